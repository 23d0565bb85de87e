//! Dirty byte of images last observed dirty, by image id. A clean image is
//! never cached: the data path can dirty it at any time.

use moka::future::Cache;

#[derive(Clone)]
pub struct DirtyCache {
    inner: Cache<String, u8>,
}

impl DirtyCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub async fn get(&self, image_id: &str) -> Option<u8> {
        self.inner.get(image_id).await
    }

    pub async fn insert(&self, image_id: &str, dirty: u8) {
        self.inner.insert(image_id.to_string(), dirty).await;
    }

    pub async fn invalidate(&self, image_id: &str) {
        self.inner.invalidate(image_id).await;
    }
}
