use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::DirtyCache;
use crate::cls;
use crate::error::Result;
use crate::identity::ImageIdentity;
use crate::locator;
use crate::protocol::DirtyProtocol;
use crate::request::{Request, Step, resolve_id};
use crate::store::{ObjectOperation, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDirtyState {
    ResolveId,
    CheckDirty,
}

/// Reads the dirty byte of an image. With `block_on_clean` a clean image
/// additionally gets its writers blocked, until an unblock request lifts it.
pub struct CheckDirtyRequest {
    store: Arc<dyn ObjectStore>,
    protocol: DirtyProtocol,
    image: ImageIdentity,
    block_on_clean: bool,
    bypass_cache: bool,
    cache: Option<DirtyCache>,
    dirty: u8,
}

impl CheckDirtyRequest {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        protocol: DirtyProtocol,
        image: ImageIdentity,
        block_on_clean: bool,
    ) -> Self {
        Self {
            store,
            protocol,
            image,
            block_on_clean,
            bypass_cache: false,
            cache: None,
            dirty: 0,
        }
    }

    pub fn with_cache(mut self, cache: DirtyCache, bypass_cache: bool) -> Self {
        self.cache = Some(cache);
        self.bypass_cache = bypass_cache;
        self
    }

    async fn check_dirty(&mut self) -> Result<()> {
        let id = self.image.id().to_string();
        let cacheable = !self.bypass_cache && !self.block_on_clean;
        if let Some(cache) = self.cache.as_ref().filter(|_| cacheable) {
            if let Some(dirty) = cache.get(&id).await {
                debug!(image = %self.image, dirty, "dirty byte served from cache");
                self.dirty = dirty;
                return Ok(());
            }
        }

        let mut op = ObjectOperation::new();
        cls::check_dirty_start(&mut op, self.block_on_clean, self.protocol.block_object(&id))?;
        let out = self
            .store
            .read(&locator::header_object_name(&id), op)
            .await?;
        self.dirty = cls::check_dirty_finish(&out)?;
        // Writers can dirty the image without going through this client, so
        // only a dirty answer is remembered.
        if let Some(cache) = &self.cache {
            if self.dirty != 0 {
                cache.insert(&id, self.dirty).await;
            } else {
                cache.invalidate(&id).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Request for CheckDirtyRequest {
    type State = CheckDirtyState;
    type Output = u8;
    const KIND: &'static str = "check_dirty";

    fn initial_state(&self) -> CheckDirtyState {
        if self.image.is_resolved() {
            CheckDirtyState::CheckDirty
        } else {
            CheckDirtyState::ResolveId
        }
    }

    async fn step(&mut self, state: CheckDirtyState) -> Step<CheckDirtyState> {
        match state {
            CheckDirtyState::ResolveId => Step::then(
                resolve_id(self.store.as_ref(), &mut self.image).await,
                CheckDirtyState::CheckDirty,
            ),
            CheckDirtyState::CheckDirty => Step::Complete(self.check_dirty().await),
        }
    }

    fn finish(self, result: Result<()>) -> Result<u8> {
        result.map(|()| self.dirty)
    }
}
