use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::DirtyCache;
use crate::cls;
use crate::error::Result;
use crate::identity::ImageIdentity;
use crate::locator;
use crate::request::{Request, Step, resolve_id};
use crate::store::{ObjectOperation, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetDirtyState {
    ResolveId,
    SetDirty,
}

/// Sets the dirty byte of an image, optionally recording a location in the
/// same atomic operation.
pub struct SetDirtyRequest {
    store: Arc<dyn ObjectStore>,
    image: ImageIdentity,
    dirty: u8,
    location: Option<String>,
    cache: Option<DirtyCache>,
}

impl SetDirtyRequest {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        image: ImageIdentity,
        dirty: u8,
        location: Option<String>,
    ) -> Self {
        Self {
            store,
            image,
            dirty,
            location: location.filter(|loc| !loc.is_empty()),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: DirtyCache) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn set_dirty(&mut self) -> Result<()> {
        let id = self.image.id().to_string();
        let location = self
            .location
            .as_deref()
            .map(|loc| locator::location_suffix(&id, loc).to_string());
        let mut op = ObjectOperation::new();
        cls::set_dirty(&mut op, self.dirty, location)?;
        let r = self
            .store
            .write(&locator::header_object_name(&id), op)
            .await;
        if let Some(cache) = &self.cache {
            cache.invalidate(&id).await;
        }
        r
    }
}

#[async_trait]
impl Request for SetDirtyRequest {
    type State = SetDirtyState;
    type Output = ();
    const KIND: &'static str = "set_dirty";

    fn initial_state(&self) -> SetDirtyState {
        if self.image.is_resolved() {
            SetDirtyState::SetDirty
        } else {
            SetDirtyState::ResolveId
        }
    }

    async fn step(&mut self, state: SetDirtyState) -> Step<SetDirtyState> {
        match state {
            SetDirtyState::ResolveId => Step::then(
                resolve_id(self.store.as_ref(), &mut self.image).await,
                SetDirtyState::SetDirty,
            ),
            SetDirtyState::SetDirty => Step::Complete(self.set_dirty().await),
        }
    }

    fn finish(self, result: Result<()>) -> Result<()> {
        result
    }
}
