use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::DirtyCache;
use crate::cls;
use crate::error::{DforkError, Result};
use crate::identity::ImageIdentity;
use crate::locations::{DirtyLocations, LocationCursor};
use crate::locator;
use crate::request::{Request, Step, record_error, resolve_id};
use crate::store::{ObjectOperation, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetDirtyState {
    ResolveId,
    GetLocations,
    ResetLocation,
    ClearDirty,
    ClearLocations,
}

/// Drains the dirty location set of an image and returns it to clean.
///
/// Fetching the locations takes the header's reset lock, so writers on the
/// data path are held off until the set has been cleared. Once the lock is
/// held the request is best effort: a failed per-location reset is recorded
/// and the walk goes on, the dirty byte is cleared regardless, and the final
/// `clear_dirty_locations` call always runs to release the lock. The set
/// itself is only dropped when nothing failed, so a retry resumes with the
/// same locations. If the final call itself fails the lock stays set until
/// the next reset of the image takes it over. The first recorded error is
/// the request's result.
pub struct ResetDirtyRequest {
    store: Arc<dyn ObjectStore>,
    image: ImageIdentity,
    cache: Option<DirtyCache>,
    cursor: Option<LocationCursor>,
    first_error: Option<DforkError>,
    visited: Vec<String>,
}

impl ResetDirtyRequest {
    pub fn new(store: Arc<dyn ObjectStore>, image: ImageIdentity) -> Self {
        Self {
            store,
            image,
            cache: None,
            cursor: None,
            first_error: None,
            visited: Vec::new(),
        }
    }

    pub fn with_cache(mut self, cache: DirtyCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn header_oid(&self) -> String {
        locator::header_object_name(self.image.id())
    }

    async fn get_locations(&mut self) -> Result<()> {
        let mut op = ObjectOperation::new();
        cls::get_dirty_locations_start(&mut op);
        let out = self.store.read(&self.header_oid(), op).await?;
        let locations = DirtyLocations::parse(cls::get_dirty_locations_finish(&out)?);
        debug!(image = %self.image, count = locations.len(), "fetched dirty locations");
        self.cursor = Some(locations.cursor());
        Ok(())
    }

    async fn reset_location(&mut self, location: String) -> Result<()> {
        let oid = locator::location_object_name(self.image.id(), &location);
        self.visited.push(location);
        let mut op = ObjectOperation::new();
        cls::reset_object_dirty(&mut op);
        self.store.write(&oid, op).await
    }

    async fn clear_dirty(&mut self) -> Result<()> {
        let mut op = ObjectOperation::new();
        cls::clear_dirty(&mut op);
        self.store.write(&self.header_oid(), op).await
    }

    async fn clear_locations(&mut self) -> Result<()> {
        let clear = self.first_error.is_none();
        let mut op = ObjectOperation::new();
        cls::clear_dirty_locations(&mut op, clear)?;
        let r = self.store.write(&self.header_oid(), op).await;
        if let Some(cache) = &self.cache {
            cache.invalidate(self.image.id()).await;
        }
        if !clear {
            warn!(image = %self.image, "dirty locations preserved after failed reset");
        }
        r
    }

    fn complete(&mut self) -> Step<ResetDirtyState> {
        Step::Complete(match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        })
    }
}

#[async_trait]
impl Request for ResetDirtyRequest {
    type State = ResetDirtyState;
    type Output = Vec<String>;
    const KIND: &'static str = "reset_dirty";

    fn initial_state(&self) -> ResetDirtyState {
        if self.image.is_resolved() {
            ResetDirtyState::GetLocations
        } else {
            ResetDirtyState::ResolveId
        }
    }

    async fn step(&mut self, state: ResetDirtyState) -> Step<ResetDirtyState> {
        match state {
            ResetDirtyState::ResolveId => Step::then(
                resolve_id(self.store.as_ref(), &mut self.image).await,
                ResetDirtyState::GetLocations,
            ),
            ResetDirtyState::GetLocations => Step::then(
                self.get_locations().await,
                ResetDirtyState::ResetLocation,
            ),
            ResetDirtyState::ResetLocation => {
                let Some(location) = self.cursor.as_mut().and_then(|cursor| cursor.next()) else {
                    return Step::Next(ResetDirtyState::ClearDirty);
                };
                let r = self.reset_location(location).await;
                if let Err(e) = &r {
                    warn!(image = %self.image, error = %e, "failed to reset dirty location");
                }
                record_error(&mut self.first_error, r);
                Step::Next(ResetDirtyState::ResetLocation)
            }
            ResetDirtyState::ClearDirty => {
                let r = self.clear_dirty().await;
                record_error(&mut self.first_error, r);
                Step::Next(ResetDirtyState::ClearLocations)
            }
            ResetDirtyState::ClearLocations => {
                let r = self.clear_locations().await;
                record_error(&mut self.first_error, r);
                self.complete()
            }
        }
    }

    /// Yields the locations that were visited, in visiting order.
    fn finish(self, result: Result<()>) -> Result<Vec<String>> {
        result.map(|()| self.visited)
    }
}
