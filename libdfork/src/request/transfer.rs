use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cls;
use crate::error::Result;
use crate::identity::ImageIdentity;
use crate::locator;
use crate::object_map::ObjectMap;
use crate::progress::ProgressContext;
use crate::request::{Request, Step, resolve_id};
use crate::store::{ObjectOperation, ObjectStore, RemoveFlags};
use crate::throttle::{AsyncObjectThrottle, ObjectOutcome, ThrottleSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    ResolveId,
    LoadObjectMap,
    Transfer,
}

/// Hands every materialized object of an image over to the image itself.
///
/// For each index the object map marks as existing, the parent-owned copy
/// is removed with [`RemoveFlags::DFORK`] (a missing copy is fine) and a
/// fresh one-byte object is written in its place. The sweep keeps going
/// past failed objects and reports the first failure at the end.
pub struct TransferRequest {
    store: Arc<dyn ObjectStore>,
    image: ImageIdentity,
    concurrency: usize,
    progress: Arc<dyn ProgressContext>,
    object_map: ObjectMap,
    summary: ThrottleSummary,
}

impl TransferRequest {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        image: ImageIdentity,
        concurrency: usize,
        progress: Arc<dyn ProgressContext>,
    ) -> Self {
        Self {
            store,
            image,
            concurrency,
            progress,
            object_map: ObjectMap::default(),
            summary: ThrottleSummary::default(),
        }
    }

    async fn load_object_map(&mut self) -> Result<()> {
        let mut op = ObjectOperation::new();
        cls::object_map_load_start(&mut op);
        let out = self
            .store
            .read(&locator::object_map_name(self.image.id()), op)
            .await?;
        self.object_map = cls::object_map_load_finish(&out)?;
        debug!(image = %self.image, objects = self.object_map.len(), "loaded object map");
        Ok(())
    }

    async fn transfer(&mut self) -> Result<()> {
        let image_id = self.image.id().to_string();
        let map = &self.object_map;
        let throttle =
            AsyncObjectThrottle::new(0..map.len(), self.concurrency, self.progress.clone());
        self.summary = throttle
            .run(|object_no| {
                let store = self.store.clone();
                let exists = map.object_may_exist(object_no);
                let oid = locator::data_object_name(&image_id, object_no);
                async move {
                    if !exists {
                        return Ok(ObjectOutcome::Skipped);
                    }
                    transfer_object(store.as_ref(), &oid).await?;
                    Ok(ObjectOutcome::Done)
                }
            })
            .await?;
        Ok(())
    }
}

async fn transfer_object(store: &dyn ObjectStore, oid: &str) -> Result<()> {
    match store.remove(oid, RemoveFlags::DFORK).await {
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }
    let mut op = ObjectOperation::new();
    op.write(0, vec![rand::random::<u8>()]);
    store.write(oid, op).await
}

#[async_trait]
impl Request for TransferRequest {
    type State = TransferState;
    type Output = ThrottleSummary;
    const KIND: &'static str = "transfer";

    fn initial_state(&self) -> TransferState {
        if self.image.is_resolved() {
            TransferState::LoadObjectMap
        } else {
            TransferState::ResolveId
        }
    }

    async fn step(&mut self, state: TransferState) -> Step<TransferState> {
        match state {
            TransferState::ResolveId => Step::then(
                resolve_id(self.store.as_ref(), &mut self.image).await,
                TransferState::LoadObjectMap,
            ),
            TransferState::LoadObjectMap => {
                Step::then(self.load_object_map().await, TransferState::Transfer)
            }
            TransferState::Transfer => Step::Complete(self.transfer().await),
        }
    }

    fn finish(self, result: Result<()>) -> Result<ThrottleSummary> {
        result.map(|()| self.summary)
    }
}
