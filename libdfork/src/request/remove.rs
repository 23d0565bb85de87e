use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{DforkError, Result};
use crate::identity::ImageIdentity;
use crate::lifecycle::{ImageHandle, ImageService, OpenFlags};
use crate::locator;
use crate::progress::ProgressContext;
use crate::request::{Request, Step};
use crate::store::{ObjectStore, RemoveFlags};
use crate::throttle::{AsyncObjectThrottle, ObjectOutcome, ThrottleSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveState {
    OpenImage,
    RemoveObjects,
    CloseImage,
}

/// Tears down the fork-owned backing objects of an image.
///
/// The image is opened without its parent and every object the object map
/// does not rule out is removed with [`RemoveFlags::DFORK`]. An image that
/// cannot be found counts as already removed. A failed sweep still closes
/// the image; the sweep error wins over a close error.
pub struct RemoveRequest {
    store: Arc<dyn ObjectStore>,
    images: Arc<dyn ImageService>,
    image: ImageIdentity,
    concurrency: usize,
    progress: Arc<dyn ProgressContext>,
    handle: Option<ImageHandle>,
    remove_error: Option<DforkError>,
    summary: ThrottleSummary,
}

impl RemoveRequest {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        images: Arc<dyn ImageService>,
        image: ImageIdentity,
        concurrency: usize,
        progress: Arc<dyn ProgressContext>,
    ) -> Self {
        Self {
            store,
            images,
            image,
            concurrency,
            progress,
            handle: None,
            remove_error: None,
            summary: ThrottleSummary::default(),
        }
    }

    async fn remove_objects(&mut self) -> Result<ThrottleSummary> {
        let Some(handle) = &self.handle else {
            return Ok(ThrottleSummary::default());
        };
        let image_id = handle.info.id.clone();
        let throttle = AsyncObjectThrottle::new(
            0..handle.info.object_count(),
            self.concurrency,
            self.progress.clone(),
        );
        throttle
            .run(|object_no| {
                let store = self.store.clone();
                let may_exist = handle.object_map.object_may_exist(object_no);
                let oid = locator::data_object_name(&image_id, object_no);
                async move {
                    if !may_exist {
                        return Ok(ObjectOutcome::Skipped);
                    }
                    store.remove(&oid, RemoveFlags::DFORK).await?;
                    Ok(ObjectOutcome::Done)
                }
            })
            .await
    }
}

#[async_trait]
impl Request for RemoveRequest {
    type State = RemoveState;
    type Output = ThrottleSummary;
    const KIND: &'static str = "remove";

    fn initial_state(&self) -> RemoveState {
        RemoveState::OpenImage
    }

    async fn step(&mut self, state: RemoveState) -> Step<RemoveState> {
        match state {
            RemoveState::OpenImage => {
                match self.images.open(&self.image, OpenFlags::SKIP_OPEN_PARENT).await {
                    Ok(handle) => {
                        self.handle = Some(handle);
                        Step::Next(RemoveState::RemoveObjects)
                    }
                    Err(e) if e.is_not_found() => {
                        info!(image = %self.image, "image already removed");
                        Step::Complete(Ok(()))
                    }
                    Err(e) => Step::Complete(Err(e)),
                }
            }
            RemoveState::RemoveObjects => {
                match self.remove_objects().await {
                    Ok(summary) => self.summary = summary,
                    Err(e) => self.remove_error = Some(e),
                }
                Step::Next(RemoveState::CloseImage)
            }
            RemoveState::CloseImage => {
                let close = match self.handle.take() {
                    Some(handle) => self.images.close(handle).await,
                    None => Ok(()),
                };
                Step::Complete(match self.remove_error.take() {
                    Some(e) => Err(e),
                    None => close,
                })
            }
        }
    }

    fn finish(self, result: Result<()>) -> Result<ThrottleSummary> {
        result.map(|()| self.summary)
    }
}
