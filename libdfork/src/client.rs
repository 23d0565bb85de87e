//! High-level client: one entry point per request kind plus the fork
//! lifecycle flows built from them.

use std::sync::Arc;

use tokio::process::Command;
use tracing::{info, warn};

use crate::cache::DirtyCache;
use crate::config::DforkConfig;
use crate::error::{DforkError, Result};
use crate::identity::ImageIdentity;
use crate::lifecycle::{ImageInfo, ImageService, OpenFlags, SnapCreateFlags, StoreImageService};
use crate::progress::{BarProgress, NoProgress, ProgressContext};
use crate::request::{
    CheckDirtyRequest, RemoveRequest, Request, RequestExecutor, RequestHandle, ResetDirtyRequest,
    SetDirtyRequest, SwitchRequest, SwitchTarget, TransferRequest, UnblockDirtyRequest,
};
use crate::store::ObjectStore;
use crate::throttle::ThrottleSummary;

/// Suffix of the snapshot a fork child is cloned from.
pub const SNAP_SUFFIX: &str = "-snap";

pub fn fork_snap_name(parent_name: &str) -> String {
    format!("{parent_name}{SNAP_SUFFIX}")
}

pub struct DforkClient<S: ObjectStore + 'static> {
    store: Arc<S>,
    images: Arc<StoreImageService>,
    config: DforkConfig,
    cache: DirtyCache,
    executor: RequestExecutor,
}

impl<S: ObjectStore + 'static> DforkClient<S> {
    pub fn new(store: Arc<S>, config: DforkConfig) -> Self {
        let images = Arc::new(StoreImageService::new(
            store.clone(),
            config.concurrency(),
        ));
        let cache = DirtyCache::new(config.dirty_cache_capacity);
        Self {
            store,
            images,
            config,
            cache,
            executor: RequestExecutor::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn images(&self) -> &StoreImageService {
        &self.images
    }

    pub fn config(&self) -> &DforkConfig {
        &self.config
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    fn dyn_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    fn progress(&self, message: &str) -> Arc<dyn ProgressContext> {
        if self.config.no_progress {
            Arc::new(NoProgress)
        } else {
            Arc::new(BarProgress::new(message))
        }
    }

    /// Starts `req` without waiting for it; see [`RequestExecutor::send`].
    pub fn send<R, F>(&self, req: R, on_finish: F) -> RequestHandle
    where
        R: Request,
        F: FnOnce(Result<R::Output>) + Send + 'static,
    {
        self.executor.send(req, on_finish)
    }

    pub fn set_dirty_request(
        &self,
        image: ImageIdentity,
        dirty: u8,
        location: Option<String>,
    ) -> SetDirtyRequest {
        SetDirtyRequest::new(self.dyn_store(), image, dirty, location).with_cache(self.cache.clone())
    }

    pub fn check_dirty_request(
        &self,
        image: ImageIdentity,
        block_on_clean: bool,
        bypass_cache: bool,
    ) -> CheckDirtyRequest {
        CheckDirtyRequest::new(self.dyn_store(), self.config.protocol, image, block_on_clean)
            .with_cache(self.cache.clone(), bypass_cache)
    }

    pub fn reset_dirty_request(&self, image: ImageIdentity) -> ResetDirtyRequest {
        ResetDirtyRequest::new(self.dyn_store(), image).with_cache(self.cache.clone())
    }

    pub fn remove_request(&self, image: ImageIdentity) -> RemoveRequest {
        RemoveRequest::new(
            self.dyn_store(),
            self.images.clone(),
            image,
            self.config.concurrency(),
            self.progress("Removing image"),
        )
    }

    pub fn transfer_request(&self, image: ImageIdentity) -> TransferRequest {
        TransferRequest::new(
            self.dyn_store(),
            image,
            self.config.concurrency(),
            self.progress("Transferring objects"),
        )
    }

    pub async fn set_dirty(
        &self,
        image: &ImageIdentity,
        dirty: u8,
        location: Option<String>,
    ) -> Result<()> {
        let req = self.set_dirty_request(image.clone(), dirty, location);
        self.executor.execute(req).await
    }

    pub async fn check_dirty(
        &self,
        image: &ImageIdentity,
        block_on_clean: bool,
        bypass_cache: bool,
    ) -> Result<u8> {
        let req = self.check_dirty_request(image.clone(), block_on_clean, bypass_cache);
        self.executor.execute(req).await
    }

    pub async fn unblock_dirty(&self, image: &ImageIdentity) -> Result<()> {
        let req = UnblockDirtyRequest::new(self.dyn_store(), self.config.protocol, image.clone());
        self.executor.execute(req).await
    }

    /// Returns the locations that were reset.
    pub async fn reset_dirty(&self, image: &ImageIdentity) -> Result<Vec<String>> {
        let req = self.reset_dirty_request(image.clone());
        self.executor.execute(req).await
    }

    pub async fn switch(&self, target: SwitchTarget, on: bool, is_child: bool) -> Result<()> {
        let req = SwitchRequest::new(self.dyn_store(), target, on, is_child)?;
        self.executor.execute(req).await
    }

    pub async fn remove_objects(&self, image: &ImageIdentity) -> Result<ThrottleSummary> {
        let req = self.remove_request(image.clone());
        self.executor.execute(req).await
    }

    pub async fn transfer(&self, image: &ImageIdentity) -> Result<ThrottleSummary> {
        let req = self.transfer_request(image.clone());
        self.executor.execute(req).await
    }

    /// Forks `parent` into a new image named `child_name`.
    ///
    /// Dirty tracking of the parent is reset first so the child starts from
    /// a clean fork point, then the fork snapshot is taken, protected and
    /// cloned.
    pub async fn fork_create(&self, parent: &ImageIdentity, child_name: &str) -> Result<ImageInfo> {
        let mut handle = self.images.open(parent, OpenFlags::empty()).await?;
        let parent_id = handle.info.identity()?;

        if self.check_dirty(&parent_id, false, true).await? != 0 {
            self.reset_dirty(&parent_id).await?;
        }

        let snap = fork_snap_name(&handle.info.name);
        self.images
            .snap_create(&mut handle, &snap, SnapCreateFlags::FOR_DFORK)
            .await?;
        if !self.images.snap_is_protected(&handle, &snap).await? {
            self.images.snap_protect(&mut handle, &snap).await?;
        }
        let child = self.images.clone_image(&mut handle, &snap, child_name).await?;
        self.images.close(handle).await?;
        info!(parent = %parent, child = child_name, "fork created");
        Ok(child)
    }

    /// Removes the child image and releases the parent's fork snapshot.
    pub async fn fork_remove(&self, parent: &ImageIdentity, child_name: &str) -> Result<()> {
        let child = ImageIdentity::by_name(child_name)?;
        self.images
            .remove(&child, self.progress("Removing image"))
            .await?;

        let mut handle = self.images.open(parent, OpenFlags::empty()).await?;
        let snap = fork_snap_name(&handle.info.name);
        if !self.images.snap_is_protected(&handle, &snap).await? {
            return Err(DforkError::InvalidArgument(format!(
                "snap {snap} is already unprotected"
            )));
        }
        self.images.snap_unprotect(&mut handle, &snap).await?;
        self.images.snap_remove(&mut handle, &snap).await?;
        self.images.close(handle).await?;
        info!(parent = %parent, child = child_name, "fork removed");
        Ok(())
    }

    /// Discards a fork child: fork mode goes off and its objects are torn
    /// down. Safe to repeat on an image that is already gone.
    pub async fn fork_abort(&self, image: &ImageIdentity) -> Result<ThrottleSummary> {
        match self.switch(SwitchTarget::Image(image.clone()), false, false).await {
            Err(e) if e.is_not_found() => {
                warn!(image = %image, "image not found while switching dfork mode off");
            }
            r => r?,
        }
        self.remove_objects(image).await
    }

    /// Turns fork mode on for a parent and hands it to the device front-end.
    pub async fn fork_map(&self, image: &ImageIdentity) -> Result<()> {
        self.switch(SwitchTarget::Image(image.clone()), true, false)
            .await?;
        self.attach_device(image).await
    }

    /// Prepares a fork child for use: resets its dirty state, marks it as a
    /// child and hands it to the device front-end.
    pub async fn fork_super(&self, image: &ImageIdentity) -> Result<()> {
        self.reset_dirty(image).await?;
        self.switch(SwitchTarget::Image(image.clone()), true, true)
            .await?;
        self.attach_device(image).await
    }

    async fn attach_device(&self, image: &ImageIdentity) -> Result<()> {
        let Some(cmd) = &self.config.device_cmd else {
            return Ok(());
        };
        let status = Command::new(cmd).arg(image.to_string()).status().await?;
        if !status.success() {
            return Err(DforkError::Remote {
                errno: status.code().filter(|c| *c > 0).unwrap_or(libc::EIO),
                context: format!("device command {cmd} for {image}"),
            });
        }
        info!(image = %image, cmd = %cmd, "device attached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn client() -> DforkClient<MemoryStore> {
        let config = DforkConfig {
            no_progress: true,
            ..DforkConfig::default()
        };
        DforkClient::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_check_dirty_cache() {
        let client = client();
        client.images().create("disk", 1 << 22, 22).await.unwrap();
        let disk = ImageIdentity::by_name("disk").unwrap();

        assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 0);
        client.store().clear_op_log();
        assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 0);
        // name lookup only; the dirty byte came from the cache
        assert_eq!(client.store().op_log().len(), 1);

        client.set_dirty(&disk, 1, None).await.unwrap();
        assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_switch_on_all_is_rejected() {
        let client = client();
        let err = client.switch(SwitchTarget::All, true, false).await.unwrap_err();
        assert_eq!(err.errno(), -libc::EOPNOTSUPP);
        assert!(client.store().op_log().is_empty());
    }
}
