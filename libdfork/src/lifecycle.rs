//! Image lifecycle: create/open/close, snapshots, clones and removal.
//!
//! Image metadata is a JSON document kept in the header's key/value map.
//! The id object maps a name to an id, the object map lives in its own
//! object next to the header.

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cls;
use crate::error::{DforkError, Result};
use crate::identity::ImageIdentity;
use crate::locator;
use crate::object_map::{ObjectMap, ObjectState};
use crate::progress::ProgressContext;
use crate::request::resolve_id;
use crate::store::{ObjectOperation, ObjectStore, RemoveFlags};
use crate::throttle::{AsyncObjectThrottle, ObjectOutcome};

const META_KEY: &str = "image_meta";

pub const DEFAULT_ORDER: u8 = 22;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Do not open the parent of a clone.
        const SKIP_OPEN_PARENT = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SnapCreateFlags: u32 {
        /// Snapshot taken as the fork point of a dfork child.
        const FOR_DFORK = 1 << 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub protected: bool,
    pub for_dfork: bool,
    /// Ids of the images cloned from this snapshot.
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSpec {
    pub image_id: String,
    pub snap_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    pub id: String,
    pub size: u64,
    pub order: u8,
    pub snapshots: Vec<SnapshotInfo>,
    pub parent: Option<ParentSpec>,
}

impl ImageInfo {
    pub fn object_size(&self) -> u64 {
        1u64 << self.order
    }

    pub fn object_count(&self) -> u64 {
        self.size.div_ceil(self.object_size())
    }

    pub fn snapshot(&self, snap: &str) -> Result<&SnapshotInfo> {
        self.snapshots
            .iter()
            .find(|s| s.name == snap)
            .ok_or_else(|| DforkError::NotFound(format!("snapshot {snap}")))
    }

    fn snapshot_mut(&mut self, snap: &str) -> Result<&mut SnapshotInfo> {
        self.snapshots
            .iter_mut()
            .find(|s| s.name == snap)
            .ok_or_else(|| DforkError::NotFound(format!("snapshot {snap}")))
    }

    pub fn identity(&self) -> Result<ImageIdentity> {
        ImageIdentity::by_id(self.id.clone())
    }
}

/// An open image.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    pub info: ImageInfo,
    pub object_map: ObjectMap,
    /// The parent of a clone, unless opened with `SKIP_OPEN_PARENT`.
    pub parent: Option<ImageInfo>,
}

#[async_trait]
pub trait ImageService: Send + Sync {
    async fn create(&self, name: &str, size: u64, order: u8) -> Result<ImageInfo>;

    async fn open(&self, image: &ImageIdentity, flags: OpenFlags) -> Result<ImageHandle>;

    async fn close(&self, image: ImageHandle) -> Result<()>;

    async fn snap_create(
        &self,
        image: &mut ImageHandle,
        snap: &str,
        flags: SnapCreateFlags,
    ) -> Result<()>;

    async fn snap_is_protected(&self, image: &ImageHandle, snap: &str) -> Result<bool>;

    async fn snap_protect(&self, image: &mut ImageHandle, snap: &str) -> Result<()>;

    async fn snap_unprotect(&self, image: &mut ImageHandle, snap: &str) -> Result<()>;

    async fn snap_remove(&self, image: &mut ImageHandle, snap: &str) -> Result<()>;

    async fn clone_image(
        &self,
        parent: &mut ImageHandle,
        snap: &str,
        child_name: &str,
    ) -> Result<ImageInfo>;

    async fn remove(
        &self,
        image: &ImageIdentity,
        progress: Arc<dyn ProgressContext>,
    ) -> Result<()>;

    async fn write_object(
        &self,
        image: &mut ImageHandle,
        object_no: u64,
        offset: u64,
        data: Bytes,
    ) -> Result<()>;
}

/// [`ImageService`] on top of an object store.
#[derive(Clone)]
pub struct StoreImageService {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl StoreImageService {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    fn new_image_id() -> String {
        hex::encode(rand::random::<[u8; 6]>())
    }

    async fn load_info(&self, image_id: &str) -> Result<ImageInfo> {
        let header_oid = locator::header_object_name(image_id);
        let mut op = ObjectOperation::new();
        op.omap_get(META_KEY);
        let out = self.store.read(&header_oid, op).await?;
        if out.is_empty() {
            return Err(DforkError::BadMessage(format!(
                "{header_oid} carries no image metadata"
            )));
        }
        Ok(serde_json::from_slice(&out)?)
    }

    async fn save_info(&self, info: &ImageInfo) -> Result<()> {
        let mut op = ObjectOperation::new();
        op.omap_set(META_KEY, serde_json::to_vec(info)?);
        self.store
            .write(&locator::header_object_name(&info.id), op)
            .await
    }

    async fn load_object_map(&self, image_id: &str) -> Result<ObjectMap> {
        let mut op = ObjectOperation::new();
        cls::object_map_load_start(&mut op);
        let out = self
            .store
            .read(&locator::object_map_name(image_id), op)
            .await?;
        cls::object_map_load_finish(&out)
    }

    async fn save_object_map(&self, image_id: &str, map: &ObjectMap) -> Result<()> {
        let mut op = ObjectOperation::new();
        op.write_full(map.encode()?);
        self.store
            .write(&locator::object_map_name(image_id), op)
            .await
    }

    async fn create_with_parent(
        &self,
        name: &str,
        size: u64,
        order: u8,
        parent: Option<ParentSpec>,
    ) -> Result<ImageInfo> {
        if name.is_empty() {
            return Err(DforkError::InvalidArgument("empty image name".into()));
        }
        if !(12..=26).contains(&order) {
            return Err(DforkError::InvalidArgument(format!(
                "object order {order} out of range"
            )));
        }
        let info = ImageInfo {
            name: name.to_string(),
            id: Self::new_image_id(),
            size,
            order,
            snapshots: Vec::new(),
            parent,
        };
        let object_map = ObjectMap::with_size(info.object_count())?;

        let mut op = ObjectOperation::new();
        op.create(true).write_full(info.id.clone().into_bytes());
        self.store
            .write(&locator::id_object_name(name), op)
            .await
            .map_err(|e| match e.errno() {
                r if r == -libc::EEXIST => {
                    DforkError::InvalidArgument(format!("image {name} already exists"))
                }
                _ => e,
            })?;
        self.save_info(&info).await?;
        self.save_object_map(&info.id, &object_map).await?;
        info!(image = name, id = %info.id, size, "created image");
        Ok(info)
    }

    async fn remove_if_present(&self, oid: &str) -> Result<()> {
        match self.store.remove(oid, RemoveFlags::empty()).await {
            Err(e) if e.is_not_found() => Ok(()),
            r => r,
        }
    }
}

#[async_trait]
impl ImageService for StoreImageService {
    async fn create(&self, name: &str, size: u64, order: u8) -> Result<ImageInfo> {
        self.create_with_parent(name, size, order, None).await
    }

    async fn open(&self, image: &ImageIdentity, flags: OpenFlags) -> Result<ImageHandle> {
        let mut image = image.clone();
        resolve_id(self.store.as_ref(), &mut image).await?;
        let info = self.load_info(image.id()).await?;
        let object_map = self.load_object_map(image.id()).await?;
        let parent = match &info.parent {
            Some(spec) if !flags.contains(OpenFlags::SKIP_OPEN_PARENT) => {
                Some(self.load_info(&spec.image_id).await?)
            }
            _ => None,
        };
        debug!(image = %image, ?flags, "opened image");
        Ok(ImageHandle {
            info,
            object_map,
            parent,
        })
    }

    async fn close(&self, image: ImageHandle) -> Result<()> {
        debug!(image = %image.info.name, "closed image");
        Ok(())
    }

    async fn snap_create(
        &self,
        image: &mut ImageHandle,
        snap: &str,
        flags: SnapCreateFlags,
    ) -> Result<()> {
        if snap.is_empty() {
            return Err(DforkError::InvalidArgument("empty snapshot name".into()));
        }
        if image.info.snapshot(snap).is_ok() {
            return Err(DforkError::from_errno(libc::EEXIST, format!("snapshot {snap}")));
        }
        let mut info = image.info.clone();
        info.snapshots.push(SnapshotInfo {
            name: snap.to_string(),
            protected: false,
            for_dfork: flags.contains(SnapCreateFlags::FOR_DFORK),
            children: Vec::new(),
        });
        self.save_info(&info).await?;
        image.info = info;
        info!(image = %image.info.name, snap, "created snapshot");
        Ok(())
    }

    async fn snap_is_protected(&self, image: &ImageHandle, snap: &str) -> Result<bool> {
        Ok(image.info.snapshot(snap)?.protected)
    }

    async fn snap_protect(&self, image: &mut ImageHandle, snap: &str) -> Result<()> {
        let mut info = image.info.clone();
        let s = info.snapshot_mut(snap)?;
        if s.protected {
            return Err(DforkError::Busy(format!("snapshot {snap} is already protected")));
        }
        s.protected = true;
        self.save_info(&info).await?;
        image.info = info;
        Ok(())
    }

    async fn snap_unprotect(&self, image: &mut ImageHandle, snap: &str) -> Result<()> {
        let mut info = image.info.clone();
        let s = info.snapshot_mut(snap)?;
        if !s.protected {
            return Err(DforkError::InvalidArgument(format!(
                "snapshot {snap} is already unprotected"
            )));
        }
        if !s.children.is_empty() {
            return Err(DforkError::Busy(format!(
                "snapshot {snap} still has {} children",
                s.children.len()
            )));
        }
        s.protected = false;
        self.save_info(&info).await?;
        image.info = info;
        Ok(())
    }

    async fn snap_remove(&self, image: &mut ImageHandle, snap: &str) -> Result<()> {
        let mut info = image.info.clone();
        if info.snapshot(snap)?.protected {
            return Err(DforkError::Busy(format!("snapshot {snap} is protected")));
        }
        info.snapshots.retain(|s| s.name != snap);
        self.save_info(&info).await?;
        image.info = info;
        info!(image = %image.info.name, snap, "removed snapshot");
        Ok(())
    }

    async fn clone_image(
        &self,
        parent: &mut ImageHandle,
        snap: &str,
        child_name: &str,
    ) -> Result<ImageInfo> {
        if !parent.info.snapshot(snap)?.protected {
            return Err(DforkError::InvalidArgument(format!(
                "parent snapshot {snap} must be protected"
            )));
        }
        let child = self
            .create_with_parent(
                child_name,
                parent.info.size,
                parent.info.order,
                Some(ParentSpec {
                    image_id: parent.info.id.clone(),
                    snap_name: snap.to_string(),
                }),
            )
            .await?;

        let mut info = parent.info.clone();
        info.snapshot_mut(snap)?.children.push(child.id.clone());
        self.save_info(&info).await?;
        parent.info = info;
        info!(parent = %parent.info.name, snap, child = child_name, "cloned image");
        Ok(child)
    }

    async fn remove(
        &self,
        image: &ImageIdentity,
        progress: Arc<dyn ProgressContext>,
    ) -> Result<()> {
        let handle = self.open(image, OpenFlags::SKIP_OPEN_PARENT).await?;
        let info = &handle.info;
        if !info.snapshots.is_empty() {
            return Err(DforkError::NotEmpty(format!(
                "image {} has {} snapshots",
                info.name,
                info.snapshots.len()
            )));
        }

        let throttle =
            AsyncObjectThrottle::new(0..info.object_count(), self.concurrency, progress);
        throttle
            .run(|object_no| {
                let store = self.store.clone();
                let may_exist = handle.object_map.object_may_exist(object_no);
                let oid = locator::data_object_name(&info.id, object_no);
                async move {
                    if !may_exist {
                        return Ok(ObjectOutcome::Skipped);
                    }
                    store.remove(&oid, RemoveFlags::empty()).await?;
                    Ok(ObjectOutcome::Done)
                }
            })
            .await?;

        if let Some(spec) = &info.parent {
            match self.load_info(&spec.image_id).await {
                Ok(mut parent) => {
                    if let Ok(s) = parent.snapshot_mut(&spec.snap_name) {
                        s.children.retain(|id| id != &info.id);
                    }
                    self.save_info(&parent).await?;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.remove_if_present(&locator::object_map_name(&info.id))
            .await?;
        self.remove_if_present(&locator::header_object_name(&info.id))
            .await?;
        self.remove_if_present(&locator::id_object_name(&info.name))
            .await?;
        info!(image = %info.name, id = %info.id, "removed image");
        self.close(handle).await
    }

    async fn write_object(
        &self,
        image: &mut ImageHandle,
        object_no: u64,
        offset: u64,
        data: Bytes,
    ) -> Result<()> {
        if object_no >= image.info.object_count() {
            return Err(DforkError::InvalidArgument(format!(
                "object {object_no} beyond the end of image {}",
                image.info.name
            )));
        }
        let end = u64::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len));
        if end.is_none_or(|end| end > image.info.object_size()) {
            return Err(DforkError::InvalidArgument(
                "write crosses the object boundary".into(),
            ));
        }
        let mut op = ObjectOperation::new();
        op.write(offset, data);
        self.store
            .write(&locator::data_object_name(&image.info.id, object_no), op)
            .await?;
        if image.object_map.get(object_no) != Some(ObjectState::Exists) {
            image.object_map.set(object_no, ObjectState::Exists);
            self.save_object_map(&image.info.id, &image.object_map)
                .await?;
        }
        Ok(())
    }
}
