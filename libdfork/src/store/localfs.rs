//! Local directory backend: one file per object under a root directory.
//!
//! The directory is loaded once at open. An operation is staged against the
//! loaded table, every object it touches is written back, and only then is
//! the staged result committed to the table. A failed write-back leaves the
//! table as it was.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::objclass::{self, Changes, ObjectTable};
use crate::store::{ObjectOperation, ObjectStore, RemoveFlags, StoredObject};

#[derive(Clone)]
pub struct LocalFsStore {
    root: PathBuf,
    table: Arc<Mutex<ObjectTable>>,
}

impl LocalFsStore {
    /// Opens (creating if needed) the pool rooted at `root`.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut table = ObjectTable::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(oid) = entry.file_name().into_string() else {
                continue;
            };
            let buf = fs::read(entry.path()).await?;
            let obj: StoredObject = bincode::deserialize(&buf)?;
            table.insert(oid, obj);
        }
        info!(root = %root.display(), objects = table.len(), "opened local object pool");
        Ok(Self {
            root,
            table: Arc::new(Mutex::new(table)),
        })
    }

    fn path_for(&self, oid: &str) -> PathBuf {
        self.root.join(oid)
    }

    async fn flush(&self, changes: &Changes) -> Result<()> {
        for (oid, obj) in changes {
            let path = self.path_for(oid);
            match obj {
                Some(obj) => {
                    let buf = bincode::serialize(obj)?;
                    let mut f = fs::File::create(&path).await?;
                    f.write_all(&buf).await?;
                    f.flush().await?;
                }
                None => match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
            debug!(oid = %oid, "flushed object");
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn read(&self, oid: &str, op: ObjectOperation) -> Result<Bytes> {
        let mut table = self.table.lock().await;
        let (out, changes) = objclass::stage(&table, oid, &op)?;
        self.flush(&changes).await?;
        objclass::commit(&mut table, changes);
        Ok(out)
    }

    async fn write(&self, oid: &str, op: ObjectOperation) -> Result<()> {
        let mut table = self.table.lock().await;
        let (_, changes) = objclass::stage(&table, oid, &op)?;
        self.flush(&changes).await?;
        objclass::commit(&mut table, changes);
        Ok(())
    }

    async fn remove(&self, oid: &str, flags: RemoveFlags) -> Result<()> {
        let mut table = self.table.lock().await;
        let changes = objclass::stage_remove(&table, oid, flags)?;
        self.flush(&changes).await?;
        objclass::commit(&mut table, changes);
        Ok(())
    }
}
