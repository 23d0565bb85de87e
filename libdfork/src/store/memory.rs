//! In-memory object store: used for tests and embedders that do not need a
//! persistent pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DforkError, Result};
use crate::store::objclass::{self, ObjectTable};
use crate::store::{ObjectOperation, ObjectStore, RemoveFlags, StoredObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Remove,
}

/// One operation as seen by the store, kept so callers can assert on the
/// order and shape of the traffic a request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub kind: OpKind,
    pub oid: String,
    pub methods: Vec<&'static str>,
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<ObjectTable>>,
    log: Arc<StdMutex<Vec<OpRecord>>>,
    faults: Arc<StdMutex<HashMap<String, i32>>>,
    method_faults: Arc<StdMutex<HashMap<&'static str, i32>>>,
    in_flight: Arc<InFlight>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation sleeps for `latency` while counted as in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every later operation on `oid` fail with `errno`.
    pub fn fail_on(&self, oid: impl Into<String>, errno: i32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(oid.into(), errno);
        }
    }

    /// Makes the next operation calling the object-class `method` fail with
    /// `errno`. The fault fires once.
    pub fn fail_method_once(&self, method: &'static str, errno: i32) {
        if let Ok(mut faults) = self.method_faults.lock() {
            faults.insert(method, errno);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
        if let Ok(mut faults) = self.method_faults.lock() {
            faults.clear();
        }
    }

    fn take_method_fault(&self, methods: &[&'static str]) -> Option<(&'static str, i32)> {
        let mut faults = self.method_faults.lock().ok()?;
        let method = methods.iter().copied().find(|m| faults.contains_key(m))?;
        faults.remove(method).map(|errno| (method, errno))
    }

    pub async fn insert_object(&self, oid: impl Into<String>, obj: StoredObject) {
        self.table.lock().await.insert(oid.into(), obj);
    }

    pub async fn get_object(&self, oid: &str) -> Option<StoredObject> {
        self.table.lock().await.get(oid).cloned()
    }

    pub async fn contains(&self, oid: &str) -> bool {
        self.table.lock().await.contains_key(oid)
    }

    pub async fn object_count(&self) -> usize {
        self.table.lock().await.len()
    }

    pub fn op_log(&self) -> Vec<OpRecord> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear_op_log(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    /// Highest number of operations that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }

    async fn begin(&self, kind: OpKind, oid: &str, methods: Vec<&'static str>) -> Result<InFlightGuard> {
        let guard = self.in_flight.enter();
        let method_fault = self.take_method_fault(&methods);
        if let Ok(mut log) = self.log.lock() {
            log.push(OpRecord {
                kind,
                oid: oid.to_string(),
                methods,
            });
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let fault = self
            .faults
            .lock()
            .ok()
            .and_then(|faults| faults.get(oid).copied());
        if let Some(errno) = fault {
            debug!(oid, errno, "injected fault");
            return Err(DforkError::from_errno(errno, oid));
        }
        if let Some((method, errno)) = method_fault {
            debug!(oid, method, errno, "injected method fault");
            return Err(DforkError::from_errno(errno, format!("{method} on {oid}")));
        }
        Ok(guard)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, oid: &str, op: ObjectOperation) -> Result<Bytes> {
        let _guard = self.begin(OpKind::Read, oid, op.methods()).await?;
        let mut table = self.table.lock().await;
        objclass::execute(&mut table, oid, &op)
    }

    async fn write(&self, oid: &str, op: ObjectOperation) -> Result<()> {
        let _guard = self.begin(OpKind::Write, oid, op.methods()).await?;
        let mut table = self.table.lock().await;
        objclass::execute(&mut table, oid, &op)?;
        Ok(())
    }

    async fn remove(&self, oid: &str, flags: RemoveFlags) -> Result<()> {
        let _guard = self.begin(OpKind::Remove, oid, Vec::new()).await?;
        let mut table = self.table.lock().await;
        let changes = objclass::stage_remove(&table, oid, flags)?;
        objclass::commit(&mut table, changes);
        Ok(())
    }
}
