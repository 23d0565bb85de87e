use crate::protocol::DirtyProtocol;

/// Default number of object operations the bulk throttle keeps in flight.
pub const DEFAULT_CONCURRENT_MANAGEMENT_OPS: usize = 10;
pub const DEFAULT_DIRTY_CACHE_CAPACITY: u64 = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DforkConfig {
    pub concurrent_management_ops: usize,
    pub protocol: DirtyProtocol,
    pub no_progress: bool,
    pub dirty_cache_capacity: u64,
    /// Program handed the image spec once a fork is ready to be attached.
    pub device_cmd: Option<String>,
}

impl Default for DforkConfig {
    fn default() -> Self {
        Self {
            concurrent_management_ops: DEFAULT_CONCURRENT_MANAGEMENT_OPS,
            protocol: DirtyProtocol::default(),
            no_progress: false,
            dirty_cache_capacity: DEFAULT_DIRTY_CACHE_CAPACITY,
            device_cmd: None,
        }
    }
}

impl DforkConfig {
    /// Concurrency actually used by the throttle; zero would stall it.
    pub fn concurrency(&self) -> usize {
        self.concurrent_management_ops.max(1)
    }
}
