//! Object store adapter
//!
//! Submodules:
//! - `memory`: in-process backend used by tests and embedders
//! - `localfs`: local directory backend, one file per object
//! - `objclass`: server-side object-class methods shared by both backends
//!
//! Responsibilities summary:
//! - Provide an async read/write/remove API over named objects.
//! - Bundle several sub-operations into one atomic operation.
//! - Run object-class calls (`Exec`) next to the data they touch, so that
//!   read-modify-write of the dirty-tracking state never needs a client lock.
//!
use std::collections::BTreeMap;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod localfs;
pub mod memory;
pub mod objclass;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RemoveFlags: u32 {
        /// Copy-on-write aware removal of a forked object.
        const DFORK = 1 << 0;
    }
}

/// One step of an atomic object operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubOp {
    Create { exclusive: bool },
    Read { offset: u64, len: u64 },
    Write { offset: u64, data: Bytes },
    WriteFull(Bytes),
    OmapGet(String),
    OmapSet(String, Bytes),
    /// Object-class call: `method` runs server side with an encoded `input`.
    Exec { method: &'static str, input: Bytes },
}

/// A bundle of sub-operations executed atomically against a single object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectOperation {
    ops: Vec<SubOp>,
}

impl ObjectOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: SubOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn create(&mut self, exclusive: bool) -> &mut Self {
        self.push(SubOp::Create { exclusive })
    }

    pub fn read(&mut self, offset: u64, len: u64) -> &mut Self {
        self.push(SubOp::Read { offset, len })
    }

    pub fn write(&mut self, offset: u64, data: impl Into<Bytes>) -> &mut Self {
        self.push(SubOp::Write {
            offset,
            data: data.into(),
        })
    }

    pub fn write_full(&mut self, data: impl Into<Bytes>) -> &mut Self {
        self.push(SubOp::WriteFull(data.into()))
    }

    pub fn omap_get(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(SubOp::OmapGet(key.into()))
    }

    pub fn omap_set(&mut self, key: impl Into<String>, value: impl Into<Bytes>) -> &mut Self {
        self.push(SubOp::OmapSet(key.into(), value.into()))
    }

    pub fn exec(&mut self, method: &'static str, input: impl Into<Bytes>) -> &mut Self {
        self.push(SubOp::Exec {
            method,
            input: input.into(),
        })
    }

    pub fn ops(&self) -> &[SubOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Names of the object-class methods in this operation, for tracing.
    pub fn methods(&self) -> Vec<&'static str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                SubOp::Exec { method, .. } => Some(*method),
                _ => None,
            })
            .collect()
    }
}

/// Object as the store keeps it: byte payload plus a key/value map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub omap: BTreeMap<String, Vec<u8>>,
}

/// Asynchronous access to named objects.
///
/// `read` and `write` run all sub-operations of an [`ObjectOperation`]
/// atomically: either every sub-operation takes effect or none does. The
/// outputs of a read are concatenated in sub-operation order.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read(&self, oid: &str, op: ObjectOperation) -> Result<Bytes>;

    async fn write(&self, oid: &str, op: ObjectOperation) -> Result<()>;

    /// Removes `oid`; a missing object is reported as `NotFound`.
    async fn remove(&self, oid: &str, flags: RemoveFlags) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_builder() {
        let mut op = ObjectOperation::new();
        op.create(false)
            .write(0, vec![1u8])
            .exec("set_dirty", Bytes::new());
        assert_eq!(op.ops().len(), 3);
        assert_eq!(op.methods(), vec!["set_dirty"]);
        assert!(!op.is_empty());
    }
}
