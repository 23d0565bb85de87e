//! Object-existence map: one state per backing object index.

use serde::{Deserialize, Serialize};

use crate::error::{DforkError, Result};

/// Largest number of objects an image may span.
pub const MAX_OBJECT_COUNT: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectState {
    #[default]
    Nonexistent = 0,
    Exists = 1,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMap {
    states: Vec<ObjectState>,
}

impl ObjectMap {
    pub fn with_size(object_count: u64) -> Result<Self> {
        let len = usize::try_from(object_count)
            .ok()
            .filter(|_| object_count <= MAX_OBJECT_COUNT)
            .ok_or_else(|| {
                DforkError::from_errno(
                    libc::EFBIG,
                    format!("{object_count} objects exceed the limit of {MAX_OBJECT_COUNT}"),
                )
            })?;
        Ok(Self {
            states: vec![ObjectState::Nonexistent; len],
        })
    }

    pub fn len(&self) -> u64 {
        self.states.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, object_no: u64) -> Option<ObjectState> {
        self.states.get(object_no as usize).copied()
    }

    /// Marks `object_no`, growing the map if the index lies past its end.
    pub fn set(&mut self, object_no: u64, state: ObjectState) {
        let idx = object_no as usize;
        if idx >= self.states.len() {
            self.states.resize(idx + 1, ObjectState::Nonexistent);
        }
        self.states[idx] = state;
    }

    /// Indices outside the map are unknown and therefore may exist.
    pub fn object_may_exist(&self, object_no: u64) -> bool {
        self.get(object_no)
            .is_none_or(|state| state != ObjectState::Nonexistent)
    }

    /// Indices of every object that is materialized in the store.
    pub fn existing(&self) -> impl Iterator<Item = u64> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != ObjectState::Nonexistent)
            .map(|(idx, _)| idx as u64)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_indices() {
        let mut map = ObjectMap::with_size(6).unwrap();
        map.set(1, ObjectState::Exists);
        map.set(4, ObjectState::Exists);
        assert_eq!(map.existing().collect::<Vec<_>>(), vec![1, 4]);
        assert!(!map.object_may_exist(0));
        assert!(map.object_may_exist(4));
        assert!(map.object_may_exist(100));
    }

    #[test]
    fn test_oversized_map_rejected() {
        let err = ObjectMap::with_size(u64::MAX).unwrap_err();
        assert_eq!(err.errno(), -libc::EFBIG);
        assert_eq!(ObjectMap::with_size(MAX_OBJECT_COUNT + 1).unwrap_err().errno(), -libc::EFBIG);
    }

    #[test]
    fn test_set_grows_map() {
        let mut map = ObjectMap::default();
        map.set(3, ObjectState::Exists);
        assert_eq!(map.len(), 4);
        let decoded = ObjectMap::decode(&map.encode().unwrap()).unwrap();
        assert_eq!(decoded, map);
    }
}
