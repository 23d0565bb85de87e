//! Image identity: an image is addressed either by name or by id, never both.

use std::fmt;

use crate::error::{DforkError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageIdentity {
    name: String,
    id: String,
}

impl ImageIdentity {
    /// Validates a caller supplied name/id pair. Exactly one of them must be
    /// non-empty; the check happens before anything touches the store.
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let id = id.into();
        match (name.is_empty(), id.is_empty()) {
            (true, true) => Err(DforkError::InvalidArgument(
                "neither image name nor image id specified".into(),
            )),
            (false, false) => Err(DforkError::InvalidArgument(format!(
                "image addressed by both name {name:?} and id {id:?}"
            ))),
            _ => Ok(Self { name, id }),
        }
    }

    pub fn by_name(name: impl Into<String>) -> Result<Self> {
        Self::new(name, "")
    }

    pub fn by_id(id: impl Into<String>) -> Result<Self> {
        Self::new("", id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_resolved(&self) -> bool {
        !self.id.is_empty()
    }

    /// Records the id found by the lookup phase. The name is kept for logging.
    pub(crate) fn resolve(&mut self, id: String) {
        self.id = id;
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.name.is_empty(), self.id.is_empty()) {
            (false, true) => write!(f, "{}", self.name),
            (true, false) => write!(f, "id:{}", self.id),
            _ => write!(f, "{} (id:{})", self.name, self.id),
        }
    }
}
