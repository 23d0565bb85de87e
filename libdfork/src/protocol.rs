use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DforkError;
use crate::locator;

/// Revision of the dirty-bit protocol spoken with the object class.
///
/// The revisions only differ in where the write block lives: `V2` keeps it
/// on the image header, `V3` on the object-map object so that writers on
/// the data path do not contend on the header. The dirty byte and location
/// set are on the header in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirtyProtocol {
    V2,
    #[default]
    V3,
}

impl DirtyProtocol {
    /// Object on which `check_dirty` arms the block, `None` for the header
    /// the call is issued against.
    pub fn block_object(self, image_id: &str) -> Option<String> {
        match self {
            DirtyProtocol::V2 => None,
            DirtyProtocol::V3 => Some(locator::object_map_name(image_id)),
        }
    }

    /// Object an `unblock_dirty` call has to be sent to.
    pub fn unblock_target(self, image_id: &str) -> String {
        match self {
            DirtyProtocol::V2 => locator::header_object_name(image_id),
            DirtyProtocol::V3 => locator::object_map_name(image_id),
        }
    }
}

impl fmt::Display for DirtyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirtyProtocol::V2 => f.write_str("v2"),
            DirtyProtocol::V3 => f.write_str("v3"),
        }
    }
}

impl FromStr for DirtyProtocol {
    type Err = DforkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v2" | "2" => Ok(DirtyProtocol::V2),
            "v3" | "3" => Ok(DirtyProtocol::V3),
            other => Err(DforkError::InvalidArgument(format!(
                "unknown dirty protocol {other:?}, expected v2 or v3"
            ))),
        }
    }
}
