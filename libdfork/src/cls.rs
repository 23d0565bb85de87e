//! Client side of the dfork object-class methods.
//!
//! Each remote call comes as a `*_start` function that appends the encoded
//! call to an [`ObjectOperation`] and, when the call returns data, a matching
//! `*_finish` that decodes the reply. Argument and reply structs are shared
//! with the server side in [`crate::store::objclass`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{DforkError, Result};
use crate::object_map::ObjectMap;
use crate::store::ObjectOperation;

pub const GET_ID: &str = "get_id";
pub const SET_DIRTY: &str = "set_dfork_dirty";
pub const CHECK_DIRTY: &str = "check_dfork_dirty";
pub const UNBLOCK_DIRTY: &str = "unblock_dfork_dirty";
pub const GET_DIRTY_LOCATIONS: &str = "get_dfork_dirty_locations";
pub const RESET_OBJECT_DIRTY: &str = "reset_dfork_dirty";
pub const CLEAR_DIRTY: &str = "clear_dfork_dirty";
pub const CLEAR_DIRTY_LOCATIONS: &str = "clear_dfork_dirty_locations";
pub const DFORK_SWITCH: &str = "dfork_switch";
pub const OBJECT_MAP_LOAD: &str = "object_map_load";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDirtyArgs {
    pub dirty: u8,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDirtyArgs {
    pub block_on_clean: bool,
    /// Object carrying the write block; `None` means the header itself.
    pub block_object: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearLocationsArgs {
    pub clear: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchArgs {
    pub on: bool,
    pub all: bool,
    pub is_child: bool,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

pub(crate) fn decode<T: DeserializeOwned>(method: &str, buf: &[u8]) -> Result<T> {
    bincode::deserialize(buf)
        .map_err(|e| DforkError::BadMessage(format!("{method} reply: {e}")))
}

pub fn get_id_start(op: &mut ObjectOperation) {
    op.exec(GET_ID, Bytes::new());
}

pub fn get_id_finish(out: &[u8]) -> Result<String> {
    let id: String = decode(GET_ID, out)?;
    if id.is_empty() {
        return Err(DforkError::BadMessage("get_id returned an empty id".into()));
    }
    Ok(id)
}

pub fn set_dirty(op: &mut ObjectOperation, dirty: u8, location: Option<String>) -> Result<()> {
    op.exec(SET_DIRTY, encode(&SetDirtyArgs { dirty, location })?);
    Ok(())
}

pub fn check_dirty_start(
    op: &mut ObjectOperation,
    block_on_clean: bool,
    block_object: Option<String>,
) -> Result<()> {
    op.exec(
        CHECK_DIRTY,
        encode(&CheckDirtyArgs {
            block_on_clean,
            block_object,
        })?,
    );
    Ok(())
}

pub fn check_dirty_finish(out: &[u8]) -> Result<u8> {
    decode(CHECK_DIRTY, out)
}

pub fn unblock_dirty(op: &mut ObjectOperation) {
    op.exec(UNBLOCK_DIRTY, Bytes::new());
}

pub fn get_dirty_locations_start(op: &mut ObjectOperation) {
    op.exec(GET_DIRTY_LOCATIONS, Bytes::new());
}

pub fn get_dirty_locations_finish(out: &[u8]) -> Result<String> {
    decode(GET_DIRTY_LOCATIONS, out)
}

pub fn reset_object_dirty(op: &mut ObjectOperation) {
    op.exec(RESET_OBJECT_DIRTY, Bytes::new());
}

pub fn clear_dirty(op: &mut ObjectOperation) {
    op.exec(CLEAR_DIRTY, Bytes::new());
}

pub fn clear_dirty_locations(op: &mut ObjectOperation, clear: bool) -> Result<()> {
    op.exec(CLEAR_DIRTY_LOCATIONS, encode(&ClearLocationsArgs { clear })?);
    Ok(())
}

pub fn dfork_switch(op: &mut ObjectOperation, on: bool, all: bool, is_child: bool) -> Result<()> {
    op.exec(DFORK_SWITCH, encode(&SwitchArgs { on, all, is_child })?);
    Ok(())
}

pub fn object_map_load_start(op: &mut ObjectOperation) {
    op.exec(OBJECT_MAP_LOAD, Bytes::new());
}

pub fn object_map_load_finish(out: &[u8]) -> Result<ObjectMap> {
    let raw: Vec<u8> = decode(OBJECT_MAP_LOAD, out)?;
    ObjectMap::decode(&raw)
        .map_err(|e| DforkError::BadMessage(format!("{OBJECT_MAP_LOAD} reply: {e}")))
}
