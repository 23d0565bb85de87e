//! Server-side half of the dfork object-class methods, plus the data write
//! path that feeds dirty tracking. Both store backends run every operation
//! through [`execute`] while holding their table lock, which is what makes a
//! bundled operation atomic.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::cls::{self, CheckDirtyArgs, ClearLocationsArgs, SetDirtyArgs, SwitchArgs};
use crate::error::{DforkError, Result};
use crate::locations::DirtyLocations;
use crate::locator::{self, RBD_HEADER_PREFIX};
use crate::store::{ObjectOperation, RemoveFlags, StoredObject, SubOp};

pub const KEY_DIRTY: &str = "dfork_dirty";
pub const KEY_LOCATIONS: &str = "dfork_dirty_locations";
pub const KEY_MODE: &str = "dfork_mode";
pub const KEY_IS_CHILD: &str = "dfork_is_child";
pub const KEY_BLOCKED: &str = "dfork_blocked";
pub const KEY_RESET_LOCK: &str = "dfork_reset_lock";

/// Largest object a store accepts.
pub const MAX_OBJECT_BYTES: u64 = 1 << 30;

pub type ObjectTable = HashMap<String, StoredObject>;

/// Staged result of an operation: the new content of every touched object,
/// `None` for objects that were deleted.
pub type Changes = HashMap<String, Option<StoredObject>>;

/// Staged view over the table. Objects are copied on first modification and
/// nothing reaches the table until [`commit`] runs.
struct Txn<'a> {
    base: &'a ObjectTable,
    staged: Changes,
}

impl<'a> Txn<'a> {
    fn new(base: &'a ObjectTable) -> Self {
        Self {
            base,
            staged: HashMap::new(),
        }
    }

    fn get(&self, oid: &str) -> Option<&StoredObject> {
        match self.staged.get(oid) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(oid),
        }
    }

    fn exists(&self, oid: &str) -> bool {
        self.get(oid).is_some()
    }

    fn get_mut(&mut self, oid: &str) -> Option<&mut StoredObject> {
        if !self.staged.contains_key(oid) {
            let current = self.base.get(oid)?.clone();
            self.staged.insert(oid.to_string(), Some(current));
        }
        self.staged.get_mut(oid)?.as_mut()
    }

    fn get_or_create(&mut self, oid: &str) -> &mut StoredObject {
        let base = self.base;
        self.staged
            .entry(oid.to_string())
            .or_insert_with(|| base.get(oid).cloned())
            .get_or_insert_with(StoredObject::default)
    }

    fn oids_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut oids: Vec<String> = self
            .base
            .keys()
            .filter(|oid| oid.starts_with(prefix) && !self.staged.contains_key(*oid))
            .cloned()
            .collect();
        oids.extend(
            self.staged
                .iter()
                .filter(|(oid, obj)| oid.starts_with(prefix) && obj.is_some())
                .map(|(oid, _)| oid.clone()),
        );
        oids.sort();
        oids
    }

    fn into_changes(self) -> Changes {
        self.staged
    }
}

/// Applies staged changes to the table.
pub fn commit(table: &mut ObjectTable, changes: Changes) {
    for (oid, obj) in changes {
        match obj {
            Some(obj) => {
                table.insert(oid, obj);
            }
            None => {
                table.remove(&oid);
            }
        }
    }
}

fn byte(obj: &StoredObject, key: &str) -> u8 {
    obj.omap
        .get(key)
        .and_then(|v| v.first().copied())
        .unwrap_or(0)
}

fn set_byte(obj: &mut StoredObject, key: &str, value: u8) {
    obj.omap.insert(key.to_string(), vec![value]);
}

fn locations(obj: &StoredObject) -> Result<DirtyLocations> {
    match obj.omap.get(KEY_LOCATIONS) {
        Some(raw) => String::from_utf8(raw.clone())
            .map(DirtyLocations::parse)
            .map_err(|e| DforkError::BadMessage(format!("dirty locations: {e}"))),
        None => Ok(DirtyLocations::default()),
    }
}

fn not_found(oid: &str) -> DforkError {
    DforkError::NotFound(oid.to_string())
}

/// Runs `op` against `oid` without touching the table. Returns the
/// concatenated output of the sub-operations and the staged changes.
pub fn stage(table: &ObjectTable, oid: &str, op: &ObjectOperation) -> Result<(Bytes, Changes)> {
    let mut txn = Txn::new(table);
    let mut out = BytesMut::new();
    for sub in op.ops() {
        if let Some(reply) = apply_sub_op(&mut txn, oid, sub)? {
            out.extend_from_slice(&reply);
        }
    }
    Ok((out.freeze(), txn.into_changes()))
}

/// Runs `op` against `oid` and commits it.
pub fn execute(table: &mut ObjectTable, oid: &str, op: &ObjectOperation) -> Result<Bytes> {
    let (out, changes) = stage(table, oid, op)?;
    commit(table, changes);
    Ok(out)
}

/// Stages the removal of `oid`.
pub fn stage_remove(table: &ObjectTable, oid: &str, flags: RemoveFlags) -> Result<Changes> {
    if !table.contains_key(oid) {
        return Err(not_found(oid));
    }
    debug!(oid, dfork = flags.contains(RemoveFlags::DFORK), "removing object");
    Ok(HashMap::from([(oid.to_string(), None)]))
}

fn apply_sub_op(txn: &mut Txn<'_>, oid: &str, sub: &SubOp) -> Result<Option<Bytes>> {
    match sub {
        SubOp::Create { exclusive } => {
            if txn.exists(oid) {
                if *exclusive {
                    return Err(DforkError::from_errno(libc::EEXIST, oid));
                }
            } else {
                txn.get_or_create(oid);
            }
            Ok(None)
        }
        SubOp::Read { offset, len } => {
            let obj = txn.get(oid).ok_or_else(|| not_found(oid))?;
            let size = obj.data.len();
            let start = usize::try_from(*offset).map_or(size, |off| off.min(size));
            let end = match *len {
                0 => size,
                len => usize::try_from(len)
                    .ok()
                    .and_then(|len| start.checked_add(len))
                    .map_or(size, |end| end.min(size)),
            };
            Ok(Some(Bytes::copy_from_slice(&obj.data[start..end])))
        }
        SubOp::Write { offset, data } => {
            let (start, end) = write_extent(oid, *offset, data.len())?;
            track_data_write(txn, oid)?;
            let obj = txn.get_or_create(oid);
            if obj.data.len() < end {
                obj.data.resize(end, 0);
            }
            obj.data[start..end].copy_from_slice(data);
            Ok(None)
        }
        SubOp::WriteFull(data) => {
            write_extent(oid, 0, data.len())?;
            track_data_write(txn, oid)?;
            txn.get_or_create(oid).data = data.to_vec();
            Ok(None)
        }
        SubOp::OmapGet(key) => {
            let obj = txn.get(oid).ok_or_else(|| not_found(oid))?;
            Ok(obj.omap.get(key).map(|v| Bytes::copy_from_slice(v)))
        }
        SubOp::OmapSet(key, value) => {
            txn.get_or_create(oid)
                .omap
                .insert(key.clone(), value.to_vec());
            Ok(None)
        }
        SubOp::Exec { method, input } => exec(txn, oid, method, input),
    }
}

/// Byte range `[start, end)` of a write, bounded by [`MAX_OBJECT_BYTES`].
fn write_extent(oid: &str, offset: u64, len: usize) -> Result<(usize, usize)> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .filter(|end| *end <= MAX_OBJECT_BYTES)
        .ok_or_else(|| {
            DforkError::from_errno(
                libc::EFBIG,
                format!("write of {len} bytes at {offset} to {oid}"),
            )
        })?;
    // Both values fit in usize once bounded by MAX_OBJECT_BYTES.
    Ok((offset as usize, end as usize))
}

/// Write path of a data object. Writes to an object that already existed
/// when the image entered fork mode mark the image dirty and record the
/// object; they are refused while a write block or a reset is pending.
fn track_data_write(txn: &mut Txn<'_>, oid: &str) -> Result<()> {
    if !txn.exists(oid) {
        return Ok(());
    }
    let Some((image_id, suffix)) = locator::parse_data_object_name(oid) else {
        return Ok(());
    };
    let header_oid = locator::header_object_name(image_id);
    let Some(header) = txn.get(&header_oid) else {
        return Ok(());
    };
    if byte(header, KEY_MODE) == 0 || byte(header, KEY_IS_CHILD) == 1 {
        return Ok(());
    }
    let map_blocked = txn
        .get(&locator::object_map_name(image_id))
        .is_some_and(|map| byte(map, KEY_BLOCKED) == 1);
    if map_blocked || byte(header, KEY_BLOCKED) == 1 || byte(header, KEY_RESET_LOCK) == 1 {
        return Err(DforkError::Busy(format!("dirty bit updates blocked for {oid}")));
    }

    let suffix = suffix.to_string();
    let header = txn
        .get_mut(&header_oid)
        .ok_or_else(|| not_found(&header_oid))?;
    let mut locs = locations(header)?;
    if locs.insert(&suffix) {
        header
            .omap
            .insert(KEY_LOCATIONS.to_string(), locs.as_str().as_bytes().to_vec());
    }
    set_byte(header, KEY_DIRTY, 1);
    if let Some(obj) = txn.get_mut(oid) {
        set_byte(obj, KEY_DIRTY, 1);
    }
    debug!(oid, "write recorded as dirty location");
    Ok(())
}

fn exec(txn: &mut Txn<'_>, oid: &str, method: &str, input: &[u8]) -> Result<Option<Bytes>> {
    match method {
        cls::GET_ID => {
            let obj = txn.get(oid).ok_or_else(|| not_found(oid))?;
            let id = String::from_utf8(obj.data.clone())
                .map_err(|e| DforkError::BadMessage(format!("image id in {oid}: {e}")))?;
            Ok(Some(cls::encode(&id)?))
        }
        cls::SET_DIRTY => {
            let args: SetDirtyArgs = cls::decode(method, input)?;
            let header = txn.get_mut(oid).ok_or_else(|| not_found(oid))?;
            if byte(header, KEY_RESET_LOCK) == 1 {
                return Err(DforkError::Busy(format!("dirty reset in progress on {oid}")));
            }
            set_byte(header, KEY_DIRTY, args.dirty);
            if let Some(location) = args.location.filter(|_| args.dirty != 0) {
                let mut locs = locations(header)?;
                if locs.insert(&location) {
                    header
                        .omap
                        .insert(KEY_LOCATIONS.to_string(), locs.as_str().as_bytes().to_vec());
                }
            }
            Ok(None)
        }
        cls::CHECK_DIRTY => {
            let args: CheckDirtyArgs = cls::decode(method, input)?;
            let header = txn.get(oid).ok_or_else(|| not_found(oid))?;
            let dirty = byte(header, KEY_DIRTY);
            if args.block_on_clean && dirty == 0 {
                let target = args.block_object.unwrap_or_else(|| oid.to_string());
                let obj = txn.get_mut(&target).ok_or_else(|| not_found(&target))?;
                set_byte(obj, KEY_BLOCKED, 1);
            }
            Ok(Some(cls::encode(&dirty)?))
        }
        cls::UNBLOCK_DIRTY => {
            let obj = txn.get_mut(oid).ok_or_else(|| not_found(oid))?;
            obj.omap.remove(KEY_BLOCKED);
            Ok(None)
        }
        cls::GET_DIRTY_LOCATIONS => {
            // Resets are serialized by the caller. A lock still held here was
            // left by a reset whose final clear failed, so it is taken over.
            let header = txn.get_mut(oid).ok_or_else(|| not_found(oid))?;
            if byte(header, KEY_RESET_LOCK) == 1 {
                debug!(oid, "taking over reset lock of an interrupted reset");
            }
            set_byte(header, KEY_RESET_LOCK, 1);
            let locs = locations(header)?;
            Ok(Some(cls::encode(&locs.as_str().to_string())?))
        }
        cls::RESET_OBJECT_DIRTY => {
            if let Some(obj) = txn.get_mut(oid) {
                obj.omap.remove(KEY_DIRTY);
            }
            Ok(None)
        }
        cls::CLEAR_DIRTY => {
            let header = txn.get_mut(oid).ok_or_else(|| not_found(oid))?;
            set_byte(header, KEY_DIRTY, 0);
            Ok(None)
        }
        cls::CLEAR_DIRTY_LOCATIONS => {
            let args: ClearLocationsArgs = cls::decode(method, input)?;
            let header = txn.get_mut(oid).ok_or_else(|| not_found(oid))?;
            if args.clear {
                header.omap.remove(KEY_LOCATIONS);
            }
            header.omap.remove(KEY_RESET_LOCK);
            Ok(None)
        }
        cls::DFORK_SWITCH => {
            let args: SwitchArgs = cls::decode(method, input)?;
            if args.all {
                if args.on {
                    return Err(DforkError::NotSupported(
                        "switching on dfork mode for all images".into(),
                    ));
                }
                for header_oid in txn.oids_with_prefix(RBD_HEADER_PREFIX) {
                    if let Some(header) = txn.get_mut(&header_oid) {
                        set_byte(header, KEY_MODE, 0);
                        header.omap.remove(KEY_IS_CHILD);
                    }
                }
                return Ok(None);
            }
            let header = txn.get_mut(oid).ok_or_else(|| not_found(oid))?;
            set_byte(header, KEY_MODE, u8::from(args.on));
            set_byte(header, KEY_IS_CHILD, u8::from(args.on && args.is_child));
            Ok(None)
        }
        cls::OBJECT_MAP_LOAD => {
            let obj = txn.get(oid).ok_or_else(|| not_found(oid))?;
            Ok(Some(cls::encode(&obj.data)?))
        }
        other => Err(DforkError::NotSupported(format!("object class method {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{data_object_name, header_object_name};

    fn header_with_mode(table: &mut ObjectTable, image_id: &str) {
        let mut header = StoredObject::default();
        set_byte(&mut header, KEY_MODE, 1);
        table.insert(header_object_name(image_id), header);
    }

    #[test]
    fn test_failed_operation_is_not_applied() {
        let mut table = ObjectTable::new();
        let mut op = ObjectOperation::new();
        op.write(0, vec![1u8, 2, 3]).read(0, 0).exec("no_such_method", Bytes::new());
        assert!(execute(&mut table, "obj", &op).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_write_to_existing_object_marks_dirty() {
        let mut table = ObjectTable::new();
        header_with_mode(&mut table, "10ab");
        let oid = data_object_name("10ab", 3);
        table.insert(oid.clone(), StoredObject::default());

        let mut op = ObjectOperation::new();
        op.write(0, vec![9u8]);
        let (_, changes) = stage(&table, &oid, &op).unwrap();
        assert_eq!(changes.len(), 2);
        commit(&mut table, changes);

        let header = &table[&header_object_name("10ab")];
        assert_eq!(byte(header, KEY_DIRTY), 1);
        assert_eq!(locations(header).unwrap().as_str(), "0000000000000003");
        assert_eq!(byte(&table[&oid], KEY_DIRTY), 1);
    }

    #[test]
    fn test_new_object_is_not_tracked() {
        let mut table = ObjectTable::new();
        header_with_mode(&mut table, "10ab");
        let oid = data_object_name("10ab", 0);
        let mut op = ObjectOperation::new();
        op.write_full(vec![1u8]);
        execute(&mut table, &oid, &op).unwrap();
        assert_eq!(byte(&table[&header_object_name("10ab")], KEY_DIRTY), 0);
    }

    #[test]
    fn test_extreme_offsets() {
        let mut table = ObjectTable::new();
        let mut op = ObjectOperation::new();
        op.write_full(vec![1u8, 2, 3]);
        execute(&mut table, "obj", &op).unwrap();

        let mut op = ObjectOperation::new();
        op.read(u64::MAX, u64::MAX).read(1, u64::MAX);
        assert_eq!(execute(&mut table, "obj", &op).unwrap(), Bytes::from_static(&[2, 3]));

        let mut op = ObjectOperation::new();
        op.write(MAX_OBJECT_BYTES, vec![1u8]);
        let err = execute(&mut table, "obj", &op).unwrap_err();
        assert_eq!(err.errno(), -libc::EFBIG);
        assert_eq!(table["obj"].data, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_missing_object() {
        let mut table = ObjectTable::new();
        let err = stage_remove(&table, "rbd_data.10ab.0000000000000000", RemoveFlags::DFORK)
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
