//! Snapshot identifiers, snapshot deltas and snapshot maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ErrorCode, StorageError, StorageResult};

/// Snapshot identifier. Snapshots are ordered by creation.
pub type SnapId = u64;

/// The "head" revision: the live, writable image (`-2` in two's complement).
pub const SNAP_HEAD: SnapId = u64::MAX - 1;

/// Pair of snapshot ids keying a snapshot delta.
///
/// `write_snap_id` is the snapshot the change becomes visible in,
/// `read_snap_id` is the snapshot the changed data should be read from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WriteReadSnapIds {
    pub write_snap_id: SnapId,
    pub read_snap_id: SnapId,
}

impl WriteReadSnapIds {
    /// Sentinel key covering state that predates every listed snapshot.
    pub const INITIAL: WriteReadSnapIds = WriteReadSnapIds {
        write_snap_id: 0,
        read_snap_id: 0,
    };

    pub fn new(write_snap_id: SnapId, read_snap_id: SnapId) -> Self {
        Self {
            write_snap_id,
            read_snap_id,
        }
    }

    pub fn is_initial(&self) -> bool {
        *self == Self::INITIAL
    }
}

impl fmt::Display for WriteReadSnapIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.write_snap_id, self.read_snap_id)
    }
}

/// State of a byte range within a snapshot delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtentState {
    /// Range did not exist (only legal under the initial key).
    DidNotExist,
    /// Range was explicitly zeroed, truncated or removed.
    Zeroed,
    /// Range contains data that must be read.
    Data,
}

/// A byte range of the logical image with its delta state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotExtent {
    pub offset: u64,
    pub length: u64,
    pub state: ExtentState,
}

impl SnapshotExtent {
    pub fn new(offset: u64, length: u64, state: ExtentState) -> Self {
        Self {
            offset,
            length,
            state,
        }
    }
}

/// Per-object record of what changed between consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDelta {
    entries: BTreeMap<WriteReadSnapIds, Vec<SnapshotExtent>>,
}

impl SnapshotDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an image extent under the given key. Zero-length extents are dropped.
    pub fn insert(&mut self, key: WriteReadSnapIds, offset: u64, length: u64, state: ExtentState) {
        if length == 0 {
            return;
        }
        self.entries
            .entry(key)
            .or_default()
            .push(SnapshotExtent::new(offset, length, state));
    }

    pub fn get(&self, key: &WriteReadSnapIds) -> Option<&[SnapshotExtent]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Iterates keys in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (&WriteReadSnapIds, &[SnapshotExtent])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &WriteReadSnapIds> {
        self.entries.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<(WriteReadSnapIds, SnapshotExtent)> for SnapshotDelta {
    fn from_iter<T: IntoIterator<Item = (WriteReadSnapIds, SnapshotExtent)>>(iter: T) -> Self {
        let mut delta = SnapshotDelta::new();
        for (key, extent) in iter {
            delta.insert(key, extent.offset, extent.length, extent.state);
        }
        delta
    }
}

/// Snapshot context attached to a write: the newest snapshot the writer knows
/// about and every existing snapshot in descending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    pub seq: SnapId,
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    pub fn new(seq: SnapId, snaps: Vec<SnapId>) -> Self {
        Self { seq, snaps }
    }
}

/// Mapping from a source snapshot id to the destination snapshot context it is
/// replicated into.
///
/// Each value starts with the destination snapshot the source snapshot maps to,
/// followed by the older destination snapshots in descending order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapMap {
    entries: BTreeMap<SnapId, Vec<SnapId>>,
}

impl SnapMap {
    /// Validates and wraps a snapshot mapping.
    pub fn new(entries: BTreeMap<SnapId, Vec<SnapId>>) -> StorageResult<Self> {
        if entries.is_empty() {
            return Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                "snap map must not be empty",
            ));
        }
        if let Some((src_snap_id, _)) = entries.iter().find(|(_, dst)| dst.is_empty()) {
            return Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                format!("snap map entry {} has no destination snapshots", src_snap_id),
            ));
        }
        Ok(Self { entries })
    }

    /// Returns the destination snapshot context for a source snapshot.
    pub fn get(&self, src_snap_id: SnapId) -> Option<&[SnapId]> {
        self.entries.get(&src_snap_id).map(Vec::as_slice)
    }

    /// Returns the destination snapshot a source snapshot maps to.
    pub fn dst_snap_id(&self, src_snap_id: SnapId) -> Option<SnapId> {
        self.get(src_snap_id).and_then(|ids| ids.first().copied())
    }

    /// Earliest source snapshot in the mapping.
    pub fn first_src_snap_id(&self) -> SnapId {
        // non-empty by construction
        self.entries.keys().next().copied().unwrap_or_default()
    }

    pub fn contains(&self, src_snap_id: SnapId) -> bool {
        self.entries.contains_key(&src_snap_id)
    }

    pub fn src_snap_ids(&self) -> impl Iterator<Item = SnapId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SnapId, &[SnapId])> {
        self.entries.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
