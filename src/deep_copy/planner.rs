//! Read planning: which source ranges to fetch at which snapshot.

use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{trace, warn};

use super::interval::IntervalSet;
use super::queue::SnapQueue;
use crate::error::StorageResult;
use crate::models::{ExtentState, ImageExtent, SnapId, SnapMap, SnapshotDelta, WriteReadSnapIds, SNAP_HEAD};
use crate::storage::ImageCtx;

/// Whether the destination object may exist at each destination snapshot
/// (and at `SNAP_HEAD`).
pub type DstObjectMayExist = BTreeMap<SnapId, bool>;

/// One pending source read and, once executed, its sparse result.
#[derive(Debug, Clone, Default)]
pub struct ReadOp {
    /// Image ranges requested.
    pub image_interval: IntervalSet,
    /// Image ranges the backend returned data for.
    pub extent_map: Vec<ImageExtent>,
    /// Concatenated data of `extent_map`.
    pub data: Bytes,
}

/// Looks up the destination snapshot a source snapshot maps to.
///
/// Panics when the mapping has no entry: the snapshot listing reported a
/// snapshot the copy was never asked to replicate.
pub(crate) fn dst_snap_id(snap_map: &SnapMap, src_snap_id: SnapId) -> SnapId {
    snap_map
        .dst_snap_id(src_snap_id)
        .unwrap_or_else(|| panic!("source snapshot {} missing from snap map", src_snap_id))
}

/// Whether the destination object may exist at `dst_snap_id`.
///
/// Panics when the snapshot was not part of the may-exist computation.
pub(crate) fn dst_may_exist(may_exist: &DstObjectMayExist, dst_snap_id: SnapId) -> bool {
    *may_exist
        .get(&dst_snap_id)
        .unwrap_or_else(|| panic!("destination snapshot {} is unknown", dst_snap_id))
}

/// An object may exist at a snapshot only if it lies below the image's
/// object count there.
pub fn compute_dst_object_may_exist(dst: &ImageCtx, object_no: u64) -> DstObjectMayExist {
    let state = dst.image_lock.read();
    let may_exist: DstObjectMayExist = state
        .snaps
        .keys()
        .copied()
        .chain(std::iter::once(SNAP_HEAD))
        .map(|snap_id| (snap_id, object_no < dst.object_count(&state, snap_id)))
        .collect();
    trace!(?may_exist, "dst object may exist");
    may_exist
}

/// Plans the source reads for a snapshot delta.
///
/// DATA extents are read at their key. When `read_from_parent` is set, DNE
/// extents of the initial state are pulled from the parent, bounded by the
/// parent overlap at the first mapped snapshot, unless the object is purely
/// inherited and no flatten was requested.
pub fn compute_read_ops(
    delta: &SnapshotDelta,
    snap_map: &SnapMap,
    may_exist: &DstObjectMayExist,
    read_from_parent: bool,
    flatten: bool,
    src_parent_overlap: impl FnOnce(SnapId) -> StorageResult<u64>,
) -> SnapQueue<WriteReadSnapIds, ReadOp> {
    let mut read_ops: SnapQueue<WriteReadSnapIds, ReadOp> = SnapQueue::new();
    let mut only_dne_extents = true;
    let mut dne_image_interval = IntervalSet::new();

    for (key, extents) in delta.iter() {
        if !key.is_initial() {
            let dst_snap_id = dst_snap_id(snap_map, key.write_snap_id);
            if !dst_may_exist(may_exist, dst_snap_id) {
                trace!("DNE snapshot: {}", key.write_snap_id);
                continue;
            }
        }

        for extent in extents {
            match extent.state {
                ExtentState::DidNotExist => {
                    assert!(key.is_initial(), "DNE extent reported under {}", key);
                    if read_from_parent {
                        trace!("DNE extent: {}~{}", extent.offset, extent.length);
                        dne_image_interval.union_insert(extent.offset, extent.length);
                    }
                }
                ExtentState::Zeroed => only_dne_extents = false,
                ExtentState::Data => {
                    trace!("read op: snap_ids={} {}~{}", key, extent.offset, extent.length);
                    read_ops
                        .entry_or_default(*key)
                        .image_interval
                        .union_insert(extent.offset, extent.length);
                    only_dne_extents = false;
                }
            }
        }
    }

    if !dne_image_interval.is_empty() && (!only_dne_extents || flatten) {
        let src_snap_seq = snap_map.first_src_snap_id();
        let key = WriteReadSnapIds::new(src_snap_seq, src_snap_seq);

        match src_parent_overlap(src_snap_seq) {
            Err(e) => {
                warn!("failed getting parent overlap for snap_id {}: {}", src_snap_seq, e);
            }
            Ok(parent_overlap) => {
                trace!("parent overlap={}", parent_overlap);
                for (offset, length) in dne_image_interval.iter() {
                    let end = (offset + length).min(parent_overlap);
                    if offset >= end {
                        continue;
                    }
                    trace!("parent read op: snap_ids={} {}~{}", key, offset, end - offset);
                    read_ops
                        .entry_or_default(key)
                        .image_interval
                        .union_insert(offset, end - offset);
                }
            }
        }
    }

    read_ops
}
