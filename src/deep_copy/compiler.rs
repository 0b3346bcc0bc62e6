//! Write/zero op compilation.
//!
//! Turns executed reads and the zeroed ranges of a snapshot delta into the
//! destination ops of every snapshot transition, and derives the object-map
//! state the destination should record for each of them.

use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

use super::interval::IntervalSet;
use super::planner::{dst_may_exist, dst_snap_id, DstObjectMayExist, ReadOp};
use super::queue::SnapQueue;
use crate::error::StorageResult;
use crate::models::{
    prune_parent_extents, ExtentState, ImageExtent, Layout, ObjectState, SnapId, SnapMap,
    SnapshotDelta, WriteOp, WriteReadSnapIds,
};

/// Inputs of the zero pass that stay fixed for the whole object.
#[derive(Debug, Clone, Copy)]
pub struct CompileContext<'a> {
    pub snap_map: &'a SnapMap,
    pub may_exist: &'a DstObjectMayExist,
    pub layout: &'a Layout,
    /// Image extents backing the object.
    pub image_extents: &'a [ImageExtent],
    /// The copy starts from the beginning of history of a clone, so ranges
    /// the parent would show through must be masked explicitly.
    pub hide_parent: bool,
    pub fast_diff: bool,
}

/// Destination ops and object-map states, keyed by source snapshot.
#[derive(Debug, Default)]
pub struct WritePlan {
    pub write_ops: SnapQueue<SnapId, Vec<WriteOp>>,
    pub dst_data_interval: BTreeMap<SnapId, IntervalSet>,
    pub dst_zero_interval: BTreeMap<SnapId, IntervalSet>,
    pub dst_object_state: SnapQueue<SnapId, ObjectState>,
}

impl WritePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts sparse read results into WRITE ops. Requested ranges the
    /// read returned nothing for become implied zeros.
    pub fn merge_write_ops(
        &mut self,
        read_ops: impl IntoIterator<Item = (WriteReadSnapIds, ReadOp)>,
        layout: &Layout,
    ) {
        for (key, mut read_op) in read_ops {
            let src_snap_seq = key.write_snap_id;

            let data_interval = self.dst_data_interval.entry(src_snap_seq).or_default();
            for extent in &read_op.extent_map {
                data_interval.union_insert(extent.offset, extent.length);
            }

            let intersection = IntervalSet::intersection_of(&read_op.image_interval, data_interval);
            read_op.image_interval.subtract(&intersection);
            for (offset, length) in read_op.image_interval.iter() {
                trace!(
                    "src_snap_seq={}, inserting sparse-read zero {}~{}",
                    src_snap_seq,
                    offset,
                    length
                );
                self.dst_zero_interval
                    .entry(src_snap_seq)
                    .or_default()
                    .union_insert(offset, length);
            }

            let mut buffer_offset = 0u64;
            for extent in &read_op.extent_map {
                for object_extent in layout.file_to_extents(extent.offset, extent.length, buffer_offset) {
                    trace!(
                        "src_snap_seq={}, object_offset={}, object_length={}",
                        src_snap_seq,
                        object_extent.offset,
                        object_extent.length
                    );
                    let start = buffer_offset as usize;
                    let end = start + object_extent.length as usize;
                    self.write_ops.entry_or_default(src_snap_seq).push(WriteOp::Write {
                        offset: object_extent.offset,
                        data: read_op.data.slice(start..end),
                    });
                    buffer_offset += object_extent.length;
                }
            }
        }
    }

    /// Folds zeroed ranges into per-snapshot zero ops and computes the
    /// destination object state of every mapped snapshot.
    ///
    /// `dst_parent_overlap` resolves the destination parent overlap at a
    /// destination snapshot; it is only consulted while hiding the parent.
    pub fn compute_zero_ops(
        &mut self,
        ctx: &CompileContext<'_>,
        delta: &SnapshotDelta,
        mut dst_parent_overlap: impl FnMut(SnapId) -> StorageResult<u64>,
    ) {
        let mut hide_parent = ctx.hide_parent;
        let first_src_snap_id = ctx.snap_map.first_src_snap_id();

        for (key, extents) in delta.iter() {
            for extent in extents.iter().filter(|e| e.state == ExtentState::Zeroed) {
                if !key.is_initial() {
                    trace!(
                        "zeroed extent: src_snap_seq={} {}~{}",
                        key.write_snap_id,
                        extent.offset,
                        extent.length
                    );
                    self.dst_zero_interval
                        .entry(key.write_snap_id)
                        .or_default()
                        .union_insert(extent.offset, extent.length);
                } else if hide_parent {
                    trace!(
                        "zeroed (hide parent) extent: src_snap_seq={} {}~{}",
                        first_src_snap_id,
                        extent.offset,
                        extent.length
                    );
                    self.dst_zero_interval
                        .entry(first_src_snap_id)
                        .or_default()
                        .union_insert(extent.offset, extent.length);
                }
            }
        }

        for src_snap_id in ctx.snap_map.src_snap_ids() {
            self.dst_zero_interval.entry(src_snap_id).or_default();
        }

        let first_zero_key = self.dst_zero_interval.keys().next().copied();
        let object_size = ctx.layout.object_size;
        let mut prev_end_size = 0u64;

        for (&src_snap_seq, zero_interval) in self.dst_zero_interval.iter_mut() {
            let data_interval = self.dst_data_interval.entry(src_snap_seq).or_default();
            let intersection = IntervalSet::intersection_of(zero_interval, data_interval);
            zero_interval.subtract(&intersection);

            let dst_snap_seq = dst_snap_id(ctx.snap_map, src_snap_seq);
            if !dst_may_exist(ctx.may_exist, dst_snap_seq) && prev_end_size > 0 {
                debug!("object DNE for snap_id: {}", dst_snap_seq);
                self.write_ops.entry_or_default(src_snap_seq).push(WriteOp::Remove);
                prev_end_size = 0;
                continue;
            }

            if hide_parent {
                let parent_overlap = dst_parent_overlap(dst_snap_seq).unwrap_or_else(|e| {
                    warn!("failed getting parent overlap for snap_id: {}: {}", dst_snap_seq, e);
                    0
                });
                if parent_overlap == 0 {
                    trace!("no parent overlap");
                    hide_parent = false;
                } else {
                    let mut image_extents = ctx.image_extents.to_vec();
                    let overlap = prune_parent_extents(&mut image_extents, parent_overlap);
                    if overlap == 0 {
                        trace!("no parent overlap");
                        hide_parent = false;
                    } else if Some(src_snap_seq) == first_zero_key {
                        prev_end_size += image_extents.iter().map(|e| e.length).sum::<u64>();
                        assert!(
                            prev_end_size <= object_size,
                            "parent overlap {} exceeds object size {}",
                            prev_end_size,
                            object_size
                        );
                    }
                }
            }

            let mut end_size = prev_end_size;
            if let Some(write_ops) = self.write_ops.get(&src_snap_seq) {
                for write_op in write_ops {
                    end_size = end_size.max(write_op.object_end());
                }
            }

            trace!(
                "src_snap_seq={}, dst_snap_seq={}, zero_interval={}, end_size={}",
                src_snap_seq,
                dst_snap_seq,
                zero_interval,
                end_size
            );
            for (offset, length) in zero_interval.iter() {
                for object_extent in ctx.layout.file_to_extents(offset, length, 0) {
                    if object_extent.offset + object_extent.length >= end_size {
                        if object_extent.offset == 0 && hide_parent {
                            trace!("remove truncate op");
                            self.write_ops
                                .entry_or_default(src_snap_seq)
                                .push(WriteOp::RemoveTruncate);
                        } else if object_extent.offset < prev_end_size {
                            let op = if object_extent.offset == 0 {
                                trace!("remove op");
                                WriteOp::Remove
                            } else {
                                trace!("truncate op: {}", object_extent.offset);
                                WriteOp::Truncate {
                                    offset: object_extent.offset,
                                }
                            };
                            self.write_ops.entry_or_default(src_snap_seq).push(op);
                        }
                        end_size = end_size.min(object_extent.offset);
                    } else {
                        trace!("zero op: {}~{}", object_extent.offset, object_extent.length);
                        self.write_ops.entry_or_default(src_snap_seq).push(WriteOp::Zero {
                            offset: object_extent.offset,
                            length: object_extent.length,
                        });
                    }
                }
            }

            trace!("src_snap_seq={}, end_size={}", src_snap_seq, end_size);
            if end_size > 0 || hide_parent {
                let state = if ctx.fast_diff
                    && end_size == prev_end_size
                    && !self.write_ops.contains_key(&src_snap_seq)
                {
                    ObjectState::ExistsClean
                } else {
                    ObjectState::Exists
                };
                self.dst_object_state.insert(src_snap_seq, state);
            }
            prev_end_size = end_size;
        }
    }
}
