//! Image data namespace.
//!
//! Reads and snapshot listings are image-level (they go through the striping
//! layout and fall through to a copy-on-write parent); transactions are raw
//! object operations.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{
    AssertSnapcSeqState, ExtentState, ImageExtent, Layout, ListSnapsFlags, ObjectExtent,
    ObjectTransaction, OpFlags, ReadFlags, ReadResult, SnapContext, SnapId, SnapshotDelta, TxOp,
    WriteReadSnapIds, SNAP_HEAD,
};

/// Builds the name of a data object from the image's object prefix.
pub fn object_name(object_prefix: &str, object_no: u64) -> String {
    format!("{}.{:016x}", object_prefix, object_no)
}

/// Trait for the data namespace of an image.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Lists, for every consecutive pair of `snap_ids`, the image ranges that
    /// changed and how.
    async fn list_snaps(
        &self,
        image_extents: &[ImageExtent],
        snap_ids: &[SnapId],
        flags: ListSnapsFlags,
    ) -> StorageResult<SnapshotDelta>;

    /// Sparse read of image extents at a snapshot.
    async fn read(
        &self,
        image_extents: &[ImageExtent],
        snap_id: SnapId,
        op_flags: OpFlags,
        read_flags: ReadFlags,
    ) -> StorageResult<ReadResult>;

    /// Applies a compound transaction to one object, all or nothing.
    async fn operate(
        &self,
        oid: &str,
        tx: ObjectTransaction,
        snapc: SnapContext,
    ) -> StorageResult<()>;

    /// Returns the head size of an object.
    async fn stat(&self, oid: &str) -> StorageResult<u64>;
}

/// Head revision plus copy-on-write clones of one object.
#[derive(Debug, Clone, Default)]
struct ObjectRecord {
    head: Option<Vec<u8>>,
    /// Content as of each snapshot; `None` when the object did not exist.
    clones: BTreeMap<SnapId, Option<Vec<u8>>>,
    snap_seq: SnapId,
}

impl ObjectRecord {
    fn is_empty(&self) -> bool {
        self.head.is_none() && self.clones.is_empty()
    }

    fn content_at(&self, snap_id: SnapId) -> Option<&[u8]> {
        if snap_id != SNAP_HEAD {
            if let Some((_, clone)) = self.clones.range(snap_id..).next() {
                return clone.as_deref();
            }
        }
        self.head.as_deref()
    }

    fn check_snapc_seq(&self, seq: SnapId, state: AssertSnapcSeqState) -> StorageResult<()> {
        if self.head.is_none() {
            return Ok(());
        }
        let passed = match state {
            AssertSnapcSeqState::GtSnapsetSeq => seq > self.snap_seq,
            AssertSnapcSeqState::LeSnapsetSeq => seq <= self.snap_seq,
        };
        if passed {
            Ok(())
        } else {
            Err(StorageError::with_message(
                ErrorCode::OutOfRange,
                format!("snapc seq {} vs snapset seq {}", seq, self.snap_seq),
            ))
        }
    }

    /// Preserves the head for every snapshot newer than the last write.
    fn make_writeable(&mut self, snapc: &SnapContext) {
        if snapc.seq <= self.snap_seq {
            return;
        }
        let seq = self.snap_seq;
        for &snap_id in snapc.snaps.iter().filter(|&&s| s > seq) {
            let head = self.head.clone();
            self.clones.entry(snap_id).or_insert(head);
        }
        self.snap_seq = snapc.seq;
    }

    fn apply(&mut self, op: &TxOp) -> StorageResult<()> {
        match op {
            TxOp::AssertSnapcSeq { .. } => {}
            TxOp::Write { offset, data, .. } => {
                let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
                    StorageError::with_message(ErrorCode::InvalidArgument, "write offset overflows")
                })?;
                let buf = self.head.get_or_insert_with(Vec::new);
                let start = *offset as usize;
                let end = end as usize;
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[start..end].copy_from_slice(data);
            }
            TxOp::Zero { offset, length } => {
                if let Some(buf) = self.head.as_mut() {
                    let start = (*offset as usize).min(buf.len());
                    let end = (offset.saturating_add(*length) as usize).min(buf.len());
                    buf[start..end].fill(0);
                }
            }
            TxOp::Create { exclusive } => {
                if *exclusive && self.head.is_some() {
                    return Err(StorageError::with_message(
                        ErrorCode::InvalidArgument,
                        "object already exists",
                    ));
                }
                self.head.get_or_insert_with(Vec::new);
            }
            TxOp::Truncate { offset } => {
                self.head
                    .get_or_insert_with(Vec::new)
                    .resize(*offset as usize, 0);
            }
            TxOp::Remove => {
                if self.head.take().is_none() {
                    return Err(StorageError::new(ErrorCode::NotFound));
                }
            }
        }
        Ok(())
    }

    fn transact(&mut self, tx: &ObjectTransaction, snapc: &SnapContext) -> StorageResult<()> {
        for op in tx.ops() {
            if let TxOp::AssertSnapcSeq { seq, state } = op {
                self.check_snapc_seq(*seq, *state)?;
            }
        }
        if tx
            .ops()
            .iter()
            .any(|op| !matches!(op, TxOp::AssertSnapcSeq { .. }))
        {
            self.make_writeable(snapc);
        }
        for op in tx.ops() {
            self.apply(op)?;
        }
        Ok(())
    }
}

/// Copy-on-write parent of a cloned image.
#[derive(Debug)]
struct ParentLink {
    store: Arc<MemoryImageStore>,
    snap_id: SnapId,
    /// Parent overlap per snapshot, `SNAP_HEAD` for the live image.
    overlaps: RwLock<BTreeMap<SnapId, u64>>,
}

impl ParentLink {
    fn overlap_at(&self, snap_id: SnapId) -> u64 {
        let overlaps = self.overlaps.read();
        overlaps
            .get(&snap_id)
            .or_else(|| overlaps.get(&SNAP_HEAD))
            .copied()
            .unwrap_or(0)
    }
}

/// In-memory data namespace of one image.
#[derive(Debug)]
pub struct MemoryImageStore {
    layout: Layout,
    object_prefix: String,
    objects: DashMap<Arc<str>, ObjectRecord>,
    /// Live image size, used to clip reads.
    image_size: AtomicU64,
    parent: Option<ParentLink>,
}

impl MemoryImageStore {
    pub fn new(layout: Layout, object_prefix: impl Into<String>) -> Self {
        Self {
            layout,
            object_prefix: object_prefix.into(),
            objects: DashMap::new(),
            image_size: AtomicU64::new(u64::MAX),
            parent: None,
        }
    }

    /// Makes this image a clone of `parent` at `parent_snap_id`.
    pub fn with_parent(
        mut self,
        parent: Arc<MemoryImageStore>,
        parent_snap_id: SnapId,
        overlap: u64,
    ) -> Self {
        let mut overlaps = BTreeMap::new();
        overlaps.insert(SNAP_HEAD, overlap);
        self.parent = Some(ParentLink {
            store: parent,
            snap_id: parent_snap_id,
            overlaps: RwLock::new(overlaps),
        });
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn object_name(&self, object_no: u64) -> String {
        object_name(&self.object_prefix, object_no)
    }

    pub fn image_size(&self) -> u64 {
        self.image_size.load(Ordering::Acquire)
    }

    /// Sets the live image size. Shrinking below the parent overlap shrinks
    /// the overlap too.
    pub fn set_image_size(&self, size: u64) {
        self.image_size.store(size, Ordering::Release);
        if let Some(parent) = &self.parent {
            let mut overlaps = parent.overlaps.write();
            if let Some(overlap) = overlaps.get_mut(&SNAP_HEAD) {
                *overlap = (*overlap).min(size);
            }
        }
    }

    /// Records the parent overlap of a new snapshot.
    pub fn snap_create(&self, snap_id: SnapId) {
        if let Some(parent) = &self.parent {
            let overlap = parent.overlap_at(SNAP_HEAD);
            parent.overlaps.write().insert(snap_id, overlap);
        }
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Parent overlap at a snapshot, 0 without a parent.
    pub fn parent_overlap(&self, snap_id: SnapId) -> u64 {
        self.parent
            .as_ref()
            .map(|parent| parent.overlap_at(snap_id))
            .unwrap_or(0)
    }

    /// Raw object content at a snapshot, without parent fall-through.
    pub fn object_at(&self, oid: &str, snap_id: SnapId) -> Option<Vec<u8>> {
        self.objects
            .get(oid)
            .and_then(|record| record.content_at(snap_id).map(<[u8]>::to_vec))
    }

    /// Snapshot sequence the object was last written with.
    pub fn object_snap_seq(&self, oid: &str) -> Option<SnapId> {
        self.objects.get(oid).map(|record| record.snap_seq)
    }

    /// Number of objects with a head or at least one clone.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Content of an object as seen through the image at a snapshot,
    /// zero-padded to the object size.
    pub fn read_object_visible(&self, object_no: u64, snap_id: SnapId) -> Vec<u8> {
        let object_size = self.layout.object_size as usize;
        if let Some(mut buf) = self.object_at(&self.object_name(object_no), snap_id) {
            buf.resize(object_size, 0);
            return buf;
        }

        let mut buf = vec![0u8; object_size];
        if self.parent.is_none() {
            return buf;
        }
        for image_extent in self
            .layout
            .extent_to_file(object_no, 0, self.layout.object_size)
        {
            let parent_data = self.parent_data(image_extent, snap_id);
            for extent in self
                .layout
                .file_to_extents(image_extent.offset, image_extent.length, 0)
            {
                let start = extent.buffer_offset as usize;
                if start >= parent_data.len() {
                    break;
                }
                let end = (start + extent.length as usize).min(parent_data.len());
                let dst = extent.offset as usize;
                buf[dst..dst + (end - start)].copy_from_slice(&parent_data[start..end]);
            }
        }
        buf
    }

    /// Visible content of an image range at a snapshot.
    fn read_image_range(&self, extent: ImageExtent, snap_id: SnapId) -> Vec<u8> {
        let mut buf = vec![0u8; extent.length as usize];
        for object_extent in self.layout.file_to_extents(extent.offset, extent.length, 0) {
            let object = self.read_object_visible(object_extent.object_no, snap_id);
            let src = &object[object_extent.offset as usize
                ..(object_extent.offset + object_extent.length) as usize];
            let dst = object_extent.buffer_offset as usize;
            buf[dst..dst + src.len()].copy_from_slice(src);
        }
        buf
    }

    /// Parent content backing an image range, cut off at the parent overlap.
    fn parent_data(&self, extent: ImageExtent, snap_id: SnapId) -> Vec<u8> {
        let Some(parent) = &self.parent else {
            return Vec::new();
        };
        let overlap = parent.overlap_at(snap_id);
        if extent.offset >= overlap {
            return Vec::new();
        }
        let length = extent.length.min(overlap - extent.offset);
        parent
            .store
            .read_image_range(ImageExtent::new(extent.offset, length), parent.snap_id)
    }

    fn read_sparse(
        &self,
        extent: ImageExtent,
        snap_id: SnapId,
        result: &mut ReadResult,
        data: &mut BytesMut,
    ) {
        for object_extent in self.layout.file_to_extents(extent.offset, extent.length, 0) {
            let image_offset = extent.offset + object_extent.buffer_offset;
            let object = self.read_object_visible(object_extent.object_no, snap_id);
            let slice = &object[object_extent.offset as usize
                ..(object_extent.offset + object_extent.length) as usize];
            for (start, end) in data_runs(slice) {
                result.push(ImageExtent::new(
                    image_offset + start as u64,
                    (end - start) as u64,
                ));
                data.extend_from_slice(&slice[start..end]);
            }
        }
    }

    fn list_object_extent(
        &self,
        delta: &mut SnapshotDelta,
        extent: ObjectExtent,
        image_offset: u64,
        snap_id_start: SnapId,
        snap_ids: &[SnapId],
        list_from_parent: bool,
    ) {
        let oid = self.object_name(extent.object_no);
        let record = self
            .objects
            .get(oid.as_str())
            .map(|record| record.clone())
            .unwrap_or_default();

        let lo = extent.offset;
        let hi = extent.offset + extent.length;

        let mut prev = None;
        if snap_id_start == 0 {
            let first_snap_id = snap_ids.first().copied().unwrap_or(SNAP_HEAD);
            if record.content_at(first_snap_id).is_none() {
                let image_end = image_offset + extent.length;
                // parent-backed ranges surface as initial data
                let parent_end = if list_from_parent {
                    self.parent_overlap(first_snap_id).clamp(image_offset, image_end)
                } else {
                    image_offset
                };
                delta.insert(
                    WriteReadSnapIds::INITIAL,
                    image_offset,
                    parent_end - image_offset,
                    ExtentState::Data,
                );
                delta.insert(
                    WriteReadSnapIds::INITIAL,
                    parent_end,
                    image_end - parent_end,
                    ExtentState::DidNotExist,
                );
            }
        } else {
            prev = record.content_at(snap_id_start);
        }

        for &snap_id in snap_ids {
            let cur = record.content_at(snap_id);
            let key = WriteReadSnapIds::new(snap_id, snap_id);
            for (offset, length, state) in diff_extents(prev, cur, lo, hi) {
                delta.insert(key, image_offset + (offset - lo), length, state);
            }
            prev = cur;
        }
    }
}

#[async_trait]
impl DataStore for MemoryImageStore {
    async fn list_snaps(
        &self,
        image_extents: &[ImageExtent],
        snap_ids: &[SnapId],
        flags: ListSnapsFlags,
    ) -> StorageResult<SnapshotDelta> {
        let Some((&snap_id_start, snap_ids)) = snap_ids.split_first() else {
            return Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                "no snapshots to list",
            ));
        };
        let list_from_parent = !flags.disable_list_from_parent && self.parent.is_some();
        trace!(list_from_parent, "list snaps");

        let mut delta = SnapshotDelta::new();
        for extent in image_extents {
            for object_extent in self.layout.file_to_extents(extent.offset, extent.length, 0) {
                let image_offset = extent.offset + object_extent.buffer_offset;
                self.list_object_extent(
                    &mut delta,
                    object_extent,
                    image_offset,
                    snap_id_start,
                    snap_ids,
                    list_from_parent,
                );
            }
        }
        Ok(delta)
    }

    async fn read(
        &self,
        image_extents: &[ImageExtent],
        snap_id: SnapId,
        _op_flags: OpFlags,
        read_flags: ReadFlags,
    ) -> StorageResult<ReadResult> {
        let image_size = self.image_size();
        let mut result = ReadResult::default();
        let mut data = BytesMut::new();
        for extent in image_extents {
            let mut extent = *extent;
            if !read_flags.disable_clipping {
                if extent.offset >= image_size {
                    continue;
                }
                extent.length = extent.length.min(image_size - extent.offset);
            }
            self.read_sparse(extent, snap_id, &mut result, &mut data);
        }
        result.data = data.freeze();
        Ok(result)
    }

    async fn operate(
        &self,
        oid: &str,
        tx: ObjectTransaction,
        snapc: SnapContext,
    ) -> StorageResult<()> {
        let result = {
            let mut slot = self.objects.entry(Arc::from(oid)).or_default();
            let mut record = slot.clone();
            let result = record.transact(&tx, &snapc);
            if result.is_ok() {
                *slot = record;
            }
            result
        };
        self.objects.remove_if(oid, |_, record| record.is_empty());
        trace!(oid, ops = tx.len(), snapc_seq = snapc.seq, ok = result.is_ok(), "operate");
        result
    }

    async fn stat(&self, oid: &str) -> StorageResult<u64> {
        self.objects
            .get(oid)
            .and_then(|record| record.head.as_ref().map(|head| head.len() as u64))
            .ok_or_else(|| StorageError::new(ErrorCode::NotFound))
    }
}

/// Byte ranges `[start, end)` holding non-zero data.
fn data_runs(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, byte) in buf.iter().enumerate() {
        match (start, *byte != 0) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                runs.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, buf.len()));
    }
    runs
}

/// Changes between two revisions of an object within `[lo, hi)`, as
/// `(offset, length, state)` runs in object space.
fn diff_extents(
    prev: Option<&[u8]>,
    cur: Option<&[u8]>,
    lo: u64,
    hi: u64,
) -> Vec<(u64, u64, ExtentState)> {
    let mut runs: Vec<(u64, u64, ExtentState)> = Vec::new();
    let mut push = |offset: u64, state: ExtentState| match runs.last_mut() {
        Some((o, l, s)) if *s == state && *o + *l == offset => *l += 1,
        _ => runs.push((offset, 1, state)),
    };

    match (prev, cur) {
        (None, None) => {}
        (Some(p), None) => {
            for offset in lo..hi.min(p.len() as u64) {
                push(offset, ExtentState::Zeroed);
            }
        }
        (p, Some(c)) => {
            let p = p.unwrap_or(&[]);
            let (plen, clen) = (p.len() as u64, c.len() as u64);
            for offset in lo..hi.min(plen.max(clen)) {
                let i = offset as usize;
                if offset < clen {
                    if offset >= plen || c[i] != p[i] {
                        push(offset, ExtentState::Data);
                    }
                } else {
                    push(offset, ExtentState::Zeroed);
                }
            }
            if prev.is_none() {
                // newly created: nothing past the end survives
                for offset in clen.max(lo)..hi {
                    push(offset, ExtentState::Zeroed);
                }
            }
        }
    }
    runs
}

/// Builds a write transaction covering a whole buffer.
pub fn write_transaction(offset: u64, data: impl Into<Bytes>) -> ObjectTransaction {
    let mut tx = ObjectTransaction::new();
    tx.write(offset, data.into(), OpFlags::default());
    tx
}
