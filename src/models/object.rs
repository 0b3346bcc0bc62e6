//! Object-level data models: write ops, transactions, read results and
//! object-map states.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::layout::ImageExtent;
use super::snapshot::SnapId;

/// Object existence state recorded in the object map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    #[default]
    Nonexistent,
    Exists,
    Pending,
    /// Object exists and is unchanged since the previous snapshot.
    ExistsClean,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Nonexistent => "nonexistent",
            ObjectState::Exists => "exists",
            ObjectState::Pending => "pending",
            ObjectState::ExistsClean => "exists_clean",
        }
    }

    /// On-disk encoding used by the object map.
    pub fn as_u8(&self) -> u8 {
        match self {
            ObjectState::Nonexistent => 0,
            ObjectState::Exists => 1,
            ObjectState::Pending => 2,
            ObjectState::ExistsClean => 3,
        }
    }
}

/// Kind of a compiled destination write op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOpKind {
    Write,
    Zero,
    Truncate,
    /// Recreate the object empty (hides the parent).
    RemoveTruncate,
    Remove,
}

/// One destination op compiled for a snapshot transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Write { offset: u64, data: Bytes },
    Zero { offset: u64, length: u64 },
    Truncate { offset: u64 },
    RemoveTruncate,
    Remove,
}

impl WriteOp {
    pub fn kind(&self) -> WriteOpKind {
        match self {
            WriteOp::Write { .. } => WriteOpKind::Write,
            WriteOp::Zero { .. } => WriteOpKind::Zero,
            WriteOp::Truncate { .. } => WriteOpKind::Truncate,
            WriteOp::RemoveTruncate => WriteOpKind::RemoveTruncate,
            WriteOp::Remove => WriteOpKind::Remove,
        }
    }

    /// Object offset the op starts at.
    pub fn object_offset(&self) -> u64 {
        match self {
            WriteOp::Write { offset, .. }
            | WriteOp::Zero { offset, .. }
            | WriteOp::Truncate { offset } => *offset,
            WriteOp::RemoveTruncate | WriteOp::Remove => 0,
        }
    }

    /// Number of bytes the op covers.
    pub fn object_length(&self) -> u64 {
        match self {
            WriteOp::Write { data, .. } => data.len() as u64,
            WriteOp::Zero { length, .. } => *length,
            WriteOp::Truncate { .. } | WriteOp::RemoveTruncate | WriteOp::Remove => 0,
        }
    }

    pub fn object_end(&self) -> u64 {
        self.object_offset() + self.object_length()
    }
}

/// Advisory I/O hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpFlags {
    pub fadvise_sequential: bool,
    pub fadvise_nocache: bool,
}

impl OpFlags {
    /// Streaming copy hints: sequential access, don't pollute caches.
    pub fn sequential_nocache() -> Self {
        Self {
            fadvise_sequential: true,
            fadvise_nocache: true,
        }
    }
}

/// Image-level read modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    /// Don't clip the request to the current image size.
    pub disable_clipping: bool,
}

/// Snapshot listing modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListSnapsFlags {
    /// Report missing ranges as DNE instead of listing them from the parent.
    pub disable_list_from_parent: bool,
}

/// Comparison used by the snapshot-sequence assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssertSnapcSeqState {
    /// Pass only when the supplied seq is greater than the object's seq.
    GtSnapsetSeq,
    /// Pass only when the supplied seq is not greater than the object's seq.
    LeSnapsetSeq,
}

/// A sub-op of a compound destination transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    AssertSnapcSeq { seq: SnapId, state: AssertSnapcSeqState },
    Write { offset: u64, data: Bytes, flags: OpFlags },
    Zero { offset: u64, length: u64 },
    Create { exclusive: bool },
    Truncate { offset: u64 },
    Remove,
}

/// Ordered, atomic list of sub-ops applied to one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectTransaction {
    ops: Vec<TxOp>,
}

impl ObjectTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert_snapc_seq(&mut self, seq: SnapId, state: AssertSnapcSeqState) {
        self.ops.push(TxOp::AssertSnapcSeq { seq, state });
    }

    pub fn write(&mut self, offset: u64, data: Bytes, flags: OpFlags) {
        self.ops.push(TxOp::Write { offset, data, flags });
    }

    pub fn zero(&mut self, offset: u64, length: u64) {
        self.ops.push(TxOp::Zero { offset, length });
    }

    pub fn create(&mut self, exclusive: bool) {
        self.ops.push(TxOp::Create { exclusive });
    }

    pub fn truncate(&mut self, offset: u64) {
        self.ops.push(TxOp::Truncate { offset });
    }

    pub fn remove(&mut self) {
        self.ops.push(TxOp::Remove);
    }

    pub fn push(&mut self, op: TxOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Sparse result of an image read: the image extents that returned data and
/// the concatenated bytes of those extents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub extent_map: Vec<ImageExtent>,
    pub data: Bytes,
}

impl ReadResult {
    /// Appends an extent, merging it into the previous one when contiguous.
    pub fn push(&mut self, extent: ImageExtent) {
        match self.extent_map.last_mut() {
            Some(last) if last.end() == extent.offset => last.length += extent.length,
            _ => self.extent_map.push(extent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_op_extents() {
        let op = WriteOp::Write {
            offset: 512,
            data: Bytes::from_static(b"abcd"),
        };
        assert_eq!(op.kind(), WriteOpKind::Write);
        assert_eq!(op.object_end(), 516);

        assert_eq!(WriteOp::Truncate { offset: 100 }.object_end(), 100);
        assert_eq!(WriteOp::Remove.object_end(), 0);
        assert_eq!(WriteOp::Zero { offset: 10, length: 5 }.object_end(), 15);
    }

    #[test]
    fn test_read_result_merges_contiguous() {
        let mut result = ReadResult::default();
        result.push(ImageExtent::new(0, 10));
        result.push(ImageExtent::new(10, 5));
        result.push(ImageExtent::new(20, 5));
        assert_eq!(result.extent_map, vec![ImageExtent::new(0, 15), ImageExtent::new(20, 5)]);
    }
}
