//! Image striping layout.
//!
//! An image is a logical byte space striped over fixed-size objects. Data is
//! laid out in `stripe_unit` blocks, round-robin over `stripe_count` objects,
//! until each object of the set holds `object_size` bytes; then the next
//! object set starts.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, StorageError, StorageResult};

/// Default object size (4 MiB).
pub const DEFAULT_OBJECT_SIZE: u64 = 4 * 1024 * 1024;

/// A range of the logical image byte space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageExtent {
    pub offset: u64,
    pub length: u64,
}

impl ImageExtent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A range within one object, with its position in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectExtent {
    pub object_no: u64,
    pub offset: u64,
    pub length: u64,
    pub buffer_offset: u64,
}

/// Striping parameters shared by source and destination images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub object_size: u64,
    pub stripe_unit: u64,
    pub stripe_count: u64,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(DEFAULT_OBJECT_SIZE)
    }
}

impl Layout {
    /// Plain layout: one stripe unit per object, no fan-out.
    pub fn new(object_size: u64) -> Self {
        Self {
            object_size,
            stripe_unit: object_size,
            stripe_count: 1,
        }
    }

    /// Fancy striping layout.
    pub fn with_striping(object_size: u64, stripe_unit: u64, stripe_count: u64) -> StorageResult<Self> {
        let layout = Self {
            object_size,
            stripe_unit,
            stripe_count,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Checks the striping invariants.
    pub fn validate(&self) -> StorageResult<()> {
        if self.object_size == 0 || self.stripe_unit == 0 || self.stripe_count == 0 {
            return Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                "layout sizes must be non-zero",
            ));
        }
        if self.object_size % self.stripe_unit != 0 {
            return Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                "object size must be a multiple of the stripe unit",
            ));
        }
        Ok(())
    }

    fn stripes_per_object(&self) -> u64 {
        self.object_size / self.stripe_unit
    }

    /// Maps a range of an object back onto the image extents it covers.
    /// Contiguous image extents are merged.
    pub fn extent_to_file(&self, object_no: u64, mut offset: u64, mut length: u64) -> Vec<ImageExtent> {
        let su = self.stripe_unit;
        let stripe_pos = object_no % self.stripe_count;
        let object_set_no = object_no / self.stripe_count;

        let mut extents: Vec<ImageExtent> = Vec::new();
        while length > 0 {
            let off_in_block = offset % su;
            let stripe_no = offset / su + object_set_no * self.stripes_per_object();
            let block_no = stripe_no * self.stripe_count + stripe_pos;
            let extent_offset = block_no * su + off_in_block;
            let extent_length = length.min(su - off_in_block);

            match extents.last_mut() {
                Some(last) if last.end() == extent_offset => last.length += extent_length,
                _ => extents.push(ImageExtent::new(extent_offset, extent_length)),
            }

            offset += extent_length;
            length -= extent_length;
        }
        extents
    }

    /// Maps an image range onto object extents, in image order.
    pub fn file_to_extents(&self, image_offset: u64, length: u64, buffer_offset: u64) -> Vec<ObjectExtent> {
        let su = self.stripe_unit;
        let stripes_per_object = self.stripes_per_object();

        let mut extents = Vec::new();
        let mut cur = image_offset;
        let mut left = length;
        let mut buffer_offset = buffer_offset;
        while left > 0 {
            let block_no = cur / su;
            let stripe_no = block_no / self.stripe_count;
            let stripe_pos = block_no % self.stripe_count;
            let object_set_no = stripe_no / stripes_per_object;
            let object_no = object_set_no * self.stripe_count + stripe_pos;

            let block_start = (stripe_no % stripes_per_object) * su;
            let block_off = cur % su;
            let x_offset = block_start + block_off;
            let x_length = left.min(su - block_off);

            extents.push(ObjectExtent {
                object_no,
                offset: x_offset,
                length: x_length,
                buffer_offset,
            });

            cur += x_length;
            left -= x_length;
            buffer_offset += x_length;
        }
        extents
    }

    /// Number of objects backing an image of the given size.
    pub fn num_objects(&self, image_size: u64) -> u64 {
        let period = self.stripe_count * self.object_size;
        let num_periods = image_size.div_ceil(period);
        let remainder_bytes = image_size % period;
        let mut remainder_objs = 0;
        if remainder_bytes > 0 && remainder_bytes < self.stripe_count * self.stripe_unit {
            remainder_objs = self.stripe_count - remainder_bytes.div_ceil(self.stripe_unit);
        }
        num_periods * self.stripe_count - remainder_objs
    }
}

/// Trims sorted image extents so nothing lies beyond `overlap`, returning the
/// number of bytes that remain.
pub fn prune_parent_extents(extents: &mut Vec<ImageExtent>, overlap: u64) -> u64 {
    extents.retain(|e| e.offset < overlap);
    if let Some(last) = extents.last_mut() {
        if last.end() > overlap {
            last.length = overlap - last.offset;
        }
    }
    extents.iter().map(|e| e.length).sum()
}
