//! Open image handle: geometry, snapshots, locks and the data namespace.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::data::{object_name, DataStore};
use super::lock::{ExclusiveLock, LockOpGuard};
use super::object_map::ObjectMap;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{
    prune_parent_extents, Layout, ObjectTransaction, OpFlags, ReadFlags, SnapContext, SnapId,
    SNAP_HEAD,
};

/// Optional image features relevant to copying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageFeatures {
    pub object_map: bool,
    pub fast_diff: bool,
}

/// Per-snapshot image metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapInfo {
    pub size: u64,
    pub parent_overlap: Option<u64>,
}

/// Mutable image metadata guarded by `image_lock`.
pub struct ImageState {
    pub size: u64,
    /// Overlap with the parent image; `None` when the image is not a clone.
    pub parent_overlap: Option<u64>,
    pub snaps: BTreeMap<SnapId, SnapInfo>,
    /// In-memory object map. Dropped when the exclusive lock is lost.
    pub object_map: Option<Arc<dyn ObjectMap>>,
}

impl ImageState {
    /// Image size at a snapshot, 0 for unknown snapshots.
    pub fn image_size(&self, snap_id: SnapId) -> u64 {
        if snap_id == SNAP_HEAD {
            return self.size;
        }
        self.snaps.get(&snap_id).map(|info| info.size).unwrap_or(0)
    }

    /// Parent overlap at a snapshot, 0 when there is no parent.
    pub fn parent_overlap(&self, snap_id: SnapId) -> StorageResult<u64> {
        if snap_id == SNAP_HEAD {
            return Ok(self.parent_overlap.unwrap_or(0));
        }
        self.snaps
            .get(&snap_id)
            .map(|info| info.parent_overlap.unwrap_or(0))
            .ok_or_else(|| {
                StorageError::with_message(ErrorCode::NotFound, format!("snapshot {} not found", snap_id))
            })
    }

    pub fn has_parent(&self) -> bool {
        self.parent_overlap.is_some()
    }

    /// Snapshot context for writes to the live image.
    pub fn snap_context(&self) -> SnapContext {
        let snaps: Vec<SnapId> = self.snaps.keys().rev().copied().collect();
        SnapContext::new(snaps.first().copied().unwrap_or(0), snaps)
    }
}

/// Counts copy requests in flight against an image.
#[derive(Debug, Default)]
pub struct AsyncOpTracker {
    in_flight: AtomicU64,
}

impl AsyncOpTracker {
    pub fn start_op(self: &Arc<Self>) -> AsyncOpGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        AsyncOpGuard {
            tracker: self.clone(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Registration of one in-flight request. Released on drop.
#[derive(Debug)]
pub struct AsyncOpGuard {
    tracker: Arc<AsyncOpTracker>,
}

impl Drop for AsyncOpGuard {
    fn drop(&mut self) {
        self.tracker.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An open image.
pub struct ImageCtx {
    pub name: String,
    pub object_prefix: String,
    pub layout: Layout,
    /// Snapshot the image is opened at.
    pub snap_id: SnapId,
    pub features: ImageFeatures,
    /// Image is the target of a live migration.
    pub migrating: bool,
    /// Data namespace; `None` when it could not be opened.
    pub data_ctx: Option<Arc<dyn DataStore>>,
    pub owner_lock: RwLock<()>,
    pub image_lock: RwLock<ImageState>,
    pub exclusive_lock: Option<Arc<ExclusiveLock>>,
    async_ops: Arc<AsyncOpTracker>,
}

impl ImageCtx {
    pub fn get_object_name(&self, object_no: u64) -> String {
        object_name(&self.object_prefix, object_no)
    }

    pub fn get_image_size(&self, snap_id: SnapId) -> u64 {
        self.image_lock.read().image_size(snap_id)
    }

    /// Number of objects backing the image at a snapshot.
    pub fn get_object_count(&self, snap_id: SnapId) -> u64 {
        self.object_count(&self.image_lock.read(), snap_id)
    }

    /// Same as [`ImageCtx::get_object_count`] with `image_lock` already held.
    pub fn object_count(&self, state: &ImageState, snap_id: SnapId) -> u64 {
        self.layout.num_objects(state.image_size(snap_id))
    }

    pub fn get_parent_overlap(&self, snap_id: SnapId) -> StorageResult<u64> {
        self.image_lock.read().parent_overlap(snap_id)
    }

    pub fn has_parent(&self) -> bool {
        self.image_lock.read().has_parent()
    }

    pub fn snap_context(&self) -> SnapContext {
        self.image_lock.read().snap_context()
    }

    /// Snapshot ids in ascending order.
    pub fn snap_ids(&self) -> Vec<SnapId> {
        self.image_lock.read().snaps.keys().copied().collect()
    }

    /// Records a snapshot of the current image state.
    pub fn snap_create(&self, snap_id: SnapId) -> StorageResult<()> {
        let mut state = self.image_lock.write();
        if snap_id == 0 || snap_id == SNAP_HEAD || state.snaps.contains_key(&snap_id) {
            return Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                format!("invalid snapshot id {}", snap_id),
            ));
        }
        let info = SnapInfo {
            size: state.size,
            parent_overlap: state.parent_overlap,
        };
        state.snaps.insert(snap_id, info);
        debug!(image = %self.name, snap_id, "created snapshot");
        Ok(())
    }

    /// Changes the image size. Shrinking a clone shrinks its parent overlap.
    pub fn resize(&self, size: u64) {
        let mut state = self.image_lock.write();
        state.size = size;
        if let Some(overlap) = state.parent_overlap.as_mut() {
            *overlap = (*overlap).min(size);
        }
    }

    /// Swaps the in-memory object map, e.g. to drop it on lock loss.
    pub fn set_object_map(&self, object_map: Option<Arc<dyn ObjectMap>>) {
        self.image_lock.write().object_map = object_map;
    }

    /// Returns the data namespace or an error when it is not open.
    pub fn data_ctx(&self) -> StorageResult<&Arc<dyn DataStore>> {
        self.data_ctx.as_ref().ok_or_else(|| {
            StorageError::with_message(ErrorCode::InvalidArgument, "data pool is not open")
        })
    }

    /// Writes a transaction to a data object at the image's snapshot
    /// context. Objects of a clone are populated from the parent first.
    pub async fn operate(&self, object_no: u64, tx: ObjectTransaction) -> StorageResult<()> {
        let data_ctx = self.data_ctx()?.clone();
        let oid = self.get_object_name(object_no);
        let (snapc, overlap) = {
            let state = self.image_lock.read();
            (state.snap_context(), state.parent_overlap.unwrap_or(0))
        };

        let tx = if overlap > 0 {
            self.copyup(&data_ctx, &oid, object_no, overlap, tx).await?
        } else {
            tx
        };
        data_ctx.operate(&oid, tx, snapc).await
    }

    async fn copyup(
        &self,
        data_ctx: &Arc<dyn DataStore>,
        oid: &str,
        object_no: u64,
        overlap: u64,
        tx: ObjectTransaction,
    ) -> StorageResult<ObjectTransaction> {
        match data_ctx.stat(oid).await {
            Ok(_) => return Ok(tx),
            Err(e) if e.code == ErrorCode::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut extents = self
            .layout
            .extent_to_file(object_no, 0, self.layout.object_size);
        if prune_parent_extents(&mut extents, overlap) == 0 {
            return Ok(tx);
        }

        let read_flags = ReadFlags {
            disable_clipping: true,
        };
        let parent = data_ctx
            .read(&extents, SNAP_HEAD, OpFlags::default(), read_flags)
            .await?;
        debug!(oid, bytes = parent.data.len(), "copyup from parent");

        let mut copyup = ObjectTransaction::new();
        copyup.create(false);
        let mut buffer_offset = 0usize;
        for extent in &parent.extent_map {
            for object_extent in self.layout.file_to_extents(extent.offset, extent.length, 0) {
                let end = buffer_offset + object_extent.length as usize;
                copyup.write(
                    object_extent.offset,
                    parent.data.slice(buffer_offset..end),
                    OpFlags::default(),
                );
                buffer_offset = end;
            }
        }
        for op in tx.ops() {
            copyup.push(op.clone());
        }
        Ok(copyup)
    }

    /// Takes an exclusive-lock op token; no-op for images without the lock.
    /// Callers hold `owner_lock`.
    pub fn start_lock_op(&self) -> StorageResult<LockOpGuard> {
        match &self.exclusive_lock {
            Some(lock) => lock.start_op(),
            None => Ok(LockOpGuard::noop()),
        }
    }

    pub fn start_async_op(&self) -> AsyncOpGuard {
        self.async_ops.start_op()
    }

    pub fn async_ops_in_flight(&self) -> u64 {
        self.async_ops.in_flight()
    }
}

/// Builder for opening an image.
pub struct ImageCtxBuilder {
    name: String,
    object_prefix: Option<String>,
    layout: Layout,
    size: u64,
    snap_id: SnapId,
    features: ImageFeatures,
    migrating: bool,
    data_ctx: Option<Arc<dyn DataStore>>,
    parent_overlap: Option<u64>,
    object_map: Option<Arc<dyn ObjectMap>>,
    exclusive_lock: Option<Arc<ExclusiveLock>>,
}

impl ImageCtxBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_prefix: None,
            layout: Layout::default(),
            size: 0,
            snap_id: SNAP_HEAD,
            features: ImageFeatures::default(),
            migrating: false,
            data_ctx: None,
            parent_overlap: None,
            object_map: None,
            exclusive_lock: None,
        }
    }

    /// Sets the data object name prefix. Defaults to `rbd_data.<name>`.
    pub fn object_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.object_prefix = Some(prefix.into());
        self
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Opens the image at a snapshot instead of the head.
    pub fn snap_id(mut self, snap_id: SnapId) -> Self {
        self.snap_id = snap_id;
        self
    }

    pub fn features(mut self, features: ImageFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn migrating(mut self, migrating: bool) -> Self {
        self.migrating = migrating;
        self
    }

    pub fn data_ctx(mut self, data_ctx: Arc<dyn DataStore>) -> Self {
        self.data_ctx = Some(data_ctx);
        self
    }

    /// Marks the image as a clone overlapping its parent by `overlap` bytes.
    pub fn parent_overlap(mut self, overlap: u64) -> Self {
        self.parent_overlap = Some(overlap);
        self
    }

    pub fn object_map(mut self, object_map: Arc<dyn ObjectMap>) -> Self {
        self.object_map = Some(object_map);
        self
    }

    pub fn exclusive_lock(mut self, lock: Arc<ExclusiveLock>) -> Self {
        self.exclusive_lock = Some(lock);
        self
    }

    pub fn build(self) -> ImageCtx {
        let object_prefix = self
            .object_prefix
            .unwrap_or_else(|| format!("rbd_data.{}", self.name));
        ImageCtx {
            name: self.name,
            object_prefix,
            layout: self.layout,
            snap_id: self.snap_id,
            features: self.features,
            migrating: self.migrating,
            data_ctx: self.data_ctx,
            owner_lock: RwLock::new(()),
            image_lock: RwLock::new(ImageState {
                size: self.size,
                parent_overlap: self.parent_overlap,
                snaps: BTreeMap::new(),
                object_map: self.object_map,
            }),
            exclusive_lock: self.exclusive_lock,
            async_ops: Arc::new(AsyncOpTracker::default()),
        }
    }
}
