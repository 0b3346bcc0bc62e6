//! Common test utilities.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use deepcopy_rs::models::{
    ImageExtent, Layout, ListSnapsFlags, ObjectState, ObjectTransaction, OpFlags, ReadFlags,
    ReadResult, SnapContext, SnapId, SnapMap, SnapshotDelta, TxOp,
};
use deepcopy_rs::storage::{
    DataStore, ExclusiveLock, ImageCtx, ImageCtxBuilder, ImageFeatures, MemoryImageStore,
    MemoryObjectMap, ObjectMap,
};
use deepcopy_rs::{ErrorCode, StorageError, StorageResult};

/// Byte every scripted read returns.
pub const FILL: u8 = 0xab;

/// One recorded destination transaction.
#[derive(Debug, Clone)]
pub struct RecordedTx {
    pub oid: String,
    pub ops: Vec<TxOp>,
    pub snapc: SnapContext,
    /// Exclusive-lock ops in flight while the transaction was submitted.
    pub lock_ops_in_flight: Option<u64>,
}

/// Data store that answers from a script and records what it was asked.
///
/// `list_snaps` returns the scripted delta, reads return [`FILL`] bytes for
/// every requested range unless a result was queued, and transactions are
/// recorded and answered from the queued write results (success by default).
#[derive(Default)]
pub struct ScriptedStore {
    delta: Mutex<Option<StorageResult<SnapshotDelta>>>,
    read_results: Mutex<VecDeque<StorageResult<ReadResult>>>,
    write_results: Mutex<VecDeque<StorageResult<()>>>,
    watched_lock: Mutex<Option<Arc<ExclusiveLock>>>,
    blocklisted_lock: Mutex<Option<Arc<ExclusiveLock>>>,
    pub list_calls: Mutex<Vec<Vec<SnapId>>>,
    pub list_flags: Mutex<Vec<ListSnapsFlags>>,
    pub read_calls: Mutex<Vec<(Vec<ImageExtent>, SnapId, ReadFlags)>>,
    pub read_op_flags: Mutex<Vec<OpFlags>>,
    pub transactions: Mutex<Vec<RecordedTx>>,
}

impl ScriptedStore {
    pub fn new(delta: SnapshotDelta) -> Arc<Self> {
        let store = Self::default();
        *store.delta.lock() = Some(Ok(delta));
        Arc::new(store)
    }

    pub fn failing_list_snaps(code: ErrorCode) -> Arc<Self> {
        let store = Self::default();
        *store.delta.lock() = Some(Err(StorageError::new(code)));
        Arc::new(store)
    }

    pub fn push_read_result(&self, result: StorageResult<ReadResult>) {
        self.read_results.lock().push_back(result);
    }

    pub fn push_write_result(&self, result: StorageResult<()>) {
        self.write_results.lock().push_back(result);
    }

    /// Records the lock's in-flight op count with every transaction.
    pub fn watch_lock(&self, lock: Arc<ExclusiveLock>) {
        *self.watched_lock.lock() = Some(lock);
    }

    /// Blocklists `lock` once a transaction has been applied.
    pub fn blocklist_after_write(&self, lock: Arc<ExclusiveLock>) {
        *self.blocklisted_lock.lock() = Some(lock);
    }

    pub fn transactions(&self) -> Vec<RecordedTx> {
        self.transactions.lock().clone()
    }
}

#[async_trait]
impl DataStore for ScriptedStore {
    async fn list_snaps(
        &self,
        _image_extents: &[ImageExtent],
        snap_ids: &[SnapId],
        flags: ListSnapsFlags,
    ) -> StorageResult<SnapshotDelta> {
        self.list_calls.lock().push(snap_ids.to_vec());
        self.list_flags.lock().push(flags);
        self.delta
            .lock()
            .clone()
            .unwrap_or_else(|| Ok(SnapshotDelta::new()))
    }

    async fn read(
        &self,
        image_extents: &[ImageExtent],
        snap_id: SnapId,
        op_flags: OpFlags,
        read_flags: ReadFlags,
    ) -> StorageResult<ReadResult> {
        self.read_calls
            .lock()
            .push((image_extents.to_vec(), snap_id, read_flags));
        self.read_op_flags.lock().push(op_flags);
        if let Some(result) = self.read_results.lock().pop_front() {
            return result;
        }

        let length: u64 = image_extents.iter().map(|e| e.length).sum();
        Ok(ReadResult {
            extent_map: image_extents.to_vec(),
            data: Bytes::from(vec![FILL; length as usize]),
        })
    }

    async fn operate(
        &self,
        oid: &str,
        tx: ObjectTransaction,
        snapc: SnapContext,
    ) -> StorageResult<()> {
        let lock_ops_in_flight = self
            .watched_lock
            .lock()
            .as_ref()
            .map(|lock| lock.in_flight_ops());
        self.transactions.lock().push(RecordedTx {
            oid: oid.to_string(),
            ops: tx.ops().to_vec(),
            snapc,
            lock_ops_in_flight,
        });
        let result = self.write_results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            if let Some(lock) = self.blocklisted_lock.lock().as_ref() {
                lock.blocklist();
            }
        }
        result
    }

    async fn stat(&self, _oid: &str) -> StorageResult<u64> {
        Err(StorageError::new(ErrorCode::NotFound))
    }
}

/// Object map whose asynchronous updates always fail.
pub struct FailingObjectMap {
    code: ErrorCode,
}

impl FailingObjectMap {
    pub fn new(code: ErrorCode) -> Arc<Self> {
        Arc::new(Self { code })
    }
}

impl ObjectMap for FailingObjectMap {
    fn aio_update(
        &self,
        _snap_id: SnapId,
        _object_no: u64,
        _new_state: ObjectState,
        _current_state: Option<ObjectState>,
    ) -> Option<BoxFuture<'static, StorageResult<()>>> {
        let code = self.code;
        Some(async move { Err(StorageError::new(code)) }.boxed())
    }

    fn object_state(&self, _snap_id: SnapId, _object_no: u64) -> ObjectState {
        ObjectState::Nonexistent
    }
}

/// Builds a snap map from `(src, [dst, older dst...])` pairs.
pub fn snap_map(entries: &[(SnapId, &[SnapId])]) -> SnapMap {
    SnapMap::new(entries.iter().map(|(k, v)| (*k, v.to_vec())).collect()).unwrap()
}

/// Builds a snapshot delta from `(write_snap, read_snap, offset, length, state)`.
pub fn delta(
    extents: &[(SnapId, SnapId, u64, u64, deepcopy_rs::models::ExtentState)],
) -> SnapshotDelta {
    use deepcopy_rs::models::{SnapshotExtent, WriteReadSnapIds};
    extents
        .iter()
        .map(|&(write, read, offset, length, state)| {
            (
                WriteReadSnapIds::new(write, read),
                SnapshotExtent::new(offset, length, state),
            )
        })
        .collect()
}

/// Source image over a data store, with the given snapshots.
pub fn src_image(
    store: Arc<dyn DataStore>,
    layout: Layout,
    size: u64,
    parent_overlap: Option<u64>,
    snaps: &[SnapId],
) -> Arc<ImageCtx> {
    let mut builder = ImageCtxBuilder::new("src")
        .layout(layout)
        .size(size)
        .data_ctx(store);
    if let Some(overlap) = parent_overlap {
        builder = builder.parent_overlap(overlap);
    }
    let image = builder.build();
    for &snap_id in snaps {
        image.snap_create(snap_id).unwrap();
    }
    Arc::new(image)
}

/// Destination image options.
#[derive(Clone)]
pub struct DstOptions {
    pub size: u64,
    pub snaps: Vec<SnapId>,
    pub object_map: Option<Arc<dyn ObjectMap>>,
    pub object_map_feature: bool,
    pub fast_diff: bool,
    pub migrating: bool,
    pub lock: Option<Arc<ExclusiveLock>>,
}

impl Default for DstOptions {
    fn default() -> Self {
        Self {
            size: 4096,
            snaps: Vec::new(),
            object_map: None,
            object_map_feature: false,
            fast_diff: false,
            migrating: false,
            lock: Some(ExclusiveLock::new_locked()),
        }
    }
}

impl DstOptions {
    /// Enables the object map feature backed by `object_map`.
    pub fn with_object_map(mut self, object_map: Arc<dyn ObjectMap>) -> Self {
        self.object_map = Some(object_map);
        self.object_map_feature = true;
        self
    }
}

pub fn dst_image(store: Arc<dyn DataStore>, layout: Layout, options: DstOptions) -> Arc<ImageCtx> {
    let mut builder = ImageCtxBuilder::new("dst")
        .layout(layout)
        .size(options.size)
        .features(ImageFeatures {
            object_map: options.object_map_feature,
            fast_diff: options.fast_diff,
        })
        .migrating(options.migrating)
        .data_ctx(store);
    if let Some(object_map) = options.object_map {
        builder = builder.object_map(object_map);
    }
    if let Some(lock) = options.lock {
        builder = builder.exclusive_lock(lock);
    }
    let image = builder.build();
    for &snap_id in &options.snaps {
        image.snap_create(snap_id).unwrap();
    }
    Arc::new(image)
}

/// Source and destination images backed by in-memory stores.
pub struct MemoryImages {
    pub layout: Layout,
    pub src_store: Arc<MemoryImageStore>,
    pub src: Arc<ImageCtx>,
    pub dst_store: Arc<MemoryImageStore>,
    pub dst: Arc<ImageCtx>,
    pub object_map: MemoryObjectMap,
}

impl MemoryImages {
    pub fn new(layout: Layout, size: u64) -> Self {
        let src_store = Arc::new(MemoryImageStore::new(layout, "rbd_data.src"));
        let dst_store = Arc::new(MemoryImageStore::new(layout, "rbd_data.dst"));
        src_store.set_image_size(size);
        dst_store.set_image_size(size);
        let object_map = MemoryObjectMap::new();

        let src = ImageCtxBuilder::new("src")
            .layout(layout)
            .size(size)
            .data_ctx(src_store.clone())
            .build();
        let dst = ImageCtxBuilder::new("dst")
            .layout(layout)
            .size(size)
            .features(ImageFeatures {
                object_map: true,
                fast_diff: true,
            })
            .data_ctx(dst_store.clone())
            .object_map(Arc::new(object_map.clone()))
            .exclusive_lock(ExclusiveLock::new_locked())
            .build();

        Self {
            layout,
            src_store,
            src: Arc::new(src),
            dst_store,
            dst: Arc::new(dst),
            object_map,
        }
    }

    /// Writes to a source object at the live snapshot context.
    pub async fn write(&self, object_no: u64, offset: u64, data: &[u8]) {
        let mut tx = ObjectTransaction::new();
        tx.write(offset, Bytes::copy_from_slice(data), OpFlags::default());
        self.src.operate(object_no, tx).await.unwrap();
    }

    /// Snapshots both images; the destination id is `src_snap_id + 100`.
    pub fn snapshot(&self, src_snap_id: SnapId) {
        self.src.snap_create(src_snap_id).unwrap();
        self.src_store.snap_create(src_snap_id);
        self.dst.snap_create(src_snap_id + 100).unwrap();
        self.dst_store.snap_create(src_snap_id + 100);
    }

    pub fn src_object(&self, object_no: u64, snap_id: SnapId) -> Vec<u8> {
        self.src_store.read_object_visible(object_no, snap_id)
    }

    pub fn dst_object(&self, object_no: u64, snap_id: SnapId) -> Vec<u8> {
        self.dst_store.read_object_visible(object_no, snap_id)
    }
}

/// Snap map replicating `src_snaps` and the head, destination ids shifted
/// by 100.
pub fn shifted_snap_map(src_snaps: &[SnapId]) -> SnapMap {
    use deepcopy_rs::models::SNAP_HEAD;
    let mut entries = BTreeMap::new();
    let mut older: Vec<SnapId> = Vec::new();
    for &src_snap_id in src_snaps {
        let mut dst = vec![src_snap_id + 100];
        dst.extend(&older);
        entries.insert(src_snap_id, dst);
        older.insert(0, src_snap_id + 100);
    }
    let mut head = vec![SNAP_HEAD];
    head.extend(older);
    entries.insert(SNAP_HEAD, head);
    SnapMap::new(entries).unwrap()
}
