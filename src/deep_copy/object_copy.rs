//! Copy of a single object and its snapshot history.
//!
//! The request runs as one task with a suspension point at every backend
//! call: list the snapshot delta, read each planned snapshot, write one
//! transaction per destination snapshot, then update the destination object
//! map. Only one backend call is outstanding at any time.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, trace, Instrument};

use super::compiler::{CompileContext, WritePlan};
use super::handler::ProgressHandler;
use super::planner::{
    compute_dst_object_may_exist, compute_read_ops, dst_may_exist, dst_snap_id, DstObjectMayExist,
    ReadOp,
};
use super::queue::SnapQueue;
use crate::error::{result_code, CopyError, CopyResult, ErrorCode, StorageError, StorageResult};
use crate::models::{
    AssertSnapcSeqState, ImageExtent, ListSnapsFlags, ObjectTransaction, OpFlags, ReadFlags,
    SnapContext, SnapId, SnapMap, SnapshotDelta, WriteOp, WriteReadSnapIds, SNAP_HEAD,
};
use crate::storage::{AsyncOpGuard, DataStore, ImageCtx, LockOpGuard};

/// Completion callback, invoked exactly once.
pub type OnFinish = Box<dyn FnOnce(CopyResult) + Send>;

/// Copies one object, with every mapped snapshot, from a source image into
/// a destination image.
pub struct ObjectCopyRequest {
    src: Arc<ImageCtx>,
    dst: Arc<ImageCtx>,
    src_snap_id_start: SnapId,
    dst_snap_id_start: SnapId,
    snap_map: SnapMap,
    dst_object_number: u64,
    flatten: bool,
    handler: Option<Arc<dyn ProgressHandler>>,
    on_finish: Option<OnFinish>,

    src_data: Arc<dyn DataStore>,
    dst_data: Arc<dyn DataStore>,
    dst_oid: String,
    // released when the request is dropped
    _src_async_op: AsyncOpGuard,

    image_extents: Vec<ImageExtent>,
    snapshot_delta: SnapshotDelta,
    dst_object_may_exist: DstObjectMayExist,
    read_ops: SnapQueue<WriteReadSnapIds, ReadOp>,
    plan: WritePlan,
}

impl ObjectCopyRequest {
    /// Creates a request. Both images must have an open data namespace.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src: Arc<ImageCtx>,
        dst: Arc<ImageCtx>,
        src_snap_id_start: SnapId,
        dst_snap_id_start: SnapId,
        snap_map: SnapMap,
        dst_object_number: u64,
        flatten: bool,
        handler: Option<Arc<dyn ProgressHandler>>,
        on_finish: OnFinish,
    ) -> Self {
        let src_data = src
            .data_ctx
            .clone()
            .expect("source image data pool must be open");
        let dst_data = dst
            .data_ctx
            .clone()
            .expect("destination image data pool must be open");

        let src_async_op = src.start_async_op();
        let dst_oid = dst.get_object_name(dst_object_number);
        debug!(dst_oid = %dst_oid, "created object copy request");

        Self {
            src,
            dst,
            src_snap_id_start,
            dst_snap_id_start,
            snap_map,
            dst_object_number,
            flatten,
            handler,
            on_finish: Some(on_finish),
            src_data,
            dst_data,
            dst_oid,
            _src_async_op: src_async_op,
            image_extents: Vec::new(),
            snapshot_delta: SnapshotDelta::new(),
            dst_object_may_exist: DstObjectMayExist::new(),
            read_ops: SnapQueue::new(),
            plan: WritePlan::new(),
        }
    }

    pub fn dst_oid(&self) -> &str {
        &self.dst_oid
    }

    /// Runs the request on the tokio runtime. The completion callback fires
    /// once the pipeline finishes, successfully or not.
    pub fn send(mut self) -> JoinHandle<()> {
        let span = debug_span!("object_copy", dst_oid = %self.dst_oid);
        tokio::spawn(
            async move {
                let result = self.execute().await;
                self.finish(result);
            }
            .instrument(span),
        )
    }

    async fn execute(&mut self) -> CopyResult {
        self.send_list_snaps().await?;

        self.dst_object_may_exist = compute_dst_object_may_exist(&self.dst, self.dst_object_number);
        self.compute_read_ops();

        let read_ops = self.send_reads().await?;
        self.compute_write_plan(read_ops);

        if self.plan.write_ops.is_empty() {
            debug!("nothing to copy");
            return Err(CopyError::NothingToCopy);
        }

        self.send_write_objects().await?;
        self.send_update_object_map().await
    }

    async fn send_list_snaps(&mut self) -> CopyResult {
        // source and destination share the object layout
        let layout = self.dst.layout;
        self.image_extents = layout.extent_to_file(self.dst_object_number, 0, layout.object_size);
        trace!(image_extents = ?self.image_extents, "list snaps");

        let mut snap_ids = Vec::with_capacity(1 + self.snap_map.len());
        snap_ids.push(self.src_snap_id_start);
        snap_ids.extend(
            self.snap_map
                .src_snap_ids()
                .filter(|&snap_id| snap_id != self.src_snap_id_start),
        );

        let flags = ListSnapsFlags {
            disable_list_from_parent: true,
        };

        self.snapshot_delta.clear();
        match self
            .src_data
            .list_snaps(&self.image_extents, &snap_ids, flags)
            .await
        {
            Ok(delta) => {
                trace!(snapshot_delta = ?delta, "listed snaps");
                self.snapshot_delta = delta;
                Ok(())
            }
            Err(e) => {
                error!("failed to list snaps: {}", e);
                Err(CopyError::ListSnaps(e))
            }
        }
    }

    fn compute_read_ops(&mut self) {
        let read_from_parent = self.src_snap_id_start == 0 && self.src.has_parent();
        let src = &self.src;
        self.read_ops = compute_read_ops(
            &self.snapshot_delta,
            &self.snap_map,
            &self.dst_object_may_exist,
            read_from_parent,
            self.flatten,
            |snap_id| src.get_parent_overlap(snap_id),
        );
    }

    /// Executes the planned reads one snapshot at a time.
    async fn send_reads(&mut self) -> CopyResult<Vec<(WriteReadSnapIds, ReadOp)>> {
        let mut completed = Vec::with_capacity(self.read_ops.len());

        while let Some((key, mut read_op)) = self.read_ops.pop_front() {
            // an empty interval is implied by a truncate or remove
            if !read_op.image_interval.is_empty() {
                let image_extents: Vec<ImageExtent> = read_op
                    .image_interval
                    .iter()
                    .map(|(offset, length)| ImageExtent::new(offset, length))
                    .collect();
                let read_flags = ReadFlags {
                    disable_clipping: key.read_snap_id != self.src.snap_id,
                };
                trace!(
                    "read: src_snap_seq={}, image_extents={}",
                    key.read_snap_id,
                    read_op.image_interval
                );

                let result = self
                    .src_data
                    .read(
                        &image_extents,
                        key.read_snap_id,
                        OpFlags::sequential_nocache(),
                        read_flags,
                    )
                    .await
                    .and_then(check_read_result);
                match result {
                    Ok(result) => {
                        read_op.extent_map = result.extent_map;
                        read_op.data = result.data;
                    }
                    Err(e) => {
                        error!("failed to read from source object: {}", e);
                        return Err(CopyError::Read(e));
                    }
                }
            }

            if let Some(handler) = &self.handler {
                handler.on_bytes_read(read_op.data.len() as u64);
            }
            completed.push((key, read_op));
        }

        Ok(completed)
    }

    fn compute_write_plan(&mut self, read_ops: Vec<(WriteReadSnapIds, ReadOp)>) {
        self.plan.merge_write_ops(read_ops, &self.dst.layout);

        let ctx = CompileContext {
            snap_map: &self.snap_map,
            may_exist: &self.dst_object_may_exist,
            layout: &self.dst.layout,
            image_extents: &self.image_extents,
            hide_parent: self.src_snap_id_start == 0 && self.src.has_parent(),
            fast_diff: self.dst.features.fast_diff,
        };
        let dst = &self.dst;
        self.plan
            .compute_zero_ops(&ctx, &self.snapshot_delta, |snap_id| dst.get_parent_overlap(snap_id));
    }

    async fn send_write_objects(&mut self) -> CopyResult {
        while let Some((src_snap_seq, write_ops)) = self.plan.write_ops.pop_front() {
            self.send_write_object(src_snap_seq, write_ops).await?;
        }
        Ok(())
    }

    async fn send_write_object(&mut self, src_snap_seq: SnapId, write_ops: Vec<WriteOp>) -> CopyResult {
        let snapc = self.write_snap_context(src_snap_seq, &write_ops);
        trace!(
            "src_snap_seq={}, dst_snap_seq={}, dst_snaps={:?}",
            src_snap_seq,
            snapc.seq,
            snapc.snaps
        );

        let mut tx = ObjectTransaction::new();
        if self.dst.migrating {
            tx.assert_snapc_seq(snapc.seq, AssertSnapcSeqState::GtSnapsetSeq);
        }
        let guard_ops = tx.len();

        for write_op in write_ops {
            match write_op {
                WriteOp::Write { offset, data } => {
                    trace!("write op: {}~{}", offset, data.len());
                    tx.write(offset, data, OpFlags::sequential_nocache());
                }
                WriteOp::Zero { offset, length } => {
                    trace!("zero op: {}~{}", offset, length);
                    tx.zero(offset, length);
                }
                WriteOp::RemoveTruncate => {
                    trace!("create op");
                    tx.create(false);
                    tx.truncate(0);
                }
                WriteOp::Truncate { offset } => {
                    trace!("trunc op: {}", offset);
                    tx.truncate(offset);
                }
                WriteOp::Remove => {
                    trace!("remove op");
                    tx.remove();
                }
            }
        }

        if tx.len() == guard_ops {
            return self.handle_write_object(Ok(()), None);
        }

        let lock_op = {
            let _owner_locker = self.dst.owner_lock.read();
            self.dst.start_lock_op()
        };
        let lock_op = match lock_op {
            Ok(lock_op) => lock_op,
            Err(e) => {
                error!("lost exclusive lock: {}", e);
                return Err(CopyError::LockLost(e));
            }
        };

        let r = self.dst_data.operate(&self.dst_oid, tx, snapc).await;
        self.handle_write_object(r, Some(lock_op))
    }

    /// Resolves the snapshot context a key's transaction is written with:
    /// the older destination snapshots, so the state at the mapped snapshot
    /// is preserved by the next write.
    fn write_snap_context(&self, src_snap_seq: SnapId, write_ops: &[WriteOp]) -> SnapContext {
        if src_snap_seq == 0 {
            return SnapContext::default();
        }

        let dst_snap_ids = self
            .snap_map
            .get(src_snap_seq)
            .unwrap_or_else(|| panic!("source snapshot {} missing from snap map", src_snap_seq));
        let dst_snap_id = dst_snap_ids[0];
        if !dst_may_exist(&self.dst_object_may_exist, dst_snap_id) && !write_ops.is_empty() {
            debug!("object DNE: src_snap_seq={}", src_snap_seq);
            assert!(
                matches!(write_ops, [WriteOp::Remove]),
                "object cannot exist at snap {} but has ops {:?}",
                dst_snap_id,
                write_ops.iter().map(WriteOp::kind).collect::<Vec<_>>()
            );
        }

        let snaps = dst_snap_ids[1..].to_vec();
        let seq = snaps.first().copied().unwrap_or(0);
        assert_ne!(seq, SNAP_HEAD, "write snapshot context cannot be HEAD");
        SnapContext::new(seq, snaps)
    }

    fn handle_write_object(&self, r: StorageResult<()>, lock_op: Option<LockOpGuard>) -> CopyResult {
        trace!(r = ?r.as_ref().err().map(StorageError::result_code), "write object");

        let r = match r {
            Err(e) if e.code == ErrorCode::NotFound => Ok(()),
            Err(e) if e.code == ErrorCode::OutOfRange => {
                debug!("concurrent deep copy");
                Ok(())
            }
            r => r,
        };
        let result = r.map_err(|e| {
            error!("failed to write to destination object: {}", e);
            CopyError::Write(e)
        });

        drop(lock_op);
        result
    }

    async fn send_update_object_map(&mut self) -> CopyResult {
        if !self.dst.features.object_map || self.plan.dst_object_state.is_empty() {
            return Ok(());
        }

        loop {
            let (dst_snap_id, update, lock_op) = {
                let _owner_locker = self.dst.owner_lock.read();
                let image_state = self.dst.image_lock.read();
                let Some(object_map) = image_state.object_map.as_ref() else {
                    // the exclusive lock may have been lost in the background
                    error!("object map is not initialized");
                    return Err(CopyError::ObjectMapUnavailable);
                };

                let Some((src_snap_seq, object_state)) = self.plan.dst_object_state.pop_front() else {
                    break;
                };
                let dst_snap_id = dst_snap_id(&self.snap_map, src_snap_seq);
                trace!("dst_snap_id={}, object_state={:?}", dst_snap_id, object_state);

                let lock_op = match self.dst.start_lock_op() {
                    Ok(lock_op) => lock_op,
                    Err(e) => {
                        error!("lost exclusive lock: {}", e);
                        return Err(CopyError::LockLost(e));
                    }
                };

                let update = object_map.aio_update(dst_snap_id, self.dst_object_number, object_state, None);
                (dst_snap_id, update, lock_op)
            };

            let r = match update {
                Some(update) => update.await,
                None => {
                    assert_eq!(dst_snap_id, SNAP_HEAD, "only HEAD updates complete synchronously");
                    Ok(())
                }
            };
            drop(lock_op);

            if let Err(e) = r {
                error!("failed to update object map: {}", e);
                return Err(CopyError::ObjectMapUpdate(e));
            }
        }

        Ok(())
    }

    /// Releases the request, then reports the result.
    fn finish(mut self, result: CopyResult) {
        debug!(
            r = result_code(&result),
            dst_snap_id_start = self.dst_snap_id_start,
            "finish"
        );
        let on_finish = self.on_finish.take();
        drop(self);
        if let Some(on_finish) = on_finish {
            on_finish(result);
        }
    }
}

fn check_read_result(result: crate::models::ReadResult) -> StorageResult<crate::models::ReadResult> {
    let mapped: u64 = result.extent_map.iter().map(|e| e.length).sum();
    if mapped != result.data.len() as u64 {
        return Err(StorageError::with_message(
            ErrorCode::Io,
            format!("read returned {} bytes for {} mapped bytes", result.data.len(), mapped),
        ));
    }
    Ok(result)
}

/// Runs one object copy to completion and returns its result.
#[allow(clippy::too_many_arguments)]
pub async fn copy_object(
    src: Arc<ImageCtx>,
    dst: Arc<ImageCtx>,
    src_snap_id_start: SnapId,
    dst_snap_id_start: SnapId,
    snap_map: SnapMap,
    dst_object_number: u64,
    flatten: bool,
    handler: Option<Arc<dyn ProgressHandler>>,
) -> CopyResult {
    let (tx, rx) = oneshot::channel();
    let request = ObjectCopyRequest::new(
        src,
        dst,
        src_snap_id_start,
        dst_snap_id_start,
        snap_map,
        dst_object_number,
        flatten,
        handler,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let task = request.send();
    match rx.await {
        Ok(result) => result,
        Err(_) => match task.await {
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            _ => Err(CopyError::Aborted),
        },
    }
}
