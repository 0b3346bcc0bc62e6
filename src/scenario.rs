//! Scenario replay.
//!
//! A scenario describes the history of one object of a source image: a
//! sequence of steps, each optionally resizing the image, applying object
//! ops and taking a snapshot. Replaying it builds in-memory source and
//! destination images with matching snapshots, deep-copies the object and
//! compares what both images show at every snapshot.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::deep_copy::{copy_object, ProgressCounter, ProgressHandler};
use crate::error::{result_code, ErrorCode, ScenarioError, StorageError, StorageResult};
use crate::models::{
    prune_parent_extents, Layout, ObjectState, ObjectTransaction, SnapContext, SnapId, SnapMap,
    DEFAULT_OBJECT_SIZE, SNAP_HEAD,
};
use crate::storage::{
    write_transaction, DataStore, ExclusiveLock, ImageCtx, ImageCtxBuilder, ImageFeatures,
    MemoryImageStore, MemoryObjectMap, ObjectMap,
};

/// Destination snapshot ids are the source ids shifted by this amount, so
/// reports can tell them apart.
pub const DST_SNAP_ID_OFFSET: SnapId = 100;

fn default_object_size() -> u64 {
    DEFAULT_OBJECT_SIZE
}

fn default_stripe_count() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

/// Object history to replay and copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_object_size")]
    pub object_size: u64,
    /// Defaults to the object size.
    #[serde(default)]
    pub stripe_unit: Option<u64>,
    #[serde(default = "default_stripe_count")]
    pub stripe_count: u64,
    #[serde(default)]
    pub object_number: u64,
    /// Initial image size. Defaults to the end of the object set holding
    /// the object.
    #[serde(default)]
    pub image_size: Option<u64>,
    #[serde(default)]
    pub flatten: bool,
    #[serde(default)]
    pub fast_diff: bool,
    #[serde(default = "default_true")]
    pub object_map: bool,
    #[serde(default)]
    pub migrating: bool,
    #[serde(default)]
    pub parent: Option<ParentImage>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Parent image of a cloned source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParentImage {
    /// Parent image content from offset 0.
    #[serde(with = "serde_base64")]
    pub data: Vec<u8>,
    /// Defaults to the parent size.
    #[serde(default)]
    pub overlap: Option<u64>,
}

/// One point in the object's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Resize the image before applying the ops.
    #[serde(default)]
    pub image_size: Option<u64>,
    #[serde(default)]
    pub ops: Vec<ScenarioOp>,
    /// Take a snapshot after the ops.
    #[serde(default)]
    pub snapshot: bool,
}

/// Object-relative op applied to the source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScenarioOp {
    Write {
        offset: u64,
        #[serde(with = "serde_base64")]
        data: Vec<u8>,
    },
    Zero {
        offset: u64,
        length: u64,
    },
    Truncate {
        offset: u64,
    },
    Remove,
}

mod serde_base64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::de::{Deserialize, Deserializer, Error};
    use serde::Serializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format_args!("invalid base64: {}", e)))
    }

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(data))
    }
}

/// Outcome of a scenario replay.
#[derive(Debug, Clone, Serialize)]
pub struct CopyReport {
    pub dst_oid: String,
    /// Completion code of the object copy.
    pub result_code: i32,
    pub bytes_read: u64,
    pub reads: u64,
    pub snapshots: Vec<SnapshotReport>,
    /// Every snapshot matches.
    pub matches: bool,
}

impl CopyReport {
    /// The copy finished, either by copying or by finding nothing to copy.
    pub fn is_success(&self) -> bool {
        self.result_code == 0 || self.result_code == -ErrorCode::NotFound.errno()
    }
}

/// Source and destination content at one mapped snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub src_snap: String,
    pub dst_snap: String,
    pub src_sha256: String,
    pub dst_sha256: String,
    pub matches: bool,
    /// Destination object-map state, when the object map is enabled.
    pub object_state: Option<ObjectState>,
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_json::from_str(json)?;
        scenario.layout()?;
        Ok(scenario)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Applies command-line overrides.
    pub fn apply_config(&mut self, config: &Config) {
        if config.flatten {
            self.flatten = true;
        }
        if config.fast_diff {
            self.fast_diff = true;
        }
        if config.disable_object_map {
            self.object_map = false;
        }
        if let Some(object_number) = config.object_number {
            self.object_number = object_number;
        }
    }

    pub fn layout(&self) -> Result<Layout, ScenarioError> {
        Layout::with_striping(
            self.object_size,
            self.stripe_unit.unwrap_or(self.object_size),
            self.stripe_count,
        )
        .map_err(|e| ScenarioError::Invalid(e.message))
    }

    fn initial_image_size(&self, layout: &Layout) -> u64 {
        self.image_size.unwrap_or_else(|| {
            let object_set = self.object_number / layout.stripe_count + 1;
            object_set * layout.object_size * layout.stripe_count
        })
    }

    /// Replays the history, copies the object and compares the images.
    pub async fn run(&self) -> Result<CopyReport, ScenarioError> {
        let mut replay = Replay::new(self).await?;
        for (index, step) in self.steps.iter().enumerate() {
            replay
                .apply_step(step)
                .await
                .map_err(|source| ScenarioError::Step { step: index, source })?;
        }
        info!(
            snapshots = replay.src_snaps.len(),
            object_number = self.object_number,
            "replayed source history"
        );
        replay.copy(self.flatten).await
    }
}

/// In-memory source and destination images of a scenario.
struct Replay {
    layout: Layout,
    object_number: u64,
    src_store: Arc<MemoryImageStore>,
    src: Arc<ImageCtx>,
    dst_store: Arc<MemoryImageStore>,
    dst: Arc<ImageCtx>,
    object_map: Option<MemoryObjectMap>,
    src_snaps: Vec<SnapId>,
}

impl Replay {
    async fn new(scenario: &Scenario) -> Result<Self, ScenarioError> {
        let layout = scenario.layout()?;
        let size = scenario.initial_image_size(&layout);

        let parent = match &scenario.parent {
            Some(parent) => Some(
                Self::build_parent(layout, parent, size)
                    .await
                    .map_err(|e| ScenarioError::Invalid(format!("failed to build parent: {}", e)))?,
            ),
            None => None,
        };

        let mut src_store = MemoryImageStore::new(layout, "rbd_data.src");
        let mut dst_store = MemoryImageStore::new(layout, "rbd_data.dst");
        if let Some((parent_store, overlap)) = &parent {
            src_store = src_store.with_parent(parent_store.clone(), SNAP_HEAD, *overlap);
            if !scenario.flatten {
                dst_store = dst_store.with_parent(parent_store.clone(), SNAP_HEAD, *overlap);
            }
        }
        src_store.set_image_size(size);
        dst_store.set_image_size(size);
        let src_store = Arc::new(src_store);
        let dst_store = Arc::new(dst_store);

        let mut src = ImageCtxBuilder::new("src")
            .layout(layout)
            .size(size)
            .data_ctx(src_store.clone());
        if let Some((_, overlap)) = &parent {
            src = src.parent_overlap(*overlap);
        }

        let object_map = scenario.object_map.then(MemoryObjectMap::new);
        let mut dst = ImageCtxBuilder::new("dst")
            .layout(layout)
            .size(size)
            .features(ImageFeatures {
                object_map: scenario.object_map,
                fast_diff: scenario.fast_diff,
            })
            .migrating(scenario.migrating)
            .data_ctx(dst_store.clone())
            .exclusive_lock(ExclusiveLock::new_locked());
        if let Some(object_map) = &object_map {
            dst = dst.object_map(Arc::new(object_map.clone()));
        }
        if let (Some((_, overlap)), false) = (&parent, scenario.flatten) {
            dst = dst.parent_overlap(*overlap);
        }

        Ok(Self {
            layout,
            object_number: scenario.object_number,
            src_store,
            src: Arc::new(src.build()),
            dst_store,
            dst: Arc::new(dst.build()),
            object_map,
            src_snaps: Vec::new(),
        })
    }

    /// Builds the parent store and returns it with the effective overlap.
    async fn build_parent(
        layout: Layout,
        parent: &ParentImage,
        size: u64,
    ) -> StorageResult<(Arc<MemoryImageStore>, u64)> {
        let store = MemoryImageStore::new(layout, "rbd_data.parent");
        let parent_size = parent.data.len() as u64;
        store.set_image_size(parent_size);
        for extent in layout.file_to_extents(0, parent_size, 0) {
            let start = extent.buffer_offset as usize;
            let end = start + extent.length as usize;
            let tx = write_transaction(extent.offset, parent.data[start..end].to_vec());
            store
                .operate(&store.object_name(extent.object_no), tx, SnapContext::default())
                .await?;
        }
        let overlap = parent.overlap.unwrap_or(parent_size).min(parent_size).min(size);
        Ok((Arc::new(store), overlap))
    }

    async fn apply_step(&mut self, step: &Step) -> StorageResult<()> {
        if let Some(size) = step.image_size {
            self.resize(size).await?;
        }
        if !step.ops.is_empty() && self.object_number >= self.src.get_object_count(SNAP_HEAD) {
            return Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                format!("object {} is beyond the end of the image", self.object_number),
            ));
        }
        for op in &step.ops {
            self.apply_op(op).await?;
        }
        if step.snapshot {
            self.snap_create()?;
        }
        Ok(())
    }

    async fn apply_op(&self, op: &ScenarioOp) -> StorageResult<()> {
        let object_size = self.layout.object_size;
        let check = |offset: u64, length: u64| match offset.checked_add(length) {
            Some(end) if end <= object_size => Ok(()),
            _ => Err(StorageError::with_message(
                ErrorCode::InvalidArgument,
                format!("{:?} extends past the object size {}", op, object_size),
            )),
        };

        let mut tx = ObjectTransaction::new();
        match op {
            ScenarioOp::Write { offset, data } => {
                check(*offset, data.len() as u64)?;
                tx = write_transaction(*offset, data.clone());
            }
            ScenarioOp::Zero { offset, length } => {
                check(*offset, *length)?;
                tx.zero(*offset, *length);
            }
            ScenarioOp::Truncate { offset } => {
                check(*offset, 0)?;
                tx.truncate(*offset);
            }
            // a clone keeps an empty object to mask the parent
            ScenarioOp::Remove if self.masks_parent() => tx.truncate(0),
            ScenarioOp::Remove => tx.remove(),
        }

        debug!(?op, "apply op");
        match self.src.operate(self.object_number, tx).await {
            Err(e) if e.code == ErrorCode::NotFound && matches!(op, ScenarioOp::Remove) => Ok(()),
            r => r,
        }
    }

    /// The live image still shows parent data through the object.
    fn masks_parent(&self) -> bool {
        let overlap = self.src.get_parent_overlap(SNAP_HEAD).unwrap_or(0);
        let mut extents = self
            .layout
            .extent_to_file(self.object_number, 0, self.layout.object_size);
        overlap > 0 && prune_parent_extents(&mut extents, overlap) > 0
    }

    async fn resize(&mut self, size: u64) -> StorageResult<()> {
        let old_size = self.src.get_image_size(SNAP_HEAD);
        debug!(old_size, size, "resize");

        self.src.resize(size);
        self.src_store.set_image_size(size);
        self.dst.resize(size);
        self.dst_store.set_image_size(size);

        if size < old_size {
            self.trim_object(size).await?;
        }
        Ok(())
    }

    /// Shrinks or removes the object to fit an image of `size` bytes.
    async fn trim_object(&self, size: u64) -> StorageResult<()> {
        let oid = self.src.get_object_name(self.object_number);
        let current = match self.src_store.stat(&oid).await {
            Ok(current) => current,
            Err(e) if e.code == ErrorCode::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut extents = self
            .layout
            .extent_to_file(self.object_number, 0, self.layout.object_size);
        let keep = prune_parent_extents(&mut extents, size);

        let mut tx = ObjectTransaction::new();
        if keep == 0 {
            tx.remove();
        } else if current > keep {
            tx.truncate(keep);
        } else {
            return Ok(());
        }
        self.src.operate(self.object_number, tx).await
    }

    fn snap_create(&mut self) -> StorageResult<()> {
        let src_snap_id = self.src_snaps.len() as SnapId + 1;
        let dst_snap_id = src_snap_id + DST_SNAP_ID_OFFSET;

        self.src.snap_create(src_snap_id)?;
        self.src_store.snap_create(src_snap_id);
        self.dst.snap_create(dst_snap_id)?;
        self.dst_store.snap_create(dst_snap_id);
        self.src_snaps.push(src_snap_id);
        Ok(())
    }

    /// Maps every source snapshot, and the head, onto its destination
    /// snapshot context.
    fn snap_map(&self) -> StorageResult<SnapMap> {
        let mut entries = BTreeMap::new();
        let mut older: Vec<SnapId> = Vec::new();
        for &src_snap_id in &self.src_snaps {
            let dst_snap_id = src_snap_id + DST_SNAP_ID_OFFSET;
            let mut dst_snap_ids = vec![dst_snap_id];
            dst_snap_ids.extend(&older);
            entries.insert(src_snap_id, dst_snap_ids);
            older.insert(0, dst_snap_id);
        }
        let mut head = vec![SNAP_HEAD];
        head.extend(older);
        entries.insert(SNAP_HEAD, head);
        SnapMap::new(entries)
    }

    async fn copy(&self, flatten: bool) -> Result<CopyReport, ScenarioError> {
        let snap_map = self.snap_map().map_err(|e| ScenarioError::Invalid(e.message))?;
        let counter = Arc::new(ProgressCounter::new());
        let handler: Arc<dyn ProgressHandler> = counter.clone();

        let result = copy_object(
            self.src.clone(),
            self.dst.clone(),
            0,
            0,
            snap_map,
            self.object_number,
            flatten,
            Some(handler),
        )
        .await;
        let result_code = result_code(&result);
        info!(result_code, bytes_read = counter.bytes_read(), "object copy finished");

        let pairs = self
            .src_snaps
            .iter()
            .map(|&snap_id| (snap_id, snap_id + DST_SNAP_ID_OFFSET))
            .chain(std::iter::once((SNAP_HEAD, SNAP_HEAD)));
        let snapshots: Vec<SnapshotReport> = pairs
            .map(|(src_snap_id, dst_snap_id)| self.compare(src_snap_id, dst_snap_id))
            .collect();

        Ok(CopyReport {
            dst_oid: self.dst.get_object_name(self.object_number),
            result_code,
            bytes_read: counter.bytes_read(),
            reads: counter.reads(),
            matches: snapshots.iter().all(|s| s.matches),
            snapshots,
        })
    }

    fn compare(&self, src_snap_id: SnapId, dst_snap_id: SnapId) -> SnapshotReport {
        let src_sha256 = sha256_hex(&self.src_store.read_object_visible(self.object_number, src_snap_id));
        let dst_sha256 = sha256_hex(&self.dst_store.read_object_visible(self.object_number, dst_snap_id));
        SnapshotReport {
            src_snap: snap_label(src_snap_id),
            dst_snap: snap_label(dst_snap_id),
            matches: src_sha256 == dst_sha256,
            src_sha256,
            dst_sha256,
            object_state: self
                .object_map
                .as_ref()
                .map(|object_map| object_map.object_state(dst_snap_id, self.object_number)),
        }
    }
}

fn snap_label(snap_id: SnapId) -> String {
    if snap_id == SNAP_HEAD {
        "head".to_string()
    } else {
        snap_id.to_string()
    }
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
