//! Object existence index.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::trace;

use crate::error::StorageResult;
use crate::models::{ObjectState, SnapId, SNAP_HEAD};

/// Per-snapshot object existence index of an image.
pub trait ObjectMap: Send + Sync {
    /// Requests a state update for one object.
    ///
    /// Returns `None` when the update completed synchronously because the
    /// in-memory HEAD map already holds the requested state. Snapshot maps
    /// always complete asynchronously. When `current_state` is given the
    /// update only applies to objects currently in that state.
    fn aio_update(
        &self,
        snap_id: SnapId,
        object_no: u64,
        new_state: ObjectState,
        current_state: Option<ObjectState>,
    ) -> Option<BoxFuture<'static, StorageResult<()>>>;

    /// Returns the recorded state of an object.
    fn object_state(&self, snap_id: SnapId, object_no: u64) -> ObjectState;
}

/// In-memory object map keyed by (snapshot, object number).
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectMap {
    states: Arc<DashMap<(SnapId, u64), ObjectState>>,
}

impl MemoryObjectMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects with a recorded state in a snapshot.
    pub fn len(&self, snap_id: SnapId) -> usize {
        self.states
            .iter()
            .filter(|entry| entry.key().0 == snap_id)
            .count()
    }
}

impl ObjectMap for MemoryObjectMap {
    fn aio_update(
        &self,
        snap_id: SnapId,
        object_no: u64,
        new_state: ObjectState,
        current_state: Option<ObjectState>,
    ) -> Option<BoxFuture<'static, StorageResult<()>>> {
        let existing = self.object_state(snap_id, object_no);
        if snap_id == SNAP_HEAD && existing == new_state {
            trace!("object map: {} already {}", object_no, new_state.as_str());
            return None;
        }

        let states = self.states.clone();
        Some(
            async move {
                let key = (snap_id, object_no);
                let matches = current_state
                    .map(|expected| states.get(&key).map(|s| *s).unwrap_or_default() == expected)
                    .unwrap_or(true);
                if matches {
                    states.insert(key, new_state);
                }
                Ok(())
            }
            .boxed(),
        )
    }

    fn object_state(&self, snap_id: SnapId, object_no: u64) -> ObjectState {
        self.states
            .get(&(snap_id, object_no))
            .map(|s| *s)
            .unwrap_or_default()
    }
}
