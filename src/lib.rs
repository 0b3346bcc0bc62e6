//! deepcopy-rs: snapshot-aware deep copy of image objects.
//!
//! Copies one object of a striped, snapshotted image into another image,
//! reproducing its whole snapshot history: the snapshot delta of the source
//! object is turned into one write transaction per destination snapshot and
//! the destination object map is updated to match.
//!
//! # Example
//!
//! ```no_run
//! use deepcopy_rs::Scenario;
//!
//! #[tokio::main]
//! async fn main() {
//!     let scenario = Scenario::load("history.json").unwrap();
//!     let report = scenario.run().await.unwrap();
//!     assert!(report.matches);
//! }
//! ```

pub mod config;
pub mod deep_copy;
pub mod error;
pub mod models;
pub mod scenario;
pub mod storage;

// Re-exports for convenience
pub use config::{Args, Config};
pub use deep_copy::{copy_object, ObjectCopyRequest, ProgressCounter, ProgressHandler};
pub use error::{result_code, CopyError, CopyResult, ErrorCode, ScenarioError, StorageError, StorageResult};
pub use scenario::{CopyReport, Scenario};
pub use storage::{DataStore, ImageCtx, ImageCtxBuilder, MemoryImageStore, MemoryObjectMap, ObjectMap};
