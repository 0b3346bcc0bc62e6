//! Object deep copy engine.

mod compiler;
mod handler;
mod interval;
mod object_copy;
mod planner;
mod queue;

pub use compiler::{CompileContext, WritePlan};
pub use handler::{ProgressCounter, ProgressHandler};
pub use interval::IntervalSet;
pub use object_copy::{copy_object, ObjectCopyRequest, OnFinish};
pub use planner::{compute_dst_object_may_exist, compute_read_ops, DstObjectMayExist, ReadOp};
pub use queue::SnapQueue;
