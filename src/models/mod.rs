//! Data models shared by the storage layer and the copy engine.

mod layout;
mod object;
mod snapshot;

pub use layout::*;
pub use object::*;
pub use snapshot::*;
