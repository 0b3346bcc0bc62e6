//! Image storage collaborators: data namespace, object map, locks.

mod data;
mod image;
mod lock;
mod object_map;

pub use data::*;
pub use image::*;
pub use lock::*;
pub use object_map::*;
