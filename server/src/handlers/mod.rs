//! Request handlers for sync operations.

mod all;
mod items;

pub use all::*;
pub use items::*;
