//! On-disk storage for extents.
//!
//! - `extent`: the per-partition extent table, checksummed writes and
//!   verified reads
//! - `common`: naming and blocking file helpers shared with the space
//!   manager

pub mod common;
pub mod extent;

pub use extent::{ExtentState, ExtentStore};
