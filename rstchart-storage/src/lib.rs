//! # rstchart-storage
//!
//! Checkpoint storage for rstchart.
//!
//! Checkpoints are stored as one JSON file each, next to an `index.json`
//! that maps sessions to their checkpoints and records a CRC32C per file.

pub mod error;
pub mod store;

pub use error::StorageError;
pub use store::{CheckpointMeta, CheckpointPolicy, CheckpointStore};
