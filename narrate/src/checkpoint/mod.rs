//! Checkpoint store for resumable conversions.
//!
//! A checkpoint names the next chunk to process, never the last one completed.

mod store;
mod types;

pub use store::{CheckpointError, checkpoint_path_for, clear, load, save};
pub use types::{Checkpoint, fingerprint};
