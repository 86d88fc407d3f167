//! Audio handling: loudness normalization and the incrementally grown WAV output.

pub mod normalize;
pub mod wav;

pub use normalize::{DEFAULT_LEVEL_DB, normalize};
pub use wav::append_samples;

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing the output audio file.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} would hold {samples} samples, more than the WAV limit of {max}")]
    TooLong {
        path: PathBuf,
        samples: usize,
        max: usize,
    },

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}
