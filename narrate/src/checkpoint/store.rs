//! Checkpoint persistence: saving, loading and clearing the progress file.

use super::types::Checkpoint;
use log::{debug, warn};
use std::ffi::OsString;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors raised while persisting a checkpoint.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Progress file path for an output file: `<output>.progress`.
pub fn checkpoint_path_for(output_path: &Path) -> PathBuf {
    let mut path = OsString::from(output_path.as_os_str());
    path.push(".progress");
    PathBuf::from(path)
}

/// Write `checkpoint` to `path`, replacing any previous checkpoint.
///
/// The record is written to a temporary sibling and renamed into place, so a
/// reader sees either the old or the new checkpoint, never a partial one.
pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(dir).map_err(io_err)?;

    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, checkpoint)?;
        writer.flush().map_err(io_err)?;
    }
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;

    debug!(
        "Checkpoint saved: chapter {}, chunk {}/{}",
        checkpoint.chapter_index, checkpoint.chunk_index, checkpoint.total_chunks_in_chapter
    );
    Ok(())
}

/// Load the checkpoint at `path`.
///
/// A missing, unreadable or corrupt file yields `None`: the run starts over
/// instead of failing.
pub fn load(path: &Path) -> Option<Checkpoint> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Ignoring unreadable checkpoint {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!("Ignoring corrupt checkpoint {}: {}", path.display(), e);
            None
        }
    }
}

/// Remove the checkpoint at `path`. A missing file is not an error.
pub fn clear(path: &Path) -> Result<(), CheckpointError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
