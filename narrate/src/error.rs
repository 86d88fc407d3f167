//! Errors that end a conversion run.

use crate::audio::AudioError;
use crate::checkpoint::CheckpointError;
use crate::selection::SelectionError;
use thiserror::Error;

/// A conversion run failure.
///
/// Engine errors only fail the chunk being processed and never end the run.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("No chapters to convert")]
    NoChapters,

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Audio output error: {0}")]
    Audio(#[from] AudioError),
}

impl ConvertError {
    /// Whether the run ended because the user backed out.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConvertError::Selection(SelectionError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_cancel_is_cancelled() {
        let err = ConvertError::from(SelectionError::Cancelled);
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Chapter selection cancelled");
        assert!(!ConvertError::NoChapters.is_cancelled());
    }

    #[test]
    fn test_audio_error_message() {
        let err = ConvertError::from(AudioError::InvalidSampleRate(0));
        assert!(err.to_string().starts_with("Audio output error"));
    }
}
