//! Checkpoint record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Durable record of the next unit of work and the active chapter selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index into the selected chapter list of the next chunk to process
    pub chapter_index: usize,
    /// Index of the next chunk within that chapter
    pub chunk_index: usize,
    /// Number of chunks the chapter had when the checkpoint was written
    pub total_chunks_in_chapter: usize,
    /// Selected chapter indices (into the full chapter list), ascending
    pub selected_chapters: Vec<usize>,
    /// When the checkpoint was written
    pub saved_at: DateTime<Utc>,
    /// Chunk-size limit in effect when the checkpoint was written
    #[serde(default)]
    pub max_chunk_words: Option<usize>,
    /// Fingerprint of the text of the chapter at `chapter_index`
    #[serde(default)]
    pub chapter_fingerprint: Option<String>,
}

impl Checkpoint {
    /// Create a checkpoint pointing at `(chapter_index, chunk_index)`.
    pub fn new(
        chapter_index: usize,
        chunk_index: usize,
        total_chunks_in_chapter: usize,
        selected_chapters: &[usize],
    ) -> Self {
        let mut selected_chapters = selected_chapters.to_vec();
        selected_chapters.sort_unstable();
        selected_chapters.dedup();

        Self {
            chapter_index,
            chunk_index,
            total_chunks_in_chapter,
            selected_chapters,
            saved_at: Utc::now(),
            max_chunk_words: None,
            chapter_fingerprint: None,
        }
    }

    /// A checkpoint that records only a chapter selection.
    pub fn selection_only(selected_chapters: &[usize]) -> Self {
        Self::new(0, 0, 0, selected_chapters)
    }

    /// Attach the values used to validate the position on resume.
    pub fn with_validation(mut self, max_chunk_words: usize, chapter_text: &str) -> Self {
        self.max_chunk_words = Some(max_chunk_words);
        self.chapter_fingerprint = Some(fingerprint(chapter_text));
        self
    }

    /// Whether at least one chunk has been recorded as processed.
    ///
    /// Chunk checkpoints always point past a completed chunk, so a zero position
    /// can only come from a selection-only record.
    pub fn has_position(&self) -> bool {
        self.chapter_index > 0 || self.chunk_index > 0
    }
}

/// Short SHA256 fingerprint of a chapter's text.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let result = hasher.finalize();

    // First 16 hex characters are plenty to detect edits
    format!("{:x}", result)[..16].to_string()
}
