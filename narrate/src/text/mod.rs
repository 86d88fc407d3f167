//! Text processing for TTS: sentence extraction and word-bounded chunking.

pub mod chunker;

pub use chunker::word_count;

/// A chunk of text ready for TTS processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position of the chapter within the selected chapter list
    pub chapter_index: usize,
    /// The chunk index within the chapter
    pub chunk_index: usize,
    /// The text content
    pub text: String,
}

impl TextChunk {
    /// Create a new text chunk.
    pub fn new(chapter_index: usize, chunk_index: usize, text: String) -> Self {
        Self {
            chapter_index,
            chunk_index,
            text,
        }
    }

    /// Number of whitespace-separated words in the chunk.
    pub fn words(&self) -> usize {
        word_count(&self.text)
    }
}
