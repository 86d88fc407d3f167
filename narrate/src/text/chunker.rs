//! Word-bounded text chunking for TTS processing.
//!
//! Sentences are never split: a sentence longer than the word limit becomes a
//! chunk of its own, so the limit is a target rather than a hard cap.

use super::TextChunk;

/// Default maximum number of words per chunk.
pub const DEFAULT_MAX_CHUNK_WORDS: usize = 500;

/// Character that terminates a sentence.
const SENTENCE_TERMINATOR: char = '.';

/// Segments with fewer words than this are treated as fragments and dropped.
///
/// This filters abbreviation artifacts ("Mr.", "e.g.") but also drops genuinely
/// short sentences. Text without any terminator is kept whole only when it has at
/// least this many words.
const MIN_SENTENCE_WORDS: usize = 3;

/// Count whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Extract sentences from text.
///
/// Newlines are flattened to spaces, the text is split on periods, each part is
/// trimmed and the period re-appended. Parts with fewer than three words are dropped.
pub fn extract_sentences(text: &str) -> Vec<String> {
    let flattened = text.replace(['\r', '\n'], " ");

    flattened
        .split(SENTENCE_TERMINATOR)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| format!("{}{}", part, SENTENCE_TERMINATOR))
        .filter(|sentence| word_count(sentence) >= MIN_SENTENCE_WORDS)
        .collect()
}

/// Split text into chunks of whole sentences.
///
/// # Arguments
/// * `text` - The text to chunk
/// * `max_words` - Maximum words per chunk (values below 1 are treated as 1)
///
/// # Returns
/// Chunks in reading order. Every chunk holds at most `max_words` words unless it
/// consists of a single sentence that is longer on its own.
pub fn chunk_text(text: &str, max_words: usize) -> Vec<String> {
    let max_words = max_words.max(1);

    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_words = 0;

    for sentence in extract_sentences(text) {
        let sentence_words = word_count(&sentence);

        // Oversized sentence: flush and emit it whole
        if sentence_words > max_words {
            if !current.is_empty() {
                chunks.push(current.join(" "));
                current.clear();
                current_words = 0;
            }
            chunks.push(sentence);
            continue;
        }

        if current_words + sentence_words > max_words && !current.is_empty() {
            chunks.push(current.join(" "));
            current.clear();
            current_words = 0;
        }

        current.push(sentence);
        current_words += sentence_words;
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

/// Process a chapter's text into TTS-ready chunks.
///
/// # Arguments
/// * `chapter_index` - Position of the chapter in the selected chapter list
/// * `text` - The chapter text
/// * `max_words` - Maximum words per chunk
pub fn chunk_chapter(chapter_index: usize, text: &str, max_words: usize) -> Vec<TextChunk> {
    chunk_text(text, max_words)
        .into_iter()
        .enumerate()
        .map(|(chunk_index, text)| TextChunk::new(chapter_index, chunk_index, text))
        .collect()
}
