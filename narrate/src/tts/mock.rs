//! Mock TTS backend for testing
//!
//! Produces deterministic audio and can simulate failing chunks and an
//! interruption partway through a run.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{EngineError, Synthesis, TtsBackend};
use crate::convert::Cancellation;

/// Sample rate of the mock audio
pub const MOCK_SAMPLE_RATE: u32 = 24_000;

/// Samples produced per word of input text
pub const SAMPLES_PER_WORD: usize = 10;

/// A mock backend whose output length depends only on the input text
pub struct MockBackend {
    /// Current call count
    call_count: AtomicUsize,
    /// Texts passed to synthesize(), in call order
    calls: Mutex<Vec<String>>,
    /// Fail any chunk containing this marker
    fail_on: Option<String>,
    /// Cancel `cancellation` once this many calls have been made
    cancel_after: Option<(usize, Cancellation)>,
    /// Sample rate of the produced audio
    sample_rate: u32,
}

impl MockBackend {
    /// Create a backend that always succeeds
    pub fn new() -> Self {
        Self {
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            fail_on: None,
            cancel_after: None,
            sample_rate: MOCK_SAMPLE_RATE,
        }
    }

    /// Fail every chunk whose text contains `marker`
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_on = Some(marker.to_string());
        self
    }

    /// Request cancellation after `n` calls have completed
    pub fn cancelling_after(mut self, n: usize, cancellation: Cancellation) -> Self {
        self.cancel_after = Some((n, cancellation));
        self
    }

    /// Produce audio at a different sample rate
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Get the number of times synthesize() was called
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Texts seen so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of samples produced for `text`
    pub fn samples_for(text: &str) -> usize {
        text.split_whitespace().count() * SAMPLES_PER_WORD
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsBackend for MockBackend {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Synthesis, EngineError> {
        let call_num = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().unwrap().push(text.to_string());

        if let Some((n, cancellation)) = &self.cancel_after {
            if call_num >= *n {
                cancellation.cancel();
            }
        }

        if let Some(marker) = &self.fail_on {
            if text.contains(marker.as_str()) {
                return Err(EngineError::Synthesis(format!("mock failure on '{}'", marker)));
            }
        }

        // Alternating square wave, quiet enough to survive normalization unclipped
        let samples = (0..Self::samples_for(text))
            .map(|i| if i % 2 == 0 { 0.05 } else { -0.05 })
            .collect();

        Ok(Synthesis {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_length_follows_words() {
        let backend = MockBackend::new();
        let result = backend.synthesize("one two three", "voice").await.unwrap();
        assert_eq!(result.samples.len(), 3 * SAMPLES_PER_WORD);
        assert_eq!(result.sample_rate, MOCK_SAMPLE_RATE);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(backend.calls(), vec!["one two three".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_on_marker() {
        let backend = MockBackend::new().failing_on("BOOM");
        assert!(backend.synthesize("fine text", "v").await.is_ok());
        let err = backend.synthesize("this goes BOOM", "v").await.unwrap_err();
        assert!(matches!(err, EngineError::Synthesis(_)));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelling_after() {
        let cancellation = Cancellation::new();
        let backend = MockBackend::new().cancelling_after(2, cancellation.clone());

        backend.synthesize("a b c", "v").await.unwrap();
        assert!(!cancellation.is_cancelled());
        backend.synthesize("a b c", "v").await.unwrap();
        assert!(cancellation.is_cancelled());
    }
}
