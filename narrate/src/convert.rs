//! Conversion driver: chapters in, one growing WAV file out.
//!
//! Chunks are processed strictly in order. After every chunk whose audio reached
//! the output file, a checkpoint naming the next chunk is written, so a run can be
//! stopped at any point and picked up again where it left off.

use crate::audio::{self, DEFAULT_LEVEL_DB};
use crate::checkpoint::{self, Checkpoint, checkpoint_path_for, fingerprint};
use crate::epub::Chapter;
use crate::error::ConvertError;
use crate::selection::{ChapterSelector, SelectionError};
use crate::text::chunker::{DEFAULT_MAX_CHUNK_WORDS, chunk_chapter};
use crate::tts::{DEFAULT_VOICE, EngineError, TtsBackend};
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SPINNER_TICK: Duration = Duration::from_millis(100);

/// Settings for a single conversion run.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Output WAV file; the checkpoint lives next to it
    pub output_path: PathBuf,
    /// Voice passed to the engine for every chunk
    pub voice: String,
    /// Word limit per chunk
    pub max_chunk_words: usize,
    /// Target loudness of each chunk in dB
    pub level_db: f32,
    /// Ask for a chapter selection even when one was saved
    pub reselect: bool,
    /// Abort the run when a checkpoint cannot be saved
    pub strict_checkpoints: bool,
}

impl ConvertOptions {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            voice: DEFAULT_VOICE.to_string(),
            max_chunk_words: DEFAULT_MAX_CHUNK_WORDS,
            level_db: DEFAULT_LEVEL_DB,
            reselect: false,
            strict_checkpoints: false,
        }
    }
}

/// Cooperative stop request, checked before each chunk.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every chunk was attempted; the checkpoint is gone
    Completed,
    /// Stopped early; the checkpoint names the next chunk
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Position in the selected chapter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub chapter_index: usize,
    pub chunk_index: usize,
}

/// A chunk the engine could not synthesize.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub chapter_index: usize,
    pub chunk_index: usize,
    pub chapter_title: String,
    pub error: EngineError,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionReport {
    pub outcome: RunOutcome,
    /// Chunks whose audio reached the output file
    pub processed: usize,
    /// Chunks handed to the engine
    pub attempted: usize,
    pub failures: Vec<ChunkFailure>,
    /// Checkpoint writes that failed and were skipped
    pub checkpoint_failures: usize,
    pub resumed_from: Option<ResumePoint>,
    /// Selected chapter indices, ascending
    pub selected_chapters: Vec<usize>,
    pub output_path: PathBuf,
    /// Samples in the output file at the end of the run
    pub total_samples: usize,
}

impl ConversionReport {
    /// One-line summary for the end of a run.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Conversion {}: {}/{} chunks processed into {} ({} samples)",
            self.outcome,
            self.processed,
            self.attempted,
            self.output_path.display(),
            self.total_samples
        );
        if let Some(point) = self.resumed_from {
            summary.push_str(&format!(
                ", resumed at chapter {} chunk {}",
                point.chapter_index + 1,
                point.chunk_index + 1
            ));
        }
        if !self.failures.is_empty() {
            summary.push_str(&format!(", {} failed", self.failures.len()));
        }
        if self.checkpoint_failures > 0 {
            summary.push_str(&format!(
                ", {} checkpoint write(s) failed",
                self.checkpoint_failures
            ));
        }
        summary
    }
}

/// Drives a conversion run over a book's chapters.
pub struct Converter<'a> {
    engine: &'a dyn TtsBackend,
    selector: &'a mut dyn ChapterSelector,
    options: ConvertOptions,
    cancellation: Cancellation,
    progress: ProgressBar,
}

impl<'a> Converter<'a> {
    pub fn new(
        engine: &'a dyn TtsBackend,
        selector: &'a mut dyn ChapterSelector,
        options: ConvertOptions,
    ) -> Self {
        Self {
            engine,
            selector,
            options,
            cancellation: Cancellation::new(),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Report per-chunk progress on `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Convert the selected chapters, resuming from the checkpoint when possible.
    pub async fn run(&mut self, chapters: &[Chapter]) -> Result<ConversionReport, ConvertError> {
        if chapters.is_empty() {
            return Err(ConvertError::NoChapters);
        }

        let checkpoint_path = checkpoint_path_for(&self.options.output_path);
        let mut checkpoint_failures = 0;

        let (selected, checkpoint) =
            self.resolve_selection(chapters, &checkpoint_path, &mut checkpoint_failures)?;
        let selected_chapters: Vec<&Chapter> = selected.iter().map(|&i| &chapters[i]).collect();

        let resumed_from = checkpoint
            .as_ref()
            .and_then(|checkpoint| self.resume_point(checkpoint, &selected_chapters));

        match resumed_from {
            Some(point) => info!(
                "Resuming from chapter {}, chunk {} ('{}')",
                point.chapter_index + 1,
                point.chunk_index + 1,
                selected_chapters[point.chapter_index].title
            ),
            None => info!(
                "Starting fresh conversion to {}",
                self.options.output_path.display()
            ),
        }

        let mut report = ConversionReport {
            outcome: RunOutcome::Completed,
            processed: 0,
            attempted: 0,
            failures: Vec::new(),
            checkpoint_failures,
            resumed_from,
            selected_chapters: selected.clone(),
            output_path: self.options.output_path.clone(),
            total_samples: 0,
        };

        self.progress.enable_steady_tick(SPINNER_TICK);

        // A fresh run replaces whatever audio is in the file, on its first success
        let mut recreate_output = resumed_from.is_none();
        let mut appended_samples = None;
        let start = resumed_from.unwrap_or(ResumePoint {
            chapter_index: 0,
            chunk_index: 0,
        });

        'chapters: for (position, chapter) in selected_chapters
            .iter()
            .enumerate()
            .skip(start.chapter_index)
        {
            let chunks = chunk_chapter(position, &chapter.text, self.options.max_chunk_words);
            let total = chunks.len();
            let first = if position == start.chapter_index {
                start.chunk_index
            } else {
                0
            };

            info!(
                "Processing: {} ({} chunks, max {} words per chunk)",
                chapter.title, total, self.options.max_chunk_words
            );
            if first > 0 {
                info!("Skipping first {} chunks of '{}'", first, chapter.title);
            }

            let mut chapter_processed = 0;
            for chunk in chunks.iter().skip(first) {
                if self.cancellation.is_cancelled() {
                    break 'chapters;
                }

                self.progress.set_message(format!(
                    "{}: chunk {}/{}",
                    chapter.title,
                    chunk.chunk_index + 1,
                    total
                ));
                report.attempted += 1;
                debug!(
                    "Synthesizing chunk {}/{} ({} words)",
                    chunk.chunk_index + 1,
                    total,
                    chunk.words()
                );

                let result = self.engine.synthesize(&chunk.text, &self.options.voice).await;
                let synthesis = match result {
                    Ok(synthesis) => synthesis,
                    Err(e) => {
                        error!(
                            "Chunk {}/{} of '{}' failed: {}",
                            chunk.chunk_index + 1,
                            total,
                            chapter.title,
                            e
                        );
                        report.failures.push(ChunkFailure {
                            chapter_index: chunk.chapter_index,
                            chunk_index: chunk.chunk_index,
                            chapter_title: chapter.title.clone(),
                            error: e,
                        });
                        continue;
                    }
                };

                let samples = audio::normalize(&synthesis.samples, self.options.level_db);
                let stats = audio::append_samples(
                    &self.options.output_path,
                    &samples,
                    synthesis.sample_rate,
                    recreate_output,
                )?;
                debug!(
                    "{} {} samples at {} Hz, {} total",
                    if stats.created { "Wrote" } else { "Appended" },
                    stats.appended,
                    stats.sample_rate,
                    stats.total_samples
                );
                recreate_output = false;
                appended_samples = Some(stats.total_samples);
                report.processed += 1;
                chapter_processed += 1;

                let next = Checkpoint::new(position, chunk.chunk_index + 1, total, &selected)
                    .with_validation(self.options.max_chunk_words, &chapter.text);
                self.save_checkpoint(&checkpoint_path, &next, &mut report.checkpoint_failures)?;
            }

            info!(
                "Completed {}: {}/{} chunks processed",
                chapter.title,
                chapter_processed,
                total - first.min(total)
            );
        }

        self.progress.finish_and_clear();

        if self.cancellation.is_cancelled() {
            report.outcome = RunOutcome::Cancelled;
            info!("Stopped; progress kept in {}", checkpoint_path.display());
        } else if let Err(e) = checkpoint::clear(&checkpoint_path) {
            warn!("Failed to remove checkpoint: {}", e);
        }

        report.total_samples = match appended_samples {
            Some(total) => total,
            None => self.existing_sample_count(),
        };

        Ok(report)
    }

    /// Pick the chapters to convert, returning the selection and the checkpoint to
    /// resume from.
    fn resolve_selection(
        &mut self,
        chapters: &[Chapter],
        checkpoint_path: &std::path::Path,
        checkpoint_failures: &mut usize,
    ) -> Result<(Vec<usize>, Option<Checkpoint>), ConvertError> {
        let existing = checkpoint::load(checkpoint_path);

        let stored = existing
            .as_ref()
            .map(|checkpoint| checkpoint.selected_chapters.clone())
            .filter(|stored| !stored.is_empty());
        let stored_valid = stored
            .as_ref()
            .filter(|stored| stored.iter().all(|&i| i < chapters.len()));

        if let Some(stored) = stored_valid {
            if !self.options.reselect {
                info!(
                    "Using previous chapter selection: {} chapters selected",
                    stored.len()
                );
                return Ok((stored.clone(), existing));
            }
        } else if stored.is_some() {
            warn!("Previous chapter selection refers to chapters that no longer exist");
        }

        let previous = existing
            .as_ref()
            .map(|checkpoint| checkpoint.selected_chapters.as_slice());
        let mut selected = self.selector.select(chapters, previous)?;
        selected.sort_unstable();
        selected.dedup();

        if selected.is_empty() {
            return Err(SelectionError::NothingSelected.into());
        }
        if let Some(&bad) = selected.iter().find(|&&i| i >= chapters.len()) {
            return Err(SelectionError::Invalid(format!(
                "chapter {} does not exist ({} chapters)",
                bad,
                chapters.len()
            ))
            .into());
        }

        if stored_valid == Some(&selected) {
            debug!("Selection unchanged, keeping resume position");
            return Ok((selected, existing));
        }

        let checkpoint = Checkpoint::selection_only(&selected);
        self.save_checkpoint(checkpoint_path, &checkpoint, checkpoint_failures)?;
        info!("Chapter selection saved ({} chapters)", selected.len());

        Ok((selected, Some(checkpoint)))
    }

    /// The position to resume from, if the checkpoint still matches the book.
    fn resume_point(
        &self,
        checkpoint: &Checkpoint,
        selected_chapters: &[&Chapter],
    ) -> Option<ResumePoint> {
        if !checkpoint.has_position() {
            return None;
        }

        let Some(chapter) = selected_chapters.get(checkpoint.chapter_index) else {
            warn!(
                "Checkpoint chapter {} is outside the selection, starting over",
                checkpoint.chapter_index + 1
            );
            return None;
        };

        if let Some(limit) = checkpoint.max_chunk_words {
            if limit != self.options.max_chunk_words {
                warn!(
                    "Chunk size changed ({} -> {} words), starting over",
                    limit, self.options.max_chunk_words
                );
                return None;
            }
        }

        if let Some(expected) = &checkpoint.chapter_fingerprint {
            if *expected != fingerprint(&chapter.text) {
                warn!("Text of '{}' changed, starting over", chapter.title);
                return None;
            }
        }

        let total = chunk_chapter(
            checkpoint.chapter_index,
            &chapter.text,
            self.options.max_chunk_words,
        )
        .len();
        if total != checkpoint.total_chunks_in_chapter || checkpoint.chunk_index > total {
            warn!(
                "'{}' now has {} chunks, checkpoint expected {}, starting over",
                chapter.title, total, checkpoint.total_chunks_in_chapter
            );
            return None;
        }

        if !self.options.output_path.exists() {
            warn!(
                "Output file {} is missing, starting over",
                self.options.output_path.display()
            );
            return None;
        }

        Some(ResumePoint {
            chapter_index: checkpoint.chapter_index,
            chunk_index: checkpoint.chunk_index,
        })
    }

    fn save_checkpoint(
        &self,
        path: &std::path::Path,
        checkpoint: &Checkpoint,
        failures: &mut usize,
    ) -> Result<(), ConvertError> {
        match checkpoint::save(path, checkpoint) {
            Ok(()) => Ok(()),
            Err(e) if self.options.strict_checkpoints => Err(e.into()),
            Err(e) => {
                warn!("{}; continuing without a checkpoint for this chunk", e);
                *failures += 1;
                Ok(())
            }
        }
    }

    fn existing_sample_count(&self) -> usize {
        if !self.options.output_path.exists() {
            return 0;
        }
        match audio::wav::sample_count(&self.options.output_path) {
            Ok(count) => count,
            Err(e) => {
                debug!("Could not count samples in output: {}", e);
                0
            }
        }
    }
}
