//! Chapter selection: which chapters of a book get converted.

use crate::epub::Chapter;
use std::io::{BufRead, Write};
use thiserror::Error;

/// Reading speed used for duration estimates.
pub const WORDS_PER_MINUTE: usize = 150;

/// Longest title shown in the chapter table.
const MAX_TITLE_CHARS: usize = 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No chapters selected")]
    NothingSelected,

    #[error("Chapter selection cancelled")]
    Cancelled,

    #[error("Invalid chapter selection: {0}")]
    Invalid(String),
}

/// Picks the chapters to convert.
pub trait ChapterSelector {
    /// Return the selected indices into `chapters`, ascending and without duplicates.
    ///
    /// `previous` is the selection recorded by an earlier run, if any.
    fn select(
        &mut self,
        chapters: &[Chapter],
        previous: Option<&[usize]>,
    ) -> Result<Vec<usize>, SelectionError>;
}

/// Parse a selection expression like `1-3,5` or `all`.
///
/// With `one_based`, chapter numbers start at 1 as shown in the chapter table;
/// otherwise they are raw indices.
pub fn parse_selection(
    expr: &str,
    total: usize,
    one_based: bool,
) -> Result<Vec<usize>, SelectionError> {
    let offset = usize::from(one_based);
    let mut selected = Vec::new();

    for part in expr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.eq_ignore_ascii_case("all") {
            selected.extend(0..total);
            continue;
        }

        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (parse_number(start)?, parse_number(end)?),
            None => {
                let n = parse_number(part)?;
                (n, n)
            }
        };

        if start > end {
            return Err(SelectionError::Invalid(format!(
                "range '{}' runs backwards",
                part
            )));
        }
        if start < offset || end - offset >= total {
            return Err(SelectionError::Invalid(format!(
                "'{}' is outside chapters {}-{}",
                part,
                offset,
                (total + offset).saturating_sub(1)
            )));
        }

        selected.extend((start - offset)..=(end - offset));
    }

    selected.sort_unstable();
    selected.dedup();

    if selected.is_empty() {
        return Err(SelectionError::NothingSelected);
    }
    Ok(selected)
}

fn parse_number(s: &str) -> Result<usize, SelectionError> {
    s.trim()
        .parse()
        .map_err(|_| SelectionError::Invalid(format!("'{}' is not a chapter number", s.trim())))
}

/// Applies a fixed selection expression (0-based indices).
#[derive(Debug, Clone)]
pub struct FixedSelector {
    expr: String,
}

impl FixedSelector {
    pub fn new(expr: impl Into<String>) -> Self {
        Self { expr: expr.into() }
    }
}

impl ChapterSelector for FixedSelector {
    fn select(
        &mut self,
        chapters: &[Chapter],
        _previous: Option<&[usize]>,
    ) -> Result<Vec<usize>, SelectionError> {
        parse_selection(&self.expr, chapters.len(), false)
    }
}

/// Prompts for a selection on a terminal.
pub struct InteractiveSelector<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> InteractiveSelector<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self) -> Result<Option<String>, SelectionError> {
        write!(
            self.output,
            "Chapters to convert (e.g. 1-3,5 | all | Enter keeps marked | q quits): "
        )
        .and_then(|_| self.output.flush())
        .map_err(io_cancelled)?;

        let mut line = String::new();
        let read = self.input.read_line(&mut line).map_err(io_cancelled)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> ChapterSelector for InteractiveSelector<R, W> {
    fn select(
        &mut self,
        chapters: &[Chapter],
        previous: Option<&[usize]>,
    ) -> Result<Vec<usize>, SelectionError> {
        let default: Vec<usize> = match previous {
            Some(previous) => previous
                .iter()
                .copied()
                .filter(|&i| i < chapters.len())
                .collect(),
            None => (0..chapters.len()).collect(),
        };

        if previous.is_some() {
            writeln!(self.output, "\nLoaded previous chapter selection").map_err(io_cancelled)?;
        }
        write_chapter_table(&mut self.output, chapters, &default).map_err(io_cancelled)?;

        let selected = loop {
            let Some(answer) = self.prompt()? else {
                return Err(SelectionError::Cancelled);
            };

            if answer.eq_ignore_ascii_case("q") || answer.eq_ignore_ascii_case("quit") {
                return Err(SelectionError::Cancelled);
            }
            if answer.is_empty() {
                if default.is_empty() {
                    return Err(SelectionError::NothingSelected);
                }
                break default;
            }

            match parse_selection(&answer, chapters.len(), true) {
                Ok(selected) => break selected,
                Err(e) => {
                    writeln!(self.output, "{}", e).map_err(io_cancelled)?;
                }
            }
        };

        writeln!(self.output, "\nWill process {} chapter(s):", selected.len())
            .map_err(io_cancelled)?;
        for &i in &selected {
            writeln!(
                self.output,
                "  {:>3}. {} ({} words)",
                i + 1,
                chapters[i].title,
                chapters[i].word_count()
            )
            .map_err(io_cancelled)?;
        }

        Ok(selected)
    }
}

/// A terminal that cannot be read or written ends the selection.
fn io_cancelled(_: std::io::Error) -> SelectionError {
    SelectionError::Cancelled
}

/// Estimated listening time in minutes.
pub fn estimated_minutes(words: usize) -> f64 {
    words as f64 / WORDS_PER_MINUTE as f64
}

/// Print the numbered chapter table, marking the `selected` chapters.
pub fn write_chapter_table(
    out: &mut impl Write,
    chapters: &[Chapter],
    selected: &[usize],
) -> std::io::Result<()> {
    let selected_words: usize = selected
        .iter()
        .filter_map(|&i| chapters.get(i))
        .map(Chapter::word_count)
        .sum();

    writeln!(out, "\nChapters")?;
    writeln!(
        out,
        "Current selection: {}/{} chapters | {} words | {:.1}m",
        selected.len(),
        chapters.len(),
        selected_words,
        estimated_minutes(selected_words)
    )?;

    for (i, chapter) in chapters.iter().enumerate() {
        let mark = if selected.contains(&i) { '*' } else { ' ' };
        let words = chapter.word_count();
        writeln!(
            out,
            " {} {:>3}. {} ({} words, {:.1}m)",
            mark,
            i + 1,
            truncate_title(&chapter.title),
            words,
            estimated_minutes(words)
        )?;
    }
    Ok(())
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return title.to_string();
    }
    let head: String = title.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chapters(n: usize) -> Vec<Chapter> {
        (0..n)
            .map(|i| Chapter::new(format!("Chapter {}", i + 1), "Some words in here.", i))
            .collect()
    }

    fn run_interactive(
        answers: &str,
        chapters: &[Chapter],
        previous: Option<&[usize]>,
    ) -> (Result<Vec<usize>, SelectionError>, String) {
        let mut output = Vec::new();
        let result = {
            let mut selector = InteractiveSelector::new(Cursor::new(answers.to_string()), &mut output);
            selector.select(chapters, previous)
        };
        (result, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_parse_selection_one_based() {
        assert_eq!(parse_selection("1-3,5", 6, true).unwrap(), vec![0, 1, 2, 4]);
        assert_eq!(parse_selection("2", 6, true).unwrap(), vec![1]);
        assert_eq!(parse_selection(" 3 , 1-2 ,2", 6, true).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_selection_zero_based() {
        assert_eq!(parse_selection("0-3,7", 8, false).unwrap(), vec![0, 1, 2, 3, 7]);
        assert_eq!(parse_selection("all", 3, false).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_selection_errors() {
        assert!(matches!(
            parse_selection("0", 3, true),
            Err(SelectionError::Invalid(_))
        ));
        assert!(matches!(
            parse_selection("4", 3, true),
            Err(SelectionError::Invalid(_))
        ));
        assert!(matches!(
            parse_selection("3-1", 3, true),
            Err(SelectionError::Invalid(_))
        ));
        assert!(matches!(
            parse_selection("one", 3, true),
            Err(SelectionError::Invalid(_))
        ));
        assert_eq!(
            parse_selection(" , ", 3, true),
            Err(SelectionError::NothingSelected)
        );
        assert_eq!(
            parse_selection("all", 0, false),
            Err(SelectionError::NothingSelected)
        );
    }

    #[test]
    fn test_fixed_selector() {
        let mut selector = FixedSelector::new("1,2");
        assert_eq!(selector.select(&chapters(4), Some(&[0])).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_interactive_enter_keeps_previous() {
        let (result, output) = run_interactive("\n", &chapters(4), Some(&[1, 3]));
        assert_eq!(result.unwrap(), vec![1, 3]);
        assert!(output.contains("Loaded previous chapter selection"));
        assert!(output.contains("Current selection: 2/4 chapters"));
    }

    #[test]
    fn test_interactive_enter_defaults_to_all() {
        let (result, _) = run_interactive("\n", &chapters(3), None);
        assert_eq!(result.unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_interactive_retries_invalid_input() {
        let (result, output) = run_interactive("9\n2-3\n", &chapters(3), None);
        assert_eq!(result.unwrap(), vec![1, 2]);
        assert!(output.contains("Invalid chapter selection"));
        assert!(output.contains("Will process 2 chapter(s)"));
    }

    #[test]
    fn test_interactive_quit_and_eof() {
        let (result, _) = run_interactive("q\n", &chapters(3), None);
        assert_eq!(result, Err(SelectionError::Cancelled));

        let (result, _) = run_interactive("", &chapters(3), None);
        assert_eq!(result, Err(SelectionError::Cancelled));
    }

    #[test]
    fn test_interactive_drops_stale_previous() {
        let (result, _) = run_interactive("\n", &chapters(2), Some(&[1, 5]));
        assert_eq!(result.unwrap(), vec![1]);
    }

    #[test]
    fn test_chapter_table() {
        let mut chapters = chapters(2);
        chapters[1].title = "x".repeat(80);
        let mut out = Vec::new();
        write_chapter_table(&mut out, &chapters, &[0]).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains(" *   1. Chapter 1 (4 words, 0.0m)"));
        assert!(out.contains(&format!("{}...", "x".repeat(57))));
    }

    #[test]
    fn test_estimated_minutes() {
        assert_eq!(estimated_minutes(300), 2.0);
    }
}
