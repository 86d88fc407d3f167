// EPUB chapter extraction

use anyhow::Result;
use epub::doc::{EpubDoc, NavPoint};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Titles (lowercase) of documents that are front matter, not reading content.
const FRONT_MATTER_TITLES: &[&str] = &["copy", "copyright", "title page", "cover"];

/// A chapter extracted from a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    /// Chapter title
    pub title: String,
    /// Plain text content
    pub text: String,
    /// Position in reading order, starting at 0
    pub order: usize,
}

impl Chapter {
    pub fn new(title: impl Into<String>, text: impl Into<String>, order: usize) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            order,
        }
    }

    /// Approximate word count
    pub fn word_count(&self) -> usize {
        crate::text::word_count(&self.text)
    }
}

/// Parsed EPUB book
#[derive(Debug)]
pub struct Book {
    /// Book title
    pub title: String,
    /// Book author(s)
    pub author: Option<String>,
    /// Chapters in reading order
    pub chapters: Vec<Chapter>,
}

impl Book {
    /// Total word count across all chapters (approximate)
    pub fn total_words(&self) -> usize {
        self.chapters.iter().map(Chapter::word_count).sum()
    }
}

/// Extract the ordered chapters of an EPUB file.
///
/// Chapters follow the table of contents, so several chapters stored in one
/// document are split at their anchors. Books without a usable table of contents
/// fall back to one chapter per spine document.
pub fn extract_chapters(path: &Path) -> Result<Book> {
    if !path.exists() {
        anyhow::bail!("EPUB file not found: {}", path.display());
    }

    let mut doc =
        EpubDoc::new(path).map_err(|e| anyhow::anyhow!("Failed to open EPUB: {}", e))?;

    let title = doc
        .mdata("title")
        .map(|m| m.value.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let author = doc.mdata("creator").map(|m| m.value.clone());

    let mut entries = Vec::new();
    flatten_toc(&doc.toc, &mut entries);
    debug!("Table of contents: {} entries", entries.len());

    let mut chapters = chapters_from_toc(&entries, |path| {
        doc.get_resource_by_path(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    });
    if chapters.is_empty() {
        debug!("No chapters from the table of contents, reading the spine");
        chapters = chapters_from_spine(&mut doc);
    }

    Ok(Book {
        title,
        author,
        chapters,
    })
}

/// A table of contents entry: a document and an optional anchor within it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TocEntry {
    label: String,
    path: PathBuf,
    fragment: Option<String>,
}

/// Flatten the nested table of contents in reading order.
///
/// An entry with children is a section heading and contributes only its children.
fn flatten_toc(points: &[NavPoint], entries: &mut Vec<TocEntry>) {
    for point in points {
        if !point.children.is_empty() {
            flatten_toc(&point.children, entries);
            continue;
        }

        let content = point.content.to_string_lossy();
        let (path, fragment) = match content.split_once('#') {
            Some((path, fragment)) => (path, Some(fragment).filter(|f| !f.is_empty())),
            None => (content.as_ref(), None),
        };
        entries.push(TocEntry {
            label: point.label.split_whitespace().collect::<Vec<_>>().join(" "),
            path: PathBuf::from(path),
            fragment: fragment.map(str::to_string),
        });
    }
}

/// Build chapters from flattened TOC entries, loading each document once.
///
/// An anchored entry runs up to the next anchor in the same document, or to the
/// end of the document.
fn chapters_from_toc(
    entries: &[TocEntry],
    mut load: impl FnMut(&Path) -> Option<String>,
) -> Vec<Chapter> {
    let mut documents: HashMap<PathBuf, Option<String>> = HashMap::new();
    let mut seen = HashSet::new();
    let mut chapters = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        if entry.label.is_empty() || is_front_matter(&entry.label) {
            continue;
        }
        if !seen.insert((&entry.path, &entry.fragment)) {
            continue;
        }

        let html = documents
            .entry(entry.path.clone())
            .or_insert_with(|| load(&entry.path));
        let Some(html) = html.as_deref() else {
            debug!("Missing document {}", entry.path.display());
            continue;
        };

        let section = match &entry.fragment {
            None => Some(html),
            Some(fragment) => {
                let next = entries[i + 1..]
                    .iter()
                    .find(|e| e.path == entry.path)
                    .and_then(|e| e.fragment.as_deref());
                section_between(html, fragment, next)
            }
        };
        let Some(section) = section else {
            debug!(
                "Anchor #{} not found in {}",
                entry.fragment.as_deref().unwrap_or_default(),
                entry.path.display()
            );
            continue;
        };

        let text = html_to_text(section);
        if text.trim().is_empty() {
            continue;
        }
        chapters.push(Chapter::new(entry.label.clone(), text, chapters.len()));
    }

    chapters
}

/// One chapter per spine document, titled by its first heading.
fn chapters_from_spine(doc: &mut EpubDoc<BufReader<File>>) -> Vec<Chapter> {
    let mut chapters = Vec::new();
    let spine = doc.spine.clone();

    for spine_item in spine.iter() {
        let Some((content_bytes, _mime)) = doc.get_resource(&spine_item.idref) else {
            continue;
        };
        let html = String::from_utf8_lossy(&content_bytes).to_string();

        let text = html_to_text(&html);
        if text.trim().is_empty() {
            continue;
        }

        let order = chapters.len();
        let chapter_title =
            heading_title(&html).unwrap_or_else(|| format!("Chapter {}", order + 1));

        if is_front_matter(&chapter_title) {
            continue;
        }

        chapters.push(Chapter::new(chapter_title, text, order));
    }

    chapters
}

/// The HTML from the element with id `start_id` up to the element with id `end_id`.
fn section_between<'a>(html: &'a str, start_id: &str, end_id: Option<&str>) -> Option<&'a str> {
    let start = anchor_offset(html, start_id)?;
    let end = end_id
        .and_then(|id| anchor_offset(&html[start..], id))
        .filter(|&offset| offset > 0)
        .map_or(html.len(), |offset| start + offset);
    Some(&html[start..end])
}

/// Byte offset of the `<` opening the element whose id is `id`.
fn anchor_offset(html: &str, id: &str) -> Option<usize> {
    ['"', '\'']
        .iter()
        .filter_map(|quote| {
            let attribute = format!("id={quote}{id}{quote}");
            html.match_indices(&attribute)
                .map(|(pos, _)| pos)
                .find(|&pos| html[..pos].ends_with(char::is_whitespace))
                .and_then(|pos| html[..pos].rfind('<'))
        })
        .min()
}

/// Whether a document title marks front matter (copyright, cover, byline...)
fn is_front_matter(title: &str) -> bool {
    let lower = title.trim().to_lowercase();
    FRONT_MATTER_TITLES.contains(&lower.as_str()) || lower.starts_with("by ")
}

/// Title from the first non-empty h1, h2 or h3 element
fn heading_title(html: &str) -> Option<String> {
    // ASCII-only lowercasing keeps byte offsets valid for `html`
    let html_lower = html.to_ascii_lowercase();

    for tag in ["h1", "h2", "h3"] {
        let open = format!("<{}", tag);
        let close = format!("</{}>", tag);

        let Some(start) = html_lower.find(&open) else {
            continue;
        };
        let Some(tag_end) = html_lower[start..].find('>') else {
            continue;
        };
        let content_start = start + tag_end + 1;
        let Some(end) = html_lower[content_start..].find(&close) else {
            continue;
        };

        let title = strip_html_tags(&html[content_start..content_start + end]);
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        if !title.is_empty() {
            return Some(title);
        }
    }

    None
}

/// Strip HTML tags from a string
fn strip_html_tags(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;

    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result
}

/// Convert HTML to plain text, one paragraph per line
fn html_to_text(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 1000);
    join_paragraphs(&text)
}

/// Join wrapped lines into paragraphs separated by a single newline
fn join_paragraphs(text: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(trimmed);
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    paragraphs.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let err = extract_chapters(Path::new("/nonexistent/book.epub")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_strip_html_tags() {
        assert_eq!(strip_html_tags("<p>Hello</p>"), "Hello");
        assert_eq!(strip_html_tags("<a href=\"x\">Link</a> text"), "Link text");
    }

    #[test]
    fn test_heading_title_prefers_h1() {
        let html = "<html><body><h2>Part</h2><h1>Chapter <em>One</em></h1></body></html>";
        assert_eq!(heading_title(html), Some("Chapter One".to_string()));
    }

    #[test]
    fn test_heading_title_falls_back() {
        let html = "<html><body><h1>  </h1><h3 class=\"t\">Epilogue</h3></body></html>";
        assert_eq!(heading_title(html), Some("Epilogue".to_string()));
        assert_eq!(heading_title("<p>No heading</p>"), None);
    }

    #[test]
    fn test_heading_title_after_non_ascii_text() {
        // Characters whose lowercase form has a different UTF-8 length
        assert_eq!(
            heading_title("<p>İstanbul</p><h1>Été</h1>"),
            Some("Été".to_string())
        );
        assert_eq!(
            heading_title("<p>\u{212A}elvin</p><H1>Title</H1>"),
            Some("Title".to_string())
        );
    }

    fn nav(label: &str, content: &str, children: Vec<NavPoint>) -> NavPoint {
        NavPoint {
            label: label.to_string(),
            content: PathBuf::from(content),
            children,
            play_order: None,
        }
    }

    fn entry(label: &str, path: &str, fragment: Option<&str>) -> TocEntry {
        TocEntry {
            label: label.to_string(),
            path: PathBuf::from(path),
            fragment: fragment.map(str::to_string),
        }
    }

    const TWO_CHAPTERS: &str = r#"<html><body>
<h1 id="ch1">Chapter One</h1><p>The first chapter starts here.</p>
<h1 id='ch2'>Chapter Two</h1><p>The second chapter follows.</p>
</body></html>"#;

    #[test]
    fn test_flatten_toc() {
        let toc = vec![
            nav("Cover", "OEBPS/cover.xhtml", vec![]),
            nav(
                "Part  One",
                "OEBPS/part1.xhtml",
                vec![
                    nav("Chapter\n One", "OEBPS/part1.xhtml#ch1", vec![]),
                    nav("Chapter Two", "OEBPS/part1.xhtml#ch2", vec![]),
                ],
            ),
            nav("Epilogue", "OEBPS/end.xhtml#", vec![]),
        ];

        let mut entries = Vec::new();
        flatten_toc(&toc, &mut entries);

        assert_eq!(
            entries,
            vec![
                entry("Cover", "OEBPS/cover.xhtml", None),
                entry("Chapter One", "OEBPS/part1.xhtml", Some("ch1")),
                entry("Chapter Two", "OEBPS/part1.xhtml", Some("ch2")),
                entry("Epilogue", "OEBPS/end.xhtml", None),
            ]
        );
    }

    #[test]
    fn test_chapters_from_toc_splits_at_anchors() {
        let entries = vec![
            entry("Copyright", "copy.xhtml", None),
            entry("Chapter One", "book.xhtml", Some("ch1")),
            entry("Chapter Two", "book.xhtml", Some("ch2")),
            entry("Afterword", "after.xhtml", None),
        ];
        let mut loads = Vec::new();
        let chapters = chapters_from_toc(&entries, |path| {
            loads.push(path.to_path_buf());
            match path.to_str() {
                Some("book.xhtml") => Some(TWO_CHAPTERS.to_string()),
                Some("after.xhtml") => Some("<p>Thanks for reading.</p>".to_string()),
                _ => None,
            }
        });

        let titles: Vec<_> = chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Chapter One", "Chapter Two", "Afterword"]);
        assert_eq!(
            chapters.iter().map(|c| c.order).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        assert!(chapters[0].text.contains("first chapter"));
        assert!(!chapters[0].text.contains("second chapter"));
        assert!(chapters[1].text.contains("second chapter"));
        assert!(!chapters[1].text.contains("first chapter"));

        // Each document is read once; front matter is never read
        assert_eq!(
            loads,
            vec![PathBuf::from("book.xhtml"), PathBuf::from("after.xhtml")]
        );
    }

    #[test]
    fn test_chapters_from_toc_skips_missing_and_duplicates() {
        let entries = vec![
            entry("Lost", "missing.xhtml", None),
            entry("Chapter One", "book.xhtml", Some("nowhere")),
            entry("Whole Book", "book.xhtml", None),
            entry("Whole Book Again", "book.xhtml", None),
        ];
        let chapters = chapters_from_toc(&entries, |path| {
            (path == Path::new("book.xhtml")).then(|| TWO_CHAPTERS.to_string())
        });

        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "Whole Book");
        assert!(chapters[0].text.contains("first chapter"));
        assert!(chapters[0].text.contains("second chapter"));
    }

    #[test]
    fn test_section_between() {
        let section = section_between(TWO_CHAPTERS, "ch2", None).unwrap();
        assert!(section.starts_with("<h1 id='ch2'>"));
        assert!(section.ends_with("</html>"));

        let section = section_between(TWO_CHAPTERS, "ch1", Some("ch2")).unwrap();
        assert!(section.starts_with("<h1 id=\"ch1\">"));
        assert!(!section.contains("Chapter Two"));

        assert!(section_between(TWO_CHAPTERS, "ch3", None).is_none());
        // `data-id` is not an id
        assert!(section_between(r#"<p data-id="x">No</p>"#, "x", None).is_none());
    }

    #[test]
    fn test_is_front_matter() {
        assert!(is_front_matter("Copyright"));
        assert!(is_front_matter("  Title Page "));
        assert!(is_front_matter("By Jane Doe"));
        assert!(!is_front_matter("Chapter 1"));
        assert!(!is_front_matter("Byzantium"));
    }

    #[test]
    fn test_join_paragraphs() {
        let text = "First line\nwrapped here.\n\n\nSecond paragraph.\n";
        assert_eq!(
            join_paragraphs(text),
            "First line wrapped here.\nSecond paragraph."
        );
    }

    #[test]
    fn test_chapter_word_count() {
        let chapter = Chapter::new("One", "Three little words.", 0);
        assert_eq!(chapter.word_count(), 3);
    }
}
