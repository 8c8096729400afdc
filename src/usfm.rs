//! Parser for versified scripture markup.
//!
//! A scripture file is a header followed by sections separated by `\s5`
//! markers. Each section is re-split into per-verse chunks, and every chunk
//! is indexed under `(chapter, first verse)`. The chapter number carries
//! across sections until the next `\c` marker.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::errors::Error;

static SECTION_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\s5\s*\n*").unwrap());
// The separator after \v and \c may be a regular space, tab or a no-break
// space, all of which occur in the wild.
static VERSE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\v[\x{A0}\s]\d").unwrap());
static VERSE_NUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\v[\x{A0}\s](\d+)(?:-(\d+))?").unwrap());
static CHAPTER_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\c[\x{A0}\s](\d+)").unwrap());

/// A contiguous span of markup bounded by section breaks, carrying one or
/// more verses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The chunk's markup exactly as it appeared in the file, verse
    /// bridges included.
    pub raw_usfm: String,
    pub first_verse: u32,
    pub last_verse: u32,
    /// Leading verse numbers mentioned in the chunk. A bridge (`\v 3-4`)
    /// contributes only its leading number here.
    pub verses: Vec<u32>,
}

/// All chunks of one chapter. `chunks` preserves document order;
/// `by_first_verse` indexes into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterBlock {
    pub chunks: Vec<Chunk>,
    pub by_first_verse: HashMap<u32, usize>,
}

impl ChapterBlock {
    pub fn chunk_at(&self, first_verse: u32) -> Option<&Chunk> {
        self.by_first_verse
            .get(&first_verse)
            .and_then(|&index| self.chunks.get(index))
    }

    fn push(&mut self, chunk: Chunk) {
        let index = self.chunks.len();
        // A repeated boundary points at the latest chunk.
        let _ = self.by_first_verse.insert(chunk.first_verse, index);
        self.chunks.push(chunk);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptureTree {
    /// Everything before the first section break: `\id`, `\h`, `\mt`,
    /// table-of-contents markers and the like.
    pub header: String,
    pub chapters: BTreeMap<u32, ChapterBlock>,
}

impl ScriptureTree {
    /// The set of `(chapter, verse)` pairs the tree addresses. Useful for
    /// round-trip checks.
    pub fn verse_pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = self
            .chapters
            .iter()
            .flat_map(|(&chapter, block)| {
                block
                    .chunks
                    .iter()
                    .flat_map(move |chunk| chunk.verses.iter().map(move |&v| (chapter, v)))
            })
            .collect();
        pairs.sort_unstable();
        pairs.dedup();
        pairs
    }

    /// First-verse boundaries of a chapter, in numeric order.
    pub fn boundaries(&self, chapter: u32) -> Vec<u32> {
        let mut verses: Vec<u32> = self
            .chapters
            .get(&chapter)
            .map(|block| block.chunks.iter().map(|c| c.first_verse).collect())
            .unwrap_or_default();
        verses.sort_unstable();
        verses.dedup();
        verses
    }
}

/// Parse a whole scripture file into its chapter/verse tree.
pub fn parse(usfm: &str) -> Result<ScriptureTree, Error> {
    if usfm.trim().is_empty() {
        return Err(Error::Parse("scripture file is empty".to_string()));
    }

    let segments: Vec<&str> = SECTION_BREAK.split(usfm).collect();
    let header = segments[0].to_string();
    if header.trim().is_empty() && segments.len() == 1 {
        return Err(Error::Parse("scripture file has no header".to_string()));
    }

    let mut chapters: BTreeMap<u32, ChapterBlock> = BTreeMap::new();
    let mut current_chapter: Option<u32> = None;

    for segment in &segments[1..] {
        for chunk_text in split_verse_chunks(segment) {
            if chunk_text.trim().is_empty() {
                continue;
            }
            if let Some(caps) = CHAPTER_NUM.captures(&chunk_text) {
                current_chapter = caps[1].parse().ok();
            }

            let mut verses: Vec<u32> = Vec::new();
            let mut last_verse = 0;
            for caps in VERSE_NUM.captures_iter(&chunk_text) {
                let first: u32 = match caps[1].parse() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                verses.push(first);
                last_verse = caps
                    .get(2)
                    .and_then(|bridge| bridge.as_str().parse().ok())
                    .unwrap_or(first);
            }
            if verses.is_empty() {
                // Introductory matter between a section break and the
                // first verse marker.
                continue;
            }
            let Some(chapter) = current_chapter else {
                warn!("Skipping verse chunk before the first chapter marker");
                continue;
            };

            chapters.entry(chapter).or_default().push(Chunk {
                raw_usfm: chunk_text,
                first_verse: verses[0],
                last_verse,
                verses,
            });
        }
    }

    Ok(ScriptureTree { header, chapters })
}

/// Re-split a section into per-verse chunks: a new chunk starts at every
/// line carrying a verse marker, and the pending chunk is emitted first.
fn split_verse_chunks(segment: &str) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut pending: Option<String> = None;
    for line in segment.split_inclusive('\n') {
        if VERSE_LINE.is_match(line) && pending.is_some() {
            if let Some(done) = pending.take() {
                chunks.push(done);
            }
        }
        match pending.as_mut() {
            Some(chunk) => chunk.push_str(line),
            None => pending = Some(line.to_string()),
        }
    }
    if let Some(done) = pending {
        chunks.push(done);
    }
    chunks
}

// ---------------------------------------------------------------------------
// HTML rendering

static FOOTNOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\\f[\x{A0}\s].*?\\f\*").unwrap());
static INLINE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\\+?[a-z]+[0-9]*\*?").unwrap());
static VERSE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\v[\x{A0}\s](\d+(?:-\d+)?)[\x{A0} ]*").unwrap());
static HEADER_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\\(?:h|mt1?)[\x{A0}\s]+(.+?)\s*$").unwrap());
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Render the header block as the book's title heading.
pub fn render_header_html(header: &str, fallback_title: &str) -> String {
    let title = HEADER_TITLE
        .captures(header)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| fallback_title.to_string());
    format!("<h1 class=\"book-title\">{}</h1>\n", escape_html(&title))
}

/// Render one chunk's markup as HTML: chapter markers become headings,
/// verse markers become superscript numbers, poetry lines keep their own
/// rows, everything else flows into paragraphs. Footnotes and unknown
/// inline markers are dropped.
pub fn render_chunk_html(chunk: &Chunk, book_title: &str) -> String {
    let cleaned = FOOTNOTE.replace_all(&chunk.raw_usfm, "");
    let mut out = String::new();
    let mut para: Vec<String> = Vec::new();

    for raw_line in cleaned.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = CHAPTER_NUM.captures(line) {
            flush_paragraph(&mut out, &mut para);
            out.push_str(&format!(
                "<h2 class=\"chapter\">{} {}</h2>\n",
                escape_html(book_title),
                &caps[1]
            ));
            let rest = line[caps.get(0).map(|m| m.end()).unwrap_or(line.len())..].trim();
            if !rest.is_empty() {
                para.push(render_inline(rest));
            }
            continue;
        }
        if let Some(rest) = strip_marker(line, &["s1", "s2", "s3", "s"]) {
            flush_paragraph(&mut out, &mut para);
            if !rest.is_empty() {
                out.push_str(&format!(
                    "<h3 class=\"section\">{}</h3>\n",
                    render_inline(rest)
                ));
            }
            continue;
        }
        if let Some(rest) = strip_marker(line, &["q1", "q2", "q3", "q"]) {
            flush_paragraph(&mut out, &mut para);
            if !rest.is_empty() {
                out.push_str(&format!("<div class=\"poetry\">{}</div>\n", render_inline(rest)));
            }
            continue;
        }
        if let Some(rest) = strip_marker(line, &["pi1", "pi", "p", "m", "nb", "b", "li1", "li"]) {
            flush_paragraph(&mut out, &mut para);
            if !rest.is_empty() {
                para.push(render_inline(rest));
            }
            continue;
        }
        if line.starts_with('\\') && !VERSE_LINE.is_match(line) {
            // Structural marker with no rendering (e.g. \d, \sp, \id).
            continue;
        }
        para.push(render_inline(line));
    }
    flush_paragraph(&mut out, &mut para);
    out
}

fn flush_paragraph(out: &mut String, para: &mut Vec<String>) {
    if !para.is_empty() {
        out.push_str(&format!("<p>{}</p>\n", para.join(" ")));
        para.clear();
    }
}

/// Strip a leading paragraph-level marker, returning the rest of the line.
/// Markers must be tried longest-first (`q2` before `q`).
fn strip_marker<'a>(line: &'a str, markers: &[&str]) -> Option<&'a str> {
    for marker in markers {
        if let Some(rest) = line.strip_prefix(&format!("\\{marker}")) {
            if rest.is_empty() || rest.starts_with([' ', '\u{A0}', '\t']) {
                return Some(rest.trim());
            }
        }
    }
    None
}

fn render_inline(text: &str) -> String {
    let escaped = escape_html(text);
    let with_verses = VERSE_TOKEN.replace_all(&escaped, |caps: &regex::Captures<'_>| {
        format!("<sup class=\"verse-num\">{}</sup> ", &caps[1])
    });
    let stripped = INLINE_MARKER.replace_all(&with_verses, "");
    WHITESPACE_RUN.replace_all(&stripped, " ").trim().to_string()
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TITUS: &str = "\\id TIT EN_ULB en_English_ltr\n\
\\ide UTF-8\n\
\\h Titus\n\
\\toc1 Titus\n\
\\mt Titus\n\
\\s5\n\
\\c 1\n\
\\p\n\
\\v 1 Paul, a servant of God,\n\
\\v 2 with the hope of everlasting life\n\
\\s5\n\
\\v 3 At the right time, he revealed his word\n\
\\s5\n\
\\c 2\n\
\\p\n\
\\v 1 But you, speak what fits\n\
\\v 2-3 Teach older men to be temperate\n";

    #[test]
    fn header_is_the_first_segment() {
        let tree = parse(TITUS).unwrap();
        assert!(tree.header.contains("\\id TIT"));
        assert!(tree.header.contains("\\mt Titus"));
        assert!(!tree.header.contains("\\v"));
    }

    #[test]
    fn chunks_index_under_chapter_and_first_verse() {
        let tree = parse(TITUS).unwrap();
        assert_eq!(tree.chapters.len(), 2);
        let one = &tree.chapters[&1];
        assert_eq!(one.chunks.len(), 2);
        assert_eq!(one.chunk_at(1).unwrap().verses, vec![1, 2]);
        assert_eq!(one.chunk_at(3).unwrap().verses, vec![3]);
    }

    #[test]
    fn chapter_carries_across_section_breaks() {
        let tree = parse(TITUS).unwrap();
        // The `\v 3` section has no chapter marker of its own.
        assert_eq!(tree.chapters[&1].chunk_at(3).unwrap().first_verse, 3);
    }

    #[test]
    fn verse_bridge_keeps_leading_number_and_span() {
        let tree = parse(TITUS).unwrap();
        let chunk = tree.chapters[&2].chunk_at(2).unwrap();
        assert_eq!(chunk.first_verse, 2);
        assert_eq!(chunk.last_verse, 3);
        assert_eq!(chunk.verses, vec![2]);
        assert!(chunk.raw_usfm.contains("\\v 2-3"));
    }

    #[test]
    fn verse_pairs_round_trip() {
        let tree = parse(TITUS).unwrap();
        assert_eq!(
            tree.verse_pairs(),
            vec![(1, 1), (1, 2), (1, 3), (2, 1), (2, 2)]
        );
    }

    #[test]
    fn section_without_verses_is_skipped() {
        let usfm = "\\id GEN\n\\h Genesis\n\\s5\n\\c 1\n\\s Intro heading only\n\\s5\n\\v 1 In the beginning\n";
        // The chapter marker in the verse-less section still takes effect.
        let tree = parse(usfm).unwrap();
        assert_eq!(tree.chapters.len(), 1);
        assert_eq!(tree.chapters[&1].chunks.len(), 1);
    }

    #[test]
    fn no_break_space_separator_is_accepted() {
        let usfm = "\\id GEN\n\\s5\n\\c\u{A0}3\n\\v\u{A0}7 And he said\n";
        let tree = parse(usfm).unwrap();
        assert_eq!(tree.chapters[&3].chunk_at(7).unwrap().verses, vec![7]);
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        assert!(matches!(parse("  \n"), Err(Error::Parse(_))));
    }

    #[test]
    fn boundaries_are_numeric_not_lexicographic() {
        let usfm = "\\id PSA\n\\s5\n\\c 1\n\\v 2 b\n\\s5\n\\v 10 c\n\\s5\n\\v 9 a\n";
        let tree = parse(usfm).unwrap();
        assert_eq!(tree.boundaries(1), vec![2, 9, 10]);
    }

    #[test]
    fn chunk_html_renders_chapter_and_verses() {
        let tree = parse(TITUS).unwrap();
        let html = render_chunk_html(tree.chapters[&1].chunk_at(1).unwrap(), "Titus");
        assert!(html.contains("<h2 class=\"chapter\">Titus 1</h2>"));
        assert!(html.contains("<sup class=\"verse-num\">1</sup> Paul, a servant of God,"));
        assert!(html.contains("<sup class=\"verse-num\">2</sup>"));
    }

    #[test]
    fn chunk_html_keeps_the_bridge_form() {
        let tree = parse(TITUS).unwrap();
        let html = render_chunk_html(tree.chapters[&2].chunk_at(2).unwrap(), "Titus");
        assert!(html.contains("<sup class=\"verse-num\">2-3</sup>"));
    }

    #[test]
    fn footnotes_and_inline_markers_are_dropped() {
        let chunk = Chunk {
            raw_usfm: "\\v 1 The \\nd Lord\\nd* spoke \\f + \\ft a note\\f* plainly\n".to_string(),
            first_verse: 1,
            last_verse: 1,
            verses: vec![1],
        };
        let html = render_chunk_html(&chunk, "Genesis");
        assert!(html.contains("The Lord spoke plainly"));
        assert!(!html.contains("\\nd"));
        assert!(!html.contains("a note"));
    }

    #[test]
    fn header_html_prefers_the_h_marker() {
        let html = render_header_html("\\id TIT\n\\h Tito\n\\mt Titus\n", "Titus");
        assert_eq!(html, "<h1 class=\"book-title\">Tito</h1>\n");
        let html = render_header_html("\\id TIT\n", "Titus");
        assert_eq!(html, "<h1 class=\"book-title\">Titus</h1>\n");
    }

    #[test]
    fn text_is_escaped() {
        let chunk = Chunk {
            raw_usfm: "\\v 1 Mercy & grace <here>\n".to_string(),
            first_verse: 1,
            last_verse: 1,
            verses: vec![1],
        };
        let html = render_chunk_html(&chunk, "Genesis");
        assert!(html.contains("Mercy &amp; grace &lt;here&gt;"));
    }
}
