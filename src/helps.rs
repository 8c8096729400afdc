//! Readers for the markdown-based helps resources: translation notes,
//! questions, words, academy and commentary.
//!
//! Notes-shaped resources (tn, tq, bc) live in per-book directories with
//! numeric chapter subdirectories holding `intro.md` and `<NNN>.md` chunk
//! files; words and academy are addressed by category path and are loaded
//! on demand while cross-references resolve (see [`crate::links`]).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use crate::books;
use crate::errors::Error;

/// A structured markdown fragment with a stable anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Doc {
    /// The `rc://` token this fragment answers to.
    pub token: String,
    pub title: String,
    pub anchor: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelpsChapter {
    pub intro: Option<Doc>,
    pub by_verse: BTreeMap<u32, Doc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelpsTree {
    pub book_intro: Option<Doc>,
    pub chapters: BTreeMap<u32, HelpsChapter>,
}

impl HelpsTree {
    /// Every doc of the tree in reading order, for token registration.
    pub fn docs(&self) -> impl Iterator<Item = &Doc> {
        self.book_intro
            .iter()
            .chain(self.chapters.values().flat_map(|chapter| {
                chapter.intro.iter().chain(chapter.by_verse.values())
            }))
    }

    pub fn docs_mut(&mut self) -> impl Iterator<Item = &mut Doc> {
        self.book_intro
            .iter_mut()
            .chain(self.chapters.values_mut().flat_map(|chapter| {
                chapter.intro.iter_mut().chain(chapter.by_verse.values_mut())
            }))
    }
}

/// Identity of the resource a tree is being read for.
#[derive(Debug, Clone, Copy)]
pub struct HelpsContext<'a> {
    pub lang_code: &'a str,
    /// Anchor tag and token container: `tn`, `tq` or `bc`.
    pub kind_tag: &'a str,
    pub book_id: &'a str,
    pub book_title: &'a str,
}

/// Locate the per-book directory inside an unpacked helps resource. Repos
/// keep the book directory either at the top level or nested one layer
/// down (`en_tn/tit/...`).
pub fn find_book_dir(resource_dir: &Path, book_id: &str) -> Option<PathBuf> {
    let direct = resource_dir.join(book_id);
    if direct.is_dir() {
        return Some(direct);
    }
    walkdir::WalkDir::new(resource_dir)
        .min_depth(1)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| {
            entry.file_type().is_dir() && entry.file_name().to_string_lossy() == book_id
        })
        .map(|entry| entry.into_path())
}

/// Read a notes-shaped book directory into the chapter/verse tree.
pub fn read_book_tree(book_dir: &Path, ctx: &HelpsContext<'_>) -> Result<HelpsTree, Error> {
    debug!("Reading {} tree from {}", ctx.kind_tag, book_dir.display());
    if !book_dir.is_dir() {
        return Err(Error::Parse(format!(
            "no book directory at {}",
            book_dir.display()
        )));
    }

    let mut tree = HelpsTree {
        book_intro: read_book_intro(book_dir, ctx)?,
        chapters: BTreeMap::new(),
    };

    let mut chapter_dirs: Vec<(u32, PathBuf)> = Vec::new();
    for entry in fs::read_dir(book_dir)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(chapter) = numeric_name(&name) {
            chapter_dirs.push((chapter, entry.path()));
        }
    }
    chapter_dirs.sort();

    for (chapter, chapter_dir) in chapter_dirs {
        let parsed = read_chapter(&chapter_dir, chapter, ctx)?;
        if parsed.intro.is_some() || !parsed.by_verse.is_empty() {
            let _ = tree.chapters.insert(chapter, parsed);
        }
    }
    Ok(tree)
}

fn read_book_intro(book_dir: &Path, ctx: &HelpsContext<'_>) -> Result<Option<Doc>, Error> {
    let intro_path = book_dir.join("front").join("intro.md");
    if !intro_path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&intro_path)?;
    let title = get_first_header(&raw);
    let mut body = fix_relative_note_links(&raw, ctx.lang_code, ctx.kind_tag, ctx.book_id, None);
    body = increase_headers(&body, 1);
    body = decrease_headers(&body, 5, 1);
    Ok(Some(Doc {
        token: format!(
            "rc://{}/{}/help/{}/front/intro",
            ctx.lang_code, ctx.kind_tag, ctx.book_id
        ),
        title,
        anchor: format!("{}-{}-front-intro", ctx.kind_tag, ctx.book_id),
        body,
    }))
}

fn read_chapter(
    chapter_dir: &Path,
    chapter: u32,
    ctx: &HelpsContext<'_>,
) -> Result<HelpsChapter, Error> {
    let padded_chapter = books::pad(ctx.book_id, chapter);
    let mut parsed = HelpsChapter::default();

    let intro_path = chapter_dir.join("intro.md");
    if intro_path.is_file() {
        let raw = fs::read_to_string(&intro_path)?;
        let title = get_first_header(&raw);
        let mut body = fix_relative_note_links(
            &raw,
            ctx.lang_code,
            ctx.kind_tag,
            ctx.book_id,
            Some(&padded_chapter),
        );
        body = increase_headers(&body, 1);
        body = decrease_headers(&body, 5, 2);
        parsed.intro = Some(Doc {
            token: format!(
                "rc://{}/{}/help/{}/{}/intro",
                ctx.lang_code, ctx.kind_tag, ctx.book_id, padded_chapter
            ),
            title,
            anchor: format!("{}-{}-{}-intro", ctx.kind_tag, ctx.book_id, padded_chapter),
            body,
        });
    }

    let mut chunk_files: Vec<(u32, PathBuf)> = Vec::new();
    for entry in fs::read_dir(chapter_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(first_verse) = numeric_name(&stem) {
            chunk_files.push((first_verse, path));
        }
    }
    chunk_files.sort();

    for (first_verse, path) in chunk_files {
        trace!("chunk file {}", path.display());
        let doc = read_chunk_doc(&path, chapter, first_verse, ctx)?;
        let _ = parsed.by_verse.insert(first_verse, doc);
    }
    Ok(parsed)
}

fn read_chunk_doc(
    path: &Path,
    chapter: u32,
    first_verse: u32,
    ctx: &HelpsContext<'_>,
) -> Result<Doc, Error> {
    let padded_chapter = books::pad(ctx.book_id, chapter);
    let padded_verse = books::pad(ctx.book_id, first_verse);
    let raw = fs::read_to_string(path)?;

    let mut body;
    let title;
    if ctx.kind_tag == "tq" {
        title = format!(
            "{} {}:{} Translation Questions",
            ctx.book_title, chapter, first_verse
        );
        body = increase_headers(&raw, 2);
        body = append_verse_backrefs(&body, ctx.book_id, chapter, first_verse);
    } else {
        title = format!("{} {}:{}", ctx.book_title, chapter, first_verse);
        body = increase_headers(&raw, 3);
        body = decrease_headers(&body, 5, 1);
        body = fix_relative_note_links(
            &body,
            ctx.lang_code,
            ctx.kind_tag,
            ctx.book_id,
            Some(&padded_chapter),
        );
    }

    Ok(Doc {
        token: format!(
            "rc://{}/{}/help/{}/{}/{}",
            ctx.lang_code, ctx.kind_tag, ctx.book_id, padded_chapter, padded_verse
        ),
        title,
        anchor: format!(
            "{}-{}-{}-{}",
            ctx.kind_tag, ctx.book_id, padded_chapter, padded_verse
        ),
        body,
    })
}

/// Every question line gains a back-reference to the verse it belongs to,
/// so readers can jump from the question to the notes block.
fn append_verse_backrefs(text: &str, book_id: &str, chapter: u32, first_verse: u32) -> String {
    static PLAIN_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^([^#\n].+)$").unwrap());
    let anchor = format!(
        "tn-{}-{}-{}",
        book_id,
        books::pad(book_id, chapter),
        books::pad(book_id, first_verse)
    );
    PLAIN_LINE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            format!(
                "{} [<a href=\"#{}\">{}:{}</a>]",
                &caps[1], anchor, chapter, first_verse
            )
        })
        .into_owned()
}

fn numeric_name(name: &str) -> Option<u32> {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        name.parse().ok()
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Category-path entries (translation words / academy)

/// A words or academy entry loaded for cross-reference resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryEntry {
    pub title: String,
    /// The category path that actually resolved, after any prefix swap.
    pub path: String,
    pub body: String,
}

/// Load a words/academy entry by category path (e.g. `bible/kt/grace` or
/// `translate/figs-metaphor`). Tries `<path>.md` then `<path>/01.md`; a
/// missing `bible/kt/` path retries as `bible/other/` and vice versa.
pub fn load_category_entry(
    working_dir: &Path,
    lang_code: &str,
    kind_tag: &str,
    path: &str,
) -> Option<CategoryEntry> {
    let base = working_dir.join(format!("{lang_code}_{kind_tag}"));
    let candidates = category_candidates(path);
    for candidate in &candidates {
        for file in [
            base.join(format!("{candidate}.md")),
            base.join(candidate).join("01.md"),
        ] {
            if !file.is_file() {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&file) else {
                return None;
            };
            let entry = match kind_tag {
                "ta" => academy_entry(&file, &raw, lang_code, candidate),
                "tw" => words_entry(&raw, lang_code, candidate),
                _ => CategoryEntry {
                    title: get_first_header(&raw),
                    path: candidate.clone(),
                    body: raw,
                },
            };
            return Some(entry);
        }
    }
    None
}

fn category_candidates(path: &str) -> Vec<String> {
    let mut candidates = vec![path.to_string()];
    if let Some(rest) = path.strip_prefix("bible/kt/") {
        candidates.push(format!("bible/other/{rest}"));
    } else if let Some(rest) = path.strip_prefix("bible/other/") {
        candidates.push(format!("bible/kt/{rest}"));
    }
    candidates
}

fn words_entry(raw: &str, lang_code: &str, path: &str) -> CategoryEntry {
    let title = get_first_header(raw);
    let dictionary = path.split('/').nth(1).unwrap_or("kt");
    let body = fix_word_links(raw, lang_code, dictionary);
    CategoryEntry {
        title,
        path: path.to_string(),
        body,
    }
}

/// Academy entries prepend the sibling `title.md` (falling back to the
/// first header) and turn the sibling `sub-title.md` into the "answers the
/// question" lead-in.
fn academy_entry(file: &Path, raw: &str, lang_code: &str, path: &str) -> CategoryEntry {
    let dir = file.parent().unwrap_or_else(|| Path::new(""));
    let title = fs::read_to_string(dir.join("title.md"))
        .map(|t| t.trim().to_string())
        .unwrap_or_else(|_| get_first_header(raw));
    let question = fs::read_to_string(dir.join("sub-title.md"))
        .map(|q| format!("This page answers the question: *{}*\n\n", q.trim()))
        .unwrap_or_default();
    let manual = path.split('/').next().unwrap_or("translate");
    let body = format!("# {title}\n\n{question}{raw}");
    let body = fix_academy_links(&body, lang_code, manual);
    CategoryEntry {
        title,
        path: path.to_string(),
        body,
    }
}

// ---------------------------------------------------------------------------
// Markdown munging shared by the readers

static HEADER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(#+) +(.+?) *#*$").unwrap());
static FIRST_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ *#+ (.*?) *#*$").unwrap());

/// Push every header down by `depth` levels.
pub fn increase_headers(text: &str, depth: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let extra = "#".repeat(depth);
    HEADER_LINE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            format!("{}{} {}", &caps[1], extra, &caps[2])
        })
        .into_owned()
}

/// Pull headers of `minimum` or more hashes back up by `decrease` levels,
/// keeping the rendered outline at five levels or less.
pub fn decrease_headers(text: &str, minimum: usize, decrease: usize) -> String {
    if text.is_empty() || minimum <= decrease {
        return text.to_string();
    }
    let pattern = format!(
        r"(?m)^({}#*){} +(.+?) *#*$",
        "#".repeat(minimum - decrease),
        "#".repeat(decrease)
    );
    let re = Regex::new(&pattern).expect("header pattern is valid");
    re.replace_all(text, "$1 $2").into_owned()
}

/// First markdown header of the text, else its first line, else a filler.
pub fn get_first_header(text: &str) -> String {
    for line in text.lines() {
        if let Some(caps) = FIRST_HEADER.captures(line) {
            return caps[1].to_string();
        }
    }
    text.lines()
        .next()
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| "NO TITLE".to_string())
}

/// Drop a named section and everything under it, up to the next header.
pub fn remove_md_section(text: &str, section_name: &str) -> String {
    static ANY_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#.*$").unwrap());
    let header = &*ANY_HEADER;
    let section = Regex::new(&format!("^#+ {}", regex::escape(section_name)))
        .expect("section pattern is valid");
    let mut out = String::new();
    let mut in_section = false;
    for line in text.lines() {
        if in_section {
            if header.is_match(line) && !section.is_match(line) {
                out.push_str(line);
                out.push('\n');
                in_section = false;
            }
        } else if section.is_match(line) {
            in_section = true;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

static NOTE_LINK_GRANDPARENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(\.\./\.\./([^)]+?)(\.md)*\)").unwrap());
static NOTE_LINK_PARENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(\.\./([^)]+?)(\.md)*\)").unwrap());
static NOTE_LINK_SIBLING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(\./([^)]+?)(\.md)*\)").unwrap());
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n__.*\|.*").unwrap());

/// Canonicalize the relative links of a notes-shaped file to `rc://` form
/// so the link rewriter can resolve them uniformly. `../../` points at
/// another book, `../` at another chapter of this book, `./` at another
/// chunk of this chapter. Pipe-table debris is dropped.
pub fn fix_relative_note_links(
    text: &str,
    lang_code: &str,
    kind_tag: &str,
    book_id: &str,
    padded_chapter: Option<&str>,
) -> String {
    let text = NOTE_LINK_GRANDPARENT
        .replace_all(text, format!("](rc://{lang_code}/{kind_tag}/help/$1)"));
    let text = NOTE_LINK_PARENT.replace_all(
        &text,
        format!("](rc://{lang_code}/{kind_tag}/help/{book_id}/$1)"),
    );
    let text = match padded_chapter {
        Some(chapter) => NOTE_LINK_SIBLING
            .replace_all(
                &text,
                format!("](rc://{lang_code}/{kind_tag}/help/{book_id}/{chapter}/$1)"),
            )
            .into_owned(),
        None => text.into_owned(),
    };
    TABLE_ROW.replace_all(&text, "").into_owned()
}

static WORD_LINK_SIBLING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(\.\./([^/)]+?)(\.md)*\)").unwrap());
static WORD_LINK_OTHER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(\.\./([^)]+?)(\.md)*\)").unwrap());

/// Canonicalize a words entry's relative links to `rc://.../tw/dict/...`.
pub fn fix_word_links(text: &str, lang_code: &str, dictionary: &str) -> String {
    let text = WORD_LINK_SIBLING.replace_all(
        text,
        format!("](rc://{lang_code}/tw/dict/bible/{dictionary}/$1)"),
    );
    WORD_LINK_OTHER
        .replace_all(&text, format!("](rc://{lang_code}/tw/dict/bible/$1)"))
        .into_owned()
}

static ACADEMY_LINK_GRANDPARENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(\.\./\.\./([^/)]+)/([^/)]+)/01\.md\)").unwrap());
static ACADEMY_LINK_PARENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(\.\./([^/)]+)/01\.md\)").unwrap());
static ACADEMY_LINK_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\(([^# :/)]+)\)").unwrap());

/// Canonicalize an academy entry's relative links to `rc://.../ta/man/...`.
pub fn fix_academy_links(text: &str, lang_code: &str, manual: &str) -> String {
    let text = ACADEMY_LINK_GRANDPARENT.replace_all(text, format!("](rc://{lang_code}/ta/man/$1/$2)"));
    let text = ACADEMY_LINK_PARENT.replace_all(&text, format!("](rc://{lang_code}/ta/man/{manual}/$1)"));
    ACADEMY_LINK_BARE
        .replace_all(&text, format!("](rc://{lang_code}/ta/man/{manual}/$1)"))
        .into_owned()
}
