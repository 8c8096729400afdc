//! Cross-reference resolution and rewriting.
//!
//! Helps content references other content with `rc://` tokens
//! (`rc://en/tw/dict/bible/kt/grace`). Tokens that resolve inside the
//! document become `[title](#anchor)` links; tokens that point at external
//! material become conventional URLs. Resolution is transitive: a words
//! entry pulled in for a note may itself reference an academy entry, which
//! is then pulled in too. Entries are interned in an id-indexed arena and
//! an id is only followed the first time it is seen, which breaks cycles.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::trace;

use crate::books;
use crate::helps::{self, Doc};

/// One resolved (or knowingly broken) cross-reference target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcEntry {
    pub token: String,
    /// Resource kind segment of the token: `tn`, `tq`, `tw`, `ta`, ...
    pub kind: String,
    pub anchor: String,
    pub title: String,
    /// Markdown body for entries loaded from disk; empty for targets that
    /// already live in a parsed tree and for broken references.
    pub body: String,
    /// Whether the assembler should emit `body` as document content
    /// (words/academy entries pulled in by reference).
    pub inline: bool,
    /// Tokens of the places that referenced this entry.
    pub references: Vec<String>,
}

impl RcEntry {
    pub fn link(&self) -> String {
        format!("#{}", self.anchor)
    }
}

/// Id-indexed arena of resolved cross-reference entries for one resource.
#[derive(Debug, Clone, Default)]
pub struct RcArena {
    entries: Vec<RcEntry>,
    by_token: HashMap<String, usize>,
}

impl RcArena {
    pub fn get(&self, token: &str) -> Option<&RcEntry> {
        self.by_token.get(token).map(|&id| &self.entries[id])
    }

    pub fn contains(&self, token: &str) -> bool {
        self.by_token.contains_key(token)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RcEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a target that already lives in a parsed tree, so
    /// references to it resolve to its anchor without re-loading files.
    pub fn register_doc(&mut self, doc: &Doc, kind: &str) {
        if self.contains(&doc.token) {
            return;
        }
        self.insert(RcEntry {
            token: doc.token.clone(),
            kind: kind.to_string(),
            anchor: doc.anchor.clone(),
            title: doc.title.clone(),
            body: String::new(),
            inline: false,
            references: Vec::new(),
        });
    }

    /// Entries the assembler should emit inline, sorted by lowercased
    /// title the way the words/topics sections are presented.
    pub fn inline_entries(&self, kind: &str) -> Vec<&RcEntry> {
        let mut picked: Vec<&RcEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.inline && entry.kind == kind && !entry.body.is_empty())
            .collect();
        picked.sort_by_key(|entry| entry.title.to_lowercase());
        picked
    }

    /// Replace an entry's body (used after its references have been
    /// rewritten in turn).
    pub fn set_body(&mut self, token: &str, body: String) {
        if let Some(&id) = self.by_token.get(token) {
            self.entries[id].body = body;
        }
    }

    fn insert(&mut self, entry: RcEntry) -> usize {
        let id = self.entries.len();
        let _ = self.by_token.insert(entry.token.clone(), id);
        self.entries.push(entry);
        id
    }

    fn note_reference(&mut self, token: &str, source: &str) {
        if let Some(&id) = self.by_token.get(token) {
            self.entries[id].references.push(source.to_string());
        }
    }
}

// The wildcard-language forms (`rc://*/...`) are deliberately not matched
// here; they only ever resolve to external URLs and are handled by
// `rewrite_external_links`.
static RC_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)rc://[a-z0-9/_-]+").unwrap());

/// Scan `text` for `rc://` tokens, interning every new one into `arena`.
///
/// Unresolved tokens load their entry file from the corresponding
/// downloaded resource directory (`<working>/<lang>_<kind>/...`) and the
/// loaded text is scanned in turn. A token whose file cannot be found
/// (after the category-prefix fallback) is recorded in `bad_links` keyed
/// by token, with the referencing source tokens as values.
pub fn collect_references(
    text: &str,
    source_token: &str,
    working_dir: &Path,
    arena: &mut RcArena,
    bad_links: &mut std::collections::BTreeMap<String, Vec<String>>,
) {
    for token_match in RC_TOKEN.find_iter(text) {
        let token = token_match.as_str().to_string();
        arena.note_reference(&token, source_token);
        if arena.contains(&token) {
            continue;
        }

        let parts: Vec<&str> = token[5..].split('/').collect();
        if parts.len() < 4 {
            continue;
        }
        let lang_code = parts[0];
        let kind = parts[1];
        // parts[2] is the container segment (`dict`, `help`, `man`).
        let path = parts[3..].join("/");

        match helps::load_category_entry(working_dir, lang_code, kind, &path) {
            Some(entry) => {
                trace!("resolved {token} -> {}", entry.path);
                let body = entry.body.clone();
                let _ = arena.insert(RcEntry {
                    token: token.clone(),
                    kind: kind.to_string(),
                    anchor: format!("{}-{}", kind, entry.path.replace('/', "-")),
                    title: entry.title,
                    body: entry.body,
                    inline: matches!(kind, "tw" | "ta"),
                    references: vec![source_token.to_string()],
                });
                collect_references(&body, &token, working_dir, arena, bad_links);
            }
            None => {
                trace!("broken reference {token} (from {source_token})");
                bad_links
                    .entry(token.clone())
                    .or_default()
                    .push(source_token.to_string());
                // The anchor link is still produced, pointing nowhere
                // better than its would-be location.
                let _ = arena.insert(RcEntry {
                    token: token.clone(),
                    kind: kind.to_string(),
                    anchor: format!("{}-{}", kind, path.replace('/', "-")),
                    title: String::new(),
                    body: String::new(),
                    inline: false,
                    references: vec![source_token.to_string()],
                });
            }
        }
    }
}

static RC_WIKI_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\[(rc://[a-z0-9/_-]+)\]\]").unwrap());
static RC_MD_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\]\((rc://[a-z0-9/_-]+)\)").unwrap());

/// Rewrite every resolvable `rc://` token in `text` to an intra-document
/// link, then turn the remaining reference forms into external URLs.
/// Running this on its own output is a no-op.
pub fn rewrite(text: &str, arena: &RcArena) -> String {
    // [[rc://...]] -> [title](#anchor)
    let text = RC_WIKI_LINK.replace_all(text, |caps: &Captures<'_>| {
        match arena.get(&caps[1]) {
            Some(entry) => format!("[{}]({})", entry.title.trim(), entry.link()),
            None => caps[0].to_string(),
        }
    });
    // [text](rc://...) -> [text](#anchor)
    let text = RC_MD_LINK.replace_all(&text, |caps: &Captures<'_>| {
        match arena.get(&caps[1]) {
            Some(entry) => format!("]({})", entry.link()),
            None => caps[0].to_string(),
        }
    });
    // bare rc://... -> [title](#anchor)
    let text = RC_TOKEN.replace_all(&text, |caps: &Captures<'_>| {
        match arena.get(&caps[0]) {
            Some(entry) => format!("[{}]({})", entry.title.trim(), entry.link()),
            None => caps[0].to_string(),
        }
    });
    rewrite_external_links(&text)
}

static OBS_STORY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)rc://[^/\s]+/tn/help/obs/(\d+)/(\d+)").unwrap());
static TN_SCRIPTURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)rc://[^/\s]+/tn/help/([a-z0-9]+)/(\d+)/(\d+)").unwrap());
static RC_GENERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)rc://([^/\s]+)/([^/\s]+)/([^/\s]+)/([^\s\)\]]+)").unwrap());
static BARE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^"\(\[])((?:http|https|ftp)://[A-Za-z0-9/\?&_\.:=#-]+[A-Za-z0-9/\?&_:=#-])"#)
        .unwrap()
});
static BARE_WWW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^A-Za-z0-9"\(\[/])(www\.[A-Za-z0-9/\?&_\.:=#-]+[A-Za-z0-9/\?&_:=#-])"#).unwrap()
});

/// Convert the reference forms that point outside the document into
/// canonical URLs and make naked URLs clickable.
pub fn rewrite_external_links(text: &str) -> String {
    // Story references, e.g. rc://*/tn/help/obs/15/07.
    let text = OBS_STORY.replace_all(text, |caps: &Captures<'_>| {
        format!(
            "https://live.door43.org/u/Door43/en_obs/b9c4f076ff/{}.html",
            &caps[1]
        )
    });
    // Scripture references, e.g. rc://*/tn/help/rev/15/07. The HTML file
    // uses the USFM book number while the anchor uses standard numbering,
    // which sits one lower for New Testament books.
    let text = TN_SCRIPTURE.replace_all(&text, |caps: &Captures<'_>| {
        let book = caps[1].to_lowercase();
        let Some(number) = books::book_number(&book) else {
            return caps[0].to_string();
        };
        let anchor_number = if number > 40 { number - 1 } else { number };
        let chapter: u32 = caps[2].parse().unwrap_or(0);
        let verse: u32 = caps[3].parse().unwrap_or(0);
        format!(
            "https://live.door43.org/u/Door43/en_ulb/c0bd11bad0/{:02}-{}.html#{:03}-ch-{:03}-v-{:03}",
            number,
            book.to_uppercase(),
            anchor_number,
            chapter,
            verse
        )
    });
    // Everything else that still looks like a repository reference.
    let text = RC_GENERIC.replace_all(&text, |caps: &Captures<'_>| {
        if &caps[2] == "tn" {
            return caps[0].to_string();
        }
        format!(
            "https://git.door43.org/Door43/{}_{}/src/master/{}.md",
            &caps[1], &caps[2], &caps[4]
        )
    });
    // Naked URLs become markdown links if not already inside one.
    let text = BARE_URL.replace_all(&text, "${1}[${2}](${2})");
    BARE_WWW
        .replace_all(&text, "${1}[${2}](http://${2})")
        .into_owned()
}

/// Markdown "Uses:" section appended to an inline entry, listing the notes
/// that referenced it.
pub fn uses_section(entry: &RcEntry) -> String {
    let mut references: Vec<&String> = entry
        .references
        .iter()
        .filter(|token| token.contains("/tn/"))
        .collect();
    references.sort();
    references.dedup();
    if references.is_empty() {
        return String::new();
    }
    let mut md = String::from("### Uses:\n\n");
    for token in references {
        md.push_str(&format!("* [[{token}]]\n"));
    }
    md.push('\n');
    md
}
