//! Assembles populated resources into one HTML document.
//!
//! The outer order comes from the strategy (language-then-book or
//! book-then-language), the inner interleaving from the chunk size (book,
//! chapter or verse boundaries), and the column arrangement from the
//! layout. The caller's request order is the sole tie-breaker everywhere;
//! nothing is reordered by completion time.

use std::collections::HashSet;

use chrono::Utc;
use handlebars::Handlebars;
use pulldown_cmark::{Options, Parser, html};
use serde_json::json;
use tracing::{debug, info};

use crate::books;
use crate::config::{AssemblyConfig, ChunkSize, Layout, Strategy};
use crate::errors::Error;
use crate::helps::{self, Doc};
use crate::links;
use crate::resource::{Resource, ResourceKind, ResourceRequest};
use crate::usfm::{self, ScriptureTree};

/// The default stylesheet inlined into every document.
pub const DEFAULT_CSS: &str = include_str!("master.css");
const DOCUMENT_TEMPLATE: &str = include_str!("document.hbs");

pub struct Assembler<'a> {
    resources: &'a [Resource],
    unfulfilled: &'a [ResourceRequest],
    config: &'a AssemblyConfig,
    hbs: Handlebars<'static>,
}

/// One interleaving unit: the resources that share a book (and, under
/// language-first ordering, a language).
struct Leaf<'a> {
    title: String,
    anchor: String,
    resources: Vec<&'a Resource>,
}

impl<'a> Assembler<'a> {
    pub fn new(
        resources: &'a [Resource],
        unfulfilled: &'a [ResourceRequest],
        config: &'a AssemblyConfig,
    ) -> Result<Assembler<'a>, Error> {
        let mut hbs = Handlebars::new();
        hbs.register_template_string("document", DOCUMENT_TEMPLATE)
            .map_err(|_| Error::TemplateParse)?;
        Ok(Assembler {
            resources,
            unfulfilled,
            config,
            hbs,
        })
    }

    pub fn assemble(&self) -> Result<String, Error> {
        info!(
            "Assembling {} resource(s), {} unfulfilled",
            self.resources.len(),
            self.unfulfilled.len()
        );
        let has_scripture = self
            .resources
            .iter()
            .any(|r| r.content.scripture().is_some());
        if self.config.chunk_size == ChunkSize::Verse && !has_scripture {
            return Err(Error::Assembler(
                "verse granularity requires at least one scripture resource".to_string(),
            ));
        }

        let leaves = self.leaves();
        debug!("Document has {} leaf group(s)", leaves.len());

        let mut body = String::new();
        body.push_str(&self.cover_page());
        body.push_str(&self.toc(&leaves));
        for leaf in &leaves {
            body.push_str(&self.render_leaf(leaf));
        }

        let mut classes = vec![match self.config.layout {
            Layout::OneColumn => "one-column",
            Layout::OneColumnCompact => "one-column compact",
            Layout::TwoColumnSlSr => "two-column",
            Layout::TwoColumnSlSrCompact => "two-column compact",
        }
        .to_string()];
        if self.config.layout_for_print {
            classes.push("print".to_string());
        }

        let ctx = json!({
            "title": self.document_title(),
            "body": body,
            "body_class": classes.join(" "),
            "stylesheet": DEFAULT_CSS,
        });
        Ok(self.hbs.render("document", &ctx)?)
    }

    fn document_title(&self) -> String {
        let mut titles: Vec<String> = self
            .resources
            .iter()
            .filter_map(|r| r.book_title.clone())
            .collect();
        titles.dedup();
        if titles.is_empty() {
            "Interleaved Resources".to_string()
        } else {
            format!("Interleaved Resources: {}", titles.join(", "))
        }
    }

    fn cover_page(&self) -> String {
        let mut out = String::from("<section class=\"cover\" id=\"cover\">\n");
        out.push_str(&format!("<h1>{}</h1>\n", usfm::escape_html(&self.document_title())));
        out.push_str(&format!(
            "<p class=\"generated\">Generated {}</p>\n",
            Utc::now().to_rfc3339()
        ));
        out.push_str("<h2>Requested resources</h2>\n<ul>\n");
        for resource in self.resources {
            out.push_str(&format!(
                "<li>{}</li>\n",
                usfm::escape_html(&resource.request.to_string())
            ));
        }
        for request in self.unfulfilled {
            out.push_str(&format!(
                "<li class=\"unfulfilled\">{} (unfulfilled)</li>\n",
                usfm::escape_html(&request.to_string())
            ));
        }
        out.push_str("</ul>\n");
        if !self.unfulfilled.is_empty() {
            out.push_str("<p class=\"unfulfilled-note\">Some requested resources could not be included; see the list above.</p>\n");
        }
        out.push_str("</section>\n");
        out
    }

    fn toc(&self, leaves: &[Leaf<'a>]) -> String {
        if leaves.is_empty() {
            return String::new();
        }
        let mut out = String::from("<nav class=\"toc\">\n<h2>Contents</h2>\n<ul>\n");
        for leaf in leaves {
            out.push_str(&format!(
                "<li><a href=\"#{}\">{}</a></li>\n",
                leaf.anchor,
                usfm::escape_html(&leaf.title)
            ));
        }
        out.push_str("</ul>\n</nav>\n");
        out
    }

    /// Build the interleaving units in presentation order.
    fn leaves(&self) -> Vec<Leaf<'a>> {
        let with_book: Vec<&Resource> = self
            .resources
            .iter()
            .filter(|r| !matches!(r.content, crate::resource::Content::Empty))
            .collect();

        match self.config.strategy {
            Strategy::LanguageBookOrder => {
                let mut leaves = Vec::new();
                for lang in dedup_in_order(with_book.iter().map(|r| r.request.lang_code.as_str()))
                {
                    let of_lang: Vec<&Resource> = with_book
                        .iter()
                        .copied()
                        .filter(|r| r.request.lang_code == lang)
                        .collect();
                    for book in books_in_number_order(&of_lang) {
                        let members: Vec<&Resource> = of_lang
                            .iter()
                            .copied()
                            .filter(|r| r.book_or_request_id() == book)
                            .collect();
                        leaves.push(Leaf {
                            title: format!("{} ({})", book_label(&members, &book), lang),
                            anchor: format!("doc-{lang}-{book}"),
                            resources: members,
                        });
                    }
                }
                leaves
            }
            Strategy::BookLanguageOrder => {
                let mut leaves = Vec::new();
                for book in books_in_number_order(&with_book) {
                    let mut members: Vec<&Resource> = Vec::new();
                    for lang in
                        dedup_in_order(with_book.iter().map(|r| r.request.lang_code.as_str()))
                    {
                        members.extend(with_book.iter().copied().filter(|r| {
                            r.request.lang_code == lang && r.book_or_request_id() == book
                        }));
                    }
                    leaves.push(Leaf {
                        title: book_label(&members, &book),
                        anchor: format!("doc-{book}"),
                        resources: members,
                    });
                }
                leaves
            }
        }
    }

    fn render_leaf(&self, leaf: &Leaf<'a>) -> String {
        let mut out = format!(
            "<section class=\"leaf\" id=\"{}\">\n<h2 class=\"leaf-title\">{}</h2>\n",
            leaf.anchor,
            usfm::escape_html(&leaf.title)
        );
        match self.config.chunk_size {
            ChunkSize::Book => out.push_str(&self.render_by_book(leaf)),
            ChunkSize::Chapter => out.push_str(&self.render_by_chapter(leaf)),
            ChunkSize::Verse => {
                let has_scripture = leaf
                    .resources
                    .iter()
                    .any(|r| r.content.scripture().is_some());
                if has_scripture {
                    out.push_str(&self.render_by_verse(leaf));
                } else {
                    // No verse boundaries to key off; this unit degrades
                    // to chapter interleaving.
                    out.push_str(&self.render_by_chapter(leaf));
                }
            }
        }
        out.push_str(&self.render_reference_sections(leaf));
        out.push_str("</section>\n");
        out
    }

    // -- granularity: book ------------------------------------------------

    fn render_by_book(&self, leaf: &Leaf<'a>) -> String {
        let mut out = String::new();
        let scriptures = scripture_resources(leaf);
        for pair in scriptures.chunks(2) {
            out.push_str(&self.scripture_columns(pair, |resource, tree| {
                let mut block = usfm::render_header_html(&tree.header, book_title(resource));
                for (&chapter, chapter_block) in &tree.chapters {
                    block.push_str(&anchor(&scripture_anchor(resource, chapter, None)));
                    for chunk in &chapter_block.chunks {
                        block.push_str(&usfm::render_chunk_html(chunk, book_title(resource)));
                    }
                }
                block
            }));
        }
        for resource in helps_resources(leaf) {
            if let Some(tree) = resource.content.helps() {
                out.push_str(&self.helps_block(resource, |out| {
                    if let Some(intro) = &tree.book_intro {
                        out.push_str(&doc_html(intro));
                    }
                    for chapter in tree.chapters.values() {
                        if let Some(intro) = &chapter.intro {
                            out.push_str(&doc_html(intro));
                        }
                        for doc in chapter.by_verse.values() {
                            out.push_str(&doc_html(doc));
                        }
                    }
                }));
            }
        }
        out
    }

    // -- granularity: chapter ---------------------------------------------

    fn render_by_chapter(&self, leaf: &Leaf<'a>) -> String {
        let mut out = String::new();
        let chapters = chapter_union(leaf);
        for (index, &chapter) in chapters.iter().enumerate() {
            if index > 0 && !self.config.layout.is_compact() {
                out.push_str("<hr class=\"granule-sep\"/>\n");
            }
            let scriptures = scripture_resources(leaf);
            for pair in scriptures.chunks(2) {
                out.push_str(&self.scripture_columns(pair, |resource, tree| {
                    let Some(chapter_block) = tree.chapters.get(&chapter) else {
                        return String::new();
                    };
                    let mut block = String::new();
                    if Some(&chapter) == tree.chapters.keys().next() {
                        block.push_str(&usfm::render_header_html(&tree.header, book_title(resource)));
                    }
                    block.push_str(&anchor(&scripture_anchor(resource, chapter, None)));
                    for chunk in &chapter_block.chunks {
                        block.push_str(&usfm::render_chunk_html(chunk, book_title(resource)));
                    }
                    block
                }));
            }
            for resource in helps_resources(leaf) {
                if let Some(tree) = resource.content.helps() {
                    out.push_str(&self.helps_block(resource, |block| {
                        if Some(&chapter) == tree.chapters.keys().next() {
                            if let Some(intro) = &tree.book_intro {
                                block.push_str(&doc_html(intro));
                            }
                        }
                        if let Some(parsed) = tree.chapters.get(&chapter) {
                            if let Some(intro) = &parsed.intro {
                                block.push_str(&doc_html(intro));
                            }
                            for doc in parsed.by_verse.values() {
                                block.push_str(&doc_html(doc));
                            }
                        }
                    }));
                }
            }
        }
        out
    }

    // -- granularity: verse -----------------------------------------------

    fn render_by_verse(&self, leaf: &Leaf<'a>) -> String {
        let mut out = String::new();
        let chapters = chapter_union(leaf);
        let mut first_granule = true;
        for &chapter in &chapters {
            let boundaries = boundary_union(leaf, chapter);
            // Intros come ahead of the first boundary of their chapter.
            for resource in helps_resources(leaf) {
                if let Some(tree) = resource.content.helps() {
                    let is_first_chapter = Some(&chapter) == tree.chapters.keys().next();
                    let intro_docs: Vec<&Doc> = {
                        let mut docs = Vec::new();
                        if is_first_chapter {
                            docs.extend(tree.book_intro.as_ref());
                        }
                        docs.extend(tree.chapters.get(&chapter).and_then(|c| c.intro.as_ref()));
                        docs
                    };
                    if !intro_docs.is_empty() {
                        out.push_str(&self.helps_block(resource, |block| {
                            for doc in intro_docs {
                                block.push_str(&doc_html(doc));
                            }
                        }));
                    }
                }
            }
            for &verse in &boundaries {
                if !first_granule && !self.config.layout.is_compact() {
                    out.push_str("<hr class=\"granule-sep\"/>\n");
                }
                first_granule = false;
                let scriptures = scripture_resources(leaf);
                for pair in scriptures.chunks(2) {
                    out.push_str(&self.scripture_columns(pair, |resource, tree| {
                        let Some(chunk) = tree
                            .chapters
                            .get(&chapter)
                            .and_then(|block| block.chunk_at(verse))
                        else {
                            // This resource has no chunk at this
                            // boundary; it contributes nothing here.
                            return String::new();
                        };
                        let mut block = String::new();
                        let first_chapter = tree.chapters.keys().next().copied();
                        if first_chapter == Some(chapter)
                            && tree.boundaries(chapter).first() == Some(&chunk.first_verse)
                        {
                            block.push_str(&usfm::render_header_html(&tree.header, book_title(resource)));
                        }
                        block.push_str(&anchor(&scripture_anchor(resource, chapter, Some(verse))));
                        block.push_str(&usfm::render_chunk_html(chunk, book_title(resource)));
                        block
                    }));
                }
                for resource in helps_resources(leaf) {
                    if let Some(tree) = resource.content.helps() {
                        let doc = tree
                            .chapters
                            .get(&chapter)
                            .and_then(|parsed| parsed.by_verse.get(&verse));
                        if let Some(doc) = doc {
                            out.push_str(&self.helps_block(resource, |block| {
                                block.push_str(&doc_html(doc));
                            }));
                        }
                    }
                }
            }
        }
        out
    }

    // -- shared pieces ----------------------------------------------------

    /// Lay a pair of scripture blocks out side by side when the layout
    /// asks for two columns; degrade to a single flow otherwise (including
    /// when the pair is just one resource).
    fn scripture_columns<F>(&self, pair: &[&'a Resource], render: F) -> String
    where
        F: Fn(&'a Resource, &'a ScriptureTree) -> String,
    {
        let rendered: Vec<String> = pair
            .iter()
            .filter_map(|&resource| {
                resource
                    .content
                    .scripture()
                    .map(|tree| render(resource, tree))
            })
            .filter(|block| !block.is_empty())
            .collect();
        match (self.config.layout.is_two_column(), rendered.as_slice()) {
            (true, [left, right]) => format!(
                "<div class=\"row\">\n<div class=\"column\">\n{left}</div>\n<div class=\"column\">\n{right}</div>\n</div>\n"
            ),
            _ => rendered.concat(),
        }
    }

    /// Helps always flow full-width below the scripture of their granule.
    fn helps_block<F>(&self, resource: &Resource, fill: F) -> String
    where
        F: FnOnce(&mut String),
    {
        let mut inner = String::new();
        fill(&mut inner);
        if inner.is_empty() {
            return String::new();
        }
        format!(
            "<div class=\"helps {}\">\n<h3 class=\"resource-heading\">{}</h3>\n{inner}</div>\n",
            resource.kind.anchor_tag(),
            resource.kind.heading()
        )
    }

    /// Words and topics referenced anywhere in this unit's resources,
    /// rendered full width after the interleaved content.
    fn render_reference_sections(&self, leaf: &Leaf<'a>) -> String {
        let mut out = String::new();
        let book = leaf
            .resources
            .first()
            .map(|r| r.book_or_request_id().to_string())
            .unwrap_or_default();
        let mut seen: HashSet<String> = HashSet::new();

        for (kind, section_anchor, heading) in [
            (ResourceKind::Words, format!("tw-{book}"), "Translation Words"),
            (ResourceKind::Academy, format!("ta-{book}"), "Translation Topics"),
        ] {
            let mut entries_md = String::new();
            for resource in &leaf.resources {
                for entry in resource.arena.inline_entries(kind.anchor_tag()) {
                    if !seen.insert(entry.anchor.clone()) {
                        continue;
                    }
                    let mut md = with_anchor_after_first_header(&entry.body, &entry.anchor);
                    md = helps::increase_headers(&md, 1);
                    if kind == ResourceKind::Words {
                        md = helps::remove_md_section(&md, "Bible References");
                        md = helps::remove_md_section(&md, "Examples from the Bible stories");
                    }
                    md.push_str(&links::uses_section(entry));
                    md.push_str("\n\n");
                    entries_md.push_str(&links::rewrite(&md, &resource.arena));
                }
            }
            if !entries_md.is_empty() {
                out.push_str(&format!(
                    "<div class=\"helps {}\">\n{}<h2>{heading}</h2>\n{}</div>\n",
                    kind.anchor_tag(),
                    anchor(&section_anchor),
                    md_to_html(&entries_md)
                ));
            }
        }
        out
    }
}

/// Convert a markdown fragment to HTML the way every fragment in the
/// document is converted.
pub fn md_to_html(md: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    let parser = Parser::new_ext(md, options);
    let mut out = String::with_capacity(md.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

fn doc_html(doc: &Doc) -> String {
    format!("{}{}", anchor(&doc.anchor), md_to_html(&doc.body))
}

fn anchor(id: &str) -> String {
    format!("<a id=\"{id}\"></a>\n")
}

fn with_anchor_after_first_header(md: &str, anchor_id: &str) -> String {
    static FIRST_HEADER_LINE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"# ([^\n]+)\n").unwrap());
    if FIRST_HEADER_LINE.is_match(md) {
        FIRST_HEADER_LINE
            .replace(md, format!("# $1\n<a id=\"{anchor_id}\"></a>\n"))
            .into_owned()
    } else {
        format!("<a id=\"{anchor_id}\"></a>\n{md}")
    }
}

fn scripture_anchor(resource: &Resource, chapter: u32, verse: Option<u32>) -> String {
    let book = resource.book_or_request_id();
    let padded_chapter = books::pad(book, chapter);
    match verse {
        Some(v) => format!(
            "{}-{}-{}-{}",
            resource.request.resource_type,
            book,
            padded_chapter,
            books::pad(book, v)
        ),
        None => format!("{}-{}-{}", resource.request.resource_type, book, padded_chapter),
    }
}

fn book_title(resource: &Resource) -> &str {
    resource
        .book_title
        .as_deref()
        .unwrap_or_else(|| resource.book_or_request_id())
}

fn scripture_resources<'a>(leaf: &Leaf<'a>) -> Vec<&'a Resource> {
    leaf.resources
        .iter()
        .copied()
        .filter(|r| r.content.scripture().is_some())
        .collect()
}

fn helps_resources<'a>(leaf: &Leaf<'a>) -> Vec<&'a Resource> {
    leaf.resources
        .iter()
        .copied()
        .filter(|r| r.content.helps().is_some())
        .collect()
}

fn dedup_in_order<'a>(items: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    items.filter(|item| seen.insert(item.to_string())).collect()
}

/// Book ids present in the group, ordered by book number (unknown books
/// last, in request order).
fn books_in_number_order(resources: &[&Resource]) -> Vec<String> {
    let mut ids: Vec<(u8, String)> = Vec::new();
    for resource in resources {
        let id = resource.book_or_request_id().to_string();
        let number = resource.book_number.unwrap_or(u8::MAX);
        if !ids.iter().any(|(_, existing)| *existing == id) {
            ids.push((number, id));
        }
    }
    ids.sort_by(|a, b| a.0.cmp(&b.0));
    ids.into_iter().map(|(_, id)| id).collect()
}

fn book_label(members: &[&Resource], book: &str) -> String {
    members
        .iter()
        .find_map(|r| r.book_title.clone())
        .unwrap_or_else(|| book.to_uppercase())
}

/// Union of the chapters addressed by any resource in the unit, numeric
/// order.
fn chapter_union(leaf: &Leaf<'_>) -> Vec<u32> {
    let mut chapters: Vec<u32> = leaf
        .resources
        .iter()
        .flat_map(|r| {
            if let Some(tree) = r.content.scripture() {
                tree.chapters.keys().copied().collect::<Vec<u32>>()
            } else if let Some(tree) = r.content.helps() {
                tree.chapters.keys().copied().collect()
            } else {
                Vec::new()
            }
        })
        .collect();
    chapters.sort_unstable();
    chapters.dedup();
    chapters
}

/// Union of scripture first-verse boundaries for a chapter, numeric order.
fn boundary_union(leaf: &Leaf<'_>, chapter: u32) -> Vec<u32> {
    let mut verses: Vec<u32> = leaf
        .resources
        .iter()
        .filter_map(|r| r.content.scripture())
        .flat_map(|tree| tree.boundaries(chapter))
        .collect();
    verses.sort_unstable();
    verses.dedup();
    verses
}
