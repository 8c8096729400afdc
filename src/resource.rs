use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::helps::HelpsTree;
use crate::layout::ManifestKind;
use crate::links::RcArena;
use crate::usfm::ScriptureTree;

/// One entry of the incoming document request: a language, a resource type
/// and (usually) a single book. `book_code` is empty for whole-language
/// resources such as translation words.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceRequest {
    pub lang_code: String,
    pub resource_type: String,
    #[serde(default)]
    pub book_code: String,
}

impl ResourceRequest {
    pub fn new(lang_code: &str, resource_type: &str, book_code: &str) -> ResourceRequest {
        ResourceRequest {
            lang_code: lang_code.to_string(),
            resource_type: resource_type.to_string(),
            book_code: book_code.trim().to_lowercase(),
        }
    }

    /// Stable textual form, used for the document key and log lines.
    pub fn slug(&self) -> String {
        format!("{}-{}-{}", self.lang_code, self.resource_type, self.book_code)
    }
}

impl Display for ResourceRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.lang_code, self.resource_type, self.book_code
        )
    }
}

/// Parser selection tag. Everything that is not a recognized helps type is
/// treated as versified scripture; scripture resource types vary wildly
/// across languages (`ulb`, `ulb-wa`, `udb`, `reg`, `f10`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Scripture,
    Notes,
    Questions,
    Words,
    Academy,
    Commentary,
}

impl ResourceKind {
    pub fn from_resource_type(resource_type: &str) -> ResourceKind {
        let head = resource_type.split('-').next().unwrap_or(resource_type);
        match head {
            "tn" => ResourceKind::Notes,
            "tq" => ResourceKind::Questions,
            "tw" => ResourceKind::Words,
            "ta" => ResourceKind::Academy,
            "bc" => ResourceKind::Commentary,
            _ => ResourceKind::Scripture,
        }
    }

    pub fn is_scripture(self) -> bool {
        self == ResourceKind::Scripture
    }

    /// Short tag used in anchor ids, e.g. `tn-tit-01-04`.
    pub fn anchor_tag(self) -> &'static str {
        match self {
            ResourceKind::Scripture => "vs",
            ResourceKind::Notes => "tn",
            ResourceKind::Questions => "tq",
            ResourceKind::Words => "tw",
            ResourceKind::Academy => "ta",
            ResourceKind::Commentary => "bc",
        }
    }

    /// Human heading used when the resource's block is emitted.
    pub fn heading(self) -> &'static str {
        match self {
            ResourceKind::Scripture => "Scripture",
            ResourceKind::Notes => "Translation Notes",
            ResourceKind::Questions => "Translation Questions",
            ResourceKind::Words => "Translation Words",
            ResourceKind::Academy => "Translation Topics",
            ResourceKind::Commentary => "Commentary",
        }
    }
}

/// How the bytes behind an asset URL are packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Zip,
    Git,
    Usfm,
    Txt,
    Tsv,
    Md,
    Other,
}

/// A concrete location resolved from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLocator {
    pub url: String,
    pub file_format: FileFormat,
}

impl AssetLocator {
    /// Classify a URL by its suffix. A URL without a suffix is assumed to
    /// name a git repository.
    pub fn from_url(url: &str) -> AssetLocator {
        let basename = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .rsplit('/')
            .next()
            .unwrap_or(url);
        let file_format = match basename.rsplit_once('.') {
            Some((_, ext)) => match ext.to_ascii_lowercase().as_str() {
                "zip" => FileFormat::Zip,
                "usfm" => FileFormat::Usfm,
                "txt" => FileFormat::Txt,
                "tsv" => FileFormat::Tsv,
                "md" => FileFormat::Md,
                _ => FileFormat::Other,
            },
            None => FileFormat::Git,
        };
        AssetLocator {
            url: url.to_string(),
            file_format,
        }
    }

    /// Final path segment of the URL, used for on-disk naming.
    pub fn basename(&self) -> &str {
        self.url
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.url)
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.url)
    }
}

/// Parsed content of a fulfilled resource. `Empty` only exists while the
/// pipeline is still working on the resource; by assembly time every
/// surviving resource holds a tree (words/academy resources hold their
/// resolved entries in the [`RcArena`] instead and stay `Empty` here).
#[derive(Debug, Default)]
pub enum Content {
    #[default]
    Empty,
    Scripture(ScriptureTree),
    Helps(HelpsTree),
}

impl Content {
    pub fn scripture(&self) -> Option<&ScriptureTree> {
        match self {
            Content::Scripture(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn helps(&self) -> Option<&HelpsTree> {
        match self {
            Content::Helps(tree) => Some(tree),
            _ => None,
        }
    }
}

/// In-memory materialization of one fulfilled [`ResourceRequest`].
///
/// Created by the orchestrator, filled in by layout discovery, the parsers
/// and the link rewriter, then read-only during assembly.
#[derive(Debug)]
pub struct Resource {
    pub request: ResourceRequest,
    pub kind: ResourceKind,
    /// Directory the asset was unpacked into.
    pub dir: PathBuf,
    pub url: String,
    pub file_format: FileFormat,
    pub manifest_kind: Option<ManifestKind>,
    pub version: Option<String>,
    pub issued: Option<String>,
    pub book_id: Option<String>,
    pub book_title: Option<String>,
    pub book_number: Option<u8>,
    pub content_files: Vec<PathBuf>,
    pub content: Content,
    /// Resolved cross-reference entries produced by the link rewriter.
    pub arena: RcArena,
    /// Reference token -> tokens of the places that referenced it, for
    /// every reference that could not be resolved on disk.
    pub bad_links: BTreeMap<String, Vec<String>>,
}

impl Resource {
    pub fn new(request: ResourceRequest, working_dir: &Path, locator: &AssetLocator) -> Resource {
        let kind = ResourceKind::from_resource_type(&request.resource_type);
        let dir = working_dir.join(format!("{}_{}", request.lang_code, request.resource_type));
        Resource {
            request,
            kind,
            dir,
            url: locator.url.clone(),
            file_format: locator.file_format,
            manifest_kind: None,
            version: None,
            issued: None,
            book_id: None,
            book_title: None,
            book_number: None,
            content_files: Vec::new(),
            content: Content::Empty,
            arena: RcArena::default(),
            bad_links: BTreeMap::new(),
        }
    }

    /// The book id to use for anchors and titles: discovered id when layout
    /// discovery found one, the requested code otherwise.
    pub fn book_or_request_id(&self) -> &str {
        self.book_id.as_deref().unwrap_or(&self.request.book_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_derived_from_the_type_head() {
        assert_eq!(
            ResourceKind::from_resource_type("tn-wa"),
            ResourceKind::Notes
        );
        assert_eq!(ResourceKind::from_resource_type("tq"), ResourceKind::Questions);
        assert_eq!(ResourceKind::from_resource_type("tw"), ResourceKind::Words);
        assert_eq!(ResourceKind::from_resource_type("ta"), ResourceKind::Academy);
        assert_eq!(ResourceKind::from_resource_type("bc"), ResourceKind::Commentary);
        assert_eq!(
            ResourceKind::from_resource_type("ulb-wa"),
            ResourceKind::Scripture
        );
        assert_eq!(ResourceKind::from_resource_type("f10"), ResourceKind::Scripture);
    }

    #[test]
    fn locator_classifies_by_suffix() {
        assert_eq!(
            AssetLocator::from_url("https://cdn.example.org/en/ulb/v12/ulb.zip").file_format,
            FileFormat::Zip
        );
        assert_eq!(
            AssetLocator::from_url("https://cdn.example.org/en/ulb/57-TIT.usfm").file_format,
            FileFormat::Usfm
        );
        assert_eq!(
            AssetLocator::from_url("https://git.example.org/owner/en_ulb").file_format,
            FileFormat::Git
        );
        assert_eq!(
            AssetLocator::from_url("https://cdn.example.org/x.bin?sig=abc").file_format,
            FileFormat::Other
        );
    }

    #[test]
    fn locator_basename_ignores_queries() {
        let locator = AssetLocator::from_url("https://git.example.org/owner/en_ulb?x=1");
        assert_eq!(locator.basename(), "en_ulb");
    }

    #[test]
    fn request_normalizes_book_code() {
        let request = ResourceRequest::new("en", "ulb-wa", " TIT ");
        assert_eq!(request.book_code, "tit");
        assert_eq!(request.slug(), "en-ulb-wa-tit");
    }
}
