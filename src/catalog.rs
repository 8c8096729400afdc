use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, trace};

use crate::errors::Error;
use crate::resource::{AssetLocator, ResourceKind, ResourceRequest};

/// One language entry of the catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub contents: Vec<CatalogContent>,
}

/// A resource (or sub-resource) available for a language.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogContent {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub links: Vec<CatalogLink>,
    #[serde(default)]
    pub subcontents: Vec<CatalogContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogLink {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// The parsed catalog plus the handful of query shapes the pipeline needs.
///
/// The catalog is a JSON array of languages; each language carries
/// `contents` (resources), each resource optionally carries `subcontents`
/// (books), and every level carries `links` (`{format, url}`). The original
/// data is queried with JSONPath selectors of the
/// `$[?code='x'].contents[?code='y']...` family; the methods below are those
/// selectors written out by hand.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Catalog, Error> {
        debug!("Loading catalog from {}", path.display());
        let file = File::open(path)
            .map_err(|e| Error::Catalog(format!("cannot open {}: {e}", path.display())))?;
        let entries: Vec<CatalogEntry> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Catalog(format!("cannot parse {}: {e}", path.display())))?;
        debug!("Catalog holds {} languages", entries.len());
        Ok(Catalog { entries })
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Catalog {
        Catalog { entries }
    }

    /// Resolve a request to asset locations.
    ///
    /// Tries the selector templates in a fixed order and stops at the first
    /// non-empty result:
    ///
    /// 1. scripture with a book code: the book's `usfm` link,
    /// 2. the resource's `zip` link at language level,
    /// 3. the resource's `zip` link one level down (sub-contents),
    /// 4. the book's `Download` link, whose `repo_url` query parameter
    ///    names a git repository.
    ///
    /// Duplicate URLs collapse onto their first occurrence in document
    /// order, so a request that matches several catalog rows resolves to
    /// the row the catalog lists first.
    pub fn lookup(&self, request: &ResourceRequest) -> Vec<AssetLocator> {
        let kind = ResourceKind::from_resource_type(&request.resource_type);
        let mut urls: Vec<String> = Vec::new();

        if kind.is_scripture() && !request.book_code.is_empty() {
            urls = self.usfm_urls(request);
            trace!("usfm template for {request}: {} hit(s)", urls.len());
        }
        if urls.is_empty() {
            urls = self.language_level_zip_urls(request);
            trace!("language-level zip template for {request}: {} hit(s)", urls.len());
        }
        if urls.is_empty() {
            urls = self.sublanguage_level_zip_urls(request);
            trace!("sub-language zip template for {request}: {} hit(s)", urls.len());
        }
        if urls.is_empty() && !request.book_code.is_empty() {
            urls = self.download_repo_urls(request);
            trace!("download template for {request}: {} hit(s)", urls.len());
        }

        dedup_in_order(&mut urls);
        urls.iter().map(|url| AssetLocator::from_url(url)).collect()
    }

    /// `$[?code=lang].contents[?code=rt].subcontents[?code=book]
    ///   .links[?format='usfm'].url`
    fn usfm_urls(&self, request: &ResourceRequest) -> Vec<String> {
        self.languages(&request.lang_code)
            .flat_map(|entry| contents_with_code(&entry.contents, &request.resource_type))
            .flat_map(|content| contents_with_code(&content.subcontents, &request.book_code))
            .flat_map(|sub| links_with_format(&sub.links, "usfm"))
            .collect()
    }

    /// `$[?code=lang].contents[?code=rt].links[?format='zip'].url`
    fn language_level_zip_urls(&self, request: &ResourceRequest) -> Vec<String> {
        self.languages(&request.lang_code)
            .flat_map(|entry| contents_with_code(&entry.contents, &request.resource_type))
            .flat_map(|content| links_with_format(&content.links, "zip"))
            .collect()
    }

    /// `$[?code=lang].contents[*].subcontents[?code=rt].links[?format='zip'].url`
    fn sublanguage_level_zip_urls(&self, request: &ResourceRequest) -> Vec<String> {
        self.languages(&request.lang_code)
            .flat_map(|entry| entry.contents.iter())
            .flat_map(|content| contents_with_code(&content.subcontents, &request.resource_type))
            .flat_map(|sub| links_with_format(&sub.links, "zip"))
            .collect()
    }

    /// `$[?code=lang].contents[?code=rt].subcontents[?code=book]
    ///   .links[?format='Download'].url`, unwrapping the `repo_url`
    /// query parameter each hit carries.
    fn download_repo_urls(&self, request: &ResourceRequest) -> Vec<String> {
        self.languages(&request.lang_code)
            .flat_map(|entry| contents_with_code(&entry.contents, &request.resource_type))
            .flat_map(|content| contents_with_code(&content.subcontents, &request.book_code))
            .flat_map(|sub| links_with_format(&sub.links, "Download"))
            .filter_map(|url| repo_url_param(&url))
            .collect()
    }

    fn languages<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a CatalogEntry> {
        self.entries.iter().filter(move |entry| entry.code == code)
    }

    /// All language codes, deduplicated and sorted.
    pub fn language_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.entries.iter().map(|e| e.code.clone()).collect();
        codes.sort();
        codes.dedup();
        codes
    }

    /// All resource type codes, deduplicated and sorted.
    pub fn resource_types(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .entries
            .iter()
            .flat_map(|entry| entry.contents.iter())
            .map(|content| content.code.clone())
            .filter(|code| !code.is_empty())
            .collect();
        codes.sort();
        codes.dedup();
        codes
    }

    /// All book codes appearing under any resource, deduplicated and sorted.
    pub fn book_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .entries
            .iter()
            .flat_map(|entry| entry.contents.iter())
            .flat_map(|content| content.subcontents.iter())
            .map(|sub| sub.code.clone())
            .filter(|code| !code.is_empty())
            .collect();
        codes.sort();
        codes.dedup();
        codes
    }
}

fn contents_with_code<'a>(
    contents: &'a [CatalogContent],
    code: &'a str,
) -> impl Iterator<Item = &'a CatalogContent> {
    contents.iter().filter(move |content| content.code == code)
}

fn links_with_format(links: &[CatalogLink], format: &str) -> Vec<String> {
    links
        .iter()
        .filter(|link| link.format == format)
        .filter_map(|link| link.url.clone())
        .collect()
}

fn dedup_in_order(urls: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    urls.retain(|url| seen.insert(url.clone()));
}

/// Extract the percent-decoded `repo_url` query parameter from a
/// `Download`-format link.
fn repo_url_param(url: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "repo_url")
        .map(|(_, value)| value.into_owned())
}

/// Whether the on-disk catalog copy needs refreshing. A missing file is
/// always stale; an unreadable modification time is treated as stale.
pub fn is_stale(path: &Path, window: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return true;
    };
    let Ok(modified) = metadata.modified() else {
        return true;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > window,
        // Clock skew put the mtime in the future; keep the copy.
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        let json = serde_json::json!([
            {
                "code": "en",
                "name": "English",
                "contents": [
                    {
                        "code": "ulb-wa",
                        "links": [{"format": "zip", "url": "https://cdn.example.org/en/ulb.zip"}],
                        "subcontents": [
                            {
                                "code": "tit",
                                "links": [
                                    {"format": "usfm", "url": "https://cdn.example.org/en/57-TIT.usfm"},
                                    {"format": "pdf", "url": "https://cdn.example.org/en/57-TIT.pdf"}
                                ]
                            }
                        ]
                    },
                    {
                        "code": "tn-wa",
                        "links": [{"format": "zip", "url": "https://cdn.example.org/en/tn.zip"}]
                    }
                ]
            },
            {
                "code": "kbt",
                "contents": [
                    {
                        "code": "reg",
                        "subcontents": [
                            {
                                "code": "col",
                                "links": [{
                                    "format": "Download",
                                    "url": "../download-scripture?repo_url=https%3A%2F%2Fgit.example.org%2Fowner%2Fkbt_col_text_reg&book_name=Colossians"
                                }]
                            }
                        ]
                    }
                ]
            },
            {
                "code": "sw",
                "contents": [
                    {
                        "code": "udb",
                        "subcontents": [
                            {
                                "code": "ulb",
                                "links": [{"format": "zip", "url": "https://cdn.example.org/sw/ulb.zip"}]
                            }
                        ]
                    }
                ]
            }
        ]);
        let entries: Vec<CatalogEntry> = serde_json::from_value(json).unwrap();
        Catalog::from_entries(entries)
    }

    #[test]
    fn scripture_with_book_resolves_to_the_usfm_link() {
        let hits = catalog().lookup(&ResourceRequest::new("en", "ulb-wa", "tit"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://cdn.example.org/en/57-TIT.usfm");
        assert_eq!(hits[0].file_format, crate::resource::FileFormat::Usfm);
    }

    #[test]
    fn helps_resolve_to_the_language_level_zip() {
        let hits = catalog().lookup(&ResourceRequest::new("en", "tn-wa", "tit"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://cdn.example.org/en/tn.zip");
    }

    #[test]
    fn sub_language_zip_is_the_third_fallback() {
        let hits = catalog().lookup(&ResourceRequest::new("sw", "ulb", ""));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://cdn.example.org/sw/ulb.zip");
    }

    #[test]
    fn download_links_unwrap_the_repo_url() {
        let hits = catalog().lookup(&ResourceRequest::new("kbt", "reg", "col"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://git.example.org/owner/kbt_col_text_reg");
        assert_eq!(hits[0].file_format, crate::resource::FileFormat::Git);
    }

    #[test]
    fn unknown_language_resolves_to_nothing() {
        assert!(catalog().lookup(&ResourceRequest::new("llx", "ulb", "col")).is_empty());
    }

    #[test]
    fn enumerations_are_sorted_and_deduplicated() {
        let catalog = catalog();
        assert_eq!(catalog.language_codes(), vec!["en", "kbt", "sw"]);
        assert_eq!(catalog.resource_types(), vec!["reg", "tn-wa", "udb", "ulb-wa"]);
        assert_eq!(catalog.book_codes(), vec!["col", "tit", "ulb"]);
    }

    #[test]
    fn missing_file_is_stale() {
        assert!(is_stale(Path::new("/no/such/catalog.json"), Duration::from_secs(60)));
    }

    #[test]
    fn fresh_file_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translations.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(!is_stale(&path, Duration::from_secs(3600)));
        // Give coarse filesystem timestamps a moment to fall behind.
        std::thread::sleep(Duration::from_millis(20));
        assert!(is_stale(&path, Duration::from_secs(0)));
    }
}
