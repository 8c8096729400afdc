//! Shared fixture builders for the pipeline tests: an in-memory catalog,
//! a canned retriever and generators for zip/scripture payloads.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Once;

use tempfile::TempDir;

use interdoc::errors::Error;
use interdoc::fetch::ContentRetriever;
use interdoc::{Catalog, Context, Settings};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Serves canned bytes per URL; anything else is a 404.
pub struct MapRetriever {
    responses: HashMap<String, Vec<u8>>,
}

impl MapRetriever {
    pub fn new(responses: Vec<(&str, Vec<u8>)>) -> MapRetriever {
        MapRetriever {
            responses: responses
                .into_iter()
                .map(|(url, bytes)| (url.to_string(), bytes))
                .collect(),
        }
    }
}

impl ContentRetriever for MapRetriever {
    fn retrieve(&self, url: &str) -> Result<Vec<u8>, Error> {
        self.responses.get(url).cloned().ok_or(Error::Acquisition {
            url: url.to_string(),
            reason: "HTTP status 404".to_string(),
        })
    }
}

/// Build a zip archive holding the given `(path, content)` entries.
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        for (path, content) in files {
            writer
                .start_file(*path, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    buf.into_inner()
}

/// Generate a scripture file for `book_code` with the given number of
/// chapters and verses per chapter.
pub fn usfm_text(book_code: &str, title: &str, chapters: u32, verses: u32) -> String {
    let mut out = format!(
        "\\id {} Test Bible\n\\ide UTF-8\n\\h {title}\n\\toc1 {title}\n\\mt {title}\n",
        book_code.to_uppercase()
    );
    for chapter in 1..=chapters {
        out.push_str(&format!("\\s5\n\\c {chapter}\n\\p\n"));
        for verse in 1..=verses {
            if verse > 1 && verse % 3 == 1 {
                out.push_str("\\s5\n");
            }
            out.push_str(&format!(
                "\\v {verse} Words of chapter {chapter} verse {verse} in {title}.\n"
            ));
        }
    }
    out
}

/// A catalog covering the languages used across the tests.
pub fn test_catalog() -> Catalog {
    let json = serde_json::json!([
        {
            "code": "en",
            "name": "English",
            "contents": [
                {
                    "code": "ulb-wa",
                    "links": [],
                    "subcontents": [
                        {"code": "tit", "links": [{"format": "usfm", "url": "https://cdn.test/en/57-TIT.usfm"}]},
                        {"code": "col", "links": [{"format": "usfm", "url": "https://cdn.test/en/52-COL.usfm"}]}
                    ]
                },
                {"code": "tn-wa", "links": [{"format": "zip", "url": "https://cdn.test/en/tn.zip"}]},
                {"code": "tw", "links": [{"format": "zip", "url": "https://cdn.test/en/tw.zip"}]},
                {"code": "ta", "links": [{"format": "zip", "url": "https://cdn.test/en/ta.zip"}]}
            ]
        },
        {
            "code": "fr",
            "name": "French",
            "contents": [
                {
                    "code": "f10",
                    "links": [],
                    "subcontents": [
                        {"code": "col", "links": [{"format": "usfm", "url": "https://cdn.test/fr/52-COL.usfm"}]}
                    ]
                },
                {"code": "tn", "links": [{"format": "zip", "url": "https://cdn.test/fr/tn.zip"}]}
            ]
        },
        {
            "code": "sw",
            "contents": [
                {
                    "code": "ulb",
                    "links": [],
                    "subcontents": [
                        {"code": "col", "links": [{"format": "usfm", "url": "https://cdn.test/sw/52-COL.usfm"}]}
                    ]
                },
                {"code": "tn", "links": [{"format": "zip", "url": "https://cdn.test/sw/tn.zip"}]}
            ]
        }
    ]);
    let entries = serde_json::from_value(json).unwrap();
    Catalog::from_entries(entries)
}

/// A context wired to the test catalog and canned responses, rooted in a
/// fresh temp dir.
pub fn test_context(responses: Vec<(&str, Vec<u8>)>) -> (TempDir, Context) {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let settings = Settings {
        working_dir: tmp.path().to_path_buf(),
        output_dir: tmp.path().to_path_buf(),
        catalog_url: "https://cdn.test/translations.json".to_string(),
        ..Settings::default()
    };
    let ctx = Context::new(
        settings,
        test_catalog(),
        std::sync::Arc::new(MapRetriever::new(responses)),
    );
    (tmp, ctx)
}
