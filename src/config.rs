use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resource::ResourceRequest;

const DEFAULT_CATALOG_URL: &str =
    "https://bibleineverylanguage.org/wp-content/themes/bb-theme-child/data/translations.json";
const DEFAULT_WORKING_DIR: &str = "/working/tn-temp";

/// Process-level configuration, sourced from the environment once at
/// startup and carried through the pipeline in the [`Context`].
///
/// [`Context`]: crate::pipeline::Context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Where resources are downloaded and unpacked, one subdirectory per
    /// `(lang_code, resource_type)` pair, plus the cached catalog.
    pub working_dir: PathBuf,
    /// Where finished documents are written. Defaults to the working dir.
    pub output_dir: PathBuf,
    pub catalog_url: String,
    /// How old the cached catalog may grow before it is re-downloaded.
    pub catalog_stale_after: Duration,
    /// Upper bound on concurrent outbound fetches.
    pub fetch_workers: usize,
    pub fetch_timeout: Duration,
    pub parse_timeout: Duration,
    pub assemble_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Settings {
        let working_dir = PathBuf::from(
            env::var("INTERDOC_WORKING_DIR").unwrap_or_else(|_| DEFAULT_WORKING_DIR.to_string()),
        );
        let output_dir = env::var("INTERDOC_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| working_dir.clone());
        Settings {
            working_dir,
            output_dir,
            catalog_url: env::var("INTERDOC_CATALOG_URL")
                .unwrap_or_else(|_| DEFAULT_CATALOG_URL.to_string()),
            catalog_stale_after: Duration::from_secs(
                60 * env_u64("INTERDOC_CATALOG_STALENESS_MINUTES", 24 * 60),
            ),
            fetch_workers: env_u64("INTERDOC_FETCH_WORKERS", 8) as usize,
            fetch_timeout: Duration::from_secs(env_u64("INTERDOC_FETCH_TIMEOUT_SECS", 120)),
            parse_timeout: Duration::from_secs(env_u64("INTERDOC_PARSE_TIMEOUT_SECS", 30)),
            assemble_timeout: Duration::from_secs(env_u64("INTERDOC_ASSEMBLE_TIMEOUT_SECS", 120)),
        }
    }

    /// On-disk location of the cached catalog file.
    pub fn catalog_path(&self) -> PathBuf {
        let basename = self
            .catalog_url
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.catalog_url)
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("catalog.json");
        self.working_dir.join(basename)
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            working_dir: PathBuf::from(DEFAULT_WORKING_DIR),
            output_dir: PathBuf::from(DEFAULT_WORKING_DIR),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            catalog_stale_after: Duration::from_secs(24 * 60 * 60),
            fetch_workers: 8,
            fetch_timeout: Duration::from_secs(120),
            parse_timeout: Duration::from_secs(30),
            assemble_timeout: Duration::from_secs(120),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Outer interleaving order of the assembled document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Group by language (request order), then by book number.
    LanguageBookOrder,
    /// Group by book number, then by language (request order).
    BookLanguageOrder,
}

/// Column layout of each granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    OneColumn,
    OneColumnCompact,
    #[serde(rename = "two-column-sl-sr")]
    TwoColumnSlSr,
    #[serde(rename = "two-column-sl-sr-compact")]
    TwoColumnSlSrCompact,
}

impl Layout {
    pub fn is_two_column(self) -> bool {
        matches!(self, Layout::TwoColumnSlSr | Layout::TwoColumnSlSrCompact)
    }

    pub fn is_compact(self) -> bool {
        matches!(self, Layout::OneColumnCompact | Layout::TwoColumnSlSrCompact)
    }
}

/// Granularity at which resources are interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkSize {
    Book,
    Chapter,
    Verse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AssemblyConfig {
    pub strategy: Strategy,
    pub layout: Layout,
    pub chunk_size: ChunkSize,
    pub layout_for_print: bool,
    pub generate_pdf: bool,
    pub generate_epub: bool,
    pub generate_docx: bool,
}

impl Default for AssemblyConfig {
    fn default() -> AssemblyConfig {
        AssemblyConfig {
            strategy: Strategy::LanguageBookOrder,
            layout: Layout::OneColumn,
            chunk_size: ChunkSize::Chapter,
            layout_for_print: false,
            generate_pdf: false,
            generate_epub: false,
            generate_docx: false,
        }
    }
}

/// The full incoming request: an ordered list of resource requests plus the
/// assembly configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DocumentRequest {
    pub resources: Vec<ResourceRequest>,
    #[serde(default)]
    pub assembly: AssemblyConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn settings_fall_back_to_defaults() {
        // The INTERDOC_* variables are not set in the test environment.
        let settings = Settings::from_env();
        assert_eq!(settings.fetch_workers, 8);
        assert_eq!(settings.catalog_stale_after, Duration::from_secs(24 * 60 * 60));
        assert_eq!(settings.output_dir, settings.working_dir);
    }

    #[test]
    #[serial]
    fn settings_read_the_environment() {
        unsafe {
            env::set_var("INTERDOC_WORKING_DIR", "/tmp/interdoc-test");
            env::set_var("INTERDOC_FETCH_WORKERS", "3");
            env::set_var("INTERDOC_CATALOG_STALENESS_MINUTES", "30");
        }
        let settings = Settings::from_env();
        unsafe {
            env::remove_var("INTERDOC_WORKING_DIR");
            env::remove_var("INTERDOC_FETCH_WORKERS");
            env::remove_var("INTERDOC_CATALOG_STALENESS_MINUTES");
        }
        assert_eq!(settings.working_dir, PathBuf::from("/tmp/interdoc-test"));
        assert_eq!(settings.output_dir, PathBuf::from("/tmp/interdoc-test"));
        assert_eq!(settings.fetch_workers, 3);
        assert_eq!(settings.catalog_stale_after, Duration::from_secs(30 * 60));
    }

    #[test]
    fn catalog_path_uses_the_url_basename() {
        let settings = Settings::default();
        assert_eq!(
            settings.catalog_path(),
            PathBuf::from(DEFAULT_WORKING_DIR).join("translations.json")
        );
    }

    #[test]
    fn assembly_config_round_trips_kebab_case() {
        let json = r#"{
            "strategy": "book-language-order",
            "layout": "two-column-sl-sr",
            "chunk-size": "verse",
            "layout-for-print": true,
            "generate-pdf": true
        }"#;
        let config: AssemblyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.strategy, Strategy::BookLanguageOrder);
        assert_eq!(config.layout, Layout::TwoColumnSlSr);
        assert_eq!(config.chunk_size, ChunkSize::Verse);
        assert!(config.layout_for_print);
        assert!(config.generate_pdf);
        assert!(!config.generate_epub);
    }
}
