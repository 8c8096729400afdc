//! Turns an unpacked resource directory into a typed view the parsers can
//! consume: locate the manifest, pull version/date metadata out of it,
//! enumerate content files and settle the book identity.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::books;
use crate::errors::Error;
use crate::resource::{Resource, ResourceKind};

/// Which manifest dialect the resource shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ManifestKind {
    Yaml,
    Txt,
    Json,
}

/// Markdown stems that are repository documentation, not content.
const RESERVED_DOC_STEMS: &[&str] = &[
    "readme",
    "license",
    "licence",
    "contributing",
    "changelog",
    "code_of_conduct",
    "issue_template",
    "notice",
];

/// Discover the layout of a freshly acquired resource directory, filling
/// in the manifest metadata, content file list and book identity.
pub fn discover(resource: &mut Resource) -> Result<(), Error> {
    debug!("Discovering layout of {}", resource.dir.display());

    if let Some((path, kind)) = find_manifest(&resource.dir) {
        resource.manifest_kind = Some(kind);
        match read_manifest(&path, kind) {
            Ok(manifest) => {
                resource.version = manifest.version;
                resource.issued = manifest.issued;
                if resource.kind.is_scripture() && !resource.request.book_code.is_empty() {
                    apply_project_identity(resource, &manifest.projects);
                }
            }
            Err(e) => warn!("Unreadable manifest {}: {e}", path.display()),
        }
    }

    resource.content_files = content_files(resource);
    if resource.content_files.is_empty() {
        return Err(Error::Layout {
            dir: resource.dir.clone(),
            reason: "no content files matched".to_string(),
        });
    }

    if resource.book_id.is_none() {
        derive_book_identity(resource);
    }
    trace!(
        "layout of {}: book={:?} files={}",
        resource.request,
        resource.book_id,
        resource.content_files.len()
    );
    Ok(())
}

/// Locate `manifest.yaml`, `manifest.txt` or `manifest.json` anywhere in
/// the directory; the first one found (walking in sorted order) wins.
pub fn find_manifest(dir: &Path) -> Option<(PathBuf, ManifestKind)> {
    for entry in walk_files(dir) {
        if entry.file_stem().and_then(|s| s.to_str()) != Some("manifest") {
            continue;
        }
        let kind = match entry.extension().and_then(|e| e.to_str()) {
            Some("yaml") => ManifestKind::Yaml,
            Some("txt") => ManifestKind::Txt,
            Some("json") => ManifestKind::Json,
            _ => continue,
        };
        return Some((entry, kind));
    }
    None
}

#[derive(Debug, Default)]
struct ManifestData {
    version: Option<String>,
    issued: Option<String>,
    projects: Vec<ManifestProject>,
}

#[derive(Debug, Clone)]
struct ManifestProject {
    identifier: String,
    title: Option<String>,
}

fn read_manifest(path: &Path, kind: ManifestKind) -> Result<ManifestData, Error> {
    let raw = fs::read_to_string(path)?;
    let value: serde_yaml::Value = match kind {
        // manifest.txt files are YAML in disguise.
        ManifestKind::Yaml | ManifestKind::Txt => serde_yaml::from_str(&raw)?,
        ManifestKind::Json => {
            let json: serde_json::Value = serde_json::from_str(&raw)?;
            serde_yaml::to_value(json)?
        }
    };
    // Some manifests are a single document, some wrap it in a list.
    let root = match &value {
        serde_yaml::Value::Sequence(seq) => seq.first().unwrap_or(&value),
        _ => &value,
    };

    let dublin_core = root.get("dublin_core");
    let mut data = ManifestData {
        version: dublin_core
            .and_then(|dc| dc.get("version"))
            .and_then(scalar_string),
        issued: dublin_core
            .and_then(|dc| dc.get("issued"))
            .and_then(scalar_string),
        projects: Vec::new(),
    };
    if let Some(serde_yaml::Value::Sequence(projects)) = root.get("projects") {
        for project in projects {
            let Some(identifier) = project.get("identifier").and_then(scalar_string) else {
                continue;
            };
            data.projects.push(ManifestProject {
                identifier,
                title: project.get("title").and_then(scalar_string),
            });
        }
    }
    Ok(data)
}

fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn apply_project_identity(resource: &mut Resource, projects: &[ManifestProject]) {
    let book_code = resource.request.book_code.clone();
    let Some(project) = projects.iter().find(|p| p.identifier == book_code) else {
        return;
    };
    resource.book_id = Some(project.identifier.clone());
    resource.book_title = project
        .title
        .as_ref()
        .map(|t| t.replace(" translationNotes", ""))
        .or_else(|| books::book_title(&project.identifier).map(str::to_string));
    resource.book_number = books::book_number(&project.identifier);
}

/// Candidate content files for the resource, filtered to the requested
/// book. Scripture prefers the scripture-markup suffix and falls back to
/// `.txt`; helps use `.md` and fall back to `.txt`. Repository
/// documentation stems never count as helps content.
fn content_files(resource: &Resource) -> Vec<PathBuf> {
    let (preferred, fallback): (&str, &str) = match resource.kind {
        ResourceKind::Scripture => ("usfm", "txt"),
        _ => ("md", "txt"),
    };
    let exclude_reserved = !resource.kind.is_scripture();
    let mut files = files_with_extension(resource, preferred, exclude_reserved);
    if files.is_empty() {
        files = files_with_extension(resource, fallback, exclude_reserved);
    }
    files.sort();
    files
}

fn files_with_extension(resource: &Resource, extension: &str, exclude_reserved: bool) -> Vec<PathBuf> {
    let book_code = resource.request.book_code.to_lowercase();
    walk_files(&resource.dir)
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        })
        .filter(|path| {
            !exclude_reserved
                || !path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| RESERVED_DOC_STEMS.contains(&stem.to_lowercase().as_str()))
        })
        .filter(|path| {
            book_code.is_empty() || path.to_string_lossy().to_lowercase().contains(&book_code)
        })
        .collect()
}

/// Walk every regular file under `dir` in sorted order, skipping hidden
/// directories such as `.git`.
fn walk_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
}

/// Settle the book identity when the manifest did not. Scripture filenames
/// have the form `01-GEN.usfm` or `GEN.usfm`: the part after the hyphen
/// (or the whole stem) is the book id.
fn derive_book_identity(resource: &mut Resource) {
    let book_id = match resource.kind {
        ResourceKind::Scripture => resource
            .content_files
            .first()
            .and_then(|path| path.file_stem())
            .and_then(|stem| stem.to_str())
            .map(|stem| {
                stem.rsplit_once('-')
                    .map(|(_, id)| id)
                    .unwrap_or(stem)
                    .to_lowercase()
            }),
        _ => (!resource.request.book_code.is_empty())
            .then(|| resource.request.book_code.clone()),
    };
    let Some(book_id) = book_id else {
        return;
    };
    resource.book_title = books::book_title(&book_id)
        .map(str::to_string)
        .or_else(|| Some(book_id.to_uppercase()));
    resource.book_number = books::book_number(&book_id);
    resource.book_id = Some(book_id);
}
