//! Asset acquisition: HTTP downloads, git clones and zip extraction, plus
//! the catalog freshness policy.
//!
//! All network access goes through the [`ContentRetriever`] trait so tests
//! can run against canned bytes. Downloads stream to a temporary file and
//! move into place on success; a partial file never lands under its final
//! name. Concurrent acquisitions of the same target directory serialize on
//! a per-directory mutex.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::config::Settings;
use crate::errors::Error;
use crate::resource::{AssetLocator, FileFormat};

#[cfg_attr(test, automock)]
pub trait ContentRetriever: Send + Sync {
    /// Fetch the bytes behind a URL.
    fn retrieve(&self, url: &str) -> Result<Vec<u8>, Error>;

    /// Download a URL to a file, atomically. An already-present file is
    /// the cache hit and is left alone.
    fn download(&self, url: &str, dest: &Path) -> Result<(), Error> {
        if dest.is_file() {
            debug!("Reusing cached file {} for '{url}'", dest.display());
            return Ok(());
        }
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let bytes = self.retrieve(url)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
        debug!("Downloaded '{url}' to {}", dest.display());
        Ok(())
    }
}

/// The production retriever: a ureq agent with a global timeout.
#[derive(Debug, Clone)]
pub struct HttpRetriever {
    agent: ureq::Agent,
}

impl HttpRetriever {
    pub fn new(timeout: Duration) -> HttpRetriever {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        HttpRetriever {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl ContentRetriever for HttpRetriever {
    fn retrieve(&self, url: &str) -> Result<Vec<u8>, Error> {
        let res = self.agent.get(url).call().map_err(|e| Error::Acquisition {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (_, body) = res.into_parts();
        let mut bytes: Vec<u8> = Vec::with_capacity(64 * 1024);
        let _ = body
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| Error::Acquisition {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(bytes)
    }
}

/// Registry of per-directory mutexes. Two concurrent acquisitions of the
/// same target directory must not interleave their writes.
#[derive(Debug, Default)]
pub struct DirLocks {
    inner: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DirLocks {
    pub fn for_dir(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(dir.to_path_buf()).or_default().clone()
    }
}

/// Make the asset behind `locator` present under `dir`.
///
/// Returns the directory holding the resource's files: `dir` itself for
/// archives and single files, the clone target for git repositories
/// (clones get one extra directory layer, named after the repository).
pub fn acquire(
    retriever: &dyn ContentRetriever,
    locator: &AssetLocator,
    dir: &Path,
    locks: &DirLocks,
) -> Result<PathBuf, Error> {
    let lock = locks.for_dir(dir);
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    fs::create_dir_all(dir)?;

    let basename = locator.basename();
    match locator.file_format {
        FileFormat::Zip => {
            let archive_path = dir.join(basename);
            if archive_path.is_file() {
                debug!("Archive {} already present", archive_path.display());
            } else {
                retriever.download(&locator.url, &archive_path)?;
                unzip(&archive_path, dir)?;
            }
            Ok(dir.to_path_buf())
        }
        FileFormat::Git => {
            let target = dir.join(basename);
            if target.is_dir() {
                debug!("Clone target {} already present", target.display());
            } else {
                clone_repo(&locator.url, &target)?;
            }
            Ok(target)
        }
        _ => {
            retriever.download(&locator.url, &dir.join(basename))?;
            Ok(dir.to_path_buf())
        }
    }
}

fn unzip(archive_path: &Path, dest: &Path) -> Result<(), Error> {
    debug!("Unzipping {} into {}", archive_path.display(), dest.display());
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(dest)?;
    Ok(())
}

fn clone_repo(url: &str, target: &Path) -> Result<(), Error> {
    info!("Cloning '{url}' into {}", target.display());
    let output = Command::new("git")
        .args(["clone", "--depth", "1", url])
        .arg(target)
        .output()
        .map_err(|e| Error::Acquisition {
            url: url.to_string(),
            reason: format!("failed to invoke git: {e}"),
        })?;
    if !output.status.success() {
        // Leave no half-cloned directory behind to poison the cache key.
        let _ = fs::remove_dir_all(target);
        return Err(Error::Acquisition {
            url: url.to_string(),
            reason: format!(
                "git clone exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// How long a leftover catalog lock may sit before it is considered
/// abandoned and broken.
const LOCK_GRACE: Duration = Duration::from_secs(60);

/// Ensure a sufficiently fresh catalog copy is on disk and return its
/// path. Whichever task first detects staleness takes an exclusive lock
/// file and downloads; concurrent tasks wait for the write to complete
/// and then reuse the same copy.
pub fn ensure_catalog(
    settings: &Settings,
    retriever: &dyn ContentRetriever,
) -> Result<PathBuf, Error> {
    let path = settings.catalog_path();
    if !catalog::is_stale(&path, settings.catalog_stale_after) {
        debug!("Catalog {} is fresh", path.display());
        return Ok(path);
    }
    fs::create_dir_all(&settings.working_dir)?;
    let lock_path = path.with_extension("lock");

    loop {
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => {
                // We hold the lock. Someone may have refreshed the file
                // while we were waiting for it.
                let result = if catalog::is_stale(&path, settings.catalog_stale_after) {
                    info!("Refreshing catalog from {}", settings.catalog_url);
                    download_catalog(retriever, &settings.catalog_url, &path)
                } else {
                    Ok(())
                };
                let _ = fs::remove_file(&lock_path);
                result?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if catalog::is_stale(&lock_path, LOCK_GRACE) {
                    warn!("Breaking abandoned catalog lock {}", lock_path.display());
                    let _ = fs::remove_file(&lock_path);
                    continue;
                }
                thread::sleep(Duration::from_millis(100));
                if !catalog::is_stale(&path, settings.catalog_stale_after) {
                    return Ok(path);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn download_catalog(
    retriever: &dyn ContentRetriever,
    url: &str,
    path: &Path,
) -> Result<(), Error> {
    // The freshness check keys off the file mtime, so an existing stale
    // copy must be replaced, not reused: bypass the download cache hit by
    // writing to a temp name and renaming over the old file.
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let bytes = retriever.retrieve(url)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&bytes)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CannedRetriever {
        bytes: Vec<u8>,
        calls: AtomicUsize,
    }

    impl CannedRetriever {
        fn new(bytes: &[u8]) -> CannedRetriever {
            CannedRetriever {
                bytes: bytes.to_vec(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ContentRetriever for CannedRetriever {
        fn retrieve(&self, _url: &str) -> Result<Vec<u8>, Error> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.bytes.clone())
        }
    }

    struct FailingRetriever;
    impl ContentRetriever for FailingRetriever {
        fn retrieve(&self, url: &str) -> Result<Vec<u8>, Error> {
            Err(Error::Acquisition {
                url: url.to_string(),
                reason: "HTTP status 404".to_string(),
            })
        }
    }

    fn zip_bytes(name: &str, content: &str) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file(name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn download_writes_the_file_once() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("sub").join("file.usfm");
        let retriever = CannedRetriever::new(b"\\id TIT\n");
        retriever.download("https://x/file.usfm", &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"\\id TIT\n");
        // A second call is a cache hit.
        retriever.download("https://x/file.usfm", &dest).unwrap();
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_download_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("file.usfm");
        let result = FailingRetriever.download("https://x/file.usfm", &dest);
        assert!(matches!(result, Err(Error::Acquisition { .. })));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn zip_acquisition_extracts_into_the_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("en_ulb");
        let retriever = CannedRetriever::new(&zip_bytes("en_ulb/57-TIT.usfm", "\\id TIT\n"));
        let locator = AssetLocator::from_url("https://cdn.example.org/en_ulb.zip");
        let locks = DirLocks::default();
        let root = acquire(&retriever, &locator, &dir, &locks).unwrap();
        assert_eq!(root, dir);
        assert_eq!(
            fs::read_to_string(dir.join("en_ulb").join("57-TIT.usfm")).unwrap(),
            "\\id TIT\n"
        );
    }

    #[test]
    fn single_file_acquisition_lands_in_the_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("en_ulb");
        let retriever = CannedRetriever::new(b"\\id TIT\n");
        let locator = AssetLocator::from_url("https://cdn.example.org/57-TIT.usfm");
        let locks = DirLocks::default();
        let root = acquire(&retriever, &locator, &dir, &locks).unwrap();
        assert_eq!(root, dir);
        assert!(dir.join("57-TIT.usfm").is_file());
    }

    #[test]
    fn catalog_downloads_once_then_reuses() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            working_dir: tmp.path().to_path_buf(),
            output_dir: tmp.path().to_path_buf(),
            catalog_url: "https://x/translations.json".to_string(),
            ..Settings::default()
        };
        let retriever = CannedRetriever::new(b"[]");
        let first = ensure_catalog(&settings, &retriever).unwrap();
        let second = ensure_catalog(&settings, &retriever).unwrap();
        assert_eq!(first, second);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert!(!first.with_extension("lock").exists());
    }

    #[test]
    fn stale_catalog_is_refreshed() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            working_dir: tmp.path().to_path_buf(),
            output_dir: tmp.path().to_path_buf(),
            catalog_url: "https://x/translations.json".to_string(),
            catalog_stale_after: Duration::from_secs(0),
            ..Settings::default()
        };
        fs::write(tmp.path().join("translations.json"), b"old").unwrap();
        // Give coarse filesystem timestamps a moment to fall behind.
        thread::sleep(Duration::from_millis(20));
        let retriever = CannedRetriever::new(b"[]");
        let path = ensure_catalog(&settings, &retriever).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[]");
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dir_locks_hand_out_the_same_mutex_per_directory() {
        let locks = DirLocks::default();
        let a = locks.for_dir(Path::new("/tmp/a"));
        let b = locks.for_dir(Path::new("/tmp/a"));
        let c = locks.for_dir(Path::new("/tmp/c"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
