//! The pipeline orchestrator: resolve, fetch, parse, rewrite, assemble,
//! convert.
//!
//! One request is one logical task. Fetches across distinct resources run
//! on a bounded worker pool; parsing and assembly are sequential. Every
//! per-resource failure demotes that resource to the unfulfilled list and
//! the assembler runs over whatever survived; only a configuration-level
//! assembly error or output-directory I/O fails the task.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::assemble::Assembler;
use crate::catalog::Catalog;
use crate::config::{DocumentRequest, Settings};
use crate::convert::{self, ConversionReport, OutputFormat};
use crate::errors::Error;
use crate::fetch::{self, ContentRetriever, DirLocks, HttpRetriever};
use crate::helps::{self, HelpsContext};
use crate::layout;
use crate::links;
use crate::resource::{Content, Resource, ResourceKind, ResourceRequest};
use crate::usfm;

/// Cooperative cancellation signal, honored between pipeline phases.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a pipeline run needs, passed through each phase explicitly.
pub struct Context {
    pub settings: Settings,
    pub catalog: Catalog,
    pub retriever: Arc<dyn ContentRetriever>,
    pub locks: DirLocks,
    pub cancel: CancelToken,
}

impl Context {
    /// Production bootstrap: build the HTTP retriever, ensure a fresh
    /// catalog copy on disk and parse it.
    pub fn bootstrap(settings: Settings) -> Result<Context, Error> {
        let retriever: Arc<dyn ContentRetriever> =
            Arc::new(HttpRetriever::new(settings.fetch_timeout));
        let catalog_path = fetch::ensure_catalog(&settings, retriever.as_ref())?;
        let catalog = Catalog::load(&catalog_path)?;
        Ok(Context {
            settings,
            catalog,
            retriever,
            locks: DirLocks::default(),
            cancel: CancelToken::new(),
        })
    }

    /// Assemble a context from parts; used by tests and embedders that
    /// bring their own catalog or retriever.
    pub fn new(
        settings: Settings,
        catalog: Catalog,
        retriever: Arc<dyn ContentRetriever>,
    ) -> Context {
        Context {
            settings,
            catalog,
            retriever,
            locks: DirLocks::default(),
            cancel: CancelToken::new(),
        }
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Task states surfaced to the (out-of-scope) request layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Started,
    Success(String),
    Failure(String),
}

/// A single document task with an observable state.
#[derive(Debug)]
pub struct DocumentJob {
    request: DocumentRequest,
    state: Mutex<TaskState>,
}

impl DocumentJob {
    pub fn new(request: DocumentRequest) -> DocumentJob {
        DocumentJob {
            request,
            state: Mutex::new(TaskState::Pending),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Drive the pipeline to completion, recording the final state.
    pub fn run(&self, ctx: &Context) -> TaskState {
        self.set_state(TaskState::Started);
        let state = match generate(ctx, &self.request) {
            Ok(outcome) => TaskState::Success(outcome.document_key),
            Err(e) => TaskState::Failure(e.to_string()),
        };
        self.set_state(state.clone());
        state
    }
}

/// What a finished pipeline run produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub document_key: String,
    pub html_path: PathBuf,
    pub conversion: ConversionReport,
    pub unfulfilled: Vec<ResourceRequest>,
    /// True when an identical earlier request already produced the file
    /// and the pipeline was skipped entirely.
    pub reused: bool,
}

/// Content-addressed key of a request: identical requests (same resource
/// list, same order, same assembly configuration) map to the same
/// document file.
pub fn document_key(request: &DocumentRequest) -> String {
    let mut hasher = Sha256::new();
    for resource in &request.resources {
        hasher.update(resource.slug());
        hasher.update([0]);
    }
    // The serde rendering of the config is stable field order.
    if let Ok(config) = serde_json::to_string(&request.assembly) {
        hasher.update(config);
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("doc-{hex}")
}

/// Run the full pipeline for one request.
pub fn generate(ctx: &Context, request: &DocumentRequest) -> Result<PipelineOutcome, Error> {
    let key = document_key(request);
    let html_path = ctx.settings.output_dir.join(format!("{key}.html"));
    if html_path.is_file() {
        info!("Document {key} already exists; skipping pipeline");
        let conversion =
            convert::run_converters(&html_path, &OutputFormat::requested(&request.assembly));
        return Ok(PipelineOutcome {
            document_key: key,
            html_path,
            conversion,
            unfulfilled: Vec::new(),
            reused: true,
        });
    }

    // Phase 1: resolve every request against the catalog.
    let mut unfulfilled: Vec<ResourceRequest> = Vec::new();
    let mut found: Vec<(ResourceRequest, crate::resource::AssetLocator)> = Vec::new();
    for resource_request in &request.resources {
        let locators = ctx.catalog.lookup(resource_request);
        match locators.into_iter().next() {
            Some(locator) => found.push((resource_request.clone(), locator)),
            None => {
                warn!("{resource_request} not found in catalog");
                unfulfilled.push(resource_request.clone());
            }
        }
    }
    ctx.check_cancelled()?;

    // Phase 2: fetch in parallel on the bounded pool. Result order is the
    // request order, which stays the presentation order.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.settings.fetch_workers.max(1))
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;
    let fetched: Vec<Result<Resource, (ResourceRequest, Error)>> = pool.install(|| {
        found
            .into_par_iter()
            .map(|(resource_request, locator)| {
                if ctx.cancel.is_cancelled() {
                    return Err((resource_request, Error::Cancelled));
                }
                let mut resource =
                    Resource::new(resource_request.clone(), &ctx.settings.working_dir, &locator);
                match fetch::acquire(ctx.retriever.as_ref(), &locator, &resource.dir, &ctx.locks)
                {
                    Ok(root) => {
                        resource.dir = root;
                        Ok(resource)
                    }
                    Err(e) => Err((resource_request, e)),
                }
            })
            .collect()
    });
    let mut resources: Vec<Resource> = Vec::new();
    for result in fetched {
        match result {
            Ok(resource) => resources.push(resource),
            Err((resource_request, e)) => {
                warn!("Failed to fetch {resource_request}: {e}");
                unfulfilled.push(resource_request);
            }
        }
    }
    ctx.check_cancelled()?;

    // Phase 3: layout discovery, parsing and link rewriting, sequentially
    // and within the parse budget.
    let deadline = Instant::now() + ctx.settings.parse_timeout;
    let mut populated: Vec<Resource> = Vec::new();
    for mut resource in resources {
        if Instant::now() > deadline {
            warn!("Parse budget exhausted; demoting {}", resource.request);
            unfulfilled.push(resource.request);
            continue;
        }
        match populate(&mut resource, ctx) {
            Ok(()) => populated.push(resource),
            Err(e) => {
                warn!("Failed to parse {}: {e}", resource.request);
                unfulfilled.push(resource.request);
            }
        }
    }
    ctx.check_cancelled()?;

    // Phase 4: assemble and write the document atomically. The first
    // finisher of concurrent identical requests wins.
    let assemble_started = Instant::now();
    let html = Assembler::new(&populated, &unfulfilled, &request.assembly)?.assemble()?;
    if assemble_started.elapsed() > ctx.settings.assemble_timeout {
        warn!(
            "Assembly ran {}s, past its {}s budget",
            assemble_started.elapsed().as_secs(),
            ctx.settings.assemble_timeout.as_secs()
        );
    }
    fs::create_dir_all(&ctx.settings.output_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&ctx.settings.output_dir)?;
    tmp.write_all(html.as_bytes())?;
    match tmp.persist_noclobber(&html_path) {
        Ok(_) => debug!("Wrote {}", html_path.display()),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!("Concurrent identical request finished first; reusing its file");
        }
        Err(e) => return Err(Error::Io(e.error)),
    }

    // Phase 5: derived formats, best effort.
    let conversion =
        convert::run_converters(&html_path, &OutputFormat::requested(&request.assembly));

    info!(
        "Document {key} finished with {} resource(s), {} unfulfilled",
        populated.len(),
        unfulfilled.len()
    );
    Ok(PipelineOutcome {
        document_key: key,
        html_path,
        conversion,
        unfulfilled,
        reused: false,
    })
}

/// Layout discovery, parsing and link rewriting for one acquired resource.
fn populate(resource: &mut Resource, ctx: &Context) -> Result<(), Error> {
    layout::discover(resource)?;
    match resource.kind {
        ResourceKind::Scripture => {
            let Some(file) = resource.content_files.first().cloned() else {
                return Err(Error::Layout {
                    dir: resource.dir.clone(),
                    reason: "no content files matched".to_string(),
                });
            };
            let text = fs::read_to_string(&file)?;
            resource.content = Content::Scripture(usfm::parse(&text)?);
        }
        ResourceKind::Notes | ResourceKind::Questions | ResourceKind::Commentary => {
            let book_id = resource.book_or_request_id().to_string();
            let book_title = resource
                .book_title
                .clone()
                .unwrap_or_else(|| book_id.to_uppercase());
            let book_dir = helps::find_book_dir(&resource.dir, &book_id).ok_or_else(|| {
                Error::Parse(format!(
                    "no '{book_id}' directory under {}",
                    resource.dir.display()
                ))
            })?;
            let helps_ctx = HelpsContext {
                lang_code: &resource.request.lang_code,
                kind_tag: resource.kind.anchor_tag(),
                book_id: &book_id,
                book_title: &book_title,
            };
            let mut tree = helps::read_book_tree(&book_dir, &helps_ctx)?;

            // Register the tree's own targets first so references between
            // chunks resolve to anchors instead of re-loading files.
            for doc in tree.docs() {
                resource.arena.register_doc(doc, resource.kind.anchor_tag());
            }
            for doc in tree.docs() {
                links::collect_references(
                    &doc.body,
                    &doc.token,
                    &ctx.settings.working_dir,
                    &mut resource.arena,
                    &mut resource.bad_links,
                );
            }
            for doc in tree.docs_mut() {
                doc.body = links::rewrite(&doc.body, &resource.arena);
            }
            // Entries pulled in transitively carry tokens of their own.
            let rewritten: Vec<(String, String)> = resource
                .arena
                .entries()
                .filter(|entry| entry.inline && !entry.body.is_empty())
                .map(|entry| (entry.token.clone(), links::rewrite(&entry.body, &resource.arena)))
                .collect();
            for (token, body) in rewritten {
                resource.arena.set_body(&token, body);
            }
            if !resource.bad_links.is_empty() {
                debug!(
                    "{} has {} broken reference(s)",
                    resource.request,
                    resource.bad_links.len()
                );
            }
            resource.content = Content::Helps(tree);
        }
        ResourceKind::Words | ResourceKind::Academy => {
            // These are consulted on disk while other resources resolve
            // their references; they contribute no tree of their own.
            debug!("{} acquired as a reference source", resource.request);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::config::AssemblyConfig;

    fn request(slugs: &[(&str, &str, &str)]) -> DocumentRequest {
        DocumentRequest {
            resources: slugs
                .iter()
                .map(|(l, t, b)| ResourceRequest::new(l, t, b))
                .collect(),
            assembly: AssemblyConfig::default(),
        }
    }

    #[test]
    fn document_key_is_stable_and_order_sensitive() {
        let a = request(&[("en", "ulb", "tit"), ("en", "tn", "tit")]);
        let b = request(&[("en", "ulb", "tit"), ("en", "tn", "tit")]);
        let c = request(&[("en", "tn", "tit"), ("en", "ulb", "tit")]);
        assert_eq!(document_key(&a), document_key(&b));
        assert_ne!(document_key(&a), document_key(&c));
        assert!(document_key(&a).starts_with("doc-"));
    }

    #[test]
    fn document_key_depends_on_the_assembly_config() {
        let a = request(&[("en", "ulb", "tit")]);
        let mut b = a.clone();
        b.assembly.layout_for_print = true;
        assert_ne!(document_key(&a), document_key(&b));
    }

    #[test]
    fn job_reports_failure_with_a_reason() {
        // An empty catalog plus verse granularity with no scripture is a
        // configuration-level assembly error.
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = Settings {
            working_dir: tmp.path().to_path_buf(),
            output_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        };
        struct NoNetwork;
        impl ContentRetriever for NoNetwork {
            fn retrieve(&self, url: &str) -> Result<Vec<u8>, Error> {
                Err(Error::Acquisition {
                    url: url.to_string(),
                    reason: "offline".to_string(),
                })
            }
        }
        let ctx = Context::new(
            settings,
            Catalog::from_entries(Vec::<CatalogEntry>::new()),
            Arc::new(NoNetwork),
        );
        let mut doc_request = request(&[("llx", "ulb", "col")]);
        doc_request.assembly.chunk_size = crate::config::ChunkSize::Verse;
        let job = DocumentJob::new(doc_request);
        assert_eq!(job.state(), TaskState::Pending);
        let state = job.run(&ctx);
        match state {
            TaskState::Failure(reason) => assert!(reason.contains("scripture")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_context_stops_between_phases() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = Settings {
            working_dir: tmp.path().to_path_buf(),
            output_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        };
        struct Canned;
        impl ContentRetriever for Canned {
            fn retrieve(&self, _url: &str) -> Result<Vec<u8>, Error> {
                Ok(Vec::new())
            }
        }
        let ctx = Context::new(
            settings,
            Catalog::from_entries(Vec::<CatalogEntry>::new()),
            Arc::new(Canned),
        );
        ctx.cancel.cancel();
        let result = generate(&ctx, &request(&[("en", "ulb", "tit")]));
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
