//! Generates single interleaved documents from sets of translation
//! resources.
//!
//! A request names a list of resources, each a `(language, resource type,
//! book)` triple, plus an assembly configuration. The pipeline resolves
//! each triple against a JSON catalog, fetches and unpacks the assets
//! (zip archives, git repositories or single scripture files), parses
//! scripture markup and markdown helps into chapter/verse-addressed
//! trees, resolves cross-references transitively, and weaves everything
//! into one HTML document at the requested granularity and layout.
//! Derived formats (PDF, EPUB, DOCX) are delegated to external
//! converters.

pub mod assemble;
pub mod books;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod errors;
pub mod fetch;
pub mod helps;
pub mod init_trace;
pub mod layout;
pub mod links;
pub mod pipeline;
pub mod resource;
pub mod usfm;

pub use crate::assemble::{Assembler, DEFAULT_CSS};
pub use crate::catalog::Catalog;
pub use crate::config::{
    AssemblyConfig, ChunkSize, DocumentRequest, Layout, Settings, Strategy,
};
pub use crate::errors::Error;
pub use crate::pipeline::{
    CancelToken, Context, DocumentJob, PipelineOutcome, TaskState, document_key, generate,
};
pub use crate::resource::{Resource, ResourceKind, ResourceRequest};
