use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No catalog entry for '{lang_code}/{resource_type}/{book_code}'")]
    NotFoundInCatalog {
        lang_code: String,
        resource_type: String,
        book_code: String,
    },

    #[error("Failed to acquire '{url}': {reason}")]
    Acquisition { url: String, reason: String },

    #[error("Catalog is unusable: {0}")]
    Catalog(String),

    #[error("Resource layout error in '{dir}': {reason}")]
    Layout { dir: PathBuf, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Cannot assemble document: {0}")]
    Assembler(String),

    #[error("Converter '{command}' failed: {reason}")]
    Converter { command: String, reason: String },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Could not parse the document template")]
    TemplateParse,

    #[error("Failed to build the fetch worker pool: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Render(#[from] handlebars::RenderError),
    #[error(transparent)]
    HttpError(#[from] Box<ureq::Error>),
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        Error::HttpError(Box::new(e))
    }
}
