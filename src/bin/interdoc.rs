use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};

use interdoc::errors::Error;
use interdoc::init_trace::init_tracing;
use interdoc::{Context, DocumentJob, DocumentRequest, Settings, TaskState};

fn main() {
    init_tracing();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let settings = Settings::from_env();
    let ctx = Context::bootstrap(settings)?;

    if args.list_language_codes {
        for code in ctx.catalog.language_codes() {
            println!("{code}");
        }
        return Ok(());
    }
    if args.list_resource_types {
        for code in ctx.catalog.resource_types() {
            println!("{code}");
        }
        return Ok(());
    }
    if args.list_book_codes {
        for code in ctx.catalog.book_codes() {
            println!("{code}");
        }
        return Ok(());
    }

    let request: DocumentRequest = match &args.request {
        Some(path) => serde_json::from_reader(File::open(path)?)?,
        None => serde_json::from_reader(io::stdin())?,
    };

    let job = DocumentJob::new(request);
    match job.run(&ctx) {
        TaskState::Success(key) => {
            info!("Document is ready");
            println!("{key}");
            Ok(())
        }
        TaskState::Failure(reason) => Err(Error::Assembler(reason)),
        other => Err(Error::Assembler(format!(
            "job ended in unexpected state {other:?}"
        ))),
    }
}

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Generate an interleaved translation-resource document", long_about = None)]
struct Args {
    #[arg(help = "JSON file describing the document request (stdin when omitted)")]
    request: Option<PathBuf>,

    #[arg(long, help = "List the catalog's language codes and exit")]
    list_language_codes: bool,

    #[arg(long, help = "List the catalog's resource types and exit")]
    list_resource_types: bool,

    #[arg(long, help = "List the catalog's book codes and exit")]
    list_book_codes: bool,
}
