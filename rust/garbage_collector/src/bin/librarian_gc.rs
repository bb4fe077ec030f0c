use std::process::ExitCode;

use clap::Parser;
use librarian_error::LibrarianError;
use librarian_gc_library::garbage_collector::GarbageCollectionOptions;
use librarian_gc_library::garbage_collector_entrypoint;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Removes unreferenced aliases, content and files from the librarian")]
struct Args {
    /// YAML configuration file. Defaults to $CONFIG_PATH, then ./librarian_gc_config.yaml.
    #[clap(long)]
    config_path: Option<String>,
    /// Don't detach expired aliases from their content.
    #[clap(long)]
    skip_expiry: bool,
    /// Don't merge duplicate content.
    #[clap(long)]
    skip_duplicates: bool,
    /// Don't delete expired temporary blobs.
    #[clap(long)]
    skip_blobs: bool,
    /// Don't delete unreferenced aliases.
    #[clap(long)]
    skip_aliases: bool,
    /// Don't delete unreferenced content.
    #[clap(long)]
    skip_content: bool,
    /// Don't sweep the disk and object store for unwanted files.
    #[clap(long)]
    skip_files: bool,
}

impl Args {
    fn options(&self) -> GarbageCollectionOptions {
        GarbageCollectionOptions {
            skip_expiry: self.skip_expiry,
            skip_duplicates: self.skip_duplicates,
            skip_blobs: self.skip_blobs,
            skip_aliases: self.skip_aliases,
            skip_content: self.skip_content,
            skip_files: self.skip_files,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let options = args.options();

    match garbage_collector_entrypoint(args.config_path, options).await {
        Ok(report) => {
            info!("Garbage collection completed: {:#?}", report);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(code = err.code().name(), "Garbage collection failed: {}", err);
            eprintln!("Garbage collection failed: {err}");
            ExitCode::FAILURE
        }
    }
}
