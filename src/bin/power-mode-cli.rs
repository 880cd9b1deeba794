//! Power Mode CLI - out-of-process administrative surface.
//!
//! Not part of the library's runtime path: this binary is for operators to
//! inspect and maintain a file-mode session's `.popkit` state.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use power_mode::{FileLockTimeoutSeconds, FileStore, MaxMessagesPerChannel};

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discards messages older than 24h and expired keys from a file-mode
    /// session's state file.
    Cleanup {
        /// Project directory whose `.popkit` state should be cleaned up.
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Cleanup { project_dir } => {
            let store = FileStore::new(
                &project_dir,
                FileLockTimeoutSeconds::default(),
                MaxMessagesPerChannel::default(),
            );
            store.cleanup_expired().await?;
            println!("cleaned up expired state under {}", project_dir.display());
        }
    }
    Ok(())
}
