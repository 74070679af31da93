use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tg-archiver", about = "Self-hosted Telegram channel archiver")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Telegram session management
    Tg {
        #[command(subcommand)]
        command: TgCommands,
    },

    /// Batch-join channels from a CSV of URLs/usernames into a folder
    Import {
        #[command(subcommand)]
        command: ImportCommands,
    },
}

#[derive(Subcommand)]
pub enum TgCommands {
    /// Interactive MTProto login wizard
    Login,
    /// Show Telegram session status
    Status,
}

#[derive(Subcommand)]
pub enum ImportCommands {
    /// Create a job from a CSV of channel URLs/usernames and validate every candidate
    Create {
        /// Path to a CSV file with one channel URL/username per line
        csv_path: PathBuf,

        /// Target folder name to join channels into
        #[arg(long)]
        folder: String,
    },

    /// Join every validated candidate in a job and wire it into its target folder
    Process {
        /// Import job id, as printed by `import create`
        job_id: uuid::Uuid,
    },
}
