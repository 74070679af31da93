mod album;
mod backfill;
mod broker;
mod cli;
mod config;
mod daemon;
mod db;
mod discovery;
mod entity_extractor;
mod error;
mod hashing;
mod import;
mod listener;
mod media_archiver;
mod models;
mod object_store;
mod processor;
mod store;
mod telegram;
mod tg_session;
mod translation;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands, ImportCommands, TgCommands};
use crate::config::{load_config, validate_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.archiver.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Tg { command }) => {
            let pool = db::create_pool(&config).await.context("creating database pool")?;
            let conn = telegram::connect(&config, &pool).await.context("connecting to Telegram")?;

            match command {
                TgCommands::Login => {
                    telegram::login(&conn.client, &config).await.context("Telegram login")?;
                    println!("Session saved. You can now run the archiver daemon.");
                }
                TgCommands::Status => {
                    telegram::status(&conn.client).await.context("Telegram status")?;
                }
            }

            conn.client.disconnect();
            conn.runner_handle.abort();
        }
        Some(Commands::Import { command }) => match command {
            ImportCommands::Create { csv_path, folder } => {
                let pool = db::create_pool(&config).await.context("creating database pool")?;
                let conn = telegram::connect(&config, &pool).await.context("connecting to Telegram")?;

                if !matches!(conn.client.is_authorized().await, Ok(true)) {
                    anyhow::bail!("Telegram not authorized. Run 'tg-archiver tg login' first.");
                }

                let content = std::fs::read_to_string(&csv_path)
                    .with_context(|| format!("reading CSV file {}", csv_path.display()))?;
                let inputs: Vec<String> = content.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();

                if inputs.is_empty() {
                    anyhow::bail!("no channel URLs/usernames found in {}", csv_path.display());
                }

                let job_id = import::create_job(&pool, &folder, inputs).await.context("creating import job")?;
                println!("Created import job {job_id} with target folder '{folder}'");

                import::validate_job(&conn.client, &pool, job_id).await.context("validating import job")?;
                println!("Validation complete. Review candidates, then run 'tg-archiver import process {job_id}'.");

                conn.client.disconnect();
                conn.runner_handle.abort();
            }
            ImportCommands::Process { job_id } => {
                let pool = db::create_pool(&config).await.context("creating database pool")?;
                let conn = telegram::connect(&config, &pool).await.context("connecting to Telegram")?;

                if !matches!(conn.client.is_authorized().await, Ok(true)) {
                    anyhow::bail!("Telegram not authorized. Run 'tg-archiver tg login' first.");
                }

                import::process_job(&conn.client, &pool, job_id).await.context("processing import job")?;
                println!("Import job {job_id} complete.");

                conn.client.disconnect();
                conn.runner_handle.abort();
            }
        },
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}
