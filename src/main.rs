use std::sync::Arc;

use log::{error, info};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};

mod commands;
mod config;
mod database;
mod endpoints;
mod error;
mod evidence;
mod formatter;
mod ledger;
mod parser;
mod settlement;
mod types;
mod validator;

use crate::commands::{execute, Context};
use crate::config::Config;
use crate::database::sqlite::SqliteDatabase;
use crate::evidence::LocalEvidenceStore;
use crate::formatter::{format_error, format_success};
use crate::parser::parse_request;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_log();

    let config = Config::from_env().map_err(|e| {
        error!("Invalid configuration: {e}");
        e
    })?;

    info!("Initializing database at {}...", config.database_path.display());
    let database = SqliteDatabase::new(&config.database_path).map_err(|e| {
        error!("Cannot initialize database: {e}");
        e
    })?;

    info!(
        "Storing evidence in {} as {}",
        config.evidence_dir.display(),
        config.evidence_base_url
    );
    let store = LocalEvidenceStore::new(&config.evidence_dir, &config.evidence_base_url);

    let context = Context {
        database: Arc::new(Mutex::new(database)),
        store,
        max_commit_retries: config.max_commit_retries,
    };

    info!("Reading requests from stdin...");
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match parse_request(&line) {
            Ok(request) => execute(request, &context).await,
            Err(e) => Err(e.into()),
        };

        let output = match response {
            Ok(data) => format_success(&data),
            Err(e) => {
                error!("Request failed: {e:#}");
                format_error(&e)
            }
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!("End of input, shutting down");
    Ok(())
}

fn init_log() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();
}
