//! Settings read from the environment at startup.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

const DATABASE_PATH: &str = "BILLS_DATABASE_PATH";
const EVIDENCE_DIR: &str = "BILLS_EVIDENCE_DIR";
const EVIDENCE_BASE_URL: &str = "BILLS_EVIDENCE_BASE_URL";
const MAX_COMMIT_RETRIES: &str = "BILLS_MAX_COMMIT_RETRIES";

const DEFAULT_DATABASE_PATH: &str = "bills.db";
const DEFAULT_EVIDENCE_DIR: &str = "evidence";
const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("cannot resolve the evidence directory: {0}")]
    EvidenceDir(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub database_path: PathBuf,
    pub evidence_dir: PathBuf,
    pub evidence_base_url: String,
    pub max_commit_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Config, ConfigError> {
        let database_path = lookup(DATABASE_PATH)
            .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string())
            .into();
        let evidence_dir: PathBuf = lookup(EVIDENCE_DIR)
            .unwrap_or_else(|| DEFAULT_EVIDENCE_DIR.to_string())
            .into();

        let evidence_base_url = match lookup(EVIDENCE_BASE_URL) {
            Some(url) if url.trim().is_empty() => {
                return Err(ConfigError::InvalidValue {
                    name: EVIDENCE_BASE_URL,
                    value: url,
                    reason: "must not be empty".to_string(),
                });
            }
            Some(url) => url,
            None => {
                let absolute = if evidence_dir.is_absolute() {
                    evidence_dir.clone()
                } else {
                    env::current_dir()?.join(&evidence_dir)
                };
                format!("file://{}", absolute.display())
            }
        };

        let max_commit_retries = match lookup(MAX_COMMIT_RETRIES) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                    name: MAX_COMMIT_RETRIES,
                    value: value.clone(),
                    reason: e.to_string(),
                })?,
            None => DEFAULT_MAX_COMMIT_RETRIES,
        };

        Ok(Config {
            database_path,
            evidence_dir,
            evidence_base_url,
            max_commit_retries,
        })
    }
}
