use std::{env, path::PathBuf, time::Duration};

use crate::certification::IssueMode;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_LAB_PASS_THRESHOLD: f64 = 75.0;

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; `None` runs on the in-memory backend.
    pub database_url: Option<String>,
    pub port: u16,
    pub lab_pass_threshold: f64,
    pub retry: RetryPolicy,
    pub issue_mode: IssueMode,
    /// JSON fixture loaded into the in-memory backend.
    pub seed_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            port: DEFAULT_PORT,
            lab_pass_threshold: DEFAULT_LAB_PASS_THRESHOLD,
            retry: RetryPolicy::default(),
            issue_mode: IssueMode::Background,
            seed_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        cfg.database_url = var("DATABASE_URL");
        cfg.seed_file = var("SEED_FILE").map(PathBuf::from);

        if let Some(port) = var("PORT") {
            cfg.port = parse("PORT", &port)?;
        }
        if let Some(threshold) = var("LAB_PASS_THRESHOLD") {
            let t: f64 = parse("LAB_PASS_THRESHOLD", &threshold)?;
            if !(0.0..=100.0).contains(&t) {
                return Err(Error::Validation(format!(
                    "LAB_PASS_THRESHOLD {t}: must be within 0..=100"
                )));
            }
            cfg.lab_pass_threshold = t;
        }
        if let Some(attempts) = var("STORE_WRITE_ATTEMPTS") {
            let n: u32 = parse("STORE_WRITE_ATTEMPTS", &attempts)?;
            if n == 0 {
                return Err(Error::Validation("STORE_WRITE_ATTEMPTS: must be at least 1".into()));
            }
            cfg.retry.attempts = n;
        }
        if let Some(delay) = var("STORE_RETRY_DELAY_MS") {
            let ms: u64 = parse("STORE_RETRY_DELAY_MS", &delay)?;
            cfg.retry.delay = Duration::from_millis(ms);
        }
        if let Some(mode) = var("CERT_ISSUE_MODE") {
            cfg.issue_mode = mode.parse()?;
        }
        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Validation(format!("{key}={raw:?}")))
}
