//! Service configuration, read from the environment (and `.env` via dotenvy).

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{completion::CompletionPolicy, runtime::RuntimeSettings};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Postgres URL; without one the service runs on the in-memory store.
    pub database_url: Option<String>,
    /// Port to bind (default `8081`).
    pub port: u16,
    /// Origin the runtime posts commits to, e.g. `https://lms.example.com`.
    /// Without it the request's `Host` header is used.
    pub public_url: Option<String>,
    /// Root for extracted packages (default `./data`).
    pub data_dir: PathBuf,
    /// Largest accepted package upload in bytes.
    pub max_upload_bytes: usize,
    pub completion: CompletionPolicy,
    /// Handed to every launched runtime.
    pub runtime: RuntimeSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            port: 8081,
            public_url: None,
            data_dir: PathBuf::from("./data"),
            max_upload_bytes: 200 * 1024 * 1024, // 200 MB
            completion: CompletionPolicy::default(),
            runtime: RuntimeSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        cfg.database_url = get("DATABASE_URL");
        if let Some(port) = get("PORT") {
            cfg.port = parse("PORT", &port)?;
        }
        cfg.public_url = get("PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string());
        if let Some(dir) = get("DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(max) = get("MAX_UPLOAD_BYTES") {
            cfg.max_upload_bytes = parse("MAX_UPLOAD_BYTES", &max)?;
        }
        if let Some(threshold) = get("PASS_THRESHOLD") {
            cfg.completion = CompletionPolicy::new(parse("PASS_THRESHOLD", &threshold)?)
                .map_err(|e| anyhow!("PASS_THRESHOLD: {e}"))?;
        }
        if let Some(window) = get("RESUME_PROTECTION_WINDOW") {
            cfg.runtime.resume_protection_window = parse("RESUME_PROTECTION_WINDOW", &window)?;
        }
        if let Some(secs) = get("AUTO_COMMIT_SECS") {
            let secs: u64 = parse("AUTO_COMMIT_SECS", &secs)?;
            if secs == 0 {
                return Err(anyhow!("AUTO_COMMIT_SECS must be at least 1"));
            }
            cfg.runtime.auto_commit_interval = Duration::from_secs(secs);
        }
        Ok(cfg)
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid {key} value {value:?}"))
}
