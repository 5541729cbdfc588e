// TV3 Downloader - Catalog Sync and Media Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Engine and per-run configuration
//!
//! `EngineConfig` carries everything that stays fixed for a process (endpoints,
//! timeouts, retry budget, worker count, directories). `RunOptions` carries the
//! choices a front end makes for one program download.
//!
//! Configuration problems are the only process-fatal errors: `validate()` runs
//! before any task is scheduled and refuses to start when the output root or
//! cache directory cannot be written.

use crate::error::{Result, Tv3Error};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Public 3cat API root
pub const DEFAULT_API_BASE: &str = "https://api.3cat.cat";

/// Default bounded worker count for resolution and transfers
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Default number of chapters requested per catalog page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Persist partial-transfer state every 1 MiB
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 1024 * 1024;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; tv3-core/0.1)";
const WRITE_CHECK_NAME: &str = ".tv3-write-check";

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt
    pub base_delay_ms: u64,
    /// Hard cap for a single delay
    pub max_delay_ms: u64,
    /// Add up to half of `base_delay_ms` of random jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        let jitter_range = self.base_delay_ms / 2;
        if !self.jitter || jitter_range == 0 {
            return Duration::from_millis(delay_ms);
        }

        let jitter = rand::thread_rng().gen_range(0..jitter_range);
        Duration::from_millis((delay_ms + jitter).min(self.max_delay_ms))
    }
}

/// External download engine settings (aria2c-compatible command line)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalEngineConfig {
    /// Executable name or path
    pub binary: String,
    /// Value passed as both `--max-connection-per-server` and `--split`
    pub connections_per_server: u32,
    /// How long an interrupted engine may keep running to save its own state
    pub cancel_grace_secs: u64,
}

impl Default for ExternalEngineConfig {
    fn default() -> Self {
        Self {
            binary: "aria2c".to_string(),
            connections_per_server: 4,
            cancel_grace_secs: 5,
        }
    }
}

/// Process-wide engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Catalog API root (no trailing slash needed)
    pub api_base_url: String,
    pub user_agent: String,
    /// Timeout for catalog requests, whole request
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Maximum silence between two body chunks of a media transfer
    pub read_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub page_size: u32,
    pub max_workers: usize,
    /// Root directory for downloaded media
    pub output_directory: PathBuf,
    /// One JSON record per program lives here
    pub cache_directory: PathBuf,
    pub checkpoint_interval_bytes: u64,
    pub external_engine: ExternalEngineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 20,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            output_directory: PathBuf::from("downloads"),
            cache_directory: PathBuf::from("cache"),
            checkpoint_interval_bytes: DEFAULT_CHECKPOINT_BYTES,
            external_engine: ExternalEngineConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from a JSON file; absent fields keep their defaults
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Tv3Error::fs(path, e))?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            Tv3Error::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Apply `TV3_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(base) = std::env::var("TV3_API_BASE") {
            self.api_base_url = base;
        }
        if let Ok(dir) = std::env::var("TV3_OUTPUT_DIR") {
            self.output_directory = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("TV3_CACHE_DIR") {
            self.cache_directory = PathBuf::from(dir);
        }
        if let Ok(workers) = std::env::var("TV3_WORKERS") {
            self.max_workers = workers.trim().parse().map_err(|_| {
                Tv3Error::InvalidConfiguration(format!("TV3_WORKERS is not a number: {}", workers))
            })?;
        }
        Ok(())
    }

    /// Check everything that must hold before the first task starts
    pub async fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Tv3Error::InvalidConfiguration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Tv3Error::InvalidConfiguration(
                "page_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Tv3Error::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let base = url::Url::parse(&self.api_base_url).map_err(|e| {
            Tv3Error::InvalidConfiguration(format!("api_base_url '{}': {}", self.api_base_url, e))
        })?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(Tv3Error::InvalidConfiguration(format!(
                "api_base_url must be http(s): {}",
                self.api_base_url
            )));
        }

        ensure_writable_dir(&self.output_directory).await?;
        ensure_writable_dir(&self.cache_directory).await?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Create the directory if needed and prove it accepts writes
async fn ensure_writable_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        Tv3Error::InvalidConfiguration(format!("cannot create {}: {}", dir.display(), e))
    })?;

    let check = dir.join(WRITE_CHECK_NAME);
    tokio::fs::write(&check, b"ok").await.map_err(|e| {
        Tv3Error::InvalidConfiguration(format!("{} is not writable: {}", dir.display(), e))
    })?;
    let _ = tokio::fs::remove_file(&check).await;

    debug!(dir = %dir.display(), "directory is writable");
    Ok(())
}

/// Builder for EngineConfig
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn output_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.output_directory = dir.into();
        self
    }

    pub fn cache_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.cache_directory = dir.into();
        self
    }

    pub fn checkpoint_interval_bytes(mut self, bytes: u64) -> Self {
        self.config.checkpoint_interval_bytes = bytes.max(1);
        self
    }

    pub fn read_timeout_secs(mut self, secs: u64) -> Self {
        self.config.read_timeout_secs = secs;
        self
    }

    pub fn external_engine(mut self, engine: ExternalEngineConfig) -> Self {
        self.config.external_engine = engine;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Choices a front end makes for one program download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Program slug, e.g. `dr-slump`
    pub program: String,
    /// Quality label filter; `None` picks the best advertised quality
    pub quality: Option<String>,
    pub include_subtitles: bool,
    /// Answer from the cache store when it has the program
    pub use_cache: bool,
    /// Continue from partial-state markers instead of restarting
    pub resume: bool,
    /// Only transfer files that already have a partial-state marker
    pub resume_only: bool,
    pub use_external_engine: bool,
    pub csv_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub failure_log_path: Option<PathBuf>,
    /// Resolve and export, but transfer nothing
    pub list_only: bool,
}

impl RunOptions {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            quality: None,
            include_subtitles: true,
            use_cache: true,
            resume: true,
            resume_only: false,
            use_external_engine: false,
            csv_path: None,
            manifest_path: None,
            failure_log_path: None,
            list_only: false,
        }
    }

    /// Prove every export destination can be written before any work starts.
    ///
    /// # Errors
    /// `InvalidConfiguration` if a parent directory cannot be created or
    /// written, or if a path names a directory
    pub async fn validate_outputs(&self) -> Result<()> {
        for path in [&self.csv_path, &self.manifest_path, &self.failure_log_path]
            .into_iter()
            .flatten()
        {
            if tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
                return Err(Tv3Error::InvalidConfiguration(format!(
                    "{} is a directory",
                    path.display()
                )));
            }
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            ensure_writable_dir(parent).await?;
        }
        Ok(())
    }
}
