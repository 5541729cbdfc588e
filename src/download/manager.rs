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

//! Download manager: one program from catalog to files on disk
//!
//! # Run Flow
//! 1. Check that every export destination is writable
//! 2. Open the cache store
//! 3. Resolve the program's chapter list (cache first unless bypassed)
//! 4. Resolve each chapter to a link, skipping chapters without the
//!    requested quality; descriptors go through the cache store too
//! 5. Close the cache store
//! 6. Export the CSV listing and manifest when paths are given
//! 7. Unless listing only, transfer every link through the worker pool
//! 8. Write the failure log
//!
//! Configuration problems, unwritable export paths included, stop the run
//! before step 2. After that, per-chapter and per-file problems end up in the
//! report and the run carries on.

use crate::api::catalog::CatalogClient;
use crate::api::client::ApiClient;
use crate::api::links::{LinkQuery, LinkResolver, ResolvedLink};
use crate::config::{EngineConfig, RunOptions};
use crate::download::progress::ProgressCallback;
use crate::download::scheduler::{RunReport, TaskOutcome, TaskScheduler};
use crate::download::transfer::{TransferEngine, TransferOptions, TransferTask};
use crate::error::Result;
use crate::file::{export, load_manifest, write_failure_log, PathBuilder};
use crate::storage::{CacheStats, CacheStore, Chapter, Program};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What a run did
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Resolved program; `None` for manifest runs
    pub program: Option<Program>,
    pub from_cache: bool,
    /// Links in (season, episode) order
    pub links: Vec<ResolvedLink>,
    pub report: RunReport,
    pub cache_stats: CacheStats,
}

/// Orchestrates catalog resolution, export and transfers
pub struct DownloadManager {
    config: EngineConfig,
    http: Arc<ApiClient>,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl DownloadManager {
    /// Validate the configuration and build the shared API client.
    ///
    /// This is the only place a run can fail for configuration reasons.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate().await?;
        let http = Arc::new(ApiClient::new(&config)?);
        Ok(Self {
            config,
            http,
            progress: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that stops the run; clone it into a signal handler
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Catalog requests issued so far
    pub fn api_requests(&self) -> u64 {
        self.http.requests_sent()
    }

    /// Run one program download as described by `options`
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        options.validate_outputs().await?;

        let cache = Arc::new(CacheStore::open(&self.config.cache_directory).await?);
        let catalog = CatalogClient::new(self.http.clone(), cache.clone(), self.config.max_workers);

        let listing = match catalog
            .resolve(&options.program, self.config.page_size, options.use_cache)
            .await
        {
            Ok(listing) => listing,
            Err(e) => {
                drop(catalog);
                close_cache(cache);
                return Err(e);
            }
        };
        drop(catalog);

        let resolver = LinkResolver::new(
            self.http.clone(),
            PathBuilder::new(&self.config.output_directory),
            self.config.max_workers,
        )
        .with_cache(cache.clone(), options.use_cache);
        let query = LinkQuery {
            quality: options.quality.clone(),
            include_subtitles: options.include_subtitles,
        };
        let resolved = resolver
            .resolve_all(&listing.program, listing.chapters, query, &self.cancel)
            .await;
        // Link resolution is the last cache user; its lifecycle ends here
        drop(resolver);
        let cache_stats = close_cache(cache);

        let mut report = RunReport::default();
        for (chapter, reason) in &resolved.skipped {
            report.push(chapter_label(chapter), TaskOutcome::Skipped(reason.clone()));
        }
        for (chapter, error) in &resolved.failed {
            report.push(chapter_label(chapter), TaskOutcome::Failed(error.to_string()));
        }
        for chapter in &resolved.not_started {
            report.push(chapter_label(chapter), TaskOutcome::NotStarted);
        }
        info!(
            program = %listing.program.slug,
            resolved = resolved.links.len(),
            skipped = resolved.skipped.len(),
            failed = resolved.failed.len(),
            not_started = resolved.not_started.len(),
            "links resolved"
        );

        export(
            &resolved.links,
            options.csv_path.as_deref(),
            options.manifest_path.as_deref(),
        )
        .await?;

        if !options.list_only {
            let transfers = self.transfer_links(&resolved.links, options).await?;
            report.extend(transfers);
        }

        self.write_failures(options, &report).await;
        info!(program = %listing.program.slug, "{}", report.summary());

        Ok(RunSummary {
            program: Some(listing.program),
            from_cache: listing.from_cache,
            links: resolved.links,
            report,
            cache_stats,
        })
    }

    /// Transfer the links of a previously exported manifest; the catalog is
    /// not consulted
    pub async fn run_manifest(&self, manifest: &Path, options: &RunOptions) -> Result<RunSummary> {
        options.validate_outputs().await?;
        let links = load_manifest(manifest).await?;
        info!(path = %manifest.display(), links = links.len(), "manifest loaded");

        let report = self.transfer_links(&links, options).await?;
        self.write_failures(options, &report).await;
        info!(path = %manifest.display(), "{}", report.summary());

        Ok(RunSummary {
            links,
            report,
            ..RunSummary::default()
        })
    }

    /// Plan and run the transfers for a set of links
    pub async fn transfer_links(&self, links: &[ResolvedLink], options: &RunOptions) -> Result<RunReport> {
        let mut engine = TransferEngine::detect(&self.config, options.use_external_engine).await?;
        if let Some(callback) = &self.progress {
            engine = engine.with_progress(callback.clone());
        }

        let transfer = TransferOptions {
            resume: options.resume || options.resume_only,
            resume_only: options.resume_only,
            use_external_engine: options.use_external_engine,
        };

        let mut duplicates = RunReport::default();
        let mut seen = HashSet::new();
        let mut tasks: Vec<TransferTask> = Vec::new();
        for link in links {
            for task in engine.plan(link, transfer).await {
                if seen.insert(task.target.clone()) {
                    tasks.push(task);
                } else {
                    warn!(path = %task.target.display(), "two links share a destination; keeping the first");
                    duplicates.push(
                        task.target.display().to_string(),
                        TaskOutcome::Skipped("duplicate destination".to_string()),
                    );
                }
            }
        }

        let scheduler = TaskScheduler::new(Arc::new(engine), self.config.max_workers);
        let mut report = scheduler.run(tasks, &self.cancel).await;
        report.extend(duplicates);
        Ok(report)
    }

    async fn write_failures(&self, options: &RunOptions, report: &RunReport) {
        let Some(path) = &options.failure_log_path else {
            return;
        };
        match write_failure_log(path, report.failures()).await {
            Ok(count) => info!(path = %path.display(), failures = count, "failure log written"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not write failure log"),
        }
    }
}

fn close_cache(cache: Arc<CacheStore>) -> CacheStats {
    match Arc::try_unwrap(cache) {
        Ok(store) => store.close(),
        Err(shared) => shared.stats(),
    }
}

/// Report subject for chapters that never got a destination path
fn chapter_label(chapter: &Chapter) -> String {
    format!(
        "{} S{:02}E{:02} {}",
        chapter.program, chapter.season, chapter.episode, chapter.title
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_chapter_label() {
        let chapter = Chapter {
            id: "7".to_string(),
            program: "dr-slump".to_string(),
            season: 2,
            episode: 5,
            title: "Gatchan".to_string(),
            qualities: BTreeSet::new(),
            has_subtitles: false,
        };
        assert_eq!(chapter_label(&chapter), "dr-slump S02E05 Gatchan");
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::builder()
            .max_workers(0)
            .output_directory(dir.path().join("out"))
            .cache_directory(dir.path().join("cache"))
            .build();
        let err = DownloadManager::new(config).await.err().unwrap();
        assert!(err.is_fatal());
    }
}
