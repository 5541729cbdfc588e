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

//! Transfer engine
//!
//! Turns a resolved link into one or two file transfers (video, then the
//! subtitle when present) and runs each through the backend chosen when the
//! task was built.
//!
//! # States
//! ```text
//! Pending -> [Resuming] -> Transferring -> Completed
//!                 \______________\_______-> Failed | Interrupted
//! ```
//! A failed or interrupted transfer keeps its partial state for a later run.
//!
//! # Destination ownership
//! A destination path is claimed for the whole lifetime of its transfer. A
//! second task for the same path fails with `TargetInUse` instead of writing
//! into the same file.

use crate::api::links::ResolvedLink;
use crate::config::EngineConfig;
use crate::download::external::ExternalEngine;
use crate::download::progress::{ProgressCallback, ProgressTracker, TransferState};
use crate::download::stream::{MarkerBackend, NativeTransfer, PartialState};
use crate::error::{Result, Tv3Error};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backend a task runs on, fixed when the task is built
#[derive(Debug, Clone)]
pub enum Backend {
    Native,
    External(ExternalEngine),
}

impl Backend {
    pub fn name(&self) -> &str {
        match self {
            Backend::Native => "native",
            Backend::External(engine) => engine.binary(),
        }
    }
}

/// Per-run transfer switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub resume: bool,
    /// Only continue destinations that already have partial state
    pub resume_only: bool,
    pub use_external_engine: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            resume: true,
            resume_only: false,
            use_external_engine: false,
        }
    }
}

/// One file to transfer
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub url: String,
    pub target: PathBuf,
    /// Display title for progress events
    pub title: String,
    pub resume: bool,
    pub resume_only: bool,
    pub backend: Backend,
}

/// How a successful transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    ResumedAndCompleted { resumed_from: u64, bytes: u64 },
    /// Destination already present with no partial state; nothing fetched
    AlreadyComplete,
    /// Resume-only run and the destination had nothing to resume
    NothingToResume,
}

impl TransferOutcome {
    /// Whether bytes were actually moved
    pub fn transferred(&self) -> bool {
        matches!(
            self,
            TransferOutcome::Completed { .. } | TransferOutcome::ResumedAndCompleted { .. }
        )
    }
}

/// Set of destination paths currently owned by a transfer
#[derive(Debug, Clone, Default)]
pub struct PathClaims {
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PathClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive ownership of `path` until the returned claim drops
    pub fn claim(&self, path: &Path) -> Result<PathClaim> {
        let mut claimed = self
            .claimed
            .lock()
            .map_err(|_| Tv3Error::internal("destination claim set poisoned"))?;
        if !claimed.insert(path.to_path_buf()) {
            return Err(Tv3Error::TargetInUse(path.display().to_string()));
        }
        Ok(PathClaim {
            claims: self.claimed.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        self.claimed
            .lock()
            .map(|claimed| claimed.contains(path))
            .unwrap_or(false)
    }
}

/// Ownership of one destination path; released on drop
#[derive(Debug)]
pub struct PathClaim {
    claims: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        if let Ok(mut claimed) = self.claims.lock() {
            claimed.remove(&self.path);
        }
    }
}

/// Runs transfer tasks on the native or external backend
pub struct TransferEngine {
    native: NativeTransfer,
    external: Option<ExternalEngine>,
    claims: PathClaims,
    progress: Option<ProgressCallback>,
}

impl TransferEngine {
    pub fn new(config: &EngineConfig, external: Option<ExternalEngine>) -> Result<Self> {
        Ok(Self {
            native: NativeTransfer::new(config)?,
            external,
            claims: PathClaims::new(),
            progress: None,
        })
    }

    /// Build an engine, probing the external engine when one is wanted.
    ///
    /// An unavailable external engine is not an error: every task then runs
    /// natively.
    pub async fn detect(config: &EngineConfig, want_external: bool) -> Result<Self> {
        let external = if want_external {
            match ExternalEngine::detect(&config.external_engine).await {
                Ok(engine) => {
                    info!(binary = engine.binary(), version = engine.version(), "using external engine");
                    Some(engine)
                }
                Err(e) => {
                    warn!(error = %e, "external engine unavailable; falling back to native transfers");
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, external)
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn external_engine(&self) -> Option<&ExternalEngine> {
        self.external.as_ref()
    }

    /// Whether a destination carries resumable state from either backend
    pub async fn has_partial_state(target: &Path) -> bool {
        PartialState::marker_exists(target).await
            || tokio::fs::try_exists(ExternalEngine::control_path(target))
                .await
                .unwrap_or(false)
    }

    /// Pick the backend for one destination.
    ///
    /// A native marker pins the native path when resuming, since the external
    /// engine cannot continue from it.
    pub async fn backend_for(&self, target: &Path, options: TransferOptions) -> Backend {
        let Some(engine) = self.external.as_ref().filter(|_| options.use_external_engine) else {
            return Backend::Native;
        };
        if options.resume {
            if let Ok(Some(marker)) = PartialState::load(target).await {
                if marker.backend == MarkerBackend::Native {
                    debug!(path = %target.display(), "native marker present; keeping native backend");
                    return Backend::Native;
                }
            }
        }
        Backend::External(engine.clone())
    }

    /// Tasks for one link: the video, then the subtitle when it has one.
    /// Subtitles are small and always go through the native path.
    pub async fn plan(&self, link: &ResolvedLink, options: TransferOptions) -> Vec<TransferTask> {
        let title = format!(
            "{} S{:02}E{:02} {}",
            link.program_title, link.chapter.season, link.chapter.episode, link.chapter.title
        );

        let mut tasks = vec![TransferTask {
            url: link.video_url.clone(),
            target: link.target_path.clone(),
            title: title.clone(),
            resume: options.resume,
            resume_only: options.resume_only,
            backend: self.backend_for(&link.target_path, options).await,
        }];

        if let (Some(url), Some(path)) = (&link.subtitle_url, &link.subtitle_path) {
            tasks.push(TransferTask {
                url: url.clone(),
                target: path.clone(),
                title: format!("{} (subtitles)", title),
                resume: options.resume,
                resume_only: options.resume_only,
                backend: Backend::Native,
            });
        }
        tasks
    }

    /// Run one task to a terminal state
    pub async fn transfer(&self, task: &TransferTask, cancel: &CancellationToken) -> Result<TransferOutcome> {
        let _claim = self.claims.claim(&task.target)?;
        let mut tracker = ProgressTracker::new(task.target.clone(), task.title.clone(), self.progress.clone());

        let partial = Self::has_partial_state(&task.target).await;
        let exists = tokio::fs::try_exists(&task.target).await.unwrap_or(false);

        if exists && !partial {
            debug!(path = %task.target.display(), "destination complete; skipping");
            return Ok(TransferOutcome::AlreadyComplete);
        }
        if task.resume_only && !partial {
            return Ok(TransferOutcome::NothingToResume);
        }

        let result = match &task.backend {
            Backend::Native => self.run_native(task, cancel, &mut tracker).await,
            Backend::External(engine) => self.run_external(engine, task, cancel, &mut tracker).await,
        };

        match &result {
            Ok(outcome) => {
                self.clear_partial_state(&task.target).await;
                tracker.finish(TransferState::Completed, None);
                info!(
                    path = %task.target.display(),
                    backend = task.backend.name(),
                    outcome = ?outcome,
                    "transfer complete"
                );
            }
            Err(Tv3Error::Cancelled) => {
                tracker.finish(TransferState::Interrupted, None);
            }
            Err(e) => {
                warn!(
                    path = %task.target.display(),
                    backend = task.backend.name(),
                    error = %e,
                    "transfer failed"
                );
                tracker.finish(TransferState::Failed, Some(e.user_message()));
            }
        }
        result
    }

    async fn run_native(
        &self,
        task: &TransferTask,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<TransferOutcome> {
        let done = self
            .native
            .run(&task.url, &task.target, task.resume, cancel, tracker)
            .await?;
        Ok(if done.resumed_from > 0 {
            TransferOutcome::ResumedAndCompleted {
                resumed_from: done.resumed_from,
                bytes: done.bytes,
            }
        } else {
            TransferOutcome::Completed { bytes: done.bytes }
        })
    }

    async fn run_external(
        &self,
        engine: &ExternalEngine,
        task: &TransferTask,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<TransferOutcome> {
        // Only the engine's control file makes its partial bytes trustworthy;
        // without one the destination is transferred again from zero
        let control = tokio::fs::try_exists(ExternalEngine::control_path(&task.target))
            .await
            .unwrap_or(false);
        let resuming = task.resume && control;
        let resumed_from = if resuming {
            tokio::fs::metadata(&task.target).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let state = if resuming {
            TransferState::Resuming
        } else {
            TransferState::Transferring
        };
        tracker.set_state(state, resumed_from, None);

        // Written before the engine starts and removed only on success, so an
        // engine that dies without its control file still leaves the
        // destination marked as partial
        if let Some(parent) = task.target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Tv3Error::fs(parent, e))?;
        }
        PartialState::external(&task.url, &task.target).save().await?;

        let bytes = engine.run(&task.url, &task.target, resuming, cancel, tracker).await?;
        Ok(if resumed_from > 0 {
            TransferOutcome::ResumedAndCompleted { resumed_from, bytes }
        } else {
            TransferOutcome::Completed { bytes }
        })
    }

    /// Remove leftovers of either backend once the destination is complete
    async fn clear_partial_state(&self, target: &Path) {
        if let Err(e) = PartialState::delete(target).await {
            warn!(path = %target.display(), error = %e, "could not remove marker");
        }
        let control = ExternalEngine::control_path(target);
        match tokio::fs::remove_file(&control).await {
            Ok(()) => debug!(path = %control.display(), "removed stale engine control file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %control.display(), error = %e, "could not remove engine control file"),
        }
    }
}
