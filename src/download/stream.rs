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

//! Native resumable HTTP transfer
//!
//! Bytes are appended directly to the destination file. Progress is recorded
//! in a JSON sidecar marker, `<file name>.resume.json`, next to it.
//!
//! # Marker Invariant
//! The marker is written before the first byte reaches the destination and
//! removed only after the file is synced at its full size. So a destination
//! without a marker is always complete, and one with a marker is partial.
//!
//! # Resume Algorithm
//! 1. Load the marker; truncate the file back to the recorded position
//!    (bytes past the last checkpoint were never confirmed)
//! 2. Request `Range: bytes={position}-`
//! 3. `206`: Content-Range start must equal the position and the total must
//!    match the recorded size; otherwise restart from zero
//! 4. `200` to a ranged request: the origin ignores ranges; restart from
//!    zero, consuming the same response
//! 5. `416` at exactly the recorded size: the file was already complete
//! 6. Checkpoint (flush + marker save) every `checkpoint_interval_bytes`,
//!    on cancellation, and on any mid-body failure

use crate::config::{EngineConfig, RetryPolicy};
use crate::download::progress::{ProgressTracker, TransferState};
use crate::error::{Result, Tv3Error};
use crate::file::write_atomic;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Suffix appended to the destination file name for its marker
pub const MARKER_SUFFIX: &str = ".resume.json";

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Which backend owns a partial destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerBackend {
    #[default]
    Native,
    /// The external engine keeps its own control file; the marker only
    /// records that the destination is unfinished
    External,
}

/// On-disk record of resumable progress for one destination file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialState {
    pub url: String,
    pub target: PathBuf,
    /// Declared total size, when the origin sent one
    pub content_length: Option<u64>,
    /// Bytes confirmed on disk at the last checkpoint
    pub write_position: u64,
    /// Whether the origin has honoured a range request
    pub accept_ranges: bool,
    #[serde(default)]
    pub backend: MarkerBackend,
    pub updated_at: DateTime<Utc>,
}

impl PartialState {
    pub fn new(url: &str, target: &Path) -> Self {
        Self {
            url: url.to_string(),
            target: target.to_path_buf(),
            content_length: None,
            write_position: 0,
            accept_ranges: false,
            backend: MarkerBackend::Native,
            updated_at: Utc::now(),
        }
    }

    /// Marker for a destination handed to the external engine
    pub fn external(url: &str, target: &Path) -> Self {
        Self {
            backend: MarkerBackend::External,
            ..Self::new(url, target)
        }
    }

    /// Marker path for a destination; the full file name is kept so that
    /// `x.mp4` and `x.vtt` get distinct markers
    pub fn marker_path(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(MARKER_SUFFIX);
        target.with_file_name(name)
    }

    pub async fn marker_exists(target: &Path) -> bool {
        tokio::fs::try_exists(Self::marker_path(target))
            .await
            .unwrap_or(false)
    }

    /// Load a destination's marker; `Ok(None)` when there is none
    pub async fn load(target: &Path) -> Result<Option<Self>> {
        let path = Self::marker_path(target);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Tv3Error::fs(&path, e)),
        };
        match serde_json::from_str::<Self>(&json) {
            Ok(state) => Ok(Some(state)),
            Err(e) => Err(Tv3Error::parse_error(
                format!("marker {}: {}", path.display(), e),
                Some(json),
            )),
        }
    }

    pub async fn save(&mut self) -> Result<()> {
        self.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::marker_path(&self.target), &json).await
    }

    pub async fn delete(target: &Path) -> Result<()> {
        let path = Self::marker_path(target);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Tv3Error::fs(&path, e)),
        }
    }
}

/// How a native transfer finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCompletion {
    /// Offset the transfer started from (0 for a fresh transfer)
    pub resumed_from: u64,
    /// Final size on disk
    pub bytes: u64,
}

/// Mutable state of one transfer across attempts
struct Session {
    state: PartialState,
    resumed_from: u64,
    /// A restart from zero already happened; a second size mismatch fails
    restarted: bool,
}

impl Session {
    /// Drop back to offset zero without using up the size-mismatch restart
    fn rewind(&mut self) {
        self.state.write_position = 0;
        self.state.content_length = None;
        self.state.accept_ranges = false;
        self.resumed_from = 0;
    }

    /// Restart after a size mismatch; only one is allowed per transfer
    fn restart(&mut self) {
        self.rewind();
        self.restarted = true;
    }
}

/// Resumable single-connection HTTP downloader
#[derive(Debug, Clone)]
pub struct NativeTransfer {
    client: Client,
    checkpoint_bytes: u64,
    read_timeout: Duration,
    retry: RetryPolicy,
}

impl NativeTransfer {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        // No whole-request timeout: bodies can be large. Stalls are caught
        // per chunk with read_timeout.
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            checkpoint_bytes: config.checkpoint_interval_bytes.max(1),
            read_timeout: config.read_timeout(),
            retry: config.retry.clone(),
        })
    }

    /// Transfer `url` into `target`, resuming from a marker when `resume` is set.
    ///
    /// The caller decides whether the destination is already complete; this
    /// always (re)transfers. Without `resume` any partial file is discarded.
    ///
    /// # Errors
    /// - `Cancelled` after a checkpoint when `cancel` fires
    /// - `InvalidDownloadUrl` for a non-retryable HTTP status
    /// - Transport, timeout and short-body errors once retries are exhausted
    pub async fn run(
        &self,
        url: &str,
        target: &Path,
        resume: bool,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<NativeCompletion> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Tv3Error::fs(parent, e))?;
        }

        let mut session = self.prepare(url, target, resume).await?;
        if session.resumed_from > 0 {
            info!(
                path = %target.display(),
                offset = session.resumed_from,
                total = ?session.state.content_length,
                "resuming transfer"
            );
            tracker.set_state(
                TransferState::Resuming,
                session.resumed_from,
                session.state.content_length,
            );
        } else {
            tracker.set_state(TransferState::Transferring, 0, None);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&mut session, cancel, tracker).await {
                Ok(()) => break,
                Err(Tv3Error::SizeMismatch { expected, actual }) if !session.restarted => {
                    warn!(
                        path = %target.display(),
                        expected,
                        actual,
                        "partial file does not match origin; restarting from zero"
                    );
                    session.restart();
                    tracker.set_state(TransferState::Transferring, 0, None);
                    attempt -= 1;
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        path = %target.display(),
                        attempt,
                        offset = session.state.write_position,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transfer attempt failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Tv3Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        PartialState::delete(target).await?;
        Ok(NativeCompletion {
            resumed_from: session.resumed_from,
            bytes: session.state.write_position,
        })
    }

    /// Work out the starting offset from the marker and the file on disk
    async fn prepare(&self, url: &str, target: &Path, resume: bool) -> Result<Session> {
        let fresh = Session {
            state: PartialState::new(url, target),
            resumed_from: 0,
            restarted: false,
        };
        if !resume {
            return Ok(fresh);
        }

        let marker = match PartialState::load(target).await {
            Ok(marker) => marker,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "unreadable marker; restarting from zero");
                None
            }
        };
        let Some(mut state) = marker.filter(|m| m.backend == MarkerBackend::Native) else {
            return Ok(fresh);
        };

        let on_disk = match tokio::fs::metadata(target).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(Tv3Error::fs(target, e)),
        };

        if on_disk < state.write_position || state.write_position == 0 {
            if on_disk < state.write_position {
                warn!(
                    path = %target.display(),
                    recorded = state.write_position,
                    on_disk,
                    "file shorter than marker; restarting from zero"
                );
            }
            return Ok(fresh);
        }

        if on_disk > state.write_position {
            debug!(
                path = %target.display(),
                recorded = state.write_position,
                on_disk,
                "dropping bytes past the last checkpoint"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(target)
                .await
                .map_err(|e| Tv3Error::fs(target, e))?;
            file.set_len(state.write_position)
                .await
                .map_err(|e| Tv3Error::fs(target, e))?;
        }

        // Signed URLs change between runs; the catalog's current one wins
        state.url = url.to_string();
        state.target = target.to_path_buf();
        Ok(Session {
            resumed_from: state.write_position,
            state,
            restarted: false,
        })
    }

    /// One request/response cycle, writing until the body ends or fails
    async fn attempt(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<()> {
        let offset = session.state.write_position;
        let mut request = self.client.get(&session.state.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Tv3Error::Cancelled),
            response = request.send() => response.map_err(|e| {
                Tv3Error::network_error(
                    format!("Request for {} failed: {}", session.state.url, e),
                    e.is_timeout() || e.is_connect() || e.is_request(),
                )
            })?,
        };

        if !self.accept_response(&response, session, tracker)? {
            // 416 at the recorded size: nothing left to fetch
            return Ok(());
        }

        // The marker exists before any byte lands in the destination
        session.state.save().await?;

        let target = session.state.target.clone();
        let file = if session.state.write_position == 0 {
            File::create(&target).await
        } else {
            OpenOptions::new().append(true).open(&target).await
        }
        .map_err(|e| Tv3Error::fs(&target, e))?;

        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let mut body = response.bytes_stream();
        let mut since_checkpoint = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.checkpoint(&mut writer, session).await?;
                    info!(
                        path = %target.display(),
                        offset = session.state.write_position,
                        "transfer interrupted; marker kept"
                    );
                    return Err(Tv3Error::Cancelled);
                }
                next = tokio::time::timeout(self.read_timeout, body.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    self.checkpoint(&mut writer, session).await?;
                    return Err(Tv3Error::network_error(
                        format!("Body of {} broke off: {}", target.display(), e),
                        true,
                    ));
                }
                Err(_) => {
                    self.checkpoint(&mut writer, session).await?;
                    return Err(Tv3Error::Timeout(self.read_timeout.as_secs()));
                }
            };

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| Tv3Error::fs(&target, e))?;
            session.state.write_position += chunk.len() as u64;
            since_checkpoint += chunk.len() as u64;

            if let Some(total) = session.state.content_length {
                if session.state.write_position > total {
                    return Err(Tv3Error::SizeMismatch {
                        expected: total,
                        actual: session.state.write_position,
                    });
                }
            }

            if since_checkpoint >= self.checkpoint_bytes {
                self.checkpoint(&mut writer, session).await?;
                since_checkpoint = 0;
            }
            tracker.update(session.state.write_position);
        }

        writer.flush().await.map_err(|e| Tv3Error::fs(&target, e))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| Tv3Error::fs(&target, e))?;

        match session.state.content_length {
            Some(total) if session.state.write_position < total => {
                session.state.save().await?;
                Err(Tv3Error::IncompleteTransfer {
                    written: session.state.write_position,
                    expected: total,
                })
            }
            _ => Ok(()),
        }
    }

    /// Validate the response against the session; `Ok(false)` means the file
    /// is already complete
    fn accept_response(
        &self,
        response: &Response,
        session: &mut Session,
        tracker: &mut ProgressTracker,
    ) -> Result<bool> {
        let offset = session.state.write_position;
        let status = response.status();

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let (start, total) = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .unwrap_or((offset, None));

                if start != offset {
                    return Err(Tv3Error::SizeMismatch {
                        expected: offset,
                        actual: start,
                    });
                }
                if let (Some(recorded), Some(total)) = (session.state.content_length, total) {
                    if recorded != total {
                        return Err(Tv3Error::SizeMismatch {
                            expected: recorded,
                            actual: total,
                        });
                    }
                }
                if total.is_some() {
                    session.state.content_length = total;
                }
                session.state.accept_ranges = true;
                Ok(true)
            }

            StatusCode::OK => {
                if offset > 0 {
                    info!(
                        path = %session.state.target.display(),
                        offset,
                        "origin ignored range request; restarting from zero"
                    );
                    session.rewind();
                }
                session.state.content_length = response.content_length();
                tracker.set_state(TransferState::Transferring, 0, session.state.content_length);
                Ok(true)
            }

            StatusCode::RANGE_NOT_SATISFIABLE => {
                if offset > 0 && session.state.content_length == Some(offset) {
                    debug!(path = %session.state.target.display(), "already at full size");
                    return Ok(false);
                }
                if offset == 0 {
                    return Err(Tv3Error::RangeNotSatisfiable { offset });
                }
                Err(Tv3Error::SizeMismatch {
                    expected: session.state.content_length.unwrap_or(0),
                    actual: offset,
                })
            }

            StatusCode::TOO_MANY_REQUESTS => Err(Tv3Error::RateLimitExceeded {
                retry_after_seconds: 1,
                endpoint: session.state.url.clone(),
            }),

            s if s.is_server_error() => Err(Tv3Error::api_failed(
                format!("Media origin returned {}", s),
                Some(s.as_u16()),
                Some(session.state.url.clone()),
            )),

            s => Err(Tv3Error::InvalidDownloadUrl(format!(
                "{} returned {}",
                session.state.url, s
            ))),
        }
    }

    /// Flush buffered bytes and record the position in the marker
    async fn checkpoint(&self, writer: &mut BufWriter<File>, session: &mut Session) -> Result<()> {
        writer
            .flush()
            .await
            .map_err(|e| Tv3Error::fs(&session.state.target, e))?;
        session.state.save().await
    }
}

/// Parse `bytes start-end/total` into `(start, total)`; total is `None` for `*`
pub fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}
