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

//! Transfer progress tracking and reporting
//!
//! # Progress Information
//! - Target path and chapter title for identification
//! - Bytes transferred / total bytes (total may be unknown)
//! - Current speed with a moving average
//! - Estimated time remaining
//! - Transfer state (Pending, Resuming, Transferring, Completed, Failed)
//!
//! Events are throttled to one per 200 ms; state changes and the terminal
//! event are always delivered.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum interval between two throttled progress events
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Lifecycle of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Queued, no bytes requested yet
    Pending,
    /// Continuing from a partial-state marker
    Resuming,
    /// Receiving bytes
    Transferring,
    Completed,
    Failed,
    /// Stopped by cancellation; the marker is left for a later run
    Interrupted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Interrupted
        )
    }
}

/// Progress snapshot for a single transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub target: PathBuf,
    /// Chapter title for display
    pub title: String,
    pub bytes_transferred: u64,
    /// Declared size, if the origin sent one
    pub total_bytes: Option<u64>,
    /// 0.0 - 100.0; 0.0 while the total is unknown
    pub percent_complete: f64,
    /// Bytes per second, moving average
    pub speed: f64,
    pub eta_seconds: Option<u64>,
    pub state: TransferState,
    pub error_message: Option<String>,
}

impl TransferProgress {
    pub fn new(target: PathBuf, title: String) -> Self {
        Self {
            target,
            title,
            bytes_transferred: 0,
            total_bytes: None,
            percent_complete: 0.0,
            speed: 0.0,
            eta_seconds: None,
            state: TransferState::Pending,
            error_message: None,
        }
    }

    fn recalculate(&mut self) {
        self.percent_complete = match self.total_bytes {
            Some(total) if total > 0 => {
                (self.bytes_transferred as f64 * 100.0 / total as f64).min(100.0)
            }
            _ => 0.0,
        };
        self.eta_seconds = match self.total_bytes {
            Some(total) if self.speed > 0.0 => {
                let remaining = total.saturating_sub(self.bytes_transferred);
                Some((remaining as f64 / self.speed) as u64)
            }
            _ => None,
        };
    }

    /// Format speed as human-readable string (e.g., "2.5 MB/s")
    pub fn speed_string(&self) -> String {
        format!("{:.1} MB/s", self.speed / 1_000_000.0)
    }

    /// Format ETA as human-readable string (e.g., "5m 30s")
    pub fn eta_string(&self) -> String {
        let Some(eta) = self.eta_seconds else {
            return "calculating...".to_string();
        };

        let hours = eta / 3600;
        let minutes = (eta % 3600) / 60;
        let seconds = eta % 60;
        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Format bytes as human-readable string (e.g., "45.2 MB")
    pub fn bytes_string(bytes: u64) -> String {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    }

    pub fn display_string(&self) -> String {
        match self.state {
            TransferState::Pending => format!("{}: Pending", self.title),
            TransferState::Resuming | TransferState::Transferring => {
                let total = self
                    .total_bytes
                    .map(Self::bytes_string)
                    .unwrap_or_else(|| "?".to_string());
                format!(
                    "{}: {:.1}% ({} / {}) - {} - {}",
                    self.title,
                    self.percent_complete,
                    Self::bytes_string(self.bytes_transferred),
                    total,
                    self.speed_string(),
                    self.eta_string()
                )
            }
            TransferState::Completed => format!("{}: Completed", self.title),
            TransferState::Failed => format!(
                "{}: Failed - {}",
                self.title,
                self.error_message.as_deref().unwrap_or("Unknown error")
            ),
            TransferState::Interrupted => {
                format!("{}: Interrupted at {:.1}%", self.title, self.percent_complete)
            }
        }
    }
}

/// Callback type for progress updates
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Moving-average speed over a sliding time window
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record the cumulative byte position at the current instant
    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();
        self.samples.push_back((now, position));
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second across the window
    pub fn average_speed(&self) -> f64 {
        let (Some((first_at, first)), Some((last_at, last))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let elapsed = last_at.duration_since(*first_at).as_secs_f64();
        if elapsed > 0.0 {
            last.saturating_sub(*first) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-transfer progress state with throttled callback delivery
pub struct ProgressTracker {
    progress: TransferProgress,
    speed: SpeedTracker,
    last_emit: Option<Instant>,
    interval: Duration,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(target: PathBuf, title: String, callback: Option<ProgressCallback>) -> Self {
        Self {
            progress: TransferProgress::new(target, title),
            speed: SpeedTracker::new(),
            last_emit: None,
            interval: PROGRESS_INTERVAL,
            callback,
        }
    }

    pub fn snapshot(&self) -> &TransferProgress {
        &self.progress
    }

    /// Enter a new non-terminal state; always emitted
    pub fn set_state(&mut self, state: TransferState, bytes: u64, total: Option<u64>) {
        self.progress.state = state;
        self.progress.total_bytes = total;
        self.progress.bytes_transferred = bytes;
        self.speed.reset();
        self.speed.add_position(bytes);
        self.progress.speed = 0.0;
        self.progress.recalculate();
        self.emit();
    }

    /// Record the current byte position. Positions never move backwards
    /// between state changes. Emits at most once per interval.
    pub fn update(&mut self, bytes: u64) {
        if bytes < self.progress.bytes_transferred {
            return;
        }
        self.progress.bytes_transferred = bytes;
        self.speed.add_position(bytes);
        self.progress.speed = self.speed.average_speed();
        self.progress.recalculate();

        let due = self
            .last_emit
            .map(|at| at.elapsed() >= self.interval)
            .unwrap_or(true);
        if due {
            self.emit();
        }
    }

    /// Emit the terminal event unconditionally
    pub fn finish(&mut self, state: TransferState, error: Option<String>) {
        self.progress.state = state;
        self.progress.error_message = error;
        if state == TransferState::Completed {
            if let Some(total) = self.progress.total_bytes {
                self.progress.bytes_transferred = self.progress.bytes_transferred.max(total);
            }
            self.progress.eta_seconds = Some(0);
        }
        self.progress.recalculate();
        self.emit();
    }

    fn emit(&mut self) {
        self.last_emit = Some(Instant::now());
        if let Some(callback) = &self.callback {
            callback(self.progress.clone());
        }
    }
}
