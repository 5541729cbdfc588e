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

//! Transfers and run orchestration
//!
//! - `stream`: native resumable HTTP transfer with on-disk markers
//! - `external`: delegation to an aria2c-compatible engine
//! - `transfer`: per-task backend choice, destination ownership
//! - `scheduler`: fixed-size worker pool over a FIFO queue
//! - `progress`: throttled per-transfer progress events
//! - `manager`: catalog to disk for one program

pub mod external;
pub mod manager;
pub mod progress;
pub mod scheduler;
pub mod stream;
pub mod transfer;

// Re-export commonly used types
pub use external::ExternalEngine;
pub use manager::{DownloadManager, RunSummary};
pub use progress::{ProgressCallback, TransferProgress, TransferState};
pub use scheduler::{RunCounters, RunReport, TaskOutcome, TaskResult, TaskScheduler};
pub use stream::{MarkerBackend, NativeTransfer, PartialState};
pub use transfer::{Backend, TransferEngine, TransferOptions, TransferOutcome, TransferTask};
