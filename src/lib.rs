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

//! Catalog sync and media download engine for the 3cat (TV3) catalog.
//!
//! Resolves a program's chapters (cache first), turns them into download
//! links at a chosen quality, exports listings, and transfers the files
//! through a bounded worker pool with resumable transfers.
//!
//! ```no_run
//! use tv3_core::{DownloadManager, EngineConfig, RunOptions};
//!
//! # async fn example() -> tv3_core::Result<()> {
//! let manager = DownloadManager::new(EngineConfig::default()).await?;
//! let mut options = RunOptions::new("dr-slump");
//! options.quality = Some("720p".to_string());
//! let summary = manager.run(&options).await?;
//! println!("{}", summary.report.summary());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod file;
pub mod logging;
pub mod storage;

pub use config::{EngineConfig, RunOptions};
pub use download::{DownloadManager, RunReport, RunSummary, TaskOutcome};
pub use error::{Result, Tv3Error};
