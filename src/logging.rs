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


//! Tracing subscriber setup
//!
//! Console output at INFO (or whatever `RUST_LOG` says), and optionally a
//! DEBUG-level log file next to it so a failed run can be inspected after the
//! fact without re-running with verbose output.

use crate::error::{Result, Tv3Error};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Logging options chosen by the front end
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Console at DEBUG instead of INFO
    pub verbose: bool,
    /// Console at ERROR only
    pub quiet: bool,
    /// Additional DEBUG-level log file
    pub log_file: Option<PathBuf>,
}

/// Install the global subscriber.
///
/// Returns the file appender guard when a log file is configured; keep it
/// alive until the process exits or buffered lines are lost. Calling this
/// twice is harmless: the second call leaves the first subscriber in place.
pub fn init_logging(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let console_filter = if options.quiet {
        EnvFilter::new("error")
    } else if options.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"))
    };

    let console = fmt::layer()
        .with_target(options.verbose)
        .with_filter(console_filter);

    let (file_layer, guard) = match &options.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .ok_or_else(|| Tv3Error::invalid_input(format!("log file has no name: {}", path.display())))?;
            std::fs::create_dir_all(&dir).map_err(|e| Tv3Error::fs(&dir, e))?;

            let appender = tracing_appender::rolling::never(&dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // Already-installed subscriber is fine (tests, embedding front ends)
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();

    Ok(guard)
}
