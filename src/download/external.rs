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

//! External download engine (aria2c)
//!
//! The engine is an opaque backend: it gets the URL, the destination and the
//! resume flag, and its exit status decides the outcome. Its own retries and
//! segmenting are not managed here.
//!
//! # Invocation
//! ```text
//! aria2c --file-allocation=none --max-connection-per-server=N --split=N
//!        --continue=<resume> --auto-file-renaming=false --allow-overwrite=<!resume>
//!        --dir <dir> --out <name> <url>
//! ```
//!
//! aria2c keeps its own `<file>.aria2` control file next to a partial
//! download and only a later `--continue` can use it. The transfer engine
//! also writes a marker tagged for this backend, so a destination is never
//! taken as complete when the engine died before saving its control file.
//!
//! # Cancellation
//! The engine gets SIGINT first so it can save its control file, then
//! `cancel_grace_secs` to exit. Only after that is it killed.

use crate::config::ExternalEngineConfig;
use crate::download::progress::ProgressTracker;
use crate::error::{Result, Tv3Error};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Suffix of aria2c's control file
pub const CONTROL_SUFFIX: &str = ".aria2";

/// Output lines kept for the failure message
const TAIL_LINES: usize = 8;

/// Handle to a detected, usable external engine
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    config: ExternalEngineConfig,
    version: String,
}

impl ExternalEngine {
    /// Check `<binary> --version`.
    ///
    /// # Errors
    /// - `EngineNotFound` if the binary is not on PATH
    /// - `EngineError` if it runs but does not report success
    pub async fn detect(config: &ExternalEngineConfig) -> Result<Self> {
        let output = Command::new(&config.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Tv3Error::EngineNotFound(config.binary.clone())
                } else {
                    Tv3Error::engine_failed(&config.binary, format!("failed to execute: {}", e), None)
                }
            })?;

        if !output.status.success() {
            return Err(Tv3Error::engine_failed(
                &config.binary,
                "version check failed",
                output.status.code(),
            ));
        }

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        debug!(binary = %config.binary, %version, "external engine available");

        Ok(Self {
            config: config.clone(),
            version,
        })
    }

    pub fn binary(&self) -> &str {
        &self.config.binary
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Control file aria2c leaves next to a partial download
    pub fn control_path(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(CONTROL_SUFFIX);
        target.with_file_name(name)
    }

    /// Command-line arguments for one transfer
    pub fn build_args(&self, url: &str, target: &Path, resume: bool) -> Result<Vec<String>> {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = target
            .file_name()
            .ok_or_else(|| Tv3Error::invalid_input(format!("not a file path: {}", target.display())))?;
        let connections = self.config.connections_per_server.max(1);

        Ok(vec![
            "--file-allocation=none".to_string(),
            format!("--max-connection-per-server={}", connections),
            format!("--split={}", connections),
            format!("--continue={}", resume),
            "--auto-file-renaming=false".to_string(),
            format!("--allow-overwrite={}", !resume),
            "--dir".to_string(),
            dir.to_string_lossy().into_owned(),
            "--out".to_string(),
            name.to_string_lossy().into_owned(),
            url.to_string(),
        ])
    }

    /// Run the engine to completion and return the final file size.
    ///
    /// On cancellation the process is interrupted, then killed if it is still
    /// running after the grace period.
    pub async fn run(
        &self,
        url: &str,
        target: &Path,
        resume: bool,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<u64> {
        let args = self.build_args(url, target, resume)?;
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Tv3Error::fs(parent, e))?;
        }

        info!(binary = %self.config.binary, path = %target.display(), resume, "delegating transfer");
        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Tv3Error::EngineNotFound(self.config.binary.clone())
                } else {
                    Tv3Error::engine_failed(&self.config.binary, format!("failed to execute: {}", e), None)
                }
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout = child
            .stdout
            .take()
            .map(|out| spawn_tail_reader(out, Some(tx)));
        let stderr = child.stderr.take().map(|err| spawn_tail_reader(err, None));

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,
                Some((done, _total)) = rx.recv() => tracker.update(done),
                status = child.wait() => break Some(status),
            }
        };

        let Some(status) = status else {
            self.stop(&mut child, target).await;
            return Err(Tv3Error::Cancelled);
        };
        let status = status.map_err(|e| {
            Tv3Error::engine_failed(&self.config.binary, format!("wait failed: {}", e), None)
        })?;

        let mut tail = Vec::new();
        for reader in [stdout, stderr].into_iter().flatten() {
            if let Ok(lines) = reader.await {
                tail.extend(lines);
            }
        }

        if !status.success() {
            let message = if tail.is_empty() {
                format!("exited with {}", status)
            } else {
                tail.join(" | ")
            };
            return Err(Tv3Error::engine_failed(&self.config.binary, message, status.code()));
        }

        let bytes = tokio::fs::metadata(target)
            .await
            .map_err(|e| Tv3Error::fs(target, e))?
            .len();
        tracker.update(bytes);
        Ok(bytes)
    }

    /// Interrupt the engine and wait out the grace period, then kill it
    async fn stop(&self, child: &mut Child, target: &Path) {
        let grace = Duration::from_secs(self.config.cancel_grace_secs);
        if send_interrupt(child) {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => {
                    info!(
                        binary = %self.config.binary,
                        path = %target.display(),
                        status = ?status.ok(),
                        "engine stopped on interrupt"
                    );
                    return;
                }
                Err(_) => warn!(
                    binary = %self.config.binary,
                    grace_secs = self.config.cancel_grace_secs,
                    "engine ignored interrupt; killing"
                ),
            }
        }

        if let Err(e) = child.start_kill() {
            debug!(binary = %self.config.binary, error = %e, "kill failed");
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!(binary = %self.config.binary, "engine did not exit after kill");
        }
    }
}

/// Send SIGINT; `false` when the process is gone or the signal failed
#[cfg(unix)]
fn send_interrupt(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "could not interrupt engine");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) -> bool {
    false
}

/// Read lines to the end, forwarding parsed progress, and keep the last few
fn spawn_tail_reader<R>(reader: R, progress: Option<mpsc::UnboundedSender<(u64, u64)>>) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if let (Some(tx), Some(p)) = (&progress, parse_progress(&line)) {
                let _ = tx.send(p);
            }
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect()
    })
}

/// Parse a progress line such as
/// `[#2089b0 400.0KiB/33.2MiB(1%) CN:1 DL:115.7KiB ETA:4m51s]`
fn parse_progress(line: &str) -> Option<(u64, u64)> {
    let start = line.find("[#")?;
    let field = line[start..].split_whitespace().nth(1)?;
    let sizes = field.split('(').next()?;
    let (done, total) = sizes.split_once('/')?;
    Some((parse_size(done)?, parse_size(total)?))
}

fn parse_size(value: &str) -> Option<u64> {
    let units: [(&str, f64); 4] = [
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("KiB", 1024.0),
        ("B", 1.0),
    ];
    units.iter().find_map(|(suffix, factor)| {
        value
            .strip_suffix(suffix)
            .and_then(|n| n.parse::<f64>().ok())
            .map(|n| (n * factor) as u64)
    })
}
