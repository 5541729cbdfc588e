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

//! On-disk catalog cache
//!
//! One JSON record per program under the cache directory, keyed by slug, and
//! one per chapter media descriptor under `descriptors/`, keyed by chapter id.
//! Presence-based: a hit always answers without network I/O, there is no TTL.
//! Entries are replaced whole through a temp file and a rename, so a reader
//! sees either the previous record or the new one, never a torn write.
//!
//! The store is an explicit handle: opened at run start, closed at run end.

use crate::error::{Result, Tv3Error};
use crate::file::{write_atomic, TEMP_SUFFIX};
use crate::storage::models::{CacheEntry, DescriptorEntry, CACHE_FORMAT_VERSION, DESCRIPTOR_FORMAT_VERSION};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "json";
const DESCRIPTOR_DIR: &str = "descriptors";

/// Counters for one open/close lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

/// Handle to the per-program catalog cache
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStore {
    /// Open the store, creating the directory and clearing temp files left by
    /// an interrupted write
    pub async fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Tv3Error::fs(&dir, e))?;

        clear_temp_files(&dir).await?;
        let descriptors = dir.join(DESCRIPTOR_DIR);
        if tokio::fs::try_exists(&descriptors).await.unwrap_or(false) {
            clear_temp_files(&descriptors).await?;
        }

        debug!(dir = %dir.display(), "cache store opened");
        Ok(Self {
            dir,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for a program slug
    pub fn entry_path(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", cache_key(slug), ENTRY_EXTENSION))
    }

    /// Look up a program's cached catalog.
    ///
    /// An unreadable or undecodable record counts as a miss; the next
    /// successful fetch replaces it.
    pub async fn get(&self, slug: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(slug);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(Tv3Error::fs(&path, e)),
        };

        match serde_json::from_str::<CacheEntry>(&json) {
            Ok(entry)
                if entry.format_version == CACHE_FORMAT_VERSION
                    && cache_key(&entry.program.slug) == cache_key(slug) =>
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(program = slug, chapters = entry.chapters.len(), "cache hit");
                Ok(Some(entry))
            }
            Ok(entry) => {
                warn!(
                    program = slug,
                    version = entry.format_version,
                    "ignoring cache record with unexpected version or slug"
                );
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                warn!(program = slug, error = %e, "ignoring unreadable cache record");
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Replace a program's record atomically
    pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.program.slug);
        let json = serde_json::to_vec_pretty(entry)?;
        write_atomic(&path, &json).await?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(
            program = %entry.program.slug,
            chapters = entry.chapters.len(),
            path = %path.display(),
            "cache record written"
        );
        Ok(())
    }

    /// Drop a program's record; returns whether one existed
    pub async fn remove(&self, slug: &str) -> Result<bool> {
        let path = self.entry_path(slug);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Tv3Error::fs(&path, e)),
        }
    }

    /// Path of the media descriptor record for a chapter id
    pub fn descriptor_path(&self, chapter_id: &str) -> PathBuf {
        self.dir
            .join(DESCRIPTOR_DIR)
            .join(format!("{}.{}", cache_key(chapter_id), ENTRY_EXTENSION))
    }

    /// Look up a chapter's cached media descriptor; same miss rules as `get`
    pub async fn get_descriptor(&self, chapter_id: &str) -> Result<Option<DescriptorEntry>> {
        let path = self.descriptor_path(chapter_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(Tv3Error::fs(&path, e)),
        };

        match serde_json::from_str::<DescriptorEntry>(&json) {
            Ok(entry) if entry.format_version == DESCRIPTOR_FORMAT_VERSION && entry.chapter_id == chapter_id => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            Ok(_) => {
                warn!(chapter = chapter_id, "ignoring descriptor record with unexpected version or id");
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                warn!(chapter = chapter_id, error = %e, "ignoring unreadable descriptor record");
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Replace a chapter's descriptor record atomically
    pub async fn put_descriptor(&self, entry: &DescriptorEntry) -> Result<()> {
        let path = self.descriptor_path(&entry.chapter_id);
        let json = serde_json::to_vec_pretty(entry)?;
        write_atomic(&path, &json).await?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(chapter = %entry.chapter_id, renditions = entry.renditions.len(), "descriptor record written");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// End the store's lifecycle. Writes are already durable at this point;
    /// this reports what the run did with the cache.
    pub fn close(self) -> CacheStats {
        let stats = self.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            writes = stats.writes,
            "cache store closed"
        );
        stats
    }
}

/// Remove temp files left in `dir` by an interrupted write
async fn clear_temp_files(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Tv3Error::fs(dir, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| Tv3Error::fs(dir, e))? {
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
            debug!(path = %entry.path().display(), "removing stale cache temp file");
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

/// File-safe key for a slug or chapter id
fn cache_key(slug: &str) -> String {
    let key: String = slug
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        "_".to_string()
    } else {
        key
    }
}
