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


//! Catalog models and the on-disk cache store
//!
//! The cache keeps one JSON record per program, and one per chapter media
//! descriptor, so a repeated run can resolve a catalog and its links without
//! touching the network.
//!
//! # Usage Example
//! ```no_run
//! use tv3_core::storage::CacheStore;
//!
//! # async fn example() -> tv3_core::error::Result<()> {
//! let store = CacheStore::open("./cache").await?;
//! if let Some(entry) = store.get("dr-slump").await? {
//!     println!("{} chapters cached", entry.chapters.len());
//! }
//! store.close();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod models;

// Re-export commonly used types
pub use cache::{CacheStats, CacheStore};
pub use models::{normalize_order, CacheEntry, Chapter, DescriptorEntry, Program, VideoRendition};
