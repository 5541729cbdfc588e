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


//! Catalog data models
//!
//! Programs and chapters are created by the catalog client (from API pages or
//! from the cache store) and never mutated afterwards within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Current on-disk layout of a cache entry
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Current on-disk layout of a descriptor entry
pub const DESCRIPTOR_FORMAT_VERSION: u32 = 1;

/// A series/show resolved from its catalog slug
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Catalog slug (`nombonic`), e.g. `dr-slump`
    pub slug: String,
    /// Numeric catalog id used for chapter pagination
    pub catalog_id: String,
    /// Display title
    pub title: String,
}

/// A single episode within a program's season structure
///
/// Uniquely identified by (program, season, episode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Catalog content id, used to look up the media descriptor
    pub id: String,
    /// Slug of the owning program
    pub program: String,
    pub season: u32,
    pub episode: u32,
    pub title: String,
    /// Advertised quality labels (e.g. "720p", "1080p")
    pub qualities: BTreeSet<String>,
    /// Whether the catalog advertises subtitles for this chapter
    pub has_subtitles: bool,
}

impl Chapter {
    /// Sort key used for catalog normalization
    pub fn order_key(&self) -> (u32, u32) {
        (self.season, self.episode)
    }

    /// Find the advertised quality matching a filter.
    ///
    /// Matching is case-insensitive and accepts a filter that is a substring of
    /// the label, so `720` matches `720p`. An exact match wins over a substring.
    pub fn matching_quality(&self, filter: &str) -> Option<&str> {
        let wanted = filter.trim().to_lowercase();
        if wanted.is_empty() {
            return self.best_quality();
        }

        self.qualities
            .iter()
            .find(|q| q.to_lowercase() == wanted)
            .or_else(|| self.qualities.iter().find(|q| q.to_lowercase().contains(&wanted)))
            .map(String::as_str)
    }

    /// Highest advertised quality by numeric resolution, then by label
    pub fn best_quality(&self) -> Option<&str> {
        self.qualities
            .iter()
            .max_by(|a, b| quality_rank(a).cmp(&quality_rank(b)).then_with(|| a.cmp(b)))
            .map(String::as_str)
    }
}

/// Numeric rank of a quality label ("1080p" -> 1080, "HD" -> 0)
pub fn quality_rank(label: &str) -> u32 {
    let digits: String = label
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Sort chapters by season then episode; ties keep their original API order
pub fn normalize_order(chapters: &mut [Chapter]) {
    // sort_by_key is stable
    chapters.sort_by_key(Chapter::order_key);
}

/// Cached catalog record for one program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub format_version: u32,
    pub program: Program,
    /// Full chapter list, already normalized
    pub chapters: Vec<Chapter>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(program: Program, chapters: Vec<Chapter>) -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION,
            program,
            chapters,
            fetched_at: Utc::now(),
        }
    }
}

/// A downloadable video rendition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRendition {
    pub label: String,
    pub url: String,
}

/// Cached media descriptor for one chapter, reduced to what link resolution
/// reads from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub format_version: u32,
    pub chapter_id: String,
    /// MP4 renditions in descriptor order
    pub renditions: Vec<VideoRendition>,
    pub subtitle_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl DescriptorEntry {
    pub fn new(chapter_id: &str, renditions: Vec<VideoRendition>, subtitle_url: Option<String>) -> Self {
        Self {
            format_version: DESCRIPTOR_FORMAT_VERSION,
            chapter_id: chapter_id.to_string(),
            renditions,
            subtitle_url,
            fetched_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(id: &str, season: u32, episode: u32, qualities: &[&str]) -> Chapter {
        Chapter {
            id: id.to_string(),
            program: "dr-slump".to_string(),
            season,
            episode,
            title: format!("Capitol {}", episode),
            qualities: qualities.iter().map(|q| q.to_string()).collect(),
            has_subtitles: false,
        }
    }

    #[test]
    fn test_normalize_order_is_stable() {
        let mut chapters = vec![
            chapter("c", 2, 1, &[]),
            chapter("a", 1, 3, &[]),
            chapter("first-dup", 1, 1, &[]),
            chapter("second-dup", 1, 1, &[]),
        ];
        normalize_order(&mut chapters);
        let ids: Vec<&str> = chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["first-dup", "second-dup", "a", "c"]);
    }

    #[test]
    fn test_matching_quality() {
        let c = chapter("1", 1, 1, &["480p", "720p", "1080p"]);
        assert_eq!(c.matching_quality("720p"), Some("720p"));
        assert_eq!(c.matching_quality("720"), Some("720p"));
        assert_eq!(c.matching_quality("720P"), Some("720p"));
        assert_eq!(c.matching_quality("2160p"), None);
        assert_eq!(c.matching_quality(""), Some("1080p"));
    }

    #[test]
    fn test_best_quality() {
        assert_eq!(chapter("1", 1, 1, &["480p", "1080p", "720p"]).best_quality(), Some("1080p"));
        assert_eq!(chapter("1", 1, 1, &["HD"]).best_quality(), Some("HD"));
        assert_eq!(chapter("1", 1, 1, &[]).best_quality(), None);
    }

    #[test]
    fn test_quality_rank() {
        assert_eq!(quality_rank("1080p"), 1080);
        assert_eq!(quality_rank("mp4 720"), 720);
        assert_eq!(quality_rank("HD"), 0);
    }
}
