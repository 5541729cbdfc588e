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

//! Target path derivation
//!
//! Every resolved link maps to exactly one local path, computed only from
//! catalog data so that the same link always lands in the same place:
//!
//! ```text
//! {output}/{program title}/S{season:02}E{episode:02} - {chapter title} [{quality}].{ext}
//! ```
//!
//! Subtitles share the video's stem with a `.vtt` extension.

use crate::error::{Result, Tv3Error};
use crate::storage::Chapter;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};

#[cfg(target_os = "windows")]
const MAX_PATH_LENGTH: usize = 260;
#[cfg(not(target_os = "windows"))]
const MAX_PATH_LENGTH: usize = 4096;

/// Longest file or directory name, in UTF-8 bytes
const MAX_COMPONENT_LENGTH: usize = 255;

/// Room kept for the `.resume.json` sidecar suffix
const MARKER_SUFFIX_RESERVE: usize = 12;

const DEFAULT_VIDEO_EXTENSION: &str = "mp4";
const DEFAULT_SUBTITLE_EXTENSION: &str = "vtt";

lazy_static! {
    static ref RESERVED_CHARS: Regex = Regex::new(r#"[\\/:"*?<>|]+"#).unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Builds target paths under an output root
#[derive(Debug, Clone)]
pub struct PathBuilder {
    base_directory: PathBuf,
}

impl PathBuilder {
    pub fn new<P: Into<PathBuf>>(base_directory: P) -> Self {
        Self {
            base_directory: base_directory.into(),
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// Directory holding every chapter of a program
    pub fn program_dir(&self, program_title: &str) -> PathBuf {
        self.base_directory
            .join(truncate_component(&sanitize_component(program_title), MAX_COMPONENT_LENGTH))
    }

    /// Video file path for a chapter at a quality
    ///
    /// The extension comes from the media URL when it has a plausible one.
    pub fn video_path(
        &self,
        program_title: &str,
        chapter: &Chapter,
        quality: &str,
        media_url: &str,
    ) -> Result<PathBuf> {
        let ext = extension_from_url(media_url).unwrap_or_else(|| DEFAULT_VIDEO_EXTENSION.to_string());
        self.build(program_title, &chapter_stem(chapter, quality), &ext)
    }

    /// Subtitle path, sharing the video's stem
    pub fn subtitle_path(&self, program_title: &str, chapter: &Chapter, quality: &str) -> Result<PathBuf> {
        self.build(program_title, &chapter_stem(chapter, quality), DEFAULT_SUBTITLE_EXTENSION)
    }

    fn build(&self, program_title: &str, stem: &str, ext: &str) -> Result<PathBuf> {
        let max_stem = MAX_COMPONENT_LENGTH - ext.len() - 1 - MARKER_SUFFIX_RESERVE;
        let file_name = format!("{}.{}", truncate_component(stem, max_stem), ext);
        let path = self.program_dir(program_title).join(file_name);

        let len = path.to_string_lossy().len();
        if len > MAX_PATH_LENGTH {
            return Err(Tv3Error::invalid_input(format!(
                "Path too long ({} bytes): {}",
                len,
                path.display()
            )));
        }
        Ok(path)
    }
}

/// `S01E07 - Title [720p]`, already sanitized
pub fn chapter_stem(chapter: &Chapter, quality: &str) -> String {
    sanitize_component(&format!(
        "S{:02}E{:02} - {} [{}]",
        chapter.season, chapter.episode, chapter.title, quality
    ))
}

/// Make a string safe as a single path component.
///
/// Runs of reserved characters become `-`, whitespace runs collapse to one
/// space, control characters are dropped, and leading/trailing spaces and
/// dots are trimmed. An empty result becomes `untitled`.
pub fn sanitize_component(name: &str) -> String {
    let replaced = RESERVED_CHARS.replace_all(name, "-");
    let without_controls: String = replaced.chars().filter(|c| !c.is_control() || c.is_whitespace()).collect();
    let collapsed = WHITESPACE.replace_all(&without_controls, " ");
    let trimmed = collapsed.trim().trim_matches('.').trim();

    if trimmed.is_empty() {
        return "untitled".to_string();
    }
    handle_windows_reserved_names(trimmed)
}

fn handle_windows_reserved_names(name: &str) -> String {
    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    let upper = name.to_uppercase();
    let stem = upper.split('.').next().unwrap_or(&upper);
    if RESERVED.contains(&stem) {
        format!("_{}", name)
    } else {
        name.to_string()
    }
}

/// Truncate to at most `max_bytes` UTF-8 bytes on a char boundary
pub fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut index = max_bytes;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    text[..index].trim_end().to_string()
}

/// Lowercased extension of a URL's last path segment, if short and alphanumeric
pub fn extension_from_url(media_url: &str) -> Option<String> {
    let parsed = url::Url::parse(media_url).ok()?;
    let segment = parsed.path_segments()?.last()?.to_string();
    let decoded = urlencoding::decode(&segment).map(|s| s.into_owned()).unwrap_or(segment);
    let (_, ext) = decoded.rsplit_once('.')?;

    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then(|| ext.to_ascii_lowercase())
}
