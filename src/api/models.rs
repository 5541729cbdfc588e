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

//! Wire records for the 3cat catalog API
//!
//! The API is loose about shapes: a collection holding a single element is
//! sent as a bare object instead of a one-element array, and numbers arrive
//! as either JSON numbers or strings. These records absorb both so the
//! catalog client only ever sees vectors and `Option<u32>`.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

pub use crate::storage::models::VideoRendition;

/// A field that is either a single object or an array of them
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// Flatten an optional one-or-many field
pub fn items<T>(field: Option<OneOrMany<T>>) -> Vec<T> {
    field.map(OneOrMany::into_vec).unwrap_or_default()
}

/// Deserialize an id that may be a string or a number
fn flexible_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

/// Deserialize a count that may be a number, a numeric string, or junk.
/// Junk becomes `None` rather than an error.
fn flexible_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

// ===== Program listing: GET /programestv =====

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramListResponse {
    pub resposta: ProgramListBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramListBody {
    #[serde(default)]
    pub items: Option<ProgramListItems>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramListItems {
    /// Alphabetical groups
    #[serde(default)]
    pub lletra: Option<OneOrMany<LetterGroup>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LetterGroup {
    #[serde(default)]
    pub item: Option<OneOrMany<ProgramItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramItem {
    #[serde(default, deserialize_with = "flexible_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub titol: Option<String>,
    /// Slug
    #[serde(default)]
    pub nombonic: Option<String>,
}

impl ProgramListResponse {
    /// All programs across every letter group
    pub fn programs(self) -> Vec<ProgramItem> {
        let groups = self.resposta.items.and_then(|i| i.lletra);
        items(groups)
            .into_iter()
            .flat_map(|group| items(group.item))
            .collect()
    }
}

// ===== Chapter pages: GET /videos =====

#[derive(Debug, Clone, Deserialize)]
pub struct VideoPageResponse {
    pub resposta: VideoPageBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoPageBody {
    #[serde(default)]
    pub paginacio: Option<Pagination>,
    #[serde(default)]
    pub items: Option<VideoItems>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default, deserialize_with = "flexible_u32")]
    pub pagina_actual: Option<u32>,
    #[serde(default, deserialize_with = "flexible_u32")]
    pub total_pagines: Option<u32>,
    #[serde(default, deserialize_with = "flexible_u32")]
    pub total_items: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoItems {
    #[serde(default)]
    pub item: Option<OneOrMany<VideoItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoItem {
    #[serde(default, deserialize_with = "flexible_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub titol: Option<String>,
    /// Episode number
    #[serde(default, deserialize_with = "flexible_u32")]
    pub capitol: Option<u32>,
    /// Season number
    #[serde(default, deserialize_with = "flexible_u32")]
    pub temporada: Option<u32>,
    #[serde(default)]
    pub variants: Option<OneOrMany<Variant>>,
    /// Either a flag or a list of subtitle tracks
    #[serde(default)]
    pub subtitols: Option<Value>,
}

/// A quality variant, sent either as a bare label or as an object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Label(String),
    Detailed {
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        qualitat: Option<String>,
    },
}

impl Variant {
    pub fn label(&self) -> Option<&str> {
        let label = match self {
            Variant::Label(label) => Some(label.as_str()),
            Variant::Detailed { label, qualitat } => label.as_deref().or(qualitat.as_deref()),
        };
        label.map(str::trim).filter(|l| !l.is_empty())
    }
}

impl VideoItem {
    pub fn quality_labels(&self) -> Vec<String> {
        self.variants
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .filter_map(Variant::label)
            .map(str::to_string)
            .collect()
    }

    pub fn has_subtitles(&self) -> bool {
        match &self.subtitols {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Array(tracks)) => !tracks.is_empty(),
            Some(Value::Object(track)) => !track.is_empty(),
            Some(Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) > 0,
            _ => false,
        }
    }
}

impl VideoPageResponse {
    pub fn pagination(&self) -> Option<&Pagination> {
        self.resposta.paginacio.as_ref()
    }

    pub fn into_items(self) -> Vec<VideoItem> {
        items(self.resposta.items.and_then(|i| i.item))
    }
}

// ===== Media descriptor: GET /pvideo/media.jsp =====

#[derive(Debug, Clone, Deserialize)]
pub struct MediaDescriptor {
    #[serde(default)]
    pub media: Option<MediaBlock>,
    #[serde(default)]
    pub subtitols: Option<OneOrMany<SubtitleTrack>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaBlock {
    #[serde(default)]
    pub url: Option<OneOrMany<MediaFile>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaFile {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubtitleTrack {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
}

impl MediaDescriptor {
    /// MP4 renditions in descriptor order. Unlabelled files are labelled `mp4`.
    pub fn video_renditions(&self) -> Vec<VideoRendition> {
        let files = self
            .media
            .as_ref()
            .and_then(|m| m.url.clone())
            .map(OneOrMany::into_vec)
            .unwrap_or_default();

        files
            .into_iter()
            .filter_map(|f| {
                let url = f.file?.trim().to_string();
                if !path_has_extension(&url, "mp4") {
                    return None;
                }
                let label = f
                    .label
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| "mp4".to_string());
                Some(VideoRendition { label, url })
            })
            .collect()
    }

    /// First WebVTT subtitle track
    pub fn subtitle_url(&self) -> Option<String> {
        self.subtitols
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| t.url)
            .map(|u| u.trim().to_string())
            .find(|u| path_has_extension(u, "vtt"))
    }
}

/// Extension check on the URL path, ignoring query string and case
fn path_has_extension(url: &str, ext: &str) -> bool {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    path.rsplit_once('.')
        .map(|(_, e)| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}
