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

//! Media link resolution
//!
//! Maps chapters to concrete download URLs by fetching each chapter's media
//! descriptor. Chapters are resolved concurrently (bounded by the worker
//! count) and outcomes are yielded as they complete, not in chapter order.
//!
//! Per chapter, exactly one of:
//! - `Resolved`: a video URL at the chosen quality (plus subtitles if wanted
//!   and available)
//! - `Skipped`: the requested quality is not offered; this is not an error
//! - `Failed`: the descriptor could not be fetched or had no usable video
//! - `NotStarted`: the run was cancelled before the chapter was looked up
//!
//! Descriptors are cached per chapter id when a cache store is attached. A
//! cached descriptor answers without a request unless the run asked for a
//! refresh, in which case it is fetched and the record replaced.

use crate::api::client::ApiClient;
use crate::api::models::{MediaDescriptor, VideoRendition};
use crate::error::{Result, Tv3Error};
use crate::file::paths::PathBuilder;
use crate::storage::models::quality_rank;
use crate::storage::{CacheStore, Chapter, DescriptorEntry, Program};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MEDIA_ENDPOINT: &str = "/pvideo/media.jsp";

/// A chapter paired with the concrete URLs and local paths to fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLink {
    pub chapter: Chapter,
    pub program_title: String,
    /// Quality label actually selected
    pub quality: String,
    pub video_url: String,
    pub subtitle_url: Option<String>,
    pub target_path: PathBuf,
    pub subtitle_path: Option<PathBuf>,
}

/// What to resolve for each chapter
#[derive(Debug, Clone, Default)]
pub struct LinkQuery {
    /// Quality filter; `None` picks the best available
    pub quality: Option<String>,
    pub include_subtitles: bool,
}

/// Per-chapter result of link resolution
#[derive(Debug)]
pub enum LinkOutcome {
    Resolved(ResolvedLink),
    Skipped { chapter: Chapter, reason: String },
    Failed { chapter: Chapter, error: Tv3Error },
    NotStarted(Chapter),
}

/// All outcomes of one resolution pass, resolved links in catalog order
#[derive(Debug, Default)]
pub struct LinkReport {
    pub links: Vec<ResolvedLink>,
    pub skipped: Vec<(Chapter, String)>,
    pub failed: Vec<(Chapter, Tv3Error)>,
    pub not_started: Vec<Chapter>,
}

/// Which quality to take from a descriptor
enum QualityChoice {
    /// Advertised by the catalog; the descriptor must carry it
    Advertised(String),
    /// Catalog advertised nothing; match the filter against the descriptor
    Filter(String),
    /// No filter; take the highest rendition
    Best,
}

/// Resolves chapters to download links
#[derive(Debug, Clone)]
pub struct LinkResolver {
    http: Arc<ApiClient>,
    paths: PathBuilder,
    concurrency: usize,
    cache: Option<Arc<CacheStore>>,
    /// Answer from cached descriptors; when unset they are only written
    read_cache: bool,
}

impl LinkResolver {
    pub fn new(http: Arc<ApiClient>, paths: PathBuilder, concurrency: usize) -> Self {
        Self {
            http,
            paths,
            concurrency: concurrency.max(1),
            cache: None,
            read_cache: false,
        }
    }

    /// Keep descriptors in `cache`; `use_cache` lets cached ones answer
    pub fn with_cache(mut self, cache: Arc<CacheStore>, use_cache: bool) -> Self {
        self.cache = Some(cache);
        self.read_cache = use_cache;
        self
    }

    /// Resolve every chapter, yielding outcomes in completion order.
    ///
    /// At most `concurrency` descriptor lookups are in flight at once. Once
    /// `cancel` fires, lookups in flight are dropped and every remaining
    /// chapter is yielded as `NotStarted`.
    pub fn resolve_links<'a>(
        &'a self,
        program: &'a Program,
        chapters: Vec<Chapter>,
        query: LinkQuery,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = LinkOutcome> + 'a {
        stream::iter(chapters)
            .map(move |chapter| {
                let query = query.clone();
                async move {
                    if cancel.is_cancelled() {
                        return LinkOutcome::NotStarted(chapter);
                    }
                    let pending = chapter.clone();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(chapter = %pending.id, "link resolution cancelled");
                            LinkOutcome::NotStarted(pending)
                        }
                        outcome = self.resolve_chapter(program, chapter, &query) => outcome,
                    }
                }
            })
            .buffer_unordered(self.concurrency)
    }

    /// Resolve all chapters and gather the outcomes into a report
    pub async fn resolve_all(
        &self,
        program: &Program,
        chapters: Vec<Chapter>,
        query: LinkQuery,
        cancel: &CancellationToken,
    ) -> LinkReport {
        collect_outcomes(self.resolve_links(program, chapters, query, cancel)).await
    }

    /// Resolve a single chapter
    pub async fn resolve_chapter(&self, program: &Program, chapter: Chapter, query: &LinkQuery) -> LinkOutcome {
        let filter = query
            .quality
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());

        let choice = match (filter, chapter.qualities.is_empty()) {
            (Some(wanted), false) => match chapter.matching_quality(wanted).map(str::to_string) {
                Some(label) => QualityChoice::Advertised(label),
                None => {
                    let reason = format!(
                        "quality '{}' not offered (available: {})",
                        wanted,
                        chapter.qualities.iter().cloned().collect::<Vec<_>>().join(", ")
                    );
                    debug!(chapter = %chapter.id, %reason, "skipping chapter");
                    return LinkOutcome::Skipped { chapter, reason };
                }
            },
            (Some(wanted), true) => QualityChoice::Filter(wanted.to_string()),
            (None, _) => QualityChoice::Best,
        };

        let descriptor = match self.fetch_descriptor(&chapter.id).await {
            Ok(descriptor) => descriptor,
            Err(error) => {
                warn!(chapter = %chapter.id, error = %error, "media descriptor unavailable");
                return LinkOutcome::Failed { chapter, error };
            }
        };

        let renditions = &descriptor.renditions;
        if renditions.is_empty() {
            let error = Tv3Error::not_found(format!("mp4 rendition for chapter {}", chapter.id));
            return LinkOutcome::Failed { chapter, error };
        }

        let rendition = match choice {
            QualityChoice::Advertised(label) => match pick_rendition(renditions, &label) {
                Some(r) => r,
                None => {
                    let error = Tv3Error::not_found(format!(
                        "'{}' rendition for chapter {} (advertised but absent from descriptor)",
                        label, chapter.id
                    ));
                    return LinkOutcome::Failed { chapter, error };
                }
            },
            QualityChoice::Filter(wanted) => match pick_rendition(renditions, &wanted) {
                Some(r) => r,
                None => {
                    let reason = format!("quality '{}' not offered", wanted);
                    return LinkOutcome::Skipped { chapter, reason };
                }
            },
            QualityChoice::Best => chapter
                .best_quality()
                .and_then(|label| pick_rendition(renditions, label))
                .unwrap_or_else(|| best_rendition(renditions)),
        };

        let subtitle_url = descriptor.subtitle_url.as_deref().filter(|_| query.include_subtitles);
        match self.build_link(program, chapter.clone(), rendition, subtitle_url) {
            Ok(link) => LinkOutcome::Resolved(link),
            Err(error) => LinkOutcome::Failed { chapter, error },
        }
    }

    /// Cached descriptor when allowed, otherwise fetched and cached
    async fn fetch_descriptor(&self, chapter_id: &str) -> Result<DescriptorEntry> {
        if let Some(cache) = self.cache.as_ref().filter(|_| self.read_cache) {
            match cache.get_descriptor(chapter_id).await {
                Ok(Some(entry)) => {
                    debug!(chapter = chapter_id, "descriptor served from cache");
                    return Ok(entry);
                }
                Ok(None) => {}
                Err(e) => warn!(chapter = chapter_id, error = %e, "descriptor cache unreadable"),
            }
        }

        let query = [("media", "video"), ("version", "0s"), ("idint", chapter_id)];
        let descriptor: MediaDescriptor = self.http.get_json(MEDIA_ENDPOINT, &query).await?;
        let entry = DescriptorEntry::new(chapter_id, descriptor.video_renditions(), descriptor.subtitle_url());

        // A descriptor without any usable rendition is not worth keeping
        if let Some(cache) = self.cache.as_ref().filter(|_| !entry.renditions.is_empty()) {
            if let Err(e) = cache.put_descriptor(&entry).await {
                warn!(chapter = chapter_id, error = %e, "could not write descriptor cache");
            }
        }
        Ok(entry)
    }

    fn build_link(
        &self,
        program: &Program,
        chapter: Chapter,
        rendition: &VideoRendition,
        subtitle_url: Option<&str>,
    ) -> Result<ResolvedLink> {
        let target_path = self
            .paths
            .video_path(&program.title, &chapter, &rendition.label, &rendition.url)?;

        let subtitle_path = match subtitle_url {
            Some(_) => Some(self.paths.subtitle_path(&program.title, &chapter, &rendition.label)?),
            None => None,
        };

        Ok(ResolvedLink {
            chapter,
            program_title: program.title.clone(),
            quality: rendition.label.clone(),
            video_url: rendition.url.clone(),
            subtitle_url: subtitle_url.map(str::to_string),
            target_path,
            subtitle_path,
        })
    }
}

/// Drain an outcome stream into a report with links in (season, episode) order
pub async fn collect_outcomes<S>(outcomes: S) -> LinkReport
where
    S: Stream<Item = LinkOutcome>,
{
    let mut report = LinkReport::default();
    futures_util::pin_mut!(outcomes);
    while let Some(outcome) = outcomes.next().await {
        match outcome {
            LinkOutcome::Resolved(link) => report.links.push(link),
            LinkOutcome::Skipped { chapter, reason } => report.skipped.push((chapter, reason)),
            LinkOutcome::Failed { chapter, error } => report.failed.push((chapter, error)),
            LinkOutcome::NotStarted(chapter) => report.not_started.push(chapter),
        }
    }

    report.links.sort_by_key(|l| l.chapter.order_key());
    report.skipped.sort_by_key(|(c, _)| c.order_key());
    report.failed.sort_by_key(|(c, _)| c.order_key());
    report.not_started.sort_by_key(Chapter::order_key);
    report
}

/// Exact case-insensitive label match, then substring
fn pick_rendition<'a>(renditions: &'a [VideoRendition], wanted: &str) -> Option<&'a VideoRendition> {
    let wanted = wanted.to_lowercase();
    renditions
        .iter()
        .find(|r| r.label.to_lowercase() == wanted)
        .or_else(|| renditions.iter().find(|r| r.label.to_lowercase().contains(&wanted)))
}

/// Highest resolution; the first listed wins ties. `renditions` is non-empty.
fn best_rendition(renditions: &[VideoRendition]) -> &VideoRendition {
    let mut best = &renditions[0];
    for r in &renditions[1..] {
        if quality_rank(&r.label) > quality_rank(&best.label) {
            best = r;
        }
    }
    best
}
