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

//! Program catalog resolution
//!
//! Turns a program slug into its full, ordered chapter list:
//! 1. Cache fast path (no network at all on a hit)
//! 2. Program lookup by slug in the `/programestv` listing
//! 3. Paginated `/videos` fetch; page 1 first, then the remaining pages
//!    concurrently with results consumed in page order
//! 4. Normalization (dedupe by chapter id, stable sort by season/episode)
//! 5. Cache write, only for a complete and non-empty result
//!
//! # Pagination
//! When the first page reports `total_pagines`, pages 2..=total are fetched.
//! Without pagination info, pages are walked one by one until a page comes
//! back empty or adds no new chapter. Either way at most [`MAX_PAGES`] pages
//! are requested.

use crate::api::client::ApiClient;
use crate::api::models::{ProgramListResponse, VideoItem, VideoPageResponse};
use crate::error::{Result, Tv3Error};
use crate::storage::{normalize_order, CacheEntry, CacheStore, Chapter, Program};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hard cap on pages fetched for one program
pub const MAX_PAGES: u32 = 1000;

const PROGRAMS_ENDPOINT: &str = "/programestv";
const VIDEOS_ENDPOINT: &str = "/videos";
const NO_QUERY: &[(&str, &str)] = &[];

/// Query parameters for a `/videos` page
#[derive(Debug, Serialize)]
struct VideoPageQuery<'a> {
    #[serde(rename = "programatv_id")]
    program_id: &'a str,
    #[serde(rename = "items_pagina")]
    page_size: u32,
    #[serde(rename = "pagina")]
    page: u32,
    #[serde(rename = "ordre")]
    order: &'static str,
}

/// A program together with its normalized chapters
#[derive(Debug, Clone)]
pub struct CatalogListing {
    pub program: Program,
    pub chapters: Vec<Chapter>,
    /// Whether the listing was answered from the cache store
    pub from_cache: bool,
}

/// Resolves program slugs into chapter lists, backed by the cache store
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: Arc<ApiClient>,
    cache: Arc<CacheStore>,
    page_concurrency: usize,
}

impl CatalogClient {
    pub fn new(http: Arc<ApiClient>, cache: Arc<CacheStore>, page_concurrency: usize) -> Self {
        Self {
            http,
            cache,
            page_concurrency: page_concurrency.max(1),
        }
    }

    /// Resolve a program slug into its ordered chapter list.
    ///
    /// With `use_cache`, a cached record answers the call without any network
    /// request. Otherwise the catalog is fetched, normalized, and written to
    /// the cache. A failing page fails the whole call and nothing is cached.
    ///
    /// # Errors
    /// - `NotFound` if the slug is unknown or the program has no chapters
    /// - `NetworkError` once retries for a request are exhausted
    /// - `ParseError` if a response cannot be decoded
    pub async fn resolve(&self, slug: &str, page_size: u32, use_cache: bool) -> Result<CatalogListing> {
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(Tv3Error::invalid_input("program slug is empty"));
        }

        if use_cache {
            if let Some(entry) = self.cache.get(slug).await? {
                info!(program = slug, chapters = entry.chapters.len(), "catalog served from cache");
                return Ok(CatalogListing {
                    program: entry.program,
                    chapters: entry.chapters,
                    from_cache: true,
                });
            }
        }

        let program = self.lookup_program(slug).await?;
        let chapters = self.fetch_chapters(&program, page_size.max(1)).await?;
        if chapters.is_empty() {
            return Err(Tv3Error::not_found(format!("chapters of '{}'", slug)));
        }

        info!(
            program = %program.slug,
            title = %program.title,
            chapters = chapters.len(),
            "catalog fetched"
        );

        let entry = CacheEntry::new(program, chapters);
        if let Err(e) = self.cache.put(&entry).await {
            warn!(program = slug, error = %e, "could not write catalog cache");
        }

        Ok(CatalogListing {
            program: entry.program,
            chapters: entry.chapters,
            from_cache: false,
        })
    }

    /// Find a program by slug in the program listing
    pub async fn lookup_program(&self, slug: &str) -> Result<Program> {
        let listing: ProgramListResponse = self.http.get_json(PROGRAMS_ENDPOINT, NO_QUERY).await?;
        let wanted = slug.trim().to_lowercase();

        listing
            .programs()
            .into_iter()
            .find(|p| {
                p.nombonic
                    .as_deref()
                    .map(|n| n.trim().to_lowercase() == wanted)
                    .unwrap_or(false)
                    && p.id.is_some()
            })
            .and_then(|p| {
                let slug = p.nombonic?.trim().to_string();
                Some(Program {
                    catalog_id: p.id?,
                    title: p
                        .titol
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| slug.clone()),
                    slug,
                })
            })
            .ok_or_else(|| Tv3Error::not_found(format!("program '{}'", slug)))
    }

    async fn fetch_page(&self, program: &Program, page: u32, page_size: u32) -> Result<VideoPageResponse> {
        let query = VideoPageQuery {
            program_id: &program.catalog_id,
            page_size,
            page,
            order: "capitol",
        };
        debug!(program = %program.slug, page, "fetching chapter page");
        self.http.get_json(VIDEOS_ENDPOINT, &query).await
    }

    async fn fetch_chapters(&self, program: &Program, page_size: u32) -> Result<Vec<Chapter>> {
        let mut collector = ChapterCollector::new(&program.slug);

        let first = self.fetch_page(program, 1, page_size).await?;
        let total_pages = first.pagination().and_then(|p| p.total_pagines);
        let added = collector.extend(first.into_items());

        match total_pages {
            Some(total) => {
                if total > MAX_PAGES {
                    warn!(program = %program.slug, total, cap = MAX_PAGES, "page count capped");
                }
                let last = total.min(MAX_PAGES);

                // buffered keeps page order while fetching ahead
                let mut pages = stream::iter(2..=last)
                    .map(|page| self.fetch_page(program, page, page_size))
                    .buffered(self.page_concurrency);

                let mut page = 1;
                while let Some(result) = pages.next().await {
                    page += 1;
                    match result {
                        Ok(response) => {
                            collector.extend(response.into_items());
                        }
                        Err(e) => {
                            warn!(
                                program = %program.slug,
                                page,
                                accumulated = collector.len(),
                                error = %e,
                                "chapter page failed"
                            );
                            return Err(e);
                        }
                    }
                }
            }
            None if added > 0 => {
                for page in 2..=MAX_PAGES {
                    let response = self.fetch_page(program, page, page_size).await.map_err(|e| {
                        warn!(
                            program = %program.slug,
                            page,
                            accumulated = collector.len(),
                            error = %e,
                            "chapter page failed"
                        );
                        e
                    })?;
                    if collector.extend(response.into_items()) == 0 {
                        break;
                    }
                }
            }
            None => {}
        }

        Ok(collector.finish())
    }
}

/// Accumulates chapters across pages, keeping the first occurrence of an id
struct ChapterCollector<'a> {
    program: &'a str,
    seen: HashSet<String>,
    chapters: Vec<Chapter>,
}

impl<'a> ChapterCollector<'a> {
    fn new(program: &'a str) -> Self {
        Self {
            program,
            seen: HashSet::new(),
            chapters: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.chapters.len()
    }

    /// Add a page of items; returns how many new chapters it contributed
    fn extend(&mut self, items: Vec<VideoItem>) -> usize {
        let before = self.chapters.len();
        for item in items {
            match chapter_from_item(self.program, item) {
                Some(chapter) if self.seen.insert(chapter.id.clone()) => self.chapters.push(chapter),
                Some(chapter) => debug!(id = %chapter.id, "duplicate chapter ignored"),
                None => debug!(program = self.program, "chapter without id ignored"),
            }
        }
        self.chapters.len() - before
    }

    fn finish(mut self) -> Vec<Chapter> {
        normalize_order(&mut self.chapters);
        self.chapters
    }
}

/// Missing season means season 1; missing or unparsable episode means 0
fn chapter_from_item(program: &str, item: VideoItem) -> Option<Chapter> {
    let qualities: BTreeSet<String> = item.quality_labels().into_iter().collect();
    let has_subtitles = item.has_subtitles();
    let id = item.id?;

    Some(Chapter {
        title: item
            .titol
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("capitol-{}", id)),
        id,
        program: program.to_string(),
        season: item.temporada.unwrap_or(1),
        episode: item.capitol.unwrap_or(0),
        qualities,
        has_subtitles,
    })
}
