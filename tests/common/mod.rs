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

//! In-process catalog API and media origin for integration tests

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tv3_core::config::{EngineConfig, RetryPolicy};

const DEFAULT_CHUNK: usize = 16 * 1024;

/// How the media origin treats `Range` requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RangeMode {
    #[default]
    Honour,
    /// Always answer 200 with the whole body
    Ignore,
}

#[derive(Default)]
pub struct MockState {
    pub base: OnceLock<String>,
    /// `/programestv` response
    pub programs: Value,
    /// `/videos` responses, page 1 first
    pub pages: Vec<Value>,
    /// Chapter id -> rendition labels; files are served as `{id}-{label}.mp4`
    pub renditions: HashMap<String, Vec<String>>,
    /// Chapter ids whose descriptor carries `{id}.vtt`
    pub subtitles: HashSet<String>,
    /// File name -> body
    pub media: HashMap<String, Vec<u8>>,
    pub chunk_size: usize,
    pub chunk_delay: Mutex<Option<Duration>>,
    pub range_mode: Mutex<RangeMode>,
    /// `/videos` pages answered with 500
    pub failing_pages: HashSet<usize>,
    /// The next media body breaks off after this many bytes
    pub break_body_after: Mutex<Option<usize>>,

    /// Catalog requests (listing, pages, descriptors)
    pub api_calls: AtomicUsize,
    pub descriptor_calls: AtomicUsize,
    /// Every media request: file name and `Range` header
    pub media_requests: Mutex<Vec<(String, Option<String>)>>,
    pub active_media: AtomicUsize,
    pub peak_media: AtomicUsize,
}

impl MockState {
    pub fn media_requests(&self) -> Vec<(String, Option<String>)> {
        self.media_requests.lock().unwrap().clone()
    }

    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        *self.chunk_delay.lock().unwrap() = delay;
    }

    pub fn set_range_mode(&self, mode: RangeMode) {
        *self.range_mode.lock().unwrap() = mode;
    }

    pub fn break_next_body_after(&self, bytes: usize) {
        *self.break_body_after.lock().unwrap() = Some(bytes);
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        state.base.set(format!("http://{}", addr)).unwrap();
        let state = Arc::new(state);

        let app = Router::new()
            .route("/programestv", get(programs))
            .route("/videos", get(videos))
            .route("/pvideo/media.jsp", get(descriptor))
            .route("/media/:name", get(media))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn media_url(&self, name: &str) -> String {
        format!("{}/media/{}", self.base(), name)
    }
}

async fn programs(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.api_calls.fetch_add(1, Ordering::SeqCst);
    if state.programs.is_null() {
        return Json(programs_json(&[]));
    }
    Json(state.programs.clone())
}

async fn videos(State(state): State<Arc<MockState>>, Query(query): Query<HashMap<String, String>>) -> Response {
    state.api_calls.fetch_add(1, Ordering::SeqCst);
    let page: usize = query.get("pagina").and_then(|p| p.parse().ok()).unwrap_or(1);
    if state.failing_pages.contains(&page) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "page unavailable").into_response();
    }
    let body = state
        .pages
        .get(page.saturating_sub(1))
        .cloned()
        .unwrap_or_else(|| json!({ "resposta": { "items": { "item": [] } } }));
    Json(body).into_response()
}

async fn descriptor(State(state): State<Arc<MockState>>, Query(query): Query<HashMap<String, String>>) -> Response {
    state.api_calls.fetch_add(1, Ordering::SeqCst);
    state.descriptor_calls.fetch_add(1, Ordering::SeqCst);

    let base = state.base.get().cloned().unwrap_or_default();
    let id = query.get("idint").cloned().unwrap_or_default();
    let Some(labels) = state.renditions.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let files: Vec<Value> = labels
        .iter()
        .map(|label| json!({ "file": format!("{}/media/{}-{}.mp4", base, id, label), "label": label }))
        .collect();
    let mut body = json!({ "media": { "url": files } });
    if state.subtitles.contains(&id) {
        body["subtitols"] = json!([{ "url": format!("{}/media/{}.vtt", base, id), "text": "Català", "lang": "ca" }]);
    }
    Json(body).into_response()
}

/// Counts a media body as active until its last chunk is produced
struct ActiveGuard(Arc<MockState>);

impl ActiveGuard {
    fn enter(state: Arc<MockState>) -> Self {
        let now = state.active_media.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_media.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_media.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn media(State(state): State<Arc<MockState>>, Path(name): Path<String>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.media_requests.lock().unwrap().push((name.clone(), range.clone()));

    let Some(body) = state.media.get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let total = body.len();
    let mode = *state.range_mode.lock().unwrap();
    let start = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split('-').next())
        .and_then(|s| s.parse::<usize>().ok());

    let (status, start, content_range) = match (mode, start) {
        (RangeMode::Honour, Some(start)) if start >= total => {
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", total))],
            )
                .into_response();
        }
        (RangeMode::Honour, Some(start)) => (
            StatusCode::PARTIAL_CONTENT,
            start,
            Some(format!("bytes {}-{}/{}", start, total - 1, total)),
        ),
        _ => (StatusCode::OK, 0, None),
    };

    let slice = &body[start..];
    let chunk_size = if state.chunk_size == 0 { DEFAULT_CHUNK } else { state.chunk_size };
    let break_after = state.break_body_after.lock().unwrap().take();
    let sent = break_after.map_or(slice.len(), |n| n.min(slice.len()));
    let mut chunks: Vec<Option<Bytes>> = slice[..sent]
        .chunks(chunk_size)
        .map(|c| Some(Bytes::copy_from_slice(c)))
        .collect();
    if break_after.is_some() {
        // Declared length stays the full slice; the body errors out early
        chunks.push(None);
    }
    let count = chunks.len();
    let delay = *state.chunk_delay.lock().unwrap();

    let mut guard = Some(ActiveGuard::enter(state.clone()));
    let stream = futures_util::stream::iter(chunks.into_iter().enumerate()).then(move |(i, chunk)| {
        if i + 1 == count {
            guard.take();
        }
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            chunk.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::ConnectionReset, "origin dropped the body"))
        }
    });

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, slice.len());
    if let Some(content_range) = content_range {
        response = response.header(header::CONTENT_RANGE, content_range);
    }
    response.body(Body::from_stream(stream)).unwrap()
}

// ===== Fixtures =====

pub fn programs_json(programs: &[(&str, &str, &str)]) -> Value {
    let items: Vec<Value> = programs
        .iter()
        .map(|(id, title, slug)| json!({ "id": id, "titol": title, "nombonic": slug }))
        .collect();
    json!({ "resposta": { "items": { "lletra": [{ "item": items }] } } })
}

pub fn page_json(page: u32, total_pages: Option<u32>, items: Vec<Value>) -> Value {
    let mut body = json!({ "resposta": { "items": { "item": items } } });
    if let Some(total) = total_pages {
        body["resposta"]["paginacio"] = json!({ "pagina_actual": page, "total_pagines": total });
    }
    body
}

pub fn item_json(id: &str, season: u32, episode: u32, title: &str, qualities: &[&str]) -> Value {
    let variants: Vec<Value> = qualities.iter().map(|q| json!({ "label": q })).collect();
    json!({
        "id": id,
        "titol": title,
        "temporada": season.to_string(),
        "capitol": episode,
        "variants": variants,
    })
}

/// Deterministic body of `len` bytes
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn config(root: &std::path::Path, base: &str, workers: usize) -> EngineConfig {
    let mut config = EngineConfig::builder()
        .api_base_url(base)
        .max_workers(workers)
        .output_directory(root.join("out"))
        .cache_directory(root.join("cache"))
        .checkpoint_interval_bytes(8 * 1024)
        .read_timeout_secs(5)
        .retry(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter: false,
        })
        .build();
    config.connect_timeout_secs = 5;
    config.request_timeout_secs = 10;
    config
}

/// Every file under `dir`, recursively, sorted
pub fn files_under(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}
