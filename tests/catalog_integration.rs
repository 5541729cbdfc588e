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

//! Catalog resolution and link resolution against a mock catalog API

mod common;

use common::{config, item_json, page_json, programs_json, MockServer, MockState};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tv3_core::api::{ApiClient, CatalogClient, LinkOutcome, LinkQuery, LinkResolver};
use tv3_core::file::PathBuilder;
use tv3_core::storage::{CacheEntry, CacheStore, Program};
use tv3_core::Tv3Error;

fn dr_slump_programs() -> serde_json::Value {
    programs_json(&[("7", "Bola de Drac", "bola-de-drac"), ("42", "Dr. Slump", "dr-slump")])
}

async fn catalog(server: &MockServer, root: &std::path::Path) -> (CatalogClient, Arc<ApiClient>) {
    let config = config(root, &server.base(), 4);
    let http = Arc::new(ApiClient::new(&config).unwrap());
    let cache = Arc::new(CacheStore::open(&config.cache_directory).await.unwrap());
    (CatalogClient::new(http.clone(), cache, 4), http)
}

#[tokio::test]
async fn test_paginated_fetch_then_cache_hit_issues_no_requests() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        pages: vec![
            page_json(
                1,
                Some(2),
                vec![
                    item_json("103", 1, 3, "Gatchan", &["720p"]),
                    item_json("101", 1, 1, "Arale", &["480p", "720p"]),
                ],
            ),
            page_json(
                2,
                Some(2),
                vec![
                    item_json("201", 2, 1, "Temporada dos", &["720p"]),
                    item_json("102", 1, 2, "Senbei", &["720p"]),
                    // repeated across pages
                    item_json("101", 1, 1, "Arale", &["480p", "720p"]),
                ],
            ),
        ],
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, http) = catalog(&server, root.path()).await;

    let fresh = catalog.resolve("dr-slump", 3, true).await.unwrap();
    assert!(!fresh.from_cache);
    assert_eq!(fresh.program.title, "Dr. Slump");
    assert_eq!(fresh.program.catalog_id, "42");
    let order: Vec<(u32, u32)> = fresh.chapters.iter().map(|c| (c.season, c.episode)).collect();
    assert_eq!(order, vec![(1, 1), (1, 2), (1, 3), (2, 1)]);
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), 3);

    let sent = http.requests_sent();
    let cached = catalog.resolve("dr-slump", 3, true).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.chapters, fresh.chapters);
    assert_eq!(http.requests_sent(), sent);
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), 3);

    // Bypassing the cache goes back to the network
    let refreshed = catalog.resolve("dr-slump", 3, false).await.unwrap();
    assert!(!refreshed.from_cache);
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_pages_without_pagination_info_are_walked_until_empty() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        pages: vec![
            page_json(1, None, vec![item_json("1", 1, 1, "A", &["720p"])]),
            page_json(2, None, vec![item_json("2", 1, 2, "B", &["720p"])]),
        ],
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, _) = catalog(&server, root.path()).await;

    let listing = catalog.resolve("dr-slump", 1, true).await.unwrap();
    assert_eq!(listing.chapters.len(), 2);
    // listing + pages 1, 2 and the empty page 3
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unknown_program_is_not_found() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, _) = catalog(&server, root.path()).await;

    let err = catalog.resolve("arale", 100, true).await.unwrap_err();
    assert!(matches!(err, Tv3Error::NotFound(_)));
    assert!(!root.path().join("cache").join("arale.json").exists());
}

#[tokio::test]
async fn test_missing_quality_is_skipped_without_a_descriptor_request() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        pages: vec![page_json(
            1,
            Some(1),
            vec![
                item_json("1", 1, 1, "Arale", &["480p", "720p"]),
                item_json("2", 1, 2, "Senbei", &["480p"]),
            ],
        )],
        renditions: HashMap::from([
            ("1".to_string(), vec!["480p".to_string(), "720p".to_string()]),
            ("2".to_string(), vec!["480p".to_string()]),
        ]),
        subtitles: ["1".to_string()].into_iter().collect(),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, http) = catalog(&server, root.path()).await;
    let listing = catalog.resolve("dr-slump", 100, true).await.unwrap();

    let resolver = LinkResolver::new(http, PathBuilder::new(root.path().join("out")), 4);
    let query = LinkQuery {
        quality: Some("720".to_string()),
        include_subtitles: true,
    };
    let report = resolver
        .resolve_all(&listing.program, listing.chapters.clone(), query.clone(), &CancellationToken::new())
        .await;

    assert_eq!(report.links.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.failed.is_empty());
    assert_eq!(report.skipped[0].0.id, "2");
    assert_eq!(server.state.descriptor_calls.load(Ordering::SeqCst), 1);

    let link = &report.links[0];
    assert_eq!(link.quality, "720p");
    assert!(link.video_url.ends_with("/media/1-720p.mp4"));
    assert!(link.subtitle_url.as_deref().unwrap().ends_with("/media/1.vtt"));
    assert_eq!(
        link.target_path,
        root.path().join("out").join("Dr. Slump").join("S01E01 - Arale [720p].mp4")
    );

    // Same inputs, same paths
    let again = resolver
        .resolve_chapter(&listing.program, listing.chapters[0].clone(), &query)
        .await;
    match again {
        LinkOutcome::Resolved(second) => assert_eq!(&second, link),
        other => panic!("expected a resolved link, got {:?}", other),
    }
}

#[tokio::test]
async fn test_descriptor_failure_only_fails_that_chapter() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        pages: vec![page_json(
            1,
            Some(1),
            vec![item_json("1", 1, 1, "A", &["720p"]), item_json("404", 1, 2, "B", &["720p"])],
        )],
        renditions: HashMap::from([("1".to_string(), vec!["720p".to_string()])]),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, http) = catalog(&server, root.path()).await;
    let listing = catalog.resolve("dr-slump", 100, true).await.unwrap();

    let resolver = LinkResolver::new(http, PathBuilder::new(root.path().join("out")), 2);
    let report = resolver
        .resolve_all(&listing.program, listing.chapters, LinkQuery::default(), &CancellationToken::new())
        .await;

    assert_eq!(report.links.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.id, "404");
    assert!(report.skipped.is_empty());
}

#[tokio::test]
async fn test_failing_page_is_a_network_error_and_keeps_the_cached_record() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        pages: vec![
            page_json(1, Some(2), vec![item_json("1", 1, 1, "Arale", &["720p"])]),
            page_json(2, Some(2), vec![item_json("2", 1, 2, "Senbei", &["720p"])]),
        ],
        failing_pages: [2].into_iter().collect(),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, _) = catalog(&server, root.path()).await;

    // Record from an earlier run
    let store = CacheStore::open(root.path().join("cache")).await.unwrap();
    let program = Program {
        slug: "dr-slump".to_string(),
        catalog_id: "42".to_string(),
        title: "Dr. Slump".to_string(),
    };
    store.put(&CacheEntry::new(program, Vec::new())).await.unwrap();
    let record = store.entry_path("dr-slump");
    let before = std::fs::read(&record).unwrap();

    let err = catalog.resolve("dr-slump", 1, false).await.unwrap_err();
    assert!(matches!(err, Tv3Error::NetworkError { .. }), "{:?}", err);
    assert_eq!(std::fs::read(&record).unwrap(), before);
    // listing, page 1, then page 2 twice (retry)
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_warm_descriptor_cache_issues_no_descriptor_requests() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        pages: vec![page_json(
            1,
            Some(1),
            vec![item_json("1", 1, 1, "Arale", &["720p"]), item_json("2", 1, 2, "Senbei", &["720p"])],
        )],
        renditions: HashMap::from([
            ("1".to_string(), vec!["720p".to_string()]),
            ("2".to_string(), vec!["720p".to_string()]),
        ]),
        subtitles: ["2".to_string()].into_iter().collect(),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, http) = catalog(&server, root.path()).await;
    let listing = catalog.resolve("dr-slump", 100, true).await.unwrap();
    let store = Arc::new(CacheStore::open(root.path().join("cache")).await.unwrap());
    let query = LinkQuery {
        quality: None,
        include_subtitles: true,
    };
    let paths = PathBuilder::new(root.path().join("out"));

    let cold = LinkResolver::new(http.clone(), paths.clone(), 2).with_cache(store.clone(), true);
    let first = cold
        .resolve_all(&listing.program, listing.chapters.clone(), query.clone(), &CancellationToken::new())
        .await;
    assert_eq!(first.links.len(), 2);
    assert_eq!(server.state.descriptor_calls.load(Ordering::SeqCst), 2);
    assert!(store.descriptor_path("1").exists());

    let warm = LinkResolver::new(http.clone(), paths.clone(), 2).with_cache(store.clone(), true);
    let second = warm
        .resolve_all(&listing.program, listing.chapters.clone(), query.clone(), &CancellationToken::new())
        .await;
    assert_eq!(second.links, first.links);
    assert_eq!(server.state.descriptor_calls.load(Ordering::SeqCst), 2);

    // A refresh goes back to the origin and rewrites the records
    let refresh = LinkResolver::new(http, paths, 2).with_cache(store.clone(), false);
    let third = refresh
        .resolve_all(&listing.program, listing.chapters, query, &CancellationToken::new())
        .await;
    assert_eq!(third.links, first.links);
    assert_eq!(server.state.descriptor_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_cancelled_resolution_reports_chapters_not_started() {
    let server = MockServer::start(MockState {
        programs: dr_slump_programs(),
        pages: vec![page_json(
            1,
            Some(1),
            vec![item_json("1", 1, 1, "Arale", &["720p"]), item_json("2", 1, 2, "Senbei", &["720p"])],
        )],
        renditions: HashMap::from([
            ("1".to_string(), vec!["720p".to_string()]),
            ("2".to_string(), vec!["720p".to_string()]),
        ]),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (catalog, http) = catalog(&server, root.path()).await;
    let listing = catalog.resolve("dr-slump", 100, true).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let resolver = LinkResolver::new(http, PathBuilder::new(root.path().join("out")), 2);
    let report = resolver
        .resolve_all(&listing.program, listing.chapters, LinkQuery::default(), &cancel)
        .await;

    assert!(report.links.is_empty());
    let ids: Vec<&str> = report.not_started.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert_eq!(server.state.descriptor_calls.load(Ordering::SeqCst), 0);
}
