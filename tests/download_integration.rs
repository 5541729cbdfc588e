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

//! Whole runs through the download manager

mod common;

use common::{config, files_under, item_json, page_json, pattern, programs_json, MockServer, MockState};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tv3_core::download::progress::{ProgressCallback, TransferState};
use tv3_core::storage::{CacheEntry, CacheStore, Chapter, Program};
use tv3_core::{DownloadManager, RunOptions, TaskOutcome, Tv3Error};

fn chapter(id: &str, episode: u32, title: &str, qualities: &[&str]) -> Chapter {
    Chapter {
        id: id.to_string(),
        program: "dr-slump".to_string(),
        season: 1,
        episode,
        title: title.to_string(),
        qualities: qualities.iter().map(|q| q.to_string()).collect::<BTreeSet<_>>(),
        has_subtitles: false,
    }
}

#[tokio::test]
async fn test_dr_slump_cached_720p_scenario() {
    let video = pattern(50_000, 7);
    let server = MockServer::start(MockState {
        renditions: HashMap::from([
            ("1".to_string(), vec!["480p".to_string(), "720p".to_string()]),
            ("2".to_string(), vec!["480p".to_string()]),
        ]),
        media: HashMap::from([("1-720p.mp4".to_string(), video.clone())]),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path(), &server.base(), 4);

    let program = Program {
        slug: "dr-slump".to_string(),
        catalog_id: "42".to_string(),
        title: "Dr. Slump".to_string(),
    };
    let cache = CacheStore::open(&config.cache_directory).await.unwrap();
    cache
        .put(&CacheEntry::new(
            program,
            vec![
                chapter("1", 1, "Arale", &["480p", "720p"]),
                chapter("2", 2, "Senbei", &["480p"]),
            ],
        ))
        .await
        .unwrap();
    cache.close();

    let csv = root.path().join("links.csv");
    let mut options = RunOptions::new("dr-slump");
    options.quality = Some("720p".to_string());
    options.include_subtitles = false;
    options.resume = false;
    options.csv_path = Some(csv.clone());

    let manager = DownloadManager::new(config.clone()).await.unwrap();
    let summary = manager.run(&options).await.unwrap();

    assert!(summary.from_cache);
    assert_eq!(summary.links.len(), 1);
    assert_eq!(summary.report.succeeded(), 1);
    assert_eq!(summary.report.skipped(), 1);
    assert_eq!(summary.report.failed(), 0);
    assert!(summary
        .report
        .results
        .iter()
        .any(|r| r.subject.contains("S01E02") && matches!(r.outcome, TaskOutcome::Skipped(_))));

    // Cached catalog: only the one descriptor lookup hits the API
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.state.descriptor_calls.load(Ordering::SeqCst), 1);

    let rows: Vec<String> = std::fs::read_to_string(&csv)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[1].starts_with("dr-slump,1,1,Arale,720p,"));

    let files = files_under(&config.output_directory);
    let expected = config
        .output_directory
        .join("Dr. Slump")
        .join("S01E01 - Arale [720p].mp4");
    assert_eq!(files, vec![expected.clone()]);
    assert_eq!(std::fs::read(&expected).unwrap(), video);
}

#[tokio::test]
async fn test_full_run_with_subtitles_then_rerun_skips_completed_files() {
    let video_1 = pattern(40_000, 1);
    let video_2 = pattern(30_000, 2);
    let subtitle = b"WEBVTT\n\n00:00.000 --> 00:01.000\nHola\n".to_vec();
    let server = MockServer::start(MockState {
        programs: programs_json(&[("42", "Dr. Slump", "dr-slump")]),
        pages: vec![page_json(
            1,
            Some(1),
            vec![
                item_json("2", 1, 2, "Senbei", &["720p"]),
                item_json("1", 1, 1, "Arale", &["720p", "1080p"]),
            ],
        )],
        renditions: HashMap::from([
            ("1".to_string(), vec!["720p".to_string(), "1080p".to_string()]),
            ("2".to_string(), vec!["720p".to_string()]),
        ]),
        subtitles: ["1".to_string()].into_iter().collect(),
        media: HashMap::from([
            ("1-1080p.mp4".to_string(), video_1.clone()),
            ("2-720p.mp4".to_string(), video_2.clone()),
            ("1.vtt".to_string(), subtitle.clone()),
        ]),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path(), &server.base(), 2);
    let manifest = root.path().join("links.json");
    let failures = root.path().join("failures.tsv");

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let progress: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));

    let mut options = RunOptions::new("dr-slump");
    options.manifest_path = Some(manifest.clone());
    options.failure_log_path = Some(failures.clone());

    let manager = DownloadManager::new(config.clone())
        .await
        .unwrap()
        .with_progress(progress);
    let first = manager.run(&options).await.unwrap();

    assert!(!first.from_cache);
    assert_eq!(first.report.succeeded(), 3);
    assert!(first.report.is_clean());
    assert_eq!(first.links[0].quality, "1080p");

    let dir = config.output_directory.join("Dr. Slump");
    assert_eq!(std::fs::read(dir.join("S01E01 - Arale [1080p].mp4")).unwrap(), video_1);
    assert_eq!(std::fs::read(dir.join("S01E01 - Arale [1080p].vtt")).unwrap(), subtitle);
    assert_eq!(std::fs::read(dir.join("S01E02 - Senbei [720p].mp4")).unwrap(), video_2);
    assert_eq!(files_under(&config.output_directory).len(), 3);
    assert_eq!(std::fs::read_to_string(&failures).unwrap(), "");

    {
        let events = events.lock().unwrap();
        let completed = events
            .iter()
            .filter(|p| p.state == TransferState::Completed)
            .count();
        assert_eq!(completed, 3);
        // Byte counts never go backwards within one transfer
        for target in events.iter().map(|p| p.target.clone()).collect::<BTreeSet<_>>() {
            let bytes: Vec<u64> = events
                .iter()
                .filter(|p| p.target == target && p.state != TransferState::Pending)
                .map(|p| p.bytes_transferred)
                .collect();
            assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "{:?}", bytes);
        }
    }

    // Second run: catalog from cache, files already present
    let media_before = server.state.media_requests().len();
    let second = manager.run(&options).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.report.succeeded(), 0);
    assert_eq!(second.report.skipped(), 3);
    assert_eq!(server.state.media_requests().len(), media_before);

    // The exported manifest drives a run without the catalog
    let api_before = server.state.api_calls.load(Ordering::SeqCst);
    let replay = manager.run_manifest(&manifest, &RunOptions::new("")).await.unwrap();
    assert_eq!(replay.links, first.links);
    assert_eq!(replay.report.skipped(), 3);
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), api_before);
}

#[tokio::test]
async fn test_list_only_exports_without_transfers() {
    let server = MockServer::start(MockState {
        programs: programs_json(&[("42", "Dr. Slump", "dr-slump")]),
        pages: vec![page_json(1, Some(1), vec![item_json("1", 1, 1, "Arale", &["720p"])])],
        renditions: HashMap::from([("1".to_string(), vec!["720p".to_string()])]),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path(), &server.base(), 2);
    let csv = root.path().join("links.csv");

    let mut options = RunOptions::new("dr-slump");
    options.list_only = true;
    options.csv_path = Some(csv.clone());

    let manager = DownloadManager::new(config.clone()).await.unwrap();
    let summary = manager.run(&options).await.unwrap();
    let first_export = std::fs::read(&csv).unwrap();

    assert_eq!(summary.links.len(), 1);
    assert!(summary.report.results.is_empty());
    assert!(server.state.media_requests().is_empty());
    assert!(files_under(&config.output_directory).is_empty());

    // Exporting the same links again is byte-identical
    manager.run(&options).await.unwrap();
    assert_eq!(std::fs::read(&csv).unwrap(), first_export);
}

#[tokio::test]
async fn test_failed_transfer_is_reported_and_logged() {
    let server = MockServer::start(MockState {
        programs: programs_json(&[("42", "Dr. Slump", "dr-slump")]),
        pages: vec![page_json(
            1,
            Some(1),
            vec![item_json("1", 1, 1, "Arale", &["720p"]), item_json("2", 1, 2, "Senbei", &["720p"])],
        )],
        renditions: HashMap::from([
            ("1".to_string(), vec!["720p".to_string()]),
            ("2".to_string(), vec!["720p".to_string()]),
        ]),
        // chapter 2's file is missing at the origin
        media: HashMap::from([("1-720p.mp4".to_string(), pattern(10_000, 3))]),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path(), &server.base(), 2);
    let failures = root.path().join("failures.tsv");

    let mut options = RunOptions::new("dr-slump");
    options.failure_log_path = Some(failures.clone());

    let manager = DownloadManager::new(config).await.unwrap();
    let summary = manager.run(&options).await.unwrap();

    assert_eq!(summary.report.succeeded(), 1);
    assert_eq!(summary.report.failed(), 1);
    let log = std::fs::read_to_string(&failures).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.starts_with(&summary.links[1].target_path.display().to_string()));
    assert!(log.contains("404"));
}

#[tokio::test]
async fn test_unwritable_export_path_fails_before_any_request() {
    let server = MockServer::start(MockState {
        programs: programs_json(&[("42", "Dr. Slump", "dr-slump")]),
        pages: vec![page_json(1, Some(1), vec![item_json("1", 1, 1, "Arale", &["720p"])])],
        renditions: HashMap::from([("1".to_string(), vec!["720p".to_string()])]),
        media: HashMap::from([("1-720p.mp4".to_string(), pattern(10_000, 4))]),
        ..MockState::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path(), &server.base(), 2);
    std::fs::write(root.path().join("blocker"), b"").unwrap();

    let mut options = RunOptions::new("dr-slump");
    options.manifest_path = Some(root.path().join("blocker").join("links.json"));

    let manager = DownloadManager::new(config.clone()).await.unwrap();
    let err = manager.run(&options).await.unwrap_err();

    assert!(matches!(err, Tv3Error::InvalidConfiguration(_)), "{:?}", err);
    assert_eq!(server.state.api_calls.load(Ordering::SeqCst), 0);
    assert!(server.state.media_requests().is_empty());
    assert!(files_under(&config.output_directory).is_empty());
}

#[tokio::test]
async fn test_cancelled_run_resolves_and_transfers_nothing() {
    let server = MockServer::start(MockState {
        programs: programs_json(&[("42", "Dr. Slump", "dr-slump")]),
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
    let config = config(root.path(), &server.base(), 2);

    let manager = DownloadManager::new(config).await.unwrap();
    manager.cancel();
    let summary = manager.run(&RunOptions::new("dr-slump")).await.unwrap();

    assert!(summary.links.is_empty());
    assert_eq!(summary.report.not_started(), 2);
    assert!(summary
        .report
        .results
        .iter()
        .all(|r| r.subject.starts_with("dr-slump S01E0")));
    assert_eq!(server.state.descriptor_calls.load(Ordering::SeqCst), 0);
    assert!(server.state.media_requests().is_empty());
}
