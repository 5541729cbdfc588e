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

//! Manifest and CSV export
//!
//! `export` is a pure function of the resolved links: no network, no cache,
//! no timestamps. Rows are ordered by program, season, episode, then target
//! path, so the same set of links always produces byte-identical files no
//! matter what order resolution finished in.

use crate::api::links::ResolvedLink;
use crate::error::{Result, Tv3Error};
use crate::file::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const CSV_HEADER: [&str; 8] = [
    "program",
    "season",
    "episode",
    "title",
    "quality",
    "video_url",
    "subtitle_url",
    "target_path",
];

/// Structured dump of a resolved link set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub links: Vec<ResolvedLink>,
}

impl Manifest {
    pub fn new(links: &[ResolvedLink]) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            links: sorted(links),
        }
    }
}

/// Write the CSV listing and/or the JSON manifest, replacing prior files
pub async fn export(links: &[ResolvedLink], csv_path: Option<&Path>, manifest_path: Option<&Path>) -> Result<()> {
    let manifest = Manifest::new(links);

    if let Some(path) = csv_path {
        write_atomic(path, render_csv(&manifest.links).as_bytes()).await?;
        info!(path = %path.display(), rows = manifest.links.len(), "CSV written");
    }

    if let Some(path) = manifest_path {
        let mut json = serde_json::to_vec_pretty(&manifest)?;
        json.push(b'\n');
        write_atomic(path, &json).await?;
        info!(path = %path.display(), links = manifest.links.len(), "manifest written");
    }

    Ok(())
}

/// Read a manifest written by [`export`] back into resolved links
pub async fn load_manifest(path: &Path) -> Result<Vec<ResolvedLink>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Tv3Error::fs(path, e))?;

    let manifest: Manifest = serde_json::from_str(&json).map_err(|e| {
        Tv3Error::parse_error(format!("manifest {}: {}", path.display(), e), None)
    })?;

    if manifest.format_version != MANIFEST_FORMAT_VERSION {
        return Err(Tv3Error::parse_error(
            format!(
                "manifest {} has format version {}, expected {}",
                path.display(),
                manifest.format_version,
                MANIFEST_FORMAT_VERSION
            ),
            None,
        ));
    }

    Ok(manifest.links)
}

/// Write one `subject<TAB>reason` line per failure; the subject is the
/// target path, or the chapter when it failed before a path existed
pub async fn write_failure_log<'a, I>(path: &Path, failures: I) -> Result<usize>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    let mut count = 0;
    for (subject, reason) in failures {
        out.push_str(&single_line(subject));
        out.push('\t');
        out.push_str(&single_line(reason));
        out.push('\n');
        count += 1;
    }

    write_atomic(path, out.as_bytes()).await?;
    Ok(count)
}

fn sorted(links: &[ResolvedLink]) -> Vec<ResolvedLink> {
    let mut links = links.to_vec();
    links.sort_by(|a, b| {
        (&a.chapter.program, a.chapter.order_key(), &a.target_path).cmp(&(
            &b.chapter.program,
            b.chapter.order_key(),
            &b.target_path,
        ))
    });
    links
}

fn render_csv(links: &[ResolvedLink]) -> String {
    let mut out = String::new();
    push_row(&mut out, CSV_HEADER.iter().map(|h| h.to_string()));

    for link in links {
        push_row(
            &mut out,
            [
                link.chapter.program.clone(),
                link.chapter.season.to_string(),
                link.chapter.episode.to_string(),
                link.chapter.title.clone(),
                link.quality.clone(),
                link.video_url.clone(),
                link.subtitle_url.clone().unwrap_or_default(),
                link.target_path.to_string_lossy().into_owned(),
            ],
        );
    }
    out
}

fn push_row<I: IntoIterator<Item = String>>(out: &mut String, fields: I) {
    let row: Vec<String> = fields.into_iter().map(|f| csv_field(&f)).collect();
    out.push_str(&row.join(","));
    out.push('\n');
}

/// Quote a field when it holds a separator, quote, or line break
fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Chapter;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn link(episode: u32, title: &str, subtitle: bool) -> ResolvedLink {
        let stem = format!("S01E{:02} - {} [720p]", episode, title);
        ResolvedLink {
            chapter: Chapter {
                id: format!("id-{}", episode),
                program: "dr-slump".to_string(),
                season: 1,
                episode,
                title: title.to_string(),
                qualities: BTreeSet::from(["720p".to_string()]),
                has_subtitles: subtitle,
            },
            program_title: "Dr. Slump".to_string(),
            quality: "720p".to_string(),
            video_url: format!("https://cdn.example/{}.mp4", episode),
            subtitle_url: subtitle.then(|| format!("https://cdn.example/{}.vtt", episode)),
            target_path: PathBuf::from(format!("out/Dr. Slump/{}.mp4", stem)),
            subtitle_path: subtitle.then(|| PathBuf::from(format!("out/Dr. Slump/{}.vtt", stem))),
        }
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a, b"), "\"a, b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_render_csv_rows() {
        let csv = render_csv(&[link(1, "Arale, la nena robot", true), link(2, "Gatchan", false)]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "program,season,episode,title,quality,video_url,subtitle_url,target_path"
        );
        assert!(lines[1].starts_with("dr-slump,1,1,\"Arale, la nena robot\",720p,https://cdn.example/1.mp4,https://cdn.example/1.vtt,"));
        assert!(lines[2].contains(",720p,https://cdn.example/2.mp4,,"));
    }

    #[tokio::test]
    async fn test_export_is_idempotent_and_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("links.csv");
        let manifest = dir.path().join("links.json");

        let links = vec![link(1, "A", true), link(2, "B", false), link(3, "C", true)];
        export(&links, Some(&csv), Some(&manifest)).await.unwrap();
        let first = (std::fs::read(&csv).unwrap(), std::fs::read(&manifest).unwrap());

        let reversed: Vec<_> = links.iter().rev().cloned().collect();
        export(&reversed, Some(&csv), Some(&manifest)).await.unwrap();
        let second = (std::fs::read(&csv).unwrap(), std::fs::read(&manifest).unwrap());

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_load_manifest_returns_exported_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.json");
        let links = vec![link(1, "A", true), link(2, "B", false)];

        export(&links, None, Some(&path)).await.unwrap();
        assert_eq!(load_manifest(&path).await.unwrap(), links);
    }

    #[tokio::test]
    async fn test_load_manifest_rejects_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.json");
        std::fs::write(&path, r#"{"format_version":99,"links":[]}"#).unwrap();

        assert!(matches!(load_manifest(&path).await, Err(Tv3Error::ParseError { .. })));
        assert!(matches!(
            load_manifest(&dir.path().join("missing.json")).await,
            Err(Tv3Error::FilesystemError { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.tsv");
        let count = write_failure_log(
            &path,
            vec![("out/a.mp4", "HTTP 404"), ("out/b.mp4", "size mismatch\nretry later")],
        )
        .await
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "out/a.mp4\tHTTP 404\nout/b.mp4\tsize mismatch retry later\n"
        );
    }
}
