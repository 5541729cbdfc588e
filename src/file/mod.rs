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

//! File output: target path derivation, manifest/CSV export, and the atomic
//! write primitive shared by every small file the engine persists.

pub mod manifest;
pub mod paths;

pub use manifest::{export, load_manifest, write_failure_log, Manifest};
pub use paths::{sanitize_component, PathBuilder};

use crate::error::{Result, Tv3Error};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Suffix of in-progress temp files
pub const TEMP_SUFFIX: &str = ".tmp";

/// Replace `path` with `bytes` through a sibling temp file and a rename.
///
/// Readers see the old content or the new content, never a mix. Parent
/// directories are created as needed.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Tv3Error::fs(parent, e))?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| Tv3Error::invalid_input(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        "{}.{}{}",
        file_name.to_string_lossy(),
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ));

    let write = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Tv3Error::fs(path, e));
    }
    Ok(())
}
