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

//! 3cat catalog API
//!
//! - [`client`]: HTTP plumbing with retry and bounded concurrency
//! - [`models`]: wire records tolerant of the API's loose JSON shapes
//! - [`catalog`]: program slug to ordered chapter list, cache-backed
//! - [`links`]: chapter to concrete media URLs and target paths

pub mod catalog;
pub mod client;
pub mod links;
pub mod models;

pub use catalog::{CatalogClient, CatalogListing, MAX_PAGES};
pub use client::ApiClient;
pub use links::{collect_outcomes, LinkOutcome, LinkQuery, LinkReport, LinkResolver, ResolvedLink};
