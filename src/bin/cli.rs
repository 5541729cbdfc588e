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

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tv3_core::download::progress::{ProgressCallback, TransferState};
use tv3_core::logging::{init_logging, LogOptions};
use tv3_core::{DownloadManager, EngineConfig, RunOptions, RunSummary};

#[derive(Parser)]
#[command(name = "tv3-cli")]
#[command(about = "TV3 CLI - Download programs from the 3cat catalog", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output root (overrides the configuration)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Concurrent workers
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Debug output on the console
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write a DEBUG log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a program and export its links without downloading
    List(ProgramArgs),
    /// Resolve a program and download it
    Download(ProgramArgs),
    /// Only continue downloads that have partial progress
    Resume(ProgramArgs),
    /// Download the links of a previously exported manifest
    FromManifest {
        /// Manifest written by `list --manifest`
        manifest: PathBuf,

        #[command(flatten)]
        transfer: TransferArgs,
    },
}

#[derive(Args)]
struct ProgramArgs {
    /// Program slug, e.g. dr-slump
    program: String,

    /// Quality label filter, e.g. 720p; best available when omitted
    #[arg(short, long)]
    quality: Option<String>,

    /// Skip subtitles
    #[arg(long)]
    no_subtitles: bool,

    /// Ignore the catalog cache and fetch fresh
    #[arg(long)]
    refresh: bool,

    /// Write a CSV listing of the resolved links
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Write a JSON manifest of the resolved links
    #[arg(long)]
    manifest: Option<PathBuf>,

    #[command(flatten)]
    transfer: TransferArgs,
}

#[derive(Args)]
struct TransferArgs {
    /// Restart partial downloads instead of resuming them
    #[arg(long)]
    no_resume: bool,

    /// Delegate video transfers to aria2c when it is installed
    #[arg(long)]
    aria2: bool,

    /// Write failed targets and reasons to this file
    #[arg(long)]
    failure_log: Option<PathBuf>,
}

impl TransferArgs {
    fn apply(&self, options: &mut RunOptions) {
        options.resume = !self.no_resume;
        options.use_external_engine = self.aria2;
        options.failure_log_path = self.failure_log.clone();
    }
}

impl ProgramArgs {
    fn options(&self) -> RunOptions {
        let mut options = RunOptions::new(self.program.clone());
        options.quality = self.quality.clone();
        options.include_subtitles = !self.no_subtitles;
        options.use_cache = !self.refresh;
        options.csv_path = self.csv.clone();
        options.manifest_path = self.manifest.clone();
        self.transfer.apply(&mut options);
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(&LogOptions {
        verbose: cli.verbose,
        quiet: false,
        log_file: cli.log_file.clone(),
    })?;

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env()?;
    if let Some(output) = &cli.output {
        config.output_directory = output.clone();
    }
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }

    let progress: ProgressCallback = Arc::new(|p| {
        if p.state.is_terminal() && p.state != TransferState::Completed {
            eprintln!("{}", p.display_string());
        }
    });
    let manager = DownloadManager::new(config)
        .await
        .context("invalid configuration")?
        .with_progress(progress);

    let cancel = manager.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, saving partial progress...");
            cancel.cancel();
        }
    });

    let summary = match &cli.command {
        Commands::List(args) => {
            let mut options = args.options();
            options.list_only = true;
            manager.run(&options).await?
        }
        Commands::Download(args) => manager.run(&args.options()).await?,
        Commands::Resume(args) => {
            let mut options = args.options();
            options.resume_only = true;
            manager.run(&options).await?
        }
        Commands::FromManifest { manifest, transfer } => {
            let mut options = RunOptions::new(String::new());
            transfer.apply(&mut options);
            manager.run_manifest(manifest, &options).await?
        }
    };

    print_summary(&summary, matches!(cli.command, Commands::List(_)));
    if summary.report.failed() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, list_only: bool) {
    if let Some(program) = &summary.program {
        let source = if summary.from_cache { "cache" } else { "catalog" };
        println!("{} ({}, from {})", program.title, program.slug, source);
    }

    if list_only {
        for link in &summary.links {
            println!(
                "  S{:02}E{:02} {} [{}]",
                link.chapter.season, link.chapter.episode, link.chapter.title, link.quality
            );
        }
    }

    println!("{}", summary.report.summary());
    for (subject, reason) in summary.report.failures() {
        println!("  failed: {}: {}", subject, reason);
    }
}
