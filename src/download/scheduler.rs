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

//! Bounded worker pool over a FIFO task queue
//!
//! Exactly `max_workers` workers pull from one shared queue in submission
//! order. A task's failure is recorded and never stops its siblings. Once
//! the cancellation token fires, workers stop dequeuing; the task each one
//! is running checkpoints and reports `Interrupted`, and everything still
//! queued is reported `NotStarted`.
//!
//! Outcomes are recorded as each task ends. A worker that panics loses only
//! the task it was running, which is reported `Failed`, and a replacement
//! worker takes over the queue.

use crate::download::transfer::{TransferEngine, TransferOutcome, TransferTask};
use crate::error::Tv3Error;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Final state of one scheduled unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded(TransferOutcome),
    /// Deliberately not transferred (quality filter, already present, ...)
    Skipped(String),
    Failed(String),
    /// Stopped by cancellation with its partial state saved
    Interrupted,
    /// Still queued when the run was cancelled
    NotStarted,
}

/// Outcome for one subject (a destination path or a chapter label)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub subject: String,
    pub outcome: TaskOutcome,
}

/// Live counters, safe to read while the pool runs
#[derive(Debug, Default)]
pub struct RunCounters {
    succeeded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Point-in-time copy of [`RunCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub active: usize,
    pub peak_active: usize,
}

impl RunCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
        }
    }

    fn start(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    /// Account for a task whose worker panicked mid-transfer
    fn abandon(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, outcome: &TaskOutcome) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let counter = match outcome {
            TaskOutcome::Succeeded(_) => &self.succeeded,
            TaskOutcome::Skipped(_) => &self.skipped,
            TaskOutcome::Failed(_) => &self.failed,
            TaskOutcome::Interrupted | TaskOutcome::NotStarted => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Complete result set of a run, in submission order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub results: Vec<TaskResult>,
}

impl RunReport {
    pub fn push<S: Into<String>>(&mut self, subject: S, outcome: TaskOutcome) {
        self.results.push(TaskResult {
            subject: subject.into(),
            outcome,
        });
    }

    pub fn extend(&mut self, other: RunReport) {
        self.results.extend(other.results);
    }

    fn count(&self, pred: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Succeeded(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Failed(_)))
    }

    pub fn interrupted(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Interrupted))
    }

    pub fn not_started(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::NotStarted))
    }

    /// `(subject, reason)` for every failure
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            TaskOutcome::Failed(reason) => Some((r.subject.as_str(), reason.as_str())),
            _ => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.interrupted() == 0 && self.not_started() == 0
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} succeeded, {} skipped, {} failed",
            self.succeeded(),
            self.skipped(),
            self.failed()
        );
        let pending = self.interrupted() + self.not_started();
        if pending > 0 {
            summary.push_str(&format!(", {} left for a later run", pending));
        }
        summary
    }
}

type Queue = Arc<Mutex<VecDeque<(usize, TransferTask)>>>;

/// Per-task slot; `None` until the task is dequeued
type Outcomes = Arc<Mutex<Vec<Option<TaskOutcome>>>>;

const PANICKED: &str = "transfer worker panicked";

/// Fixed-size worker pool feeding the transfer engine
pub struct TaskScheduler {
    engine: Arc<TransferEngine>,
    max_workers: usize,
    counters: Arc<RunCounters>,
}

impl TaskScheduler {
    pub fn new(engine: Arc<TransferEngine>, max_workers: usize) -> Self {
        Self {
            engine,
            max_workers: max_workers.max(1),
            counters: Arc::new(RunCounters::default()),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Live counters for front ends that poll
    pub fn counters(&self) -> Arc<RunCounters> {
        self.counters.clone()
    }

    /// Run every task and report each outcome. Never fails as a whole.
    pub async fn run(&self, tasks: Vec<TransferTask>, cancel: &CancellationToken) -> RunReport {
        let total = tasks.len();
        let subjects: Vec<String> = tasks.iter().map(|t| t.target.display().to_string()).collect();
        let queue: Queue = Arc::new(Mutex::new(tasks.into_iter().enumerate().collect()));

        info!(tasks = total, workers = self.max_workers, "starting transfers");

        let outcomes: Outcomes = Arc::new(Mutex::new(vec![None; total]));
        let spawn = |workers: &mut JoinSet<()>, worker: usize| {
            workers.spawn(work_queue(
                worker,
                queue.clone(),
                outcomes.clone(),
                self.engine.clone(),
                self.counters.clone(),
                cancel.clone(),
            ));
        };

        let mut workers = JoinSet::new();
        for worker in 0..self.max_workers {
            spawn(&mut workers, worker);
        }

        let mut next_worker = self.max_workers;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "transfer worker panicked; starting a replacement");
                self.counters.abandon();
                spawn(&mut workers, next_worker);
                next_worker += 1;
            }
        }

        let outcomes = std::mem::take(&mut *outcomes.lock().await);
        let mut report = RunReport::default();
        for (subject, outcome) in subjects.into_iter().zip(outcomes) {
            report.push(subject, outcome.unwrap_or(TaskOutcome::NotStarted));
        }

        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            interrupted = report.interrupted(),
            not_started = report.not_started(),
            "transfers finished"
        );
        report
    }
}

async fn work_queue(
    worker: usize,
    queue: Queue,
    outcomes: Outcomes,
    engine: Arc<TransferEngine>,
    counters: Arc<RunCounters>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(worker, "cancelled; no longer dequeuing");
            break;
        }
        let Some((index, task)) = queue.lock().await.pop_front() else {
            break;
        };

        // Stands until the real outcome replaces it
        outcomes.lock().await[index] = Some(TaskOutcome::Failed(PANICKED.to_string()));

        counters.start();
        let outcome = match engine.transfer(&task, &cancel).await {
            Ok(TransferOutcome::AlreadyComplete) => TaskOutcome::Skipped("already downloaded".to_string()),
            Ok(TransferOutcome::NothingToResume) => {
                TaskOutcome::Skipped("no partial transfer to resume".to_string())
            }
            Ok(outcome) => TaskOutcome::Succeeded(outcome),
            Err(Tv3Error::Cancelled) => TaskOutcome::Interrupted,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        };
        counters.finish(&outcome);
        outcomes.lock().await[index] = Some(outcome);
    }
}
