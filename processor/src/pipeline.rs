//! Worker pool that evaluates a whole corpus.

use crate::{
    evaluate::{Evaluator, Job},
    report_log::ReportLog,
};
use anyhow::Context;
use sample_loader::{Corpus, EntryMap, ExtractMode, DEFAULT_MIN_SAMPLE_SIZE};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

/// Default number of concurrently evaluated samples
pub const DEFAULT_WORKERS: usize = 5;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Samples smaller than this are not evaluated
    pub min_sample_size: u64,
    /// Sample ids that are not evaluated
    pub excluded: HashSet<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: DEFAULT_WORKERS,
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            excluded: HashSet::new(),
        }
    }
}

/// What happened during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Samples handed to workers
    pub queued: usize,
    /// Withdrawn, excluded or not present in the entry map
    pub skipped: usize,
    /// Records written
    pub evaluated: usize,
    /// Records written with an error
    pub failed: usize,
}

enum WorkItem {
    Evaluate(Job),
    Shutdown,
}

#[derive(Default)]
struct WorkerStats {
    evaluated: usize,
    failed: usize,
}

pub struct Pipeline {
    evaluator: Arc<Evaluator>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(evaluator: Arc<Evaluator>, config: PipelineConfig) -> Pipeline {
        Pipeline { evaluator, config }
    }

    fn jobs(&self, corpus: &Corpus, entries: Option<&EntryMap>) -> (Vec<Job>, usize) {
        let mut jobs = Vec::new();
        let mut skipped = 0;
        for sample in corpus.samples() {
            if sample.is_withdrawn(self.config.min_sample_size) {
                tracing::debug!(sample = %sample.id, size = sample.size, "skipping withdrawn sample");
                skipped += 1;
                continue;
            }
            if self.config.excluded.contains(&sample.id) {
                tracing::debug!(sample = %sample.id, "skipping excluded sample");
                skipped += 1;
                continue;
            }
            let (mode, entry) = match entries {
                Some(map) => match map.get(&sample.id) {
                    Some(entry) => (map.extract_mode(&sample.id), Some(entry.to_string())),
                    None => {
                        tracing::debug!(sample = %sample.id, "skipping sample without entry document");
                        skipped += 1;
                        continue;
                    }
                },
                None => (ExtractMode::Auto, None),
            };
            jobs.push(Job {
                sample: sample.clone(),
                mode,
                entry,
            });
        }
        (jobs, skipped)
    }

    /// Evaluates every eligible sample of the corpus and appends the records
    /// to `report`. The report is closed before returning, also when the run
    /// is aborted by a fatal error.
    #[tracing::instrument(skip_all, fields(corpus = %corpus.dir().display()))]
    pub async fn run(
        &self,
        corpus: &Corpus,
        entries: Option<&EntryMap>,
        report: ReportLog,
    ) -> anyhow::Result<RunSummary> {
        let workers = self.config.workers.max(1);
        let (jobs, skipped) = self.jobs(corpus, entries);
        let queued = jobs.len();
        tracing::info!(queued, skipped, workers, "starting evaluation");

        let (tx, rx) = mpsc::channel(queued + workers);
        for job in jobs {
            tx.try_send(WorkItem::Evaluate(job))
                .ok()
                .context("bug: work queue is too small")?;
        }
        for _ in 0..workers {
            tx.try_send(WorkItem::Shutdown)
                .ok()
                .context("bug: work queue is too small")?;
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let report = Arc::new(report);
        let abort = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for id in 0..workers {
            let worker = Worker {
                evaluator: self.evaluator.clone(),
                rx: rx.clone(),
                report: report.clone(),
                abort: abort.clone(),
            };
            handles.push(tokio::task::spawn(
                worker.run().instrument(tracing::info_span!("worker", id)),
            ));
        }

        let mut summary = RunSummary {
            queued,
            skipped,
            ..RunSummary::default()
        };
        let mut first_error = None;
        for res in futures::future::join_all(handles).await {
            let res = res
                .context("worker panicked")
                .and_then(|worker_res| worker_res);
            match res {
                Ok(stats) => {
                    summary.evaluated += stats.evaluated;
                    summary.failed += stats.failed;
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let report = Arc::try_unwrap(report)
            .ok()
            .context("bug: report log is still shared after workers finished")?;
        report.close().await?;
        if let Some(err) = first_error {
            return Err(err);
        }
        tracing::info!(
            evaluated = summary.evaluated,
            failed = summary.failed,
            "evaluation finished"
        );
        Ok(summary)
    }
}

struct Worker {
    evaluator: Arc<Evaluator>,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    report: Arc<ReportLog>,
    abort: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self) -> anyhow::Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        loop {
            // release the receiver before evaluating
            let item = self.rx.lock().await.recv().await;
            let job = match item {
                Some(WorkItem::Evaluate(job)) => job,
                Some(WorkItem::Shutdown) | None => break,
            };
            if self.abort.load(Ordering::SeqCst) {
                continue;
            }
            let record = match self.evaluator.evaluate(&job).await {
                Ok(record) => record,
                Err(err) => {
                    self.abort.store(true, Ordering::SeqCst);
                    tracing::error!(sample = %job.sample.id, err = %format_args!("{:#}", err), "aborting run");
                    return Err(err);
                }
            };
            if let Err(err) = self.report.append(&record).await {
                self.abort.store(true, Ordering::SeqCst);
                return Err(err);
            }
            stats.evaluated += 1;
            if record.error.is_some() {
                stats.failed += 1;
            }
        }
        tracing::debug!(evaluated = stats.evaluated, "worker stopped");
        Ok(stats)
    }
}
