//! Evaluation of a single sample with every configured engine.

use crate::{
    capture::{Baseline, CaptureStore},
    tags::TagTable,
};
use anyhow::Context;
use engine_client::{CommandRequest, RunError};
use engine_loader::{Engine, Invocation, Substitutions};
use report_apis::{EngineReport, ReportRecord};
use sample_loader::{EntryDocument, ExtractMode, Extractor, Sample, Workspace};
use std::{collections::BTreeMap, path::Path};

/// One unit of work
#[derive(Debug, Clone)]
pub struct Job {
    pub sample: Sample,
    pub mode: ExtractMode,
    /// Entry document recorded by the preparation pass. Resolved in the
    /// workspace if absent.
    pub entry: Option<String>,
}

/// Why an engine could not be evaluated on a sample
#[derive(Debug)]
enum Failure {
    /// Something is wrong with the sample; other samples are unaffected
    Sample(anyhow::Error),
    /// Something is wrong with the setup; continuing makes no sense
    Fatal(anyhow::Error),
}

/// Extracted sample, ready for an engine
struct Prepared {
    workspace: Workspace,
    baseline: Baseline,
    entry: EntryDocument,
}

pub struct Evaluator {
    extractor: Extractor,
    store: CaptureStore,
    tags: &'static TagTable,
    engines: Vec<Engine>,
}

impl Evaluator {
    pub fn new(extractor: Extractor, store: CaptureStore, engines: Vec<Engine>) -> Evaluator {
        Evaluator {
            extractor,
            store,
            tags: TagTable::builtin(),
            engines,
        }
    }

    pub fn engines(&self) -> &[Engine] {
        &self.engines
    }

    /// Runs all engines on the sample. Problems with the sample itself end
    /// up in [`ReportRecord::error`]; an error is only returned when the
    /// evaluation setup is broken (e.g. an engine cannot be launched).
    #[tracing::instrument(skip(self, job), fields(sample = %job.sample.id))]
    pub async fn evaluate(&self, job: &Job) -> anyhow::Result<ReportRecord> {
        let mut record = ReportRecord::new(job.sample.id.clone());
        for engine in &self.engines {
            match self.evaluate_engine(engine, job).await {
                Ok(report) => {
                    tracing::info!(
                        engine = engine.name(),
                        status = report.statuscode,
                        seconds = report.seconds,
                        "engine finished"
                    );
                    record.engines.insert(engine.name().to_string(), report);
                }
                Err(Failure::Sample(err)) => {
                    let err = format!("{:#}", err);
                    tracing::warn!(engine = engine.name(), err = %err, "sample could not be evaluated");
                    record.error = Some(err);
                    break;
                }
                Err(Failure::Fatal(err)) => {
                    return Err(err.context(format!("engine {} failed", engine.name())))
                }
            }
        }
        Ok(record)
    }

    async fn evaluate_engine(&self, engine: &Engine, job: &Job) -> Result<EngineReport, Failure> {
        let prepared = {
            let extractor = self.extractor.clone();
            let store = self.store.clone();
            let job = job.clone();
            tokio::task::spawn_blocking(move || prepare(&extractor, &store, &job))
                .await
                .context("workspace preparation panicked")
                .map_err(Failure::Fatal)?
                .map_err(Failure::Sample)?
        };
        let Prepared {
            workspace,
            baseline,
            entry,
        } = prepared;
        let entry_name = entry.name();
        let entry_stem = entry.stem();
        let subst = Substitutions {
            program: &engine.program,
            entry: &entry_name,
            entry_stem: &entry_stem,
            workspace: workspace.path(),
        };

        for (i, invocation) in engine.prepare_invocations(&subst).iter().enumerate() {
            let outcome = run(invocation, workspace.path()).await?;
            if outcome.timed_out() {
                tracing::warn!(step = i, "preparation command timed out");
            }
        }
        let outcome = run(&engine.run_invocation(&subst), workspace.path()).await?;

        let log_file = engine.log_file(&subst).map(|p| workspace.path().join(p));
        let dir = workspace.path().to_path_buf();
        let tags = self.tags;
        let store = self.store.clone();
        let capture = engine.spec.capture;
        let (tags, results) = tokio::task::spawn_blocking(move || {
            collect(tags, &store, &dir, log_file.as_deref(), capture.then(|| baseline))
        })
        .await
        .context("output collection panicked")
        .map_err(Failure::Fatal)?
        .map_err(Failure::Sample)?;

        if let Err(err) = workspace.close() {
            tracing::warn!(err = %err, "failed to remove workspace");
        }
        Ok(EngineReport {
            statuscode: outcome.status,
            seconds: outcome.elapsed.as_secs_f64(),
            results,
            tags,
        })
    }
}

fn prepare(extractor: &Extractor, store: &CaptureStore, job: &Job) -> anyhow::Result<Prepared> {
    let workspace = extractor
        .extract(&job.sample.path, job.mode)
        .context("failed to extract sample")?;
    let baseline = store
        .snapshot_digests(workspace.path())
        .context("failed to snapshot inputs")?;
    let entry = match &job.entry {
        Some(name) => EntryDocument::from_map(workspace.path(), name),
        None => EntryDocument::resolve(workspace.path()),
    }
    .context("failed to determine entry document")?;
    Ok(Prepared {
        workspace,
        baseline,
        entry,
    })
}

type Collected = (Option<Vec<String>>, Option<BTreeMap<String, String>>);

fn collect(
    tags: &TagTable,
    store: &CaptureStore,
    dir: &Path,
    log_file: Option<&Path>,
    baseline: Option<Baseline>,
) -> anyhow::Result<Collected> {
    let tags = match log_file {
        Some(log) => Some(
            tags.classify(log)
                .with_context(|| format!("failed to read log {}", log.display()))?,
        ),
        None => None,
    };
    let results = match baseline {
        Some(baseline) => Some(
            store
                .capture_new(dir, &baseline)
                .context("failed to capture outputs")?,
        ),
        None => None,
    };
    Ok((tags, results))
}

async fn run(
    invocation: &Invocation,
    dir: &Path,
) -> Result<engine_client::CommandOutcome, Failure> {
    let req = CommandRequest {
        argv: &invocation.argv,
        env: &invocation.env,
        current_dir: dir,
        timeout: invocation.timeout,
    };
    engine_client::run_command(req).await.map_err(|err| match err {
        RunError::Wait { .. } => Failure::Sample(err.into()),
        RunError::Spawn { .. } | RunError::EmptyCommand => Failure::Fatal(err.into()),
    })
}
