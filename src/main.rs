use anyhow::Context;
use clap::Parser;
use engine_loader::{Engine, EngineLoader};
use processor::{
    CaptureStore, Evaluator, ExtensionPolicy, Pipeline, PipelineConfig, ReportLog,
};
use report_apis::{EngineInfo, RunMetadata};
use sample_loader::{Corpus, EntryMap, Extractor, DEFAULT_MIN_SAMPLE_SIZE};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Runs TeX engines over a corpus of submissions and writes a report
#[derive(Parser)]
struct Args {
    /// Directory with one gzip-compressed sample per file
    #[clap(long)]
    corpus: PathBuf,
    /// Run name; the report is written to <reports>/<name>.jsonl
    #[clap(long)]
    name: String,
    /// Entry map produced by `corpusctl prepare`. Defaults to
    /// <corpus>.json if that exists.
    #[clap(long)]
    entries: Option<PathBuf>,
    /// Directory containing engine manifests
    #[clap(long, default_value = "engines")]
    engines_dir: PathBuf,
    /// Engines to evaluate, in order
    #[clap(long = "engine", default_value = "tectonic")]
    engines: Vec<String>,
    /// Overrides program of an engine, e.g. tectonic=target/release/tectonic
    #[clap(long = "binary", value_parser = parse_binary)]
    binaries: Vec<(String, PathBuf)>,
    #[clap(long, default_value_t = processor::pipeline::DEFAULT_WORKERS)]
    workers: usize,
    /// Timeout of the main engine invocation, in seconds
    #[clap(long)]
    timeout: Option<u64>,
    /// Object store for produced files
    #[clap(long, default_value = "objects")]
    objects: PathBuf,
    #[clap(long, default_value = "reports")]
    reports: PathBuf,
    /// Samples smaller than this (in bytes) are withdrawn submissions
    #[clap(long, default_value_t = DEFAULT_MIN_SAMPLE_SIZE)]
    min_size: u64,
    /// Name stored objects after the produced file's extension instead of
    /// its detected content type
    #[clap(long)]
    ext_from_suffix: bool,
    /// Copy engine programs to a private directory before the run
    #[clap(long)]
    pin_binaries: bool,
    /// Replace an existing report with the same name
    #[clap(long)]
    overwrite: bool,
    /// Directory for temporary workspaces
    #[clap(long)]
    temp_dir: Option<PathBuf>,
    #[clap(long)]
    branch: Option<String>,
    #[clap(long)]
    commit: Option<String>,
    #[clap(long)]
    timestamp: Option<String>,
    #[clap(long)]
    link: Option<String>,
}

fn parse_binary(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got {:?}", s)),
    }
}

async fn load_engines(args: &Args, pin_dir: Option<&Path>) -> anyhow::Result<Vec<Engine>> {
    let loader = EngineLoader::new(&args.engines_dir);
    let mut overrides: HashMap<&str, &Path> = HashMap::new();
    for (name, path) in &args.binaries {
        if !args.engines.contains(name) {
            anyhow::bail!("--binary given for unknown engine {}", name);
        }
        overrides.insert(name, path);
    }
    let mut engines = Vec::new();
    for name in &args.engines {
        let mut engine = loader
            .resolve(name)
            .await
            .with_context(|| format!("failed to load engine {}", name))?;
        if let Some(path) = overrides.get(name.as_str()) {
            engine.program = path.to_path_buf();
        }
        if let Some(timeout) = args.timeout {
            engine.set_run_timeout(timeout);
        }
        engine.locate()?;
        if let Some(dir) = pin_dir {
            engine.pin(dir).await?;
        }
        engines.push(engine);
    }
    Ok(engines)
}

async fn load_entries(args: &Args, corpus: &Corpus) -> anyhow::Result<Option<EntryMap>> {
    let path = match &args.entries {
        Some(path) => path.clone(),
        None => {
            let path = corpus.entry_map_path();
            if tokio::fs::metadata(&path).await.is_err() {
                tracing::info!("no entry map found, entry documents will be resolved per sample");
                return Ok(None);
            }
            path
        }
    };
    let map = EntryMap::load(&path).await?;
    tracing::info!(entries = map.len(), path = %path.display(), "entry map loaded");
    Ok(Some(map))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let corpus = Corpus::open(&args.corpus)
        .await
        .context("failed to open corpus")?;
    let entries = load_entries(&args, &corpus).await?;

    let pin_dir = if args.pin_binaries {
        Some(tempfile::tempdir().context("failed to create directory for pinned engines")?)
    } else {
        None
    };
    let engines = load_engines(&args, pin_dir.as_ref().map(|d| d.path())).await?;

    let mut meta = RunMetadata::new(
        args.name.clone(),
        corpus.name(),
        engines
            .iter()
            .map(|e| EngineInfo {
                name: e.spec.name.clone(),
                title: e.spec.title.clone(),
                argv: e.spec.run.argv.clone(),
            })
            .collect(),
    );
    meta.branch = args.branch.clone();
    meta.commit = args.commit.clone();
    meta.timestamp = args.timestamp.clone();
    meta.link = args.link.clone();
    let report_path = args.reports.join(format!("{}.jsonl", args.name));
    let report = ReportLog::create(&report_path, &meta, args.overwrite).await?;

    let policy = if args.ext_from_suffix {
        ExtensionPolicy::Suffix
    } else {
        ExtensionPolicy::Sniffed
    };
    let store = CaptureStore::open(&args.objects, policy)?;
    let extractor = match &args.temp_dir {
        Some(dir) => Extractor::with_temp_root(dir.clone()),
        None => Extractor::new(),
    };
    let evaluator = Arc::new(Evaluator::new(extractor, store, engines));
    let config = PipelineConfig {
        workers: args.workers,
        min_sample_size: args.min_size,
        ..PipelineConfig::default()
    };
    let summary = Pipeline::new(evaluator, config)
        .run(&corpus, entries.as_ref(), report)
        .await?;
    println!(
        "Evaluated {} samples ({} with errors, {} skipped), report written to {}",
        summary.evaluated,
        summary.failed,
        summary.skipped,
        report_path.display()
    );
    Ok(())
}
