use anyhow::Context;
use clap::{Parser, Subcommand};
use sample_loader::{
    prepare::{prepare, PrepareOptions},
    Corpus, Extractor, DEFAULT_MIN_SAMPLE_SIZE,
};
use std::{collections::HashSet, path::PathBuf};

/// Corpus maintenance tool
#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the entry document of every sample and store the mapping
    /// next to the corpus directory
    Prepare(PrepareArgs),
}

#[derive(clap::Args)]
struct PrepareArgs {
    /// Corpus directory
    corpus: PathBuf,
    /// Samples smaller than this (in bytes) are withdrawn submissions
    #[clap(long, default_value_t = DEFAULT_MIN_SAMPLE_SIZE)]
    min_size: u64,
    /// File with sample ids to leave out, one per line
    #[clap(long)]
    exclude: Option<PathBuf>,
    /// Directory for temporary workspaces
    #[clap(long)]
    temp_dir: Option<PathBuf>,
}

async fn read_exclusions(path: &std::path::Path) -> anyhow::Result<HashSet<String>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read exclusion list {}", path.display()))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}

async fn run_prepare(args: PrepareArgs) -> anyhow::Result<()> {
    let corpus = Corpus::open(&args.corpus)
        .await
        .context("failed to open corpus")?;
    let excluded = match &args.exclude {
        Some(path) => read_exclusions(path).await?,
        None => HashSet::new(),
    };
    let options = PrepareOptions {
        min_sample_size: args.min_size,
        excluded,
    };
    let extractor = match args.temp_dir {
        Some(dir) => Extractor::with_temp_root(dir),
        None => Extractor::new(),
    };
    let map = prepare(&corpus, &extractor, &options).await?;
    let dest = corpus.entry_map_path();
    map.save(&dest).await?;
    tracing::info!(
        resolved = map.len(),
        samples = corpus.samples().len(),
        entry_map = %dest.display(),
        "preparation finished"
    );
    println!(
        "Resolved {} of {} samples, entry map written to {}",
        map.len(),
        corpus.samples().len(),
        dest.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    match args.command {
        Command::Prepare(args) => run_prepare(args).await,
    }
}
