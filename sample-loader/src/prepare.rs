//! Preparation pass: finds the entry document of every sample once, so
//! that evaluation runs do not have to guess.

use crate::{Corpus, EntryDocument, EntryMap, Extractor, ExtractMode, Sample};
use anyhow::Context;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub min_sample_size: u64,
    /// Sample ids that are known to be unusable
    pub excluded: HashSet<String>,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        PrepareOptions {
            min_sample_size: crate::DEFAULT_MIN_SAMPLE_SIZE,
            excluded: HashSet::new(),
        }
    }
}

/// Resolves entry documents for all usable samples. Samples that cannot be
/// extracted or have no unambiguous entry are logged and left out.
pub async fn prepare(
    corpus: &Corpus,
    extractor: &Extractor,
    options: &PrepareOptions,
) -> anyhow::Result<EntryMap> {
    let mut map = EntryMap::new();
    for sample in corpus.samples() {
        if sample.is_withdrawn(options.min_sample_size) {
            tracing::debug!(sample = %sample.id, "skipping withdrawn sample");
            continue;
        }
        if options.excluded.contains(&sample.id) {
            tracing::debug!(sample = %sample.id, "skipping excluded sample");
            continue;
        }
        let task = {
            let sample = sample.clone();
            let extractor = extractor.clone();
            tokio::task::spawn_blocking(move || entry_of(&extractor, &sample))
        };
        match task.await.context("preparation task panicked")? {
            Ok(entry) => {
                tracing::info!(sample = %sample.id, entry = %entry, "resolved entry document");
                map.insert(sample.id.clone(), entry);
            }
            Err(err) => {
                tracing::warn!(sample = %sample.id, err = %format_args!("{:#}", err), "sample skipped");
            }
        }
    }
    Ok(map)
}

fn entry_of(extractor: &Extractor, sample: &Sample) -> anyhow::Result<String> {
    let workspace = extractor
        .extract(&sample.path, ExtractMode::Auto)
        .context("extraction failed")?;
    let entry = EntryDocument::resolve(workspace.path()).context("no entry document")?;
    workspace.close().context("failed to remove workspace")?;
    Ok(entry.name())
}
