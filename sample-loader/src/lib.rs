//! This library is responsible for turning corpus samples into workspaces
//! an engine can be run in.

pub mod entry;
pub mod prepare;
pub mod sandbox;
pub mod sniff;

pub use entry::{resolve_entry, EntryDocument, EntryError};
pub use sandbox::{ExtractError, ExtractMode, Extractor, Workspace};

use anyhow::Context;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Samples smaller than this are withdrawn submissions.
pub const DEFAULT_MIN_SAMPLE_SIZE: u64 = 100;

/// One submission file
#[derive(Debug, Clone)]
pub struct Sample {
    /// File stem
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
}

impl Sample {
    pub fn is_withdrawn(&self, min_size: u64) -> bool {
        self.size < min_size
    }
}

/// Directory with one file per sample
#[derive(Debug, Clone)]
pub struct Corpus {
    dir: PathBuf,
    samples: Vec<Sample>,
}

impl Corpus {
    /// Lists regular files in `dir`. Samples are sorted by id.
    #[tracing::instrument]
    pub async fn open(dir: &Path) -> anyhow::Result<Corpus> {
        // drop trailing separators so that sibling paths can be derived
        let dir: PathBuf = dir.components().collect();
        let mut samples = Vec::new();
        let mut items = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to list corpus at {}", dir.display()))?;
        while let Some(item) = items
            .next_entry()
            .await
            .context("failed to list corpus")?
        {
            let meta = item
                .metadata()
                .await
                .with_context(|| format!("failed to stat {}", item.path().display()))?;
            if !meta.is_file() {
                continue;
            }
            let path = item.path();
            let id = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().into_owned(),
                None => continue,
            };
            samples.push(Sample {
                id,
                path,
                size: meta.len(),
            });
        }
        samples.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::info!(samples = samples.len(), "corpus listed");
        Ok(Corpus { dir, samples })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Dataset name used in reports
    pub fn name(&self) -> String {
        self.dir
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// `<corpus-dir>.json`, where the preparation pass stores its entry map
    pub fn entry_map_path(&self) -> PathBuf {
        let mut path = self.dir.clone().into_os_string();
        path.push(".json");
        path.into()
    }
}

/// Maps sample id to the file name of its entry document.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct EntryMap(BTreeMap<String, String>);

impl EntryMap {
    pub fn new() -> Self {
        EntryMap::default()
    }

    pub async fn load(path: &Path) -> anyhow::Result<EntryMap> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read entry map {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("entry map {} is not valid", path.display()))
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec(self).context("failed to serialize entry map")?;
        tokio::fs::write(path, data)
            .await
            .with_context(|| format!("failed to write entry map to {}", path.display()))
    }

    pub fn get(&self, sample_id: &str) -> Option<&str> {
        self.0.get(sample_id).map(String::as_str)
    }

    pub fn insert(&mut self, sample_id: String, entry: String) {
        self.0.insert(sample_id, entry);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// How a sample should be extracted. Flat submissions are recorded with
    /// the sample id itself as entry, since that is the name their single
    /// decompressed file gets.
    pub fn extract_mode(&self, sample_id: &str) -> ExtractMode {
        match self.get(sample_id) {
            Some(entry) if entry == sample_id => ExtractMode::Flat,
            Some(_) => ExtractMode::Tar,
            None => ExtractMode::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn corpus_lists_files_sorted() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("arxiv");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("2.gz"), b"bb").unwrap();
        std::fs::write(dir.join("1.gz"), b"a").unwrap();
        std::fs::create_dir(dir.join("nested")).unwrap();

        let corpus = Corpus::open(&dir.join("")).await.unwrap();
        let ids: Vec<_> = corpus.samples().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
        assert_eq!(corpus.samples()[1].size, 2);
        assert_eq!(corpus.name(), "arxiv");
        assert_eq!(corpus.entry_map_path(), root.path().join("arxiv.json"));
    }

    #[tokio::test]
    async fn entry_map_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        let mut map = EntryMap::new();
        map.insert("1".to_string(), "main.tex".to_string());
        map.insert("2".to_string(), "2".to_string());
        map.save(&path).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"1":"main.tex","2":"2"}"#
        );
        let loaded = EntryMap::load(&path).await.unwrap();
        assert_eq!(loaded.extract_mode("1"), ExtractMode::Tar);
        assert_eq!(loaded.extract_mode("2"), ExtractMode::Flat);
        assert_eq!(loaded.extract_mode("3"), ExtractMode::Auto);
    }
}
