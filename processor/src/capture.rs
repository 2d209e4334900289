//! Content-addressed storage of files produced by engines.

use anyhow::Context;
use sample_loader::sniff::{self, ContentType};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

/// Hex characters of the SHA-256 digest used as object name
pub const DIGEST_LEN: usize = 16;
const HASH_BUF_LEN: usize = 128 * 1024;
const GENERIC_EXTENSION: &str = ".bin";

/// How the extension of a stored object is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionPolicy {
    /// From the detected content type
    Sniffed,
    /// From the captured file's own name
    Suffix,
}

/// Digests of files that must not be captured, usually the sample inputs.
#[derive(Debug, Clone, Default)]
pub struct Baseline(HashSet<String>);

impl Baseline {
    pub fn contains(&self, digest: &str) -> bool {
        self.0.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Directory of immutable objects named `<digest><ext>`
#[derive(Debug, Clone)]
pub struct CaptureStore {
    objects_dir: PathBuf,
    policy: ExtensionPolicy,
}

impl CaptureStore {
    pub fn open(objects_dir: &Path, policy: ExtensionPolicy) -> anyhow::Result<CaptureStore> {
        fs::create_dir_all(objects_dir).with_context(|| {
            format!(
                "failed to create object store at {}",
                objects_dir.display()
            )
        })?;
        Ok(CaptureStore {
            objects_dir: objects_dir.to_path_buf(),
            policy,
        })
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Records digests of all regular files in `dir` without storing anything.
    pub fn snapshot_digests(&self, dir: &Path) -> anyhow::Result<Baseline> {
        let mut digests = HashSet::new();
        for (_, path) in regular_files(dir)? {
            digests.insert(file_digest(&path)?);
        }
        Ok(Baseline(digests))
    }

    /// Stores every regular file in `dir` whose digest is not in `excluded`.
    /// Returns file name -> object name.
    pub fn capture_new(
        &self,
        dir: &Path,
        excluded: &Baseline,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let mut captured = BTreeMap::new();
        for (name, path) in regular_files(dir)? {
            let digest = file_digest(&path)?;
            if excluded.contains(&digest) {
                continue;
            }
            let object = format!("{}{}", digest, self.extension(&path)?);
            if self.store(&path, &object)? {
                tracing::debug!(file = %name, object = %object, "stored new object");
            }
            captured.insert(name, object);
        }
        Ok(captured)
    }

    fn extension(&self, path: &Path) -> anyhow::Result<String> {
        let ext = match self.policy {
            ExtensionPolicy::Suffix => match path.extension() {
                Some(ext) => format!(".{}", ext.to_string_lossy()),
                None => GENERIC_EXTENSION.to_string(),
            },
            ExtensionPolicy::Sniffed => {
                let ty = sniff::sniff_file(path)
                    .with_context(|| format!("failed to inspect {}", path.display()))?;
                extension_for(ty).to_string()
            }
        };
        Ok(ext)
    }

    /// Returns whether a new object was written. An existing object with the
    /// same name has the same content, so it is left alone.
    fn store(&self, src: &Path, object: &str) -> anyhow::Result<bool> {
        let target = self.objects_dir.join(object);
        if target.exists() {
            return Ok(false);
        }
        let mut incoming = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.objects_dir)
            .context("failed to create temporary object")?;
        let mut data =
            File::open(src).with_context(|| format!("failed to open {}", src.display()))?;
        io::copy(&mut data, incoming.as_file_mut())
            .with_context(|| format!("failed to copy {}", src.display()))?;
        match incoming.persist_noclobber(&target) {
            Ok(_) => Ok(true),
            // another worker stored the same content first
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error)
                .with_context(|| format!("failed to store object {}", target.display())),
        }
    }
}

fn extension_for(ty: ContentType) -> &'static str {
    match ty {
        ContentType::Pdf => ".pdf",
        ContentType::PlainText => ".txt",
        _ => GENERIC_EXTENSION,
    }
}

/// Truncated hex SHA-256 of a file's content
pub fn file_digest(path: &Path) -> anyhow::Result<String> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_LEN];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(DIGEST_LEN);
    Ok(digest)
}

/// Regular files directly under `dir`, sorted by name
fn regular_files(dir: &Path) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let items = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for item in items {
        let item = item.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = item.path();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            _ => continue,
        }
        files.push((item.file_name().to_string_lossy().into_owned(), path));
    }
    files.sort();
    Ok(files)
}
