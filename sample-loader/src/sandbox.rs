//! Extraction of untrusted submissions into private workspaces.

use crate::sniff::{self, ContentType};
use flate2::read::MultiGzDecoder;
use std::{
    collections::HashSet,
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
};

const WORKSPACE_PREFIX: &str = "corpus-eval-";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Outer layer (or inner layer in [`ExtractMode::Tar`]) has unexpected type
    #[error("{} is not {expected} (detected {found})", path.display())]
    Format {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },
    /// Some archive member would land outside of the workspace
    #[error("archive member {} escapes the workspace", entry.display())]
    PathTraversal { entry: PathBuf },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> ExtractError {
    let context = context.into();
    move |source| ExtractError::Io { context, source }
}

/// What to do with decompressed sample contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Unpack if the decompressed data looks like a tar stream
    Auto,
    /// Decompressed data must be a tar stream
    Tar,
    /// Keep decompressed data as a single file named after the sample
    Flat,
}

/// Directory holding one extracted sample.
///
/// Removed recursively when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the workspace, reporting errors instead of ignoring them.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Creates workspaces for samples.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    /// Parent for workspace directories. OS temp dir if unset.
    temp_root: Option<PathBuf>,
}

impl Extractor {
    pub fn new() -> Self {
        Extractor::default()
    }

    pub fn with_temp_root(temp_root: impl Into<PathBuf>) -> Self {
        Extractor {
            temp_root: Some(temp_root.into()),
        }
    }

    /// Decompresses `archive` into a fresh workspace, unpacking an inner tar
    /// stream according to `mode`.
    ///
    /// Nothing is left on disk if this returns an error.
    pub fn extract(&self, archive: &Path, mode: ExtractMode) -> Result<Workspace, ExtractError> {
        let outer = sniff::sniff_file(archive)
            .map_err(io_err(format!("failed to read {}", archive.display())))?;
        if outer != ContentType::Gzip {
            return Err(ExtractError::Format {
                path: archive.to_path_buf(),
                expected: ContentType::Gzip.mime_type(),
                found: outer.mime_type(),
            });
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match &self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(io_err("failed to create workspace"))?;
        let workspace = Workspace { dir };

        let stem = archive
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "sample".into());

        let mut staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(workspace.path())
            .map_err(io_err("failed to create staging file"))?;
        {
            let src = File::open(archive)
                .map_err(io_err(format!("failed to open {}", archive.display())))?;
            let mut decoder = MultiGzDecoder::new(src);
            io::copy(&mut decoder, staging.as_file_mut())
                .map_err(io_err(format!("failed to decompress {}", archive.display())))?;
        }

        let inner = sniff::sniff_file(staging.path())
            .map_err(io_err("failed to inspect decompressed data"))?;
        let unpack = match mode {
            ExtractMode::Flat => false,
            ExtractMode::Auto => inner == ContentType::Tar,
            ExtractMode::Tar if inner == ContentType::Tar => true,
            ExtractMode::Tar => {
                return Err(ExtractError::Format {
                    path: archive.to_path_buf(),
                    expected: ContentType::Tar.mime_type(),
                    found: inner.mime_type(),
                })
            }
        };

        if unpack {
            let root = fs::canonicalize(workspace.path())
                .map_err(io_err("failed to canonicalize workspace"))?;
            check_members(&root, staging.path())?;
            let data = staging
                .reopen()
                .map_err(io_err("failed to reopen staging file"))?;
            tar::Archive::new(data)
                .unpack(&root)
                .map_err(io_err(format!("failed to unpack {}", archive.display())))?;
            staging
                .close()
                .map_err(io_err("failed to remove staging file"))?;
        } else {
            staging
                .persist(workspace.path().join(&stem))
                .map_err(|e| e.error)
                .map_err(io_err("failed to store decompressed sample"))?;
        }
        tracing::debug!(workspace = %workspace.path().display(), unpacked = unpack, "sample extracted");
        Ok(workspace)
    }
}

/// Validates every member of the tar stream at `tar_path` before anything
/// is unpacked into `root` (which must be canonical).
fn check_members(root: &Path, tar_path: &Path) -> Result<(), ExtractError> {
    let file = File::open(tar_path).map_err(io_err("failed to reopen staging file"))?;
    let mut archive = tar::Archive::new(file);
    let entries = archive
        .entries()
        .map_err(io_err("failed to read tar stream"))?;
    // symlinks seen so far; nothing may be resolved through them
    let mut symlinks = HashSet::new();
    for entry in entries {
        let entry = entry.map_err(io_err("failed to read tar entry"))?;
        let name = entry
            .path()
            .map_err(io_err("failed to decode tar entry name"))?
            .into_owned();
        let kind = entry.header().entry_type();
        let traversal = || ExtractError::PathTraversal {
            entry: name.clone(),
        };

        let relative = normalize(&name).ok_or_else(traversal)?;
        if relative.as_os_str().is_empty() && !kind.is_dir() {
            return Err(traversal());
        }
        if !root.join(&relative).starts_with(root) || passes_symlink(&name, &symlinks) {
            return Err(traversal());
        }

        if kind.is_symlink() || kind.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(io_err("failed to decode tar link name"))?
                .ok_or_else(traversal)?;
            // symlinks are relative to their own directory, hard links to the archive root
            let base = if kind.is_symlink() {
                relative.parent().unwrap_or_else(|| Path::new(""))
            } else {
                Path::new("")
            };
            let resolved = normalize(&base.join(&target)).ok_or_else(traversal)?;
            if kind.is_hard_link() && resolved.as_os_str().is_empty() {
                return Err(traversal());
            }
            let through_link = passes_symlink(&base.join(&target), &symlinks);
            if through_link || !root.join(&resolved).starts_with(root) {
                return Err(traversal());
            }
            if kind.is_symlink() {
                symlinks.insert(relative);
            }
        }
    }
    Ok(())
}

/// Whether walking `path` from the workspace root touches any of `symlinks`.
/// Lexical normalization alone would miss `link/..` where `link` points
/// elsewhere.
fn passes_symlink(path: &Path, symlinks: &HashSet<PathBuf>) -> bool {
    if symlinks.is_empty() {
        return false;
    }
    let mut current = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                current.push(part);
                if symlinks.contains(&current) {
                    return true;
                }
            }
            Component::ParentDir => {
                current.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    false
}

/// Lexically resolves `.` and `..`. Returns `None` for absolute paths and
/// paths climbing above their starting point.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::normalize;
    use std::path::{Path, PathBuf};

    #[test]
    fn normalize_rejects_escapes() {
        assert_eq!(normalize(Path::new("a/./b")), Some(PathBuf::from("a/b")));
        assert_eq!(normalize(Path::new("a/../b")), Some(PathBuf::from("b")));
        assert_eq!(normalize(Path::new("./")), Some(PathBuf::new()));
        assert_eq!(normalize(Path::new("../x")), None);
        assert_eq!(normalize(Path::new("a/../../x")), None);
        assert_eq!(normalize(Path::new("/etc/passwd")), None);
    }
}
