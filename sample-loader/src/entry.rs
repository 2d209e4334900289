//! Choosing the document a submission should be compiled from.

use crate::sniff::{self, ContentType};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

/// Only the document that should be passed to the engine contains this.
pub const ENTRY_MARKER: &[u8] = b"\\documentclass";

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("no TeX document found in {}", dir.display())]
    NoCandidates { dir: PathBuf },
    #[error("cannot choose entry document: {marked} of {candidates:?} contain \\documentclass")]
    Ambiguous {
        candidates: Vec<String>,
        marked: usize,
    },
    #[error("entry name {name:?} is not a plain file name")]
    InvalidName { name: String },
    #[error("entry document {name:?} does not exist")]
    Missing { name: String },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// Compilation root of a workspace, relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDocument(PathBuf);

impl EntryDocument {
    /// Inspects files directly under `dir` and picks the entry document.
    ///
    /// A single TeX-like file is the entry without looking inside it.
    /// Otherwise exactly one candidate must contain [`ENTRY_MARKER`].
    pub fn resolve(dir: &Path) -> Result<EntryDocument, EntryError> {
        let candidates = tex_candidates(dir)?;
        match candidates.len() {
            0 => {
                return Err(EntryError::NoCandidates {
                    dir: dir.to_path_buf(),
                })
            }
            1 => return Ok(EntryDocument(PathBuf::from(&candidates[0]))),
            _ => {}
        }
        let mut marked = Vec::new();
        for name in &candidates {
            let path = dir.join(name);
            let data = fs::read(&path).map_err(|source| EntryError::Io {
                context: format!("failed to read {}", path.display()),
                source,
            })?;
            if sniff::contains(&data, ENTRY_MARKER) {
                marked.push(name);
            }
        }
        if marked.len() == 1 {
            return Ok(EntryDocument(PathBuf::from(marked[0])));
        }
        Err(EntryError::Ambiguous {
            marked: marked.len(),
            candidates,
        })
    }

    /// Validates an entry name recorded by an earlier preparation pass.
    pub fn from_map(dir: &Path, name: &str) -> Result<EntryDocument, EntryError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                return Err(EntryError::InvalidName {
                    name: name.to_string(),
                })
            }
        }
        match fs::metadata(dir.join(name)) {
            Ok(meta) if meta.is_file() => Ok(EntryDocument(PathBuf::from(name))),
            _ => Err(EntryError::Missing {
                name: name.to_string(),
            }),
        }
    }

    pub fn relative(&self) -> &Path {
        &self.0
    }

    pub fn name(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }

    /// File name without extension, e.g. to locate the log file
    pub fn stem(&self) -> String {
        self.0
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Path of the entry document of the workspace at `dir`, relative to it.
pub fn resolve_entry(dir: &Path) -> Result<PathBuf, EntryError> {
    EntryDocument::resolve(dir).map(|entry| entry.0)
}

/// Names of regular files directly under `dir` that look like TeX sources,
/// sorted.
fn tex_candidates(dir: &Path) -> Result<Vec<String>, EntryError> {
    let io_err = |source| EntryError::Io {
        context: format!("failed to list {}", dir.display()),
        source,
    };
    let mut candidates = Vec::new();
    for item in fs::read_dir(dir).map_err(io_err)? {
        let item = item.map_err(io_err)?;
        let path = item.path();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            _ => continue,
        }
        let is_tex = path.extension().map_or(false, |ext| ext == "tex")
            || sniff::sniff_file(&path).map_err(io_err)? == ContentType::Tex;
        if is_tex {
            candidates.push(item.file_name().to_string_lossy().into_owned());
        }
    }
    candidates.sort();
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, data: &str) {
        fs::write(dir.join(name), data).unwrap();
    }

    #[test]
    fn single_tex_file_is_taken_as_is() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "paper.tex", "no marker in here");
        write(dir.path(), "fig.eps", "%!PS-Adobe-3.0");
        let entry = EntryDocument::resolve(dir.path()).unwrap();
        assert_eq!(entry.relative(), Path::new("paper.tex"));
        assert_eq!(entry.stem(), "paper");
    }

    #[test]
    fn marker_selects_among_several() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "intro.tex", "\\section{Intro}");
        write(dir.path(), "main.tex", "\\documentclass{article}\n\\input{intro}");
        let entry = EntryDocument::resolve(dir.path()).unwrap();
        assert_eq!(entry.name(), "main.tex");
        assert_eq!(resolve_entry(dir.path()).unwrap(), Path::new("main.tex"));
    }

    #[test]
    fn zero_or_many_markers_are_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.tex", "\\section{A}");
        write(dir.path(), "b.tex", "\\section{B}");
        match EntryDocument::resolve(dir.path()) {
            Err(EntryError::Ambiguous { marked: 0, candidates }) => {
                assert_eq!(candidates, vec!["a.tex", "b.tex"])
            }
            other => panic!("unexpected {:?}", other),
        }

        write(dir.path(), "a.tex", "\\documentclass{article}");
        write(dir.path(), "b.tex", "\\documentclass{book}");
        assert!(matches!(
            EntryDocument::resolve(dir.path()),
            Err(EntryError::Ambiguous { marked: 2, .. })
        ));
    }

    #[test]
    fn empty_directory_has_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README", "just text");
        assert!(matches!(
            EntryDocument::resolve(dir.path()),
            Err(EntryError::NoCandidates { .. })
        ));
    }

    #[test]
    fn suffixless_document_is_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "1234.5678",
            "\\documentclass{article}\n\\begin{document}x\\end{document}",
        );
        let entry = EntryDocument::resolve(dir.path()).unwrap();
        assert_eq!(entry.name(), "1234.5678");
    }

    #[test]
    fn subdirectories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("chapters.tex")).unwrap();
        write(dir.path(), "main.tex", "");
        assert_eq!(EntryDocument::resolve(dir.path()).unwrap().name(), "main.tex");
    }

    #[test]
    fn mapped_names_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.tex", "");
        assert!(EntryDocument::from_map(dir.path(), "main.tex").is_ok());
        assert!(matches!(
            EntryDocument::from_map(dir.path(), "../main.tex"),
            Err(EntryError::InvalidName { .. })
        ));
        assert!(matches!(
            EntryDocument::from_map(dir.path(), "/etc/passwd"),
            Err(EntryError::InvalidName { .. })
        ));
        assert!(matches!(
            EntryDocument::from_map(dir.path(), "other.tex"),
            Err(EntryError::Missing { .. })
        ));
    }
}
