//! Classification of engine logs by known failure signatures.

use std::{
    collections::{BTreeSet, HashMap},
    fs, io,
    path::Path,
    sync::OnceLock,
};

/// Reported instead of any other tag when the engine left no log behind
pub const NO_LOG_FILE: &str = "no-log-file";

/// Tag name and the log text identifying it
pub const BUILTIN_SIGNATURES: &[(&str, &str)] = &[
    (
        "no-font-for-pdf",
        "Cannot proceed without .vf or \"physical\" font for PDF output...",
    ),
    ("latex-file-not-found", "LaTeX Error: File"),
    ("undefined-control-sequence", "! Undefined control sequence."),
    ("not-latex", "LaTeX Error: Missing \\begin{document}"),
    (
        "uses-inputenc",
        "Package inputenc Error: inputenc is not designed for xetex or luatex.",
    ),
    ("latex-error", "LaTeX Error"),
    ("bib-failed", "\\end{thebibliography}"),
];

/// Signatures plus, for each tag, the tags whose signatures its own
/// signature contains. A match of the former always implies a match of
/// the latter, which is then not worth reporting.
#[derive(Debug, Clone)]
pub struct TagTable {
    signatures: Vec<(String, String)>,
    implied: HashMap<String, BTreeSet<String>>,
}

impl TagTable {
    pub fn new(signatures: &[(&str, &str)]) -> TagTable {
        let signatures: Vec<(String, String)> = signatures
            .iter()
            .map(|(tag, sig)| (tag.to_string(), sig.to_string()))
            .collect();
        let mut implied = HashMap::new();
        for (tag, sig) in &signatures {
            let implies: BTreeSet<String> = signatures
                .iter()
                .filter(|(other, other_sig)| {
                    other != tag && other_sig != sig && sig.contains(other_sig.as_str())
                })
                .map(|(other, _)| other.clone())
                .collect();
            implied.insert(tag.clone(), implies);
        }
        TagTable {
            signatures,
            implied,
        }
    }

    /// Table over [`BUILTIN_SIGNATURES`], built on first use
    pub fn builtin() -> &'static TagTable {
        static TABLE: OnceLock<TagTable> = OnceLock::new();
        TABLE.get_or_init(|| TagTable::new(BUILTIN_SIGNATURES))
    }

    /// Tags made redundant by `tag`
    pub fn implied_by(&self, tag: &str) -> impl Iterator<Item = &str> {
        self.implied
            .get(tag)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Minimal sorted set of tags matching `text`
    pub fn classify_text(&self, text: &str) -> Vec<String> {
        let matched: BTreeSet<&str> = self
            .signatures
            .iter()
            .filter(|(_, sig)| text.contains(sig.as_str()))
            .map(|(tag, _)| tag.as_str())
            .collect();
        let redundant: BTreeSet<&str> = matched
            .iter()
            .flat_map(|tag| self.implied_by(tag))
            .collect();
        matched
            .difference(&redundant)
            .map(|tag| tag.to_string())
            .collect()
    }

    /// Classifies the log at `log`. A missing log yields [`NO_LOG_FILE`].
    pub fn classify(&self, log: &Path) -> io::Result<Vec<String>> {
        let data = match fs::read(log) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(vec![NO_LOG_FILE.to_string()])
            }
            Err(err) => return Err(err),
        };
        Ok(self.classify_text(&String::from_utf8_lossy(&data)))
    }
}
