use serde::{Deserialize, Serialize};

/// Bumped whenever the shape of report lines changes.
pub const REPORT_FORMAT_VERSION: u32 = 1;

/// Leading line of every report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run name, also the report file stem
    pub name: String,
    /// Branch of the engine sources under test
    pub branch: Option<String>,
    /// Commit of the engine sources under test
    pub commit: Option<String>,
    /// Optional link to CI job or similar
    pub link: Option<String>,
    pub version: u32,
    /// Commit (or run) timestamp, as provided by the caller
    pub timestamp: Option<String>,
    /// Corpus name
    pub dataset: String,
    /// Engines evaluated in this run, in invocation order
    pub engines: Vec<EngineInfo>,
    /// Always true. Lets readers tell this line apart from records.
    pub meta: bool,
}

impl RunMetadata {
    pub fn new(name: String, dataset: String, engines: Vec<EngineInfo>) -> Self {
        RunMetadata {
            name,
            branch: None,
            commit: None,
            link: None,
            version: REPORT_FORMAT_VERSION,
            timestamp: None,
            dataset,
            engines,
            meta: true,
        }
    }
}

/// How an engine was invoked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineInfo {
    pub name: String,
    pub title: String,
    /// Main command line, before substitution of per-sample values
    pub argv: Vec<String>,
}
