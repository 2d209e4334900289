//! Types making up a report stream.
//!
//! A report is a newline-delimited JSON file. The first line is always
//! [`RunMetadata`], every following line is a [`ReportRecord`].

pub mod meta;
pub mod record;

pub use meta::{EngineInfo, RunMetadata, REPORT_FORMAT_VERSION};
pub use record::{EngineReport, ReportRecord, TIMEOUT_STATUS};

use serde::{Deserialize, Serialize};

/// Any line of a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportLine {
    Meta(RunMetadata),
    Record(ReportRecord),
}

impl ReportLine {
    /// Parses a single report line.
    pub fn parse(line: &str) -> serde_json::Result<ReportLine> {
        serde_json::from_str(line)
    }
}
