use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status recorded when an engine exceeded its wall-clock budget.
pub const TIMEOUT_STATUS: i32 = -99999;

/// Result of evaluating one sample.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportRecord {
    /// Sample identifier
    pub sample: String,
    /// Per-engine outcome, keyed by engine name
    pub engines: BTreeMap<String, EngineReport>,
    /// Set if the sample could not be evaluated (broken archive,
    /// no entry document, ...). Engines evaluated before the failure
    /// are still reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReportRecord {
    pub fn new(sample: impl Into<String>) -> Self {
        ReportRecord {
            sample: sample.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineReport {
    /// Exit code, `-signal` if killed by a signal, or [`TIMEOUT_STATUS`]
    pub statuscode: i32,
    /// Wall time of the main invocation
    pub seconds: f64,
    /// Produced file name -> stored object name.
    /// `None` if the engine is not configured to capture outputs.
    pub results: Option<BTreeMap<String, String>>,
    /// Failure tags found in the log.
    /// `None` if the engine is not configured to inspect logs.
    pub tags: Option<Vec<String>>,
}

impl EngineReport {
    pub fn timed_out(&self) -> bool {
        self.statuscode == TIMEOUT_STATUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReportLine, RunMetadata};

    #[test]
    fn error_field_is_omitted_when_unset() {
        let rec = ReportRecord::new("1234.5678");
        let line = serde_json::to_string(&rec).unwrap();
        assert_eq!(line, r#"{"sample":"1234.5678","engines":{}}"#);
    }

    #[test]
    fn lines_are_told_apart() {
        let meta = RunMetadata::new("nightly".to_string(), "arxiv".to_string(), vec![]);
        let meta = serde_json::to_string(&meta).unwrap();
        assert!(matches!(ReportLine::parse(&meta).unwrap(), ReportLine::Meta(m) if m.meta));

        let mut rec = ReportRecord::new("s");
        rec.engines.insert(
            "tectonic".to_string(),
            EngineReport {
                statuscode: TIMEOUT_STATUS,
                seconds: 600.0,
                results: Some(BTreeMap::new()),
                tags: None,
            },
        );
        let rec = serde_json::to_string(&rec).unwrap();
        match ReportLine::parse(&rec).unwrap() {
            ReportLine::Record(r) => assert!(r.engines["tectonic"].timed_out()),
            ReportLine::Meta(_) => panic!("record parsed as metadata"),
        }
    }
}
