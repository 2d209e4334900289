//! Processor is the part of the evaluator that deals with running engines
//! on samples. It doesn't care where the corpus and engines come from.

pub mod capture;
pub mod evaluate;
pub mod pipeline;
pub mod report_log;
pub mod tags;

pub use capture::{CaptureStore, ExtensionPolicy};
pub use evaluate::{Evaluator, Job};
pub use pipeline::{Pipeline, PipelineConfig, RunSummary};
pub use report_log::ReportLog;
pub use tags::TagTable;
