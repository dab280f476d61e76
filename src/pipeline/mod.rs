// Data processing pipeline: ingestion, processing, and stage orchestration

pub mod ingestion;
pub mod orchestrator;
pub mod processing;

pub use orchestrator::{Pipeline, RunSummary};
