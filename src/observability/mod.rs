// Observability: the metric catalog. Logging setup lives in crate::logging.

pub mod metrics;

pub use metrics::describe_all;
