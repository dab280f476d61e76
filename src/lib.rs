pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod storage;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
