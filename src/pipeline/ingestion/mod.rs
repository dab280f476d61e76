// Pipeline ingestion: input encoding detection and the raw record stream

pub mod reader;

pub use reader::{InputFormat, RawRecord, RecordStream};
