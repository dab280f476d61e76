use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::atomic::write_atomic;
use super::DatasetFormat;
use crate::domain::CanonicalRequest;
use crate::error::{PipelineError, Result};

/// One JSON object per line, in record order.
pub struct JsonlFormat;

impl DatasetFormat for JsonlFormat {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn write(&self, records: &[CanonicalRequest], path: &Path) -> Result<()> {
        write_atomic(path, |file| {
            let mut out = BufWriter::new(file);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            Ok(())
        })
    }

    fn read(&self, path: &Path) -> Result<Vec<CanonicalRequest>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                PipelineError::Format(format!("{} line {}: {}", path.display(), idx + 1, e))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
