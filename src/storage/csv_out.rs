use std::fs::File;
use std::path::Path;

use super::atomic::write_atomic;
use super::columns::{columns, from_cells, to_cells, Cell, ColumnKind, ColumnSpec};
use super::DatasetFormat;
use crate::domain::CanonicalRequest;
use crate::error::{PipelineError, Result};

/// Flat tabular encoding: header row, booleans as 0/1, nulls as empty cells.
pub struct CsvFormat;

fn render(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Bool(true) => "1".to_string(),
        Cell::Bool(false) => "0".to_string(),
        Cell::Int(i) => i.to_string(),
        Cell::Float(f) => f.to_string(),
        Cell::Text(s) => s.clone(),
    }
}

fn parse(spec: &ColumnSpec, raw: &str) -> Result<Cell> {
    let bad = |what: &str| {
        PipelineError::Format(format!(
            "column '{}': '{}' is not {}",
            spec.name, raw, what
        ))
    };
    if raw.is_empty() && spec.kind.nullable() {
        return Ok(Cell::Null);
    }
    let cell = match spec.kind {
        ColumnKind::Text | ColumnKind::OptText | ColumnKind::List => Cell::Text(raw.to_string()),
        ColumnKind::Bool | ColumnKind::OptBool => match raw {
            "1" | "true" => Cell::Bool(true),
            "0" | "false" => Cell::Bool(false),
            _ => return Err(bad("a 0/1 boolean")),
        },
        ColumnKind::OptFloat => Cell::Float(raw.parse().map_err(|_| bad("a number"))?),
        ColumnKind::UInt => Cell::Int(raw.parse().map_err(|_| bad("an integer"))?),
    };
    Ok(cell)
}

impl DatasetFormat for CsvFormat {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn write(&self, records: &[CanonicalRequest], path: &Path) -> Result<()> {
        let layout = columns();
        write_atomic(path, |file| {
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(layout.iter().map(|c| c.name))?;
            for record in records {
                let cells = to_cells(record, &layout)?;
                writer.write_record(cells.iter().map(render))?;
            }
            writer.flush()?;
            Ok(())
        })
    }

    fn read(&self, path: &Path) -> Result<Vec<CanonicalRequest>> {
        let layout = columns();
        let mut reader = csv::Reader::from_reader(File::open(path)?);

        let headers = reader.headers()?.clone();
        let order = layout
            .iter()
            .map(|spec| {
                headers.iter().position(|h| h == spec.name).ok_or_else(|| {
                    PipelineError::Format(format!(
                        "{} is missing column '{}'",
                        path.display(),
                        spec.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let cells = layout
                .iter()
                .zip(&order)
                .map(|(spec, &idx)| parse(spec, row.get(idx).unwrap_or("")))
                .collect::<Result<Vec<_>>>()?;
            records.push(from_cells(&layout, cells)?);
        }
        Ok(records)
    }
}
