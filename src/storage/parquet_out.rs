use parquet::basic::{Compression, LogicalType, Repetition, Type as PhysicalType};
use parquet::data_type::{BoolType, ByteArray, ByteArrayType, DoubleType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::record::Field;
use parquet::schema::types::{Type, TypePtr};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use super::atomic::write_atomic;
use super::columns::{columns, from_cells, to_cells, Cell, ColumnKind, ColumnSpec};
use super::DatasetFormat;
use crate::domain::CanonicalRequest;
use crate::error::{PipelineError, Result};

/// Columnar encoding; one row group per write.
pub struct ParquetFormat;

fn build_schema(layout: &[ColumnSpec]) -> Result<TypePtr> {
    let mut fields = Vec::with_capacity(layout.len());
    for spec in layout {
        let repetition = if spec.kind.nullable() {
            Repetition::OPTIONAL
        } else {
            Repetition::REQUIRED
        };
        let builder = match spec.kind {
            ColumnKind::Text | ColumnKind::OptText | ColumnKind::List => {
                Type::primitive_type_builder(spec.name, PhysicalType::BYTE_ARRAY)
                    .with_logical_type(Some(LogicalType::String))
            }
            ColumnKind::Bool | ColumnKind::OptBool => {
                Type::primitive_type_builder(spec.name, PhysicalType::BOOLEAN)
            }
            ColumnKind::OptFloat => Type::primitive_type_builder(spec.name, PhysicalType::DOUBLE),
            ColumnKind::UInt => Type::primitive_type_builder(spec.name, PhysicalType::INT64),
        };
        fields.push(Arc::new(builder.with_repetition(repetition).build()?));
    }
    Ok(Arc::new(
        Type::group_type_builder("canonical_request")
            .with_fields(fields)
            .build()?,
    ))
}

/// Values for one column plus definition levels when the column is nullable.
fn split_column<T>(
    spec: &ColumnSpec,
    cells: impl Iterator<Item = Cell>,
    extract: impl Fn(Cell) -> Option<T>,
) -> Result<(Vec<T>, Option<Vec<i16>>)> {
    let mut values = Vec::new();
    let mut defs = Vec::new();
    for cell in cells {
        match cell {
            Cell::Null if spec.kind.nullable() => defs.push(0),
            other => {
                let v = extract(other).ok_or_else(|| {
                    PipelineError::Format(format!("column '{}' holds a mistyped cell", spec.name))
                })?;
                values.push(v);
                defs.push(1);
            }
        }
    }
    Ok((values, spec.kind.nullable().then_some(defs)))
}

fn write_rows(file: &mut File, layout: &[ColumnSpec], rows: Vec<Vec<Cell>>) -> Result<()> {
    let schema = build_schema(layout)?;
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build(),
    );
    let mut writer = SerializedFileWriter::new(file, schema, props)?;

    if !rows.is_empty() {
        // transpose once so each column is written in a single batch
        let mut by_column: Vec<Vec<Cell>> = (0..layout.len())
            .map(|_| Vec::with_capacity(rows.len()))
            .collect();
        for row in rows {
            for (idx, cell) in row.into_iter().enumerate() {
                by_column[idx].push(cell);
            }
        }

        let mut rg = writer.next_row_group()?;
        for (spec, cells) in layout.iter().zip(by_column) {
            let mut col = rg.next_column()?.ok_or_else(|| {
                PipelineError::Format(format!("schema has no column for '{}'", spec.name))
            })?;
            let cells = cells.into_iter();
            match spec.kind {
                ColumnKind::Text | ColumnKind::OptText | ColumnKind::List => {
                    let (vals, defs) = split_column(spec, cells, |c| match c {
                        Cell::Text(s) => Some(ByteArray::from(s.into_bytes())),
                        _ => None,
                    })?;
                    col.typed::<ByteArrayType>()
                        .write_batch(&vals, defs.as_deref(), None)?;
                }
                ColumnKind::Bool | ColumnKind::OptBool => {
                    let (vals, defs) = split_column(spec, cells, |c| match c {
                        Cell::Bool(b) => Some(b),
                        _ => None,
                    })?;
                    col.typed::<BoolType>().write_batch(&vals, defs.as_deref(), None)?;
                }
                ColumnKind::OptFloat => {
                    let (vals, defs) = split_column(spec, cells, |c| match c {
                        Cell::Float(f) => Some(f),
                        _ => None,
                    })?;
                    col.typed::<DoubleType>().write_batch(&vals, defs.as_deref(), None)?;
                }
                ColumnKind::UInt => {
                    let (vals, defs) = split_column(spec, cells, |c| match c {
                        Cell::Int(i) => Some(i),
                        _ => None,
                    })?;
                    col.typed::<Int64Type>().write_batch(&vals, defs.as_deref(), None)?;
                }
            }
            col.close()?;
        }
        rg.close()?;
    }

    writer.close()?;
    Ok(())
}

fn field_to_cell(field: &Field) -> Result<Cell> {
    let cell = match field {
        Field::Null => Cell::Null,
        Field::Bool(b) => Cell::Bool(*b),
        Field::Int(i) => Cell::Int(i64::from(*i)),
        Field::Long(i) => Cell::Int(*i),
        Field::Double(f) => Cell::Float(*f),
        Field::Float(f) => Cell::Float(f64::from(*f)),
        Field::Str(s) => Cell::Text(s.clone()),
        other => {
            return Err(PipelineError::Format(format!(
                "unsupported parquet value {}",
                other
            )))
        }
    };
    Ok(cell)
}

impl DatasetFormat for ParquetFormat {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn write(&self, records: &[CanonicalRequest], path: &Path) -> Result<()> {
        let layout = columns();
        let rows = records
            .iter()
            .map(|r| to_cells(r, &layout))
            .collect::<Result<Vec<_>>>()?;
        write_atomic(path, |file| write_rows(file, &layout, rows))
    }

    fn read(&self, path: &Path) -> Result<Vec<CanonicalRequest>> {
        let layout = columns();
        let reader = SerializedFileReader::new(File::open(path)?)?;
        let mut records = Vec::new();
        for row in reader.get_row_iter(None)? {
            let row = row?;
            let mut by_name: Vec<(String, Cell)> = Vec::with_capacity(layout.len());
            for (name, field) in row.get_column_iter() {
                by_name.push((name.clone(), field_to_cell(field)?));
            }
            let mut cells = Vec::with_capacity(layout.len());
            for spec in &layout {
                let idx = by_name
                    .iter()
                    .position(|(name, _)| name == spec.name)
                    .ok_or_else(|| {
                        PipelineError::Format(format!(
                            "{} is missing column '{}'",
                            path.display(),
                            spec.name
                        ))
                    })?;
                cells.push(std::mem::replace(&mut by_name[idx].1, Cell::Null));
            }
            records.push(from_cells(&layout, cells)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sample_record;

    #[test]
    fn round_trips_nulls_lists_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let mut bare = sample_record();
        bare.request_id = "102".into();
        bare.created_at = None;
        bare.latitude = None;
        bare.text = None;
        bare.photo_urls.clear();
        bare.has_photo = false;
        bare.images = Default::default();
        bare.provenance = Default::default();
        let records = vec![sample_record(), bare];

        ParquetFormat.write(&records, &path).unwrap();
        assert_eq!(ParquetFormat.read(&path).unwrap(), records);
    }

    #[test]
    fn empty_dataset_is_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        ParquetFormat.write(&[], &path).unwrap();
        assert!(ParquetFormat.read(&path).unwrap().is_empty());
    }
}
