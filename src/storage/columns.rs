//! The flat column layout shared by the Parquet and CSV encodings.
//!
//! Rows go through `serde_json::Value` in both directions, so the column set can never
//! disagree with the serde field names of [`CanonicalRequest`].

use serde_json::{Map, Number, Value};

use crate::domain::{CanonicalRequest, KeywordFlag};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    OptText,
    Bool,
    OptBool,
    OptFloat,
    UInt,
    /// A JSON array stored as its compact text
    List,
}

impl ColumnKind {
    pub fn nullable(self) -> bool {
        matches!(self, ColumnKind::OptText | ColumnKind::OptBool | ColumnKind::OptFloat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec { name, kind }
}

const HEAD: [ColumnSpec; 14] = [
    col("request_id", ColumnKind::Text),
    col("created_at", ColumnKind::OptText),
    col("updated_at", ColumnKind::OptText),
    col("status", ColumnKind::OptText),
    col("status_notes", ColumnKind::OptText),
    col("category", ColumnKind::OptText),
    col("district", ColumnKind::OptText),
    col("latitude", ColumnKind::OptFloat),
    col("longitude", ColumnKind::OptFloat),
    col("text", ColumnKind::OptText),
    col("text_truncated", ColumnKind::Bool),
    col("desc_len", ColumnKind::UInt),
    col("photo_urls", ColumnKind::List),
    col("has_photo", ColumnKind::Bool),
];

const TAIL: [ColumnSpec; 14] = [
    col("responder_goa", ColumnKind::Bool),
    col("num_people_bin", ColumnKind::Text),
    col("size_feet_bin", ColumnKind::Text),
    col("image_paths", ColumnKind::List),
    col("image_checksums", ColumnKind::List),
    col("image_fetch_status", ColumnKind::List),
    col("tag_safety_issue", ColumnKind::OptBool),
    col("tag_drugs", ColumnKind::OptBool),
    col("tag_person_position", ColumnKind::OptText),
    col("tag_lying_face_down", ColumnKind::OptBool),
    col("tag_tents_present", ColumnKind::OptBool),
    col("tag_size_feet", ColumnKind::OptFloat),
    col("tag_num_people", ColumnKind::OptFloat),
    col("keyword_table_version", ColumnKind::Text),
];

/// Every column in output order: identity and text first, then one boolean per keyword
/// flag, then bins, image metadata and provenance tags.
pub fn columns() -> Vec<ColumnSpec> {
    let mut out = Vec::with_capacity(HEAD.len() + KeywordFlag::ALL.len() + TAIL.len());
    out.extend_from_slice(&HEAD);
    out.extend(KeywordFlag::ALL.iter().map(|f| col(f.name(), ColumnKind::Bool)));
    out.extend_from_slice(&TAIL);
    out
}

/// A single format-neutral value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn layout_error(column: &str, detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::Format(format!("column '{}': {}", column, detail))
}

/// Flatten one record into cells, in `columns()` order.
pub fn to_cells(record: &CanonicalRequest, layout: &[ColumnSpec]) -> Result<Vec<Cell>> {
    let value = serde_json::to_value(record)?;
    let Value::Object(map) = value else {
        return Err(PipelineError::Format("record did not serialize to an object".into()));
    };

    layout
        .iter()
        .map(|spec| {
            let v = map.get(spec.name).unwrap_or(&Value::Null);
            value_to_cell(spec, v)
        })
        .collect()
}

fn value_to_cell(spec: &ColumnSpec, v: &Value) -> Result<Cell> {
    let cell = match (spec.kind, v) {
        (kind, Value::Null) if kind.nullable() => Cell::Null,
        (ColumnKind::Text | ColumnKind::OptText, Value::String(s)) => Cell::Text(s.clone()),
        (ColumnKind::Bool | ColumnKind::OptBool, Value::Bool(b)) => Cell::Bool(*b),
        (ColumnKind::OptFloat, Value::Number(n)) => {
            Cell::Float(n.as_f64().ok_or_else(|| layout_error(spec.name, "not a float"))?)
        }
        (ColumnKind::UInt, Value::Number(n)) => Cell::Int(
            n.as_u64()
                .and_then(|u| i64::try_from(u).ok())
                .ok_or_else(|| layout_error(spec.name, "not an unsigned integer"))?,
        ),
        (ColumnKind::List, Value::Array(_)) => Cell::Text(serde_json::to_string(v)?),
        (kind, other) => {
            return Err(layout_error(
                spec.name,
                format!("unexpected value {} for {:?}", other, kind),
            ))
        }
    };
    Ok(cell)
}

fn cell_to_value(spec: &ColumnSpec, cell: Cell) -> Result<Value> {
    let value = match (spec.kind, cell) {
        (kind, Cell::Null) if kind.nullable() => Value::Null,
        (ColumnKind::Text | ColumnKind::OptText, Cell::Text(s)) => Value::String(s),
        (ColumnKind::Bool | ColumnKind::OptBool, Cell::Bool(b)) => Value::Bool(b),
        (ColumnKind::OptFloat, Cell::Float(f)) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| layout_error(spec.name, "non-finite float"))?,
        (ColumnKind::OptFloat, Cell::Int(i)) => Value::from(i as f64),
        (ColumnKind::UInt, Cell::Int(i)) => {
            let u = u64::try_from(i).map_err(|_| layout_error(spec.name, "negative length"))?;
            Value::from(u)
        }
        (ColumnKind::List, Cell::Text(s)) => {
            let parsed: Value = serde_json::from_str(&s)
                .map_err(|e| layout_error(spec.name, format!("list is not JSON: {}", e)))?;
            if !parsed.is_array() {
                return Err(layout_error(spec.name, "list is not a JSON array"));
            }
            parsed
        }
        (kind, other) => {
            return Err(layout_error(
                spec.name,
                format!("cell {:?} does not fit {:?}", other, kind),
            ))
        }
    };
    Ok(value)
}

/// Rebuild a record from cells in `layout` order.
pub fn from_cells(layout: &[ColumnSpec], cells: Vec<Cell>) -> Result<CanonicalRequest> {
    if cells.len() != layout.len() {
        return Err(PipelineError::Format(format!(
            "row has {} cells, layout has {} columns",
            cells.len(),
            layout.len()
        )));
    }
    let mut map = Map::with_capacity(layout.len());
    for (spec, cell) in layout.iter().zip(cells) {
        map.insert(spec.name.to_string(), cell_to_value(spec, cell)?);
    }
    Ok(serde_json::from_value(Value::Object(map))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sample_record as sample;

    #[test]
    fn layout_covers_every_serialized_field() {
        let value = serde_json::to_value(sample()).unwrap();
        let names: Vec<&str> = columns().iter().map(|c| c.name).collect();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), names.len());
        for key in obj.keys() {
            assert!(names.contains(&key.as_str()), "missing column {}", key);
        }
    }

    #[test]
    fn cells_rebuild_the_same_record() {
        let layout = columns();
        let record = sample();
        let cells = to_cells(&record, &layout).unwrap();
        assert_eq!(cells[0], Cell::Text("101".into()));
        assert_eq!(from_cells(&layout, cells).unwrap(), record);
    }

    #[test]
    fn short_rows_are_rejected() {
        let layout = columns();
        assert!(from_cells(&layout, vec![Cell::Text("1".into())]).is_err());
    }
}
