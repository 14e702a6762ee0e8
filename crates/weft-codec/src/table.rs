// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed columnar codec over CSV.
//!
//! Accepts tables whose columns each hold one scalar type. The header row
//! carries column names; per-column types travel in fragment metadata so
//! cells decode back to their original types.

use serde_json::json;
use weft_core::{Data, Metadata};

use crate::{CodecError, Serialiser};

/// Columnar codec, tagged `table`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableSerialiser;

impl TableSerialiser {
    /// A new columnar codec.
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Bool,
    Int,
    Float,
    String,
}

impl ColumnType {
    fn of(cell: &Data) -> Option<Self> {
        match cell {
            Data::Bool(_) => Some(ColumnType::Bool),
            Data::Int(_) => Some(ColumnType::Int),
            Data::Float(_) => Some(ColumnType::Float),
            Data::String(_) => Some(ColumnType::String),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::String => "string",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(ColumnType::Bool),
            "int" => Some(ColumnType::Int),
            "float" => Some(ColumnType::Float),
            "string" => Some(ColumnType::String),
            _ => None,
        }
    }

    fn render(&self, cell: &Data) -> String {
        match cell {
            Data::Bool(b) => b.to_string(),
            Data::Int(i) => i.to_string(),
            Data::Float(f) => {
                // Keep a trailing ".0" so floats survive re-parsing.
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Data::String(s) => s.clone(),
            _ => unreachable!("column types were checked during acceptance"),
        }
    }

    fn parse(&self, cell: &str) -> Result<Data, CodecError> {
        let fail = || CodecError::Decode {
            tag: "table".into(),
            reason: format!("cell '{cell}' is not a {}", self.name()),
        };
        match self {
            ColumnType::Bool => cell.parse().map(Data::Bool).map_err(|_| fail()),
            ColumnType::Int => cell.parse().map(Data::Int).map_err(|_| fail()),
            ColumnType::Float => cell.parse().map(Data::Float).map_err(|_| fail()),
            ColumnType::String => Ok(Data::String(cell.to_string())),
        }
    }
}

/// Infer per-column types; `None` means the table is not this codec's shape.
fn column_types(columns: &[String], rows: &[Vec<Data>]) -> Option<Vec<ColumnType>> {
    if columns.is_empty() || rows.is_empty() {
        return None;
    }
    let mut types: Vec<Option<ColumnType>> = vec![None; columns.len()];
    for row in rows {
        if row.len() != columns.len() {
            return None;
        }
        for (slot, cell) in types.iter_mut().zip(row) {
            let cell_type = ColumnType::of(cell)?;
            match slot {
                None => *slot = Some(cell_type),
                Some(existing) if *existing != cell_type => return None,
                Some(_) => {}
            }
        }
    }
    types.into_iter().collect()
}

impl Serialiser for TableSerialiser {
    fn tag(&self) -> &'static str {
        "table"
    }

    fn try_serialise(&self, data: &Data) -> Result<Option<(Vec<u8>, Metadata)>, CodecError> {
        let Data::Table { columns, rows } = data else {
            return Ok(None);
        };
        let Some(types) = column_types(columns, rows) else {
            return Ok(None);
        };

        let mut writer = csv::Writer::from_writer(Vec::new());
        let encode_failure = |err: csv::Error| CodecError::Encode {
            tag: "table".into(),
            reason: err.to_string(),
        };
        writer.write_record(columns).map_err(encode_failure)?;
        for row in rows {
            let record: Vec<String> = types
                .iter()
                .zip(row)
                .map(|(column_type, cell)| column_type.render(cell))
                .collect();
            writer.write_record(&record).map_err(encode_failure)?;
        }
        let content = writer.into_inner().map_err(|err| CodecError::Encode {
            tag: "table".into(),
            reason: err.to_string(),
        })?;

        let mut metadata = Metadata::new();
        metadata.insert(
            "types".into(),
            json!(types.iter().map(ColumnType::name).collect::<Vec<_>>()),
        );
        metadata.insert("rows".into(), json!(rows.len()));
        Ok(Some((content, metadata)))
    }

    fn deserialise(&self, content: &[u8], metadata: &Metadata) -> Result<Data, CodecError> {
        let types = metadata
            .get("types")
            .and_then(|types| types.as_array())
            .ok_or_else(|| CodecError::Decode {
                tag: "table".into(),
                reason: "missing column types".into(),
            })?
            .iter()
            .map(|name| {
                name.as_str()
                    .and_then(ColumnType::from_name)
                    .ok_or_else(|| CodecError::Decode {
                        tag: "table".into(),
                        reason: format!("unknown column type {name}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut reader = csv::Reader::from_reader(content);
        let decode_failure = |err: csv::Error| CodecError::Decode {
            tag: "table".into(),
            reason: err.to_string(),
        };
        let columns: Vec<String> = reader
            .headers()
            .map_err(decode_failure)?
            .iter()
            .map(str::to_string)
            .collect();
        if columns.len() != types.len() {
            return Err(CodecError::Decode {
                tag: "table".into(),
                reason: "column/type count mismatch".into(),
            });
        }
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(decode_failure)?;
            let row = types
                .iter()
                .zip(record.iter())
                .map(|(column_type, cell)| column_type.parse(cell))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(row);
        }
        Ok(Data::Table { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> Data {
        Data::Table {
            columns: vec!["id".into(), "name".into(), "score".into()],
            rows: vec![
                vec![Data::Int(1), Data::string("ada"), Data::Float(9.5)],
                vec![Data::Int(2), Data::string("grace"), Data::Float(10.0)],
            ],
        }
    }

    #[test]
    fn table_round_trips() {
        let codec = TableSerialiser::new();
        let table = people();
        let (content, metadata) = codec.try_serialise(&table).unwrap().unwrap();
        assert_eq!(codec.deserialise(&content, &metadata).unwrap(), table);
    }

    #[test]
    fn whole_floats_survive() {
        let codec = TableSerialiser::new();
        let table = Data::Table {
            columns: vec!["v".into()],
            rows: vec![vec![Data::Float(2.0)]],
        };
        let (content, metadata) = codec.try_serialise(&table).unwrap().unwrap();
        assert_eq!(codec.deserialise(&content, &metadata).unwrap(), table);
    }

    #[test]
    fn mixed_columns_are_rejected() {
        let codec = TableSerialiser::new();
        let mixed = Data::Table {
            columns: vec!["v".into()],
            rows: vec![vec![Data::Int(1)], vec![Data::string("two")]],
        };
        assert!(codec.try_serialise(&mixed).unwrap().is_none());

        let nested = Data::Table {
            columns: vec!["v".into()],
            rows: vec![vec![Data::List(vec![])]],
        };
        assert!(codec.try_serialise(&nested).unwrap().is_none());
    }

    #[test]
    fn non_tables_are_rejected() {
        let codec = TableSerialiser::new();
        assert!(codec.try_serialise(&Data::Int(3)).unwrap().is_none());
    }
}
