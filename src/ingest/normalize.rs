//! Flattening of group-qualified raw records into schema-ordered rows.

use rusqlite::types::{ToSql, ToSqlOutput};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::config::UnmappedKeyPolicy;
use crate::source::{RawField, RawRecord};
use crate::taxonomy::{fold_key, sanitize_name, ColumnSpec, Taxonomy, ValueKind};

use super::diagnostics::{Diagnostic, DiagnosticKind};

/// A single bound value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl CellValue {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Text(String::new()),
            Value::Bool(b) => CellValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Integer(i),
                None => CellValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => CellValue::Text(s.clone()),
            Value::Array(items) => CellValue::Text(join_list(items)),
            Value::Object(_) => CellValue::Text(value.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(s) => f.write_str(s),
            CellValue::Integer(i) => write!(f, "{}", i),
            CellValue::Real(r) => write!(f, "{}", r),
        }
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            CellValue::Text(s) => s.to_sql(),
            CellValue::Integer(i) => i.to_sql(),
            CellValue::Real(r) => r.to_sql(),
        }
    }
}

/// List values (keywords, subjects) become one comma-separated string.
fn join_list(items: &[Value]) -> String {
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Trim, then replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_value(value: &str) -> String {
    sanitize_name(value.trim())
}

/// One value per schema column, in schema order; index 0 is the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    values: Vec<CellValue>,
}

impl NormalizedRecord {
    pub fn identity(&self) -> &str {
        self.values
            .first()
            .and_then(CellValue::as_text)
            .unwrap_or_default()
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn value(&self, index: usize) -> Option<&CellValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of normalizing one raw record.
#[derive(Debug)]
pub enum Normalized {
    Ready {
        record: NormalizedRecord,
        diagnostics: Vec<Diagnostic>,
    },
    /// The record cannot be stored; diagnostics say why.
    Dropped { diagnostics: Vec<Diagnostic> },
}

impl Normalized {
    pub fn into_parts(self) -> (Option<NormalizedRecord>, Vec<Diagnostic>) {
        match self {
            Normalized::Ready { record, diagnostics } => (Some(record), diagnostics),
            Normalized::Dropped { diagnostics } => (None, diagnostics),
        }
    }
}

pub struct RecordNormalizer {
    columns: Vec<ColumnSpec>,
    /// (folded group, exact tag) -> column index
    exact: HashMap<(String, String), usize>,
    /// (folded group, folded tag) -> column index
    folded: HashMap<(String, String), usize>,
    unmapped: UnmappedKeyPolicy,
}

impl RecordNormalizer {
    pub fn new(taxonomy: &Taxonomy, unmapped: UnmappedKeyPolicy) -> Self {
        let columns = taxonomy.columns();
        let mut exact = HashMap::new();
        let mut folded = HashMap::new();
        for (index, column) in columns.iter().enumerate() {
            if let (Some(group), Some(tag)) = (&column.group, &column.tag) {
                let group = fold_key(group);
                exact.insert((group.clone(), tag.clone()), index);
                folded.entry((group, fold_key(tag))).or_insert(index);
            }
        }
        Self {
            columns,
            exact,
            folded,
            unmapped,
        }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn resolve(&self, field: &RawField) -> Option<usize> {
        let group = fold_key(field.group.as_deref()?);
        self.exact
            .get(&(group.clone(), field.tag.clone()))
            .or_else(|| self.folded.get(&(group, fold_key(&field.tag))))
            .copied()
    }

    pub fn normalize(&self, raw: &RawRecord) -> Normalized {
        let mut diagnostics = Vec::new();

        let Some(identity) = raw.source().map(str::trim).filter(|s| !s.is_empty()) else {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::MissingIdentity,
                None,
                format!("record with {} fields has no source-file identifier", raw.fields().len()),
            ));
            return Normalized::Dropped { diagnostics };
        };

        if let Some(cause) = raw.extraction_error() {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::ExtractionFailed,
                Some(identity),
                cause,
            ));
        }

        let mut slots: Vec<Option<&Value>> = vec![None; self.columns.len()];
        let mut unmapped: Vec<&RawField> = Vec::new();
        for field in raw.fields() {
            match self.resolve(field) {
                Some(index) if slots[index].is_none() => slots[index] = Some(&field.value),
                Some(index) => {
                    if self.unmapped != UnmappedKeyPolicy::Drop {
                        diagnostics.push(
                            Diagnostic::new(
                                DiagnosticKind::UnmappedKey,
                                Some(identity),
                                format!(
                                    "duplicate key {} for column {}; first value kept",
                                    field.key(),
                                    self.columns[index].name
                                ),
                            )
                            .with_column(&self.columns[index].name)
                            .with_value(CellValue::from_json(&field.value).to_string()),
                        );
                    }
                }
                None => unmapped.push(field),
            }
        }

        match self.unmapped {
            UnmappedKeyPolicy::Drop => {}
            UnmappedKeyPolicy::Diagnose | UnmappedKeyPolicy::Reject => {
                for field in &unmapped {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticKind::UnmappedKey,
                            Some(identity),
                            format!("key {} matches no taxonomy tag; dropped", field.key()),
                        )
                        .with_value(CellValue::from_json(&field.value).to_string()),
                    );
                }
            }
        }
        if self.unmapped == UnmappedKeyPolicy::Reject && !unmapped.is_empty() {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::RecordExcluded,
                Some(identity),
                format!("{} unmapped keys and unmapped keys are rejected", unmapped.len()),
            ));
            return Normalized::Dropped { diagnostics };
        }

        let mut values = Vec::with_capacity(self.columns.len());
        values.push(CellValue::Text(identity.to_string()));
        for (column, slot) in self.columns.iter().zip(&slots).skip(1) {
            let value = match slot {
                Some(raw_value) => CellValue::from_json(raw_value),
                None => CellValue::Text(String::new()),
            };
            let value = match (column.kind, value) {
                (ValueKind::Text, CellValue::Text(original)) => {
                    let clean = sanitize_value(&original);
                    if clean != original {
                        diagnostics.push(
                            Diagnostic::new(
                                DiagnosticKind::ValueSanitized,
                                Some(identity),
                                format!("value rewritten to {:?}", clean),
                            )
                            .with_column(&column.name)
                            .with_value(original),
                        );
                    }
                    CellValue::Text(clean)
                }
                (_, value) => value,
            };
            values.push(value);
        }

        Normalized::Ready {
            record: NormalizedRecord { values },
            diagnostics,
        }
    }
}
