//! Raw metadata records and the sources that produce them.
//!
//! Sources are black boxes to the ingest engine: each yields a sequence of
//! [`RawRecord`]s carrying a source-file identifier and group-qualified
//! fields.

pub mod discovery;
pub mod dump;
pub mod exiftool;
pub mod native;

use serde_json::Value;

use crate::error::{Error, Result};

pub use discovery::discover_files;
pub use dump::DumpSource;
pub use exiftool::ExifToolSource;
pub use native::NativeExifSource;

/// Key carrying the source-file identifier in extractor output.
pub const SOURCE_KEY: &str = "SourceFile";

#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    /// `None` when the key carried no group prefix.
    pub group: Option<String>,
    pub tag: String,
    pub value: Value,
}

impl RawField {
    /// Key as it appeared in the source, e.g. `EXIF:Model`.
    pub fn key(&self) -> String {
        match &self.group {
            Some(group) => format!("{}:{}", group, self.tag),
            None => self.tag.clone(),
        }
    }
}

/// One photo's metadata as produced by a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    source: Option<String>,
    fields: Vec<RawField>,
    /// Why the extractor produced nothing for this file, if it failed.
    extraction_error: Option<String>,
}

impl RawRecord {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    /// A record with no identifier; it will be dropped at normalization.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, group: &str, tag: &str, value: impl Into<Value>) -> Self {
        self.push(Some(group), tag, value.into());
        self
    }

    pub fn push(&mut self, group: Option<&str>, tag: &str, value: Value) {
        self.fields.push(RawField {
            group: group.map(str::to_string),
            tag: tag.to_string(),
            value,
        });
    }

    pub fn with_extraction_error(mut self, cause: impl Into<String>) -> Self {
        self.extraction_error = Some(cause.into());
        self
    }

    pub fn extraction_error(&self) -> Option<&str> {
        self.extraction_error.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn fields(&self) -> &[RawField] {
        &self.fields
    }

    /// Build a record from one extractor JSON object.
    ///
    /// Accepts `"Group:Tag"` keys (exiftool `-G` output), nested
    /// `{"group": {"Tag": ..}}` objects, and the `SourceFile` identifier.
    /// Keys with no group are kept ungrouped.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(Error::source_failed("metadata record is not a JSON object"));
        };

        let mut record = RawRecord::default();
        for (key, value) in object {
            if key.eq_ignore_ascii_case(SOURCE_KEY) {
                record.source = identity_string(&value);
                continue;
            }
            if let Some((group, tag)) = key.split_once(':') {
                record.push(Some(group), tag, value);
                continue;
            }
            match value {
                Value::Object(tags) => {
                    for (tag, value) in tags {
                        record.push(Some(key.as_str()), &tag, value);
                    }
                }
                other => record.push(None, &key, other),
            }
        }
        Ok(record)
    }
}

fn identity_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Parse extractor output: a JSON array of record objects.
///
/// An element that is not an object becomes an anonymous record, so it is
/// dropped and diagnosed on its own instead of failing the whole array.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<RawRecord>> {
    let entries: Vec<Value> = serde_json::from_slice(bytes)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            RawRecord::from_json(entry).unwrap_or_else(|e| {
                tracing::warn!(index, error = %e, "Unreadable metadata entry");
                RawRecord::anonymous()
            })
        })
        .collect())
}

/// Anything that yields raw metadata records.
pub trait RecordSource {
    /// Short human-readable description, used in logs.
    fn describe(&self) -> String;

    fn read_records(&mut self) -> Result<Vec<RawRecord>>;
}

impl RecordSource for Vec<RawRecord> {
    fn describe(&self) -> String {
        format!("{} in-memory records", self.len())
    }

    fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        Ok(std::mem::take(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_grouped_keys() {
        let record = RawRecord::from_json(json!({
            "SourceFile": "/photos/a.jpg",
            "EXIF:Model": "X100",
            "IPTC:By-line": "Ann"
        }))
        .unwrap();

        assert_eq!(record.source(), Some("/photos/a.jpg"));
        assert_eq!(record.fields().len(), 2);
        assert_eq!(record.fields()[0].group.as_deref(), Some("EXIF"));
        assert_eq!(record.fields()[1].key(), "IPTC:By-line");
    }

    #[test]
    fn test_from_json_nested_groups() {
        let record = RawRecord::from_json(json!({
            "sourcefile": "a.jpg",
            "cam": {"Model": "X100"},
            "loc": {"GPS-Lat": "51.5N"},
            "Orphan": 3
        }))
        .unwrap();

        assert_eq!(record.source(), Some("a.jpg"));
        let keys: Vec<String> = record.fields().iter().map(|f| f.key()).collect();
        assert_eq!(keys, vec!["cam:Model", "loc:GPS-Lat", "Orphan"]);
    }

    #[test]
    fn test_blank_identity_is_missing() {
        let record = RawRecord::from_json(json!({"SourceFile": "  ", "EXIF:Model": "X"})).unwrap();
        assert_eq!(record.source(), None);
    }

    #[test]
    fn test_parse_records_isolates_non_objects() {
        let records =
            parse_records(br#"[{"SourceFile": "a.jpg"}, "garbage", {"SourceFile": "b.jpg"}]"#)
                .unwrap();
        let sources: Vec<Option<&str>> = records.iter().map(|r| r.source()).collect();
        assert_eq!(sources, vec![Some("a.jpg"), None, Some("b.jpg")]);

        assert_eq!(parse_records(b"[]").unwrap().len(), 0);
        assert!(parse_records(br#"{"SourceFile": "a.jpg"}"#).is_err());
    }

    #[test]
    fn test_vec_source_drains() {
        let mut source = vec![RawRecord::new("a.jpg")];
        assert_eq!(source.read_records().unwrap().len(), 1);
        assert!(source.read_records().unwrap().is_empty());
    }
}
