//! In-process EXIF extraction for hosts without exiftool.
//!
//! Only the `EXIF` group is produced; IPTC and XMP columns stay empty.

use serde_json::{Number, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::config::ExtractorConfig;
use crate::error::{Error, Result};

use super::{discover_files, RawRecord, RecordSource};

pub const NATIVE_GROUP: &str = "EXIF";

pub struct NativeExifSource {
    root: PathBuf,
    exclude_extensions: Vec<String>,
}

impl NativeExifSource {
    pub fn new(config: &ExtractorConfig, root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            exclude_extensions: config.exclude_extensions.clone(),
        }
    }
}

impl RecordSource for NativeExifSource {
    fn describe(&self) -> String {
        format!("built-in EXIF reader over {}", self.root.display())
    }

    fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        let files = discover_files(&self.root, &self.exclude_extensions)
            .map_err(|e| Error::source_failed(format!("cannot list {}: {}", self.root.display(), e)))?;
        tracing::info!(root = %self.root.display(), files = files.len(), "Reading EXIF");

        Ok(files.iter().map(|path| read_file(path)).collect())
    }
}

/// Read one file; files without readable EXIF yield an identifier-only record.
pub fn read_file(path: &Path) -> RawRecord {
    let mut record = RawRecord::new(path.to_string_lossy());

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Cannot open file");
            return record.with_extraction_error(format!("cannot open file: {}", e));
        }
    };

    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "No EXIF data");
            return record;
        }
    };

    for field in exif.fields().filter(|f| f.ifd_num == exif::In::PRIMARY) {
        let tag = field.tag.to_string();
        record.push(Some(NATIVE_GROUP), &tag, field_value(field));
    }
    record
}

fn field_value(field: &exif::Field) -> Value {
    match &field.value {
        exif::Value::Byte(v) if v.len() == 1 => Value::from(v[0]),
        exif::Value::Short(v) if v.len() == 1 => Value::from(v[0]),
        exif::Value::Long(v) if v.len() == 1 => Value::from(v[0]),
        exif::Value::SShort(v) if v.len() == 1 => Value::from(v[0]),
        exif::Value::SLong(v) if v.len() == 1 => Value::from(v[0]),
        exif::Value::Rational(v) if v.len() == 1 && v[0].denom != 0 => {
            rational(v[0].num as f64 / v[0].denom as f64)
        }
        exif::Value::SRational(v) if v.len() == 1 && v[0].denom != 0 => {
            rational(v[0].num as f64 / v[0].denom as f64)
        }
        _ => Value::String(
            field
                .display_value()
                .to_string()
                .trim_matches('"')
                .to_string(),
        ),
    }
}

fn rational(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_without_exif_keeps_identifier() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank.jpg");
        std::fs::write(&path, b"not really a jpeg").unwrap();

        let record = read_file(&path);
        assert_eq!(record.source(), Some(path.to_string_lossy().as_ref()));
        assert!(record.fields().is_empty());
        assert_eq!(record.extraction_error(), None);
    }

    #[test]
    fn test_unreadable_file_carries_cause() {
        let dir = tempdir().unwrap();
        let record = read_file(&dir.path().join("vanished.jpg"));
        assert!(record.source().is_some());
        assert!(record.extraction_error().unwrap().starts_with("cannot open file"));
    }

    #[test]
    fn test_read_records_skips_excluded() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut source = NativeExifSource::new(&ExtractorConfig::default(), dir.path());
        let records = source.read_records().unwrap();
        assert_eq!(records.len(), 1);
    }
}
