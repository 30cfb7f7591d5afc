//! Metadata extraction through the external `exiftool` binary.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::ExtractorConfig;
use crate::error::{Error, Result};
use crate::taxonomy::Taxonomy;

use super::{discover_files, parse_records, RawRecord, RecordSource};

pub struct ExifToolSource {
    exe: PathBuf,
    root: PathBuf,
    exclude_extensions: Vec<String>,
    chunk_size: usize,
    tag_args: Vec<String>,
}

impl ExifToolSource {
    pub fn new(config: &ExtractorConfig, root: &Path, taxonomy: &Taxonomy) -> Self {
        Self {
            exe: config.exiftool_path.clone(),
            root: root.to_path_buf(),
            exclude_extensions: config.exclude_extensions.clone(),
            chunk_size: config.chunk_size.max(1),
            tag_args: tag_arguments(taxonomy),
        }
    }

    /// Arguments for one invocation over `files`.
    ///
    /// `-G` prefixes every key with its family-0 group (`EXIF:Model`), `-m`
    /// keeps minor warnings from failing a file.
    pub fn command_args(&self, files: &[PathBuf]) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-j", "-G", "-m", "-charset", "filename=utf8"]
            .iter()
            .map(OsString::from)
            .collect();
        args.extend(self.tag_args.iter().map(OsString::from));
        args.extend(files.iter().map(|f| f.as_os_str().to_os_string()));
        args
    }

    fn run_chunk(&self, files: &[PathBuf]) -> Result<Vec<RawRecord>> {
        let output = Command::new(&self.exe)
            .args(self.command_args(files))
            .output()
            .map_err(|e| {
                Error::source_failed(format!(
                    "failed to execute {}: {}",
                    self.exe.display(),
                    e
                ))
            })?;

        // exiftool exits non-zero when any file in the chunk failed but still
        // prints records for the rest.
        let stderr = String::from_utf8_lossy(&output.stderr);
        let records = if output.stdout.iter().all(|b| b.is_ascii_whitespace()) {
            tracing::warn!(
                files = files.len(),
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "exiftool produced no records for chunk"
            );
            Vec::new()
        } else {
            parse_records(&output.stdout)?
        };

        Ok(reconcile(files, records, &stderr))
    }
}

impl RecordSource for ExifToolSource {
    fn describe(&self) -> String {
        format!("exiftool over {}", self.root.display())
    }

    fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        let files = discover_files(&self.root, &self.exclude_extensions)
            .map_err(|e| Error::source_failed(format!("cannot list {}: {}", self.root.display(), e)))?;
        tracing::info!(root = %self.root.display(), files = files.len(), "Running exiftool");

        let mut records = Vec::with_capacity(files.len());
        for chunk in files.chunks(self.chunk_size) {
            records.extend(self.run_chunk(chunk)?);
        }
        Ok(records)
    }
}

/// Append an identifier-only record for every file in `files` that exiftool
/// did not report, carrying its stderr line for that file when there is one.
fn reconcile(files: &[PathBuf], mut records: Vec<RawRecord>, stderr: &str) -> Vec<RawRecord> {
    let reported: HashSet<String> = records
        .iter()
        .filter_map(RawRecord::source)
        .map(path_key)
        .collect();

    for file in files {
        let name = file.to_string_lossy().into_owned();
        if reported.contains(&path_key(&name)) {
            continue;
        }
        let cause = stderr
            .lines()
            .find(|line| line.contains(name.as_str()))
            .map(|line| line.trim().to_string())
            .unwrap_or_else(|| "file missing from exiftool output".to_string());
        tracing::warn!(file = %name, cause = %cause, "No metadata extracted");
        records.push(RawRecord::new(name).with_extraction_error(cause));
    }
    records
}

/// exiftool reports paths with forward slashes on every platform.
fn path_key(path: &str) -> String {
    path.replace('\\', "/")
}

/// `-group:Tag` selectors for every taxonomy tag.
pub fn tag_arguments(taxonomy: &Taxonomy) -> Vec<String> {
    taxonomy
        .tags()
        .map(|tag| format!("-{}:{}", tag.group, tag.tag))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::DEFAULT_IDENTITY_COLUMN;

    fn taxonomy() -> Taxonomy {
        Taxonomy::parse(
            r#"{"metadata_tags": {
                "exif": {"Model": ["TEXT"]},
                "iptc": {"By-line": ["TEXT"]}
            }}"#,
            DEFAULT_IDENTITY_COLUMN,
        )
        .unwrap()
    }

    #[test]
    fn test_tag_arguments() {
        assert_eq!(tag_arguments(&taxonomy()), vec!["-exif:Model", "-iptc:By-line"]);
    }

    #[test]
    fn test_command_args_end_with_files() {
        let source = ExifToolSource::new(&ExtractorConfig::default(), Path::new("/photos"), &taxonomy());
        let args = source.command_args(&[PathBuf::from("/photos/a.jpg")]);

        assert_eq!(args[0], OsString::from("-j"));
        assert!(args.contains(&OsString::from("-G")));
        assert!(args.contains(&OsString::from("-exif:Model")));
        assert_eq!(args.last().unwrap(), &OsString::from("/photos/a.jpg"));
    }

    #[test]
    fn test_unreported_files_become_failed_records() {
        let files = vec![
            PathBuf::from("/photos/a.jpg"),
            PathBuf::from("/photos/b.jpg"),
            PathBuf::from("/photos/c.jpg"),
        ];
        let records = parse_records(br#"[{"SourceFile": "/photos/b.jpg", "EXIF:Model": "X"}]"#).unwrap();
        let stderr = "Error: File format error - /photos/a.jpg\n    1 image files read\n";

        let records = reconcile(&files, records, stderr);

        let summary: Vec<(Option<&str>, Option<&str>)> = records
            .iter()
            .map(|r| (r.source(), r.extraction_error()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Some("/photos/b.jpg"), None),
                (Some("/photos/a.jpg"), Some("Error: File format error - /photos/a.jpg")),
                (Some("/photos/c.jpg"), Some("file missing from exiftool output")),
            ]
        );
    }

    #[test]
    fn test_empty_chunk_output_keeps_every_file() {
        let files = vec![PathBuf::from("/photos/a.jpg")];
        let records = reconcile(&files, Vec::new(), "");
        assert_eq!(records.len(), 1);
        assert!(records[0].extraction_error().is_some());
    }

    #[test]
    fn test_missing_binary_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("a.jpg")).unwrap();
        let config = ExtractorConfig {
            exiftool_path: dir.path().join("no-such-exiftool"),
            ..ExtractorConfig::default()
        };

        let mut source = ExifToolSource::new(&config, dir.path(), &taxonomy());
        assert!(matches!(source.read_records(), Err(Error::Source(_))));
    }
}
