use std::path::{Path, PathBuf};

use crate::error::Result;

use super::{parse_records, RawRecord, RecordSource};

/// Reads records from a pre-existing extractor dump (`exiftool -j -G` JSON).
pub struct DumpSource {
    path: PathBuf,
}

impl DumpSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl RecordSource for DumpSource {
    fn describe(&self) -> String {
        format!("dump {}", self.path.display())
    }

    fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        let bytes = std::fs::read(&self.path)?;
        parse_records(&bytes)
    }
}
