use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively list files under `directory`, skipping the excluded
/// extensions (sidecar text, databases, previous dumps).
pub fn discover_files(directory: &Path, exclude_extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let excluded = path
            .extension()
            .map(|ext| {
                let ext_lower = ext.to_string_lossy().to_lowercase();
                exclude_extensions
                    .iter()
                    .any(|e| e.trim_start_matches('.').to_lowercase() == ext_lower)
            })
            .unwrap_or(false);

        if !excluded {
            files.push(path.to_path_buf());
        }
    }

    // Sort by path for consistent ordering
    files.sort();

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_discover_files() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.CR2")).unwrap();
        File::create(dir.path().join("errors.txt")).unwrap();
        File::create(dir.path().join("photo_metadata.db")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();
        File::create(dir.path().join("subdir/metadata.JSON")).unwrap();

        let exclude = vec![".txt".to_string(), "db".to_string(), "json".to_string()];
        let files = discover_files(dir.path(), &exclude).unwrap();

        assert_eq!(files.len(), 3);
        assert!(files.windows(2).all(|w| w[0] <= w[1]));
    }
}
