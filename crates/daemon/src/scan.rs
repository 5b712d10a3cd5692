//! Folder scanner for bulk enqueuing.
//!
//! Recursively walks a directory and collects media files by extension. The
//! walk is eager and stateless; files added or removed while it runs may or
//! may not be reported.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Media extensions accepted by the scanner (case-insensitive matching).
pub const MEDIA_EXTENSIONS: &[&str] = &["mkv", "avi", "ts"];

/// Checks if a file has a media extension (case-insensitive).
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            MEDIA_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Recursively finds all media files below `root`.
///
/// Entries that cannot be read are logged and skipped. A missing or
/// unreadable root yields an empty list. Results come back in file-name
/// order within each directory.
pub fn find_all_media_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(true).sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_file() && is_media_file(entry.path()) {
            files.push(entry.into_path());
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_is_media_file() {
        assert!(is_media_file(Path::new("/media/movie.mkv")));
        assert!(is_media_file(Path::new("/media/movie.MKV")));
        assert!(is_media_file(Path::new("/media/movie.Avi")));
        assert!(is_media_file(Path::new("/media/movie.ts")));
        assert!(!is_media_file(Path::new("/media/movie.mp4")));
        assert!(!is_media_file(Path::new("/media/movie.txt")));
        assert!(!is_media_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_scan_mixed_tree() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        File::create(root.join("a.mkv")).unwrap();
        File::create(root.join("b.txt")).unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        File::create(root.join("sub").join("c.avi")).unwrap();

        let files = find_all_media_files(root);

        assert_eq!(files, vec![root.join("a.mkv"), root.join("sub").join("c.avi")]);
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(find_all_media_files(&temp_dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_scan_ignores_directories_named_like_media() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("season.mkv")).unwrap();
        File::create(root.join("season.mkv").join("ep.ts")).unwrap();

        let files = find_all_media_files(root);
        assert_eq!(files, vec![root.join("season.mkv").join("ep.ts")]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_media_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("Mkv"),
                Just("avi"), Just("AVI"),
                Just("ts"), Just("TS"),
                Just("mp4"), Just("mov"), Just("txt"), Just("srt"), Just("m2ts"),
            ],
        ) {
            let path = PathBuf::from(format!("/media/{}.{}", basename, ext));
            let expected = matches!(ext.to_lowercase().as_str(), "mkv" | "avi" | "ts");
            prop_assert_eq!(is_media_file(&path), expected);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(25))]

        // Every media file in a nested tree is found exactly once.
        #[test]
        fn prop_scan_finds_nested_files(
            dirs in prop::collection::vec("[a-z]{1,6}", 0..4),
            names in prop::collection::btree_set("[a-z]{1,8}", 1..6),
        ) {
            let temp_dir = TempDir::new().unwrap();
            let mut dir = temp_dir.path().to_path_buf();
            for d in &dirs {
                dir = dir.join(d);
            }
            fs::create_dir_all(&dir).unwrap();
            for name in &names {
                File::create(dir.join(format!("{}.mkv", name))).unwrap();
                File::create(dir.join(format!("{}.nfo", name))).unwrap();
            }

            let files = find_all_media_files(temp_dir.path());
            prop_assert_eq!(files.len(), names.len());
            for name in &names {
                let expected = dir.join(format!("{}.mkv", name));
                prop_assert!(files.contains(&expected));
            }
        }
    }
}
