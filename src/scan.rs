//! Incremental scanner for acquisition data directories.
//!
//! Keeps every regular file seen under the scanned root with its size and
//! modification time, and recognises movie files by suffix.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::coordinator::JsonMap;

/// Suffixes of the movie files detectors write.
pub const DEFAULT_MOVIE_SUFFIXES: [&str; 3] = ["fractions.tiff", "fractions.mrc", "EER.eer"];

/// Size and modification time of one scanned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedFile {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Summary of everything seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanInfo {
    pub movies: usize,
    pub total_files: usize,
    pub total_size: u64,
    pub first_movie: Option<String>,
    pub first_movie_creation: Option<DateTime<Utc>>,
    pub last_movie: Option<String>,
    pub last_movie_creation: Option<DateTime<Utc>>,
    /// Per-file detail, keyed by path relative to the scanned root.
    pub files: BTreeMap<String, ScannedFile>,
}

impl ScanInfo {
    /// Everything, for merging into the session's `raw` section.
    pub fn to_map(&self) -> JsonMap {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => JsonMap::new(),
        }
    }

    /// Counters only, for task progress updates.
    pub fn summary(&self) -> JsonMap {
        let mut map = self.to_map();
        map.remove("files");
        map
    }
}

#[derive(Debug, Clone)]
pub struct FileScanner {
    suffixes: Vec<String>,
    files: BTreeMap<String, ScannedFile>,
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            suffixes: DEFAULT_MOVIE_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            files: BTreeMap::new(),
        }
    }

    /// Also recognise files matching an instrument pattern such as `*.tiff`.
    pub fn with_pattern(mut self, pattern: Option<&str>) -> Self {
        if let Some(suffix) = pattern.map(|p| p.trim().trim_start_matches('*')) {
            if !suffix.is_empty() && !self.suffixes.iter().any(|s| s == suffix) {
                self.suffixes.push(suffix.to_string());
            }
        }
        self
    }

    pub fn is_movie(&self, name: &str) -> bool {
        self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }

    /// Walk `root` and record every regular file. A missing root finds nothing.
    ///
    /// Returns the number of files not seen before.
    pub fn scan(&mut self, root: &Path) -> usize {
        let mut new_files = 0;

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let key = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            let file = ScannedFile {
                size: meta.len(),
                modified,
            };
            if self.files.insert(key, file).is_none() {
                new_files += 1;
            }
        }

        debug!(root = %root.display(), new_files, total = self.files.len(), "Scanned");
        new_files
    }

    pub fn info(&self) -> ScanInfo {
        let mut movies: Vec<(&String, &ScannedFile)> = self
            .files
            .iter()
            .filter(|(name, _)| self.is_movie(name))
            .collect();
        movies.sort_by(|a, b| a.1.modified.cmp(&b.1.modified).then_with(|| a.0.cmp(b.0)));

        let first = movies.first();
        let last = movies.last();

        ScanInfo {
            movies: movies.len(),
            total_files: self.files.len(),
            total_size: self.files.values().map(|f| f.size).sum(),
            first_movie: first.map(|(name, _)| (*name).clone()),
            first_movie_creation: first.map(|(_, f)| f.modified),
            last_movie: last.map(|(name, _)| (*name).clone()),
            last_movie_creation: last.map(|(_, f)| f.modified),
            files: self.files.clone(),
        }
    }
}
