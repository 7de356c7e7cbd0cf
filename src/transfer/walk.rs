//! Lazy top-down walk of a local tree, mirrored onto remote paths.
//!
//! Yields every directory before its contents, so a collection is always
//! ensured before the files that land in it. Symbolic links are classified by
//! their target: dangling links become `BrokenLink`, links to directories are
//! mirrored as collections but not descended into.

use std::path::{Component, Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// What a walked entry maps to on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Collection,
    File,
    BrokenLink,
}

/// One local entry and its mirrored remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub kind: EntryKind,
    pub local: PathBuf,
    pub remote: String,
}

/// A symbolic link whose target does not exist.
pub fn is_broken_symlink(path: &Path) -> bool {
    let is_link = path
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    is_link && std::fs::metadata(path).is_err()
}

/// Map `local` (under `root`) to its path under the remote collection `dest`.
///
/// Remote paths always use `/`, whatever the local separator.
pub fn remote_path(root: &Path, local: &Path, dest: &str) -> Option<String> {
    let relative = local.strip_prefix(root).ok()?;
    let mut remote = dest.trim_end_matches('/').to_string();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                remote.push('/');
                remote.push_str(&part.to_string_lossy());
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(remote)
}

/// Iterator over the entries below a local root (the root itself excluded).
pub struct TreeWalker {
    root: PathBuf,
    dest: String,
    inner: walkdir::IntoIter,
}

impl TreeWalker {
    pub fn new(root: impl Into<PathBuf>, dest: impl Into<String>) -> Self {
        let root = root.into();
        let inner = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self {
            root,
            dest: dest.into(),
            inner,
        }
    }

    fn classify(entry: &walkdir::DirEntry) -> Option<EntryKind> {
        let file_type = entry.file_type();
        if file_type.is_dir() {
            return Some(EntryKind::Collection);
        }
        if file_type.is_file() {
            return Some(EntryKind::File);
        }
        if file_type.is_symlink() {
            return match std::fs::metadata(entry.path()) {
                Err(_) => Some(EntryKind::BrokenLink),
                Ok(meta) if meta.is_dir() => Some(EntryKind::Collection),
                Ok(meta) if meta.is_file() => Some(EntryKind::File),
                Ok(_) => None,
            };
        }
        // sockets, fifos, devices
        None
    }
}

impl Iterator for TreeWalker {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Cannot read local entry, skipping");
                    continue;
                }
            };

            let Some(kind) = Self::classify(&entry) else {
                continue;
            };
            let Some(remote) = remote_path(&self.root, entry.path(), &self.dest) else {
                continue;
            };

            return Some(WalkEntry {
                kind,
                local: entry.into_path(),
                remote,
            });
        }
    }
}
