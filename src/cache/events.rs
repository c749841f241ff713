//! File-change events delivered from the watcher to the cache.

use std::path::{Path, PathBuf};

use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Written or created: the entry is reset and rebuilt on next access.
    Modified,
    /// Renamed away or deleted: the entry is forgotten.
    Renamed,
}

impl WatchEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchEventKind::Modified => "modified",
            WatchEventKind::Renamed => "renamed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    pub observed_at: OffsetDateTime,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, WatchEventKind::Modified)
    }

    pub fn renamed(path: impl Into<PathBuf>) -> Self {
        Self::new(path, WatchEventKind::Renamed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
