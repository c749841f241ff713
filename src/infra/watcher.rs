//! Recursive file watcher feeding cache eviction.
//!
//! Events are delivered on notify's own thread and handed to a sink without
//! debouncing; the sink only touches the cache map.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::cache::WatchEvent;

use super::error::InfraError;

/// Keeps the underlying watcher alive. Dropping it stops delivery.
pub struct SiteWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for SiteWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteWatcher").field("root", &self.root).finish()
    }
}

impl SiteWatcher {
    /// Watch `root` recursively. `accept` filters file paths; `sink` receives
    /// every classified event.
    pub fn start<A, S>(root: &Path, accept: A, sink: S) -> Result<Self, InfraError>
    where
        A: Fn(&Path) -> bool + Send + 'static,
        S: Fn(WatchEvent) + Send + 'static,
    {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in classify(&event, &accept) {
                        debug!(
                            target = "kiln::infra::watcher",
                            path = %change.path.display(),
                            kind = change.kind.as_str(),
                            "source change observed"
                        );
                        sink(change);
                    }
                }
                Err(error) => warn!(
                    target = "kiln::infra::watcher",
                    error = %error,
                    "file watcher reported an error"
                ),
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Map a raw notify event to cache events.
///
/// Writes and creations become `Modified`; removals and the old side of a
/// rename become `Renamed`. Removal-like events also pass for paths without
/// an extension, since a vanished directory can no longer be inspected.
pub fn classify(event: &Event, accept: &impl Fn(&Path) -> bool) -> Vec<WatchEvent> {
    let modified = |path: &PathBuf| {
        accept(path.as_path()).then(|| WatchEvent::modified(path.clone()))
    };
    let renamed = |path: &PathBuf| {
        (accept(path.as_path()) || path.extension().is_none())
            .then(|| WatchEvent::renamed(path.clone()))
    };

    match &event.kind {
        EventKind::Create(_) => event.paths.iter().filter_map(modified).collect(),
        EventKind::Remove(_) => event.paths.iter().filter_map(renamed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().filter_map(modified).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::new();
            if let Some(from) = event.paths.first() {
                changes.extend(renamed(from));
            }
            if let Some(to) = event.paths.get(1) {
                changes.extend(modified(to));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            event.paths.iter().filter_map(renamed).collect()
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event.paths.iter().filter_map(modified).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
