//! Turns filesystem notifications into cache invalidations.

use crate::tenant_config::ConfigCache;
use crate::templates::TemplateCache;
use crate::BoxFuture;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Written,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Content changes carried by `event`. Access and metadata-only events are
/// dropped.
pub fn classify(event: &Event) -> Vec<FsChange> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => ChangeKind::Written,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event
        .paths
        .iter()
        .map(|path| FsChange {
            kind,
            path: path.clone(),
        })
        .collect()
}

/// Something that reacts to changes under a watched directory.
pub trait ChangeSink: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn recursive(&self) -> bool;

    fn apply<'a>(&'a self, change: &'a FsChange) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigInvalidation {
    All,
    Domain(String),
}

/// Which cached configs a change to `path` makes stale.
pub fn config_invalidation(path: &Path) -> Option<ConfigInvalidation> {
    if path.extension().and_then(|e| e.to_str()) != Some("conf") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?.to_lowercase();
    if stem.is_empty() {
        return None;
    }
    if stem == crate::resource_cache::DEFAULT_KEY {
        Some(ConfigInvalidation::All)
    } else {
        Some(ConfigInvalidation::Domain(stem))
    }
}

impl ChangeSink for ConfigCache {
    fn name(&self) -> &'static str {
        "config"
    }

    fn recursive(&self) -> bool {
        false
    }

    fn apply<'a>(&'a self, change: &'a FsChange) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match config_invalidation(&change.path) {
                Some(ConfigInvalidation::All) => {
                    let cleared = self.invalidate_all().await;
                    log::info!(
                        "Default config changed ({:?}), cleared {cleared} cached configs",
                        change.kind
                    );
                }
                Some(ConfigInvalidation::Domain(domain)) => {
                    if self.invalidate(&domain).await {
                        log::info!("Config for {domain} changed ({:?}), invalidated", change.kind);
                    }
                }
                None => {}
            }
        })
    }
}

impl ChangeSink for TemplateCache {
    fn name(&self) -> &'static str {
        "template"
    }

    fn recursive(&self) -> bool {
        true
    }

    fn apply<'a>(&'a self, change: &'a FsChange) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self.reload().await {
                Ok(count) => log::info!(
                    "Template tree changed at {}, reloaded {count} templates",
                    change.path.display()
                ),
                Err(e) => log::error!("Template reload failed, keeping previous templates: {e}"),
            }
        })
    }
}

/// Watch `dir` and feed its changes to `sink`, one at a time, from a single
/// task. A watcher that cannot start is logged and the task ends.
pub fn spawn_watcher(dir: PathBuf, sink: Arc<dyn ChangeSink>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => log::warn!("Filesystem watch error: {e}"),
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                log::error!("Failed to create {} watcher: {e}", sink.name());
                return;
            }
        };

        let mode = if sink.recursive() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(e) = watcher.watch(&dir, mode) {
            log::error!(
                "Failed to watch {} directory {}: {e}",
                sink.name(),
                dir.display()
            );
            return;
        }
        log::info!("Watching {} directory {}", sink.name(), dir.display());

        while let Some(event) = rx.recv().await {
            for change in classify(&event) {
                log::debug!("{} change: {:?} {}", sink.name(), change.kind, change.path.display());
                sink.apply(&change).await;
            }
        }
    })
}
