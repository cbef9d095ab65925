use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::configuration::Error;

/// A component holding material read from disk that can be rebuilt in place.
pub trait Reloadable: Send + Sync {
    fn name(&self) -> &'static str;
    fn reload(&self) -> Result<(), Error>;
}

/// Watches credential files and reloads every registered component when one
/// of them changes.
///
/// Parent directories are watched rather than the files themselves so that
/// Kubernetes secret mounts, which swap a `..data` symlink, are picked up.
pub struct CredentialWatcher {
    _watcher: Option<RecommendedWatcher>,
    _handle: JoinHandle<()>,
}

impl CredentialWatcher {
    pub fn new(
        files: &[PathBuf],
        reload_interval: Duration,
        reloadables: Vec<Arc<dyn Reloadable>>,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<Event>(100);
        let dirs = watched_dirs(files);

        let watcher = if dirs.is_empty() {
            info!("No credential files to watch");
            None
        } else {
            let mut watcher =
                notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                    Ok(event) => {
                        let _ = tx.blocking_send(event);
                    }
                    Err(e) => warn!("Credential watcher error: {e}"),
                })?;

            for dir in &dirs {
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
                info!("Watching credential directory: {}", dir.display());
            }
            Some(watcher)
        };

        let handle = tokio::spawn(watch_loop(rx, dirs, reload_interval, reloadables));

        Ok(Self {
            _watcher: watcher,
            _handle: handle,
        })
    }
}

fn watched_dirs(files: &[PathBuf]) -> HashSet<PathBuf> {
    files
        .iter()
        .filter_map(|file| {
            let dir = match file.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            };
            match std::fs::canonicalize(&dir) {
                Ok(dir) => Some(dir),
                Err(e) => {
                    warn!("Not watching {}: {e}", file.display());
                    None
                }
            }
        })
        .collect()
}

fn is_relevant(event: &Event, dirs: &HashSet<PathBuf>) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|path| path.parent().is_some_and(|dir| dirs.contains(dir)))
}

async fn watch_loop(
    mut rx: mpsc::Receiver<Event>,
    dirs: HashSet<PathBuf>,
    reload_interval: Duration,
    reloadables: Vec<Arc<dyn Reloadable>>,
) {
    loop {
        let Some(event) = rx.recv().await else {
            debug!("Credential watcher channel closed");
            return;
        };

        if !is_relevant(&event, &dirs) {
            continue;
        }

        // Coalesce the burst of events a single rotation produces.
        tokio::time::sleep(reload_interval).await;
        while rx.try_recv().is_ok() {}

        info!("Credential change detected, reloading");
        reload_all(&reloadables);
    }
}

fn reload_all(reloadables: &[Arc<dyn Reloadable>]) {
    for reloadable in reloadables {
        match reloadable.reload() {
            Ok(()) => info!("Reloaded {}", reloadable.name()),
            Err(e) => error!(
                "Failed to reload {}, keeping previous material: {e}",
                reloadable.name()
            ),
        }
    }
}
