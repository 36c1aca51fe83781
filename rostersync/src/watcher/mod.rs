use crate::error::{Result, SyncError};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

pub mod daemon;

pub use daemon::{Daemon, StopHandle};

/// A debounced filesystem event, ready for the daemon to filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_directory: bool,
}

/// The kind of file change detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Watches a single directory (not its subdirectories) for changes.
/// Debounced events are sent through an mpsc channel.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    /// Handle to the background thread processing events
    _thread: std::thread::JoinHandle<()>,
    /// Receiver for debounced file change events
    pub event_rx: mpsc::Receiver<WatchEvent>,
}

impl FileWatcher {
    /// Start watching `dir`. Events for the same path that arrive less than
    /// `debounce` apart are collapsed into one, keeping the latest kind.
    ///
    /// Fails if `dir` does not exist or the subscription cannot be created.
    pub fn start(dir: &Path, debounce: Duration) -> Result<Self> {
        if !dir.exists() {
            return Err(SyncError::Watch(
                notify::Error::path_not_found().add_path(dir.to_path_buf()),
            ));
        }
        if !dir.is_dir() {
            return Err(SyncError::Config(format!(
                "Watch path is not a directory: {}",
                dir.display()
            )));
        }

        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        let thread = std::thread::spawn(move || {
            let mut pending: Vec<(PathBuf, ChangeKind)> = Vec::new();
            let mut last_event = Instant::now();

            loop {
                match notify_rx.recv_timeout(debounce) {
                    Ok(Ok(event)) => {
                        if let Some(kind) = change_kind(&event.kind) {
                            for path in event.paths {
                                pending.push((path, kind));
                            }
                        }
                        last_event = Instant::now();
                    }
                    Ok(Err(e)) => {
                        log::warn!("File watcher error: {e}");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !pending.is_empty() && last_event.elapsed() >= debounce {
                            let mut seen = HashMap::new();
                            for (path, kind) in pending.drain(..) {
                                seen.insert(path, kind);
                            }
                            for (path, kind) in seen {
                                let is_directory = path.is_dir();
                                let event = WatchEvent {
                                    path,
                                    kind,
                                    is_directory,
                                };
                                if event_tx.send(event).is_err() {
                                    return; // Receiver dropped
                                }
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        break;
                    }
                }
            }
        });

        log::info!("Watching {} for changes", dir.display());
        Ok(FileWatcher {
            _watcher: watcher,
            _thread: thread,
            event_rx,
        })
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}
