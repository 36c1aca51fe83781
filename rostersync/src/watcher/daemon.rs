use super::{ChangeKind, FileWatcher, WatchEvent};
use crate::config::{NotifyConfig, SyncConfig, WatchConfig};
use crate::error::{Result, SyncError};
use crate::notification::{Message, NotificationQueue};
use crate::reconcile::{PassSummary, Reconciler};
use chrono::Local;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// How long the event loop blocks before re-checking for a stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Requests a running [`Daemon`] to stop once any in-flight pass is done.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Connects watch events to reconciliation passes and report delivery.
///
/// Passes run one at a time on the daemon's thread. Qualifying events that
/// pile up while a pass runs are collapsed into a single follow-up pass, since
/// every pass re-reads the whole file.
pub struct Daemon {
    watch: WatchConfig,
    notify: NotifyConfig,
    reconciler: Arc<Reconciler>,
    queue: NotificationQueue,
    stop: StopHandle,
}

impl Daemon {
    pub fn new(config: &SyncConfig, reconciler: Arc<Reconciler>, queue: NotificationQueue) -> Self {
        Daemon {
            watch: config.watch.clone(),
            notify: config.notify.clone(),
            reconciler,
            queue,
            stop: StopHandle::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Subscribe to the configured directory and process events until stopped.
    /// A subscription failure is returned before any event is processed.
    pub fn run(self) -> Result<()> {
        let watcher = FileWatcher::start(&self.watch.path, self.watch.debounce())?;
        self.run_with(&watcher.event_rx)
    }

    /// Process events from `events` until stopped or the channel closes, then
    /// wait for queued notifications to be delivered.
    pub fn run_with(self, events: &Receiver<WatchEvent>) -> Result<()> {
        let result = loop {
            if self.stop.is_stopped() {
                break Ok(());
            }
            match events.recv_timeout(STOP_POLL_INTERVAL) {
                Ok(event) => {
                    if !self.is_trigger(&event) {
                        continue;
                    }
                    let coalesced = events.try_iter().filter(|e| self.is_trigger(e)).count();
                    if coalesced > 0 {
                        log::debug!("Coalesced {coalesced} queued change(s) into one pass");
                    }
                    self.handle_trigger(&event.path);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(SyncError::Other("File watcher stopped unexpectedly".into()));
                }
            }
        };

        log::info!("Watcher stopping; flushing pending notifications");
        self.queue.shutdown();
        result
    }

    /// True for a non-directory modification of the target file.
    pub fn is_trigger(&self, event: &WatchEvent) -> bool {
        !event.is_directory
            && event.kind == ChangeKind::Modified
            && event
                .path
                .file_name()
                .map_or(false, |name| name == self.watch.target_file_name.as_str())
    }

    /// Run one pass for `path` and queue its report. Failures are logged and
    /// swallowed so the watcher keeps running.
    pub fn handle_trigger(&self, path: &Path) -> Option<PassSummary> {
        let summary = match self.reconciler.run_pass(path) {
            Ok(summary) => summary,
            Err(e) if e.is_store_failure() => {
                // Already logged by the reconciler; the next change retries.
                return None;
            }
            Err(e) => {
                log::warn!("Pass for {} failed: {e}", path.display());
                return None;
            }
        };

        if summary.report.is_empty() {
            log::info!("No records in {}; no report sent", path.display());
        } else {
            let message =
                Message::for_report(&self.notify, &summary.report, Local::now().date_naive());
            self.queue.enqueue(message);
        }
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::testing::RecordingNotifier;
    use crate::notification::RetryPolicy;
    use crate::store::EmployeeStore;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Instant;
    use tempfile::TempDir;

    const EXPORT: &str = "BOF\n2023-04-12 09:15:42.123456\n850\n\
TAndrews|Andrews|Thomas||||Engineer|||||thomas@example.com\n\
DBurch|Burch|Denise||||Chemist|||||denise@example.org\n";

    struct Fixture {
        _tmp: TempDir,
        dir: PathBuf,
        notifier: RecordingNotifier,
        reconciler: Arc<Reconciler>,
        daemon: Daemon,
    }

    fn fixture() -> Fixture {
        fixture_with(EmployeeStore::open_in_memory().unwrap())
    }

    fn fixture_with(store: EmployeeStore) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        let yaml = format!(
            "watch:\n  path: {}\nstore:\n  connection_string: \":memory:\"\nnotify:\n  from: sync@example.com\n  to: ops@example.com\n  transport:\n    kind: log\n",
            dir.display()
        );
        let config = SyncConfig::from_yaml_str(&yaml, |_| None).unwrap();

        let notifier = RecordingNotifier::default();
        let queue = NotificationQueue::start(
            Box::new(notifier.clone()),
            4,
            RetryPolicy {
                max_attempts: 1,
                delay: Duration::from_millis(1),
            },
        );
        let reconciler = Arc::new(Reconciler::new(store));
        let daemon = Daemon::new(&config, Arc::clone(&reconciler), queue);
        Fixture {
            _tmp: tmp,
            dir,
            notifier,
            reconciler,
            daemon,
        }
    }

    fn modified(path: PathBuf) -> WatchEvent {
        WatchEvent {
            path,
            kind: ChangeKind::Modified,
            is_directory: false,
        }
    }

    #[test]
    fn test_trigger_filter() {
        let f = fixture();
        let target = f.dir.join("Vericelusers.txt");

        assert!(f.daemon.is_trigger(&modified(target.clone())));
        assert!(!f.daemon.is_trigger(&modified(f.dir.join("Other.txt"))));
        assert!(!f.daemon.is_trigger(&modified(f.dir.join("OldVericelusers.txt"))));
        assert!(!f.daemon.is_trigger(&WatchEvent {
            path: target.clone(),
            kind: ChangeKind::Modified,
            is_directory: true,
        }));
        assert!(!f.daemon.is_trigger(&WatchEvent {
            path: target,
            kind: ChangeKind::Deleted,
            is_directory: false,
        }));
    }

    #[test]
    fn test_trigger_runs_pass_and_queues_report() {
        let f = fixture();
        let target = f.dir.join("Vericelusers.txt");
        std::fs::write(&target, EXPORT).unwrap();

        let summary = f.daemon.handle_trigger(&target).unwrap();
        assert_eq!(summary.inserted, 2);
        f.daemon.queue.shutdown();

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.starts_with("Employee sync report for "));
        assert_eq!(sent[0].body, summary.report.build());
    }

    #[test]
    fn test_header_only_file_sends_nothing() {
        let f = fixture();
        let target = f.dir.join("Vericelusers.txt");
        std::fs::write(&target, "BOF\n2023-04-12 09:15:42\n0\n").unwrap();

        let summary = f.daemon.handle_trigger(&target).unwrap();
        assert!(summary.report.is_empty());
        f.daemon.queue.shutdown();
        assert!(f.notifier.sent().is_empty());
    }

    #[test]
    fn test_missing_file_does_not_panic() {
        let f = fixture();
        assert!(f.daemon.handle_trigger(&f.dir.join("Vericelusers.txt")).is_none());
    }

    #[test]
    fn test_locked_store_is_logged_and_skipped() {
        crate::testing::capture_logs();
        let db_dir = TempDir::new().unwrap();
        let db = db_dir.path().join("peaches.db");
        let db = db.to_str().unwrap();
        let holder = EmployeeStore::open(db, "employees", Duration::from_millis(50)).unwrap();
        holder.begin_pass().unwrap();

        let f = fixture_with(EmployeeStore::open(db, "employees", Duration::from_millis(50)).unwrap());
        let target = f.dir.join("Vericelusers.txt");
        std::fs::write(&target, EXPORT).unwrap();

        assert!(f.daemon.handle_trigger(&target).is_none());
        let logged_error = crate::testing::logs_for_current_thread()
            .iter()
            .any(|(level, line)| *level == log::Level::Error && line.contains("Vericelusers.txt"));
        assert!(logged_error);

        f.daemon.queue.shutdown();
        assert!(f.notifier.sent().is_empty());
        holder.rollback_pass().unwrap();
    }

    #[test]
    fn test_queued_triggers_collapse_into_one_pass() {
        let f = fixture();
        let target = f.dir.join("Vericelusers.txt");
        std::fs::write(&target, EXPORT).unwrap();

        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            tx.send(modified(target.clone())).unwrap();
        }
        drop(tx);

        // The channel closes after the burst, which ends the loop.
        let result = f.daemon.run_with(&rx);
        assert!(result.is_err());
        assert_eq!(f.notifier.sent().len(), 1);
        assert_eq!(f.reconciler.store().unwrap().list_names().unwrap().len(), 2);
    }

    #[test]
    fn test_stop_waits_for_delivery() {
        let f = fixture();
        let target = f.dir.join("Vericelusers.txt");
        std::fs::write(&target, EXPORT).unwrap();

        let stop = f.daemon.stop_handle();
        let daemon = f.daemon;
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || daemon.run_with(&rx));

        tx.send(modified(target)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.reconciler.store().unwrap().list_names().unwrap().len() < 2
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(20));
        }

        stop.stop();
        handle.join().unwrap().unwrap();
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[test]
    fn test_run_fails_fast_on_missing_directory() {
        let f = fixture();
        let mut daemon = f.daemon;
        daemon.watch.path = f.dir.join("missing");
        assert!(matches!(daemon.run(), Err(SyncError::Watch(_))));
    }
}
