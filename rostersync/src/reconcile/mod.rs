use crate::error::{Result, SyncError};
use crate::record::{parse_export, Record};
use crate::report::{Report, ReportEntry};
use crate::store::EmployeeStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// What reconciling one record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The name already existed this many times; nothing was written.
    Found(i64),
    Inserted,
}

/// Result of a committed pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub file: PathBuf,
    pub found: usize,
    pub inserted: usize,
    pub skipped: usize,
    #[serde(skip)]
    pub report: Report,
}

/// Runs reconciliation passes against the store.
///
/// The store sits behind a mutex, so at most one pass runs at a time in this
/// process; each pass also runs inside one `BEGIN IMMEDIATE` transaction,
/// which serializes it against passes in other processes.
pub struct Reconciler {
    store: Mutex<EmployeeStore>,
}

impl Reconciler {
    pub fn new(store: EmployeeStore) -> Self {
        Reconciler {
            store: Mutex::new(store),
        }
    }

    /// Lock the store for direct use outside of a pass.
    pub fn store(&self) -> Result<MutexGuard<'_, EmployeeStore>> {
        self.store
            .lock()
            .map_err(|_| SyncError::Other("Store lock poisoned by an earlier pass".into()))
    }

    /// Check one record and insert it if absent. Must run inside a pass
    /// transaction.
    pub fn reconcile(store: &EmployeeStore, record: &Record) -> Result<Outcome> {
        let key = record.identity_key();
        let count = store.count_named(&key)?;
        if count == 0 {
            store.insert_name(&key)?;
            Ok(Outcome::Inserted)
        } else {
            Ok(Outcome::Found(count))
        }
    }

    /// Read `path` and reconcile every record in it, in file order.
    ///
    /// All inserts of the pass commit together. On any store failure the pass
    /// is rolled back and the error returned; unparseable lines are only noted
    /// in the report.
    pub fn run_pass(&self, path: &Path) -> Result<PassSummary> {
        let content = std::fs::read_to_string(path)?;
        self.run_pass_on(path, &content)
    }

    /// Run a pass over already-read file content.
    pub fn run_pass_on(&self, path: &Path, content: &str) -> Result<PassSummary> {
        let store = self.store()?;
        let mut summary = PassSummary {
            file: path.to_path_buf(),
            found: 0,
            inserted: 0,
            skipped: 0,
            report: Report::new(),
        };

        log::info!("Reconciliation pass started for {}", path.display());
        if let Err(e) = store.begin_pass() {
            log::error!(
                "Reconciliation pass for {} could not start, store unavailable: {e}",
                path.display()
            );
            return Err(e);
        }

        if let Err(e) = Self::reconcile_all(&store, content, &mut summary) {
            if let Err(rollback_err) = store.rollback_pass() {
                log::error!("Rollback failed: {rollback_err}");
            }
            log::error!(
                "Reconciliation pass for {} aborted, no changes committed: {e}",
                path.display()
            );
            return Err(e);
        }

        if let Err(e) = store.commit_pass() {
            if let Err(rollback_err) = store.rollback_pass() {
                log::error!("Rollback failed: {rollback_err}");
            }
            log::error!("Commit failed for {}: {e}", path.display());
            return Err(e);
        }

        log::info!(
            "Reconciliation pass finished for {}: {} found, {} inserted, {} skipped",
            path.display(),
            summary.found,
            summary.inserted,
            summary.skipped
        );
        Ok(summary)
    }

    fn reconcile_all(store: &EmployeeStore, content: &str, summary: &mut PassSummary) -> Result<()> {
        let query = store.count_query();
        for item in parse_export(content).records {
            let record = match item {
                Ok(record) => record,
                Err(SyncError::Parse { line, reason }) => {
                    log::warn!("Skipping line {line}: {reason}");
                    summary.skipped += 1;
                    summary.report.push(ReportEntry::Skipped { line, reason });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let key = record.identity_key();
            match Self::reconcile(store, &record)? {
                Outcome::Found(count) => {
                    summary.found += 1;
                    summary.report.push(ReportEntry::Found {
                        query: query.clone(),
                        key,
                        count,
                    });
                }
                Outcome::Inserted => {
                    log::debug!("Inserted {key:?}");
                    summary.inserted += 1;
                    summary.report.push(ReportEntry::Inserted {
                        query: query.clone(),
                        key,
                    });
                }
            }
        }
        Ok(())
    }
}
