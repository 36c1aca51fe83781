pub mod config;
pub mod error;
pub mod notification;
pub mod reconcile;
pub mod record;
pub mod report;
pub mod store;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use reconcile::{Outcome, PassSummary, Reconciler};
pub use record::Record;
pub use report::Report;
pub use store::EmployeeStore;
pub use watcher::{Daemon, StopHandle};
