use crate::error::{Result, SyncError};
use rusqlite::{params, Connection, OpenFlags};
use std::time::Duration;

/// Default table holding one employee name per row.
pub const DEFAULT_TABLE: &str = "employees";

/// The persistent store of employee names.
///
/// Entries are only ever inserted. There is no unique constraint on the name
/// column, so callers must hold a pass transaction (`begin_pass`) around any
/// check-then-insert sequence.
pub struct EmployeeStore {
    conn: Connection,
    table: String,
}

impl EmployeeStore {
    /// Open the store from a connection string: a filesystem path or a `file:` URI.
    pub fn open(connection_string: &str, table: &str, busy_timeout: Duration) -> Result<Self> {
        validate_table_name(table)?;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(connection_string, flags)?;
        conn.busy_timeout(busy_timeout)?;
        let store = EmployeeStore {
            conn,
            table: table.to_string(),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = EmployeeStore {
            conn,
            table: DEFAULT_TABLE.to_string(),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    fn initialize_tables(&self) -> Result<()> {
        // Take the write lock first; a plain CREATE would upgrade from a read
        // lock and can fail without waiting when another process is starting up.
        self.conn.execute_batch(&format!(
            "BEGIN IMMEDIATE;
             CREATE TABLE IF NOT EXISTS {} (EmployeeName TEXT);
             COMMIT;",
            self.table
        ))?;
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The lookup issued for every record, as it appears in pass reports.
    pub fn count_query(&self) -> String {
        format!("SELECT COUNT(*) FROM {} WHERE EmployeeName = ?1", self.table)
    }

    // ── Lookups and inserts ──────────────────────────────────────────

    /// Count entries whose name equals `name` exactly (case-sensitive).
    pub fn count_named(&self, name: &str) -> Result<i64> {
        let count = self
            .conn
            .query_row(&self.count_query(), params![name], |row| row.get(0))?;
        Ok(count)
    }

    /// Insert a new entry with exactly this name.
    pub fn insert_name(&self, name: &str) -> Result<()> {
        self.conn.execute(
            &format!("INSERT INTO {} (EmployeeName) VALUES (?1)", self.table),
            params![name],
        )?;
        Ok(())
    }

    /// All stored names, in insertion order.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT EmployeeName FROM {} ORDER BY rowid", self.table))?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Insert each name that is not already present, in one transaction.
    /// Returns how many names were inserted.
    pub fn seed<S: AsRef<str>>(&self, names: &[S]) -> Result<usize> {
        self.begin_pass()?;
        let mut inserted = 0;
        for name in names {
            let name = name.as_ref();
            let res = self.count_named(name).and_then(|count| {
                if count == 0 {
                    inserted += 1;
                    self.insert_name(name)
                } else {
                    Ok(())
                }
            });
            if let Err(e) = res {
                self.rollback_pass()?;
                return Err(e);
            }
        }
        self.commit_pass()?;
        Ok(inserted)
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Begin a pass transaction. `IMMEDIATE` takes the write lock up front, so a
    /// second writer (another process) waits here instead of racing the lookups.
    pub fn begin_pass(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        Ok(())
    }

    /// Commit the current pass transaction.
    pub fn commit_pass(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the current pass transaction. A no-op when SQLite already
    /// rolled it back on its own.
    pub fn rollback_pass(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// The table name is interpolated into SQL, so it must be a plain identifier.
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::Config(format!("Invalid table name: {table:?}")))
    }
}
