use std::fmt;

/// One line of a pass report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEntry {
    /// The lookup matched existing entries; nothing was written.
    Found { query: String, key: String, count: i64 },
    /// The lookup matched nothing and the name was inserted.
    Inserted { query: String, key: String },
    /// The line could not be parsed and was skipped.
    Skipped { line: usize, reason: String },
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportEntry::Found { query, key, count } => {
                write!(f, "{query} [{key:?}] -> {count} found, no action")
            }
            ReportEntry::Inserted { query, key } => {
                write!(f, "{query} [{key:?}] -> 0 found, inserted {key:?}")
            }
            ReportEntry::Skipped { line, reason } => {
                write!(f, "line {line} skipped: {reason}")
            }
        }
    }
}

/// Append-only trace of what a single pass did, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    entries: Vec<ReportEntry>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// An empty report is never delivered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render all entries, one per line.
    pub fn build(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const QUERY: &str = "SELECT COUNT(*) FROM employees WHERE EmployeeName = ?1";

    #[test]
    fn test_empty_report_builds_empty_string() {
        let report = Report::new();
        assert!(report.is_empty());
        assert_eq!(report.build(), "");
    }

    #[test]
    fn test_entries_render_in_order() {
        let mut report = Report::new();
        report.push(ReportEntry::Found {
            query: QUERY.into(),
            key: "Andrews, Thomas".into(),
            count: 1,
        });
        report.push(ReportEntry::Skipped {
            line: 5,
            reason: "expected at least 3 '|'-separated fields, found 1".into(),
        });
        report.push(ReportEntry::Inserted {
            query: QUERY.into(),
            key: "Burch, Denise".into(),
        });

        assert_eq!(report.len(), 3);
        assert_eq!(
            report.build(),
            "SELECT COUNT(*) FROM employees WHERE EmployeeName = ?1 [\"Andrews, Thomas\"] -> 1 found, no action\n\
             line 5 skipped: expected at least 3 '|'-separated fields, found 1\n\
             SELECT COUNT(*) FROM employees WHERE EmployeeName = ?1 [\"Burch, Denise\"] -> 0 found, inserted \"Burch, Denise\"\n"
        );
    }
}
