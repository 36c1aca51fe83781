use crate::error::{Result, SyncError};
use chrono::NaiveDateTime;
use std::fmt;
use std::str::Lines;

/// Marker the exporter writes on the first line of every file.
pub const EXPORT_MARKER: &str = "BOF";

/// Number of lines before the first data line.
pub const HEADER_LINES: usize = 3;

/// A single employee parsed from one data line of an export file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub last_name: String,
    pub first_name: String,
}

impl Record {
    /// The `"Last, First"` string used to look the employee up in the store.
    pub fn identity_key(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.last_name, self.first_name)
    }
}

/// The three header lines of an export file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportHeader {
    pub marker: String,
    pub timestamp: Option<NaiveDateTime>,
    pub metadata: String,
}

impl ExportHeader {
    pub fn has_marker(&self) -> bool {
        self.marker == EXPORT_MARKER
    }
}

/// A parsed export file. Records are produced lazily and can be consumed once.
pub struct ExportFile<'a> {
    pub header: ExportHeader,
    pub records: RecordIter<'a>,
}

/// Lazy iterator over the data lines of an export file.
///
/// Yields one item per non-blank data line: either the parsed `Record` or a
/// `SyncError::Parse` carrying the 1-based line number in the file. A bad line
/// never ends the iteration.
pub struct RecordIter<'a> {
    lines: Lines<'a>,
    line_no: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            return Some(parse_line(line, self.line_no));
        }
    }
}

/// Split raw file content into its header and a lazy record iterator.
pub fn parse_export(content: &str) -> ExportFile<'_> {
    let mut lines = content.lines();
    let mut header_lines = Vec::with_capacity(HEADER_LINES);
    for _ in 0..HEADER_LINES {
        match lines.next() {
            Some(line) => header_lines.push(line.trim_end_matches('\r').trim()),
            None => break,
        }
    }

    let header = ExportHeader {
        marker: header_lines.first().copied().unwrap_or_default().to_string(),
        timestamp: header_lines.get(1).and_then(|s| parse_timestamp(s)),
        metadata: header_lines.get(2).copied().unwrap_or_default().to_string(),
    };

    if !header.has_marker() {
        log::warn!(
            "Export file does not start with {EXPORT_MARKER} marker (found {:?}); header skipped anyway",
            header.marker
        );
    }

    ExportFile {
        header,
        records: RecordIter {
            lines,
            line_no: header_lines.len(),
        },
    }
}

/// Parse one data line.
///
/// Layout: `InitialLast|Last|First|...`. Only the second and third fields are used.
pub fn parse_line(line: &str, line_no: usize) -> Result<Record> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 3 {
        return Err(SyncError::Parse {
            line: line_no,
            reason: format!("expected at least 3 '|'-separated fields, found {}", fields.len()),
        });
    }

    let last_name = fields[1].trim();
    let first_name = fields[2].trim();
    if last_name.is_empty() {
        return Err(SyncError::Parse {
            line: line_no,
            reason: "last name is empty".into(),
        });
    }
    if first_name.is_empty() {
        return Err(SyncError::Parse {
            line: line_no,
            reason: "first name is empty".into(),
        });
    }

    Ok(Record {
        last_name: last_name.to_string(),
        first_name: first_name.to_string(),
    })
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok()
}
