//! Append-only evidence file.
//!
//! One CSV line per persisted observation, written alongside the store so
//! the raw inbound evidence survives any later database surgery. Write
//! failures are logged and absorbed; the evidence file is best-effort.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct EventLog {
    path: PathBuf,
    file: File,
}

impl EventLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(EventLog {
            path: path.to_owned(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Errors are logged, never propagated.
    pub fn record(&mut self, line: &str) {
        if let Err(e) = writeln!(self.file, "{}", line).and_then(|()| self.file.flush()) {
            tracing::warn!(path = %self.path.display(), error = %e, "event file write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_lines() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("events.csv");
        let mut log = EventLog::open(&path).expect("open event log");
        log.record("MTRUPDATE,n,1,AB,1,MUP,5,15,100,NORM");
        log.record("MTRREBASE,n,2,CD,2,MREB,200,NORM");
        drop(log);

        let content = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("MTRUPDATE,"));
    }

    #[test]
    fn reopen_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("events.csv");
        EventLog::open(&path).expect("open").record("first");
        EventLog::open(&path).expect("reopen").record("second");
        let content = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(content.lines().count(), 2);
    }
}
