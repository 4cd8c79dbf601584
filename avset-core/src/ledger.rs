//! Persistent record of segment identifiers that failed terminally in a
//! previous run. Identifiers in the ledger are skipped forever; removing
//! an entry is a manual operation.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub id: String,
    pub reason: String,
}

/// Two-column `id,'reason'` file, loaded fully at startup. The ledger is
/// only appended to after a batch drains, never while workers run.
#[derive(Debug)]
pub struct FailureLedger {
    path: PathBuf,
    known: HashSet<String>,
}

impl FailureLedger {
    /// A missing file is an empty ledger.
    pub fn load<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let known = match std::fs::read_to_string(&path) {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| {
                    let id = line.split(',').next()?.trim();
                    (!id.is_empty()).then(|| id.to_string())
                })
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(source) => return Err(LedgerError::Io { source, path }),
        };
        Ok(Self { path, known })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn append(&mut self, records: &[FailureRecord]) -> LedgerResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| LedgerError::Io {
                source,
                path: self.path.clone(),
            })?;
        for record in records {
            let reason = record.reason.replace('\n', "\\n").replace('\r', "\\r");
            writeln!(file, "{},'{}'", record.id, reason).map_err(|source| LedgerError::Io {
                source,
                path: self.path.clone(),
            })?;
            self.known.insert(record.id.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty_ledger() {
        let dir = tempdir().unwrap();
        let ledger = FailureLedger::load(dir.path().join("failures.csv")).unwrap();
        assert!(ledger.is_empty());
        assert!(!ledger.contains("abc"));
    }

    #[test]
    fn append_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failures.csv");
        let mut ledger = FailureLedger::load(&path).unwrap();
        ledger
            .append(&[
                FailureRecord {
                    id: "abc123".to_string(),
                    reason: "audio track failed".to_string(),
                },
                FailureRecord {
                    id: "def456".to_string(),
                    reason: "multi\nline\rerror".to_string(),
                },
            ])
            .unwrap();
        assert!(ledger.contains("abc123"));

        let reloaded = FailureLedger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("abc123"));
        assert!(reloaded.contains("def456"));

        // Escaped newlines keep one record per line.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("multi\\nline\\rerror"));
    }
}
