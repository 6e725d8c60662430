//! Transaction ids the watcher has already acted on.
//!
//! Membership only grows. With a journal attached, each newly marked id is
//! appended to a file so that a restart does not re-fire actions for
//! transactions still inside the lookback window.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SeenError {
    #[error("failed to open seen journal {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct Journal {
    path: PathBuf,
    file: File,
}

#[derive(Default)]
pub struct SeenSet {
    ids: HashSet<String>,
    journal: Option<Journal>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load ids from `path` (one per line, created if missing) and append
    /// future marks to it.
    pub fn with_journal(path: impl AsRef<Path>) -> Result<Self, SeenError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| SeenError::Io {
            path: path.clone(),
            source,
        };

        let mut ids = HashSet::new();
        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line.map_err(io_err)?;
                    let id = line.trim();
                    if !id.is_empty() {
                        ids.insert(id.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        info!(path = %path.display(), loaded = ids.len(), "loaded seen journal");

        Ok(Self {
            ids,
            journal: Some(Journal { path, file }),
        })
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.ids.contains(txid)
    }

    /// Record `txid`. Returns false if it was already present.
    ///
    /// The in-memory mark always lands; a failed journal write is logged and
    /// only weakens the guarantee across restarts.
    pub fn mark_seen(&mut self, txid: &str) -> bool {
        if !self.ids.insert(txid.to_string()) {
            return false;
        }
        if let Some(journal) = &mut self.journal {
            let written = writeln!(journal.file, "{txid}").and_then(|_| journal.file.flush());
            if let Err(e) = written {
                warn!(
                    path = %journal.path.display(),
                    txid = txid,
                    error = %e,
                    "failed to append to seen journal"
                );
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
