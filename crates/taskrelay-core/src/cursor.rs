//! Stream resumption cursor.
//!
//! A single token (the last seen notification timestamp) kept in a plain
//! text file. Deleting the file replays the topic from the beginning.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

/// Token sent to the server when no cursor has been persisted.
pub const SINCE_ALL: &str = "all";

#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored token, or None if nothing has been saved yet.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub fn load(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let token = raw.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("read cursor file {}", self.path.display()))
            }
        }
    }

    /// Returns the `since` value to resume from.
    ///
    /// An unreadable cursor falls back to [`SINCE_ALL`]; the job ledger
    /// deduplicates whatever gets replayed.
    pub fn since(&self) -> String {
        match self.load() {
            Ok(Some(token)) => token,
            Ok(None) => SINCE_ALL.to_string(),
            Err(err) => {
                warn!("{err:#}; replaying from the start");
                SINCE_ALL.to_string()
            }
        }
    }

    /// Persists `time` as the new cursor.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, time: i64) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create cursor dir {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, time.to_string())
            .with_context(|| format!("write cursor temp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "persist cursor from {} to {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}
