use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::Record;

use super::error::{DeliveryError, DeliveryResult};

/// One line of the output dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub location: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: Record,
}

/// Durable, append-only destination for entries.
pub trait DatasetSink: Send + Sync {
    fn append(&self, entry: &DatasetEntry) -> DeliveryResult<()>;
}

/// Newline-delimited JSON file; one entry per line.
#[derive(Debug)]
pub struct JsonlDataset {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlDataset {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry back; a missing file is an empty dataset.
    pub fn entries(&self) -> DeliveryResult<Vec<DatasetEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| self.io_error(source))?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn io_error(&self, source: std::io::Error) -> DeliveryError {
        DeliveryError::Dataset {
            path: self.path.clone(),
            source,
        }
    }
}

impl DatasetSink for JsonlDataset {
    fn append(&self, entry: &DatasetEntry) -> DeliveryResult<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        writeln!(file, "{}", line).map_err(|source| self.io_error(source))?;
        file.flush().map_err(|source| self.io_error(source))?;
        Ok(())
    }
}
