use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::model::AuditEntry;

use super::{AuditSink, StoreError};

/// Audit log as one JSON object per line, appended and flushed per entry.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlAuditLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(tokio::fs::File::from_std(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry back. Lines that fail to parse are skipped.
    pub fn read(path: &Path) -> io::Result<Vec<AuditEntry>> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("skipping malformed audit line: {e}"),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| StoreError::Io(e.into()))?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Audit sink that keeps entries in memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}
