//! Persistent renewal state.
//!
//! Each renewal record is one JSON document; only the record semantics are
//! fixed, the serialization is free to evolve. Writes go through a temp file
//! plus rename so a crashed run never leaves a half-written record behind.

use crate::state::types::RenewalRecord;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::warn;

pub mod lock;
pub mod types;

const RECORD_SUFFIX: &str = ".renewal.json";

#[derive(Debug, Clone)]
pub struct RecordStore {
    directory: PathBuf,
}

impl RecordStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{id}{RECORD_SUFFIX}"))
    }

    /// Loads every parseable record. Unreadable records are skipped with a
    /// warning rather than failing the whole pass; one broken record must not
    /// block everyone else's renewal.
    pub async fn load_all(&self) -> anyhow::Result<Vec<RenewalRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => {
                return Err(e).context(format!(
                    "Reading renewal state directory {}",
                    self.directory.display()
                ));
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Listing renewal state directory")?
        {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !file_name.ends_with(RECORD_SUFFIX) {
                continue;
            }
            match self.load_path(&path).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping unreadable renewal record {file_name}: {e:#}");
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub async fn load(&self, id: &str) -> anyhow::Result<RenewalRecord> {
        self.load_path(&self.record_path(id)).await
    }

    async fn load_path(&self, path: &Path) -> anyhow::Result<RenewalRecord> {
        let content = tokio::fs::read(path)
            .await
            .context(format!("Reading renewal record {}", path.display()))?;
        serde_json::from_slice(&content)
            .context(format!("Parsing renewal record {}", path.display()))
    }

    pub async fn save(&self, record: &RenewalRecord) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .context("Creating renewal state directory")?;
        let path = self.record_path(&record.id);
        let temp_path = path.with_extension("json.tmp");
        let content =
            serde_json::to_vec_pretty(record).context("Encoding renewal record failed")?;
        tokio::fs::write(&temp_path, &content)
            .await
            .context(format!("Writing renewal record {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .context(format!("Replacing renewal record {}", path.display()))
    }
}
