//! JSON file storage
//!
//! The queue is written to a single JSON document. Every save writes a
//! sibling `.tmp` file, syncs it and renames it over the target, so a crash
//! leaves either the previous or the new document, never a torn one.

use super::Storage;
use crate::error::{PumpError, Result, StorageErrorKind};
use crate::protocol::Pumping;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct QueueDocumentRef<'a> {
    version: u32,
    pumpings: &'a [Pumping],
}

#[derive(Deserialize)]
struct QueueDocument {
    version: u32,
    #[serde(default)]
    pumpings: Vec<Pumping>,
}

/// Storage bound to one queue file
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn save_all(&self, pumpings: &[Pumping]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PumpError::io(parent, "Failed to create state directory", e))?;
        }

        let json = serde_json::to_vec_pretty(&QueueDocumentRef {
            version: FORMAT_VERSION,
            pumpings,
        })?;

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| PumpError::io(&tmp, "Failed to create temp file", e))?;
        file.write_all(&json)
            .await
            .map_err(|e| PumpError::io(&tmp, "Failed to write queue", e))?;
        file.sync_all()
            .await
            .map_err(|e| PumpError::io(&tmp, "Failed to sync queue", e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PumpError::io(&self.path, "Failed to replace queue file", e))?;

        tracing::trace!(path = %self.path.display(), count = pumpings.len(), "Queue saved");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Pumping>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PumpError::io(&self.path, "Failed to read queue file", e)),
        };

        let doc: QueueDocument = serde_json::from_slice(&raw).map_err(|e| {
            PumpError::storage(StorageErrorKind::Corrupt, &self.path, e.to_string())
        })?;

        if doc.version != FORMAT_VERSION {
            return Err(PumpError::storage(
                StorageErrorKind::Corrupt,
                &self.path,
                format!("Unsupported queue file version {}", doc.version),
            ));
        }

        Ok(doc.pumpings)
    }
}
