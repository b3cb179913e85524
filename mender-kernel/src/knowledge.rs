/**
 * KNOWLEDGE BASE - Applied fixes kept as (faulty, fixed) pairs
 *
 * Stored as one JSON document:
 *   {"entries": [{"id": "...", "app": "worker-A", "faulty_code": "...",
 *                 "fixed_code": "...", "timestamp": "2024-01-01T12:00:00Z"}]}
 *
 * The document is cached in memory and rewritten whole on every record.
 * A missing or unreadable document is reset to an empty one on open, so a
 * corrupt file never blocks remediation.
 */

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("knowledge base I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot encode knowledge base: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub app: String,
    pub faulty_code: String,
    pub fixed_code: String,
    pub timestamp: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnowledgeDoc {
    #[serde(default)]
    entries: Vec<KnowledgeEntry>,
}

pub struct KnowledgeBase {
    path: PathBuf,
    doc: parking_lot::Mutex<KnowledgeDoc>,
    writer: tokio::sync::Mutex<()>,
}

impl KnowledgeBase {
    /// Loads the document at `path`, resetting it when missing or corrupt.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, KnowledgeError> {
        let path = path.into();
        let doc = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<KnowledgeDoc>(&text) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(path = %path.display(), "knowledge base unreadable, resetting: {e}");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(KnowledgeError::Io { path, source }),
        };

        let kb = Self {
            path,
            doc: parking_lot::Mutex::new(KnowledgeDoc::default()),
            writer: tokio::sync::Mutex::new(()),
        };
        match doc {
            Some(doc) => *kb.doc.lock() = doc,
            None => kb.save(&KnowledgeDoc::default())?,
        }
        info!(path = %kb.path.display(), entries = kb.len(), "knowledge base ready");
        Ok(kb)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, doc: &KnowledgeDoc) -> Result<(), KnowledgeError> {
        let json = serde_json::to_string_pretty(doc)?;
        fs::write(&self.path, json).map_err(|source| KnowledgeError::Io { path: self.path.clone(), source })
    }

    /// Appends one applied fix and rewrites the document.
    /// Writers are serialized; the cache lock is never held across the write.
    pub async fn record(&self, app: &str, faulty: &str, fixed: &str) -> Result<KnowledgeEntry, KnowledgeError> {
        let now = OffsetDateTime::now_utc();
        let entry = KnowledgeEntry {
            id: Uuid::new_v4().to_string(),
            app: app.to_string(),
            faulty_code: faulty.to_string(),
            fixed_code: fixed.to_string(),
            timestamp: now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string()),
        };

        let _writing = self.writer.lock().await;
        let json = {
            let mut doc = self.doc.lock();
            doc.entries.push(entry.clone());
            serde_json::to_string_pretty(&*doc)
        };
        let written = match json {
            Ok(json) => tokio::fs::write(&self.path, json)
                .await
                .map_err(|source| KnowledgeError::Io { path: self.path.clone(), source }),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            self.doc.lock().entries.retain(|kept| kept.id != entry.id);
            return Err(e);
        }
        Ok(entry)
    }

    pub fn entries(&self) -> Vec<KnowledgeEntry> {
        self.doc.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.doc.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        let kb = KnowledgeBase::open(&path).unwrap();
        assert!(kb.is_empty());
        let on_disk: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, serde_json::json!({"entries": []}));
    }

    #[test]
    fn test_corrupt_file_is_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        fs::write(&path, "{not json").unwrap();
        let kb = KnowledgeBase::open(&path).unwrap();
        assert!(kb.is_empty());
        assert!(serde_json::from_str::<serde_json::Value>(&fs::read_to_string(&path).unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_record_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");

        let kb = KnowledgeBase::open(&path).unwrap();
        let entry = kb.record("worker-A", "print(1/0)\n", "print(0)\n").await.unwrap();
        assert_eq!(entry.app, "worker-A");
        assert!(OffsetDateTime::parse(&entry.timestamp, &Rfc3339).is_ok());
        drop(kb);

        let reopened = KnowledgeBase::open(&path).unwrap();
        assert_eq!(reopened.entries(), vec![entry]);
    }

    #[tokio::test]
    async fn test_concurrent_records_all_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        let kb = std::sync::Arc::new(KnowledgeBase::open(&path).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let kb = kb.clone();
                tokio::spawn(async move { kb.record(&format!("worker-{i}"), "a\n", "b\n").await.unwrap() })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(kb.len(), 8);
        let reopened = KnowledgeBase::open(&path).unwrap();
        assert_eq!(reopened.len(), 8);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        let kb = KnowledgeBase::open(nested.join("kb.json")).unwrap();
        fs::remove_dir_all(&nested).unwrap();

        let err = kb.record("worker-A", "a\n", "b\n").await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Io { .. }), "{err}");
        assert!(kb.is_empty());
    }
}
