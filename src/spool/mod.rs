mod worker;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use worker::SpoolWorker;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("failed to read spool directory: {0}")]
    ReadDir(std::io::Error),
    #[error("failed to write spool entry: {0}")]
    Write(std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SpoolMeta {
    mail_from: String,
    rcpt_tos: Vec<String>,
}

/// A pending entry found on disk: its two sibling files and decoded
/// metadata, per §3's "Spool Entry".
pub struct SpoolEntry {
    pub stem: String,
    pub mail_from: String,
    pub rcpt_tos: Vec<String>,
    pub raw_bytes: Vec<u8>,
    eml_path: PathBuf,
    meta_path: PathBuf,
}

impl SpoolEntry {
    pub fn remove(&self) -> Result<(), SpoolError> {
        let _ = std::fs::remove_file(&self.eml_path);
        std::fs::remove_file(&self.meta_path).map_err(SpoolError::Write)
    }
}

/// Filesystem-backed store-and-forward queue for submissions the Upstream
/// Adapter could not deliver immediately (§4.6).
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(SpoolError::Write)?;
        Ok(Self { dir })
    }

    fn meta_entries(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(SpoolError::ReadDir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter(|path| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.ends_with(".meta"))
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    pub fn enqueue(
        &self,
        mail_from: &str,
        rcpt_tos: &[String],
        raw_bytes: &[u8],
    ) -> Result<(), SpoolError> {
        let index = self.meta_entries()?.len();
        let stem = format!("mail_{index:04}");

        let eml_path = self.dir.join(format!("{stem}.eml"));
        let meta_path = self.dir.join(format!("{stem}.meta.json"));

        std::fs::write(&eml_path, raw_bytes).map_err(SpoolError::Write)?;

        let meta = SpoolMeta {
            mail_from: mail_from.to_string(),
            rcpt_tos: rcpt_tos.to_vec(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| SpoolError::Write(std::io::Error::other(e)))?;
        std::fs::write(&meta_path, meta_bytes).map_err(SpoolError::Write)?;

        debug!("spooled undeliverable message as {stem}");
        Ok(())
    }

    /// Scans the spool in lexical (FIFO) order, dropping any `.meta.json`
    /// whose `.eml` sibling is missing (§3's corruption invariant).
    pub fn pending(&self) -> Result<Vec<SpoolEntry>, SpoolError> {
        let mut entries = Vec::new();

        for meta_path in self.meta_entries()? {
            let stem = meta_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.trim_end_matches(".meta.json").to_string())
                .unwrap_or_default();
            let eml_path = self.dir.join(format!("{stem}.eml"));

            if !eml_path.exists() {
                debug!("removing orphaned spool metadata {stem}");
                let _ = std::fs::remove_file(&meta_path);
                continue;
            }

            let meta_bytes = match std::fs::read(&meta_path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let meta: SpoolMeta = match serde_json::from_slice(&meta_bytes) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let raw_bytes = match std::fs::read(&eml_path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };

            entries.push(SpoolEntry {
                stem,
                mail_from: meta.mail_from,
                rcpt_tos: meta.rcpt_tos,
                raw_bytes,
                eml_path,
                meta_path,
            });
        }

        Ok(entries)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn enqueue_assigns_incrementing_stems() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path()).unwrap();

        spool.enqueue("a@x.test", &["b@y.test".into()], b"one").unwrap();
        spool.enqueue("a@x.test", &["b@y.test".into()], b"two").unwrap();

        let pending = spool.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].stem, "mail_0000");
        assert_eq!(pending[1].stem, "mail_0001");
    }

    #[test]
    fn orphaned_meta_without_eml_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("mail_0000.meta.json"),
            r#"{"mail_from":"a@x.test","rcpt_tos":[]}"#,
        )
        .unwrap();

        let pending = spool.pending().unwrap();
        assert!(pending.is_empty());
        assert!(!dir.path().join("mail_0000.meta.json").exists());
    }

    #[test]
    fn remove_deletes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path()).unwrap();
        spool.enqueue("a@x.test", &["b@y.test".into()], b"one").unwrap();

        let pending = spool.pending().unwrap();
        pending[0].remove().unwrap();

        assert!(spool.pending().unwrap().is_empty());
    }
}
