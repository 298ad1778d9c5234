//! Directory-watch ingestion source
//!
//! Polls a directory for recorder output. A file is only picked up once
//! its size is unchanged between two consecutive polls, so half-written
//! recordings are never ingested. Ingested files are deleted (or moved
//! to `processed/`); files the gateway rejects are moved to
//! `quarantine/` for operator inspection.

use crate::gateway::Gateway;
use crate::sources::SourcePayload;
use callrelay_core::{config::DirwatchConfig, utils::sanitize_filename, Error};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const QUARANTINE_DIR: &str = "quarantine";
const PROCESSED_DIR: &str = "processed";

/// One polled directory bound to a System
#[derive(Debug)]
pub struct DirwatchSource {
    config: DirwatchConfig,
    gateway: Arc<Gateway>,
    // file size observed on the previous poll, keyed by path
    sizes: HashMap<PathBuf, u64>,
}

impl DirwatchSource {
    /// Create a source for one watched directory
    #[must_use]
    pub fn new(config: DirwatchConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            config,
            gateway,
            sizes: HashMap::new(),
        }
    }

    /// Spawn the poll loop; it stops when the shutdown signal flips to true
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            system = self.config.system,
            path = %self.config.path.display(),
            poll_interval_ms = self.config.poll_interval_ms,
            "directory watch started"
        );

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => self.scan().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            system = self.config.system,
            path = %self.config.path.display(),
            "directory watch stopped"
        );
    }

    /// One poll pass: note new file sizes, ingest files that went stable
    pub async fn scan(&mut self) {
        let mut entries = match tokio::fs::read_dir(&self.config.path).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    path = %self.config.path.display(),
                    error = %e,
                    "watched directory unreadable"
                );
                return;
            }
        };

        let mut present: Vec<(PathBuf, u64)> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() || is_hidden(&path) {
                continue;
            }
            present.push((path, metadata.len()));
        }

        // Forget files that vanished between polls.
        self.sizes
            .retain(|path, _| present.iter().any(|(p, _)| p == path));

        for (path, size) in present {
            match self.sizes.get(&path) {
                Some(&previous) if previous == size => {
                    self.sizes.remove(&path);
                    self.ingest_file(&path).await;
                }
                _ => {
                    self.sizes.insert(path, size);
                }
            }
        }
    }

    async fn ingest_file(&mut self, path: &Path) {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);
        let Some(filename) = filename else {
            self.quarantine(path, "filename is not valid UTF-8").await;
            return;
        };

        let audio = match tokio::fs::read(path).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "watched file unreadable");
                return;
            }
        };

        let payload = SourcePayload::Dirwatch {
            system: self.config.system,
            filename: filename.clone(),
            audio,
        };

        match self.gateway.submit(payload).await {
            Ok(persisted) => {
                if persisted.deduplicated {
                    tracing::debug!(
                        path = %path.display(),
                        call_id = %persisted.call.id,
                        "watched file was a duplicate"
                    );
                }
                self.finish_file(path, &filename).await;
            }
            Err(e) if e.is_rejection() => {
                self.quarantine(path, &e.to_string()).await;
            }
            Err(e) => {
                // Transient failure; the file stays in place and is
                // retried once it goes stable again.
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "ingestion failed, will retry"
                );
            }
        }
    }

    async fn finish_file(&self, path: &Path, filename: &str) {
        let result = if self.config.keep_processed {
            self.move_into(path, PROCESSED_DIR, filename).await
        } else {
            tokio::fs::remove_file(path).await.map_err(Error::from)
        };

        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "could not clear ingested file");
        }
    }

    async fn quarantine(&self, path: &Path, reason: &str) {
        tracing::warn!(
            path = %path.display(),
            system = self.config.system,
            reason,
            "watched file quarantined"
        );

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or_else(|| "unnamed".to_string(), sanitize_filename);

        if let Err(e) = self.move_into(path, QUARANTINE_DIR, &filename).await {
            tracing::error!(path = %path.display(), error = %e, "quarantine move failed");
        }
    }

    async fn move_into(
        &self,
        path: &Path,
        subdir: &str,
        filename: &str,
    ) -> callrelay_core::Result<()> {
        let dir = self.config.path.join(subdir);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::rename(path, dir.join(filename)).await?;
        Ok(())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
mod tests {
    use super::*;
    use callrelay_archive::Archive;
    use callrelay_core::config::{ArchiveConfig, IngestConfig, StorageConfig};

    async fn source_in(dir: &tempfile::TempDir, keep_processed: bool) -> DirwatchSource {
        let storage = StorageConfig {
            base_dir: dir.path().join("store"),
            database_file: "dw.db".to_string(),
            max_connections: 4,
        };
        let archive = Archive::open(&storage, ArchiveConfig::default())
            .await
            .unwrap();
        let (gateway, _events) =
            Gateway::new(archive, IngestConfig::default(), dir.path().join("store"));

        let watch_dir = dir.path().join("watch");
        tokio::fs::create_dir_all(&watch_dir).await.unwrap();

        DirwatchSource::new(
            DirwatchConfig {
                system: 1,
                path: watch_dir,
                poll_interval_ms: 10,
                keep_processed,
            },
            Arc::new(gateway),
        )
    }

    #[tokio::test]
    async fn stable_file_is_ingested_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(&dir, false).await;
        let file = source.config.path.join("100-1700000000_4001.mp3");
        tokio::fs::write(&file, b"audio").await.unwrap();

        // First pass records the size, second pass sees it stable.
        source.scan().await;
        assert!(file.exists());
        source.scan().await;
        assert!(!file.exists());

        let count = source.gateway.archive().count_calls(1).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn growing_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(&dir, false).await;
        let file = source.config.path.join("100-1700000000_4001.mp3");

        tokio::fs::write(&file, b"par").await.unwrap();
        source.scan().await;
        tokio::fs::write(&file, b"partial-more").await.unwrap();
        source.scan().await;

        // Size changed between polls, so nothing was ingested yet.
        assert!(file.exists());
        let count = source.gateway.archive().count_calls(1).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn keep_processed_moves_instead_of_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(&dir, true).await;
        let file = source.config.path.join("100-1700000000_4001.mp3");
        tokio::fs::write(&file, b"audio").await.unwrap();

        source.scan().await;
        source.scan().await;

        assert!(!file.exists());
        assert!(source
            .config
            .path
            .join("processed/100-1700000000_4001.mp3")
            .exists());
    }

    #[tokio::test]
    async fn malformed_filename_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(&dir, false).await;
        let file = source.config.path.join("not-a-valid-name.mp3");
        tokio::fs::write(&file, b"audio").await.unwrap();

        source.scan().await;
        source.scan().await;

        assert!(!file.exists());
        assert!(source
            .config
            .path
            .join("quarantine/not-a-valid-name.mp3")
            .exists());

        let count = source.gateway.archive().count_calls(1).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn hidden_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(&dir, false).await;
        let file = source.config.path.join(".partial-download");
        tokio::fs::write(&file, b"x").await.unwrap();

        source.scan().await;
        source.scan().await;
        source.scan().await;

        assert!(file.exists());
    }
}
