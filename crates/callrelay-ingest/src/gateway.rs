//! The ingestion gateway: authenticate, normalize, archive, announce

use crate::sources::{NormalizedCall, SourcePayload};
use callrelay_archive::{Archive, Persisted};
use callrelay_core::{
    config::IngestConfig,
    utils::{audio_storage_ref, format_allowed},
    Call, Error, NewCall, Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Announced for every newly archived (non-duplicate) call
#[derive(Debug, Clone)]
pub struct CallArrived {
    /// The archived call
    pub call: Call,

    /// The audio payload, shared between live fan-out and downstream relay
    pub audio: Arc<Vec<u8>>,
}

/// The single entry point for all call submissions
#[derive(Debug)]
pub struct Gateway {
    archive: Archive,
    config: IngestConfig,
    base_dir: PathBuf,
    events: mpsc::Sender<CallArrived>,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

impl Gateway {
    /// Create a gateway and the event stream of newly archived calls
    #[must_use]
    pub fn new(
        archive: Archive,
        config: IngestConfig,
        base_dir: impl Into<PathBuf>,
    ) -> (Self, mpsc::Receiver<CallArrived>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                archive,
                config,
                base_dir: base_dir.into(),
                events,
            },
            rx,
        )
    }

    /// Submit a call from any source
    ///
    /// Normalizes the payload, authenticates the writer, stores the audio,
    /// archives the call and, unless it collapsed onto an existing record,
    /// announces the arrival.
    ///
    /// The audio payload lands on disk before the archive transaction
    /// commits, so an archived row always has its payload; if archival
    /// fails or collapses onto an existing record, the fresh payload file
    /// is removed again.
    ///
    /// # Errors
    ///
    /// Rejections (`Validation`, `Auth`, `UnknownSystem`) mean the submitter
    /// must not retry; `Storage` and `Io` failures are transient.
    pub async fn submit(&self, payload: SourcePayload) -> Result<Persisted> {
        let normalized = payload.normalize()?;
        self.check_limits(&normalized)?;
        self.authenticate(&normalized).await?;

        let audio_ref = audio_storage_ref(&normalized.start, &normalized.audio_format);
        self.write_audio(&audio_ref, &normalized.audio).await?;

        let new = NewCall {
            system: normalized.system,
            talkgroup: normalized.talkgroup,
            units: normalized.units,
            start: normalized.start,
            duration_secs: normalized.duration_secs,
            audio_ref: audio_ref.clone(),
            audio_format: normalized.audio_format,
            source: normalized.source,
        };

        let persisted = match self.archive.persist(&new).await {
            Ok(persisted) => persisted,
            Err(e) => {
                self.discard_audio(&audio_ref).await;
                return Err(e);
            }
        };
        if persisted.deduplicated {
            // The existing record keeps its own payload.
            self.discard_audio(&audio_ref).await;
            tracing::debug!(
                call_id = %persisted.call.id,
                system = new.system,
                talkgroup = new.talkgroup,
                source = %new.source,
                "duplicate submission, not re-announced"
            );
            return Ok(persisted);
        }

        tracing::info!(
            call_id = %persisted.call.id,
            system = persisted.call.system,
            talkgroup = persisted.call.talkgroup,
            source = %persisted.call.source,
            duration_secs = persisted.call.duration_secs,
            "call archived"
        );

        let event = CallArrived {
            call: persisted.call.clone(),
            audio: Arc::new(normalized.audio),
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!("call event stream has no consumer");
        }

        Ok(persisted)
    }

    /// Absolute filesystem path for an audio reference
    #[must_use]
    pub fn audio_path(&self, audio_ref: &str) -> PathBuf {
        self.base_dir.join(audio_ref)
    }

    /// The archive this gateway writes into
    #[must_use]
    pub const fn archive(&self) -> &Archive {
        &self.archive
    }

    fn check_limits(&self, normalized: &NormalizedCall) -> Result<()> {
        if normalized.audio.is_empty() {
            return Err(Error::validation("audio", "empty payload"));
        }
        if normalized.audio.len() as u64 > self.config.max_audio_bytes {
            return Err(Error::validation(
                "audio",
                format!(
                    "payload of {} bytes exceeds limit of {}",
                    normalized.audio.len(),
                    self.config.max_audio_bytes
                ),
            ));
        }
        if !format_allowed(&normalized.audio_format, &self.config.allowed_formats) {
            return Err(Error::validation(
                "audio_format",
                format!("format not accepted: {}", normalized.audio_format),
            ));
        }
        Ok(())
    }

    async fn authenticate(&self, normalized: &NormalizedCall) -> Result<()> {
        // Local sources (dirwatch) carry no credential and are trusted.
        let Some(presented) = &normalized.api_key else {
            return Ok(());
        };

        let Some(key) = self.archive.find_api_key(presented).await? else {
            tracing::warn!(
                system = normalized.system,
                source = %normalized.source,
                "submission with unknown api key rejected"
            );
            return Err(Error::auth("unknown api key"));
        };

        if !key.allows_system(normalized.system) {
            tracing::warn!(
                key_ident = %key.ident,
                system = normalized.system,
                disabled = key.disabled,
                expired = key.is_expired(),
                "submission outside api key scope rejected"
            );
            return Err(Error::auth(format!(
                "api key {} may not ingest into system {}",
                key.ident, normalized.system
            )));
        }

        Ok(())
    }

    async fn write_audio(&self, audio_ref: &str, audio: &[u8]) -> Result<()> {
        let path = self.base_dir.join(audio_ref);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, audio).await?;
        Ok(())
    }

    async fn discard_audio(&self, audio_ref: &str) {
        let path = self.base_dir.join(audio_ref);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(audio_ref, error = %e, "could not remove unarchived payload");
        }
    }
}
