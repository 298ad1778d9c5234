//! Source payload shapes and their normalization into the canonical call form

use callrelay_core::{
    utils::parse_dirwatch_filename, CallSubmission, Error, IngestSource, Result, SystemId,
    UnitId,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A call submission in one of the accepted source encodings
#[derive(Debug, Clone)]
pub enum SourcePayload {
    /// Direct upload in the canonical submission schema
    Upload(CallSubmission),

    /// Trunk-recorder style upload: sidecar metadata plus raw audio
    TrunkRecorder(TrunkRecorderUpload),

    /// A file picked up from a watched directory; metadata lives in the
    /// filename, the System comes from the watch configuration
    Dirwatch {
        /// System the watched directory is bound to
        system: SystemId,

        /// Original filename, `<talkgroup>-<unixtime>_<unit>.<ext>`
        filename: String,

        /// Raw audio payload
        audio: Vec<u8>,
    },
}

/// Trunk-recorder sidecar metadata, the subset the engine consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkRecorderMeta {
    /// Talkgroup the transmission was tagged to
    pub talkgroup: i64,

    /// Transmission start, unix seconds
    pub start_time: i64,

    /// Duration in seconds
    pub call_length: f64,

    /// Transmitting sources heard on the call
    #[serde(default, rename = "srcList")]
    pub src_list: Vec<TrunkRecorderSrc>,
}

/// One entry of a trunk-recorder source list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkRecorderSrc {
    /// Transmitting unit id
    pub src: UnitId,
}

/// A trunk-recorder style upload
#[derive(Debug, Clone)]
pub struct TrunkRecorderUpload {
    /// Ingestion credential
    pub api_key: String,

    /// Target system
    pub system: SystemId,

    /// Sidecar metadata
    pub meta: TrunkRecorderMeta,

    /// Raw audio payload
    pub audio: Vec<u8>,

    /// Audio codec tag derived from the uploaded filename
    pub audio_format: String,
}

/// A source payload normalized into the canonical call shape, before
/// authentication and archival
#[derive(Debug, Clone)]
pub struct NormalizedCall {
    /// Target system
    pub system: SystemId,

    /// Talkgroup
    pub talkgroup: i64,

    /// Transmitting units, deduplicated, order preserved
    pub units: Vec<UnitId>,

    /// Transmission start time
    pub start: DateTime<Utc>,

    /// Duration in seconds
    pub duration_secs: f64,

    /// Raw audio payload
    pub audio: Vec<u8>,

    /// Audio codec tag, lowercase
    pub audio_format: String,

    /// Source encoding the payload arrived through
    pub source: IngestSource,

    /// Credential, absent for trusted local sources
    pub api_key: Option<String>,
}

impl SourcePayload {
    /// Normalize the payload into the canonical call shape
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed metadata; the caller
    /// rejects the submission without retry.
    pub fn normalize(self) -> Result<NormalizedCall> {
        match self {
            Self::Upload(submission) => normalize_upload(submission),
            Self::TrunkRecorder(upload) => normalize_trunk_recorder(upload),
            Self::Dirwatch {
                system,
                filename,
                audio,
            } => normalize_dirwatch(system, &filename, audio),
        }
    }
}

fn normalize_upload(submission: CallSubmission) -> Result<NormalizedCall> {
    submission.validate().map_err(|e| {
        let field = e
            .field_errors()
            .keys()
            .next()
            .map_or_else(|| "submission".to_string(), ToString::to_string);
        Error::validation(field, e.to_string())
    })?;

    let start = Utc
        .timestamp_opt(submission.start, 0)
        .single()
        .ok_or_else(|| Error::validation("start", "timestamp out of range"))?;

    Ok(NormalizedCall {
        system: submission.system,
        talkgroup: submission.talkgroup,
        units: dedup_units(submission.unit_ids),
        start,
        duration_secs: submission.duration,
        audio: submission.audio,
        audio_format: submission.audio_format.to_ascii_lowercase(),
        source: IngestSource::Upload,
        api_key: Some(submission.api_key),
    })
}

fn normalize_trunk_recorder(upload: TrunkRecorderUpload) -> Result<NormalizedCall> {
    if upload.system < 1 {
        return Err(Error::validation("system", "must be positive"));
    }
    if upload.meta.talkgroup < 1 {
        return Err(Error::validation("talkgroup", "must be positive"));
    }
    if upload.meta.call_length < 0.0 {
        return Err(Error::validation("call_length", "must not be negative"));
    }

    let start = Utc
        .timestamp_opt(upload.meta.start_time, 0)
        .single()
        .ok_or_else(|| Error::validation("start_time", "timestamp out of range"))?;

    let units = dedup_units(upload.meta.src_list.into_iter().map(|s| s.src).collect());

    Ok(NormalizedCall {
        system: upload.system,
        talkgroup: upload.meta.talkgroup,
        units,
        start,
        duration_secs: upload.meta.call_length,
        audio: upload.audio,
        audio_format: upload.audio_format.to_ascii_lowercase(),
        source: IngestSource::TrunkRecorder,
        api_key: Some(upload.api_key),
    })
}

fn normalize_dirwatch(system: SystemId, filename: &str, audio: Vec<u8>) -> Result<NormalizedCall> {
    let meta = parse_dirwatch_filename(filename)?;

    Ok(NormalizedCall {
        system,
        talkgroup: meta.talkgroup,
        units: vec![meta.unit],
        start: meta.start,
        duration_secs: 0.0,
        audio,
        audio_format: meta.format,
        source: IngestSource::Dirwatch,
        api_key: None,
    })
}

fn dedup_units(units: Vec<UnitId>) -> Vec<UnitId> {
    let mut seen = Vec::with_capacity(units.len());
    for unit in units {
        if !seen.contains(&unit) {
            seen.push(unit);
        }
    }
    seen
}
