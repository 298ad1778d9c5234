//! Core data types for the callrelay engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// System identifier type
pub type SystemId = i64;

/// Talkgroup identifier type (unique within a System)
pub type TalkgroupId = i64;

/// Transmitting radio identifier type
pub type UnitId = i64;

/// Retention policy applied per System during pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionPolicy {
    /// Delete calls older than this many days
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,

    /// Keep at most this many calls, newest first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
}

impl RetentionPolicy {
    /// A policy that never deletes anything
    #[must_use]
    pub const fn keep_all() -> Self {
        Self {
            max_age_days: None,
            max_count: None,
        }
    }

    /// Whether this policy never deletes anything
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.max_age_days.is_none() && self.max_count.is_none()
    }
}

/// A logical radio network grouping Talkgroups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    /// System identifier
    pub id: SystemId,

    /// Human-readable label
    pub label: String,

    /// Retention policy for this System's calls
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Whether the System was auto-discovered from an ingested call
    #[serde(default)]
    pub auto_provisioned: bool,
}

/// A channel within a System
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Talkgroup {
    /// Owning system
    pub system: SystemId,

    /// Talkgroup identifier, unique within the System
    pub id: TalkgroupId,

    /// Human-readable label
    pub label: String,

    /// Free-form tag (e.g. "Fire Dispatch")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A transmitting radio, referenced (not owned) by Calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    /// Owning system
    pub system: SystemId,

    /// Unit identifier
    pub id: UnitId,

    /// Human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// The closed set of ingestion source encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    /// Direct upload in the canonical submission schema
    Upload,
    /// Third-party trunk-recorder upload format
    TrunkRecorder,
    /// Filesystem directory polling
    Dirwatch,
}

impl std::fmt::Display for IngestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::TrunkRecorder => write!(f, "trunk_recorder"),
            Self::Dirwatch => write!(f, "dirwatch"),
        }
    }
}

impl std::str::FromStr for IngestSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "trunk_recorder" => Ok(Self::TrunkRecorder),
            "dirwatch" => Ok(Self::Dirwatch),
            other => Err(crate::Error::validation(
                "source",
                format!("unknown ingest source tag: {other}"),
            )),
        }
    }
}

/// An immutable archived transmission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Generated archive id
    pub id: Uuid,

    /// Owning system
    pub system: SystemId,

    /// Talkgroup the transmission was tagged to
    pub talkgroup: TalkgroupId,

    /// Transmitting units heard on the call
    pub units: Vec<UnitId>,

    /// Transmission start time
    pub start: DateTime<Utc>,

    /// Duration in seconds
    pub duration_secs: f64,

    /// Audio payload reference, relative to the storage base directory
    pub audio_ref: String,

    /// Audio codec tag (e.g. "mp3", "wav")
    pub audio_format: String,

    /// Which source encoding the call arrived through
    pub source: IngestSource,

    /// When the call was archived
    pub archived_at: DateTime<Utc>,
}

/// A normalized call ready for archival, produced by the Ingestion Gateway
#[derive(Debug, Clone)]
pub struct NewCall {
    /// Owning system
    pub system: SystemId,

    /// Talkgroup the transmission was tagged to
    pub talkgroup: TalkgroupId,

    /// Transmitting units heard on the call
    pub units: Vec<UnitId>,

    /// Transmission start time
    pub start: DateTime<Utc>,

    /// Duration in seconds
    pub duration_secs: f64,

    /// Audio payload reference, relative to the storage base directory
    pub audio_ref: String,

    /// Audio codec tag
    pub audio_format: String,

    /// Which source encoding the call arrived through
    pub source: IngestSource,
}

/// The notification streamed to live listeners on `CallArrived`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallNotice {
    /// Archive id
    pub id: Uuid,

    /// Owning system
    pub system: SystemId,

    /// Talkgroup
    pub talkgroup: TalkgroupId,

    /// Transmission start time
    pub start: DateTime<Utc>,

    /// Duration in seconds
    pub duration_secs: f64,

    /// Audio payload reference
    pub audio_ref: String,
}

impl From<&Call> for CallNotice {
    fn from(call: &Call) -> Self {
        Self {
            id: call.id,
            system: call.system,
            talkgroup: call.talkgroup,
            start: call.start,
            duration_secs: call.duration_secs,
            audio_ref: call.audio_ref.clone(),
        }
    }
}

/// Wire representation for scopes: `"*"` or an explicit id list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ScopeRepr {
    Wildcard(String),
    List(Vec<i64>),
}

/// Talkgroup scope within a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScopeRepr", into = "ScopeRepr")]
pub enum TalkgroupScope {
    /// Every talkgroup of the granted System
    All,
    /// Only the listed talkgroups
    List(Vec<TalkgroupId>),
}

impl TalkgroupScope {
    /// Whether the scope covers the given talkgroup
    #[must_use]
    pub fn covers(&self, talkgroup: TalkgroupId) -> bool {
        match self {
            Self::All => true,
            Self::List(ids) => ids.contains(&talkgroup),
        }
    }
}

impl TryFrom<ScopeRepr> for TalkgroupScope {
    type Error = String;

    fn try_from(repr: ScopeRepr) -> Result<Self, Self::Error> {
        match repr {
            ScopeRepr::Wildcard(s) if s == "*" => Ok(Self::All),
            ScopeRepr::Wildcard(s) => Err(format!("invalid scope wildcard: {s:?}")),
            ScopeRepr::List(ids) => Ok(Self::List(ids)),
        }
    }
}

impl From<TalkgroupScope> for ScopeRepr {
    fn from(scope: TalkgroupScope) -> Self {
        match scope {
            TalkgroupScope::All => Self::Wildcard("*".to_string()),
            TalkgroupScope::List(ids) => Self::List(ids),
        }
    }
}

/// System scope of an `ApiKey`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScopeRepr", into = "ScopeRepr")]
pub enum SystemScope {
    /// Every System
    All,
    /// Only the listed Systems
    List(Vec<SystemId>),
}

impl SystemScope {
    /// Whether the scope covers the given system
    #[must_use]
    pub fn covers(&self, system: SystemId) -> bool {
        match self {
            Self::All => true,
            Self::List(ids) => ids.contains(&system),
        }
    }
}

impl TryFrom<ScopeRepr> for SystemScope {
    type Error = String;

    fn try_from(repr: ScopeRepr) -> Result<Self, Self::Error> {
        match repr {
            ScopeRepr::Wildcard(s) if s == "*" => Ok(Self::All),
            ScopeRepr::Wildcard(s) => Err(format!("invalid scope wildcard: {s:?}")),
            ScopeRepr::List(ids) => Ok(Self::List(ids)),
        }
    }
}

impl From<SystemScope> for ScopeRepr {
    fn from(scope: SystemScope) -> Self {
        match scope {
            SystemScope::All => Self::Wildcard("*".to_string()),
            SystemScope::List(ids) => Self::List(ids),
        }
    }
}

/// One (System, Talkgroup-scope) grant inside an `AccessCode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Granted system
    pub system: SystemId,

    /// Talkgroups covered within the system
    pub talkgroups: TalkgroupScope,
}

impl Grant {
    /// Whether the grant covers the given (system, talkgroup) pair
    #[must_use]
    pub fn matches(&self, system: SystemId, talkgroup: TalkgroupId) -> bool {
        self.system == system && self.talkgroups.covers(talkgroup)
    }
}

/// Read credential: defines what a live Client or downstream peer may receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCode {
    /// Stable identifier for logging and admin listings
    pub ident: String,

    /// The secret presented by the listener
    pub code: String,

    /// Grant set; empty means deny everything
    pub grants: Vec<Grant>,
}

/// Write credential: authorizes ingestion for specific Systems
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// Stable identifier for logging and admin listings
    pub ident: String,

    /// The secret presented by the ingestion source
    pub key: String,

    /// Systems this key may ingest into
    pub systems: SystemScope,

    /// A disabled key is rejected regardless of scope
    #[serde(default)]
    pub disabled: bool,

    /// Optional expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Whether the key has expired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at < Utc::now())
    }

    /// Whether the key may ingest into the given system
    #[must_use]
    pub fn allows_system(&self, system: SystemId) -> bool {
        !self.disabled && !self.is_expired() && self.systems.covers(system)
    }
}

/// A peer instance receiving a filtered copy of calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamTarget {
    /// Stable identifier for logging and operator status
    pub ident: String,

    /// Peer ingestion endpoint
    pub url: String,

    /// Credential presented to the peer's Ingestion Gateway
    pub api_key: String,

    /// Access filter; empty means relay nothing
    pub grants: Vec<Grant>,
}

/// Ingestion submission schema, shared with the downstream relay wire contract
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CallSubmission {
    /// Target system
    #[validate(range(min = 1))]
    pub system: SystemId,

    /// Talkgroup the transmission was tagged to
    #[validate(range(min = 1))]
    pub talkgroup: TalkgroupId,

    /// Transmitting units heard on the call
    #[serde(default)]
    pub unit_ids: Vec<UnitId>,

    /// Transmission start, unix seconds
    pub start: i64,

    /// Duration in seconds
    #[validate(range(min = 0.0))]
    pub duration: f64,

    /// Raw audio payload
    pub audio: Vec<u8>,

    /// Audio codec tag
    #[validate(length(min = 1, max = 16))]
    pub audio_format: String,

    /// Ingestion credential
    #[validate(length(min = 1))]
    pub api_key: String,
}
