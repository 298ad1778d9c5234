//! Database row models for the archive store

use callrelay_core::{
    AccessCode, ApiKey, Call, DownstreamTarget, Error, Grant, Result, RetentionPolicy, System,
    Talkgroup, Unit,
};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::FromRow;
use uuid::Uuid;

fn from_millis(ms: i64, column: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::storage(format!("{column}: timestamp out of range: {ms}")))
}

/// Database row for an archived call
#[derive(Debug, Clone, FromRow)]
pub struct CallDb {
    /// Archive id
    pub id: Uuid,

    /// Owning system
    pub system: i64,

    /// Talkgroup
    pub talkgroup: i64,

    /// Unit id list, JSON-encoded
    pub units: String,

    /// Transmission start, unix milliseconds
    pub start_ms: i64,

    /// Duration in seconds
    pub duration_secs: f64,

    /// Audio payload reference
    pub audio_ref: String,

    /// Audio codec tag
    pub audio_format: String,

    /// Ingestion source tag
    pub source: String,

    /// Archival time, unix milliseconds
    pub archived_at_ms: i64,
}

impl CallDb {
    /// Convert the row into the domain `Call`
    ///
    /// # Errors
    ///
    /// Returns a storage error if a column holds an unparseable value.
    pub fn into_call(self) -> Result<Call> {
        let units: Vec<i64> = serde_json::from_str(&self.units)
            .map_err(|e| Error::storage(format!("units: invalid JSON: {e}")))?;
        let source = self
            .source
            .parse()
            .map_err(|_| Error::storage(format!("source: unknown tag: {}", self.source)))?;

        Ok(Call {
            id: self.id,
            system: self.system,
            talkgroup: self.talkgroup,
            units,
            start: from_millis(self.start_ms, "start_ms")?,
            duration_secs: self.duration_secs,
            audio_ref: self.audio_ref,
            audio_format: self.audio_format,
            source,
            archived_at: from_millis(self.archived_at_ms, "archived_at_ms")?,
        })
    }
}

/// Database row for a System
#[derive(Debug, Clone, FromRow)]
pub struct SystemDb {
    /// System id
    pub id: i64,

    /// Label
    pub label: String,

    /// Retention: maximum call age in days
    pub max_age_days: Option<i64>,

    /// Retention: maximum call count
    pub max_count: Option<i64>,

    /// Auto-discovered flag
    pub auto_provisioned: bool,
}

impl SystemDb {
    /// Convert the row into the domain `System`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn into_system(self) -> System {
        System {
            id: self.id,
            label: self.label,
            retention: RetentionPolicy {
                max_age_days: self.max_age_days.map(|v| v as u32),
                max_count: self.max_count.map(|v| v as u32),
            },
            auto_provisioned: self.auto_provisioned,
        }
    }
}

/// Database row for a Talkgroup
#[derive(Debug, Clone, FromRow)]
pub struct TalkgroupDb {
    /// Owning system
    pub system: i64,

    /// Talkgroup id
    pub id: i64,

    /// Label
    pub label: String,

    /// Free-form tag
    pub tag: Option<String>,
}

impl TalkgroupDb {
    /// Convert the row into the domain `Talkgroup`
    #[must_use]
    pub fn into_talkgroup(self) -> Talkgroup {
        Talkgroup {
            system: self.system,
            id: self.id,
            label: self.label,
            tag: self.tag,
        }
    }
}

/// Database row for a Unit
#[derive(Debug, Clone, FromRow)]
pub struct UnitDb {
    /// Owning system
    pub system: i64,

    /// Unit id
    pub id: i64,

    /// Label
    pub label: Option<String>,
}

impl UnitDb {
    /// Convert the row into the domain `Unit`
    #[must_use]
    pub fn into_unit(self) -> Unit {
        Unit {
            system: self.system,
            id: self.id,
            label: self.label,
        }
    }
}

/// Database row for an `ApiKey`
#[derive(Debug, Clone, FromRow)]
pub struct ApiKeyDb {
    /// Stable identifier
    pub ident: String,

    /// Secret
    pub key: String,

    /// System scope, JSON-encoded
    pub systems: String,

    /// Disabled flag
    pub disabled: bool,

    /// Expiry, unix milliseconds
    pub expires_at_ms: Option<i64>,
}

impl ApiKeyDb {
    /// Convert the row into the domain `ApiKey`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scope column is unparseable.
    pub fn into_api_key(self) -> Result<ApiKey> {
        let systems = serde_json::from_str(&self.systems)
            .map_err(|e| Error::storage(format!("systems: invalid scope: {e}")))?;
        let expires_at = self
            .expires_at_ms
            .map(|ms| from_millis(ms, "expires_at_ms"))
            .transpose()?;

        Ok(ApiKey {
            ident: self.ident,
            key: self.key,
            systems,
            disabled: self.disabled,
            expires_at,
        })
    }
}

/// Database row for an `AccessCode`
#[derive(Debug, Clone, FromRow)]
pub struct AccessCodeDb {
    /// Stable identifier
    pub ident: String,

    /// Secret
    pub code: String,

    /// Grant set, JSON-encoded
    pub grants: String,
}

impl AccessCodeDb {
    /// Convert the row into the domain `AccessCode`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the grants column is unparseable.
    pub fn into_access_code(self) -> Result<AccessCode> {
        let grants: Vec<Grant> = serde_json::from_str(&self.grants)
            .map_err(|e| Error::storage(format!("grants: invalid JSON: {e}")))?;

        Ok(AccessCode {
            ident: self.ident,
            code: self.code,
            grants,
        })
    }
}

/// Database row for a `DownstreamTarget`
#[derive(Debug, Clone, FromRow)]
pub struct DownstreamTargetDb {
    /// Stable identifier
    pub ident: String,

    /// Peer ingestion endpoint
    pub url: String,

    /// Credential presented to the peer
    pub api_key: String,

    /// Grant set, JSON-encoded
    pub grants: String,
}

impl DownstreamTargetDb {
    /// Convert the row into the domain `DownstreamTarget`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the grants column is unparseable.
    pub fn into_target(self) -> Result<DownstreamTarget> {
        let grants: Vec<Grant> = serde_json::from_str(&self.grants)
            .map_err(|e| Error::storage(format!("grants: invalid JSON: {e}")))?;

        Ok(DownstreamTarget {
            ident: self.ident,
            url: self.url,
            api_key: self.api_key,
            grants,
        })
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc, clippy::float_cmp, clippy::unwrap_used)]
mod tests {
    use super::*;
    use callrelay_core::IngestSource;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_call_db_conversion() {
        let row = CallDb {
            id: Uuid::new_v4(),
            system: 1,
            talkgroup: 100,
            units: "[4001,4002]".to_string(),
            start_ms: 1_700_000_000_000,
            duration_secs: 4.5,
            audio_ref: "2023/11/14/a.mp3".to_string(),
            audio_format: "mp3".to_string(),
            source: "dirwatch".to_string(),
            archived_at_ms: 1_700_000_001_000,
        };

        let call = row.into_call().unwrap();
        assert_eq!(call.units, vec![4001, 4002]);
        assert_eq!(call.start.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(call.source, IngestSource::Dirwatch);
        assert_eq!(call.duration_secs, 4.5);
    }

    #[test]
    fn test_call_db_rejects_bad_units() {
        let row = CallDb {
            id: Uuid::new_v4(),
            system: 1,
            talkgroup: 100,
            units: "not json".to_string(),
            start_ms: 0,
            duration_secs: 0.0,
            audio_ref: String::new(),
            audio_format: "mp3".to_string(),
            source: "upload".to_string(),
            archived_at_ms: 0,
        };
        assert!(row.into_call().is_err());
    }

    #[test]
    fn test_system_db_conversion() {
        let row = SystemDb {
            id: 7,
            label: "Metro".to_string(),
            max_age_days: Some(30),
            max_count: None,
            auto_provisioned: false,
        };

        let system = row.into_system();
        assert_eq!(system.retention.max_age_days, Some(30));
        assert_eq!(system.retention.max_count, None);
        assert!(!system.retention.is_unbounded());
    }

    #[test]
    fn test_access_code_db_conversion() {
        let row = AccessCodeDb {
            ident: "listener-1".to_string(),
            code: "s3cret".to_string(),
            grants: r#"[{"system":1,"talkgroups":"*"}]"#.to_string(),
        };

        let code = row.into_access_code().unwrap();
        assert_eq!(code.grants.len(), 1);
        assert!(code.grants[0].matches(1, 42));
    }

    #[test]
    fn test_api_key_db_conversion() {
        let row = ApiKeyDb {
            ident: "recorder".to_string(),
            key: "k".to_string(),
            systems: "[1,2]".to_string(),
            disabled: false,
            expires_at_ms: None,
        };

        let key = row.into_api_key().unwrap();
        assert!(key.allows_system(2));
        assert!(!key.allows_system(3));
    }
}
