//! Archive store operations: persist, lookup, search, prune, and the
//! configuration entity loaders

use crate::models::{
    AccessCodeDb, ApiKeyDb, CallDb, DownstreamTargetDb, SystemDb, TalkgroupDb, UnitDb,
};
use crate::Archive;
use callrelay_core::{
    AccessCode, ApiKey, Call, DownstreamTarget, Error, NewCall, Result, System, Talkgroup, Unit,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

/// Outcome of a persist operation
#[derive(Debug, Clone)]
pub struct Persisted {
    /// The archived call; on a dedup hit this is the existing record
    pub call: Call,

    /// Whether the submission collapsed onto an existing record
    pub deduplicated: bool,
}

/// Search filter for archived calls
#[derive(Debug, Clone, Default)]
pub struct CallFilter {
    /// Restrict to one system
    pub system: Option<i64>,

    /// Restrict to one talkgroup
    pub talkgroup: Option<i64>,

    /// Calls starting at or after this time
    pub from: Option<chrono::DateTime<Utc>>,

    /// Calls starting before this time
    pub to: Option<chrono::DateTime<Utc>>,

    /// Page size
    pub limit: u32,
}

/// Restartable keyset cursor over `(start, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCursor {
    /// Start time of the last seen call, unix milliseconds
    pub start_ms: i64,

    /// Archive id of the last seen call
    pub id: Uuid,
}

/// One page of a search; `next` is `None` once the sequence is exhausted
#[derive(Debug, Clone)]
pub struct CallPage {
    /// Calls in archive insertion order
    pub calls: Vec<Call>,

    /// Cursor to resume from, if more rows may exist
    pub next: Option<CallCursor>,
}

/// Outcome of a prune pass over one System
#[derive(Debug, Clone, Default)]
pub struct PruneOutcome {
    /// Number of call records deleted
    pub deleted: u64,

    /// Audio references of the deleted records, for payload cleanup
    pub audio_refs: Vec<String>,
}

const CALL_COLUMNS: &str = "id, system, talkgroup, units, start_ms, duration_secs, \
     audio_ref, audio_format, source, archived_at_ms";

impl Archive {
    /// Transactionally persist a normalized call
    ///
    /// The dedup check, entity auto-provisioning and the insert commit
    /// atomically. A submission matching an archived call on
    /// (system, talkgroup, duration) with a start within the dedup window
    /// returns the existing record with `deduplicated = true`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSystem` if the call references a System that does
    /// not exist and auto-provisioning is off, or a storage error if the
    /// database rejects the transaction.
    pub async fn persist(&self, new: &NewCall) -> Result<Persisted> {
        let units_json =
            serde_json::to_string(&new.units).map_err(|e| Error::storage(e.to_string()))?;
        let start_ms = new.start.timestamp_millis();

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        if let Some(existing) = self.find_duplicate(&mut tx, new, start_ms).await? {
            drop(tx);
            tracing::debug!(
                call_id = %existing.id,
                system = new.system,
                talkgroup = new.talkgroup,
                "duplicate submission collapsed onto existing record"
            );
            return Ok(Persisted {
                call: existing,
                deduplicated: true,
            });
        }

        self.provision_entities(&mut tx, new).await?;

        let id = Uuid::new_v4();
        let archived_at = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO calls (id, system, talkgroup, units, start_ms, duration_secs, \
             audio_ref, audio_format, source, archived_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(new.system)
        .bind(new.talkgroup)
        .bind(&units_json)
        .bind(start_ms)
        .bind(new.duration_secs)
        .bind(&new.audio_ref)
        .bind(&new.audio_format)
        .bind(new.source.to_string())
        .bind(archived_at.timestamp_millis())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(|e| Error::storage(e.to_string()))?;
                Ok(Persisted {
                    call: Call {
                        id,
                        system: new.system,
                        talkgroup: new.talkgroup,
                        units: new.units.clone(),
                        start: new.start,
                        duration_secs: new.duration_secs,
                        audio_ref: new.audio_ref.clone(),
                        audio_format: new.audio_format.clone(),
                        source: new.source,
                        archived_at,
                    },
                    deduplicated: false,
                })
            }
            // Lost a race against a concurrent writer inserting the exact
            // same tuple; surface the winner as a dedup hit.
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                let existing = sqlx::query_as::<_, CallDb>(&format!(
                    "SELECT {CALL_COLUMNS} FROM calls \
                     WHERE system = ? AND talkgroup = ? AND start_ms = ? AND duration_secs = ?"
                ))
                .bind(new.system)
                .bind(new.talkgroup)
                .bind(start_ms)
                .bind(new.duration_secs)
                .fetch_one(self.pool())
                .await
                .map_err(|e| Error::storage(e.to_string()))?;

                Ok(Persisted {
                    call: existing.into_call()?,
                    deduplicated: true,
                })
            }
            Err(e) => Err(Error::storage(e.to_string())),
        }
    }

    async fn find_duplicate(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        new: &NewCall,
        start_ms: i64,
    ) -> Result<Option<Call>> {
        #[allow(clippy::cast_possible_wrap)]
        let window_ms = (self.config().dedup_window_secs * 1000) as i64;

        let row = sqlx::query_as::<_, CallDb>(&format!(
            "SELECT {CALL_COLUMNS} FROM calls \
             WHERE system = ? AND talkgroup = ? AND duration_secs = ? \
             AND start_ms BETWEEN ? AND ? LIMIT 1"
        ))
        .bind(new.system)
        .bind(new.talkgroup)
        .bind(new.duration_secs)
        .bind(start_ms - window_ms)
        .bind(start_ms + window_ms)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| Error::storage(e.to_string()))?;

        row.map(CallDb::into_call).transpose()
    }

    async fn provision_entities(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        new: &NewCall,
    ) -> Result<()> {
        let known: Option<i64> = sqlx::query_scalar("SELECT id FROM systems WHERE id = ?")
            .bind(new.system)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        if known.is_none() {
            if !self.config().auto_provision {
                return Err(Error::UnknownSystem { system: new.system });
            }
            sqlx::query(
                "INSERT INTO systems (id, label, auto_provisioned) VALUES (?, ?, 1)",
            )
            .bind(new.system)
            .bind(format!("System {}", new.system))
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

            tracing::info!(system = new.system, "auto-provisioned system");
        }

        sqlx::query(
            "INSERT OR IGNORE INTO talkgroups (system, id, label) VALUES (?, ?, ?)",
        )
        .bind(new.system)
        .bind(new.talkgroup)
        .bind(format!("Talkgroup {}", new.talkgroup))
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::storage(e.to_string()))?;

        for unit in &new.units {
            sqlx::query("INSERT OR IGNORE INTO units (system, id) VALUES (?, ?)")
                .bind(new.system)
                .bind(unit)
                .execute(&mut **tx)
                .await
                .map_err(|e| Error::storage(e.to_string()))?;
        }

        Ok(())
    }

    /// Look up an archived call by id
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<Call>> {
        let row = sqlx::query_as::<_, CallDb>(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;

        row.map(CallDb::into_call).transpose()
    }

    /// Search the archive; lazy, finite and restartable via the returned cursor
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn search(
        &self,
        filter: &CallFilter,
        cursor: Option<CallCursor>,
    ) -> Result<CallPage> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE 1=1"
        ));

        if let Some(system) = filter.system {
            qb.push(" AND system = ").push_bind(system);
        }
        if let Some(talkgroup) = filter.talkgroup {
            qb.push(" AND talkgroup = ").push_bind(talkgroup);
        }
        if let Some(from) = filter.from {
            qb.push(" AND start_ms >= ").push_bind(from.timestamp_millis());
        }
        if let Some(to) = filter.to {
            qb.push(" AND start_ms < ").push_bind(to.timestamp_millis());
        }
        if let Some(cursor) = cursor {
            qb.push(" AND (start_ms > ")
                .push_bind(cursor.start_ms)
                .push(" OR (start_ms = ")
                .push_bind(cursor.start_ms)
                .push(" AND id > ")
                .push_bind(cursor.id)
                .push("))");
        }
        qb.push(" ORDER BY start_ms ASC, id ASC LIMIT ")
            .push_bind(i64::from(limit));

        let rows: Vec<CallDb> = qb
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        let next = if rows.len() == limit as usize {
            rows.last().map(|last| CallCursor {
                start_ms: last.start_ms,
                id: last.id,
            })
        } else {
            None
        };

        let calls = rows
            .into_iter()
            .map(CallDb::into_call)
            .collect::<Result<Vec<_>>>()?;

        Ok(CallPage { calls, next })
    }

    /// Apply a System's retention policy
    ///
    /// Each policy is one short `DELETE .. RETURNING` statement, so the
    /// deleted rows and their audio references are captured atomically
    /// and concurrent inserts are never blocked behind a long exclusive
    /// lock.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn prune(&self, system: &System) -> Result<PruneOutcome> {
        let mut outcome = PruneOutcome::default();
        if system.retention.is_unbounded() {
            return Ok(outcome);
        }

        if let Some(max_age_days) = system.retention.max_age_days {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));

            let refs: Vec<String> = sqlx::query_scalar(
                "DELETE FROM calls WHERE system = ? AND start_ms < ? RETURNING audio_ref",
            )
            .bind(system.id)
            .bind(cutoff.timestamp_millis())
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

            outcome.deleted += refs.len() as u64;
            outcome.audio_refs.extend(refs);
        }

        if let Some(max_count) = system.retention.max_count {
            let refs: Vec<String> = sqlx::query_scalar(
                "DELETE FROM calls WHERE system = ?1 AND id NOT IN \
                 (SELECT id FROM calls WHERE system = ?1 \
                  ORDER BY start_ms DESC, id DESC LIMIT ?2) \
                 RETURNING audio_ref",
            )
            .bind(system.id)
            .bind(i64::from(max_count))
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

            outcome.deleted += refs.len() as u64;
            outcome.audio_refs.extend(refs);
        }

        if outcome.deleted > 0 {
            tracing::info!(
                system = system.id,
                deleted = outcome.deleted,
                "pruned archived calls"
            );
        }

        Ok(outcome)
    }

    /// Count archived calls for one System
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn count_calls(&self, system: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM calls WHERE system = ?")
            .bind(system)
            .fetch_one(self.pool())
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        Ok(row.get("count"))
    }

    // --- configuration entities ---

    /// Insert or update a System
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn upsert_system(&self, system: &System) -> Result<()> {
        sqlx::query(
            "INSERT INTO systems (id, label, max_age_days, max_count, auto_provisioned) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET label = excluded.label, \
             max_age_days = excluded.max_age_days, max_count = excluded.max_count, \
             auto_provisioned = excluded.auto_provisioned",
        )
        .bind(system.id)
        .bind(&system.label)
        .bind(system.retention.max_age_days.map(i64::from))
        .bind(system.retention.max_count.map(i64::from))
        .bind(system.auto_provisioned)
        .execute(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(())
    }

    /// Look up one System
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn get_system(&self, id: i64) -> Result<Option<System>> {
        let row = sqlx::query_as::<_, SystemDb>(
            "SELECT id, label, max_age_days, max_count, auto_provisioned \
             FROM systems WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(row.map(SystemDb::into_system))
    }

    /// List all Systems
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn list_systems(&self) -> Result<Vec<System>> {
        let rows = sqlx::query_as::<_, SystemDb>(
            "SELECT id, label, max_age_days, max_count, auto_provisioned \
             FROM systems ORDER BY id",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(rows.into_iter().map(SystemDb::into_system).collect())
    }

    /// Insert or update a Talkgroup
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn upsert_talkgroup(&self, talkgroup: &Talkgroup) -> Result<()> {
        sqlx::query(
            "INSERT INTO talkgroups (system, id, label, tag) VALUES (?, ?, ?, ?) \
             ON CONFLICT(system, id) DO UPDATE SET label = excluded.label, tag = excluded.tag",
        )
        .bind(talkgroup.system)
        .bind(talkgroup.id)
        .bind(&talkgroup.label)
        .bind(&talkgroup.tag)
        .execute(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(())
    }

    /// List a System's Talkgroups
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn list_talkgroups(&self, system: i64) -> Result<Vec<Talkgroup>> {
        let rows = sqlx::query_as::<_, TalkgroupDb>(
            "SELECT system, id, label, tag FROM talkgroups WHERE system = ? ORDER BY id",
        )
        .bind(system)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(rows.into_iter().map(TalkgroupDb::into_talkgroup).collect())
    }

    /// List a System's Units
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn list_units(&self, system: i64) -> Result<Vec<Unit>> {
        let rows = sqlx::query_as::<_, UnitDb>(
            "SELECT system, id, label FROM units WHERE system = ? ORDER BY id",
        )
        .bind(system)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(rows.into_iter().map(UnitDb::into_unit).collect())
    }

    /// Insert or update an `ApiKey`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn upsert_api_key(&self, key: &ApiKey) -> Result<()> {
        let systems =
            serde_json::to_string(&key.systems).map_err(|e| Error::storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO api_keys (ident, key, systems, disabled, expires_at_ms) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(ident) DO UPDATE SET key = excluded.key, \
             systems = excluded.systems, disabled = excluded.disabled, \
             expires_at_ms = excluded.expires_at_ms",
        )
        .bind(&key.ident)
        .bind(&key.key)
        .bind(systems)
        .bind(key.disabled)
        .bind(key.expires_at.map(|at| at.timestamp_millis()))
        .execute(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(())
    }

    /// Look up an `ApiKey` by its secret
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn find_api_key(&self, key: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyDb>(
            "SELECT ident, key, systems, disabled, expires_at_ms FROM api_keys WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        row.map(ApiKeyDb::into_api_key).transpose()
    }

    /// Insert or update an `AccessCode`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn upsert_access_code(&self, code: &AccessCode) -> Result<()> {
        let grants =
            serde_json::to_string(&code.grants).map_err(|e| Error::storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO access_codes (ident, code, grants) VALUES (?, ?, ?) \
             ON CONFLICT(ident) DO UPDATE SET code = excluded.code, grants = excluded.grants",
        )
        .bind(&code.ident)
        .bind(&code.code)
        .bind(grants)
        .execute(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(())
    }

    /// Look up an `AccessCode` by its secret
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn find_access_code(&self, code: &str) -> Result<Option<AccessCode>> {
        let row = sqlx::query_as::<_, AccessCodeDb>(
            "SELECT ident, code, grants FROM access_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        row.map(AccessCodeDb::into_access_code).transpose()
    }

    /// Insert or update a `DownstreamTarget`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn upsert_downstream_target(&self, target: &DownstreamTarget) -> Result<()> {
        let grants =
            serde_json::to_string(&target.grants).map_err(|e| Error::storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO downstream_targets (ident, url, api_key, grants) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(ident) DO UPDATE SET url = excluded.url, \
             api_key = excluded.api_key, grants = excluded.grants",
        )
        .bind(&target.ident)
        .bind(&target.url)
        .bind(&target.api_key)
        .bind(grants)
        .execute(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(())
    }

    /// List all configured `DownstreamTargets`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database query fails.
    pub async fn list_downstream_targets(&self) -> Result<Vec<DownstreamTarget>> {
        let rows = sqlx::query_as::<_, DownstreamTargetDb>(
            "SELECT ident, url, api_key, grants FROM downstream_targets ORDER BY ident",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
        rows.into_iter()
            .map(DownstreamTargetDb::into_target)
            .collect()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}
