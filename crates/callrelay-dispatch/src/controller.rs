//! Engine lifecycle: wiring, maintenance loops and shutdown

use crate::error::Result;
use crate::hub::{ClientHandle, Hub};
use crate::relay::{HttpTransport, RelayManager};
use callrelay_archive::Archive;
use callrelay_core::{config::Config, CallNotice, Error};
use callrelay_ingest::{dirwatch::DirwatchSource, CallArrived, Gateway};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Owns every component of a running engine
///
/// Startup order: archive, gateway, hub, relay workers, watched
/// directories, then the event pump that fans arrivals out to the hub
/// and the relay. Shutdown reverses it: sources stop first so no new
/// calls arrive while the relay drains within its grace period.
#[derive(Debug)]
pub struct Controller {
    archive: Archive,
    gateway: Arc<Gateway>,
    hub: Arc<Hub>,
    relay: Arc<RelayManager>,
    base_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Start the engine from its configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be opened or the relay
    /// transport cannot be built.
    pub async fn start(config: Config) -> Result<Self> {
        let archive = Archive::open(&config.storage, config.archive.clone()).await?;

        let (gateway, events) = Gateway::new(
            archive.clone(),
            config.ingest.clone(),
            config.storage.base_dir.clone(),
        );
        let gateway = Arc::new(gateway);

        let hub = Arc::new(Hub::new(config.hub.clone()));

        let transport =
            HttpTransport::new(Duration::from_secs(config.relay.send_timeout_secs))?;
        let relay = Arc::new(RelayManager::new(config.relay.clone(), Arc::new(transport)));
        for target in archive.list_downstream_targets().await? {
            relay.add_target(target);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for watch_config in config.ingest.dirwatch.clone() {
            let source = DirwatchSource::new(watch_config, Arc::clone(&gateway));
            tasks.push(source.spawn(shutdown_rx.clone()));
        }

        tasks.push(tokio::spawn(pump(
            events,
            Arc::clone(&hub),
            Arc::clone(&relay),
            shutdown_rx.clone(),
        )));

        tasks.push(hub.spawn_reaper(shutdown_rx.clone()));

        tasks.push(tokio::spawn(prune_loop(
            archive.clone(),
            config.storage.base_dir.clone(),
            config.archive.prune_interval_secs,
            shutdown_rx,
        )));

        tracing::info!(
            base_dir = %config.storage.base_dir.display(),
            dirwatch_sources = config.ingest.dirwatch.len(),
            relay_targets = relay.snapshot().len(),
            "engine started"
        );

        Ok(Self {
            archive,
            gateway,
            hub,
            relay,
            base_dir: config.storage.base_dir,
            shutdown,
            tasks,
        })
    }

    /// Register a live listener by its access code secret
    ///
    /// # Errors
    ///
    /// Returns an auth error for an unknown code; the attempt is logged
    /// as a security event.
    pub async fn register_listener(&self, code: &str) -> Result<ClientHandle> {
        let Some(access) = self.archive.find_access_code(code).await? else {
            tracing::warn!("listener registration with unknown access code rejected");
            return Err(Error::auth("unknown access code").into());
        };
        Ok(self.hub.register(&access))
    }

    /// Run one retention pass over every System immediately
    ///
    /// # Errors
    ///
    /// Returns a storage error if the archive cannot be read.
    pub async fn prune_now(&self) -> Result<u64> {
        prune_pass(&self.archive, &self.base_dir).await
    }

    /// The ingestion gateway
    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// The live broadcast hub
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The downstream relay manager
    #[must_use]
    pub fn relay(&self) -> &Arc<RelayManager> {
        &self.relay
    }

    /// The archive store
    #[must_use]
    pub const fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Stop the engine: sources first, then fan-out, then the relay
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        for task in self.tasks {
            if task.await.is_err() {
                tracing::warn!("engine task ended abnormally");
            }
        }

        self.hub.close_all();
        self.relay.shutdown().await;
        tracing::info!("engine stopped");
    }
}

async fn pump(
    mut events: mpsc::Receiver<CallArrived>,
    hub: Arc<Hub>,
    relay: Arc<RelayManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let notice = CallNotice::from(&event.call);
                let listeners = hub.broadcast(&notice);
                let targets = relay.dispatch(&event.call, &event.audio);
                tracing::debug!(
                    call_id = %event.call.id,
                    listeners,
                    targets,
                    "arrival fanned out"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn prune_loop(
    archive: Archive,
    base_dir: PathBuf,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup stays cheap.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = prune_pass(&archive, &base_dir).await {
                    tracing::error!(error = %e, "retention pass failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn prune_pass(archive: &Archive, base_dir: &Path) -> Result<u64> {
    let mut total = 0;
    for system in archive.list_systems().await? {
        if system.retention.is_unbounded() {
            continue;
        }
        let outcome = archive.prune(&system).await?;
        total += outcome.deleted;

        for audio_ref in outcome.audio_refs {
            let path = base_dir.join(&audio_ref);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "pruned audio already gone");
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
mod tests {
    use super::*;
    use callrelay_core::{
        config::StorageConfig, AccessCode, Grant, RetentionPolicy, TalkgroupScope,
    };
    use callrelay_ingest::SourcePayload;
    use pretty_assertions::assert_eq;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            storage: StorageConfig {
                base_dir: dir.path().to_path_buf(),
                database_file: "engine.db".to_string(),
                max_connections: 4,
            },
            ..Config::default()
        }
    }

    fn dirwatch_payload(system: i64, start: i64) -> SourcePayload {
        SourcePayload::Dirwatch {
            system,
            filename: format!("100-{start}_4001.mp3"),
            audio: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn submitted_call_reaches_authorized_listener() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::start(test_config(&dir)).await.unwrap();

        controller
            .archive()
            .upsert_access_code(&AccessCode {
                ident: "listener".to_string(),
                code: "c0de".to_string(),
                grants: vec![Grant {
                    system: 3,
                    talkgroups: TalkgroupScope::All,
                }],
            })
            .await
            .unwrap();

        let client = controller.register_listener("c0de").await.unwrap();
        let persisted = controller
            .gateway()
            .submit(dirwatch_payload(3, 1_700_000_000))
            .await
            .unwrap();

        let notice = client.next().await.unwrap();
        assert_eq!(notice.id, persisted.call.id);
        assert_eq!(notice.system, 3);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_access_code_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::start(test_config(&dir)).await.unwrap();

        let err = controller.register_listener("nope").await.unwrap_err();
        assert!(matches!(
            err,
            crate::DispatchError::Core(Error::Auth(_))
        ));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn unauthorized_listener_sees_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::start(test_config(&dir)).await.unwrap();

        controller
            .archive()
            .upsert_access_code(&AccessCode {
                ident: "other".to_string(),
                code: "other-code".to_string(),
                grants: vec![Grant {
                    system: 9,
                    talkgroups: TalkgroupScope::All,
                }],
            })
            .await
            .unwrap();

        let client = controller.register_listener("other-code").await.unwrap();
        controller
            .gateway()
            .submit(dirwatch_payload(3, 1_700_000_000))
            .await
            .unwrap();

        // Give the pump a chance to run; the notice must not appear.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.dropped(), 0);

        controller.shutdown().await;
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn prune_now_applies_retention_and_removes_audio() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::start(test_config(&dir)).await.unwrap();

        let mut refs = Vec::new();
        for i in 0..3 {
            let persisted = controller
                .gateway()
                .submit(dirwatch_payload(1, 1_700_000_000 + i * 100))
                .await
                .unwrap();
            refs.push(persisted.call.audio_ref);
        }

        let mut system = controller.archive().get_system(1).await.unwrap().unwrap();
        system.retention = RetentionPolicy {
            max_age_days: None,
            max_count: Some(1),
        };
        controller.archive().upsert_system(&system).await.unwrap();

        let deleted = controller.prune_now().await.unwrap();
        assert_eq!(deleted, 2);

        // Oldest two payloads are gone, the newest survives.
        assert!(!dir.path().join(&refs[0]).exists());
        assert!(!dir.path().join(&refs[1]).exists());
        assert!(dir.path().join(&refs[2]).exists());

        controller.shutdown().await;
    }
}
