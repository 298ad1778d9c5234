//! Live broadcast hub
//!
//! Every registered listener gets its own bounded notice queue. A
//! broadcast walks a snapshot of the registry, so registration never
//! contends with delivery, and a full queue evicts that listener's
//! oldest notice instead of stalling the broadcast.

use crate::access::permits;
use crate::queue::BoundedQueue;
use callrelay_core::{config::HubConfig, AccessCode, CallNotice, Grant};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
struct ClientState {
    ident: String,
    grants: Vec<Grant>,
    queue: BoundedQueue<CallNotice>,
    last_seen: Mutex<Instant>,
}

/// A registered listener's receiving end
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: Uuid,
    state: Arc<ClientState>,
}

impl ClientHandle {
    /// The client's registration id
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The access code identity this client registered with
    #[must_use]
    pub fn ident(&self) -> &str {
        &self.state.ident
    }

    /// Wait for the next notice; `None` once the client is disconnected
    pub async fn next(&self) -> Option<CallNotice> {
        self.state.queue.pop().await
    }

    /// Record client liveness; a silent client is eventually reaped
    pub fn heartbeat(&self) {
        *self.state.last_seen.lock() = Instant::now();
    }

    /// Notices this client lost to queue overflow
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.queue.dropped()
    }
}

/// The live fan-out registry
#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    clients: RwLock<HashMap<Uuid, Arc<ClientState>>>,
}

impl Hub {
    /// Create an empty hub
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener under an access code's grant set
    #[must_use]
    pub fn register(&self, code: &AccessCode) -> ClientHandle {
        let id = Uuid::new_v4();
        let state = Arc::new(ClientState {
            ident: code.ident.clone(),
            grants: code.grants.clone(),
            queue: BoundedQueue::new(self.config.client_queue_capacity),
            last_seen: Mutex::new(Instant::now()),
        });

        self.clients.write().insert(id, Arc::clone(&state));
        tracing::info!(
            client_id = %id,
            ident = %code.ident,
            grants = code.grants.len(),
            "listener registered"
        );

        ClientHandle { id, state }
    }

    /// Disconnect a listener; its pending notices are discarded
    pub fn unregister(&self, id: Uuid) {
        if let Some(state) = self.clients.write().remove(&id) {
            state.queue.close();
            tracing::info!(client_id = %id, ident = %state.ident, "listener unregistered");
        }
    }

    /// Record liveness for a listener by id
    pub fn touch(&self, id: Uuid) {
        if let Some(state) = self.clients.read().get(&id) {
            *state.last_seen.lock() = Instant::now();
        }
    }

    /// Fan a notice out to every listener whose grants cover it
    ///
    /// Returns the number of listeners the notice was queued for.
    pub fn broadcast(&self, notice: &CallNotice) -> usize {
        let snapshot: Vec<Arc<ClientState>> =
            self.clients.read().values().map(Arc::clone).collect();

        let mut delivered = 0;
        for client in snapshot {
            if !permits(&client.grants, notice.system, notice.talkgroup) {
                continue;
            }
            if client.queue.push(notice.clone()) {
                delivered += 1;
            }
        }

        tracing::debug!(
            call_id = %notice.id,
            system = notice.system,
            talkgroup = notice.talkgroup,
            delivered,
            "notice broadcast"
        );
        delivered
    }

    /// Connected listener count
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Disconnect listeners silent for longer than the grace period
    ///
    /// Returns the number of listeners reaped.
    pub fn reap_stale(&self) -> usize {
        let grace = Duration::from_secs(self.config.heartbeat_grace_secs);
        let now = Instant::now();

        let stale: Vec<(Uuid, Arc<ClientState>)> = self
            .clients
            .read()
            .iter()
            .filter(|(_, state)| now.duration_since(*state.last_seen.lock()) > grace)
            .map(|(id, state)| (*id, Arc::clone(state)))
            .collect();

        let mut clients = self.clients.write();
        for (id, state) in &stale {
            clients.remove(id);
            state.queue.close();
            tracing::warn!(
                client_id = %id,
                ident = %state.ident,
                "silent listener disconnected"
            );
        }
        stale.len()
    }

    /// Spawn the liveness reaper; it stops when the shutdown signal flips
    pub fn spawn_reaper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                hub.config.heartbeat_interval_secs.max(1),
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        hub.reap_stale();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Close every listener queue; used during shutdown
    pub fn close_all(&self) {
        let mut clients = self.clients.write();
        for state in clients.values() {
            state.queue.close();
        }
        clients.clear();
    }
}
