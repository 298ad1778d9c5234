//! Downstream relay manager
//!
//! One worker per configured target, each with its own bounded pending
//! queue, so a slow or dead peer never delays the others. Delivery is
//! strictly in arrival order per target: a failed forward is retried
//! head-of-line with doubling backoff, and a target that keeps failing
//! is disabled until an operator re-enables it.

use crate::access::permits;
use crate::error::{DispatchError, Result};
use crate::queue::BoundedQueue;
use callrelay_core::{config::RelayConfig, Call, DownstreamTarget};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A call queued for forwarding to one target
#[derive(Debug, Clone)]
struct RelayJob {
    call: Call,
    audio: Arc<Vec<u8>>,
}

/// Transport used to forward a call to a downstream peer
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Forward one call with its audio payload
    ///
    /// # Errors
    ///
    /// Returns a delivery error when the peer cannot be reached or
    /// refuses the call; the caller decides on retry.
    async fn forward(
        &self,
        target: &DownstreamTarget,
        call: &Call,
        audio: &[u8],
    ) -> Result<()>;
}

/// HTTP transport posting calls to a peer's ingestion endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the transport with the configured per-attempt timeout
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(send_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(send_timeout)
            .build()
            .map_err(|e| {
                DispatchError::Core(callrelay_core::Error::configuration(e.to_string()))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RelayTransport for HttpTransport {
    async fn forward(
        &self,
        target: &DownstreamTarget,
        call: &Call,
        audio: &[u8],
    ) -> Result<()> {
        let units = serde_json::to_string(&call.units)
            .map_err(|e| DispatchError::delivery(&target.ident, e.to_string()))?;

        let audio_part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(format!("{}.{}", call.id, call.audio_format));

        let form = reqwest::multipart::Form::new()
            .text("api_key", target.api_key.clone())
            .text("system", call.system.to_string())
            .text("talkgroup", call.talkgroup.to_string())
            .text("start", call.start.timestamp().to_string())
            .text("duration", call.duration_secs.to_string())
            .text("unit_ids", units)
            .text("audio_format", call.audio_format.clone())
            .part("audio", audio_part);

        let response = self
            .client
            .post(&target.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DispatchError::delivery(&target.ident, e.to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::delivery(
                &target.ident,
                format!("peer answered {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TargetStatus {
    consecutive_failures: AtomicU32,
    disabled: AtomicBool,
    forwarded: AtomicU64,
    enable_signal: Notify,
}

impl TargetStatus {
    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    fn enable(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.disabled.store(false, Ordering::Release);
        self.enable_signal.notify_one();
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }
}

/// Operator-facing view of one target's relay state
#[derive(Debug, Clone)]
pub struct TargetSnapshot {
    /// Target identifier
    pub ident: String,

    /// Peer endpoint
    pub url: String,

    /// Whether the target is disabled and needs manual re-enabling
    pub disabled: bool,

    /// Current consecutive failure count
    pub consecutive_failures: u32,

    /// Calls waiting in the pending queue
    pub queued: usize,

    /// Calls forwarded successfully since startup
    pub forwarded: u64,

    /// Calls evicted from a full pending queue
    pub dropped: u64,
}

struct TargetHandle {
    target: DownstreamTarget,
    queue: Arc<BoundedQueue<RelayJob>>,
    status: Arc<TargetStatus>,
    task: JoinHandle<()>,
}

struct TargetWorker {
    target: DownstreamTarget,
    config: RelayConfig,
    transport: Arc<dyn RelayTransport>,
    queue: Arc<BoundedQueue<RelayJob>>,
    status: Arc<TargetStatus>,
}

impl TargetWorker {
    async fn run(self) {
        loop {
            if !self.wait_enabled().await {
                break;
            }
            let Some(job) = self.queue.pop().await else {
                break;
            };
            if !self.deliver(&job).await {
                break;
            }
        }
        tracing::info!(peer = %self.target.ident, "relay worker stopped");
    }

    // false once the queue is closed while disabled
    async fn wait_enabled(&self) -> bool {
        while self.status.is_disabled() {
            if self.queue.is_closed() {
                return false;
            }
            self.status.enable_signal.notified().await;
        }
        true
    }

    // Retries the same job head-of-line until it lands; false aborts the
    // worker because shutdown closed the queue mid-delivery.
    async fn deliver(&self, job: &RelayJob) -> bool {
        loop {
            match self
                .transport
                .forward(&self.target, &job.call, &job.audio)
                .await
            {
                Ok(()) => {
                    self.status.record_success();
                    tracing::debug!(
                        peer = %self.target.ident,
                        call_id = %job.call.id,
                        "call forwarded"
                    );
                    return true;
                }
                Err(e) => {
                    let failures = self.status.record_failure();
                    tracing::warn!(
                        peer = %self.target.ident,
                        call_id = %job.call.id,
                        failures,
                        error = %e,
                        "forward failed"
                    );

                    if failures >= self.config.max_consecutive_failures {
                        self.status.disable();
                        let alarm = DispatchError::ExhaustedRetry {
                            target: self.target.ident.clone(),
                            failures,
                        };
                        tracing::error!(
                            peer = %self.target.ident,
                            error = %alarm,
                            "downstream target disabled, manual re-enable required"
                        );
                        if !self.wait_enabled().await {
                            return false;
                        }
                        continue;
                    }

                    if self.queue.is_closed() {
                        tracing::warn!(
                            peer = %self.target.ident,
                            call_id = %job.call.id,
                            "delivery abandoned at shutdown"
                        );
                        return false;
                    }
                    tokio::time::sleep(self.backoff(failures)).await;
                }
            }
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let secs = self
            .config
            .backoff_base_secs
            .saturating_mul(1 << exp)
            .min(self.config.backoff_cap_secs);
        Duration::from_secs(secs)
    }
}

/// Owns one relay worker per downstream target
pub struct RelayManager {
    config: RelayConfig,
    transport: Arc<dyn RelayTransport>,
    targets: RwLock<HashMap<String, TargetHandle>>,
}

impl std::fmt::Debug for RelayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayManager")
            .field("config", &self.config)
            .field("targets", &self.targets.read().len())
            .finish_non_exhaustive()
    }
}

impl RelayManager {
    /// Create a manager with no targets yet
    #[must_use]
    pub fn new(config: RelayConfig, transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            config,
            transport,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Add a target and spawn its worker
    pub fn add_target(&self, target: DownstreamTarget) {
        let queue = Arc::new(BoundedQueue::new(self.config.target_queue_capacity));
        let status = Arc::new(TargetStatus::default());

        let worker = TargetWorker {
            target: target.clone(),
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            queue: Arc::clone(&queue),
            status: Arc::clone(&status),
        };
        let task = tokio::spawn(worker.run());

        tracing::info!(peer = %target.ident, url = %target.url, "relay target added");
        self.targets.write().insert(
            target.ident.clone(),
            TargetHandle {
                target,
                queue,
                status,
                task,
            },
        );
    }

    /// Queue a call for every target whose grants cover it
    ///
    /// Returns the number of targets the call was queued for. A full
    /// target queue evicts that target's oldest pending call.
    pub fn dispatch(&self, call: &Call, audio: &Arc<Vec<u8>>) -> usize {
        let targets = self.targets.read();
        let mut queued = 0;

        for handle in targets.values() {
            if !permits(&handle.target.grants, call.system, call.talkgroup) {
                continue;
            }
            let job = RelayJob {
                call: call.clone(),
                audio: Arc::clone(audio),
            };
            if handle.queue.push(job) {
                queued += 1;
            }
        }
        queued
    }

    /// Re-enable a disabled target; its queued backlog resumes in order
    ///
    /// # Errors
    ///
    /// Returns `UnknownTarget` if no target with this identifier exists.
    pub fn enable(&self, ident: &str) -> Result<()> {
        let targets = self.targets.read();
        let handle = targets.get(ident).ok_or_else(|| DispatchError::UnknownTarget {
            target: ident.to_string(),
        })?;

        handle.status.enable();
        tracing::info!(peer = %ident, "target re-enabled");
        Ok(())
    }

    /// Current state of every target
    #[must_use]
    pub fn snapshot(&self) -> Vec<TargetSnapshot> {
        let targets = self.targets.read();
        let mut snapshots: Vec<TargetSnapshot> = targets
            .values()
            .map(|h| TargetSnapshot {
                ident: h.target.ident.clone(),
                url: h.target.url.clone(),
                disabled: h.status.is_disabled(),
                consecutive_failures: h.status.consecutive_failures.load(Ordering::Relaxed),
                queued: h.queue.len(),
                forwarded: h.status.forwarded.load(Ordering::Relaxed),
                dropped: h.queue.dropped(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.ident.cmp(&b.ident));
        snapshots
    }

    /// Stop all workers, allowing in-flight deliveries a bounded grace
    pub async fn shutdown(&self) {
        let handles: Vec<TargetHandle> = {
            let mut targets = self.targets.write();
            targets.drain().map(|(_, h)| h).collect()
        };

        for handle in &handles {
            handle.queue.close();
            // Wake a worker parked in a disabled state.
            handle.status.enable_signal.notify_one();
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        for handle in handles {
            let ident = handle.target.ident;
            if tokio::time::timeout(grace, handle.task).await.is_err() {
                tracing::warn!(peer = %ident, "relay worker did not stop within grace");
            }
        }
    }
}
