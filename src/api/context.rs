//! Shared services passed explicitly to every engine component.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::registry::{PeerId, PeerRecord, PeerRegistry, PeerUpdate};
use crate::reputation::{Outcome, ReputationTracker};
use crate::transport::{self, PeerTransport};
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The registry, transport, reputation book, clock and configuration one
/// engine instance works against.
///
/// Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct EngineContext {
    pub registry: Arc<dyn PeerRegistry>,
    pub transport: Arc<dyn PeerTransport>,
    pub reputation: Arc<ReputationTracker>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<EngineMetrics>,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(
        registry: Arc<dyn PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            reputation: Arc::new(ReputationTracker::new()),
            clock,
            metrics: Arc::new(EngineMetrics::new()),
            config,
        }
    }

    /// Uses an existing reputation book, e.g. one restored from disk.
    pub fn with_reputation(mut self, reputation: Arc<ReputationTracker>) -> Self {
        self.reputation = reputation;
        self
    }

    /// Records an outcome and mirrors the new score to the coordinator.
    ///
    /// Coordinator errors are logged, not returned: a stale score in the
    /// directory never fails the operation that produced it.
    pub async fn report(&self, peer_id: &PeerId, outcome: Outcome) {
        let score = self.reputation.record_outcome(peer_id, outcome);
        let update = PeerUpdate {
            reputation_score: Some(score),
            seen_at: outcome.is_success().then(|| self.clock.now()),
            ..Default::default()
        };
        if let Err(e) = self.registry.update_peer(peer_id, update).await {
            warn!(peer = %peer_id.short(), error = %e, "failed to publish reputation");
        }
    }

    /// Runs one transfer against `peer` with a timeout per attempt, retrying
    /// transient failures with exponential backoff.
    ///
    /// When every attempt fails transiently the peer is penalized as for an
    /// integrity violation. Non-transient errors return immediately without
    /// any reputation effect; the caller decides what they mean.
    pub(crate) async fn transfer<T, F, Fut>(
        &self,
        peer: &PeerRecord,
        operation: &str,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.transfer_retries.max(1);
        let mut tried = 0;
        loop {
            let timeout: Duration = self.config.transfer_timeout();
            match transport::with_timeout(timeout, peer, operation, attempt()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tried + 1 < attempts => {
                    let backoff = self.config.retry_backoff(tried);
                    debug!(
                        peer = %peer.peer_id.short(),
                        operation,
                        attempt = tried + 1,
                        ?backoff,
                        error = %e,
                        "transient failure, retrying"
                    );
                    EngineMetrics::incr(&self.metrics.transfer_retries);
                    tried += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(peer = %peer.peer_id.short(), operation, error = %e, "retries exhausted");
                        self.report(&peer.peer_id, Outcome::IntegrityViolation).await;
                    }
                    return Err(e);
                }
            }
        }
    }
}
