//! Deterministic in-process network simulation.
//!
//! Provides [`SimNetwork`] to create simulated peers that exchange datagrams
//! over in-process channels with configurable latency, jitter, packet loss,
//! disconnection and an optional drop filter. Loss and jitter come from a
//! seeded RNG so runs are reproducible. No real sockets are involved.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use std::time::Duration;
//! use wisp_transport::{MessageTransport, SimNetwork};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = SimNetwork::new();
//! sim.set_latency(Duration::from_millis(20));
//! sim.set_loss_rate(0.05);
//!
//! let (alice, _alice_rx) = sim.join("alice");
//! let (_bob, mut bob_rx) = sim.join("bob");
//!
//! alice.send_to_peer(&"bob".into(), Bytes::from("hello")).await?;
//! let event = bob_rx.recv().await;
//! # Ok(())
//! # }
//! ```

use crate::peer::PeerId;
use crate::transport::{
    InboundEvent, MessageTransport, PeerEvent, TransportError, TransportResult, TransportStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Predicate deciding whether a datagram `(from, to, payload)` is dropped.
///
/// Runs before random loss, so tests can target specific messages.
pub type DropFilter = Arc<dyn Fn(&PeerId, &PeerId, &[u8]) -> bool + Send + Sync>;

/// Conditions applied to every link.
#[derive(Debug, Clone, Copy, Default)]
struct LinkConditions {
    latency: Duration,
    jitter: Duration,
    loss_rate: f64,
}

/// Shared interior of the simulation network.
struct SimNetworkInner {
    conditions: RwLock<LinkConditions>,
    /// Inbound queues of connected peers
    endpoints: RwLock<HashMap<PeerId, mpsc::UnboundedSender<InboundEvent>>>,
    drop_filter: RwLock<Option<DropFilter>>,
    rng: Mutex<StdRng>,
}

impl SimNetworkInner {
    /// Route a datagram from `from` to `to`, applying the filter, loss,
    /// latency and jitter.
    fn route(
        &self,
        from: &PeerId,
        to: &PeerId,
        data: Bytes,
        stats: &Mutex<TransportStats>,
    ) -> TransportResult<()> {
        let tx = {
            let endpoints = self.endpoints.read();
            if !endpoints.contains_key(from) {
                return Err(TransportError::Closed);
            }
            endpoints
                .get(to)
                .cloned()
                .ok_or_else(|| TransportError::PeerNotConnected(to.clone()))?
        };

        let filter = self.drop_filter.read().clone();
        if let Some(filter) = filter {
            if filter(from, to, &data) {
                stats.lock().record_drop();
                tracing::trace!(%from, %to, "datagram dropped by filter");
                return Ok(());
            }
        }

        let conditions = *self.conditions.read();
        let (lost, jitter) = {
            let mut rng = self.rng.lock();
            let lost = conditions.loss_rate > 0.0 && rng.gen_bool(conditions.loss_rate.clamp(0.0, 1.0));
            let jitter = if conditions.jitter > Duration::ZERO {
                Duration::from_nanos(rng.gen_range(0..conditions.jitter.as_nanos() as u64))
            } else {
                Duration::ZERO
            };
            (lost, jitter)
        };

        stats.lock().record_send(data.len());

        if lost {
            stats.lock().record_drop();
            tracing::trace!(%from, %to, "datagram dropped by loss simulation");
            return Ok(());
        }

        let event = InboundEvent {
            from: from.clone(),
            event: PeerEvent::Datagram(data),
        };
        let delay = conditions.latency + jitter;
        if delay > Duration::ZERO {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event);
            });
        } else {
            let _ = tx.send(event);
        }

        Ok(())
    }
}

/// Simulation network controller.
///
/// Creates simulated peers and controls network conditions. Cloning yields
/// another handle to the same network.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<SimNetworkInner>,
}

impl SimNetwork {
    /// Create a new simulation network with default seed (42).
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(42)
    }

    /// Create a new simulation network with a specific RNG seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        tracing::debug!(seed, "created sim network");
        Self {
            inner: Arc::new(SimNetworkInner {
                conditions: RwLock::new(LinkConditions::default()),
                endpoints: RwLock::new(HashMap::new()),
                drop_filter: RwLock::new(None),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }),
        }
    }

    /// Attach a peer to the network.
    ///
    /// Every peer already present is connected to the newcomer; both sides
    /// observe a [`PeerEvent::Connected`]. Returns the endpoint and the
    /// newcomer's inbound event queue.
    pub fn join(
        &self,
        id: impl Into<PeerId>,
    ) -> (SimEndpoint, mpsc::UnboundedReceiver<InboundEvent>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut endpoints = self.inner.endpoints.write();
            for (other, other_tx) in endpoints.iter() {
                let _ = other_tx.send(InboundEvent {
                    from: id.clone(),
                    event: PeerEvent::Connected,
                });
                let _ = tx.send(InboundEvent {
                    from: other.clone(),
                    event: PeerEvent::Connected,
                });
            }
            endpoints.insert(id.clone(), tx);
        }

        tracing::debug!(peer = %id, "sim peer joined");

        let endpoint = SimEndpoint {
            id,
            inner: Arc::clone(&self.inner),
            stats: Mutex::new(TransportStats::new()),
        };
        (endpoint, rx)
    }

    /// Detach a peer. Remaining peers observe a [`PeerEvent::Disconnected`],
    /// and later sends to or from it fail.
    pub fn disconnect(&self, id: &PeerId) {
        let mut endpoints = self.inner.endpoints.write();
        let Some(leaving_tx) = endpoints.remove(id) else {
            return;
        };
        for (other, other_tx) in endpoints.iter() {
            let _ = other_tx.send(InboundEvent {
                from: id.clone(),
                event: PeerEvent::Disconnected,
            });
            let _ = leaving_tx.send(InboundEvent {
                from: other.clone(),
                event: PeerEvent::Disconnected,
            });
        }
        tracing::debug!(peer = %id, "sim peer disconnected");
    }

    /// Set one-way latency for every link
    pub fn set_latency(&self, latency: Duration) {
        self.inner.conditions.write().latency = latency;
    }

    /// Set maximum additional random delay per datagram
    pub fn set_jitter(&self, jitter: Duration) {
        self.inner.conditions.write().jitter = jitter;
    }

    /// Set datagram loss probability (0.0 to 1.0)
    pub fn set_loss_rate(&self, loss_rate: f64) {
        self.inner.conditions.write().loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    /// Install a drop filter, replacing any previous one
    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.inner.drop_filter.write() = Some(filter);
    }

    /// Remove the drop filter
    pub fn clear_drop_filter(&self) {
        *self.inner.drop_filter.write() = None;
    }

    /// Number of attached peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.endpoints.read().len()
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's handle onto a [`SimNetwork`].
pub struct SimEndpoint {
    id: PeerId,
    inner: Arc<SimNetworkInner>,
    stats: Mutex<TransportStats>,
}

#[async_trait]
impl MessageTransport for SimEndpoint {
    fn local_peer(&self) -> &PeerId {
        &self.id
    }

    async fn send_to_peer(&self, peer: &PeerId, payload: Bytes) -> TransportResult<()> {
        if peer == &self.id {
            return Err(TransportError::PeerNotConnected(peer.clone()));
        }
        self.inner
            .route(&self.id, peer, payload, &self.stats)
            .inspect_err(|_| self.stats.lock().record_send_error())
    }

    async fn broadcast(&self, payload: Bytes) -> TransportResult<usize> {
        let peers = self.connected_peers();
        let mut delivered = 0;
        for peer in &peers {
            match self.inner.route(&self.id, peer, payload.clone(), &self.stats) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.lock().record_send_error();
                    tracing::debug!(%peer, error = %e, "broadcast leg failed");
                }
            }
        }
        Ok(delivered)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let endpoints = self.inner.endpoints.read();
        if !endpoints.contains_key(&self.id) {
            return Vec::new();
        }
        let mut peers: Vec<PeerId> = endpoints
            .keys()
            .filter(|p| **p != self.id)
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}
