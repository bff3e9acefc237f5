//! Per-peer connection state machine
//!
//! One resolver task runs per known peer. It probes reachability, runs
//! the handshake, then settles into a heartbeat loop. Failures back off
//! exponentially with jitter; trust and version problems park the peer
//! in the matching state until conditions change.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::directory::{ConnectionState, PeerDirectory, TrustState};
use crate::identity::DeviceIdentity;
use crate::paste::PasteStore;
use crate::secure::SecureStore;
use crate::sync::reconcile::Reconciler;
use crate::transport::protocol::Heartbeat;
use crate::transport::{HandshakeOutcome, PeerClient};

/// How long an unmatched or verifying peer waits between retries
const TRUST_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// How long an incompatible peer is left alone
const INCOMPATIBLE_RETRY: Duration = Duration::from_secs(300);

/// Shared registry of live clients for connected peers
pub type ClientPool = Arc<RwLock<HashMap<Uuid, Arc<PeerClient>>>>;

/// Exponential backoff with jitter
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff schedule
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter_factor: 0.1,
            attempt: 0,
        }
    }

    /// Next delay, growing exponentially up to the max
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let base = self.initial.as_secs_f64();
        let delay = base * self.multiplier.powi(self.attempt.saturating_sub(1) as i32);
        let clamped = delay.min(self.max.as_secs_f64());

        // Jitter spreads out reconnect storms after a network blip.
        let jitter_range = clamped * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        Duration::from_secs_f64((clamped + jitter).max(0.0))
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Drives the connection state machine for one peer
pub struct PeerResolver {
    /// Service configuration
    pub config: Arc<Config>,
    /// Local signing identity
    pub identity: Arc<DeviceIdentity>,
    /// Device directory
    pub directory: PeerDirectory,
    /// Live sessions
    pub secure: SecureStore,
    /// Record store
    pub store: Arc<PasteStore>,
    /// Apply path for caught-up records
    pub reconciler: Arc<Reconciler>,
    /// Registry of clients for connected peers
    pub clients: ClientPool,
}

impl PeerResolver {
    /// Run the state machine until the peer disappears from the directory
    pub async fn run(self, peer_id: Uuid) {
        let mut backoff = Backoff::new(
            Duration::from_secs(self.config.sync.backoff_initial_secs),
            Duration::from_secs(self.config.sync.backoff_max_secs),
        );

        loop {
            let Some(record) = self.directory.get(&peer_id).await else {
                debug!("Peer {} gone from directory, resolver exiting", peer_id);
                return;
            };

            // Operator said no; nothing to do until that changes.
            if record.trust == TrustState::Rejected {
                self.directory
                    .set_state(&peer_id, ConnectionState::Disconnected)
                    .await;
                sleep(TRUST_POLL_INTERVAL).await;
                continue;
            }

            // A known fingerprint that is not yet trusted parks the peer
            // in Verifying until the operator decides.
            if record.fingerprint.is_some() && !record.is_trusted() {
                self.directory
                    .set_state(&peer_id, ConnectionState::Verifying)
                    .await;
                sleep(TRUST_POLL_INTERVAL).await;
                continue;
            }

            let Some(addr) = record.addresses.first().copied() else {
                sleep(backoff.next_delay()).await;
                continue;
            };

            self.directory
                .set_state(&peer_id, ConnectionState::Connecting)
                .await;

            let mut client = match PeerClient::new(
                self.config.device_id,
                peer_id,
                !record.manual,
                addr,
                self.secure.clone(),
                self.config.sync.max_payload,
            ) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Failed to build client for {}: {}", peer_id, e);
                    sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            match client
                .handshake(
                    &self.identity,
                    &self.config.device_name,
                    self.config.network.listen_addr.port(),
                )
                .await
            {
                Ok(HandshakeOutcome::Established {
                    fingerprint,
                    device_id,
                    device_name,
                    platform,
                    ..
                }) => {
                    if device_id != peer_id {
                        // A manual placeholder just learned the device's
                        // real identity; re-home the directory entry and
                        // let the resolver for the real id take over.
                        if let Err(e) = self
                            .adopt_manual_peer(peer_id, device_id, device_name, platform, addr, &fingerprint)
                            .await
                        {
                            warn!("Failed to adopt manual peer {}: {}", peer_id, e);
                        }
                        self.secure.remove(&device_id).await;
                        return;
                    }

                    if let Err(e) = self.directory.bind_fingerprint(&peer_id, &fingerprint).await {
                        warn!("Failed to bind fingerprint for {}: {}", peer_id, e);
                    }

                    // The handshake may have surfaced a fingerprint the
                    // operator has not confirmed yet.
                    let trusted = self
                        .directory
                        .get(&peer_id)
                        .await
                        .map(|r| r.is_trusted())
                        .unwrap_or(false);
                    if !trusted {
                        self.secure.remove(&peer_id).await;
                        self.directory
                            .set_state(&peer_id, ConnectionState::Verifying)
                            .await;
                        sleep(TRUST_POLL_INTERVAL).await;
                        continue;
                    }

                    info!("Connected to peer {} at {}", peer_id, addr);
                    self.directory
                        .set_state(&peer_id, ConnectionState::Connected)
                        .await;
                    backoff.reset();

                    let client = Arc::new(client);
                    self.clients.write().await.insert(peer_id, client.clone());
                    let result = self.connected_loop(peer_id, &client).await;
                    self.clients.write().await.remove(&peer_id);
                    self.secure.remove(&peer_id).await;

                    self.directory
                        .set_state(&peer_id, ConnectionState::Disconnected)
                        .await;
                    if let Err(e) = result {
                        debug!("Connection to {} ended: {}", peer_id, e);
                    }
                    sleep(backoff.next_delay()).await;
                }
                Ok(HandshakeOutcome::Unmatched { .. }) => {
                    // The peer has seen us but its operator has not
                    // confirmed our fingerprint yet.
                    self.directory
                        .set_state(&peer_id, ConnectionState::Unmatched)
                        .await;
                    sleep(TRUST_POLL_INTERVAL).await;
                }
                Ok(HandshakeOutcome::Incompatible { protocol_version }) => {
                    warn!(
                        "Peer {} speaks protocol v{}, parking as incompatible",
                        peer_id, protocol_version
                    );
                    self.directory
                        .set_state(&peer_id, ConnectionState::Incompatible)
                        .await;
                    sleep(INCOMPATIBLE_RETRY).await;
                }
                Err(e) => {
                    debug!("Handshake with {} failed: {}", peer_id, e);
                    self.directory
                        .set_state(&peer_id, ConnectionState::Disconnected)
                        .await;
                    if self.directory.mark_failure(&peer_id).await {
                        debug!("Peer {} considered offline", peer_id);
                    }
                    sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// Re-home a manual placeholder entry under the device's real id
    async fn adopt_manual_peer(
        &self,
        placeholder: Uuid,
        device_id: Uuid,
        device_name: String,
        platform: String,
        addr: std::net::SocketAddr,
        fingerprint: &str,
    ) -> std::io::Result<()> {
        use crate::discovery::types::DeviceInfo;

        info!(
            "Manual peer at {} identified as {} ({})",
            addr, device_name, device_id
        );

        let info = DeviceInfo {
            id: device_id,
            name: device_name,
            addresses: vec![addr],
            port: addr.port(),
            protocol_version: crate::transport::PROTOCOL_VERSION,
            platform,
            fingerprint: Some(fingerprint.to_string()),
        };
        self.directory.observe(&info, true).await?;
        self.directory.bind_fingerprint(&device_id, fingerprint).await?;
        self.directory.remove(&placeholder).await
    }

    /// Catch up and then heartbeat until the connection degrades
    async fn connected_loop(
        &self,
        peer_id: Uuid,
        client: &PeerClient,
    ) -> Result<(), crate::transport::TransportError> {
        // Entering Connected always starts with a catch-up so missed
        // pushes while disconnected are recovered.
        self.reconciler.catch_up(client, &self.directory).await?;

        // Retry blob pulls for records that arrived while their source
        // was unreachable; this peer may hold the bytes too.
        self.reconciler
            .pull_incomplete(client, self.config.sync.chunk_retries)
            .await;

        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut misses = 0u32;

        loop {
            interval.tick().await;

            let heartbeat = Heartbeat {
                sender: self.config.device_id,
                latest_seq: self.store.latest_seq().await.unwrap_or(0),
                sent_at: chrono::Utc::now(),
            };

            match client.heartbeat(&heartbeat).await {
                Ok(ack) => {
                    misses = 0;
                    self.directory.touch(&peer_id).await;

                    // The peer is ahead of our cursor; pull instead of
                    // waiting for a push replay.
                    if ack.latest_seq > self.directory.cursor(&peer_id).await {
                        if let Err(e) = self.reconciler.catch_up(client, &self.directory).await {
                            warn!("Catch-up with {} failed: {}", peer_id, e);
                        }
                    }
                }
                Err(e) => {
                    misses += 1;
                    debug!(
                        "Heartbeat {}/{} to {} failed: {}",
                        misses, self.config.sync.max_heartbeat_misses, peer_id, e
                    );
                    if misses >= self.config.sync.max_heartbeat_misses {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();

        // ~1s, ~2s, ~4s with 10% jitter.
        assert!(first.as_secs_f64() < 1.5);
        assert!(second.as_secs_f64() > first.as_secs_f64());
        assert!(third.as_secs_f64() > 3.0 && third.as_secs_f64() < 5.0);
    }

    #[test]
    fn test_backoff_clamps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));

        for _ in 0..10 {
            backoff.next_delay();
        }
        let delay = backoff.next_delay();
        assert!(delay.as_secs_f64() <= 8.0 * 1.1 + f64::EPSILON);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();

        let delay = backoff.next_delay();
        assert!(delay.as_secs_f64() < 1.5);
    }
}
