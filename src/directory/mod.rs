//! Peer directory: known devices, their trust, and connection state
//!
//! The directory is the single source of truth the sync engine works
//! from. Device records persist across restarts as a JSON file; runtime
//! connection state does not.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::types::DeviceInfo;

const PEER_TIMEOUT_SECS: i64 = 300; // 5 minutes
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Per-peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Reachability probe / session setup in progress
    Connecting,
    /// Identity seen, awaiting trust confirmation
    Verifying,
    /// Session established, reconciliation live
    Connected,
    /// Identity not trusted on this device
    Unmatched,
    /// Peer speaks an unsupported protocol version
    Incompatible,
    /// Not currently reachable
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Verifying => "verifying",
            ConnectionState::Connected => "connected",
            ConnectionState::Unmatched => "unmatched",
            ConnectionState::Incompatible => "incompatible",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Trust standing of a device's identity fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrustState {
    /// Never confirmed by the operator
    #[default]
    Pending,
    /// Operator confirmed the fingerprint
    Trusted,
    /// Operator rejected the fingerprint
    Rejected,
}

/// A known peer device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable device id
    pub id: Uuid,
    /// Advertised name
    pub name: String,
    /// Platform string
    pub platform: String,
    /// Last known addresses
    pub addresses: Vec<std::net::SocketAddr>,
    /// Transport port
    pub port: u16,
    /// Identity fingerprint, once seen
    pub fingerprint: Option<String>,
    /// Trust standing of the fingerprint
    #[serde(default)]
    pub trust: TrustState,
    /// Statically configured; exempt from expiry
    #[serde(default)]
    pub manual: bool,
    /// Highest peer sequence number we have applied
    #[serde(default)]
    pub cursor: i64,
    /// First time this device was seen (unix seconds)
    pub first_seen: i64,
    /// Last time this device was seen (unix seconds)
    pub last_seen: i64,

    /// Runtime connection state; resets on restart
    #[serde(skip)]
    pub state: ConnectionState,
    /// Consecutive connection failures; resets on success
    #[serde(skip)]
    pub consecutive_failures: u32,
}

impl DeviceRecord {
    fn from_info(info: &DeviceInfo, manual: bool) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: info.id,
            name: info.name.clone(),
            platform: info.platform.clone(),
            addresses: info.addresses.clone(),
            port: info.port,
            fingerprint: info.fingerprint.clone(),
            trust: TrustState::Pending,
            manual,
            cursor: 0,
            first_seen: now,
            last_seen: now,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
        }
    }

    /// Whether this device's identity is trusted
    pub fn is_trusted(&self) -> bool {
        self.trust == TrustState::Trusted
    }
}

/// Directory change events
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    /// New device added
    DeviceAdded(DeviceRecord),
    /// Existing device's metadata updated
    DeviceUpdated(DeviceRecord),
    /// Device removed (expired or evicted)
    DeviceRemoved(Uuid),
    /// Connection state transition
    StateChanged {
        /// Device id
        id: Uuid,
        /// New state
        state: ConnectionState,
    },
    /// Trust decision changed
    TrustChanged {
        /// Device id
        id: Uuid,
        /// New trust standing
        trust: TrustState,
    },
}

/// Manages known devices and their lifecycle
#[derive(Clone)]
pub struct PeerDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    devices: RwLock<HashMap<Uuid, DeviceRecord>>,
    event_tx: broadcast::Sender<DirectoryEvent>,
    path: PathBuf,
}

impl PeerDirectory {
    /// Load the directory from `path`, starting empty if absent
    pub async fn load(path: PathBuf) -> std::io::Result<Self> {
        let devices = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Vec<DeviceRecord>>(&content) {
                Ok(records) => {
                    info!("Loaded {} known devices", records.len());
                    records.into_iter().map(|r| (r.id, r)).collect()
                }
                Err(e) => {
                    warn!("Device directory unreadable, starting fresh: {}", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let (event_tx, _) = broadcast::channel(128);

        Ok(Self {
            inner: Arc::new(DirectoryInner {
                devices: RwLock::new(devices),
                event_tx,
                path,
            }),
        })
    }

    /// Subscribe to directory events
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.inner.event_tx.subscribe()
    }

    fn emit(&self, event: DirectoryEvent) {
        // Nobody listening is fine (CLI usage).
        let _ = self.inner.event_tx.send(event);
    }

    async fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records: Vec<DeviceRecord> = {
            let devices = self.inner.devices.read().await;
            devices.values().cloned().collect()
        };
        let content = serde_json::to_string_pretty(&records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.inner.path, content).await
    }

    /// Record a discovered device, adding or refreshing its entry
    pub async fn observe(&self, info: &DeviceInfo, manual: bool) -> std::io::Result<()> {
        let event = {
            let mut devices = self.inner.devices.write().await;
            let now = Utc::now().timestamp();

            if let Some(existing) = devices.get_mut(&info.id) {
                existing.name = info.name.clone();
                existing.platform = info.platform.clone();
                existing.addresses = info.addresses.clone();
                existing.port = info.port;
                existing.last_seen = now;
                existing.consecutive_failures = 0;
                if existing.fingerprint.is_none() {
                    existing.fingerprint = info.fingerprint.clone();
                }
                DirectoryEvent::DeviceUpdated(existing.clone())
            } else {
                let record = DeviceRecord::from_info(info, manual);
                devices.insert(info.id, record.clone());
                debug!("New device observed: {} ({})", record.name, record.id);
                DirectoryEvent::DeviceAdded(record)
            }
        };

        self.save().await?;
        self.emit(event);
        Ok(())
    }

    /// Get a device record
    pub async fn get(&self, id: &Uuid) -> Option<DeviceRecord> {
        self.inner.devices.read().await.get(id).cloned()
    }

    /// Find a device by identity fingerprint
    pub async fn get_by_fingerprint(&self, fingerprint: &str) -> Option<DeviceRecord> {
        self.inner
            .devices
            .read()
            .await
            .values()
            .find(|r| r.fingerprint.as_deref() == Some(fingerprint))
            .cloned()
    }

    /// All known devices
    pub async fn all(&self) -> Vec<DeviceRecord> {
        self.inner.devices.read().await.values().cloned().collect()
    }

    /// Whether a fingerprint is trusted on this device
    pub async fn is_fingerprint_trusted(&self, fingerprint: &str) -> bool {
        self.inner
            .devices
            .read()
            .await
            .values()
            .any(|r| r.fingerprint.as_deref() == Some(fingerprint) && r.is_trusted())
    }

    /// Bind an identity fingerprint to a device the first time its
    /// handshake arrives. A changed fingerprint for a known device is
    /// suspicious and resets trust.
    pub async fn bind_fingerprint(&self, id: &Uuid, fingerprint: &str) -> std::io::Result<()> {
        let event = {
            let mut devices = self.inner.devices.write().await;
            let Some(record) = devices.get_mut(id) else {
                return Ok(());
            };

            match record.fingerprint.as_deref() {
                Some(existing) if existing == fingerprint => None,
                Some(existing) => {
                    warn!(
                        "Device {} changed identity ({} -> {}), trust reset",
                        record.name, existing, fingerprint
                    );
                    record.fingerprint = Some(fingerprint.to_string());
                    record.trust = TrustState::Pending;
                    Some(DirectoryEvent::TrustChanged {
                        id: *id,
                        trust: TrustState::Pending,
                    })
                }
                None => {
                    record.fingerprint = Some(fingerprint.to_string());
                    None
                }
            }
        };

        self.save().await?;
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    /// Set the trust decision for a fingerprint. Returns the ids of the
    /// devices it applied to.
    pub async fn set_trust(
        &self,
        fingerprint: &str,
        trust: TrustState,
    ) -> std::io::Result<Vec<Uuid>> {
        let mut affected = Vec::new();
        {
            let mut devices = self.inner.devices.write().await;
            for record in devices.values_mut() {
                if record.fingerprint.as_deref() == Some(fingerprint) {
                    record.trust = trust;
                    affected.push(record.id);
                }
            }
        }

        self.save().await?;
        for id in &affected {
            self.emit(DirectoryEvent::TrustChanged { id: *id, trust });
        }

        match trust {
            TrustState::Trusted => info!("Trusted fingerprint {}", fingerprint),
            TrustState::Rejected => warn!("Rejected fingerprint {}", fingerprint),
            TrustState::Pending => {}
        }
        Ok(affected)
    }

    /// Update a device's runtime connection state
    pub async fn set_state(&self, id: &Uuid, state: ConnectionState) {
        let changed = {
            let mut devices = self.inner.devices.write().await;
            match devices.get_mut(id) {
                Some(record) if record.state != state => {
                    debug!("Device {} state: {} -> {}", record.name, record.state, state);
                    record.state = state;
                    if state == ConnectionState::Connected {
                        record.consecutive_failures = 0;
                        record.last_seen = Utc::now().timestamp();
                    }
                    true
                }
                _ => false,
            }
        };

        if changed {
            self.emit(DirectoryEvent::StateChanged { id: *id, state });
        }
    }

    /// Count a connection failure; returns true once the failure
    /// threshold is reached and the peer should be considered offline.
    pub async fn mark_failure(&self, id: &Uuid) -> bool {
        let mut devices = self.inner.devices.write().await;
        if let Some(record) = devices.get_mut(id) {
            record.consecutive_failures += 1;
            return record.consecutive_failures >= MAX_CONSECUTIVE_FAILURES;
        }
        false
    }

    /// Refresh a device's last-seen time
    pub async fn touch(&self, id: &Uuid) {
        let mut devices = self.inner.devices.write().await;
        if let Some(record) = devices.get_mut(id) {
            record.last_seen = Utc::now().timestamp();
            record.consecutive_failures = 0;
        }
    }

    /// Stored reconciliation cursor for a peer
    pub async fn cursor(&self, id: &Uuid) -> i64 {
        self.inner
            .devices
            .read()
            .await
            .get(id)
            .map(|r| r.cursor)
            .unwrap_or(0)
    }

    /// Advance the reconciliation cursor for a peer
    pub async fn set_cursor(&self, id: &Uuid, cursor: i64) -> std::io::Result<()> {
        {
            let mut devices = self.inner.devices.write().await;
            if let Some(record) = devices.get_mut(id) {
                if cursor > record.cursor {
                    record.cursor = cursor;
                }
            }
        }
        self.save().await
    }

    /// Remove a device entirely
    pub async fn remove(&self, id: &Uuid) -> std::io::Result<()> {
        let removed = self.inner.devices.write().await.remove(id).is_some();
        if removed {
            self.save().await?;
            self.emit(DirectoryEvent::DeviceRemoved(*id));
        }
        Ok(())
    }

    /// Drop transient devices not seen within the timeout. Manual peers
    /// and anything with a trust decision persist indefinitely.
    pub async fn expire_stale(&self) -> std::io::Result<Vec<Uuid>> {
        let now = Utc::now().timestamp();
        let expired: Vec<Uuid> = {
            let devices = self.inner.devices.read().await;
            devices
                .values()
                .filter(|r| {
                    !r.manual
                        && r.trust == TrustState::Pending
                        && now - r.last_seen > PEER_TIMEOUT_SECS
                })
                .map(|r| r.id)
                .collect()
        };

        for id in &expired {
            self.remove(id).await?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    fn test_info(id: Uuid, name: &str) -> DeviceInfo {
        DeviceInfo {
            id,
            name: name.to_string(),
            addresses: vec!["192.168.1.10:13129".parse::<SocketAddr>().unwrap()],
            port: 13129,
            protocol_version: 1,
            platform: "linux".to_string(),
            fingerprint: Some("aa:bb:cc".to_string()),
        }
    }

    async fn test_directory(temp: &TempDir) -> PeerDirectory {
        PeerDirectory::load(temp.path().join("devices.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_observe_and_get() {
        let temp = TempDir::new().unwrap();
        let directory = test_directory(&temp).await;
        let id = Uuid::new_v4();

        directory.observe(&test_info(id, "desk"), false).await.unwrap();

        let record = directory.get(&id).await.unwrap();
        assert_eq!(record.name, "desk");
        assert_eq!(record.trust, TrustState::Pending);
        assert_eq!(record.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let temp = TempDir::new().unwrap();
        let id = Uuid::new_v4();

        {
            let directory = test_directory(&temp).await;
            directory.observe(&test_info(id, "desk"), false).await.unwrap();
            directory.set_trust("aa:bb:cc", TrustState::Trusted).await.unwrap();
            directory.set_cursor(&id, 42).await.unwrap();
            directory.set_state(&id, ConnectionState::Connected).await;
        }

        let reloaded = test_directory(&temp).await;
        let record = reloaded.get(&id).await.unwrap();
        assert!(record.is_trusted());
        assert_eq!(record.cursor, 42);
        // Runtime state does not persist.
        assert_eq!(record.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_trust_by_fingerprint() {
        let temp = TempDir::new().unwrap();
        let directory = test_directory(&temp).await;
        let id = Uuid::new_v4();

        directory.observe(&test_info(id, "desk"), false).await.unwrap();
        assert!(!directory.is_fingerprint_trusted("aa:bb:cc").await);

        let affected = directory
            .set_trust("aa:bb:cc", TrustState::Trusted)
            .await
            .unwrap();
        assert_eq!(affected, vec![id]);
        assert!(directory.is_fingerprint_trusted("aa:bb:cc").await);
    }

    #[tokio::test]
    async fn test_fingerprint_change_resets_trust() {
        let temp = TempDir::new().unwrap();
        let directory = test_directory(&temp).await;
        let id = Uuid::new_v4();

        directory.observe(&test_info(id, "desk"), false).await.unwrap();
        directory.set_trust("aa:bb:cc", TrustState::Trusted).await.unwrap();

        directory.bind_fingerprint(&id, "dd:ee:ff").await.unwrap();

        let record = directory.get(&id).await.unwrap();
        assert_eq!(record.trust, TrustState::Pending);
        assert_eq!(record.fingerprint.as_deref(), Some("dd:ee:ff"));
    }

    #[tokio::test]
    async fn test_failure_threshold() {
        let temp = TempDir::new().unwrap();
        let directory = test_directory(&temp).await;
        let id = Uuid::new_v4();

        directory.observe(&test_info(id, "desk"), false).await.unwrap();

        assert!(!directory.mark_failure(&id).await);
        assert!(!directory.mark_failure(&id).await);
        assert!(directory.mark_failure(&id).await);

        // Success clears the counter.
        directory.touch(&id).await;
        assert!(!directory.mark_failure(&id).await);
    }

    #[tokio::test]
    async fn test_events() {
        let temp = TempDir::new().unwrap();
        let directory = test_directory(&temp).await;
        let mut events = directory.subscribe();
        let id = Uuid::new_v4();

        directory.observe(&test_info(id, "desk"), false).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            DirectoryEvent::DeviceAdded(_)
        ));

        directory.set_state(&id, ConnectionState::Connecting).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            DirectoryEvent::StateChanged {
                state: ConnectionState::Connecting,
                ..
            }
        ));
    }
}
