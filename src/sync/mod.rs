//! Sync engine: composes discovery, the peer directory, secure
//! sessions, the record store, and the HTTP transport into the running
//! service.

pub mod reconcile;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use reconcile::{Applied, PullJob, Reconciler};
pub use state::{Backoff, ClientPool, PeerResolver};

use crate::config::Config;
use crate::directory::{DirectoryEvent, PeerDirectory, TrustState};
use crate::discovery::{Discovery, DiscoveryEvent, MdnsDiscovery, ServiceAnnouncement};
use crate::identity::DeviceIdentity;
use crate::paste::{BlobStore, Encryptor, PasteStore};
use crate::secure::SecureStore;
use crate::transport::protocol::{SyncBatch, SyncMessage};
use crate::transport::{AppState, PasteServer};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const FANOUT_BATCH_MAX: usize = 32;

/// The assembled service
pub struct SyncEngine {
    config: Arc<Config>,
    identity: Arc<DeviceIdentity>,
    directory: PeerDirectory,
    secure: SecureStore,
    store: Arc<PasteStore>,
    blobs: BlobStore,
    reconciler: Arc<Reconciler>,
    clients: ClientPool,
    pull_rx: Mutex<Option<mpsc::UnboundedReceiver<PullJob>>>,
    resolvers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build the engine from configuration, opening all persistent state
    pub async fn bootstrap(config: Config) -> crate::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let identity = Arc::new(DeviceIdentity::load_or_create(&config.security.identity_key)?);
        info!(
            "Device {} ({}), fingerprint {}",
            config.device_name,
            config.device_id,
            identity.fingerprint()
        );

        let encryptor = Encryptor::new(&config.security.store_key)?;
        let store = Arc::new(PasteStore::open(&config.storage.database, encryptor).await?);
        let blobs = BlobStore::open(&config.storage.blob_dir)?;
        let directory = PeerDirectory::load(config.security.trust_db.clone()).await?;

        let (reconciler, pull_rx) =
            Reconciler::new(config.device_id, store.clone(), blobs.clone());

        Ok(Self {
            config,
            identity,
            directory,
            secure: SecureStore::new(),
            store,
            blobs,
            reconciler,
            clients: Arc::new(RwLock::new(HashMap::new())),
            pull_rx: Mutex::new(Some(pull_rx)),
            resolvers: Mutex::new(HashMap::new()),
        })
    }

    /// The reconciler, for local record operations
    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    /// The record store
    pub fn store(&self) -> Arc<PasteStore> {
        self.store.clone()
    }

    /// The device directory
    pub fn directory(&self) -> PeerDirectory {
        self.directory.clone()
    }

    /// The local identity
    pub fn identity(&self) -> Arc<DeviceIdentity> {
        self.identity.clone()
    }

    /// Run the service until cancelled
    pub async fn start(&self) -> anyhow::Result<()> {
        info!("Starting sync engine");

        let listener = TcpListener::bind(self.config.network.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        // Resolvers for everything we already know about.
        for record in self.directory.all().await {
            self.ensure_resolver(record.id).await;
        }

        let server_task = self.run_server(listener);
        let discovery_task = self.run_discovery(local_addr.port());
        let events_task = self.run_directory_events();
        let fanout_task = self.run_fanout();
        let pull_task = self.run_pulls();
        let maintenance_task = self.run_maintenance();

        tokio::try_join!(
            server_task,
            discovery_task,
            events_task,
            fanout_task,
            pull_task,
            maintenance_task
        )?;

        Ok(())
    }

    async fn run_server(&self, listener: TcpListener) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            identity: self.identity.clone(),
            directory: self.directory.clone(),
            secure: self.secure.clone(),
            store: self.store.clone(),
            blobs: self.blobs.clone(),
            reconciler: self.reconciler.clone(),
        });

        PasteServer::new(state).serve(listener).await?;
        Ok(())
    }

    async fn run_discovery(&self, listen_port: u16) -> anyhow::Result<()> {
        // Manual peers are seeded whether or not mDNS is available.
        for addr in &self.config.network.manual_peers {
            let info = crate::discovery::DeviceInfo::manual(*addr);
            self.directory.observe(&info, true).await?;
        }

        if !self.config.network.enable_mdns {
            debug!("mDNS disabled, relying on manual peers");
            return std::future::pending().await;
        }

        let mut discovery = MdnsDiscovery::new();
        discovery.start().await?;
        discovery
            .announce(ServiceAnnouncement::new(
                self.config.device_id,
                self.config.device_name.clone(),
                listen_port,
                self.identity.fingerprint(),
            ))
            .await?;

        let mut events = discovery.subscribe();
        while let Some(event) = events.recv().await {
            match event {
                DiscoveryEvent::DeviceFound(info) => {
                    if let Err(e) = self.directory.observe(&info, false).await {
                        warn!("Failed to record discovered device: {}", e);
                    }
                }
                DiscoveryEvent::DeviceLost(id) => {
                    // The announcement went away; trust and history stay.
                    self.directory
                        .set_state(&id, crate::directory::ConnectionState::Disconnected)
                        .await;
                }
                DiscoveryEvent::Error(e) => warn!("Discovery error: {}", e),
            }
        }

        Ok(())
    }

    async fn run_directory_events(&self) -> anyhow::Result<()> {
        let mut events = self.directory.subscribe();

        loop {
            match events.recv().await {
                Ok(DirectoryEvent::DeviceAdded(record)) => {
                    self.ensure_resolver(record.id).await;
                }
                Ok(DirectoryEvent::TrustChanged { id, trust }) => {
                    if trust == TrustState::Trusted {
                        self.ensure_resolver(id).await;
                    } else {
                        // Any live session dies with the trust decision.
                        self.secure.remove(&id).await;
                        self.clients.write().await.remove(&id);
                    }
                }
                Ok(DirectoryEvent::DeviceRemoved(id)) => {
                    if let Some(handle) = self.resolvers.lock().await.remove(&id) {
                        handle.abort();
                    }
                    self.secure.remove(&id).await;
                    self.clients.write().await.remove(&id);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Directory event stream lagged by {}", count);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("Directory event stream closed");
                    return Ok(());
                }
            }
        }
    }

    async fn ensure_resolver(&self, peer_id: Uuid) {
        let mut resolvers = self.resolvers.lock().await;
        if let Some(handle) = resolvers.get(&peer_id) {
            if !handle.is_finished() {
                return;
            }
        }

        debug!("Spawning resolver for {}", peer_id);
        let resolver = PeerResolver {
            config: self.config.clone(),
            identity: self.identity.clone(),
            directory: self.directory.clone(),
            secure: self.secure.clone(),
            store: self.store.clone(),
            reconciler: self.reconciler.clone(),
            clients: self.clients.clone(),
        };
        resolvers.insert(peer_id, tokio::spawn(resolver.run(peer_id)));
    }

    /// Fan local mutations out to every connected peer. A failed push is
    /// only logged: the peer's cursor will recover it at the next
    /// catch-up.
    async fn run_fanout(&self) -> anyhow::Result<()> {
        let mut events = self.reconciler.subscribe_local();

        loop {
            let first = match events.recv().await {
                Ok(message) => message,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Fanout lagged by {} mutations", count);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("Local mutation stream closed");
                    return Ok(());
                }
            };

            // Coalesce whatever else is already queued.
            let mut messages: Vec<SyncMessage> = vec![first];
            while messages.len() < FANOUT_BATCH_MAX {
                match events.try_recv() {
                    Ok(message) => messages.push(message),
                    Err(_) => break,
                }
            }

            let batch = SyncBatch {
                sender: self.config.device_id,
                messages,
            };

            let clients: Vec<_> = self
                .clients
                .read()
                .await
                .values()
                .cloned()
                .collect();

            for client in clients {
                if let Err(e) = client.send_batch(&batch).await {
                    debug!("Push to {} failed: {}", client.peer_id(), e);
                }
            }
        }
    }

    async fn run_pulls(&self) -> anyhow::Result<()> {
        let mut pull_rx = self
            .pull_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("pull queue already consumed"))?;

        while let Some(job) = pull_rx.recv().await {
            let client = self.clients.read().await.get(&job.source).cloned();
            let Some(client) = client else {
                // Source is not connected; the resolver retries
                // incomplete records on its next connect.
                debug!(
                    "Deferring blob pull for record {} (peer {} offline)",
                    job.record_id, job.source
                );
                continue;
            };

            match self
                .reconciler
                .run_pull_job(&client, &job, self.config.sync.chunk_retries)
                .await
            {
                Ok(true) => debug!("Record {} blobs complete", job.record_id),
                Ok(false) => {}
                Err(e) => warn!("Blob pull for record {} failed: {}", job.record_id, e),
            }
        }

        Ok(())
    }

    async fn run_maintenance(&self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            interval.tick().await;

            match self.directory.expire_stale().await {
                Ok(expired) if !expired.is_empty() => {
                    debug!("Expired {} stale devices", expired.len());
                }
                Ok(_) => {}
                Err(e) => warn!("Device expiry failed: {}", e),
            }

            let horizon = chrono::Utc::now()
                - chrono::Duration::days(self.config.storage.tombstone_days as i64);
            match self.store.prune(self.config.storage.retention, horizon).await {
                Ok(removed) if removed > 0 => debug!("Pruned {} records", removed),
                Ok(_) => {}
                Err(e) => warn!("Store pruning failed: {}", e),
            }
        }
    }
}
