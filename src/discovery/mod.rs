//! Peer discovery on the local network

pub mod mdns;
pub mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use mdns::MdnsDiscovery;
pub use types::{DeviceInfo, DiscoveryEvent, ServiceAnnouncement};

/// Discovery backend interface
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start browsing for peer devices
    async fn start(&mut self) -> anyhow::Result<()>;

    /// Stop browsing and withdraw our announcement
    async fn stop(&mut self) -> anyhow::Result<()>;

    /// Announce our own service
    async fn announce(&mut self, announcement: ServiceAnnouncement) -> anyhow::Result<()>;

    /// Receive discovery events
    fn subscribe(&mut self) -> mpsc::Receiver<DiscoveryEvent>;
}
