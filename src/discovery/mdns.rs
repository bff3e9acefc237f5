//! mDNS/DNS-SD service discovery implementation

use crate::discovery::{
    types::{DeviceInfo, DiscoveryEvent, ServiceAnnouncement},
    Discovery,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo as MdnsServiceInfo, TxtProperties};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

const SERVICE_TYPE: &str = "_pastesync._tcp.local.";
const BROWSE_TIMEOUT_MS: u64 = 5000;

/// mDNS-based service discovery
pub struct MdnsDiscovery {
    daemon: Arc<Mutex<Option<ServiceDaemon>>>,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    event_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    service_handle: Arc<Mutex<Option<String>>>,
    browse_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
    our_id: Arc<RwLock<Option<Uuid>>>,
}

impl MdnsDiscovery {
    /// Create a new mDNS discovery instance
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);
        Self {
            daemon: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            service_handle: Arc::new(Mutex::new(None)),
            browse_handle: Arc::new(RwLock::new(None)),
            our_id: Arc::new(RwLock::new(None)),
        }
    }

    /// Start browsing for services
    async fn start_browsing(&self) -> Result<()> {
        let daemon = self.daemon.lock().await;
        let daemon = daemon
            .as_ref()
            .ok_or_else(|| anyhow!("mDNS daemon not started"))?;

        let receiver = daemon.browse(SERVICE_TYPE)?;
        let event_tx = self.event_tx.clone();
        let our_id = self.our_id.clone();

        // Spawn browser task
        let handle = tokio::spawn(async move {
            Self::browse_loop(receiver, event_tx, our_id).await;
        });

        let mut browse_handle = self.browse_handle.write().await;
        *browse_handle = Some(handle);

        Ok(())
    }

    /// Browse loop to handle discovered services
    async fn browse_loop(
        receiver: mdns_sd::Receiver<ServiceEvent>,
        event_tx: mpsc::Sender<DiscoveryEvent>,
        our_id: Arc<RwLock<Option<Uuid>>>,
    ) {
        loop {
            match receiver.recv_timeout(std::time::Duration::from_millis(BROWSE_TIMEOUT_MS)) {
                Ok(event) => {
                    if let Err(e) = Self::handle_service_event(event, &event_tx, &our_id).await {
                        tracing::error!("Error handling mDNS event: {}", e);
                    }
                }
                Err(_) => {
                    // Timeout is expected during normal operation
                }
            }
        }
    }

    /// Handle a service discovery event
    async fn handle_service_event(
        event: ServiceEvent,
        event_tx: &mpsc::Sender<DiscoveryEvent>,
        our_id: &Arc<RwLock<Option<Uuid>>>,
    ) -> Result<()> {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let device_info = Self::parse_service_info(&info)?;

                // Skip our own announcement
                let our_id = our_id.read().await;
                if let Some(id) = our_id.as_ref() {
                    if device_info.id == *id {
                        return Ok(());
                    }
                }

                let _ = event_tx.send(DiscoveryEvent::DeviceFound(device_info)).await;
            }
            ServiceEvent::ServiceRemoved(_, full_name) => {
                if let Some(device_id) = Self::extract_device_id(&full_name) {
                    let _ = event_tx.send(DiscoveryEvent::DeviceLost(device_id)).await;
                }
            }
            _ => {
                // Other events we don't need to handle
            }
        }

        Ok(())
    }

    /// Parse mDNS service info into DeviceInfo
    fn parse_service_info(info: &MdnsServiceInfo) -> Result<DeviceInfo> {
        let txt_data = Self::parse_txt_records(info.get_properties());

        let addresses: Vec<SocketAddr> = info
            .get_addresses()
            .iter()
            .map(|addr| SocketAddr::new(*addr, info.get_port()))
            .collect();

        if addresses.is_empty() {
            return Err(anyhow!("No addresses found for service"));
        }

        // Service hostname minus the .local. suffix
        let name = info
            .get_hostname()
            .trim_end_matches(".local.")
            .trim_end_matches('.')
            .to_string();

        Ok(DeviceInfo::from_txt(
            name,
            addresses,
            info.get_port(),
            &txt_data,
        ))
    }

    /// Parse TXT records into key-value pairs
    fn parse_txt_records(properties: &TxtProperties) -> Vec<(String, String)> {
        properties
            .iter()
            .map(|prop| {
                let key = prop.key().to_string();
                let value = if let Some(val) = prop.val() {
                    String::from_utf8_lossy(val).to_string()
                } else {
                    String::new()
                };
                (key, value)
            })
            .collect()
    }

    /// Extract device ID from a full service name
    fn extract_device_id(full_name: &str) -> Option<Uuid> {
        // Service name format: "PasteSync-{uuid}.{service_type}"
        let parts: Vec<&str> = full_name.split('.').collect();
        if let Some(name_part) = parts.first() {
            if let Some(uuid_str) = name_part.strip_prefix("PasteSync-") {
                return Uuid::parse_str(uuid_str).ok();
            }
        }
        None
    }

    /// Create mDNS service info from our announcement
    fn create_mdns_service_info(announcement: &ServiceAnnouncement) -> Result<MdnsServiceInfo> {
        let service_name = format!("PasteSync-{}", announcement.id);
        let hostname = format!("{}.local.", announcement.name);

        let mut properties = HashMap::new();
        for (key, value) in &announcement.txt_data {
            properties.insert(key.clone(), value.clone());
        }

        let addresses = Self::get_local_addresses()?;
        if addresses.is_empty() {
            return Err(anyhow!("No local IP addresses found"));
        }

        Ok(MdnsServiceInfo::new(
            SERVICE_TYPE,
            &service_name,
            &hostname,
            addresses[0],
            announcement.port,
            Some(properties),
        )?)
    }

    /// Get local IP addresses (excluding loopback)
    fn get_local_addresses() -> Result<Vec<IpAddr>> {
        let mut addresses = Vec::new();

        for iface in if_addrs::get_if_addrs()? {
            if !iface.is_loopback() {
                addresses.push(iface.ip());
            }
        }

        Ok(addresses)
    }
}

impl Default for MdnsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn start(&mut self) -> Result<()> {
        let daemon = ServiceDaemon::new()?;
        *self.daemon.lock().await = Some(daemon);

        self.start_browsing().await?;

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.browse_handle.write().await.take() {
            handle.abort();
        }

        if let Some(service_name) = self.service_handle.lock().await.take() {
            if let Some(daemon) = self.daemon.lock().await.as_ref() {
                daemon.unregister(&service_name)?;
            }
        }

        if let Some(daemon) = self.daemon.lock().await.take() {
            daemon.shutdown()?;
        }

        Ok(())
    }

    async fn announce(&mut self, announcement: ServiceAnnouncement) -> Result<()> {
        let daemon = self.daemon.lock().await;
        let daemon = daemon
            .as_ref()
            .ok_or_else(|| anyhow!("mDNS daemon not started"))?;

        *self.our_id.write().await = Some(announcement.id);

        let mdns_info = Self::create_mdns_service_info(&announcement)?;
        let service_name = mdns_info.get_fullname().to_string();

        daemon.register(mdns_info)?;

        *self.service_handle.lock().await = Some(service_name);

        Ok(())
    }

    fn subscribe(&mut self) -> mpsc::Receiver<DiscoveryEvent> {
        self.event_rx
            .take()
            .expect("discovery events already subscribed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_device_id() {
        let full_name = "PasteSync-550e8400-e29b-41d4-a716-446655440000._pastesync._tcp.local.";
        let device_id = MdnsDiscovery::extract_device_id(full_name);
        assert!(device_id.is_some());
        assert_eq!(
            device_id.unwrap().to_string(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn test_extract_device_id_rejects_foreign_name() {
        assert!(MdnsDiscovery::extract_device_id("Printer-1._ipp._tcp.local.").is_none());
    }

    #[tokio::test]
    async fn test_mdns_lifecycle() {
        let mut discovery = MdnsDiscovery::new();

        // Start and stop should both succeed even with no peers around
        if discovery.start().await.is_ok() {
            assert!(discovery.stop().await.is_ok());
        }
    }
}
