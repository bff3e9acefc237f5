//! Common types for service discovery

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::transport::protocol::PROTOCOL_VERSION;

/// Information about a discovered device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Unique identifier for the device
    pub id: Uuid,
    /// Human-readable name (hostname)
    pub name: String,
    /// Network addresses where the device can be reached
    pub addresses: Vec<SocketAddr>,
    /// Transport port number
    pub port: u16,
    /// Protocol version announced by the device
    pub protocol_version: u32,
    /// Platform information (macos, linux, etc)
    pub platform: String,
    /// Identity key fingerprint, if announced
    pub fingerprint: Option<String>,
}

/// Service information for announcement
#[derive(Debug, Clone)]
pub struct ServiceAnnouncement {
    /// Our device ID
    pub id: Uuid,
    /// Name to announce
    pub name: String,
    /// Port we're listening on
    pub port: u16,
    /// TXT record data
    pub txt_data: Vec<(String, String)>,
}

/// Discovery events
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// New device resolved on the network
    DeviceFound(DeviceInfo),
    /// Device announcement went away
    DeviceLost(Uuid),
    /// Discovery error occurred
    Error(String),
}

impl ServiceAnnouncement {
    /// Build our announcement from identity data
    pub fn new(id: Uuid, name: String, port: u16, fingerprint: String) -> Self {
        Self {
            id,
            name,
            port,
            txt_data: vec![
                ("id".to_string(), id.to_string()),
                ("proto".to_string(), PROTOCOL_VERSION.to_string()),
                ("platform".to_string(), std::env::consts::OS.to_string()),
                ("fp".to_string(), fingerprint),
            ],
        }
    }
}

impl DeviceInfo {
    /// Create DeviceInfo from mDNS TXT record data
    pub fn from_txt(
        name: String,
        addresses: Vec<SocketAddr>,
        port: u16,
        txt_data: &[(String, String)],
    ) -> Self {
        let find = |key: &str| {
            txt_data
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        let id = find("id")
            .and_then(|v| Uuid::parse_str(&v).ok())
            .unwrap_or_else(Uuid::new_v4);

        let protocol_version = find("proto")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let platform = find("platform").unwrap_or_else(|| "unknown".to_string());

        Self {
            id,
            name,
            addresses,
            port,
            protocol_version,
            platform,
            fingerprint: find("fp"),
        }
    }

    /// A device statically configured by address. The placeholder id is
    /// derived from the address so restarts do not mint duplicates; the
    /// real id is adopted at first handshake.
    pub fn manual(addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_URL, addr.to_string().as_bytes()),
            name: addr.to_string(),
            addresses: vec![addr],
            port: addr.port(),
            protocol_version: PROTOCOL_VERSION,
            platform: "unknown".to_string(),
            fingerprint: None,
        }
    }

    /// Get the best address to connect to (prefer IPv4)
    pub fn best_address(&self) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|addr| matches!(addr.ip(), IpAddr::V4(_)))
            .or_else(|| self.addresses.first())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_from_txt_parses_metadata() {
        let id = Uuid::new_v4();
        let txt = vec![
            ("id".to_string(), id.to_string()),
            ("proto".to_string(), PROTOCOL_VERSION.to_string()),
            ("platform".to_string(), "linux".to_string()),
            ("fp".to_string(), "ab:cd".to_string()),
        ];

        let info = DeviceInfo::from_txt(
            "desk".to_string(),
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 13129)],
            13129,
            &txt,
        );

        assert_eq!(info.id, id);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(info.platform, "linux");
        assert_eq!(info.fingerprint.as_deref(), Some("ab:cd"));
    }

    #[test]
    fn test_best_address_prefers_ipv4() {
        let v6: SocketAddr = "[::1]:13129".parse().unwrap();
        let v4: SocketAddr = "10.0.0.2:13129".parse().unwrap();

        let mut info = DeviceInfo::manual(v6);
        info.addresses.push(v4);

        assert_eq!(info.best_address(), Some(v4));
    }
}
