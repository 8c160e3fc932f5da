//! Driver configuration
//!
//! Mirrors the agent's OVS option group. Only `integration_bridge` selects
//! what the driver manages; the remaining options exist to resolve the
//! outbound patch port and to choose the ofctl transport.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which ofctl transport drives the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfInterface {
    #[serde(rename = "ovs-ofctl")]
    OvsOfctl,
    #[serde(rename = "ovsdpdk-ofctl")]
    OvsdpdkOfctl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Integration bridge under management.
    #[serde(default = "default_integration_bridge")]
    pub integration_bridge: String,

    /// Tunnel bridge paired with the integration bridge.
    #[serde(default = "default_tunnel_bridge")]
    pub tunnel_bridge: String,

    /// Peer patch port in the integration bridge for the tunnel bridge.
    #[serde(default = "default_int_peer_patch_port")]
    pub int_peer_patch_port: String,

    /// Peer patch port in the tunnel bridge for the integration bridge.
    #[serde(default = "default_tun_peer_patch_port")]
    pub tun_peer_patch_port: String,

    /// Local tunnel endpoint; set when tunneling is in use.
    #[serde(default)]
    pub local_ip: Option<IpAddr>,

    /// `<physical_network>:<bridge>` mappings for provider networks.
    #[serde(default)]
    pub bridge_mappings: Vec<String>,

    /// Interconnect integration and physical bridges with veths instead of
    /// patch ports.
    #[serde(default)]
    pub use_veth_interconnection: bool,

    #[serde(default = "default_of_interface")]
    pub of_interface: OfInterface,
}

fn default_integration_bridge() -> String {
    "br-int".to_string()
}

fn default_tunnel_bridge() -> String {
    "br-tun".to_string()
}

fn default_int_peer_patch_port() -> String {
    "patch-tun".to_string()
}

fn default_tun_peer_patch_port() -> String {
    "patch-int".to_string()
}

fn default_of_interface() -> OfInterface {
    OfInterface::OvsdpdkOfctl
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            integration_bridge: default_integration_bridge(),
            tunnel_bridge: default_tunnel_bridge(),
            int_peer_patch_port: default_int_peer_patch_port(),
            tun_peer_patch_port: default_tun_peer_patch_port(),
            local_ip: None,
            bridge_mappings: Vec::new(),
            use_veth_interconnection: false,
            of_interface: default_of_interface(),
        }
    }
}

impl FirewallConfig {
    /// Name of the patch port broadcast ingress traffic leaves through:
    /// the tunnel peer patch when tunneling, otherwise the patch towards the
    /// first mapped physical bridge.
    pub fn outbound_patch_port(&self) -> String {
        if self.local_ip.is_some() {
            return self.int_peer_patch_port.clone();
        }
        if let Some(mapping) = self.bridge_mappings.first() {
            if let Some((_physnet, bridge)) = mapping.split_once(':') {
                return format!("int-{bridge}");
            }
        }
        self.int_peer_patch_port.clone()
    }
}
