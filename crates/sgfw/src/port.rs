//! Port (VIF) descriptions and security-group member sets

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::rules::EtherType;

/// Lowest usable zone id (doubles as the tenant VLAN tag).
pub const ZONE_MIN: u16 = 1;
/// Highest usable zone id.
pub const ZONE_MAX: u16 = 4094;

/// Description of a tenant VIF as delivered by the agent.
///
/// `ofport` may be absent in the description; the driver then falls back to
/// resolving the device on the bridge before programming it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDesc {
    pub device: String,
    #[serde(default)]
    pub ofport: Option<u32>,
    pub mac_address: String,
    pub zone_id: u16,
    #[serde(default)]
    pub fixed_ips: Vec<IpAddr>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub security_group_source_groups: Vec<String>,
}

impl PortDesc {
    /// Fixed IPs of one address family, in description order.
    pub fn fixed_ips_of(&self, ethertype: EtherType) -> impl Iterator<Item = &IpAddr> {
        self.fixed_ips
            .iter()
            .filter(move |ip| EtherType::of(ip) == ethertype)
    }
}

/// Member addresses of one security group, split by address family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SgMembers {
    #[serde(rename = "IPv4", default)]
    pub ipv4: Vec<IpAddr>,
    #[serde(rename = "IPv6", default)]
    pub ipv6: Vec<IpAddr>,
}

impl SgMembers {
    pub fn of(&self, ethertype: EtherType) -> &[IpAddr] {
        match ethertype {
            EtherType::IPv4 => &self.ipv4,
            EtherType::IPv6 => &self.ipv6,
        }
    }
}
