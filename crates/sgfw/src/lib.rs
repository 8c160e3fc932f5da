//! sgfw: Stateful security-group firewall driver for OVS integration bridges
//!
//! This crate provides:
//! - Compilation of declarative security-group rules into OpenFlow flows
//! - Connection learning via `learn()` reverse-flow templates with finite timeouts
//! - The fixed per-port scaffold: anti-spoofing, DHCP, IPv6 ND/RA and ARP handling
//! - L4 port-range expansion into value/mask matches
//! - A driver orchestrating port, rule and member catalogs with deferred apply
//! - An `ovs-ofctl`/OVSDB bridge transport behind the `BridgeClient` seam

pub mod bridge;
pub mod config;
pub mod error;
pub mod firewall;
pub mod flow;
pub mod ovsdb;
pub mod port;
pub mod port_mask;
pub mod rules;
mod scaffold;

pub use bridge::{BridgeClient, OfctlBridge, VifPort};
pub use config::{FirewallConfig, OfInterface};
pub use error::{FirewallError, Phase};
pub use firewall::OvsFirewallDriver;
pub use flow::{Flow, FlowMatch, LearnSpec, PortMatch, Proto};
pub use ovsdb::OvsdbClient;
pub use port::{PortDesc, SgMembers};
pub use port_mask::port_rule_masking;
pub use rules::{Direction, EtherType, RuleProtocol, SecurityGroupRule};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::bridge::{BridgeClient, OfctlBridge, VifPort};
    pub use super::config::FirewallConfig;
    pub use super::error::{FirewallError, Phase};
    pub use super::firewall::OvsFirewallDriver;
    pub use super::flow::{Flow, FlowMatch, PortMatch, Proto};
    pub use super::port::{PortDesc, SgMembers};
    pub use super::rules::{Direction, EtherType, RuleProtocol, SecurityGroupRule};
}
