//! Security-group firewall driver for the integration bridge
//!
//! The driver owns the in-memory catalogs (rules, group members, filtered
//! ports) and compiles them into flow programming through a `BridgeClient`.
//! It is the sole writer for tables 0, 1, 2, 11 and 12 on its bridge; two
//! drivers must not bind to the same bridge.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bridge::BridgeClient;
use crate::config::FirewallConfig;
use crate::error::{FirewallError, Phase};
use crate::flow::Flow;
use crate::port::{PortDesc, SgMembers, ZONE_MAX, ZONE_MIN};
use crate::rules::{self, Direction, EtherType, SecurityGroupRule};
use crate::scaffold;

/// The firewall driver.
///
/// All mutation entry points take `&mut self`, so a host calling in from
/// several threads serializes on whatever lock it wraps the driver in; the
/// driver itself suspends only on bridge calls.
pub struct OvsFirewallDriver {
    bridge: Arc<dyn BridgeClient>,
    config: FirewallConfig,
    sg_rules: HashMap<String, Vec<SecurityGroupRule>>,
    sg_members: HashMap<String, SgMembers>,
    /// Previous member snapshot, used to compute re-application deltas.
    pre_sg_members: HashMap<String, SgMembers>,
    filtered_ports: BTreeMap<String, PortDesc>,
    deferred: bool,
    deferred_ports: BTreeSet<String>,
    deferred_removals: BTreeMap<String, PortDesc>,
    deferred_rule_groups: BTreeSet<String>,
}

impl OvsFirewallDriver {
    pub fn new(bridge: Arc<dyn BridgeClient>, config: FirewallConfig) -> Self {
        Self {
            bridge,
            config,
            sg_rules: HashMap::new(),
            sg_members: HashMap::new(),
            pre_sg_members: HashMap::new(),
            filtered_ports: BTreeMap::new(),
            deferred: false,
            deferred_ports: BTreeSet::new(),
            deferred_removals: BTreeMap::new(),
            deferred_rule_groups: BTreeSet::new(),
        }
    }

    /// Devices currently filtered, sorted.
    pub fn ports(&self) -> Vec<&str> {
        self.filtered_ports.keys().map(String::as_str).collect()
    }

    /// The ports currently programmed, by device.
    pub fn filtered_ports(&self) -> &BTreeMap<String, PortDesc> {
        &self.filtered_ports
    }

    /// Install the scaffold and rule flows for a port. Idempotent for an
    /// unchanged description and catalog.
    pub async fn prepare_port_filter(&mut self, port: PortDesc) -> Result<(), FirewallError> {
        self.validate(&port)?;
        info!(device = %port.device, "preparing port filter");
        if self.deferred {
            self.deferred_removals.remove(&port.device);
            self.deferred_ports.insert(port.device.clone());
            self.filtered_ports.insert(port.device.clone(), port);
            return Ok(());
        }
        self.setup_port_filter(&port).await?;
        self.filtered_ports.insert(port.device.clone(), port);
        Ok(())
    }

    /// Reprogram a port after its description changed.
    pub async fn update_port_filter(&mut self, port: PortDesc) -> Result<(), FirewallError> {
        if !self.filtered_ports.contains_key(&port.device) {
            warn!(device = %port.device, "update for an unfiltered device, preparing it instead");
        }
        self.prepare_port_filter(port).await
    }

    /// Drop every flow bound to a device and forget it.
    pub async fn remove_port_filter(&mut self, port: &PortDesc) -> Result<(), FirewallError> {
        info!(device = %port.device, "removing port filter");
        let desc = self
            .filtered_ports
            .remove(&port.device)
            .unwrap_or_else(|| port.clone());
        self.deferred_ports.remove(&port.device);
        if self.deferred {
            self.deferred_removals.insert(desc.device.clone(), desc);
            return Ok(());
        }
        self.clear_port_flows(&desc).await
    }

    /// Replace the rule set of a security group and reprogram its ports.
    pub async fn update_security_group_rules(
        &mut self,
        sg_id: &str,
        sg_rules: Vec<SecurityGroupRule>,
    ) -> Result<(), FirewallError> {
        debug!(sg_id, count = sg_rules.len(), "updating security group rules");
        self.sg_rules.insert(sg_id.to_string(), sg_rules);
        if self.deferred {
            self.deferred_rule_groups.insert(sg_id.to_string());
            return Ok(());
        }
        let devices = self.devices_in_group(sg_id);
        self.reapply(devices).await
    }

    /// Replace the member set of a security group; ports referencing it as a
    /// remote group are reprogrammed when the set actually changed.
    pub async fn update_security_group_members(
        &mut self,
        sg_id: &str,
        members: SgMembers,
    ) -> Result<(), FirewallError> {
        debug!(sg_id, "updating security group members");
        let previous = self
            .sg_members
            .insert(sg_id.to_string(), members)
            .unwrap_or_default();
        if self.deferred {
            // The delta is taken against the window snapshot on apply-off.
            return Ok(());
        }
        let changed = self.sg_members.get(sg_id) != Some(&previous);
        self.pre_sg_members.insert(sg_id.to_string(), previous);
        if !changed {
            return Ok(());
        }
        let devices = self.devices_sourcing_group(sg_id);
        self.reapply(devices).await
    }

    /// Open a batching window: catalog and port mutations only record intent
    /// until `filter_defer_apply_off`.
    pub fn filter_defer_apply_on(&mut self) {
        if self.deferred {
            return;
        }
        debug!("starting deferred apply window");
        self.pre_sg_members = self.sg_members.clone();
        self.deferred = true;
    }

    /// Close the batching window with one consolidated reprogramming per
    /// affected port, removals first.
    pub async fn filter_defer_apply_off(&mut self) -> Result<(), FirewallError> {
        if !self.deferred {
            return Ok(());
        }
        debug!("closing deferred apply window");
        self.deferred = false;

        let removals = std::mem::take(&mut self.deferred_removals);
        for desc in removals.values() {
            self.clear_port_flows(desc).await?;
        }

        let mut devices: BTreeSet<String> = std::mem::take(&mut self.deferred_ports);
        for sg_id in std::mem::take(&mut self.deferred_rule_groups) {
            devices.extend(self.devices_in_group(&sg_id));
        }
        for sg_id in self.changed_member_groups() {
            devices.extend(self.devices_sourcing_group(&sg_id));
        }

        let result = self.reapply(devices).await;
        self.pre_sg_members = self.sg_members.clone();
        result
    }

    fn validate(&self, port: &PortDesc) -> Result<(), FirewallError> {
        if port.zone_id < ZONE_MIN || port.zone_id > ZONE_MAX {
            return Err(FirewallError::ZoneOutOfRange {
                device: port.device.clone(),
                zone_id: port.zone_id,
            });
        }
        Ok(())
    }

    /// Filtered devices bound to a security group.
    fn devices_in_group(&self, sg_id: &str) -> BTreeSet<String> {
        self.filtered_ports
            .values()
            .filter(|p| p.security_groups.iter().any(|sg| sg == sg_id))
            .map(|p| p.device.clone())
            .collect()
    }

    /// Filtered devices whose rules reference a group as remote peer.
    fn devices_sourcing_group(&self, sg_id: &str) -> BTreeSet<String> {
        self.filtered_ports
            .values()
            .filter(|p| p.security_group_source_groups.iter().any(|sg| sg == sg_id))
            .map(|p| p.device.clone())
            .collect()
    }

    /// Groups whose member set differs from the shadow snapshot.
    fn changed_member_groups(&self) -> Vec<String> {
        let empty = SgMembers::default();
        let mut groups: BTreeSet<&String> = self.sg_members.keys().collect();
        groups.extend(self.pre_sg_members.keys());
        groups
            .into_iter()
            .filter(|sg| {
                self.sg_members.get(*sg).unwrap_or(&empty)
                    != self.pre_sg_members.get(*sg).unwrap_or(&empty)
            })
            .cloned()
            .collect()
    }

    async fn reapply(&self, devices: BTreeSet<String>) -> Result<(), FirewallError> {
        for device in devices {
            if let Some(port) = self.filtered_ports.get(&device) {
                self.setup_port_filter(port).await?;
            }
        }
        Ok(())
    }

    /// The full programming pipeline for one port: clear, scaffold, rules.
    async fn setup_port_filter(&self, port: &PortDesc) -> Result<(), FirewallError> {
        let ofport = self.resolve_ofport(port).await?;
        self.clear_flows(port, Some(ofport)).await?;

        let outbound_port = self.resolve_outbound_port(port).await?;
        for flow in scaffold::base_flows(port, ofport, outbound_port) {
            self.add_flow(&port.device, Phase::Scaffold, &flow).await?;
        }

        self.add_rules_flows(port, ofport).await
    }

    /// The bridge's view of the VIF wins over the description.
    async fn resolve_ofport(&self, port: &PortDesc) -> Result<u32, FirewallError> {
        let vif = self
            .bridge
            .get_vif_port_by_id(&port.device)
            .await
            .map_err(|source| FirewallError::Transport {
                device: port.device.clone(),
                phase: Phase::Clear,
                source,
            })?;
        vif.map(|v| v.ofport)
            .or(port.ofport)
            .ok_or_else(|| FirewallError::PortWithoutOfport {
                device: port.device.clone(),
            })
    }

    async fn resolve_outbound_port(&self, port: &PortDesc) -> Result<u32, FirewallError> {
        let patch = self.config.outbound_patch_port();
        let resolved = self
            .bridge
            .get_port_ofport(&patch)
            .await
            .map_err(|source| FirewallError::Transport {
                device: port.device.clone(),
                phase: Phase::Scaffold,
                source,
            })?;
        resolved.ok_or_else(|| FirewallError::OutboundPortMissing {
            device: port.device.clone(),
            port_name: patch,
        })
    }

    async fn clear_port_flows(&self, port: &PortDesc) -> Result<(), FirewallError> {
        self.clear_flows(port, port.ofport).await
    }

    async fn clear_flows(
        &self,
        port: &PortDesc,
        ofport: Option<u32>,
    ) -> Result<(), FirewallError> {
        for matches in scaffold::clear_matches(port, ofport) {
            self.bridge
                .delete_flows(&matches)
                .await
                .map_err(|source| FirewallError::Transport {
                    device: port.device.clone(),
                    phase: Phase::Clear,
                    source,
                })?;
        }
        Ok(())
    }

    /// Install the flows of every security group the port is bound to.
    async fn add_rules_flows(&self, port: &PortDesc, ofport: u32) -> Result<(), FirewallError> {
        for sg_id in &port.security_groups {
            let Some(sg_rules) = self.sg_rules.get(sg_id) else {
                debug!(device = %port.device, %sg_id, "no rules known for security group");
                continue;
            };
            for rule in sg_rules {
                for resolved in self.expand_remote_group(rule) {
                    for flow in rules::compile(&resolved, port, ofport) {
                        self.add_flow(&port.device, Phase::Rules, &flow).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Expand a remote-group reference into one rule clone per member
    /// address. A plain set lookup: self-references are expected and an
    /// empty member set contributes nothing.
    fn expand_remote_group(&self, rule: &SecurityGroupRule) -> Vec<SecurityGroupRule> {
        let Some(remote) = rule.remote_group_id.as_deref() else {
            return vec![rule.clone()];
        };
        let ips: &[IpAddr] = self
            .sg_members
            .get(remote)
            .map(|m| m.of(rule.ethertype))
            .unwrap_or(&[]);
        ips.iter()
            .filter(|ip| EtherType::of(ip) == rule.ethertype)
            .map(|ip| {
                let mut clone = rule.clone();
                clone.remote_group_id = None;
                let prefix = format!("{}/{}", ip, rule.ethertype.host_prefix_len());
                match rule.direction {
                    Direction::Ingress => clone.source_ip_prefix = Some(prefix),
                    Direction::Egress => clone.dest_ip_prefix = Some(prefix),
                }
                clone
            })
            .collect()
    }

    async fn add_flow(
        &self,
        device: &str,
        phase: Phase,
        flow: &Flow,
    ) -> Result<(), FirewallError> {
        self.bridge
            .add_flow(flow)
            .await
            .map_err(|source| FirewallError::Transport {
                device: device.to_string(),
                phase,
                source,
            })
    }
}
