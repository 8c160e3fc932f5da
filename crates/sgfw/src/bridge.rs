//! Bridge client interface and the ofctl transport
//!
//! The driver never touches the switch directly: everything goes through
//! `BridgeClient`, which keeps the flow table the single external authority
//! and gives the tests a seam to record the exact call sequence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::config::FirewallConfig;
use crate::flow::{Flow, FlowMatch};
use crate::ovsdb::OvsdbClient;

/// A VIF as resolved on the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifPort {
    pub port_name: String,
    pub ofport: u32,
    pub vif_id: String,
    pub vif_mac: String,
    pub switch: String,
}

/// Mediator for the bridge flow table.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Install one flow.
    async fn add_flow(&self, flow: &Flow) -> Result<()>;

    /// Remove every flow matching the given fields.
    async fn delete_flows(&self, matches: &FlowMatch) -> Result<()>;

    /// Resolve a VIF by its port id, if it is attached to the bridge.
    async fn get_vif_port_by_id(&self, device_id: &str) -> Result<Option<VifPort>>;

    /// ofport of a named port on the bridge.
    async fn get_port_ofport(&self, port_name: &str) -> Result<Option<u32>>;
}

/// `BridgeClient` backed by the `ovs-ofctl` CLI for flow programming and
/// OVSDB for port resolution.
pub struct OfctlBridge {
    bridge: String,
    ovsdb: OvsdbClient,
}

impl OfctlBridge {
    /// Bind to the configured integration bridge. Both recognized
    /// `of_interface` choices drive the same CLI here.
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            bridge: config.integration_bridge.clone(),
            ovsdb: OvsdbClient::new(),
        }
    }

    async fn run_ofctl(&self, args: &[&str]) -> Result<()> {
        let output = tokio::process::Command::new("ovs-ofctl")
            .args(args)
            .output()
            .await
            .context("failed to spawn ovs-ofctl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ovs-ofctl {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeClient for OfctlBridge {
    async fn add_flow(&self, flow: &Flow) -> Result<()> {
        let spec = flow.to_string();
        debug!(bridge = %self.bridge, flow = %spec, "add-flow");
        self.run_ofctl(&["add-flow", &self.bridge, &spec]).await
    }

    async fn delete_flows(&self, matches: &FlowMatch) -> Result<()> {
        let spec = matches.to_string();
        debug!(bridge = %self.bridge, matches = %spec, "del-flows");
        self.run_ofctl(&["del-flows", &self.bridge, &spec]).await
    }

    async fn get_vif_port_by_id(&self, device_id: &str) -> Result<Option<VifPort>> {
        let Some(record) = self.ovsdb.find_interface_by_iface_id(device_id).await? else {
            return Ok(None);
        };
        // An interface without an ofport is not usable as a VIF yet.
        let Some(ofport) = record.ofport else {
            return Ok(None);
        };
        Ok(Some(VifPort {
            port_name: record.name,
            ofport,
            vif_id: device_id.to_string(),
            vif_mac: record.mac.unwrap_or_default(),
            switch: self.bridge.clone(),
        }))
    }

    async fn get_port_ofport(&self, port_name: &str) -> Result<Option<u32>> {
        self.ovsdb.interface_ofport(port_name).await
    }
}
