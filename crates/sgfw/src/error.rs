//! Driver error types
//!
//! Every failure names the device it concerns; transport failures also carry
//! the programming phase they interrupted so the agent can decide what to
//! retry.

use std::fmt;

use thiserror::Error;

/// Phase of port programming a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Deleting the device's stale flows.
    Clear,
    /// Installing the fixed per-port scaffold.
    Scaffold,
    /// Installing the security-group rule flows.
    Rules,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Clear => "clear",
            Phase::Scaffold => "scaffold",
            Phase::Rules => "rules",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the firewall driver.
#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("bridge operation failed for device '{device}' during the {phase} phase: {source:#}")]
    Transport {
        device: String,
        phase: Phase,
        source: anyhow::Error,
    },

    #[error("device '{device}' has no ofport assigned")]
    PortWithoutOfport { device: String },

    #[error("device '{device}' zone id {zone_id} is outside the VLAN range 1-4094")]
    ZoneOutOfRange { device: String, zone_id: u16 },

    #[error("device '{device}': outbound patch port '{port_name}' not found on the bridge")]
    OutboundPortMissing { device: String, port_name: String },
}

impl FirewallError {
    /// The device the failure concerns.
    pub fn device(&self) -> &str {
        match self {
            FirewallError::Transport { device, .. }
            | FirewallError::PortWithoutOfport { device }
            | FirewallError::ZoneOutOfRange { device, .. }
            | FirewallError::OutboundPortMissing { device, .. } => device,
        }
    }

    /// The programming phase that failed, where one applies.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            FirewallError::Transport { phase, .. } => Some(*phase),
            FirewallError::OutboundPortMissing { .. } => Some(Phase::Scaffold),
            _ => None,
        }
    }

    /// True when the port is left in a needs-retry state and the agent
    /// should call `prepare_port_filter` again.
    pub fn needs_retry(&self) -> bool {
        matches!(self, FirewallError::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_carries_device_and_phase() {
        let err = FirewallError::Transport {
            device: "tap0".into(),
            phase: Phase::Scaffold,
            source: anyhow::anyhow!("bridge unreachable"),
        };
        assert_eq!(err.device(), "tap0");
        assert_eq!(err.phase(), Some(Phase::Scaffold));
        assert!(err.needs_retry());
        let msg = err.to_string();
        assert!(msg.contains("tap0"));
        assert!(msg.contains("scaffold"));
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        let err = FirewallError::PortWithoutOfport {
            device: "tap0".into(),
        };
        assert!(!err.needs_retry());
        assert_eq!(err.phase(), None);

        let err = FirewallError::ZoneOutOfRange {
            device: "tap0".into(),
            zone_id: 0,
        };
        assert!(err.to_string().contains("VLAN range"));
    }
}
