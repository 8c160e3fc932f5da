//! Security-group rule model and compilation into flows
//!
//! One rule and one port compile into the table 11/12 match flows that carry
//! the `learn()` reverse-flow action. Remote-group references are expanded by
//! the driver before compilation, so the compiler itself only sees concrete
//! address prefixes.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::flow::{
    learn_egress_actions, learn_ingress_actions, Flow, FlowMatch, LearnSpec, PortMatch, Proto,
    EGRESS_TABLE, INGRESS_TABLE,
};
use crate::port::PortDesc;
use crate::port_mask::port_rule_masking;

/// Priority of every installed rule match flow.
pub const RULE_PRIORITY: u16 = 30;
/// Priority of the learned reverse flow when the rule names a protocol.
const LEARN_PRIORITY: u16 = 60;

/// Address family of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtherType {
    #[serde(rename = "IPv4")]
    IPv4,
    #[serde(rename = "IPv6")]
    IPv6,
}

impl EtherType {
    pub fn of(ip: &IpAddr) -> Self {
        if ip.is_ipv4() {
            EtherType::IPv4
        } else {
            EtherType::IPv6
        }
    }

    /// Prefix length of a single-host match in this family.
    pub fn host_prefix_len(self) -> u8 {
        match self {
            EtherType::IPv4 => 32,
            EtherType::IPv6 => 128,
        }
    }
}

/// Traffic direction relative to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// L4 protocol selector of a rule.
///
/// Unrecognized wire values land on `Unknown` and are skipped at compile
/// time instead of failing the whole rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Ip,
    #[serde(other)]
    Unknown,
}

impl RuleProtocol {
    fn proto(self) -> Option<Proto> {
        match self {
            RuleProtocol::Tcp => Some(Proto::Tcp),
            RuleProtocol::Udp => Some(Proto::Udp),
            RuleProtocol::Icmp => Some(Proto::Icmp),
            RuleProtocol::Icmpv6 => Some(Proto::Icmpv6),
            RuleProtocol::Ip => Some(Proto::Ip),
            RuleProtocol::Unknown => None,
        }
    }
}

/// One security-group rule as delivered by the agent.
///
/// For ICMP rules `port_range_min` carries the ICMP type and
/// `port_range_max` the ICMP code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub ethertype: EtherType,
    pub direction: Direction,
    #[serde(default)]
    pub protocol: Option<RuleProtocol>,
    #[serde(default)]
    pub port_range_min: Option<u16>,
    #[serde(default)]
    pub port_range_max: Option<u16>,
    #[serde(default)]
    pub source_ip_prefix: Option<String>,
    #[serde(default)]
    pub dest_ip_prefix: Option<String>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
}

/// L4 destination-port selection of one rule, validated.
enum PortSelection {
    Any,
    Single(u16),
    Range(u16, u16),
}

/// Reverse-flow priority when the rule leaves the protocol open.
fn default_learn_priority(proto: Proto) -> u16 {
    match proto {
        Proto::Tcp | Proto::Udp => 70,
        _ => 60,
    }
}

/// Compile one rule against one port into its match flows.
///
/// Flows are anchored on each fixed IP of the rule's family; a port without
/// an address in that family contributes nothing. Malformed rules are
/// skipped with a warning.
pub(crate) fn compile(rule: &SecurityGroupRule, port: &PortDesc, ofport: u32) -> Vec<Flow> {
    let proto = match rule.protocol {
        None => None,
        Some(rp) => match rp.proto() {
            Some(proto) => Some(proto),
            None => {
                warn!(device = %port.device, "skipping rule with unknown protocol");
                return Vec::new();
            }
        },
    };

    // Destination ports only constrain TCP/UDP; ICMP reuses the range
    // fields as type/code and everything else ignores them.
    let ports = match proto {
        Some(Proto::Tcp | Proto::Udp) => match (rule.port_range_min, rule.port_range_max) {
            (None, None) => PortSelection::Any,
            (Some(lo), Some(hi)) if lo == hi => PortSelection::Single(lo),
            (Some(lo), Some(hi)) if lo < hi => PortSelection::Range(lo, hi),
            _ => {
                warn!(
                    device = %port.device,
                    min = ?rule.port_range_min,
                    max = ?rule.port_range_max,
                    "skipping rule with malformed port range"
                );
                return Vec::new();
            }
        },
        _ => PortSelection::Any,
    };

    let mut flows = Vec::new();
    for ip in port.fixed_ips_of(rule.ethertype) {
        match proto {
            // Open protocol: one flow per TCP/UDP/IP, no port match.
            None => {
                for proto in [Proto::Tcp, Proto::Udp, Proto::Ip] {
                    let spec = LearnSpec::new(proto, default_learn_priority(proto));
                    flows.push(rule_flow(rule, port, ofport, ip, spec, None));
                }
            }
            Some(proto @ (Proto::Tcp | Proto::Udp)) => {
                let spec = LearnSpec::new(proto, LEARN_PRIORITY);
                match &ports {
                    PortSelection::Any => {
                        flows.push(rule_flow(rule, port, ofport, ip, spec, None));
                    }
                    PortSelection::Single(dst) => {
                        flows.push(rule_flow(
                            rule,
                            port,
                            ofport,
                            ip,
                            spec,
                            Some(PortMatch::Port(*dst)),
                        ));
                    }
                    PortSelection::Range(lo, hi) => {
                        for mask in port_rule_masking(*lo, *hi) {
                            flows.push(rule_flow(
                                rule,
                                port,
                                ofport,
                                ip,
                                spec,
                                Some(PortMatch::Masked(mask)),
                            ));
                        }
                    }
                }
            }
            Some(proto @ (Proto::Icmp | Proto::Icmpv6)) => {
                let mut spec = LearnSpec::new(proto, LEARN_PRIORITY);
                spec.icmp_type = rule.port_range_min;
                spec.icmp_code = rule.port_range_max;
                flows.push(rule_flow(rule, port, ofport, ip, spec, None));
            }
            Some(proto) => {
                let spec = LearnSpec::new(proto, LEARN_PRIORITY);
                flows.push(rule_flow(rule, port, ofport, ip, spec, None));
            }
        }
    }
    flows
}

fn rule_flow(
    rule: &SecurityGroupRule,
    port: &PortDesc,
    ofport: u32,
    anchor_ip: &IpAddr,
    spec: LearnSpec,
    dst_port: Option<PortMatch>,
) -> Flow {
    let mut m = FlowMatch {
        priority: Some(RULE_PRIORITY),
        proto: Some(spec.proto),
        ..Default::default()
    };
    let actions = match rule.direction {
        Direction::Ingress => {
            m.table = Some(INGRESS_TABLE);
            m.dl_dst = Some(port.mac_address.clone());
            m.nw_dst = Some(anchor_ip.to_string());
            if let Some(prefix) = &rule.source_ip_prefix {
                m.nw_src = Some(prefix.clone());
            }
            learn_ingress_actions(&spec, ofport)
        }
        Direction::Egress => {
            m.table = Some(EGRESS_TABLE);
            m.dl_src = Some(port.mac_address.clone());
            m.nw_src = Some(anchor_ip.to_string());
            if let Some(prefix) = &rule.dest_ip_prefix {
                m.nw_dst = Some(prefix.clone());
            }
            learn_egress_actions(&spec)
        }
    };
    match spec.proto {
        Proto::Tcp => m.tcp_dst = dst_port,
        Proto::Udp => m.udp_dst = dst_port,
        _ => {}
    }
    Flow::new(m, actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_port() -> PortDesc {
        PortDesc {
            device: "tapfake_dev_1".into(),
            ofport: Some(1),
            mac_address: "ff:ff:ff:ff:ff:ff".into(),
            zone_id: 1,
            fixed_ips: vec!["10.0.0.1".parse().unwrap(), "fe80::1".parse().unwrap()],
            security_groups: vec!["fake_sgid".into()],
            security_group_source_groups: vec!["fake_sgid".into()],
        }
    }

    fn ingress_rule(protocol: Option<RuleProtocol>) -> SecurityGroupRule {
        SecurityGroupRule {
            ethertype: EtherType::IPv4,
            direction: Direction::Ingress,
            protocol,
            port_range_min: None,
            port_range_max: None,
            source_ip_prefix: None,
            dest_ip_prefix: None,
            remote_group_id: None,
        }
    }

    #[test]
    fn test_open_protocol_expands_tcp_udp_ip() {
        let flows = compile(&ingress_rule(None), &fake_port(), 1);
        assert_eq!(flows.len(), 3);
        let protos: Vec<_> = flows
            .iter()
            .map(|f| f.match_fields.proto.unwrap())
            .collect();
        assert_eq!(protos, vec![Proto::Tcp, Proto::Udp, Proto::Ip]);
        // TCP/UDP reply flows learn at 70, plain IP at 60.
        assert!(flows[0].actions.contains("priority=70"));
        assert!(flows[1].actions.contains("priority=70"));
        assert!(flows[2].actions.contains("priority=60"));
        for flow in &flows {
            assert_eq!(flow.match_fields.table, Some(INGRESS_TABLE));
            assert_eq!(flow.match_fields.priority, Some(RULE_PRIORITY));
            assert_eq!(flow.match_fields.nw_dst.as_deref(), Some("10.0.0.1"));
        }
    }

    #[test]
    fn test_ingress_prefix_lands_on_nw_src() {
        let mut rule = ingress_rule(Some(RuleProtocol::Tcp));
        rule.source_ip_prefix = Some("10.0.0.0/24".into());
        let flows = compile(&rule, &fake_port(), 1);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].match_fields.nw_src.as_deref(), Some("10.0.0.0/24"));
        assert_eq!(flows[0].match_fields.nw_dst.as_deref(), Some("10.0.0.1"));
        assert!(flows[0].actions.ends_with("strip_vlan,output:1"));
    }

    #[test]
    fn test_egress_prefix_lands_on_nw_dst() {
        let rule = SecurityGroupRule {
            direction: Direction::Egress,
            protocol: Some(RuleProtocol::Udp),
            dest_ip_prefix: Some("10.0.0.0/24".into()),
            ..ingress_rule(None)
        };
        let flows = compile(&rule, &fake_port(), 1);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].match_fields.table, Some(EGRESS_TABLE));
        assert_eq!(flows[0].match_fields.dl_src.as_deref(), Some("ff:ff:ff:ff:ff:ff"));
        assert_eq!(flows[0].match_fields.nw_src.as_deref(), Some("10.0.0.1"));
        assert_eq!(flows[0].match_fields.nw_dst.as_deref(), Some("10.0.0.0/24"));
        assert!(flows[0].actions.ends_with("resubmit(,2)"));
    }

    #[test]
    fn test_single_port_matches_raw_integer() {
        let rule = SecurityGroupRule {
            protocol: Some(RuleProtocol::Tcp),
            port_range_min: Some(10),
            port_range_max: Some(10),
            ..ingress_rule(None)
        };
        let flows = compile(&rule, &fake_port(), 1);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].match_fields.tcp_dst, Some(PortMatch::Port(10)));
    }

    #[test]
    fn test_port_range_expands_in_mask_order() {
        let rule = SecurityGroupRule {
            protocol: Some(RuleProtocol::Udp),
            port_range_min: Some(10),
            port_range_max: Some(100),
            ..ingress_rule(None)
        };
        let flows = compile(&rule, &fake_port(), 1);
        let masks: Vec<_> = flows
            .iter()
            .map(|f| f.match_fields.udp_dst.clone().unwrap().to_string())
            .collect();
        assert_eq!(
            masks,
            vec![
                "0x000a/0xfffe",
                "0x000c/0xfffc",
                "0x0010/0xfff0",
                "0x0020/0xffe0",
                "0x0044/0xffe0",
                "0x0060/0xfffc",
                "0x0064",
            ]
        );
    }

    #[test]
    fn test_icmp_type_and_code_live_in_the_learn_action() {
        let rule = SecurityGroupRule {
            protocol: Some(RuleProtocol::Icmp),
            port_range_min: Some(10),
            port_range_max: Some(20),
            ..ingress_rule(None)
        };
        let flows = compile(&rule, &fake_port(), 1);
        assert_eq!(flows.len(), 1);
        // The match flow itself carries no ICMP type.
        assert_eq!(flows[0].match_fields.icmp_type, None);
        assert!(flows[0].actions.contains("icmp_type=10,icmp_code=20,"));

        // A type without a code is a valid rule.
        let type_only = SecurityGroupRule {
            protocol: Some(RuleProtocol::Icmp),
            port_range_min: Some(8),
            ..ingress_rule(None)
        };
        let flows = compile(&type_only, &fake_port(), 1);
        assert!(flows[0].actions.contains("icmp_type=8,"));
        assert!(!flows[0].actions.contains("icmp_code"));
    }

    #[test]
    fn test_icmpv6_matches_on_ipv6_next_header() {
        let rule = SecurityGroupRule {
            ethertype: EtherType::IPv6,
            protocol: Some(RuleProtocol::Icmpv6),
            ..ingress_rule(None)
        };
        let flows = compile(&rule, &fake_port(), 1);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].match_fields.proto, Some(Proto::Icmpv6));
        assert_eq!(flows[0].match_fields.nw_dst.as_deref(), Some("fe80::1"));
        assert!(flows[0].actions.contains("eth_type=0x86dd,ip_proto=58"));
    }

    #[test]
    fn test_unknown_protocol_is_skipped() {
        let rule: SecurityGroupRule = serde_json::from_str(
            r#"{"ethertype": "IPv4", "direction": "ingress", "protocol": "sctp"}"#,
        )
        .unwrap();
        assert_eq!(rule.protocol, Some(RuleProtocol::Unknown));
        assert!(compile(&rule, &fake_port(), 1).is_empty());
    }

    #[test]
    fn test_malformed_port_range_is_skipped() {
        let inverted = SecurityGroupRule {
            protocol: Some(RuleProtocol::Tcp),
            port_range_min: Some(100),
            port_range_max: Some(10),
            ..ingress_rule(None)
        };
        assert!(compile(&inverted, &fake_port(), 1).is_empty());

        let one_sided = SecurityGroupRule {
            protocol: Some(RuleProtocol::Tcp),
            port_range_min: Some(10),
            ..ingress_rule(None)
        };
        assert!(compile(&one_sided, &fake_port(), 1).is_empty());
    }

    #[test]
    fn test_family_without_address_contributes_nothing() {
        let mut port = fake_port();
        port.fixed_ips = vec!["10.0.0.1".parse().unwrap()];
        let rule = SecurityGroupRule {
            ethertype: EtherType::IPv6,
            ..ingress_rule(Some(RuleProtocol::Tcp))
        };
        assert!(compile(&rule, &port, 1).is_empty());
    }
}
