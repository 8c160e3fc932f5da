//! Fixed per-port flow scaffold
//!
//! Every filtered VIF gets the same program: anti-spoofing entry flows,
//! DHCP/ICMP service exceptions, the default drop, the ARP shortcut and the
//! table hand-offs. Rule flows from the security groups stack on top in
//! tables 11 and 12. Emission order is contractual.

use crate::flow::{Flow, FlowMatch, Proto, EGRESS_TABLE, INGRESS_TABLE};
use crate::port::PortDesc;
use crate::rules::EtherType;

/// DHCPv4 (server, client) UDP ports.
const DHCPV4_PORTS: (u16, u16) = (67, 68);
/// DHCPv6 (server, client) UDP ports.
const DHCPV6_PORTS: (u16, u16) = (547, 546);
/// ICMPv6 types delivered straight to the guest: MLD query/report/done,
/// neighbour solicitation and advertisement.
const IPV6_ND_TYPES: [u16; 5] = [130, 131, 132, 135, 136];

/// Partial matches that wipe every flow bound to this VIF, in the
/// contractual order: `dl_src`, `dl_dst`, `in_port`.
pub(crate) fn clear_matches(port: &PortDesc, ofport: Option<u32>) -> Vec<FlowMatch> {
    let mut matches = vec![
        FlowMatch {
            dl_src: Some(port.mac_address.clone()),
            ..Default::default()
        },
        FlowMatch {
            dl_dst: Some(port.mac_address.clone()),
            ..Default::default()
        },
    ];
    if let Some(ofport) = ofport {
        matches.push(FlowMatch {
            in_port: Some(ofport),
            ..Default::default()
        });
    }
    matches
}

/// The scaffold flows for one VIF, in installation order.
pub(crate) fn base_flows(port: &PortDesc, ofport: u32, outbound_port: u32) -> Vec<Flow> {
    let mac = &port.mac_address;
    let mut flows = Vec::new();

    // Egress entry, table 0: only traffic sourced from the VIF's own
    // addresses may proceed, tagged with the tenant VLAN. DHCP discovery
    // runs before the guest has an address, hence the literal zero source.
    flows.push(Flow::new(
        FlowMatch {
            priority: Some(100),
            proto: Some(Proto::Ip),
            in_port: Some(ofport),
            dl_src: Some(mac.clone()),
            nw_src: Some("0.0.0.0".into()),
            ..Default::default()
        },
        "goto_table:1",
    ));
    for ethertype in [EtherType::IPv4, EtherType::IPv6] {
        for ip in port.fixed_ips_of(ethertype) {
            flows.push(Flow::new(
                FlowMatch {
                    priority: Some(100),
                    proto: Some(Proto::Ip),
                    in_port: Some(ofport),
                    dl_src: Some(mac.clone()),
                    nw_src: Some(ip.to_string()),
                    ..Default::default()
                },
                format!("mod_vlan_vid:{},goto_table:1", port.zone_id),
            ));
        }
    }

    // Egress service exceptions, table 11: the guest must never answer as a
    // DHCP server, but its client traffic and ICMP go out unfiltered.
    for (server, client) in [DHCPV4_PORTS, DHCPV6_PORTS] {
        flows.push(Flow::new(
            FlowMatch {
                table: Some(EGRESS_TABLE),
                priority: Some(40),
                proto: Some(Proto::Udp),
                in_port: Some(ofport),
                udp_src: Some(server.into()),
                udp_dst: Some(client.into()),
                ..Default::default()
            },
            "drop",
        ));
    }
    for (server, client) in [DHCPV4_PORTS, DHCPV6_PORTS] {
        flows.push(Flow::new(
            FlowMatch {
                table: Some(EGRESS_TABLE),
                priority: Some(50),
                proto: Some(Proto::Udp),
                in_port: Some(ofport),
                dl_src: Some(mac.clone()),
                udp_src: Some(client.into()),
                udp_dst: Some(server.into()),
                ..Default::default()
            },
            "normal",
        ));
    }
    for proto in [Proto::Icmp, Proto::Icmpv6] {
        flows.push(Flow::new(
            FlowMatch {
                table: Some(EGRESS_TABLE),
                priority: Some(50),
                proto: Some(proto),
                in_port: Some(ofport),
                dl_src: Some(mac.clone()),
                ..Default::default()
            },
            "normal",
        ));
    }

    // Default drop and the inbound entry points in table 0.
    flows.push(Flow::new(
        FlowMatch {
            priority: Some(40),
            proto: Some(Proto::Ip),
            ..Default::default()
        },
        "drop",
    ));
    flows.push(Flow::new(
        FlowMatch {
            priority: Some(60),
            proto: Some(Proto::Arp),
            dl_dst: Some(mac.clone()),
            ..Default::default()
        },
        format!("strip_vlan,output:{ofport}"),
    ));
    flows.push(Flow::new(
        FlowMatch {
            priority: Some(50),
            dl_dst: Some(mac.clone()),
            ..Default::default()
        },
        "resubmit(0,2)",
    ));

    // Ingress service exceptions, table 12: DHCP replies and IPv6 ND/RA
    // bypass the policy and reach the guest directly.
    for (server, client) in [DHCPV4_PORTS, DHCPV6_PORTS] {
        flows.push(Flow::new(
            FlowMatch {
                table: Some(INGRESS_TABLE),
                priority: Some(45),
                proto: Some(Proto::Udp),
                dl_dst: Some(mac.clone()),
                udp_src: Some(server.into()),
                udp_dst: Some(client.into()),
                ..Default::default()
            },
            format!("strip_vlan,output:{ofport}"),
        ));
    }
    for icmp_type in IPV6_ND_TYPES {
        flows.push(Flow::new(
            FlowMatch {
                table: Some(INGRESS_TABLE),
                priority: Some(45),
                proto: Some(Proto::Icmpv6),
                dl_dst: Some(mac.clone()),
                icmp_type: Some(icmp_type),
                ..Default::default()
            },
            format!("strip_vlan,output:{ofport}"),
        ));
    }
    flows.push(Flow::new(
        FlowMatch {
            table: Some(INGRESS_TABLE),
            priority: Some(10),
            proto: Some(Proto::Ip),
            ..Default::default()
        },
        format!("mod_vlan_vid:{},output:{}", port.zone_id, outbound_port),
    ));

    // Table hand-offs into the policy tables.
    flows.push(Flow::new(
        FlowMatch {
            table: Some(2),
            priority: Some(100),
            dl_dst: Some(mac.clone()),
            ..Default::default()
        },
        "strip_vlan,resubmit(,12)",
    ));
    flows.push(Flow::new(
        FlowMatch {
            table: Some(2),
            priority: Some(90),
            ..Default::default()
        },
        "resubmit(,12)",
    ));
    flows.push(Flow::new(
        FlowMatch {
            table: Some(1),
            priority: Some(100),
            dl_dst: Some(mac.clone()),
            ..Default::default()
        },
        "strip_vlan,resubmit(,11)",
    ));
    flows.push(Flow::new(
        FlowMatch {
            table: Some(1),
            priority: Some(90),
            ..Default::default()
        },
        "resubmit(,11)",
    ));

    flows
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

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

    #[test]
    fn test_clear_matches_order() {
        let matches = clear_matches(&fake_port(), Some(1));
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].dl_src.as_deref(), Some("ff:ff:ff:ff:ff:ff"));
        assert_eq!(matches[1].dl_dst.as_deref(), Some("ff:ff:ff:ff:ff:ff"));
        assert_eq!(matches[2].in_port, Some(1));
    }

    #[test]
    fn test_base_flows_exact_program() {
        let mac = "ff:ff:ff:ff:ff:ff";
        let flows = base_flows(&fake_port(), 1, 100);
        let rendered: Vec<String> = flows.iter().map(|f| f.to_string()).collect();
        let expected = vec![
            // Egress entry.
            format!("priority=100,ip,in_port=1,dl_src={mac},nw_src=0.0.0.0,actions=goto_table:1"),
            format!(
                "priority=100,ip,in_port=1,dl_src={mac},nw_src=10.0.0.1,\
                 actions=mod_vlan_vid:1,goto_table:1"
            ),
            format!(
                "priority=100,ip,in_port=1,dl_src={mac},nw_src=fe80::1,\
                 actions=mod_vlan_vid:1,goto_table:1"
            ),
            // Egress service exceptions.
            "table=11,priority=40,udp,in_port=1,udp_src=67,udp_dst=68,actions=drop".to_string(),
            "table=11,priority=40,udp,in_port=1,udp_src=547,udp_dst=546,actions=drop".to_string(),
            format!("table=11,priority=50,udp,in_port=1,dl_src={mac},udp_src=68,udp_dst=67,actions=normal"),
            format!("table=11,priority=50,udp,in_port=1,dl_src={mac},udp_src=546,udp_dst=547,actions=normal"),
            format!("table=11,priority=50,icmp,in_port=1,dl_src={mac},actions=normal"),
            format!("table=11,priority=50,ipv6,nw_proto=58,in_port=1,dl_src={mac},actions=normal"),
            // Default drop and inbound entry.
            "priority=40,ip,actions=drop".to_string(),
            format!("priority=60,arp,dl_dst={mac},actions=strip_vlan,output:1"),
            format!("priority=50,dl_dst={mac},actions=resubmit(0,2)"),
            // Ingress service exceptions.
            format!("table=12,priority=45,udp,dl_dst={mac},udp_src=67,udp_dst=68,actions=strip_vlan,output:1"),
            format!("table=12,priority=45,udp,dl_dst={mac},udp_src=547,udp_dst=546,actions=strip_vlan,output:1"),
            format!("table=12,priority=45,ipv6,nw_proto=58,dl_dst={mac},icmp_type=130,actions=strip_vlan,output:1"),
            format!("table=12,priority=45,ipv6,nw_proto=58,dl_dst={mac},icmp_type=131,actions=strip_vlan,output:1"),
            format!("table=12,priority=45,ipv6,nw_proto=58,dl_dst={mac},icmp_type=132,actions=strip_vlan,output:1"),
            format!("table=12,priority=45,ipv6,nw_proto=58,dl_dst={mac},icmp_type=135,actions=strip_vlan,output:1"),
            format!("table=12,priority=45,ipv6,nw_proto=58,dl_dst={mac},icmp_type=136,actions=strip_vlan,output:1"),
            "table=12,priority=10,ip,actions=mod_vlan_vid:1,output:100".to_string(),
            // Hand-offs.
            format!("table=2,priority=100,dl_dst={mac},actions=strip_vlan,resubmit(,12)"),
            "table=2,priority=90,actions=resubmit(,12)".to_string(),
            format!("table=1,priority=100,dl_dst={mac},actions=strip_vlan,resubmit(,11)"),
            "table=1,priority=90,actions=resubmit(,11)".to_string(),
        ];
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_base_flows_are_unique() {
        // No two scaffold flows may collide on (table, priority, match).
        let flows = base_flows(&fake_port(), 1, 100);
        let keys: HashSet<String> = flows.iter().map(|f| f.match_fields.to_string()).collect();
        assert_eq!(keys.len(), flows.len());
    }

    #[test]
    fn test_base_flows_count_follows_fixed_ips() {
        let mut port = fake_port();
        port.fixed_ips = vec!["10.0.0.1".parse().unwrap()];
        assert_eq!(base_flows(&port, 1, 100).len(), 23);
        assert_eq!(base_flows(&fake_port(), 1, 100).len(), 24);
    }
}
