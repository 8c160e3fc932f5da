//! OpenFlow match fields and action strings for the firewall pipeline
//!
//! Everything the switch parses is text: match fields rendered in ofctl
//! syntax and the `learn(...)` reverse-flow templates. The strings here are
//! an ABI; field order, trailing commas and hex formatting must not drift.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Idle timeout (seconds) of learned reverse flows.
pub const LEARN_IDLE_TIMEOUT: u32 = 30;
/// Hard timeout (seconds) of learned reverse flows.
pub const LEARN_HARD_TIMEOUT: u32 = 1800;

/// Egress policy table.
pub const EGRESS_TABLE: u8 = 11;
/// Ingress policy table.
pub const INGRESS_TABLE: u8 = 12;

/// Protocol token of a match field.
///
/// Rendered as the bare ofctl protocol keyword; ICMPv6 has no keyword of its
/// own in this pipeline and is matched as `ipv6,nw_proto=58`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Ip,
    Arp,
    Tcp,
    Udp,
    Icmp,
    Ipv6,
    Icmpv6,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Proto::Ip => "ip",
            Proto::Arp => "arp",
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Icmp => "icmp",
            Proto::Ipv6 => "ipv6",
            Proto::Icmpv6 => "ipv6,nw_proto=58",
        };
        f.write_str(s)
    }
}

impl Proto {
    /// Protocol preamble inside a `learn()` action.
    pub(crate) fn learn_proto_match(self) -> &'static str {
        match self {
            Proto::Tcp => "eth_type=0x0800,ip_proto=6",
            Proto::Udp => "eth_type=0x0800,ip_proto=17",
            Proto::Ip => "eth_type=0x0800",
            Proto::Icmp => "eth_type=0x0800,ip_proto=1",
            Proto::Icmpv6 => "eth_type=0x86dd,ip_proto=58",
            Proto::Ipv6 => "eth_type=0x86dd",
            Proto::Arp => "eth_type=0x0806",
        }
    }

    /// Destination-port swap fragment (trailing comma included).
    pub(crate) fn learn_dst_swap(self) -> &'static str {
        match self {
            Proto::Tcp => "NXM_OF_TCP_DST[]=NXM_OF_TCP_SRC[],",
            Proto::Udp => "NXM_OF_UDP_DST[]=NXM_OF_UDP_SRC[],",
            _ => "",
        }
    }

    /// Source-port swap fragment (trailing comma included).
    pub(crate) fn learn_src_swap(self) -> &'static str {
        match self {
            Proto::Tcp => "NXM_OF_TCP_SRC[]=NXM_OF_TCP_DST[],",
            Proto::Udp => "NXM_OF_UDP_SRC[]=NXM_OF_UDP_DST[],",
            _ => "",
        }
    }
}

/// An L4 port match: either a plain port number or a `value/mask` literal
/// produced by the range expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMatch {
    Port(u16),
    Masked(String),
}

impl fmt::Display for PortMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortMatch::Port(p) => write!(f, "{p}"),
            PortMatch::Masked(m) => f.write_str(m),
        }
    }
}

impl From<u16> for PortMatch {
    fn from(port: u16) -> Self {
        PortMatch::Port(port)
    }
}

/// Match fields of one flow, all optional.
///
/// Doubles as the partial match handed to `delete_flows`. Rendering order is
/// fixed so the emitted text is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMatch {
    pub table: Option<u8>,
    pub priority: Option<u16>,
    pub proto: Option<Proto>,
    pub in_port: Option<u32>,
    pub dl_src: Option<String>,
    pub dl_dst: Option<String>,
    pub nw_src: Option<String>,
    pub nw_dst: Option<String>,
    pub tcp_dst: Option<PortMatch>,
    pub udp_src: Option<PortMatch>,
    pub udp_dst: Option<PortMatch>,
    pub icmp_type: Option<u16>,
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(table) = self.table {
            parts.push(format!("table={table}"));
        }
        if let Some(priority) = self.priority {
            parts.push(format!("priority={priority}"));
        }
        if let Some(proto) = self.proto {
            parts.push(proto.to_string());
        }
        if let Some(in_port) = self.in_port {
            parts.push(format!("in_port={in_port}"));
        }
        if let Some(ref dl_src) = self.dl_src {
            parts.push(format!("dl_src={dl_src}"));
        }
        if let Some(ref dl_dst) = self.dl_dst {
            parts.push(format!("dl_dst={dl_dst}"));
        }
        if let Some(ref nw_src) = self.nw_src {
            parts.push(format!("nw_src={nw_src}"));
        }
        if let Some(ref nw_dst) = self.nw_dst {
            parts.push(format!("nw_dst={nw_dst}"));
        }
        if let Some(ref tcp_dst) = self.tcp_dst {
            parts.push(format!("tcp_dst={tcp_dst}"));
        }
        if let Some(ref udp_src) = self.udp_src {
            parts.push(format!("udp_src={udp_src}"));
        }
        if let Some(ref udp_dst) = self.udp_dst {
            parts.push(format!("udp_dst={udp_dst}"));
        }
        if let Some(icmp_type) = self.icmp_type {
            parts.push(format!("icmp_type={icmp_type}"));
        }
        f.write_str(&parts.join(","))
    }
}

/// One complete flow: match fields plus the action string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub match_fields: FlowMatch,
    pub actions: String,
}

impl Flow {
    pub fn new(match_fields: FlowMatch, actions: impl Into<String>) -> Self {
        Self {
            match_fields,
            actions: actions.into(),
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let matches = self.match_fields.to_string();
        if matches.is_empty() {
            write!(f, "actions={}", self.actions)
        } else {
            write!(f, "{},actions={}", matches, self.actions)
        }
    }
}

/// Parameters of one `learn()` reverse-flow template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnSpec {
    /// Protocol of the synthetic reverse flow.
    pub proto: Proto,
    /// Priority the datapath gives the learned flow.
    pub priority: u16,
    pub icmp_type: Option<u16>,
    pub icmp_code: Option<u16>,
}

impl LearnSpec {
    pub fn new(proto: Proto, priority: u16) -> Self {
        Self {
            proto,
            priority,
            icmp_type: None,
            icmp_code: None,
        }
    }
}

fn learn_action(table: u8, spec: &LearnSpec) -> String {
    let icmp_type = spec
        .icmp_type
        .map(|t| format!("icmp_type={t},"))
        .unwrap_or_default();
    let icmp_code = spec
        .icmp_code
        .map(|c| format!("icmp_code={c},"))
        .unwrap_or_default();
    format!(
        "learn(table={table},priority={priority},\
         idle_timeout={idle},hard_timeout={hard},\
         {proto},\
         NXM_OF_ETH_SRC[]=NXM_OF_ETH_DST[],\
         NXM_OF_ETH_DST[]=NXM_OF_ETH_SRC[],\
         NXM_OF_IP_SRC[]=NXM_OF_IP_DST[],\
         NXM_OF_IP_DST[]=NXM_OF_IP_SRC[],\
         {dst_swap}{src_swap}{icmp_type}{icmp_code}\
         output:NXM_OF_IN_PORT[])",
        table = table,
        priority = spec.priority,
        idle = LEARN_IDLE_TIMEOUT,
        hard = LEARN_HARD_TIMEOUT,
        proto = spec.proto.learn_proto_match(),
        dst_swap = spec.proto.learn_dst_swap(),
        src_swap = spec.proto.learn_src_swap(),
        icmp_type = icmp_type,
        icmp_code = icmp_code,
    )
}

/// Action string for an ingress rule flow (table 12): learn the reverse flow
/// into the egress table, then deliver to the guest.
pub fn learn_ingress_actions(spec: &LearnSpec, ofport: u32) -> String {
    format!(
        "{},strip_vlan,output:{}",
        learn_action(EGRESS_TABLE, spec),
        ofport
    )
}

/// Action string for an egress rule flow (table 11): learn the reverse flow
/// into the ingress table, then continue up the pipeline.
pub fn learn_egress_actions(spec: &LearnSpec) -> String {
    format!("{},resubmit(,2)", learn_action(INGRESS_TABLE, spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_tokens() {
        assert_eq!(Proto::Udp.to_string(), "udp");
        assert_eq!(Proto::Icmpv6.to_string(), "ipv6,nw_proto=58");
    }

    #[test]
    fn test_learn_ingress_tcp() {
        let actions = learn_ingress_actions(&LearnSpec::new(Proto::Tcp, 60), 1);
        assert_eq!(
            actions,
            "learn(table=11,priority=60,idle_timeout=30,hard_timeout=1800,\
             eth_type=0x0800,ip_proto=6,\
             NXM_OF_ETH_SRC[]=NXM_OF_ETH_DST[],\
             NXM_OF_ETH_DST[]=NXM_OF_ETH_SRC[],\
             NXM_OF_IP_SRC[]=NXM_OF_IP_DST[],\
             NXM_OF_IP_DST[]=NXM_OF_IP_SRC[],\
             NXM_OF_TCP_DST[]=NXM_OF_TCP_SRC[],\
             NXM_OF_TCP_SRC[]=NXM_OF_TCP_DST[],\
             output:NXM_OF_IN_PORT[]),strip_vlan,output:1"
        );
    }

    #[test]
    fn test_learn_egress_icmp_with_type_and_code() {
        let mut spec = LearnSpec::new(Proto::Icmp, 60);
        spec.icmp_type = Some(10);
        spec.icmp_code = Some(20);
        let actions = learn_egress_actions(&spec);
        assert_eq!(
            actions,
            "learn(table=12,priority=60,idle_timeout=30,hard_timeout=1800,\
             eth_type=0x0800,ip_proto=1,\
             NXM_OF_ETH_SRC[]=NXM_OF_ETH_DST[],\
             NXM_OF_ETH_DST[]=NXM_OF_ETH_SRC[],\
             NXM_OF_IP_SRC[]=NXM_OF_IP_DST[],\
             NXM_OF_IP_DST[]=NXM_OF_IP_SRC[],\
             icmp_type=10,icmp_code=20,\
             output:NXM_OF_IN_PORT[]),resubmit(,2)"
        );
    }

    #[test]
    fn test_learn_egress_ip_has_no_port_swaps() {
        let actions = learn_egress_actions(&LearnSpec::new(Proto::Ip, 60));
        assert!(actions.contains("eth_type=0x0800,NXM_OF_ETH_SRC"));
        assert!(!actions.contains("TCP"));
        assert!(!actions.contains("UDP"));
    }

    #[test]
    fn test_flow_match_render_order() {
        let m = FlowMatch {
            table: Some(11),
            priority: Some(50),
            proto: Some(Proto::Udp),
            in_port: Some(1),
            dl_src: Some("fa:16:3e:00:00:01".into()),
            udp_src: Some(68.into()),
            udp_dst: Some(67.into()),
            ..Default::default()
        };
        assert_eq!(
            m.to_string(),
            "table=11,priority=50,udp,in_port=1,dl_src=fa:16:3e:00:00:01,udp_src=68,udp_dst=67"
        );
    }

    #[test]
    fn test_flow_render_with_masked_port() {
        let flow = Flow::new(
            FlowMatch {
                table: Some(12),
                priority: Some(30),
                proto: Some(Proto::Tcp),
                tcp_dst: Some(PortMatch::Masked("0x000a/0xfffe".into())),
                ..Default::default()
            },
            "drop",
        );
        assert_eq!(
            flow.to_string(),
            "table=12,priority=30,tcp,tcp_dst=0x000a/0xfffe,actions=drop"
        );
    }
}
