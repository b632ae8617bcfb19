//! Firewall rule data structures
//!
//! A [`Rule`] is the abstract directive the Manager hands to a backend:
//!
//! - Direction (inbound/outbound) selects the managed chain
//! - Protocol filtering (TCP, UDP, ICMP or all)
//! - Destination port or inclusive port range (`port = 0` means not port-scoped)
//! - Optional source/destination networks
//! - Action (ACCEPT/DROP/REJECT)
//!
//! Identity is the `id`. Two rules with the same match criteria but different
//! ids are distinct kernel entries.
//!
//! # Example
//!
//! ```
//! use hostwall::core::rule::{Action, Direction, Protocol, Rule};
//!
//! let rule = Rule::new("allow-https", Direction::Inbound, Protocol::Tcp, Action::Accept)
//!     .with_port(443);
//! assert!(rule.validate().is_ok());
//! assert!(!rule.is_blocking());
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::{Error, Result};

/// Network protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Transmission Control Protocol
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
    /// Internet Control Message Protocol (IPv4)
    #[strum(serialize = "icmp")]
    Icmp,
    /// Match all protocols
    #[strum(serialize = "all")]
    All,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        }
    }

    /// Only TCP and UDP carry the port numbers a rule can match on.
    pub const fn has_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    /// Whether traffic of `other` is matched by a rule using `self`.
    pub fn covers(self, other: Protocol) -> bool {
        self == Protocol::All || self == other
    }
}

/// Rule action (ACCEPT, DROP or REJECT)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Action {
    /// Accept the packet (allow it through)
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
    /// Drop the packet silently (no response sent)
    #[strum(serialize = "DROP")]
    Drop,
    /// Reject the packet and send ICMP unreachable response
    #[strum(serialize = "REJECT")]
    Reject,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
        }
    }

    /// DROP and REJECT both stop the packet.
    pub const fn is_blocking(self) -> bool {
        matches!(self, Action::Drop | Action::Reject)
    }
}

/// Traffic direction, which decides the managed chain a rule lands in
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    #[strum(serialize = "inbound")]
    Inbound,
    #[strum(serialize = "outbound")]
    Outbound,
}

impl Direction {
    /// Short tag used in kernel log prefixes
    pub const fn log_tag(self) -> &'static str {
        match self {
            Direction::Inbound => "IN",
            Direction::Outbound => "OUT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub protocol: Protocol,
    /// Destination port, 0 when the rule is not port-scoped
    #[serde(default)]
    pub port: u16,
    /// Inclusive end of a port range, 0 for a single port
    #[serde(default)]
    pub port_end: u16,
    #[serde(default)]
    pub source_cidr: Option<IpNetwork>,
    #[serde(default)]
    pub dest_cidr: Option<IpNetwork>,
    #[serde(default)]
    pub action: Action,
}

impl Rule {
    pub fn new(id: impl Into<String>, direction: Direction, protocol: Protocol, action: Action) -> Self {
        Self {
            id: id.into(),
            direction,
            protocol,
            port: 0,
            port_end: 0,
            source_cidr: None,
            dest_cidr: None,
            action,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self.port_end = 0;
        self
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port = start;
        self.port_end = end;
        self
    }

    pub fn from_source(mut self, cidr: IpNetwork) -> Self {
        self.source_cidr = Some(cidr);
        self
    }

    pub fn to_destination(mut self, cidr: IpNetwork) -> Self {
        self.dest_cidr = Some(cidr);
        self
    }

    /// The destination ports this rule matches, `None` when not port-scoped.
    pub fn ports(&self) -> Option<PortRange> {
        if self.port == 0 {
            return None;
        }
        let end = if self.port_end == 0 { self.port } else { self.port_end };
        Some(PortRange {
            start: self.port,
            end,
        })
    }

    pub fn is_blocking(&self) -> bool {
        self.action.is_blocking()
    }

    /// Whether this rule matches traffic to `port` over `protocol`,
    /// ignoring networks. A port-less rule matches every port.
    pub fn matches_port(&self, port: u16, protocol: Protocol) -> bool {
        self.protocol.covers(protocol) && self.ports().is_none_or(|r| r.contains(port))
    }

    /// Identifier of the opening rule that keeps an immutable/ensured port reachable.
    pub fn ensure_id(port: u16, protocol: Protocol) -> String {
        format!("immutable-{}-{port}", protocol.as_str())
    }

    /// Identifier of the DROP rule for a block-listed source network.
    pub fn block_id(cidr: &IpNetwork) -> String {
        format!("block-{}", cidr.to_string().replace('/', "_"))
    }

    /// Checks the rule is well formed before any backend sees it.
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_rule_id(&self.id).map_err(|m| Error::validation("id", m))?;
        crate::validators::validate_port_range(self.port, self.port_end)
            .map_err(|m| Error::validation("port_end", m))?;
        if self.port != 0 && !self.protocol.has_ports() {
            return Err(Error::validation(
                "port",
                format!("protocol {} cannot match ports", self.protocol),
            ));
        }
        crate::validators::validate_cidr_pair(self.source_cidr.as_ref(), self.dest_cidr.as_ref())
            .map_err(|m| Error::validation("dest_cidr", m))?;
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.id, self.direction, self.protocol)?;
        if let Some(ports) = self.ports() {
            write!(f, " port {ports}")?;
        }
        if let Some(src) = self.source_cidr {
            write!(f, " from {src}")?;
        }
        if let Some(dst) = self.dest_cidr {
            write!(f, " to {dst}")?;
        }
        write!(f, " {}", self.action)
    }
}

/// A port that must always resolve to ACCEPT
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ImmutablePort {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Default ports are seeded at startup and can never be removed
    #[serde(default, rename = "default")]
    pub is_default: bool,
}

impl ImmutablePort {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self {
            port,
            protocol,
            is_default: false,
        }
    }

    pub fn permanent(port: u16, protocol: Protocol) -> Self {
        Self {
            port,
            protocol,
            is_default: true,
        }
    }

    /// The ACCEPT rule a backend installs to keep this port open.
    pub fn opening_rule(&self) -> Rule {
        Rule::new(
            Rule::ensure_id(self.port, self.protocol),
            Direction::Inbound,
            self.protocol,
            Action::Accept,
        )
        .with_port(self.port)
    }
}

impl fmt::Display for ImmutablePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_port_range_single_and_range() {
        let rule = Rule::new("r", Direction::Inbound, Protocol::Tcp, Action::Drop).with_port(80);
        assert_eq!(rule.ports(), Some(PortRange::single(80)));

        let rule = rule.with_port_range(8000, 8080);
        let ports = rule.ports().unwrap();
        assert!(ports.contains(8000));
        assert!(ports.contains(8080));
        assert!(!ports.contains(8081));
        assert_eq!(ports.to_string(), "8000-8080");
    }

    #[test]
    fn test_not_port_scoped() {
        let rule = Rule::new("r", Direction::Inbound, Protocol::All, Action::Drop);
        assert!(rule.ports().is_none());
        assert!(rule.matches_port(22, Protocol::Tcp));
        assert!(rule.matches_port(53, Protocol::Udp));
    }

    #[test]
    fn test_matches_port_respects_protocol() {
        let rule = Rule::new("r", Direction::Inbound, Protocol::Udp, Action::Drop).with_port(22);
        assert!(!rule.matches_port(22, Protocol::Tcp));
        assert!(rule.matches_port(22, Protocol::Udp));
        assert!(!rule.matches_port(23, Protocol::Udp));
    }

    #[test]
    fn test_action_serde_uppercase() {
        let json = serde_json::to_string(&Action::Reject).unwrap();
        assert_eq!(json, "\"REJECT\"");
        let action: Action = serde_json::from_str("\"DROP\"").unwrap();
        assert_eq!(action, Action::Drop);
        assert_eq!(Action::from_str("accept").unwrap(), Action::Accept);
    }

    #[test]
    fn test_rule_deserialize_with_defaults() {
        let json = r#"{"id":"sg-1","port":443,"source_cidr":"10.0.0.0/8"}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.direction, Direction::Inbound);
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.action, Action::Accept);
        assert_eq!(rule.source_cidr.unwrap().to_string(), "10.0.0.0/8");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_port_on_icmp() {
        let rule = Rule::new("ping", Direction::Inbound, Protocol::Icmp, Action::Accept).with_port(7);
        assert!(matches!(rule.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let rule =
            Rule::new("r", Direction::Inbound, Protocol::Tcp, Action::Accept).with_port_range(90, 80);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_opening_rule_for_immutable_port() {
        let port = ImmutablePort::permanent(22, Protocol::Tcp);
        let rule = port.opening_rule();
        assert_eq!(rule.id, "immutable-tcp-22");
        assert_eq!(rule.action, Action::Accept);
        assert!(rule.matches_port(22, Protocol::Tcp));
        assert_eq!(port.to_string(), "22/tcp");
    }

    #[test]
    fn test_block_id_is_valid_rule_id() {
        let cidr: IpNetwork = "203.0.113.0/24".parse().unwrap();
        let id = Rule::block_id(&cidr);
        assert_eq!(id, "block-203.0.113.0_24");
        assert!(crate::validators::validate_rule_id(&id).is_ok());
    }

    #[test]
    fn test_display() {
        let rule = Rule::new("web", Direction::Outbound, Protocol::Tcp, Action::Reject)
            .with_port(25)
            .to_destination("198.51.100.0/24".parse().unwrap());
        assert_eq!(rule.to_string(), "web outbound tcp port 25 to 198.51.100.0/24 REJECT");
    }
}
