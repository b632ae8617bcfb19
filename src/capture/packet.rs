//! Log prefix and IP header decoding
//!
//! Nothing here fails: a payload that is too short or malformed still yields
//! a [`Headers`] value, with protocol `OTHER`, zero ports and unspecified
//! addresses wherever the bytes were missing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::core::rule::Action;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

/// Extracts the verdict from a kernel log prefix such as `HOSTWALL-IN:DROP:`.
///
/// Segments are compared case-insensitively and the first recognised one
/// wins. Prefixes without a verdict mean the packet took the default path,
/// which accepts.
pub fn parse_verdict(prefix: &str) -> Action {
    prefix
        .to_ascii_uppercase()
        .split(':')
        .find_map(|segment| match segment.trim() {
            "ACCEPT" => Some(Action::Accept),
            "DROP" => Some(Action::Drop),
            "REJECT" => Some(Action::Reject),
            _ => None,
        })
        .unwrap_or(Action::Accept)
}

/// Name for an IP protocol number.
pub const fn protocol_name(number: u8) -> &'static str {
    match number {
        1 => "ICMP",
        2 => "IGMP",
        PROTO_TCP => "TCP",
        PROTO_UDP => "UDP",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        _ => "OTHER",
    }
}

/// Addressing information recovered from a raw IP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headers {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: &'static str,
}

impl Default for Headers {
    fn default() -> Self {
        Self {
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            protocol: "OTHER",
        }
    }
}

fn be16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
}

/// Source and destination ports of a TCP/UDP header starting at `offset`.
fn transport_ports(payload: &[u8], number: u8, offset: usize) -> (u16, u16) {
    if number != PROTO_TCP && number != PROTO_UDP {
        return (0, 0);
    }
    match (be16(payload, offset), be16(payload, offset + 2)) {
        (Some(src), Some(dst)) => (src, dst),
        _ => (0, 0),
    }
}

fn decode_v4(payload: &[u8]) -> Headers {
    let header_len = usize::from(payload[0] & 0x0f) * 4;
    let number = payload[9];
    let src = Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]);
    let dst = Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]);

    // An IHL below the minimum leaves no trustworthy transport offset
    let (src_port, dst_port) = if header_len >= IPV4_MIN_HEADER {
        transport_ports(payload, number, header_len)
    } else {
        (0, 0)
    };

    Headers {
        src_ip: IpAddr::V4(src),
        dst_ip: IpAddr::V4(dst),
        src_port,
        dst_port,
        protocol: protocol_name(number),
    }
}

fn decode_v6(payload: &[u8]) -> Headers {
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&payload[8..24]);
    dst.copy_from_slice(&payload[24..40]);
    let number = payload[6];
    let (src_port, dst_port) = transport_ports(payload, number, IPV6_HEADER);

    Headers {
        src_ip: IpAddr::V6(Ipv6Addr::from(src)),
        dst_ip: IpAddr::V6(Ipv6Addr::from(dst)),
        src_port,
        dst_port,
        protocol: if number == PROTO_ICMPV6 { "ICMPv6" } else { protocol_name(number) },
    }
}

/// Decodes the network and transport headers of a raw packet.
pub fn decode(payload: &[u8]) -> Headers {
    match payload.first().map(|b| b >> 4) {
        Some(6) if payload.len() >= IPV6_HEADER => decode_v6(payload),
        Some(6) => Headers::default(),
        Some(_) if payload.len() >= IPV4_MIN_HEADER => decode_v4(payload),
        _ => Headers::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ipv4_packet(protocol: u8, ports: Option<(u16, u16)>) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[9] = protocol;
        packet[12..16].copy_from_slice(&[192, 0, 2, 10]);
        packet[16..20].copy_from_slice(&[198, 51, 100, 20]);
        if let Some((src, dst)) = ports {
            packet.extend_from_slice(&src.to_be_bytes());
            packet.extend_from_slice(&dst.to_be_bytes());
        }
        packet
    }

    #[test]
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("HOSTWALL-IN:DROP:"), Action::Drop);
        assert_eq!(parse_verdict("hostwall-out:reject:"), Action::Reject);
        assert_eq!(parse_verdict("HOSTWALL-IN:ACCEPT:"), Action::Accept);
        assert_eq!(parse_verdict("HOSTWALL-IN:"), Action::Accept);
        assert_eq!(parse_verdict(""), Action::Accept);
        // First recognised segment wins
        assert_eq!(parse_verdict("X:REJECT:DROP"), Action::Reject);
        assert_eq!(parse_verdict("DROPPED:"), Action::Accept);
    }

    #[test]
    fn test_decode_tcp_header() {
        let packet = ipv4_packet(6, Some((51234, 443)));
        let headers = decode(&packet);
        assert_eq!(headers.protocol, "TCP");
        assert_eq!(headers.src_ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(headers.dst_ip, "198.51.100.20".parse::<IpAddr>().unwrap());
        assert_eq!(headers.src_port, 51234);
        assert_eq!(headers.dst_port, 443);
    }

    #[test]
    fn test_decode_honours_header_length() {
        // IHL 6: four option bytes sit between the header and the ports
        let mut packet = ipv4_packet(17, None);
        packet[0] = 0x46;
        packet.extend_from_slice(&[1, 1, 1, 1]);
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(&5353u16.to_be_bytes());
        let headers = decode(&packet);
        assert_eq!(headers.protocol, "UDP");
        assert_eq!((headers.src_port, headers.dst_port), (53, 5353));
    }

    #[test]
    fn test_non_port_protocols() {
        let headers = decode(&ipv4_packet(1, Some((1, 2))));
        assert_eq!(headers.protocol, "ICMP");
        assert_eq!((headers.src_port, headers.dst_port), (0, 0));
        assert_eq!(decode(&ipv4_packet(47, None)).protocol, "GRE");
        assert_eq!(decode(&ipv4_packet(99, None)).protocol, "OTHER");
        // Next-header 58 only means ICMPv6 inside an IPv6 packet
        assert_eq!(decode(&ipv4_packet(58, None)).protocol, "OTHER");
    }

    #[test]
    fn test_truncated_transport_header() {
        let mut packet = ipv4_packet(6, None);
        packet.extend_from_slice(&[0x01, 0xbb]);
        let headers = decode(&packet);
        assert_eq!(headers.protocol, "TCP");
        assert_eq!((headers.src_port, headers.dst_port), (0, 0));
    }

    #[test]
    fn test_short_payload_is_best_effort() {
        let headers = decode(&[0x45, 0, 0, 20]);
        assert_eq!(headers, Headers::default());
        assert_eq!(decode(&[]).protocol, "OTHER");
    }

    #[test]
    fn test_decode_ipv6_udp() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[6] = 17;
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        packet[8..24].copy_from_slice(&src.octets());
        packet[24..40].copy_from_slice(&dst.octets());
        packet.extend_from_slice(&546u16.to_be_bytes());
        packet.extend_from_slice(&547u16.to_be_bytes());

        let headers = decode(&packet);
        assert_eq!(headers.protocol, "UDP");
        assert_eq!(headers.src_ip, IpAddr::V6(src));
        assert_eq!(headers.dst_ip, IpAddr::V6(dst));
        assert_eq!((headers.src_port, headers.dst_port), (546, 547));
    }

    #[test]
    fn test_decode_icmpv6() {
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[6] = 58;
        let headers = decode(&packet);
        assert_eq!(headers.protocol, "ICMPv6");
        assert_eq!((headers.src_port, headers.dst_port), (0, 0));
    }

    #[test]
    fn test_truncated_ipv6_is_best_effort() {
        let mut packet = vec![0u8; 30];
        packet[0] = 0x60;
        assert_eq!(decode(&packet), Headers::default());
    }

    proptest! {
        #[test]
        fn decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..128)) {
            let headers = decode(&payload);
            if headers.protocol != "TCP" && headers.protocol != "UDP" {
                prop_assert_eq!(headers.src_port, 0);
                prop_assert_eq!(headers.dst_port, 0);
            }
        }

        #[test]
        fn verdict_is_case_insensitive(prefix in "HOSTWALL-(IN|OUT)", verdict in prop_oneof!["drop", "Reject", "ACCEPT"]) {
            let expected = parse_verdict(&verdict.to_ascii_uppercase());
            prop_assert_eq!(parse_verdict(&format!("{prefix}:{verdict}:")), expected);
        }
    }
}
