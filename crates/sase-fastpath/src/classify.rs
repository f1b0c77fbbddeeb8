//! Packet Classifier
//!
//! Ethernet → (VLAN)* → IPv4 → TCP/UDP header extraction.
//!
//! Each layer takes the captured bytes plus an offset and returns a typed
//! view and the next offset, or a length error. Embedded length fields are
//! clamped to what was actually captured, never trusted. No allocation.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ethernet header length
pub const ETH_HDR_LEN: usize = 14;
/// 802.1Q / 802.1ad tag length
pub const VLAN_TAG_LEN: usize = 4;
/// Minimum IPv4 header length
pub const IPV4_HDR_LEN: usize = 20;
/// Minimum TCP header length
pub const TCP_HDR_LEN: usize = 20;
/// UDP header length
pub const UDP_HDR_LEN: usize = 8;
/// Stacked VLAN tags accepted before the frame is rejected
pub const MAX_VLAN_TAGS: u8 = 2;

/// IPv4 ethertype
pub const ETH_P_IPV4: u16 = 0x0800;
/// 802.1Q VLAN ethertype
pub const ETH_P_8021Q: u16 = 0x8100;
/// 802.1ad service VLAN ethertype
pub const ETH_P_8021AD: u16 = 0x88A8;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Classification failure. Always recoverable: the buffer is released and
/// counted as a drop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassifyError {
    /// A header extends past the captured bytes
    #[error("truncated packet")]
    Truncated,

    /// More stacked VLAN tags than supported
    #[error("more than 2 stacked VLAN tags")]
    MalformedVlan,

    /// Not IPv4
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEthertype(u16),

    /// IPv4 version or header length field is invalid
    #[error("malformed IPv4 header")]
    MalformedIpv4,

    /// Neither TCP nor UDP
    #[error("unsupported transport protocol {0}")]
    UnsupportedTransport(u8),
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Transport {
    /// IP protocol number
    pub fn ip_proto(self) -> u8 {
        match self {
            Transport::Tcp => IPPROTO_TCP,
            Transport::Udp => IPPROTO_UDP,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("TCP"),
            Transport::Udp => f.write_str("UDP"),
        }
    }
}

/// Per-packet metadata (transient)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMetadata {
    /// Source address
    pub src_ip: Ipv4Addr,
    /// Destination address
    pub dst_ip: Ipv4Addr,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Transport protocol
    pub protocol: Transport,
    /// IPv4 payload length, clamped to the captured bytes
    pub payload_len: u16,
    /// VLAN tags skipped
    pub vlan_tags: u8,
}

#[inline(always)]
fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

#[inline(always)]
fn ipv4_at(data: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[off], data[off + 1], data[off + 2], data[off + 3])
}

/// Ethernet view after VLAN stripping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EthernetView {
    ethertype: u16,
    vlan_tags: u8,
}

/// Parse the Ethernet header and skip up to [`MAX_VLAN_TAGS`] tags.
/// Returns the view and the L3 offset.
#[inline]
fn ethernet(data: &[u8]) -> Result<(EthernetView, usize), ClassifyError> {
    if data.len() < ETH_HDR_LEN {
        return Err(ClassifyError::Truncated);
    }

    // Offset of the ethertype field currently being examined
    let mut type_off = ETH_HDR_LEN - 2;
    let mut ethertype = be16(data, type_off);
    let mut vlan_tags = 0u8;

    while ethertype == ETH_P_8021Q || ethertype == ETH_P_8021AD {
        if vlan_tags == MAX_VLAN_TAGS {
            return Err(ClassifyError::MalformedVlan);
        }
        type_off += VLAN_TAG_LEN;
        if type_off + 2 > data.len() {
            return Err(ClassifyError::Truncated);
        }
        ethertype = be16(data, type_off);
        vlan_tags += 1;
    }

    Ok((EthernetView { ethertype, vlan_tags }, type_off + 2))
}

/// IPv4 view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4View {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: u16,
}

/// Parse the IPv4 header at `off`. Returns the view and the L4 offset.
#[inline]
fn ipv4(data: &[u8], off: usize) -> Result<(Ipv4View, usize), ClassifyError> {
    let captured = data.len().saturating_sub(off);
    if captured < IPV4_HDR_LEN {
        return Err(ClassifyError::Truncated);
    }

    let version = data[off] >> 4;
    let header_len = ((data[off] & 0x0F) as usize) * 4;
    if version != 4 || header_len < IPV4_HDR_LEN {
        return Err(ClassifyError::MalformedIpv4);
    }
    if captured < header_len {
        return Err(ClassifyError::Truncated);
    }

    // Total length may claim more than was captured; clamp it.
    let total_len = (be16(data, off + 2) as usize).min(captured);
    let payload_len = total_len.saturating_sub(header_len) as u16;

    let view = Ipv4View {
        src: ipv4_at(data, off + 12),
        dst: ipv4_at(data, off + 16),
        protocol: data[off + 9],
        payload_len,
    };
    Ok((view, off + header_len))
}

/// Parse the transport ports at `off` given the clamped payload length.
#[inline]
fn transport(
    data: &[u8],
    off: usize,
    protocol: u8,
    payload_len: u16,
) -> Result<(Transport, u16, u16), ClassifyError> {
    let (transport, min_len) = match protocol {
        IPPROTO_TCP => (Transport::Tcp, TCP_HDR_LEN),
        IPPROTO_UDP => (Transport::Udp, UDP_HDR_LEN),
        other => return Err(ClassifyError::UnsupportedTransport(other)),
    };

    // payload_len is already bounded by the capture, but check the slice
    // itself as well so a bad offset can never index out of range.
    if (payload_len as usize) < min_len || data.len() < off + min_len {
        return Err(ClassifyError::Truncated);
    }

    Ok((transport, be16(data, off), be16(data, off + 2)))
}

/// Classify a captured frame.
#[inline]
pub fn parse(data: &[u8]) -> Result<PacketMetadata, ClassifyError> {
    let (eth, l3) = ethernet(data)?;
    if eth.ethertype != ETH_P_IPV4 {
        return Err(ClassifyError::UnsupportedEthertype(eth.ethertype));
    }

    let (ip, l4) = ipv4(data, l3)?;
    let (protocol, src_port, dst_port) = transport(data, l4, ip.protocol, ip.payload_len)?;

    Ok(PacketMetadata {
        src_ip: ip.src,
        dst_ip: ip.dst,
        src_port,
        dst_port,
        protocol,
        payload_len: ip.payload_len,
        vlan_tags: eth.vlan_tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use proptest::prelude::*;

    fn tcp_packet() -> [u8; 54] {
        [
            // Ethernet (14 bytes)
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // dst mac
            0x02, 0x00, 0x00, 0x00, 0x00, 0x01, // src mac
            0x08, 0x00, // IPv4
            // IPv4 (20 bytes)
            0x45, 0x00, 0x00, 0x28, // ver, ihl, tos, len = 40
            0x00, 0x00, 0x40, 0x00, // id, flags, frag
            0x40, 0x06, 0x00, 0x00, // ttl, proto (TCP), checksum
            0xC0, 0xA8, 0x01, 0x01, // src ip: 192.168.1.1
            0x0A, 0x00, 0x00, 0x01, // dst ip: 10.0.0.1
            // TCP (20 bytes)
            0x30, 0x39, 0x01, 0xBB, // src port: 12345, dst port: 443
            0x00, 0x00, 0x00, 0x00, // seq
            0x00, 0x00, 0x00, 0x00, // ack
            0x50, 0x02, 0x00, 0x00, // offset, flags
            0x00, 0x00, 0x00, 0x00, // checksum, urgent
        ]
    }

    #[test]
    fn test_parse_tcp() {
        let meta = parse(&tcp_packet()).unwrap();
        assert_eq!(meta.src_ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(meta.dst_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(meta.src_port, 12345);
        assert_eq!(meta.dst_port, 443);
        assert_eq!(meta.protocol, Transport::Tcp);
        assert_eq!(meta.payload_len, 20);
        assert_eq!(meta.vlan_tags, 0);
    }

    #[test]
    fn test_truncated_to_30_bytes() {
        assert_eq!(parse(&tcp_packet()[..30]), Err(ClassifyError::Truncated));
    }

    #[test]
    fn test_short_ethernet() {
        assert_eq!(parse(&[0u8; 13]), Err(ClassifyError::Truncated));
        assert_eq!(parse(&[]), Err(ClassifyError::Truncated));
    }

    #[test]
    fn test_truncated_tcp_header() {
        let pkt = tcp_packet();
        assert_eq!(parse(&pkt[..50]), Err(ClassifyError::Truncated));
    }

    #[test]
    fn test_two_vlan_tags() {
        let frame = FrameBuilder::udp([10, 1, 1, 1], [10, 2, 2, 2], 5060, 5061)
            .vlan(ETH_P_8021AD, 100)
            .vlan(ETH_P_8021Q, 200)
            .build();

        let meta = parse(&frame).unwrap();
        assert_eq!(meta.vlan_tags, 2);
        assert_eq!(meta.src_ip, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(meta.dst_ip, Ipv4Addr::new(10, 2, 2, 2));
        assert_eq!((meta.src_port, meta.dst_port), (5060, 5061));
        assert_eq!(meta.protocol, Transport::Udp);
    }

    #[test]
    fn test_three_vlan_tags_rejected() {
        let frame = FrameBuilder::udp([10, 1, 1, 1], [10, 2, 2, 2], 1, 2)
            .vlan(ETH_P_8021Q, 1)
            .vlan(ETH_P_8021Q, 2)
            .vlan(ETH_P_8021Q, 3)
            .build();
        assert_eq!(parse(&frame), Err(ClassifyError::MalformedVlan));
    }

    #[test]
    fn test_vlan_tag_cut_off() {
        let frame = FrameBuilder::udp([10, 1, 1, 1], [10, 2, 2, 2], 1, 2)
            .vlan(ETH_P_8021Q, 1)
            .build();
        assert_eq!(parse(&frame[..16]), Err(ClassifyError::Truncated));
    }

    #[test]
    fn test_unsupported_ethertype() {
        let mut pkt = tcp_packet();
        pkt[12] = 0x86;
        pkt[13] = 0xDD; // IPv6
        assert_eq!(parse(&pkt), Err(ClassifyError::UnsupportedEthertype(0x86DD)));
    }

    #[test]
    fn test_unsupported_transport() {
        let mut pkt = tcp_packet();
        pkt[23] = 132; // SCTP
        assert_eq!(parse(&pkt), Err(ClassifyError::UnsupportedTransport(132)));
    }

    #[test]
    fn test_malformed_ipv4() {
        let mut pkt = tcp_packet();
        pkt[14] = 0x44; // IHL 4
        assert_eq!(parse(&pkt), Err(ClassifyError::MalformedIpv4));
        pkt[14] = 0x65; // version 6
        assert_eq!(parse(&pkt), Err(ClassifyError::MalformedIpv4));
    }

    #[test]
    fn test_total_length_clamped() {
        let mut pkt = tcp_packet();
        pkt[16] = 0x05;
        pkt[17] = 0xDC; // claims 1500 bytes
        let meta = parse(&pkt).unwrap();
        assert_eq!(meta.payload_len, 20);
    }

    #[test]
    fn test_total_length_shorter_than_transport() {
        let mut pkt = tcp_packet();
        pkt[17] = 0x1C; // total length 28 leaves 8 bytes for TCP
        assert_eq!(parse(&pkt), Err(ClassifyError::Truncated));
    }

    #[test]
    fn test_ipv4_options_honoured() {
        let frame = FrameBuilder::tcp([1, 1, 1, 1], [2, 2, 2, 2], 80, 8080)
            .ip_options(8)
            .build();
        let meta = parse(&frame).unwrap();
        assert_eq!((meta.src_port, meta.dst_port), (80, 8080));
        assert_eq!(meta.payload_len as usize, TCP_HDR_LEN);
    }

    proptest! {
        #[test]
        fn prop_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = parse(&data);
        }

        #[test]
        fn prop_short_prefix_is_truncated(cut in 0usize..54) {
            let pkt = tcp_packet();
            prop_assert_eq!(parse(&pkt[..cut]), Err(ClassifyError::Truncated));
        }
    }
}
