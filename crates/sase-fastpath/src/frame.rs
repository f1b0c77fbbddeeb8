//! Test-traffic frame builder
//!
//! Builds Ethernet/IPv4/TCP-or-UDP frames for software ports, benchmarks
//! and dry runs. Checksums are left at zero; the fast path never verifies
//! them.

use crate::classify::{
    Transport, ETH_HDR_LEN, ETH_P_IPV4, IPV4_HDR_LEN, TCP_HDR_LEN, UDP_HDR_LEN, VLAN_TAG_LEN,
};

/// Default source MAC of generated frames
pub const DEFAULT_SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Frame builder
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    vlans: Vec<(u16, u16)>,
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    protocol: Transport,
    src_port: u16,
    dst_port: u16,
    ip_options: usize,
    payload: usize,
}

impl FrameBuilder {
    fn new(protocol: Transport, src_ip: [u8; 4], dst_ip: [u8; 4], src_port: u16, dst_port: u16) -> Self {
        Self {
            dst_mac: [0xFF; 6],
            src_mac: DEFAULT_SRC_MAC,
            vlans: Vec::new(),
            src_ip,
            dst_ip,
            protocol,
            src_port,
            dst_port,
            ip_options: 0,
            payload: 0,
        }
    }

    /// UDP frame
    pub fn udp(src_ip: [u8; 4], dst_ip: [u8; 4], src_port: u16, dst_port: u16) -> Self {
        Self::new(Transport::Udp, src_ip, dst_ip, src_port, dst_port)
    }

    /// TCP frame
    pub fn tcp(src_ip: [u8; 4], dst_ip: [u8; 4], src_port: u16, dst_port: u16) -> Self {
        Self::new(Transport::Tcp, src_ip, dst_ip, src_port, dst_port)
    }

    /// Destination MAC
    pub fn dst_mac(mut self, mac: [u8; 6]) -> Self {
        self.dst_mac = mac;
        self
    }

    /// Push a VLAN tag (outermost first)
    pub fn vlan(mut self, tpid: u16, vid: u16) -> Self {
        self.vlans.push((tpid, vid & 0x0FFF));
        self
    }

    /// IPv4 options length in bytes (rounded up to 4)
    pub fn ip_options(mut self, len: usize) -> Self {
        self.ip_options = len.div_ceil(4) * 4;
        self
    }

    /// Transport payload length in bytes
    pub fn payload(mut self, len: usize) -> Self {
        self.payload = len;
        self
    }

    /// Encode the frame
    pub fn build(&self) -> Vec<u8> {
        let l4_len = match self.protocol {
            Transport::Tcp => TCP_HDR_LEN,
            Transport::Udp => UDP_HDR_LEN,
        };
        let ip_hdr_len = IPV4_HDR_LEN + self.ip_options;
        let total_len = ip_hdr_len + l4_len + self.payload;

        let mut out =
            Vec::with_capacity(ETH_HDR_LEN + self.vlans.len() * VLAN_TAG_LEN + total_len);

        // Ethernet
        out.extend_from_slice(&self.dst_mac);
        out.extend_from_slice(&self.src_mac);
        for (tpid, vid) in &self.vlans {
            out.extend_from_slice(&tpid.to_be_bytes());
            out.extend_from_slice(&vid.to_be_bytes());
        }
        out.extend_from_slice(&ETH_P_IPV4.to_be_bytes());

        // IPv4
        out.push(0x40 | (ip_hdr_len / 4) as u8);
        out.push(0x00);
        out.extend_from_slice(&(total_len as u16).to_be_bytes());
        out.extend_from_slice(&[0x00, 0x00, 0x40, 0x00]); // id, DF
        out.push(64); // ttl
        out.push(self.protocol.ip_proto());
        out.extend_from_slice(&[0x00, 0x00]); // checksum
        out.extend_from_slice(&self.src_ip);
        out.extend_from_slice(&self.dst_ip);
        out.resize(out.len() + self.ip_options, 0x01); // NOP options

        // Transport
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        match self.protocol {
            Transport::Tcp => {
                out.extend_from_slice(&[0; 8]); // seq, ack
                out.extend_from_slice(&[0x50, 0x02, 0xFF, 0xFF]); // offset, SYN, window
                out.extend_from_slice(&[0; 4]); // checksum, urgent
            }
            Transport::Udp => {
                out.extend_from_slice(&((UDP_HDR_LEN + self.payload) as u16).to_be_bytes());
                out.extend_from_slice(&[0; 2]);
            }
        }
        out.resize(out.len() + self.payload, 0xAB);
        out
    }
}
