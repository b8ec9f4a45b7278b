//! In-memory IPv4 packet buffer handed through the transmit path

use crate::protocol::ipv4::{self, offset, MIN_HEADER_SIZE};
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// An IPv4 packet starting at the network header, tagged with the VRF it
/// was received in and the transmit offload requests made on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    vrf: u32,
    tx_ip_checksum: bool,
}

impl Packet {
    /// Wrap raw bytes. Only the fixed header is checked here; the header
    /// length field is validated by the code that relies on it.
    pub fn new(data: Vec<u8>, vrf: u32) -> Result<Self> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "{} bytes is shorter than an IPv4 header",
                data.len()
            )));
        }
        if data[offset::VER_IHL] >> 4 != 4 {
            return Err(Error::InvalidPacket("not an IPv4 packet".into()));
        }

        Ok(Self {
            data,
            vrf,
            tx_ip_checksum: false,
        })
    }

    pub fn vrf(&self) -> u32 {
        self.vrf
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw access for protocol handlers mangling the payload
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Header length from the IHL field, if it describes a header that
    /// fits in the buffer.
    pub fn header_len(&self) -> Option<usize> {
        let len = ((self.data[offset::VER_IHL] & 0x0F) as usize) * 4;
        (len >= MIN_HEADER_SIZE && len <= self.data.len()).then_some(len)
    }

    pub fn protocol(&self) -> u8 {
        self.data[offset::PROTOCOL]
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        ipv4::read_addr(&self.data, offset::SRC)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        ipv4::read_addr(&self.data, offset::DST)
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.data[offset::SRC..offset::SRC + 4].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.data[offset::DST..offset::DST + 4].copy_from_slice(&addr.octets());
    }

    /// Source port of the transport header that follows the IPv4 header
    pub fn transport_src_port(&self) -> Option<u16> {
        let at = self.header_len()?;
        let bytes = self.data.get(at..at + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([
            self.data[offset::CHECKSUM],
            self.data[offset::CHECKSUM + 1],
        ])
    }

    pub fn zero_checksum(&mut self) {
        self.data[offset::CHECKSUM..offset::CHECKSUM + 2].fill(0);
    }

    /// Compute the header checksum in software. Assumes a zeroed field.
    pub fn fill_checksum(&mut self) {
        if let Some(hlen) = self.header_len() {
            let sum = ipv4::checksum(&self.data[..hlen]);
            self.data[offset::CHECKSUM..offset::CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
        }
    }

    pub fn header_checksum_valid(&self) -> bool {
        self.header_len()
            .is_some_and(|hlen| ipv4::checksum_valid(&self.data[..hlen]))
    }

    /// Ask the NIC to compute the IPv4 header checksum on transmit
    pub fn request_checksum_offload(&mut self) {
        self.tx_ip_checksum = true;
    }

    pub fn checksum_offload_requested(&self) -> bool {
        self.tx_ip_checksum
    }
}
