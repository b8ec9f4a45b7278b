//! Ethernet framing for egress and ARP ingress

use super::{EtherType, MacAddr, VlanTag};
use crate::{Error, Result};

/// Ethernet header size without a VLAN tag
pub const HEADER_SIZE: usize = 14;

/// Parsed Ethernet frame (zero-copy reference)
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
    vlan_tag: Option<VlanTag>,
    payload_offset: usize,
}

impl<'a> Frame<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("frame too short".into()));
        }

        let ethertype = u16::from_be_bytes([buffer[12], buffer[13]]);
        let (vlan_tag, payload_offset) = if ethertype == EtherType::Vlan as u16 {
            if buffer.len() < HEADER_SIZE + 4 {
                return Err(Error::Parse("VLAN frame too short".into()));
            }
            (Some(VlanTag::from_bytes([buffer[14], buffer[15]])), 18)
        } else {
            (None, HEADER_SIZE)
        };

        Ok(Self {
            buffer,
            vlan_tag,
            payload_offset,
        })
    }

    pub fn dst_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buffer[0..6]);
        MacAddr(mac)
    }

    pub fn src_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buffer[6..12]);
        MacAddr(mac)
    }

    pub fn ethertype(&self) -> u16 {
        let at = self.payload_offset - 2;
        u16::from_be_bytes([self.buffer[at], self.buffer[at + 1]])
    }

    pub fn vlan_tag(&self) -> Option<VlanTag> {
        self.vlan_tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_offset..]
    }
}

/// Builder for outgoing Ethernet frames
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn with_capacity(payload_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(HEADER_SIZE + 4 + payload_len),
        }
    }

    pub fn dst_mac(mut self, mac: MacAddr) -> Self {
        self.buffer.extend_from_slice(&mac.0);
        self
    }

    pub fn src_mac(mut self, mac: MacAddr) -> Self {
        self.buffer.extend_from_slice(&mac.0);
        self
    }

    /// VLAN 0 means untagged
    pub fn vlan(mut self, vid: u16) -> Self {
        if vid != 0 {
            self.buffer
                .extend_from_slice(&(EtherType::Vlan as u16).to_be_bytes());
            self.buffer.extend_from_slice(&VlanTag::new(vid).to_bytes());
        }
        self
    }

    pub fn ethertype(mut self, ethertype: EtherType) -> Self {
        self.buffer
            .extend_from_slice(&(ethertype as u16).to_be_bytes());
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.buffer.extend_from_slice(payload);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}
