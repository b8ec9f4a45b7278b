//! IPv4 header layout, checksum and packet builder - RFC 791

use std::net::Ipv4Addr;

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// Header field offsets
pub mod offset {
    pub const VER_IHL: usize = 0;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: usize = 10;
    pub const SRC: usize = 12;
    pub const DST: usize = 16;
}

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Ones-complement checksum over a header with its checksum field zeroed
pub fn checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = header.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u16::from_be_bytes([*last, 0]) as u32);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// True when the header sums to zero including its stored checksum
pub fn checksum_valid(header: &[u8]) -> bool {
    checksum(header) == 0
}

/// Read an address at a fixed offset
pub(crate) fn read_addr(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

/// Builder for constructing IPv4 packets (tests, benchmark traffic)
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    identification: u16,
    ttl: u8,
    protocol: u8,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    options: Vec<u8>,
    payload: Vec<u8>,
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Self {
            identification: 0,
            ttl: 64,
            protocol: PROTO_UDP,
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn src_addr(mut self, addr: Ipv4Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv4Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    /// Header options, padded to a 4-byte boundary
    pub fn options(mut self, options: &[u8]) -> Self {
        self.options = options.to_vec();
        while self.options.len() % 4 != 0 {
            self.options.push(0);
        }
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// UDP datagram payload with the given ports
    pub fn udp(self, src_port: u16, dst_port: u16, data: &[u8]) -> Self {
        let mut dgram = Vec::with_capacity(8 + data.len());
        dgram.extend_from_slice(&src_port.to_be_bytes());
        dgram.extend_from_slice(&dst_port.to_be_bytes());
        dgram.extend_from_slice(&((8 + data.len()) as u16).to_be_bytes());
        dgram.extend_from_slice(&[0, 0]);
        dgram.extend_from_slice(data);
        self.protocol(PROTO_UDP).payload(&dgram)
    }

    pub fn build(self) -> Vec<u8> {
        let header_len = MIN_HEADER_SIZE + self.options.len();
        let total_length = (header_len + self.payload.len()) as u16;
        let mut buffer = vec![0u8; header_len + self.payload.len()];

        buffer[offset::VER_IHL] = 0x40 | (header_len / 4) as u8;
        buffer[2..4].copy_from_slice(&total_length.to_be_bytes());
        buffer[4..6].copy_from_slice(&self.identification.to_be_bytes());
        // DF
        buffer[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
        buffer[offset::TTL] = self.ttl;
        buffer[offset::PROTOCOL] = self.protocol;
        buffer[offset::SRC..offset::SRC + 4].copy_from_slice(&self.src_addr.octets());
        buffer[offset::DST..offset::DST + 4].copy_from_slice(&self.dst_addr.octets());
        buffer[MIN_HEADER_SIZE..header_len].copy_from_slice(&self.options);
        buffer[header_len..].copy_from_slice(&self.payload);

        let sum = checksum(&buffer[..header_len]);
        buffer[offset::CHECKSUM..offset::CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());

        buffer
    }
}

impl Default for Ipv4Builder {
    fn default() -> Self {
        Self::new()
    }
}
