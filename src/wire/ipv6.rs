//! Plain IPv6, UDP and ICMPv6 header handling.
//!
//! The adaptation layer compresses and expands these headers; the DHCPv6
//! server and the RPL root build them. Only what those consumers need is
//! here, not a general stack.

use std::net::Ipv6Addr;

use super::util::Deserializer;
use super::Error;

pub const NEXT_HEADER_ROUTING: u8 = 43;
pub const NEXT_HEADER_UDP: u8 = 17;
pub const NEXT_HEADER_ICMPV6: u8 = 58;

pub const HEADER_SIZE: usize = 40;
pub const UDP_HEADER_SIZE: usize = 8;

/// The fixed IPv6 header
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-------+---------------+-------------------------------------+
/// |Version| Traffic Class |              Flow Label             |
/// +-------+---------------+-------+---------------+-------------+
/// |       Payload Length          |  Next Header  |  Hop Limit  |
/// +-------------------------------+---------------+-------------+
/// |                     Source Address (128)                    |
/// +-------------------------------------------------------------+
/// |                  Destination Address (128)                  |
/// +-------------------------------------------------------------+
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Header {
    pub fn new(next_header: u8, src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            payload_len: 0,
            next_header,
            hop_limit: 64,
            src,
            dst,
        }
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        let word = 6u32 << 28
            | u32::from(self.traffic_class) << 20
            | self.flow_label & 0x000f_ffff;
        out.extend_from_slice(&word.to_be_bytes());
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        out.push(self.next_header);
        out.push(self.hop_limit);
        out.extend_from_slice(&self.src.octets());
        out.extend_from_slice(&self.dst.octets());
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut data = Deserializer::new(bytes);
        let word = u32::from_be_bytes(data.deserialize()?);
        if word >> 28 != 6 {
            return Err(Error::UnknownValue("IP version", word >> 28));
        }
        Ok(Self {
            traffic_class: ((word >> 20) & 0xff) as u8,
            flow_label: word & 0x000f_ffff,
            payload_len: u16::from_be_bytes(data.deserialize()?),
            next_header: data.deserialize()?,
            hop_limit: data.deserialize()?,
            src: data.deserialize()?,
            dst: data.deserialize()?,
        })
    }
}

/// RFC 2460 upper-layer checksum over the pseudo-header and payload
pub fn upper_layer_checksum(
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    next_header: u8,
    payload: &[u8],
) -> u16 {
    let mut sum: u32 = 0;
    let mut add = |bytes: &[u8]| {
        let mut chunks = bytes.chunks_exact(2);
        for c in &mut chunks {
            sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
        }
        if let [last] = chunks.remainder() {
            sum += u32::from(u16::from_be_bytes([*last, 0]));
        }
    };
    add(&src.octets());
    add(&dst.octets());
    add(&(payload.len() as u32).to_be_bytes());
    add(&[0, 0, 0, next_header]);
    add(payload);
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let sum = !(sum as u16);
    if sum == 0 {
        0xffff
    } else {
        sum
    }
}

/// A UDP datagram ready for an IPv6 payload
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    /// Emits header plus payload with the checksum computed over the given
    /// address pair
    pub fn emit(&self, src: &Ipv6Addr, dst: &Ipv6Addr) -> Vec<u8> {
        let len = (UDP_HEADER_SIZE + self.payload.len()) as u16;
        let mut out = Vec::with_capacity(usize::from(len));
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.payload);
        let csum = upper_layer_checksum(src, dst, NEXT_HEADER_UDP, &out);
        out[6..8].copy_from_slice(&csum.to_be_bytes());
        out
    }

    /// Parses and checksum-verifies a UDP payload
    pub fn parse(bytes: &[u8], src: &Ipv6Addr, dst: &Ipv6Addr) -> Result<Self, Error> {
        let mut data = Deserializer::new(bytes);
        let src_port = u16::from_be_bytes(data.deserialize()?);
        let dst_port = u16::from_be_bytes(data.deserialize()?);
        let len = usize::from(u16::from_be_bytes(data.deserialize()?));
        let csum = u16::from_be_bytes(data.deserialize()?);
        if len < UDP_HEADER_SIZE || len > bytes.len() {
            return Err(Error::InvalidLength(len));
        }
        if csum != 0 && upper_layer_checksum(src, dst, NEXT_HEADER_UDP, &bytes[..len]) != 0 {
            return Err(Error::BadChecksum);
        }
        Ok(Self {
            src_port,
            dst_port,
            payload: bytes[UDP_HEADER_SIZE..len].to_vec(),
        })
    }
}

/// Emits an ICMPv6 message (type, code, body) with its checksum
pub fn emit_icmpv6(
    icmp_type: u8,
    code: u8,
    body: &[u8],
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.push(icmp_type);
    out.push(code);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(body);
    let csum = upper_layer_checksum(src, dst, NEXT_HEADER_ICMPV6, &out);
    out[2..4].copy_from_slice(&csum.to_be_bytes());
    out
}

/// Parses and verifies an ICMPv6 payload into (type, code, body)
pub fn parse_icmpv6<'a>(
    bytes: &'a [u8],
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
) -> Result<(u8, u8, &'a [u8]), Error> {
    if bytes.len() < 4 {
        return Err(Error::Truncated(bytes.len(), 4));
    }
    if upper_layer_checksum(src, dst, NEXT_HEADER_ICMPV6, bytes) != 0 {
        return Err(Error::BadChecksum);
    }
    Ok((bytes[0], bytes[1], &bytes[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Ipv6Addr, Ipv6Addr) {
        ("fd00::1".parse().unwrap(), "fd00::2".parse().unwrap())
    }

    #[test]
    fn header_roundtrip() {
        let (src, dst) = pair();
        let mut hdr = Ipv6Header::new(NEXT_HEADER_UDP, src, dst);
        hdr.payload_len = 52;
        hdr.hop_limit = 1;
        hdr.flow_label = 0xbeef;
        let mut out = Vec::new();
        hdr.emit(&mut out);
        assert_eq!(out.len(), HEADER_SIZE);
        assert_eq!(Ipv6Header::parse(&out).unwrap(), hdr);
    }

    #[test]
    fn udp_checksum_verifies() {
        let (src, dst) = pair();
        let dgram = UdpDatagram {
            src_port: 547,
            dst_port: 546,
            payload: b"advertise".to_vec(),
        };
        let wire = dgram.emit(&src, &dst);
        assert_eq!(UdpDatagram::parse(&wire, &src, &dst).unwrap(), dgram);

        let mut bad = wire;
        bad[10] ^= 1;
        assert_eq!(
            UdpDatagram::parse(&bad, &src, &dst),
            Err(Error::BadChecksum)
        );
    }

    #[test]
    fn icmpv6_roundtrip() {
        let (src, dst) = pair();
        let wire = emit_icmpv6(155, 0x01, &[1, 2, 3], &src, &dst);
        let (t, c, body) = parse_icmpv6(&wire, &src, &dst).unwrap();
        assert_eq!((t, c, body), (155, 0x01, &[1u8, 2, 3][..]));
    }
}
