//! 6LoWPAN header compression (RFC 6282) and fragmentation (RFC 4944).
//!
//! IPHC base encoding:
//!
//! ```plain
//!  0   1   2   3   4   5   6   7   8   9   10  11  12  13  14  15
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 1 |  TF   | NH| HLIM  |CID|SAC|  SAM  | M |DAC|  DAM  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! Stateful compression consults the interface context table through the
//! [`ContextLookup`] capability; the adaptation layer implements it over
//! its context list. UDP is the only next header compressed (NHC
//! `11110CPP`); its checksum always stays inline.

use std::net::Ipv6Addr;

use super::ipv6::{self, Ipv6Header};
use super::util::Deserializer;
use super::Error;
use crate::MacAddr;

/// Dispatch values (RFC 4944 §5.1)
pub const DISPATCH_IPV6: u8 = 0x41;
const DISPATCH_IPHC_MASK: u8 = 0xe0;
const DISPATCH_IPHC: u8 = 0x60;
const DISPATCH_FRAG1: u8 = 0xc0;
const DISPATCH_FRAGN: u8 = 0xe0;
const DISPATCH_FRAG_MASK: u8 = 0xf8;

const NHC_UDP: u8 = 0xf0;
const NHC_UDP_MASK: u8 = 0xf8;

/// Access to the 6LoWPAN context table for stateful compression
pub trait ContextLookup {
    /// Longest-prefix context usable for *compression* of `addr`
    fn by_addr(&self, addr: &Ipv6Addr) -> Option<(u8, Ipv6Addr, u8)>;
    /// Context by identifier, usable for decompression (including expiring
    /// contexts in their grace window)
    fn by_cid(&self, cid: u8) -> Option<(Ipv6Addr, u8)>;
}

/// An empty context table; link-local traffic compresses fine without one
pub struct NoContexts;

impl ContextLookup for NoContexts {
    fn by_addr(&self, _addr: &Ipv6Addr) -> Option<(u8, Ipv6Addr, u8)> {
        None
    }
    fn by_cid(&self, _cid: u8) -> Option<(Ipv6Addr, u8)> {
        None
    }
}

/// The interface identifier a link-layer address implies (RFC 6282 §3.2.2)
fn l2_iid(addr: &MacAddr) -> [u8; 8] {
    match addr {
        MacAddr::Ext(eui64) => eui64.iid(),
        MacAddr::Short(s) => {
            let b = s.to_be_bytes();
            [0, 0, 0, 0xff, 0xfe, 0, b[0], b[1]]
        }
    }
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    addr.octets()[..8] == [0xfe, 0x80, 0, 0, 0, 0, 0, 0]
}

/// Unicast source/destination address modes shared by SAM and DAM
fn compress_unicast(
    addr: &Ipv6Addr,
    l2: &MacAddr,
    ctxs: &dyn ContextLookup,
    inline: &mut Vec<u8>,
) -> (bool, u8, Option<u8>) {
    let octets = addr.octets();
    let iid = &octets[8..16];
    if is_link_local(addr) {
        let mode = if iid == l2_iid(l2) {
            3
        } else if iid[..6] == [0, 0, 0, 0xff, 0xfe, 0] {
            inline.extend_from_slice(&iid[6..]);
            2
        } else {
            inline.extend_from_slice(iid);
            1
        };
        return (false, mode, None);
    }
    if let Some((cid, _prefix, len)) = ctxs.by_addr(addr) {
        // Contexts cover at most the upper 64 bits
        if len <= 64 {
            let mode = if iid == l2_iid(l2) {
                3
            } else if iid[..6] == [0, 0, 0, 0xff, 0xfe, 0] {
                inline.extend_from_slice(&iid[6..]);
                2
            } else {
                inline.extend_from_slice(iid);
                1
            };
            return (true, mode, Some(cid));
        }
    }
    inline.extend_from_slice(&octets);
    (false, 0, None)
}

fn expand_unicast(
    stateful: bool,
    mode: u8,
    cid: u8,
    l2: &MacAddr,
    ctxs: &dyn ContextLookup,
    data: &mut Deserializer<'_>,
) -> Result<Ipv6Addr, Error> {
    let mut octets = [0u8; 16];
    let prefix: [u8; 8] = if stateful {
        if mode == 0 {
            // SAC=1, SAM=00 is the unspecified address
            return Ok(Ipv6Addr::UNSPECIFIED);
        }
        let (ctx_prefix, _len) = ctxs
            .by_cid(cid)
            .ok_or(Error::UnknownValue("context identifier", cid.into()))?;
        ctx_prefix.octets()[..8].try_into().unwrap()
    } else {
        [0xfe, 0x80, 0, 0, 0, 0, 0, 0]
    };
    octets[..8].copy_from_slice(&prefix);
    match mode {
        0 => return Ok(Ipv6Addr::from(<[u8; 16]>::try_from(data.advance(16)?).unwrap())),
        1 => octets[8..].copy_from_slice(data.advance(8)?),
        2 => {
            octets[8..14].copy_from_slice(&[0, 0, 0, 0xff, 0xfe, 0]);
            octets[14..].copy_from_slice(data.advance(2)?);
        }
        _ => octets[8..].copy_from_slice(&l2_iid(l2)),
    }
    Ok(octets.into())
}

/// Compresses a full IPv6 packet into 6LoWPAN IPHC form
pub fn compress(
    packet: &[u8],
    ctxs: &dyn ContextLookup,
    l2_src: &MacAddr,
    l2_dst: &MacAddr,
) -> Result<Vec<u8>, Error> {
    let hdr = Ipv6Header::parse(packet)?;
    let payload = &packet[ipv6::HEADER_SIZE..];

    let mut inline = Vec::new();

    // Traffic class and flow label
    let tf = match (hdr.traffic_class, hdr.flow_label) {
        (0, 0) => 3u8,
        (_, 0) => {
            inline.push(hdr.traffic_class);
            2
        }
        _ => {
            let fl = hdr.flow_label.to_be_bytes();
            inline.push(hdr.traffic_class);
            inline.push(fl[1] & 0x0f);
            inline.push(fl[2]);
            inline.push(fl[3]);
            0
        }
    };

    let udp = hdr.next_header == ipv6::NEXT_HEADER_UDP && payload.len() >= ipv6::UDP_HEADER_SIZE;
    if !udp {
        inline.push(hdr.next_header);
    }

    let hlim = match hdr.hop_limit {
        1 => 1u8,
        64 => 2,
        255 => 3,
        h => {
            inline.push(h);
            0
        }
    };

    let (sac, sam, sci) = compress_unicast(&hdr.src, l2_src, ctxs, &mut inline);

    let (m, dac, dam, dci);
    if hdr.dst.is_multicast() {
        m = true;
        dac = false;
        dci = None;
        let octets = hdr.dst.octets();
        if octets[1] == 0x02 && octets[2..15] == [0; 13] {
            inline.push(octets[15]);
            dam = 3;
        } else if octets[2..13] == [0; 11] {
            inline.push(octets[1]);
            inline.extend_from_slice(&octets[13..]);
            dam = 2;
        } else if octets[2..11] == [0; 9] {
            inline.push(octets[1]);
            inline.extend_from_slice(&octets[11..]);
            dam = 1;
        } else {
            inline.extend_from_slice(&octets);
            dam = 0;
        }
    } else {
        m = false;
        let (c, mode, cid) = compress_unicast(&hdr.dst, l2_dst, ctxs, &mut inline);
        dac = c;
        dam = mode;
        dci = cid;
    }

    let cid = sci.is_some() || dci.is_some();
    let base = u16::from(DISPATCH_IPHC) << 8
        | u16::from(tf) << 11
        | u16::from(udp) << 10
        | u16::from(hlim) << 8
        | u16::from(cid) << 7
        | u16::from(sac) << 6
        | u16::from(sam) << 4
        | u16::from(m) << 3
        | u16::from(dac) << 2
        | u16::from(dam);

    let mut out = Vec::with_capacity(packet.len());
    out.extend_from_slice(&base.to_be_bytes());
    if cid {
        out.push(sci.unwrap_or(0) << 4 | dci.unwrap_or(0));
    }
    out.extend_from_slice(&inline);

    if udp {
        let src_port = u16::from_be_bytes([payload[0], payload[1]]);
        let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
        let checksum = &payload[6..8];
        const NIBBLE: u16 = 0xf0b0;
        if src_port & 0xfff0 == NIBBLE && dst_port & 0xfff0 == NIBBLE {
            out.push(NHC_UDP | 0x03);
            out.push((src_port as u8 & 0x0f) << 4 | dst_port as u8 & 0x0f);
        } else if dst_port & 0xff00 == 0xf000 {
            out.push(NHC_UDP | 0x01);
            out.extend_from_slice(&src_port.to_be_bytes());
            out.push(dst_port as u8);
        } else if src_port & 0xff00 == 0xf000 {
            out.push(NHC_UDP | 0x02);
            out.push(src_port as u8);
            out.extend_from_slice(&dst_port.to_be_bytes());
        } else {
            out.push(NHC_UDP);
            out.extend_from_slice(&src_port.to_be_bytes());
            out.extend_from_slice(&dst_port.to_be_bytes());
        }
        out.extend_from_slice(checksum);
        out.extend_from_slice(&payload[ipv6::UDP_HEADER_SIZE..]);
    } else {
        out.extend_from_slice(payload);
    }
    Ok(out)
}

/// Expands an IPHC packet back into a full IPv6 packet
pub fn decompress(
    bytes: &[u8],
    ctxs: &dyn ContextLookup,
    l2_src: &MacAddr,
    l2_dst: &MacAddr,
) -> Result<Vec<u8>, Error> {
    let mut data = Deserializer::new(bytes);
    let base = u16::from_be_bytes(data.deserialize()?);
    if (base >> 8) as u8 & DISPATCH_IPHC_MASK != DISPATCH_IPHC {
        return Err(Error::UnknownValue("IPHC dispatch", (base >> 8).into()));
    }
    let tf = ((base >> 11) & 0x3) as u8;
    let nh_compressed = base & 1 << 10 != 0;
    let hlim = ((base >> 8) & 0x3) as u8;
    let cid = base & 1 << 7 != 0;
    let sac = base & 1 << 6 != 0;
    let sam = ((base >> 4) & 0x3) as u8;
    let m = base & 1 << 3 != 0;
    let dac = base & 1 << 2 != 0;
    let dam = (base & 0x3) as u8;

    let (sci, dci) = if cid {
        let byte = data.deserialize::<u8>()?;
        (byte >> 4, byte & 0x0f)
    } else {
        (0, 0)
    };

    let (traffic_class, flow_label) = match tf {
        0 => {
            let tc = data.deserialize::<u8>()?;
            let fl: [u8; 3] = data.deserialize()?;
            (tc, u32::from_be_bytes([0, fl[0] & 0x0f, fl[1], fl[2]]))
        }
        1 => {
            let b: [u8; 3] = data.deserialize()?;
            (b[0] & 0xc0, u32::from_be_bytes([0, b[0] & 0x0f, b[1], b[2]]))
        }
        2 => (data.deserialize()?, 0),
        _ => (0, 0),
    };

    let next_header = if nh_compressed {
        0 // patched below once the NHC octet is read
    } else {
        data.deserialize()?
    };

    let hop_limit = match hlim {
        0 => data.deserialize()?,
        1 => 1,
        2 => 64,
        _ => 255,
    };

    let src = expand_unicast(sac, sam, sci, l2_src, ctxs, &mut data)?;
    let dst = if m {
        if dac {
            return Err(Error::UnknownValue("multicast DAC", 1));
        }
        let mut octets = [0u8; 16];
        octets[0] = 0xff;
        match dam {
            0 => octets = data.advance(16)?.try_into().unwrap(),
            1 => {
                octets[1] = data.deserialize()?;
                octets[11..].copy_from_slice(data.advance(5)?);
            }
            2 => {
                octets[1] = data.deserialize()?;
                octets[13..].copy_from_slice(data.advance(3)?);
            }
            _ => {
                octets[1] = 0x02;
                octets[15] = data.deserialize()?;
            }
        }
        Ipv6Addr::from(octets)
    } else {
        expand_unicast(dac, dam, dci, l2_dst, ctxs, &mut data)?
    };

    let mut hdr = Ipv6Header::new(next_header, src, dst);
    hdr.traffic_class = traffic_class;
    hdr.flow_label = flow_label;
    hdr.hop_limit = hop_limit;

    let mut payload = Vec::new();
    if nh_compressed {
        let nhc = data.deserialize::<u8>()?;
        if nhc & NHC_UDP_MASK != NHC_UDP {
            return Err(Error::UnknownValue("next header compression", nhc.into()));
        }
        hdr.next_header = ipv6::NEXT_HEADER_UDP;
        let (src_port, dst_port) = match nhc & 0x3 {
            3 => {
                let b = data.deserialize::<u8>()?;
                (0xf0b0 | u16::from(b >> 4), 0xf0b0 | u16::from(b & 0x0f))
            }
            2 => {
                let s = data.deserialize::<u8>()?;
                (0xf000 | u16::from(s), u16::from_be_bytes(data.deserialize()?))
            }
            1 => {
                let s = u16::from_be_bytes(data.deserialize()?);
                (s, 0xf000 | u16::from(data.deserialize::<u8>()?))
            }
            _ => (
                u16::from_be_bytes(data.deserialize()?),
                u16::from_be_bytes(data.deserialize()?),
            ),
        };
        if nhc & 0x4 != 0 {
            return Err(Error::UnknownValue("elided UDP checksum", nhc.into()));
        }
        let checksum: [u8; 2] = data.deserialize()?;
        let body = data.rest();
        let len = (ipv6::UDP_HEADER_SIZE + body.len()) as u16;
        payload.extend_from_slice(&src_port.to_be_bytes());
        payload.extend_from_slice(&dst_port.to_be_bytes());
        payload.extend_from_slice(&len.to_be_bytes());
        payload.extend_from_slice(&checksum);
        payload.extend_from_slice(body);
    } else {
        payload.extend_from_slice(data.rest());
    }

    hdr.payload_len = payload.len() as u16;
    let mut out = Vec::with_capacity(ipv6::HEADER_SIZE + payload.len());
    hdr.emit(&mut out);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// RFC 4944 fragmentation header
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FragHeader {
    /// First fragment: total (uncompressed) datagram size and tag
    First { size: u16, tag: u16 },
    /// Subsequent fragment; offset counts 8-octet units
    Next { size: u16, tag: u16, offset: u8 },
}

impl FragHeader {
    pub fn emit(&self, out: &mut Vec<u8>) {
        match self {
            Self::First { size, tag } => {
                out.extend_from_slice(&(size & 0x7ff | u16::from(DISPATCH_FRAG1) << 8).to_be_bytes());
                out.extend_from_slice(&tag.to_be_bytes());
            }
            Self::Next { size, tag, offset } => {
                out.extend_from_slice(&(size & 0x7ff | u16::from(DISPATCH_FRAGN) << 8).to_be_bytes());
                out.extend_from_slice(&tag.to_be_bytes());
                out.push(*offset);
            }
        }
    }

    /// Tries to parse a fragmentation header; `None` when `bytes` does not
    /// start with a fragment dispatch
    pub fn parse(bytes: &[u8]) -> Result<Option<(Self, usize)>, Error> {
        if bytes.is_empty() {
            return Err(Error::Truncated(0, 1));
        }
        let dispatch = bytes[0] & DISPATCH_FRAG_MASK;
        if dispatch != DISPATCH_FRAG1 && dispatch != DISPATCH_FRAGN {
            return Ok(None);
        }
        let mut data = Deserializer::new(bytes);
        let word = u16::from_be_bytes(data.deserialize()?);
        let size = word & 0x7ff;
        let tag = u16::from_be_bytes(data.deserialize()?);
        if dispatch == DISPATCH_FRAG1 {
            Ok(Some((Self::First { size, tag }, 4)))
        } else {
            Ok(Some((
                Self::Next {
                    size,
                    tag,
                    offset: data.deserialize()?,
                },
                5,
            )))
        }
    }
}
