//! 6LoWPAN adaptation: context table, compression and fragmentation.
//!
//! The context table is published by the border router itself (it is the
//! one handing contexts to descendants); a context whose lifetime runs
//! out first loses its compression eligibility and lingers for a grace
//! period in which it still decompresses, then disappears (RFC 6775
//! §5.4.3). Datagrams larger than the link budget are fragmented; the
//! reassembly side is bounded in buffers, bytes and time.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::wire::iphc::{self, ContextLookup, FragHeader};
use crate::wire::Error;
use crate::{Eui64, MacAddr};

/// Ticks a fully expired (but still decompressing) context lingers:
/// two default router lifetimes
const GRACE_TICKS: u32 = 2 * 18_000;

/// One 6LoWPAN context
#[derive(Clone, Debug)]
pub struct LowpanContext {
    pub cid: u8,
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    /// Usable for compression (cleared during the grace window)
    pub compression: bool,
    pub expiring: bool,
    /// Remaining lifetime, 100 ms ticks
    pub lifetime: u32,
}

/// The bounded context table, longest prefix first
pub struct ContextTable {
    entries: Vec<LowpanContext>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LowpanContext> {
        self.entries.iter()
    }

    /// Installs, replaces or (lifetime 0) removes a context
    pub fn update(
        &mut self,
        cid: u8,
        prefix: Ipv6Addr,
        prefix_len: u8,
        compression: bool,
        lifetime: u32,
    ) {
        let cid = cid & 0x0f;
        self.entries.retain(|c| c.cid != cid);
        if lifetime == 0 {
            return;
        }
        let entry = LowpanContext {
            cid,
            prefix,
            prefix_len,
            compression,
            expiring: false,
            lifetime,
        };
        // Longest prefixes first so by_addr takes the tightest match
        let at = self
            .entries
            .iter()
            .position(|c| c.prefix_len < prefix_len)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
    }

    /// Ages the table by `ticks`
    pub fn tick(&mut self, ticks: u32) {
        self.entries.retain_mut(|ctx| {
            if ctx.lifetime > ticks {
                ctx.lifetime -= ticks;
                return true;
            }
            if !ctx.expiring {
                // Keep decompressing for the grace window, stop
                // compressing now
                ctx.compression = false;
                ctx.expiring = true;
                ctx.lifetime = GRACE_TICKS;
                log::debug!("lowpan: context {} expired, compression off", ctx.cid);
                true
            } else {
                log::debug!("lowpan: context {} removed", ctx.cid);
                false
            }
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn prefix_matches(ctx: &LowpanContext, addr: &Ipv6Addr) -> bool {
        let bits = usize::from(ctx.prefix_len);
        let a = ctx.prefix.octets();
        let b = addr.octets();
        let full = bits / 8;
        if a[..full] != b[..full] {
            return false;
        }
        let rem = bits % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        a[full] & mask == b[full] & mask
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextLookup for ContextTable {
    fn by_addr(&self, addr: &Ipv6Addr) -> Option<(u8, Ipv6Addr, u8)> {
        self.entries
            .iter()
            .find(|c| c.compression && Self::prefix_matches(c, addr))
            .map(|c| (c.cid, c.prefix, c.prefix_len))
    }

    fn by_cid(&self, cid: u8) -> Option<(Ipv6Addr, u8)> {
        // Grace-window contexts still resolve here
        self.entries
            .iter()
            .find(|c| c.cid == cid)
            .map(|c| (c.prefix, c.prefix_len))
    }
}

struct Partial {
    size: usize,
    data: Vec<u8>,
    /// Received byte count (fragments arrive in order on this link)
    received: usize,
    age_s: u32,
}

/// Bounded reassembly buffers keyed by (source, datagram tag)
pub struct Reassembly {
    buffers: HashMap<(Eui64, u16), Partial>,
    max_buffers: usize,
    max_bytes: usize,
    timeout_s: u32,
}

impl Reassembly {
    pub fn new(max_buffers: usize, max_bytes: usize, timeout_s: u32) -> Self {
        Self {
            buffers: HashMap::new(),
            max_buffers,
            max_bytes,
            timeout_s,
        }
    }

    fn bytes_held(&self) -> usize {
        self.buffers.values().map(|p| p.size).sum()
    }

    /// Consumes one fragment; returns the whole datagram when complete
    pub fn push(&mut self, src: Eui64, header: FragHeader, payload: &[u8]) -> Option<Vec<u8>> {
        match header {
            FragHeader::First { size, tag } => {
                let size = usize::from(size);
                if self.buffers.len() >= self.max_buffers
                    || self.bytes_held() + size > self.max_bytes
                {
                    log::debug!("lowpan: reassembly full, dropping datagram from {src}");
                    return None;
                }
                let mut data = vec![0; size];
                let take = payload.len().min(size);
                data[..take].copy_from_slice(&payload[..take]);
                self.buffers.insert(
                    (src, tag),
                    Partial {
                        size,
                        data,
                        received: take,
                        age_s: 0,
                    },
                );
                None
            }
            FragHeader::Next { tag, offset, .. } => {
                let key = (src, tag);
                let partial = self.buffers.get_mut(&key)?;
                let at = usize::from(offset) * 8;
                if at != partial.received || at + payload.len() > partial.size {
                    log::debug!("lowpan: out-of-order fragment from {src}, dropping datagram");
                    self.buffers.remove(&key);
                    return None;
                }
                partial.data[at..at + payload.len()].copy_from_slice(payload);
                partial.received += payload.len();
                if partial.received >= partial.size {
                    return self.buffers.remove(&key).map(|p| p.data);
                }
                None
            }
        }
    }

    /// One second of aging; stale partial datagrams are dropped
    pub fn tick_second(&mut self) -> usize {
        let timeout = self.timeout_s;
        let before = self.buffers.len();
        self.buffers.retain(|_, p| {
            p.age_s += 1;
            p.age_s < timeout
        });
        before - self.buffers.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}

/// The adaptation layer
pub struct Lowpan {
    pub contexts: ContextTable,
    pub reassembly: Reassembly,
    next_tag: u16,
    /// Link payload budget per frame
    mtu: usize,
}

impl Lowpan {
    pub fn new(max_buffers: usize, max_bytes: usize, timeout_s: u32, mtu: usize) -> Self {
        Self {
            contexts: ContextTable::new(),
            reassembly: Reassembly::new(max_buffers, max_bytes, timeout_s),
            next_tag: 0,
            mtu,
        }
    }

    /// Compresses (and if needed fragments) one IPv6 packet into link
    /// frames
    pub fn to_mesh(
        &mut self,
        packet: &[u8],
        l2_src: &MacAddr,
        l2_dst: &MacAddr,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let compressed = iphc::compress(packet, &self.contexts, l2_src, l2_dst)?;
        if compressed.len() <= self.mtu {
            return Ok(vec![compressed]);
        }
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        let total = compressed.len() as u16;

        let mut frames = Vec::new();
        // First fragment: as much as fits after the 4-byte header,
        // trimmed to an 8-byte boundary
        let first_budget = (self.mtu - 4) & !7;
        let mut at = first_budget.min(compressed.len());
        let mut frame = Vec::with_capacity(self.mtu);
        FragHeader::First { size: total, tag }.emit(&mut frame);
        frame.extend_from_slice(&compressed[..at]);
        frames.push(frame);

        while at < compressed.len() {
            let budget = (self.mtu - 5) & !7;
            let take = budget.min(compressed.len() - at);
            let mut frame = Vec::with_capacity(self.mtu);
            FragHeader::Next {
                size: total,
                tag,
                offset: (at / 8) as u8,
            }
            .emit(&mut frame);
            frame.extend_from_slice(&compressed[at..at + take]);
            frames.push(frame);
            at += take;
        }
        Ok(frames)
    }

    /// Consumes one link frame; returns a full IPv6 packet when one
    /// completes
    pub fn from_mesh(
        &mut self,
        bytes: &[u8],
        src_eui: Eui64,
        l2_src: &MacAddr,
        l2_dst: &MacAddr,
    ) -> Result<Option<Vec<u8>>, Error> {
        if bytes.first() == Some(&iphc::DISPATCH_IPV6) {
            return Ok(Some(bytes[1..].to_vec()));
        }
        let compressed = match FragHeader::parse(bytes)? {
            Some((header, consumed)) => {
                match self.reassembly.push(src_eui, header, &bytes[consumed..]) {
                    Some(datagram) => datagram,
                    None => return Ok(None),
                }
            }
            None => bytes.to_vec(),
        };
        iphc::decompress(&compressed, &self.contexts, l2_src, l2_dst).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ipv6::{self, Ipv6Header};

    fn eui(n: u8) -> Eui64 {
        Eui64([2, 0, 0, 0, 0, 0, 0, n])
    }

    fn l2(n: u8) -> MacAddr {
        MacAddr::Ext(eui(n))
    }

    fn packet(payload_len: usize) -> Vec<u8> {
        let src = eui(1).link_local();
        let dst = eui(2).link_local();
        let mut hdr = Ipv6Header::new(ipv6::NEXT_HEADER_ICMPV6, src, dst);
        hdr.payload_len = payload_len as u16;
        let mut out = Vec::new();
        hdr.emit(&mut out);
        out.extend((0..payload_len).map(|i| i as u8));
        out
    }

    #[test]
    fn small_packets_stay_single_frame() {
        let mut lowpan = Lowpan::new(4, 8192, 60, 120);
        let packet = packet(40);
        let frames = lowpan.to_mesh(&packet, &l2(1), &l2(2)).unwrap();
        assert_eq!(frames.len(), 1);
        let back = lowpan
            .from_mesh(&frames[0], eui(1), &l2(1), &l2(2))
            .unwrap()
            .unwrap();
        assert_eq!(back, packet);
    }

    #[test]
    fn large_packets_fragment_and_reassemble() {
        let mut tx = Lowpan::new(4, 8192, 60, 120);
        let mut rx = Lowpan::new(4, 8192, 60, 120);
        let packet = packet(900);
        let frames = tx.to_mesh(&packet, &l2(1), &l2(2)).unwrap();
        assert!(frames.len() > 1);
        assert!(frames.iter().all(|f| f.len() <= 120));
        let mut done = None;
        for frame in &frames {
            done = rx.from_mesh(frame, eui(1), &l2(1), &l2(2)).unwrap();
        }
        assert_eq!(done.unwrap(), packet);
    }

    #[test]
    fn reassembly_timeout_drops_partials() {
        let mut tx = Lowpan::new(4, 8192, 2, 120);
        let mut rx = Lowpan::new(4, 8192, 2, 120);
        let packet = packet(900);
        let frames = tx.to_mesh(&packet, &l2(1), &l2(2)).unwrap();
        rx.from_mesh(&frames[0], eui(1), &l2(1), &l2(2)).unwrap();
        assert_eq!(rx.reassembly.len(), 1);
        rx.reassembly.tick_second();
        assert_eq!(rx.reassembly.tick_second(), 1);
        assert_eq!(rx.reassembly.len(), 0);
        // The late tail fragment finds nothing
        assert!(rx
            .from_mesh(&frames[1], eui(1), &l2(1), &l2(2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn buffer_bounds_are_enforced() {
        let mut rx = Reassembly::new(1, 8192, 60);
        rx.push(eui(1), FragHeader::First { size: 100, tag: 1 }, &[0; 40]);
        // Second concurrent datagram exceeds the buffer bound
        assert!(rx
            .push(eui(2), FragHeader::First { size: 100, tag: 9 }, &[0; 40])
            .is_none());
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn context_grace_window_decompresses_but_never_compresses() {
        let mut table = ContextTable::new();
        let prefix: Ipv6Addr = "fd12:3456::".parse().unwrap();
        table.update(3, prefix, 64, true, 10);
        let inside: Ipv6Addr = "fd12:3456::1".parse().unwrap();
        assert!(table.by_addr(&inside).is_some());

        // Main lifetime runs out: compression gone, cid lookup stays
        table.tick(10);
        assert!(table.by_addr(&inside).is_none());
        assert_eq!(table.by_cid(3), Some((prefix, 64)));

        // Grace window runs out: gone entirely
        table.tick(GRACE_TICKS);
        assert_eq!(table.by_cid(3), None);
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = ContextTable::new();
        table.update(1, "fd12::".parse().unwrap(), 16, true, 1000);
        table.update(2, "fd12:3456::".parse().unwrap(), 32, true, 1000);
        let addr: Ipv6Addr = "fd12:3456::9".parse().unwrap();
        assert_eq!(table.by_addr(&addr).unwrap().0, 2);
        let other: Ipv6Addr = "fd12:9999::1".parse().unwrap();
        assert_eq!(table.by_addr(&other).unwrap().0, 1);
    }

    #[test]
    fn lifetime_zero_removes() {
        let mut table = ContextTable::new();
        table.update(1, "fd12::".parse().unwrap(), 64, true, 1000);
        table.update(1, "fd12::".parse().unwrap(), 64, true, 0);
        assert_eq!(table.by_cid(1), None);
    }
}
