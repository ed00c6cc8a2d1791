//! Outbound MAC queues.
//!
//! Frames wait in per-priority bands, each split into unicast and
//! broadcast sub-queues so channel admission can prefer whichever matches
//! the radio's current dwell without ever reordering frames inside a
//! sub-queue. A frame blacklisted after a busy channel carries its
//! release time and blocks its sub-queue until then, preserving order.
//!
//! Frames addressed to sleepy devices wait in the indirect queue instead
//! and leave only when the device polls, or expire.

use std::collections::VecDeque;

use crate::wire::ie::FrameType;
use crate::{Eui64, MacAddr};

/// MCPS data priority bands
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum TxPriority {
    #[default]
    Normal,
    /// Polled (indirect) traffic
    Medium,
    High,
    /// Expedited forwarding
    Expedited,
    /// Bypasses channel admission
    Immediate,
}

/// An accepted MCPS-DATA request waiting for the air
#[derive(Clone, Debug)]
pub struct DataReq {
    /// MSDU handle chosen by the caller, echoed in the confirmation
    pub handle: u8,
    pub dst: Option<MacAddr>,
    pub dst_pan: Option<u16>,
    pub payload: Vec<u8>,
    pub header_ies: Vec<u8>,
    pub payload_ies: Vec<u8>,
    /// 0 = unsecured
    pub security_level: u8,
    pub key_index: u8,
    pub priority: TxPriority,
    pub ack_requested: bool,
    pub seq_suppressed: bool,
    /// Management frame type for FHSS async handling
    pub frame_type: FrameType,
    /// Hold until the destination polls
    pub indirect: bool,
    /// Scheduled PHY transmit time, microseconds
    pub tx_at: Option<u32>,
    /// Attempts used so far
    pub attempts: u8,
    /// Blacklist release time, engine milliseconds
    pub not_before_ms: u64,
}

impl DataReq {
    pub fn is_broadcast(&self) -> bool {
        self.dst.is_none() || self.dst.is_some_and(|d| d.is_broadcast())
    }
}

#[derive(Default)]
struct Band {
    unicast: VecDeque<DataReq>,
    broadcast: VecDeque<DataReq>,
}

impl Band {
    fn len(&self) -> usize {
        self.unicast.len() + self.broadcast.len()
    }
}

/// The bounded priority queue
pub struct TxQueue {
    bands: [Band; 5],
    capacity: usize,
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            bands: Default::default(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(Band::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accepts a frame; the bound covers queued frames only, the caller
    /// accounts in-flight ones against the same budget
    pub fn push(&mut self, req: DataReq, in_flight: usize) -> Result<(), crate::Status> {
        if self.len() + in_flight >= self.capacity {
            return Err(crate::Status::TransactionOverflow);
        }
        let band = &mut self.bands[req.priority as usize];
        if req.is_broadcast() {
            band.broadcast.push_back(req);
        } else {
            band.unicast.push_back(req);
        }
        Ok(())
    }

    /// Puts a frame back at the front of its sub-queue (admission was
    /// withdrawn, channel parameters changed)
    pub fn push_front(&mut self, req: DataReq) {
        let band = &mut self.bands[req.priority as usize];
        if req.is_broadcast() {
            band.broadcast.push_front(req);
        } else {
            band.unicast.push_front(req);
        }
    }

    /// Picks the next admissible frame, highest band first. Within a band
    /// the two sub-queue heads compete: when `prefer_broadcast` is set
    /// (the local broadcast slot is active) the broadcast head goes
    /// first. `admit` is the FHSS admission check.
    pub fn next(
        &mut self,
        now_ms: u64,
        prefer_broadcast: bool,
        mut admit: impl FnMut(&DataReq) -> bool,
    ) -> Option<DataReq> {
        for band_idx in (0..self.bands.len()).rev() {
            let band = &mut self.bands[band_idx];
            let order: [bool; 2] = if prefer_broadcast {
                [true, false]
            } else {
                [false, true]
            };
            for pick_broadcast in order {
                let queue = if pick_broadcast {
                    &mut band.broadcast
                } else {
                    &mut band.unicast
                };
                let Some(head) = queue.front() else {
                    continue;
                };
                if head.not_before_ms > now_ms {
                    continue;
                }
                if admit(head) {
                    return queue.pop_front();
                }
            }
        }
        None
    }

    /// Removes a queued frame by its MSDU handle
    pub fn purge(&mut self, handle: u8) -> Option<DataReq> {
        for band in &mut self.bands {
            for queue in [&mut band.unicast, &mut band.broadcast] {
                if let Some(pos) = queue.iter().position(|r| r.handle == handle) {
                    return queue.remove(pos);
                }
            }
        }
        None
    }

    /// Takes everything out (transport poisoned, teardown)
    pub fn drain(&mut self) -> Vec<DataReq> {
        let mut out = Vec::new();
        for band in &mut self.bands {
            out.extend(band.unicast.drain(..));
            out.extend(band.broadcast.drain(..));
        }
        out
    }
}

/// Held frames for sleepy devices
pub struct IndirectQueue {
    entries: Vec<(DataReq, u32)>,
    ttl: u32,
}

impl IndirectQueue {
    pub fn new(ttl: u32) -> Self {
        Self {
            entries: Vec::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, req: DataReq) {
        self.entries.push((req, self.ttl));
    }

    /// Releases every frame held for the device that just polled
    pub fn release(&mut self, eui64: Eui64, short_addr: u16) -> Vec<DataReq> {
        let matches = |req: &DataReq| match req.dst {
            Some(MacAddr::Ext(e)) => e == eui64,
            Some(MacAddr::Short(s)) => s == short_addr,
            None => false,
        };
        let mut out = Vec::new();
        self.entries.retain_mut(|(req, _)| {
            if matches(req) {
                out.push(req.clone());
                false
            } else {
                true
            }
        });
        out
    }

    /// One second of aging; expired frames come back for their
    /// `TRANSACTION_EXPIRED` confirmation
    pub fn tick_second(&mut self) -> Vec<DataReq> {
        let mut expired = Vec::new();
        self.entries.retain_mut(|(req, left)| {
            if *left <= 1 {
                expired.push(req.clone());
                false
            } else {
                *left -= 1;
                true
            }
        });
        expired
    }

    pub fn purge(&mut self, handle: u8) -> Option<DataReq> {
        let pos = self.entries.iter().position(|(r, _)| r.handle == handle)?;
        Some(self.entries.remove(pos).0)
    }

    pub fn drain(&mut self) -> Vec<DataReq> {
        self.entries.drain(..).map(|(r, _)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(handle: u8, priority: TxPriority, dst: Option<MacAddr>) -> DataReq {
        DataReq {
            handle,
            dst,
            dst_pan: None,
            payload: vec![handle],
            header_ies: Vec::new(),
            payload_ies: Vec::new(),
            security_level: 0,
            key_index: 0,
            priority,
            ack_requested: dst.is_some(),
            seq_suppressed: true,
            frame_type: FrameType::Data,
            indirect: false,
            tx_at: None,
            attempts: 0,
            not_before_ms: 0,
        }
    }

    fn unicast(n: u8) -> Option<MacAddr> {
        Some(MacAddr::Ext(Eui64([0, 0, 0, 0, 0, 0, 0, n])))
    }

    #[test]
    fn bound_counts_in_flight() {
        let mut q = TxQueue::new(2);
        q.push(req(1, TxPriority::Normal, unicast(1)), 0).unwrap();
        assert_eq!(
            q.push(req(2, TxPriority::Normal, unicast(1)), 1),
            Err(crate::Status::TransactionOverflow)
        );
        q.push(req(2, TxPriority::Normal, unicast(1)), 0).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn higher_band_wins() {
        let mut q = TxQueue::new(8);
        q.push(req(1, TxPriority::Normal, unicast(1)), 0).unwrap();
        q.push(req(2, TxPriority::Expedited, unicast(1)), 0).unwrap();
        let picked = q.next(0, false, |_| true).unwrap();
        assert_eq!(picked.handle, 2);
    }

    #[test]
    fn refused_unicast_lets_broadcast_through() {
        let mut q = TxQueue::new(8);
        q.push(req(1, TxPriority::Normal, unicast(1)), 0).unwrap();
        q.push(req(2, TxPriority::Normal, None), 0).unwrap();
        // Unicast head refused by admission, broadcast head admitted
        let picked = q.next(0, false, |r| r.is_broadcast()).unwrap();
        assert_eq!(picked.handle, 2);
        // The unicast stays at its sub-queue head
        let picked = q.next(0, false, |_| true).unwrap();
        assert_eq!(picked.handle, 1);
    }

    #[test]
    fn broadcast_slot_prefers_broadcast() {
        let mut q = TxQueue::new(8);
        q.push(req(1, TxPriority::Normal, unicast(1)), 0).unwrap();
        q.push(req(2, TxPriority::Normal, None), 0).unwrap();
        assert_eq!(q.next(0, true, |_| true).unwrap().handle, 2);
        assert_eq!(q.next(0, true, |_| true).unwrap().handle, 1);
    }

    #[test]
    fn blacklisted_head_blocks_its_subqueue_only() {
        let mut q = TxQueue::new(8);
        let mut blocked = req(1, TxPriority::Normal, unicast(1));
        blocked.not_before_ms = 500;
        q.push(blocked, 0).unwrap();
        q.push(req(2, TxPriority::Normal, unicast(2)), 0).unwrap();
        q.push(req(3, TxPriority::Normal, None), 0).unwrap();
        // At t=0 only the broadcast may go: frame 2 sits behind frame 1
        assert_eq!(q.next(0, false, |_| true).unwrap().handle, 3);
        assert!(q.next(0, false, |_| true).is_none());
        // After the backoff the unicast queue resumes in order
        assert_eq!(q.next(600, false, |_| true).unwrap().handle, 1);
        assert_eq!(q.next(600, false, |_| true).unwrap().handle, 2);
    }

    #[test]
    fn purge_removes_by_handle() {
        let mut q = TxQueue::new(8);
        q.push(req(1, TxPriority::Normal, unicast(1)), 0).unwrap();
        q.push(req(2, TxPriority::Normal, unicast(1)), 0).unwrap();
        assert!(q.purge(1).is_some());
        assert!(q.purge(1).is_none());
        assert_eq!(q.next(0, false, |_| true).unwrap().handle, 2);
    }

    #[test]
    fn indirect_release_and_expiry() {
        let mut iq = IndirectQueue::new(2);
        let sleepy = Eui64([0, 0, 0, 0, 0, 0, 0, 9]);
        iq.push(req(1, TxPriority::Medium, Some(MacAddr::Ext(sleepy))));
        iq.push(req(2, TxPriority::Medium, unicast(1)));
        let released = iq.release(sleepy, 0xfffe);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].handle, 1);
        assert!(iq.tick_second().is_empty());
        let expired = iq.tick_second();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle, 2);
        assert_eq!(iq.len(), 0);
    }
}
