//! The MAC helper: the per-interface IEEE 802.15.4 state the host keeps
//! on behalf of the RCP.
//!
//! Outbound, a request moves through: bounded priority queue → FHSS
//! admission → sequence number → header and IE assembly → CCM* → RCP.
//! Exactly one confirmation comes back per accepted request, in order
//! within a priority band. Transient radio failures (busy channel, no
//! ack) retry against a per-frame budget with a randomized, doubling
//! blacklist backoff; everything else is terminal for the frame.
//!
//! Inbound, frames are authenticated against the device table with a
//! strictly increasing counter per (device, key), decrypted and handed
//! up; enhanced acknowledgments are assembled synchronously through the
//! [`EackBuilder`] capability the upper layer installs.

pub mod queue;
pub mod security;

use rand::Rng;

pub use queue::{DataReq, IndirectQueue, TxPriority, TxQueue};
pub use security::{DeviceHandle, KeySlot, SecurityTables};

use crate::config::MacConfig;
use crate::fhss::{Fhss, TxTarget};
use crate::neighbor::NeighborIndex;
use crate::wire::ie::FrameType;
use crate::wire::mac154::{self, Frame, FrameKind, SecurityHeader};
use crate::wire::rcp::{DataConfirm, DataIndication, DataRequest};
use crate::{Eui64, MacAddr, Status};

/// Builds the IE content of an enhanced acknowledgment, synchronously,
/// inside the RCP turnaround window
pub trait EackBuilder {
    /// Returns (header IEs, payload IEs) to carry in the ack to `src`
    fn build_eack(&mut self, src: Eui64, rsl_dbm: i8) -> (Vec<u8>, Vec<u8>);
}

/// What a caller hands to [`MacHelper::enqueue`]
#[derive(Clone, Debug)]
pub struct EnqueueReq {
    pub dst: Option<MacAddr>,
    pub payload: Vec<u8>,
    pub header_ies: Vec<u8>,
    pub payload_ies: Vec<u8>,
    pub security_level: u8,
    pub key_index: u8,
    pub priority: TxPriority,
    pub ack_requested: bool,
    pub seq_suppressed: bool,
    pub frame_type: FrameType,
    pub indirect: bool,
}

impl EnqueueReq {
    /// An unsecured broadcast management frame
    pub fn async_frame(frame_type: FrameType, payload_ies: Vec<u8>, header_ies: Vec<u8>) -> Self {
        Self {
            dst: None,
            payload: Vec::new(),
            header_ies,
            payload_ies,
            security_level: 0,
            key_index: 0,
            priority: TxPriority::Normal,
            ack_requested: false,
            seq_suppressed: true,
            frame_type,
            indirect: false,
        }
    }
}

/// Events the helper reports upward
#[derive(Debug)]
pub enum MacEvent {
    /// The single confirmation of an accepted request
    Confirm { handle: u8, status: Status },
    /// A decrypted, counter-checked data frame
    Indication(RxIndication),
    /// A security failure on reception, for the management layer
    CommStatus { src: Option<Eui64>, status: Status },
    /// An enhanced ack to transmit right now
    EnhancedAck(DataRequest),
}

/// A received data frame after security processing
#[derive(Debug)]
pub struct RxIndication {
    pub src: Option<MacAddr>,
    pub dst: Option<MacAddr>,
    pub src_pan: Option<u16>,
    pub dst_pan: Option<u16>,
    pub header_ies: Vec<u8>,
    pub payload_ies: Vec<u8>,
    pub payload: Vec<u8>,
    pub lqi: u8,
    pub rssi_dbm: i8,
    pub phy_timestamp: u32,
    pub secured: bool,
    pub key_index: u8,
}

struct InFlight {
    req: DataReq,
    /// Seconds left before the ack-requested confirmation times out
    timeout_s: u32,
}

/// The per-interface MAC helper
pub struct MacHelper {
    cfg: MacConfig,
    eui64: Eui64,
    pan_id: u16,
    short_addr: u16,
    seq: u8,
    next_handle: u8,
    frame_counter_per_key: bool,
    pub tables: SecurityTables,
    tx: TxQueue,
    indirect: IndirectQueue,
    in_flight: Vec<InFlight>,
    /// Transport poisoned: everything fails with `RcpTransport` until the
    /// RCP reset recovery completes
    poisoned: bool,
}

impl MacHelper {
    pub fn new(cfg: MacConfig, eui64: Eui64) -> Self {
        Self {
            cfg,
            eui64,
            pan_id: 0xffff,
            short_addr: MacAddr::SHORT_NONE,
            seq: 0,
            next_handle: 0,
            frame_counter_per_key: false,
            tables: SecurityTables::new(8, 256),
            tx: TxQueue::new(cfg.tx_queue_size),
            indirect: IndirectQueue::new(cfg.indirect_ttl),
            in_flight: Vec::new(),
            poisoned: true,
        }
    }

    pub fn configure(&mut self, pan_id: u16, short_addr: u16) {
        self.pan_id = pan_id;
        self.short_addr = short_addr;
    }

    pub fn enable_frame_counter_per_key(&mut self, enable: bool) {
        self.frame_counter_per_key = enable;
    }

    pub fn frame_counter_per_key(&self) -> bool {
        self.frame_counter_per_key
    }

    pub fn short_addr(&self) -> u16 {
        self.short_addr
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Frames queued plus in flight
    pub fn backlog(&self) -> usize {
        self.tx.len() + self.in_flight.len()
    }

    /// Accepts an outbound request, returning its MSDU handle
    pub fn enqueue(&mut self, req: EnqueueReq) -> Result<u8, Status> {
        if self.poisoned {
            return Err(Status::RcpTransport);
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        let data_req = DataReq {
            handle,
            dst: req.dst,
            dst_pan: Some(self.pan_id),
            payload: req.payload,
            header_ies: req.header_ies,
            payload_ies: req.payload_ies,
            security_level: req.security_level,
            key_index: req.key_index,
            priority: req.priority,
            ack_requested: req.ack_requested,
            seq_suppressed: req.seq_suppressed,
            frame_type: req.frame_type,
            indirect: req.indirect,
            tx_at: None,
            attempts: 0,
            not_before_ms: 0,
        };
        if data_req.indirect {
            self.indirect.push(data_req);
        } else {
            self.tx.push(data_req, self.in_flight.len())?;
        }
        Ok(handle)
    }

    /// Removes a not-yet-transmitted frame
    pub fn purge(&mut self, handle: u8) -> Status {
        if self.tx.purge(handle).is_some() || self.indirect.purge(handle).is_some() {
            Status::Ok
        } else {
            Status::InvalidHandle
        }
    }

    /// Pulls admissible frames out of the queue, assembles and encrypts
    /// them, and returns the RCP requests to transmit. `resolve` maps a
    /// destination to its neighbor table entry for FHSS admission.
    pub fn pump(
        &mut self,
        fhss: &Fhss,
        mut resolve: impl FnMut(&MacAddr) -> Option<(NeighborIndex, Eui64)>,
        events: &mut Vec<MacEvent>,
    ) -> Vec<DataRequest> {
        let mut out = Vec::new();
        if self.poisoned {
            return out;
        }
        let now_ms = fhss.now_ms();
        let prefer_broadcast = fhss.in_broadcast_dwell();
        loop {
            let mut resolved: Option<(NeighborIndex, Eui64)> = None;
            let picked = self.tx.next(now_ms, prefer_broadcast, |req| {
                let target = match (&req.dst, req.frame_type) {
                    (_, t) if t != FrameType::Data && t != FrameType::Eapol => TxTarget::Async,
                    (None, _) => TxTarget::Broadcast,
                    (Some(d), _) if d.is_broadcast() => TxTarget::Broadcast,
                    (Some(d), _) => match resolve(d) {
                        Some((idx, eui)) => {
                            resolved = Some((idx, eui));
                            TxTarget::Neighbor(idx)
                        }
                        None => TxTarget::Async,
                    },
                };
                fhss.may_transmit(target, req.priority, resolved.map(|(_, e)| e))
                    .is_some()
            });
            let Some(mut req) = picked else {
                break;
            };
            req.attempts += 1;
            match self.assemble(&req) {
                Ok(data_req) => {
                    self.in_flight.push(InFlight {
                        req,
                        timeout_s: self.cfg.ack_timeout,
                    });
                    out.push(data_req);
                }
                Err(status) => {
                    events.push(MacEvent::Confirm {
                        handle: req.handle,
                        status,
                    });
                }
            }
        }
        out
    }

    /// Builds and encrypts the final frame bytes
    fn assemble(&mut self, req: &DataReq) -> Result<DataRequest, Status> {
        let mut frame = Frame::data(req.dst.or(Some(MacAddr::BROADCAST)), MacAddr::Ext(self.eui64));
        frame.kind = FrameKind::Data;
        frame.dst_pan = req.dst_pan;
        frame.ack_requested = req.ack_requested;
        frame.seq = if req.seq_suppressed {
            None
        } else {
            let seq = self.seq;
            self.seq = self.seq.wrapping_add(1);
            Some(seq)
        };
        frame.header_ies = req.header_ies.clone();
        frame.payload_ies = req.payload_ies.clone();
        frame.payload = req.payload.clone();

        let mut counter = 0;
        let mut key = None;
        if req.security_level > 0 {
            let (slot, descriptor) = self
                .tables
                .key_by_index(req.key_index)
                .ok_or(Status::UnavailableKey)?;
            key = Some(descriptor.key);
            counter = self.tables.next_outgoing_counter(slot)?;
            frame.security = Some(SecurityHeader {
                level: req.security_level,
                key_id_mode: 1,
                frame_counter: counter,
                key_index: req.key_index,
            });
        }

        let (mut bytes, offset) = frame.emit();
        if let Some(key) = key {
            let (open, message) = bytes.split_at_mut(offset);
            let mic = security::encrypt(
                &key,
                self.eui64,
                counter,
                req.security_level,
                open,
                message,
            )?;
            bytes.extend_from_slice(&mic);
        }
        if bytes.len() > 2047 {
            return Err(Status::FrameTooLong);
        }
        Ok(DataRequest {
            handle: req.handle,
            frame: bytes,
            ack_requested: req.ack_requested,
            cca: true,
            channel: 0xffff,
            tx_at: req.tx_at.unwrap_or(0),
            priority: req.priority as u8,
        })
    }

    /// Handles an MCPS-DATA.confirm from the RCP
    pub fn on_confirm(&mut self, cnf: DataConfirm, now_ms: u64, rng: &mut impl Rng) -> Vec<MacEvent> {
        let mut events = Vec::new();
        let Some(pos) = self.in_flight.iter().position(|f| f.req.handle == cnf.handle) else {
            log::debug!("mac: confirm for unknown handle {}", cnf.handle);
            return events;
        };
        let mut entry = self.in_flight.remove(pos);
        let status = Status::from_mac(cnf.status);
        if status.is_transient() && entry.req.attempts < self.cfg.max_retries {
            if status == Status::BusyChannel {
                // Randomized backoff, doubling with the attempt count
                let exp = (entry.req.attempts - 1).min(8);
                let hi = (self.cfg.blacklist_min_ms << exp)
                    .min(self.cfg.blacklist_max_ms)
                    .max(self.cfg.blacklist_min_ms + 1);
                let wait = rng.gen_range(self.cfg.blacklist_min_ms..hi);
                entry.req.not_before_ms = now_ms + u64::from(wait);
            }
            self.tx.push_front(entry.req);
        } else {
            events.push(MacEvent::Confirm {
                handle: cnf.handle,
                status,
            });
        }
        events
    }

    /// Handles an MCPS-DATA.indication from the RCP
    pub fn on_indication(
        &mut self,
        ind: &DataIndication,
        eack: &mut dyn EackBuilder,
    ) -> Vec<MacEvent> {
        let mut events = Vec::new();
        let (frame, offset) = match Frame::parse(&ind.frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::debug!("mac-rx: unparseable frame: {err}");
                return events;
            }
        };

        if frame.kind == FrameKind::Ack {
            // The RCP acknowledges at baseline; host acks only feed timing
            return events;
        }

        let src_eui = match frame.src {
            Some(MacAddr::Ext(e)) => Some(e),
            Some(MacAddr::Short(s)) => self
                .tables
                .device_by_short(s)
                .and_then(|h| self.tables.device(h))
                .map(|d| d.eui64),
            None => None,
        };

        let mut payload = frame.payload.clone();
        let mut key_index = 0;
        if let Some(sec) = frame.security {
            key_index = sec.key_index;
            let Some(src_eui) = src_eui else {
                events.push(MacEvent::CommStatus {
                    src: None,
                    status: Status::UnsupportedSecurity,
                });
                return events;
            };
            let Some(device) = self.tables.device_by_eui64(src_eui) else {
                events.push(MacEvent::CommStatus {
                    src: Some(src_eui),
                    status: Status::UnavailableKey,
                });
                return events;
            };
            let Some((slot, descriptor)) = self.tables.key_by_index(sec.key_index) else {
                events.push(MacEvent::CommStatus {
                    src: Some(src_eui),
                    status: Status::UnavailableKey,
                });
                return events;
            };
            let key = descriptor.key;
            // Replay gate before any crypto
            let replay = self
                .tables
                .device(device)
                .and_then(|d| d.frame_counters.get(slot).copied().flatten())
                .is_some_and(|stored| sec.frame_counter <= stored);
            let exempt = self.tables.device(device).is_some_and(|d| d.exempt);
            if replay && !exempt {
                events.push(MacEvent::CommStatus {
                    src: Some(src_eui),
                    status: Status::CounterError,
                });
                return events;
            }
            let mic_len = sec.mic_len();
            if payload.len() < mic_len {
                events.push(MacEvent::CommStatus {
                    src: Some(src_eui),
                    status: Status::SecurityFail,
                });
                return events;
            }
            let mic = payload.split_off(payload.len() - mic_len);
            let open = &ind.frame[..offset];
            if let Err(status) = security::decrypt(
                &key,
                src_eui,
                sec.frame_counter,
                sec.level,
                open,
                &mut payload,
                &mic,
            ) {
                events.push(MacEvent::CommStatus {
                    src: Some(src_eui),
                    status,
                });
                return events;
            }
            if let Err(status) =
                self.tables
                    .check_and_update_counter(device, slot, sec.frame_counter)
            {
                events.push(MacEvent::CommStatus {
                    src: Some(src_eui),
                    status,
                });
                return events;
            }
        }

        // A data-request command releases the sender's held frames
        if frame.kind == FrameKind::Command {
            if payload.first() == Some(&mac154::CMD_DATA_REQUEST) {
                if let Some(src_eui) = src_eui {
                    let short = match frame.src {
                        Some(MacAddr::Short(s)) => s,
                        _ => MacAddr::SHORT_NONE,
                    };
                    for mut held in self.indirect.release(src_eui, short) {
                        held.priority = TxPriority::Medium;
                        if self.tx.push(held.clone(), self.in_flight.len()).is_err() {
                            events.push(MacEvent::Confirm {
                                handle: held.handle,
                                status: Status::TransactionOverflow,
                            });
                        }
                    }
                }
            }
            return events;
        }

        if ind.ack_requested {
            if let Some(src_eui) = src_eui {
                if let Some(ack) = self.build_eack(src_eui, ind.rssi_dbm, eack) {
                    events.push(MacEvent::EnhancedAck(ack));
                }
            }
        }

        events.push(MacEvent::Indication(RxIndication {
            src: frame.src,
            dst: frame.dst,
            src_pan: frame.src_pan,
            dst_pan: frame.dst_pan,
            header_ies: frame.header_ies,
            payload_ies: frame.payload_ies,
            payload,
            lqi: ind.lqi,
            rssi_dbm: ind.rssi_dbm,
            phy_timestamp: ind.phy_timestamp,
            secured: frame.security.is_some(),
            key_index,
        }));
        events
    }

    /// Assembles and secures the enhanced ack within the turnaround
    fn build_eack(
        &mut self,
        dst: Eui64,
        rsl_dbm: i8,
        eack: &mut dyn EackBuilder,
    ) -> Option<DataRequest> {
        let (header_ies, payload_ies) = eack.build_eack(dst, rsl_dbm);
        let mut frame = Frame::data(Some(MacAddr::Ext(dst)), MacAddr::Ext(self.eui64));
        frame.kind = FrameKind::Ack;
        frame.dst_pan = None;
        frame.header_ies = header_ies;
        frame.payload_ies = payload_ies;
        // Acks ride the active GTK when one is installed
        let secured = self
            .tables
            .keys()
            .next()
            .map(|(slot, d)| (slot, d.key, d.key_index));
        let bytes = if let Some((slot, key, key_index)) = secured {
            let counter = self.tables.next_outgoing_counter(slot).ok()?;
            frame.security = Some(SecurityHeader {
                level: 6,
                key_id_mode: 1,
                frame_counter: counter,
                key_index,
            });
            let (mut bytes, offset) = frame.emit();
            let (open, message) = bytes.split_at_mut(offset);
            let mic = security::encrypt(&key, self.eui64, counter, 6, open, message).ok()?;
            bytes.extend_from_slice(&mic);
            bytes
        } else {
            frame.emit().0
        };
        Some(DataRequest {
            handle: 0xff,
            frame: bytes,
            ack_requested: false,
            cca: false,
            channel: 0xffff,
            tx_at: 0,
            priority: TxPriority::Immediate as u8,
        })
    }

    /// One second of aging: ack timeouts and indirect expiry
    pub fn tick_second(&mut self) -> Vec<MacEvent> {
        let mut events = Vec::new();
        let mut idx = 0;
        while idx < self.in_flight.len() {
            if self.in_flight[idx].timeout_s <= 1 {
                let entry = self.in_flight.remove(idx);
                events.push(MacEvent::Confirm {
                    handle: entry.req.handle,
                    status: Status::TransactionExpired,
                });
            } else {
                self.in_flight[idx].timeout_s -= 1;
                idx += 1;
            }
        }
        for expired in self.indirect.tick_second() {
            events.push(MacEvent::Confirm {
                handle: expired.handle,
                status: Status::TransactionExpired,
            });
        }
        events
    }

    /// RCP transport lost: everything pending fails
    pub fn poison(&mut self) -> Vec<MacEvent> {
        self.poisoned = true;
        let mut events = Vec::new();
        for entry in self.in_flight.drain(..) {
            events.push(MacEvent::Confirm {
                handle: entry.req.handle,
                status: Status::RcpTransport,
            });
        }
        for req in self.tx.drain() {
            events.push(MacEvent::Confirm {
                handle: req.handle,
                status: Status::RcpTransport,
            });
        }
        for req in self.indirect.drain() {
            events.push(MacEvent::Confirm {
                handle: req.handle,
                status: Status::RcpTransport,
            });
        }
        // Counters bound to the old RCP session are meaningless now
        self.tables.reset_device_counters();
        events
    }

    /// RCP reset recovery finished, traffic may flow again
    pub fn recover(&mut self) {
        self.poisoned = false;
    }
}
