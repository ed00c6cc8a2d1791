//! RCP transport driver.
//!
//! Sits between the HDLC byte pipe and the rest of the engine: allocates
//! transaction identifiers, encodes commands, decodes incoming frames and
//! tracks the link state across RCP resets. Commands are never reordered
//! on the wire; the serial pipe preserves write order and the driver
//! writes from the event loop only.
//!
//! A `RESET` indication (solicited or not) drops the link to
//! `Resetting`: the MAC helper poisons its queues, the engine republishes
//! the whole radio configuration and only then declares the link synced
//! again.

use tokio::sync::mpsc;

use crate::wire::hdlc;
use crate::wire::rcp::{Command, DataRequest, Header, Property, RcpFrame};

/// Link state toward the RCP
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    /// Nothing heard yet (startup), reset requested
    Down,
    /// Reset seen, configuration replay in progress
    Resetting,
    /// Configured and carrying traffic
    Synced,
}

/// The driver
pub struct RcpDriver {
    serial_tx: mpsc::UnboundedSender<Vec<u8>>,
    decoder: hdlc::Decoder,
    iid: u8,
    next_tid: u8,
    state: LinkState,
    api_version: Option<(u8, u8)>,
    firmware_version: Option<String>,
    unknown_frames: u64,
    /// CRC-error notifications from the radio side, rate-limit counter
    radio_crc_errors: u64,
}

impl RcpDriver {
    pub fn new(serial_tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            serial_tx,
            decoder: hdlc::Decoder::new(),
            iid: 0,
            next_tid: 1,
            state: LinkState::Down,
            api_version: None,
            firmware_version: None,
            unknown_frames: 0,
            radio_crc_errors: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn api_version(&self) -> Option<(u8, u8)> {
        self.api_version
    }

    pub fn link_crc_errors(&self) -> u64 {
        self.decoder.crc_errors()
    }

    pub fn radio_crc_errors(&self) -> u64 {
        self.radio_crc_errors
    }

    pub fn unknown_frames(&self) -> u64 {
        self.unknown_frames
    }

    fn header(&mut self) -> Header {
        let tid = self.next_tid;
        // TID 0 is reserved for unsolicited events
        self.next_tid = if self.next_tid == 15 { 1 } else { self.next_tid + 1 };
        Header::new(self.iid, tid)
    }

    fn send(&mut self, command: Command<'_>) {
        let header = self.header();
        let payload = command.encode(header);
        if self.serial_tx.send(hdlc::encode(&payload)).is_err() {
            log::error!("rcp: serial pipe closed");
        }
    }

    /// Asks the RCP to reset; the reply arrives as a `Reset` frame
    pub fn send_reset(&mut self) {
        self.state = LinkState::Down;
        self.send(Command::Reset);
    }

    pub fn send_noop(&mut self) {
        self.send(Command::Noop);
    }

    /// Drops the RCP into its bootloader for the external flashing tool
    pub fn bootloader_update(&mut self) {
        self.state = LinkState::Down;
        self.send(Command::BootloaderUpdate);
    }

    pub fn get(&mut self, property: Property) {
        self.send(Command::Get(property));
    }

    pub fn set_raw(&mut self, property: Property, value: &[u8]) {
        self.send(Command::Set(property, value));
    }

    pub fn set_bool(&mut self, property: Property, value: bool) {
        self.set_raw(property, &[u8::from(value)]);
    }

    pub fn set_u8(&mut self, property: Property, value: u8) {
        self.set_raw(property, &[value]);
    }

    pub fn set_i8(&mut self, property: Property, value: i8) {
        self.set_raw(property, &[value as u8]);
    }

    pub fn set_u16(&mut self, property: Property, value: u16) {
        self.set_raw(property, &value.to_le_bytes());
    }

    pub fn set_u32(&mut self, property: Property, value: u32) {
        self.set_raw(property, &value.to_le_bytes());
    }

    pub fn data_request(&mut self, request: &DataRequest) {
        self.send(Command::DataRequest(request));
    }

    /// Marks the configuration replay finished; traffic may flow
    pub fn mark_synced(&mut self) {
        self.state = LinkState::Synced;
    }

    /// Feeds serial bytes through the framer and decodes every completed
    /// frame. `Reset` frames update the link state before being handed
    /// back for recovery.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RcpFrame> {
        let mut payloads = Vec::new();
        self.decoder.feed(bytes, &mut payloads);
        let mut frames = Vec::new();
        for payload in payloads {
            match crate::wire::rcp::decode(&payload) {
                Ok((_header, frame)) => {
                    match &frame {
                        RcpFrame::Reset(ind) => {
                            log::info!(
                                "rcp: reset, api {}.{}, firmware {}",
                                ind.api_major,
                                ind.api_minor,
                                ind.version
                            );
                            self.api_version = Some((ind.api_major, ind.api_minor));
                            self.firmware_version = Some(ind.version.clone());
                            self.state = LinkState::Resetting;
                        }
                        RcpFrame::MlmeEvent(crate::wire::rcp::MlmeEvent::CrcError { .. }) => {
                            self.radio_crc_errors += 1;
                            if self.radio_crc_errors % 100 == 1 {
                                log::debug!(
                                    "rcp: {} corrupted frames on the air",
                                    self.radio_crc_errors
                                );
                            }
                            continue;
                        }
                        _ => {}
                    }
                    frames.push(frame);
                }
                Err(err) => {
                    self.unknown_frames += 1;
                    log::debug!("rcp: undecodable frame: {err}");
                }
            }
        }
        frames
    }

}
