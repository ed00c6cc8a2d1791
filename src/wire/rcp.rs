//! Command codec of the RCP serial protocol.
//!
//! Inside every HDLC frame the payload is a self-describing sequence of
//! primitives (see [`super::util`]). The first byte is the header:
//!
//! ```plain
//!  7 6 5 4 3 2 1 0
//! +---+---+-------+
//! |1 0|IID|  TID  |
//! +---+---+-------+
//! ```
//!
//! `TID` pairs a command with its reply (0 marks unsolicited events), `IID`
//! selects the interface on multi-PAN radios. The header is followed by a
//! command identifier (variable-length integer) and, for property commands,
//! a property identifier (variable-length integer), then the command
//! payload.

use super::util::{self, Deserialize, Deserializer, Serialize, Serializer};
use super::Error;

/// Frame header carrying the transaction and interface identifiers
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Header {
    pub iid: u8,
    pub tid: u8,
}

impl Header {
    const PATTERN: u8 = 0b1000_0000;
    const PATTERN_MASK: u8 = 0b1100_0000;

    pub fn new(iid: u8, tid: u8) -> Self {
        Self {
            iid: iid & 0x3,
            tid: tid & 0xf,
        }
    }

    /// Header for an unsolicited event (no transaction pending)
    pub fn event(iid: u8) -> Self {
        Self::new(iid, 0)
    }
}

impl Serialize for Header {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> util::Result<Serializer<'a>> {
        buffer.serialize(Self::PATTERN | (self.iid & 0x3) << 4 | (self.tid & 0xf))
    }
}

impl Deserialize for Header {
    fn deserialize(data: &mut Deserializer<'_>) -> util::Result<Self> {
        let byte = data.deserialize::<u8>()?;
        if byte & Self::PATTERN_MASK != Self::PATTERN {
            return Err(Error::UnknownValue("frame header pattern", byte.into()));
        }
        Ok(Self {
            iid: (byte >> 4) & 0x3,
            tid: byte & 0xf,
        })
    }
}

/// Command identifiers
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum CommandId {
    Noop = 0,
    Reset = 1,
    PropertyGet = 2,
    PropertySet = 3,
    PropertyIs = 6,
    BootloaderUpdate = 10,
}

/// Property identifiers understood by both ends.
///
/// The low numbers are the PHY/MAC baseline, the `Ws*` range carries the
/// Wi-SUN specific state the host mirrors onto the radio.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Property {
    LastStatus = 0x00,
    HwAddress = 0x08,
    PhyChannel = 0x21,
    PhyCcaThreshold = 0x24,
    PhyTxPower = 0x25,
    MacShortAddress = 0x34,
    MacPanId = 0x36,
    MacPromiscuous = 0x38,
    RfTimestamp = 0x40,
    WsFrame = 0x1000,
    WsFrameCounter = 0x1001,
    WsDeviceTable = 0x1002,
    WsKeyTable = 0x1003,
    WsFhssUcConfig = 0x1004,
    WsFhssBcConfig = 0x1005,
    WsFhssSetChannel = 0x1006,
    WsEnableFrameCounterPerKey = 0x1007,
    WsMlmeEvent = 0x1008,
    WsRxOnWhenIdle = 0x1009,
    WsModeSwitchPhyList = 0x100a,
}

impl Property {
    fn from_id(id: u32) -> Option<Self> {
        use Property::*;
        Some(match id {
            0x00 => LastStatus,
            0x08 => HwAddress,
            0x21 => PhyChannel,
            0x24 => PhyCcaThreshold,
            0x25 => PhyTxPower,
            0x34 => MacShortAddress,
            0x36 => MacPanId,
            0x38 => MacPromiscuous,
            0x40 => RfTimestamp,
            0x1000 => WsFrame,
            0x1001 => WsFrameCounter,
            0x1002 => WsDeviceTable,
            0x1003 => WsKeyTable,
            0x1004 => WsFhssUcConfig,
            0x1005 => WsFhssBcConfig,
            0x1006 => WsFhssSetChannel,
            0x1007 => WsEnableFrameCounterPerKey,
            0x1008 => WsMlmeEvent,
            0x1009 => WsRxOnWhenIdle,
            0x100a => WsModeSwitchPhyList,
            _ => return None,
        })
    }
}

/// An MCPS-DATA.request as handed to the radio.
///
/// The frame bytes are final: header, information elements and (when
/// secured) the CCM* ciphertext and MIC are all assembled by the MAC helper
/// before the request reaches the transport.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DataRequest {
    /// MSDU handle echoed in the confirmation
    pub handle: u8,
    /// Fully assembled frame, ready for the air
    pub frame: Vec<u8>,
    pub ack_requested: bool,
    /// Perform clear-channel assessment before transmitting
    pub cca: bool,
    /// Channel to transmit on, `0xffff` for the radio's current one
    pub channel: u16,
    /// PHY timestamp to transmit at (microseconds), 0 for immediately
    pub tx_at: u32,
    /// Queue priority, echoed back for accounting
    pub priority: u8,
}

impl Serialize for &DataRequest {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> util::Result<Serializer<'a>> {
        buffer
            .serialize(self.handle)?
            .serialize(self.ack_requested)?
            .serialize(self.cca)?
            .serialize(self.channel)?
            .serialize(self.tx_at)?
            .serialize(self.priority)?
            .push_data(&self.frame)
    }
}

impl Deserialize for DataRequest {
    fn deserialize(data: &mut Deserializer<'_>) -> util::Result<Self> {
        Ok(Self {
            handle: data.deserialize()?,
            ack_requested: data.deserialize()?,
            cca: data.deserialize()?,
            channel: data.deserialize()?,
            tx_at: data.deserialize()?,
            priority: data.deserialize()?,
            frame: data.pop_data()?.to_vec(),
        })
    }
}

/// An MCPS-DATA.indication delivered by the radio
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DataIndication {
    pub frame: Vec<u8>,
    pub lqi: u8,
    pub rssi_dbm: i8,
    /// PHY clock at the start of reception, microseconds
    pub phy_timestamp: u32,
    pub ack_requested: bool,
    pub frame_pending: bool,
}

impl Serialize for &DataIndication {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> util::Result<Serializer<'a>> {
        buffer
            .serialize(self.lqi)?
            .serialize(self.rssi_dbm)?
            .serialize(self.phy_timestamp)?
            .serialize(self.ack_requested)?
            .serialize(self.frame_pending)?
            .push_data(&self.frame)
    }
}

impl Deserialize for DataIndication {
    fn deserialize(data: &mut Deserializer<'_>) -> util::Result<Self> {
        Ok(Self {
            lqi: data.deserialize()?,
            rssi_dbm: data.deserialize()?,
            phy_timestamp: data.deserialize()?,
            ack_requested: data.deserialize()?,
            frame_pending: data.deserialize()?,
            frame: data.pop_data()?.to_vec(),
        })
    }
}

/// An MCPS-DATA.confirm reporting the outcome of one request
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DataConfirm {
    pub handle: u8,
    /// Raw IEEE 802.15.4 status byte, see [`crate::Status::from_mac`]
    pub status: u8,
    pub retries: u8,
    pub cca_attempts: u8,
    pub phy_timestamp: u32,
}

impl Serialize for DataConfirm {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> util::Result<Serializer<'a>> {
        buffer
            .serialize(self.handle)?
            .serialize(self.status)?
            .serialize(self.retries)?
            .serialize(self.cca_attempts)?
            .serialize(self.phy_timestamp)
    }
}

impl Deserialize for DataConfirm {
    fn deserialize(data: &mut Deserializer<'_>) -> util::Result<Self> {
        Ok(Self {
            handle: data.deserialize()?,
            status: data.deserialize()?,
            retries: data.deserialize()?,
            cca_attempts: data.deserialize()?,
            phy_timestamp: data.deserialize()?,
        })
    }
}

/// Reset notification, solicited or not
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ResetIndication {
    pub api_major: u8,
    pub api_minor: u8,
    /// Firmware version string advertised by the RCP
    pub version: String,
}

impl Serialize for &ResetIndication {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> util::Result<Serializer<'a>> {
        buffer
            .serialize(self.api_major)?
            .serialize(self.api_minor)?
            .push_data(self.version.as_bytes())
    }
}

impl Deserialize for ResetIndication {
    fn deserialize(data: &mut Deserializer<'_>) -> util::Result<Self> {
        Ok(Self {
            api_major: data.deserialize()?,
            api_minor: data.deserialize()?,
            version: String::from_utf8_lossy(data.pop_data()?).into_owned(),
        })
    }
}

/// Asynchronous MLME notifications from the radio
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MlmeEvent {
    /// A frame failed its PHY-level check; observable so the host can
    /// rate-limit noisy channels
    CrcError { phy_timestamp: u32, rssi_dbm: i8 },
    /// Receiver turned on or off
    RxState(bool),
    /// An EDFE exchange opened by a peer
    Edfe,
}

impl Serialize for MlmeEvent {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> util::Result<Serializer<'a>> {
        match self {
            Self::CrcError {
                phy_timestamp,
                rssi_dbm,
            } => buffer
                .serialize(0u8)?
                .serialize(phy_timestamp)?
                .serialize(rssi_dbm),
            Self::RxState(on) => buffer.serialize(1u8)?.serialize(on),
            Self::Edfe => buffer.serialize(2u8),
        }
    }
}

impl Deserialize for MlmeEvent {
    fn deserialize(data: &mut Deserializer<'_>) -> util::Result<Self> {
        match data.deserialize::<u8>()? {
            0 => Ok(Self::CrcError {
                phy_timestamp: data.deserialize()?,
                rssi_dbm: data.deserialize()?,
            }),
            1 => Ok(Self::RxState(data.deserialize()?)),
            2 => Ok(Self::Edfe),
            v => Err(Error::UnknownValue("MLME event", v.into())),
        }
    }
}

/// A command issued by the host
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command<'a> {
    Noop,
    Reset,
    /// Hand the RCP over to its bootloader for firmware flashing
    BootloaderUpdate,
    Get(Property),
    /// Set a property; the value is already serialized by the caller
    Set(Property, &'a [u8]),
    DataRequest(&'a DataRequest),
}

impl Command<'_> {
    /// Encodes the command, with its header, into frame payload bytes
    pub fn encode(&self, header: Header) -> Vec<u8> {
        let mut out = Vec::new();
        let ser = Serializer::new(&mut out).serialize(header).unwrap();
        // Serialization into a Vec only fails on an over-long blob, and
        // every frame here is bounded well below that
        match self {
            Self::Noop => ser.push_uint(CommandId::Noop as u32),
            Self::Reset => ser.push_uint(CommandId::Reset as u32),
            Self::BootloaderUpdate => ser.push_uint(CommandId::BootloaderUpdate as u32),
            Self::Get(prop) => ser
                .push_uint(CommandId::PropertyGet as u32)
                .and_then(|s| s.push_uint(*prop as u32)),
            Self::Set(prop, value) => ser
                .push_uint(CommandId::PropertySet as u32)
                .and_then(|s| s.push_uint(*prop as u32))
                .and_then(|s| s.push(value)),
            Self::DataRequest(req) => ser
                .push_uint(CommandId::PropertySet as u32)
                .and_then(|s| s.push_uint(Property::WsFrame as u32))
                .and_then(|s| s.serialize(*req)),
        }
        .unwrap();
        out
    }
}

/// A decoded frame from the RCP
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RcpFrame {
    Reset(ResetIndication),
    /// `LastStatus` notification answering the previous command
    Status(u32),
    DataIndication(DataIndication),
    DataConfirm(DataConfirm),
    MlmeEvent(MlmeEvent),
    /// Current PHY clock, microseconds
    RfTimestamp(u32),
    /// A property notification the transport does not give a type to
    PropertyIs { property: Property, value: Vec<u8> },
}

/// Decodes one HDLC payload coming from the RCP.
///
/// Unknown command or property identifiers are reported as
/// [`Error::UnknownValue`]; the caller logs and counts them, they are never
/// fatal.
pub fn decode(payload: &[u8]) -> Result<(Header, RcpFrame), Error> {
    let mut data = Deserializer::new(payload);
    let header = data.deserialize::<Header>()?;
    let command = data.pop_uint()?;
    let frame = match command {
        c if c == CommandId::Reset as u32 => RcpFrame::Reset(data.deserialize()?),
        c if c == CommandId::PropertyIs as u32 => {
            let id = data.pop_uint()?;
            let property =
                Property::from_id(id).ok_or(Error::UnknownValue("property", id))?;
            match property {
                Property::LastStatus => RcpFrame::Status(data.pop_uint()?),
                Property::WsFrame => RcpFrame::DataIndication(data.deserialize()?),
                Property::WsMlmeEvent => RcpFrame::MlmeEvent(data.deserialize()?),
                Property::RfTimestamp => RcpFrame::RfTimestamp(data.deserialize()?),
                _ => RcpFrame::PropertyIs {
                    property,
                    value: data.rest().to_vec(),
                },
            }
        }
        c if c == CommandId::PropertySet as u32 => {
            // The RCP confirms a transmitted frame by setting WsFrame back
            // with the confirm payload
            let id = data.pop_uint()?;
            match Property::from_id(id) {
                Some(Property::WsFrame) => RcpFrame::DataConfirm(data.deserialize()?),
                _ => return Err(Error::UnknownValue("property", id)),
            }
        }
        c => return Err(Error::UnknownValue("command", c)),
    };
    Ok((header, frame))
}
