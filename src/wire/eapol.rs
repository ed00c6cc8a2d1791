//! EAPOL framing, EAP(-TLS) packets and the IEEE 802.11 key descriptor.
//!
//! The authenticator speaks three shapes over the mesh data path: plain
//! EAP carried in EAPOL-EAP packets (identity and TLS), EAPOL-Key frames
//! for the 4-way handshake and group-key delivery, and EAPOL-Start from
//! supplicants. All multi-byte fields in this family are big-endian.
//!
//! ```plain
//!  0              1              2              3
//! +--------------+--------------+-----------------------------+
//! | Version = 3  | Packet Type  |        Body Length          |
//! +--------------+--------------+-----------------------------+
//! |                         Body ...                          |
//! +-----------------------------------------------------------+
//! ```

use bitflags::bitflags;

use super::util::Deserializer;
use super::Error;

pub const EAPOL_VERSION: u8 = 3;

const IEEE_OUI: [u8; 3] = [0x00, 0x0f, 0xac];
const WISUN_OUI: [u8; 3] = [0x0c, 0x5b, 0xa0];

fn pop_be16(data: &mut Deserializer<'_>) -> Result<u16, Error> {
    data.deserialize().map(u16::from_be_bytes)
}

fn pop_be32(data: &mut Deserializer<'_>) -> Result<u32, Error> {
    data.deserialize().map(u32::from_be_bytes)
}

fn pop_be64(data: &mut Deserializer<'_>) -> Result<u64, Error> {
    data.deserialize().map(u64::from_be_bytes)
}

/// EAP message codes
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

bitflags! {
    /// EAP-TLS flags byte
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TlsFlags: u8 {
        /// The four-byte total message length follows
        const LENGTH_INCLUDED = 0x80;
        /// More fragments follow
        const MORE = 0x40;
        /// EAP-TLS start
        const START = 0x20;
    }
}

/// An EAP packet body
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EapBody {
    Identity(Vec<u8>),
    Tls {
        flags: TlsFlags,
        /// Total reassembled length, present on the first fragment of a
        /// fragmented message
        total_length: Option<u32>,
        data: Vec<u8>,
    },
    /// Success and failure packets carry no body
    None,
}

/// An EAP packet
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EapPacket {
    pub code: EapCode,
    pub identifier: u8,
    pub body: EapBody,
}

impl EapPacket {
    pub const TYPE_IDENTITY: u8 = 1;
    pub const TYPE_TLS: u8 = 13;

    pub fn emit(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match &self.body {
            EapBody::Identity(id) => {
                body.push(Self::TYPE_IDENTITY);
                body.extend_from_slice(id);
            }
            EapBody::Tls {
                flags,
                total_length,
                data,
            } => {
                body.push(Self::TYPE_TLS);
                body.push(flags.bits());
                if let Some(len) = total_length {
                    body.extend_from_slice(&len.to_be_bytes());
                }
                body.extend_from_slice(data);
            }
            EapBody::None => {}
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.push(self.code as u8);
        out.push(self.identifier);
        out.extend_from_slice(&(4 + body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut data = Deserializer::new(bytes);
        let code = match data.deserialize::<u8>()? {
            1 => EapCode::Request,
            2 => EapCode::Response,
            3 => EapCode::Success,
            4 => EapCode::Failure,
            v => return Err(Error::UnknownValue("EAP code", v.into())),
        };
        let identifier = data.deserialize()?;
        let length = usize::from(pop_be16(&mut data)?);
        if length < 4 || length > bytes.len() {
            return Err(Error::InvalidLength(length));
        }
        let mut data = Deserializer::new(&bytes[4..length]);
        let body = match code {
            EapCode::Success | EapCode::Failure => EapBody::None,
            _ => match data.deserialize::<u8>()? {
                Self::TYPE_IDENTITY => EapBody::Identity(data.rest().to_vec()),
                Self::TYPE_TLS => {
                    let flags = TlsFlags::from_bits_truncate(data.deserialize()?);
                    let total_length = if flags.contains(TlsFlags::LENGTH_INCLUDED) {
                        Some(pop_be32(&mut data)?)
                    } else {
                        None
                    };
                    EapBody::Tls {
                        flags,
                        total_length,
                        data: data.rest().to_vec(),
                    }
                }
                v => return Err(Error::UnknownValue("EAP type", v.into())),
            },
        };
        Ok(Self {
            code,
            identifier,
            body,
        })
    }
}

bitflags! {
    /// EAPOL-Key key information flags (the descriptor version bits are
    /// fixed at 2: HMAC-SHA1 MIC with AES key wrap)
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct KeyInfo: u16 {
        const PAIRWISE = 1 << 3;
        const INSTALL = 1 << 6;
        const ACK = 1 << 7;
        const MIC = 1 << 8;
        const SECURE = 1 << 9;
        const ERROR = 1 << 10;
        const REQUEST = 1 << 11;
        const ENCRYPTED_KEY_DATA = 1 << 12;
    }
}

/// Position of a key frame within its handshake
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandshakeMsg {
    FourWh1,
    FourWh2,
    FourWh3,
    FourWh4,
    Group1,
    Group2,
}

impl KeyInfo {
    const DESCRIPTOR_VERSION: u16 = 2;

    /// Classifies a received key frame by its flags
    pub fn classify(&self) -> Option<HandshakeMsg> {
        use HandshakeMsg::*;
        let f = *self;
        Some(if f.contains(Self::PAIRWISE) {
            match (
                f.contains(Self::ACK),
                f.contains(Self::MIC),
                f.contains(Self::INSTALL),
            ) {
                (true, false, false) => FourWh1,
                (false, true, false) if !f.contains(Self::SECURE) => FourWh2,
                (true, true, true) => FourWh3,
                (false, true, false) => FourWh4,
                _ => return None,
            }
        } else {
            match (f.contains(Self::ACK), f.contains(Self::MIC)) {
                (true, true) => Group1,
                (false, true) => Group2,
                _ => return None,
            }
        })
    }
}

/// An EAPOL-Key frame, descriptor type 2 (IEEE 802.11)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KeyFrame {
    pub key_info: KeyInfo,
    pub key_length: u16,
    pub replay_counter: u64,
    pub nonce: [u8; 32],
    pub key_iv: [u8; 16],
    pub key_rsc: u64,
    pub mic: [u8; 16],
    pub key_data: Vec<u8>,
}

impl KeyFrame {
    pub const DESCRIPTOR_TYPE: u8 = 2;
    /// Offset of the MIC field within the emitted body, for computing and
    /// checking the MIC over the whole EAPOL frame with this field zeroed
    pub const MIC_OFFSET: usize = 4 + 77;

    pub fn new(key_info: KeyInfo) -> Self {
        Self {
            key_info,
            key_length: 0,
            replay_counter: 0,
            nonce: [0; 32],
            key_iv: [0; 16],
            key_rsc: 0,
            mic: [0; 16],
            key_data: Vec::new(),
        }
    }

    fn emit_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(95 + self.key_data.len());
        out.push(Self::DESCRIPTOR_TYPE);
        out.extend_from_slice(
            &(self.key_info.bits() | KeyInfo::DESCRIPTOR_VERSION).to_be_bytes(),
        );
        out.extend_from_slice(&self.key_length.to_be_bytes());
        out.extend_from_slice(&self.replay_counter.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.key_iv);
        out.extend_from_slice(&self.key_rsc.to_be_bytes());
        out.extend_from_slice(&[0; 8]); // reserved
        out.extend_from_slice(&self.mic);
        out.extend_from_slice(&(self.key_data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.key_data);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut data = Deserializer::new(bytes);
        let descriptor = data.deserialize::<u8>()?;
        if descriptor != Self::DESCRIPTOR_TYPE {
            return Err(Error::UnknownValue("key descriptor type", descriptor.into()));
        }
        let raw_info = pop_be16(&mut data)?;
        if raw_info & 0x7 != KeyInfo::DESCRIPTOR_VERSION {
            return Err(Error::UnknownValue(
                "key descriptor version",
                (raw_info & 0x7).into(),
            ));
        }
        let key_info = KeyInfo::from_bits_truncate(raw_info);
        let key_length = pop_be16(&mut data)?;
        let replay_counter = pop_be64(&mut data)?;
        let nonce = data.deserialize()?;
        let key_iv = data.deserialize()?;
        let key_rsc = pop_be64(&mut data)?;
        data.skip(8)?;
        let mic = data.deserialize()?;
        let key_data_len = usize::from(pop_be16(&mut data)?);
        let key_data = data.advance(key_data_len)?.to_vec();
        Ok(Self {
            key_info,
            key_length,
            replay_counter,
            nonce,
            key_iv,
            key_rsc,
            mic,
            key_data,
        })
    }
}

/// EAPOL packet types the authenticator handles
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EapolPacket {
    Eap(EapPacket),
    Start,
    Key(KeyFrame),
}

impl EapolPacket {
    const TYPE_EAP: u8 = 0;
    const TYPE_START: u8 = 1;
    const TYPE_KEY: u8 = 3;

    pub fn emit(&self) -> Vec<u8> {
        let (packet_type, body) = match self {
            Self::Eap(eap) => (Self::TYPE_EAP, eap.emit()),
            Self::Start => (Self::TYPE_START, Vec::new()),
            Self::Key(key) => (Self::TYPE_KEY, key.emit_body()),
        };
        let mut out = Vec::with_capacity(4 + body.len());
        out.push(EAPOL_VERSION);
        out.push(packet_type);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut data = Deserializer::new(bytes);
        let _version = data.deserialize::<u8>()?;
        let packet_type = data.deserialize::<u8>()?;
        let length = usize::from(pop_be16(&mut data)?);
        let body = data.advance(length)?;
        match packet_type {
            Self::TYPE_EAP => EapPacket::parse(body).map(Self::Eap),
            Self::TYPE_START => Ok(Self::Start),
            Self::TYPE_KEY => KeyFrame::parse(body).map(Self::Key),
            v => Err(Error::UnknownValue("EAPOL packet type", v.into())),
        }
    }
}

/// Key data elements carried encrypted in message 3 and the group handshake
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kde {
    /// Group transient key with its slot index
    Gtk { index: u8, key: [u8; 16] },
    Pmkid([u8; 16]),
    Ptkid([u8; 16]),
    /// Remaining key lifetime, seconds
    Lifetime(u32),
    /// Liveness bitmap of the GTK slots
    Gtkl(u8),
    /// LFN group transient key with its slot index
    Lgtk { index: u8, key: [u8; 16] },
    /// Liveness bitmap of the LGTK slots
    Lgtkl(u8),
}

impl Kde {
    fn oui_and_type(&self) -> ([u8; 3], u8) {
        match self {
            Self::Gtk { .. } => (IEEE_OUI, 1),
            Self::Pmkid(_) => (IEEE_OUI, 4),
            Self::Lifetime(_) => (IEEE_OUI, 7),
            Self::Ptkid(_) => (WISUN_OUI, 1),
            Self::Gtkl(_) => (WISUN_OUI, 2),
            Self::Lgtk { .. } => (WISUN_OUI, 4),
            Self::Lgtkl(_) => (WISUN_OUI, 5),
        }
    }
}

/// Encodes a KDE list into key data bytes
pub fn emit_kdes(kdes: &[Kde]) -> Vec<u8> {
    let mut out = Vec::new();
    for kde in kdes {
        let (oui, data_type) = kde.oui_and_type();
        let mut body = Vec::new();
        body.extend_from_slice(&oui);
        body.push(data_type);
        match kde {
            Kde::Gtk { index, key } => {
                body.push(index & 0x3);
                body.push(0);
                body.extend_from_slice(key);
            }
            Kde::Pmkid(id) | Kde::Ptkid(id) => body.extend_from_slice(id),
            Kde::Lifetime(secs) => body.extend_from_slice(&secs.to_be_bytes()),
            Kde::Gtkl(map) | Kde::Lgtkl(map) => body.push(*map),
            Kde::Lgtk { index, key } => {
                body.push(index & 0x3);
                body.extend_from_slice(key);
            }
        }
        out.push(0xdd);
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
    }
    out
}

/// Decodes the KDE list from (decrypted) key data, skipping unknown
/// elements and any key-wrap padding
pub fn parse_kdes(bytes: &[u8]) -> Result<Vec<Kde>, Error> {
    let mut data = Deserializer::new(bytes);
    let mut out = Vec::new();
    while !data.is_empty() {
        let tag = data.deserialize::<u8>()?;
        if tag != 0xdd {
            // Key-wrap padding starts with 0xdd too, but a bare 0x00 run
            // can trail the last element
            if tag == 0 {
                continue;
            }
            return Err(Error::UnknownValue("key data element", tag.into()));
        }
        if data.is_empty() {
            break; // 0xdd alone is padding
        }
        let len = usize::from(data.deserialize::<u8>()?);
        if len == 0 {
            continue;
        }
        let mut body = Deserializer::new(data.advance(len)?);
        let oui: [u8; 3] = body.deserialize()?;
        let data_type = body.deserialize::<u8>()?;
        match (oui, data_type) {
            (IEEE_OUI, 1) => {
                let flags = body.deserialize::<u8>()?;
                out.push(Kde::Gtk {
                    index: flags & 0x3,
                    key: body.skip(1)?.deserialize()?,
                });
            }
            (IEEE_OUI, 4) => out.push(Kde::Pmkid(body.deserialize()?)),
            (IEEE_OUI, 7) => out.push(Kde::Lifetime(pop_be32(&mut body)?)),
            (WISUN_OUI, 1) => out.push(Kde::Ptkid(body.deserialize()?)),
            (WISUN_OUI, 2) => out.push(Kde::Gtkl(body.deserialize()?)),
            (WISUN_OUI, 4) => {
                let index = body.deserialize::<u8>()?;
                out.push(Kde::Lgtk {
                    index: index & 0x3,
                    key: body.deserialize()?,
                });
            }
            (WISUN_OUI, 5) => out.push(Kde::Lgtkl(body.deserialize()?)),
            (oui, t) => log::debug!("eapol: skip KDE {oui:02x?}:{t}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eap_identity_roundtrip() {
        let packet = EapPacket {
            code: EapCode::Response,
            identifier: 7,
            body: EapBody::Identity(b"anonymous".to_vec()),
        };
        let wire = EapolPacket::Eap(packet.clone()).emit();
        assert_eq!(EapolPacket::parse(&wire).unwrap(), EapolPacket::Eap(packet));
    }

    #[test]
    fn eap_tls_first_fragment_roundtrip() {
        let packet = EapPacket {
            code: EapCode::Request,
            identifier: 2,
            body: EapBody::Tls {
                flags: TlsFlags::LENGTH_INCLUDED | TlsFlags::MORE,
                total_length: Some(3000),
                data: vec![0x16, 0x03, 0x03],
            },
        };
        let wire = packet.emit();
        assert_eq!(EapPacket::parse(&wire).unwrap(), packet);
    }

    #[test]
    fn key_frame_roundtrip() {
        let mut frame = KeyFrame::new(KeyInfo::PAIRWISE | KeyInfo::ACK);
        frame.replay_counter = 1;
        frame.nonce = [0xaa; 32];
        frame.key_data = emit_kdes(&[Kde::Pmkid([9; 16])]);
        let wire = EapolPacket::Key(frame.clone()).emit();
        assert_eq!(EapolPacket::parse(&wire).unwrap(), EapolPacket::Key(frame));
    }

    #[test]
    fn mic_offset_matches_layout() {
        let mut frame = KeyFrame::new(KeyInfo::PAIRWISE | KeyInfo::MIC);
        frame.mic = [0x5a; 16];
        let wire = EapolPacket::Key(frame).emit();
        assert_eq!(&wire[KeyFrame::MIC_OFFSET..KeyFrame::MIC_OFFSET + 16], [0x5a; 16]);
    }

    #[test]
    fn classification() {
        use HandshakeMsg::*;
        let cases = [
            (KeyInfo::PAIRWISE | KeyInfo::ACK, FourWh1),
            (KeyInfo::PAIRWISE | KeyInfo::MIC, FourWh2),
            (
                KeyInfo::PAIRWISE
                    | KeyInfo::ACK
                    | KeyInfo::MIC
                    | KeyInfo::INSTALL
                    | KeyInfo::SECURE
                    | KeyInfo::ENCRYPTED_KEY_DATA,
                FourWh3,
            ),
            (KeyInfo::PAIRWISE | KeyInfo::MIC | KeyInfo::SECURE, FourWh4),
            (
                KeyInfo::ACK | KeyInfo::MIC | KeyInfo::SECURE | KeyInfo::ENCRYPTED_KEY_DATA,
                Group1,
            ),
            (KeyInfo::MIC | KeyInfo::SECURE, Group2),
        ];
        for (info, expected) in cases {
            assert_eq!(info.classify(), Some(expected), "{info:?}");
        }
    }

    #[test]
    fn kde_roundtrip() {
        let kdes = vec![
            Kde::Gtk {
                index: 1,
                key: [0x11; 16],
            },
            Kde::Lifetime(43200 * 60),
            Kde::Gtkl(0b0011),
            Kde::Lgtk {
                index: 0,
                key: [0x22; 16],
            },
            Kde::Lgtkl(0b001),
        ];
        let mut wire = emit_kdes(&kdes);
        // Key-wrap padding
        wire.push(0xdd);
        wire.push(0x00);
        assert_eq!(parse_kdes(&wire).unwrap(), kdes);
    }
}
