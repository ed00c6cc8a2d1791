//! IEEE 802.15.4-2015 MAC frame header codec.
//!
//! Only the frame shapes the border router exchanges are covered: version-2
//! data, acknowledgment and command frames with optional security and
//! information elements.
//!
//! ```plain
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-----+-+-+-+-+-+-+-+-+---+---+---+
//! |Type |S|P|A|C|res|Q|I|DAM|Ver|SAM|   frame control
//! +-----+-+-+-+-+-+-+-+-+---+---+---+
//! ```
//!
//! `S` security enabled, `P` frame pending, `A` ack request, `C` PAN ID
//! compression, `Q` sequence number suppression, `I` IE present, `DAM`/
//! `SAM` address modes, `Ver` frame version (always 2 here).

use super::util::{Deserialize, Deserializer, Serialize, Serializer};
use super::Error;
use crate::{Eui64, MacAddr};

/// MAC frame type field
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FrameKind {
    Data = 1,
    Ack = 2,
    Command = 3,
}

/// MAC command identifier (first payload byte of a command frame)
pub const CMD_DATA_REQUEST: u8 = 0x04;

/// Auxiliary security header
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SecurityHeader {
    /// Security level 1..=7; level 6 (ENC-MIC-64) is the Wi-SUN default
    pub level: u8,
    /// Key identifier mode; Wi-SUN uses mode 1 (index only)
    pub key_id_mode: u8,
    pub frame_counter: u32,
    /// Key index, 1-based; GTK slot N travels as index N+1
    pub key_index: u8,
}

impl SecurityHeader {
    /// MIC length in bytes implied by the security level
    pub fn mic_len(&self) -> usize {
        match self.level & 0x3 {
            0 => 0,
            1 => 4,
            2 => 8,
            _ => 16,
        }
    }
}

/// A parsed or to-be-emitted MAC frame.
///
/// `header_ies` and `payload_ies` hold the raw IE regions (see
/// [`super::ie`]); when the frame is secured, `payload` carries ciphertext
/// followed by the MIC.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub frame_pending: bool,
    pub ack_requested: bool,
    /// `None` when sequence number suppression is in effect
    pub seq: Option<u8>,
    pub dst_pan: Option<u16>,
    pub dst: Option<MacAddr>,
    pub src_pan: Option<u16>,
    pub src: Option<MacAddr>,
    pub security: Option<SecurityHeader>,
    pub header_ies: Vec<u8>,
    pub payload_ies: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A plain unsecured data frame skeleton
    pub fn data(dst: Option<MacAddr>, src: MacAddr) -> Self {
        Self {
            kind: FrameKind::Data,
            frame_pending: false,
            ack_requested: false,
            seq: None,
            dst_pan: None,
            dst,
            src_pan: None,
            src: Some(src),
            security: None,
            header_ies: Vec::new(),
            payload_ies: Vec::new(),
            payload: Vec::new(),
        }
    }

    fn addr_mode(addr: Option<&MacAddr>) -> u16 {
        match addr {
            None => 0,
            Some(MacAddr::Short(_)) => 2,
            Some(MacAddr::Ext(_)) => 3,
        }
    }

    /// Serializes the frame; the second value is the offset of `payload`
    /// within the returned bytes (everything before it is authenticated
    /// but not encrypted by CCM*)
    pub fn emit(&self) -> (Vec<u8>, usize) {
        let pan_id_compression = self.src_pan.is_none() && self.src.is_some();
        let fc = self.kind as u16
            | u16::from(self.security.is_some()) << 3
            | u16::from(self.frame_pending) << 4
            | u16::from(self.ack_requested) << 5
            | u16::from(pan_id_compression) << 6
            | u16::from(self.seq.is_none()) << 8
            | u16::from(!self.header_ies.is_empty() || !self.payload_ies.is_empty()) << 9
            | Self::addr_mode(self.dst.as_ref()) << 10
            | 2 << 12
            | Self::addr_mode(self.src.as_ref()) << 14;

        let mut out = Vec::with_capacity(32 + self.payload.len());
        let mut ser = Serializer::new(&mut out).serialize(fc).unwrap();
        if let Some(seq) = self.seq {
            ser = ser.serialize(seq).unwrap();
        }
        if let Some(pan) = self.dst_pan {
            ser = ser.serialize(pan).unwrap();
        }
        ser = Self::emit_addr(ser, self.dst.as_ref());
        if let Some(pan) = self.src_pan {
            ser = ser.serialize(pan).unwrap();
        }
        ser = Self::emit_addr(ser, self.src.as_ref());
        if let Some(sec) = &self.security {
            ser = ser
                .serialize(sec.level & 0x7 | (sec.key_id_mode & 0x3) << 3)
                .unwrap()
                .serialize(sec.frame_counter)
                .unwrap();
            if sec.key_id_mode == 1 {
                ser = ser.serialize(sec.key_index).unwrap();
            }
        }
        let mut ser = ser.push(&self.header_ies).unwrap();
        if !self.payload_ies.is_empty() {
            // Header termination 1 separates the two IE spaces
            ser = ser.serialize(0u16 | 0x7eu16 << 7).unwrap();
            ser = ser.push(&self.payload_ies).unwrap();
        } else if !self.header_ies.is_empty() && !self.payload.is_empty() {
            // Header termination 2 closes the IE list before plain payload
            ser = ser.serialize(0u16 | 0x7fu16 << 7).unwrap();
        }
        let _ = ser;
        let offset = out.len();
        out.extend_from_slice(&self.payload);
        (out, offset)
    }

    fn emit_addr<'a>(ser: Serializer<'a>, addr: Option<&MacAddr>) -> Serializer<'a> {
        match addr {
            None => ser,
            Some(MacAddr::Short(a)) => ser.serialize(*a).unwrap(),
            Some(MacAddr::Ext(e)) => {
                // Extended addresses travel least-significant byte first
                let mut b = e.0;
                b.reverse();
                ser.serialize(b).unwrap()
            }
        }
    }

    /// Parses a frame; the second value is the offset of the payload (and
    /// the start of the encrypted region when secured)
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), Error> {
        let mut data = Deserializer::new(bytes);
        let fc = data.deserialize::<u16>()?;
        let kind = match fc & 0x7 {
            1 => FrameKind::Data,
            2 => FrameKind::Ack,
            3 => FrameKind::Command,
            v => return Err(Error::UnknownValue("frame type", v.into())),
        };
        if (fc >> 12) & 0x3 != 2 {
            return Err(Error::UnknownValue("frame version", ((fc >> 12) & 0x3).into()));
        }
        let seq = if fc & 1 << 8 != 0 {
            None
        } else {
            Some(data.deserialize()?)
        };
        let dst_mode = (fc >> 10) & 0x3;
        let src_mode = (fc >> 14) & 0x3;
        let pan_id_compression = fc & 1 << 6 != 0;
        let dst_pan = if dst_mode != 0 {
            Some(data.deserialize()?)
        } else {
            None
        };
        let dst = Self::parse_addr(&mut data, dst_mode)?;
        let src_pan = if src_mode != 0 && !pan_id_compression {
            Some(data.deserialize()?)
        } else {
            None
        };
        let src = Self::parse_addr(&mut data, src_mode)?;
        let security = if fc & 1 << 3 != 0 {
            let control = data.deserialize::<u8>()?;
            let key_id_mode = (control >> 3) & 0x3;
            if key_id_mode > 1 {
                return Err(Error::UnknownValue("key id mode", key_id_mode.into()));
            }
            let frame_counter = data.deserialize()?;
            let key_index = if key_id_mode == 1 {
                data.deserialize()?
            } else {
                0
            };
            Some(SecurityHeader {
                level: control & 0x7,
                key_id_mode,
                frame_counter,
                key_index,
            })
        } else {
            None
        };
        let (header_ies, payload_ies) = if fc & 1 << 9 != 0 {
            Self::parse_ie_regions(&mut data)?
        } else {
            (Vec::new(), Vec::new())
        };
        let offset = bytes.len() - data.remaining();
        let payload = data.rest().to_vec();
        Ok((
            Self {
                kind,
                frame_pending: fc & 1 << 4 != 0,
                ack_requested: fc & 1 << 5 != 0,
                seq,
                dst_pan,
                dst,
                src_pan,
                src,
                security,
                header_ies,
                payload_ies,
                payload,
            },
            offset,
        ))
    }

    fn parse_addr(data: &mut Deserializer<'_>, mode: u16) -> Result<Option<MacAddr>, Error> {
        match mode {
            0 => Ok(None),
            2 => Ok(Some(MacAddr::Short(data.deserialize()?))),
            3 => {
                let mut b: [u8; 8] = data.deserialize()?;
                b.reverse();
                Ok(Some(MacAddr::Ext(Eui64(b))))
            }
            v => Err(Error::UnknownValue("address mode", v.into())),
        }
    }

    /// Splits the IE area into the header-IE region (up to a termination
    /// IE) and the payload-IE region (up to the payload termination or the
    /// end of the frame)
    fn parse_ie_regions(data: &mut Deserializer<'_>) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let mut header = Vec::new();
        loop {
            if data.remaining() < 2 {
                return Ok((header, Vec::new()));
            }
            let descriptor = u16::from_le_bytes(data.advance(2)?.try_into().unwrap());
            let elem_id = ((descriptor >> 7) & 0xff) as u8;
            let len = usize::from(descriptor & 0x7f);
            match elem_id {
                0x7e => break,                          // HT1: payload IEs follow
                0x7f => return Ok((header, Vec::new())), // HT2: payload follows
                _ => {
                    header.extend_from_slice(&descriptor.to_le_bytes());
                    header.extend_from_slice(data.advance(len)?);
                }
            }
        }
        let mut payload = Vec::new();
        while data.remaining() >= 2 {
            let descriptor = u16::from_le_bytes(data.advance(2)?.try_into().unwrap());
            let gid = ((descriptor >> 11) & 0xf) as u8;
            let len = usize::from(descriptor & 0x7ff);
            // Payload termination group closes the list
            if descriptor & 0x8000 != 0 && gid == 0xf {
                break;
            }
            payload.extend_from_slice(&descriptor.to_le_bytes());
            payload.extend_from_slice(data.advance(len)?);
        }
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eui(last: u8) -> Eui64 {
        Eui64([0x0c, 0x5b, 0xa0, 0xff, 0xfe, 0x00, 0x00, last])
    }

    #[test]
    fn data_frame_roundtrip() {
        let mut frame = Frame::data(Some(MacAddr::Ext(eui(1))), MacAddr::Ext(eui(2)));
        frame.dst_pan = Some(0xabcd);
        frame.ack_requested = true;
        frame.payload = vec![1, 2, 3, 4];
        let (wire, offset) = frame.emit();
        let (parsed, parsed_offset) = Frame::parse(&wire).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed_offset, offset);
        assert_eq!(&wire[offset..], [1, 2, 3, 4]);
    }

    #[test]
    fn secured_frame_roundtrip() {
        let mut frame = Frame::data(Some(MacAddr::Short(0x0001)), MacAddr::Ext(eui(9)));
        frame.dst_pan = Some(0xabcd);
        frame.seq = Some(77);
        frame.security = Some(SecurityHeader {
            level: 6,
            key_id_mode: 1,
            frame_counter: 0x01020304,
            key_index: 2,
        });
        frame.payload = vec![0xde; 24];
        let (wire, _) = frame.emit();
        let (parsed, _) = Frame::parse(&wire).unwrap();
        assert_eq!(parsed.security, frame.security);
        assert_eq!(parsed.payload, frame.payload);
    }

    #[test]
    fn ie_regions_roundtrip() {
        let mut frame = Frame::data(None, MacAddr::Ext(eui(3)));
        frame.header_ies = {
            let mut buf = Vec::new();
            Serializer::new(&mut buf)
                .serialize(super::super::ie::HeaderIe::Utt {
                    frame_type: super::super::ie::FrameType::PanAdvert,
                    ufsi: 99,
                })
                .unwrap();
            buf
        };
        frame.payload_ies = super::super::ie::emit_wp_ies(&[super::super::ie::WpIe::PanVersion(7)])
            .unwrap();
        let (wire, _) = frame.emit();
        let (parsed, _) = Frame::parse(&wire).unwrap();
        assert_eq!(parsed.header_ies, frame.header_ies);
        assert_eq!(parsed.payload_ies, frame.payload_ies);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn mic_lengths() {
        for (level, len) in [(0u8, 0usize), (1, 4), (2, 8), (3, 16), (5, 4), (6, 8), (7, 16)] {
            let sec = SecurityHeader {
                level,
                key_id_mode: 1,
                frame_counter: 0,
                key_index: 1,
            };
            assert_eq!(sec.mic_len(), len, "level {level}");
        }
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = Frame::data(Some(MacAddr::Ext(eui(1))), MacAddr::Ext(eui(2)));
        let (wire, _) = frame.emit();
        assert!(Frame::parse(&wire[..wire.len() - 3]).is_err());
    }
}
