//! Wi-SUN information elements.
//!
//! Management and data frames carry two IE spaces: *header IEs* inside the
//! MAC header (timing corrections, all under the Wi-SUN element ID) and
//! *payload IEs* nested inside the WP-IE (schedules, PAN attributes, key
//! hashes).
//!
//! Header IE descriptor:
//!
//! ```plain
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-------------+---------------+-+
//! |  Length (7) |  Elem ID (8)  |0|
//! +-------------+---------------+-+
//! | Sub-ID (8)  |   content ...   |
//! +-----------------------------+-+
//! ```
//!
//! Payload IE descriptor (the WP-IE wrapper), followed by nested IEs in
//! long form (US, BS) or short form (the rest):
//!
//! ```plain
//! +--------------------+--------+-+     +------------------+-------+-+
//! |    Length (11)     | GID(4) |1|     |    Length (11)   | ID(4) |1|  long
//! +--------------------+--------+-+     +------------------+-------+-+
//!                                       +---------+----------------+-+
//!                                       | Len (8) |   Sub-ID (7)   |0|  short
//!                                       +---------+----------------+-+
//! ```
//!
//! Unknown sub-IEs are skipped on reception with a debug log.

use super::util::{self, Deserialize, Deserializer, Serialize, Serializer};
use super::Error;

/// Wi-SUN header IE element identifier
pub const WISUN_HIE_ID: u8 = 0x2a;
/// Wi-SUN payload IE group identifier (WP-IE)
pub const WISUN_WPIE_GID: u8 = 0x4;

/// Frame type carried in the UTT-IE
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FrameType {
    PanAdvert = 0,
    PanAdvertSolicit = 1,
    PanConfig = 2,
    PanConfigSolicit = 3,
    Data = 4,
    Ack = 5,
    Eapol = 6,
    LfnPanAdvertSolicit = 9,
    LfnPanAdvert = 10,
    LfnPanConfigSolicit = 11,
    LfnPanConfig = 12,
    LfnTimeSync = 13,
}

impl FrameType {
    fn from_raw(raw: u8) -> Option<Self> {
        use FrameType::*;
        Some(match raw {
            0 => PanAdvert,
            1 => PanAdvertSolicit,
            2 => PanConfig,
            3 => PanConfigSolicit,
            4 => Data,
            5 => Ack,
            6 => Eapol,
            9 => LfnPanAdvertSolicit,
            10 => LfnPanAdvert,
            11 => LfnPanConfigSolicit,
            12 => LfnPanConfig,
            13 => LfnTimeSync,
            _ => return None,
        })
    }
}

/// Wi-SUN header information elements
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeaderIe {
    /// Unicast timing: frame type plus the sender's unicast fractional
    /// sequence interval (24 bits)
    Utt { frame_type: FrameType, ufsi: u32 },
    /// Broadcast timing: slot number and offset into the broadcast
    /// interval, milliseconds (24 bits)
    Bt { slot: u16, interval_offset: u32 },
    /// LFN unicast timing
    Lutt {
        frame_type: FrameType,
        slot: u16,
        interval_offset: u32,
    },
    /// LFN broadcast timing
    Lbt { slot: u16, interval_offset: u32 },
}

impl HeaderIe {
    const SUB_UTT: u8 = 1;
    const SUB_BT: u8 = 2;
    const SUB_LUTT: u8 = 3;
    const SUB_LBT: u8 = 4;
}

fn push_u24<'a>(ser: Serializer<'a>, val: u32) -> util::Result<Serializer<'a>> {
    let b = val.to_le_bytes();
    ser.serialize([b[0], b[1], b[2]])
}

fn pop_u24(data: &mut Deserializer<'_>) -> util::Result<u32> {
    let b: [u8; 3] = data.deserialize()?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
}

impl Serialize for HeaderIe {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> util::Result<Serializer<'a>> {
        let mut content = Vec::new();
        let ser = Serializer::new(&mut content);
        match self {
            Self::Utt { frame_type, ufsi } => {
                push_u24(ser.serialize(Self::SUB_UTT)?.serialize(frame_type as u8)?, ufsi)?;
            }
            Self::Bt {
                slot,
                interval_offset,
            } => {
                push_u24(ser.serialize(Self::SUB_BT)?.serialize(slot)?, interval_offset)?;
            }
            Self::Lutt {
                frame_type,
                slot,
                interval_offset,
            } => {
                push_u24(
                    ser.serialize(Self::SUB_LUTT)?
                        .serialize(frame_type as u8)?
                        .serialize(slot)?,
                    interval_offset,
                )?;
            }
            Self::Lbt {
                slot,
                interval_offset,
            } => {
                push_u24(ser.serialize(Self::SUB_LBT)?.serialize(slot)?, interval_offset)?;
            }
        }
        let descriptor = content.len() as u16 & 0x7f | u16::from(WISUN_HIE_ID) << 7;
        buffer.serialize(descriptor)?.push(&content)
    }
}

/// Parses every Wi-SUN header IE in `bytes`, skipping the ones it does not
/// know
pub fn parse_header_ies(bytes: &[u8]) -> Result<Vec<HeaderIe>, Error> {
    let mut data = Deserializer::new(bytes);
    let mut out = Vec::new();
    while !data.is_empty() {
        let descriptor = data.deserialize::<u16>()?;
        let len = usize::from(descriptor & 0x7f);
        let elem_id = (descriptor >> 7) as u8;
        let content = data.advance(len)?;
        if descriptor & 0x8000 != 0 || elem_id != WISUN_HIE_ID {
            continue;
        }
        let mut content = Deserializer::new(content);
        match content.deserialize::<u8>()? {
            HeaderIe::SUB_UTT => {
                let raw = content.deserialize::<u8>()?;
                let Some(frame_type) = FrameType::from_raw(raw) else {
                    log::debug!("ie: skip UTT with frame type {raw}");
                    continue;
                };
                out.push(HeaderIe::Utt {
                    frame_type,
                    ufsi: pop_u24(&mut content)?,
                });
            }
            HeaderIe::SUB_BT => out.push(HeaderIe::Bt {
                slot: content.deserialize()?,
                interval_offset: pop_u24(&mut content)?,
            }),
            HeaderIe::SUB_LUTT => {
                let raw = content.deserialize::<u8>()?;
                let Some(frame_type) = FrameType::from_raw(raw) else {
                    continue;
                };
                out.push(HeaderIe::Lutt {
                    frame_type,
                    slot: content.deserialize()?,
                    interval_offset: pop_u24(&mut content)?,
                });
            }
            HeaderIe::SUB_LBT => out.push(HeaderIe::Lbt {
                slot: content.deserialize()?,
                interval_offset: pop_u24(&mut content)?,
            }),
            sub => log::debug!("ie: skip header sub-IE {sub}"),
        }
    }
    Ok(out)
}

/// How a schedule walks its channels
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelFunction {
    /// Stay on one channel
    Fixed(u16),
    /// Direct hash channel function over the regulatory channel set
    Dh1cf,
}

/// Which channels the schedule draws from
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ChannelPlan {
    /// Regulatory domain and operating class, resolved from tables both
    /// ends carry
    Domain { reg_domain: u8, op_class: u8 },
    /// Explicit plan: base frequency (kHz), spacing code, channel count
    Explicit {
        base_khz: u32,
        spacing: u8,
        count: u16,
    },
}

/// Channels masked out of a plan
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ExcludedChannels {
    None,
    /// Inclusive (first, last) channel ranges
    Ranges(Vec<(u16, u16)>),
    /// Bitmask, bit N = channel N excluded
    Mask(Vec<u8>),
}

/// A unicast channel schedule as advertised in the US-IE
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Schedule {
    /// Dwell interval, milliseconds (15..=255 per FAN)
    pub dwell_interval: u8,
    pub clock_drift: u8,
    pub timing_accuracy: u8,
    pub plan: ChannelPlan,
    pub function: ChannelFunction,
    pub excluded: ExcludedChannels,
}

/// A broadcast channel schedule as advertised in the BS-IE
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BroadcastSchedule {
    /// Broadcast interval, milliseconds
    pub interval: u32,
    /// Broadcast schedule identifier, bumped whenever the schedule changes
    pub bsi: u16,
    pub schedule: Schedule,
}

fn serialize_schedule<'a>(s: &Schedule, ser: Serializer<'a>) -> util::Result<Serializer<'a>> {
    let plan = match s.plan {
        ChannelPlan::Domain { .. } => 0u8,
        ChannelPlan::Explicit { .. } => 1,
    };
    let function = match s.function {
        ChannelFunction::Fixed(_) => 0u8,
        ChannelFunction::Dh1cf => 2,
    };
    let excluded = match s.excluded {
        ExcludedChannels::None => 0u8,
        ExcludedChannels::Ranges(_) => 1,
        ExcludedChannels::Mask(_) => 2,
    };
    let mut ser = ser
        .serialize(s.dwell_interval)?
        .serialize(s.clock_drift)?
        .serialize(s.timing_accuracy)?
        .serialize(plan | function << 3 | excluded << 6)?;
    ser = match s.plan {
        ChannelPlan::Domain {
            reg_domain,
            op_class,
        } => ser.serialize(reg_domain)?.serialize(op_class)?,
        ChannelPlan::Explicit {
            base_khz,
            spacing,
            count,
        } => push_u24(ser, base_khz)?.serialize(spacing)?.serialize(count)?,
    };
    if let ChannelFunction::Fixed(ch) = s.function {
        ser = ser.serialize(ch)?;
    }
    match &s.excluded {
        ExcludedChannels::None => Ok(ser),
        ExcludedChannels::Ranges(ranges) => {
            let count =
                u8::try_from(ranges.len()).map_err(|_| Error::Unrepresentable("range count"))?;
            ser = ser.serialize(count)?;
            for (first, last) in ranges {
                ser = ser.serialize(*first)?.serialize(*last)?;
            }
            Ok(ser)
        }
        ExcludedChannels::Mask(mask) => ser.push(mask),
    }
}

fn deserialize_schedule(data: &mut Deserializer<'_>) -> util::Result<Schedule> {
    let dwell_interval = data.deserialize()?;
    let clock_drift = data.deserialize()?;
    let timing_accuracy = data.deserialize()?;
    let control = data.deserialize::<u8>()?;
    let plan = match control & 0x7 {
        0 => ChannelPlan::Domain {
            reg_domain: data.deserialize()?,
            op_class: data.deserialize()?,
        },
        1 => ChannelPlan::Explicit {
            base_khz: pop_u24(data)?,
            spacing: data.deserialize()?,
            count: data.deserialize()?,
        },
        v => return Err(Error::UnknownValue("channel plan", v.into())),
    };
    let function = match (control >> 3) & 0x7 {
        0 => ChannelFunction::Fixed(data.deserialize()?),
        2 => ChannelFunction::Dh1cf,
        v => return Err(Error::UnknownValue("channel function", v.into())),
    };
    let excluded = match (control >> 6) & 0x3 {
        0 => ExcludedChannels::None,
        1 => {
            let count = data.deserialize::<u8>()?;
            let mut ranges = Vec::with_capacity(count.into());
            for _ in 0..count {
                ranges.push((data.deserialize()?, data.deserialize()?));
            }
            ExcludedChannels::Ranges(ranges)
        }
        2 => ExcludedChannels::Mask(data.rest().to_vec()),
        v => return Err(Error::UnknownValue("excluded channel control", v.into())),
    };
    Ok(Schedule {
        dwell_interval,
        clock_drift,
        timing_accuracy,
        plan,
        function,
        excluded,
    })
}

/// Wi-SUN payload information elements (nested in the WP-IE)
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WpIe {
    /// Unicast schedule
    Us(Schedule),
    /// Broadcast schedule
    Bs(BroadcastSchedule),
    /// PAN attributes
    Pan {
        pan_size: u16,
        routing_cost: u16,
        use_parent_bs: bool,
        /// true = RPL, false = L2 mesh
        routing_method: bool,
        fan_tps_version: u8,
    },
    /// Network name, UTF-8, at most 32 bytes
    NetName(String),
    PanVersion(u16),
    /// Truncated SHA-256 of the four GTK slots (all-zero when empty)
    GtkHash([[u8; 8]; 4]),
    /// LFN variant: active index plus hashes of the installed LGTKs
    LgtkHash {
        active_index: u8,
        hashes: [Option<[u8; 8]>; 3],
    },
    LfnVersion(u16),
}

impl WpIe {
    // Long-form sub-IDs
    const SUB_US: u8 = 1;
    const SUB_BS: u8 = 2;
    // Short-form sub-IDs
    const SUB_PAN: u8 = 4;
    const SUB_NETNAME: u8 = 5;
    const SUB_PANVER: u8 = 6;
    const SUB_GTKHASH: u8 = 7;
    const SUB_LFNVER: u8 = 0x40;
    const SUB_LGTKHASH: u8 = 0x41;

    fn is_long(&self) -> bool {
        matches!(self, Self::Us(_) | Self::Bs(_))
    }
}

fn serialize_wpie(ie: &WpIe, out: &mut Vec<u8>) -> util::Result<()> {
    let mut content = Vec::new();
    let ser = Serializer::new(&mut content);
    let sub_id = match ie {
        WpIe::Us(s) => {
            serialize_schedule(s, ser)?;
            WpIe::SUB_US
        }
        WpIe::Bs(b) => {
            serialize_schedule(&b.schedule, ser.serialize(b.interval)?.serialize(b.bsi)?)?;
            WpIe::SUB_BS
        }
        WpIe::Pan {
            pan_size,
            routing_cost,
            use_parent_bs,
            routing_method,
            fan_tps_version,
        } => {
            let flags = u8::from(*use_parent_bs)
                | u8::from(*routing_method) << 1
                | (fan_tps_version & 0x7) << 5;
            ser.serialize(*pan_size)?
                .serialize(*routing_cost)?
                .serialize(flags)?;
            WpIe::SUB_PAN
        }
        WpIe::NetName(name) => {
            if name.len() > 32 {
                return Err(Error::Unrepresentable("network name"));
            }
            ser.push(name.as_bytes())?;
            WpIe::SUB_NETNAME
        }
        WpIe::PanVersion(v) => {
            ser.serialize(*v)?;
            WpIe::SUB_PANVER
        }
        WpIe::GtkHash(hashes) => {
            let mut ser = ser;
            for h in hashes {
                ser = ser.serialize(*h)?;
            }
            WpIe::SUB_GTKHASH
        }
        WpIe::LgtkHash {
            active_index,
            hashes,
        } => {
            let mut present = 0u8;
            for (i, h) in hashes.iter().enumerate() {
                if h.is_some() {
                    present |= 1 << i;
                }
            }
            let mut ser = ser.serialize((active_index & 0x3) << 3 | present)?;
            for h in hashes.iter().flatten() {
                ser = ser.serialize(*h)?;
            }
            WpIe::SUB_LGTKHASH
        }
        WpIe::LfnVersion(v) => {
            ser.serialize(*v)?;
            WpIe::SUB_LFNVER
        }
    };
    let descriptor = if ie.is_long() {
        content.len() as u16 & 0x7ff | u16::from(sub_id) << 11 | 0x8000
    } else {
        content.len() as u16 & 0xff | u16::from(sub_id) << 8
    };
    Serializer::new(out).serialize(descriptor)?.push(&content)?;
    Ok(())
}

/// Wraps a set of payload IEs in the WP-IE descriptor
pub fn emit_wp_ies(ies: &[WpIe]) -> Result<Vec<u8>, Error> {
    let mut nested = Vec::new();
    for ie in ies {
        serialize_wpie(ie, &mut nested)?;
    }
    let descriptor = nested.len() as u16 & 0x7ff | u16::from(WISUN_WPIE_GID) << 11 | 0x8000;
    let mut out = Vec::new();
    Serializer::new(&mut out).serialize(descriptor)?.push(&nested)?;
    Ok(out)
}

/// Parses the nested IEs of every WP-IE found in `bytes`, skipping unknown
/// sub-IEs
pub fn parse_wp_ies(bytes: &[u8]) -> Result<Vec<WpIe>, Error> {
    let mut data = Deserializer::new(bytes);
    let mut out = Vec::new();
    while !data.is_empty() {
        let descriptor = data.deserialize::<u16>()?;
        let len = usize::from(descriptor & 0x7ff);
        let gid = ((descriptor >> 11) & 0xf) as u8;
        let content = data.advance(len)?;
        if descriptor & 0x8000 == 0 || gid != WISUN_WPIE_GID {
            continue;
        }
        parse_nested(content, &mut out)?;
    }
    Ok(out)
}

fn parse_nested(bytes: &[u8], out: &mut Vec<WpIe>) -> Result<(), Error> {
    let mut data = Deserializer::new(bytes);
    while !data.is_empty() {
        let descriptor = data.deserialize::<u16>()?;
        let (len, sub_id) = if descriptor & 0x8000 != 0 {
            (usize::from(descriptor & 0x7ff), ((descriptor >> 11) & 0xf) as u8)
        } else {
            (usize::from(descriptor & 0xff), ((descriptor >> 8) & 0x7f) as u8)
        };
        let long = descriptor & 0x8000 != 0;
        let mut content = Deserializer::new(data.advance(len)?);
        match (long, sub_id) {
            (true, WpIe::SUB_US) => out.push(WpIe::Us(deserialize_schedule(&mut content)?)),
            (true, WpIe::SUB_BS) => out.push(WpIe::Bs(BroadcastSchedule {
                interval: content.deserialize()?,
                bsi: content.deserialize()?,
                schedule: deserialize_schedule(&mut content)?,
            })),
            (false, WpIe::SUB_PAN) => {
                let pan_size = content.deserialize()?;
                let routing_cost = content.deserialize()?;
                let flags = content.deserialize::<u8>()?;
                out.push(WpIe::Pan {
                    pan_size,
                    routing_cost,
                    use_parent_bs: flags & 1 != 0,
                    routing_method: flags & 2 != 0,
                    fan_tps_version: (flags >> 5) & 0x7,
                });
            }
            (false, WpIe::SUB_NETNAME) => out.push(WpIe::NetName(
                String::from_utf8_lossy(content.rest()).into_owned(),
            )),
            (false, WpIe::SUB_PANVER) => out.push(WpIe::PanVersion(content.deserialize()?)),
            (false, WpIe::SUB_GTKHASH) => out.push(WpIe::GtkHash([
                content.deserialize()?,
                content.deserialize()?,
                content.deserialize()?,
                content.deserialize()?,
            ])),
            (false, WpIe::SUB_LGTKHASH) => {
                let control = content.deserialize::<u8>()?;
                let mut hashes = [None; 3];
                for (i, slot) in hashes.iter_mut().enumerate() {
                    if control & (1 << i) != 0 {
                        *slot = Some(content.deserialize()?);
                    }
                }
                out.push(WpIe::LgtkHash {
                    active_index: (control >> 3) & 0x3,
                    hashes,
                });
            }
            (false, WpIe::SUB_LFNVER) => out.push(WpIe::LfnVersion(content.deserialize()?)),
            (_, sub) => log::debug!("ie: skip payload sub-IE {sub}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schedule() -> Schedule {
        Schedule {
            dwell_interval: 255,
            clock_drift: 255,
            timing_accuracy: 10,
            plan: ChannelPlan::Explicit {
                base_khz: 863_100,
                spacing: 0,
                count: 69,
            },
            function: ChannelFunction::Dh1cf,
            excluded: ExcludedChannels::None,
        }
    }

    #[test]
    fn header_ie_roundtrip() {
        let ies = [
            HeaderIe::Utt {
                frame_type: FrameType::PanAdvert,
                ufsi: 0x00dead,
            },
            HeaderIe::Bt {
                slot: 12,
                interval_offset: 4321,
            },
        ];
        let mut buf = Vec::new();
        for ie in ies {
            Serializer::new(&mut buf).serialize(ie).unwrap();
        }
        assert_eq!(parse_header_ies(&buf).unwrap(), ies);
    }

    #[test]
    fn unknown_header_sub_ie_is_skipped() {
        let mut buf = Vec::new();
        Serializer::new(&mut buf)
            .serialize(HeaderIe::Utt {
                frame_type: FrameType::Data,
                ufsi: 7,
            })
            .unwrap();
        // Append a sub-IE 0x55 of 2 bytes under the Wi-SUN element ID
        let descriptor = 3u16 | u16::from(WISUN_HIE_ID) << 7;
        buf.extend_from_slice(&descriptor.to_le_bytes());
        buf.extend_from_slice(&[0x55, 0xaa, 0xbb]);
        assert_eq!(parse_header_ies(&buf).unwrap().len(), 1);
    }

    #[test]
    fn wp_ie_roundtrip() {
        let ies = vec![
            WpIe::Us(sample_schedule()),
            WpIe::Bs(BroadcastSchedule {
                interval: 1020,
                bsi: 0x1234,
                schedule: Schedule {
                    function: ChannelFunction::Fixed(11),
                    excluded: ExcludedChannels::Ranges(vec![(5, 8), (60, 68)]),
                    ..sample_schedule()
                },
            }),
            WpIe::Pan {
                pan_size: 200,
                routing_cost: 0,
                use_parent_bs: true,
                routing_method: true,
                fan_tps_version: 1,
            },
            WpIe::NetName("meter-field-7".into()),
            WpIe::PanVersion(3),
            WpIe::GtkHash([[1; 8], [2; 8], [0; 8], [0; 8]]),
            WpIe::LgtkHash {
                active_index: 1,
                hashes: [Some([3; 8]), Some([4; 8]), None],
            },
        ];
        let wire = emit_wp_ies(&ies).unwrap();
        assert_eq!(parse_wp_ies(&wire).unwrap(), ies);
    }

    #[test]
    fn excluded_mask_roundtrip() {
        let ies = vec![WpIe::Us(Schedule {
            excluded: ExcludedChannels::Mask(vec![0xff, 0x01]),
            ..sample_schedule()
        })];
        let wire = emit_wp_ies(&ies).unwrap();
        assert_eq!(parse_wp_ies(&wire).unwrap(), ies);
    }

    #[test]
    fn over_long_network_name_is_refused() {
        let name = "x".repeat(33);
        assert_eq!(
            emit_wp_ies(&[WpIe::NetName(name)]),
            Err(Error::Unrepresentable("network name"))
        );
    }
}
