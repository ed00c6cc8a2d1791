//! RPL control messages (RFC 6550) and the source routing header
//! (RFC 6554).
//!
//! RPL control messages are ICMPv6 type 155; the code selects the message.
//! Only the shapes a non-storing root needs are implemented: DIS parsing,
//! DIO emission, DAO aggregation and DAO-ACK, plus the SRH installed on
//! downward traffic.

use std::net::Ipv6Addr;

use super::util::Deserializer;
use super::Error;

/// ICMPv6 type of every RPL control message
pub const ICMPV6_TYPE_RPL: u8 = 155;

/// Rank advertised when poisoning the DODAG
pub const INFINITE_RANK: u16 = 0xffff;

/// Mode of operation: non-storing
pub const MOP_NON_STORING: u8 = 1;

/// RPL control message codes
pub const CODE_DIS: u8 = 0x00;
pub const CODE_DIO: u8 = 0x01;
pub const CODE_DAO: u8 = 0x02;
pub const CODE_DAO_ACK: u8 = 0x03;

/// DIO base object
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +---------------+---------------+-------------------------------+
/// | RPLInstanceID |Version Number |             Rank              |
/// +---------------+---------------+-------------------------------+
/// |G|0| MOP | Prf |     DTSN      |     Flags     |   Reserved    |
/// +---------------+---------------+-------------------------------+
/// |                          DODAGID (128)                        |
/// +---------------------------------------------------------------+
/// ```
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Dio {
    pub instance_id: u8,
    pub version: u8,
    pub rank: u16,
    pub grounded: bool,
    pub mop: u8,
    pub preference: u8,
    pub dtsn: u8,
    pub dodag_id: Ipv6Addr,
    pub options: Vec<RplOption>,
}

/// DAO base object; `dodag_id` present when the D flag is set
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Dao {
    pub instance_id: u8,
    pub expect_ack: bool,
    pub sequence: u8,
    pub dodag_id: Option<Ipv6Addr>,
    pub options: Vec<RplOption>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DaoAck {
    pub instance_id: u8,
    pub sequence: u8,
    pub status: u8,
    pub dodag_id: Option<Ipv6Addr>,
}

/// RPL options carried by the control messages
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RplOption {
    DodagConfig {
        authenticated: bool,
        path_control_size: u8,
        interval_doublings: u8,
        interval_min: u8,
        redundancy: u8,
        max_rank_increase: u16,
        min_hop_rank_increase: u16,
        objective_code_point: u16,
        default_lifetime: u8,
        lifetime_unit: u16,
    },
    RouteInfo {
        prefix_len: u8,
        preference: u8,
        lifetime: u32,
        prefix: Ipv6Addr,
    },
    Target {
        prefix_len: u8,
        prefix: Ipv6Addr,
    },
    Transit {
        external: bool,
        path_control: u8,
        path_sequence: u8,
        /// Lifetime in lifetime units; 0 is a no-path (withdrawal)
        path_lifetime: u8,
        parent: Option<Ipv6Addr>,
    },
    PrefixInfo {
        prefix_len: u8,
        on_link: bool,
        autonomous: bool,
        router_address: bool,
        valid_lifetime: u32,
        preferred_lifetime: u32,
        prefix: Ipv6Addr,
    },
}

impl RplOption {
    const TYPE_ROUTE_INFO: u8 = 0x03;
    const TYPE_DODAG_CONFIG: u8 = 0x04;
    const TYPE_TARGET: u8 = 0x05;
    const TYPE_TRANSIT: u8 = 0x06;
    const TYPE_PREFIX_INFO: u8 = 0x08;

    fn emit(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        let option_type = match self {
            Self::DodagConfig {
                authenticated,
                path_control_size,
                interval_doublings,
                interval_min,
                redundancy,
                max_rank_increase,
                min_hop_rank_increase,
                objective_code_point,
                default_lifetime,
                lifetime_unit,
            } => {
                body.push(u8::from(*authenticated) << 3 | path_control_size & 0x7);
                body.push(*interval_doublings);
                body.push(*interval_min);
                body.push(*redundancy);
                body.extend_from_slice(&max_rank_increase.to_be_bytes());
                body.extend_from_slice(&min_hop_rank_increase.to_be_bytes());
                body.extend_from_slice(&objective_code_point.to_be_bytes());
                body.push(0);
                body.push(*default_lifetime);
                body.extend_from_slice(&lifetime_unit.to_be_bytes());
                Self::TYPE_DODAG_CONFIG
            }
            Self::RouteInfo {
                prefix_len,
                preference,
                lifetime,
                prefix,
            } => {
                body.push(*prefix_len);
                body.push((preference & 0x3) << 3);
                body.extend_from_slice(&lifetime.to_be_bytes());
                body.extend_from_slice(&prefix.octets()[..usize::from(prefix_len.div_ceil(8))]);
                Self::TYPE_ROUTE_INFO
            }
            Self::Target { prefix_len, prefix } => {
                body.push(0);
                body.push(*prefix_len);
                body.extend_from_slice(&prefix.octets()[..usize::from(prefix_len.div_ceil(8))]);
                Self::TYPE_TARGET
            }
            Self::Transit {
                external,
                path_control,
                path_sequence,
                path_lifetime,
                parent,
            } => {
                body.push(u8::from(*external) << 7);
                body.push(*path_control);
                body.push(*path_sequence);
                body.push(*path_lifetime);
                if let Some(parent) = parent {
                    body.extend_from_slice(&parent.octets());
                }
                Self::TYPE_TRANSIT
            }
            Self::PrefixInfo {
                prefix_len,
                on_link,
                autonomous,
                router_address,
                valid_lifetime,
                preferred_lifetime,
                prefix,
            } => {
                body.push(*prefix_len);
                body.push(
                    u8::from(*on_link) << 7
                        | u8::from(*autonomous) << 6
                        | u8::from(*router_address) << 5,
                );
                body.extend_from_slice(&valid_lifetime.to_be_bytes());
                body.extend_from_slice(&preferred_lifetime.to_be_bytes());
                body.extend_from_slice(&[0; 4]);
                body.extend_from_slice(&prefix.octets());
                Self::TYPE_PREFIX_INFO
            }
        };
        out.push(option_type);
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
    }

    fn parse_list(bytes: &[u8]) -> Result<Vec<Self>, Error> {
        let mut data = Deserializer::new(bytes);
        let mut out = Vec::new();
        while !data.is_empty() {
            let option_type = data.deserialize::<u8>()?;
            if option_type == 0 {
                continue; // Pad1
            }
            let len = usize::from(data.deserialize::<u8>()?);
            let mut body = Deserializer::new(data.advance(len)?);
            match option_type {
                0x01 => {} // PadN
                Self::TYPE_DODAG_CONFIG => {
                    let flags = body.deserialize::<u8>()?;
                    out.push(Self::DodagConfig {
                        authenticated: flags & 0x08 != 0,
                        path_control_size: flags & 0x7,
                        interval_doublings: body.deserialize()?,
                        interval_min: body.deserialize()?,
                        redundancy: body.deserialize()?,
                        max_rank_increase: u16::from_be_bytes(body.deserialize()?),
                        min_hop_rank_increase: u16::from_be_bytes(body.deserialize()?),
                        objective_code_point: u16::from_be_bytes(body.deserialize()?),
                        default_lifetime: {
                            body.skip(1)?;
                            body.deserialize()?
                        },
                        lifetime_unit: u16::from_be_bytes(body.deserialize()?),
                    });
                }
                Self::TYPE_ROUTE_INFO => {
                    let prefix_len = body.deserialize::<u8>()?;
                    let flags = body.deserialize::<u8>()?;
                    let lifetime = u32::from_be_bytes(body.deserialize()?);
                    out.push(Self::RouteInfo {
                        prefix_len,
                        preference: (flags >> 3) & 0x3,
                        lifetime,
                        prefix: parse_prefix(&mut body, prefix_len)?,
                    });
                }
                Self::TYPE_TARGET => {
                    body.skip(1)?;
                    let prefix_len = body.deserialize::<u8>()?;
                    out.push(Self::Target {
                        prefix_len,
                        prefix: parse_prefix(&mut body, prefix_len)?,
                    });
                }
                Self::TYPE_TRANSIT => {
                    let flags = body.deserialize::<u8>()?;
                    out.push(Self::Transit {
                        external: flags & 0x80 != 0,
                        path_control: body.deserialize()?,
                        path_sequence: body.deserialize()?,
                        path_lifetime: body.deserialize()?,
                        parent: if body.remaining() >= 16 {
                            Some(body.deserialize()?)
                        } else {
                            None
                        },
                    });
                }
                Self::TYPE_PREFIX_INFO => {
                    let prefix_len = body.deserialize::<u8>()?;
                    let flags = body.deserialize::<u8>()?;
                    out.push(Self::PrefixInfo {
                        prefix_len,
                        on_link: flags & 0x80 != 0,
                        autonomous: flags & 0x40 != 0,
                        router_address: flags & 0x20 != 0,
                        valid_lifetime: u32::from_be_bytes(body.deserialize()?),
                        preferred_lifetime: u32::from_be_bytes(body.deserialize()?),
                        prefix: {
                            body.skip(4)?;
                            body.deserialize()?
                        },
                    });
                }
                t => log::debug!("rpl: skip option {t}"),
            }
        }
        Ok(out)
    }
}

fn parse_prefix(body: &mut Deserializer<'_>, prefix_len: u8) -> Result<Ipv6Addr, Error> {
    if prefix_len > 128 {
        return Err(Error::InvalidLength(prefix_len.into()));
    }
    let bytes = body.advance(usize::from(prefix_len.div_ceil(8)))?;
    let mut octets = [0u8; 16];
    octets[..bytes.len()].copy_from_slice(bytes);
    Ok(octets.into())
}

/// A decoded RPL control message (the ICMPv6 body)
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RplMessage {
    Dis,
    Dio(Dio),
    Dao(Dao),
    DaoAck(DaoAck),
}

impl RplMessage {
    /// Emits the ICMPv6 code and body
    pub fn emit(&self) -> (u8, Vec<u8>) {
        let mut out = Vec::new();
        match self {
            Self::Dis => {
                out.extend_from_slice(&[0, 0]);
                (CODE_DIS, out)
            }
            Self::Dio(dio) => {
                out.push(dio.instance_id);
                out.push(dio.version);
                out.extend_from_slice(&dio.rank.to_be_bytes());
                out.push(
                    u8::from(dio.grounded) << 7 | (dio.mop & 0x7) << 3 | dio.preference & 0x7,
                );
                out.push(dio.dtsn);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&dio.dodag_id.octets());
                for opt in &dio.options {
                    opt.emit(&mut out);
                }
                (CODE_DIO, out)
            }
            Self::Dao(dao) => {
                out.push(dao.instance_id);
                out.push(
                    u8::from(dao.expect_ack) << 7 | u8::from(dao.dodag_id.is_some()) << 6,
                );
                out.push(0);
                out.push(dao.sequence);
                if let Some(id) = dao.dodag_id {
                    out.extend_from_slice(&id.octets());
                }
                for opt in &dao.options {
                    opt.emit(&mut out);
                }
                (CODE_DAO, out)
            }
            Self::DaoAck(ack) => {
                out.push(ack.instance_id);
                out.push(u8::from(ack.dodag_id.is_some()) << 7);
                out.push(ack.sequence);
                out.push(ack.status);
                if let Some(id) = ack.dodag_id {
                    out.extend_from_slice(&id.octets());
                }
                (CODE_DAO_ACK, out)
            }
        }
    }

    /// Parses the ICMPv6 body for the given code
    pub fn parse(code: u8, bytes: &[u8]) -> Result<Self, Error> {
        let mut data = Deserializer::new(bytes);
        match code {
            CODE_DIS => Ok(Self::Dis),
            CODE_DIO => {
                let instance_id = data.deserialize()?;
                let version = data.deserialize()?;
                let rank = u16::from_be_bytes(data.deserialize()?);
                let flags = data.deserialize::<u8>()?;
                let dtsn = data.deserialize()?;
                data.skip(2)?;
                Ok(Self::Dio(Dio {
                    instance_id,
                    version,
                    rank,
                    grounded: flags & 0x80 != 0,
                    mop: (flags >> 3) & 0x7,
                    preference: flags & 0x7,
                    dtsn,
                    dodag_id: data.deserialize()?,
                    options: RplOption::parse_list(data.rest())?,
                }))
            }
            CODE_DAO => {
                let instance_id = data.deserialize()?;
                let flags = data.deserialize::<u8>()?;
                data.skip(1)?;
                let sequence = data.deserialize()?;
                let dodag_id = if flags & 0x40 != 0 {
                    Some(data.deserialize()?)
                } else {
                    None
                };
                Ok(Self::Dao(Dao {
                    instance_id,
                    expect_ack: flags & 0x80 != 0,
                    sequence,
                    dodag_id,
                    options: RplOption::parse_list(data.rest())?,
                }))
            }
            CODE_DAO_ACK => {
                let instance_id = data.deserialize()?;
                let flags = data.deserialize::<u8>()?;
                let sequence = data.deserialize()?;
                let status = data.deserialize()?;
                let dodag_id = if flags & 0x80 != 0 {
                    Some(data.deserialize()?)
                } else {
                    None
                };
                Ok(Self::DaoAck(DaoAck {
                    instance_id,
                    sequence,
                    status,
                    dodag_id,
                }))
            }
            c => Err(Error::UnknownValue("RPL message code", c.into())),
        }
    }
}

/// RFC 6554 source routing header (routing type 3).
///
/// Hops share their leading octets with the final destination; the common
/// part is elided with `CmprI`/`CmprE`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SourceRouteHeader {
    pub next_header: u8,
    pub segments_left: u8,
    /// Intermediate hops, first hop first; the final destination stays in
    /// the IPv6 destination field
    pub hops: Vec<Ipv6Addr>,
}

impl SourceRouteHeader {
    pub const ROUTING_TYPE: u8 = 3;

    /// Emits the header, compressing against `destination`
    pub fn emit(&self, destination: &Ipv6Addr) -> Vec<u8> {
        let dst = destination.octets();
        let cmpr = self
            .hops
            .iter()
            .map(|h| {
                h.octets()
                    .iter()
                    .zip(dst.iter())
                    .take_while(|(a, b)| a == b)
                    .count()
                    .min(15)
            })
            .min()
            .unwrap_or(0) as u8;
        let elided = usize::from(cmpr);
        let addr_bytes: usize = self.hops.len() * (16 - elided);
        // Length unit is 8 octets, excluding the first 8
        let pad = (8 - addr_bytes % 8) % 8;
        let hdr_ext_len = ((addr_bytes + pad) / 8) as u8;

        let mut out = Vec::with_capacity(8 + addr_bytes + pad);
        out.push(self.next_header);
        out.push(hdr_ext_len);
        out.push(Self::ROUTING_TYPE);
        out.push(self.segments_left);
        out.push(cmpr << 4 | cmpr);
        out.push((pad as u8) << 4);
        out.extend_from_slice(&[0, 0]);
        for hop in &self.hops {
            out.extend_from_slice(&hop.octets()[elided..]);
        }
        out.resize(out.len() + pad, 0);
        out
    }

    /// Parses the header, expanding elided octets from `destination`
    pub fn parse(bytes: &[u8], destination: &Ipv6Addr) -> Result<(Self, usize), Error> {
        let mut data = Deserializer::new(bytes);
        let next_header = data.deserialize()?;
        let hdr_ext_len = usize::from(data.deserialize::<u8>()?);
        let routing_type = data.deserialize::<u8>()?;
        if routing_type != Self::ROUTING_TYPE {
            return Err(Error::UnknownValue("routing type", routing_type.into()));
        }
        let segments_left = data.deserialize()?;
        let cmpr = data.deserialize::<u8>()?;
        let cmpr_i = usize::from(cmpr >> 4);
        let pad = usize::from(data.deserialize::<u8>()? >> 4);
        data.skip(2)?;
        let total = 8 + hdr_ext_len * 8;
        let addr_area = total - 8 - pad;
        let per_hop = 16 - cmpr_i;
        if per_hop == 0 || addr_area % per_hop != 0 {
            return Err(Error::InvalidLength(addr_area));
        }
        let mut hops = Vec::with_capacity(addr_area / per_hop);
        let dst = destination.octets();
        for _ in 0..addr_area / per_hop {
            let tail = data.advance(per_hop)?;
            let mut octets = dst;
            octets[cmpr_i..].copy_from_slice(tail);
            hops.push(octets.into());
        }
        data.skip(pad)?;
        Ok((
            Self {
                next_header,
                segments_left,
                hops,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tail: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfd12, 0x3456, 0, 0, 0, 0, 0, tail)
    }

    #[test]
    fn dio_roundtrip() {
        let dio = Dio {
            instance_id: 1,
            version: 240,
            rank: 128,
            grounded: true,
            mop: MOP_NON_STORING,
            preference: 0,
            dtsn: 3,
            dodag_id: addr(1),
            options: vec![
                RplOption::DodagConfig {
                    authenticated: false,
                    path_control_size: 0,
                    interval_doublings: 8,
                    interval_min: 12,
                    redundancy: 10,
                    max_rank_increase: 2048,
                    min_hop_rank_increase: 128,
                    objective_code_point: 1,
                    default_lifetime: 120,
                    lifetime_unit: 60,
                },
                RplOption::PrefixInfo {
                    prefix_len: 64,
                    on_link: false,
                    autonomous: true,
                    router_address: true,
                    valid_lifetime: 7200,
                    preferred_lifetime: 3600,
                    prefix: addr(0),
                },
            ],
        };
        let (code, wire) = RplMessage::Dio(dio.clone()).emit();
        assert_eq!(RplMessage::parse(code, &wire).unwrap(), RplMessage::Dio(dio));
    }

    #[test]
    fn dao_roundtrip() {
        let dao = Dao {
            instance_id: 1,
            expect_ack: true,
            sequence: 9,
            dodag_id: Some(addr(1)),
            options: vec![
                RplOption::Target {
                    prefix_len: 128,
                    prefix: addr(0x0a),
                },
                RplOption::Transit {
                    external: false,
                    path_control: 0,
                    path_sequence: 1,
                    path_lifetime: 30,
                    parent: Some(addr(0x0b)),
                },
            ],
        };
        let (code, wire) = RplMessage::Dao(dao.clone()).emit();
        assert_eq!(RplMessage::parse(code, &wire).unwrap(), RplMessage::Dao(dao));
    }

    #[test]
    fn target_prefix_is_truncated_on_the_wire() {
        let dao = Dao {
            instance_id: 1,
            expect_ack: false,
            sequence: 0,
            dodag_id: None,
            options: vec![RplOption::Target {
                prefix_len: 64,
                prefix: addr(0),
            }],
        };
        let (_, wire) = RplMessage::Dao(dao).emit();
        // base (4) + option header (2) + flags/len (2) + 8 prefix octets
        assert_eq!(wire.len(), 4 + 2 + 2 + 8);
    }

    #[test]
    fn srh_roundtrip() {
        let srh = SourceRouteHeader {
            next_header: 17,
            segments_left: 2,
            hops: vec![addr(0x0b), addr(0x0a)],
        };
        let dst = addr(0x0c);
        let wire = srh.emit(&dst);
        // 15 common octets elided from every hop, padded back to 8-octet units
        assert_eq!(wire.len(), 8 + 2 * 1 + 6);
        let (parsed, consumed) = SourceRouteHeader::parse(&wire, &dst).unwrap();
        assert_eq!(parsed, srh);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn srh_uncompressible_hops() {
        let srh = SourceRouteHeader {
            next_header: 58,
            segments_left: 1,
            hops: vec!["fe80::1".parse().unwrap()],
        };
        let dst = addr(1);
        let (parsed, _) = SourceRouteHeader::parse(&srh.emit(&dst), &dst).unwrap();
        assert_eq!(parsed, srh);
    }
}
