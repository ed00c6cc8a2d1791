//! DHCPv6 message codec (server and relay subset).
//!
//! ```plain
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +---------------+-------------------------------+
//! |   msg-type    |        transaction-id         |     client/server
//! +---------------+-------------------------------+
//! |            options ...
//! +---------------------------------------------
//!
//! +---------------+---------------+
//! |   msg-type    |   hop-count   |                     relay agent
//! +---------------+---------------+------------+
//! |          link-address (128 bits)           |
//! +--------------------------------------------+
//! |          peer-address (128 bits)           |
//! +--------------------------------------------+
//! |            options ...
//! +---------------------------------------------
//! ```
//!
//! All fields are big-endian. Unknown options are skipped with a debug
//! log; they never fail the message.

use std::net::Ipv6Addr;

use super::util::Deserializer;
use super::Error;
use crate::Eui64;

pub const SERVER_PORT: u16 = 547;
pub const CLIENT_PORT: u16 = 546;

/// All_DHCP_Relay_Agents_and_Servers (ff02::1:2)
pub const ALL_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// Status codes used by the server
pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_NO_ADDRS_AVAIL: u16 = 2;

/// DHCP unique identifier in its link-layer form (DUID-LL over an EUI-64)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Duid {
    /// IANA hardware type; 27 = EUI-64
    pub hw_type: u16,
    pub eui64: Eui64,
}

impl Duid {
    pub const TYPE_LL: u16 = 3;
    pub const HW_EUI64: u16 = 27;

    pub fn new(eui64: Eui64) -> Self {
        Self {
            hw_type: Self::HW_EUI64,
            eui64,
        }
    }
}

/// Message types handled by the server/relay
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MsgType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Renew = 5,
    Reply = 7,
    Release = 8,
    RelayForw = 12,
    RelayReply = 13,
}

impl MsgType {
    fn from_raw(raw: u8) -> Option<Self> {
        use MsgType::*;
        Some(match raw {
            1 => Solicit,
            2 => Advertise,
            3 => Request,
            5 => Renew,
            7 => Reply,
            8 => Release,
            12 => RelayForw,
            13 => RelayReply,
            _ => return None,
        })
    }
}

/// DHCPv6 options the engine understands
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DhcpOption {
    ClientId(Duid),
    ServerId(Duid),
    IaNa {
        iaid: u32,
        t1: u32,
        t2: u32,
        options: Vec<DhcpOption>,
    },
    IaAddr {
        addr: Ipv6Addr,
        preferred: u32,
        valid: u32,
    },
    StatusCode {
        code: u16,
        message: String,
    },
    RapidCommit,
    ElapsedTime(u16),
    InterfaceId(Vec<u8>),
    /// Nested message carried by a relay, kept raw
    RelayMsg(Vec<u8>),
}

impl DhcpOption {
    const CLIENT_ID: u16 = 1;
    const SERVER_ID: u16 = 2;
    const IA_NA: u16 = 3;
    const IA_ADDR: u16 = 5;
    const RELAY_MSG: u16 = 9;
    const STATUS_CODE: u16 = 13;
    const RAPID_COMMIT: u16 = 14;
    const ELAPSED_TIME: u16 = 8;
    const INTERFACE_ID: u16 = 18;

    fn emit(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        let code = match self {
            Self::ClientId(duid) | Self::ServerId(duid) => {
                body.extend_from_slice(&Duid::TYPE_LL.to_be_bytes());
                body.extend_from_slice(&duid.hw_type.to_be_bytes());
                body.extend_from_slice(&duid.eui64.0);
                match self {
                    Self::ClientId(_) => Self::CLIENT_ID,
                    _ => Self::SERVER_ID,
                }
            }
            Self::IaNa {
                iaid,
                t1,
                t2,
                options,
            } => {
                body.extend_from_slice(&iaid.to_be_bytes());
                body.extend_from_slice(&t1.to_be_bytes());
                body.extend_from_slice(&t2.to_be_bytes());
                for opt in options {
                    opt.emit(&mut body);
                }
                Self::IA_NA
            }
            Self::IaAddr {
                addr,
                preferred,
                valid,
            } => {
                body.extend_from_slice(&addr.octets());
                body.extend_from_slice(&preferred.to_be_bytes());
                body.extend_from_slice(&valid.to_be_bytes());
                Self::IA_ADDR
            }
            Self::StatusCode { code, message } => {
                body.extend_from_slice(&code.to_be_bytes());
                body.extend_from_slice(message.as_bytes());
                Self::STATUS_CODE
            }
            Self::RapidCommit => Self::RAPID_COMMIT,
            Self::ElapsedTime(t) => {
                body.extend_from_slice(&t.to_be_bytes());
                Self::ELAPSED_TIME
            }
            Self::InterfaceId(id) => {
                body.extend_from_slice(id);
                Self::INTERFACE_ID
            }
            Self::RelayMsg(msg) => {
                body.extend_from_slice(msg);
                Self::RELAY_MSG
            }
        };
        out.extend_from_slice(&code.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
    }

    fn parse_list(bytes: &[u8]) -> Result<Vec<Self>, Error> {
        let mut data = Deserializer::new(bytes);
        let mut out = Vec::new();
        while !data.is_empty() {
            let code = u16::from_be_bytes(data.deserialize()?);
            let len = usize::from(u16::from_be_bytes(data.deserialize()?));
            let mut body = Deserializer::new(data.advance(len)?);
            match code {
                Self::CLIENT_ID | Self::SERVER_ID => {
                    let duid_type = u16::from_be_bytes(body.deserialize()?);
                    if duid_type != Duid::TYPE_LL {
                        log::debug!("dhcpv6: skip DUID type {duid_type}");
                        continue;
                    }
                    let duid = Duid {
                        hw_type: u16::from_be_bytes(body.deserialize()?),
                        eui64: body.deserialize()?,
                    };
                    out.push(match code {
                        Self::CLIENT_ID => Self::ClientId(duid),
                        _ => Self::ServerId(duid),
                    });
                }
                Self::IA_NA => out.push(Self::IaNa {
                    iaid: u32::from_be_bytes(body.deserialize()?),
                    t1: u32::from_be_bytes(body.deserialize()?),
                    t2: u32::from_be_bytes(body.deserialize()?),
                    options: Self::parse_list(body.rest())?,
                }),
                Self::IA_ADDR => out.push(Self::IaAddr {
                    addr: body.deserialize()?,
                    preferred: u32::from_be_bytes(body.deserialize()?),
                    valid: u32::from_be_bytes(body.deserialize()?),
                }),
                Self::STATUS_CODE => out.push(Self::StatusCode {
                    code: u16::from_be_bytes(body.deserialize()?),
                    message: String::from_utf8_lossy(body.rest()).into_owned(),
                }),
                Self::RAPID_COMMIT => out.push(Self::RapidCommit),
                Self::ELAPSED_TIME => {
                    out.push(Self::ElapsedTime(u16::from_be_bytes(body.deserialize()?)))
                }
                Self::INTERFACE_ID => out.push(Self::InterfaceId(body.rest().to_vec())),
                Self::RELAY_MSG => out.push(Self::RelayMsg(body.rest().to_vec())),
                _ => log::debug!("dhcpv6: skip option {code}"),
            }
        }
        Ok(out)
    }
}

/// A client/server message or a relay wrapper
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Packet {
    Message {
        msg_type: MsgType,
        /// 24-bit transaction identifier
        transaction_id: u32,
        options: Vec<DhcpOption>,
    },
    Relay {
        msg_type: MsgType,
        hop_count: u8,
        link_address: Ipv6Addr,
        peer_address: Ipv6Addr,
        options: Vec<DhcpOption>,
    },
}

impl Packet {
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Message {
                msg_type,
                transaction_id,
                options,
            } => {
                let tid = transaction_id.to_be_bytes();
                out.push(*msg_type as u8);
                out.extend_from_slice(&tid[1..]);
                for opt in options {
                    opt.emit(&mut out);
                }
            }
            Self::Relay {
                msg_type,
                hop_count,
                link_address,
                peer_address,
                options,
            } => {
                out.push(*msg_type as u8);
                out.push(*hop_count);
                out.extend_from_slice(&link_address.octets());
                out.extend_from_slice(&peer_address.octets());
                for opt in options {
                    opt.emit(&mut out);
                }
            }
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut data = Deserializer::new(bytes);
        let raw = data.deserialize::<u8>()?;
        let msg_type =
            MsgType::from_raw(raw).ok_or(Error::UnknownValue("DHCPv6 message type", raw.into()))?;
        match msg_type {
            MsgType::RelayForw | MsgType::RelayReply => Ok(Self::Relay {
                msg_type,
                hop_count: data.deserialize()?,
                link_address: data.deserialize()?,
                peer_address: data.deserialize()?,
                options: DhcpOption::parse_list(data.rest())?,
            }),
            _ => {
                let tid: [u8; 3] = data.deserialize()?;
                Ok(Self::Message {
                    msg_type,
                    transaction_id: u32::from_be_bytes([0, tid[0], tid[1], tid[2]]),
                    options: DhcpOption::parse_list(data.rest())?,
                })
            }
        }
    }

    /// Finds the client DUID in the top-level options
    pub fn client_duid(&self) -> Option<Duid> {
        self.options().iter().find_map(|o| match o {
            DhcpOption::ClientId(duid) => Some(*duid),
            _ => None,
        })
    }

    /// Finds the first IA_NA in the top-level options
    pub fn ia_na(&self) -> Option<(u32, &[DhcpOption])> {
        self.options().iter().find_map(|o| match o {
            DhcpOption::IaNa { iaid, options, .. } => Some((*iaid, options.as_slice())),
            _ => None,
        })
    }

    pub fn options(&self) -> &[DhcpOption] {
        match self {
            Self::Message { options, .. } | Self::Relay { options, .. } => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eui() -> Eui64 {
        Eui64([0x0c, 0x5b, 0xa0, 0x11, 0x22, 0x33, 0x44, 0x55])
    }

    #[test]
    fn solicit_roundtrip() {
        let packet = Packet::Message {
            msg_type: MsgType::Solicit,
            transaction_id: 0x00a1b2c3,
            options: vec![
                DhcpOption::ClientId(Duid::new(eui())),
                DhcpOption::ElapsedTime(0),
                DhcpOption::IaNa {
                    iaid: 1,
                    t1: 0,
                    t2: 0,
                    options: vec![],
                },
                DhcpOption::RapidCommit,
            ],
        };
        assert_eq!(Packet::parse(&packet.emit()).unwrap(), packet);
    }

    #[test]
    fn reply_with_address_roundtrip() {
        let packet = Packet::Message {
            msg_type: MsgType::Reply,
            transaction_id: 7,
            options: vec![
                DhcpOption::ServerId(Duid::new(eui())),
                DhcpOption::IaNa {
                    iaid: 1,
                    t1: 1800,
                    t2: 2880,
                    options: vec![DhcpOption::IaAddr {
                        addr: "2001:db8::1".parse().unwrap(),
                        preferred: 3600,
                        valid: 3600,
                    }],
                },
            ],
        };
        assert_eq!(Packet::parse(&packet.emit()).unwrap(), packet);
    }

    #[test]
    fn relay_roundtrip() {
        let inner = Packet::Message {
            msg_type: MsgType::Solicit,
            transaction_id: 3,
            options: vec![DhcpOption::ClientId(Duid::new(eui()))],
        };
        let relay = Packet::Relay {
            msg_type: MsgType::RelayForw,
            hop_count: 0,
            link_address: "fe80::1".parse().unwrap(),
            peer_address: "fe80::2".parse().unwrap(),
            options: vec![
                DhcpOption::InterfaceId(b"mesh0".to_vec()),
                DhcpOption::RelayMsg(inner.emit()),
            ],
        };
        let parsed = Packet::parse(&relay.emit()).unwrap();
        assert_eq!(parsed, relay);
        let Packet::Relay { options, .. } = parsed else {
            unreachable!()
        };
        let nested = options
            .iter()
            .find_map(|o| match o {
                DhcpOption::RelayMsg(m) => Some(Packet::parse(m).unwrap()),
                _ => None,
            })
            .unwrap();
        assert_eq!(nested, inner);
    }

    #[test]
    fn unknown_option_is_skipped() {
        let mut wire = Packet::Message {
            msg_type: MsgType::Solicit,
            transaction_id: 1,
            options: vec![DhcpOption::RapidCommit],
        }
        .emit();
        // Option 200, 2 bytes
        wire.extend_from_slice(&[0, 200, 0, 2, 0xaa, 0xbb]);
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.options(), &[DhcpOption::RapidCommit]);
    }
}
