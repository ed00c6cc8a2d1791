//! A Wi-SUN FAN border router protocol engine written in Rust.
//!
//! The border router bridges an IEEE 802.15.4 Sub-GHz mesh, operated by a
//! Radio Co-Processor (RCP) on a serial link, to an IPv6 backbone behind a
//! TUN device. It owns the PAN identity, drives the frequency-hopping
//! schedule, authenticates joining nodes over EAP-TLS, distributes and
//! rotates the group keys, roots the RPL topology and serves DHCPv6
//! addresses to the mesh.
//!
//! # Getting Started
//!
//! The engine never opens devices itself: the serial link to the RCP, the
//! TUN device and the operator bus are byte pipes handed over at startup.
//! Start the engine and keep the [`Handle`] it returns:
//!
//! ```no_run
//! use wsbr::{Config, Engine};
//!
//! # async fn run(pipes: wsbr::EnginePipes) {
//! let config = Config::default();
//! let handle = Engine::start(config, pipes).expect("valid configuration");
//! // Bring the FAN up and watch it form
//! handle.start_fan().await.unwrap();
//! # }
//! ```
//!
//! The [`Handle`] exposes the operator surface: network properties, the
//! node table, group-key material, key revocation and the FHSS and timing
//! knobs. Everything else happens inside the engine's single-threaded
//! event loop.

use core::fmt;

mod buffer;
mod config;
mod dhcp;
mod engine;
mod event;
mod fhss;
mod handle;
mod lowpan;
mod mac;
mod mngt;
mod neighbor;
mod rcp;
mod rpl;
mod status;
mod storage;
mod timers;
mod trickle;

pub mod auth;
pub mod wire;

pub use buffer::Buffer;
pub use config::{Config, WisunSize};
pub use engine::{Engine, EnginePipes, MulticastCtl};
pub use event::{Event, Priority};
pub use handle::{Handle, HandleError, NodeInfo, PropertyChanged};
pub use mac::TxPriority;
pub use neighbor::NodeRole;
pub use status::Status;
pub use storage::Storage;

/// A 64-bit IEEE EUI-64 device identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub const BROADCAST: Self = Self([0xff; 8]);

    /// The modified EUI-64 interface identifier (RFC 4291, U/L bit flipped)
    pub fn iid(&self) -> [u8; 8] {
        let mut iid = self.0;
        iid[0] ^= 0x02;
        iid
    }

    /// Builds the link-local address derived from this identifier
    pub fn link_local(&self) -> std::net::Ipv6Addr {
        let mut octets = [0; 16];
        octets[0] = 0xfe;
        octets[1] = 0x80;
        octets[8..].copy_from_slice(&self.iid());
        octets.into()
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl fmt::Debug for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An IEEE 802.15.4 MAC address in either of its two widths
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MacAddr {
    /// 16-bit short address
    Short(u16),
    /// 64-bit extended address
    Ext(Eui64),
}

impl MacAddr {
    /// The 16-bit broadcast address
    pub const BROADCAST: Self = Self::Short(0xffff);

    /// Short address value meaning "no short address allocated"
    pub const SHORT_NONE: u16 = 0xfffe;

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Short(0xffff))
    }
}

impl From<Eui64> for MacAddr {
    fn from(eui64: Eui64) -> Self {
        Self::Ext(eui64)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Short(addr) => write!(f, "{addr:04x}"),
            Self::Ext(eui64) => write!(f, "{eui64}"),
        }
    }
}
