//! Wire formats spoken by the border router.
//!
//! Every message that crosses a byte boundary lives here: the HDLC framing
//! and command codec of the RCP serial link, the Wi-SUN information
//! elements carried in MAC frames, EAPOL and the 802.11 key descriptor,
//! DHCPv6, the RPL control messages and the 6LoWPAN header compression
//! formats.
//!
//! # Parsing
//!
//! Owned structs implement [`util::Deserialize`] and are read out of a
//! [`util::Deserializer`] cursor over the received slice. A short or
//! malformed input produces the module's `Error`, never a panic.
//!
//! # Sending
//!
//! The same structs implement [`util::Serialize`] and append their bytes to
//! a [`util::Serializer`]. Serialization of a well-formed struct is
//! infallible except where a field genuinely cannot be represented (an
//! over-long blob, an out-of-range length), which surfaces as an `Error`.

pub mod dhcpv6;
pub mod eapol;
pub mod hdlc;
pub mod ie;
pub mod iphc;
pub mod ipv6;
pub mod mac154;
pub mod rcp;
pub mod rpl;
pub mod util;

mod error;
pub use error::Error;
