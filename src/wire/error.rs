use core::fmt;

/// Errors returned by the wire (de)serialization functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The input ended before the required amount of data
    ///
    /// The first value is the number of bytes available, the second the
    /// number of bytes needed
    Truncated(usize, usize),
    /// A variable-length unsigned integer did not terminate within its
    /// maximum width
    UnterminatedUint,
    /// A length field does not fit the data it describes
    InvalidLength(usize),
    /// An enumerated field holds a value outside its known set
    ///
    /// The first value names the field, the second is the raw value
    UnknownValue(&'static str, u32),
    /// The frame check sequence did not match the received bytes
    BadChecksum,
    /// The value cannot be represented on the wire
    Unrepresentable(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Truncated(have, need) => write!(f, "input truncated: {have} bytes left, {need} needed"),
            UnterminatedUint => write!(f, "unterminated variable-length integer"),
            InvalidLength(l) => write!(f, "invalid length field {l}"),
            UnknownValue(what, v) => write!(f, "unknown {what} value {v}"),
            BadChecksum => write!(f, "frame check sequence mismatch"),
            Unrepresentable(what) => write!(f, "{what} cannot be represented on the wire"),
        }
    }
}
