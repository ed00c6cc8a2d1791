use std::net::Ipv6Addr;

use super::Error::{self, Truncated, UnterminatedUint};
use crate::Eui64;

pub type Result<T> = core::result::Result<T, Error>;

/// Reading cursor over a received byte slice
#[repr(transparent)]
pub struct Deserializer<'a>(&'a [u8]);

impl<'a> Deserializer<'a> {
    pub fn new(s: &'a [u8]) -> Self {
        Self(s)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.0.len()
    }

    pub fn skip(&mut self, by: usize) -> Result<&mut Self> {
        self.advance(by)?;
        Ok(self)
    }

    pub fn advance(&mut self, by: usize) -> Result<&'a [u8]> {
        if self.0.len() < by {
            return Err(Truncated(self.0.len(), by));
        }
        let (l, r) = self.0.split_at(by);
        self.0 = r;
        Ok(l)
    }

    /// Takes all the remaining bytes out of the cursor
    pub fn rest(&mut self) -> &'a [u8] {
        let r = self.0;
        self.0 = &[];
        r
    }

    /// Reads a variable-length unsigned integer: 7 bits per byte,
    /// least-significant group first, bit 7 set on every byte but the last
    pub fn pop_uint(&mut self) -> Result<u32> {
        let mut val: u32 = 0;
        for shift in (0..32).step_by(7) {
            let byte = self.deserialize::<u8>()?;
            val |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(val);
            }
        }
        Err(UnterminatedUint)
    }

    /// Reads a blob prefixed by its `u16` little-endian length
    pub fn pop_data(&mut self) -> Result<&'a [u8]> {
        let len = u16::from_le_bytes(self.deserialize()?);
        self.advance(usize::from(len))
    }

    pub fn deserialize<T: Deserialize>(&mut self) -> Result<T> {
        T::deserialize(self)
    }
}

pub trait Deserialize: Sized {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self>;
}

impl Deserialize for () {
    fn deserialize(_data: &mut Deserializer<'_>) -> Result<Self> {
        Ok(())
    }
}

impl<const S: usize> Deserialize for [u8; S] {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.advance(S).map(Self::try_from).map(|r| r.unwrap())
    }
}

impl Deserialize for bool {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        Ok(data.advance(1)?[0] != 0)
    }
}

impl Deserialize for u8 {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        Ok(data.advance(1)?[0])
    }
}

impl Deserialize for i8 {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.deserialize::<u8>().map(|v| v as i8)
    }
}

impl Deserialize for u16 {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.deserialize().map(u16::from_le_bytes)
    }
}

impl Deserialize for i16 {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.deserialize().map(i16::from_le_bytes)
    }
}

impl Deserialize for u32 {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.deserialize().map(u32::from_le_bytes)
    }
}

impl Deserialize for i32 {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.deserialize().map(i32::from_le_bytes)
    }
}

impl Deserialize for Eui64 {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.deserialize().map(Eui64)
    }
}

impl Deserialize for Ipv6Addr {
    fn deserialize(data: &mut Deserializer<'_>) -> Result<Self> {
        data.deserialize().map(<[u8; 16]>::into)
    }
}

/// Writing cursor appending to an owned byte vector
#[repr(transparent)]
pub struct Serializer<'a>(&'a mut Vec<u8>);

impl<'a> Serializer<'a> {
    pub fn new(vec: &'a mut Vec<u8>) -> Self {
        Self(vec)
    }

    pub fn push(self, data: &[u8]) -> Result<Self> {
        self.0.extend_from_slice(data);
        Ok(self)
    }

    /// Writes a variable-length unsigned integer (see
    /// [`Deserializer::pop_uint`])
    pub fn push_uint(self, mut val: u32) -> Result<Self> {
        let mut this = self;
        while val >= 0x80 {
            this = this.serialize((val & 0x7f) as u8 | 0x80)?;
            val >>= 7;
        }
        this.serialize(val as u8)
    }

    /// Writes a blob prefixed by its `u16` little-endian length
    pub fn push_data(self, data: &[u8]) -> Result<Self> {
        let len = u16::try_from(data.len()).map_err(|_| Error::Unrepresentable("blob length"))?;
        self.serialize(len)?.push(data)
    }

    pub fn serialize<T: Serialize>(self, v: T) -> Result<Self> {
        v.serialize(self)
    }
}

pub trait Serialize {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>>;
}

impl<T: Copy + Serialize> Serialize for &T {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        T::serialize(*self, buffer)
    }
}

impl Serialize for () {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        Ok(buffer)
    }
}

impl Serialize for &[u8] {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.push(self)
    }
}

impl<const SIZE: usize> Serialize for [u8; SIZE] {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.push(&self)
    }
}

impl Serialize for bool {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(u8::from(self))
    }
}

impl Serialize for u8 {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.push(&[self])
    }
}

impl Serialize for i8 {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(self as u8)
    }
}

impl Serialize for u16 {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(self.to_le_bytes())
    }
}

impl Serialize for i16 {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(self.to_le_bytes())
    }
}

impl Serialize for u32 {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(self.to_le_bytes())
    }
}

impl Serialize for i32 {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(self.to_le_bytes())
    }
}

impl Serialize for Eui64 {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(self.0)
    }
}

impl Serialize for Ipv6Addr {
    fn serialize<'a>(self, buffer: Serializer<'a>) -> Result<Serializer<'a>> {
        buffer.serialize(self.octets())
    }
}

/// Serializes `v` into a fresh vector
pub fn to_vec<T: Serialize>(v: T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    Serializer::new(&mut out).serialize(v)?;
    Ok(out)
}

/// Deserializes a `T` from the whole of `s`, tolerating trailing bytes
pub fn from_slice<T: Deserialize>(s: &[u8]) -> Result<T> {
    T::deserialize(&mut Deserializer::new(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_boundaries() {
        for val in [0u32, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x1f_ffff, u32::MAX] {
            let mut buf = Vec::new();
            Serializer::new(&mut buf).push_uint(val).unwrap();
            let mut de = Deserializer::new(&buf);
            assert_eq!(de.pop_uint().unwrap(), val);
            assert!(de.is_empty());
        }
        // Single-byte values stay single-byte, the RCP relies on it
        let mut buf = Vec::new();
        Serializer::new(&mut buf).push_uint(0x7f).unwrap();
        assert_eq!(buf, [0x7f]);
    }

    #[test]
    fn uint_unterminated() {
        let mut de = Deserializer::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80]);
        assert_eq!(de.pop_uint(), Err(Error::UnterminatedUint));
    }

    #[test]
    fn data_roundtrip() {
        let mut buf = Vec::new();
        Serializer::new(&mut buf).push_data(b"abcd").unwrap();
        assert_eq!(buf, [4, 0, b'a', b'b', b'c', b'd']);
        let mut de = Deserializer::new(&buf);
        assert_eq!(de.pop_data().unwrap(), b"abcd");
    }

    #[test]
    fn truncation_is_reported() {
        let mut de = Deserializer::new(&[1, 2]);
        assert_eq!(de.deserialize::<u32>(), Err(Truncated(2, 4)));
    }

    #[test]
    fn scalar_roundtrip() {
        let mut buf = Vec::new();
        Serializer::new(&mut buf)
            .serialize(0xABu8)
            .unwrap()
            .serialize(0x1234u16)
            .unwrap()
            .serialize(-5i32)
            .unwrap()
            .serialize(Eui64([1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        let mut de = Deserializer::new(&buf);
        assert_eq!(de.deserialize::<u8>().unwrap(), 0xAB);
        assert_eq!(de.deserialize::<u16>().unwrap(), 0x1234);
        assert_eq!(de.deserialize::<i32>().unwrap(), -5);
        assert_eq!(
            de.deserialize::<Eui64>().unwrap(),
            Eui64([1, 2, 3, 4, 5, 6, 7, 8])
        );
        assert!(de.is_empty());
    }
}
