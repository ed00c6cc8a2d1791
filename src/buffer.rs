//! Owned packet buffer with explicit head and tail room.
//!
//! Packets grow headers as they descend the stack (IPHC, fragmentation,
//! MAC header) and shed them on the way up. The buffer keeps its payload
//! inside a larger allocation so that prepending a header is a copy-free
//! pointer move in the common case; a headroom request beyond what is
//! reserved performs a single reallocation and copy, consuming the old
//! storage.

use crate::mac::TxPriority;
use crate::MacAddr;

/// Default headroom reserved for the MAC header and compression dispatch
pub const DEFAULT_HEADROOM: usize = 48;

/// Metadata travelling with a packet through the stack
#[derive(Clone, Debug, Default)]
pub struct BufferInfo {
    pub src: Option<MacAddr>,
    pub dst: Option<MacAddr>,
    pub src_pan: Option<u16>,
    pub dst_pan: Option<u16>,
    pub priority: TxPriority,
    pub hop_limit: u8,
    pub flow_label: u32,
    pub multicast_loop: bool,
    /// Security level requested for the MAC hop, 0 = none
    pub security_level: u8,
    /// Key slot (1-based key index) for the MAC hop
    pub key_index: u8,
}

/// An owned, growable byte buffer with reserved headroom
#[derive(Clone, Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    head: usize,
    tail: usize,
    pub info: BufferInfo,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_headroom(DEFAULT_HEADROOM)
    }

    pub fn with_headroom(headroom: usize) -> Self {
        Self {
            storage: vec![0; headroom],
            head: headroom,
            tail: headroom,
            info: BufferInfo::default(),
        }
    }

    /// Wraps payload bytes, reserving the default headroom in front
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut buf = Self::with_headroom(DEFAULT_HEADROOM);
        buf.push_back(payload);
        buf
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.head..self.tail]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.tail]
    }

    /// Makes sure at least `needed` bytes can be prepended without another
    /// allocation. When the current allocation is too small the contents
    /// move once into a bigger one.
    pub fn reserve_headroom(&mut self, needed: usize) {
        if self.head >= needed {
            return;
        }
        let len = self.len();
        let mut storage = vec![0; needed + len];
        storage[needed..].copy_from_slice(self.as_slice());
        self.storage = storage;
        self.head = needed;
        self.tail = needed + len;
    }

    /// Prepends bytes, growing the allocation if the headroom runs out
    pub fn push_front(&mut self, bytes: &[u8]) {
        if self.head < bytes.len() {
            // One reallocation: ask for the missing room plus the default
            // so repeated prepends do not thrash
            self.reserve_headroom(bytes.len() + DEFAULT_HEADROOM);
        }
        self.head -= bytes.len();
        self.storage[self.head..self.head + bytes.len()].copy_from_slice(bytes);
    }

    /// Appends bytes to the tail
    pub fn push_back(&mut self, bytes: &[u8]) {
        self.storage.truncate(self.tail);
        self.storage.extend_from_slice(bytes);
        self.tail = self.storage.len();
    }

    /// Removes and returns the first `n` bytes
    pub fn pop_front(&mut self, n: usize) -> Option<&[u8]> {
        if self.len() < n {
            return None;
        }
        let start = self.head;
        self.head += n;
        Some(&self.storage[start..self.head])
    }

    /// Drops all but the first `n` bytes
    pub fn truncate(&mut self, n: usize) {
        if n < self.len() {
            self.tail = self.head + n;
        }
    }

    /// Takes the payload out, consuming the buffer
    pub fn into_payload(mut self) -> Vec<u8> {
        self.storage.truncate(self.tail);
        self.storage.split_off(self.head)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_front_within_headroom_keeps_storage() {
        let mut buf = Buffer::from_payload(b"payload");
        let cap = buf.storage.capacity();
        buf.push_front(b"hdr:");
        assert_eq!(buf.as_slice(), b"hdr:payload");
        assert_eq!(buf.storage.capacity(), cap);
    }

    #[test]
    fn push_front_past_headroom_reallocates_once() {
        let mut buf = Buffer::with_headroom(2);
        buf.push_back(b"xy");
        let big = vec![0xab; 64];
        buf.push_front(&big);
        assert_eq!(buf.len(), 66);
        assert_eq!(&buf.as_slice()[..64], &big[..]);
        assert_eq!(&buf.as_slice()[64..], b"xy");
        // The spare room requested alongside makes the next prepend cheap
        assert!(buf.headroom() >= DEFAULT_HEADROOM);
    }

    #[test]
    fn pop_front_and_truncate() {
        let mut buf = Buffer::from_payload(b"abcdef");
        assert_eq!(buf.pop_front(2), Some(&b"ab"[..]));
        assert_eq!(buf.as_slice(), b"cdef");
        assert_eq!(buf.pop_front(10), None);
        buf.truncate(3);
        assert_eq!(buf.as_slice(), b"cde");
        assert_eq!(buf.into_payload(), b"cde");
    }

    #[test]
    fn reserve_headroom_copies_payload() {
        let mut buf = Buffer::with_headroom(0);
        buf.push_back(b"data");
        buf.reserve_headroom(100);
        assert_eq!(buf.headroom(), 100);
        assert_eq!(buf.as_slice(), b"data");
    }
}
