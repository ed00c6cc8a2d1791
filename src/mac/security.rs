//! MAC security material: key and device descriptor tables and the CCM*
//! transform.
//!
//! Keys and devices live in slot arenas addressed by stable attribute
//! indexes, the contract the RCP mirror tables rely on. Every inbound
//! secured frame must present a frame counter strictly above the stored
//! one for its (device, key) pair; anything else is a replay.
//!
//! CCM* nonce: source EUI-64 (8) || frame counter (4, big-endian) ||
//! security level (1).

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U16, U4, U8};
use ccm::Ccm;

use crate::{Eui64, Status};

type CcmMic4 = Ccm<Aes128, U4, U13>;
type CcmMic8 = Ccm<Aes128, U8, U13>;
type CcmMic16 = Ccm<Aes128, U16, U13>;

/// Builds the 13-byte CCM* nonce
pub fn nonce(src: Eui64, frame_counter: u32, level: u8) -> [u8; 13] {
    let mut out = [0; 13];
    out[..8].copy_from_slice(&src.0);
    out[8..12].copy_from_slice(&frame_counter.to_be_bytes());
    out[12] = level;
    out
}

/// Encrypts `message` in place and returns the MIC to append.
///
/// `open` is the authenticated-but-clear part of the frame (MAC header and
/// information elements). Levels 1..=3 authenticate only: the message
/// stays clear and joins the authenticated data.
pub fn encrypt(
    key: &[u8; 16],
    src: Eui64,
    frame_counter: u32,
    level: u8,
    open: &[u8],
    message: &mut [u8],
) -> Result<Vec<u8>, Status> {
    let nonce = nonce(src, frame_counter, level);
    let nonce = GenericArray::from_slice(&nonce);
    let key = GenericArray::from_slice(key);
    let encrypted = level >= 4;
    let mut aad = open.to_vec();
    let mut body: &mut [u8] = message;
    let mut empty: [u8; 0] = [];
    if !encrypted {
        aad.extend_from_slice(message);
        body = &mut empty;
    }
    let tag = match level & 0x3 {
        0 => Vec::new(),
        1 => CcmMic4::new(key)
            .encrypt_in_place_detached(nonce, &aad, body)
            .map_err(|_| Status::SecurityFail)?
            .to_vec(),
        2 => CcmMic8::new(key)
            .encrypt_in_place_detached(nonce, &aad, body)
            .map_err(|_| Status::SecurityFail)?
            .to_vec(),
        _ => CcmMic16::new(key)
            .encrypt_in_place_detached(nonce, &aad, body)
            .map_err(|_| Status::SecurityFail)?
            .to_vec(),
    };
    Ok(tag)
}

/// Checks the MIC and decrypts `message` in place
pub fn decrypt(
    key: &[u8; 16],
    src: Eui64,
    frame_counter: u32,
    level: u8,
    open: &[u8],
    message: &mut [u8],
    mic: &[u8],
) -> Result<(), Status> {
    let nonce = nonce(src, frame_counter, level);
    let nonce = GenericArray::from_slice(&nonce);
    let key = GenericArray::from_slice(key);
    let encrypted = level >= 4;
    let mut aad = open.to_vec();
    let mut body: &mut [u8] = message;
    let mut empty: [u8; 0] = [];
    if !encrypted {
        aad.extend_from_slice(message);
        body = &mut empty;
    }
    let result = match level & 0x3 {
        0 => return Ok(()),
        1 => CcmMic4::new(key).decrypt_in_place_detached(
            nonce,
            &aad,
            body,
            GenericArray::from_slice(mic),
        ),
        2 => CcmMic8::new(key).decrypt_in_place_detached(
            nonce,
            &aad,
            body,
            GenericArray::from_slice(mic),
        ),
        _ => CcmMic16::new(key).decrypt_in_place_detached(
            nonce,
            &aad,
            body,
            GenericArray::from_slice(mic),
        ),
    };
    result.map_err(|_| Status::SecurityFail)
}

/// A key descriptor slot
#[derive(Clone, Debug)]
pub struct KeyDescriptor {
    pub key: [u8; 16],
    /// 1-based key index travelling in the auxiliary security header
    pub key_index: u8,
    pub frame_counter: u32,
}

/// A device descriptor slot
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub eui64: Eui64,
    pub short_addr: u16,
    pub pan_id: u16,
    /// Highest frame counter accepted so far, per key slot
    pub frame_counters: Vec<Option<u32>>,
    /// Exempt devices skip the replay check (join traffic)
    pub exempt: bool,
}

/// Key and device arenas
pub struct SecurityTables {
    keys: Vec<Option<KeyDescriptor>>,
    devices: Vec<Option<DeviceDescriptor>>,
}

pub type KeySlot = usize;
pub type DeviceHandle = usize;

impl SecurityTables {
    pub fn new(key_slots: usize, device_slots: usize) -> Self {
        Self {
            keys: (0..key_slots).map(|_| None).collect(),
            devices: (0..device_slots).map(|_| None).collect(),
        }
    }

    /// Installs (or replaces) a key, returning its slot
    pub fn install_key(&mut self, key: [u8; 16], key_index: u8) -> Result<KeySlot, Status> {
        if let Some(slot) = self
            .keys
            .iter()
            .position(|k| matches!(k, Some(d) if d.key_index == key_index))
        {
            let descriptor = self.keys[slot].as_mut().unwrap();
            if descriptor.key != key {
                descriptor.key = key;
                descriptor.frame_counter = 0;
            }
            return Ok(slot);
        }
        let slot = self
            .keys
            .iter()
            .position(|k| k.is_none())
            .ok_or(Status::NoMemory)?;
        self.keys[slot] = Some(KeyDescriptor {
            key,
            key_index,
            frame_counter: 0,
        });
        Ok(slot)
    }

    pub fn remove_key(&mut self, key_index: u8) {
        for slot in &mut self.keys {
            if matches!(slot, Some(d) if d.key_index == key_index) {
                *slot = None;
            }
        }
    }

    pub fn key_by_index(&self, key_index: u8) -> Option<(KeySlot, &KeyDescriptor)> {
        self.keys
            .iter()
            .enumerate()
            .find_map(|(i, k)| match k {
                Some(d) if d.key_index == key_index => Some((i, d)),
                _ => None,
            })
    }

    pub fn key_mut(&mut self, slot: KeySlot) -> Option<&mut KeyDescriptor> {
        self.keys.get_mut(slot)?.as_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = (KeySlot, &KeyDescriptor)> {
        self.keys
            .iter()
            .enumerate()
            .filter_map(|(i, k)| k.as_ref().map(|d| (i, d)))
    }

    /// Allocates the next outgoing counter of a key
    pub fn next_outgoing_counter(&mut self, slot: KeySlot) -> Result<u32, Status> {
        let key = self.key_mut(slot).ok_or(Status::UnavailableKey)?;
        let counter = key.frame_counter;
        key.frame_counter = key.frame_counter.wrapping_add(1);
        Ok(counter)
    }

    /// Seeds a key's outgoing counter (restored from stable storage)
    pub fn seed_outgoing_counter(&mut self, slot: KeySlot, counter: u32) {
        if let Some(key) = self.key_mut(slot) {
            key.frame_counter = key.frame_counter.max(counter);
        }
    }

    /// Installs a device descriptor, returning its handle
    pub fn install_device(
        &mut self,
        eui64: Eui64,
        short_addr: u16,
        pan_id: u16,
    ) -> Result<DeviceHandle, Status> {
        if let Some(handle) = self.device_by_eui64(eui64) {
            let dev = self.devices[handle].as_mut().unwrap();
            dev.short_addr = short_addr;
            dev.pan_id = pan_id;
            return Ok(handle);
        }
        let handle = self
            .devices
            .iter()
            .position(|d| d.is_none())
            .ok_or(Status::NoMemory)?;
        self.devices[handle] = Some(DeviceDescriptor {
            eui64,
            short_addr,
            pan_id,
            frame_counters: vec![None; self.keys.len()],
            exempt: false,
        });
        Ok(handle)
    }

    pub fn remove_device(&mut self, handle: DeviceHandle) {
        if let Some(slot) = self.devices.get_mut(handle) {
            *slot = None;
        }
    }

    pub fn device_by_eui64(&self, eui64: Eui64) -> Option<DeviceHandle> {
        self.devices
            .iter()
            .position(|d| matches!(d, Some(dev) if dev.eui64 == eui64))
    }

    pub fn device_by_short(&self, short_addr: u16) -> Option<DeviceHandle> {
        self.devices
            .iter()
            .position(|d| matches!(d, Some(dev) if dev.short_addr == short_addr))
    }

    pub fn device(&self, handle: DeviceHandle) -> Option<&DeviceDescriptor> {
        self.devices.get(handle)?.as_ref()
    }

    pub fn device_mut(&mut self, handle: DeviceHandle) -> Option<&mut DeviceDescriptor> {
        self.devices.get_mut(handle)?.as_mut()
    }

    /// Enforces the strictly-increasing counter rule for one received
    /// frame; accepting updates the stored value
    pub fn check_and_update_counter(
        &mut self,
        handle: DeviceHandle,
        key_slot: KeySlot,
        counter: u32,
    ) -> Result<(), Status> {
        let device = self.device_mut(handle).ok_or(Status::InvalidHandle)?;
        if device.exempt {
            return Ok(());
        }
        let stored = device
            .frame_counters
            .get_mut(key_slot)
            .ok_or(Status::UnavailableKey)?;
        match *stored {
            Some(last) if counter <= last => Err(Status::CounterError),
            _ => {
                *stored = Some(counter);
                Ok(())
            }
        }
    }

    /// Drops every device binding and counter (RCP reset, key purge)
    pub fn reset_device_counters(&mut self) {
        let key_slots = self.keys.len();
        for device in self.devices.iter_mut().flatten() {
            device.frame_counters = vec![None; key_slots];
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.keys {
            *slot = None;
        }
        for slot in &mut self.devices {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eui(n: u8) -> Eui64 {
        Eui64([0x0c, 0x5b, 0xa0, 0, 0, 0, 0, n])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [0x11; 16];
        let open = b"mac header and ies";
        let mut message = b"application payload".to_vec();
        let mic = encrypt(&key, eui(1), 42, 6, open, &mut message).unwrap();
        assert_eq!(mic.len(), 8);
        assert_ne!(&message, b"application payload");
        decrypt(&key, eui(1), 42, 6, open, &mut message, &mic).unwrap();
        assert_eq!(&message, b"application payload");
    }

    #[test]
    fn tampered_open_part_fails_the_mic() {
        let key = [0x11; 16];
        let mut message = b"payload".to_vec();
        let mic = encrypt(&key, eui(1), 1, 6, b"header", &mut message).unwrap();
        assert_eq!(
            decrypt(&key, eui(1), 1, 6, b"he4der", &mut message, &mic),
            Err(Status::SecurityFail)
        );
    }

    #[test]
    fn auth_only_level_leaves_payload_clear() {
        let key = [0x22; 16];
        let mut message = b"clear".to_vec();
        let mic = encrypt(&key, eui(1), 7, 2, b"hdr", &mut message).unwrap();
        assert_eq!(&message, b"clear");
        decrypt(&key, eui(1), 7, 2, b"hdr", &mut message, &mic).unwrap();
    }

    #[test]
    fn wrong_counter_in_nonce_fails() {
        let key = [0x33; 16];
        let mut message = b"x".to_vec();
        let mic = encrypt(&key, eui(1), 5, 6, b"", &mut message).unwrap();
        assert_eq!(
            decrypt(&key, eui(1), 6, 6, b"", &mut message, &mic),
            Err(Status::SecurityFail)
        );
    }

    #[test]
    fn replay_counter_rule() {
        let mut tables = SecurityTables::new(4, 4);
        let slot = tables.install_key([1; 16], 1).unwrap();
        let dev = tables.install_device(eui(1), 0x0001, 0xabcd).unwrap();
        tables.check_and_update_counter(dev, slot, 10).unwrap();
        assert_eq!(
            tables.check_and_update_counter(dev, slot, 10),
            Err(Status::CounterError)
        );
        tables.check_and_update_counter(dev, slot, 11).unwrap();
    }

    #[test]
    fn key_replacement_resets_its_counter() {
        let mut tables = SecurityTables::new(4, 4);
        let slot = tables.install_key([1; 16], 1).unwrap();
        tables.seed_outgoing_counter(slot, 100);
        assert_eq!(tables.next_outgoing_counter(slot).unwrap(), 100);
        // Reinstalling the same key keeps the counter
        assert_eq!(tables.install_key([1; 16], 1).unwrap(), slot);
        assert_eq!(tables.next_outgoing_counter(slot).unwrap(), 101);
        // A new key in the slot starts over
        tables.install_key([2; 16], 1).unwrap();
        assert_eq!(tables.next_outgoing_counter(slot).unwrap(), 0);
    }

    #[test]
    fn exempt_device_skips_replay_check() {
        let mut tables = SecurityTables::new(2, 2);
        let slot = tables.install_key([1; 16], 1).unwrap();
        let dev = tables.install_device(eui(2), 0xfffe, 0xabcd).unwrap();
        tables.device_mut(dev).unwrap().exempt = true;
        tables.check_and_update_counter(dev, slot, 5).unwrap();
        tables.check_and_update_counter(dev, slot, 5).unwrap();
    }
}
