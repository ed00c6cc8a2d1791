//! Key derivation for the authenticator.
//!
//! The 4-way handshake follows IEEE 802.11i with EUI-64 station
//! addresses: PTK = PRF-384(PMK, "Pairwise key expansion", min(AA,SPA) ||
//! max(AA,SPA) || min(ANonce,SNonce) || max(ANonce,SNonce)), split into
//! KCK || KEK || TK. Key frames are authenticated with HMAC-SHA1-128 under
//! the KCK and their key data is wrapped with AES key wrap (RFC 3394)
//! under the KEK. The radio keys on GAK = SHA-256(network name || GTK)
//! truncated to 16 bytes.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::Eui64;

type HmacSha1 = Hmac<Sha1>;

/// IEEE 802.11i PRF: concatenated HMAC-SHA1 blocks over
/// label || 0x00 || data || counter
pub fn prf(key: &[u8], label: &str, data: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + 20);
    let mut counter = 0u8;
    while out.len() < out_len {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(label.as_bytes());
        mac.update(&[0]);
        mac.update(data);
        mac.update(&[counter]);
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(out_len);
    out
}

/// PTK = KCK(16) || KEK(16) || TK(16)
pub fn derive_ptk(
    pmk: &[u8; 32],
    authenticator: Eui64,
    supplicant: Eui64,
    anonce: &[u8; 32],
    snonce: &[u8; 32],
) -> [u8; 48] {
    let (addr_lo, addr_hi) = if authenticator.0 <= supplicant.0 {
        (authenticator.0, supplicant.0)
    } else {
        (supplicant.0, authenticator.0)
    };
    let (nonce_lo, nonce_hi) = if anonce <= snonce {
        (anonce, snonce)
    } else {
        (snonce, anonce)
    };
    let mut data = Vec::with_capacity(16 + 64);
    data.extend_from_slice(&addr_lo);
    data.extend_from_slice(&addr_hi);
    data.extend_from_slice(nonce_lo);
    data.extend_from_slice(nonce_hi);
    prf(pmk, "Pairwise key expansion", &data, 48)
        .try_into()
        .unwrap()
}

pub fn kck(ptk: &[u8; 48]) -> &[u8] {
    &ptk[..16]
}

pub fn kek(ptk: &[u8; 48]) -> &[u8] {
    &ptk[16..32]
}

pub fn tk(ptk: &[u8; 48]) -> [u8; 16] {
    ptk[32..48].try_into().unwrap()
}

/// HMAC-SHA1-128 over the whole EAPOL frame with the MIC field zeroed
pub fn key_mic(kck: &[u8], frame: &[u8]) -> [u8; 16] {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(kck).expect("hmac accepts any key length");
    mac.update(frame);
    let digest = mac.finalize().into_bytes();
    digest[..16].try_into().unwrap()
}

/// PMKID = HMAC-SHA1-128(PMK, "PMK Name" || AA || SPA)
pub fn pmkid(pmk: &[u8; 32], authenticator: Eui64, supplicant: Eui64) -> [u8; 16] {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(pmk).expect("hmac accepts any key length");
    mac.update(b"PMK Name");
    mac.update(&authenticator.0);
    mac.update(&supplicant.0);
    mac.finalize().into_bytes()[..16].try_into().unwrap()
}

/// PTKID = HMAC-SHA1-128(PTK-KCK, "PTK Name" || AA || SPA)
pub fn ptkid(ptk: &[u8; 48], authenticator: Eui64, supplicant: Eui64) -> [u8; 16] {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(kck(ptk)).expect("hmac accepts any key length");
    mac.update(b"PTK Name");
    mac.update(&authenticator.0);
    mac.update(&supplicant.0);
    mac.finalize().into_bytes()[..16].try_into().unwrap()
}

/// GAK = SHA-256(network name || GTK) truncated to 16 bytes; what the PHY
/// actually keys on
pub fn gak(network_name: &str, gtk: &[u8; 16]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(network_name.as_bytes());
    hasher.update(gtk);
    hasher.finalize()[..16].try_into().unwrap()
}

/// The 8-byte GTK hash advertised in the PC frame
pub fn gtk_hash(gtk: &[u8; 16]) -> [u8; 8] {
    let digest = Sha256::digest(gtk);
    digest[..8].try_into().unwrap()
}

const KEY_WRAP_IV: u64 = 0xa6a6_a6a6_a6a6_a6a6;

/// AES key wrap (RFC 3394); `plain` must be a multiple of 8 bytes, at
/// least 16
pub fn aes_key_wrap(kek: &[u8], plain: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new_from_slice(kek).expect("kek is 16 bytes");
    let n = plain.len() / 8;
    let mut a = KEY_WRAP_IV;
    let mut r: Vec<[u8; 8]> = plain.chunks(8).map(|c| c.try_into().unwrap()).collect();
    for j in 0..6u64 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&a.to_be_bytes());
            block[8..].copy_from_slice(ri);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
            let t = (n as u64) * j + (i as u64) + 1;
            a = u64::from_be_bytes(block[..8].try_into().unwrap()) ^ t;
            ri.copy_from_slice(&block[8..]);
        }
    }
    let mut out = Vec::with_capacity(plain.len() + 8);
    out.extend_from_slice(&a.to_be_bytes());
    for ri in r {
        out.extend_from_slice(&ri);
    }
    out
}

/// AES key unwrap; `None` on an integrity failure
pub fn aes_key_unwrap(kek: &[u8], wrapped: &[u8]) -> Option<Vec<u8>> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return None;
    }
    let cipher = Aes128::new_from_slice(kek).ok()?;
    let n = wrapped.len() / 8 - 1;
    let mut a = u64::from_be_bytes(wrapped[..8].try_into().unwrap());
    let mut r: Vec<[u8; 8]> = wrapped[8..]
        .chunks(8)
        .map(|c| c.try_into().unwrap())
        .collect();
    for j in (0..6u64).rev() {
        for i in (0..n).rev() {
            let t = (n as u64) * j + (i as u64) + 1;
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&(a ^ t).to_be_bytes());
            block[8..].copy_from_slice(&r[i]);
            cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
            a = u64::from_be_bytes(block[..8].try_into().unwrap());
            r[i].copy_from_slice(&block[8..]);
        }
    }
    (a == KEY_WRAP_IV).then(|| r.concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_wrap_rfc3394_vector() {
        // RFC 3394 §4.1: 128-bit KEK, 128-bit key data
        let kek = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let plain = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let wrapped = aes_key_wrap(&kek, &plain);
        assert_eq!(
            hex::encode(&wrapped),
            "1fa68b0a8112b447aef34bd8fb5a7b829d3e862371d2cfe5"
        );
        assert_eq!(aes_key_unwrap(&kek, &wrapped).unwrap(), plain);
    }

    #[test]
    fn key_unwrap_detects_tampering() {
        let kek = [0u8; 16];
        let mut wrapped = aes_key_wrap(&kek, &[0x42; 16]);
        wrapped[9] ^= 1;
        assert!(aes_key_unwrap(&kek, &wrapped).is_none());
    }

    #[test]
    fn ptk_is_symmetric_in_address_order() {
        let pmk = [7u8; 32];
        let a = Eui64([1, 2, 3, 4, 5, 6, 7, 8]);
        let b = Eui64([8, 7, 6, 5, 4, 3, 2, 1]);
        let anonce = [0x11; 32];
        let snonce = [0x22; 32];
        assert_eq!(
            derive_ptk(&pmk, a, b, &anonce, &snonce),
            derive_ptk(&pmk, b, a, &snonce, &anonce)
        );
    }

    #[test]
    fn prf_length_and_determinism() {
        let out1 = prf(&[1; 32], "Pairwise key expansion", b"data", 48);
        let out2 = prf(&[1; 32], "Pairwise key expansion", b"data", 48);
        assert_eq!(out1.len(), 48);
        assert_eq!(out1, out2);
        let out3 = prf(&[1; 32], "Pairwise key expansion", b"datb", 48);
        assert_ne!(out1, out3);
    }

    #[test]
    fn gak_depends_on_name_and_key() {
        let gtk = [0x33; 16];
        assert_ne!(gak("net-a", &gtk), gak("net-b", &gtk));
        assert_ne!(gak("net-a", &gtk), gak("net-a", &[0x34; 16]));
        assert_eq!(gak("net-a", &gtk), gak("net-a", &gtk));
    }

    #[test]
    fn mic_covers_the_frame() {
        let ptk = [9u8; 48];
        let mic1 = key_mic(kck(&ptk), b"frame-bytes");
        let mic2 = key_mic(kck(&ptk), b"frame-bytez");
        assert_ne!(mic1, mic2);
    }
}
