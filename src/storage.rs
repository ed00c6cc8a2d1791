//! Persisted state.
//!
//! One directory of small text files, each rewritten atomically through a
//! temporary file: per-key outgoing frame counters (restored with a safety
//! margin so a counter can never be reused after a crash), the DHCPv6
//! lease table and the long-term supplicant state for joined-but-sleeping
//! nodes. A volatile instance backs the tests and diskless runs.

use std::collections::HashMap;
use std::io;
use std::net::Ipv6Addr;
use std::path::PathBuf;

use crate::Eui64;

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Backing store for the engine's durable state
pub struct Storage {
    dir: Option<PathBuf>,
    /// In-memory copy used when no directory is configured
    volatile: std::sync::Mutex<HashMap<String, String>>,
}

impl Storage {
    /// Opens (and creates) the state directory
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            volatile: Default::default(),
        })
    }

    /// A store that forgets on drop
    pub fn volatile() -> Self {
        Self {
            dir: None,
            volatile: Default::default(),
        }
    }

    fn write_file(&self, name: &str, content: &str) {
        match &self.dir {
            Some(dir) => {
                let path = dir.join(name);
                let tmp = dir.join(format!("{name}.tmp"));
                let result = std::fs::write(&tmp, content)
                    .and_then(|_| std::fs::rename(&tmp, &path));
                if let Err(err) = result {
                    log::error!("storage: write {name}: {err}");
                }
            }
            None => {
                self.volatile
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), content.to_string());
            }
        }
    }

    fn read_file(&self, name: &str) -> Option<String> {
        match &self.dir {
            Some(dir) => std::fs::read_to_string(dir.join(name)).ok(),
            None => self.volatile.lock().unwrap().get(name).cloned(),
        }
    }

    /// Records the outgoing frame counter of a key slot
    pub fn store_frame_counter(&self, lgtk: bool, slot: usize, counter: u32) {
        let name = if lgtk { "lgtk-counters" } else { "gtk-counters" };
        let mut counters = self.load_counters(name);
        counters.insert(slot, counter);
        let mut lines: Vec<_> = counters
            .iter()
            .map(|(slot, counter)| format!("{slot}={counter}"))
            .collect();
        lines.sort();
        self.write_file(name, &(lines.join("\n") + "\n"));
    }

    /// Reads a slot's stored counter, already offset by the restart margin
    pub fn load_frame_counter(&self, lgtk: bool, slot: usize, margin: u32) -> Option<u32> {
        let name = if lgtk { "lgtk-counters" } else { "gtk-counters" };
        self.load_counters(name)
            .get(&slot)
            .map(|c| c.saturating_add(margin))
    }

    fn load_counters(&self, name: &str) -> HashMap<usize, u32> {
        let mut out = HashMap::new();
        if let Some(content) = self.read_file(name) {
            for line in content.lines() {
                if let Some((slot, counter)) = line.split_once('=') {
                    if let (Ok(slot), Ok(counter)) = (slot.parse(), counter.parse()) {
                        out.insert(slot, counter);
                    }
                }
            }
        }
        out
    }

    /// Rewrites the lease table
    pub fn store_leases(&self, leases: &[(Eui64, Ipv6Addr, u32)]) {
        let content: String = leases
            .iter()
            .map(|(eui64, addr, lifetime)| format!("{}={addr},{lifetime}\n", to_hex(&eui64.0)))
            .collect();
        self.write_file("dhcp-leases", &content);
    }

    pub fn load_leases(&self) -> Vec<(Eui64, Ipv6Addr, u32)> {
        let mut out = Vec::new();
        if let Some(content) = self.read_file("dhcp-leases") {
            for line in content.lines() {
                let Some((eui, rest)) = line.split_once('=') else {
                    continue;
                };
                let Some((addr, lifetime)) = rest.split_once(',') else {
                    continue;
                };
                let (Some(eui), Ok(addr), Ok(lifetime)) =
                    (from_hex(eui), addr.parse(), lifetime.parse())
                else {
                    continue;
                };
                if let Ok(eui) = <[u8; 8]>::try_from(eui) {
                    out.push((Eui64(eui), addr, lifetime));
                }
            }
        }
        out
    }

    /// Rewrites the long-term supplicant records (EUI-64, PMK, remaining
    /// lifetime in minutes)
    pub fn store_supplicants(&self, entries: &[(Eui64, [u8; 32], u32)]) {
        let content: String = entries
            .iter()
            .map(|(eui64, pmk, lifetime)| {
                format!("{}={},{lifetime}\n", to_hex(&eui64.0), to_hex(pmk))
            })
            .collect();
        self.write_file("supplicants", &content);
    }

    pub fn load_supplicants(&self) -> Vec<(Eui64, [u8; 32], u32)> {
        let mut out = Vec::new();
        if let Some(content) = self.read_file("supplicants") {
            for line in content.lines() {
                let Some((eui, rest)) = line.split_once('=') else {
                    continue;
                };
                let Some((pmk, lifetime)) = rest.split_once(',') else {
                    continue;
                };
                let (Some(eui), Some(pmk), Ok(lifetime)) =
                    (from_hex(eui), from_hex(pmk), lifetime.parse())
                else {
                    continue;
                };
                if let (Ok(eui), Ok(pmk)) = (<[u8; 8]>::try_from(eui), <[u8; 32]>::try_from(pmk)) {
                    out.push((Eui64(eui), pmk, lifetime));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eui(n: u8) -> Eui64 {
        Eui64([1, 2, 3, 4, 5, 6, 7, n])
    }

    #[test]
    fn counters_survive_with_margin() {
        let storage = Storage::volatile();
        storage.store_frame_counter(false, 1, 5000);
        storage.store_frame_counter(false, 2, 77);
        storage.store_frame_counter(true, 1, 9);
        assert_eq!(storage.load_frame_counter(false, 1, 1000), Some(6000));
        assert_eq!(storage.load_frame_counter(false, 2, 1000), Some(1077));
        assert_eq!(storage.load_frame_counter(true, 1, 1000), Some(1009));
        assert_eq!(storage.load_frame_counter(false, 3, 1000), None);
    }

    #[test]
    fn counter_margin_saturates() {
        let storage = Storage::volatile();
        storage.store_frame_counter(false, 0, u32::MAX - 10);
        assert_eq!(storage.load_frame_counter(false, 0, 1000), Some(u32::MAX));
    }

    #[test]
    fn leases_roundtrip() {
        let storage = Storage::volatile();
        let leases = vec![
            (eui(1), "fd00::1".parse().unwrap(), 3600),
            (eui(2), "fd00::2".parse().unwrap(), 60),
        ];
        storage.store_leases(&leases);
        assert_eq!(storage.load_leases(), leases);
    }

    #[test]
    fn supplicants_roundtrip() {
        let storage = Storage::volatile();
        let entries = vec![(eui(9), [0xab; 32], 172_800)];
        storage.store_supplicants(&entries);
        assert_eq!(storage.load_supplicants(), entries);
    }

    #[test]
    fn disk_backed_rewrite() {
        let dir = std::env::temp_dir().join(format!("wsbr-test-{}", std::process::id()));
        let storage = Storage::open(&dir).unwrap();
        storage.store_frame_counter(false, 0, 42);
        // A second open sees the rewritten file, not the tmp
        let reopened = Storage::open(&dir).unwrap();
        assert_eq!(reopened.load_frame_counter(false, 0, 0), Some(42));
        std::fs::remove_dir_all(&dir).ok();
    }
}
