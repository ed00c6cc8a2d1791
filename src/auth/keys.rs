//! Group key lifecycle.
//!
//! Up to four GTKs and three LGTKs live in indexed slots; exactly one of
//! each family is active for transmission. When the active key has
//! consumed its configured share of life (80% by default) the next slot
//! receives a fresh key, pre-announced to the PAN so supplicants rekey
//! inside the activation window; at expiry the new key takes over.
//! Revocation shortens the active key's remaining life to a small window
//! and installs a replacement immediately.

use rand::Rng;

use crate::config::SecurityConfig;

use super::kdf;

/// One installed group key
#[derive(Clone, Debug)]
pub struct GroupKeyEntry {
    pub key: [u8; 16],
    /// Minutes until removal from the table
    pub expire_in: u32,
    /// Lifetime granted at installation
    pub lifetime: u32,
}

/// Lifecycle notifications
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeyEvent {
    Installed { lgtk: bool, index: usize },
    Activated { lgtk: bool, index: usize },
    Expired { lgtk: bool, index: usize },
}

struct Family {
    slots: Vec<Option<GroupKeyEntry>>,
    active: usize,
    expire_offset: u32,
    act_divisor: u32,
    install_req: u8,
    revocation_divisor: u32,
    lgtk: bool,
}

impl Family {
    fn entry(&self, index: usize) -> Option<&GroupKeyEntry> {
        self.slots.get(index)?.as_ref()
    }

    fn next_index(&self) -> usize {
        (self.active + 1) % self.slots.len()
    }

    fn install(&mut self, index: usize, key: [u8; 16], lifetime: u32) -> KeyEvent {
        self.slots[index] = Some(GroupKeyEntry {
            key,
            expire_in: lifetime,
            lifetime,
        });
        KeyEvent::Installed {
            lgtk: self.lgtk,
            index,
        }
    }

    fn tick_minute(&mut self, rng: &mut impl Rng, events: &mut Vec<KeyEvent>) {
        // Age every slot
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot {
                if entry.expire_in <= 1 {
                    *slot = None;
                    events.push(KeyEvent::Expired {
                        lgtk: self.lgtk,
                        index,
                    });
                } else {
                    entry.expire_in -= 1;
                }
            }
        }
        // Pre-install the successor once the active key is mostly spent
        if let Some(active) = self.entry(self.active) {
            let consumed = active.lifetime - active.expire_in;
            let threshold = active.lifetime / 100 * u32::from(self.install_req);
            let next = self.next_index();
            if consumed >= threshold && self.entry(next).is_none() {
                let mut key = [0u8; 16];
                rng.fill(&mut key);
                // The successor must outlive the active key by a full
                // offset, capped by configuration
                events.push(self.install(next, key, self.expire_offset));
            }
        }
        // Hand transmission to the successor once the activation window
        // (a subdivision of the expire offset) opens
        let window = self.expire_offset / self.act_divisor;
        let next = self.next_index();
        if window > 0
            && next != self.active
            && self.entry(next).is_some()
            && self
                .entry(self.active)
                .is_some_and(|a| a.expire_in <= window)
        {
            self.active = next;
            events.push(KeyEvent::Activated {
                lgtk: self.lgtk,
                index: next,
            });
        }
        // The active key expired: the freshest installed key takes over
        if self.entry(self.active).is_none() {
            if let Some(index) = self.richest_slot() {
                self.active = index;
                events.push(KeyEvent::Activated {
                    lgtk: self.lgtk,
                    index,
                });
            }
        }
    }

    fn richest_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (i, e.expire_in)))
            .max_by_key(|(_, left)| *left)
            .map(|(i, _)| i)
    }

    fn revoke(&mut self, rng: &mut impl Rng, events: &mut Vec<KeyEvent>) {
        let window = (self.expire_offset / self.revocation_divisor).max(1);
        if let Some(entry) = self.slots[self.active].as_mut() {
            entry.expire_in = entry.expire_in.min(window);
        }
        let next = self.next_index();
        if self.entry(next).is_none() {
            let mut key = [0u8; 16];
            rng.fill(&mut key);
            events.push(self.install(next, key, self.expire_offset));
        }
    }

    fn hashes<const N: usize>(&self) -> [[u8; 8]; N] {
        let mut out = [[0u8; 8]; N];
        for (i, slot) in self.slots.iter().enumerate().take(N) {
            if let Some(entry) = slot {
                out[i] = kdf::gtk_hash(&entry.key);
            }
        }
        out
    }
}

/// The GTK and LGTK tables
pub struct GroupKeys {
    gtk: Family,
    lgtk: Family,
    /// Seconds toward the next minute step
    second_accum: u32,
}

impl GroupKeys {
    pub fn new(cfg: &SecurityConfig) -> Self {
        Self {
            gtk: Family {
                slots: vec![None; 4],
                active: 0,
                expire_offset: cfg.gtk_expire_offset,
                act_divisor: cfg.gtk_new_act_time.max(1),
                install_req: cfg.gtk_new_install_req,
                revocation_divisor: cfg.ffn_revocation_reduction.max(1),
                lgtk: false,
            },
            lgtk: Family {
                slots: vec![None; 3],
                active: 0,
                expire_offset: cfg.lgtk_expire_offset,
                act_divisor: cfg.lgtk_new_act_time.max(1),
                install_req: cfg.lgtk_new_install_req,
                revocation_divisor: cfg.lfn_revocation_reduction.max(1),
                lgtk: true,
            },
            second_accum: 0,
        }
    }

    /// Seeds both families at FAN start
    pub fn start(&mut self, rng: &mut impl Rng) -> Vec<KeyEvent> {
        let mut events = Vec::new();
        for family in [&mut self.gtk, &mut self.lgtk] {
            if family.entry(family.active).is_none() {
                let mut key = [0u8; 16];
                rng.fill(&mut key);
                let lifetime = family.expire_offset;
                events.push(family.install(family.active, key, lifetime));
                events.push(KeyEvent::Activated {
                    lgtk: family.lgtk,
                    index: family.active,
                });
            }
        }
        events
    }

    /// Installs an operator-provided GTK into the next slot
    pub fn install_gtk(&mut self, key: [u8; 16]) -> KeyEvent {
        let next = self.gtk.next_index();
        let lifetime = self.gtk.expire_offset;
        self.gtk.install(next, key, lifetime)
    }

    pub fn install_lgtk(&mut self, key: [u8; 16]) -> KeyEvent {
        let next = self.lgtk.next_index();
        let lifetime = self.lgtk.expire_offset;
        self.lgtk.install(next, key, lifetime)
    }

    /// Revokes the active GTK and/or LGTK
    pub fn revoke(&mut self, gtk: bool, lgtk: bool, rng: &mut impl Rng) -> Vec<KeyEvent> {
        let mut events = Vec::new();
        if gtk {
            self.gtk.revoke(rng, &mut events);
        }
        if lgtk {
            self.lgtk.revoke(rng, &mut events);
        }
        events
    }

    /// One second of wall time; lifecycle runs on whole minutes
    pub fn tick_second(&mut self, rng: &mut impl Rng) -> Vec<KeyEvent> {
        self.second_accum += 1;
        if self.second_accum < 60 {
            return Vec::new();
        }
        self.second_accum = 0;
        let mut events = Vec::new();
        self.gtk.tick_minute(rng, &mut events);
        self.lgtk.tick_minute(rng, &mut events);
        events
    }

    pub fn active_gtk(&self) -> Option<(usize, &GroupKeyEntry)> {
        self.gtk.entry(self.gtk.active).map(|e| (self.gtk.active, e))
    }

    pub fn active_lgtk(&self) -> Option<(usize, &GroupKeyEntry)> {
        self.lgtk
            .entry(self.lgtk.active)
            .map(|e| (self.lgtk.active, e))
    }

    pub fn gtk(&self, index: usize) -> Option<&GroupKeyEntry> {
        self.gtk.entry(index)
    }

    pub fn lgtk(&self, index: usize) -> Option<&GroupKeyEntry> {
        self.lgtk.entry(index)
    }

    pub fn gtk_hashes(&self) -> [[u8; 8]; 4] {
        self.gtk.hashes::<4>()
    }

    pub fn lgtk_hashes(&self) -> [Option<[u8; 8]>; 3] {
        let mut out = [None; 3];
        for (i, slot) in self.lgtk.slots.iter().enumerate() {
            if let Some(entry) = slot {
                out[i] = Some(kdf::gtk_hash(&entry.key));
            }
        }
        out
    }

    pub fn active_gtk_index(&self) -> usize {
        self.gtk.active
    }

    pub fn active_lgtk_index(&self) -> usize {
        self.lgtk.active
    }

    /// Liveness bitmap for the GTKL KDE
    pub fn gtkl(&self) -> u8 {
        self.gtk
            .slots
            .iter()
            .enumerate()
            .fold(0, |acc, (i, s)| acc | (u8::from(s.is_some()) << i))
    }

    pub fn lgtkl(&self) -> u8 {
        self.lgtk
            .slots
            .iter()
            .enumerate()
            .fold(0, |acc, (i, s)| acc | (u8::from(s.is_some()) << i))
    }

    /// GAKs over every installed GTK slot, for the management surface
    pub fn gaks(&self, network_name: &str) -> [Option<[u8; 16]>; 4] {
        let mut out = [None; 4];
        for (i, slot) in self.gtk.slots.iter().enumerate() {
            if let Some(entry) = slot {
                out[i] = Some(kdf::gak(network_name, &entry.key));
            }
        }
        out
    }

    pub fn lgaks(&self, network_name: &str) -> [Option<[u8; 16]>; 3] {
        let mut out = [None; 3];
        for (i, slot) in self.lgtk.slots.iter().enumerate() {
            if let Some(entry) = slot {
                out[i] = Some(kdf::gak(network_name, &entry.key));
            }
        }
        out
    }

    /// Everything gone (FAN teardown)
    pub fn clear(&mut self) {
        for slot in self.gtk.slots.iter_mut().chain(self.lgtk.slots.iter_mut()) {
            *slot = None;
        }
        self.gtk.active = 0;
        self.lgtk.active = 0;
        self.second_accum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cfg_minutes(expire: u32, install_req: u8) -> SecurityConfig {
        SecurityConfig {
            gtk_expire_offset: expire,
            gtk_new_install_req: install_req,
            ffn_revocation_reduction: 30,
            ..SecurityConfig::default()
        }
    }

    fn tick_minutes(keys: &mut GroupKeys, rng: &mut StdRng, minutes: u32) -> Vec<KeyEvent> {
        let mut events = Vec::new();
        for _ in 0..minutes * 60 {
            events.extend(keys.tick_second(rng));
        }
        events
    }

    #[test]
    fn successor_installed_at_the_threshold_and_activated_at_expiry() {
        let mut rng = StdRng::seed_from_u64(0x6b);
        let mut keys = GroupKeys::new(&cfg_minutes(100, 80));
        keys.start(&mut rng);
        let (first_index, first) = keys.active_gtk().unwrap();
        assert_eq!(first_index, 0);
        let first_key = first.key;

        // Nothing happens during the first 79 minutes
        let events = tick_minutes(&mut keys, &mut rng, 79);
        assert!(events.iter().all(|e| !matches!(e, KeyEvent::Installed { .. })));

        // The 80% point installs the successor in slot 1
        let events = tick_minutes(&mut keys, &mut rng, 1);
        assert!(events.contains(&KeyEvent::Installed {
            lgtk: false,
            index: 1
        }));
        // Still the old key transmitting
        assert_eq!(keys.active_gtk().unwrap().1.key, first_key);

        // At expiry slot 1 takes over
        let events = tick_minutes(&mut keys, &mut rng, 20);
        assert!(events.contains(&KeyEvent::Expired {
            lgtk: false,
            index: 0
        }));
        assert!(events.contains(&KeyEvent::Activated {
            lgtk: false,
            index: 1
        }));
        assert_ne!(keys.active_gtk().unwrap().1.key, first_key);
    }

    #[test]
    fn lifetime_never_exceeds_the_expire_offset() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut keys = GroupKeys::new(&cfg_minutes(100, 80));
        keys.start(&mut rng);
        for _ in 0..300 {
            tick_minutes(&mut keys, &mut rng, 1);
            if let Some((_, entry)) = keys.active_gtk() {
                assert!(entry.expire_in <= 100);
                assert!(entry.lifetime <= 100);
            }
        }
    }

    #[test]
    fn revocation_shortens_and_replaces() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut keys = GroupKeys::new(&cfg_minutes(3000, 80));
        keys.start(&mut rng);
        let events = keys.revoke(true, false, &mut rng);
        assert!(events.iter().any(|e| matches!(
            e,
            KeyEvent::Installed { lgtk: false, .. }
        )));
        // Active key now dies within the revocation window
        let (_, active) = keys.active_gtk().unwrap();
        assert!(active.expire_in <= 3000 / 30);
        // And the successor takes over once it does
        let events = tick_minutes(&mut keys, &mut rng, 3000 / 30 + 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, KeyEvent::Activated { lgtk: false, .. })));
    }

    #[test]
    fn hashes_track_the_slots() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut keys = GroupKeys::new(&SecurityConfig::default());
        assert_eq!(keys.gtk_hashes(), [[0; 8]; 4]);
        keys.start(&mut rng);
        let hashes = keys.gtk_hashes();
        assert_ne!(hashes[0], [0; 8]);
        assert_eq!(hashes[1], [0; 8]);
        assert_eq!(keys.gtkl(), 0b0001);
        keys.install_gtk([5; 16]);
        assert_eq!(keys.gtkl(), 0b0011);
    }

    #[test]
    fn activation_window_hands_over_before_expiry() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut cfg = cfg_minutes(100, 80);
        cfg.gtk_new_act_time = 10; // window = 10 minutes
        let mut keys = GroupKeys::new(&cfg);
        keys.start(&mut rng);
        tick_minutes(&mut keys, &mut rng, 80); // successor installed
        let events = tick_minutes(&mut keys, &mut rng, 10);
        assert!(events.contains(&KeyEvent::Activated {
            lgtk: false,
            index: 1
        }));
        // The retired key lingers until its real expiry for reception
        assert!(keys.gtk(0).is_some());
        assert_eq!(keys.active_gtk_index(), 1);
    }

    #[test]
    fn operator_installed_gtk_lands_in_the_next_slot() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut keys = GroupKeys::new(&SecurityConfig::default());
        keys.start(&mut rng);
        let event = keys.install_gtk([0x77; 16]);
        assert_eq!(
            event,
            KeyEvent::Installed {
                lgtk: false,
                index: 1
            }
        );
        assert_eq!(keys.gtk(1).unwrap().key, [0x77; 16]);
    }
}
