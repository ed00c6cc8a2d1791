//! The MAC neighbor table.
//!
//! A bounded arena of neighbor entries addressed by a stable small index;
//! freed slots are reused but an index never moves while its entry lives.
//! Entries expire when their link lifetime runs out without traffic; the
//! table reports every removal so the other subsystems drop their indexes
//! instead of holding dangling references.

use crate::Eui64;

pub type NeighborIndex = u16;

/// Role of the link with this neighbor
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LinkRole {
    #[default]
    Normal,
    PrimaryParent,
    SecondaryParent,
    Child,
}

/// What the neighbor is in the FAN
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum NodeRole {
    #[default]
    Router,
    BorderRouter,
    Lfn,
}

/// Exponentially weighted received signal level, eighth-dBm resolution
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Rsl(Option<i16>);

impl Rsl {
    pub fn update(&mut self, dbm: i8) {
        let sample = i16::from(dbm) * 8;
        self.0 = Some(match self.0 {
            None => sample,
            Some(prev) => prev - prev / 8 + sample / 8,
        });
    }

    pub fn dbm(&self) -> Option<i16> {
        self.0.map(|v| v / 8)
    }
}

#[derive(Clone, Debug)]
pub struct Neighbor {
    pub eui64: Eui64,
    /// 16-bit short address, `0xfffe` when none is allocated
    pub short_addr: u16,
    /// Link lifetime left, seconds; refreshed on reception
    pub lifetime: u32,
    /// Lifetime granted on refresh
    pub lifetime_full: u32,
    /// May we accept data from it
    pub connected: bool,
    /// Group-key regime (false while still on the pairwise join path)
    pub trusted: bool,
    pub link_role: LinkRole,
    pub node_role: NodeRole,
    /// PHY mode identifiers the neighbor advertised for mode switch
    pub phy_mode_ids: Vec<u8>,
    /// Mode-switch PHY selected by the operator for this neighbor
    pub ms_phy_mode_id: Option<u8>,
    pub rsl_in: Rsl,
    pub rsl_out: Rsl,
}

impl Neighbor {
    fn new(eui64: Eui64, lifetime: u32) -> Self {
        Self {
            eui64,
            short_addr: crate::MacAddr::SHORT_NONE,
            lifetime,
            lifetime_full: lifetime,
            connected: false,
            trusted: false,
            link_role: LinkRole::default(),
            node_role: NodeRole::default(),
            phy_mode_ids: Vec::new(),
            ms_phy_mode_id: None,
            rsl_in: Rsl::default(),
            rsl_out: Rsl::default(),
        }
    }
}

/// Bounded neighbor arena
pub struct NeighborTable {
    entries: Vec<Option<Neighbor>>,
    default_lifetime: u32,
}

impl NeighborTable {
    pub fn new(capacity: usize, default_lifetime: u32) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            default_lifetime,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Finds or allocates the entry for `eui64`. Allocation fails only
    /// when the table is full.
    pub fn allocate(&mut self, eui64: Eui64) -> Option<NeighborIndex> {
        if let Some(idx) = self.index_of(eui64) {
            return Some(idx);
        }
        let slot = self.entries.iter().position(|e| e.is_none())?;
        self.entries[slot] = Some(Neighbor::new(eui64, self.default_lifetime));
        Some(slot as NeighborIndex)
    }

    pub fn index_of(&self, eui64: Eui64) -> Option<NeighborIndex> {
        self.entries
            .iter()
            .position(|e| matches!(e, Some(n) if n.eui64 == eui64))
            .map(|i| i as NeighborIndex)
    }

    pub fn by_short(&self, short_addr: u16) -> Option<NeighborIndex> {
        if short_addr == crate::MacAddr::SHORT_NONE {
            return None;
        }
        self.entries
            .iter()
            .position(|e| matches!(e, Some(n) if n.short_addr == short_addr))
            .map(|i| i as NeighborIndex)
    }

    pub fn get(&self, idx: NeighborIndex) -> Option<&Neighbor> {
        self.entries.get(usize::from(idx))?.as_ref()
    }

    pub fn get_mut(&mut self, idx: NeighborIndex) -> Option<&mut Neighbor> {
        self.entries.get_mut(usize::from(idx))?.as_mut()
    }

    /// Grants the entry its full lifetime again (called on reception)
    pub fn refresh(&mut self, idx: NeighborIndex) {
        if let Some(n) = self.get_mut(idx) {
            n.lifetime = n.lifetime_full;
        }
    }

    /// Explicit removal; returns the entry so the caller can notify
    pub fn remove(&mut self, idx: NeighborIndex) -> Option<Neighbor> {
        self.entries.get_mut(usize::from(idx))?.take()
    }

    /// One second of aging; returns the entries that expired, already
    /// removed from the table
    pub fn tick_second(&mut self) -> Vec<(NeighborIndex, Neighbor)> {
        let mut expired = Vec::new();
        for (i, slot) in self.entries.iter_mut().enumerate() {
            if let Some(n) = slot {
                if n.lifetime <= 1 {
                    expired.push((i as NeighborIndex, slot.take().unwrap()));
                } else {
                    n.lifetime -= 1;
                }
            }
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = (NeighborIndex, &Neighbor)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|n| (i as NeighborIndex, n)))
    }

    /// Drops every entry (FAN teardown)
    pub fn clear(&mut self) -> Vec<(NeighborIndex, Neighbor)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.take().map(|n| (i as NeighborIndex, n)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eui(n: u8) -> Eui64 {
        Eui64([0, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn allocation_reuses_freed_slots() {
        let mut table = NeighborTable::new(2, 100);
        let a = table.allocate(eui(1)).unwrap();
        let b = table.allocate(eui(2)).unwrap();
        assert!(table.allocate(eui(3)).is_none());
        // Same EUI-64 maps to the same index
        assert_eq!(table.allocate(eui(1)), Some(a));
        table.remove(a).unwrap();
        let c = table.allocate(eui(3)).unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn expiry_removes_and_reports() {
        let mut table = NeighborTable::new(4, 2);
        let idx = table.allocate(eui(1)).unwrap();
        assert!(table.tick_second().is_empty());
        table.refresh(idx);
        assert!(table.tick_second().is_empty());
        let expired = table.tick_second();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, idx);
        assert!(table.get(idx).is_none());
    }

    #[test]
    fn short_address_lookup_ignores_the_none_value() {
        let mut table = NeighborTable::new(4, 100);
        let idx = table.allocate(eui(1)).unwrap();
        assert_eq!(table.by_short(crate::MacAddr::SHORT_NONE), None);
        table.get_mut(idx).unwrap().short_addr = 0x0012;
        assert_eq!(table.by_short(0x0012), Some(idx));
    }

    #[test]
    fn rsl_converges_toward_samples() {
        let mut rsl = Rsl::default();
        rsl.update(-70);
        assert_eq!(rsl.dbm(), Some(-70));
        for _ in 0..40 {
            rsl.update(-50);
        }
        let settled = rsl.dbm().unwrap();
        assert!(settled > -55, "{settled}");
    }
}
