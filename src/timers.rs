//! Named periodic timers, all derived from one canonical 100 ms tick.
//!
//! Each subsystem owns one or more entries here; the engine feeds the
//! tick in and dispatches the timers that came due, in declaration order.
//! Nothing else in the process keeps time.

use std::time::Duration;

/// The canonical tick period
pub const TICK: Duration = Duration::from_millis(100);

/// Ticks per second, for the timers that think in seconds
pub const TICKS_PER_SECOND: u32 = 10;

/// Every named timer in the process
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerId {
    MonotonicTime,
    MplSlow,
    RplFast,
    RplSlow,
    PaeFast,
    PaeSlow,
    IpFrag,
    IcmpFast,
    MldFast,
    MldSlow,
    AddrFast,
    AddrSlow,
    Nd,
    Etx,
    Adaptation,
    NeighborTable,
    LowpanContext,
    Bootstrap,
    ReachableTime,
    WsCommonFast,
    WsCommonSlow,
    DhcpSocket,
}

struct Entry {
    id: TimerId,
    period: u32,
    left: u32,
}

/// The timer table: fixed set, fixed periods, created once at startup
pub struct Timers {
    entries: Vec<Entry>,
}

impl Timers {
    pub fn new() -> Self {
        use TimerId::*;
        let periods = [
            (MonotonicTime, 10),
            (MplSlow, 10),
            (RplFast, 1),
            (RplSlow, 10),
            (PaeFast, 1),
            (PaeSlow, 10),
            (IpFrag, 10),
            (IcmpFast, 1),
            (MldFast, 1),
            (MldSlow, 10),
            (AddrFast, 1),
            (AddrSlow, 10),
            (Nd, 1),
            (Etx, 10),
            (Adaptation, 1),
            (NeighborTable, 10),
            (LowpanContext, 1),
            (Bootstrap, 1),
            (ReachableTime, 10),
            (WsCommonFast, 1),
            (WsCommonSlow, 10),
            (DhcpSocket, 10),
        ];
        Self {
            entries: periods
                .into_iter()
                .map(|(id, period)| Entry {
                    id,
                    period,
                    left: period,
                })
                .collect(),
        }
    }

    /// Advances all timers by one tick and returns the ones that expired,
    /// in declaration order
    pub fn tick(&mut self) -> Vec<TimerId> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            entry.left -= 1;
            if entry.left == 0 {
                entry.left = entry.period;
                due.push(entry.id);
            }
        }
        due
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_timers_fire_every_tick() {
        let mut timers = Timers::new();
        let due = timers.tick();
        assert!(due.contains(&TimerId::RplFast));
        assert!(due.contains(&TimerId::WsCommonFast));
        assert!(!due.contains(&TimerId::NeighborTable));
    }

    #[test]
    fn second_timers_fire_every_ten_ticks() {
        let mut timers = Timers::new();
        let mut neighbor_fires = 0;
        for _ in 0..100 {
            if timers.tick().contains(&TimerId::NeighborTable) {
                neighbor_fires += 1;
            }
        }
        assert_eq!(neighbor_fires, 10);
    }

    #[test]
    fn dispatch_order_is_stable() {
        let mut timers = Timers::new();
        for _ in 0..9 {
            timers.tick();
        }
        let due = timers.tick();
        let mono = due.iter().position(|t| *t == TimerId::MonotonicTime);
        let dhcp = due.iter().position(|t| *t == TimerId::DhcpSocket);
        assert!(mono.unwrap() < dhcp.unwrap());
    }
}
