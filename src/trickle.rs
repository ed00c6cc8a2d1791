//! Trickle timer (RFC 6206).
//!
//! Drives the PA/PC management frames and their LFN variants: each
//! instance transmits within a randomized window of its current interval,
//! suppresses itself when it has heard enough consistent traffic, doubles
//! the interval while the network agrees and snaps back to `imin` on any
//! inconsistency.
//!
//! The timer counts in the canonical 100 ms ticks so it can ride the
//! shared timer wheel.

use rand::Rng;

use crate::timers::TICKS_PER_SECOND;

/// Trickle configuration
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TrickleParams {
    /// Smallest interval, ticks
    pub imin: u32,
    /// Largest interval, ticks
    pub imax: u32,
    /// Redundancy constant; 0 disables suppression
    pub k: u16,
}

impl TrickleParams {
    pub fn from_secs(imin: u32, imax: u32, k: u16) -> Self {
        Self {
            imin: imin * TICKS_PER_SECOND,
            imax: imax * TICKS_PER_SECOND,
            k,
        }
    }
}

/// One trickle instance
#[derive(Debug)]
pub struct Trickle {
    params: TrickleParams,
    /// Current interval length, ticks
    i: u32,
    /// Transmission point within the interval, ticks
    t: u32,
    /// Ticks elapsed in the current interval
    elapsed: u32,
    /// Consistent transmissions heard this interval
    c: u16,
    transmitted: bool,
    running: bool,
}

impl Trickle {
    pub fn new(params: TrickleParams) -> Self {
        Self {
            params,
            i: 0,
            t: 0,
            elapsed: 0,
            c: 0,
            transmitted: false,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts the timer at the smallest interval
    pub fn start(&mut self, rng: &mut impl Rng) {
        self.running = true;
        self.i = self.params.imin;
        self.begin_interval(rng);
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    fn begin_interval(&mut self, rng: &mut impl Rng) {
        self.elapsed = 0;
        self.c = 0;
        self.transmitted = false;
        // t drawn from [I/2, I)
        self.t = rng.gen_range(self.i / 2..self.i.max(1));
    }

    /// A consistent frame was heard
    pub fn consistent(&mut self) {
        self.c = self.c.saturating_add(1);
    }

    /// An inconsistent frame was heard: snap the interval back down
    pub fn inconsistent(&mut self, rng: &mut impl Rng) {
        if self.running && self.i > self.params.imin {
            self.i = self.params.imin;
            self.begin_interval(rng);
        }
    }

    /// Advances one tick; returns true when the caller should transmit
    pub fn tick(&mut self, rng: &mut impl Rng) -> bool {
        if !self.running {
            return false;
        }
        self.elapsed += 1;
        let mut fire = false;
        if !self.transmitted && self.elapsed >= self.t {
            self.transmitted = true;
            // Suppressed when enough consistent traffic was heard
            fire = self.params.k == 0 || self.c < self.params.k;
        }
        if self.elapsed >= self.i {
            self.i = (self.i * 2).min(self.params.imax);
            self.begin_interval(rng);
        }
        fire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn first_transmission_lands_in_the_second_half_of_imin() {
        let mut rng = rng();
        let params = TrickleParams::from_secs(15, 960, 1);
        let mut trickle = Trickle::new(params);
        trickle.start(&mut rng);
        let mut fired_at = None;
        for tick in 1..=params.imin {
            if trickle.tick(&mut rng) {
                fired_at = Some(tick);
                break;
            }
        }
        let fired_at = fired_at.expect("must transmit within imin");
        assert!(fired_at >= params.imin / 2);
        assert!(fired_at <= params.imin);
    }

    #[test]
    fn consistent_traffic_suppresses() {
        let mut rng = rng();
        let mut trickle = Trickle::new(TrickleParams::from_secs(15, 960, 1));
        trickle.start(&mut rng);
        trickle.consistent();
        for _ in 0..15 * TICKS_PER_SECOND {
            assert!(!trickle.tick(&mut rng));
        }
    }

    #[test]
    fn interval_doubles_up_to_imax() {
        let mut rng = rng();
        let params = TrickleParams {
            imin: 4,
            imax: 16,
            k: 0,
        };
        let mut trickle = Trickle::new(params);
        trickle.start(&mut rng);
        // Swallow the first interval, then measure the next ones
        let mut fires = Vec::new();
        let mut clock = 0u32;
        for _ in 0..4 + 8 + 16 + 16 {
            clock += 1;
            if trickle.tick(&mut rng) {
                fires.push(clock);
            }
        }
        // One transmission per interval, intervals 4, 8, 16, 16
        assert_eq!(fires.len(), 4);
        assert!(fires[1] > 4 && fires[1] <= 12);
        assert!(fires[2] > 12 && fires[2] <= 28);
        assert!(fires[3] > 28 && fires[3] <= 44);
    }

    #[test]
    fn inconsistency_resets_the_interval() {
        let mut rng = rng();
        let params = TrickleParams {
            imin: 4,
            imax: 1024,
            k: 1,
        };
        let mut trickle = Trickle::new(params);
        trickle.start(&mut rng);
        for _ in 0..64 {
            trickle.tick(&mut rng);
        }
        assert!(trickle.i > params.imin);
        trickle.inconsistent(&mut rng);
        assert_eq!(trickle.i, params.imin);
    }
}
