//! RPL non-storing root.
//!
//! The border router is the single DODAG root: it emits DIOs on a
//! trickle, absorbs non-storing DAOs into a child → parent map and
//! computes source routes for downward traffic by walking that map
//! backwards. Poisoning advertises infinite rank three times, then the
//! root goes quiet so descendants leave cleanly.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use rand::Rng;

use crate::config::RplConfig;
use crate::trickle::{Trickle, TrickleParams};
use crate::wire::rpl::{
    Dao, DaoAck, Dio, RplMessage, RplOption, SourceRouteHeader, INFINITE_RANK, MOP_NON_STORING,
};

/// Rank of the root
const ROOT_RANK: u16 = 128;
/// Sequence counters start in the lollipop region (RFC 6550 §7.2)
const LOLLIPOP_INIT: u8 = 240;
/// Rough bytes retained per downward route entry, for the soft limit
const CHILD_ENTRY_COST: usize = 96;

/// A descendant known through its DAO
#[derive(Clone, Debug)]
struct Child {
    parent: Ipv6Addr,
    /// Seconds of path lifetime left
    lifetime_s: u32,
    path_sequence: u8,
}

/// Messages the root wants transmitted, with their IPv6 destination
/// (`None` = all-RPL-nodes multicast)
pub type RplTx = (Option<Ipv6Addr>, RplMessage);

/// The root state machine
pub struct RplRoot {
    cfg: RplConfig,
    dodag_id: Ipv6Addr,
    version: u8,
    dtsn: u8,
    trickle: Trickle,
    prefix: Option<(Ipv6Addr, u8, u32)>,
    routes: Vec<(Ipv6Addr, u8, u32)>,
    children: HashMap<Ipv6Addr, Child>,
    /// Force-leaf or post-poison: no DIO emission
    leaf: bool,
    /// Poison DIOs still owed
    poison_left: u8,
    running: bool,
}

impl RplRoot {
    /// Creates the root; re-issuing replaces any previous root state
    pub fn new(cfg: RplConfig, dodag_id: Ipv6Addr) -> Self {
        // DIO interval minimum is 2^n milliseconds, trickle runs in ticks
        let imin_ticks = (1u32 << cfg.dio_interval_min.min(24)) / 100;
        let params = TrickleParams {
            imin: imin_ticks.max(1),
            imax: (imin_ticks << cfg.dio_interval_doublings.min(16)).max(2),
            k: u16::from(cfg.dio_redundancy),
        };
        Self {
            cfg,
            dodag_id,
            version: LOLLIPOP_INIT,
            dtsn: LOLLIPOP_INIT,
            trickle: Trickle::new(params),
            prefix: None,
            routes: Vec::new(),
            children: HashMap::new(),
            leaf: false,
            poison_left: 0,
            running: false,
        }
    }

    pub fn dodag_id(&self) -> Ipv6Addr {
        self.dodag_id
    }

    pub fn start(&mut self, rng: &mut impl Rng) {
        self.running = true;
        self.trickle.start(rng);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.trickle.stop();
        self.children.clear();
    }

    /// Updates the prefix information option carried in DIOs
    pub fn advertise_prefix(&mut self, prefix: Ipv6Addr, prefix_len: u8, lifetime: u32) {
        self.prefix = Some((prefix, prefix_len, lifetime));
    }

    /// Adds or refreshes a route information option
    pub fn advertise_route(&mut self, prefix: Ipv6Addr, prefix_len: u8, lifetime: u32) {
        if let Some(entry) = self.routes.iter_mut().find(|(p, l, _)| *p == prefix && *l == prefix_len)
        {
            entry.2 = lifetime;
        } else {
            self.routes.push((prefix, prefix_len, lifetime));
        }
    }

    /// Toggles DIO emission off (leaf) or back on
    pub fn force_leaf(&mut self, leaf: bool) {
        self.leaf = leaf;
    }

    /// Makes every node rejoin the DODAG
    pub fn version_increment(&mut self, rng: &mut impl Rng) {
        self.version = self.version.wrapping_add(1);
        self.trickle.inconsistent(rng);
    }

    /// Asks descendants to refresh their DAOs
    pub fn dtsn_increment(&mut self, rng: &mut impl Rng) {
        self.dtsn = self.dtsn.wrapping_add(1);
        self.trickle.inconsistent(rng);
    }

    /// Clean shutdown: three poison DIOs, then leaf
    pub fn poison(&mut self) {
        self.poison_left = 3;
    }

    fn build_dio(&self, rank: u16) -> Dio {
        let mut options = vec![RplOption::DodagConfig {
            authenticated: false,
            path_control_size: 0,
            interval_doublings: self.cfg.dio_interval_doublings,
            interval_min: self.cfg.dio_interval_min,
            redundancy: self.cfg.dio_redundancy,
            max_rank_increase: self.cfg.max_rank_increase,
            min_hop_rank_increase: self.cfg.min_hop_rank_increase,
            objective_code_point: 1,
            default_lifetime: self.cfg.default_lifetime,
            lifetime_unit: self.cfg.lifetime_unit,
        }];
        if let Some((prefix, prefix_len, lifetime)) = self.prefix {
            options.push(RplOption::PrefixInfo {
                prefix_len,
                on_link: false,
                autonomous: true,
                router_address: true,
                valid_lifetime: lifetime,
                preferred_lifetime: lifetime,
                prefix,
            });
        }
        for (prefix, prefix_len, lifetime) in &self.routes {
            options.push(RplOption::RouteInfo {
                prefix_len: *prefix_len,
                preference: 0,
                lifetime: *lifetime,
                prefix: *prefix,
            });
        }
        Dio {
            instance_id: self.cfg.instance_id,
            version: self.version,
            rank,
            grounded: true,
            mop: MOP_NON_STORING,
            preference: 0,
            dtsn: self.dtsn,
            dodag_id: self.dodag_id,
            options,
        }
    }

    /// One canonical tick
    pub fn on_tick(&mut self, rng: &mut impl Rng) -> Vec<RplTx> {
        if !self.running {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.poison_left > 0 {
            self.poison_left -= 1;
            out.push((None, RplMessage::Dio(self.build_dio(INFINITE_RANK))));
            if self.poison_left == 0 {
                // Poison sent: stop advertising for good
                self.leaf = true;
            }
            return out;
        }
        if self.trickle.tick(rng) && !self.leaf {
            out.push((None, RplMessage::Dio(self.build_dio(ROOT_RANK))));
        }
        out
    }

    /// Handles a received RPL control message
    pub fn handle(&mut self, msg: RplMessage, src: Ipv6Addr, rng: &mut impl Rng) -> Vec<RplTx> {
        let mut out = Vec::new();
        match msg {
            RplMessage::Dis => {
                // Solicitation: answer directly and reset the trickle
                self.trickle.inconsistent(rng);
                if !self.leaf {
                    out.push((Some(src), RplMessage::Dio(self.build_dio(ROOT_RANK))));
                }
            }
            RplMessage::Dio(dio) => {
                // Another node advertising our DODAG consistently
                if dio.dodag_id == self.dodag_id && dio.version == self.version {
                    self.trickle.consistent();
                } else if dio.dodag_id == self.dodag_id {
                    self.trickle.inconsistent(rng);
                }
            }
            RplMessage::Dao(dao) => {
                if dao.instance_id != self.cfg.instance_id {
                    return out;
                }
                let acked = self.absorb_dao(&dao, src);
                if dao.expect_ack {
                    out.push((
                        Some(src),
                        RplMessage::DaoAck(DaoAck {
                            instance_id: self.cfg.instance_id,
                            sequence: dao.sequence,
                            status: if acked { 0 } else { 1 },
                            dodag_id: dao.dodag_id,
                        }),
                    ));
                }
            }
            RplMessage::DaoAck(_) => {}
        }
        out
    }

    /// Aggregates one DAO's target/transit pairs
    fn absorb_dao(&mut self, dao: &Dao, src: Ipv6Addr) -> bool {
        let mut targets: Vec<(Ipv6Addr, u8)> = Vec::new();
        let mut accepted = false;
        for option in &dao.options {
            match option {
                RplOption::Target { prefix, prefix_len } => {
                    targets.push((*prefix, *prefix_len));
                }
                RplOption::Transit {
                    parent,
                    path_lifetime,
                    path_sequence,
                    ..
                } => {
                    let lifetime_s =
                        u32::from(*path_lifetime) * u32::from(self.cfg.lifetime_unit);
                    for (target, prefix_len) in targets.drain(..) {
                        if prefix_len != 128 {
                            log::debug!("rpl: ignore non-host DAO target {target}/{prefix_len}");
                            continue;
                        }
                        if *path_lifetime == 0 {
                            // No-path: withdrawal
                            self.children.remove(&target);
                            accepted = true;
                            continue;
                        }
                        let parent = parent.unwrap_or(src);
                        self.children.insert(
                            target,
                            Child {
                                parent,
                                lifetime_s,
                                path_sequence: *path_sequence,
                            },
                        );
                        accepted = true;
                    }
                }
                _ => {}
            }
        }
        self.enforce_soft_limit();
        accepted
    }

    /// The soft memory bound prunes the entries closest to expiry; the
    /// hard bound stays disabled for a root
    fn enforce_soft_limit(&mut self) {
        if self.cfg.memory_soft_limit == 0 {
            return;
        }
        while self.children.len() * CHILD_ENTRY_COST > self.cfg.memory_soft_limit {
            let Some(victim) = self
                .children
                .iter()
                .min_by_key(|(_, c)| c.lifetime_s)
                .map(|(addr, _)| *addr)
            else {
                break;
            };
            log::warn!("rpl: soft limit reached, pruning {victim}");
            self.children.remove(&victim);
        }
    }

    /// One second of aging: expired DAOs withdraw their routes
    pub fn tick_second(&mut self) {
        self.children.retain(|target, child| {
            if child.lifetime_s <= 1 {
                log::debug!("rpl: DAO for {target} expired");
                false
            } else {
                child.lifetime_s -= 1;
                true
            }
        });
    }

    /// Computes the downward source route: intermediate hops then the
    /// destination, every hop backed by a live DAO
    pub fn source_route(&self, dst: &Ipv6Addr) -> Option<Vec<Ipv6Addr>> {
        let mut path = vec![*dst];
        let mut cursor = *dst;
        for _ in 0..self.children.len() + 1 {
            let child = self.children.get(&cursor)?;
            if child.parent == self.dodag_id {
                path.reverse();
                return Some(path);
            }
            // A hop is only usable while its own DAO is live
            cursor = child.parent;
            path.push(cursor);
        }
        // Loop in the parent chain
        None
    }

    /// Builds the routing header for a downward packet, or `None` when no
    /// route exists (or the destination is a direct child)
    pub fn source_route_header(&self, dst: &Ipv6Addr, next_header: u8) -> Option<SourceRouteHeader> {
        let path = self.source_route(dst)?;
        if path.len() < 2 {
            return None;
        }
        let hops = path[..path.len() - 1].to_vec();
        Some(SourceRouteHeader {
            next_header,
            segments_left: hops.len() as u8,
            hops,
        })
    }

    /// Live descendants with their parents, for the operator surface
    pub fn descendants(&self) -> impl Iterator<Item = (&Ipv6Addr, &Ipv6Addr)> {
        self.children.iter().map(|(t, c)| (t, &c.parent))
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn dtsn(&self) -> u8 {
        self.dtsn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(tail: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, tail)
    }

    fn root() -> RplRoot {
        let mut cfg = RplConfig::default();
        cfg.lifetime_unit = 60;
        RplRoot::new(cfg, addr(1))
    }

    fn dao_from(parent_of: &[(u16, u16)], seq: u8, ack: bool) -> Dao {
        let mut options = Vec::new();
        for (target, parent) in parent_of {
            options.push(RplOption::Target {
                prefix_len: 128,
                prefix: addr(*target),
            });
            options.push(RplOption::Transit {
                external: false,
                path_control: 0,
                path_sequence: seq,
                path_lifetime: 30,
                parent: Some(addr(*parent)),
            });
        }
        Dao {
            instance_id: 1,
            expect_ack: ack,
            sequence: seq,
            dodag_id: Some(addr(1)),
            options,
        }
    }

    #[test]
    fn dao_aggregation_yields_source_routes() {
        let mut rng = StdRng::seed_from_u64(0xda0);
        let mut root = root();
        root.start(&mut rng);
        // A → B → root, C → B → root, B → root
        root.handle(RplMessage::Dao(dao_from(&[(0xb, 1)], 1, false)), addr(0xb), &mut rng);
        root.handle(RplMessage::Dao(dao_from(&[(0xa, 0xb)], 1, false)), addr(0xa), &mut rng);
        root.handle(RplMessage::Dao(dao_from(&[(0xc, 0xb)], 1, false)), addr(0xc), &mut rng);

        assert_eq!(root.source_route(&addr(0xa)).unwrap(), vec![addr(0xb), addr(0xa)]);
        assert_eq!(root.source_route(&addr(0xc)).unwrap(), vec![addr(0xb), addr(0xc)]);
        assert_eq!(root.source_route(&addr(0xb)).unwrap(), vec![addr(0xb)]);
        assert!(root.source_route(&addr(0xd)).is_none());
    }

    #[test]
    fn expired_intermediate_withdraws_the_whole_route() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut root = root();
        root.start(&mut rng);
        root.handle(RplMessage::Dao(dao_from(&[(0xb, 1)], 1, false)), addr(0xb), &mut rng);
        root.handle(RplMessage::Dao(dao_from(&[(0xa, 0xb)], 1, false)), addr(0xa), &mut rng);

        // Age B's DAO out (30 lifetime units × 60 s)
        for _ in 0..30 * 60 {
            // Refresh A's own DAO so only B expires
            if root.children.get(&addr(0xa)).is_some() {
                root.children.get_mut(&addr(0xa)).unwrap().lifetime_s = 1000;
            }
            root.tick_second();
        }
        assert!(root.source_route(&addr(0xa)).is_none());

        // B's refresh restores the path
        root.handle(RplMessage::Dao(dao_from(&[(0xb, 1)], 2, false)), addr(0xb), &mut rng);
        assert_eq!(root.source_route(&addr(0xa)).unwrap(), vec![addr(0xb), addr(0xa)]);
    }

    #[test]
    fn dao_with_ack_flag_is_acknowledged() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut root = root();
        root.start(&mut rng);
        let out = root.handle(RplMessage::Dao(dao_from(&[(0xb, 1)], 7, true)), addr(0xb), &mut rng);
        match &out[..] {
            [(Some(dst), RplMessage::DaoAck(ack))] => {
                assert_eq!(*dst, addr(0xb));
                assert_eq!(ack.sequence, 7);
                assert_eq!(ack.status, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn no_path_transit_withdraws() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut root = root();
        root.start(&mut rng);
        root.handle(RplMessage::Dao(dao_from(&[(0xb, 1)], 1, false)), addr(0xb), &mut rng);
        assert_eq!(root.child_count(), 1);
        let mut withdraw = dao_from(&[(0xb, 1)], 2, false);
        if let Some(RplOption::Transit { path_lifetime, .. }) = withdraw.options.get_mut(1) {
            *path_lifetime = 0;
        }
        root.handle(RplMessage::Dao(withdraw), addr(0xb), &mut rng);
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn poison_emits_three_infinite_rank_dios_then_silence() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut root = root();
        root.start(&mut rng);
        root.poison();
        let mut poison_dios = 0;
        for _ in 0..10_000 {
            for (_, msg) in root.on_tick(&mut rng) {
                match msg {
                    RplMessage::Dio(dio) if dio.rank == INFINITE_RANK => poison_dios += 1,
                    RplMessage::Dio(_) => panic!("ranked DIO after poison"),
                    _ => {}
                }
            }
        }
        assert_eq!(poison_dios, 3);
    }

    #[test]
    fn dis_answers_with_a_unicast_dio() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut root = root();
        root.start(&mut rng);
        root.advertise_prefix(addr(0), 64, 7200);
        let out = root.handle(RplMessage::Dis, addr(0x33), &mut rng);
        match &out[..] {
            [(Some(dst), RplMessage::Dio(dio))] => {
                assert_eq!(*dst, addr(0x33));
                assert_eq!(dio.rank, ROOT_RANK);
                assert!(dio
                    .options
                    .iter()
                    .any(|o| matches!(o, RplOption::PrefixInfo { .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn version_and_dtsn_lollipop() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut root = root();
        root.start(&mut rng);
        assert_eq!(root.version(), 240);
        root.version_increment(&mut rng);
        assert_eq!(root.version(), 241);
        root.dtsn_increment(&mut rng);
        assert_eq!(root.dtsn(), 241);
    }

    #[test]
    fn soft_limit_prunes_shortest_lived() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut cfg = RplConfig::default();
        cfg.memory_soft_limit = 2 * CHILD_ENTRY_COST;
        let mut root = RplRoot::new(cfg, addr(1));
        root.start(&mut rng);
        for n in 2..=4u16 {
            root.handle(
                RplMessage::Dao(dao_from(&[(n, 1)], n as u8, false)),
                addr(n),
                &mut rng,
            );
            // Stagger lifetimes so the first is the shortest lived
            root.tick_second();
        }
        assert_eq!(root.child_count(), 2);
        assert!(root.source_route(&addr(2)).is_none());
    }
}
