//! Wi-SUN management frames: the asynchronous PA/PC machinery that forms
//! and maintains the PAN.
//!
//! As the root, the border router advertises on trickle timers: PAN
//! Advertisement (PA) answers discovery, PAN Configuration (PC) carries
//! schedules, the PAN version and the group key hashes. Solicits (PAS,
//! PCS) from joining nodes are trickle inconsistencies; consistent peer
//! advertisements feed suppression. The LFN variants LPC runs a slower
//! trickle and LPA is sent once per solicit, back to the node that asked.

use rand::Rng;

use crate::fhss::Fhss;
use crate::mac::{EnqueueReq, TxPriority};
use crate::neighbor::{NeighborIndex, NeighborTable, NodeRole};
use crate::trickle::{Trickle, TrickleParams};
use crate::wire::ie::{self, BroadcastSchedule, FrameType, HeaderIe, Schedule, WpIe};
use crate::wire::util::Serializer;
use crate::Eui64;

/// What inbound analysis asks the rest of the engine to do
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MngtSignal {
    /// A neighbor advertises GTK hashes that do not match ours; the
    /// authenticator should push fresh keys
    KeyRefreshNeeded,
    /// Same for the LFN group keys
    LgtkRefreshNeeded,
    /// A neighbor entry was created or refreshed by a management frame
    NeighborSeen(NeighborIndex),
}

/// Identity and key state the management frames advertise, supplied by
/// the engine on every call
pub struct PanAdvertInfo<'a> {
    pub pan_id: u16,
    pub network_name: &'a str,
    pub pan_size: u16,
    pub fan_version: u8,
    pub gtk_hashes: [[u8; 8]; 4],
    pub gtk_active_index: u8,
    pub lgtk_hashes: [Option<[u8; 8]>; 3],
    pub lgtk_active_index: u8,
}

/// The IEs pulled out of one received management frame
#[derive(Default, Debug)]
pub struct WsFrameIes {
    pub utt: Option<(FrameType, u32)>,
    pub bt: Option<(u16, u32)>,
    pub us: Option<Schedule>,
    pub bs: Option<BroadcastSchedule>,
    pub pan: Option<(u16, u16)>,
    pub netname: Option<String>,
    pub pan_version: Option<u16>,
    pub gtk_hash: Option<[[u8; 8]; 4]>,
    pub lgtk_hash: Option<[Option<[u8; 8]>; 3]>,
}

impl WsFrameIes {
    pub fn parse(header_ies: &[u8], payload_ies: &[u8]) -> Self {
        let mut out = Self::default();
        if let Ok(hies) = ie::parse_header_ies(header_ies) {
            for hie in hies {
                match hie {
                    HeaderIe::Utt { frame_type, ufsi } => out.utt = Some((frame_type, ufsi)),
                    HeaderIe::Bt {
                        slot,
                        interval_offset,
                    } => out.bt = Some((slot, interval_offset)),
                    _ => {}
                }
            }
        }
        if let Ok(pies) = ie::parse_wp_ies(payload_ies) {
            for pie in pies {
                match pie {
                    WpIe::Us(s) => out.us = Some(s),
                    WpIe::Bs(b) => out.bs = Some(b),
                    WpIe::Pan {
                        pan_size,
                        routing_cost,
                        ..
                    } => out.pan = Some((pan_size, routing_cost)),
                    WpIe::NetName(n) => out.netname = Some(n),
                    WpIe::PanVersion(v) => out.pan_version = Some(v),
                    WpIe::GtkHash(h) => out.gtk_hash = Some(h),
                    WpIe::LgtkHash { hashes, .. } => out.lgtk_hash = Some(hashes),
                    WpIe::LfnVersion(_) => {}
                }
            }
        }
        out
    }
}

/// The border router's management state machine
pub struct WsMngt {
    trickle_pa: Trickle,
    trickle_pc: Trickle,
    trickle_lpc: Trickle,
    /// LPA goes to the node that solicited it
    lpa_dst: Option<Eui64>,
    pan_version: u16,
    lfn_version: u16,
    running: bool,
}

impl WsMngt {
    pub fn new(params: TrickleParams, lfn_params: TrickleParams) -> Self {
        Self {
            trickle_pa: Trickle::new(params),
            trickle_pc: Trickle::new(params),
            trickle_lpc: Trickle::new(lfn_params),
            lpa_dst: None,
            pan_version: 0,
            lfn_version: 0,
            running: false,
        }
    }

    pub fn pan_version(&self) -> u16 {
        self.pan_version
    }

    pub fn start(&mut self, rng: &mut impl Rng) {
        self.running = true;
        self.trickle_pa.start(rng);
        self.trickle_pc.start(rng);
        self.trickle_lpc.start(rng);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.trickle_pa.stop();
        self.trickle_pc.stop();
        self.trickle_lpc.stop();
        self.lpa_dst = None;
    }

    /// The PAN configuration changed: bump the version so routers fetch
    /// the new one
    pub fn pan_version_increment(&mut self, rng: &mut impl Rng) {
        self.pan_version = self.pan_version.wrapping_add(1);
        self.trickle_pc.inconsistent(rng);
    }

    /// The authenticator rotated keys: reset the configuration trickles
    /// so the new hashes propagate fast
    pub fn keys_changed(&mut self, rng: &mut impl Rng) {
        self.pan_version = self.pan_version.wrapping_add(1);
        self.lfn_version = self.lfn_version.wrapping_add(1);
        self.trickle_pc.inconsistent(rng);
        self.trickle_lpc.inconsistent(rng);
    }

    /// One canonical tick; returns the frames to enqueue
    pub fn on_tick(
        &mut self,
        rng: &mut impl Rng,
        fhss: &Fhss,
        info: &PanAdvertInfo<'_>,
    ) -> Vec<EnqueueReq> {
        if !self.running {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.trickle_pa.tick(rng) {
            out.push(self.build_pa(fhss, info));
        }
        if self.trickle_pc.tick(rng) {
            out.push(self.build_pc(fhss, info));
        }
        if self.trickle_lpc.tick(rng) {
            out.push(self.build_lpc(fhss, info));
        }
        if let Some(dst) = self.lpa_dst.take() {
            out.push(self.build_lpa(fhss, info, dst));
        }
        out
    }

    fn utt(&self, fhss: &Fhss, frame_type: FrameType) -> Vec<u8> {
        let mut out = Vec::new();
        Serializer::new(&mut out)
            .serialize(HeaderIe::Utt {
                frame_type,
                ufsi: fhss.ufsi_now(),
            })
            .expect("header IE emission cannot fail");
        out
    }

    fn utt_bt(&self, fhss: &Fhss, frame_type: FrameType) -> Vec<u8> {
        let mut out = self.utt(fhss, frame_type);
        let (slot, interval_offset) = fhss.bt_now();
        Serializer::new(&mut out)
            .serialize(HeaderIe::Bt {
                slot,
                interval_offset,
            })
            .expect("header IE emission cannot fail");
        out
    }

    fn build_pa(&self, fhss: &Fhss, info: &PanAdvertInfo<'_>) -> EnqueueReq {
        let payload_ies = ie::emit_wp_ies(&[
            WpIe::Us(fhss.own_us_ie()),
            WpIe::Pan {
                pan_size: info.pan_size,
                // The root of the PAN has routing cost 0
                routing_cost: 0,
                use_parent_bs: false,
                routing_method: true,
                fan_tps_version: info.fan_version,
            },
            WpIe::NetName(info.network_name.to_string()),
        ])
        .expect("PA IEs are bounded");
        EnqueueReq::async_frame(
            FrameType::PanAdvert,
            payload_ies,
            self.utt(fhss, FrameType::PanAdvert),
        )
    }

    fn build_pc(&self, fhss: &Fhss, info: &PanAdvertInfo<'_>) -> EnqueueReq {
        let payload_ies = ie::emit_wp_ies(&[
            WpIe::Us(fhss.own_us_ie()),
            WpIe::Bs(fhss.own_bs_ie()),
            WpIe::PanVersion(self.pan_version),
            WpIe::GtkHash(info.gtk_hashes),
        ])
        .expect("PC IEs are bounded");
        let mut req = EnqueueReq::async_frame(
            FrameType::PanConfig,
            payload_ies,
            self.utt_bt(fhss, FrameType::PanConfig),
        );
        // The PC is authenticated with the active GTK so only joined
        // nodes act on it
        req.security_level = 6;
        req.key_index = info.gtk_active_index + 1;
        req
    }

    fn build_lpc(&self, fhss: &Fhss, info: &PanAdvertInfo<'_>) -> EnqueueReq {
        let payload_ies = ie::emit_wp_ies(&[
            WpIe::LfnVersion(self.lfn_version),
            WpIe::LgtkHash {
                active_index: info.lgtk_active_index,
                hashes: info.lgtk_hashes,
            },
        ])
        .expect("LPC IEs are bounded");
        let mut req = EnqueueReq::async_frame(
            FrameType::LfnPanConfig,
            payload_ies,
            self.utt_bt(fhss, FrameType::LfnPanConfig),
        );
        // LGTK slots ride key indexes 5..=7
        req.security_level = 6;
        req.key_index = info.lgtk_active_index + 5;
        req
    }

    fn build_lpa(&self, fhss: &Fhss, info: &PanAdvertInfo<'_>, dst: Eui64) -> EnqueueReq {
        let payload_ies = ie::emit_wp_ies(&[
            WpIe::Us(fhss.own_us_ie()),
            WpIe::Pan {
                pan_size: info.pan_size,
                routing_cost: 0,
                use_parent_bs: false,
                routing_method: true,
                fan_tps_version: info.fan_version,
            },
            WpIe::NetName(info.network_name.to_string()),
        ])
        .expect("LPA IEs are bounded");
        let mut req = EnqueueReq::async_frame(
            FrameType::LfnPanAdvert,
            payload_ies,
            self.utt(fhss, FrameType::LfnPanAdvert),
        );
        req.dst = Some(crate::MacAddr::Ext(dst));
        req.ack_requested = true;
        req.priority = TxPriority::High;
        req
    }

    /// Processes one received management frame
    #[allow(clippy::too_many_arguments)]
    pub fn analyze(
        &mut self,
        frame_type: FrameType,
        src: Eui64,
        ies: &WsFrameIes,
        rssi_dbm: i8,
        neighbors: &mut NeighborTable,
        fhss: &mut Fhss,
        info: &PanAdvertInfo<'_>,
        rng: &mut impl Rng,
    ) -> Vec<MngtSignal> {
        let mut signals = Vec::new();

        // Any management frame proves the neighbor is alive
        let idx = match neighbors.allocate(src) {
            Some(idx) => idx,
            None => {
                log::warn!("mngt: neighbor table full, ignoring {src}");
                return signals;
            }
        };
        neighbors.refresh(idx);
        if let Some(n) = neighbors.get_mut(idx) {
            n.rsl_in.update(rssi_dbm);
            if matches!(
                frame_type,
                FrameType::LfnPanAdvertSolicit | FrameType::LfnPanConfigSolicit
            ) {
                n.node_role = NodeRole::Lfn;
            }
        }
        signals.push(MngtSignal::NeighborSeen(idx));

        if let (Some(us), Some((_, ufsi))) = (&ies.us, &ies.utt) {
            fhss.learn_unicast(idx, us.clone(), *ufsi);
        }
        if let Some(bs) = &ies.bs {
            fhss.learn_broadcast(idx, bs.clone());
        }

        match frame_type {
            FrameType::PanAdvertSolicit => {
                // Someone is searching: advertise sooner
                self.trickle_pa.inconsistent(rng);
            }
            FrameType::PanConfigSolicit => {
                self.trickle_pc.inconsistent(rng);
            }
            FrameType::PanAdvert => {
                // A consistent advertisement for our PAN suppresses ours
                if ies.netname.as_deref() == Some(info.network_name) {
                    self.trickle_pa.consistent();
                }
            }
            FrameType::PanConfig => {
                match &ies.gtk_hash {
                    Some(hashes) if *hashes == info.gtk_hashes => {
                        self.trickle_pc.consistent();
                    }
                    Some(_) => {
                        // The neighbor runs stale keys
                        self.trickle_pc.inconsistent(rng);
                        signals.push(MngtSignal::KeyRefreshNeeded);
                    }
                    None => {}
                }
            }
            FrameType::LfnPanAdvertSolicit => {
                self.lpa_dst = Some(src);
            }
            FrameType::LfnPanConfigSolicit => {
                self.trickle_lpc.inconsistent(rng);
            }
            FrameType::LfnPanConfig => {
                if let Some(hashes) = &ies.lgtk_hash {
                    if *hashes != info.lgtk_hashes {
                        self.trickle_lpc.inconsistent(rng);
                        signals.push(MngtSignal::LgtkRefreshNeeded);
                    }
                }
            }
            _ => {}
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FhssConfig;
    use crate::timers::TICKS_PER_SECOND;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn eui(n: u8) -> Eui64 {
        Eui64([0, 0, 0, 0, 0, 0, 1, n])
    }

    fn fhss() -> Fhss {
        Fhss::new(eui(0), FhssConfig::default(), 69)
    }

    fn info() -> PanAdvertInfo<'static> {
        PanAdvertInfo {
            pan_id: 0xabcd,
            network_name: "field-7",
            pan_size: 10,
            fan_version: 2,
            gtk_hashes: [[1; 8], [0; 8], [0; 8], [0; 8]],
            gtk_active_index: 0,
            lgtk_hashes: [Some([2; 8]), None, None],
            lgtk_active_index: 0,
        }
    }

    fn mngt() -> WsMngt {
        WsMngt::new(
            TrickleParams::from_secs(15, 960, 1),
            TrickleParams::from_secs(60, 3840, 1),
        )
    }

    fn tick_until_pa(
        mngt: &mut WsMngt,
        fhss: &mut Fhss,
        rng: &mut StdRng,
        limit_ticks: u32,
    ) -> Option<u32> {
        let advert_info = info();
        for tick in 1..=limit_ticks {
            fhss.on_tick(100);
            let frames = mngt.on_tick(rng, fhss, &advert_info);
            if frames
                .iter()
                .any(|f| f.frame_type == FrameType::PanAdvert)
            {
                return Some(tick);
            }
        }
        None
    }

    #[test]
    fn pa_fires_within_imin_of_start() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut mngt = mngt();
        let mut fhss = fhss();
        mngt.start(&mut rng);
        let fired = tick_until_pa(&mut mngt, &mut fhss, &mut rng, 15 * TICKS_PER_SECOND).unwrap();
        assert!(fired >= 15 * TICKS_PER_SECOND / 2);
    }

    #[test]
    fn consistent_peer_pa_suppresses_ours() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut mngt = mngt();
        let mut fhss = fhss();
        let mut neighbors = NeighborTable::new(8, 100);
        mngt.start(&mut rng);
        // A peer advertising the same network before our fire point
        let ies = WsFrameIes {
            netname: Some("field-7".into()),
            ..Default::default()
        };
        mngt.analyze(
            FrameType::PanAdvert,
            eui(5),
            &ies,
            -70,
            &mut neighbors,
            &mut fhss,
            &info(),
            &mut rng,
        );
        assert!(
            tick_until_pa(&mut mngt, &mut fhss, &mut rng, 15 * TICKS_PER_SECOND).is_none()
        );
    }

    #[test]
    fn pas_resets_the_advertisement_trickle() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut mngt = mngt();
        let mut fhss = fhss();
        let mut neighbors = NeighborTable::new(8, 100);
        mngt.start(&mut rng);
        // Run far into the doubled intervals
        let advert_info = info();
        for _ in 0..200 * TICKS_PER_SECOND {
            mngt.on_tick(&mut rng, &fhss, &advert_info);
        }
        mngt.analyze(
            FrameType::PanAdvertSolicit,
            eui(6),
            &WsFrameIes::default(),
            -75,
            &mut neighbors,
            &mut fhss,
            &advert_info,
            &mut rng,
        );
        // Next advertisement comes within one imin again
        assert!(
            tick_until_pa(&mut mngt, &mut fhss, &mut rng, 15 * TICKS_PER_SECOND).is_some()
        );
    }

    #[test]
    fn stale_gtk_hash_triggers_refresh_signal() {
        let mut rng = StdRng::seed_from_u64(10);
        let mut mngt = mngt();
        let mut fhss = fhss();
        let mut neighbors = NeighborTable::new(8, 100);
        mngt.start(&mut rng);
        let ies = WsFrameIes {
            gtk_hash: Some([[9; 8], [0; 8], [0; 8], [0; 8]]),
            ..Default::default()
        };
        let signals = mngt.analyze(
            FrameType::PanConfig,
            eui(7),
            &ies,
            -60,
            &mut neighbors,
            &mut fhss,
            &info(),
            &mut rng,
        );
        assert!(signals.contains(&MngtSignal::KeyRefreshNeeded));
    }

    #[test]
    fn lpa_waits_for_its_solicit_and_goes_back_to_the_asker() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut mngt = mngt();
        let mut fhss = fhss();
        let mut neighbors = NeighborTable::new(8, 100);
        mngt.start(&mut rng);
        let advert_info = info();
        mngt.analyze(
            FrameType::LfnPanAdvertSolicit,
            eui(9),
            &WsFrameIes::default(),
            -80,
            &mut neighbors,
            &mut fhss,
            &advert_info,
            &mut rng,
        );
        let frames = mngt.on_tick(&mut rng, &fhss, &advert_info);
        let lpa = frames
            .iter()
            .find(|f| f.frame_type == FrameType::LfnPanAdvert)
            .expect("LPA after LPAS");
        assert_eq!(lpa.dst, Some(crate::MacAddr::Ext(eui(9))));
        // The asker is marked as an LFN
        let idx = neighbors.index_of(eui(9)).unwrap();
        assert_eq!(neighbors.get(idx).unwrap().node_role, NodeRole::Lfn);
        // Only once
        assert!(mngt
            .on_tick(&mut rng, &fhss, &advert_info)
            .iter()
            .all(|f| f.frame_type != FrameType::LfnPanAdvert));
    }

    #[test]
    fn management_rx_feeds_fhss_schedules() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut mngt = mngt();
        let mut fhss = fhss();
        let mut neighbors = NeighborTable::new(8, 100);
        let ies = WsFrameIes {
            utt: Some((FrameType::PanAdvert, 1234)),
            us: Some(fhss.own_us_ie()),
            ..Default::default()
        };
        mngt.analyze(
            FrameType::PanAdvert,
            eui(3),
            &ies,
            -65,
            &mut neighbors,
            &mut fhss,
            &info(),
            &mut rng,
        );
        let idx = neighbors.index_of(eui(3)).unwrap();
        assert!(fhss.neighbor_timing(idx).is_some());
    }
}
