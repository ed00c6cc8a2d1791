//! The operator surface.
//!
//! [`Handle`] is what the management bus adapter talks to: typed property
//! reads, methods, and a signal stream for the property-changed
//! notifications. Every call posts a request event into the engine's
//! queue and awaits the reply on a one-shot channel; the engine never
//! blocks on the operator.

use std::net::Ipv6Addr;

use tokio::sync::{mpsc, oneshot};

use crate::event::Event;
use crate::neighbor::NodeRole;
use crate::{Config, Eui64};

type Reply<T> = oneshot::Sender<T>;

/// One row of the `Nodes` property
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub eui64: Eui64,
    pub role: NodeRole,
    pub parent: Option<Ipv6Addr>,
    pub rsl_in_dbm: Option<i16>,
    pub rsl_out_dbm: Option<i16>,
    pub ipv6: Vec<Ipv6Addr>,
}

/// Signals pushed when observable property groups change
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PropertyChanged {
    GroupKeys,
    Nodes,
}

/// Errors surfaced to the operator
#[derive(Debug, PartialEq, Eq)]
pub enum HandleError {
    /// The engine's event loop is gone
    EngineGone,
    /// The request was refused
    Rejected(String),
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EngineGone => write!(f, "engine terminated"),
            Self::Rejected(why) => write!(f, "request rejected: {why}"),
        }
    }
}

type MethodReply = Reply<Result<(), String>>;

/// Requests the handle posts into the engine
#[derive(Debug)]
pub enum Request {
    // Property reads
    HwAddress(Reply<Eui64>),
    PanId(Reply<u16>),
    FanVersion(Reply<u8>),
    NetworkState(Reply<Vec<Ipv6Addr>>),
    Nodes(Reply<Vec<NodeInfo>>),
    Gtks(Reply<[Option<[u8; 16]>; 4]>),
    Lgtks(Reply<[Option<[u8; 16]>; 3]>),
    Gaks(Reply<[Option<[u8; 16]>; 4]>),
    Lgaks(Reply<[Option<[u8; 16]>; 3]>),
    GtkActiveIndex(Reply<u8>),
    TimingParams(Reply<(u32, u32, u16, u32)>),
    FhssChannelMask(Reply<[u32; 8]>),
    FhssTiming(Reply<(u8, u32, u8)>),
    ConfigSnapshot(Box<Reply<Config>>),
    FirmwareVersion(Reply<Option<String>>),
    // Methods
    StartFan(MethodReply),
    StopFan(MethodReply),
    JoinMulticastGroup(Ipv6Addr, MethodReply),
    LeaveMulticastGroup(Ipv6Addr, MethodReply),
    SetModeSwitch {
        eui64: Eui64,
        phy_mode_id: u8,
        reply: MethodReply,
    },
    SetSlotAlgorithm(u8, MethodReply),
    RevokePairwiseKeys(Eui64, MethodReply),
    RevokeGroupKeys {
        gtk: bool,
        lgtk: bool,
        reply: MethodReply,
    },
    InstallGtk([u8; 16], MethodReply),
    InstallLgtk([u8; 16], MethodReply),
    SetNetworkName(String, MethodReply),
    SetPhyConfigs {
        domain: u8,
        class: u8,
        mode: u8,
        reply: MethodReply,
    },
    SetTimingParams {
        imin: u32,
        imax: u32,
        k: u16,
        pan_timeout: u32,
        reply: MethodReply,
    },
    SetFhssChannelMask {
        mask: [u32; 4],
        lfn: bool,
        reply: MethodReply,
    },
    SetFhssTiming {
        uc_dwell: u8,
        bc_interval: u32,
        bc_dwell: u8,
        reply: MethodReply,
    },
    SetFhssUcFunction {
        fixed_channel: Option<u16>,
        dwell: u8,
        reply: MethodReply,
    },
    SetFhssBcFunction {
        fixed_channel: Option<u16>,
        dwell: u8,
        bc_interval: u32,
        reply: MethodReply,
    },
    UpdateRcpFirmware(MethodReply),
}

/// The operator's handle to a running engine
pub struct Handle {
    to_engine: mpsc::UnboundedSender<Event>,
    signals: mpsc::UnboundedReceiver<PropertyChanged>,
}

macro_rules! property {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub async fn $name(&self) -> Result<$ty, HandleError> {
            let (tx, rx) = oneshot::channel();
            self.send(Request::$variant(tx))?;
            rx.await.map_err(|_| HandleError::EngineGone)
        }
    };
}

impl Handle {
    pub(crate) fn new(
        to_engine: mpsc::UnboundedSender<Event>,
        signals: mpsc::UnboundedReceiver<PropertyChanged>,
    ) -> Self {
        Self { to_engine, signals }
    }

    fn send(&self, request: Request) -> Result<(), HandleError> {
        self.to_engine
            .send(Event::Management(request))
            .map_err(|_| HandleError::EngineGone)
    }

    async fn method(
        &self,
        build: impl FnOnce(MethodReply) -> Request,
    ) -> Result<(), HandleError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await
            .map_err(|_| HandleError::EngineGone)?
            .map_err(HandleError::Rejected)
    }

    /// Waits for the next property-changed signal
    pub async fn changed(&mut self) -> Option<PropertyChanged> {
        self.signals.recv().await
    }

    property!(/// The interface EUI-64
        hw_address, HwAddress, Eui64);
    property!(/// Current PAN identifier
        pan_id, PanId, u16);
    property!(/// Advertised FAN version
        fan_version, FanVersion, u8);
    property!(/// Our own IPv6 addresses
        network_state, NetworkState, Vec<Ipv6Addr>);
    property!(/// Every joined node with role, parent and addresses
        nodes, Nodes, Vec<NodeInfo>);
    property!(/// Installed GTKs by slot
        gtks, Gtks, [Option<[u8; 16]>; 4]);
    property!(/// Installed LGTKs by slot
        lgtks, Lgtks, [Option<[u8; 16]>; 3]);
    property!(/// GAKs (SHA-256 of name || GTK) by slot
        gaks, Gaks, [Option<[u8; 16]>; 4]);
    property!(/// LFN GAKs by slot
        lgaks, Lgaks, [Option<[u8; 16]>; 3]);
    property!(/// Index of the GTK used for transmission
        gtk_active_key_index, GtkActiveIndex, u8);
    property!(/// Discovery trickle (imin, imax, k) and the PAN timeout
        timing_params, TimingParams, (u32, u32, u16, u32));
    property!(/// Allowed channel mask
        fhss_channel_mask, FhssChannelMask, [u32; 8]);
    property!(/// (unicast dwell, broadcast interval, broadcast dwell)
        fhss_timing, FhssTiming, (u8, u32, u8));
    property!(/// RCP firmware version from the last reset
        firmware_version, FirmwareVersion, Option<String>);

    /// Full configuration snapshot
    pub async fn config(&self) -> Result<Config, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::ConfigSnapshot(Box::new(tx)))?;
        rx.await.map_err(|_| HandleError::EngineGone)
    }

    /// Brings the FAN up
    pub async fn start_fan(&self) -> Result<(), HandleError> {
        self.method(Request::StartFan).await
    }

    /// Full teardown: keys, supplicants, leases and neighbors are gone
    pub async fn stop_fan(&self) -> Result<(), HandleError> {
        self.method(Request::StopFan).await
    }

    pub async fn join_multicast_group(&self, group: Ipv6Addr) -> Result<(), HandleError> {
        self.method(|reply| Request::JoinMulticastGroup(group, reply))
            .await
    }

    pub async fn leave_multicast_group(&self, group: Ipv6Addr) -> Result<(), HandleError> {
        self.method(|reply| Request::LeaveMulticastGroup(group, reply))
            .await
    }

    pub async fn set_mode_switch(&self, eui64: Eui64, phy_mode_id: u8) -> Result<(), HandleError> {
        self.method(|reply| Request::SetModeSwitch {
            eui64,
            phy_mode_id,
            reply,
        })
        .await
    }

    pub async fn set_slot_algorithm(&self, mode: u8) -> Result<(), HandleError> {
        self.method(|reply| Request::SetSlotAlgorithm(mode, reply))
            .await
    }

    /// Drops one node's pairwise keys; it has to rejoin
    pub async fn revoke_pairwise_keys(&self, eui64: Eui64) -> Result<(), HandleError> {
        self.method(|reply| Request::RevokePairwiseKeys(eui64, reply))
            .await
    }

    /// Shortens the active group key lifetime and rotates
    pub async fn revoke_group_keys(&self, gtk: bool, lgtk: bool) -> Result<(), HandleError> {
        self.method(|reply| Request::RevokeGroupKeys { gtk, lgtk, reply })
            .await
    }

    pub async fn install_gtk(&self, key: [u8; 16]) -> Result<(), HandleError> {
        self.method(|reply| Request::InstallGtk(key, reply)).await
    }

    pub async fn install_lgtk(&self, key: [u8; 16]) -> Result<(), HandleError> {
        self.method(|reply| Request::InstallLgtk(key, reply)).await
    }

    pub async fn set_network_name(&self, name: String) -> Result<(), HandleError> {
        self.method(|reply| Request::SetNetworkName(name, reply))
            .await
    }

    pub async fn set_phy_configs(&self, domain: u8, class: u8, mode: u8) -> Result<(), HandleError> {
        self.method(|reply| Request::SetPhyConfigs {
            domain,
            class,
            mode,
            reply,
        })
        .await
    }

    pub async fn set_timing_params(
        &self,
        imin: u32,
        imax: u32,
        k: u16,
        pan_timeout: u32,
    ) -> Result<(), HandleError> {
        self.method(|reply| Request::SetTimingParams {
            imin,
            imax,
            k,
            pan_timeout,
            reply,
        })
        .await
    }

    /// Sets the lower 128 channels of the FFN (or LFN) mask
    pub async fn set_fhss_channel_mask(
        &self,
        mask: [u32; 4],
        lfn: bool,
    ) -> Result<(), HandleError> {
        self.method(|reply| Request::SetFhssChannelMask { mask, lfn, reply })
            .await
    }

    pub async fn set_fhss_timing(
        &self,
        uc_dwell: u8,
        bc_interval: u32,
        bc_dwell: u8,
    ) -> Result<(), HandleError> {
        self.method(|reply| Request::SetFhssTiming {
            uc_dwell,
            bc_interval,
            bc_dwell,
            reply,
        })
        .await
    }

    pub async fn set_fhss_uc_function(
        &self,
        fixed_channel: Option<u16>,
        dwell: u8,
    ) -> Result<(), HandleError> {
        self.method(|reply| Request::SetFhssUcFunction {
            fixed_channel,
            dwell,
            reply,
        })
        .await
    }

    pub async fn set_fhss_bc_function(
        &self,
        fixed_channel: Option<u16>,
        dwell: u8,
        bc_interval: u32,
    ) -> Result<(), HandleError> {
        self.method(|reply| Request::SetFhssBcFunction {
            fixed_channel,
            dwell,
            bc_interval,
            reply,
        })
        .await
    }

    /// Hands the RCP to its bootloader for the external flashing helper
    pub async fn update_rcp_firmware(&self) -> Result<(), HandleError> {
        self.method(Request::UpdateRcpFirmware).await
    }

    /// Stops the engine
    pub fn shutdown(&self) {
        self.to_engine.send(Event::Shutdown).ok();
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.to_engine.send(Event::Shutdown).ok();
    }
}
