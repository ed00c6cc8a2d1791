//! Engine configuration.
//!
//! Everything the operator can choose lives here: network identity, PHY
//! selection, the Wi-SUN size preset that scales the management timings,
//! FHSS schedule parameters, the security timing table and the resource
//! bounds. Validation happens once at startup; a bad combination is fatal
//! before the engine starts.

use std::net::Ipv6Addr;

use crate::trickle::TrickleParams;

/// Network size preset, scaling timing defaults the way the deployment
/// guides do
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WisunSize {
    Small,
    #[default]
    Medium,
    Large,
    /// Certification bench timings
    Certification,
}

/// Management frame timing (trickle Imin/Imax in seconds)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimingConfig {
    pub disc_imin: u32,
    pub disc_imax: u32,
    pub disc_k: u16,
    /// Seconds without any traffic before a PAN peer is considered gone
    pub pan_timeout: u32,
}

impl TimingConfig {
    pub fn for_size(size: WisunSize) -> Self {
        match size {
            WisunSize::Small => Self {
                disc_imin: 15,
                disc_imax: 60,
                disc_k: 1,
                pan_timeout: 620,
            },
            WisunSize::Medium => Self {
                disc_imin: 60,
                disc_imax: 960,
                disc_k: 1,
                pan_timeout: 1520,
            },
            WisunSize::Large => Self {
                disc_imin: 120,
                disc_imax: 1536,
                disc_k: 1,
                pan_timeout: 3840,
            },
            WisunSize::Certification => Self {
                disc_imin: 15,
                disc_imax: 960,
                disc_k: 1,
                pan_timeout: 620,
            },
        }
    }

    pub fn trickle_params(&self) -> TrickleParams {
        TrickleParams::from_secs(self.disc_imin, self.disc_imax, self.disc_k)
    }

    /// LFN variants run an interval an order of magnitude slower
    pub fn lfn_trickle_params(&self) -> TrickleParams {
        TrickleParams::from_secs(self.disc_imin * 4, self.disc_imax * 4, self.disc_k)
    }
}

/// Group and pairwise key timing, minutes unless noted
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SecurityConfig {
    pub pmk_lifetime: u32,
    pub ptk_lifetime: u32,
    pub gtk_expire_offset: u32,
    /// New key activation time as a divisor of the expire offset
    pub gtk_new_act_time: u32,
    /// Install the next GTK when the active one passed this percentage of
    /// its lifetime
    pub gtk_new_install_req: u8,
    /// Lifetime reduction applied on revocation (divisor of expire offset)
    pub ffn_revocation_reduction: u32,
    pub lgtk_expire_offset: u32,
    pub lgtk_new_act_time: u32,
    pub lgtk_new_install_req: u8,
    pub lfn_revocation_reduction: u32,
    /// EAPOL retry backoff, seconds
    pub prot_imin: u32,
    pub prot_imax: u32,
    /// Retries per handshake message
    pub prot_retries: u8,
    /// Concurrent EAP-TLS negotiations allowed
    pub max_simultaneous: usize,
    /// Frame counter restart margin added after a reboot
    pub counter_restart_margin: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pmk_lifetime: 172_800,
            ptk_lifetime: 86_400,
            gtk_expire_offset: 43_200,
            gtk_new_act_time: 720,
            gtk_new_install_req: 80,
            ffn_revocation_reduction: 30,
            lgtk_expire_offset: 129_600,
            lgtk_new_act_time: 720,
            lgtk_new_install_req: 90,
            lfn_revocation_reduction: 30,
            prot_imin: 30,
            prot_imax: 90,
            prot_retries: 3,
            max_simultaneous: 5,
            counter_restart_margin: 1000,
        }
    }
}

/// FHSS schedule knobs
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FhssConfig {
    /// Unicast dwell interval, milliseconds (15..=255)
    pub uc_dwell_interval: u8,
    /// Broadcast interval, milliseconds
    pub bc_interval: u32,
    /// Broadcast dwell interval, milliseconds
    pub bc_dwell_interval: u8,
    /// Fixed unicast channel; `None` selects DH1CF hopping
    pub uc_fixed_channel: Option<u16>,
    /// Fixed broadcast channel; `None` selects DH1CF hopping
    pub bc_fixed_channel: Option<u16>,
    /// Allowed channel mask, bit N = channel N usable
    pub channel_mask: [u32; 8],
}

impl Default for FhssConfig {
    fn default() -> Self {
        Self {
            uc_dwell_interval: 255,
            bc_interval: 1020,
            bc_dwell_interval: 255,
            uc_fixed_channel: None,
            bc_fixed_channel: None,
            channel_mask: [u32::MAX; 8],
        }
    }
}

/// MAC helper bounds and retry policy
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MacConfig {
    /// Outbound queue bound (frames, queued plus in flight)
    pub tx_queue_size: usize,
    /// CCA blacklist backoff bounds, milliseconds
    pub blacklist_min_ms: u32,
    pub blacklist_max_ms: u32,
    /// Transmission attempts per frame
    pub max_retries: u8,
    /// Held (indirect) frame time to live, seconds
    pub indirect_ttl: u32,
    /// Confirmation timeout for ack-requested frames, seconds
    pub ack_timeout: u32,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            tx_queue_size: 64,
            blacklist_min_ms: 20,
            blacklist_max_ms: 300,
            max_retries: 4,
            indirect_ttl: 7,
            ack_timeout: 10,
        }
    }
}

/// RPL root parameters
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RplConfig {
    pub instance_id: u8,
    /// DIO interval minimum, 2^n milliseconds
    pub dio_interval_min: u8,
    pub dio_interval_doublings: u8,
    pub dio_redundancy: u8,
    /// Default route lifetime, lifetime units
    pub default_lifetime: u8,
    /// Lifetime unit, seconds
    pub lifetime_unit: u16,
    pub min_hop_rank_increase: u16,
    pub max_rank_increase: u16,
    /// Soft memory bound for retained RPL state, bytes
    pub memory_soft_limit: usize,
    /// Hard bound; 0 disables it (mandatory for a root)
    pub memory_hard_limit: usize,
}

impl Default for RplConfig {
    fn default() -> Self {
        Self {
            instance_id: 1,
            dio_interval_min: 15,
            dio_interval_doublings: 2,
            dio_redundancy: 10,
            default_lifetime: 120,
            lifetime_unit: 60,
            min_hop_rank_increase: 128,
            max_rank_increase: 2048,
            memory_soft_limit: 64 * 1024,
            memory_hard_limit: 0,
        }
    }
}

/// DHCPv6 behavior
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DhcpConfig {
    /// Lease lifetime, seconds
    pub lease_lifetime: u32,
    /// Lease table bound
    pub max_leases: usize,
    /// When set, relay toward this server instead of serving locally
    pub relay_server: Option<Ipv6Addr>,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            lease_lifetime: 43_200,
            max_leases: 512,
            relay_server: None,
        }
    }
}

/// The full engine configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub network_name: String,
    pub pan_id: u16,
    /// Wi-SUN FAN version advertised (1 = FAN 1.0, 2 = FAN 1.1)
    pub fan_version: u8,
    pub size: WisunSize,
    pub reg_domain: u8,
    pub op_class: u8,
    pub op_mode: u8,
    pub phy_mode_id: u8,
    pub chan_plan_id: u8,
    /// PAN size advertised in the PAN-IE
    pub pan_size: u16,
    /// Global prefix served to the mesh
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub tx_power_dbm: i8,
    pub cca_threshold_dbm: i8,
    pub timing: TimingConfig,
    pub security: SecurityConfig,
    pub fhss: FhssConfig,
    pub mac: MacConfig,
    pub rpl: RplConfig,
    pub dhcp: DhcpConfig,
    pub neighbor_table_size: usize,
    /// Reassembly bounds
    pub frag_max_buffers: usize,
    pub frag_max_bytes: usize,
    /// Seconds before a partial datagram is dropped
    pub frag_timeout: u32,
    /// TUN admission queue bound
    pub tun_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let size = WisunSize::default();
        Self {
            network_name: "Wi-SUN Network".into(),
            pan_id: 0xffff,
            fan_version: 2,
            size,
            reg_domain: 3, // EU
            op_class: 2,
            op_mode: 0x1b,
            phy_mode_id: 0,
            chan_plan_id: 0,
            pan_size: 0,
            prefix: Ipv6Addr::UNSPECIFIED,
            prefix_len: 64,
            tx_power_dbm: 14,
            cca_threshold_dbm: -60,
            timing: TimingConfig::for_size(size),
            security: SecurityConfig::default(),
            fhss: FhssConfig::default(),
            mac: MacConfig::default(),
            rpl: RplConfig::default(),
            dhcp: DhcpConfig::default(),
            neighbor_table_size: 256,
            frag_max_buffers: 16,
            frag_max_bytes: 32 * 1024,
            frag_timeout: 60,
            tun_queue_size: 32,
        }
    }
}

/// A configuration the engine refuses to start with
#[derive(Debug, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_name.is_empty() || self.network_name.len() > 32 {
            return Err(ConfigError("network name must be 1..=32 bytes".into()));
        }
        if self.fhss.uc_dwell_interval < 15 {
            return Err(ConfigError("unicast dwell interval below 15 ms".into()));
        }
        if self.fhss.bc_interval < u32::from(self.fhss.bc_dwell_interval) {
            return Err(ConfigError(
                "broadcast interval shorter than the broadcast dwell".into(),
            ));
        }
        if self.fhss.channel_mask.iter().all(|w| *w == 0) {
            return Err(ConfigError("empty channel mask".into()));
        }
        if self.prefix_len != 64 {
            return Err(ConfigError("served prefix must be /64".into()));
        }
        if self.security.gtk_new_install_req == 0 || self.security.gtk_new_install_req > 100 {
            return Err(ConfigError("gtk install threshold must be 1..=100".into()));
        }
        if self.mac.tx_queue_size == 0 {
            return Err(ConfigError("tx queue size must be positive".into()));
        }
        if self.rpl.memory_hard_limit != 0 {
            return Err(ConfigError(
                "the root's RPL database must not have a hard memory limit".into(),
            ));
        }
        Ok(())
    }

    /// Channels allowed by the mask
    pub fn channel_count(&self) -> u16 {
        self.fhss
            .channel_mask
            .iter()
            .map(|w| w.count_ones() as u16)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut config = Config::default();
        config.prefix = "fd12:3456::".parse().unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn dwell_below_floor_is_rejected() {
        let mut config = Config::default();
        config.fhss.uc_dwell_interval = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn root_hard_memory_limit_is_rejected() {
        let mut config = Config::default();
        config.rpl.memory_hard_limit = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn size_presets_scale_discovery() {
        let small = TimingConfig::for_size(WisunSize::Small);
        let large = TimingConfig::for_size(WisunSize::Large);
        assert!(small.disc_imin < large.disc_imin);
        assert!(small.pan_timeout < large.pan_timeout);
    }
}
