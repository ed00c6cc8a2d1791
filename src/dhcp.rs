//! DHCPv6 server and relay for the mesh.
//!
//! Joining nodes get a /128 under the advertised prefix, derived
//! deterministically from their EUI-64 so the same node keeps its
//! address across reboots of either side. The lease table is a bounded
//! bijection between EUI-64 and address; a full table answers
//! `NoAddrsAvail`. In relay mode client messages are wrapped toward the
//! configured server instead.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::config::DhcpConfig;
use crate::wire::dhcpv6::{
    DhcpOption, Duid, MsgType, Packet, STATUS_NO_ADDRS_AVAIL, STATUS_SUCCESS,
};
use crate::Eui64;

/// Bijective EUI-64 ↔ IPv6 lease map
pub struct LeaseTable {
    by_eui: HashMap<Eui64, Ipv6Addr>,
    by_addr: HashMap<Ipv6Addr, Eui64>,
    lifetime_s: HashMap<Eui64, u32>,
    capacity: usize,
}

impl LeaseTable {
    fn new(capacity: usize) -> Self {
        Self {
            by_eui: HashMap::new(),
            by_addr: HashMap::new(),
            lifetime_s: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.by_eui.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_eui.is_empty()
    }

    pub fn addr_of(&self, eui64: Eui64) -> Option<Ipv6Addr> {
        self.by_eui.get(&eui64).copied()
    }

    pub fn eui_of(&self, addr: &Ipv6Addr) -> Option<Eui64> {
        self.by_addr.get(addr).copied()
    }

    /// Inserts or refreshes a lease, keeping the map bijective
    fn commit(&mut self, eui64: Eui64, addr: Ipv6Addr, lifetime: u32) -> bool {
        match self.by_eui.get(&eui64) {
            Some(existing) if *existing == addr => {
                self.lifetime_s.insert(eui64, lifetime);
                return true;
            }
            Some(existing) => {
                // The pairing changed (new prefix): drop the stale half
                let stale = *existing;
                self.by_addr.remove(&stale);
            }
            None => {
                if self.by_eui.len() >= self.capacity {
                    return false;
                }
            }
        }
        if let Some(holder) = self.by_addr.get(&addr) {
            if *holder != eui64 {
                // Someone else holds the address; deterministic
                // derivation makes this a configuration error
                log::warn!("dhcp: address {addr} already bound to {holder}");
                return false;
            }
        }
        self.by_eui.insert(eui64, addr);
        self.by_addr.insert(addr, eui64);
        self.lifetime_s.insert(eui64, lifetime);
        true
    }

    fn remove(&mut self, eui64: Eui64) {
        if let Some(addr) = self.by_eui.remove(&eui64) {
            self.by_addr.remove(&addr);
        }
        self.lifetime_s.remove(&eui64);
    }

    /// One second of aging; returns reclaimed leases
    fn tick_second(&mut self) -> Vec<Eui64> {
        let mut expired = Vec::new();
        for (eui64, left) in self.lifetime_s.iter_mut() {
            if *left <= 1 {
                expired.push(*eui64);
            } else {
                *left -= 1;
            }
        }
        for eui64 in &expired {
            let addr = self.by_eui.remove(eui64);
            if let Some(addr) = addr {
                self.by_addr.remove(&addr);
            }
            self.lifetime_s.remove(eui64);
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = (Eui64, Ipv6Addr, u32)> + '_ {
        self.by_eui.iter().map(|(eui64, addr)| {
            (
                *eui64,
                *addr,
                self.lifetime_s.get(eui64).copied().unwrap_or(0),
            )
        })
    }
}

/// What the server wants sent, or a fatal condition
#[derive(Debug)]
pub enum DhcpOutput {
    /// A UDP payload toward this address (client or upstream server)
    Send { dst: Ipv6Addr, payload: Vec<u8> },
    /// The configured relay target is unusable: infrastructure failure,
    /// the process exits
    RelayUnreachable,
}

/// The DHCPv6 service
pub struct DhcpServer {
    cfg: DhcpConfig,
    prefix: Ipv6Addr,
    our_duid: Duid,
    pub leases: LeaseTable,
}

impl DhcpServer {
    pub fn new(cfg: DhcpConfig, prefix: Ipv6Addr, our_eui64: Eui64) -> Self {
        Self {
            leases: LeaseTable::new(cfg.max_leases),
            cfg,
            prefix,
            our_duid: Duid::new(our_eui64),
        }
    }

    /// Restores leases from stable storage
    pub fn restore(&mut self, leases: &[(Eui64, Ipv6Addr, u32)]) {
        for (eui64, addr, lifetime) in leases {
            self.leases.commit(*eui64, *addr, *lifetime);
        }
    }

    /// The deterministic address for a client
    fn address_for(&self, eui64: Eui64) -> Ipv6Addr {
        let mut octets = self.prefix.octets();
        octets[8..].copy_from_slice(&eui64.iid());
        octets.into()
    }

    /// Handles one UDP payload arriving on the server port
    pub fn handle(&mut self, payload: &[u8], src: Ipv6Addr) -> Vec<DhcpOutput> {
        let packet = match Packet::parse(payload) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("dhcp: unparseable message from {src}: {err}");
                return Vec::new();
            }
        };
        if let Some(server) = self.cfg.relay_server {
            return self.relay(packet, payload, src, server);
        }
        match packet {
            Packet::Message {
                msg_type,
                transaction_id,
                ..
            } => self.serve(&packet, msg_type, transaction_id, src),
            Packet::Relay { .. } => {
                log::debug!("dhcp: relay message while serving locally, dropped");
                Vec::new()
            }
        }
    }

    fn serve(
        &mut self,
        packet: &Packet,
        msg_type: MsgType,
        transaction_id: u32,
        src: Ipv6Addr,
    ) -> Vec<DhcpOutput> {
        let Some(client) = packet.client_duid() else {
            return Vec::new();
        };
        let eui64 = client.eui64;
        let Some((iaid, _)) = packet.ia_na() else {
            return Vec::new();
        };
        let rapid = packet
            .options()
            .iter()
            .any(|o| matches!(o, DhcpOption::RapidCommit));

        let mut reply_options = vec![
            DhcpOption::ServerId(self.our_duid),
            DhcpOption::ClientId(client),
        ];
        let addr = self.address_for(eui64);

        let build = |msg_type: MsgType, options: Vec<DhcpOption>| {
            Packet::Message {
                msg_type,
                transaction_id,
                options,
            }
            .emit()
        };

        match msg_type {
            MsgType::Solicit => {
                let commit = rapid;
                let granted = if commit {
                    self.leases.commit(eui64, addr, self.cfg.lease_lifetime)
                } else {
                    self.leases.len() < self.leases.capacity
                        || self.leases.addr_of(eui64).is_some()
                };
                let reply_type = if commit {
                    MsgType::Reply
                } else {
                    MsgType::Advertise
                };
                if granted {
                    reply_options.push(self.ia_na_granted(iaid, addr));
                    if commit {
                        reply_options.push(DhcpOption::RapidCommit);
                    }
                } else {
                    reply_options.push(DhcpOption::IaNa {
                        iaid,
                        t1: 0,
                        t2: 0,
                        options: vec![DhcpOption::StatusCode {
                            code: STATUS_NO_ADDRS_AVAIL,
                            message: "address pool exhausted".into(),
                        }],
                    });
                }
                vec![DhcpOutput::Send {
                    dst: src,
                    payload: build(reply_type, reply_options),
                }]
            }
            MsgType::Request | MsgType::Renew => {
                if self.leases.commit(eui64, addr, self.cfg.lease_lifetime) {
                    reply_options.push(self.ia_na_granted(iaid, addr));
                } else {
                    reply_options.push(DhcpOption::IaNa {
                        iaid,
                        t1: 0,
                        t2: 0,
                        options: vec![DhcpOption::StatusCode {
                            code: STATUS_NO_ADDRS_AVAIL,
                            message: "address pool exhausted".into(),
                        }],
                    });
                }
                vec![DhcpOutput::Send {
                    dst: src,
                    payload: build(MsgType::Reply, reply_options),
                }]
            }
            MsgType::Release => {
                self.leases.remove(eui64);
                reply_options.push(DhcpOption::StatusCode {
                    code: STATUS_SUCCESS,
                    message: String::new(),
                });
                vec![DhcpOutput::Send {
                    dst: src,
                    payload: build(MsgType::Reply, reply_options),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn ia_na_granted(&self, iaid: u32, addr: Ipv6Addr) -> DhcpOption {
        let lifetime = self.cfg.lease_lifetime;
        DhcpOption::IaNa {
            iaid,
            t1: lifetime / 2,
            t2: lifetime * 4 / 5,
            options: vec![DhcpOption::IaAddr {
                addr,
                preferred: lifetime,
                valid: lifetime,
            }],
        }
    }

    fn relay(
        &mut self,
        packet: Packet,
        raw: &[u8],
        src: Ipv6Addr,
        server: Ipv6Addr,
    ) -> Vec<DhcpOutput> {
        if server.is_unspecified() {
            // The relay target is an infrastructure assumption; without
            // it the process cannot serve the mesh at all
            return vec![DhcpOutput::RelayUnreachable];
        }
        match packet {
            Packet::Message { .. } => {
                // Client → server: wrap
                let forward = Packet::Relay {
                    msg_type: MsgType::RelayForw,
                    hop_count: 0,
                    link_address: self.prefix,
                    peer_address: src,
                    options: vec![DhcpOption::RelayMsg(raw.to_vec())],
                };
                vec![DhcpOutput::Send {
                    dst: server,
                    payload: forward.emit(),
                }]
            }
            Packet::Relay {
                msg_type: MsgType::RelayReply,
                peer_address,
                options,
                ..
            } => {
                // Server → client: unwrap
                options
                    .into_iter()
                    .find_map(|o| match o {
                        DhcpOption::RelayMsg(inner) => Some(DhcpOutput::Send {
                            dst: peer_address,
                            payload: inner,
                        }),
                        _ => None,
                    })
                    .into_iter()
                    .collect()
            }
            Packet::Relay { .. } => Vec::new(),
        }
    }

    /// One second of aging
    pub fn tick_second(&mut self) -> Vec<Eui64> {
        self.leases.tick_second()
    }

    pub fn clear(&mut self) {
        let capacity = self.leases.capacity;
        self.leases = LeaseTable::new(capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eui(n: u8) -> Eui64 {
        Eui64([0x0c, 0x5b, 0xa0, 0, 0, 0, 0, n])
    }

    fn server(max: usize) -> DhcpServer {
        let cfg = DhcpConfig {
            max_leases: max,
            lease_lifetime: 100,
            relay_server: None,
        };
        DhcpServer::new(cfg, "fd12:3456::".parse().unwrap(), eui(0xbb))
    }

    fn solicit(n: u8, rapid: bool) -> Vec<u8> {
        let mut options = vec![
            DhcpOption::ClientId(Duid::new(eui(n))),
            DhcpOption::IaNa {
                iaid: 1,
                t1: 0,
                t2: 0,
                options: vec![],
            },
        ];
        if rapid {
            options.push(DhcpOption::RapidCommit);
        }
        Packet::Message {
            msg_type: MsgType::Solicit,
            transaction_id: u32::from(n),
            options,
        }
        .emit()
    }

    fn request(n: u8) -> Vec<u8> {
        Packet::Message {
            msg_type: MsgType::Request,
            transaction_id: 0x999,
            options: vec![
                DhcpOption::ClientId(Duid::new(eui(n))),
                DhcpOption::IaNa {
                    iaid: 1,
                    t1: 0,
                    t2: 0,
                    options: vec![],
                },
            ],
        }
        .emit()
    }

    fn reply_of(outputs: &[DhcpOutput]) -> Packet {
        match &outputs[..] {
            [DhcpOutput::Send { payload, .. }] => Packet::parse(payload).unwrap(),
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    fn granted_addr(packet: &Packet) -> Option<Ipv6Addr> {
        packet.options().iter().find_map(|o| match o {
            DhcpOption::IaNa { options, .. } => options.iter().find_map(|o| match o {
                DhcpOption::IaAddr { addr, .. } => Some(*addr),
                _ => None,
            }),
            _ => None,
        })
    }

    #[test]
    fn solicit_advertise_request_reply() {
        let mut server = server(8);
        let client = eui(1).link_local();
        let outputs = server.handle(&solicit(1, false), client);
        let advertise = reply_of(&outputs);
        let offered = granted_addr(&advertise).unwrap();
        assert_eq!(offered, "fd12:3456::e5b:a000:0:1".parse::<Ipv6Addr>().unwrap());
        // Nothing committed yet
        assert!(server.leases.is_empty());

        let outputs = server.handle(&request(1), client);
        let reply = reply_of(&outputs);
        assert_eq!(granted_addr(&reply), Some(offered));
        assert_eq!(server.leases.addr_of(eui(1)), Some(offered));
        assert_eq!(server.leases.eui_of(&offered), Some(eui(1)));
    }

    #[test]
    fn same_node_gets_the_same_address_across_reboots() {
        let mut first = server(8);
        let mut second = server(8);
        let client = eui(7).link_local();
        first.handle(&request(7), client);
        second.handle(&request(7), client);
        assert_eq!(first.leases.addr_of(eui(7)), second.leases.addr_of(eui(7)));
    }

    #[test]
    fn rapid_commit_grants_in_one_exchange() {
        let mut server = server(8);
        let outputs = server.handle(&solicit(2, true), eui(2).link_local());
        let reply = reply_of(&outputs);
        let Packet::Message { msg_type, options, .. } = &reply else {
            panic!()
        };
        assert_eq!(*msg_type, MsgType::Reply);
        assert!(options.iter().any(|o| matches!(o, DhcpOption::RapidCommit)));
        assert_eq!(server.leases.len(), 1);
    }

    #[test]
    fn full_table_answers_no_addrs_avail() {
        let mut server = server(1);
        server.handle(&request(1), eui(1).link_local());
        let outputs = server.handle(&request(2), eui(2).link_local());
        let reply = reply_of(&outputs);
        let has_noaddrs = reply.options().iter().any(|o| match o {
            DhcpOption::IaNa { options, .. } => options.iter().any(|o| {
                matches!(
                    o,
                    DhcpOption::StatusCode {
                        code: STATUS_NO_ADDRS_AVAIL,
                        ..
                    }
                )
            }),
            _ => false,
        });
        assert!(has_noaddrs);
        assert_eq!(server.leases.len(), 1);
    }

    #[test]
    fn lease_expiry_reclaims_the_address() {
        let mut server = server(1);
        server.handle(&request(1), eui(1).link_local());
        for _ in 0..99 {
            assert!(server.tick_second().is_empty());
        }
        assert_eq!(server.tick_second(), vec![eui(1)]);
        // The slot is free again
        server.handle(&request(2), eui(2).link_local());
        assert_eq!(server.leases.len(), 1);
    }

    #[test]
    fn release_frees_and_acknowledges() {
        let mut server = server(4);
        server.handle(&request(1), eui(1).link_local());
        let release = Packet::Message {
            msg_type: MsgType::Release,
            transaction_id: 5,
            options: vec![
                DhcpOption::ClientId(Duid::new(eui(1))),
                DhcpOption::IaNa {
                    iaid: 1,
                    t1: 0,
                    t2: 0,
                    options: vec![],
                },
            ],
        }
        .emit();
        let outputs = server.handle(&release, eui(1).link_local());
        let reply = reply_of(&outputs);
        assert!(matches!(reply, Packet::Message { msg_type: MsgType::Reply, .. }));
        assert!(server.leases.is_empty());
    }

    #[test]
    fn relay_wraps_and_unwraps() {
        let upstream: Ipv6Addr = "fd00::beef".parse().unwrap();
        let cfg = DhcpConfig {
            relay_server: Some(upstream),
            ..DhcpConfig::default()
        };
        let mut relay = DhcpServer::new(cfg, "fd12:3456::".parse().unwrap(), eui(0xbb));
        let client = eui(3).link_local();
        let outputs = relay.handle(&solicit(3, false), client);
        let [DhcpOutput::Send { dst, payload }] = &outputs[..] else {
            panic!()
        };
        assert_eq!(*dst, upstream);
        let Packet::Relay {
            msg_type: MsgType::RelayForw,
            peer_address,
            ..
        } = Packet::parse(payload).unwrap()
        else {
            panic!()
        };
        assert_eq!(peer_address, client);

        // And the reply path
        let inner_reply = Packet::Message {
            msg_type: MsgType::Reply,
            transaction_id: 3,
            options: vec![],
        }
        .emit();
        let wrapped = Packet::Relay {
            msg_type: MsgType::RelayReply,
            hop_count: 0,
            link_address: "fd12:3456::".parse().unwrap(),
            peer_address: client,
            options: vec![DhcpOption::RelayMsg(inner_reply.clone())],
        }
        .emit();
        let outputs = relay.handle(&wrapped, upstream);
        let [DhcpOutput::Send { dst, payload }] = &outputs[..] else {
            panic!()
        };
        assert_eq!(*dst, client);
        assert_eq!(*payload, inner_reply);
    }

    #[test]
    fn lease_table_stays_bijective() {
        let mut table = LeaseTable::new(8);
        let a1: Ipv6Addr = "fd00::1".parse().unwrap();
        let a2: Ipv6Addr = "fd00::2".parse().unwrap();
        assert!(table.commit(eui(1), a1, 10));
        // Prefix change: same EUI, new address
        assert!(table.commit(eui(1), a2, 10));
        assert_eq!(table.addr_of(eui(1)), Some(a2));
        assert_eq!(table.eui_of(&a1), None);
        assert_eq!(table.eui_of(&a2), Some(eui(1)));
        // Another EUI cannot steal the bound address
        assert!(!table.commit(eui(2), a2, 10));
        assert_eq!(table.len(), 1);
    }
}
