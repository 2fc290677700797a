//! Tokio driver for the border routing engine.
//!
//! Owns the raw ICMPv6 and DHCPv6 client sockets on the infrastructure
//! interface, feeds received packets and timer expirations into the
//! sans-io `RoutingManager` and `PdClient`, and carries out their effects.
//! The delegated prefix is published on a `watch` channel.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use ipnet::Ipv6Net;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BorderRoutingConfig, Settings};
use crate::error::{self, Error};
use crate::nd::ALL_ROUTERS;
use crate::pd_client::{client_duid_from_mac, DelegatedPrefix, PdClient, PdEffect, PdState};
use crate::prefix::RoutePreference;
use crate::routing::infra_if::InfraIf;
use crate::routing::net_data::LocalNetworkData;
use crate::routing::{RoutingEvent, RoutingManager};
use crate::timer::earliest;

const DHCP6_CLIENT_PORT: u16 = 546;
const DHCP6_SERVER_PORT: u16 = 547;
const MAX_PACKET_SIZE: usize = 1500;
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_WAKEUP: Duration = Duration::from_secs(60);
const COMMAND_QUEUE_SIZE: usize = 16;

/// RFC 7050 well-known name and the IPv4 addresses it resolves to.
const NAT64_WELL_KNOWN_NAME: &str = "ipv4only.arpa";
const NAT64_WELL_KNOWN_IPV4: [[u8; 4]; 2] = [[192, 0, 0, 170], [192, 0, 0, 171]];

const FALLBACK_MAC: [u8; 6] = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01];

pub type PrefixSender = watch::Sender<Option<DelegatedPrefix>>;
pub type PrefixWatch = watch::Receiver<Option<DelegatedPrefix>>;

#[derive(Debug, Clone)]
pub enum Command {
    /// Mesh data changed outside the engine.
    Reevaluate,
    SetEnabled(bool),
    SetRoutePreference(Option<RoutePreference>),
    SetRioPreference(Option<RoutePreference>),
    /// Applies a reloaded configuration.
    Reload(BorderRoutingConfig),
    Shutdown,
}

// ── Infrastructure interface ────────────────────────────────────────────────

/// `InfraIf` backed by the kernel interface and the driver's sockets.
#[derive(Debug)]
pub struct SocketInfraIf {
    interface: String,
    if_index: u32,
    mac: Option<[u8; 6]>,
    running: bool,
    addresses: Vec<Ipv6Addr>,
    icmp6: Arc<UdpSocket>,
    dhcp6: Arc<UdpSocket>,
    nat64_tx: mpsc::UnboundedSender<Option<Ipv6Net>>,
}

impl SocketInfraIf {
    /// Re-reads the link state and addresses. Returns true if the link went
    /// up or down.
    pub fn refresh(&mut self) -> bool {
        self.refresh_addresses();
        let running = read_link_up(&self.interface);
        if running == self.running {
            return false;
        }
        info!("Interface {} is {}", self.interface, if running { "up" } else { "down" });
        self.running = running;
        true
    }

    pub fn refresh_addresses(&mut self) {
        match std::fs::read_to_string("/proc/net/if_inet6") {
            Ok(content) => self.addresses = parse_if_inet6(&content, &self.interface),
            Err(e) => warn!("Failed to read interface addresses: {}", e),
        }
    }

    fn dest(&self, addr: Ipv6Addr, port: u16) -> SocketAddr {
        let scope_id = if addr.is_multicast() || addr.is_unicast_link_local() {
            self.if_index
        } else {
            0
        };
        SocketAddr::V6(SocketAddrV6::new(addr, port, 0, scope_id))
    }
}

impl InfraIf for SocketInfraIf {
    fn is_running(&self) -> bool {
        self.running
    }

    fn has_address(&self, address: &Ipv6Addr) -> bool {
        self.addresses.contains(address)
    }

    fn link_layer_address(&self) -> Option<Vec<u8>> {
        self.mac.map(|mac| mac.to_vec())
    }

    fn send_icmp6(&mut self, message: &[u8], dest: Ipv6Addr) -> error::Result<()> {
        try_send(&self.icmp6, message, self.dest(dest, 0))
    }

    fn send_dhcp6(&mut self, message: &[u8], dest: Ipv6Addr) -> error::Result<()> {
        try_send(&self.dhcp6, message, self.dest(dest, DHCP6_SERVER_PORT))
    }

    fn discover_nat64_prefix(&mut self) -> error::Result<()> {
        let tx = self.nat64_tx.clone();
        tokio::spawn(async move {
            let prefix = lookup_nat64_prefix().await;
            let _ = tx.send(prefix);
        });
        Ok(())
    }
}

fn try_send(socket: &UdpSocket, message: &[u8], dest: SocketAddr) -> error::Result<()> {
    match socket.try_send_to(message, dest) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::NoBufs),
        Err(e) => Err(e.into()),
    }
}

async fn lookup_nat64_prefix() -> Option<Ipv6Net> {
    let addrs = match tokio::net::lookup_host((NAT64_WELL_KNOWN_NAME, 0)).await {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!("NAT64 discovery lookup failed: {}", e);
            return None;
        }
    };
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V6(v6) => Some(*v6.ip()),
            SocketAddr::V4(_) => None,
        })
        .find_map(nat64_prefix_from_address)
}

/// /96 prefix of a synthesized `ipv4only.arpa` address.
fn nat64_prefix_from_address(addr: Ipv6Addr) -> Option<Ipv6Net> {
    let octets = addr.octets();
    if !NAT64_WELL_KNOWN_IPV4.iter().any(|v4| octets[12..] == v4[..]) {
        return None;
    }
    Ipv6Net::new(addr, 96).ok().map(|net| net.trunc())
}

/// Addresses of `interface` from `/proc/net/if_inet6` content.
fn parse_if_inet6(content: &str, interface: &str) -> Vec<Ipv6Addr> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 6 || fields[5] != interface {
                return None;
            }
            let octets: [u8; 16] = hex::decode(fields[0]).ok()?.try_into().ok()?;
            Some(Ipv6Addr::from(octets))
        })
        .collect()
}

fn read_link_up(interface: &str) -> bool {
    let path = format!("/sys/class/net/{}/operstate", interface);
    match std::fs::read_to_string(path) {
        Ok(state) => matches!(state.trim(), "up" | "unknown"),
        Err(_) => false,
    }
}

fn read_if_index(interface: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{}/ifindex", interface);
    let content = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Invalid interface index in {}", path))
}

fn read_interface_mac(interface: &str) -> Option<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", interface);
    let content = std::fs::read_to_string(path).ok()?;
    parse_mac(content.trim())
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

// ── Socket creation ─────────────────────────────────────────────────────────

fn create_icmp6_socket(interface: &str, if_index: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
    socket.set_multicast_hops_v6(255)?;
    socket.set_unicast_hops_v6(255)?;

    #[cfg(target_os = "linux")]
    socket.bind_device(Some(interface.as_bytes()))?;
    #[cfg(not(target_os = "linux"))]
    let _ = interface;

    // Router Solicitations are sent to all-routers.
    socket.join_multicast_v6(&ALL_ROUTERS, if_index)?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

fn create_dhcpv6_socket(interface: &str) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[cfg(target_os = "linux")]
    socket.bind_device(Some(interface.as_bytes()))?;
    #[cfg(not(target_os = "linux"))]
    let _ = interface;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, DHCP6_CLIENT_PORT, 0, 0);
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Driver {
    config: BorderRoutingConfig,
    settings: Settings,
    settings_path: PathBuf,
    manager: RoutingManager<SocketInfraIf, LocalNetworkData>,
    pd_client: PdClient,
    pd_listening: bool,
    icmp6: Arc<UdpSocket>,
    dhcp6: Arc<UdpSocket>,
    nat64_rx: mpsc::UnboundedReceiver<Option<Ipv6Net>>,
    prefix_tx: PrefixSender,
}

/// Handle to a spawned driver task.
pub struct DriverHandle {
    pub commands: mpsc::Sender<Command>,
    pub prefix: PrefixWatch,
    pub task: JoinHandle<Result<()>>,
}

/// Creates the driver and runs it on the current tokio runtime.
pub fn spawn(config: BorderRoutingConfig) -> Result<DriverHandle> {
    let (prefix_tx, prefix_rx) = watch::channel(None);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
    let driver = Driver::new(config, prefix_tx)?;
    let task = tokio::spawn(driver.run(command_rx));
    Ok(DriverHandle {
        commands: command_tx,
        prefix: prefix_rx,
        task,
    })
}

impl Driver {
    pub fn new(config: BorderRoutingConfig, prefix_tx: PrefixSender) -> Result<Self> {
        if config.infra_interface.is_empty() {
            anyhow::bail!("infra_interface is not configured");
        }
        let interface = config.infra_interface.clone();

        let settings_path = PathBuf::from(&config.state_file);
        let settings = Settings::load_or_generate(&settings_path)?;
        let options = config.routing_options(&settings)?;

        let if_index = read_if_index(&interface)?;
        let icmp6 = Arc::new(
            create_icmp6_socket(&interface, if_index)
                .with_context(|| format!("Failed to create ICMPv6 socket on {}", interface))?,
        );
        let dhcp6 = Arc::new(
            create_dhcpv6_socket(&interface)
                .with_context(|| format!("Failed to create DHCPv6 socket on {}", interface))?,
        );

        let mac = read_interface_mac(&interface);
        if mac.is_none() {
            warn!("No MAC address for {}, using a fixed DUID", interface);
        }
        let (nat64_tx, nat64_rx) = mpsc::unbounded_channel();

        let mut infra_if = SocketInfraIf {
            interface: interface.clone(),
            if_index,
            mac,
            running: false,
            addresses: Vec::new(),
            icmp6: icmp6.clone(),
            dhcp6: dhcp6.clone(),
            nat64_tx,
        };
        infra_if.refresh();

        let now = Instant::now();
        let manager = RoutingManager::new(options, infra_if, LocalNetworkData::default(), now)
            .context("Failed to initialize border routing")?;

        info!(
            "Border routing on {} (index {}), BR ULA prefix {}",
            interface, if_index, settings.br_ula_prefix
        );

        let mut driver = Self {
            pd_client: PdClient::new(client_duid_from_mac(&mac.unwrap_or(FALLBACK_MAC))),
            pd_listening: false,
            config: config.clone(),
            settings,
            settings_path,
            manager,
            icmp6,
            dhcp6,
            nat64_rx,
            prefix_tx,
        };
        driver.apply_preferences(&config, now);
        driver.manager.set_enabled(config.enabled, now);
        driver.after_event(now);
        Ok(driver)
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        let icmp6 = self.icmp6.clone();
        let dhcp6 = self.dhcp6.clone();
        let mut icmp_buf = vec![0u8; MAX_PACKET_SIZE];
        let mut dhcp_buf = vec![0u8; MAX_PACKET_SIZE];
        let mut link_check = tokio::time::interval(LINK_CHECK_INTERVAL);

        loop {
            let deadline = tokio::time::Instant::from_std(self.next_deadline());

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let now = Instant::now();
                    self.manager.handle_timers(now);
                    let effects = self.pd_client.handle_timer(now);
                    self.apply_pd_effects(effects, now);
                }
                res = icmp6.recv_from(&mut icmp_buf) => match res {
                    Ok((len, SocketAddr::V6(src))) => {
                        self.manager.infra_if_mut().refresh_addresses();
                        self.manager.handle_received_icmp6(&icmp_buf[..len], *src.ip(), Instant::now());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("ICMPv6 receive failed: {}", e),
                },
                res = dhcp6.recv_from(&mut dhcp_buf) => match res {
                    Ok((len, _)) if self.pd_listening => {
                        let now = Instant::now();
                        let effects = self.pd_client.handle_received(&dhcp_buf[..len], now);
                        self.apply_pd_effects(effects, now);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("DHCPv6 receive failed: {}", e),
                },
                Some(prefix) = self.nat64_rx.recv() => {
                    self.manager.handle_nat64_discover_done(prefix, Instant::now());
                }
                _ = link_check.tick() => {
                    if self.manager.infra_if_mut().refresh() {
                        self.manager.handle_infra_if_state_changed(Instant::now());
                    }
                }
                command = commands.recv() => {
                    let now = Instant::now();
                    match command {
                        Some(Command::Reevaluate) => self.manager.handle_net_data_changed(now),
                        Some(Command::SetEnabled(enabled)) => self.manager.set_enabled(enabled, now),
                        Some(Command::SetRoutePreference(Some(p))) => self.manager.set_route_preference(p, now),
                        Some(Command::SetRoutePreference(None)) => self.manager.clear_route_preference(now),
                        Some(Command::SetRioPreference(Some(p))) => self.manager.set_rio_preference(p, now),
                        Some(Command::SetRioPreference(None)) => self.manager.clear_rio_preference(now),
                        Some(Command::Reload(config)) => self.apply_config(config, now),
                        Some(Command::Shutdown) | None => {
                            self.shutdown(now);
                            return Ok(());
                        }
                    }
                }
            }

            self.after_event(Instant::now());
        }
    }

    fn next_deadline(&self) -> Instant {
        earliest(self.manager.next_fire_time(), self.pd_client.next_fire_time())
            .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP)
    }

    fn apply_preferences(&mut self, config: &BorderRoutingConfig, now: Instant) {
        match config.route_preference {
            Some(p) => self.manager.set_route_preference(p, now),
            None => self.manager.clear_route_preference(now),
        }
        match config.rio_preference {
            Some(p) => self.manager.set_rio_preference(p, now),
            None => self.manager.clear_rio_preference(now),
        }
    }

    fn apply_config(&mut self, config: BorderRoutingConfig, now: Instant) {
        if config.infra_interface != self.config.infra_interface || config.state_file != self.config.state_file {
            warn!("Interface or state file change needs a restart, keeping {}", self.config.infra_interface);
        }

        self.apply_preferences(&config, now);
        self.manager.set_nat64_enabled(config.nat64_enabled, now);
        self.manager.set_dhcp6_pd_enabled(config.dhcp6_pd_enabled, now);
        self.manager.set_multi_ail_detection_enabled(config.multi_ail_detection_enabled, now);
        match config.ext_pan_id_bytes() {
            Ok(ext_pan_id) => self.manager.handle_ext_pan_id_changed(&ext_pan_id, now),
            Err(e) => warn!("Keeping extended PAN ID: {:#}", e),
        }
        self.manager.set_enabled(config.enabled, now);

        self.config.enabled = config.enabled;
        self.config.dhcp6_pd_enabled = config.dhcp6_pd_enabled;
        self.config.nat64_enabled = config.nat64_enabled;
        self.config.multi_ail_detection_enabled = config.multi_ail_detection_enabled;
        self.config.ext_pan_id = config.ext_pan_id;
        self.config.route_preference = config.route_preference;
        self.config.rio_preference = config.rio_preference;
        info!("Border routing configuration applied");
    }

    fn shutdown(&mut self, now: Instant) {
        info!("Shutting down border routing");
        self.manager.set_enabled(false, now);
        let effects = self.pd_client.stop(now);
        self.apply_pd_effects(effects, now);
        self.after_event(now);
    }

    fn apply_pd_effects(&mut self, effects: Vec<PdEffect>, now: Instant) {
        for effect in effects {
            match effect {
                PdEffect::Send { message, dest } => {
                    if let Err(e) = self.manager.infra_if_mut().send_dhcp6(&message, dest) {
                        warn!("Failed to send DHCPv6 message to {}: {}", dest, e);
                        self.pd_client.handle_send_failed(now);
                    }
                }
                PdEffect::Report(delegated) => {
                    self.manager.process_delegated_prefix(&delegated, now);
                    let active = (delegated.valid_lifetime > 0).then_some(delegated);
                    self.prefix_tx.send_replace(active);
                }
                PdEffect::Listen(on) => self.pd_listening = on,
            }
        }
    }

    /// Drains engine events and keeps the PD client in step with the engine.
    fn after_event(&mut self, now: Instant) {
        for event in self.manager.take_events() {
            match event {
                RoutingEvent::SettingsChanged => self.save_settings(now),
                RoutingEvent::StateChanged(state) => info!("Border routing state: {:?}", state),
                RoutingEvent::RaSent { .. } => {}
                other => debug!("Border routing event: {:?}", other),
            }
        }

        let should_run = self.manager.is_running() && self.config.dhcp6_pd_enabled;
        let effects = match self.pd_client.state() {
            PdState::Stopped | PdState::Releasing if should_run => self.pd_client.start(now),
            PdState::Stopped | PdState::Releasing => Vec::new(),
            _ if !should_run => self.pd_client.stop(now),
            _ => Vec::new(),
        };
        self.apply_pd_effects(effects, now);
    }

    fn save_settings(&mut self, now: Instant) {
        let saved = self.manager.saved_on_link_prefixes(now);
        if !self.settings.set_on_link_prefixes(&saved, Utc::now()) {
            return;
        }
        if let Err(e) = self.settings.save_to_file(&self.settings_path) {
            warn!("Failed to save border routing settings: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_if_inet6() {
        let content = "\
fe800000000000000211223344556677 02 40 20 80     eth0
fd001122334400010000000000000001 02 40 00 80     eth0
00000000000000000000000000000001 01 80 10 80       lo
";
        let addresses = parse_if_inet6(content, "eth0");
        assert_eq!(
            addresses,
            vec![
                "fe80::211:2233:4455:6677".parse::<Ipv6Addr>().unwrap(),
                "fd00:1122:3344:1::1".parse::<Ipv6Addr>().unwrap(),
            ]
        );
        assert!(parse_if_inet6(content, "wlan0").is_empty());
    }

    #[test]
    fn test_nat64_prefix_from_synthesized_address() {
        let addr: Ipv6Addr = "64:ff9b::c000:aa".parse().unwrap();
        assert_eq!(nat64_prefix_from_address(addr), Some("64:ff9b::/96".parse().unwrap()));

        let addr: Ipv6Addr = "2001:db8:64::c000:ab".parse().unwrap();
        assert_eq!(nat64_prefix_from_address(addr), Some("2001:db8:64::/96".parse().unwrap()));

        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(nat64_prefix_from_address(addr), None);
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("02:11:22:aa:bb:cc"), Some([0x02, 0x11, 0x22, 0xaa, 0xbb, 0xcc]));
        assert_eq!(parse_mac("02:11:22"), None);
        assert_eq!(parse_mac("02:11:22:aa:bb:zz"), None);
    }
}
