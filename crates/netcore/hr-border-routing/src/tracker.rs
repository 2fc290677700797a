//! Table of routers seen on the infrastructure link.
//!
//! Every received Router Advertisement updates the `Router` entry of its
//! sender together with the on-link prefixes (PIO), route prefixes (RIO and
//! the RA header default route) and RDNSS addresses it carries. The table
//! expires entries, probes silent routers with Neighbor Solicitations and
//! summarizes everything into `DecisionFactors` for the routing policy.
//!
//! The table never touches a socket: outbound probes and change signals are
//! queued as `TrackerEvent`s and drained by the owner with `take_events`.

use std::collections::BTreeSet;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use serde::Serialize;
use tracing::{debug, info};

use crate::nd::{NdOption, NeighborAdvert, PrefixInfoOption, RaHeader, RdnssOption, RouteInfoOption, RouterAdvert};
use crate::prefix::{default_route, is_link_local, is_multicast, is_ula, is_valid_omr_prefix, RoutePreference};
use crate::timer::{add_jitter, clamped_expiration, NextFireTime, Timer};

// ── Constants ───────────────────────────────────────────────────────────────

/// Time after the last RA before an advertised prefix is considered stale.
pub const STALE_TIME: u32 = 600;

pub const DEFAULT_REACHABLE_INTERVAL: Duration = Duration::from_secs(60);
const PEER_BR_REACHABLE_INTERVAL: Duration = Duration::from_secs(200);
const REACHABILITY_JITTER: Duration = Duration::from_secs(2);

pub const MAX_NS_PROBES: u8 = 5;
const NS_PROBE_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const NS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const FAVORED_ON_LINK_MIN_PREFERRED_LIFETIME: u32 = 1800;
const FAVORED_ON_LINK_PREFIX_LEN: u8 = 64;
const TWO_HOURS: u32 = 2 * 3600;

// ── Entry types ─────────────────────────────────────────────────────────────

/// Where a received RA came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaOrigin {
    AnotherRouter,
    /// Sent from one of our own addresses by some other software entity.
    ThisBrOtherEntity,
    /// One of the RAs we transmitted ourselves.
    ThisBrRoutingManager,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnLinkPrefix {
    pub prefix: Ipv6Net,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    pub auto_addr_config: bool,
    pub dhcp6_pd_preferred: bool,
    pub last_update: Instant,
    disregard: bool,
}

impl OnLinkPrefix {
    pub fn from_pio(pio: &PrefixInfoOption, now: Instant) -> Self {
        Self {
            prefix: pio.prefix,
            valid_lifetime: pio.valid_lifetime,
            preferred_lifetime: pio.preferred_lifetime,
            auto_addr_config: pio.auto_addr_config,
            dhcp6_pd_preferred: pio.dhcp6_pd_preferred,
            last_update: now,
            disregard: false,
        }
    }

    pub fn expire_time(&self) -> Instant {
        clamped_expiration(self.last_update, self.valid_lifetime)
    }

    pub fn deprecation_time(&self) -> Instant {
        clamped_expiration(self.last_update, self.preferred_lifetime)
    }

    pub fn is_deprecated(&self, now: Instant) -> bool {
        self.deprecation_time() <= now
    }

    pub fn stale_time(&self) -> Instant {
        clamped_expiration(self.last_update, STALE_TIME.min(self.preferred_lifetime))
    }

    pub fn should_disregard(&self) -> bool {
        self.disregard
    }

    /// Takes flags and lifetimes from a fresh PIO for the same prefix,
    /// applying the two-hour rule of RFC 4862 §5.5.3(e) to the valid lifetime.
    fn adopt_from(&mut self, other: &OnLinkPrefix, now: Instant) {
        if other.valid_lifetime > TWO_HOURS || other.expire_time() > self.expire_time() {
            self.valid_lifetime = other.valid_lifetime;
        } else if self.expire_time() > now + Duration::from_secs(TWO_HOURS as u64) {
            // Remaining lifetime counts from the new update time below.
            self.valid_lifetime = TWO_HOURS;
        } else {
            // Keep the current expiry, re-expressed against the new update time.
            let remaining = self.expire_time().saturating_duration_since(other.last_update);
            self.valid_lifetime = remaining.as_secs() as u32;
        }

        self.preferred_lifetime = other.preferred_lifetime;
        self.auto_addr_config = other.auto_addr_config;
        self.dhcp6_pd_preferred = other.dhcp6_pd_preferred;
        self.last_update = other.last_update;
    }

    /// Whether this prefix should replace `current` as the favored on-link
    /// prefix: a `/64` with the A or P flag, a long enough preferred
    /// lifetime, and numerically smaller than `current`.
    pub fn is_favored_over(&self, current: Option<&Ipv6Net>) -> bool {
        if self.prefix.prefix_len() != FAVORED_ON_LINK_PREFIX_LEN {
            return false;
        }
        if !(self.auto_addr_config || self.dhcp6_pd_preferred) {
            return false;
        }
        if self.preferred_lifetime < FAVORED_ON_LINK_MIN_PREFERRED_LIFETIME {
            return false;
        }
        match current {
            None => true,
            Some(current) => self.prefix < *current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePrefix {
    pub prefix: Ipv6Net,
    pub valid_lifetime: u32,
    pub preference: RoutePreference,
    pub last_update: Instant,
    disregard: bool,
}

impl RoutePrefix {
    pub fn from_rio(rio: &RouteInfoOption, now: Instant) -> Self {
        Self {
            prefix: rio.prefix,
            valid_lifetime: rio.lifetime,
            preference: rio.preference,
            last_update: now,
            disregard: false,
        }
    }

    /// The default route implied by the RA header.
    pub fn from_header(header: &RaHeader, now: Instant) -> Self {
        Self {
            prefix: default_route(),
            valid_lifetime: header.router_lifetime as u32,
            preference: header.default_route_preference(),
            last_update: now,
            disregard: false,
        }
    }

    fn set_from(&mut self, other: RoutePrefix) {
        let disregard = self.disregard;
        *self = other;
        self.disregard = disregard;
    }

    pub fn expire_time(&self) -> Instant {
        clamped_expiration(self.last_update, self.valid_lifetime)
    }

    pub fn stale_time(&self) -> Instant {
        clamped_expiration(self.last_update, STALE_TIME.min(self.valid_lifetime))
    }

    pub fn should_disregard(&self) -> bool {
        self.disregard
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdnssAddress {
    pub address: Ipv6Addr,
    pub lifetime: u32,
    pub last_update: Instant,
}

impl RdnssAddress {
    pub fn expire_time(&self) -> Instant {
        clamped_expiration(self.last_update, self.lifetime)
    }
}

#[derive(Debug, Clone)]
struct IfAddress {
    address: Ipv6Addr,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct Router {
    address: Ipv6Addr,
    discover_time: Instant,
    last_update: Instant,
    timeout: Instant,
    ns_probe_count: u8,
    managed_flag: bool,
    other_flag: bool,
    snac_router_flag: bool,
    is_local_device: bool,
    all_entries_disregarded: bool,
    on_link_prefixes: Vec<OnLinkPrefix>,
    route_prefixes: Vec<RoutePrefix>,
    rdnss_addresses: Vec<RdnssAddress>,
}

impl Router {
    fn new(address: Ipv6Addr, now: Instant) -> Self {
        Self {
            address,
            discover_time: now,
            last_update: now,
            timeout: now,
            ns_probe_count: 0,
            managed_flag: false,
            other_flag: false,
            snac_router_flag: false,
            is_local_device: false,
            all_entries_disregarded: true,
            on_link_prefixes: Vec::new(),
            route_prefixes: Vec::new(),
            rdnss_addresses: Vec::new(),
        }
    }

    fn is_reachable(&self) -> bool {
        self.ns_probe_count <= MAX_NS_PROBES
    }

    fn should_check_reachability(&self) -> bool {
        self.is_reachable() && !self.is_local_device
    }

    /// Called whenever an RA or NA is received from the router.
    fn reset_reachability(&mut self, reachable_interval: Duration, now: Instant) {
        self.ns_probe_count = 0;
        self.last_update = now;
        self.timeout = now + add_jitter(reachable_interval, REACHABILITY_JITTER);
    }

    fn determine_reachability_timeout(&mut self, reachable_interval: Duration) {
        if !self.should_check_reachability() || self.ns_probe_count != 0 {
            return;
        }
        // A router whose entries are all disregarded is most likely a peer
        // BR on the same mesh, so it is checked less often.
        let interval = if self.all_entries_disregarded {
            PEER_BR_REACHABLE_INTERVAL
        } else {
            reachable_interval
        };
        self.timeout = self.last_update + add_jitter(interval, REACHABILITY_JITTER);
    }

    /// Removable once it has no entries and no M/O flags. Flags of an
    /// unreachable router no longer count.
    fn is_empty(&self) -> bool {
        let has_flags = self.is_reachable() && (self.managed_flag || self.other_flag);
        !has_flags
            && self.on_link_prefixes.is_empty()
            && self.route_prefixes.is_empty()
            && self.rdnss_addresses.is_empty()
    }

    fn is_peer_br(&self) -> bool {
        self.all_entries_disregarded && !(self.on_link_prefixes.is_empty() && self.route_prefixes.is_empty())
    }

    fn info(&self, now: Instant) -> RouterInfo {
        RouterInfo {
            address: self.address,
            msec_since_last_update: now.saturating_duration_since(self.last_update).as_millis() as u64,
            age_secs: now.saturating_duration_since(self.discover_time).as_secs(),
            managed_flag: self.managed_flag,
            other_flag: self.other_flag,
            snac_router_flag: self.snac_router_flag,
            is_local_device: self.is_local_device,
            is_reachable: self.is_reachable(),
            is_peer_br: self.is_peer_br(),
        }
    }
}

// ── Decision factors ────────────────────────────────────────────────────────

/// Summary of the table consumed by the routing policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecisionFactors {
    pub has_ula_on_link: bool,
    pub has_non_ula_on_link: bool,
    pub has_non_ula_route: bool,
    pub favored_on_link_prefix: Option<Ipv6Net>,
    pub header_managed_flag: bool,
    pub header_other_flag: bool,
    pub reachable_peer_br_count: u16,
}

impl DecisionFactors {
    /// M and O are mirrored from reachable routers that are not stub routers.
    fn update_flags_from(&mut self, router: &Router) {
        if router.snac_router_flag || !router.is_reachable() {
            return;
        }
        self.header_managed_flag |= router.managed_flag;
        self.header_other_flag |= router.other_flag;
    }

    fn update_from_on_link(&mut self, entry: &OnLinkPrefix) {
        if entry.should_disregard() {
            return;
        }
        if is_ula(&entry.prefix) {
            self.has_ula_on_link = true;
        } else {
            self.has_non_ula_on_link = true;
        }
        if entry.is_favored_over(self.favored_on_link_prefix.as_ref()) {
            self.favored_on_link_prefix = Some(entry.prefix);
        }
    }

    fn update_from_route(&mut self, entry: &RoutePrefix) {
        if entry.should_disregard() {
            return;
        }
        if !is_ula(&entry.prefix) {
            self.has_non_ula_route = true;
        }
    }
}

// ── Snapshots ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterInfo {
    pub address: Ipv6Addr,
    pub msec_since_last_update: u64,
    pub age_secs: u64,
    pub managed_flag: bool,
    pub other_flag: bool,
    pub snac_router_flag: bool,
    pub is_local_device: bool,
    pub is_reachable: bool,
    pub is_peer_br: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixTableEntry {
    pub router: RouterInfo,
    pub prefix: Ipv6Net,
    pub is_on_link: bool,
    pub msec_since_last_update: u64,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    pub route_preference: RoutePreference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RdnssEntry {
    pub router: Ipv6Addr,
    pub address: Ipv6Addr,
    pub msec_since_last_update: u64,
    pub lifetime: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IfAddressEntry {
    pub address: Ipv6Addr,
    pub secs_since_last_seen: u64,
}

// ── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// `DecisionFactors` changed.
    TableChanged,
    RdnssChanged,
    /// The RA header of the other local entity changed; evaluate after a
    /// random delay.
    LocalHeaderChanged,
    /// A discovered prefix went stale; solicit fresh RAs.
    StaleTimeout,
    SendNeighborSolicit(Ipv6Addr),
}

/// Facts owned by the routing policy that decide whether a received prefix
/// is one of ours (and therefore likely relayed by a peer BR).
#[derive(Debug, Clone, Default)]
pub struct RaContext<'a> {
    pub local_on_link_prefix: Option<Ipv6Net>,
    pub local_omr_prefix: Option<Ipv6Net>,
    pub advertised_rios: &'a [Ipv6Net],
    pub net_data_omr_prefixes: &'a [Ipv6Net],
}

// ── Table ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PrefixRouterTable {
    routers: Vec<Router>,
    if_addresses: Vec<IfAddress>,
    decision_factors: DecisionFactors,
    local_ra_header: Option<(RaHeader, Instant)>,
    reachable_interval: Duration,
    router_timer: Timer,
    expiration_timer: Timer,
    stale_timer: Timer,
    rdnss_timer: Timer,
    table_changed: bool,
    rdnss_changed: bool,
    local_header_changed: bool,
    stale_expired: bool,
    ns_targets: Vec<Ipv6Addr>,
}

impl Default for PrefixRouterTable {
    fn default() -> Self {
        Self::new(DEFAULT_REACHABLE_INTERVAL)
    }
}

impl PrefixRouterTable {
    pub fn new(reachable_interval: Duration) -> Self {
        Self {
            routers: Vec::new(),
            if_addresses: Vec::new(),
            decision_factors: DecisionFactors::default(),
            local_ra_header: None,
            reachable_interval,
            router_timer: Timer::new(),
            expiration_timer: Timer::new(),
            stale_timer: Timer::new(),
            rdnss_timer: Timer::new(),
            table_changed: false,
            rdnss_changed: false,
            local_header_changed: false,
            stale_expired: false,
            ns_targets: Vec::new(),
        }
    }

    pub fn decision_factors(&self) -> &DecisionFactors {
        &self.decision_factors
    }

    /// RA header most recently sent by another entity on this device.
    pub fn local_ra_header(&self) -> Option<&RaHeader> {
        self.local_ra_header.as_ref().map(|(header, _)| header)
    }

    pub fn set_header_flags_on(&self, header: &mut RaHeader) {
        if self.decision_factors.header_managed_flag {
            header.set_managed_flag(true);
        }
        if self.decision_factors.header_other_flag {
            header.set_other_flag(true);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// Drops everything, as when the routing manager stops.
    pub fn clear(&mut self) {
        self.routers.clear();
        self.if_addresses.clear();
        self.decision_factors = DecisionFactors::default();
        self.local_ra_header = None;
        self.router_timer.stop();
        self.expiration_timer.stop();
        self.stale_timer.stop();
        self.rdnss_timer.stop();
        self.stale_expired = false;
        self.ns_targets.clear();
    }

    pub fn take_events(&mut self) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        if std::mem::take(&mut self.local_header_changed) {
            events.push(TrackerEvent::LocalHeaderChanged);
        }
        if std::mem::take(&mut self.table_changed) {
            events.push(TrackerEvent::TableChanged);
        }
        if std::mem::take(&mut self.rdnss_changed) {
            events.push(TrackerEvent::RdnssChanged);
        }
        if std::mem::take(&mut self.stale_expired) {
            events.push(TrackerEvent::StaleTimeout);
        }
        events.extend(self.ns_targets.drain(..).map(TrackerEvent::SendNeighborSolicit));
        events
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        [
            self.router_timer.fire_time(),
            self.expiration_timer.fire_time(),
            self.stale_timer.fire_time(),
            self.rdnss_timer.fire_time(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ── Inbound messages ────────────────────────────────────────────────────

    pub fn process_router_advert(
        &mut self,
        ra: &RouterAdvert,
        src: Ipv6Addr,
        origin: RaOrigin,
        ctx: &RaContext<'_>,
        now: Instant,
    ) {
        debug!("Received RA from {} ({:?})", src, origin);

        if origin != RaOrigin::AnotherRouter {
            self.update_if_addresses(src, now);
        }
        if origin == RaOrigin::ThisBrRoutingManager {
            return;
        }

        let index = match self.routers.iter().position(|r| r.address == src) {
            Some(index) => index,
            None => {
                info!("Discovered router {}", src);
                self.routers.push(Router::new(src, now));
                self.routers.len() - 1
            }
        };

        self.process_ra_header(&ra.header, index, origin, now);

        for option in &ra.options {
            match option {
                NdOption::PrefixInfo(pio) => self.process_pio(pio, index, ctx, now),
                NdOption::RouteInfo(rio) => self.process_rio(rio, index, ctx, now),
                NdOption::Rdnss(rdnss) => self.process_rdnss(rdnss, index, now),
                _ => {}
            }
        }

        let reachable_interval = self.reachable_interval;
        let router = &mut self.routers[index];
        router.is_local_device = origin == RaOrigin::ThisBrOtherEntity;
        router.reset_reachability(reachable_interval, now);

        self.evaluate(now);
    }

    fn process_ra_header(&mut self, header: &RaHeader, index: usize, origin: RaOrigin, now: Instant) {
        let router = &mut self.routers[index];
        router.managed_flag = header.managed_flag();
        router.other_flag = header.other_flag();
        router.snac_router_flag = header.snac_router_flag();

        if origin == RaOrigin::ThisBrOtherEntity {
            let old = self.local_ra_header.map(|(h, _)| h);
            self.local_ra_header = (header.router_lifetime != 0).then_some((*header, now));
            if self.local_ra_header.map(|(h, _)| h) != old {
                debug!("Local RA header changed");
                self.local_header_changed = true;
            }
        }

        // A `::/0` RIO later in the same RA overrides the header values.
        let router = &mut self.routers[index];
        let default_route = RoutePrefix::from_header(header, now);
        match router.route_prefixes.iter_mut().find(|e| e.prefix == default_route.prefix) {
            Some(entry) => entry.set_from(default_route),
            None if header.router_lifetime != 0 => router.route_prefixes.push(default_route),
            None => {}
        }
    }

    fn process_pio(&mut self, pio: &PrefixInfoOption, index: usize, ctx: &RaContext<'_>, now: Instant) {
        if is_link_local(&pio.prefix) || is_multicast(&pio.prefix) {
            return;
        }

        let router = &mut self.routers[index];
        if !pio.on_link {
            router.on_link_prefixes.retain(|e| e.prefix != pio.prefix);
            return;
        }

        // Our own on-link prefix seen from another router means a peer BR
        // on the same mesh.
        let disregard = ctx.local_on_link_prefix == Some(pio.prefix);

        debug!(
            "PIO {} valid {} preferred {} (disregard {})",
            pio.prefix, pio.valid_lifetime, pio.preferred_lifetime, disregard
        );

        let new_entry = OnLinkPrefix::from_pio(pio, now);
        let entry = match router.on_link_prefixes.iter_mut().position(|e| e.prefix == pio.prefix) {
            Some(pos) => {
                let entry = &mut router.on_link_prefixes[pos];
                entry.adopt_from(&new_entry, now);
                entry
            }
            None => {
                if pio.valid_lifetime == 0 {
                    return;
                }
                router.on_link_prefixes.push(new_entry);
                let last = router.on_link_prefixes.len() - 1;
                &mut router.on_link_prefixes[last]
            }
        };
        entry.disregard = disregard;
    }

    fn process_rio(&mut self, rio: &RouteInfoOption, index: usize, ctx: &RaContext<'_>, now: Instant) {
        if is_link_local(&rio.prefix) || is_multicast(&rio.prefix) {
            return;
        }

        // Our own OMR prefixes, whether still in our RAs or already in mesh
        // data, point at a peer BR.
        let disregard = ctx.local_omr_prefix == Some(rio.prefix)
            || ctx.advertised_rios.contains(&rio.prefix)
            || ctx.net_data_omr_prefixes.contains(&rio.prefix);

        debug!(
            "RIO {} lifetime {} preference {} (disregard {})",
            rio.prefix, rio.lifetime, rio.preference, disregard
        );

        let router = &mut self.routers[index];
        let new_entry = RoutePrefix::from_rio(rio, now);
        match router.route_prefixes.iter_mut().find(|e| e.prefix == rio.prefix) {
            Some(entry) => {
                entry.set_from(new_entry);
                entry.disregard = disregard;
            }
            None if rio.lifetime != 0 => {
                router.route_prefixes.push(RoutePrefix { disregard, ..new_entry });
            }
            None => {}
        }
    }

    fn process_rdnss(&mut self, rdnss: &RdnssOption, index: usize, now: Instant) {
        let router = &mut self.routers[index];
        let mut changed = false;

        for &address in &rdnss.addresses {
            debug!("RDNSS {} lifetime {}", address, rdnss.lifetime);

            if rdnss.lifetime == 0 {
                let before = router.rdnss_addresses.len();
                router.rdnss_addresses.retain(|e| e.address != address);
                changed |= router.rdnss_addresses.len() != before;
                continue;
            }

            match router.rdnss_addresses.iter_mut().find(|e| e.address == address) {
                Some(entry) => {
                    entry.lifetime = rdnss.lifetime;
                    entry.last_update = now;
                }
                None => {
                    router.rdnss_addresses.push(RdnssAddress {
                        address,
                        lifetime: rdnss.lifetime,
                        last_update: now,
                    });
                    changed = true;
                }
            }
        }

        if changed {
            self.rdnss_changed = true;
        }
    }

    fn update_if_addresses(&mut self, address: Ipv6Addr, now: Instant) {
        match self.if_addresses.iter_mut().find(|e| e.address == address) {
            Some(entry) => entry.last_seen = now,
            None => self.if_addresses.push(IfAddress { address, last_seen: now }),
        }
    }

    /// Forgets interface addresses that no longer belong to the interface.
    pub fn retain_if_addresses(&mut self, mut is_local: impl FnMut(&Ipv6Addr) -> bool) {
        self.if_addresses.retain(|e| is_local(&e.address));
    }

    pub fn process_neighbor_advert(&mut self, na: &NeighborAdvert, now: Instant) {
        let reachable_interval = self.reachable_interval;
        let Some(router) = self.routers.iter_mut().find(|r| r.address == na.target) else {
            return;
        };

        info!("Received NA from router {}", router.address);
        router.reset_reachability(reachable_interval, now);
        self.evaluate(now);
    }

    // ── Policy hooks ────────────────────────────────────────────────────────

    /// Deprecates on-link prefixes and expires route prefixes and RDNSS
    /// addresses that were not refreshed after `threshold`.
    pub fn remove_or_deprecate_old_entries(&mut self, threshold: Instant, now: Instant) {
        for router in &mut self.routers {
            for entry in &mut router.on_link_prefixes {
                if entry.last_update <= threshold {
                    entry.preferred_lifetime = 0;
                }
            }
            for entry in &mut router.route_prefixes {
                if entry.last_update <= threshold {
                    entry.valid_lifetime = 0;
                }
            }
            for entry in &mut router.rdnss_addresses {
                if entry.last_update <= threshold {
                    entry.lifetime = 0;
                }
            }
        }

        if matches!(self.local_ra_header, Some((_, update)) if update <= threshold) {
            self.local_ra_header = None;
        }

        self.evaluate(now);
    }

    /// Marks route prefixes that match OMR prefixes now present in mesh data.
    pub fn handle_net_data_change(&mut self, omr_prefixes: &[Ipv6Net], now: Instant) {
        let mut changed = false;

        for prefix in omr_prefixes.iter().filter(|p| is_valid_omr_prefix(p)) {
            for router in &mut self.routers {
                if let Some(entry) = router.route_prefixes.iter_mut().find(|e| e.prefix == *prefix) {
                    if !entry.disregard {
                        entry.disregard = true;
                        changed = true;
                    }
                }
            }
        }

        if changed {
            self.evaluate(now);
        }
    }

    pub fn handle_local_on_link_prefix_changed(&mut self, local_prefix: &Ipv6Net, now: Instant) {
        let mut changed = false;

        for router in &mut self.routers {
            if let Some(entry) = router.on_link_prefixes.iter_mut().find(|e| e.prefix == *local_prefix) {
                if !entry.disregard {
                    entry.disregard = true;
                    changed = true;
                }
            }
        }

        if changed {
            self.evaluate(now);
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn is_address_on_link(&self, address: &Ipv6Addr, local_on_link_prefix: Option<&Ipv6Net>) -> bool {
        if local_on_link_prefix.is_some_and(|p| p.contains(address)) {
            return true;
        }
        self.routers
            .iter()
            .flat_map(|r| r.on_link_prefixes.iter())
            .any(|e| e.prefix.contains(address))
    }

    /// Whether a discovered route prefix other than `::/0` covers `address`.
    pub fn is_address_reachable_through_explicit_route(&self, address: &Ipv6Addr) -> bool {
        self.routers
            .iter()
            .flat_map(|r| r.route_prefixes.iter())
            .filter(|e| e.prefix.prefix_len() != 0)
            .any(|e| e.prefix.contains(address))
    }

    /// Whether any router advertised a usable default route.
    pub fn has_default_route(&self) -> bool {
        self.routers
            .iter()
            .flat_map(|r| r.route_prefixes.iter())
            .any(|e| e.prefix.prefix_len() == 0 && e.valid_lifetime > 0 && !e.disregard)
    }

    pub fn routers(&self, now: Instant) -> Vec<RouterInfo> {
        self.routers.iter().map(|r| r.info(now)).collect()
    }

    /// All prefix entries, aged against one `now` for the whole pass.
    pub fn prefix_entries(&self, now: Instant) -> Vec<PrefixTableEntry> {
        let mut entries = Vec::new();
        for router in &self.routers {
            let info = router.info(now);
            for entry in &router.on_link_prefixes {
                entries.push(PrefixTableEntry {
                    router: info.clone(),
                    prefix: entry.prefix,
                    is_on_link: true,
                    msec_since_last_update: now.saturating_duration_since(entry.last_update).as_millis() as u64,
                    valid_lifetime: entry.valid_lifetime,
                    preferred_lifetime: entry.preferred_lifetime,
                    route_preference: RoutePreference::Medium,
                });
            }
            for entry in &router.route_prefixes {
                entries.push(PrefixTableEntry {
                    router: info.clone(),
                    prefix: entry.prefix,
                    is_on_link: false,
                    msec_since_last_update: now.saturating_duration_since(entry.last_update).as_millis() as u64,
                    valid_lifetime: entry.valid_lifetime,
                    preferred_lifetime: 0,
                    route_preference: entry.preference,
                });
            }
        }
        entries
    }

    pub fn rdnss_entries(&self, now: Instant) -> Vec<RdnssEntry> {
        self.routers
            .iter()
            .flat_map(|r| {
                r.rdnss_addresses.iter().map(move |e| RdnssEntry {
                    router: r.address,
                    address: e.address,
                    msec_since_last_update: now.saturating_duration_since(e.last_update).as_millis() as u64,
                    lifetime: e.lifetime,
                })
            })
            .collect()
    }

    pub fn if_addresses(&self, now: Instant) -> Vec<IfAddressEntry> {
        self.if_addresses
            .iter()
            .map(|e| IfAddressEntry {
                address: e.address,
                secs_since_last_seen: now.saturating_duration_since(e.last_seen).as_secs(),
            })
            .collect()
    }

    // ── Timers ──────────────────────────────────────────────────────────────

    /// Runs whichever table timers are due. NS probes are held back while an
    /// RS burst is in progress.
    pub fn handle_timers(&mut self, now: Instant, rs_in_progress: bool) {
        // Checked first since evaluation below re-arms it.
        if self.stale_timer.take_expired(now) {
            info!("Stale timer expired");
            self.stale_expired = true;
        }
        if self.router_timer.take_expired(now) {
            self.handle_router_timer(now, rs_in_progress);
        }
        if self.expiration_timer.take_expired(now) | self.rdnss_timer.take_expired(now) {
            self.evaluate(now);
        }
    }

    fn handle_router_timer(&mut self, now: Instant, rs_in_progress: bool) {
        for router in &mut self.routers {
            if !router.should_check_reachability() || router.timeout > now {
                continue;
            }

            router.ns_probe_count += 1;

            if router.is_reachable() {
                router.timeout = now
                    + if router.ns_probe_count < MAX_NS_PROBES {
                        NS_PROBE_RETRY_INTERVAL
                    } else {
                        NS_PROBE_TIMEOUT
                    };
                if !rs_in_progress {
                    info!(
                        "Sending NS to router {} - attempt {}/{}",
                        router.address, router.ns_probe_count, MAX_NS_PROBES
                    );
                    self.ns_targets.push(router.address);
                }
            } else {
                info!("No response to NS probes from router {}, marking it unreachable", router.address);
                for entry in &mut router.on_link_prefixes {
                    if !entry.is_deprecated(now) {
                        entry.preferred_lifetime = 0;
                    }
                }
                for entry in &mut router.route_prefixes {
                    entry.valid_lifetime = 0;
                }
                for entry in &mut router.rdnss_addresses {
                    entry.lifetime = 0;
                }
            }
        }

        self.evaluate(now);
    }

    // ── Evaluation ──────────────────────────────────────────────────────────

    fn evaluate(&mut self, now: Instant) {
        let old_factors = self.decision_factors.clone();

        for router in &mut self.routers {
            router.on_link_prefixes.retain(|e| e.expire_time() > now);
            router.route_prefixes.retain(|e| e.expire_time() > now);
            let before = router.rdnss_addresses.len();
            router.rdnss_addresses.retain(|e| e.expire_time() > now);
            if router.rdnss_addresses.len() != before {
                self.rdnss_changed = true;
            }
        }

        self.routers.retain(|r| {
            let empty = r.is_empty();
            if empty {
                info!("Removing router {}", r.address);
            }
            !empty
        });

        let mut factors = DecisionFactors::default();
        for router in &mut self.routers {
            factors.update_flags_from(router);

            let mut all_disregarded = true;
            for entry in &router.on_link_prefixes {
                factors.update_from_on_link(entry);
                all_disregarded &= entry.should_disregard();
            }
            for entry in &router.route_prefixes {
                factors.update_from_route(entry);
                all_disregarded &= entry.should_disregard();
            }
            router.all_entries_disregarded = all_disregarded;
        }
        factors.reachable_peer_br_count = self
            .routers
            .iter()
            .filter(|r| !r.is_local_device && r.is_peer_br() && r.is_reachable())
            .count() as u16;
        self.decision_factors = factors;

        if self.decision_factors != old_factors {
            debug!("Decision factors changed: {:?}", self.decision_factors);
            self.table_changed = true;
        }

        self.schedule_timers(now);
    }

    fn schedule_timers(&mut self, now: Instant) {
        let mut router_timeout = NextFireTime::new(now);
        let mut expire_time = NextFireTime::new(now);
        let mut stale_time = NextFireTime::new(now);
        let mut rdnss_expire_time = NextFireTime::new(now);

        let reachable_interval = self.reachable_interval;
        for router in &mut self.routers {
            if router.should_check_reachability() {
                router.determine_reachability_timeout(reachable_interval);
                router_timeout.update_if_earlier(router.timeout);
            }
            for entry in &router.on_link_prefixes {
                expire_time.update_if_earlier(entry.expire_time());
            }
            for entry in &router.route_prefixes {
                expire_time.update_if_earlier(entry.expire_time());
            }
            for entry in &router.rdnss_addresses {
                rdnss_expire_time.update_if_earlier(entry.expire_time());
            }
        }

        // When several routers advertise the same prefix, the prefix goes
        // stale at the latest stale time among them.
        let on_link: BTreeSet<Ipv6Net> = self
            .routers
            .iter()
            .flat_map(|r| r.on_link_prefixes.iter().map(|e| e.prefix))
            .collect();
        for prefix in on_link {
            let stale = self
                .routers
                .iter()
                .flat_map(|r| r.on_link_prefixes.iter())
                .filter(|e| e.prefix == prefix && !e.is_deprecated(now))
                .map(|e| e.stale_time().max(now))
                .max();
            stale_time.update_opt(stale);
        }

        let routes: BTreeSet<Ipv6Net> = self
            .routers
            .iter()
            .flat_map(|r| r.route_prefixes.iter().map(|e| e.prefix))
            .collect();
        for prefix in routes {
            let stale = self
                .routers
                .iter()
                .flat_map(|r| r.route_prefixes.iter())
                .filter(|e| e.prefix == prefix)
                .map(|e| e.stale_time().max(now))
                .max();
            stale_time.update_opt(stale);
        }

        if let Some((header, update)) = &self.local_ra_header {
            let mut interval = STALE_TIME;
            if header.router_lifetime > 0 {
                interval = interval.min(header.router_lifetime as u32);
            }
            stale_time.update_if_earlier(clamped_expiration(*update, interval));
        }

        self.router_timer.fire_at_next(&router_timeout);
        self.expiration_timer.fire_at_next(&expire_time);
        self.stale_timer.fire_at_next(&stale_time);
        self.rdnss_timer.fire_at_next(&rdnss_expire_time);
    }
}
