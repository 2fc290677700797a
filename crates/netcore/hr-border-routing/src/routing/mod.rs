//! Border routing policy engine.
//!
//! `RoutingManager` ties the router table to the individual policy pieces:
//! it decides which on-link prefix to advertise on the infrastructure link,
//! which OMR, route and NAT64 entries to publish in the mesh data, and when
//! to send Router Advertisements.
//!
//! Like the rest of the crate it is a sans-io state machine: every entry
//! point takes the current time, outbound packets go through the `InfraIf`
//! implementation, and the owner polls `next_fire_time` / `handle_timers`
//! and drains `take_events`.

pub mod infra_if;
pub mod multi_ail;
pub mod nat64;
pub mod net_data;
pub mod omr;
pub mod on_link;
pub mod pd_prefix;
pub mod rio;
pub mod route_publisher;
pub mod rs_sender;

use std::collections::VecDeque;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::nd::{
    build_neighbor_solicit, ra_hash, NeighborAdvert, RaBuilder, RouterAdvert, ALL_NODES, ICMP6_NEIGHBOR_ADVERT,
    ICMP6_ROUTER_ADVERT, ICMP6_ROUTER_SOLICIT,
};
use crate::pd_client::DelegatedPrefix;
use crate::prefix::{is_valid_br_ula_prefix, RoutePreference};
use crate::timer::{add_jitter, Timer};
use crate::tracker::{
    PrefixRouterTable, PrefixTableEntry, RaContext, RaOrigin, RdnssEntry, RouterInfo, TrackerEvent,
};

use infra_if::InfraIf;
use multi_ail::MultiAilDetector;
use nat64::{Nat64PrefixManager, Nat64State};
use net_data::{DeviceRole, NetworkData};
use omr::{OmrPrefix, OmrPrefixManager};
use on_link::{OnLinkPrefixManager, OnLinkState, SavedOnLinkPrefix};
use pd_prefix::{PdPrefixInfo, PdPrefixManager, PdPrefixState, PdProcessedRaInfo};
use rio::{collect_rio_prefixes, RioAdvertiser};
use route_publisher::{PublishState, RoutePublisher, RoutePublisherInputs};
use rs_sender::RsSender;

// ── Constants ───────────────────────────────────────────────────────────────

const INITIAL_RA_TX_COUNT: u32 = 3;
const INITIAL_RA_INTERVAL: Duration = Duration::from_secs(16);
const INITIAL_RA_JITTER: Duration = Duration::from_secs(2);
const MAX_RA_INTERVAL: Duration = Duration::from_secs(180);
const MAX_RA_JITTER: Duration = Duration::from_secs(15);
const EVALUATION_DELAY: Duration = Duration::from_secs(3);
const EVALUATION_JITTER: Duration = Duration::from_secs(1);
const RS_REPLY_DELAY: Duration = Duration::from_millis(250);
const RS_REPLY_JITTER: Duration = Duration::from_millis(250);
const MIN_DELAY_BETWEEN_RAS: Duration = Duration::from_secs(3);

const MAX_TX_HASHES: usize = 5;
const MAX_EVENT_ROUNDS: usize = 8;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingState {
    Disabled,
    /// Enabled but waiting for the mesh attachment or the infrastructure
    /// interface.
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Immediately,
    ForNextRa,
    AfterRandomDelay,
    ToReplyToRs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    StateChanged(RoutingState),
    RaSent { len: usize },
    FavoredOmrPrefixChanged(Option<Ipv6Net>),
    PublishedRouteChanged(PublishState),
    Nat64StateChanged(Nat64State),
    PdStateChanged(PdPrefixState),
    MultiAilChanged(bool),
    RdnssChanged,
    /// Persisted on-link prefixes changed.
    SettingsChanged,
}

/// Everything the manager needs at construction.
#[derive(Debug, Clone)]
pub struct RoutingOptions {
    pub br_ula_prefix: Ipv6Net,
    pub ext_pan_id: [u8; 8],
    pub reachable_interval: Duration,
    pub max_old_on_link_prefixes: usize,
    pub saved_on_link_prefixes: Vec<SavedOnLinkPrefix>,
    pub nat64_enabled: bool,
    pub dhcp6_pd_enabled: bool,
    pub multi_ail_detection_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RaTxMode {
    AdvertiseFromNetData,
    InvalidateAll,
}

/// Bookkeeping of our own transmitted RAs.
#[derive(Debug, Default)]
struct TxRaInfo {
    tx_count: u32,
    last_tx_time: Option<Instant>,
    hashes: VecDeque<[u8; 32]>,
}

impl TxRaInfo {
    fn record(&mut self, ra: &[u8], now: Instant) {
        self.last_tx_time = Some(now);
        if self.hashes.len() == MAX_TX_HASHES {
            self.hashes.pop_front();
        }
        self.hashes.push_back(ra_hash(ra));
    }

    fn is_from_us(&self, ra: &[u8]) -> bool {
        let hash = ra_hash(ra);
        self.hashes.iter().any(|h| *h == hash)
    }
}

/// Values reported through events when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    state: RoutingState,
    favored_omr: Option<Ipv6Net>,
    published_route: PublishState,
    nat64: Nat64State,
    pd: PdPrefixState,
}

// ── Manager ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RoutingManager<I: InfraIf, N: NetworkData> {
    infra_if: I,
    net_data: N,
    br_ula_prefix: Ipv6Net,
    enabled: bool,
    running: bool,
    tracker: PrefixRouterTable,
    on_link: OnLinkPrefixManager,
    omr: OmrPrefixManager,
    route_publisher: RoutePublisher,
    nat64: Nat64PrefixManager,
    rio: RioAdvertiser,
    rs_sender: RsSender,
    pd_prefix: PdPrefixManager,
    multi_ail: MultiAilDetector,
    tx_ra_info: TxRaInfo,
    policy_timer: Timer,
    net_data_version: u64,
    observed: Observed,
    events: Vec<RoutingEvent>,
}

impl<I: InfraIf, N: NetworkData> RoutingManager<I, N> {
    pub fn new(options: RoutingOptions, infra_if: I, mut net_data: N, now: Instant) -> Result<Self> {
        if !is_valid_br_ula_prefix(&options.br_ula_prefix) {
            return Err(Error::InvalidArgs);
        }
        if options.reachable_interval.is_zero() {
            return Err(Error::InvalidArgs);
        }

        let mut rio = RioAdvertiser::default();
        rio.handle_role_changed(net_data.role().is_router_or_leader());
        let mut route_publisher = RoutePublisher::default();
        route_publisher.handle_role_changed(&mut net_data);

        let nat64 = Nat64PrefixManager::new(&options.br_ula_prefix, options.nat64_enabled);
        let pd_prefix = PdPrefixManager::new(options.dhcp6_pd_enabled);
        let observed = Observed {
            state: RoutingState::Disabled,
            favored_omr: None,
            published_route: route_publisher.state(),
            nat64: nat64.state(),
            pd: pd_prefix.state(),
        };

        info!("Border routing initialized with BR ULA prefix {}", options.br_ula_prefix);

        Ok(Self {
            br_ula_prefix: options.br_ula_prefix,
            enabled: false,
            running: false,
            tracker: PrefixRouterTable::new(options.reachable_interval),
            on_link: OnLinkPrefixManager::new(
                &options.ext_pan_id,
                &options.saved_on_link_prefixes,
                options.max_old_on_link_prefixes,
                now,
            ),
            omr: OmrPrefixManager::new(&options.br_ula_prefix),
            route_publisher,
            nat64,
            rio,
            rs_sender: RsSender::default(),
            pd_prefix,
            multi_ail: MultiAilDetector::new(options.multi_ail_detection_enabled),
            tx_ra_info: TxRaInfo::default(),
            policy_timer: Timer::new(),
            net_data_version: net_data.version(),
            observed,
            events: Vec::new(),
            infra_if,
            net_data,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn infra_if(&self) -> &I {
        &self.infra_if
    }

    pub fn infra_if_mut(&mut self) -> &mut I {
        &mut self.infra_if
    }

    pub fn net_data(&self) -> &N {
        &self.net_data
    }

    /// Direct access to the mesh data. Changes are picked up on the next
    /// entry point call.
    pub fn net_data_mut(&mut self) -> &mut N {
        &mut self.net_data
    }

    pub fn state(&self) -> RoutingState {
        if !self.enabled {
            RoutingState::Disabled
        } else if self.running {
            RoutingState::Running
        } else {
            RoutingState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn br_ula_prefix(&self) -> &Ipv6Net {
        &self.br_ula_prefix
    }

    pub fn local_omr_prefix(&self) -> &OmrPrefix {
        self.omr.local_prefix()
    }

    pub fn favored_omr_prefix(&self) -> Option<&OmrPrefix> {
        self.omr.favored_prefix()
    }

    pub fn on_link_prefix(&self) -> &Ipv6Net {
        self.on_link.local_prefix()
    }

    pub fn on_link_state(&self) -> OnLinkState {
        self.on_link.state()
    }

    /// Favored on-link prefix discovered on the link, if one is in use.
    pub fn favored_on_link_prefix(&self) -> Option<&Ipv6Net> {
        self.on_link.favored_discovered_prefix()
    }

    pub fn local_nat64_prefix(&self) -> &Ipv6Net {
        self.nat64.local_prefix()
    }

    pub fn favored_nat64_prefix(&self) -> (Ipv6Net, RoutePreference) {
        self.nat64.favored_prefix(self.omr.is_favored_infrastructure_derived())
    }

    pub fn nat64_state(&self) -> Nat64State {
        self.nat64.state()
    }

    pub fn published_route(&self) -> PublishState {
        self.route_publisher.state()
    }

    pub fn route_preference(&self) -> RoutePreference {
        self.route_publisher.preference()
    }

    pub fn rio_preference(&self) -> RoutePreference {
        self.rio.preference()
    }

    pub fn advertised_rio_prefixes(&self) -> Vec<Ipv6Net> {
        self.rio.advertised_prefixes()
    }

    pub fn pd_state(&self) -> PdPrefixState {
        self.pd_prefix.state()
    }

    pub fn pd_prefix_info(&self, now: Instant) -> Result<PdPrefixInfo> {
        self.pd_prefix.info(now)
    }

    pub fn pd_processed_ra_info(&self, now: Instant) -> PdProcessedRaInfo {
        self.pd_prefix.processed_ra_info(now)
    }

    pub fn is_multi_ail_detected(&self) -> bool {
        self.multi_ail.is_detected()
    }

    pub fn prefix_table(&self, now: Instant) -> Vec<PrefixTableEntry> {
        self.tracker.prefix_entries(now)
    }

    pub fn routers(&self, now: Instant) -> Vec<RouterInfo> {
        self.tracker.routers(now)
    }

    pub fn rdnss_entries(&self, now: Instant) -> Vec<RdnssEntry> {
        self.tracker.rdnss_entries(now)
    }

    pub fn is_address_on_link(&self, address: &Ipv6Addr) -> bool {
        let local = (self.on_link.state() != OnLinkState::Idle).then_some(self.on_link.local_prefix());
        self.tracker.is_address_on_link(address, local)
    }

    pub fn saved_on_link_prefixes(&self, now: Instant) -> Vec<SavedOnLinkPrefix> {
        self.on_link.saved_prefixes(now)
    }

    pub fn take_events(&mut self) -> Vec<RoutingEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        [
            self.tracker.next_fire_time(),
            self.rs_sender.next_fire_time(),
            self.on_link.next_fire_time(),
            self.rio.next_fire_time(),
            self.route_publisher.next_fire_time(),
            self.nat64.next_fire_time(),
            self.pd_prefix.next_fire_time(),
            self.multi_ail.next_fire_time(),
            self.policy_timer.fire_time(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ── Control ─────────────────────────────────────────────────────────────

    pub fn set_enabled(&mut self, enabled: bool, now: Instant) {
        if self.enabled == enabled {
            return;
        }
        info!("Border routing {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;
        self.evaluate_state(now);
        self.finish(now);
    }

    /// Re-checks the start conditions, for instance after the mesh role or
    /// the infrastructure interface state changed.
    pub fn handle_infra_if_state_changed(&mut self, now: Instant) {
        self.evaluate_state(now);
        self.finish(now);
    }

    pub fn handle_role_changed(&mut self, now: Instant) {
        let role = self.net_data.role();
        debug!("Mesh role changed to {:?}", role);

        if self.rio.handle_role_changed(role.is_router_or_leader()) {
            self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
        }
        self.route_publisher.handle_role_changed(&mut self.net_data);
        self.evaluate_state(now);
        self.finish(now);
    }

    pub fn handle_parent_link_quality_changed(&mut self, now: Instant) {
        if self.net_data.role() == DeviceRole::Child {
            self.route_publisher.handle_parent_link_quality_changed(&mut self.net_data, now);
        }
        self.finish(now);
    }

    pub fn handle_ext_pan_id_changed(&mut self, ext_pan_id: &[u8; 8], now: Instant) {
        if self.on_link.handle_ext_pan_id_change(ext_pan_id, now) && self.running {
            self.evaluate_route_publisher(now);
            self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
        }
        self.finish(now);
    }

    pub fn set_nat64_enabled(&mut self, enabled: bool, now: Instant) {
        self.nat64.set_enabled(enabled, self.running, &mut self.net_data, now);
        if self.running {
            self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
        }
        self.finish(now);
    }

    pub fn set_dhcp6_pd_enabled(&mut self, enabled: bool, now: Instant) {
        if self.pd_prefix.set_enabled(enabled) {
            self.schedule_routing_policy_evaluation(ScheduleMode::Immediately, now);
        }
        self.finish(now);
    }

    pub fn set_multi_ail_detection_enabled(&mut self, enabled: bool, now: Instant) {
        if let Some(detected) = self.multi_ail.set_enabled(enabled) {
            self.events.push(RoutingEvent::MultiAilChanged(detected));
        }
        if enabled && self.running {
            self.multi_ail.start();
            self.evaluate_multi_ail(now);
        }
        self.finish(now);
    }

    pub fn set_rio_preference(&mut self, preference: RoutePreference, now: Instant) {
        if self.rio.set_preference(preference) {
            self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
        }
        self.finish(now);
    }

    pub fn clear_rio_preference(&mut self, now: Instant) {
        if self.rio.clear_preference() {
            self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
        }
        self.finish(now);
    }

    pub fn set_route_preference(&mut self, preference: RoutePreference, now: Instant) {
        self.route_publisher.set_preference(&mut self.net_data, preference);
        self.finish(now);
    }

    pub fn clear_route_preference(&mut self, now: Instant) {
        self.route_publisher.clear_preference(&mut self.net_data);
        self.finish(now);
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    /// Dispatches an ICMPv6 message received on the infrastructure interface.
    pub fn handle_received_icmp6(&mut self, packet: &[u8], src: Ipv6Addr, now: Instant) {
        if !self.running {
            return;
        }
        match packet.first() {
            Some(&ICMP6_ROUTER_ADVERT) => self.handle_router_advert(packet, src, now),
            Some(&ICMP6_ROUTER_SOLICIT) => {
                debug!("Received RS from {}", src);
                self.schedule_routing_policy_evaluation(ScheduleMode::ToReplyToRs, now);
            }
            Some(&ICMP6_NEIGHBOR_ADVERT) => match NeighborAdvert::parse(packet) {
                Ok(na) => self.tracker.process_neighbor_advert(&na, now),
                Err(e) => debug!("Dropping NA from {}: {}", src, e),
            },
            _ => {}
        }
        self.finish(now);
    }

    /// Handles an RA generated by a platform DHCPv6-PD agent.
    pub fn process_platform_ra(&mut self, packet: &[u8], now: Instant) -> Result<()> {
        let result = self.pd_prefix.process_platform_ra(packet, now);
        if let Ok(true) = result {
            self.schedule_routing_policy_evaluation(ScheduleMode::Immediately, now);
        }
        self.finish(now);
        result.map(|_| ())
    }

    pub fn process_delegated_prefix(&mut self, delegated: &DelegatedPrefix, now: Instant) {
        if self.pd_prefix.process_delegated_prefix(delegated, now) {
            self.schedule_routing_policy_evaluation(ScheduleMode::Immediately, now);
        }
        self.finish(now);
    }

    pub fn handle_nat64_discover_done(&mut self, prefix: Option<Ipv6Net>, now: Instant) {
        if self.nat64.handle_discover_done(prefix) && self.running {
            self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
        }
        self.finish(now);
    }

    /// Mesh data changed. Also detected automatically through
    /// `NetworkData::version`.
    pub fn handle_net_data_changed(&mut self, now: Instant) {
        self.process_net_data_change(now);
        self.finish(now);
    }

    // ── Timers ──────────────────────────────────────────────────────────────

    pub fn handle_timers(&mut self, now: Instant) {
        self.tracker.handle_timers(now, self.rs_sender.is_in_progress());

        if let Some(start_time) = self.rs_sender.handle_timer(&mut self.infra_if, now) {
            self.tracker.remove_or_deprecate_old_entries(start_time, now);
            self.schedule_routing_policy_evaluation(ScheduleMode::Immediately, now);
        }
        if self.on_link.handle_timer(now) {
            self.evaluate_route_publisher(now);
        }
        if self.rio.handle_timer(now) {
            self.schedule_routing_policy_evaluation(ScheduleMode::Immediately, now);
        }
        if self.route_publisher.handle_timer(&mut self.net_data, now) {
            self.evaluate_route_publisher(now);
        }
        self.nat64.handle_timer(&mut self.infra_if, now);
        if self.pd_prefix.handle_timer(now) {
            self.schedule_routing_policy_evaluation(ScheduleMode::Immediately, now);
        }
        if let Some(detected) = self.multi_ail.handle_timer(now) {
            self.events.push(RoutingEvent::MultiAilChanged(detected));
        }
        if self.policy_timer.take_expired(now) {
            self.evaluate_routing_policy(now);
        }

        self.finish(now);
    }

    // ── Start / stop ────────────────────────────────────────────────────────

    fn evaluate_state(&mut self, now: Instant) {
        let should_run = self.enabled && self.net_data.is_attached() && self.infra_if.is_running();
        if should_run && !self.running {
            self.start(now);
        } else if !should_run && self.running {
            self.stop(now);
        }
    }

    fn start(&mut self, now: Instant) {
        info!("Border routing manager started");
        self.running = true;
        self.net_data_version = self.net_data.version();

        self.tracker.handle_net_data_change(&self.net_data.omr_prefixes(), now);
        self.on_link.start();
        self.omr.start(&self.net_data);
        self.evaluate_route_publisher(now);
        self.rs_sender.start(now);
        self.nat64.start(now);
        self.pd_prefix.start();
        self.multi_ail.start();
    }

    fn stop(&mut self, now: Instant) {
        self.omr.stop(&mut self.net_data);
        self.on_link.stop();
        self.nat64.stop(&mut self.net_data);

        self.send_router_advertisement(RaTxMode::InvalidateAll, now);

        self.rio.clear();
        self.tracker.clear();
        self.tx_ra_info.tx_count = 0;
        self.rs_sender.stop();
        self.policy_timer.stop();
        self.route_publisher.stop(&mut self.net_data);
        self.pd_prefix.stop();
        if let Some(detected) = self.multi_ail.stop() {
            self.events.push(RoutingEvent::MultiAilChanged(detected));
        }

        self.running = false;
        info!("Border routing manager stopped");
    }

    // ── Policy ──────────────────────────────────────────────────────────────

    fn evaluate_routing_policy(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        debug!("Evaluating routing policy");

        let favored = self.tracker.decision_factors().favored_on_link_prefix;
        let has_ula_route = self.net_data.contains_ula_route();
        if self.on_link.evaluate(favored, has_ula_route, self.rs_sender.is_in_progress(), now) {
            let local = *self.on_link.local_prefix();
            self.tracker.handle_local_on_link_prefix_changed(&local, now);
        }
        self.route_publisher
            .update_adv_pio_flag(&mut self.net_data, self.on_link.is_publishing_or_advertising());

        self.omr.evaluate(&mut self.net_data, self.pd_prefix.current_prefix());
        self.evaluate_route_publisher(now);
        self.nat64
            .evaluate(&mut self.net_data, self.omr.is_favored_infrastructure_derived());

        self.send_router_advertisement(RaTxMode::AdvertiseFromNetData, now);
        self.schedule_routing_policy_evaluation(ScheduleMode::ForNextRa, now);
    }

    fn schedule_routing_policy_evaluation(&mut self, mode: ScheduleMode, now: Instant) {
        if !self.running {
            return;
        }

        let delay = match mode {
            ScheduleMode::Immediately => Duration::ZERO,
            ScheduleMode::ForNextRa if self.tx_ra_info.tx_count <= INITIAL_RA_TX_COUNT => {
                add_jitter(INITIAL_RA_INTERVAL, INITIAL_RA_JITTER)
            }
            ScheduleMode::ForNextRa => add_jitter(MAX_RA_INTERVAL, MAX_RA_JITTER),
            ScheduleMode::AfterRandomDelay => add_jitter(EVALUATION_DELAY, EVALUATION_JITTER),
            ScheduleMode::ToReplyToRs => add_jitter(RS_REPLY_DELAY, RS_REPLY_JITTER),
        };

        let mut evaluate_time = now + delay;
        if let Some(last_tx) = self.tx_ra_info.last_tx_time {
            evaluate_time = evaluate_time.max(last_tx + MIN_DELAY_BETWEEN_RAS);
        }

        debug!("Scheduling routing policy evaluation ({:?}) in {:?}", mode, evaluate_time - now);
        self.policy_timer.fire_at_if_earlier(evaluate_time);
    }

    fn evaluate_route_publisher(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        let factors = self.tracker.decision_factors();
        let inputs = RoutePublisherInputs {
            favored_omr_infra_derived: self.omr.is_favored_infrastructure_derived(),
            has_default_or_non_ula_route: self.tracker.has_default_route() || factors.has_non_ula_route,
            has_non_ula_on_link: factors.has_non_ula_on_link,
            has_ula_on_link: factors.has_ula_on_link,
            should_publish_ula_route: self.on_link.should_publish_ula_route(),
        };
        if let Some(default_route) = self.route_publisher.evaluate(&mut self.net_data, &inputs, now) {
            self.omr.update_default_route_flag(&mut self.net_data, default_route);
        }
    }

    fn evaluate_multi_ail(&mut self, now: Instant) {
        let reachable = self.tracker.decision_factors().reachable_peer_br_count;
        self.multi_ail.evaluate(self.net_data.peer_br_count(), reachable, now);
    }

    // ── Router Advertisements ───────────────────────────────────────────────

    fn rio_prefixes(&self) -> Vec<Ipv6Net> {
        let local = self
            .omr
            .is_local_added_in_net_data()
            .then_some(&self.omr.local_prefix().prefix);
        collect_rio_prefixes(local, self.omr.favored_prefix(), &self.net_data.on_mesh_prefixes())
    }

    fn build_router_advert(&mut self, mode: RaTxMode, now: Instant) -> Result<Option<Vec<u8>>> {
        let mut header = self.tracker.local_ra_header().copied().unwrap_or_default();
        self.tracker.set_header_flags_on(&mut header);

        let mut builder = RaBuilder::new(&header);
        self.on_link.append_pios(&mut builder, now)?;
        match mode {
            RaTxMode::InvalidateAll => self.rio.invalidate_all(&mut builder)?,
            RaTxMode::AdvertiseFromNetData => {
                let prefixes = self.rio_prefixes();
                self.rio.append_rios(&mut builder, &prefixes, now)?;
            }
        }

        if !builder.has_options() {
            return Ok(None);
        }
        builder.append_flags_ext(true)?;
        Ok(Some(builder.finish()))
    }

    fn send_router_advertisement(&mut self, mode: RaTxMode, now: Instant) {
        let ra = match self.build_router_advert(mode, now) {
            Ok(Some(ra)) => ra,
            Ok(None) => {
                debug!("Nothing to advertise, skipping RA");
                return;
            }
            Err(e) => {
                warn!("Failed to build RA: {}", e);
                return;
            }
        };

        self.tx_ra_info.tx_count += 1;
        match self.infra_if.send_icmp6(&ra, ALL_NODES) {
            Ok(()) => {
                info!("Sent RA ({} bytes, #{})", ra.len(), self.tx_ra_info.tx_count);
                self.tx_ra_info.record(&ra, now);
                self.events.push(RoutingEvent::RaSent { len: ra.len() });
            }
            Err(e) => warn!("Failed to send RA: {}", e),
        }
    }

    fn handle_router_advert(&mut self, packet: &[u8], src: Ipv6Addr, now: Instant) {
        let ra = match RouterAdvert::parse(packet) {
            Ok(ra) => ra,
            Err(e) => {
                debug!("Dropping RA from {}: {}", src, e);
                return;
            }
        };

        let origin = if !self.infra_if.has_address(&src) {
            RaOrigin::AnotherRouter
        } else if self.tx_ra_info.is_from_us(packet) {
            RaOrigin::ThisBrRoutingManager
        } else {
            RaOrigin::ThisBrOtherEntity
        };

        let infra_if = &self.infra_if;
        self.tracker.retain_if_addresses(|addr| infra_if.has_address(addr));

        let advertised_rios = self.rio.advertised_prefixes();
        let net_data_omr_prefixes = self.net_data.omr_prefixes();
        let ctx = RaContext {
            local_on_link_prefix: (self.on_link.state() != OnLinkState::Idle).then_some(*self.on_link.local_prefix()),
            local_omr_prefix: self
                .omr
                .is_local_added_in_net_data()
                .then_some(self.omr.local_prefix().prefix),
            advertised_rios: &advertised_rios,
            net_data_omr_prefixes: &net_data_omr_prefixes,
        };
        self.tracker.process_router_advert(&ra, src, origin, &ctx, now);
    }

    // ── Change propagation ──────────────────────────────────────────────────

    fn process_net_data_change(&mut self, now: Instant) {
        self.net_data_version = self.net_data.version();
        if !self.running {
            return;
        }

        self.tracker.handle_net_data_change(&self.net_data.omr_prefixes(), now);
        if self.on_link.handle_net_data_change(self.net_data.contains_ula_route()) {
            debug!("ULA route present in network data, advertising on-link prefix");
        }
        self.evaluate_multi_ail(now);
        self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
    }

    fn handle_tracker_event(&mut self, event: TrackerEvent, now: Instant) {
        match event {
            TrackerEvent::TableChanged => {
                if !self.running {
                    return;
                }
                let favored = self.tracker.decision_factors().favored_on_link_prefix;
                if self.on_link.handle_table_changed(favored) {
                    self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
                }
                self.evaluate_route_publisher(now);
                self.evaluate_multi_ail(now);
            }
            TrackerEvent::RdnssChanged => self.events.push(RoutingEvent::RdnssChanged),
            TrackerEvent::LocalHeaderChanged => {
                self.schedule_routing_policy_evaluation(ScheduleMode::AfterRandomDelay, now);
            }
            TrackerEvent::StaleTimeout => {
                if self.running {
                    self.rs_sender.start(now);
                }
            }
            TrackerEvent::SendNeighborSolicit(target) => {
                let ll = self.infra_if.link_layer_address();
                let ns = build_neighbor_solicit(target, ll.as_deref());
                if let Err(e) = self.infra_if.send_icmp6(&ns, target) {
                    warn!("Failed to send NS to {}: {}", target, e);
                }
            }
        }
    }

    /// Drains internal signals until nothing changes and reports the
    /// resulting state changes as events.
    fn finish(&mut self, now: Instant) {
        for _ in 0..MAX_EVENT_ROUNDS {
            let tracker_events = self.tracker.take_events();
            let net_data_changed = self.net_data.version() != self.net_data_version;
            if tracker_events.is_empty() && !net_data_changed {
                break;
            }
            for event in tracker_events {
                self.handle_tracker_event(event, now);
            }
            if net_data_changed {
                self.process_net_data_change(now);
            }
        }

        if self.on_link.take_settings_changed() {
            self.events.push(RoutingEvent::SettingsChanged);
        }

        let observed = Observed {
            state: self.state(),
            favored_omr: self.omr.favored_prefix().map(|p| p.prefix),
            published_route: self.route_publisher.state(),
            nat64: self.nat64.state(),
            pd: self.pd_prefix.state(),
        };
        if observed.state != self.observed.state {
            self.events.push(RoutingEvent::StateChanged(observed.state));
        }
        if observed.favored_omr != self.observed.favored_omr {
            self.events.push(RoutingEvent::FavoredOmrPrefixChanged(observed.favored_omr));
        }
        if observed.published_route != self.observed.published_route {
            self.events.push(RoutingEvent::PublishedRouteChanged(observed.published_route));
        }
        if observed.nat64 != self.observed.nat64 {
            self.events.push(RoutingEvent::Nat64StateChanged(observed.nat64));
        }
        if observed.pd != self.observed.pd {
            self.events.push(RoutingEvent::PdStateChanged(observed.pd));
        }
        self.observed = observed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nd::{build_router_solicit, RaHeader};
    use crate::routing::infra_if::testing::FakeInfraIf;
    use crate::routing::net_data::LocalNetworkData;

    type Manager = RoutingManager<FakeInfraIf, LocalNetworkData>;

    const EXT_PAN_ID: [u8; 8] = [0xde, 0xad, 0x00, 0xbe, 0xef, 0x00, 0xca, 0xfe];

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn local_addr() -> Ipv6Addr {
        "fe80::1".parse().unwrap()
    }

    fn peer_addr() -> Ipv6Addr {
        "fe80::2".parse().unwrap()
    }

    fn options() -> RoutingOptions {
        RoutingOptions {
            br_ula_prefix: net("fd11:2233:4455::/48"),
            ext_pan_id: EXT_PAN_ID,
            reachable_interval: Duration::from_secs(60),
            max_old_on_link_prefixes: 3,
            saved_on_link_prefixes: Vec::new(),
            nat64_enabled: false,
            dhcp6_pd_enabled: false,
            multi_ail_detection_enabled: true,
        }
    }

    fn manager_with(options: RoutingOptions, now: Instant) -> Manager {
        let mut infra_if = FakeInfraIf::new();
        infra_if.addresses.push(local_addr());
        let mut manager = Manager::new(options, infra_if, LocalNetworkData::default(), now).unwrap();
        manager.set_enabled(true, now);
        manager
    }

    fn run_until(manager: &mut Manager, end: Instant) {
        for _ in 0..10_000 {
            match manager.next_fire_time() {
                Some(t) if t <= end => manager.handle_timers(t),
                _ => return,
            }
        }
        panic!("timers did not settle");
    }

    /// Runs timers until `count` RAs went out and returns the time of the
    /// last one.
    fn run_until_ras(manager: &mut Manager, count: usize, limit: Instant) -> Instant {
        while let Some(t) = manager.next_fire_time() {
            assert!(t <= limit, "RA #{} not sent in time", count);
            manager.handle_timers(t);
            if sent_ras(manager).len() >= count {
                return t;
            }
        }
        panic!("no timer pending");
    }

    fn sent_ras(manager: &Manager) -> Vec<RouterAdvert> {
        manager
            .infra_if()
            .sent_of_type(ICMP6_ROUTER_ADVERT)
            .iter()
            .map(|(ra, _)| RouterAdvert::parse(ra).unwrap())
            .collect()
    }

    fn last_ra(manager: &Manager) -> RouterAdvert {
        sent_ras(manager).pop().unwrap()
    }

    /// Manager that finished its RS burst and advertises its on-link prefix.
    fn advertising_manager(options: RoutingOptions, now: Instant) -> (Manager, Instant) {
        let mut manager = manager_with(options, now);
        let t = run_until_ras(&mut manager, 2, now + Duration::from_secs(20));
        (manager, t)
    }

    fn peer_ra(on_link: &str, preferred_lifetime: u32) -> Vec<u8> {
        let header = RaHeader {
            cur_hop_limit: 64,
            ..RaHeader::default()
        };
        let mut builder = RaBuilder::new(&header);
        builder.append_pio(&net(on_link), 1800, preferred_lifetime).unwrap();
        builder.finish()
    }

    #[test]
    fn test_rejects_invalid_br_ula_prefix() {
        let mut options = options();
        options.br_ula_prefix = net("2001:db8::/48");
        let result = Manager::new(options, FakeInfraIf::new(), LocalNetworkData::default(), Instant::now());
        assert!(matches!(result, Err(Error::InvalidArgs)));
    }

    #[test]
    fn test_start_conditions() {
        let now = Instant::now();
        let mut infra_if = FakeInfraIf::new();
        infra_if.running = false;
        let mut manager = Manager::new(options(), infra_if, LocalNetworkData::default(), now).unwrap();
        assert_eq!(manager.state(), RoutingState::Disabled);

        manager.set_enabled(true, now);
        assert_eq!(manager.state(), RoutingState::Stopped);

        manager.infra_if_mut().running = true;
        manager.handle_infra_if_state_changed(now);
        assert_eq!(manager.state(), RoutingState::Running);

        let events = manager.take_events();
        assert!(events.contains(&RoutingEvent::StateChanged(RoutingState::Stopped)));
        assert!(events.contains(&RoutingEvent::StateChanged(RoutingState::Running)));

        manager.net_data_mut().set_role(DeviceRole::Detached);
        manager.handle_role_changed(now);
        assert_eq!(manager.state(), RoutingState::Stopped);
    }

    #[test]
    fn test_initial_policy_evaluation() {
        let now = Instant::now();
        let mut manager = manager_with(options(), now);
        assert!(sent_ras(&manager).is_empty());

        let first = run_until_ras(&mut manager, 1, now + Duration::from_secs(11));
        assert_eq!(manager.infra_if().sent_of_type(ICMP6_ROUTER_SOLICIT).len(), 3);

        // First RA only carries the OMR route; the on-link prefix waits for
        // the ULA route to show up in mesh data.
        let local_omr = manager.local_omr_prefix().prefix;
        assert_eq!(local_omr, net("fd11:2233:4455:1::/64"));
        let ra = last_ra(&manager);
        assert!(ra.route_infos().any(|rio| rio.prefix == local_omr && rio.lifetime > 0));
        assert_eq!(ra.prefix_infos().count(), 0);
        assert!(manager.net_data().omr_prefixes().contains(&local_omr));
        assert!(manager.net_data().contains_ula_route());
        assert_eq!(manager.published_route(), PublishState::PublishUla);

        let second = run_until_ras(&mut manager, 2, first + Duration::from_secs(5));
        assert!(second >= first + MIN_DELAY_BETWEEN_RAS);
        assert_eq!(manager.on_link_state(), OnLinkState::Advertising);
        let on_link = *manager.on_link_prefix();
        let ra = last_ra(&manager);
        let pio = ra.prefix_infos().find(|pio| pio.prefix == on_link).unwrap();
        assert_eq!(pio.valid_lifetime, 1800);
        assert_eq!(pio.preferred_lifetime, 1800);

        let events = manager.take_events();
        assert!(events.contains(&RoutingEvent::FavoredOmrPrefixChanged(Some(local_omr))));
        assert!(events.contains(&RoutingEvent::PublishedRouteChanged(PublishState::PublishUla)));
        assert!(events.iter().any(|e| matches!(e, RoutingEvent::RaSent { .. })));
    }

    #[test]
    fn test_reply_to_rs() {
        let now = Instant::now();
        let (mut manager, last) = advertising_manager(options(), now);

        let t = last + Duration::from_secs(5);
        manager.handle_received_icmp6(&build_router_solicit(), peer_addr(), t);
        assert!(manager.next_fire_time().unwrap() <= t + Duration::from_millis(500));

        run_until(&mut manager, t + Duration::from_millis(500));
        assert_eq!(sent_ras(&manager).len(), 3);
        let dest = manager.infra_if().sent_of_type(ICMP6_ROUTER_ADVERT).pop().unwrap().1;
        assert_eq!(dest, ALL_NODES);
    }

    #[test]
    fn test_ras_are_spaced() {
        let now = Instant::now();
        let (mut manager, last) = advertising_manager(options(), now);

        let t = last + Duration::from_secs(1);
        manager.handle_received_icmp6(&build_router_solicit(), peer_addr(), t);
        run_until(&mut manager, last + Duration::from_millis(2900));
        assert_eq!(sent_ras(&manager).len(), 2);
        run_until(&mut manager, last + MIN_DELAY_BETWEEN_RAS);
        assert_eq!(sent_ras(&manager).len(), 3);
    }

    #[test]
    fn test_own_ra_is_not_tracked() {
        let now = Instant::now();
        let (mut manager, last) = advertising_manager(options(), now);

        let own = manager.infra_if().sent_of_type(ICMP6_ROUTER_ADVERT).pop().unwrap().0.clone();
        manager.handle_received_icmp6(&own, local_addr(), last);
        assert!(manager.routers(last).is_empty());
    }

    #[test]
    fn test_rs_burst_deprecates_entries_not_refreshed() {
        let now = Instant::now();
        let mut manager = manager_with(options(), now);
        let stale = net("2001:db8:1::/64");
        let fresh = net("2001:db8:2::/64");
        let other_peer: Ipv6Addr = "fe80::3".parse().unwrap();

        manager.handle_received_icmp6(&peer_ra("2001:db8:1::/64", 1800), peer_addr(), now);
        let t = now + Duration::from_secs(2);
        manager.handle_received_icmp6(&peer_ra("2001:db8:2::/64", 1800), other_peer, t);

        let preferred = |manager: &Manager, prefix: Ipv6Net, at: Instant| {
            manager
                .prefix_table(at)
                .iter()
                .find(|e| e.prefix == prefix)
                .map(|e| e.preferred_lifetime)
        };
        assert_eq!(preferred(&manager, stale, t), Some(1800));

        let end = now + Duration::from_secs(15);
        run_until(&mut manager, end);
        assert_eq!(manager.infra_if().sent_of_type(ICMP6_ROUTER_SOLICIT).len(), 3);
        assert_eq!(preferred(&manager, stale, end), Some(0));
        assert_eq!(preferred(&manager, fresh, end), Some(1800));
    }

    #[test]
    fn test_yields_to_favored_on_link_prefix() {
        let now = Instant::now();
        let (mut manager, last) = advertising_manager(options(), now);
        let local = *manager.on_link_prefix();

        let t = last + Duration::from_secs(1);
        manager.handle_received_icmp6(&peer_ra("2001:db8:1::/64", 1800), peer_addr(), t);
        assert_eq!(manager.routers(t).len(), 1);

        // Non-ULA on-link prefix on the link: publish the default route.
        assert_eq!(manager.published_route(), PublishState::PublishDefault);
        let default_route = net("::/0");
        assert!(manager.net_data().external_routes().iter().any(|r| r.prefix == default_route));

        run_until(&mut manager, t + Duration::from_secs(5));
        assert_eq!(manager.on_link_state(), OnLinkState::Deprecating);
        assert_eq!(manager.favored_on_link_prefix(), Some(&net("2001:db8:1::/64")));

        let ra = last_ra(&manager);
        let pio = ra.prefix_infos().find(|pio| pio.prefix == local).unwrap();
        assert_eq!(pio.preferred_lifetime, 0);
        assert!(pio.valid_lifetime > 0);
    }

    #[test]
    fn test_disable_invalidates_advertised_prefixes() {
        let now = Instant::now();
        let (mut manager, last) = advertising_manager(options(), now);
        let local_omr = manager.local_omr_prefix().prefix;

        let t = last + Duration::from_secs(1);
        manager.set_enabled(false, t);
        assert_eq!(manager.state(), RoutingState::Disabled);

        let ra = last_ra(&manager);
        let rio = ra.route_infos().find(|rio| rio.prefix == local_omr).unwrap();
        assert_eq!(rio.lifetime, 0);
        assert!(ra.prefix_infos().all(|pio| pio.preferred_lifetime == 0));

        assert!(manager.net_data().omr_prefixes().is_empty());
        assert!(manager.net_data().external_routes().is_empty());
        assert!(manager.policy_timer.fire_time().is_none());
        assert!(!manager.rs_sender.is_in_progress());
    }

    #[test]
    fn test_delegated_prefix_becomes_local_omr() {
        let now = Instant::now();
        let mut options = options();
        options.dhcp6_pd_enabled = true;
        let (mut manager, last) = advertising_manager(options, now);
        assert_eq!(manager.pd_state(), PdPrefixState::Idle);

        let t = last + Duration::from_secs(1);
        let delegated = DelegatedPrefix {
            prefix: net("2001:db8:aa::/64"),
            valid_lifetime: 7200,
            preferred_lifetime: 3600,
        };
        manager.process_delegated_prefix(&delegated, t);
        assert_eq!(manager.pd_state(), PdPrefixState::Running);

        run_until(&mut manager, t + Duration::from_secs(4));
        let omr_prefixes = manager.net_data().omr_prefixes();
        assert!(omr_prefixes.contains(&net("2001:db8:aa::/64")));
        assert!(!omr_prefixes.contains(&net("fd11:2233:4455:1::/64")));
        assert_eq!(manager.local_omr_prefix().prefix, net("2001:db8:aa::/64"));
        assert!(manager.take_events().contains(&RoutingEvent::PdStateChanged(PdPrefixState::Running)));
    }

    #[test]
    fn test_multi_ail_detection() {
        let now = Instant::now();
        let (mut manager, last) = advertising_manager(options(), now);

        let t = last + Duration::from_secs(1);
        manager.net_data_mut().set_peer_br_count(1);
        manager.handle_net_data_changed(t);
        assert!(!manager.is_multi_ail_detected());

        run_until(&mut manager, t + multi_ail::DETECT_TIME);
        assert!(manager.is_multi_ail_detected());
        assert!(manager.take_events().contains(&RoutingEvent::MultiAilChanged(true)));
    }

    #[test]
    fn test_ext_pan_id_change_deprecates_old_prefix() {
        let now = Instant::now();
        let (mut manager, last) = advertising_manager(options(), now);
        let old = *manager.on_link_prefix();

        let t = last + Duration::from_secs(1);
        manager.handle_ext_pan_id_changed(&[1, 2, 3, 4, 5, 6, 7, 8], t);
        assert_ne!(*manager.on_link_prefix(), old);
        assert!(manager.take_events().contains(&RoutingEvent::SettingsChanged));
        assert!(manager.saved_on_link_prefixes(t).iter().any(|s| s.prefix == old));

        run_until(&mut manager, t + Duration::from_secs(5));
        let ra = last_ra(&manager);
        let pio = ra.prefix_infos().find(|pio| pio.prefix == old).unwrap();
        assert_eq!(pio.preferred_lifetime, 0);
    }

    #[test]
    fn test_nat64_prefix_published() {
        let now = Instant::now();
        let mut options = options();
        options.nat64_enabled = true;
        let (mut manager, last) = advertising_manager(options, now);

        assert!(manager.infra_if().nat64_discoveries >= 1);
        assert_eq!(manager.nat64_state(), Nat64State::Active);
        let local = *manager.local_nat64_prefix();
        assert!(manager.net_data().external_routes().iter().any(|r| r.nat64 && r.prefix == local));

        // The local OMR prefix is not infrastructure derived, so the
        // discovered prefix is not favored.
        manager.handle_nat64_discover_done(Some(net("64:ff9b::/96")), last);
        assert_eq!(manager.favored_nat64_prefix(), (local, RoutePreference::Low));
    }
}
