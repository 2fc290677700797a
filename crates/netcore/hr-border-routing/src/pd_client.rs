//! DHCPv6 Prefix Delegation client (RFC 8415).
//!
//! Requests a prefix from the upstream DHCPv6 server on the infrastructure
//! link and keeps it renewed. The client is sans-io: every entry point takes
//! the current time and returns the effects (messages to send, prefix
//! reports) for the caller to carry out.

use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use tracing::{debug, info, warn};

use crate::dhcp6::{
    self, Dhcp6Message, IaPd, StatusCode, MSG_ADVERTISE, MSG_REBIND, MSG_RELEASE, MSG_RENEW,
    MSG_REPLY, MSG_REQUEST, MSG_SOLICIT, OPT_CLIENTID, OPT_ELAPSED_TIME, OPT_IA_PD, OPT_ORO,
    OPT_SERVERID, OPT_SOL_MAX_RT,
};
use crate::prefix::{new_prefix, pad_to_64};
use crate::retx::{JitterMode, RetxTracker};
use crate::timer::{random_delay, Timer};

// ── Constants ───────────────────────────────────────────────────────────────

const IAID: u32 = 0;
const DESIRED_PREFIX_LEN: u8 = 64;

pub const MIN_PREFERRED_LIFETIME: u32 = 1800;
pub const MAX_PREFERRED_LIFETIME: u32 = 14400;
const MAX_VALID_MARGIN_AFTER_PREFERRED: u32 = 120;

const MIN_T1: u32 = 300;
const MIN_T1_MARGIN_BEFORE_PREFERRED: u32 = 900;
const MIN_T2_MARGIN_BEFORE_PREFERRED: u32 = 360;

const MAX_DELAY_FIRST_SOLICIT: Duration = Duration::from_millis(1000);
const INITIAL_SOLICIT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_SOLICIT_TIMEOUT: Duration = Duration::from_secs(3600);
const INITIAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REQUEST_RETX_COUNT: u16 = 10;
const INITIAL_RENEW_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RENEW_TIMEOUT: Duration = Duration::from_secs(600);
const INITIAL_REBIND_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REBIND_TIMEOUT: Duration = Duration::from_secs(600);
const INITIAL_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RELEASE_RETX_COUNT: u16 = 4;
const RETX_DELAY_ON_FAILED_TX: Duration = Duration::from_secs(1);

const MAX_PREFERENCE: u8 = 255;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdState {
    Stopped,
    ToSolicit,
    Soliciting,
    Requesting,
    ToRenew,
    Renewing,
    Rebinding,
    Releasing,
}

/// Prefix reported to the routing manager. Zero lifetimes mean withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegatedPrefix {
    pub prefix: Ipv6Net,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdEffect {
    /// Transmit `message` to `dest` port 547.
    Send { message: Vec<u8>, dest: Ipv6Addr },
    Report(DelegatedPrefix),
    /// Enable or disable reception on the DHCPv6 client port.
    Listen(bool),
}

/// DUID-LL (type 3, hardware type 1) from an Ethernet MAC.
pub fn client_duid_from_mac(mac: &[u8; 6]) -> Vec<u8> {
    let mut duid = Vec::with_capacity(10);
    duid.extend_from_slice(&3u16.to_be_bytes()); // DUID-LL
    duid.extend_from_slice(&1u16.to_be_bytes()); // Ethernet
    duid.extend_from_slice(mac);
    duid
}

// ── Delegated prefix record ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PdPrefix {
    prefix: Ipv6Net,
    /// `prefix` padded to /64; `None` when the prefix is longer than /64.
    adjusted: Option<Ipv6Net>,
    t1: u32,
    t2: u32,
    preferred_lifetime: u32,
    valid_lifetime: u32,
    update_time: Instant,
}

impl PdPrefix {
    fn t1_time(&self) -> Instant {
        self.update_time + Duration::from_secs(self.t1 as u64)
    }

    fn t2_time(&self) -> Instant {
        self.update_time + Duration::from_secs(self.t2 as u64)
    }

    fn preferred_time(&self) -> Instant {
        self.update_time + Duration::from_secs(self.preferred_lifetime as u64)
    }

    /// Clamps lifetimes and derives T1/T2 so renewal always happens with
    /// margin before the preferred lifetime runs out.
    fn adjust_lifetimes(&mut self) {
        self.preferred_lifetime = self.preferred_lifetime.min(MAX_PREFERRED_LIFETIME);
        self.valid_lifetime = self
            .valid_lifetime
            .min(self.preferred_lifetime + MAX_VALID_MARGIN_AFTER_PREFERRED);

        if self.t1 == 0 {
            self.t1 = self.preferred_lifetime / 2;
        }
        if self.t2 == 0 {
            self.t2 = self.preferred_lifetime * 4 / 5;
        }

        let preferred = self.preferred_lifetime;
        if preferred >= MIN_PREFERRED_LIFETIME {
            self.t1 = self.t1.clamp(MIN_T1, preferred - MIN_T1_MARGIN_BEFORE_PREFERRED);
            self.t2 = self.t2.clamp(self.t1, preferred - MIN_T2_MARGIN_BEFORE_PREFERRED);
        } else if preferred >= MIN_T1 {
            self.t1 = self.t1.clamp(MIN_T1, preferred);
            self.t2 = self.t2.clamp(self.t1, preferred);
        } else {
            self.t1 = preferred;
            self.t2 = preferred;
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PdClient {
    state: PdState,
    client_duid: Vec<u8>,
    server_duid: Vec<u8>,
    server_address: Option<Ipv6Addr>,
    pd_prefix: Option<PdPrefix>,
    committed: bool,
    retx: RetxTracker,
    timer: Timer,
    max_solicit_timeout: Duration,
    effects: Vec<PdEffect>,
}

impl PdClient {
    pub fn new(client_duid: Vec<u8>) -> Self {
        Self {
            state: PdState::Stopped,
            client_duid,
            server_duid: Vec::new(),
            server_address: None,
            pd_prefix: None,
            committed: false,
            retx: RetxTracker::default(),
            timer: Timer::new(),
            max_solicit_timeout: DEFAULT_MAX_SOLICIT_TIMEOUT,
            effects: Vec::new(),
        }
    }

    pub fn state(&self) -> PdState {
        self.state
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        self.timer.fire_time()
    }

    /// The committed prefix, if any.
    pub fn delegated_prefix(&self) -> Option<DelegatedPrefix> {
        if !self.committed {
            return None;
        }
        self.pd_prefix.as_ref().map(|p| DelegatedPrefix {
            prefix: p.prefix,
            valid_lifetime: p.valid_lifetime,
            preferred_lifetime: p.preferred_lifetime,
        })
    }

    pub fn start(&mut self, now: Instant) -> Vec<PdEffect> {
        match self.state {
            PdState::Stopped => {
                info!("Starting DHCPv6-PD client");
                self.effects.push(PdEffect::Listen(true));
                self.enter_state(PdState::ToSolicit, now);
            }
            PdState::Releasing => self.enter_state(PdState::ToSolicit, now),
            PdState::ToSolicit
            | PdState::Soliciting
            | PdState::Requesting
            | PdState::ToRenew
            | PdState::Renewing
            | PdState::Rebinding => {}
        }
        self.take_effects()
    }

    pub fn stop(&mut self, now: Instant) -> Vec<PdEffect> {
        info!("Stopping DHCPv6-PD client");
        match self.state {
            PdState::Stopped | PdState::Releasing => {}
            PdState::ToSolicit | PdState::Soliciting | PdState::Requesting => {
                self.enter_state(PdState::Stopped, now)
            }
            PdState::ToRenew | PdState::Renewing | PdState::Rebinding => {
                self.enter_state(PdState::Releasing, now)
            }
        }
        self.take_effects()
    }

    pub fn handle_timer(&mut self, now: Instant) -> Vec<PdEffect> {
        if !self.timer.take_expired(now) {
            return Vec::new();
        }

        match self.state {
            PdState::Stopped => {}
            PdState::ToSolicit => self.enter_state(PdState::Soliciting, now),
            PdState::ToRenew => self.enter_state(PdState::Renewing, now),
            PdState::Soliciting if self.pd_prefix.is_some() => {
                self.enter_state(PdState::Requesting, now)
            }
            PdState::Soliciting
            | PdState::Requesting
            | PdState::Renewing
            | PdState::Rebinding
            | PdState::Releasing => self.send_message(now),
        }
        self.take_effects()
    }

    /// The transport could not send the last message; retry shortly
    /// instead of waiting for the retransmission timeout.
    pub fn handle_send_failed(&mut self, now: Instant) {
        match self.state {
            PdState::Soliciting
            | PdState::Requesting
            | PdState::Renewing
            | PdState::Rebinding
            | PdState::Releasing => {
                warn!("DHCPv6 transmission failed, retrying in {:?}", RETX_DELAY_ON_FAILED_TX);
                self.timer.start(now, RETX_DELAY_ON_FAILED_TX);
            }
            PdState::Stopped | PdState::ToSolicit | PdState::ToRenew => {}
        }
    }

    pub fn handle_received(&mut self, data: &[u8], now: Instant) -> Vec<PdEffect> {
        match self.state {
            PdState::Soliciting
            | PdState::Requesting
            | PdState::Renewing
            | PdState::Rebinding
            | PdState::Releasing => {}
            PdState::Stopped | PdState::ToSolicit | PdState::ToRenew => return Vec::new(),
        }

        let msg = match Dhcp6Message::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping DHCPv6 message: {}", e);
                return Vec::new();
            }
        };

        match msg.msg_type {
            MSG_ADVERTISE if self.state == PdState::Soliciting => {}
            MSG_REPLY if self.state != PdState::Soliciting => {}
            _ => return Vec::new(),
        }

        if msg.transaction_id != self.retx.transaction_id() {
            debug!("Dropping DHCPv6 message with mismatched transaction id");
            return Vec::new();
        }
        if msg.option(OPT_CLIENTID) != Some(self.client_duid.as_slice()) {
            debug!("Dropping DHCPv6 message with mismatched client id");
            return Vec::new();
        }
        let Some(server_duid) = msg.option(OPT_SERVERID) else {
            debug!("Dropping DHCPv6 message without server id");
            return Vec::new();
        };

        // During the first Solicit window, offers from every server are
        // compared, so the tracked DUID is not enforced there.
        if !self.server_duid.is_empty()
            && self.state != PdState::Soliciting
            && server_duid != self.server_duid.as_slice()
        {
            debug!("Dropping DHCPv6 message from another server");
            return Vec::new();
        }

        self.process_sol_max_rt(&msg);

        match msg.msg_type {
            MSG_ADVERTISE => self.handle_advertise(&msg, now),
            _ => self.handle_reply(&msg, now),
        }
        self.take_effects()
    }

    fn take_effects(&mut self) -> Vec<PdEffect> {
        std::mem::take(&mut self.effects)
    }

    // ── State machine ───────────────────────────────────────────────────────

    fn enter_state(&mut self, state: PdState, now: Instant) {
        info!("DHCPv6-PD state: {:?} -> {:?}", self.state, state);
        self.state = state;

        match state {
            PdState::Stopped => {
                self.clear_server_duid();
                self.clear_pd_prefix();
                self.timer.stop();
                self.effects.push(PdEffect::Listen(false));
            }
            PdState::ToSolicit => {
                self.clear_server_duid();
                self.clear_pd_prefix();
                self.timer.start(now, random_delay(MAX_DELAY_FIRST_SOLICIT));
            }
            PdState::Soliciting => {
                self.clear_server_duid();
                self.clear_pd_prefix();
                self.retx.start(
                    now,
                    INITIAL_SOLICIT_TIMEOUT,
                    Some(self.max_solicit_timeout),
                    JitterMode::Positive,
                );
            }
            PdState::Requesting => {
                self.retx.start(now, INITIAL_REQUEST_TIMEOUT, Some(MAX_REQUEST_TIMEOUT), JitterMode::Full);
                self.retx.set_max_count(MAX_REQUEST_RETX_COUNT);
            }
            PdState::ToRenew => {
                if let Some(t1_time) = self.pd_prefix.as_ref().map(PdPrefix::t1_time) {
                    self.timer.fire_at(t1_time);
                }
            }
            PdState::Renewing => {
                self.retx.start(now, INITIAL_RENEW_TIMEOUT, Some(MAX_RENEW_TIMEOUT), JitterMode::Full);
                if let Some(t2_time) = self.pd_prefix.as_ref().map(PdPrefix::t2_time) {
                    self.retx.set_end_time(t2_time);
                }
            }
            PdState::Rebinding => {
                self.clear_server_duid();
                self.retx.start(now, INITIAL_REBIND_TIMEOUT, Some(MAX_REBIND_TIMEOUT), JitterMode::Full);
                if let Some(preferred_time) = self.pd_prefix.as_ref().map(PdPrefix::preferred_time) {
                    self.retx.set_end_time(preferred_time);
                }
            }
            PdState::Releasing => {
                self.retx.start(now, INITIAL_RELEASE_TIMEOUT, None, JitterMode::Full);
                self.retx.set_max_count(MAX_RELEASE_RETX_COUNT);
            }
        }

        self.send_message(now);
    }

    fn send_message(&mut self, now: Instant) {
        let msg_type = match self.state {
            PdState::Soliciting => MSG_SOLICIT,
            PdState::Requesting => MSG_REQUEST,
            PdState::Renewing => MSG_RENEW,
            PdState::Rebinding => MSG_REBIND,
            PdState::Releasing => MSG_RELEASE,
            PdState::Stopped | PdState::ToSolicit | PdState::ToRenew => return,
        };

        if !self.retx.should_retx(now) {
            self.update_state_after_retx_exhausted(now);
            return;
        }

        // Re-armed below once the message is handed off.
        self.timer.start(now, RETX_DELAY_ON_FAILED_TX);

        let message = self.build_message(msg_type, now);
        let dest = self.server_address.unwrap_or(dhcp6::ALL_RELAY_AGENTS_AND_SERVERS);

        info!(
            "Sending DHCPv6 {} to {}{}",
            msg_type_name(msg_type),
            dest,
            if self.server_address.is_some() { " (unicast)" } else { "" }
        );
        self.effects.push(PdEffect::Send { message, dest });

        self.retx.schedule_timeout(&mut self.timer, now);
        self.retx.update_timeout_and_count();
    }

    fn build_message(&mut self, msg_type: u8, now: Instant) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        dhcp6::append_header(&mut buf, msg_type, &self.retx.transaction_id());

        dhcp6::append_option(&mut buf, OPT_CLIENTID, &self.client_duid);
        if !self.server_duid.is_empty() {
            dhcp6::append_option(&mut buf, OPT_SERVERID, &self.server_duid);
        }

        let elapsed = self.retx.elapsed_time(now);
        dhcp6::append_option(&mut buf, OPT_ELAPSED_TIME, &elapsed.to_be_bytes());
        dhcp6::append_option(&mut buf, OPT_ORO, &OPT_SOL_MAX_RT.to_be_bytes());

        // Without a candidate, `::/64` tells the server the length we want.
        let hint = match &self.pd_prefix {
            Some(p) => p.prefix,
            None => new_prefix(Ipv6Addr::UNSPECIFIED, DESIRED_PREFIX_LEN),
        };
        dhcp6::append_option(&mut buf, OPT_IA_PD, &dhcp6::build_ia_pd(IAID, &hint));

        buf
    }

    fn update_state_after_retx_exhausted(&mut self, now: Instant) {
        match self.state {
            PdState::Stopped | PdState::ToSolicit | PdState::Soliciting | PdState::ToRenew => {}
            PdState::Requesting => self.enter_state(PdState::Soliciting, now),
            PdState::Renewing => self.enter_state(PdState::Rebinding, now),
            PdState::Rebinding => self.enter_state(PdState::Soliciting, now),
            PdState::Releasing => self.enter_state(PdState::Stopped, now),
        }
    }

    // ── Message handling ────────────────────────────────────────────────────

    fn handle_advertise(&mut self, msg: &Dhcp6Message<'_>, now: Instant) {
        if msg.status() != StatusCode::Success {
            return;
        }
        info!("Received DHCPv6 Advertise");

        let (prefixes, status) = process_ia_pd(msg, now);
        if status == StatusCode::NoPrefixAvail {
            return;
        }
        let Some(favored) = select_favored_prefix(&prefixes) else {
            return;
        };
        let preference = msg.preference();

        // Within the first Solicit window keep collecting, switching only
        // to a strictly more favored offer.
        if self.retx.is_first_attempt() && !self.server_duid.is_empty() {
            let current = self.pd_prefix.as_ref().and_then(|p| p.adjusted);
            if let (Some(new), Some(current)) = (favored.adjusted, current) {
                if new >= current {
                    return;
                }
            }
        }

        self.pd_prefix = Some(favored.clone());
        self.save_server_duid_and_address(msg);

        if !self.retx.is_first_attempt() || preference == MAX_PREFERENCE {
            self.enter_state(PdState::Requesting, now);
        }
    }

    fn handle_reply(&mut self, msg: &Dhcp6Message<'_>, now: Instant) {
        let status = msg.status();
        info!("Received DHCPv6 Reply, status {:?}", status);

        match status {
            StatusCode::UnspecFail => return,
            StatusCode::UseMulticast => {
                if self.server_address.take().is_some() {
                    self.send_message(now);
                }
                return;
            }
            _ => {}
        }

        if self.state == PdState::Releasing {
            // Release completes on any Reply regardless of status.
            info!("DHCPv6-PD state: {:?} -> {:?}", self.state, PdState::Stopped);
            self.state = PdState::Stopped;
            self.timer.stop();
            return;
        }

        let (prefixes, status) = process_ia_pd(msg, now);

        match self.state {
            PdState::Requesting => {
                let favored = select_favored_prefix(&prefixes);
                match favored {
                    Some(favored) if status != StatusCode::NoPrefixAvail => {
                        let favored = favored.clone();
                        self.save_server_duid_and_address(msg);
                        self.commit_pd_prefix(favored, now);
                    }
                    _ => self.enter_state(PdState::ToSolicit, now),
                }
            }
            PdState::Renewing | PdState::Rebinding => {
                if status == StatusCode::NoPrefixAvail {
                    return;
                }

                let current = self.pd_prefix.as_ref().map(|p| p.prefix);
                if let Some(matched) = prefixes.iter().find(|p| Some(p.prefix) == current) {
                    let matched = matched.clone();
                    self.save_server_duid_and_address(msg);
                    self.commit_pd_prefix(matched, now);

                    if self
                        .pd_prefix
                        .as_ref()
                        .is_some_and(|p| p.preferred_lifetime >= MIN_PREFERRED_LIFETIME)
                    {
                        return;
                    }
                }

                // Previous prefix missing or too short-lived: take any
                // other acceptable prefix the server offered.
                if let Some(favored) = select_favored_prefix(&prefixes) {
                    let favored = favored.clone();
                    self.save_server_duid_and_address(msg);
                    self.commit_pd_prefix(favored, now);
                    return;
                }

                if status == StatusCode::NoBinding && self.state == PdState::Renewing {
                    self.enter_state(PdState::Rebinding, now);
                }
            }
            PdState::Stopped
            | PdState::ToSolicit
            | PdState::Soliciting
            | PdState::ToRenew
            | PdState::Releasing => {}
        }
    }

    fn process_sol_max_rt(&mut self, msg: &Dhcp6Message<'_>) {
        let Some(sol_max_rt) = msg.sol_max_rt() else {
            return;
        };
        if !(dhcp6::SOL_MAX_RT_MIN..=dhcp6::SOL_MAX_RT_MAX).contains(&sol_max_rt) {
            debug!("Ignoring out-of-range SOL_MAX_RT {}", sol_max_rt);
            return;
        }
        let value = Duration::from_secs(sol_max_rt as u64);

        // Adopt a server value only while every server agrees on it.
        if self.max_solicit_timeout == DEFAULT_MAX_SOLICIT_TIMEOUT {
            self.max_solicit_timeout = value;
        } else if value != self.max_solicit_timeout {
            self.max_solicit_timeout = DEFAULT_MAX_SOLICIT_TIMEOUT;
        }

        if self.state == PdState::Soliciting {
            self.retx.set_max_timeout(self.max_solicit_timeout);
        }
    }

    // ── Prefix and server bookkeeping ───────────────────────────────────────

    fn save_server_duid_and_address(&mut self, msg: &Dhcp6Message<'_>) {
        if let Some(duid) = msg.option(OPT_SERVERID) {
            self.server_duid = duid.to_vec();
        }
        if let Some(addr) = msg.server_unicast().filter(|a| !a.is_unspecified()) {
            self.server_address = Some(addr);
        }
    }

    fn clear_server_duid(&mut self) {
        self.server_duid.clear();
        self.server_address = None;
    }

    fn clear_pd_prefix(&mut self) {
        if self.committed {
            if let Some(p) = self.pd_prefix.as_mut() {
                p.preferred_lifetime = 0;
                p.valid_lifetime = 0;
                p.t1 = 0;
                p.t2 = 0;
            }
            self.report_pd_prefix();
        }
        self.pd_prefix = None;
        self.committed = false;
    }

    fn commit_pd_prefix(&mut self, mut pd_prefix: PdPrefix, now: Instant) {
        if self.pd_prefix.as_ref().map(|p| p.prefix) != Some(pd_prefix.prefix) {
            self.clear_pd_prefix();
        }

        pd_prefix.adjust_lifetimes();
        info!(
            "Committed delegated prefix {} (T1 {}s, T2 {}s, preferred {}s, valid {}s)",
            pd_prefix.prefix, pd_prefix.t1, pd_prefix.t2, pd_prefix.preferred_lifetime, pd_prefix.valid_lifetime
        );
        self.pd_prefix = Some(pd_prefix);
        self.committed = true;

        self.enter_state(PdState::ToRenew, now);
        self.report_pd_prefix();
    }

    fn report_pd_prefix(&mut self) {
        match self.state {
            PdState::Stopped | PdState::Releasing => return,
            PdState::ToSolicit
            | PdState::Soliciting
            | PdState::Requesting
            | PdState::ToRenew
            | PdState::Renewing
            | PdState::Rebinding => {}
        }

        if let Some(p) = &self.pd_prefix {
            self.effects.push(PdEffect::Report(DelegatedPrefix {
                prefix: p.prefix,
                valid_lifetime: p.valid_lifetime,
                preferred_lifetime: p.preferred_lifetime,
            }));
        }
    }
}

// ── IA_PD processing ────────────────────────────────────────────────────────

/// Prefixes from the first acceptable IA_PD matching our IAID, and the
/// status code carried inside that IA_PD.
fn process_ia_pd(msg: &Dhcp6Message<'_>, now: Instant) -> (Vec<PdPrefix>, StatusCode) {
    let ia = msg
        .options_of(OPT_IA_PD)
        .filter_map(IaPd::parse)
        .find(|ia| ia.iaid == IAID && !(ia.t1 != 0 && ia.t2 != 0 && ia.t1 > ia.t2));

    let Some(ia) = ia else {
        return (Vec::new(), StatusCode::Success);
    };

    let prefixes = ia
        .prefixes()
        .filter(|p| {
            let skip = p.prefix_len > 128 || p.preferred_lifetime > p.valid_lifetime;
            if skip {
                warn!("Skipping invalid IA prefix {}/{}", p.prefix, p.prefix_len);
            }
            !skip
        })
        .map(|p| {
            let prefix = p.net();
            PdPrefix {
                prefix,
                adjusted: pad_to_64(&prefix),
                t1: ia.t1,
                t2: ia.t2,
                preferred_lifetime: p.preferred_lifetime,
                valid_lifetime: p.valid_lifetime,
                update_time: now,
            }
        })
        .collect();

    (prefixes, ia.status())
}

/// Numerically smallest /64-padded prefix among those no longer than /64
/// with enough preferred lifetime.
fn select_favored_prefix(prefixes: &[PdPrefix]) -> Option<&PdPrefix> {
    prefixes
        .iter()
        .filter(|p| p.prefix.prefix_len() <= DESIRED_PREFIX_LEN)
        .filter(|p| p.preferred_lifetime >= MIN_PREFERRED_LIFETIME)
        .min_by_key(|p| p.adjusted)
}

fn msg_type_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_SOLICIT => "Solicit",
        MSG_ADVERTISE => "Advertise",
        MSG_REQUEST => "Request",
        MSG_RENEW => "Renew",
        MSG_REBIND => "Rebind",
        MSG_REPLY => "Reply",
        MSG_RELEASE => "Release",
        _ => "Unknown",
    }
}
