//! Delegated prefix used as the local OMR prefix.
//!
//! The prefix either comes from our own DHCPv6-PD client or from Router
//! Advertisements generated by a platform PD agent. Among several candidates
//! the numerically smallest wins, which favors GUA over ULA prefixes.

use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::nd::RouterAdvert;
use crate::pd_client::DelegatedPrefix;
use crate::prefix::{is_valid_pd_prefix, pad_to_64};
use crate::timer::Timer;
use crate::tracker::STALE_TIME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PdPrefixState {
    Disabled,
    Stopped,
    /// Running without a usable prefix.
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefixSource {
    PlatformRa,
    Dhcp6Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PdPrefixEntry {
    prefix: Ipv6Net,
    valid_lifetime: u32,
    preferred_lifetime: u32,
    last_update: Instant,
    source: PrefixSource,
}

impl PdPrefixEntry {
    fn is_deprecated(&self, now: Instant) -> bool {
        now >= self.last_update + Duration::from_secs(self.preferred_lifetime as u64)
    }

    /// RA-sourced prefixes are expected to be refreshed at least every
    /// `STALE_TIME`; the PD client refreshes before the preferred lifetime
    /// ends.
    fn stale_time(&self) -> Instant {
        let secs = match self.source {
            PrefixSource::PlatformRa => self.preferred_lifetime.min(STALE_TIME),
            PrefixSource::Dhcp6Client => self.preferred_lifetime,
        };
        self.last_update + Duration::from_secs(secs as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PdPrefixInfo {
    pub prefix: Ipv6Net,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    pub msec_since_last_update: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PdProcessedRaInfo {
    pub num_platform_ra_received: u32,
    pub num_platform_pio_processed: u32,
    pub msec_since_last_platform_ra: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PdPrefixManager {
    enabled: bool,
    running: bool,
    prefix: Option<PdPrefixEntry>,
    timer: Timer,
    num_platform_ra_received: u32,
    num_platform_pio_processed: u32,
    last_platform_ra_time: Option<Instant>,
}

impl PdPrefixManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> PdPrefixState {
        if !self.enabled {
            PdPrefixState::Disabled
        } else if !self.running {
            PdPrefixState::Stopped
        } else if self.prefix.is_some() {
            PdPrefixState::Running
        } else {
            PdPrefixState::Idle
        }
    }

    /// Prefix to use as the local OMR prefix, if any.
    pub fn current_prefix(&self) -> Option<Ipv6Net> {
        if !self.running {
            return None;
        }
        self.prefix.map(|p| p.prefix)
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        self.timer.fire_time()
    }

    pub fn info(&self, now: Instant) -> Result<PdPrefixInfo> {
        let entry = self.prefix.filter(|_| self.running).ok_or(Error::NotFound)?;
        Ok(PdPrefixInfo {
            prefix: entry.prefix,
            valid_lifetime: entry.valid_lifetime,
            preferred_lifetime: entry.preferred_lifetime,
            msec_since_last_update: now.saturating_duration_since(entry.last_update).as_millis() as u64,
        })
    }

    pub fn processed_ra_info(&self, now: Instant) -> PdProcessedRaInfo {
        PdProcessedRaInfo {
            num_platform_ra_received: self.num_platform_ra_received,
            num_platform_pio_processed: self.num_platform_pio_processed,
            msec_since_last_platform_ra: self
                .last_platform_ra_time
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
        }
    }

    /// Returns true when a prefix was withdrawn and the policy needs to run.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        info!("PD prefix manager {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;
        !enabled && self.withdraw_prefix()
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.prefix = None;
        self.timer.stop();
    }

    /// Handles an RA built by a platform PD agent. Returns true when the
    /// selected prefix changed.
    pub fn process_platform_ra(&mut self, data: &[u8], now: Instant) -> Result<bool> {
        if !self.enabled {
            warn!("Ignoring platform generated RA since PD is disabled");
            return Ok(false);
        }

        self.num_platform_ra_received = self.num_platform_ra_received.saturating_add(1);
        self.last_platform_ra_time = Some(now);

        let ra = RouterAdvert::parse(data)?;
        let mut entries = Vec::new();
        for pio in ra.prefix_infos() {
            if !is_valid_pd_prefix(&pio.prefix) {
                warn!("Ignoring invalid PD prefix {}", pio.prefix);
                continue;
            }
            let Some(prefix) = pad_to_64(&pio.prefix) else {
                continue;
            };
            self.num_platform_pio_processed = self.num_platform_pio_processed.saturating_add(1);
            entries.push(PdPrefixEntry {
                prefix,
                valid_lifetime: pio.valid_lifetime,
                preferred_lifetime: pio.preferred_lifetime,
                last_update: now,
                source: PrefixSource::PlatformRa,
            });
        }

        Ok(self.process_entries(entries, now))
    }

    /// Handles a prefix reported by the DHCPv6-PD client. Zero lifetimes
    /// withdraw it.
    pub fn process_delegated_prefix(&mut self, delegated: &DelegatedPrefix, now: Instant) -> bool {
        if !self.enabled {
            debug!("Ignoring delegated prefix {} since PD is disabled", delegated.prefix);
            return false;
        }
        if !is_valid_pd_prefix(&delegated.prefix) {
            warn!("Ignoring invalid delegated prefix {}", delegated.prefix);
            return false;
        }
        let Some(prefix) = pad_to_64(&delegated.prefix) else {
            return false;
        };
        let entry = PdPrefixEntry {
            prefix,
            valid_lifetime: delegated.valid_lifetime,
            preferred_lifetime: delegated.preferred_lifetime,
            last_update: now,
            source: PrefixSource::Dhcp6Client,
        };
        self.process_entries(vec![entry], now)
    }

    /// Withdraws the prefix once it went stale. Returns true if withdrawn.
    pub fn handle_timer(&mut self, now: Instant) -> bool {
        if !self.timer.take_expired(now) {
            return false;
        }
        self.withdraw_prefix()
    }

    fn process_entries(&mut self, entries: Vec<PdPrefixEntry>, now: Instant) -> bool {
        let mut changed = false;
        let mut favored: Option<PdPrefixEntry> = None;
        let mut current_updated = false;

        for entry in entries {
            if let Some(current) = self.prefix.as_mut().filter(|c| c.prefix == entry.prefix) {
                *current = entry;
                current_updated = true;
            }
            if entry.is_deprecated(now) {
                continue;
            }
            if favored.is_none_or(|f| entry.prefix < f.prefix) {
                favored = Some(entry);
            }
        }

        if current_updated && self.prefix.is_some_and(|p| p.is_deprecated(now)) {
            if let Some(old) = self.prefix.take() {
                info!("PD prefix {} is deprecated", old.prefix);
            }
            changed = true;
        }

        if let Some(favored) = favored {
            let replace = match self.prefix {
                None => true,
                Some(current) => favored.prefix < current.prefix,
            };
            if replace {
                info!("Using delegated prefix {}", favored.prefix);
                self.prefix = Some(favored);
                changed = true;
            }
        }

        match self.prefix {
            Some(entry) => self.timer.fire_at(entry.stale_time()),
            None => self.timer.stop(),
        }
        changed
    }

    fn withdraw_prefix(&mut self) -> bool {
        let Some(old) = self.prefix.take() else {
            return false;
        };
        info!("Withdrew outdated delegated prefix {}", old.prefix);
        self.timer.stop();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nd::{RaBuilder, RaHeader};

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn ra(pios: &[(&str, u32, u32)]) -> Vec<u8> {
        let mut builder = RaBuilder::new(&RaHeader::default());
        for (prefix, valid, preferred) in pios {
            builder.append_pio(&net(prefix), *valid, *preferred).unwrap();
        }
        builder.finish()
    }

    fn running() -> PdPrefixManager {
        let mut manager = PdPrefixManager::new(true);
        manager.start();
        manager
    }

    #[test]
    fn test_platform_ra_picks_smallest_and_pads() {
        let now = Instant::now();
        let mut manager = running();
        assert_eq!(manager.state(), PdPrefixState::Idle);

        let changed = manager
            .process_platform_ra(&ra(&[("fd00:1::/64", 7200, 3600), ("2001:db8:1::/56", 7200, 3600)]), now)
            .unwrap();
        assert!(changed);
        assert_eq!(manager.current_prefix(), Some(net("2001:db8:1::/64")));
        assert_eq!(manager.state(), PdPrefixState::Running);
        assert_eq!(manager.next_fire_time(), Some(now + Duration::from_secs(STALE_TIME as u64)));

        let info = manager.processed_ra_info(now);
        assert_eq!(info.num_platform_ra_received, 1);
        assert_eq!(info.num_platform_pio_processed, 2);
        assert_eq!(info.msec_since_last_platform_ra, Some(0));
    }

    #[test]
    fn test_invalid_and_deprecated_prefixes_ignored() {
        let now = Instant::now();
        let mut manager = running();
        let changed = manager
            .process_platform_ra(&ra(&[("fe80::/64", 7200, 3600), ("2001:db8:2::/64", 7200, 0)]), now)
            .unwrap();
        assert!(!changed);
        assert!(manager.current_prefix().is_none());
        assert!(manager.next_fire_time().is_none());
        assert_eq!(manager.processed_ra_info(now).num_platform_pio_processed, 1);
    }

    #[test]
    fn test_deprecating_current_prefix_clears_it() {
        let now = Instant::now();
        let mut manager = running();
        manager.process_platform_ra(&ra(&[("2001:db8:1::/64", 7200, 3600)]), now).unwrap();

        let changed = manager.process_platform_ra(&ra(&[("2001:db8:1::/64", 7200, 0)]), now).unwrap();
        assert!(changed);
        assert!(manager.current_prefix().is_none());
    }

    #[test]
    fn test_larger_prefix_does_not_replace_current() {
        let now = Instant::now();
        let mut manager = running();
        manager.process_platform_ra(&ra(&[("2001:db8:1::/64", 7200, 3600)]), now).unwrap();
        let changed = manager.process_platform_ra(&ra(&[("2001:db8:9::/64", 7200, 3600)]), now).unwrap();
        assert!(!changed);
        assert_eq!(manager.current_prefix(), Some(net("2001:db8:1::/64")));
    }

    #[test]
    fn test_stale_prefix_withdrawn() {
        let now = Instant::now();
        let mut manager = running();
        manager.process_platform_ra(&ra(&[("2001:db8:1::/64", 7200, 300)]), now).unwrap();
        let stale = now + Duration::from_secs(300);
        assert_eq!(manager.next_fire_time(), Some(stale));
        assert!(manager.handle_timer(stale));
        assert!(manager.current_prefix().is_none());
    }

    #[test]
    fn test_delegated_prefix_from_client() {
        let now = Instant::now();
        let mut manager = running();
        let delegated = DelegatedPrefix {
            prefix: net("2001:db8:aa00::/56"),
            valid_lifetime: 7200,
            preferred_lifetime: 3600,
        };
        assert!(manager.process_delegated_prefix(&delegated, now));
        assert_eq!(manager.current_prefix(), Some(net("2001:db8:aa00::/64")));
        assert_eq!(manager.next_fire_time(), Some(now + Duration::from_secs(3600)));

        let info = manager.info(now + Duration::from_secs(2)).unwrap();
        assert_eq!(info.msec_since_last_update, 2000);

        let withdrawn = DelegatedPrefix {
            valid_lifetime: 0,
            preferred_lifetime: 0,
            ..delegated
        };
        assert!(manager.process_delegated_prefix(&withdrawn, now));
        assert!(manager.current_prefix().is_none());
        assert!(matches!(manager.info(now), Err(Error::NotFound)));
    }

    #[test]
    fn test_disable_withdraws_and_ignores_input() {
        let now = Instant::now();
        let mut manager = running();
        manager.process_platform_ra(&ra(&[("2001:db8:1::/64", 7200, 3600)]), now).unwrap();
        assert!(manager.set_enabled(false));
        assert_eq!(manager.state(), PdPrefixState::Disabled);
        assert!(!manager.process_platform_ra(&ra(&[("2001:db8:1::/64", 7200, 3600)]), now).unwrap());
        assert_eq!(manager.processed_ra_info(now).num_platform_ra_received, 1);
    }
}
