//! Local on-link prefix advertised on the infrastructure link.
//!
//! When no other router provides a usable on-link prefix, the border router
//! advertises a ULA /64 derived from the mesh extended PAN id. Prefixes that
//! stop being used (for instance after the extended PAN id changes) keep
//! being advertised as deprecated until their valid lifetime runs out.

use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::nd::RaBuilder;
use crate::prefix::on_link_prefix_from_ext_pan_id;
use crate::timer::{NextFireTime, Timer};

pub const ON_LINK_PREFIX_LIFETIME: u32 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnLinkState {
    Idle,
    /// Waiting for the ULA route to show up in mesh data.
    Publishing,
    Advertising,
    Deprecating,
}

/// A prefix with its remaining valid lifetime, as persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedOnLinkPrefix {
    pub prefix: Ipv6Net,
    pub remaining_secs: u32,
}

#[derive(Debug, Clone, Copy)]
struct OldPrefix {
    prefix: Ipv6Net,
    expire_time: Instant,
}

fn remaining_secs(expire_time: Instant, now: Instant) -> u32 {
    expire_time.saturating_duration_since(now).as_secs().min(u32::MAX as u64) as u32
}

#[derive(Debug)]
pub struct OnLinkPrefixManager {
    local_prefix: Ipv6Net,
    state: OnLinkState,
    expire_time: Instant,
    favored_discovered: Option<Ipv6Net>,
    old_prefixes: Vec<OldPrefix>,
    max_old_prefixes: usize,
    timer: Timer,
    settings_changed: bool,
}

impl OnLinkPrefixManager {
    pub fn new(ext_pan_id: &[u8; 8], saved: &[SavedOnLinkPrefix], max_old_prefixes: usize, now: Instant) -> Self {
        let mut manager = Self {
            local_prefix: on_link_prefix_from_ext_pan_id(ext_pan_id),
            state: OnLinkState::Idle,
            expire_time: now,
            favored_discovered: None,
            old_prefixes: Vec::new(),
            max_old_prefixes,
            timer: Timer::new(),
            settings_changed: false,
        };

        for entry in saved {
            if entry.remaining_secs == 0 || manager.old_prefixes.iter().any(|o| o.prefix == entry.prefix) {
                continue;
            }
            if manager.old_prefixes.len() >= max_old_prefixes {
                break;
            }
            let lifetime = entry.remaining_secs.min(ON_LINK_PREFIX_LIFETIME);
            manager.old_prefixes.push(OldPrefix {
                prefix: entry.prefix,
                expire_time: now + Duration::from_secs(lifetime as u64),
            });
        }

        manager.generate_local_prefix(ext_pan_id, now);
        manager
    }

    pub fn local_prefix(&self) -> &Ipv6Net {
        &self.local_prefix
    }

    pub fn state(&self) -> OnLinkState {
        self.state
    }

    pub fn favored_discovered_prefix(&self) -> Option<&Ipv6Net> {
        self.favored_discovered.as_ref()
    }

    pub fn is_publishing_or_advertising(&self) -> bool {
        matches!(self.state, OnLinkState::Publishing | OnLinkState::Advertising)
    }

    /// True once a favored prefix was found on the link or we started
    /// offering our own.
    pub fn is_initial_evaluation_done(&self) -> bool {
        self.favored_discovered.is_some() || self.is_publishing_or_advertising()
    }

    /// Whether the `fc00::/7` route should stay published for our ULA
    /// on-link prefixes.
    pub fn should_publish_ula_route(&self) -> bool {
        self.state != OnLinkState::Idle || !self.old_prefixes.is_empty()
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        self.timer.fire_time()
    }

    pub fn take_settings_changed(&mut self) -> bool {
        std::mem::take(&mut self.settings_changed)
    }

    /// Prefixes to persist: the local one while in use plus the deprecated
    /// ones still advertised.
    pub fn saved_prefixes(&self, now: Instant) -> Vec<SavedOnLinkPrefix> {
        let mut saved = Vec::new();
        if self.state != OnLinkState::Idle && self.expire_time > now {
            saved.push(SavedOnLinkPrefix {
                prefix: self.local_prefix,
                remaining_secs: remaining_secs(self.expire_time, now),
            });
        }
        saved.extend(self.old_prefixes.iter().filter(|o| o.expire_time > now).map(|o| SavedOnLinkPrefix {
            prefix: o.prefix,
            remaining_secs: remaining_secs(o.expire_time, now),
        }));
        saved
    }

    pub fn old_prefixes(&self, now: Instant) -> Vec<SavedOnLinkPrefix> {
        self.old_prefixes
            .iter()
            .map(|o| SavedOnLinkPrefix {
                prefix: o.prefix,
                remaining_secs: remaining_secs(o.expire_time, now),
            })
            .collect()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    pub fn start(&mut self) {
        debug!("On-link prefix manager started with {}", self.local_prefix);
    }

    pub fn stop(&mut self) {
        self.favored_discovered = None;
        if self.is_publishing_or_advertising() {
            self.set_state(OnLinkState::Deprecating);
        }
    }

    /// Returns true when we started offering the local prefix, so that
    /// copies of it relayed by other routers can be disregarded.
    pub fn evaluate(
        &mut self,
        favored: Option<Ipv6Net>,
        net_data_has_ula_route: bool,
        rs_in_progress: bool,
        now: Instant,
    ) -> bool {
        if rs_in_progress {
            return false;
        }

        self.favored_discovered = favored;

        match favored {
            Some(favored) if favored != self.local_prefix => {
                if self.is_publishing_or_advertising() && favored < self.local_prefix {
                    info!("Found favored on-link prefix {}, deprecating {}", favored, self.local_prefix);
                    self.deprecate();
                }
                false
            }
            _ => {
                let started = self.publish_and_advertise(net_data_has_ula_route, now);
                self.favored_discovered = None;
                started
            }
        }
    }

    /// Mesh data changed; advertising waits for the ULA route.
    pub fn handle_net_data_change(&mut self, net_data_has_ula_route: bool) -> bool {
        if self.state == OnLinkState::Publishing && net_data_has_ula_route {
            self.set_state(OnLinkState::Advertising);
            return true;
        }
        false
    }

    /// Whether the favored on-link prefix on the link changed and the policy
    /// needs another look.
    pub fn handle_table_changed(&self, favored: Option<Ipv6Net>) -> bool {
        favored != self.favored_discovered
    }

    /// Regenerates the local prefix. Returns true if it changed.
    pub fn handle_ext_pan_id_change(&mut self, ext_pan_id: &[u8; 8], now: Instant) -> bool {
        let old_prefix = self.local_prefix;
        let old_state = self.state;
        let old_expire_time = self.expire_time;

        self.generate_local_prefix(ext_pan_id, now);
        if self.local_prefix == old_prefix {
            return false;
        }

        info!("Local on-link prefix changed: {} -> {}", old_prefix, self.local_prefix);
        if matches!(old_state, OnLinkState::Advertising | OnLinkState::Deprecating) {
            self.deprecate_old_prefix(old_prefix, old_expire_time);
        }
        true
    }

    /// Appends PIOs for the local prefix and all deprecated ones.
    pub fn append_pios(&mut self, builder: &mut RaBuilder, now: Instant) -> Result<()> {
        match self.state {
            OnLinkState::Idle | OnLinkState::Publishing => {}
            OnLinkState::Advertising => {
                self.reset_expire_time(now);
                builder.append_pio(&self.local_prefix, ON_LINK_PREFIX_LIFETIME, ON_LINK_PREFIX_LIFETIME)?;
            }
            OnLinkState::Deprecating => {
                if self.expire_time > now {
                    builder.append_pio(&self.local_prefix, remaining_secs(self.expire_time, now), 0)?;
                }
            }
        }

        for old in &self.old_prefixes {
            if old.expire_time > now {
                builder.append_pio(&old.prefix, remaining_secs(old.expire_time, now), 0)?;
            }
        }
        Ok(())
    }

    /// Expires the deprecated prefixes. Returns true if anything was dropped.
    pub fn handle_timer(&mut self, now: Instant) -> bool {
        if !self.timer.take_expired(now) {
            return false;
        }

        let mut next = NextFireTime::new(now);
        let mut changed = false;

        if self.state == OnLinkState::Deprecating {
            if self.expire_time <= now {
                info!("Local on-link prefix {} expired", self.local_prefix);
                self.set_state(OnLinkState::Idle);
                changed = true;
            } else {
                next.update_if_earlier(self.expire_time);
            }
        }

        let before = self.old_prefixes.len();
        self.old_prefixes.retain(|o| {
            if o.expire_time <= now {
                info!("Old on-link prefix {} expired", o.prefix);
                return false;
            }
            next.update_if_earlier(o.expire_time);
            true
        });
        if self.old_prefixes.len() != before {
            changed = true;
        }

        self.timer.fire_at_next(&next);
        if changed {
            self.settings_changed = true;
        }
        changed
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn generate_local_prefix(&mut self, ext_pan_id: &[u8; 8], now: Instant) {
        self.local_prefix = on_link_prefix_from_ext_pan_id(ext_pan_id);
        self.state = OnLinkState::Idle;

        if let Some(index) = self.old_prefixes.iter().position(|o| o.prefix == self.local_prefix) {
            let old = self.old_prefixes.remove(index);
            self.expire_time = old.expire_time;
            self.state = OnLinkState::Deprecating;
            self.timer.fire_at_if_earlier(old.expire_time.max(now));
            info!("Local on-link prefix {} is still deprecating", self.local_prefix);
        }
    }

    fn publish_and_advertise(&mut self, net_data_has_ula_route: bool, now: Instant) -> bool {
        if self.is_publishing_or_advertising() {
            return false;
        }
        self.set_state(OnLinkState::Publishing);
        self.reset_expire_time(now);
        if net_data_has_ula_route {
            self.set_state(OnLinkState::Advertising);
        }
        true
    }

    fn deprecate(&mut self) {
        if self.is_publishing_or_advertising() {
            self.set_state(OnLinkState::Deprecating);
            self.timer.fire_at_if_earlier(self.expire_time);
        }
    }

    fn reset_expire_time(&mut self, now: Instant) {
        self.expire_time = now + Duration::from_secs(ON_LINK_PREFIX_LIFETIME as u64);
        self.timer.fire_at_if_earlier(self.expire_time);
        self.settings_changed = true;
    }

    fn deprecate_old_prefix(&mut self, prefix: Ipv6Net, expire_time: Instant) {
        if self.max_old_prefixes == 0 || self.old_prefixes.iter().any(|o| o.prefix == prefix) {
            return;
        }

        let entry = OldPrefix { prefix, expire_time };
        if self.old_prefixes.len() >= self.max_old_prefixes {
            // Replace the entry closest to expiring.
            if let Some(soonest) = self.old_prefixes.iter_mut().min_by_key(|o| o.expire_time) {
                *soonest = entry;
            }
        } else {
            self.old_prefixes.push(entry);
        }

        info!("Deprecating old on-link prefix {}", prefix);
        self.timer.fire_at_if_earlier(expire_time);
        self.settings_changed = true;
    }

    fn set_state(&mut self, state: OnLinkState) {
        if state != self.state {
            info!("On-link prefix {} state: {:?} -> {:?}", self.local_prefix, self.state, state);
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nd::{RaHeader, RouterAdvert};

    const EXT_PAN_ID: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    const OTHER_EXT_PAN_ID: [u8; 8] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, 0x01];

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn pios(manager: &mut OnLinkPrefixManager, now: Instant) -> Vec<(Ipv6Net, u32, u32)> {
        let mut builder = RaBuilder::new(&RaHeader::default());
        manager.append_pios(&mut builder, now).unwrap();
        let ra = RouterAdvert::parse(&builder.finish()).unwrap();
        ra.prefix_infos().map(|p| (p.prefix, p.valid_lifetime, p.preferred_lifetime)).collect()
    }

    #[test]
    fn test_local_prefix_from_ext_pan_id() {
        let now = Instant::now();
        let manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &[], 3, now);
        assert_eq!(manager.local_prefix(), &net("fd11:2233:4455:7788::/64"));
        assert_eq!(manager.state(), OnLinkState::Idle);
        assert!(!manager.should_publish_ula_route());
        assert!(!manager.is_initial_evaluation_done());
    }

    #[test]
    fn test_publish_then_advertise_after_ula_route() {
        let now = Instant::now();
        let mut manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &[], 3, now);

        assert!(manager.evaluate(None, false, false, now));
        assert_eq!(manager.state(), OnLinkState::Publishing);
        assert!(manager.should_publish_ula_route());
        assert!(pios(&mut manager, now).is_empty());

        assert!(manager.handle_net_data_change(true));
        assert_eq!(manager.state(), OnLinkState::Advertising);
        assert_eq!(
            pios(&mut manager, now),
            vec![(net("fd11:2233:4455:7788::/64"), ON_LINK_PREFIX_LIFETIME, ON_LINK_PREFIX_LIFETIME)]
        );

        // Already advertising: nothing new to report.
        assert!(!manager.evaluate(None, true, false, now));
    }

    #[test]
    fn test_skipped_while_rs_in_progress() {
        let now = Instant::now();
        let mut manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &[], 3, now);
        assert!(!manager.evaluate(None, true, true, now));
        assert_eq!(manager.state(), OnLinkState::Idle);
    }

    #[test]
    fn test_smaller_discovered_prefix_deprecates_local() {
        let now = Instant::now();
        let mut manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &[], 3, now);
        manager.evaluate(None, true, false, now);
        assert_eq!(manager.state(), OnLinkState::Advertising);

        // A larger prefix does not displace ours.
        manager.evaluate(Some(net("fdff::/64")), true, false, now);
        assert_eq!(manager.state(), OnLinkState::Advertising);
        assert!(manager.handle_table_changed(None));

        let later = now + Duration::from_secs(100);
        manager.evaluate(Some(net("2001:db8::/64")), true, false, later);
        assert_eq!(manager.state(), OnLinkState::Deprecating);
        assert_eq!(manager.favored_discovered_prefix(), Some(&net("2001:db8::/64")));

        let pios = pios(&mut manager, later);
        assert_eq!(pios.len(), 1);
        assert_eq!(pios[0].1, ON_LINK_PREFIX_LIFETIME - 100);
        assert_eq!(pios[0].2, 0);

        // Expires back to idle.
        let expiry = now + Duration::from_secs(ON_LINK_PREFIX_LIFETIME as u64);
        assert!(manager.handle_timer(expiry));
        assert_eq!(manager.state(), OnLinkState::Idle);
    }

    #[test]
    fn test_ext_pan_id_change_keeps_old_prefix_deprecated() {
        let now = Instant::now();
        let mut manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &[], 3, now);
        manager.evaluate(None, true, false, now);
        manager.take_settings_changed();

        assert!(manager.handle_ext_pan_id_change(&OTHER_EXT_PAN_ID, now));
        assert!(manager.take_settings_changed());
        assert_eq!(manager.state(), OnLinkState::Idle);
        assert!(manager.should_publish_ula_route());

        let old = manager.old_prefixes(now);
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].prefix, net("fd11:2233:4455:7788::/64"));

        manager.evaluate(None, true, false, now);
        let pios = pios(&mut manager, now);
        assert_eq!(pios.len(), 2);
        assert!(pios.contains(&(net("fdaa:bbcc:ddee:1::/64"), 1800, 1800)));
        assert!(pios.contains(&(net("fd11:2233:4455:7788::/64"), 1800, 0)));

        // Same id again: nothing changes.
        assert!(!manager.handle_ext_pan_id_change(&OTHER_EXT_PAN_ID, now));
    }

    #[test]
    fn test_restored_prefixes_are_deduplicated_and_capped() {
        let now = Instant::now();
        let saved = [
            SavedOnLinkPrefix { prefix: net("fd00:1::/64"), remaining_secs: 100 },
            SavedOnLinkPrefix { prefix: net("fd00:1::/64"), remaining_secs: 200 },
            SavedOnLinkPrefix { prefix: net("fd00:2::/64"), remaining_secs: 0 },
            SavedOnLinkPrefix { prefix: net("fd00:3::/64"), remaining_secs: 99_999 },
            SavedOnLinkPrefix { prefix: net("fd00:4::/64"), remaining_secs: 50 },
        ];
        let manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &saved, 2, now);

        let old = manager.old_prefixes(now);
        assert_eq!(old.len(), 2);
        assert_eq!(old[0], SavedOnLinkPrefix { prefix: net("fd00:1::/64"), remaining_secs: 100 });
        assert_eq!(old[1].prefix, net("fd00:3::/64"));
        assert_eq!(old[1].remaining_secs, ON_LINK_PREFIX_LIFETIME);
    }

    #[test]
    fn test_restored_local_prefix_resumes_deprecating() {
        let now = Instant::now();
        let saved = [SavedOnLinkPrefix { prefix: net("fd11:2233:4455:7788::/64"), remaining_secs: 600 }];
        let mut manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &saved, 3, now);

        assert_eq!(manager.state(), OnLinkState::Deprecating);
        assert!(manager.old_prefixes(now).is_empty());
        assert_eq!(pios(&mut manager, now), vec![(net("fd11:2233:4455:7788::/64"), 600, 0)]);

        // Republishing from deprecating resets the lifetime.
        manager.evaluate(None, true, false, now);
        assert_eq!(manager.state(), OnLinkState::Advertising);
        assert_eq!(manager.saved_prefixes(now)[0].remaining_secs, ON_LINK_PREFIX_LIFETIME);
    }

    #[test]
    fn test_old_prefix_list_replaces_soonest_expiring() {
        let now = Instant::now();
        let saved = [
            SavedOnLinkPrefix { prefix: net("fd00:1::/64"), remaining_secs: 100 },
            SavedOnLinkPrefix { prefix: net("fd00:2::/64"), remaining_secs: 50 },
        ];
        let mut manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &saved, 2, now);
        manager.evaluate(None, true, false, now);
        manager.handle_ext_pan_id_change(&OTHER_EXT_PAN_ID, now);

        let old: Vec<_> = manager.old_prefixes(now).into_iter().map(|o| o.prefix).collect();
        assert_eq!(old.len(), 2);
        assert!(old.contains(&net("fd00:1::/64")));
        assert!(old.contains(&net("fd11:2233:4455:7788::/64")));
    }

    #[test]
    fn test_stop_deprecates_advertised_prefix() {
        let now = Instant::now();
        let mut manager = OnLinkPrefixManager::new(&EXT_PAN_ID, &[], 3, now);
        manager.evaluate(None, false, false, now);
        manager.stop();
        assert_eq!(manager.state(), OnLinkState::Deprecating);
        assert!(manager.favored_discovered_prefix().is_none());
    }
}
