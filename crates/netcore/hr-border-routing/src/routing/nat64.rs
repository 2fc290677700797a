//! NAT64 prefix publication.
//!
//! The infrastructure NAT64 prefix (when discovered and the favored OMR
//! prefix comes from the infrastructure) is published with medium
//! preference; otherwise the local /96 from the BR ULA is offered with low
//! preference. Nothing is published while a better prefix from another
//! border router is present.

use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::prefix::{is_valid_nat64_prefix, local_nat64_prefix, RoutePreference};
use crate::timer::Timer;

use super::infra_if::InfraIf;
use super::net_data::{ExternalRouteConfig, NetworkData};

pub const NAT64_DISCOVERY_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Nat64State {
    Disabled,
    NotRunning,
    /// Running but not publishing.
    Idle,
    Active,
}

#[derive(Debug)]
pub struct Nat64PrefixManager {
    enabled: bool,
    running: bool,
    local_prefix: Ipv6Net,
    infra_if_prefix: Option<Ipv6Net>,
    published: Option<(Ipv6Net, RoutePreference)>,
    timer: Timer,
}

impl Nat64PrefixManager {
    pub fn new(br_ula_prefix: &Ipv6Net, enabled: bool) -> Self {
        let local_prefix = local_nat64_prefix(br_ula_prefix);
        info!("Generated local NAT64 prefix: {}", local_prefix);
        Self {
            enabled,
            running: false,
            local_prefix,
            infra_if_prefix: None,
            published: None,
            timer: Timer::new(),
        }
    }

    pub fn local_prefix(&self) -> &Ipv6Net {
        &self.local_prefix
    }

    pub fn infra_if_prefix(&self) -> Option<&Ipv6Net> {
        self.infra_if_prefix.as_ref()
    }

    pub fn published_prefix(&self) -> Option<&(Ipv6Net, RoutePreference)> {
        self.published.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> Nat64State {
        if !self.enabled {
            Nat64State::Disabled
        } else if !self.running {
            Nat64State::NotRunning
        } else if self.published.is_some() {
            Nat64State::Active
        } else {
            Nat64State::Idle
        }
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        self.timer.fire_time()
    }

    /// Enables or disables the manager. `manager_running` tells whether the
    /// routing manager is running, in which case discovery starts at once.
    pub fn set_enabled(&mut self, enabled: bool, manager_running: bool, net_data: &mut dyn NetworkData, now: Instant) {
        if self.enabled == enabled {
            return;
        }
        info!("NAT64 prefix manager {}", if enabled { "enabled" } else { "disabled" });
        if enabled {
            self.enabled = true;
            if manager_running {
                self.start(now);
            }
        } else {
            self.stop(net_data);
            self.enabled = false;
        }
    }

    pub fn start(&mut self, now: Instant) {
        if !self.enabled || self.running {
            return;
        }
        debug!("Starting NAT64 prefix manager");
        self.running = true;
        self.timer.start(now, Duration::ZERO);
    }

    pub fn stop(&mut self, net_data: &mut dyn NetworkData) {
        if let Some((prefix, _)) = self.published.take() {
            unpublish(net_data, &prefix);
        }
        self.infra_if_prefix = None;
        self.running = false;
        self.timer.stop();
    }

    /// Prefix we would publish and its preference.
    pub fn favored_prefix(&self, favored_omr_infra_derived: bool) -> (Ipv6Net, RoutePreference) {
        match self.infra_if_prefix {
            Some(prefix) if is_valid_nat64_prefix(&prefix) && favored_omr_infra_derived => {
                (prefix, RoutePreference::Medium)
            }
            _ => (self.local_prefix, RoutePreference::Low),
        }
    }

    pub fn evaluate(&mut self, net_data: &mut dyn NetworkData, favored_omr_infra_derived: bool) {
        if !self.enabled || !self.running {
            return;
        }

        let (prefix, preference) = self.favored_prefix(favored_omr_infra_derived);
        let published_prefix = self.published.map(|(p, _)| p);

        let should_publish = match net_data.preferred_nat64_prefix() {
            None => true,
            Some(existing) => {
                existing.preference < preference
                    || Some(existing.prefix) == published_prefix
                    || Some(existing.prefix) == self.infra_if_prefix
            }
        };

        if let Some(old) = published_prefix {
            if !should_publish || old != prefix {
                unpublish(net_data, &old);
                self.published = None;
            }
        }

        if should_publish && self.published != Some((prefix, preference)) {
            match net_data.publish_external_route(ExternalRouteConfig::nat64(prefix, preference)) {
                Ok(()) => {
                    info!("Published NAT64 prefix {} ({})", prefix, preference);
                    self.published = Some((prefix, preference));
                }
                Err(e) => warn!("Failed to publish NAT64 prefix {}: {}", prefix, e),
            }
        }
    }

    /// Triggers a discovery round and re-arms the periodic timer.
    pub fn handle_timer(&mut self, infra_if: &mut dyn InfraIf, now: Instant) {
        if !self.timer.take_expired(now) {
            return;
        }
        if let Err(e) = infra_if.discover_nat64_prefix() {
            warn!("NAT64 prefix discovery failed to start: {}", e);
        }
        self.timer.start(now, NAT64_DISCOVERY_INTERVAL);
    }

    /// Returns true if the infrastructure prefix changed.
    pub fn handle_discover_done(&mut self, prefix: Option<Ipv6Net>) -> bool {
        let prefix = prefix.filter(is_valid_nat64_prefix);
        if prefix == self.infra_if_prefix {
            return false;
        }
        match prefix {
            Some(p) => info!("Discovered infrastructure NAT64 prefix {}", p),
            None => info!("Infrastructure NAT64 prefix no longer available"),
        }
        self.infra_if_prefix = prefix;
        true
    }
}

fn unpublish(net_data: &mut dyn NetworkData, prefix: &Ipv6Net) {
    match net_data.unpublish_external_route(prefix) {
        Ok(()) => info!("Unpublished NAT64 prefix {}", prefix),
        Err(e) => warn!("Failed to unpublish NAT64 prefix {}: {}", prefix, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::infra_if::testing::FakeInfraIf;
    use crate::routing::net_data::LocalNetworkData;

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn running_manager(now: Instant) -> Nat64PrefixManager {
        let mut manager = Nat64PrefixManager::new(&net("fd11:2233:4455::/48"), true);
        manager.start(now);
        manager
    }

    fn nat64_routes(nd: &LocalNetworkData) -> Vec<(Ipv6Net, RoutePreference)> {
        nd.external_routes().iter().filter(|r| r.nat64).map(|r| (r.prefix, r.preference)).collect()
    }

    #[test]
    fn test_states() {
        let now = Instant::now();
        let mut nd = LocalNetworkData::default();
        let mut manager = Nat64PrefixManager::new(&net("fd11:2233:4455::/48"), false);
        assert_eq!(manager.state(), Nat64State::Disabled);

        manager.set_enabled(true, false, &mut nd, now);
        assert_eq!(manager.state(), Nat64State::NotRunning);

        manager.start(now);
        assert_eq!(manager.state(), Nat64State::Idle);

        manager.evaluate(&mut nd, false);
        assert_eq!(manager.state(), Nat64State::Active);

        manager.set_enabled(false, true, &mut nd, now);
        assert_eq!(manager.state(), Nat64State::Disabled);
        assert!(nat64_routes(&nd).is_empty());
    }

    #[test]
    fn test_publishes_local_prefix_when_none_in_mesh() {
        let now = Instant::now();
        let mut nd = LocalNetworkData::default();
        let mut manager = running_manager(now);

        assert_eq!(manager.local_prefix(), &net("fd11:2233:4455:2::/96"));
        manager.evaluate(&mut nd, false);
        assert_eq!(nat64_routes(&nd), vec![(net("fd11:2233:4455:2::/96"), RoutePreference::Low)]);

        // Stable on re-evaluation.
        manager.evaluate(&mut nd, false);
        assert_eq!(nat64_routes(&nd).len(), 1);
    }

    #[test]
    fn test_yields_to_better_prefix_from_peer() {
        let now = Instant::now();
        let mut nd = LocalNetworkData::default();
        let mut manager = running_manager(now);
        manager.evaluate(&mut nd, false);

        nd.publish_external_route(ExternalRouteConfig::nat64(net("64:ff9b::/96"), RoutePreference::Medium))
            .unwrap();
        manager.evaluate(&mut nd, false);
        assert_eq!(nat64_routes(&nd), vec![(net("64:ff9b::/96"), RoutePreference::Medium)]);
        assert_eq!(manager.state(), Nat64State::Idle);
    }

    #[test]
    fn test_infrastructure_prefix_replaces_local() {
        let now = Instant::now();
        let mut nd = LocalNetworkData::default();
        let mut manager = running_manager(now);
        manager.evaluate(&mut nd, true);

        assert!(manager.handle_discover_done(Some(net("64:ff9b::/96"))));
        assert!(!manager.handle_discover_done(Some(net("64:ff9b::/96"))));

        // Only used while the favored OMR prefix is infrastructure derived.
        assert_eq!(manager.favored_prefix(false), (net("fd11:2233:4455:2::/96"), RoutePreference::Low));

        manager.evaluate(&mut nd, true);
        assert_eq!(nat64_routes(&nd), vec![(net("64:ff9b::/96"), RoutePreference::Medium)]);
        assert_eq!(manager.published_prefix(), Some(&(net("64:ff9b::/96"), RoutePreference::Medium)));

        // Invalid discoveries clear the prefix.
        assert!(manager.handle_discover_done(Some(net("64:ff9b::/100"))));
        assert!(manager.infra_if_prefix().is_none());
    }

    #[test]
    fn test_periodic_discovery() {
        let now = Instant::now();
        let mut infra_if = FakeInfraIf::new();
        let mut manager = running_manager(now);

        manager.handle_timer(&mut infra_if, now);
        assert_eq!(infra_if.nat64_discoveries, 1);
        assert_eq!(manager.next_fire_time(), Some(now + NAT64_DISCOVERY_INTERVAL));

        manager.handle_timer(&mut infra_if, now + Duration::from_secs(10));
        assert_eq!(infra_if.nat64_discoveries, 1);
        manager.handle_timer(&mut infra_if, now + NAT64_DISCOVERY_INTERVAL);
        assert_eq!(infra_if.nat64_discoveries, 2);
    }
}
