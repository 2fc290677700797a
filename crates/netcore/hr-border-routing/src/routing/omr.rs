//! Off-mesh-routable (OMR) prefix selection.
//!
//! The mesh should carry exactly one favored OMR prefix. This border router
//! offers its own (the DHCPv6-PD prefix when one is delegated, otherwise a
//! /64 from the BR ULA) and withdraws it as soon as a better one shows up in
//! the mesh data.

use ipnet::Ipv6Net;
use serde::Serialize;
use tracing::{info, warn};

use crate::prefix::{local_omr_prefix, RoutePreference};

use super::net_data::{NetworkData, OnMeshPrefixConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OmrPrefix {
    pub prefix: Ipv6Net,
    pub preference: RoutePreference,
    pub is_domain_prefix: bool,
}

impl OmrPrefix {
    fn new(prefix: Ipv6Net, preference: RoutePreference) -> Self {
        Self {
            prefix,
            preference,
            is_domain_prefix: false,
        }
    }

    fn from_config(config: &OnMeshPrefixConfig) -> Self {
        Self {
            prefix: config.prefix,
            preference: config.preference,
            is_domain_prefix: config.domain_prefix,
        }
    }

    /// Higher preference wins, then the numerically smaller prefix.
    pub fn is_favored_over(&self, other: &OmrPrefix) -> bool {
        if self.preference != other.preference {
            return self.preference > other.preference;
        }
        self.prefix < other.prefix
    }

    /// Only prefixes delegated from the infrastructure are published with
    /// medium or higher preference.
    pub fn is_infrastructure_derived(&self) -> bool {
        self.preference >= RoutePreference::Medium
    }
}

#[derive(Debug)]
pub struct OmrPrefixManager {
    generated_prefix: Ipv6Net,
    local_prefix: OmrPrefix,
    favored_prefix: Option<OmrPrefix>,
    is_local_added: bool,
    default_route: bool,
}

impl OmrPrefixManager {
    pub fn new(br_ula_prefix: &Ipv6Net) -> Self {
        let generated_prefix = local_omr_prefix(br_ula_prefix);
        info!("Generated local OMR prefix: {}", generated_prefix);
        Self {
            generated_prefix,
            local_prefix: OmrPrefix::new(generated_prefix, RoutePreference::Low),
            favored_prefix: None,
            is_local_added: false,
            default_route: false,
        }
    }

    pub fn generated_prefix(&self) -> &Ipv6Net {
        &self.generated_prefix
    }

    pub fn local_prefix(&self) -> &OmrPrefix {
        &self.local_prefix
    }

    pub fn favored_prefix(&self) -> Option<&OmrPrefix> {
        self.favored_prefix.as_ref()
    }

    pub fn is_local_added_in_net_data(&self) -> bool {
        self.is_local_added
    }

    pub fn is_favored_infrastructure_derived(&self) -> bool {
        self.favored_prefix.as_ref().is_some_and(OmrPrefix::is_infrastructure_derived)
    }

    pub fn start(&mut self, net_data: &dyn NetworkData) {
        self.determine_favored(net_data);
    }

    pub fn stop(&mut self, net_data: &mut dyn NetworkData) {
        self.remove_local(net_data);
        self.favored_prefix = None;
    }

    pub fn evaluate(&mut self, net_data: &mut dyn NetworkData, pd_prefix: Option<Ipv6Net>) {
        self.determine_favored(net_data);

        let new_local = match pd_prefix {
            Some(prefix) => OmrPrefix::new(prefix, RoutePreference::Medium),
            None => OmrPrefix::new(self.generated_prefix, RoutePreference::Low),
        };
        if new_local != self.local_prefix {
            info!(
                "Local OMR prefix changed: {} -> {} ({})",
                self.local_prefix.prefix, new_local.prefix, new_local.preference
            );
            self.remove_local(net_data);
            self.local_prefix = new_local;
            self.determine_favored(net_data);
        }

        match self.favored_prefix {
            None => self.add_local_as_favored(net_data),
            Some(favored) if favored.preference < self.local_prefix.preference => {
                self.add_local_as_favored(net_data)
            }
            Some(favored) if favored.prefix == self.local_prefix.prefix => self.add_local(net_data),
            Some(favored) => {
                if self.is_local_added {
                    info!("Favoring OMR prefix {} over local {}", favored.prefix, self.local_prefix.prefix);
                    self.remove_local(net_data);
                }
            }
        }
    }

    /// Republishes the local prefix when the default-route flag changes.
    pub fn update_default_route_flag(&mut self, net_data: &mut dyn NetworkData, default_route: bool) {
        if default_route == self.default_route {
            return;
        }
        self.default_route = default_route;
        if self.is_local_added {
            self.add_local(net_data);
        }
    }

    fn determine_favored(&mut self, net_data: &dyn NetworkData) {
        let mut favored: Option<OmrPrefix> = None;

        for config in net_data.on_mesh_prefixes() {
            if !config.is_valid_omr() || !config.preferred {
                continue;
            }
            let candidate = OmrPrefix::from_config(&config);
            match &favored {
                Some(current) if current.is_favored_over(&candidate) => {}
                _ => favored = Some(candidate),
            }
        }

        self.favored_prefix = favored;
    }

    fn add_local_as_favored(&mut self, net_data: &mut dyn NetworkData) {
        self.add_local(net_data);
        if self.is_local_added {
            self.favored_prefix = Some(self.local_prefix);
        }
    }

    fn add_local(&mut self, net_data: &mut dyn NetworkData) {
        let config = OnMeshPrefixConfig::omr(self.local_prefix.prefix, self.local_prefix.preference, self.default_route);
        match net_data.add_on_mesh_prefix(config) {
            Ok(()) => {
                if !self.is_local_added {
                    info!(
                        "Published local OMR prefix {} ({}) in network data",
                        self.local_prefix.prefix, self.local_prefix.preference
                    );
                }
                self.is_local_added = true;
            }
            Err(e) => warn!("Failed to publish local OMR prefix {}: {}", self.local_prefix.prefix, e),
        }
    }

    fn remove_local(&mut self, net_data: &mut dyn NetworkData) {
        if !self.is_local_added {
            return;
        }
        match net_data.remove_on_mesh_prefix(&self.local_prefix.prefix) {
            Ok(()) => info!("Removed local OMR prefix {} from network data", self.local_prefix.prefix),
            Err(e) => warn!("Failed to remove local OMR prefix {}: {}", self.local_prefix.prefix, e),
        }
        self.is_local_added = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::net_data::LocalNetworkData;

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn manager() -> OmrPrefixManager {
        OmrPrefixManager::new(&net("fd11:2233:4455::/48"))
    }

    #[test]
    fn test_favored_prefers_preference_then_smaller_prefix() {
        let low_small = OmrPrefix::new(net("fd00::/64"), RoutePreference::Low);
        let med_big = OmrPrefix::new(net("fdff::/64"), RoutePreference::Medium);
        let med_small = OmrPrefix::new(net("fd01::/64"), RoutePreference::Medium);

        assert!(med_big.is_favored_over(&low_small));
        assert!(med_small.is_favored_over(&med_big));
        assert!(!med_big.is_favored_over(&med_small));
    }

    #[test]
    fn test_publishes_generated_prefix_when_mesh_has_none() {
        let mut nd = LocalNetworkData::default();
        let mut omr = manager();
        omr.start(&nd);
        omr.evaluate(&mut nd, None);

        assert_eq!(omr.generated_prefix(), &net("fd11:2233:4455:1::/64"));
        assert!(omr.is_local_added_in_net_data());
        assert_eq!(omr.favored_prefix().unwrap().prefix, net("fd11:2233:4455:1::/64"));
        assert!(!omr.is_favored_infrastructure_derived());

        let published = nd.on_mesh_prefixes();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].preference, RoutePreference::Low);
        assert!(published[0].is_valid_omr());
    }

    #[test]
    fn test_withdraws_local_when_better_prefix_exists() {
        let mut nd = LocalNetworkData::default();
        let mut omr = manager();
        omr.evaluate(&mut nd, None);
        assert!(omr.is_local_added_in_net_data());

        nd.add_on_mesh_prefix(OnMeshPrefixConfig::omr(net("2001:db8:1::/64"), RoutePreference::Medium, false))
            .unwrap();
        omr.evaluate(&mut nd, None);

        assert!(!omr.is_local_added_in_net_data());
        assert_eq!(omr.favored_prefix().unwrap().prefix, net("2001:db8:1::/64"));
        assert!(omr.is_favored_infrastructure_derived());
        assert_eq!(nd.on_mesh_prefixes().len(), 1);
    }

    #[test]
    fn test_smaller_peer_prefix_with_same_preference_wins() {
        let mut nd = LocalNetworkData::default();
        let mut omr = manager();
        omr.evaluate(&mut nd, None);

        nd.add_on_mesh_prefix(OnMeshPrefixConfig::omr(net("fd00:1::/64"), RoutePreference::Low, false))
            .unwrap();
        omr.evaluate(&mut nd, None);
        assert!(!omr.is_local_added_in_net_data());
        assert_eq!(omr.favored_prefix().unwrap().prefix, net("fd00:1::/64"));
    }

    #[test]
    fn test_pd_prefix_replaces_generated_prefix() {
        let mut nd = LocalNetworkData::default();
        let mut omr = manager();
        omr.evaluate(&mut nd, None);

        omr.evaluate(&mut nd, Some(net("2001:db8:aa::/64")));
        assert_eq!(omr.local_prefix().prefix, net("2001:db8:aa::/64"));
        assert_eq!(omr.local_prefix().preference, RoutePreference::Medium);

        let published = nd.on_mesh_prefixes();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].prefix, net("2001:db8:aa::/64"));
        assert!(omr.is_favored_infrastructure_derived());

        omr.evaluate(&mut nd, None);
        assert_eq!(nd.on_mesh_prefixes()[0].prefix, net("fd11:2233:4455:1::/64"));
    }

    #[test]
    fn test_default_route_flag_republishes() {
        let mut nd = LocalNetworkData::default();
        let mut omr = manager();
        omr.evaluate(&mut nd, None);
        assert!(!nd.on_mesh_prefixes()[0].default_route);

        omr.update_default_route_flag(&mut nd, true);
        assert!(nd.on_mesh_prefixes()[0].default_route);

        omr.stop(&mut nd);
        assert!(nd.on_mesh_prefixes().is_empty());
        assert!(omr.favored_prefix().is_none());
    }
}
