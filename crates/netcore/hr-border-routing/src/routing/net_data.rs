//! Mesh routing data seen and published by this border router.
//!
//! The mesh stack owns the real network data; the policy engine only needs
//! a narrow view of it, expressed by the `NetworkData` trait. The daemon runs
//! without a mesh stack attached and uses `LocalNetworkData`, where every
//! published entry is immediately part of the leader data.

use ipnet::Ipv6Net;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::prefix::{is_ula, is_valid_nat64_prefix, is_valid_omr_prefix, RoutePreference};

/// Role of this device in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Disabled,
    Detached,
    Child,
    Router,
    Leader,
}

impl DeviceRole {
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Child | Self::Router | Self::Leader)
    }

    pub fn is_router_or_leader(self) -> bool {
        matches!(self, Self::Router | Self::Leader)
    }
}

/// Parent link quality that counts as a good link for a child.
pub const GOOD_LINK_QUALITY: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OnMeshPrefixConfig {
    pub prefix: Ipv6Net,
    pub preference: RoutePreference,
    pub preferred: bool,
    pub slaac: bool,
    pub on_mesh: bool,
    pub default_route: bool,
    pub stable: bool,
    pub domain_prefix: bool,
}

impl OnMeshPrefixConfig {
    /// Entry published for a local OMR prefix.
    pub fn omr(prefix: Ipv6Net, preference: RoutePreference, default_route: bool) -> Self {
        Self {
            prefix,
            preference,
            preferred: true,
            slaac: true,
            on_mesh: true,
            default_route,
            stable: true,
            domain_prefix: false,
        }
    }

    pub fn is_valid_omr(&self) -> bool {
        is_valid_omr_prefix(&self.prefix) && self.on_mesh && self.slaac && self.stable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExternalRouteConfig {
    pub prefix: Ipv6Net,
    pub preference: RoutePreference,
    pub stable: bool,
    pub nat64: bool,
    pub adv_pio: bool,
}

impl ExternalRouteConfig {
    pub fn route(prefix: Ipv6Net, preference: RoutePreference) -> Self {
        Self {
            prefix,
            preference,
            stable: true,
            nat64: false,
            adv_pio: false,
        }
    }

    pub fn nat64(prefix: Ipv6Net, preference: RoutePreference) -> Self {
        Self {
            nat64: true,
            ..Self::route(prefix, preference)
        }
    }
}

// ── Trait ───────────────────────────────────────────────────────────────────

pub trait NetworkData {
    fn role(&self) -> DeviceRole;

    /// Link quality to the parent while attached as a child.
    fn parent_link_quality(&self) -> Option<u8>;

    /// Number of other border routers publishing in the mesh data.
    fn peer_br_count(&self) -> u16;

    fn on_mesh_prefixes(&self) -> Vec<OnMeshPrefixConfig>;

    fn external_routes(&self) -> Vec<ExternalRouteConfig>;

    fn add_on_mesh_prefix(&mut self, config: OnMeshPrefixConfig) -> Result<()>;

    fn remove_on_mesh_prefix(&mut self, prefix: &Ipv6Net) -> Result<()>;

    /// Publishes an external route, replacing an earlier entry of the same
    /// prefix.
    fn publish_external_route(&mut self, config: ExternalRouteConfig) -> Result<()>;

    fn unpublish_external_route(&mut self, prefix: &Ipv6Net) -> Result<()>;

    /// Changes whenever the leader data changes.
    fn version(&self) -> u64;

    fn is_attached(&self) -> bool {
        self.role().is_attached()
    }

    fn omr_prefixes(&self) -> Vec<Ipv6Net> {
        self.on_mesh_prefixes()
            .into_iter()
            .filter(OnMeshPrefixConfig::is_valid_omr)
            .map(|c| c.prefix)
            .collect()
    }

    fn contains_omr_prefix(&self, prefix: &Ipv6Net) -> bool {
        self.on_mesh_prefixes()
            .iter()
            .any(|c| c.prefix == *prefix && c.is_valid_omr())
    }

    /// Whether a stable ULA external route is present.
    fn contains_ula_route(&self) -> bool {
        self.external_routes()
            .iter()
            .any(|r| r.stable && !r.nat64 && is_ula(&r.prefix))
    }

    /// Most preferred NAT64 route, ties broken by the numerically smaller
    /// prefix.
    fn preferred_nat64_prefix(&self) -> Option<ExternalRouteConfig> {
        self.external_routes()
            .into_iter()
            .filter(|r| r.nat64 && is_valid_nat64_prefix(&r.prefix))
            .min_by(|a, b| b.preference.cmp(&a.preference).then(a.prefix.cmp(&b.prefix)))
    }
}

// ── In-memory data ──────────────────────────────────────────────────────────

/// Network data of a mesh consisting of this device alone.
#[derive(Debug, Clone)]
pub struct LocalNetworkData {
    role: DeviceRole,
    parent_link_quality: Option<u8>,
    peer_br_count: u16,
    on_mesh_prefixes: Vec<OnMeshPrefixConfig>,
    external_routes: Vec<ExternalRouteConfig>,
    version: u64,
}

impl Default for LocalNetworkData {
    fn default() -> Self {
        Self::new(DeviceRole::Leader)
    }
}

impl LocalNetworkData {
    pub fn new(role: DeviceRole) -> Self {
        Self {
            role,
            parent_link_quality: None,
            peer_br_count: 0,
            on_mesh_prefixes: Vec::new(),
            external_routes: Vec::new(),
            version: 0,
        }
    }

    pub fn set_role(&mut self, role: DeviceRole) {
        self.role = role;
    }

    pub fn set_parent_link_quality(&mut self, quality: Option<u8>) {
        self.parent_link_quality = quality;
    }

    pub fn set_peer_br_count(&mut self, count: u16) {
        self.peer_br_count = count;
    }

}

impl NetworkData for LocalNetworkData {
    fn role(&self) -> DeviceRole {
        self.role
    }

    fn parent_link_quality(&self) -> Option<u8> {
        self.parent_link_quality
    }

    fn peer_br_count(&self) -> u16 {
        self.peer_br_count
    }

    fn on_mesh_prefixes(&self) -> Vec<OnMeshPrefixConfig> {
        self.on_mesh_prefixes.clone()
    }

    fn external_routes(&self) -> Vec<ExternalRouteConfig> {
        self.external_routes.clone()
    }

    fn add_on_mesh_prefix(&mut self, config: OnMeshPrefixConfig) -> Result<()> {
        if !self.role.is_attached() {
            return Err(Error::InvalidState);
        }
        match self.on_mesh_prefixes.iter_mut().find(|c| c.prefix == config.prefix) {
            Some(existing) if *existing == config => return Ok(()),
            Some(existing) => *existing = config,
            None => self.on_mesh_prefixes.push(config),
        }
        debug!("Network data: added on-mesh prefix {}", config.prefix);
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn remove_on_mesh_prefix(&mut self, prefix: &Ipv6Net) -> Result<()> {
        let before = self.on_mesh_prefixes.len();
        self.on_mesh_prefixes.retain(|c| c.prefix != *prefix);
        if self.on_mesh_prefixes.len() == before {
            return Err(Error::NotFound);
        }
        debug!("Network data: removed on-mesh prefix {}", prefix);
        self.version += 1;
        Ok(())
    }

    fn publish_external_route(&mut self, config: ExternalRouteConfig) -> Result<()> {
        if !self.role.is_attached() {
            return Err(Error::InvalidState);
        }
        match self.external_routes.iter_mut().find(|r| r.prefix == config.prefix) {
            Some(existing) if *existing == config => return Ok(()),
            Some(existing) => *existing = config,
            None => self.external_routes.push(config),
        }
        debug!("Network data: published route {} ({})", config.prefix, config.preference);
        self.version += 1;
        Ok(())
    }

    fn unpublish_external_route(&mut self, prefix: &Ipv6Net) -> Result<()> {
        let before = self.external_routes.len();
        self.external_routes.retain(|r| r.prefix != *prefix);
        if self.external_routes.len() == before {
            return Err(Error::NotFound);
        }
        debug!("Network data: unpublished route {}", prefix);
        self.version += 1;
        Ok(())
    }
}
