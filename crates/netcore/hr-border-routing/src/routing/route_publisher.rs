//! Publishes the external route that draws mesh traffic toward this border
//! router: the default route `::/0` when the infrastructure offers real
//! connectivity, or the ULA aggregate `fc00::/7` when only ULA prefixes are
//! reachable.

use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::prefix::{default_route, ula_aggregate, RoutePreference};
use crate::timer::{add_jitter, Timer};

use super::net_data::{DeviceRole, ExternalRouteConfig, NetworkData, GOOD_LINK_QUALITY};

const DEFAULT_ROUTE_WITHDRAW_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_ROUTE_WITHDRAW_JITTER: Duration = Duration::from_secs(1);
const PREFERENCE_UPGRADE_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    DoNotPublish,
    PublishDefault,
    PublishUla,
}

impl PublishState {
    fn route(self) -> Option<Ipv6Net> {
        match self {
            Self::DoNotPublish => None,
            Self::PublishDefault => Some(default_route()),
            Self::PublishUla => Some(ula_aggregate()),
        }
    }
}

/// What the publisher needs to know about the link and the mesh.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutePublisherInputs {
    pub favored_omr_infra_derived: bool,
    pub has_default_or_non_ula_route: bool,
    pub has_non_ula_on_link: bool,
    pub has_ula_on_link: bool,
    pub should_publish_ula_route: bool,
}

impl RoutePublisherInputs {
    fn target_state(&self) -> PublishState {
        if self.favored_omr_infra_derived && self.has_default_or_non_ula_route {
            PublishState::PublishDefault
        } else if self.has_non_ula_on_link {
            PublishState::PublishDefault
        } else if self.has_ula_on_link || self.should_publish_ula_route {
            PublishState::PublishUla
        } else {
            PublishState::DoNotPublish
        }
    }
}

fn role_based_preference(role: DeviceRole, parent_link_quality: Option<u8>) -> RoutePreference {
    if role == DeviceRole::Child && parent_link_quality != Some(GOOD_LINK_QUALITY) {
        RoutePreference::Low
    } else {
        RoutePreference::Medium
    }
}

#[derive(Debug)]
pub struct RoutePublisher {
    state: PublishState,
    published: Option<Ipv6Net>,
    preference: RoutePreference,
    user_preference: Option<RoutePreference>,
    adv_pio: bool,
    upgrade_timer: Timer,
    withdraw_timer: Timer,
    withdraw_due: bool,
}

impl Default for RoutePublisher {
    fn default() -> Self {
        Self {
            state: PublishState::DoNotPublish,
            published: None,
            preference: RoutePreference::Medium,
            user_preference: None,
            adv_pio: false,
            upgrade_timer: Timer::new(),
            withdraw_timer: Timer::new(),
            withdraw_due: false,
        }
    }
}

impl RoutePublisher {
    pub fn state(&self) -> PublishState {
        self.state
    }

    pub fn published_route(&self) -> Option<&Ipv6Net> {
        self.published.as_ref()
    }

    pub fn preference(&self) -> RoutePreference {
        self.user_preference.unwrap_or(self.preference)
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        crate::timer::earliest(self.upgrade_timer.fire_time(), self.withdraw_timer.fire_time())
    }

    /// Returns the new default-route flag for the local OMR prefix when the
    /// publish state changed.
    pub fn evaluate(
        &mut self,
        net_data: &mut dyn NetworkData,
        inputs: &RoutePublisherInputs,
        now: Instant,
    ) -> Option<bool> {
        let mut new_state = inputs.target_state();

        if self.state == PublishState::PublishDefault && new_state != PublishState::PublishDefault {
            if std::mem::take(&mut self.withdraw_due) {
                debug!("Default route withdrawal delay elapsed");
            } else {
                if !self.withdraw_timer.is_running() {
                    let delay = add_jitter(DEFAULT_ROUTE_WITHDRAW_DELAY, DEFAULT_ROUTE_WITHDRAW_JITTER);
                    debug!("Delaying default route withdrawal by {:?}", delay);
                    self.withdraw_timer.start(now, delay);
                }
                new_state = PublishState::PublishDefault;
            }
        } else {
            self.withdraw_timer.stop();
            self.withdraw_due = false;
        }

        if new_state == self.state {
            return None;
        }

        info!("Route publisher state: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        self.update_published_route(net_data);
        Some(new_state == PublishState::PublishDefault)
    }

    pub fn stop(&mut self, net_data: &mut dyn NetworkData) {
        self.state = PublishState::DoNotPublish;
        self.update_published_route(net_data);
        self.withdraw_timer.stop();
        self.withdraw_due = false;
    }

    /// Returns true when the publish state should be evaluated again.
    pub fn handle_timer(&mut self, net_data: &mut dyn NetworkData, now: Instant) -> bool {
        if self.upgrade_timer.take_expired(now) {
            let preference = role_based_preference(net_data.role(), net_data.parent_link_quality());
            self.update_preference(net_data, preference);
        }
        if self.withdraw_timer.take_expired(now) {
            self.withdraw_due = true;
            return true;
        }
        false
    }

    // ── Preference ──────────────────────────────────────────────────────────

    pub fn set_preference(&mut self, net_data: &mut dyn NetworkData, preference: RoutePreference) {
        info!("User route preference set to {}", preference);
        let old = self.preference();
        self.user_preference = Some(preference);
        self.upgrade_timer.stop();
        self.republish_if_changed(net_data, old);
    }

    pub fn clear_preference(&mut self, net_data: &mut dyn NetworkData) {
        if self.user_preference.is_none() {
            return;
        }
        info!("User route preference cleared");
        let old = self.preference();
        self.user_preference = None;
        self.preference = role_based_preference(net_data.role(), net_data.parent_link_quality());
        self.upgrade_timer.stop();
        self.republish_if_changed(net_data, old);
    }

    pub fn handle_role_changed(&mut self, net_data: &mut dyn NetworkData) {
        self.upgrade_timer.stop();
        let preference = role_based_preference(net_data.role(), net_data.parent_link_quality());
        self.update_preference(net_data, preference);
    }

    /// As a child, a good parent link upgrades the preference only after it
    /// stayed good for a while; a weak link downgrades at once.
    pub fn handle_parent_link_quality_changed(&mut self, net_data: &mut dyn NetworkData, now: Instant) {
        if net_data.role() != DeviceRole::Child || self.user_preference.is_some() {
            return;
        }

        if net_data.parent_link_quality() == Some(GOOD_LINK_QUALITY) {
            if self.preference == RoutePreference::Low && !self.upgrade_timer.is_running() {
                debug!("Parent link is good, upgrading route preference in {:?}", PREFERENCE_UPGRADE_DELAY);
                self.upgrade_timer.start(now, PREFERENCE_UPGRADE_DELAY);
            }
        } else {
            self.upgrade_timer.stop();
            self.update_preference(net_data, RoutePreference::Low);
        }
    }

    pub fn update_adv_pio_flag(&mut self, net_data: &mut dyn NetworkData, adv_pio: bool) {
        if self.adv_pio == adv_pio {
            return;
        }
        self.adv_pio = adv_pio;
        if self.state != PublishState::DoNotPublish {
            self.publish(net_data);
        }
    }

    fn update_preference(&mut self, net_data: &mut dyn NetworkData, preference: RoutePreference) {
        let old = self.preference();
        self.preference = preference;
        self.republish_if_changed(net_data, old);
    }

    fn republish_if_changed(&mut self, net_data: &mut dyn NetworkData, old: RoutePreference) {
        if self.preference() == old {
            return;
        }
        info!("Route preference changed: {} -> {}", old, self.preference());
        if self.state != PublishState::DoNotPublish {
            self.publish(net_data);
        }
    }

    // ── Publishing ──────────────────────────────────────────────────────────

    fn update_published_route(&mut self, net_data: &mut dyn NetworkData) {
        let target = self.state.route();
        if let Some(old) = self.published.filter(|old| Some(*old) != target) {
            match net_data.unpublish_external_route(&old) {
                Ok(()) => info!("Unpublished route {}", old),
                Err(e) => warn!("Failed to unpublish route {}: {}", old, e),
            }
            self.published = None;
        }
        if target.is_some() {
            self.publish(net_data);
        }
    }

    fn publish(&mut self, net_data: &mut dyn NetworkData) {
        let Some(prefix) = self.state.route() else {
            return;
        };
        let config = ExternalRouteConfig {
            adv_pio: self.adv_pio,
            ..ExternalRouteConfig::route(prefix, self.preference())
        };
        match net_data.publish_external_route(config) {
            Ok(()) => {
                if self.published != Some(prefix) {
                    info!("Published route {} ({})", prefix, config.preference);
                }
                self.published = Some(prefix);
            }
            Err(e) => warn!("Failed to publish route {}: {}", prefix, e),
        }
    }
}
