//! Route Information Options advertised for mesh prefixes.
//!
//! Prefixes that drop out of the advertised set are not withdrawn at once:
//! they keep being advertised with a shrinking lifetime for
//! `RIO_DEPRECATION_TIME` so hosts move away gracefully.

use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use tracing::{debug, info};

use crate::error::Result;
use crate::nd::RaBuilder;
use crate::prefix::RoutePreference;
use crate::timer::{NextFireTime, Timer};

use super::net_data::OnMeshPrefixConfig;
use super::omr::OmrPrefix;

pub const RIO_LIFETIME: u32 = 1800;
pub const RIO_DEPRECATION_TIME: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RioPrefix {
    prefix: Ipv6Net,
    /// Set while the prefix is no longer in the mesh data.
    deprecating_until: Option<Instant>,
}

/// Ordered list of prefixes to advertise: the local OMR prefix when it is
/// published, the favored OMR prefix, other OMR prefixes, then the remaining
/// on-mesh prefixes. Domain prefixes are never advertised.
pub fn collect_rio_prefixes(
    local_omr: Option<&Ipv6Net>,
    favored_omr: Option<&OmrPrefix>,
    on_mesh_prefixes: &[OnMeshPrefixConfig],
) -> Vec<Ipv6Net> {
    let mut prefixes: Vec<Ipv6Net> = Vec::new();
    let mut push = |prefix: Ipv6Net| {
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    };

    if let Some(local) = local_omr {
        push(*local);
    }
    if let Some(favored) = favored_omr.filter(|f| !f.is_domain_prefix) {
        push(favored.prefix);
    }
    for config in on_mesh_prefixes.iter().filter(|c| c.is_valid_omr() && !c.domain_prefix) {
        push(config.prefix);
    }
    for config in on_mesh_prefixes.iter().filter(|c| c.on_mesh && !c.domain_prefix) {
        push(config.prefix);
    }
    prefixes
}

#[derive(Debug)]
pub struct RioAdvertiser {
    prefixes: Vec<RioPrefix>,
    timer: Timer,
    preference: RoutePreference,
    user_preference: Option<RoutePreference>,
}

impl Default for RioAdvertiser {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            timer: Timer::new(),
            preference: RoutePreference::Low,
            user_preference: None,
        }
    }
}

impl RioAdvertiser {
    pub fn preference(&self) -> RoutePreference {
        self.user_preference.unwrap_or(self.preference)
    }

    /// Returns true if the effective preference changed.
    pub fn set_preference(&mut self, preference: RoutePreference) -> bool {
        let old = self.preference();
        self.user_preference = Some(preference);
        self.log_preference_change(old)
    }

    pub fn clear_preference(&mut self) -> bool {
        let old = self.preference();
        self.user_preference = None;
        self.log_preference_change(old)
    }

    /// Medium while acting as a mesh router or leader, low otherwise.
    pub fn handle_role_changed(&mut self, is_router_or_leader: bool) -> bool {
        let old = self.preference();
        self.preference = if is_router_or_leader {
            RoutePreference::Medium
        } else {
            RoutePreference::Low
        };
        self.log_preference_change(old)
    }

    fn log_preference_change(&self, old: RoutePreference) -> bool {
        let new = self.preference();
        if new != old {
            info!("RIO preference changed: {} -> {}", old, new);
        }
        new != old
    }

    /// Every prefix currently in the advertised set, deprecating ones
    /// included.
    pub fn advertised_prefixes(&self) -> Vec<Ipv6Net> {
        self.prefixes.iter().map(|p| p.prefix).collect()
    }

    pub fn has_advertised(&self, prefix: &Ipv6Net) -> bool {
        self.prefixes.iter().any(|p| p.prefix == *prefix)
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        self.timer.fire_time()
    }

    /// Advertises `new_prefixes` and keeps deprecating the ones that left the
    /// set.
    pub fn append_rios(&mut self, builder: &mut RaBuilder, new_prefixes: &[Ipv6Net], now: Instant) -> Result<()> {
        let preference = self.preference();
        let mut next = NextFireTime::new(now);
        let mut updated: Vec<RioPrefix> = Vec::with_capacity(new_prefixes.len());

        for old in &self.prefixes {
            if new_prefixes.contains(&old.prefix) {
                continue;
            }
            let expire_time = match old.deprecating_until {
                Some(until) if until <= now => {
                    debug!("RIO prefix {} finished deprecating", old.prefix);
                    builder.append_rio(&old.prefix, 0, preference)?;
                    continue;
                }
                Some(until) => until,
                None => {
                    debug!("RIO prefix {} left mesh data, deprecating", old.prefix);
                    now + RIO_DEPRECATION_TIME
                }
            };

            let lifetime = expire_time.saturating_duration_since(now).as_secs() as u32;
            builder.append_rio(&old.prefix, lifetime, preference)?;
            next.update_if_earlier(expire_time);
            updated.push(RioPrefix {
                prefix: old.prefix,
                deprecating_until: Some(expire_time),
            });
        }

        for prefix in new_prefixes {
            builder.append_rio(prefix, RIO_LIFETIME, preference)?;
            updated.push(RioPrefix {
                prefix: *prefix,
                deprecating_until: None,
            });
        }

        self.prefixes = updated;
        self.timer.fire_at_next(&next);
        Ok(())
    }

    /// Withdraws everything ever advertised (lifetime zero).
    pub fn invalidate_all(&mut self, builder: &mut RaBuilder) -> Result<()> {
        let preference = self.preference();
        for entry in self.prefixes.drain(..) {
            builder.append_rio(&entry.prefix, 0, preference)?;
        }
        self.timer.stop();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.prefixes.clear();
        self.timer.stop();
    }

    /// Returns true when a deprecation period ended and a new RA is due.
    pub fn handle_timer(&mut self, now: Instant) -> bool {
        self.timer.take_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nd::{RaHeader, RouterAdvert};

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn rios(advertiser: &mut RioAdvertiser, prefixes: &[Ipv6Net], now: Instant) -> Vec<(Ipv6Net, u32)> {
        let mut builder = RaBuilder::new(&RaHeader::default());
        advertiser.append_rios(&mut builder, prefixes, now).unwrap();
        let ra = RouterAdvert::parse(&builder.finish()).unwrap();
        ra.route_infos().map(|r| (r.prefix, r.lifetime)).collect()
    }

    #[test]
    fn test_collect_order_and_dedup() {
        let favored = OmrPrefix {
            prefix: net("fd00:2::/64"),
            preference: RoutePreference::Medium,
            is_domain_prefix: false,
        };
        let mut domain = OnMeshPrefixConfig::omr(net("fd00:9::/64"), RoutePreference::Low, false);
        domain.domain_prefix = true;
        let mut non_omr = OnMeshPrefixConfig::omr(net("fd00:5::/48"), RoutePreference::Low, false);
        non_omr.slaac = false;
        let configs = [
            non_omr,
            OnMeshPrefixConfig::omr(net("fd00:3::/64"), RoutePreference::Low, false),
            OnMeshPrefixConfig::omr(net("fd00:2::/64"), RoutePreference::Medium, false),
            domain,
        ];

        let prefixes = collect_rio_prefixes(Some(&net("fd00:1::/64")), Some(&favored), &configs);
        assert_eq!(
            prefixes,
            vec![net("fd00:1::/64"), net("fd00:2::/64"), net("fd00:3::/64"), net("fd00:5::/48")]
        );
    }

    #[test]
    fn test_removed_prefix_deprecates_then_withdraws() {
        let now = Instant::now();
        let mut advertiser = RioAdvertiser::default();
        let a = net("fd00:1::/64");
        let b = net("fd00:2::/64");

        assert_eq!(rios(&mut advertiser, &[a, b], now), vec![(a, RIO_LIFETIME), (b, RIO_LIFETIME)]);
        assert!(advertiser.next_fire_time().is_none());

        let t1 = now + Duration::from_secs(10);
        assert_eq!(rios(&mut advertiser, &[a], t1), vec![(b, 300), (a, RIO_LIFETIME)]);
        assert_eq!(advertiser.next_fire_time(), Some(t1 + RIO_DEPRECATION_TIME));
        assert!(advertiser.has_advertised(&b));

        let t2 = t1 + Duration::from_secs(100);
        assert_eq!(rios(&mut advertiser, &[a], t2), vec![(b, 200), (a, RIO_LIFETIME)]);

        let t3 = t1 + RIO_DEPRECATION_TIME;
        assert!(advertiser.handle_timer(t3));
        assert_eq!(rios(&mut advertiser, &[a], t3), vec![(b, 0), (a, RIO_LIFETIME)]);
        assert!(!advertiser.has_advertised(&b));
    }

    #[test]
    fn test_prefix_returning_stops_deprecation() {
        let now = Instant::now();
        let mut advertiser = RioAdvertiser::default();
        let a = net("fd00:1::/64");
        rios(&mut advertiser, &[a], now);
        rios(&mut advertiser, &[], now);
        assert_eq!(rios(&mut advertiser, &[a], now), vec![(a, RIO_LIFETIME)]);
        assert!(advertiser.next_fire_time().is_none());
    }

    #[test]
    fn test_invalidate_all() {
        let now = Instant::now();
        let mut advertiser = RioAdvertiser::default();
        let a = net("fd00:1::/64");
        rios(&mut advertiser, &[a], now);

        let mut builder = RaBuilder::new(&RaHeader::default());
        advertiser.invalidate_all(&mut builder).unwrap();
        let ra = RouterAdvert::parse(&builder.finish()).unwrap();
        let rios: Vec<_> = ra.route_infos().map(|r| (r.prefix, r.lifetime)).collect();
        assert_eq!(rios, vec![(a, 0)]);
        assert!(advertiser.advertised_prefixes().is_empty());
    }

    #[test]
    fn test_preference_follows_role_and_override() {
        let mut advertiser = RioAdvertiser::default();
        assert_eq!(advertiser.preference(), RoutePreference::Low);
        assert!(advertiser.handle_role_changed(true));
        assert_eq!(advertiser.preference(), RoutePreference::Medium);

        assert!(advertiser.set_preference(RoutePreference::High));
        assert!(!advertiser.handle_role_changed(false));
        assert_eq!(advertiser.preference(), RoutePreference::High);

        assert!(advertiser.clear_preference());
        assert_eq!(advertiser.preference(), RoutePreference::Low);
    }
}
