//! Daemon configuration and persisted border routing settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::prefix::{generate_br_ula_prefix, is_valid_br_ula_prefix, RoutePreference};
use crate::routing::on_link::SavedOnLinkPrefix;
use crate::routing::RoutingOptions;

pub const CONFIG_PATH_ENV: &str = "BORDER_ROUTING_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "/var/lib/server-dashboard/border-routing.json";

pub fn config_path() -> PathBuf {
    PathBuf::from(std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()))
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorderRoutingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Infrastructure interface (the adjacent IP link).
    #[serde(default)]
    pub infra_interface: String,

    #[serde(default)]
    pub dhcp6_pd_enabled: bool,

    #[serde(default)]
    pub nat64_enabled: bool,

    #[serde(default = "default_true")]
    pub multi_ail_detection_enabled: bool,

    /// Extended PAN ID of the mesh, 16 hex digits.
    #[serde(default = "default_ext_pan_id")]
    pub ext_pan_id: String,

    #[serde(default = "default_reachable_interval")]
    pub reachable_interval_secs: u64,

    #[serde(default = "default_max_old_on_link_prefixes")]
    pub max_old_on_link_prefixes: usize,

    /// Overrides the role based preference of published routes.
    #[serde(default)]
    pub route_preference: Option<RoutePreference>,

    /// Overrides the preference of advertised RIOs.
    #[serde(default)]
    pub rio_preference: Option<RoutePreference>,

    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_true() -> bool {
    true
}
fn default_ext_pan_id() -> String {
    "dead00beef00cafe".into()
}
fn default_reachable_interval() -> u64 {
    60
}
fn default_max_old_on_link_prefixes() -> usize {
    3
}
fn default_state_file() -> String {
    "/var/lib/server-dashboard/border-routing-state.json".into()
}

impl Default for BorderRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            infra_interface: String::new(),
            dhcp6_pd_enabled: false,
            nat64_enabled: false,
            multi_ail_detection_enabled: default_true(),
            ext_pan_id: default_ext_pan_id(),
            reachable_interval_secs: default_reachable_interval(),
            max_old_on_link_prefixes: default_max_old_on_link_prefixes(),
            route_preference: None,
            rio_preference: None,
            state_file: default_state_file(),
        }
    }
}

impl BorderRoutingConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: BorderRoutingConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Loads the file at `path`, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn ext_pan_id_bytes(&self) -> Result<[u8; 8]> {
        let bytes = hex::decode(self.ext_pan_id.trim())
            .with_context(|| format!("Invalid extended PAN ID {:?}", self.ext_pan_id))?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("Extended PAN ID must be 8 bytes, got {}", b.len()))
    }

    pub fn routing_options(&self, settings: &Settings) -> Result<RoutingOptions> {
        if self.reachable_interval_secs == 0 {
            anyhow::bail!("reachable_interval_secs must be positive");
        }
        Ok(RoutingOptions {
            br_ula_prefix: settings.br_ula_prefix,
            ext_pan_id: self.ext_pan_id_bytes()?,
            reachable_interval: Duration::from_secs(self.reachable_interval_secs),
            max_old_on_link_prefixes: self.max_old_on_link_prefixes,
            saved_on_link_prefixes: settings.saved_on_link_prefixes(Utc::now()),
            nat64_enabled: self.nat64_enabled,
            dhcp6_pd_enabled: self.dhcp6_pd_enabled,
            multi_ail_detection_enabled: self.multi_ail_detection_enabled,
        })
    }
}

// ── Persisted settings ──────────────────────────────────────────────────────

/// An on-link prefix that must keep being deprecated after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnLinkPrefixRecord {
    pub prefix: Ipv6Net,
    pub expires_at: DateTime<Utc>,
}

/// State that survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub br_ula_prefix: Ipv6Net,
    #[serde(default)]
    pub on_link_prefixes: Vec<OnLinkPrefixRecord>,
}

impl Settings {
    pub fn generate() -> Self {
        Self {
            br_ula_prefix: generate_br_ula_prefix(),
            on_link_prefixes: Vec::new(),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))?;
        Ok(settings)
    }

    /// Loads saved settings, generating a fresh BR ULA prefix when there are
    /// none (or the saved one is unusable).
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        let loaded = if path.exists() {
            match Self::load_from_file(path) {
                Ok(settings) if is_valid_br_ula_prefix(&settings.br_ula_prefix) => Some(settings),
                Ok(settings) => {
                    warn!("Ignoring invalid saved BR ULA prefix {}", settings.br_ula_prefix);
                    None
                }
                Err(e) => {
                    warn!("Failed to load settings: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        match loaded {
            Some(settings) => Ok(settings),
            None => {
                let settings = Self::generate();
                info!("Generated BR ULA prefix {}", settings.br_ula_prefix);
                settings.save_to_file(path)?;
                Ok(settings)
            }
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename settings to {}", path.display()))?;
        Ok(())
    }

    /// Prefixes still valid at `now`, with their remaining lifetime.
    pub fn saved_on_link_prefixes(&self, now: DateTime<Utc>) -> Vec<SavedOnLinkPrefix> {
        self.on_link_prefixes
            .iter()
            .filter_map(|record| {
                let remaining = (record.expires_at - now).num_seconds();
                (remaining > 0).then(|| SavedOnLinkPrefix {
                    prefix: record.prefix,
                    remaining_secs: remaining.min(u32::MAX as i64) as u32,
                })
            })
            .collect()
    }

    /// Replaces the persisted on-link prefixes. Returns true if they changed
    /// beyond a second of expiry drift.
    pub fn set_on_link_prefixes(&mut self, saved: &[SavedOnLinkPrefix], now: DateTime<Utc>) -> bool {
        let records: Vec<OnLinkPrefixRecord> = saved
            .iter()
            .map(|s| OnLinkPrefixRecord {
                prefix: s.prefix,
                expires_at: now + chrono::Duration::seconds(s.remaining_secs as i64),
            })
            .collect();

        let unchanged = records.len() == self.on_link_prefixes.len()
            && records.iter().zip(&self.on_link_prefixes).all(|(new, old)| {
                new.prefix == old.prefix && (new.expires_at - old.expires_at).num_seconds().abs() <= 1
            });
        self.on_link_prefixes = records;
        !unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_defaults_from_empty_object() {
        let config: BorderRoutingConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.reachable_interval_secs, 60);
        assert_eq!(config.max_old_on_link_prefixes, 3);
        assert_eq!(config.route_preference, None);
        assert_eq!(config.ext_pan_id_bytes().unwrap(), [0xde, 0xad, 0x00, 0xbe, 0xef, 0x00, 0xca, 0xfe]);
    }

    #[test]
    fn test_preference_overrides() {
        let config: BorderRoutingConfig =
            serde_json::from_str(r#"{"route_preference": "high", "rio_preference": "low"}"#).unwrap();
        assert_eq!(config.route_preference, Some(RoutePreference::High));
        assert_eq!(config.rio_preference, Some(RoutePreference::Low));
    }

    #[test]
    fn test_invalid_ext_pan_id() {
        let config = BorderRoutingConfig {
            ext_pan_id: "0011".into(),
            ..BorderRoutingConfig::default()
        };
        assert!(config.ext_pan_id_bytes().is_err());

        let config = BorderRoutingConfig {
            ext_pan_id: "zz11223344556677".into(),
            ..BorderRoutingConfig::default()
        };
        assert!(config.ext_pan_id_bytes().is_err());
    }

    #[test]
    fn test_routing_options() {
        let settings = Settings {
            br_ula_prefix: net("fd11:2233:4455::/48"),
            on_link_prefixes: Vec::new(),
        };
        let options = BorderRoutingConfig::default().routing_options(&settings).unwrap();
        assert_eq!(options.br_ula_prefix, settings.br_ula_prefix);
        assert_eq!(options.reachable_interval, Duration::from_secs(60));

        let config = BorderRoutingConfig {
            reachable_interval_secs: 0,
            ..BorderRoutingConfig::default()
        };
        assert!(config.routing_options(&settings).is_err());
    }

    #[test]
    fn test_on_link_prefixes_round_trip_through_absolute_time() {
        let now = Utc::now();
        let mut settings = Settings {
            br_ula_prefix: net("fd11:2233:4455::/48"),
            on_link_prefixes: Vec::new(),
        };
        let saved = [
            SavedOnLinkPrefix {
                prefix: net("fd00:1::/64"),
                remaining_secs: 600,
            },
            SavedOnLinkPrefix {
                prefix: net("fd00:2::/64"),
                remaining_secs: 30,
            },
        ];
        assert!(settings.set_on_link_prefixes(&saved, now));
        assert!(!settings.set_on_link_prefixes(&saved, now));

        let later = now + chrono::Duration::seconds(100);
        let restored = settings.saved_on_link_prefixes(later);
        assert_eq!(
            restored,
            vec![SavedOnLinkPrefix {
                prefix: net("fd00:1::/64"),
                remaining_secs: 500,
            }]
        );
    }

    #[test]
    fn test_settings_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("br-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");
        let _ = std::fs::remove_file(&path);

        let generated = Settings::load_or_generate(&path).unwrap();
        assert!(is_valid_br_ula_prefix(&generated.br_ula_prefix));

        let loaded = Settings::load_or_generate(&path).unwrap();
        assert_eq!(loaded, generated);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
