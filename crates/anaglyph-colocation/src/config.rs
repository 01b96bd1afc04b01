use std::path::Path;
use std::time::Duration;

use anaglyph_common::helpers::{env_bool, env_duration_ms};
use anaglyph_common::{Error, Result};
use glam::Vec3;
use serde::{Deserialize, Serialize};

const DEFAULT_SCAN_BACKOFF_MS: u64 = 3_000;
const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
const DEFAULT_TICK_INTERVAL_MS: u64 = 14;
pub const DEFAULT_SERVICE_TYPE: &str = "_anaglyph._udp.local.";

pub const ENV_SCAN_BACKOFF_MS: &str = "ANAGLYPH_SCAN_BACKOFF_MS";
pub const ENV_OWNER_ONLY_ADVERTISING: &str = "ANAGLYPH_OWNER_ONLY_ADVERTISING";
pub const ENV_RETRY_DELAY_MS: &str = "ANAGLYPH_RETRY_DELAY_MS";

/// Top-level colocation settings, loadable from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColocationConfig {
    pub discovery: DiscoveryConfig,
    pub anchor: AnchorConfig,
    pub coordinator: CoordinatorConfig,
}

impl ColocationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(Error::serialization)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Environment variables take precedence over file values.
    pub fn apply_env_overrides(&mut self) {
        self.discovery.scan_backoff_ms =
            env_duration_ms(ENV_SCAN_BACKOFF_MS, self.discovery.scan_backoff()).as_millis() as u64;
        self.discovery.advertise_as_session_owner_only = env_bool(
            ENV_OWNER_ONLY_ADVERTISING,
            self.discovery.advertise_as_session_owner_only,
        );
        self.anchor.retry_delay_ms =
            env_duration_ms(ENV_RETRY_DELAY_MS, self.anchor.retry_delay()).as_millis() as u64;
    }

    pub fn validate(&self) -> Result<()> {
        if self.anchor.retry_delay_ms == 0 {
            return Err(Error::config("anchor.retry_delay_ms must be non-zero"));
        }
        if self.coordinator.tick_interval_ms == 0 {
            return Err(Error::config("coordinator.tick_interval_ms must be non-zero"));
        }
        if !(self.coordinator.spawn_distance_m > 0.0) {
            return Err(Error::config("coordinator.spawn_distance_m must be positive"));
        }
        if self.discovery.service_type.is_empty() {
            return Err(Error::config("discovery.service_type must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Wait between leaving a session and starting to scan.
    pub scan_backoff_ms: u64,
    /// Only the session owner advertises; other connected peers stay silent.
    pub advertise_as_session_owner_only: bool,
    /// mDNS service type used by the mDNS radio.
    pub service_type: String,
}

impl DiscoveryConfig {
    pub fn scan_backoff(&self) -> Duration {
        Duration::from_millis(self.scan_backoff_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_backoff_ms: DEFAULT_SCAN_BACKOFF_MS,
            advertise_as_session_owner_only: false,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Delay before a failed share/reconcile attempt starts over.
    pub retry_delay_ms: u64,
}

impl AnchorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Seed anchors spawn this far ahead of the head (horizontal).
    pub seed_forward_m: f32,
    /// Seed anchors spawn this far below the head.
    pub seed_below_m: f32,
    /// Where the rig is parked while waiting to align to an existing anchor.
    pub sentinel_position: Vec3,
    /// A new anchor is seeded once the nearest one is farther than this.
    pub spawn_distance_m: f32,
    pub tick_interval_ms: u64,
}

impl CoordinatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            seed_forward_m: 0.5,
            seed_below_m: 1.0,
            sentinel_position: Vec3::new(0.0, 1000.0, 0.0),
            spawn_distance_m: 3.0,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}
