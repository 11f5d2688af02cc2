//! Tunable configuration (spec §3.9), loaded from TOML via `serde`.
//!
//! Every floor/ceiling named in §4.1 is enforced here, not just documented —
//! `Config::load` clamps a file's values before they reach the rest of the
//! crate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lease_duration_secs: u64,
    pub reaper_interval_secs: u64,

    pub fore_max_requests_ceiling: u32,
    pub back_max_requests_ceiling: u32,
    pub max_request_size_floor: u32,
    pub max_request_size_ceiling: u32,
    pub max_response_size_cached_ceiling: u32,

    pub session_cap_per_client: usize,

    pub callback_timeouts_secs: [u64; 3],

    pub notification_batch_window_millis: u64,
    pub notification_batch_max: usize,

    pub sweep_interval_secs: u64,
    pub flush_timeout_secs: u64,

    pub chunk_size: u64,
    pub block_size: u64,

    pub multipart_min_part_size: u64,

    pub directory_delegation_cap: usize,

    pub recently_revoked_ttl_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lease_duration_secs: 90,
            reaper_interval_secs: 30,

            fore_max_requests_ceiling: 64,
            back_max_requests_ceiling: 8,
            max_request_size_floor: 8 * 1024,
            max_request_size_ceiling: 1024 * 1024,
            max_response_size_cached_ceiling: 64 * 1024,

            session_cap_per_client: 16,

            callback_timeouts_secs: [5, 10, 20],

            notification_batch_window_millis: 50,
            notification_batch_max: 100,

            sweep_interval_secs: 10,
            flush_timeout_secs: 30,

            chunk_size: 64 * 1024 * 1024,
            block_size: 4 * 1024 * 1024,

            multipart_min_part_size: 5 * 1024 * 1024,

            directory_delegation_cap: 1024,

            recently_revoked_ttl_secs: 90,
            grace_period_secs: 90,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let mut cfg: Config = toml::from_str(s)?;
        cfg.clamp();
        Ok(cfg)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Enforces the floors/ceilings of spec §4.1 regardless of what a config
    /// file asked for.
    fn clamp(&mut self) {
        let d = Config::default();
        self.fore_max_requests_ceiling = self.fore_max_requests_ceiling.min(d.fore_max_requests_ceiling).max(1);
        self.back_max_requests_ceiling = self.back_max_requests_ceiling.min(d.back_max_requests_ceiling).max(1);
        self.max_request_size_floor = self.max_request_size_floor.max(d.max_request_size_floor);
        self.max_request_size_ceiling = self
            .max_request_size_ceiling
            .min(d.max_request_size_ceiling)
            .max(self.max_request_size_floor);
        self.max_response_size_cached_ceiling = self
            .max_response_size_cached_ceiling
            .min(d.max_response_size_cached_ceiling);
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn callback_timeouts(&self) -> [Duration; 3] {
        self.callback_timeouts_secs.map(Duration::from_secs)
    }

    pub fn notification_batch_window(&self) -> Duration {
        Duration::from_millis(self.notification_batch_window_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn recently_revoked_ttl(&self) -> Duration {
        Duration::from_secs(self.recently_revoked_ttl_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Command-line entry point used by the `demos` binaries, styled on the
/// teacher's own `clap` usage.
#[derive(Debug, clap::Parser)]
pub struct Cli {
    /// Path to a TOML config file; defaults are used when omitted.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
}

impl Cli {
    pub fn load_config(&self) -> std::io::Result<Config> {
        match &self.config {
            Some(path) => Config::load(path),
            None => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_within_their_own_ceilings() {
        let cfg = Config::default();
        assert_eq!(cfg.fore_max_requests_ceiling, 64);
        assert_eq!(cfg.back_max_requests_ceiling, 8);
    }

    #[test]
    fn clamp_never_raises_above_ceiling() {
        let cfg = Config::from_toml_str("fore_max_requests_ceiling = 4096\n").unwrap();
        assert_eq!(cfg.fore_max_requests_ceiling, 64);
    }

    #[test]
    fn clamp_never_lowers_request_size_floor() {
        let cfg = Config::from_toml_str("max_request_size_floor = 1\n").unwrap();
        assert_eq!(cfg.max_request_size_floor, 8 * 1024);
    }
}
