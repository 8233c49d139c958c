//! Session broker configuration.
//!
//! Configuration is loaded from environment variables with defaults and
//! validated at startup; an invalid value aborts the process instead of
//! being silently replaced.

use crate::engine::ListenConfig;
use signal_protocol::codecs::CodecProfile;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3001";

/// Default number of media engine instances.
pub const DEFAULT_ENGINE_WORKER_COUNT: usize = 2;

/// Default relay port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40_000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49_999;

/// Default address advertised in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default capacity limits.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 50;
pub const DEFAULT_MAX_PRODUCERS_PER_PEER: usize = 4;
pub const DEFAULT_MAX_CONSUMERS_PER_PEER: usize = 200;

/// Default idle-room reaping parameters.
pub const DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_ROOM_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Per-room and per-peer capacity limits enforced by room actors.
#[derive(Debug, Clone, Copy)]
pub struct RoomLimits {
    pub max_peers_per_room: usize,
    pub max_producers_per_peer: usize,
    pub max_consumers_per_peer: usize,
}

/// Session broker configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket bind address (default: "0.0.0.0:3001").
    pub bind_address: String,

    /// Number of media engine instances to spawn.
    pub engine_worker_count: usize,

    /// Lower bound of the relay port range.
    pub rtc_min_port: u16,

    /// Upper bound of the relay port range.
    pub rtc_max_port: u16,

    /// Address advertised to clients in ICE candidates.
    pub announced_ip: String,

    /// Maximum peers admitted to one room.
    pub max_peers_per_room: usize,

    /// Maximum producers one peer may publish.
    pub max_producers_per_peer: usize,

    /// Maximum consumers one peer may hold.
    pub max_consumers_per_peer: usize,

    /// How long a room may sit empty before the reaper removes it.
    pub room_idle_timeout_seconds: u64,

    /// Period of the idle-room sweep.
    pub room_sweep_interval_seconds: u64,

    /// Codec preset used when creating room routers.
    pub codec_profile: CodecProfile,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}: {e}"))),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("BROKER_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let announced_ip = vars
            .get("ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCED_IP.to_string());

        let engine_worker_count =
            parse_or(vars, "ENGINE_WORKER_COUNT", DEFAULT_ENGINE_WORKER_COUNT)?;
        let rtc_min_port = parse_or(vars, "RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_or(vars, "RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        let max_peers_per_room =
            parse_or(vars, "MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?;
        let max_producers_per_peer = parse_or(
            vars,
            "MAX_PRODUCERS_PER_PEER",
            DEFAULT_MAX_PRODUCERS_PER_PEER,
        )?;
        let max_consumers_per_peer = parse_or(
            vars,
            "MAX_CONSUMERS_PER_PEER",
            DEFAULT_MAX_CONSUMERS_PER_PEER,
        )?;
        let room_idle_timeout_seconds = parse_or(
            vars,
            "ROOM_IDLE_TIMEOUT_SECONDS",
            DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS,
        )?;
        let room_sweep_interval_seconds = parse_or(
            vars,
            "ROOM_SWEEP_INTERVAL_SECONDS",
            DEFAULT_ROOM_SWEEP_INTERVAL_SECONDS,
        )?;

        let codec_profile = match vars.get("CODEC_PROFILE") {
            None => CodecProfile::default(),
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("CODEC_PROFILE: {e}")))?,
        };

        let config = Config {
            bind_address,
            engine_worker_count,
            rtc_min_port,
            rtc_max_port,
            announced_ip,
            max_peers_per_room,
            max_producers_per_peer,
            max_consumers_per_peer,
            room_idle_timeout_seconds,
            room_sweep_interval_seconds,
            codec_profile,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine_worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "ENGINE_WORKER_COUNT must be at least 1".to_string(),
            ));
        }
        if self.rtc_min_port > self.rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RTC_MIN_PORT ({}) must not exceed RTC_MAX_PORT ({})",
                self.rtc_min_port, self.rtc_max_port
            )));
        }
        if self.max_peers_per_room == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_PEERS_PER_ROOM must be at least 1".to_string(),
            ));
        }
        if self.max_producers_per_peer == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_PRODUCERS_PER_PEER must be at least 1".to_string(),
            ));
        }
        if self.max_consumers_per_peer == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONSUMERS_PER_PEER must be at least 1".to_string(),
            ));
        }
        if self.room_sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "ROOM_SWEEP_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Capacity limits handed to room actors.
    #[must_use]
    pub fn limits(&self) -> RoomLimits {
        RoomLimits {
            max_peers_per_room: self.max_peers_per_room,
            max_producers_per_peer: self.max_producers_per_peer,
            max_consumers_per_peer: self.max_consumers_per_peer,
        }
    }

    /// Listen configuration handed to the engine when creating transports.
    #[must_use]
    pub fn listen_config(&self) -> ListenConfig {
        ListenConfig {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: self.announced_ip.clone(),
            min_port: self.rtc_min_port,
            max_port: self.rtc_max_port,
        }
    }

    /// Empty-room inactivity threshold.
    #[must_use]
    pub fn room_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.room_idle_timeout_seconds)
    }

    /// Idle-room sweep period.
    #[must_use]
    pub fn room_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.room_sweep_interval_seconds)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.engine_worker_count, DEFAULT_ENGINE_WORKER_COUNT);
        assert_eq!(config.rtc_min_port, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_max_port, DEFAULT_RTC_MAX_PORT);
        assert_eq!(config.announced_ip, DEFAULT_ANNOUNCED_IP);
        assert_eq!(config.max_peers_per_room, DEFAULT_MAX_PEERS_PER_ROOM);
        assert_eq!(
            config.max_producers_per_peer,
            DEFAULT_MAX_PRODUCERS_PER_PEER
        );
        assert_eq!(
            config.max_consumers_per_peer,
            DEFAULT_MAX_CONSUMERS_PER_PEER
        );
        assert_eq!(
            config.room_idle_timeout_seconds,
            DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS
        );
        assert_eq!(
            config.room_sweep_interval_seconds,
            DEFAULT_ROOM_SWEEP_INTERVAL_SECONDS
        );
        assert_eq!(config.codec_profile, CodecProfile::Balanced);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("BROKER_BIND_ADDRESS".to_string(), "127.0.0.1:4000".to_string()),
            ("ENGINE_WORKER_COUNT".to_string(), "4".to_string()),
            ("RTC_MIN_PORT".to_string(), "20000".to_string()),
            ("RTC_MAX_PORT".to_string(), "20999".to_string()),
            ("ANNOUNCED_IP".to_string(), "203.0.113.9".to_string()),
            ("MAX_PEERS_PER_ROOM".to_string(), "8".to_string()),
            ("MAX_PRODUCERS_PER_PEER".to_string(), "2".to_string()),
            ("MAX_CONSUMERS_PER_PEER".to_string(), "32".to_string()),
            ("ROOM_IDLE_TIMEOUT_SECONDS".to_string(), "120".to_string()),
            ("ROOM_SWEEP_INTERVAL_SECONDS".to_string(), "30".to_string()),
            ("CODEC_PROFILE".to_string(), "minimal".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:4000");
        assert_eq!(config.engine_worker_count, 4);
        assert_eq!(config.rtc_min_port, 20_000);
        assert_eq!(config.rtc_max_port, 20_999);
        assert_eq!(config.announced_ip, "203.0.113.9");
        assert_eq!(config.max_peers_per_room, 8);
        assert_eq!(config.max_producers_per_peer, 2);
        assert_eq!(config.max_consumers_per_peer, 32);
        assert_eq!(config.room_idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.room_sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.codec_profile, CodecProfile::Minimal);
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let vars = HashMap::from([("ENGINE_WORKER_COUNT".to_string(), "many".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(ref v)) if v.contains("ENGINE_WORKER_COUNT"))
        );
    }

    #[test]
    fn test_zero_worker_count_is_rejected() {
        let vars = HashMap::from([("ENGINE_WORKER_COUNT".to_string(), "0".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let vars = HashMap::from([
            ("RTC_MIN_PORT".to_string(), "50000".to_string()),
            ("RTC_MAX_PORT".to_string(), "40000".to_string()),
        ]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_unknown_codec_profile_is_rejected() {
        let vars = HashMap::from([("CODEC_PROFILE".to_string(), "theora".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(ref v)) if v.contains("CODEC_PROFILE"))
        );
    }

    #[test]
    fn test_zero_room_capacity_is_rejected() {
        let vars = HashMap::from([("MAX_PEERS_PER_ROOM".to_string(), "0".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
