//! Relay configuration, loaded from the environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3001;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Interval between server-sent pings
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are closed
    pub idle_timeout: Duration,
    /// How long shutdown waits for connections to close
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Read `HOST`, `PORT`, `RELAY_HEARTBEAT_SECS`, `RELAY_IDLE_TIMEOUT_SECS`
    /// and `RELAY_SHUTDOWN_GRACE_SECS`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            let ip = parse::<IpAddr>("HOST", &host)?;
            config.bind_addr.set_ip(ip);
        }
        if let Some(port) = lookup("PORT") {
            config.bind_addr.set_port(parse::<u16>("PORT", &port)?);
        }
        if let Some(secs) = lookup("RELAY_HEARTBEAT_SECS") {
            config.heartbeat_interval = seconds("RELAY_HEARTBEAT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("RELAY_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = seconds("RELAY_IDLE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("RELAY_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace = Duration::from_secs(parse("RELAY_SHUTDOWN_GRACE_SECS", &secs)?);
        }

        Ok(config)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Non-zero whole seconds. A zero interval would make `tokio::time::interval` panic.
fn seconds(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse::<u64>(key, value)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}
