//! Server configuration from environment variables

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::modules::ingest::{HwAccel, IngestSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub bind_address: IpAddr,
    pub media_root: PathBuf,
    pub session_ttl: Duration,
    /// Zero disables the sweeper
    pub sweep_interval: Duration,
    /// Zero disables periodic CPU and memory logging
    pub usage_log_interval: Duration,
    pub transcoder_path: String,
    /// `None` probes the host at each launch
    pub hw_accel: Option<HwAccel>,
    pub segment_seconds: u32,
    pub playlist_size: u32,
    pub shutdown_grace: Duration,
    pub ingest_queue_bytes: usize,
    pub ingest_write_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            port: 3000,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            media_root: PathBuf::from("media"),
            session_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            usage_log_interval: Duration::from_secs(60),
            transcoder_path: "ffmpeg".to_string(),
            hw_accel: None,
            segment_seconds: 4,
            playlist_size: 10,
            shutdown_grace: Duration::from_millis(5000),
            ingest_queue_bytes: 8 * 1024 * 1024,
            ingest_write_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerSettings {
    /// Build settings from a variable lookup, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ServerSettings::default();

        let hw_accel = match lookup("HW_ACCEL") {
            None => defaults.hw_accel,
            Some(value) if value.eq_ignore_ascii_case("auto") => None,
            Some(value) => Some(value.parse::<HwAccel>().map_err(|_| ConfigError::Invalid {
                key: "HW_ACCEL",
                value,
            })?),
        };

        Ok(ServerSettings {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            bind_address: parse_or(&lookup, "BIND_ADDRESS", defaults.bind_address)?,
            media_root: lookup("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_root),
            session_ttl: Duration::from_secs(parse_or(&lookup, "SESSION_TTL_SECS", 300)?),
            sweep_interval: Duration::from_secs(parse_or(&lookup, "SWEEP_INTERVAL_SECS", 60)?),
            usage_log_interval: Duration::from_secs(parse_or(
                &lookup,
                "USAGE_LOG_INTERVAL_SECS",
                60,
            )?),
            transcoder_path: lookup("TRANSCODER_PATH").unwrap_or(defaults.transcoder_path),
            hw_accel,
            segment_seconds: parse_or(&lookup, "SEGMENT_SECONDS", defaults.segment_seconds)?,
            playlist_size: parse_or(&lookup, "PLAYLIST_SIZE", defaults.playlist_size)?,
            shutdown_grace: Duration::from_millis(parse_or(&lookup, "SHUTDOWN_GRACE_MS", 5000)?),
            ingest_queue_bytes: parse_or(&lookup, "INGEST_QUEUE_BYTES", defaults.ingest_queue_bytes)?,
            ingest_write_timeout: Duration::from_secs(parse_or(
                &lookup,
                "INGEST_WRITE_TIMEOUT_SECS",
                10,
            )?),
        })
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            media_root: self.media_root.clone(),
            hw_accel: self.hw_accel,
            segment_seconds: self.segment_seconds,
            playlist_size: self.playlist_size,
            shutdown_grace: self.shutdown_grace,
            max_pending_bytes: self.ingest_queue_bytes,
            write_timeout: self.ingest_write_timeout,
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Load settings from the process environment
pub fn load_config() -> Result<ServerSettings, ConfigError> {
    ServerSettings::from_lookup(|key| env::var(key).ok())
}
