//! Configuration parsing and validation

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Smallest and largest HTTP/2 SETTINGS_MAX_FRAME_SIZE values.
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub http2: Http2Config,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the proxy learns where a client wants to go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Clients send HTTP CONNECT (or absolute-URI requests).
    #[default]
    Explicit,
    /// Traffic is redirected to the proxy; the destination comes from the
    /// accepted socket and, for TLS, from SNI.
    Transparent,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProxyMode::Explicit => "explicit",
            ProxyMode::Transparent => "transparent",
        })
    }
}

impl std::str::FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "explicit" => Ok(ProxyMode::Explicit),
            "transparent" => Ok(ProxyMode::Transparent),
            other => Err(Error::config(format!(
                "Unknown proxy mode '{}' (expected explicit or transparent)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub mode: ProxyMode,

    /// Path to the CA certificate used to sign per-host certificates
    pub ca_cert: Option<String>,

    /// Path to the CA private key
    pub ca_key: Option<String>,

    /// Connect every backend to this port instead (testing only)
    #[serde(default)]
    pub upstream_override_port: Option<u16>,

    /// PEM bundle trusted for server handshakes instead of the web roots
    #[serde(default)]
    pub upstream_tls_ca: Option<String>,

    /// How long a silent client may take before it is treated as plaintext
    #[serde(default = "default_sniff_timeout_ms")]
    pub sniff_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            mode: ProxyMode::default(),
            ca_cert: None,
            ca_key: None,
            upstream_override_port: None,
            upstream_tls_ca: None,
            sniff_timeout_ms: default_sniff_timeout_ms(),
        }
    }
}

impl ProxyConfig {
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sniff_timeout_ms() -> u64 {
    3000
}

/// Settings applied to both HTTP/2 connections of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Config {
    pub initial_window_size: u32,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_window_size: 65_535,
            max_concurrent_streams: 100,
            max_frame_size: MIN_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,

    /// Log every completed request/response exchange at info
    pub log_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_events: true,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        let frame = self.http2.max_frame_size;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&frame) {
            return Err(Error::config(format!(
                "http2.max_frame_size {} outside {}..={}",
                frame, MIN_FRAME_SIZE, MAX_FRAME_SIZE
            )));
        }

        if self.proxy.sniff_timeout_ms == 0 {
            return Err(Error::config("proxy.sniff_timeout_ms must be greater than 0"));
        }

        if self.proxy.ca_cert.is_some() != self.proxy.ca_key.is_some() {
            return Err(Error::config(
                "proxy.ca_cert and proxy.ca_key must be set together",
            ));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.proxy.bind_address.parse().map_err(|e| {
            Error::config(format!(
                "Invalid bind_address '{}': {}",
                self.proxy.bind_address, e
            ))
        })
    }

    pub fn minimal(bind_address: String, ca_cert: String, ca_key: String) -> Self {
        Self {
            proxy: ProxyConfig {
                bind_address,
                ca_cert: Some(ca_cert),
                ca_key: Some(ca_key),
                ..ProxyConfig::default()
            },
            ..Config::default()
        }
    }
}
