//! Platform configuration.
//!
//! The backend is chosen here, once, rather than by conditional compilation: a build without an
//! accelerator simply runs with [`BackendKind::HostOnly`].

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const BACKEND_ENV: &str = "XFER_BACKEND";
pub const DEVICE_COUNT_ENV: &str = "XFER_DEVICE_COUNT";
pub const DEVICE_MEMORY_MB_ENV: &str = "XFER_DEVICE_MEMORY_MB";
/// Turns every channel on the platform into a blocking channel (useful when bisecting races).
pub const FORCE_BLOCKING_ENV: &str = "XFER_FORCE_BLOCKING";

pub const DEFAULT_DEVICE_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Upper bound on `device_count`: every device needs its own 1 TiB address window below 2^64.
pub const MAX_DEVICE_COUNT: u32 = 1 << 23;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("unknown backend {0:?} (expected `emulated` or `host-only`)")]
    UnknownBackend(String),

    #[error("invalid platform config: {0}")]
    Invalid(&'static str),
}

/// How queues execute their commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Every queue is an independent copy engine running on its own worker thread.
    #[default]
    Emulated,
    /// Every command runs to completion on the submitting thread.
    HostOnly,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emulated => "emulated",
            Self::HostOnly => "host-only",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s.trim();
        if v.eq_ignore_ascii_case("emulated") || v.eq_ignore_ascii_case("gpu") {
            Ok(Self::Emulated)
        } else if v.eq_ignore_ascii_case("host-only")
            || v.eq_ignore_ascii_case("host")
            || v.eq_ignore_ascii_case("cpu")
        {
            Ok(Self::HostOnly)
        } else {
            Err(ConfigError::UnknownBackend(v.to_owned()))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformConfig {
    pub backend: BackendKind,
    /// Valid device ids are `0..device_count`.
    pub device_count: u32,
    /// Capacity of each device's memory.
    pub device_memory_bytes: u64,
    pub force_blocking: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Emulated,
            device_count: 1,
            device_memory_bytes: DEFAULT_DEVICE_MEMORY_BYTES,
            force_blocking: false,
        }
    }
}

impl PlatformConfig {
    pub fn host_only() -> Self {
        Self {
            backend: BackendKind::HostOnly,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(raw) = lookup(BACKEND_ENV) {
            cfg.backend = raw.parse()?;
        }
        if let Some(raw) = lookup(DEVICE_COUNT_ENV) {
            cfg.device_count = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: DEVICE_COUNT_ENV,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(DEVICE_MEMORY_MB_ENV) {
            let mb: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: DEVICE_MEMORY_MB_ENV,
                value: raw.clone(),
            })?;
            cfg.device_memory_bytes = mb
                .checked_mul(1024 * 1024)
                .ok_or_else(|| ConfigError::InvalidEnv {
                    var: DEVICE_MEMORY_MB_ENV,
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = lookup(FORCE_BLOCKING_ENV) {
            cfg.force_blocking = truthy(&raw);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_count == 0 {
            return Err(ConfigError::Invalid("device_count must be > 0"));
        }
        if self.device_count > MAX_DEVICE_COUNT {
            return Err(ConfigError::Invalid("device_count exceeds MAX_DEVICE_COUNT"));
        }
        if self.device_memory_bytes == 0 {
            return Err(ConfigError::Invalid("device_memory_bytes must be > 0"));
        }
        Ok(())
    }
}

fn truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}
