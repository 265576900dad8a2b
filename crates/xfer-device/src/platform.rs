use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::warn;

use crate::config::{ConfigError, PlatformConfig};
use crate::context::DeviceContext;
use crate::error::{DeviceError, Result};
use crate::DeviceId;

/// The set of devices visible to the process, and how their queues execute.
///
/// Devices are opened lazily; every call to [`Platform::device`] with the same id returns the
/// same context.
#[derive(Debug)]
pub struct Platform {
    config: PlatformConfig,
    devices: Mutex<HashMap<DeviceId, Arc<DeviceContext>>>,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// A single-device platform without an accelerator: every command runs inline.
    pub fn host_only() -> Self {
        Self {
            config: PlatformConfig::host_only(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide platform, configured from the environment on first use.
    ///
    /// An invalid environment falls back to [`PlatformConfig::default`].
    pub fn global() -> &'static Platform {
        static GLOBAL: OnceLock<Platform> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = PlatformConfig::from_env().unwrap_or_else(|err| {
                warn!("invalid transfer platform config, using defaults: {err}");
                PlatformConfig::default()
            });
            Platform {
                config,
                devices: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn lock_devices(&self) -> MutexGuard<'_, HashMap<DeviceId, Arc<DeviceContext>>> {
        match self.devices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The context for `id`, opening the device on first use.
    pub fn device(&self, id: DeviceId) -> Result<Arc<DeviceContext>> {
        let window = id
            .index()
            .filter(|index| *index < self.config.device_count)
            .ok_or(DeviceError::InvalidDevice {
                device: id,
                device_count: self.config.device_count,
            })?;

        let mut devices = self.lock_devices();
        let ctx = devices.entry(id).or_insert_with(|| {
            Arc::new(DeviceContext::new(
                id,
                window,
                self.config.backend,
                self.config.device_memory_bytes,
                self.config.force_blocking,
            ))
        });
        Ok(Arc::clone(ctx))
    }
}
