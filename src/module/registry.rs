use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{ConfigError, TransportConfig};
use crate::device::DeviceProvider;
use crate::dispatch::FragmentHandler;
use crate::errors::TransportError;

use super::transport_module::TransportModule;

// -----------------------------------------------------------------------------
// ----- ModuleRegistry --------------------------------------------------------

/// The modules opened at startup, one per usable device.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<TransportModule>,
}

// -----------------------------------------------------------------------------
// ----- ModuleRegistry: Static ------------------------------------------------

impl ModuleRegistry {
    /// Open a module on every device `provider` lists.
    ///
    /// Only an invalid `config` is an error. Finding no devices, or failing to
    /// open one, is logged and leaves that device out.
    pub fn init(
        provider: &dyn DeviceProvider,
        config: &TransportConfig,
        handler: Arc<dyn FragmentHandler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let devices = match provider.list_devices() {
            Ok(devices) => devices,
            Err(err) => {
                warn!("device enumeration failed: {err}");
                Vec::new()
            }
        };

        if devices.is_empty() {
            warn!("{}", TransportError::DeviceUnavailable);
            return Ok(Self::default());
        }

        let mut modules = Vec::with_capacity(devices.len());
        for id in devices {
            match provider.open(&id) {
                Ok(device) => {
                    let module = TransportModule::open(device, config, Arc::clone(&handler));
                    info!("{id}: module ready");
                    modules.push(module);
                }
                Err(err) => warn!("{id}: skipping device: {err}"),
            }
        }

        Ok(Self { modules })
    }
}

// -----------------------------------------------------------------------------
// ----- ModuleRegistry: Public ------------------------------------------------

impl ModuleRegistry {
    pub fn modules(&self) -> &[TransportModule] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Progress every module once; returns the total processed.
    pub fn progress(&self, now: Instant) -> usize {
        self.modules.iter().map(|module| module.progress(now)).sum()
    }

    pub fn close(&self) {
        for module in &self.modules {
            module.close();
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
