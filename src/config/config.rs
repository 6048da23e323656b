use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};

use super::{
    cli::CliConfig,
    transport::{ConfigFile, TransportConfig},
    types::LogLevel,
};

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static ROOT_CONFIG: OnceLock<Arc<RwLock<Config>>> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- Config ----------------------------------------------------------------

/// Process-wide settings for the `fragcrab` binary.
///
/// Library code never reads this; modules are handed a `&TransportConfig`
/// when they open.
#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: LogLevel,
    pub transport: TransportConfig,
    pub nodes: u32,
    pub rails: u16,
    pub messages: u32,
}

// -----------------------------------------------------------------------------
// ----- Config: Static --------------------------------------------------------

impl Config {
    /// Async because the config file is read with non-blocking IO.
    pub async fn init() {
        CliConfig::init();

        Self::load().await;
    }

    pub async fn reload() {
        Self::load().await;
    }

    pub fn snapshot() -> Config {
        Self::handle().read().clone()
    }
}

// -----------------------------------------------------------------------------
// ----- Config: Private -------------------------------------------------------

impl Config {
    async fn load() {
        let cli = CliConfig::snapshot();

        let file = match &cli.config_file_location {
            Some(path) => ConfigFile::from_file_async(path)
                .await
                .unwrap_or_else(|e| panic!("failed to load config from {:?}: {e}", path)),
            None => ConfigFile::default(),
        };

        let next = Config {
            log_level: cli.log_level.or(file.log_level).unwrap_or_default(),
            transport: file.transport,
            nodes: cli.nodes,
            rails: cli.rails,
            messages: cli.messages,
        };

        if let Some(handle) = ROOT_CONFIG.get() {
            *handle.write() = next;
        } else {
            let _ = ROOT_CONFIG.set(Arc::new(RwLock::new(next)));
        }
    }

    fn handle() -> Arc<RwLock<Config>> {
        ROOT_CONFIG
            .get()
            .expect("Config not initialized; call Config::init().await first")
            .clone()
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
