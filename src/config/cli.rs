use clap::Parser;
use parking_lot::RwLock;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static CLI_CONFIG: OnceLock<Arc<RwLock<CliConfig>>> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub config_file_location: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
    pub nodes: u32,
    pub rails: u16,
    pub messages: u32,
}

impl CliConfig {
    pub fn init() {
        CLI_CONFIG.get_or_init(|| {
            let cfg = Self::from_args();
            cfg.validate();
            Arc::new(RwLock::new(cfg))
        });
    }

    pub fn snapshot() -> CliConfig {
        handle().read().clone()
    }
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Private ----------------------------------------------------

impl CliConfig {
    fn from_args() -> Self {
        let args = Args::try_parse().unwrap_or_else(|e| e.exit());

        Self {
            config_file_location: args.config_file,
            log_level: args.log_level,
            nodes: args.nodes,
            rails: args.rails,
            messages: args.messages,
        }
    }

    fn validate(&self) {
        if let Some(path) = &self.config_file_location {
            must_exist_file(path, "--config / fragcrab.toml");
        }

        if self.nodes < 2 {
            panic!("--nodes must be at least 2, got {}", self.nodes);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fragcrab", version, about = "Fragment transport over an in-memory fabric")]
struct Args {
    // Optional; transport defaults apply without a file.
    #[arg(long = "config", env = "FRAGCRAB_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    // Overrides log_level from the config file (defaults to info).
    #[arg(long = "log", env = "FRAGCRAB_LOG")]
    log_level: Option<LogLevel>,

    // Simulated processes attached to the fabric.
    #[arg(long = "nodes", default_value_t = 3, env = "FRAGCRAB_NODES")]
    nodes: u32,

    // Devices per process; each becomes one transport module.
    #[arg(long = "rails", default_value_t = 1, env = "FRAGCRAB_RAILS")]
    rails: u16,

    // Fragments each node sends to every other node.
    #[arg(long = "messages", default_value_t = 32, env = "FRAGCRAB_MESSAGES")]
    messages: u32,
}

// -----------------------------------------------------------------------------
// ----- Private Utils ---------------------------------------------------------

fn handle() -> Arc<RwLock<CliConfig>> {
    CLI_CONFIG
        .get()
        .expect("cli config not initialized; call CliConfig::init() first")
        .clone()
}

fn must_exist_file(path: &Path, hint: &str) {
    let md = fs::metadata(path).unwrap_or_else(|_| {
        panic!("required file missing: {} (from {hint})", path.display());
    });

    if !md.is_file() {
        panic!("path is not a file: {} (from {hint})", path.display());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
