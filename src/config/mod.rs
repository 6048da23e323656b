pub mod cli;
#[allow(clippy::module_inception)]
pub mod config;
pub mod transport;
pub mod types;

pub use cli::CliConfig;
pub use config::Config;
pub use transport::{ConfigError, ConfigFile, FRAGMENT_HEADER_LEN, MTU_UNIT, TransportConfig};
pub use types::LogLevel;
