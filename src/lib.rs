pub mod config;
pub mod device;
pub mod dispatch;
pub mod errors;
pub mod module;
pub mod peer;
pub mod pool;
pub mod shared_types;

pub use config::{Config, TransportConfig};
pub use dispatch::{FragmentHandler, PollSummary};
pub use errors::{DeviceError, TransportError};
pub use module::{ModuleInfo, ModuleRegistry, ModuleStats, TransportModule};
pub use peer::{PeerConnection, PeerState};
pub use pool::{Fragment, FragmentPool, PoolStats};
pub use shared_types::{DeviceId, FragmentId, PeerId};
