pub mod registry;
pub(crate) mod shared;
pub mod transport_module;

pub use registry::ModuleRegistry;
pub use transport_module::{ModuleInfo, ModuleStats, TransportModule};
