pub mod device_id;
pub mod fragment_id;
pub mod peer_id;

pub use device_id::DeviceId;
pub use fragment_id::FragmentId;
pub use peer_id::PeerId;
