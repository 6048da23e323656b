pub mod connection;
pub mod state;

pub use connection::{PeerConnection, PeerStats};
pub use state::{PeerInput, PeerState};
