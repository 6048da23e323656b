use std::{fmt, sync::Arc};
use thiserror::Error;

use crate::errors::DeviceError;
use crate::pool::Fragment;
use crate::shared_types::{DeviceId, PeerId};

use super::{completion::RawCompletion, event::ConnectionEvent};

// -----------------------------------------------------------------------------
// ----- DeviceProvider --------------------------------------------------------

/// Enumerates and opens the devices visible to this process.
pub trait DeviceProvider {
    fn list_devices(&self) -> Result<Vec<DeviceId>, DeviceError>;

    fn open(&self, id: &DeviceId) -> Result<Arc<dyn Device>, DeviceError>;
}

// -----------------------------------------------------------------------------
// ----- Device ----------------------------------------------------------------

/// One opened network device: its work queues, completion queue, and the
/// out-of-band channel used to set up connections.
///
/// Every method is non-blocking. Posted receive buffers are owned by the
/// device until they come back in a completion or from `disconnect`/`close`.
pub trait Device: Send + Sync + fmt::Debug {
    fn id(&self) -> &DeviceId;

    /// Start a transport-level connect. The outcome arrives later through
    /// `poll_connection`, or not at all if the peer never answers.
    fn connect(&self, peer: PeerId) -> Result<(), DeviceError>;

    fn poll_connection(&self) -> Option<ConnectionEvent>;

    fn poll_completion(&self) -> Option<RawCompletion>;

    /// Submit `payload` for `peer`; completion is reported with `wr_id`.
    fn post_send(&self, peer: PeerId, wr_id: u64, payload: &[u8]) -> Result<(), DeviceError>;

    fn post_receive(&self, peer: PeerId, fragment: Fragment) -> Result<(), RejectedReceive>;

    /// Tear down the connection to `peer`, handing back its posted receives.
    fn disconnect(&self, peer: PeerId) -> Vec<Fragment>;

    /// Close the device, handing back every buffer it still owns.
    fn close(&self) -> Vec<Fragment>;
}

/// A receive post the device refused; the buffer comes back to the caller.
#[derive(Debug, Error)]
#[error("receive post rejected: {error}")]
pub struct RejectedReceive {
    #[source]
    pub error: DeviceError,
    pub fragment: Fragment,
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
