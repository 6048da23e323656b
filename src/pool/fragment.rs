use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Weak;
use tracing::debug;

use crate::errors::TransportError;
use crate::shared_types::FragmentId;

use super::fragment_pool::PoolInner;

// -----------------------------------------------------------------------------
// ----- Fragment --------------------------------------------------------------

/// A pooled, fixed-capacity buffer.
///
/// Not `Clone`: whoever holds the value owns the buffer, whether that is the
/// caller, a peer's send queue, or a device's receive queue. It goes back to
/// its pool through `FragmentPool::release`, or on drop if it was issued.
#[derive(Debug)]
pub struct Fragment {
    id: FragmentId,
    buf: BytesMut,
    capacity: usize,
    tag: u64,
    /// Set while issued; the slot is handed back through it on drop.
    home: Option<Weak<Mutex<PoolInner>>>,
}

// -----------------------------------------------------------------------------
// ----- Fragment: Static ------------------------------------------------------

impl Fragment {
    pub(crate) fn new(id: FragmentId, capacity: usize) -> Self {
        Self {
            id,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            tag: 0,
            home: None,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Fragment: Public ------------------------------------------------------

impl Fragment {
    pub fn id(&self) -> FragmentId {
        self.id
    }

    /// Owner-supplied value echoed back in completion and failure upcalls.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Replace the payload.
    pub fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.capacity {
            return Err(TransportError::PayloadTooLarge {
                len: data.len(),
                capacity: self.capacity,
            });
        }

        self.buf.clear();
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Append to the payload.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let len = self.buf.len() + data.len();
        if len > self.capacity {
            return Err(TransportError::PayloadTooLarge {
                len,
                capacity: self.capacity,
            });
        }

        self.buf.extend_from_slice(data);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Fragment: Crate -------------------------------------------------------

impl Fragment {
    pub(crate) fn issue(&mut self, home: Weak<Mutex<PoolInner>>) {
        self.home = Some(home);
    }

    /// State reset performed on release, never on acquire.
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.tag = 0;
        self.home = None;
    }
}

// -----------------------------------------------------------------------------
// ----- Fragment: Drop --------------------------------------------------------

impl Drop for Fragment {
    fn drop(&mut self) {
        let Some(pool) = self.home.take().and_then(|home| home.upgrade()) else {
            return;
        };

        debug!("fragment {:?} dropped without release", self.id);

        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();

        let frag = Fragment {
            id: self.id,
            buf,
            capacity: self.capacity,
            tag: 0,
            home: None,
        };
        pool.lock().reclaim(frag);
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
