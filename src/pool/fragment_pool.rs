use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::errors::TransportError;
use crate::shared_types::FragmentId;

use super::fragment::Fragment;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

// -----------------------------------------------------------------------------
// ----- FragmentPool ----------------------------------------------------------

/// Growable pool of fixed-size fragment buffers.
///
/// Buffers are constructed when the pool grows and reused until teardown.
/// Every slot is either in the pool or issued to exactly one holder; an
/// issued fragment that is dropped instead of released frees its slot.
#[derive(Debug)]
pub struct FragmentPool {
    id: u32,
    unit_size: usize,
    low: usize,
    max: usize,
    increment: usize,
    inner: Arc<Mutex<PoolInner>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub unit_size: usize,
    pub total: usize,
    pub free: usize,
    pub outstanding: usize,
    pub max: usize,
    pub closed: bool,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    slots: Vec<SlotState>,
    free: Vec<Fragment>,
    outstanding: usize,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    InPool,
    Issued,
}

// -----------------------------------------------------------------------------
// ----- FragmentPool: Static --------------------------------------------------

impl FragmentPool {
    pub fn new(unit_size: usize, low: usize, max: usize, increment: usize) -> Self {
        let max = max.max(1);
        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            unit_size,
            low: low.min(max),
            max,
            increment: increment.max(1),
            inner: Arc::new(Mutex::new(PoolInner {
                slots: Vec::with_capacity(low.min(max)),
                free: Vec::with_capacity(low.min(max)),
                outstanding: 0,
                closed: false,
            })),
        };

        {
            let mut inner = pool.inner.lock();
            pool.grow(&mut inner, pool.low);
        }

        pool
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.unit_size(),
            config.free_list_num,
            config.free_list_max,
            config.free_list_inc,
        )
    }
}

// -----------------------------------------------------------------------------
// ----- FragmentPool: Public --------------------------------------------------

impl FragmentPool {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn acquire(&self) -> Result<Fragment, TransportError> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(self.exhausted(&inner));
        }

        if inner.free.is_empty() {
            let total = inner.slots.len();
            if total >= self.max {
                return Err(self.exhausted(&inner));
            }

            let step = self.increment.min(self.max - total);
            self.grow(&mut inner, step);
        }

        let Some(mut frag) = inner.free.pop() else {
            return Err(self.exhausted(&inner));
        };

        inner.slots[frag.id().slot as usize] = SlotState::Issued;
        inner.outstanding += 1;
        frag.issue(Arc::downgrade(&self.inner));

        Ok(frag)
    }

    /// Return an issued fragment. After `close` the buffer is dropped instead
    /// of being kept for reuse.
    pub fn release(&self, mut frag: Fragment) -> Result<(), TransportError> {
        let id = frag.id();
        if id.pool != self.id {
            return Err(TransportError::InvalidRelease {
                pool: id.pool,
                slot: id.slot,
            });
        }

        let mut inner = self.inner.lock();
        if inner.slots.get(id.slot as usize).copied() != Some(SlotState::Issued) {
            return Err(TransportError::InvalidRelease {
                pool: id.pool,
                slot: id.slot,
            });
        }

        frag.reset();
        inner.reclaim(frag);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let total = inner.slots.len();

        PoolStats {
            unit_size: self.unit_size,
            total,
            free: total - inner.outstanding,
            outstanding: inner.outstanding,
            max: self.max,
            closed: inner.closed,
        }
    }

    /// Teardown: drop every pooled buffer and refuse further acquires.
    pub fn close(&self) -> PoolStats {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.free.clear();
            inner.free.shrink_to_fit();
        }

        let stats = self.stats();
        debug!(
            "pool {} closed with {} of {} buffers outstanding",
            self.id, stats.outstanding, stats.total
        );
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

// -----------------------------------------------------------------------------
// ----- FragmentPool: Private -------------------------------------------------

impl FragmentPool {
    fn grow(&self, inner: &mut PoolInner, count: usize) {
        let start = inner.slots.len();
        let count = count.min(self.max - start);

        for slot in start..start + count {
            let id = FragmentId {
                pool: self.id,
                slot: slot as u32,
            };
            inner.slots.push(SlotState::InPool);
            inner.free.push(Fragment::new(id, self.unit_size));
        }

        trace!("pool {} grew by {count} to {}", self.id, inner.slots.len());
    }

    fn exhausted(&self, inner: &PoolInner) -> TransportError {
        TransportError::ResourceExhausted {
            total: inner.slots.len(),
            max: self.max,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PoolInner -------------------------------------------------------------

impl PoolInner {
    /// Take back the buffer of an issued slot. After close the buffer is
    /// dropped and only the accounting changes.
    pub(crate) fn reclaim(&mut self, frag: Fragment) {
        let slot = frag.id().slot as usize;
        if self.slots.get(slot).copied() != Some(SlotState::Issued) {
            return;
        }

        self.slots[slot] = SlotState::InPool;
        self.outstanding -= 1;

        if !self.closed {
            self.free.push(frag);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- FragmentPool: Test Helpers --------------------------------------------

impl FragmentPool {
    #[cfg(test)]
    fn free_list_len(&self) -> usize {
        self.inner.lock().free.len()
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
