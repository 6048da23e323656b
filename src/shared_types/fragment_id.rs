// -----------------------------------------------------------------------------
// ----- FragmentId ------------------------------------------------------------

/// Correlates a device completion back to the pooled buffer that produced it.
///
/// Packed into the 64-bit work-request id handed to the device: the owning
/// pool in the high half, the slot index in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId {
    pub pool: u32,
    pub slot: u32,
}

impl FragmentId {
    pub fn to_wr_id(self) -> u64 {
        ((self.pool as u64) << 32) | self.slot as u64
    }

    pub fn from_wr_id(wr_id: u64) -> Self {
        Self {
            pool: (wr_id >> 32) as u32,
            slot: wr_id as u32,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
