use std::fmt;

// -----------------------------------------------------------------------------
// ----- PeerId ----------------------------------------------------------------

/// Identity of a remote process as resolved by the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
