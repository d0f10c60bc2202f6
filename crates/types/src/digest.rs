//! Opaque content digest.

use sbor::prelude::*;
use std::fmt;

/// A 32-byte content digest.
///
/// The state machine never computes digests itself; they are produced by the
/// hasher collaborator and fed back as results. This type only carries them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
#[sbor(transparent)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The all-zero digest.
    pub const ZERO: Self = Digest([0u8; 32]);

    /// Wrap raw digest bytes (without hashing).
    pub fn new(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check whether this is the all-zero digest.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.hex();
        write!(f, "Digest({}..{})", &hex[..8], &hex[56..])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero() {
        assert!(Digest::ZERO.is_zero());
        assert!(!Digest::new([1u8; 32]).is_zero());
    }

    #[test]
    fn test_debug_is_truncated_hex() {
        let d = Digest::new([0xab; 32]);
        let s = format!("{:?}", d);
        assert!(s.starts_with("Digest(abababab"));
    }
}
