//! 16-byte session identifiers in RFC 4122 v4 layout.

use rand::RngCore;
use std::fmt;

/// Identity of a message-data transaction. Generated by the caller, echoed
/// verbatim by the replier in every response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionUuid([u8; 16]);

impl SessionUuid {
    pub const SIZE: usize = 16;

    /// Generates a fresh random identifier with the v4 version and variant
    /// bits set.
    pub fn generate() -> SessionUuid {
        let mut bytes = [0u8; Self::SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        SessionUuid(bytes)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> SessionUuid {
        SessionUuid(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// The all-zero identifier, never produced by `generate`.
    #[inline]
    pub fn nil() -> SessionUuid {
        SessionUuid([0u8; Self::SIZE])
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; Self::SIZE]
    }
}

impl fmt::Display for SessionUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SessionUuid({})", self)
    }
}
