//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep thread ids, instruction addresses and host
//! slot indices from being mixed up in the instrumentation APIs.

use std::fmt;

/// Thread ID
///
/// Identifies one thread of the observed program. Assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Application instruction address
///
/// The address an instruction had in the original program, before
/// translation. Recorded as the origin of every memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppPc(pub u64);

impl fmt::Display for AppPc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Direction of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Direction::Write)
    }

    /// Single-letter form used in text logs
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Direction::Read => 'r',
            Direction::Write => 'w',
        }
    }
}

impl From<bool> for Direction {
    fn from(is_write: bool) -> Self {
        if is_write {
            Direction::Write
        } else {
            Direction::Read
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Index of a thread-local field registered with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsIndex(pub usize);

/// Index of a per-thread register spill slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpillSlot(pub u8);

impl fmt::Display for SpillSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Handle of a clean-call target registered with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_display() {
        assert_eq!(ThreadId(7).to_string(), "TID:7");
    }

    #[test]
    fn test_app_pc_display_is_zero_padded() {
        assert_eq!(AppPc(0x40_1000).to_string(), "0x0000000000401000");
    }

    #[test]
    fn test_direction_from_bool() {
        assert_eq!(Direction::from(true), Direction::Write);
        assert_eq!(Direction::from(false).as_char(), 'r');
        assert!(Direction::Write.is_write());
    }
}
