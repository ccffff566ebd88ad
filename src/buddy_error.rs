use core::fmt;

/// Errors that can occur while using a [`crate::BuddyPool`].
#[derive(PartialEq, Clone, Copy)]
pub enum BuddyError {
    /// No block large enough to satisfy the request exists in the pool, or the
    /// request itself exceeds the pool's total capacity.
    NoMemory,
    /// A pointer handed to [`crate::BuddyPool::realloc`] could not be traced back
    /// to a valid block header.
    CorruptedMemoryPool,
}

impl fmt::Debug for BuddyError {
    /// Formats the error message for debugging purposes.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BuddyError::NoMemory => write!(f, "Insufficient memory available"),
            BuddyError::CorruptedMemoryPool => write!(f, "Memory pool is corrupted or invalid"),
        }
    }
}

impl fmt::Display for BuddyError {
    /// Formats the error message for display purposes.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl core::error::Error for BuddyError {}
