//! Outcome and mode enums shared across the search subsystem
//!
//! The hash index itself never surfaces an error to its caller; every
//! declined operation is completed by the tree. `Status` classifies the
//! outcomes the harness operations can report.

use std::fmt;

/// Status code returned by engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Key was not found
    NotFound = 1,
    /// Key already exists in a unique tree
    KeyExists = 2,
    /// Buffer pool could not supply a block
    OutOfMemory = 3,
    /// Data corruption detected
    Corruption = 4,
    /// Invalid operation in current state
    InvalidOperation = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::OutOfMemory | Status::Corruption | Status::InvalidOperation
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::KeyExists => "KeyExists",
            Status::OutOfMemory => "OutOfMemory",
            Status::Corruption => "Corruption",
            Status::InvalidOperation => "InvalidOperation",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the cursor reached its current position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CursorFlag {
    /// Positioned by binary search down the tree
    #[default]
    Binary = 0,
    /// Positioned by a successful hash lookup
    Hash = 1,
    /// A hash lookup was attempted and failed validation
    HashFail = 2,
}

/// Search mode for positioning a cursor relative to a tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SearchMode {
    /// Position on the first record strictly greater than the tuple
    Greater = 0,
    /// Position on the first record greater than or equal to the tuple
    GreaterOrEqual = 1,
    /// Position on the last record strictly less than the tuple
    Less = 2,
    /// Position on the last record less than or equal to the tuple
    LessOrEqual = 3,
}

/// Requested latch strength for a leaf-page access
///
/// Ordering matters: the hash shortcut is only permitted for latch modes
/// no stronger than [`LatchMode::ModifyLeaf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LatchMode {
    /// Shared latch on the leaf page
    SearchLeaf = 0,
    /// Exclusive latch on the leaf page
    ModifyLeaf = 1,
    /// Exclusive latch on a subtree; disqualifies the hash shortcut
    ModifyTree = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_checks() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Ok.is_error());
        assert!(Status::NotFound.is_not_found());
        assert!(Status::OutOfMemory.is_error());
        assert!(Status::Corruption.is_error());
        assert!(!Status::KeyExists.is_error());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::Ok), "Ok");
        assert_eq!(format!("{}", Status::KeyExists), "KeyExists");
        assert_eq!(Status::Corruption.as_str(), "Corruption");
    }

    #[test]
    fn test_latch_mode_ordering() {
        assert!(LatchMode::SearchLeaf < LatchMode::ModifyLeaf);
        assert!(LatchMode::ModifyLeaf < LatchMode::ModifyTree);
        assert!(!(LatchMode::ModifyLeaf > LatchMode::ModifyLeaf));
    }

    #[test]
    fn test_cursor_flag_default() {
        assert_eq!(CursorFlag::default(), CursorFlag::Binary);
    }
}
