//! Error types
//!
//! [`Error`] is returned when building a kernel object from storage that
//! cannot work. [`Violation`] is never returned: it describes a misuse
//! caught at run time and is handed to [`Config::on_violation`], after
//! which the offending operation does nothing.
//!
//! Author: Moroya Sakamoto
//!
//! [`Config::on_violation`]: crate::Config::on_violation

use crate::list::NodeId;

/// Construction-time configuration error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// More slots than a list can address
    #[error("event table of {len} slots exceeds the {max} addressable")]
    TableTooLarge { len: usize, max: usize },

    /// Blocks must hold the free-list link
    #[error("slab block size {size} is below the {min}-byte minimum")]
    BlockTooSmall { size: usize, min: usize },

    /// Buffer shorter than `block_count * block_size`
    #[error("slab buffer of {len} bytes cannot hold {needed}")]
    BufferTooSmall { len: usize, needed: usize },

    /// More blocks than a list can address
    #[error("slab of {count} blocks exceeds the {max} addressable")]
    TooManyBlocks { count: usize, max: usize },
}

impl Error {
    pub(crate) const fn table_too_large(len: usize) -> Self {
        Error::TableTooLarge {
            len,
            max: NodeId::MAX_NODES,
        }
    }
}

/// Misuse detected at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// Scratch request past the end of the task's region
    #[error("task scratch overflow: {requested} bytes at offset {offset} of {capacity}")]
    ScratchOverflow {
        offset: usize,
        requested: usize,
        capacity: usize,
    },

    /// More distinct caller routines than the kernel can index
    #[error("more than {max} caller routines")]
    TooManyRoutines { max: usize },

    /// Handle does not name a coroutine task
    #[error("event {index} is not a task")]
    NotATask { index: usize },

    /// Handle does not name a timer
    #[error("event {index} is not a timer")]
    NotATimer { index: usize },

    /// Handle does not name a slab request
    #[error("event {index} is not a slab request")]
    NotASlabRequest { index: usize },

    /// Typed locals do not fit the scratch region's alignment
    #[error("task locals need {align}-byte alignment")]
    LocalsLayout { align: usize },

    /// Block handle from another pool
    #[error("block {index} does not belong to this pool of {count}")]
    BadBlock { index: usize, count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::BlockTooSmall { size: 1, min: 2 };
        assert_eq!(err.to_string(), "slab block size 1 is below the 2-byte minimum");
        let err = Error::table_too_large(70_000);
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_violation_messages() {
        let v = Violation::ScratchOverflow {
            offset: 60,
            requested: 8,
            capacity: 64,
        };
        assert_eq!(
            v.to_string(),
            "task scratch overflow: 8 bytes at offset 60 of 64"
        );
        assert_eq!(Violation::NotATimer { index: 3 }.to_string(), "event 3 is not a timer");
    }
}
