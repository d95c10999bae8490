use std::path::PathBuf;

use thiserror::Error;

use crate::addr::PageNum;

/// Result type alias using the memory subsystem's error type.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors surfaced by memory-subsystem initialization and bookkeeping.
///
/// Hot-path accesses never error; out-of-range and denied accesses are
/// absorbed by the illegal/unmapped handlers and recorded in diagnostics.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The host mapping for guest RAM could not be established.
    #[error("guest RAM allocation of {size} bytes failed: {reason}")]
    BackingAllocation {
        /// Requested mapping size in bytes.
        size: usize,
        /// Host error description.
        reason: String,
    },

    /// The configured memory file exists but is not a regular file.
    #[error("memory file {0} is not a regular file")]
    MemoryFileNotRegular(PathBuf),

    /// I/O failure while preparing the memory file.
    #[error("memory file I/O error: {0}")]
    MemoryFileIo(#[from] std::io::Error),

    /// Address aliasing below 1 MiB cannot produce a working machine.
    #[error("alias page mask {0:#x} covers less than 1 MiB")]
    AliasMaskBelowOneMegabyte(u32),

    /// A mapping request referenced pages beyond the handler table.
    #[error("page range {start:#x}..={end:#x} exceeds handler table limit {limit:#x}")]
    RangeOutsideHandlerTable {
        /// First page of the rejected range.
        start: PageNum,
        /// Last page of the rejected range.
        end: PageNum,
        /// Handler table size in pages.
        limit: PageNum,
    },

    /// A mapping request would overwrite a foreign handler.
    #[error("page {0:#x} already claimed by another handler")]
    MappingConflict(PageNum),

    /// A callout install was rejected by page-mask validation.
    #[error("callout page mask {mem_mask:#x} at base {base_page:#x} is invalid: {reason}")]
    InvalidCalloutMask {
        /// Base page of the rejected install.
        base_page: PageNum,
        /// Offending page mask.
        mem_mask: u32,
        /// Which validation rule failed.
        reason: &'static str,
    },

    /// The callout handle does not name an allocated slot.
    #[error("callout handle does not name an allocated slot")]
    StaleCalloutHandle,

    /// The per-bus callout pool is exhausted.
    #[error("callout pool for bus {0} has no free entries")]
    CalloutPoolExhausted(&'static str),

    /// PC-98 shutdown lines were driven into the invalid SHUT0=1 SHUT1=0
    /// combination, which real firmware answers by halting the system.
    #[error("invalid PC-98 shutdown combination SHUT0=1 SHUT1=0")]
    InvalidShutdownLines,
}
