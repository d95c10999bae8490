//! Versioned save-state schema for the memory subsystem.
//!
//! The snapshot carries the scalar state, the raw low-RAM image, the
//! allocator handle map, and a per-page index naming which well-known
//! handler each RAM-area page had. Device-owned pages save as `0xFF` and
//! re-resolve through the slow path after restore, once devices have
//! reinstalled their callouts.

use thiserror::Error;

use crate::addr::{MemHandle, PAGE_SIZE};
use crate::handler::PageHandler;
use crate::memory::Memory;

/// Stable snapshot wire-version identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u16)]
pub enum SnapshotVersion {
    /// Initial schema revision.
    V1 = 1,
}

impl SnapshotVersion {
    /// Converts a wire value to a known snapshot version.
    #[must_use]
    pub const fn from_u16(version: u16) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            _ => None,
        }
    }
}

/// Handler-index byte meaning "no cached handler; re-resolve on access".
pub const HANDLER_INDEX_NONE: u8 = 0xFF;

fn handler_to_index(handler: Option<PageHandler>) -> u8 {
    match handler {
        Some(PageHandler::Ram) => 0,
        Some(PageHandler::Rom) => 1,
        Some(PageHandler::RomAlias) => 2,
        Some(PageHandler::Unmapped) => 3,
        Some(PageHandler::Illegal) => 4,
        Some(PageHandler::Mem4Gb) => 5,
        Some(PageHandler::Acpi) => 6,
        Some(PageHandler::Device(_)) | None => HANDLER_INDEX_NONE,
    }
}

fn index_to_handler(index: u8) -> Option<Option<PageHandler>> {
    match index {
        0 => Some(Some(PageHandler::Ram)),
        1 => Some(Some(PageHandler::Rom)),
        2 => Some(Some(PageHandler::RomAlias)),
        3 => Some(Some(PageHandler::Unmapped)),
        4 => Some(Some(PageHandler::Illegal)),
        5 => Some(Some(PageHandler::Mem4Gb)),
        6 => Some(Some(PageHandler::Acpi)),
        HANDLER_INDEX_NONE => Some(None),
        _ => None,
    }
}

/// Snapshot validation failures raised on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SnapshotLayoutError {
    /// The snapshot was taken on a machine with a different RAM size.
    #[error("snapshot page count {actual} does not match configured {expected}")]
    WrongPageCount {
        /// Configured backing page count.
        expected: u32,
        /// Page count recorded in the snapshot.
        actual: u32,
    },
    /// The RAM image length does not match the page count.
    #[error("invalid RAM image length: expected {expected} bytes, got {actual}")]
    InvalidRamLength {
        /// Required image size.
        expected: usize,
        /// Provided image size.
        actual: usize,
    },
    /// The handle map length does not match the page count.
    #[error("invalid handle map length: {0}")]
    InvalidHandleMapLength(usize),
    /// The handler index table length does not match the page count.
    #[error("invalid handler index table length: {0}")]
    InvalidHandlerTableLength(usize),
    /// A handler index byte names no well-known handler.
    #[error("unknown handler index {index:#04x} at page {page:#x}")]
    UnknownHandlerIndex {
        /// Page the bad byte belongs to.
        page: u32,
        /// The unrecognized index value.
        index: u8,
    },
    /// The active alias mask is not a legal A20 restriction of the full one.
    #[error("active alias mask {active:#x} does not derive from {full:#x}")]
    InvalidAliasMask {
        /// Full alias mask recorded in the snapshot.
        full: u32,
        /// Active alias mask recorded in the snapshot.
        active: u32,
    },
}

/// Canonical snapshot payload with explicit primitive encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemoryStateLayout {
    /// Backing page count below 4 GiB.
    pub pages: u32,
    /// Pages reported to the guest below 4 GiB.
    pub reported_pages: u32,
    /// Pages reported above 4 GiB.
    pub reported_pages_4gb: u32,
    /// Full alias page mask.
    pub alias_pagemask: u32,
    /// Active alias page mask (A20 folded in).
    pub alias_pagemask_active: u32,
    /// Hardware auto-assigner cursor.
    pub hw_next_assign: u32,
    /// A20 gate line state.
    pub a20_enabled: bool,
    /// Last PS/2 control-port value.
    pub a20_control_port: u8,
    /// Raw low-RAM image, `pages * 4096` bytes.
    pub ram: Vec<u8>,
    /// Allocator handle map, one entry per backing page; all zeros when the
    /// DOS kernel was torn down at capture time.
    pub mhandles: Vec<MemHandle>,
    /// Well-known handler index per backing page; `0xFF` re-resolves.
    pub handler_index: Vec<u8>,
    /// True when the handle map carries live allocator state.
    pub dos_kernel_active: bool,
}

/// Serializable full-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemorySnapshot {
    /// Snapshot schema version.
    pub version: SnapshotVersion,
    /// Canonical payload.
    pub state: MemoryStateLayout,
}

impl Memory {
    /// Captures the current state. `dos_kernel_active` selects whether the
    /// allocator handle map is saved or replaced by a zero surrogate.
    #[must_use]
    pub fn snapshot(&self, version: SnapshotVersion, dos_kernel_active: bool) -> MemorySnapshot {
        let pages = self.pages as usize;
        let ram = self.backing.as_slice()[..pages * PAGE_SIZE].to_vec();
        let mhandles = if dos_kernel_active {
            self.mhandles.clone()
        } else {
            vec![0; pages]
        };
        let handler_index = (0..pages)
            .map(|page| handler_to_index(self.phandlers[page]))
            .collect();

        MemorySnapshot {
            version,
            state: MemoryStateLayout {
                pages: self.pages,
                reported_pages: self.reported_pages,
                reported_pages_4gb: self.reported_pages_4gb,
                alias_pagemask: self.alias_pagemask,
                alias_pagemask_active: self.alias_pagemask_active,
                hw_next_assign: self.hw_next_assign,
                a20_enabled: self.a20.enabled,
                a20_control_port: self.a20.control_port,
                ram,
                mhandles,
                handler_index,
                dos_kernel_active,
            },
        }
    }

    /// Restores a snapshot taken on an identically sized machine.
    ///
    /// Pages whose handler index is `0xFF` go back to the slow path, except
    /// inside the adapter window `0xA0..0x100` where the current entry is
    /// kept (video emulation re-registers itself there and restoring null
    /// would drop its live mapping).
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotLayoutError`] when the payload shape or masks are
    /// inconsistent; the state is unchanged on error.
    pub fn restore(
        &mut self,
        snapshot: &MemorySnapshot,
    ) -> std::result::Result<(), SnapshotLayoutError> {
        let state = &snapshot.state;
        let pages = self.pages as usize;

        if state.pages != self.pages {
            return Err(SnapshotLayoutError::WrongPageCount {
                expected: self.pages,
                actual: state.pages,
            });
        }
        if state.ram.len() != pages * PAGE_SIZE {
            return Err(SnapshotLayoutError::InvalidRamLength {
                expected: pages * PAGE_SIZE,
                actual: state.ram.len(),
            });
        }
        if state.mhandles.len() != pages {
            return Err(SnapshotLayoutError::InvalidHandleMapLength(
                state.mhandles.len(),
            ));
        }
        if state.handler_index.len() != pages {
            return Err(SnapshotLayoutError::InvalidHandlerTableLength(
                state.handler_index.len(),
            ));
        }
        if state.alias_pagemask_active & !state.alias_pagemask != 0
            || (state.alias_pagemask ^ state.alias_pagemask_active) & !0x100 != 0
        {
            return Err(SnapshotLayoutError::InvalidAliasMask {
                full: state.alias_pagemask,
                active: state.alias_pagemask_active,
            });
        }

        let mut handlers = Vec::with_capacity(pages);
        for (page, &index) in state.handler_index.iter().enumerate() {
            match index_to_handler(index) {
                Some(handler) => handlers.push(handler),
                None => {
                    return Err(SnapshotLayoutError::UnknownHandlerIndex {
                        page: page as u32,
                        index,
                    })
                }
            }
        }

        self.backing.as_mut_slice()[..pages * PAGE_SIZE].copy_from_slice(&state.ram);
        self.reported_pages = state.reported_pages;
        self.reported_pages_4gb = state.reported_pages_4gb;
        self.alias_pagemask = state.alias_pagemask;
        self.alias_pagemask_active = state.alias_pagemask_active;
        self.hw_next_assign = state.hw_next_assign;
        self.a20.enabled = state.a20_enabled;
        self.a20.control_port = state.a20_control_port;

        if state.dos_kernel_active {
            self.mhandles.copy_from_slice(&state.mhandles);
        } else {
            self.mhandles.fill(0);
        }

        for (page, handler) in handlers.into_iter().enumerate() {
            match handler {
                Some(h) => self.phandlers[page] = Some(h),
                None if (0xA0..0x100).contains(&page) => {}
                None => self.phandlers[page] = None,
            }
        }

        self.request_tlb_flush();
        Ok(())
    }
}
