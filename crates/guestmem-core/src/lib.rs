//! Guest physical memory subsystem for an x86/PC-98 emulator core.
//!
//! Models the machine's physical address space: backing RAM, ROM regions,
//! memory-mapped device windows, the A20 gate, and the per-page dispatch
//! that routes every CPU load and store to the right handler. Device
//! emulation registers claims through bus callouts and device handles; the
//! CPU dispatcher owns the [`Memory`] object and drains its TLB-flush flag
//! between instructions.

/// Address-space primitives and page arithmetic.
pub mod addr;
pub use addr::{
    page_of, pagemask_combine, pagemask_range, phys_page_of, LinearAddr, MemHandle, PageNum,
    PhysAddr, A20_PAGE_BIT, ISA_HOLE_FIRST_PAGE, ISA_HOLE_LAST_PAGE, PAGEMASK_FULL, PAGES_4GB,
    PAGE_SIZE, RESERVED_HANDLE, XMS_START,
};

/// Error taxonomy.
pub mod error;
pub use error::{MemoryError, Result};

/// Diagnostics counters and the structural trace hook.
pub mod diag;
pub use diag::{MemDiag, MemTraceEvent, MemTraceSink, RecordingTraceSink, ILLEGAL_TRACE_CAP};

/// Configuration and the derived RAM plan.
pub mod config;
pub use config::{
    A20Mode, AcpiConfig, CpuArchetype, MachineKind, MemoryConfig, RamPlan, MAX_BELOW_4GB_BYTES,
};

/// Host backing store (anonymous or file-backed mapping).
pub mod backing;
pub use backing::HostBacking;

/// Page-handler contract and the device registry.
pub mod handler;
pub use handler::{DeviceId, DeviceRegistry, HandlerFlags, PageHandler, PagedDevice};

/// The memory-state object and the page-handler table.
pub mod memory;
pub use memory::{AcpiRegion, LfbOverride, LfbWindow, Memory};

/// Bus callout registries and the slow path.
pub mod callout;
pub use callout::{
    BusType, CalloutArena, CalloutId, CalloutObject, CalloutResolver, CALLOUT_BUS_COUNT,
    CALLOUT_POOL_INITIAL, CALLOUT_POOL_MAX,
};

/// A20 gate and its I/O ports.
pub mod a20;
pub use a20::{A20Gate, Port92Effect};

/// EMS/XMS page allocator.
pub mod allocator;

/// Mapping facade: RAM/ROM ranges, LFB, hardware assigner, ACPI.
pub mod mapping;
pub use mapping::{LFB_MMIO_OFFSET, LFB_MMIO_PAGES};

/// Byte-level access API.
pub mod access;

/// Software CPU reset dispatch.
pub mod reset;
pub use reset::{Resume, ShutdownRequest};

/// Versioned save-state schema.
pub mod snapshot;
pub use snapshot::{
    MemorySnapshot, MemoryStateLayout, SnapshotLayoutError, SnapshotVersion, HANDLER_INDEX_NONE,
};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
#[cfg(test)]
use tempfile as _;
