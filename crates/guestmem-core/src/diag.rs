//! Deterministic diagnostics counters and the structural trace hook.

use crate::addr::{PageNum, PhysAddr};

/// Illegal-access trace events stop being emitted past this count; the
/// counters keep incrementing so totals stay accurate.
pub const ILLEGAL_TRACE_CAP: u32 = 1000;

/// Saturating counters recording recoverable memory-subsystem anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemDiag {
    /// Writes dropped by ROM pages (excluding the silent PC-98 window).
    pub denied_rom_writes: u32,
    /// Reads served `0xFF` by the illegal handler.
    pub illegal_reads: u32,
    /// Writes dropped by the illegal handler.
    pub illegal_writes: u32,
    /// Slow-path resolutions that landed inside reported system RAM.
    pub slow_path_ram_hits: u32,
    /// Callout installs rejected by page-mask validation.
    pub callout_rejects: u32,
    /// Slow-path resolutions where more than one device claimed the page.
    pub device_conflicts: u32,
    /// Mapping requests with unaligned byte bounds (accepted after rounding).
    pub unaligned_map_requests: u32,
}

impl MemDiag {
    /// Creates a zeroed counter block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_denied_rom_write(&mut self) {
        self.denied_rom_writes = self.denied_rom_writes.saturating_add(1);
    }

    pub(crate) fn record_illegal_read(&mut self) -> bool {
        self.illegal_reads = self.illegal_reads.saturating_add(1);
        self.illegal_reads <= ILLEGAL_TRACE_CAP
    }

    pub(crate) fn record_illegal_write(&mut self) -> bool {
        self.illegal_writes = self.illegal_writes.saturating_add(1);
        self.illegal_writes <= ILLEGAL_TRACE_CAP
    }

    pub(crate) fn record_slow_path_ram_hit(&mut self) {
        self.slow_path_ram_hits = self.slow_path_ram_hits.saturating_add(1);
    }

    pub(crate) fn record_callout_reject(&mut self) {
        self.callout_rejects = self.callout_rejects.saturating_add(1);
    }

    pub(crate) fn record_device_conflict(&mut self) {
        self.device_conflicts = self.device_conflicts.saturating_add(1);
    }

    pub(crate) fn record_unaligned_map_request(&mut self) {
        self.unaligned_map_requests = self.unaligned_map_requests.saturating_add(1);
    }

    /// Resets all counters to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Structural events emitted by the memory subsystem in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTraceEvent {
    /// A ROM page dropped a guest write.
    RomWriteDenied {
        /// Physical address of the dropped write.
        addr: PhysAddr,
        /// Value the guest attempted to store.
        value: u32,
    },
    /// The illegal handler served an out-of-range access.
    IllegalAccess {
        /// Physical address of the access.
        addr: PhysAddr,
        /// True for writes, false for reads.
        is_write: bool,
    },
    /// The slow path resolved a page and reports how many devices claimed it.
    SlowPathResolved {
        /// Page that was resolved.
        page: PageNum,
        /// Number of devices that claimed the page.
        matches: u32,
    },
    /// A callout install passed validation and claimed its range.
    CalloutInstalled {
        /// Base page of the install.
        base_page: PageNum,
        /// Full decode mask of the install.
        mem_mask: u32,
    },
    /// The A20 gate line changed state.
    A20Changed {
        /// New gate state.
        enabled: bool,
    },
    /// The linear framebuffer window moved or was disabled.
    LfbMoved {
        /// First page of the new window, zero when disabled.
        start_page: PageNum,
        /// Page count of the new window, zero when disabled.
        pages: u32,
    },
    /// Reported RAM was capped to make room for a ROM at the top.
    RamCut {
        /// New reported page count.
        reported_pages: u32,
    },
    /// The hardware auto-assigner handed out a physical base address.
    HardwareAssigned {
        /// Assigned base address.
        base: u32,
        /// Size of the assigned window in bytes.
        size: u32,
    },
}

/// Sink trait receiving [`MemTraceEvent`] values in execution order.
///
/// The subsystem works without a sink; install one to observe structural
/// changes and denied accesses during debugging or conformance runs.
pub trait MemTraceSink {
    /// Records one event.
    fn on_event(&mut self, event: MemTraceEvent);
}

/// Trace sink that retains every event, for tests and debugging.
#[derive(Debug, Default)]
pub struct RecordingTraceSink {
    /// Events in emission order.
    pub events: Vec<MemTraceEvent>,
}

impl MemTraceSink for RecordingTraceSink {
    fn on_event(&mut self, event: MemTraceEvent) {
        self.events.push(event);
    }
}

// Shared sinks let the installer keep a handle for inspection while the
// subsystem owns the other.
impl<T: MemTraceSink> MemTraceSink for std::rc::Rc<std::cell::RefCell<T>> {
    fn on_event(&mut self, event: MemTraceEvent) {
        self.borrow_mut().on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{MemDiag, MemTraceEvent, MemTraceSink, RecordingTraceSink, ILLEGAL_TRACE_CAP};

    #[test]
    fn counters_saturate_instead_of_wrapping() {
        let mut diag = MemDiag::new();
        diag.denied_rom_writes = u32::MAX;
        diag.record_denied_rom_write();
        assert_eq!(diag.denied_rom_writes, u32::MAX);
    }

    #[test]
    fn illegal_trace_emission_stops_at_the_cap() {
        let mut diag = MemDiag::new();
        diag.illegal_reads = ILLEGAL_TRACE_CAP - 1;
        assert!(diag.record_illegal_read());
        assert!(!diag.record_illegal_read());
        assert_eq!(diag.illegal_reads, ILLEGAL_TRACE_CAP + 1);
    }

    #[test]
    fn recording_sink_preserves_emission_order() {
        let mut sink = RecordingTraceSink::default();
        sink.on_event(MemTraceEvent::A20Changed { enabled: true });
        sink.on_event(MemTraceEvent::A20Changed { enabled: false });
        assert_eq!(
            sink.events,
            vec![
                MemTraceEvent::A20Changed { enabled: true },
                MemTraceEvent::A20Changed { enabled: false },
            ]
        );
    }

    #[test]
    fn reset_zeroes_every_counter() {
        let mut diag = MemDiag::new();
        diag.record_callout_reject();
        diag.record_device_conflict();
        diag.record_slow_path_ram_hit();
        diag.reset();
        assert_eq!(diag, MemDiag::new());
    }
}
