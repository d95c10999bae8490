//! The memory-subsystem state object and the physical page-handler table.

use crate::a20::A20Gate;
use crate::addr::{
    MemHandle, PageNum, ISA_HOLE_FIRST_PAGE, ISA_HOLE_LAST_PAGE, PAGES_4GB, PAGE_SHIFT, PAGE_SIZE,
    RESERVED_HANDLE,
};
use crate::backing::HostBacking;
use crate::callout::{CalloutArena, CalloutId, CALLOUT_BUS_COUNT, CALLOUT_POOL_INITIAL};
use crate::config::{MemoryConfig, RamPlan};
use crate::diag::{MemDiag, MemTraceEvent, MemTraceSink};
use crate::error::{MemoryError, Result};
use crate::handler::{DeviceId, DeviceRegistry, HandlerFlags, PageHandler, PagedDevice};

/// One linear-framebuffer window (video RAM or its MMIO block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LfbWindow {
    /// First page of the window; zero when disabled.
    pub start_page: PageNum,
    /// One past the last page of the window.
    pub end_page: PageNum,
    /// Page count; zero when disabled.
    pub pages: u32,
    /// Handler dispatched inside the window.
    pub handler: Option<PageHandler>,
}

impl LfbWindow {
    /// True when `page` falls inside an enabled window.
    #[must_use]
    pub fn contains(&self, page: PageNum) -> bool {
        self.pages != 0 && page >= self.start_page && page < self.end_page
    }
}

/// Fixed-priority framebuffer override consulted before the handler table;
/// pass-through 3D accelerators claim their aperture this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfbOverride {
    /// First page of the override window.
    pub start_page: PageNum,
    /// Page count of the override window.
    pub pages: u32,
    /// Handler dispatched inside the window.
    pub handler: PageHandler,
}

/// ACPI table region: a fixed buffer mirrored across a power-of-two window.
#[derive(Debug)]
pub struct AcpiRegion {
    pub(crate) base: u32,
    pub(crate) region_size: u32,
    pub(crate) buffer: Vec<u8>,
    pub(crate) mapped: bool,
}

/// The guest physical memory subsystem.
///
/// Owns the host backing store, the page-handler table, the bus callout
/// registries, the A20 gate, and the EMS/XMS handle map. The CPU dispatcher
/// holds the only long-lived reference; device modules address it through
/// callout and device handles.
pub struct Memory {
    pub(crate) cfg: MemoryConfig,

    pub(crate) pages: u32,
    pub(crate) reported_pages: u32,
    pub(crate) reported_pages_4gb: u32,
    pub(crate) handler_pages: u32,
    pub(crate) phandlers: Vec<Option<PageHandler>>,
    pub(crate) mhandles: Vec<MemHandle>,
    pub(crate) lfb: LfbWindow,
    pub(crate) lfb_mmio: LfbWindow,
    pub(crate) lfb_override: Option<LfbOverride>,
    pub(crate) a20: A20Gate,
    pub(crate) address_bits: u32,
    pub(crate) alias_pagemask: u32,
    pub(crate) alias_pagemask_active: u32,
    pub(crate) hw_next_assign: u32,

    pub(crate) backing: HostBacking,
    pub(crate) callouts: [CalloutArena; CALLOUT_BUS_COUNT],
    pub(crate) devices: DeviceRegistry,
    pub(crate) acpi: Option<AcpiRegion>,
    pub(crate) lfb_mem_cb: Option<CalloutId>,
    pub(crate) lfb_mmio_cb: Option<CalloutId>,

    pub(crate) diag: MemDiag,
    pub(crate) trace: Option<Box<dyn MemTraceSink>>,
    pub(crate) tlb_flush_pending: bool,
}

impl Memory {
    /// Builds the subsystem: resolves the wired address width, sizes and
    /// maps the host backing, and populates the handler table and handle
    /// map.
    ///
    /// When a memory file is configured but cannot be mapped, initialization
    /// falls back to an anonymous mapping and drops any above-4 GiB RAM.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] when no backing can be mapped at all, or when
    /// the alias mask would cover less than 1 MiB.
    pub fn new(cfg: MemoryConfig) -> Result<Self> {
        let address_bits = cfg.resolved_address_bits();
        let alias_pagemask = cfg.alias_pagemask();
        if alias_pagemask & 0xFF != 0xFF {
            return Err(MemoryError::AliasMaskBelowOneMegabyte(alias_pagemask));
        }

        let mut plan = cfg.ram_plan();
        let backing = Self::map_backing(&cfg, &mut plan)?;

        let handler_pages = PAGES_4GB.min(alias_pagemask + 1);

        let mut phandlers = vec![None; handler_pages as usize];
        let ram_limit = plan.reported_pages.min(handler_pages);
        for slot in phandlers.iter_mut().take(ram_limit as usize) {
            *slot = Some(PageHandler::Ram);
        }
        // The adapter ROM window answers to devices, not system RAM; leave it
        // to the slow path so video and option ROMs can claim it lazily.
        for slot in phandlers
            .iter_mut()
            .take(0x100)
            .skip(0xA0)
        {
            *slot = None;
        }
        if cfg.isa_memory_hole_15mb {
            let last = ISA_HOLE_LAST_PAGE.min(handler_pages.saturating_sub(1));
            for slot in phandlers
                .iter_mut()
                .take(last as usize + 1)
                .skip(ISA_HOLE_FIRST_PAGE as usize)
            {
                *slot = None;
            }
        }

        let mut mhandles = vec![0 as MemHandle; plan.pages as usize];
        if cfg.isa_memory_hole_15mb {
            for handle in mhandles
                .iter_mut()
                .take(ISA_HOLE_LAST_PAGE as usize + 1)
                .skip(ISA_HOLE_FIRST_PAGE as usize)
            {
                *handle = RESERVED_HANDLE;
            }
        }

        let a20 = A20Gate::from_mode(cfg.a20);
        let mut alias_pagemask_active = alias_pagemask;
        if !a20.enabled && !a20.fast_changeable && alias_pagemask & 0x100 != 0 {
            alias_pagemask_active &= !0x100;
        }

        let mut memory = Self {
            pages: plan.pages,
            reported_pages: plan.reported_pages,
            reported_pages_4gb: plan.reported_pages_4gb,
            handler_pages,
            phandlers,
            mhandles,
            lfb: LfbWindow::default(),
            lfb_mmio: LfbWindow::default(),
            lfb_override: None,
            a20,
            address_bits,
            alias_pagemask,
            alias_pagemask_active,
            hw_next_assign: plan.pages << PAGE_SHIFT,
            backing,
            callouts: std::array::from_fn(|_| CalloutArena::new(CALLOUT_POOL_INITIAL)),
            devices: DeviceRegistry::default(),
            acpi: None,
            lfb_mem_cb: None,
            lfb_mmio_cb: None,
            diag: MemDiag::new(),
            trace: None,
            tlb_flush_pending: false,
            cfg,
        };
        memory.fill_initial_ram_pattern();
        memory.acpi_init()?;
        Ok(memory)
    }

    fn map_backing(cfg: &MemoryConfig, plan: &mut RamPlan) -> Result<HostBacking> {
        let mut size = plan.pages as usize * PAGE_SIZE;
        if plan.reported_pages_4gb != 0 {
            let high_end =
                (1u64 << 32) + u64::from(plan.reported_pages_4gb) * PAGE_SIZE as u64;
            match usize::try_from(high_end) {
                Ok(high_end) => size = size.max(high_end),
                Err(_) => plan.reported_pages_4gb = 0,
            }
        }

        if let Some(path) = &cfg.memory_file {
            match HostBacking::file_backed(path, size) {
                Ok(backing) => return Ok(backing),
                Err(_) => {
                    // Safe fallback: anonymous RAM without the high region.
                    plan.reported_pages_4gb = 0;
                }
            }
        }
        HostBacking::anonymous(plan.pages as usize * PAGE_SIZE)
    }

    /// Applies the power-on content pattern: reported RAM zeroed, the unused
    /// tail and the adapter ROM window floating (`0xFF`), and the BIOS range
    /// `0xF0000..0xFFFFF` zeroed for the ROM image loader.
    fn fill_initial_ram_pattern(&mut self) {
        let reported = self.reported_pages as usize * PAGE_SIZE;
        let pages = self.pages as usize * PAGE_SIZE;
        let zeroed = self.backing.starts_zeroed();
        let ram = self.backing.as_mut_slice();

        if !zeroed {
            ram[..reported].fill(0);
        }
        if reported < pages {
            ram[reported..pages].fill(0xFF);
        }
        ram[0xA0000..0x100000].fill(0xFF);
        ram[0xF0000..0x100000].fill(0);
    }

    /// Configuration the subsystem was built with.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.cfg
    }

    /// Usable backing pages below 4 GiB.
    #[must_use]
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Pages disclosed to the guest OS below 4 GiB.
    #[must_use]
    pub fn reported_pages(&self) -> u32 {
        self.reported_pages
    }

    /// Pages disclosed to the guest OS above 4 GiB.
    #[must_use]
    pub fn reported_pages_4gb(&self) -> u32 {
        self.reported_pages_4gb
    }

    /// Size of the handler table in pages.
    #[must_use]
    pub fn handler_pages(&self) -> u32 {
        self.handler_pages
    }

    /// Wired address-bit count.
    #[must_use]
    pub fn address_bits(&self) -> u32 {
        self.address_bits
    }

    /// Address bits clamped to 32 for callers that cannot go wider.
    #[must_use]
    pub fn address_bits_4gb(&self) -> u32 {
        self.address_bits.min(32)
    }

    /// Full alias page mask for the wired address bits.
    #[must_use]
    pub fn alias_pagemask(&self) -> u32 {
        self.alias_pagemask
    }

    /// Alias page mask with the A20 bit folded in.
    #[must_use]
    pub fn alias_pagemask_active(&self) -> u32 {
        self.alias_pagemask_active
    }

    /// Diagnostics counters.
    #[must_use]
    pub fn diag(&self) -> &MemDiag {
        &self.diag
    }

    /// Clears the diagnostics counters.
    pub fn reset_diag(&mut self) {
        self.diag.reset();
    }

    /// Installs a trace sink receiving structural events.
    pub fn set_trace_sink(&mut self, sink: Box<dyn MemTraceSink>) {
        self.trace = Some(sink);
    }

    /// Removes and returns the installed trace sink.
    pub fn take_trace_sink(&mut self) -> Option<Box<dyn MemTraceSink>> {
        self.trace.take()
    }

    pub(crate) fn emit(&mut self, event: MemTraceEvent) {
        if let Some(sink) = self.trace.as_mut() {
            sink.on_event(event);
        }
    }

    /// True when a structural change invalidated cached CPU translations.
    #[must_use]
    pub fn tlb_flush_pending(&self) -> bool {
        self.tlb_flush_pending
    }

    /// Consumes the pending-flush flag; the CPU dispatcher calls this
    /// between instructions and clears its TLB when it returns true.
    pub fn take_tlb_flush(&mut self) -> bool {
        std::mem::take(&mut self.tlb_flush_pending)
    }

    pub(crate) fn request_tlb_flush(&mut self) {
        self.tlb_flush_pending = true;
    }

    /// Registers a device page handler and returns its handle.
    pub fn register_device(&mut self, device: Box<dyn PagedDevice>) -> DeviceId {
        self.devices.register(device)
    }

    /// Unregisters a device; any handler-table entries still naming it must
    /// be invalidated or remapped by the caller beforehand.
    pub fn unregister_device(&mut self, id: DeviceId) -> Option<Box<dyn PagedDevice>> {
        self.devices.unregister(id)
    }

    /// Capability flags for a handler; unknown device handles report empty.
    #[must_use]
    pub fn handler_flags(&self, handler: PageHandler) -> HandlerFlags {
        match handler.stock_flags() {
            Some(flags) => flags,
            None => match handler {
                PageHandler::Device(id) => self
                    .devices
                    .get(id)
                    .map_or(HandlerFlags::EMPTY, PagedDevice::flags),
                _ => HandlerFlags::EMPTY,
            },
        }
    }

    /// Resolves the handler for a physical page. Never fails: pages beyond
    /// every mapping resolve to [`PageHandler::Illegal`].
    pub fn get_handler(&mut self, ppn: PageNum) -> PageHandler {
        let page = ppn & self.alias_pagemask_active;

        if let Some(window) = self.lfb_override {
            if page >= window.start_page && page < window.start_page + window.pages {
                return window.handler;
            }
        }

        if page < self.handler_pages {
            if let Some(handler) = self.phandlers[page as usize] {
                return handler;
            }
            return self.slow_path(page);
        }

        if page >= PAGES_4GB && page < PAGES_4GB + self.reported_pages_4gb {
            return PageHandler::Mem4Gb;
        }

        PageHandler::Illegal
    }

    /// Installs or replaces the fixed-priority framebuffer override window.
    pub fn set_lfb_override(&mut self, window: Option<LfbOverride>) {
        self.lfb_override = window;
        self.request_tlb_flush();
    }

    /// Installs `handler` on `count` pages starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] when the range
    /// exceeds the handler table.
    pub fn set_page_handler(
        &mut self,
        start: PageNum,
        count: u32,
        handler: PageHandler,
    ) -> Result<()> {
        let range = self.checked_range(start, count)?;
        for slot in &mut self.phandlers[range] {
            *slot = Some(handler);
        }
        self.request_tlb_flush();
        Ok(())
    }

    /// Restores `count` pages starting at `start` to system RAM.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] when the range
    /// exceeds the handler table.
    pub fn reset_page_handler_ram(&mut self, start: PageNum, count: u32) -> Result<()> {
        self.set_page_handler(start, count, PageHandler::Ram)
    }

    /// Restores `count` pages starting at `start` to open bus.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] when the range
    /// exceeds the handler table.
    pub fn reset_page_handler_unmapped(&mut self, start: PageNum, count: u32) -> Result<()> {
        self.set_page_handler(start, count, PageHandler::Unmapped)
    }

    /// Forgets cached handlers so the next access re-runs bus arbitration.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] when the range
    /// exceeds the handler table.
    pub fn invalidate_cached_handlers(&mut self, start: PageNum, count: u32) -> Result<()> {
        let range = self.checked_range(start, count)?;
        for slot in &mut self.phandlers[range] {
            *slot = None;
        }
        self.request_tlb_flush();
        Ok(())
    }

    fn checked_range(&self, start: PageNum, count: u32) -> Result<std::ops::Range<usize>> {
        let end = u64::from(start) + u64::from(count);
        if end > u64::from(self.handler_pages) {
            return Err(MemoryError::RangeOutsideHandlerTable {
                start,
                end: end.saturating_sub(1) as PageNum,
                limit: self.handler_pages,
            });
        }
        Ok(start as usize..end as usize)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.pages)
            .field("reported_pages", &self.reported_pages)
            .field("reported_pages_4gb", &self.reported_pages_4gb)
            .field("handler_pages", &self.handler_pages)
            .field("address_bits", &self.address_bits)
            .field("alias_pagemask", &self.alias_pagemask)
            .field("alias_pagemask_active", &self.alias_pagemask_active)
            .field("a20", &self.a20)
            .field("lfb", &self.lfb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{LfbOverride, Memory};
    use crate::addr::PhysAddr;
    use crate::config::MemoryConfig;
    use crate::handler::{PageHandler, PagedDevice};

    struct StubDevice;

    impl PagedDevice for StubDevice {
        fn read_b(&mut self, _addr: PhysAddr) -> u8 {
            0x42
        }

        fn write_b(&mut self, _addr: PhysAddr, _val: u8) {}
    }

    fn megs(mib: u32) -> Memory {
        Memory::new(MemoryConfig {
            memsize_mib: mib,
            ..MemoryConfig::default()
        })
        .expect("memory init")
    }

    #[test]
    fn init_reports_the_configured_ram_and_covers_4gb_of_handlers() {
        let mem = megs(16);
        assert_eq!(mem.reported_pages(), 16 * 256);
        assert_eq!(mem.pages(), 16 * 256);
        assert_eq!(mem.handler_pages(), 1 << 20);
        assert!(mem.reported_pages() <= mem.pages());
        assert!(mem.pages() <= mem.handler_pages());
    }

    #[test]
    fn system_ram_pages_start_cached_and_adapter_rom_window_does_not() {
        let mut mem = megs(16);
        assert_eq!(mem.phandlers[0x50], Some(PageHandler::Ram));
        for page in 0xA0..0x100 {
            assert_eq!(mem.phandlers[page], None, "page {page:#x}");
        }
        // Below reported RAM the slow path falls back to RAM and records
        // the anomaly; a VGA callout would normally have claimed the page.
        assert_eq!(mem.get_handler(0xA0), PageHandler::Ram);
        assert_eq!(mem.diag().slow_path_ram_hits, 1);
    }

    #[test]
    fn adapter_window_past_reported_ram_resolves_to_open_bus() {
        let mut mem = Memory::new(MemoryConfig {
            memsize_mib: 0,
            memsize_kb: 640,
            ..MemoryConfig::default()
        })
        .expect("memory init");
        assert_eq!(mem.get_handler(0xA0), PageHandler::Unmapped);
        assert_eq!(mem.diag().slow_path_ram_hits, 0);
    }

    #[test]
    fn initial_ram_pattern_matches_floating_bus_convention() {
        let mem = Memory::new(MemoryConfig {
            memsize_mib: 0,
            memsize_kb: 640,
            ..MemoryConfig::default()
        })
        .expect("memory init");
        let ram = mem.backing.as_slice();
        assert_eq!(ram[0x00000], 0x00);
        assert_eq!(ram[0x9FFFF], 0x00);
        assert_eq!(ram[0xA0000], 0xFF);
        assert_eq!(ram[0xEFFFF], 0xFF);
        assert_eq!(ram[0xF0000], 0x00);
        assert_eq!(ram[0xFFFFF], 0x00);
    }

    #[test]
    fn every_page_below_the_handler_limit_resolves_to_a_handler() {
        let mut mem = megs(4);
        for page in [0u32, 0x9F, 0xA0, 0xFF, 0x3FF, 0x400, 0xF_FFFF] {
            // No panic, and a concrete variant comes back.
            let _ = mem.get_handler(page);
        }
        // On a 32-bit machine everything aliases into the table; a wider
        // machine exposes the illegal region above it.
        assert_eq!(mem.get_handler(0x10_0000), PageHandler::Ram);

        let mut wide = Memory::new(MemoryConfig {
            memsize_mib: 4,
            address_bits: 36,
            ..MemoryConfig::default()
        })
        .expect("memory init");
        assert_eq!(wide.get_handler(0x10_0000), PageHandler::Illegal);
    }

    #[test]
    fn bulk_table_updates_raise_the_flush_flag_and_bounds_are_enforced() {
        let mut mem = megs(4);
        let _ = mem.take_tlb_flush();

        mem.set_page_handler(0xC0, 4, PageHandler::Unmapped)
            .expect("in range");
        assert!(mem.take_tlb_flush());
        assert_eq!(mem.get_handler(0xC2), PageHandler::Unmapped);

        mem.invalidate_cached_handlers(0xC0, 4).expect("in range");
        assert!(mem.take_tlb_flush());

        assert!(mem.set_page_handler(0xF_FFFF, 2, PageHandler::Ram).is_err());
    }

    #[test]
    fn lfb_override_window_wins_over_the_table() {
        let mut mem = megs(4);
        let id = mem.register_device(Box::new(StubDevice));
        mem.set_lfb_override(Some(LfbOverride {
            start_page: 0x50,
            pages: 2,
            handler: PageHandler::Device(id),
        }));
        assert_eq!(mem.get_handler(0x50), PageHandler::Device(id));
        assert_eq!(mem.get_handler(0x52), PageHandler::Ram);

        mem.set_lfb_override(None);
        assert_eq!(mem.get_handler(0x50), PageHandler::Ram);
    }

    #[test]
    fn isa_hole_pages_are_reserved_in_the_handle_map() {
        let mem = Memory::new(MemoryConfig {
            memsize_mib: 24,
            isa_memory_hole_15mb: true,
            ..MemoryConfig::default()
        })
        .expect("memory init");
        assert_eq!(mem.mhandles[0xF00], crate::addr::RESERVED_HANDLE);
        assert_eq!(mem.mhandles[0xFFF], crate::addr::RESERVED_HANDLE);
        assert_eq!(mem.mhandles[0xEFF], 0);
        assert_eq!(mem.phandlers[0xF00], None);
    }
}
