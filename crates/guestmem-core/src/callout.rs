//! Bus callout registries and the slow-path arbitration they feed.
//!
//! Devices claim physical pages lazily: a callout records `(base page, page
//! mask)` and a resolver; the first access to an uncached page walks the
//! motherboard, PCI, and ISA registries in that order and caches the winner
//! in the handler table.

use crate::addr::{PageNum, ISA_HOLE_FIRST_PAGE, ISA_HOLE_LAST_PAGE, PAGEMASK_FULL};
use crate::diag::MemTraceEvent;
use crate::error::{MemoryError, Result};
use crate::handler::PageHandler;
use crate::memory::Memory;

/// Number of callout bus types.
pub const CALLOUT_BUS_COUNT: usize = 3;

/// Initial slot count of each per-bus pool.
pub const CALLOUT_POOL_INITIAL: usize = 64;

/// Hard ceiling on per-bus pool growth.
pub const CALLOUT_POOL_MAX: usize = 4096;

/// Bus a callout belongs to; arbitration order is motherboard, then PCI,
/// then ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusType {
    /// Motherboard resources: ROM BIOS, chipset windows.
    Motherboard,
    /// PCI bus devices and the PCI/ISA bridge.
    Pci,
    /// ISA bus devices.
    Isa,
}

impl BusType {
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Motherboard => 0,
            Self::Pci => 1,
            Self::Isa => 2,
        }
    }

    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Motherboard => "motherboard",
            Self::Pci => "pci",
            Self::Isa => "isa",
        }
    }
}

/// Handle naming one callout slot; encodes `(bus, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalloutId {
    pub(crate) bus: BusType,
    pub(crate) index: u32,
}

impl CalloutId {
    /// Bus this handle belongs to.
    #[must_use]
    pub const fn bus(self) -> BusType {
        self.bus
    }
}

/// How an installed callout answers "do you own this page".
///
/// Resolvers that need live subsystem state (the movable framebuffer and
/// ACPI windows) are tagged variants resolved inside the slow path; external
/// devices with fixed claims use `Fixed`, and `Func` covers custom decode
/// logic that depends only on the page number.
#[derive(Debug, Clone, Copy)]
pub enum CalloutResolver {
    /// The callout always serves its matched range with this handler.
    Fixed(PageHandler),
    /// Resolve against the current LFB and LFB-MMIO windows.
    LfbWindow,
    /// Resolve against the current ACPI window.
    AcpiWindow,
    /// Custom page-number-only decode.
    Func(fn(PageNum) -> Option<PageHandler>),
}

/// One slot in a per-bus callout pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalloutObject {
    pub(crate) allocated: bool,
    pub(crate) installed: bool,
    pub(crate) base_page: PageNum,
    pub(crate) mem_mask: u32,
    pub(crate) range_mask: u32,
    pub(crate) alias_mask: u32,
    pub(crate) resolver: Option<CalloutResolver>,
}

impl CalloutObject {
    /// True when this callout is installed and decodes `page`.
    #[must_use]
    pub fn matches_page(&self, page: PageNum) -> bool {
        self.installed && (page & self.mem_mask) == self.base_page
    }

    /// True once `install` succeeded and until `uninstall`.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Base page of the installed decode.
    #[must_use]
    pub fn base_page(&self) -> PageNum {
        self.base_page
    }

    /// Full decode mask of the installed decode.
    #[must_use]
    pub fn mem_mask(&self) -> u32 {
        self.mem_mask
    }

    /// Low mask covering the claimed range width.
    #[must_use]
    pub fn range_mask(&self) -> u32 {
        self.range_mask
    }

    /// Mask covering one alias period of the decode.
    #[must_use]
    pub fn alias_mask(&self) -> u32 {
        self.alias_mask
    }
}

/// Index-stable pool of callout slots with a free-list cursor.
#[derive(Debug)]
pub struct CalloutArena {
    pub(crate) slots: Vec<CalloutObject>,
    alloc_from: usize,
}

impl CalloutArena {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: vec![CalloutObject::default(); capacity],
            alloc_from: 0,
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        while self.alloc_from < self.slots.len() {
            let index = self.alloc_from;
            if !self.slots[index].allocated {
                self.slots[index].allocated = true;
                self.alloc_from = index + 1;
                return Some(index as u32);
            }
            self.alloc_from += 1;
        }
        if self.slots.len() < CALLOUT_POOL_MAX {
            self.alloc_from = self.slots.len();
            let grown = (self.slots.len() * 2).min(CALLOUT_POOL_MAX);
            self.slots.resize(grown, CalloutObject::default());
            return self.allocate();
        }
        None
    }

    fn free(&mut self, index: u32) -> bool {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return false;
        };
        if !slot.allocated {
            return false;
        }
        *slot = CalloutObject::default();
        if self.alloc_from > index as usize {
            self.alloc_from = index as usize;
        }
        true
    }
}

/// Splits a callout page mask into its range and alias parts.
///
/// A valid mask reads, MSB to LSB: zero or more clear bits, one or more set
/// bits, zero or more clear bits. The low clear bits become the range mask
/// (claimed width) and the set bits extend it into the alias mask (decode
/// period).
pub(crate) fn decompose_page_mask(
    base_page: PageNum,
    mem_mask: u32,
) -> std::result::Result<(u32, u32), &'static str> {
    if mem_mask == 0 || mem_mask & !PAGEMASK_FULL != 0 {
        return Err("page mask outside the supported width");
    }

    let mut m: u32 = 1;
    let mut range_mask: u32 = 0;
    let test = mem_mask ^ PAGEMASK_FULL;
    while test & m == m {
        range_mask = m;
        m = (m << 1) | 1;
    }
    if mem_mask & range_mask != 0 || range_mask.wrapping_add(1) & range_mask != 0 {
        return Err("page mask and range mask overlap");
    }

    let mut alias_mask = range_mask;
    let test = mem_mask + range_mask;
    while test & m == m {
        alias_mask = m;
        m = (m << 1) | 1;
    }
    if mem_mask ^ range_mask ^ alias_mask != 0 || alias_mask.wrapping_add(1) & alias_mask != 0 {
        return Err("page mask decode bits are not contiguous");
    }

    if base_page & range_mask != 0 {
        return Err("base page not aligned to the claimed range");
    }

    Ok((range_mask, alias_mask))
}

impl Memory {
    /// Allocates a callout slot on `bus`; the pool doubles on demand up to
    /// its ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CalloutPoolExhausted`] at the ceiling.
    pub fn allocate_callout(&mut self, bus: BusType) -> Result<CalloutId> {
        match self.callouts[bus.index()].allocate() {
            Some(index) => Ok(CalloutId { bus, index }),
            None => Err(MemoryError::CalloutPoolExhausted(bus.name())),
        }
    }

    /// Frees a callout slot, uninstalling it first when needed.
    pub fn free_callout(&mut self, id: CalloutId) {
        if self
            .callout(id)
            .is_some_and(CalloutObject::is_installed)
        {
            self.uninstall_callout(id);
        }
        self.callouts[id.bus.index()].free(id.index);
    }

    /// Borrows a callout slot for inspection.
    #[must_use]
    pub fn callout(&self, id: CalloutId) -> Option<&CalloutObject> {
        let slot = self.callouts[id.bus.index()].slots.get(id.index as usize)?;
        slot.allocated.then_some(slot)
    }

    /// Installs a callout: validates the page mask, records the decode, and
    /// reverts every aliased page of the claim to the slow path. Installing
    /// an already-installed callout is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::StaleCalloutHandle`] for a handle that names no
    /// allocated slot and [`MemoryError::InvalidCalloutMask`] when mask
    /// validation fails; failed installs change no state.
    pub fn install_callout(
        &mut self,
        id: CalloutId,
        base_page: PageNum,
        mem_mask: u32,
        resolver: CalloutResolver,
    ) -> Result<()> {
        {
            let Some(slot) = self.callouts[id.bus.index()].slots.get(id.index as usize) else {
                return Err(MemoryError::StaleCalloutHandle);
            };
            if !slot.allocated {
                return Err(MemoryError::StaleCalloutHandle);
            }
            if slot.installed {
                return Ok(());
            }
        }

        let (range_mask, alias_mask) = match decompose_page_mask(base_page, mem_mask) {
            Ok(parts) => parts,
            Err(reason) => {
                self.diag.record_callout_reject();
                return Err(MemoryError::InvalidCalloutMask {
                    base_page,
                    mem_mask,
                    reason,
                });
            }
        };

        {
            let slot = &mut self.callouts[id.bus.index()].slots[id.index as usize];
            slot.installed = true;
            slot.base_page = base_page;
            slot.mem_mask = mem_mask;
            slot.range_mask = range_mask;
            slot.alias_mask = alias_mask;
            slot.resolver = Some(resolver);
        }

        self.emit(MemTraceEvent::CalloutInstalled {
            base_page,
            mem_mask,
        });
        self.invalidate_callout_pages(base_page, range_mask, alias_mask);
        Ok(())
    }

    /// Uninstalls a callout, reverting its claimed pages to the slow path.
    pub fn uninstall_callout(&mut self, id: CalloutId) {
        let Some(slot) = self.callouts[id.bus.index()].slots.get_mut(id.index as usize) else {
            return;
        };
        if !slot.allocated || !slot.installed {
            return;
        }
        let (base, range_mask, alias_mask) = (slot.base_page, slot.range_mask, slot.alias_mask);
        slot.installed = false;
        slot.resolver = None;
        self.invalidate_callout_pages(base, range_mask, alias_mask);
    }

    /// Nulls the cached handler for the claimed range and every alias of it.
    fn invalidate_callout_pages(&mut self, base: PageNum, range_mask: u32, alias_mask: u32) {
        let width = u64::from(range_mask) + 1;
        let step = u64::from(alias_mask) + 1;
        let mut page = u64::from(base);
        while page < u64::from(self.handler_pages) {
            let count = width.min(u64::from(self.handler_pages) - page) as u32;
            // In range by construction.
            let _ = self.invalidate_cached_handlers(page as PageNum, count);
            page += step;
        }
        self.request_tlb_flush();
    }

    /// Bus arbitration for a page with no cached handler.
    ///
    /// Pages inside reported RAM default to the RAM handler (recorded as an
    /// anomaly unless they sit in the ISA 15 MiB hole); everything else
    /// defaults to open bus. Motherboard callouts are consulted first; when
    /// none claim the page, PCI and then ISA get a turn. The result is
    /// cached unless more than one device claimed the page, so genuine
    /// conflicts keep re-arbitrating per access.
    pub(crate) fn slow_path(&mut self, page: PageNum) -> PageHandler {
        let mut handler = PageHandler::Unmapped;

        if page < self.reported_pages {
            let in_hole = self.cfg.isa_memory_hole_15mb
                && (ISA_HOLE_FIRST_PAGE..=ISA_HOLE_LAST_PAGE).contains(&page);
            if !in_hole {
                // System RAM normally never reaches the slow path.
                self.diag.record_slow_path_ram_hit();
                handler = PageHandler::Ram;
            }
        }

        let mut matches = self.run_bus_callouts(BusType::Motherboard, page, &mut handler);
        if matches == 0 {
            if self.cfg.pcibus_enable {
                matches = self.run_bus_callouts(BusType::Pci, page, &mut handler);
                if matches == 0 {
                    matches = self.run_bus_callouts(BusType::Isa, page, &mut handler);
                }
            } else {
                matches = self.run_bus_callouts(BusType::Isa, page, &mut handler);
            }
        }

        self.emit(MemTraceEvent::SlowPathResolved { page, matches });
        if matches <= 1 {
            self.phandlers[page as usize] = Some(handler);
        } else {
            self.diag.record_device_conflict();
        }
        handler
    }

    fn run_bus_callouts(&mut self, bus: BusType, page: PageNum, handler: &mut PageHandler) -> u32 {
        let mut matches = 0u32;
        for index in 0..self.callouts[bus.index()].slots.len() {
            let resolver = {
                let slot = &self.callouts[bus.index()].slots[index];
                if !slot.matches_page(page) {
                    continue;
                }
                match slot.resolver {
                    Some(resolver) => resolver,
                    None => continue,
                }
            };
            if let Some(resolved) = self.resolve_callout(resolver, page) {
                if matches == 0 {
                    *handler = resolved;
                    matches = 1;
                } else {
                    // Conflict: leave the first winner, report both.
                    matches += 1;
                    break;
                }
            }
        }
        matches
    }

    fn resolve_callout(&self, resolver: CalloutResolver, page: PageNum) -> Option<PageHandler> {
        match resolver {
            CalloutResolver::Fixed(handler) => Some(handler),
            CalloutResolver::Func(f) => f(page),
            CalloutResolver::LfbWindow => {
                if self.lfb.start_page == 0 || self.lfb.pages == 0 {
                    return None;
                }
                if self.lfb.contains(page) {
                    return self.lfb.handler;
                }
                if self.lfb_mmio.contains(page) {
                    return self.lfb_mmio.handler;
                }
                None
            }
            CalloutResolver::AcpiWindow => {
                let acpi = self.acpi.as_ref()?;
                if acpi.region_size == 0 || acpi.buffer.is_empty() {
                    return None;
                }
                let first = acpi.base >> 12;
                let count = acpi.region_size >> 12;
                (page >= first && page < first + count).then_some(PageHandler::Acpi)
            }
        }
    }
}
