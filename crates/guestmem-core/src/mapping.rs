//! Memory-mapping bookkeeping: RAM/ROM range installs, the linear
//! framebuffer, the hardware-address auto-assigner, and the ACPI window.

use crate::addr::{next_power_of_two_pages, pagemask_combine, pagemask_range, PageNum, PAGEMASK_FULL, PAGE_SHIFT};
use crate::callout::{BusType, CalloutId, CalloutResolver};
use crate::config::MachineKind;
use crate::diag::MemTraceEvent;
use crate::error::{MemoryError, Result};
use crate::handler::PageHandler;
use crate::memory::{AcpiRegion, LfbWindow, Memory};

/// Byte distance from the LFB base to its MMIO block, fixed by the SVGA
/// chipset register layout.
pub const LFB_MMIO_OFFSET: u32 = 0x0100_0000;

/// Page count of the LFB MMIO block.
pub const LFB_MMIO_PAGES: u32 = 16;

impl Memory {
    fn map_page_bounds(&mut self, start: u32, end: u32) -> Result<(PageNum, PageNum)> {
        if start & 0xFFF != 0 || end & 0xFFF != 0xFFF {
            self.diag.record_unaligned_map_request();
        }
        let first = start >> PAGE_SHIFT;
        let last = end >> PAGE_SHIFT;
        if first >= self.handler_pages || last >= self.handler_pages {
            return Err(MemoryError::RangeOutsideHandlerTable {
                start: first,
                end: last,
                limit: self.handler_pages,
            });
        }
        Ok((first, last))
    }

    /// Unmaps a byte range: accesses read `0xFF` and writes drop.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] when the range lies
    /// beyond the handler table.
    pub fn unmap_physmem(&mut self, start: u32, end: u32) -> Result<()> {
        let (first, last) = self.map_page_bounds(start, end)?;
        for slot in &mut self.phandlers[first as usize..=last as usize] {
            *slot = Some(PageHandler::Unmapped);
        }
        self.request_tlb_flush();
        Ok(())
    }

    fn map_range_checked(
        &mut self,
        start: u32,
        end: u32,
        target: PageHandler,
        also_allowed: Option<PageHandler>,
    ) -> Result<()> {
        let (first, last) = self.map_page_bounds(start, end)?;
        for page in first..=last {
            match self.phandlers[page as usize] {
                None | Some(PageHandler::Illegal) | Some(PageHandler::Unmapped) => {}
                Some(existing) if existing == target => {}
                Some(existing) if Some(existing) == also_allowed => {}
                Some(_) => return Err(MemoryError::MappingConflict(page)),
            }
        }
        for slot in &mut self.phandlers[first as usize..=last as usize] {
            *slot = Some(target);
        }
        self.request_tlb_flush();
        Ok(())
    }

    /// Maps a byte range as system RAM; refuses to displace device handlers.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] or
    /// [`MemoryError::MappingConflict`].
    pub fn map_ram_physmem(&mut self, start: u32, end: u32) -> Result<()> {
        self.map_range_checked(start, end, PageHandler::Ram, None)
    }

    /// Maps a byte range as ROM; refuses to displace device handlers.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] or
    /// [`MemoryError::MappingConflict`].
    pub fn map_rom_physmem(&mut self, start: u32, end: u32) -> Result<()> {
        self.map_range_checked(start, end, PageHandler::Rom, None)
    }

    /// Maps a byte range as the ROM alias mirroring the top of the 1 MiB
    /// window.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] or
    /// [`MemoryError::MappingConflict`].
    pub fn map_rom_alias_physmem(&mut self, start: u32, end: u32) -> Result<()> {
        self.map_range_checked(start, end, PageHandler::RomAlias, None)
    }

    /// Current linear framebuffer window.
    #[must_use]
    pub fn lfb_window(&self) -> LfbWindow {
        self.lfb
    }

    /// Current LFB MMIO window.
    #[must_use]
    pub fn lfb_mmio_window(&self) -> LfbWindow {
        self.lfb_mmio
    }

    /// Moves, installs, or disables the linear framebuffer.
    ///
    /// The video RAM window covers `pages` pages at `page`; when an MMIO
    /// handler is given, its block sits 16 MiB above the LFB base and spans
    /// 16 pages. Both windows are claimed through callouts on the PCI bus
    /// when one is present, the ISA bus otherwise, rounded up to a power of
    /// two. Passing a zero page or page count tears the windows down.
    /// Repeating the current assignment is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] when no callout slot can be claimed or the
    /// window install fails validation.
    pub fn set_lfb(
        &mut self,
        page: PageNum,
        pages: u32,
        handler: Option<PageHandler>,
        mmio_handler: Option<PageHandler>,
    ) -> Result<()> {
        if page == self.lfb.start_page
            && self.lfb.end_page == page + pages
            && self.lfb.pages == pages
            && self.lfb.handler == handler
            && self.lfb_mmio.handler == mmio_handler
        {
            return Ok(());
        }

        self.lfb.handler = handler;
        if handler.is_some() {
            self.lfb.start_page = page;
            self.lfb.end_page = page + pages;
            self.lfb.pages = pages;
        } else {
            self.lfb = LfbWindow::default();
        }

        self.lfb_mmio.handler = mmio_handler;
        if mmio_handler.is_some() {
            let mmio_start = page + (LFB_MMIO_OFFSET >> PAGE_SHIFT);
            self.lfb_mmio.start_page = mmio_start;
            self.lfb_mmio.end_page = mmio_start + LFB_MMIO_PAGES;
            self.lfb_mmio.pages = LFB_MMIO_PAGES;
        } else {
            self.lfb_mmio = LfbWindow::default();
        }

        if pages == 0 || page == 0 {
            self.free_lfb_callouts();
            self.emit(MemTraceEvent::LfbMoved {
                start_page: 0,
                pages: 0,
            });
        } else {
            self.install_lfb_callouts()?;
            self.emit(MemTraceEvent::LfbMoved {
                start_page: page,
                pages,
            });
        }

        self.request_tlb_flush();
        Ok(())
    }

    fn free_lfb_callouts(&mut self) {
        if let Some(id) = self.lfb_mem_cb.take() {
            self.free_callout(id);
        }
        if let Some(id) = self.lfb_mmio_cb.take() {
            self.free_callout(id);
        }
    }

    fn install_lfb_callouts(&mut self) -> Result<()> {
        let bus = if self.cfg.pcibus_enable {
            BusType::Pci
        } else {
            BusType::Isa
        };

        let mem_cb = match self.lfb_mem_cb {
            Some(id) => id,
            None => {
                let id = self.allocate_callout(bus)?;
                self.lfb_mem_cb = Some(id);
                id
            }
        };
        let mmio_cb = match self.lfb_mmio_cb {
            Some(id) => id,
            None => {
                let id = self.allocate_callout(bus)?;
                self.lfb_mmio_cb = Some(id);
                id
            }
        };

        self.reinstall_window_callout(mem_cb, self.lfb.start_page, self.lfb.pages)?;
        self.reinstall_window_callout(mmio_cb, self.lfb_mmio.start_page, self.lfb_mmio.pages)?;
        Ok(())
    }

    fn reinstall_window_callout(
        &mut self,
        id: CalloutId,
        start_page: PageNum,
        pages: u32,
    ) -> Result<()> {
        self.uninstall_callout(id);
        if pages == 0 {
            return Ok(());
        }
        let p2 = next_power_of_two_pages(pages);
        let mask = pagemask_combine(PAGEMASK_FULL, pagemask_range(p2));
        self.install_callout(id, start_page, mask, CalloutResolver::LfbWindow)
    }

    /// Assigns a physical base address for a device window of `size` bytes
    /// (a power of two). The cursor starts at the top of RAM and grows
    /// toward `0xFE000000`; crossing it fails the assignment.
    pub fn hw_allocate(&mut self, name: &str, size: u32) -> Option<u32> {
        let _ = name;
        if size == 0 || !size.is_power_of_two() {
            return None;
        }

        let size = u64::from(size);
        let mut cursor = u64::from(self.hw_next_assign);
        cursor = (cursor + size - 1) & !(size - 1);
        if cursor + size > 0xFE00_0000 {
            return None;
        }

        self.hw_next_assign = (cursor + size) as u32;
        let base = cursor as u32;
        self.emit(MemTraceEvent::HardwareAssigned {
            base,
            size: size as u32,
        });
        Some(base)
    }

    /// Lowers reported RAM so a ROM image at the top of the address space
    /// gets its room; the vacated pages fall back to the slow path.
    pub fn cut_ram_up_to(&mut self, addr: u32) {
        let pages = addr >> PAGE_SHIFT;
        if self.reported_pages <= pages {
            return;
        }
        while self.reported_pages > pages {
            self.reported_pages -= 1;
            self.phandlers[self.reported_pages as usize] = None;
        }
        self.emit(MemTraceEvent::RamCut {
            reported_pages: pages,
        });
        self.request_tlb_flush();
    }

    /// Removes the EMS page frame, restoring ROM at its window: the frame
    /// lives at `0xD0000` on PC-98 and at `0xE0000` on IBM machines.
    pub fn remove_ems_page_frame(&mut self) {
        let range = match self.cfg.machine {
            MachineKind::Pc98 => 0xD0..0xE0,
            MachineKind::IbmPc => 0xE0..0xF0,
        };
        for page in range {
            self.phandlers[page as usize] = Some(PageHandler::Rom);
        }
        self.request_tlb_flush();
    }

    /// Maps the PCjr cartridge ROM staging window at `0xD0000..0xE0000`.
    pub fn prepare_pcjr_cartridge_rom(&mut self) {
        for page in 0xD0..0xE0 {
            self.phandlers[page as usize] = Some(PageHandler::Rom);
        }
        self.request_tlb_flush();
    }

    /// Maps the PCjr cartridge ROM window at `0xE0000..0xF0000`.
    pub fn map_pcjr_cartridge_rom(&mut self) {
        for page in 0xE0..0xF0 {
            self.phandlers[page as usize] = Some(PageHandler::Rom);
        }
        self.request_tlb_flush();
    }

    /// Builds the ACPI buffer when configured; needs all 32 address bits and
    /// a sane power-of-two region no larger than 8 MiB.
    pub(crate) fn acpi_init(&mut self) -> Result<()> {
        let Some(acpi_cfg) = self.cfg.acpi else {
            return Ok(());
        };
        if self.address_bits < 32 {
            return Ok(());
        }
        if acpi_cfg.region_size < 4096
            || acpi_cfg.region_size > (8 << 20)
            || !acpi_cfg.region_size.is_power_of_two()
            || acpi_cfg.base == 0
        {
            return Ok(());
        }
        self.acpi = Some(AcpiRegion {
            base: acpi_cfg.base,
            region_size: acpi_cfg.region_size,
            buffer: vec![0; acpi_cfg.region_size as usize],
            mapped: false,
        });
        Ok(())
    }

    /// Maps or unmaps the ACPI window over its handler range.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RangeOutsideHandlerTable`] when the configured
    /// window lies beyond the handler table.
    pub fn acpi_enable(&mut self, enable: bool) -> Result<()> {
        let Some(acpi) = self.acpi.as_ref() else {
            return Ok(());
        };
        let (base, size, mapped) = (acpi.base, acpi.region_size, acpi.mapped);
        if base == 0 || size == 0 {
            return Ok(());
        }

        if enable && !mapped {
            self.set_page_handler(base >> PAGE_SHIFT, size >> PAGE_SHIFT, PageHandler::Acpi)?;
        } else if !enable && mapped {
            self.reset_page_handler_unmapped(base >> PAGE_SHIFT, size >> PAGE_SHIFT)?;
        } else {
            return Ok(());
        }
        if let Some(acpi) = self.acpi.as_mut() {
            acpi.mapped = enable;
        }
        Ok(())
    }

    /// Registers a motherboard callout claiming the ACPI window, so the
    /// window also resolves through the slow path after an invalidate.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] when no slot is free or the install fails.
    pub fn register_acpi_callout(&mut self) -> Result<CalloutId> {
        let Some(acpi) = self.acpi.as_ref() else {
            return Err(MemoryError::StaleCalloutHandle);
        };
        let (base, size) = (acpi.base, acpi.region_size);
        let id = self.allocate_callout(BusType::Motherboard)?;
        let p2 = next_power_of_two_pages(size >> PAGE_SHIFT);
        let mask = pagemask_combine(PAGEMASK_FULL, pagemask_range(p2));
        self.install_callout(id, base >> PAGE_SHIFT, mask, CalloutResolver::AcpiWindow)?;
        Ok(id)
    }

    /// ACPI table buffer for the BIOS table generator.
    pub fn acpi_buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.acpi.as_mut().map(|acpi| acpi.buffer.as_mut_slice())
    }

    /// Configured ACPI window as `(base, region_size)` bytes.
    #[must_use]
    pub fn acpi_window(&self) -> Option<(u32, u32)> {
        self.acpi.as_ref().map(|acpi| (acpi.base, acpi.region_size))
    }
}
