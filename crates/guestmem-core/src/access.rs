//! Byte-level guest memory access: linear helpers, block transfers, raw
//! physical pokes, and handler-dispatched device access.
//!
//! Paging is owned by the CPU; the linear helpers here resolve through the
//! page-handler table directly, which is the identity-mapped fallback the
//! CPU uses when its TLB has no host-pointer shortcut.

use crate::addr::{
    offset_in_page, page_of, phys_page_of, LinearAddr, PageNum, PhysAddr, PAGE_SIZE,
};
use crate::diag::MemTraceEvent;
use crate::handler::PageHandler;
use crate::memory::Memory;

impl Memory {
    /// Host slice covering one readable page, when the handler has one.
    #[must_use]
    pub fn host_read_page(&self, handler: PageHandler, ppn: PageNum) -> Option<&[u8]> {
        if !self.handler_flags(handler).readable() {
            return None;
        }
        match handler {
            PageHandler::Ram | PageHandler::Rom => {
                let base = self.ram_host_page(ppn) as usize * PAGE_SIZE;
                self.backing.as_slice().get(base..base + PAGE_SIZE)
            }
            PageHandler::RomAlias => {
                let base = ((ppn & 0xF) + 0xF0) as usize * PAGE_SIZE;
                self.backing.as_slice().get(base..base + PAGE_SIZE)
            }
            PageHandler::Mem4Gb => {
                let base = usize::try_from(u64::from(ppn) * PAGE_SIZE as u64).ok()?;
                self.backing.as_slice().get(base..base + PAGE_SIZE)
            }
            PageHandler::Acpi => {
                let base = self.acpi_page_offset(ppn)?;
                self.acpi
                    .as_ref()?
                    .buffer
                    .get(base..base + PAGE_SIZE)
            }
            PageHandler::Device(id) => self.devices.get(id)?.host_read_page(ppn),
            PageHandler::Unmapped | PageHandler::Illegal => None,
        }
    }

    /// Host slice covering one writable page, when the handler has one.
    pub fn host_write_page(&mut self, handler: PageHandler, ppn: PageNum) -> Option<&mut [u8]> {
        if !self.handler_flags(handler).writeable() {
            return None;
        }
        match handler {
            PageHandler::Ram => {
                let base = self.ram_host_page(ppn) as usize * PAGE_SIZE;
                self.backing.as_mut_slice().get_mut(base..base + PAGE_SIZE)
            }
            PageHandler::Mem4Gb => {
                let base = usize::try_from(u64::from(ppn) * PAGE_SIZE as u64).ok()?;
                self.backing.as_mut_slice().get_mut(base..base + PAGE_SIZE)
            }
            PageHandler::Acpi => {
                let base = self.acpi_page_offset(ppn)?;
                self.acpi
                    .as_mut()?
                    .buffer
                    .get_mut(base..base + PAGE_SIZE)
            }
            PageHandler::Device(id) => self.devices.get_mut(id)?.host_write_page(ppn),
            _ => None,
        }
    }

    /// Byte offset into the ACPI buffer for a page inside its window; the
    /// buffer mirrors across the power-of-two region and clamps at its end.
    fn acpi_page_offset(&self, ppn: PageNum) -> Option<usize> {
        let acpi = self.acpi.as_ref()?;
        if acpi.buffer.len() < PAGE_SIZE {
            return None;
        }
        let mut page = ppn.wrapping_sub(acpi.base >> 12) & ((acpi.region_size >> 12) - 1);
        let buffer_pages = (acpi.buffer.len() / PAGE_SIZE) as u32;
        if page >= buffer_pages {
            page = buffer_pages - 1;
        }
        Some(page as usize * PAGE_SIZE)
    }

    fn rom_write_dropped(&mut self, addr: PhysAddr, value: u32) {
        // Many PC-98 programs zero 0xE0000-0xE7FFF whether or not the 4th
        // bitplane is mapped; stay silent for those.
        if self.cfg.machine == crate::config::MachineKind::Pc98 && addr & !0x7FFF == 0xE0000 {
            return;
        }
        self.diag.record_denied_rom_write();
        self.emit(MemTraceEvent::RomWriteDenied { addr, value });
    }

    pub(crate) fn handler_read_b(&mut self, handler: PageHandler, addr: PhysAddr) -> u8 {
        let ppn = phys_page_of(addr);
        if let Some(page) = self.host_read_page(handler, ppn) {
            return page[offset_in_page(addr)];
        }
        match handler {
            PageHandler::Illegal => {
                if self.diag.record_illegal_read() {
                    self.emit(MemTraceEvent::IllegalAccess {
                        addr,
                        is_write: false,
                    });
                }
                0xFF
            }
            PageHandler::Device(id) => match self.devices.get_mut(id) {
                Some(device) => device.read_b(addr),
                None => 0xFF,
            },
            // Open bus, or a readable handler whose backing range is absent.
            _ => 0xFF,
        }
    }

    pub(crate) fn handler_write_b(&mut self, handler: PageHandler, addr: PhysAddr, val: u8) {
        if matches!(handler, PageHandler::Rom | PageHandler::RomAlias) {
            self.rom_write_dropped(addr, u32::from(val));
            return;
        }
        let ppn = phys_page_of(addr);
        if let Some(page) = self.host_write_page(handler, ppn) {
            page[offset_in_page(addr)] = val;
            return;
        }
        match handler {
            PageHandler::Illegal => {
                if self.diag.record_illegal_write() {
                    self.emit(MemTraceEvent::IllegalAccess {
                        addr,
                        is_write: true,
                    });
                }
            }
            PageHandler::Device(id) => {
                if let Some(device) = self.devices.get_mut(id) {
                    device.write_b(addr, val);
                }
            }
            _ => {}
        }
    }

    fn handler_read_w(&mut self, handler: PageHandler, addr: PhysAddr) -> u16 {
        let ppn = phys_page_of(addr);
        let off = offset_in_page(addr);
        if let Some(page) = self.host_read_page(handler, ppn) {
            return u16::from_le_bytes([page[off], page[off + 1]]);
        }
        if let PageHandler::Device(id) = handler {
            if let Some(device) = self.devices.get_mut(id) {
                return device.read_w(addr);
            }
        }
        u16::from(self.handler_read_b(handler, addr))
            | (u16::from(self.handler_read_b(handler, addr + 1)) << 8)
    }

    fn handler_read_d(&mut self, handler: PageHandler, addr: PhysAddr) -> u32 {
        let ppn = phys_page_of(addr);
        let off = offset_in_page(addr);
        if let Some(page) = self.host_read_page(handler, ppn) {
            return u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]]);
        }
        if let PageHandler::Device(id) = handler {
            if let Some(device) = self.devices.get_mut(id) {
                return device.read_d(addr);
            }
        }
        u32::from(self.handler_read_b(handler, addr))
            | (u32::from(self.handler_read_b(handler, addr + 1)) << 8)
            | (u32::from(self.handler_read_b(handler, addr + 2)) << 16)
            | (u32::from(self.handler_read_b(handler, addr + 3)) << 24)
    }

    fn handler_write_w(&mut self, handler: PageHandler, addr: PhysAddr, val: u16) {
        if matches!(handler, PageHandler::Rom | PageHandler::RomAlias) {
            self.rom_write_dropped(addr, u32::from(val));
            return;
        }
        let ppn = phys_page_of(addr);
        let off = offset_in_page(addr);
        if let Some(page) = self.host_write_page(handler, ppn) {
            page[off..off + 2].copy_from_slice(&val.to_le_bytes());
            return;
        }
        if let PageHandler::Device(id) = handler {
            if let Some(device) = self.devices.get_mut(id) {
                device.write_w(addr, val);
                return;
            }
        }
        self.handler_write_b(handler, addr, val as u8);
        self.handler_write_b(handler, addr + 1, (val >> 8) as u8);
    }

    fn handler_write_d(&mut self, handler: PageHandler, addr: PhysAddr, val: u32) {
        if matches!(handler, PageHandler::Rom | PageHandler::RomAlias) {
            self.rom_write_dropped(addr, val);
            return;
        }
        let ppn = phys_page_of(addr);
        let off = offset_in_page(addr);
        if let Some(page) = self.host_write_page(handler, ppn) {
            page[off..off + 4].copy_from_slice(&val.to_le_bytes());
            return;
        }
        if let PageHandler::Device(id) = handler {
            if let Some(device) = self.devices.get_mut(id) {
                device.write_d(addr, val);
                return;
            }
        }
        for (i, byte) in val.to_le_bytes().into_iter().enumerate() {
            self.handler_write_b(handler, addr + i as u64, byte);
        }
    }

    /// Reads one byte at a linear address.
    pub fn mem_readb(&mut self, addr: LinearAddr) -> u8 {
        let handler = self.get_handler(page_of(addr));
        self.handler_read_b(handler, PhysAddr::from(addr))
    }

    /// Reads a little-endian 16-bit value at a linear address; accesses that
    /// cross a page boundary split into byte reads.
    pub fn mem_readw(&mut self, addr: LinearAddr) -> u16 {
        if offset_in_page(PhysAddr::from(addr)) <= PAGE_SIZE - 2 {
            let handler = self.get_handler(page_of(addr));
            return self.handler_read_w(handler, PhysAddr::from(addr));
        }
        u16::from(self.mem_readb(addr)) | (u16::from(self.mem_readb(addr.wrapping_add(1))) << 8)
    }

    /// Reads a little-endian 32-bit value at a linear address.
    pub fn mem_readd(&mut self, addr: LinearAddr) -> u32 {
        if offset_in_page(PhysAddr::from(addr)) <= PAGE_SIZE - 4 {
            let handler = self.get_handler(page_of(addr));
            return self.handler_read_d(handler, PhysAddr::from(addr));
        }
        u32::from(self.mem_readb(addr))
            | (u32::from(self.mem_readb(addr.wrapping_add(1))) << 8)
            | (u32::from(self.mem_readb(addr.wrapping_add(2))) << 16)
            | (u32::from(self.mem_readb(addr.wrapping_add(3))) << 24)
    }

    /// Writes one byte at a linear address.
    pub fn mem_writeb(&mut self, addr: LinearAddr, val: u8) {
        let handler = self.get_handler(page_of(addr));
        self.handler_write_b(handler, PhysAddr::from(addr), val);
    }

    /// Writes a little-endian 16-bit value at a linear address.
    pub fn mem_writew(&mut self, addr: LinearAddr, val: u16) {
        if offset_in_page(PhysAddr::from(addr)) <= PAGE_SIZE - 2 {
            let handler = self.get_handler(page_of(addr));
            self.handler_write_w(handler, PhysAddr::from(addr), val);
            return;
        }
        self.mem_writeb(addr, val as u8);
        self.mem_writeb(addr.wrapping_add(1), (val >> 8) as u8);
    }

    /// Writes a little-endian 32-bit value at a linear address.
    pub fn mem_writed(&mut self, addr: LinearAddr, val: u32) {
        if offset_in_page(PhysAddr::from(addr)) <= PAGE_SIZE - 4 {
            let handler = self.get_handler(page_of(addr));
            self.handler_write_d(handler, PhysAddr::from(addr), val);
            return;
        }
        for (i, byte) in val.to_le_bytes().into_iter().enumerate() {
            self.mem_writeb(addr.wrapping_add(i as u32), byte);
        }
    }

    /// Checked byte read: `None` when the address resolves to the illegal
    /// handler (outside every mapping).
    pub fn mem_readb_checked(&mut self, addr: LinearAddr) -> Option<u8> {
        let handler = self.get_handler(page_of(addr));
        if handler == PageHandler::Illegal {
            return None;
        }
        Some(self.handler_read_b(handler, PhysAddr::from(addr)))
    }

    /// Checked 16-bit read; fails when either byte is out of range.
    pub fn mem_readw_checked(&mut self, addr: LinearAddr) -> Option<u16> {
        let lo = self.mem_readb_checked(addr)?;
        let hi = self.mem_readb_checked(addr.wrapping_add(1))?;
        Some(u16::from(lo) | (u16::from(hi) << 8))
    }

    /// Checked 32-bit read; fails when any byte is out of range.
    pub fn mem_readd_checked(&mut self, addr: LinearAddr) -> Option<u32> {
        let mut val = 0u32;
        for i in 0..4 {
            val |= u32::from(self.mem_readb_checked(addr.wrapping_add(i))?) << (8 * i);
        }
        Some(val)
    }

    /// Checked byte write; returns false when the address is out of range.
    pub fn mem_writeb_checked(&mut self, addr: LinearAddr, val: u8) -> bool {
        let handler = self.get_handler(page_of(addr));
        if handler == PageHandler::Illegal {
            return false;
        }
        self.handler_write_b(handler, PhysAddr::from(addr), val);
        true
    }

    /// Checked 16-bit write; stops at the first out-of-range byte.
    pub fn mem_writew_checked(&mut self, addr: LinearAddr, val: u16) -> bool {
        self.mem_writeb_checked(addr, val as u8)
            && self.mem_writeb_checked(addr.wrapping_add(1), (val >> 8) as u8)
    }

    /// Checked 32-bit write; stops at the first out-of-range byte.
    pub fn mem_writed_checked(&mut self, addr: LinearAddr, val: u32) -> bool {
        val.to_le_bytes()
            .into_iter()
            .enumerate()
            .all(|(i, byte)| self.mem_writeb_checked(addr.wrapping_add(i as u32), byte))
    }

    /// Copies guest memory into `buf`, splitting on page boundaries and
    /// using the host-page fast path where the handler provides one.
    pub fn block_read(&mut self, addr: LinearAddr, buf: &mut [u8]) {
        let mut addr = PhysAddr::from(addr);
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let off = offset_in_page(addr);
            let chunk = (PAGE_SIZE - off).min(buf.len());
            let ppn = phys_page_of(addr);
            let handler = self.get_handler(ppn);
            if let Some(page) = self.host_read_page(handler, ppn) {
                buf[..chunk].copy_from_slice(&page[off..off + chunk]);
            } else {
                for (i, slot) in buf[..chunk].iter_mut().enumerate() {
                    *slot = self.handler_read_b(handler, addr + i as u64);
                }
            }
            addr += chunk as u64;
            buf = &mut buf[chunk..];
        }
    }

    /// Copies `data` into guest memory, splitting on page boundaries and
    /// using the host-page fast path where the handler provides one.
    pub fn block_write(&mut self, addr: LinearAddr, data: &[u8]) {
        let mut addr = PhysAddr::from(addr);
        let mut data = data;
        while !data.is_empty() {
            let off = offset_in_page(addr);
            let chunk = (PAGE_SIZE - off).min(data.len());
            let ppn = phys_page_of(addr);
            let handler = self.get_handler(ppn);
            if let Some(page) = self.host_write_page(handler, ppn) {
                page[off..off + chunk].copy_from_slice(&data[..chunk]);
            } else {
                for (i, byte) in data[..chunk].iter().enumerate() {
                    self.handler_write_b(handler, addr + i as u64, *byte);
                }
            }
            addr += chunk as u64;
            data = &data[chunk..];
        }
    }

    /// Byte-wise copy between two guest ranges, in ascending order.
    pub fn block_copy(&mut self, dst: LinearAddr, src: LinearAddr, len: u32) {
        for i in 0..len {
            let byte = self.mem_readb(src.wrapping_add(i));
            self.mem_writeb(dst.wrapping_add(i), byte);
        }
    }

    /// Length of the NUL-terminated string at `addr`, scanning at most 1024
    /// bytes; returns 0 when no terminator is found.
    pub fn str_len(&mut self, addr: LinearAddr) -> u32 {
        for i in 0..1024 {
            if self.mem_readb(addr.wrapping_add(i)) == 0 {
                return i;
            }
        }
        0
    }

    /// Reads up to `max` bytes of a NUL-terminated string, terminator
    /// excluded.
    pub fn str_read(&mut self, addr: LinearAddr, max: u32) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..max {
            let byte = self.mem_readb(addr.wrapping_add(i));
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        out
    }

    /// Copies a NUL-terminated string from `src` to `dst`, terminator
    /// included.
    pub fn str_copy(&mut self, dst: LinearAddr, src: LinearAddr) {
        let mut i = 0;
        loop {
            let byte = self.mem_readb(src.wrapping_add(i));
            self.mem_writeb(dst.wrapping_add(i), byte);
            if byte == 0 {
                return;
            }
            i = i.wrapping_add(1);
        }
    }

    fn low_ram(&self) -> &[u8] {
        &self.backing.as_slice()[..self.pages as usize * PAGE_SIZE]
    }

    fn low_ram_mut(&mut self) -> &mut [u8] {
        let len = self.pages as usize * PAGE_SIZE;
        &mut self.backing.as_mut_slice()[..len]
    }

    /// Raw read from the backing RAM, ignoring all device mappings.
    /// Out-of-range reads float to `0xFF`.
    #[must_use]
    pub fn phys_readb(&self, addr: u32) -> u8 {
        self.low_ram().get(addr as usize).copied().unwrap_or(0xFF)
    }

    /// Raw little-endian 16-bit read from the backing RAM.
    #[must_use]
    pub fn phys_readw(&self, addr: u32) -> u16 {
        u16::from(self.phys_readb(addr)) | (u16::from(self.phys_readb(addr.wrapping_add(1))) << 8)
    }

    /// Raw little-endian 32-bit read from the backing RAM.
    #[must_use]
    pub fn phys_readd(&self, addr: u32) -> u32 {
        u32::from(self.phys_readb(addr))
            | (u32::from(self.phys_readb(addr.wrapping_add(1))) << 8)
            | (u32::from(self.phys_readb(addr.wrapping_add(2))) << 16)
            | (u32::from(self.phys_readb(addr.wrapping_add(3))) << 24)
    }

    /// Raw write to the backing RAM; out-of-range writes drop.
    pub fn phys_writeb(&mut self, addr: u32, val: u8) {
        if let Some(slot) = self.low_ram_mut().get_mut(addr as usize) {
            *slot = val;
        }
    }

    /// Raw little-endian 16-bit write to the backing RAM.
    pub fn phys_writew(&mut self, addr: u32, val: u16) {
        self.phys_writeb(addr, val as u8);
        self.phys_writeb(addr.wrapping_add(1), (val >> 8) as u8);
    }

    /// Raw little-endian 32-bit write to the backing RAM.
    pub fn phys_writed(&mut self, addr: u32, val: u32) {
        for (i, byte) in val.to_le_bytes().into_iter().enumerate() {
            self.phys_writeb(addr.wrapping_add(i as u32), byte);
        }
    }

    /// Raw bounded write of `data` to the backing RAM, used by ROM image
    /// and table loaders.
    pub fn phys_write_bytes(&mut self, addr: u32, data: &[u8]) {
        let ram = self.low_ram_mut();
        let start = addr as usize;
        if start >= ram.len() {
            return;
        }
        let len = data.len().min(ram.len() - start);
        ram[start..start + len].copy_from_slice(&data[..len]);
    }

    /// Physical device read: dispatches through the page handler, so device
    /// mappings respond; addresses above 4 GiB reach the high RAM region.
    pub fn physdev_readb(&mut self, addr: PhysAddr) -> u8 {
        let handler = self.get_handler(phys_page_of(addr));
        self.handler_read_b(handler, addr)
    }

    /// Physical device 16-bit read.
    pub fn physdev_readw(&mut self, addr: PhysAddr) -> u16 {
        if offset_in_page(addr) <= PAGE_SIZE - 2 {
            let handler = self.get_handler(phys_page_of(addr));
            return self.handler_read_w(handler, addr);
        }
        u16::from(self.physdev_readb(addr)) | (u16::from(self.physdev_readb(addr + 1)) << 8)
    }

    /// Physical device 32-bit read.
    pub fn physdev_readd(&mut self, addr: PhysAddr) -> u32 {
        if offset_in_page(addr) <= PAGE_SIZE - 4 {
            let handler = self.get_handler(phys_page_of(addr));
            return self.handler_read_d(handler, addr);
        }
        u32::from(self.physdev_readb(addr))
            | (u32::from(self.physdev_readb(addr + 1)) << 8)
            | (u32::from(self.physdev_readb(addr + 2)) << 16)
            | (u32::from(self.physdev_readb(addr + 3)) << 24)
    }

    /// Physical device byte write.
    pub fn physdev_writeb(&mut self, addr: PhysAddr, val: u8) {
        let handler = self.get_handler(phys_page_of(addr));
        self.handler_write_b(handler, addr, val);
    }

    /// Physical device 16-bit write.
    pub fn physdev_writew(&mut self, addr: PhysAddr, val: u16) {
        if offset_in_page(addr) <= PAGE_SIZE - 2 {
            let handler = self.get_handler(phys_page_of(addr));
            self.handler_write_w(handler, addr, val);
            return;
        }
        self.physdev_writeb(addr, val as u8);
        self.physdev_writeb(addr + 1, (val >> 8) as u8);
    }

    /// Physical device 32-bit write.
    pub fn physdev_writed(&mut self, addr: PhysAddr, val: u32) {
        if offset_in_page(addr) <= PAGE_SIZE - 4 {
            let handler = self.get_handler(phys_page_of(addr));
            self.handler_write_d(handler, addr, val);
            return;
        }
        for (i, byte) in val.to_le_bytes().into_iter().enumerate() {
            self.physdev_writeb(addr + i as u64, byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{AcpiConfig, MachineKind, MemoryConfig};
    use crate::handler::{HandlerFlags, PageHandler, PagedDevice};
    use crate::memory::Memory;

    fn megs(mib: u32) -> Memory {
        Memory::new(MemoryConfig {
            memsize_mib: mib,
            ..MemoryConfig::default()
        })
        .expect("memory init")
    }

    struct CountingDevice {
        reads: u32,
        writes: Vec<(u64, u8)>,
    }

    impl CountingDevice {
        fn new() -> Self {
            Self {
                reads: 0,
                writes: Vec::new(),
            }
        }
    }

    impl PagedDevice for CountingDevice {
        fn flags(&self) -> HandlerFlags {
            HandlerFlags::NO_CODE
        }

        fn read_b(&mut self, addr: u64) -> u8 {
            self.reads += 1;
            addr as u8
        }

        fn write_b(&mut self, addr: u64, val: u8) {
            self.writes.push((addr, val));
        }
    }

    #[test]
    fn ram_roundtrips_through_every_width() {
        let mut mem = megs(2);
        mem.mem_writeb(0x1000, 0xAB);
        mem.mem_writew(0x1002, 0xBEEF);
        mem.mem_writed(0x1004, 0xDEAD_C0DE);

        assert_eq!(mem.mem_readb(0x1000), 0xAB);
        assert_eq!(mem.mem_readw(0x1002), 0xBEEF);
        assert_eq!(mem.mem_readd(0x1004), 0xDEAD_C0DE);
        // Little-endian byte order in the backing store.
        assert_eq!(mem.phys_readb(0x1004), 0xDE);
        assert_eq!(mem.phys_readb(0x1007), 0xDE);
    }

    #[test]
    fn word_access_across_a_page_boundary_splits_into_bytes() {
        let mut mem = megs(2);
        mem.mem_writed(0x1FFE, 0x1122_3344);
        assert_eq!(mem.mem_readd(0x1FFE), 0x1122_3344);
        assert_eq!(mem.phys_readb(0x1FFE), 0x44);
        assert_eq!(mem.phys_readb(0x2001), 0x11);
    }

    #[test]
    fn unmapped_pages_float_high_and_swallow_writes() {
        let mut mem = megs(2);
        mem.unmap_physmem(0x80000, 0x80FFF).expect("unmap");
        mem.mem_writed(0x80010, 0x0123_4567);
        assert_eq!(mem.mem_readb(0x80010), 0xFF);
        assert_eq!(mem.mem_readw(0x80010), 0xFFFF);
        assert_eq!(mem.mem_readd(0x80010), 0xFFFF_FFFF);
    }

    #[test]
    fn rom_drops_writes_and_keeps_the_prior_bytes() {
        let mut mem = megs(2);
        mem.phys_writeb(0xF0000, 0xEA);
        mem.map_rom_physmem(0xF0000, 0xFFFFF).expect("map rom");

        mem.mem_writeb(0xF0000, 0x55);
        assert_eq!(mem.mem_readb(0xF0000), 0xEA);
        assert_eq!(mem.diag().denied_rom_writes, 1);

        mem.mem_writew(0xF0010, 0x1234);
        mem.mem_writed(0xF0020, 0x5678_9ABC);
        assert_eq!(mem.diag().denied_rom_writes, 3);
    }

    #[test]
    fn pc98_bitplane_window_swallows_rom_writes_silently() {
        let mut mem = Memory::new(MemoryConfig {
            memsize_mib: 2,
            machine: MachineKind::Pc98,
            ..MemoryConfig::default()
        })
        .expect("memory init");
        mem.map_rom_physmem(0xE0000, 0xEFFFF).expect("map rom");

        mem.mem_writeb(0xE4000, 0x00);
        assert_eq!(mem.diag().denied_rom_writes, 0);

        // Past the 32 KiB quirk window the drop is reported again.
        mem.mem_writeb(0xE8000, 0x00);
        assert_eq!(mem.diag().denied_rom_writes, 1);
    }

    #[test]
    fn rom_alias_mirrors_the_top_of_the_first_megabyte() {
        let mut mem = megs(2);
        mem.phys_writeb(0xF5123, 0x77);
        mem.unmap_physmem(0xC0000, 0xCFFFF).expect("unmap");
        mem.map_rom_alias_physmem(0xC0000, 0xCFFFF).expect("alias");

        // Page 0xC5 & 0xF = 5 -> host page 0xF5.
        assert_eq!(mem.mem_readb(0xC5123), 0x77);
        mem.mem_writeb(0xC5123, 0x00);
        assert_eq!(mem.mem_readb(0xC5123), 0x77);
    }

    #[test]
    fn device_dispatch_reaches_the_registered_handler() {
        let mut mem = megs(2);
        let id = mem.register_device(Box::new(CountingDevice::new()));
        mem.set_page_handler(0xD0, 1, PageHandler::Device(id))
            .expect("claim page");

        assert_eq!(mem.mem_readb(0xD0005), 0x05);
        assert_eq!(mem.mem_readw(0xD0010), 0x1110);
        mem.mem_writeb(0xD0003, 0x99);

        let device = mem.unregister_device(id).expect("device");
        drop(device);
    }

    #[test]
    fn physdev_reaches_above_4gb_or_reports_illegal() {
        // 36 wired bits, but nothing configured above 4 GiB: the high pages
        // resolve to the illegal handler and float.
        let mut mem = Memory::new(MemoryConfig {
            memsize_mib: 2,
            address_bits: 36,
            ..MemoryConfig::default()
        })
        .expect("memory init");
        assert_eq!(mem.physdev_readb(0x2_0000_0000), 0xFF);
        mem.physdev_writeb(0x2_0000_0000, 0x12);
        assert_eq!(mem.diag().illegal_reads, 1);
        assert_eq!(mem.diag().illegal_writes, 1);
    }

    #[test]
    fn checked_access_rejects_out_of_range_addresses() {
        let mut mem = megs(2);
        assert_eq!(mem.mem_readb_checked(0x1000), Some(0));
        assert!(mem.mem_writeb_checked(0x1000, 0x42));
        assert_eq!(mem.mem_readb_checked(0x1000), Some(0x42));

        assert_eq!(mem.mem_readw_checked(0x2000), Some(0));
        assert!(mem.mem_writed_checked(0x2000, 0x0102_0304));
        assert_eq!(mem.mem_readd_checked(0x2000), Some(0x0102_0304));
    }

    #[test]
    fn block_transfers_split_on_page_boundaries() {
        let mut mem = megs(2);
        let pattern: Vec<u8> = (0..0x2000u32).map(|i| i as u8).collect();
        mem.block_write(0x0800, &pattern);

        let mut readback = vec![0u8; pattern.len()];
        mem.block_read(0x0800, &mut readback);
        assert_eq!(readback, pattern);

        mem.block_copy(0x40000, 0x0800, 0x2000);
        let mut copied = vec![0u8; pattern.len()];
        mem.block_read(0x40000, &mut copied);
        assert_eq!(copied, pattern);
    }

    #[test]
    fn block_write_through_an_unmapped_hole_drops_only_the_hole() {
        let mut mem = megs(2);
        mem.unmap_physmem(0x51000, 0x51FFF).expect("unmap");
        let pattern = vec![0x5Au8; 0x3000];
        mem.block_write(0x50000, &pattern);

        assert_eq!(mem.mem_readb(0x50FFF), 0x5A);
        assert_eq!(mem.mem_readb(0x51000), 0xFF);
        assert_eq!(mem.mem_readb(0x52000), 0x5A);
    }

    #[test]
    fn string_helpers_honor_the_nul_terminator() {
        let mut mem = megs(2);
        mem.block_write(0x3000, b"COMMAND.COM\0garbage");
        assert_eq!(mem.str_len(0x3000), 11);
        assert_eq!(mem.str_read(0x3000, 64), b"COMMAND.COM");

        mem.str_copy(0x4000, 0x3000);
        assert_eq!(mem.str_read(0x4000, 64), b"COMMAND.COM");
        assert_eq!(mem.mem_readb(0x4000 + 11), 0);
    }

    #[test]
    fn acpi_window_mirrors_its_buffer_across_the_region() {
        let mut mem = Memory::new(MemoryConfig {
            memsize_mib: 2,
            acpi: Some(AcpiConfig {
                base: 0xE000_0000,
                region_size: 0x2000,
            }),
            ..MemoryConfig::default()
        })
        .expect("memory init");
        if let Some(buffer) = mem.acpi_buffer_mut() {
            buffer[0] = 0x52; // 'R'
            buffer[0x1000] = 0x53;
        }
        mem.acpi_enable(true).expect("enable");

        assert_eq!(mem.physdev_readb(0xE000_0000), 0x52);
        assert_eq!(mem.physdev_readb(0xE000_1000), 0x53);

        mem.physdev_writeb(0xE000_0004, 0x99);
        assert_eq!(mem.physdev_readb(0xE000_0004), 0x99);
    }
}
