//! Per-page dispatch contract: handler variants, capability flags, and the
//! open device-handler registry.

use crate::addr::{PageNum, PhysAddr};

/// Capability flags describing what a page handler supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HandlerFlags(u8);

impl HandlerFlags {
    /// No capabilities.
    pub const EMPTY: Self = Self(0);
    /// Reads may go through the host-page fast path.
    pub const READABLE: Self = Self(1 << 0);
    /// Writes may go through the host-page fast path.
    pub const WRITEABLE: Self = Self(1 << 1);
    /// The page holds ROM content.
    pub const HAS_ROM: Self = Self(1 << 2);
    /// The CPU must not cache decoded code from this page.
    pub const NO_CODE: Self = Self(1 << 3);
    /// Initial handler installed before any device claimed the page.
    pub const INIT: Self = Self(1 << 4);

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when every flag in `other` is present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when the host-page read fast path is available.
    #[must_use]
    pub const fn readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    /// True when the host-page write fast path is available.
    #[must_use]
    pub const fn writeable(self) -> bool {
        self.contains(Self::WRITEABLE)
    }

    /// True when the page carries ROM content.
    #[must_use]
    pub const fn has_rom(self) -> bool {
        self.contains(Self::HAS_ROM)
    }
}

/// Handle naming a registered device page handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u32);

/// Per-page dispatch target.
///
/// The stock variants cover everything the motherboard itself serves; the
/// `Device` variant is the open extension point for memory-mapped hardware
/// (video banks, framebuffer BARs, option ROM windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageHandler {
    /// System RAM below 4 GiB, alias-masked.
    Ram,
    /// ROM: reads like RAM, writes drop.
    Rom,
    /// Mirror of the top 64 KiB of the 1 MiB window.
    RomAlias,
    /// Open bus: reads `0xFF`, writes drop silently.
    Unmapped,
    /// Out-of-range: reads `0xFF`, accesses are recorded.
    Illegal,
    /// RAM above the 4 GiB mark, served from the memory file.
    Mem4Gb,
    /// Mirrored window into the ACPI table buffer.
    Acpi,
    /// Registered device handler.
    Device(DeviceId),
}

impl PageHandler {
    /// Flags for the stock variants; `Device` flags live in the registry.
    #[must_use]
    pub const fn stock_flags(self) -> Option<HandlerFlags> {
        match self {
            Self::Ram | Self::Mem4Gb => {
                Some(HandlerFlags::READABLE.union(HandlerFlags::WRITEABLE))
            }
            Self::Rom | Self::RomAlias => Some(HandlerFlags::READABLE.union(HandlerFlags::HAS_ROM)),
            Self::Unmapped | Self::Illegal => Some(HandlerFlags::INIT.union(HandlerFlags::NO_CODE)),
            Self::Acpi => Some(
                HandlerFlags::READABLE
                    .union(HandlerFlags::WRITEABLE)
                    .union(HandlerFlags::NO_CODE),
            ),
            Self::Device(_) => None,
        }
    }
}

/// Contract for device-owned page handlers.
///
/// Byte accessors are mandatory; wider accesses default to little-endian
/// byte composition, and the host-page fast paths default to absent so a
/// minimal device only implements `read_b`/`write_b`.
pub trait PagedDevice {
    /// Capability flags for pages served by this device.
    fn flags(&self) -> HandlerFlags {
        HandlerFlags::NO_CODE
    }

    /// Reads one byte at a physical address.
    fn read_b(&mut self, addr: PhysAddr) -> u8;

    /// Reads a 16-bit value; the default composes two byte reads.
    fn read_w(&mut self, addr: PhysAddr) -> u16 {
        u16::from(self.read_b(addr)) | (u16::from(self.read_b(addr + 1)) << 8)
    }

    /// Reads a 32-bit value; the default composes four byte reads.
    fn read_d(&mut self, addr: PhysAddr) -> u32 {
        u32::from(self.read_b(addr))
            | (u32::from(self.read_b(addr + 1)) << 8)
            | (u32::from(self.read_b(addr + 2)) << 16)
            | (u32::from(self.read_b(addr + 3)) << 24)
    }

    /// Writes one byte at a physical address.
    fn write_b(&mut self, addr: PhysAddr, val: u8);

    /// Writes a 16-bit value; the default splits into byte writes.
    fn write_w(&mut self, addr: PhysAddr, val: u16) {
        self.write_b(addr, val as u8);
        self.write_b(addr + 1, (val >> 8) as u8);
    }

    /// Writes a 32-bit value; the default splits into byte writes.
    fn write_d(&mut self, addr: PhysAddr, val: u32) {
        self.write_b(addr, val as u8);
        self.write_b(addr + 1, (val >> 8) as u8);
        self.write_b(addr + 2, (val >> 16) as u8);
        self.write_b(addr + 3, (val >> 24) as u8);
    }

    /// Host slice for a whole readable page, when the device can expose one.
    fn host_read_page(&self, _ppn: PageNum) -> Option<&[u8]> {
        None
    }

    /// Host slice for a whole writable page, when the device can expose one.
    fn host_write_page(&mut self, _ppn: PageNum) -> Option<&mut [u8]> {
        None
    }
}

/// Slot-reusing registry of device page handlers.
#[derive(Default)]
pub struct DeviceRegistry {
    slots: Vec<Option<Box<dyn PagedDevice>>>,
}

impl DeviceRegistry {
    /// Registers a device and returns its handle; freed slots are reused.
    pub fn register(&mut self, device: Box<dyn PagedDevice>) -> DeviceId {
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            self.slots[index] = Some(device);
            return DeviceId(index as u32);
        }
        self.slots.push(Some(device));
        DeviceId((self.slots.len() - 1) as u32)
    }

    /// Removes a device, returning it; stale handles yield `None`.
    pub fn unregister(&mut self, id: DeviceId) -> Option<Box<dyn PagedDevice>> {
        self.slots.get_mut(id.0 as usize)?.take()
    }

    /// Borrows a registered device.
    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<&dyn PagedDevice> {
        self.slots.get(id.0 as usize)?.as_deref()
    }

    /// Mutably borrows a registered device.
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut (dyn PagedDevice + '_)> {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(device)) => Some(device.as_mut()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("DeviceRegistry")
            .field("slots", &self.slots.len())
            .field("live", &live)
            .finish()
    }
}
