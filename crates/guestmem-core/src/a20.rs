//! A20 gate emulation and its I/O ports.
//!
//! When the gate is off, page-number bit `0x100` is cleared from the active
//! alias mask, producing the legacy 1 MiB mirror. The *fast* variant leaves
//! the mask alone so toggling never costs a TLB flush; the RAM handler then
//! applies the alias on the fly, but only inside the 64 KiB window of pages
//! at the 1 MiB mark.

use crate::addr::{A20_PAGE_BIT, PageNum, ISA_HOLE_FIRST_PAGE};
use crate::config::A20Mode;
use crate::diag::MemTraceEvent;
use crate::memory::Memory;

/// Live A20 gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A20Gate {
    /// Gate line state as the guest sees it.
    pub(crate) enabled: bool,
    /// Last value written to the PS/2 control port, reset bit stripped.
    pub(crate) control_port: u8,
    pub(crate) guest_changeable: bool,
    pub(crate) fake_changeable: bool,
    pub(crate) fast_changeable: bool,
}

impl A20Gate {
    pub(crate) fn from_mode(mode: A20Mode) -> Self {
        Self {
            enabled: mode.initial_enabled(),
            control_port: 0,
            guest_changeable: mode.guest_changeable(),
            fake_changeable: mode.fake_changeable(),
            fast_changeable: mode.fast_changeable(),
        }
    }
}

/// Side effect requested by a port `0x92` write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port92Effect {
    /// Nothing beyond the A20 update.
    None,
    /// Bit 0 was set and resets are allowed; the dispatcher performs the
    /// software CPU reset.
    ResetRequested,
}

impl Memory {
    /// Current A20 gate state.
    #[must_use]
    pub fn a20_enabled(&self) -> bool {
        self.a20.enabled
    }

    /// Drives the A20 gate line.
    ///
    /// Locked modes ignore the request; fake modes update only the readable
    /// bit. Outside fast mode, a real change rewrites the active alias mask
    /// and schedules a TLB flush.
    pub fn set_a20(&mut self, enabled: bool) {
        if self.a20.guest_changeable || self.a20.fake_changeable {
            if self.a20.enabled != enabled {
                self.emit(MemTraceEvent::A20Changed { enabled });
            }
            self.a20.enabled = enabled;
        }

        if !self.a20.fake_changeable
            && !self.a20.fast_changeable
            && self.alias_pagemask & A20_PAGE_BIT != 0
        {
            let active = if self.a20.enabled {
                self.alias_pagemask_active | A20_PAGE_BIT
            } else {
                self.alias_pagemask_active & !A20_PAGE_BIT
            };
            if active != self.alias_pagemask_active {
                self.alias_pagemask_active = active;
                self.request_tlb_flush();
            }
        }
    }

    /// Switches the gate emulation mode at runtime and reapplies the mask.
    pub fn set_a20_mode(&mut self, mode: A20Mode) {
        let control_port = self.a20.control_port;
        self.a20 = A20Gate::from_mode(mode);
        self.a20.control_port = control_port;
        self.cfg.a20 = mode;

        let mut active = self.alias_pagemask;
        if self.alias_pagemask & A20_PAGE_BIT != 0
            && !self.a20.fast_changeable
            && !self.a20.enabled
        {
            active &= !A20_PAGE_BIT;
        }
        if active != self.alias_pagemask_active {
            self.alias_pagemask_active = active;
            self.request_tlb_flush();
        }
    }

    /// Hardware-reset override: the BIOS needs the gate on to POST on a 386
    /// or later, whatever the configured mode says. The user setting comes
    /// back via [`Memory::a20_apply_user_setting`] after boot.
    pub fn a20_on_reset(&mut self) {
        self.a20.control_port = 0;
        self.a20.guest_changeable = true;
        self.a20.fake_changeable = false;
        self.set_a20(true);
    }

    /// Reapplies the configured A20 mode, as done after BIOS boot.
    pub fn a20_apply_user_setting(&mut self) {
        self.set_a20_mode(self.cfg.a20);
    }

    /// Host page index the RAM handler uses for `page`.
    ///
    /// Fast mode serves pages outside the 1 MiB mirror window unmasked so
    /// their translations survive an A20 toggle.
    pub(crate) fn ram_host_page(&self, page: PageNum) -> PageNum {
        if self.a20.fast_changeable {
            if page & !0xF == A20_PAGE_BIT {
                let mask = if self.a20.enabled {
                    self.alias_pagemask
                } else {
                    self.alias_pagemask & !A20_PAGE_BIT
                };
                return page & mask;
            }
            return page;
        }
        page & self.alias_pagemask_active
    }

    /// True when the I/O bus should wire up the A20 control ports: always
    /// on PC-98, configurable on IBM machines.
    #[must_use]
    pub fn port92_enabled(&self) -> bool {
        self.cfg.machine == crate::config::MachineKind::Pc98 || self.cfg.enable_port92
    }

    /// Reads PS/2 system control port A (`0x92`).
    #[must_use]
    pub fn port92_read(&self) -> u8 {
        self.a20.control_port | if self.a20.enabled { 0x02 } else { 0x00 }
    }

    /// Writes PS/2 system control port A (`0x92`): bit 1 drives A20, bit 0
    /// requests a CPU reset when the configuration allows it.
    pub fn port92_write(&mut self, val: u8) -> Port92Effect {
        self.a20.control_port = val & !0x02;
        self.set_a20(val & 0x02 != 0);

        if val & 0x01 != 0 && self.cfg.allow_port92_reset {
            return Port92Effect::ResetRequested;
        }
        Port92Effect::None
    }

    /// Reads the PC-98 A20 port `0xF2`; bit 0 reports the line *masked*,
    /// not enabled.
    #[must_use]
    pub fn pc98_a20_read(&self, port: u16) -> u8 {
        if port == 0xF2 {
            return u8::from(!self.a20.enabled);
        }
        0xFF
    }

    /// Writes the PC-98 A20 ports: any write to `0xF2` unmasks the line;
    /// `0xF6` accepts the `0000 001x` command where x selects masking.
    pub fn pc98_a20_write(&mut self, port: u16, val: u8) {
        if port == 0xF2 {
            self.set_a20(true);
        } else if port == 0xF6 && val & 0xFE == 0x02 {
            self.set_a20(val & 0x01 == 0);
        }
    }

    /// Reads the PC-98 memory-space register `0x43B`; bit 2 reports the
    /// 15-16 MiB range as usable RAM.
    #[must_use]
    pub fn pc98_port_43b_read(&self) -> u8 {
        if self.cfg.isa_memory_hole_15mb || self.reported_pages <= ISA_HOLE_FIRST_PAGE {
            0x00
        } else {
            0x04
        }
    }
}
