//! Memory-subsystem configuration and the derived RAM plan.

use std::path::PathBuf;

/// A20 gate emulation mode, as selected by the `a20` configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum A20Mode {
    /// Guest-controlled masking, the historical default.
    #[default]
    Mask,
    /// Gate locked on; guest toggle attempts are ignored.
    On,
    /// Gate locked off.
    Off,
    /// Gate locked on, but the control bit reads back as if toggling worked.
    OnFake,
    /// Gate locked off with a faked control bit.
    OffFake,
    /// Guest-controlled, but toggling never flushes the TLB; the RAM handler
    /// applies the alias on the fly inside the 1 MiB mirror window only.
    Fast,
}

impl A20Mode {
    /// Parses the enumerated configuration value. Longer names first so that
    /// `off_fake` is not consumed by `off`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off_fake" => Some(Self::OffFake),
            "on_fake" => Some(Self::OnFake),
            "mask" | "" => Some(Self::Mask),
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "fast" => Some(Self::Fast),
            _ => None,
        }
    }

    /// True when the guest may change the gate state.
    #[must_use]
    pub const fn guest_changeable(self) -> bool {
        matches!(self, Self::Mask | Self::Fast)
    }

    /// True when toggles only affect the readable control bit.
    #[must_use]
    pub const fn fake_changeable(self) -> bool {
        matches!(self, Self::OnFake | Self::OffFake)
    }

    /// True for the flush-free fast variant.
    #[must_use]
    pub const fn fast_changeable(self) -> bool {
        matches!(self, Self::Fast)
    }

    /// Initial gate state for this mode.
    #[must_use]
    pub const fn initial_enabled(self) -> bool {
        matches!(self, Self::On | Self::OnFake)
    }
}

/// Machine family being emulated; PC-98 changes ROM-write and A20 port
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MachineKind {
    /// IBM PC and compatibles.
    #[default]
    IbmPc,
    /// NEC PC-98 family.
    Pc98,
}

/// CPU archetype, ordered by capability; selects the automatic address-bit
/// width when `address_bits` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum CpuArchetype {
    /// 8086/8088: 20 address lines.
    I8086,
    /// 80286: 24 address lines.
    I286,
    /// 80386: full 32-bit addressing.
    I386,
    /// 80486.
    #[default]
    I486,
    /// Pentium.
    Pentium,
    /// Pentium II and later: PSE-36 extensions.
    PentiumII,
}

/// ACPI table region placement; only meaningful with all 32 address bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AcpiConfig {
    /// Physical base address of the ACPI window.
    pub base: u32,
    /// Window size in bytes; must be a power of two, at most 8 MiB.
    pub region_size: u32,
}

/// Top-level configuration for one memory subsystem instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemoryConfig {
    /// Guest RAM in MiB; summed with `memsize_kb`.
    pub memsize_mib: u32,
    /// Additional guest RAM in KiB, rounded up to a 4 KiB multiple.
    pub memsize_kb: u32,
    /// Wired address bits, clamped to `20..=40`; `0` selects the automatic
    /// width for `cpu_archetype`.
    pub address_bits: u32,
    /// CPU archetype driving the automatic address-bit width.
    pub cpu_archetype: CpuArchetype,
    /// Machine family.
    pub machine: MachineKind,
    /// Path for file-backed RAM; `None` selects an anonymous mapping.
    /// Required for RAM above 4 GiB.
    pub memory_file: Option<PathBuf>,
    /// A20 gate mode.
    pub a20: A20Mode,
    /// Install the PS/2 control-port-A handler at port `0x92` (IBM only).
    pub enable_port92: bool,
    /// Allow bit 0 of port `0x92` to request a CPU reset.
    pub allow_port92_reset: bool,
    /// A PCI bus is present; the slow path consults PCI callouts before ISA.
    pub pcibus_enable: bool,
    /// Leave the 15-16 MiB range unpopulated for ISA device windows.
    pub isa_memory_hole_15mb: bool,
    /// ACPI table region, when the BIOS generates ACPI tables.
    pub acpi: Option<AcpiConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memsize_mib: 16,
            memsize_kb: 0,
            address_bits: 0,
            cpu_archetype: CpuArchetype::default(),
            machine: MachineKind::default(),
            memory_file: None,
            a20: A20Mode::default(),
            enable_port92: true,
            allow_port92_reset: true,
            pcibus_enable: true,
            isa_memory_hole_15mb: false,
            acpi: None,
        }
    }
}

/// RAM sizing derived from a [`MemoryConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamPlan {
    /// Backing pages actually allocated (at least 1 MiB worth).
    pub pages: u32,
    /// Pages reported to the guest OS below 4 GiB.
    pub reported_pages: u32,
    /// Pages reported above 4 GiB; nonzero only with file backing on a
    /// 64-bit host.
    pub reported_pages_4gb: u32,
}

/// Below-4 GiB RAM never exceeds this, leaving 128 MiB at the top for the
/// ROM BIOS, the framebuffer BAR, and other device windows.
pub const MAX_BELOW_4GB_BYTES: u64 = 0xF800_0000;

impl MemoryConfig {
    /// Resolves the wired address-bit count.
    #[must_use]
    pub fn resolved_address_bits(&self) -> u32 {
        let bits = if self.address_bits == 0 {
            match self.cpu_archetype {
                CpuArchetype::PentiumII => 36,
                CpuArchetype::I386 | CpuArchetype::I486 | CpuArchetype::Pentium => 32,
                CpuArchetype::I286 => 24,
                CpuArchetype::I8086 => 20,
            }
        } else {
            self.address_bits
        };
        bits.clamp(20, 40)
    }

    /// Page mask implementing address aliasing for the resolved bit width.
    #[must_use]
    pub fn alias_pagemask(&self) -> u32 {
        let bits = self.resolved_address_bits();
        (((1u64 << bits) - 1) >> 12) as u32
    }

    /// Computes the RAM plan: requested size, rounded, capped by the alias
    /// window and the host, and split across the 4 GiB boundary.
    #[must_use]
    pub fn ram_plan(&self) -> RamPlan {
        let address_bits = self.resolved_address_bits();
        let alias_pagemask = self.alias_pagemask();

        let mut mib = self.memsize_mib;
        if self.memsize_kb == 0 && mib < 1 {
            mib = 1;
        }
        let mut memsize_kb = (u64::from(self.memsize_kb) + 3) & !3;
        memsize_kb += u64::from(mib) * 1024;

        // Reserve the top of the aliased window for the ROM BIOS and device
        // windows: 64 MiB once 1 GiB+ is addressable, 1 MiB for 16 MiB+
        // spaces, 64 KiB for a bare 20-bit machine.
        let alias_pages = u64::from(alias_pagemask) + 1;
        let max_pages = if address_bits >= 30 {
            alias_pages - 0x4000
        } else if address_bits >= 24 {
            alias_pages - 0x100
        } else {
            alias_pages - 0x10
        };
        if memsize_kb / 4 > max_pages {
            memsize_kb = max_pages * 4;
        }

        let host_cap_kb: u64 = if cfg!(target_pointer_width = "64") {
            1_048_576 * 1024 // 1 TiB
        } else {
            1024 * 1024 // 1 GiB
        };
        if memsize_kb > host_cap_kb {
            memsize_kb = host_cap_kb;
        }

        let mut memsize_kb_4gb = 0u64;
        if address_bits > 32 && memsize_kb > MAX_BELOW_4GB_BYTES >> 10 {
            memsize_kb_4gb = memsize_kb - (MAX_BELOW_4GB_BYTES >> 10);
            memsize_kb = MAX_BELOW_4GB_BYTES >> 10;
        }

        let mut reported_pages_4gb = (memsize_kb_4gb / 4) as u32;
        if reported_pages_4gb != 0
            && (self.memory_file.is_none() || !cfg!(target_pointer_width = "64"))
        {
            // Above-4 GiB RAM needs the sparse memory file and a 64-bit host.
            reported_pages_4gb = 0;
        }

        let reported_pages = (memsize_kb / 4) as u32;
        RamPlan {
            // Too much code in the surrounding machine assumes at least 1 MiB
            // of backing, even when less is reported to the guest.
            pages: reported_pages.max(0x100),
            reported_pages,
            reported_pages_4gb,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{A20Mode, CpuArchetype, MemoryConfig, RamPlan};

    #[rstest]
    #[case("mask", Some(A20Mode::Mask))]
    #[case("", Some(A20Mode::Mask))]
    #[case("on", Some(A20Mode::On))]
    #[case("off", Some(A20Mode::Off))]
    #[case("on_fake", Some(A20Mode::OnFake))]
    #[case("off_fake", Some(A20Mode::OffFake))]
    #[case("fast", Some(A20Mode::Fast))]
    #[case("bogus", None)]
    fn a20_mode_names_parse_to_their_variants(
        #[case] name: &str,
        #[case] expected: Option<A20Mode>,
    ) {
        assert_eq!(A20Mode::from_name(name), expected);
    }

    #[rstest]
    #[case(CpuArchetype::I8086, 20)]
    #[case(CpuArchetype::I286, 24)]
    #[case(CpuArchetype::I386, 32)]
    #[case(CpuArchetype::I486, 32)]
    #[case(CpuArchetype::Pentium, 32)]
    #[case(CpuArchetype::PentiumII, 36)]
    fn auto_address_bits_follow_cpu_archetype(#[case] arch: CpuArchetype, #[case] bits: u32) {
        let config = MemoryConfig {
            cpu_archetype: arch,
            ..MemoryConfig::default()
        };
        assert_eq!(config.resolved_address_bits(), bits);
    }

    #[test]
    fn explicit_address_bits_are_clamped_to_the_supported_window() {
        let low = MemoryConfig {
            address_bits: 16,
            ..MemoryConfig::default()
        };
        assert_eq!(low.resolved_address_bits(), 20);

        let high = MemoryConfig {
            address_bits: 48,
            ..MemoryConfig::default()
        };
        assert_eq!(high.resolved_address_bits(), 40);
    }

    #[test]
    fn alias_pagemask_spans_the_wired_bits() {
        let config = MemoryConfig {
            address_bits: 20,
            ..MemoryConfig::default()
        };
        assert_eq!(config.alias_pagemask(), 0xFF);

        let config = MemoryConfig {
            address_bits: 32,
            ..MemoryConfig::default()
        };
        assert_eq!(config.alias_pagemask(), 0xF_FFFF);
    }

    #[test]
    fn ram_plan_rounds_kb_and_sums_with_mib() {
        let config = MemoryConfig {
            memsize_mib: 1,
            memsize_kb: 5, // rounds to 8 KiB
            ..MemoryConfig::default()
        };
        let plan = config.ram_plan();
        assert_eq!(plan.reported_pages, (1024 + 8) / 4);
        assert_eq!(plan.reported_pages_4gb, 0);
    }

    #[test]
    fn ram_plan_keeps_at_least_one_mebibyte_of_backing() {
        let config = MemoryConfig {
            memsize_mib: 0,
            memsize_kb: 640,
            ..MemoryConfig::default()
        };
        let plan = config.ram_plan();
        assert_eq!(plan.reported_pages, 160);
        assert_eq!(plan.pages, 0x100);
    }

    #[test]
    fn ram_plan_is_capped_by_the_alias_window() {
        let config = MemoryConfig {
            memsize_mib: 64,
            address_bits: 24,
            ..MemoryConfig::default()
        };
        let plan = config.ram_plan();
        // 16 MiB window minus the reserved top megabyte.
        assert_eq!(plan.reported_pages, 0x1000 - 0x100);
    }

    #[test]
    fn above_4gb_ram_requires_a_memory_file() {
        let without_file = MemoryConfig {
            memsize_mib: 5 * 1024,
            address_bits: 36,
            ..MemoryConfig::default()
        };
        let plan = without_file.ram_plan();
        assert_eq!(plan.reported_pages_4gb, 0);

        let with_file = MemoryConfig {
            memory_file: Some("guest-ram.img".into()),
            ..without_file
        };
        let plan = with_file.ram_plan();
        if cfg!(target_pointer_width = "64") {
            let total_pages = 5 * 1024 * 256;
            assert_eq!(
                plan,
                RamPlan {
                    pages: 0xF_8000,
                    reported_pages: 0xF_8000,
                    reported_pages_4gb: total_pages - 0xF_8000,
                }
            );
        } else {
            assert_eq!(plan.reported_pages_4gb, 0);
        }
    }

    #[test]
    fn narrow_machines_never_split_across_4gb() {
        let config = MemoryConfig {
            memsize_mib: 8,
            address_bits: 20,
            ..MemoryConfig::default()
        };
        let plan = config.ram_plan();
        // 1 MiB window minus the reserved 64 KiB.
        assert_eq!(plan.reported_pages, 0x100 - 0x10);
        assert_eq!(plan.reported_pages_4gb, 0);
    }
}
