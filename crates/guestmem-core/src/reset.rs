//! Software CPU reset dispatch.
//!
//! A guest triggers a CPU reset on purpose to drop out of protected mode on
//! a 286; the firmware then inspects the CMOS shutdown byte (IBM) or the
//! SHUT0/SHUT1 lines (PC-98) to decide whether to boot or resume the
//! program. The outcome is returned as a [`Resume`] value the CPU
//! dispatcher acts on; no control flow is unwound through the subsystem.

use crate::error::{MemoryError, Result};
use crate::memory::Memory;

/// IBM BIOS data area slot holding the reset-vector offset (or SP).
const BDA_RESET_VECTOR_OFFSET: u32 = 0x400 + 0x67;

/// IBM BIOS data area slot holding the reset-vector segment (or SS).
const BDA_RESET_VECTOR_SEGMENT: u32 = 0x400 + 0x69;

/// PC-98 word holding the resume stack pointer.
const PC98_RESET_SP: u32 = 0x404;

/// PC-98 word holding the resume stack segment.
const PC98_RESET_SS: u32 = 0x406;

/// What the emulated machine observed at the moment of a software reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// IBM: the CMOS shutdown byte as programmed before the reset.
    CmosShutdownByte(u8),
    /// PC-98: the SHUT0/SHUT1 line latches.
    Pc98Shut {
        /// SHUT0 latch.
        shut0: bool,
        /// SHUT1 latch.
        shut1: bool,
    },
}

/// Action the CPU dispatcher performs after a software reset. Every variant
/// implies the CPU is forced back to real mode first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Full system reset through the BIOS POST path.
    FullReset,
    /// Jump to the real-mode reset vector recorded in the BIOS data area
    /// (CMOS shutdown bytes `0x05` and `0x0A`).
    JumpRealMode {
        /// Target code segment.
        cs: u16,
        /// Target instruction pointer.
        ip: u16,
    },
    /// Emulate the BIOS returning from an INT 15h block move, 286 style:
    /// the recorded vector is a stack pointer and the dispatcher pops ES,
    /// DS, a PUSHA frame, and an IRET frame from it (shutdown byte `0x09`).
    Block286Return {
        /// Stack segment to restore.
        ss: u16,
        /// Stack pointer to restore.
        sp: u16,
    },
    /// PC-98 continue-after-reset: load SS:SP from `0000:0404` and RETF.
    Pc98Continue {
        /// Stack segment to restore.
        ss: u16,
        /// Stack pointer to restore.
        sp: u16,
    },
}

impl Memory {
    /// Dispatches a software CPU reset into the action the CPU dispatcher
    /// must perform. Reads the recorded vectors from guest RAM.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidShutdownLines`] for the PC-98
    /// SHUT0=1/SHUT1=0 combination, which real firmware answers by halting.
    pub fn software_cpu_reset(&mut self, request: ShutdownRequest) -> Result<Resume> {
        match request {
            ShutdownRequest::CmosShutdownByte(byte) => Ok(self.ibm_shutdown(byte)),
            ShutdownRequest::Pc98Shut { shut0, shut1 } => self.pc98_shutdown(shut0, shut1),
        }
    }

    fn ibm_shutdown(&mut self, byte: u8) -> Resume {
        match byte {
            // JMP double-word pointer, with (0x05) or without (0x0A) EOI.
            0x05 | 0x0A => {
                let ip = self.phys_readw(BDA_RESET_VECTOR_OFFSET);
                let cs = self.phys_readw(BDA_RESET_VECTOR_SEGMENT);
                Resume::JumpRealMode { cs, ip }
            }
            // INT 15h block move return; the vector is SS:SP here.
            0x09 => {
                let sp = self.phys_readw(BDA_RESET_VECTOR_OFFSET);
                let ss = self.phys_readw(BDA_RESET_VECTOR_SEGMENT);
                Resume::Block286Return { ss, sp }
            }
            _ => Resume::FullReset,
        }
    }

    fn pc98_shutdown(&mut self, shut0: bool, shut1: bool) -> Result<Resume> {
        if shut0 {
            if !shut1 {
                return Err(MemoryError::InvalidShutdownLines);
            }
            return Ok(Resume::FullReset);
        }
        let sp = self.phys_readw(PC98_RESET_SP);
        let ss = self.phys_readw(PC98_RESET_SS);
        Ok(Resume::Pc98Continue { ss, sp })
    }
}
