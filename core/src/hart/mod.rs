//! Hart state and the per-instruction step loop (the part of it that belongs
//! to a single hart rather than the board it's plugged into).

pub mod clint;
pub mod csr;
pub mod execute;
pub mod trap;

use crate::instruction::Instruction;
use crate::registers::{Registers, Specifier};
use crate::resources::Ram;
use crate::{PrivilegeLevel, RAM_IMAGE_OFFSET};
use log::trace;

pub use trap::Cause;

const EXTRAFLAGS_WFI_BIT: u32 = 1 << 2;
const EXTRAFLAGS_TRAP_BIT: u32 = 1 << 3;

/// A single RV32IMA hart: registers, machine CSRs, the LR/SC reservation, and
/// the WFI latch. Owns no memory and no MMIO devices; [`crate::Board`] supplies
/// those when stepping.
#[derive(Debug, Clone)]
pub struct Hart {
    pub(crate) regs: Registers,
    pub(crate) privilege: PrivilegeLevel,

    pub(crate) mstatus: u32,
    pub(crate) mtvec: u32,
    pub(crate) mscratch: u32,
    pub(crate) mepc: u32,
    pub(crate) mcause: u32,
    pub(crate) mtval: u32,
    pub(crate) mie: u32,
    pub(crate) mip: u32,

    /// Retired-instruction count, also serving as `mtime`: this core treats
    /// cycle count and time as the same monotonic counter. Stored as a 64-bit
    /// value; `cyclel`/`cycleh` expose it as the low/high 32-bit halves the
    /// architectural CSRs need.
    cycle: u64,

    /// Active LR reservation, or `None`.
    pub(crate) reservation: Option<u32>,

    pub(crate) wfi: bool,

    /// Set while a trap is being delivered, cleared before the next
    /// instruction retires. Exists only so `extraflags` bit 3 has something
    /// truthful to report; no code in this workspace reads it back.
    trapped_this_step: bool,
}

/// `mstatus.MIE`, bit 3.
pub(crate) const MSTATUS_MIE: u32 = 1 << 3;
/// `mstatus.MPIE`, bit 7.
pub(crate) const MSTATUS_MPIE: u32 = 1 << 7;
/// `mstatus.MPP`, bits 12:11.
pub(crate) const MSTATUS_MPP_SHIFT: u32 = 11;
pub(crate) const MSTATUS_MPP_MASK: u32 = 0b11 << MSTATUS_MPP_SHIFT;

/// `mip`/`mie` bit for the machine software interrupt.
pub const MIP_MSIP: u32 = 1 << 3;
/// `mip`/`mie` bit for the machine timer interrupt.
pub const MIP_MTIP: u32 = 1 << 7;

impl Hart {
    /// Resets a hart: all `x` registers zero, `pc = RAM_IMAGE_OFFSET`, `a0`
    /// (hart id) and `a1` (DTB address) set, privilege machine, interrupts
    /// globally disabled, no reservation, not waiting.
    pub fn new(hart_id: u32, dtb_addr: u32) -> Self {
        let mut regs = Registers::new(RAM_IMAGE_OFFSET);
        regs.set_x(Specifier::from_u5(10), hart_id);
        regs.set_x(Specifier::from_u5(11), dtb_addr);
        Self {
            regs,
            privilege: PrivilegeLevel::Machine,
            mstatus: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            mie: 0,
            mip: 0,
            cycle: 0,
            reservation: None,
            wfi: false,
            trapped_this_step: false,
        }
    }

    pub fn pc(&self) -> u32 {
        self.regs.pc()
    }

    pub fn x(&self, specifier: Specifier) -> u32 {
        self.regs.x(specifier)
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn is_waiting_for_interrupt(&self) -> bool {
        self.wfi
    }

    /// The 64-bit retired-instruction / `mtime` counter.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn cyclel(&self) -> u32 {
        self.cycle as u32
    }

    pub fn cycleh(&self) -> u32 {
        (self.cycle >> 32) as u32
    }

    pub fn mcause(&self) -> u32 {
        self.mcause
    }

    pub fn mtval(&self) -> u32 {
        self.mtval
    }

    pub fn mepc(&self) -> u32 {
        self.mepc
    }

    pub fn mtvec(&self) -> u32 {
        self.mtvec
    }

    /// Advances the time/cycle counter by `delta` without retiring an
    /// instruction. Used by the step loop to fold in the host's
    /// elapsed-microseconds hint.
    pub(crate) fn advance_time(&mut self, delta: u64) {
        self.cycle = self.cycle.wrapping_add(delta);
    }

    pub(crate) fn set_mtip(&mut self, pending: bool) {
        if pending {
            self.mip |= MIP_MTIP;
        } else {
            self.mip &= !MIP_MTIP;
        }
    }

    pub(crate) fn has_pending_interrupt(&self) -> bool {
        self.pending_interrupt().is_some()
    }

    /// Packs privilege/WFI/trap-latch state into the host-inspectable
    /// `extraflags` word.
    pub fn extraflags(&self) -> u32 {
        let mut flags = self.privilege.as_u2() as u32;
        if self.wfi {
            flags |= EXTRAFLAGS_WFI_BIT;
        }
        if self.trapped_this_step {
            flags |= EXTRAFLAGS_TRAP_BIT;
        }
        flags
    }

    /// Returns the lowest-numbered pending-and-enabled interrupt bit, if any
    /// is both set in `mip` and enabled in `mie`, gated on the global-enable
    /// rule: `mstatus.MIE` set, or privilege below machine mode.
    fn pending_interrupt(&self) -> Option<u32> {
        let globally_enabled =
            self.privilege != PrivilegeLevel::Machine || self.mstatus & MSTATUS_MIE != 0;
        if !globally_enabled {
            return None;
        }
        let pending = self.mip & self.mie;
        if pending & MIP_MTIP != 0 {
            Some(7)
        } else if pending & MIP_MSIP != 0 {
            Some(3)
        } else {
            None
        }
    }

    /// Runs up to `max_insns` retirements, stopping early on a host-hook exit
    /// (SYSCON) or, in strict mode, on the first unrecovered fault. This is the
    /// inner loop; [`crate::Board::step`] wraps it with the time-advance and
    /// WFI bookkeeping that spans the hart and its MMIO devices.
    pub(crate) fn run_batch(
        &mut self,
        ram: &mut Ram,
        host: &mut impl crate::bus::MmioHost,
        max_insns: u32,
        strict: bool,
    ) -> BatchOutcome {
        let mut memory = crate::board::HartMemory::new(ram, host);
        for _ in 0..max_insns {
            self.trapped_this_step = false;
            if let Some(irq_bit) = self.pending_interrupt() {
                self.mip &= !(1 << irq_bit);
                self.wfi = false;
                trap::enter_interrupt(self, irq_bit);
                if let Some(code) = memory.take_host_exit() {
                    return BatchOutcome::HostExit(code);
                }
                continue;
            }

            let pc = self.pc();
            let outcome = match memory.fetch(pc) {
                Ok(ir) => {
                    trace!("fetched {ir:#010x} at pc {pc:#010x}");
                    match Instruction::decode(ir) {
                        Ok(instruction) => {
                            execute::Executor::new(self, &mut memory).execute(instruction)
                        }
                        Err(_) => Some((Cause::IllegalInstruction, ir)),
                    }
                }
                Err(cause) => Some((cause, pc)),
            };

            if let Some((cause, tval)) = outcome {
                if strict && cause != Cause::Breakpoint {
                    return BatchOutcome::Fault;
                }
                trap::enter_exception(self, cause, pc, tval);
            } else {
                self.cycle = self.cycle.wrapping_add(1);
            }

            if let Some(code) = memory.take_host_exit() {
                return BatchOutcome::HostExit(code);
            }
        }
        BatchOutcome::Completed
    }
}

/// What happened while running a batch of instructions.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum BatchOutcome {
    Completed,
    HostExit(u32),
    Fault,
}
