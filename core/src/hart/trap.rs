//! Trap unit: cause/tval computation, privilege transitions, `mtvec` dispatch,
//! and `MRET`.

use super::{Hart, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP_MASK, MSTATUS_MPP_SHIFT};
use crate::PrivilegeLevel;

/// Exception causes this core can raise. Interrupt causes are not listed here
/// since they're delivered with the interrupt bit (`0x8000_0000`) already set
/// on a raw `u32`, not through this enum.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum Cause {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    UserEnvironmentCall = 8,
    MachineEnvironmentCall = 11,
}

/// Enters a trap for a synchronous exception. `pc` is the faulting
/// instruction's address (becomes `mepc`); `tval` is the cause-specific
/// auxiliary value.
pub(super) fn enter_exception(hart: &mut Hart, cause: Cause, pc: u32, tval: u32) {
    enter(hart, cause as u32, pc, tval);
}

/// Enters a trap for an interrupt. `mepc` gets the *next* instruction
/// address — which, since interrupts are only taken at a batch boundary
/// before fetching, is simply the hart's current `pc`. `mtval` is left at `0`;
/// interrupts don't have an auxiliary value worth reporting.
pub(super) fn enter_interrupt(hart: &mut Hart, irq_bit: u32) {
    let pc = hart.pc();
    enter(hart, 0x8000_0000 | irq_bit, pc, 0);
}

fn enter(hart: &mut Hart, cause: u32, mepc: u32, tval: u32) {
    hart.mcause = cause;
    hart.mtval = tval;
    hart.mepc = mepc;

    let mie = hart.mstatus & MSTATUS_MIE != 0;
    hart.mstatus = (hart.mstatus & !MSTATUS_MPIE) | if mie { MSTATUS_MPIE } else { 0 };
    hart.mstatus &= !MSTATUS_MIE;
    hart.mstatus = (hart.mstatus & !MSTATUS_MPP_MASK)
        | ((hart.privilege.as_u2() as u32) << MSTATUS_MPP_SHIFT);

    hart.privilege = PrivilegeLevel::Machine;
    hart.reservation = None;
    hart.trapped_this_step = true;

    // Direct mode only: vectored mode is not implemented, so the low two bits
    // of mtvec (the mode field) are masked off regardless of their value.
    *hart.regs.pc_mut() = hart.mtvec & !0b11;
}

/// Executes `MRET`: the inverse of trap entry.
pub(super) fn mret(hart: &mut Hart) {
    let mpie = hart.mstatus & MSTATUS_MPIE != 0;
    let mpp = PrivilegeLevel::from_u2(((hart.mstatus & MSTATUS_MPP_MASK) >> MSTATUS_MPP_SHIFT) as u8);

    hart.mstatus = (hart.mstatus & !MSTATUS_MIE) | if mpie { MSTATUS_MIE } else { 0 };
    hart.mstatus |= MSTATUS_MPIE;
    hart.mstatus &= !MSTATUS_MPP_MASK;
    // MPP reverts to U (0) on MRET.
    hart.privilege = mpp;
    *hart.regs.pc_mut() = hart.mepc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::Hart;

    #[test]
    fn trap_then_mret_restores_mie() {
        let mut hart = Hart::new(0, 0);
        hart.mstatus = MSTATUS_MIE;
        hart.mtvec = 0x8000_1000;
        *hart.regs.pc_mut() = 0x8000_0010;

        enter_exception(&mut hart, Cause::Breakpoint, 0x8000_0010, 0);
        assert_eq!(hart.mcause, Cause::Breakpoint as u32);
        assert_eq!(hart.mepc, 0x8000_0010);
        assert_eq!(hart.pc(), 0x8000_1000);
        assert_eq!(hart.mstatus & MSTATUS_MIE, 0);
        assert_ne!(hart.mstatus & MSTATUS_MPIE, 0);
        assert_eq!(hart.privilege, PrivilegeLevel::Machine);

        mret(&mut hart);
        assert_eq!(hart.pc(), 0x8000_0010);
        assert_ne!(hart.mstatus & MSTATUS_MIE, 0);
        assert_eq!(hart.privilege, PrivilegeLevel::Machine);
    }

    #[test]
    fn trap_clears_reservation() {
        let mut hart = Hart::new(0, 0);
        hart.reservation = Some(0x8000_0000);
        enter_exception(&mut hart, Cause::IllegalInstruction, 0, 0);
        assert_eq!(hart.reservation, None);
    }
}
