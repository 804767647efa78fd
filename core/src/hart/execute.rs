//! Execution unit: the semantics of each decoded [`Instruction`], borrowing a
//! hart and its memory/MMIO view for exactly one retirement.

use super::csr;
use super::trap;
use super::{Cause, Hart};
use crate::board::{HartMemory, Width};
use crate::bus::MmioHost;
use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, Instruction, LoadWidth, RegImmOp, RegRegOp, RegShiftImmOp,
    StoreWidth,
};
use crate::registers::Specifier;
use log::trace;

/// Executes one decoded instruction against a borrowed hart and memory view.
pub(crate) struct Executor<'a, H: MmioHost> {
    hart: &'a mut Hart,
    memory: &'a mut HartMemory<'a, H>,
}

impl<'a, H: MmioHost> Executor<'a, H> {
    pub(crate) fn new(hart: &'a mut Hart, memory: &'a mut HartMemory<'a, H>) -> Self {
        Self { hart, memory }
    }

    /// Runs `instruction`, leaving `pc` pointing at the next instruction on
    /// success. On fault, returns the cause and the cause-specific `mtval`;
    /// registers and `pc` are left exactly as they were before the faulting
    /// access, so the trap handler's `mepc` points back at the instruction
    /// that faulted.
    pub(crate) fn execute(&mut self, instruction: Instruction) -> Option<(Cause, u32)> {
        let pc = self.hart.pc();
        let mut next_pc = pc.wrapping_add(4);
        trace!("executing {instruction:?} at pc {pc:#010x}");

        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let a = self.hart.x(src);
                let value = reg_imm(op, a, immediate);
                self.set(dest, value);
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let a = self.hart.x(src);
                let value = reg_shift_imm(op, a, shift_amount_u5);
                self.set(dest, value);
            }
            Instruction::Lui { dest, immediate } => self.set(dest, immediate as u32),
            Instruction::Auipc { dest, immediate } => {
                self.set(dest, pc.wrapping_add(immediate as u32))
            }
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let a = self.hart.x(src1);
                let b = self.hart.x(src2);
                self.set(dest, reg_reg(op, a, b));
            }
            Instruction::Jal { dest, offset } => {
                self.set(dest, pc.wrapping_add(4));
                next_pc = pc.wrapping_add(offset as u32);
            }
            Instruction::Jalr { dest, base, offset } => {
                let target = self.hart.x(base).wrapping_add(offset as u32) & !1;
                self.set(dest, pc.wrapping_add(4));
                next_pc = target;
            }
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let a = self.hart.x(src1);
                let b = self.hart.x(src2);
                if branch_taken(condition, a, b) {
                    next_pc = pc.wrapping_add(offset as u32);
                }
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let addr = self.hart.x(base).wrapping_add(offset as u32);
                let mem_width = load_width(width);
                let raw = match self.memory.load(mem_width, addr) {
                    Ok(v) => v,
                    Err(cause) => return Some((cause, addr)),
                };
                self.set(dest, extend_load(width, raw));
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let addr = self.hart.x(base).wrapping_add(offset as u32);
                let value = self.hart.x(src);
                if let Err(cause) = self.memory.store(store_width(width), addr, value) {
                    return Some((cause, addr));
                }
                self.hart.reservation = None;
            }
            Instruction::Fence | Instruction::FenceI => {
                // Single-hart, in-order core: both are no-ops.
            }
            Instruction::Amo {
                op,
                src,
                addr,
                dest,
                ..
            } => {
                let address = self.hart.x(addr);
                if let Some(fault) = self.amo(op, address, src, dest) {
                    return Some(fault);
                }
            }
            Instruction::Ecall => {
                let cause = if self.hart.privilege() == crate::PrivilegeLevel::Machine {
                    Cause::MachineEnvironmentCall
                } else {
                    Cause::UserEnvironmentCall
                };
                return Some((cause, 0));
            }
            Instruction::Ebreak => return Some((Cause::Breakpoint, pc)),
            Instruction::Mret => {
                trap::mret(self.hart);
                next_pc = self.hart.pc();
            }
            Instruction::Wfi => {
                self.hart.wfi = true;
            }
            Instruction::Csr {
                op,
                dest,
                csr,
                src,
            } => {
                let operand = self.hart.x(src);
                let skip_write = op != CsrOp::ReadWrite && src == Specifier::X0;
                self.csr_op(op, dest, csr, operand, skip_write);
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let skip_write = op != CsrOp::ReadWrite && immediate == 0;
                self.csr_op(op, dest, csr, immediate, skip_write);
            }
        }

        *self.hart.regs.pc_mut() = next_pc;
        None
    }

    fn set(&mut self, dest: Specifier, value: u32) {
        self.hart.regs.set_x(dest, value);
    }

    fn csr_op(&mut self, op: CsrOp, dest: Specifier, csr_num: u16, operand: u32, skip_write: bool) {
        let old = csr::read(self.hart, csr_num, self.memory.host());
        self.set(dest, old);
        if skip_write {
            return;
        }
        let new = match op {
            CsrOp::ReadWrite => operand,
            CsrOp::ReadSet => old | operand,
            CsrOp::ReadClear => old & !operand,
        };
        csr::write(self.hart, csr_num, new, self.memory.host());
    }

    /// AMO/LR/SC: all are word-only and fault on any address outside RAM
    /// rather than reaching MMIO. A successful write anywhere invalidates the
    /// hart's LR reservation; `Lr` is the only op that establishes one.
    fn amo(
        &mut self,
        op: AmoOp,
        addr: u32,
        src: Specifier,
        dest: Specifier,
    ) -> Option<(Cause, u32)> {
        if op == AmoOp::Lr {
            let value = match self.memory.amo_read(addr) {
                Ok(v) => v,
                Err(cause) => return Some((cause, addr)),
            };
            self.hart.reservation = Some(addr);
            self.set(dest, value);
            return None;
        }

        if op == AmoOp::Sc {
            let reserved = self.hart.reservation == Some(addr);
            self.hart.reservation = None;
            if reserved {
                let value = self.hart.x(src);
                if let Err(cause) = self.memory.amo_write(addr, value) {
                    return Some((cause, addr));
                }
                self.set(dest, 0);
            } else {
                self.set(dest, 1);
            }
            return None;
        }

        let old = match self.memory.amo_read(addr) {
            Ok(v) => v,
            Err(cause) => return Some((cause, addr)),
        };
        let operand = self.hart.x(src);
        let new = match op {
            AmoOp::Swap => operand,
            AmoOp::Add => old.wrapping_add(operand),
            AmoOp::Xor => old ^ operand,
            AmoOp::And => old & operand,
            AmoOp::Or => old | operand,
            AmoOp::Min => ((old as i32).min(operand as i32)) as u32,
            AmoOp::Max => ((old as i32).max(operand as i32)) as u32,
            AmoOp::Minu => old.min(operand),
            AmoOp::Maxu => old.max(operand),
            AmoOp::Lr | AmoOp::Sc => unreachable!("handled above"),
        };
        if let Err(cause) = self.memory.amo_write(addr, new) {
            return Some((cause, addr));
        }
        self.hart.reservation = None;
        self.set(dest, old);
        None
    }
}

fn reg_imm(op: RegImmOp, a: u32, immediate: i32) -> u32 {
    let imm = immediate as u32;
    match op {
        RegImmOp::Addi => a.wrapping_add(imm),
        RegImmOp::Slti => u32::from((a as i32) < immediate),
        RegImmOp::Sltiu => u32::from(a < imm),
        RegImmOp::Xori => a ^ imm,
        RegImmOp::Ori => a | imm,
        RegImmOp::Andi => a & imm,
    }
}

fn reg_shift_imm(op: RegShiftImmOp, a: u32, shift: u32) -> u32 {
    match op {
        RegShiftImmOp::Slli => a << shift,
        RegShiftImmOp::Srli => a >> shift,
        RegShiftImmOp::Srai => ((a as i32) >> shift) as u32,
    }
}

/// M-extension division never traps: divide-by-zero and the signed-overflow
/// case both have fixed results.
fn reg_reg(op: RegRegOp, a: u32, b: u32) -> u32 {
    let shift = b & 0x1F;
    match op {
        RegRegOp::Add => a.wrapping_add(b),
        RegRegOp::Sub => a.wrapping_sub(b),
        RegRegOp::Sll => a << shift,
        RegRegOp::Slt => u32::from((a as i32) < (b as i32)),
        RegRegOp::Sltu => u32::from(a < b),
        RegRegOp::Xor => a ^ b,
        RegRegOp::Srl => a >> shift,
        RegRegOp::Sra => ((a as i32) >> shift) as u32,
        RegRegOp::Or => a | b,
        RegRegOp::And => a & b,
        RegRegOp::Mul => (a as i32).wrapping_mul(b as i32) as u32,
        RegRegOp::Mulh => {
            (((a as i32) as i64).wrapping_mul((b as i32) as i64) >> 32) as u32
        }
        RegRegOp::Mulhsu => (((a as i32) as i64).wrapping_mul(b as i64) >> 32) as u32,
        RegRegOp::Mulhu => ((a as u64).wrapping_mul(b as u64) >> 32) as u32,
        RegRegOp::Div => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                u32::MAX
            } else if a == i32::MIN && b == -1 {
                a as u32
            } else {
                (a.wrapping_div(b)) as u32
            }
        }
        RegRegOp::Divu => {
            if b == 0 {
                u32::MAX
            } else {
                a / b
            }
        }
        RegRegOp::Rem => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                a as u32
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                (a.wrapping_rem(b)) as u32
            }
        }
        RegRegOp::Remu => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
    }
}

fn branch_taken(condition: BranchCondition, a: u32, b: u32) -> bool {
    match condition {
        BranchCondition::Beq => a == b,
        BranchCondition::Bne => a != b,
        BranchCondition::Blt => (a as i32) < (b as i32),
        BranchCondition::Bge => (a as i32) >= (b as i32),
        BranchCondition::Bltu => a < b,
        BranchCondition::Bgeu => a >= b,
    }
}

fn load_width(width: LoadWidth) -> Width {
    match width {
        LoadWidth::Lb | LoadWidth::Lbu => Width::Byte,
        LoadWidth::Lh | LoadWidth::Lhu => Width::Half,
        LoadWidth::Lw => Width::Word,
    }
}

fn store_width(width: StoreWidth) -> Width {
    match width {
        StoreWidth::Sb => Width::Byte,
        StoreWidth::Sh => Width::Half,
        StoreWidth::Sw => Width::Word,
    }
}

fn extend_load(width: LoadWidth, raw: u32) -> u32 {
    match width {
        LoadWidth::Lb => (raw as u8 as i8 as i32) as u32,
        LoadWidth::Lh => (raw as u16 as i16 as i32) as u32,
        LoadWidth::Lbu | LoadWidth::Lhu | LoadWidth::Lw => raw,
    }
}
