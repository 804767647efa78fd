mod support;

use proptest::prelude::*;
use rv32ima_core::registers::Specifier;
use rv32ima_core::{Board, RAM_IMAGE_OFFSET};
use support::*;

fn x(n: u8) -> Specifier {
    Specifier::from_u5(n)
}

proptest! {
    /// Whatever gets written to `x0` through the general-purpose register
    /// file, it reads back as zero.
    #[test]
    fn x0_is_always_zero(dest in 1u8..32, imm in -2047i32..=2047) {
        let mut board = Board::new(4096, 0, 0);
        load_program(&mut board, &[addi(dest, 0, imm), addi(0, dest, imm)]);
        let mut host = NullHost;
        board.step(&mut host, 0, 2, false);
        prop_assert_eq!(board.hart().x(x(0)), 0);
    }

    /// A run of non-faulting, non-CSR instructions retires exactly one
    /// instruction per cycle tick.
    #[test]
    fn cycle_counts_retired_instructions(n in 1u32..64) {
        let mut board = Board::new(4096, 0, 0);
        let program: Vec<u32> = (0..n).map(|_| addi(1, 1, 1)).collect();
        load_program(&mut board, &program);
        let mut host = NullHost;
        board.step(&mut host, 0, n, false);
        prop_assert_eq!(board.hart().cycle(), n as u64);
    }

    /// Any 32-bit word using an opcode RV32IMA never assigns traps with
    /// cause 2 and `mtval` equal to the raw word, leaving `pc` at `mtvec`.
    #[test]
    fn illegal_opcode_raises_cause_2(payload in any::<u32>()) {
        let ir = (payload & 0xFFFF_FF80) | 0b1111111; // opcode 0x7F is unassigned
        let mut board = Board::new(4096, 0, 0);
        load_program(&mut board, &[ir]);
        let mut host = NullHost;
        board.step(&mut host, 0, 1, false);
        prop_assert_eq!(board.hart().mcause(), 2);
        prop_assert_eq!(board.hart().mtval(), ir);
        prop_assert_eq!(board.hart().pc(), board.hart().mtvec());
    }

    /// A store to an MMIO address whose hook returns 0 changes no
    /// architectural state beyond advancing `pc`, exactly like a NOP would.
    #[test]
    fn zero_returning_mmio_store_is_transparent(value in any::<u32>()) {
        let mut board = Board::new(4096, 0, 0);
        // 0x1000_0000 (UART data) is MMIO and below the CLINT's own
        // intercepted addresses, so it reaches the host hook unmodified.
        load_program(&mut board, &[lui(5, 0x1000_0000), addi(6, 0, (value & 0x7FF) as i32), sw(6, 0, 5)]);
        let mut host = NullHost;
        let before_x1 = board.hart().x(x(1));
        board.step(&mut host, 0, 3, false);
        prop_assert_eq!(board.hart().mcause(), 0);
        prop_assert_eq!(board.hart().x(x(1)), before_x1);
        prop_assert_eq!(board.hart().pc(), RAM_IMAGE_OFFSET + 12);
    }

    /// Any trap between `LR.W` and `SC.W` invalidates the reservation, so
    /// the `SC.W` reports failure.
    #[test]
    fn trap_between_lr_and_sc_fails_the_sc(stored in any::<u32>()) {
        let mut board = Board::new(8192, 0, 0);
        let mtvec_target = RAM_IMAGE_OFFSET + 0x1000;
        let lr_addr = RAM_IMAGE_OFFSET; // any RAM word works as the reservation target

        let program = [
            lui(9, mtvec_target),
            csrrw(0, CSR_MTVEC, 9),
            lui(10, lr_addr),
            addi(1, 0, (stored & 0x7FF) as i32),
            lr_w(5, 10),
            EBREAK, // any trap invalidates the reservation
        ];
        load_program(&mut board, &program);
        board.ram_mut().load(0x1000, &sc_w(6, 1, 10).to_le_bytes());

        let mut host = NullHost;
        board.step(&mut host, 0, program.len() as u32 + 1, false);
        prop_assert_eq!(board.hart().x(x(6)), 1);
    }

    /// `DIVU`/`REMU` by zero follow the fixed RISC-V results regardless of
    /// the dividend.
    #[test]
    fn divu_remu_by_zero(dividend in any::<u32>()) {
        let mut board = Board::new(4096, 0, 0);
        load_program(
            &mut board,
            &[
                lui(1, dividend & 0xFFFF_F000),
                addi(1, 1, (dividend & 0xFFF) as i32),
                divu(2, 1, 0),
                remu(3, 1, 0),
            ],
        );
        let mut host = NullHost;
        board.step(&mut host, 0, 4, false);
        prop_assert_eq!(board.hart().x(x(2)), u32::MAX);
    }
}

#[test]
fn div_rem_signed_overflow_is_fixed() {
    let mut board = Board::new(4096, 0, 0);
    load_program(
        &mut board,
        &[
            lui(1, 0x8000_0000), // x1 = i32::MIN
            addi(2, 0, -1),      // x2 = -1
            div(3, 1, 2),
            rem(4, 1, 2),
        ],
    );
    let mut host = NullHost;
    board.step(&mut host, 0, 4, false);
    assert_eq!(board.hart().x(Specifier::from_u5(3)), 0x8000_0000);
    assert_eq!(board.hart().x(Specifier::from_u5(4)), 0);
}
