//! Memory image classification and MMIO dispatch, and the step loop's outer
//! contract: advancing time, updating the CLINT, and handing a bounded batch
//! of instructions to the hart.

use crate::bus::MmioHost;
use crate::hart::clint::Clint;
use crate::hart::{BatchOutcome, Cause, Hart};
use crate::resources::Ram;
use crate::RAM_IMAGE_OFFSET;
use log::{debug, warn};

/// MMIO address of the UART data register (TX on store, RX on load).
const UART_DATA: u32 = 0x1000_0000;
/// MMIO address of the UART Line Status Register (read-only).
const UART_LSR: u32 = 0x1000_0005;
/// MMIO address of `mtimecmp`'s low 32 bits (write-only from the guest's point of view).
const MTIMECMP_LOW: u32 = 0x1100_4000;
const MTIMECMP_HIGH: u32 = 0x1100_4004;
/// MMIO address of `mtime`'s low/high 32 bits (read-only).
const MTIME_LOW: u32 = 0x1100_bff8;
const MTIME_HIGH: u32 = 0x1100_bffc;
/// SYSCON: a store here asks the host to end the batch with the stored value.
const SYSCON: u32 = 0x1110_0000;

/// A complete machine: RAM, a single hart, and its CLINT.
#[derive(Debug, Clone)]
pub struct Board {
    ram: Ram,
    hart: Hart,
    clint: Clint,
}

/// The outcome of a [`Board::step`] call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepResult {
    /// The full `max_insns` batch ran to completion without being asked to stop.
    Completed,
    /// The hart is waiting for an interrupt; no instruction was executed.
    Idle,
    /// A store to the SYSCON (or any other) MMIO address asked the host to end
    /// the batch with this value (reboot/poweroff codes, by convention).
    HostExit(u32),
    /// Strict mode: a trap occurred and was not locally recovered.
    Fault,
}

impl Board {
    pub fn new(ram_size: u32, hart_id: u32, dtb_addr: u32) -> Self {
        Self {
            ram: Ram::new(ram_size),
            hart: Hart::new(hart_id, dtb_addr),
            clint: Clint::new(),
        }
    }

    pub fn hart(&self) -> &Hart {
        &self.hart
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    /// Runs at most `max_insns` instruction retirements.
    ///
    /// In strict mode, any unrecovered trap (i.e. any trap at all, since this
    /// core always resolves traps locally) ends the batch with
    /// [`StepResult::Fault`] instead of continuing from `mtvec`.
    pub fn step(
        &mut self,
        host: &mut impl MmioHost,
        elapsed_us: u32,
        max_insns: u32,
        strict: bool,
    ) -> StepResult {
        self.hart.advance_time(elapsed_us as u64);
        let timer_pending = self.clint.timer_pending(self.hart.cycle());
        self.hart.set_mtip(timer_pending);

        if self.hart.is_waiting_for_interrupt() && !self.hart.has_pending_interrupt() {
            return StepResult::Idle;
        }

        let mut dispatching_host = DispatchingHost {
            host,
            clint: &mut self.clint,
            cyclel: self.hart.cyclel(),
            cycleh: self.hart.cycleh(),
        };
        match self
            .hart
            .run_batch(&mut self.ram, &mut dispatching_host, max_insns, strict)
        {
            BatchOutcome::Completed => StepResult::Completed,
            BatchOutcome::HostExit(code) => {
                debug!("batch ended via host exit code {code:#x}");
                StepResult::HostExit(code)
            }
            BatchOutcome::Fault => {
                warn!("strict mode: unrecovered fault, giving up");
                StepResult::Fault
            }
        }
    }
}

/// Wraps the caller's [`MmioHost`] so [`HartMemory`] only has to know about a
/// single host-like thing, while CLINT registers are intercepted before ever
/// reaching the real host: the CLINT is core-local state, not a host device.
///
/// `cyclel`/`cycleh` are the hart's cycle/`mtime` counter as of the start of
/// this batch, captured here (rather than held as a hart reference) because
/// [`Hart::run_batch`] already borrows the hart mutably for the whole batch.
/// Like the timer-pending check in [`Board::step`], `mtime` MMIO reads are
/// only as fresh as the current batch boundary, not the current instruction.
struct DispatchingHost<'a, H: MmioHost> {
    host: &'a mut H,
    clint: &'a mut Clint,
    cyclel: u32,
    cycleh: u32,
}

impl<H: MmioHost> MmioHost for DispatchingHost<'_, H> {
    fn control_store(&mut self, addr: u32, val: u32) -> u32 {
        match addr {
            MTIMECMP_LOW => {
                self.clint.set_mtimecmp_low(val);
                0
            }
            MTIMECMP_HIGH => {
                self.clint.set_mtimecmp_high(val);
                0
            }
            _ => self.host.control_store(addr, val),
        }
    }

    fn control_load(&mut self, addr: u32) -> u32 {
        match addr {
            MTIME_LOW => self.cyclel,
            MTIME_HIGH => self.cycleh,
            _ => self.host.control_load(addr),
        }
    }

    fn other_csr_read(&mut self, csr: u16) -> u32 {
        self.host.other_csr_read(csr)
    }

    fn other_csr_write(&mut self, csr: u16, value: u32) {
        self.host.other_csr_write(csr, value)
    }
}

/// Byte width of a memory access.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    fn len(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }
}

/// Classifies and dispatches loads/stores for one batch: RAM, the CLINT's own
/// registers, or the host's MMIO hooks. Also tracks a pending
/// host-exit code for the current instruction, consumed by
/// [`crate::hart::Hart::run_batch`] after each retirement.
pub(crate) struct HartMemory<'a, H: MmioHost> {
    ram: &'a mut Ram,
    host: &'a mut H,
    host_exit_code: Option<u32>,
}

impl<'a, H: MmioHost> HartMemory<'a, H> {
    pub(crate) fn new(ram: &'a mut Ram, host: &'a mut H) -> Self {
        Self {
            ram,
            host,
            host_exit_code: None,
        }
    }

    pub(crate) fn take_host_exit(&mut self) -> Option<u32> {
        self.host_exit_code.take()
    }

    /// Gives the execute unit a way to reach CSR delegation hooks without
    /// otherwise exposing the host to instruction semantics.
    pub(crate) fn host(&mut self) -> &mut H {
        self.host
    }

    /// Fetches an instruction word. Fetch never goes through MMIO: anything
    /// outside RAM is an instruction access fault, and a misaligned `pc` is an
    /// instruction-address-misaligned exception.
    pub(crate) fn fetch(&self, pc: u32) -> Result<u32, Cause> {
        if pc % 4 != 0 {
            return Err(Cause::InstructionAddressMisaligned);
        }
        self.ram_offset(pc)
            .and_then(|off| self.ram.read_u32(off))
            .ok_or(Cause::InstructionAccessFault)
    }

    /// Performs a load of `width` bytes at `addr`, returning the raw
    /// zero-extended-to-u32 bit pattern; sign extension (if any) is the
    /// caller's job.
    pub(crate) fn load(&mut self, width: Width, addr: u32) -> Result<u32, Cause> {
        if !aligned(addr, width) {
            return Err(Cause::LoadAddressMisaligned);
        }
        match self.classify(addr) {
            Region::Ram => self
                .ram_offset(addr)
                .and_then(|off| self.read_ram(off, width))
                .ok_or(Cause::LoadAccessFault),
            Region::Mmio => Ok(self.host.control_load(addr) & width_mask(width)),
            Region::OutOfRange => Err(Cause::LoadAccessFault),
        }
    }

    /// Performs a store of `width` bytes at `addr`. On success, a non-zero
    /// host-exit request (e.g. from SYSCON) is latched for the caller to pick
    /// up via [`Self::take_host_exit`] once the instruction has otherwise
    /// retired (the store's own `pc` advance happens first, then the exit is
    /// observed).
    pub(crate) fn store(&mut self, width: Width, addr: u32, value: u32) -> Result<(), Cause> {
        if !aligned(addr, width) {
            return Err(Cause::StoreAddressMisaligned);
        }
        match self.classify(addr) {
            Region::Ram => {
                let wrote = self
                    .ram_offset(addr)
                    .map(|off| self.write_ram(off, width, value))
                    .unwrap_or(false);
                if wrote {
                    Ok(())
                } else {
                    Err(Cause::StoreAccessFault)
                }
            }
            Region::Mmio => {
                // Always presents 32-bit values to MMIO hooks regardless of
                // access width; a host serving a byte-wide device just reads
                // the low bits of the value it gets.
                let code = self.host.control_store(addr, value);
                if code != 0 {
                    self.host_exit_code = Some(code);
                }
                Ok(())
            }
            Region::OutOfRange => Err(Cause::StoreAccessFault),
        }
    }

    /// Reads a word for an AMO/LR. AMOs to non-RAM addresses fault rather than
    /// reaching MMIO.
    pub(crate) fn amo_read(&self, addr: u32) -> Result<u32, Cause> {
        if !aligned(addr, Width::Word) {
            return Err(Cause::LoadAddressMisaligned);
        }
        self.ram_offset(addr)
            .and_then(|off| self.ram.read_u32(off))
            .ok_or(Cause::LoadAccessFault)
    }

    /// Writes a word for an AMO/SC. See [`Self::amo_read`].
    pub(crate) fn amo_write(&mut self, addr: u32, value: u32) -> Result<(), Cause> {
        if !aligned(addr, Width::Word) {
            return Err(Cause::StoreAddressMisaligned);
        }
        let wrote = self
            .ram_offset(addr)
            .map(|off| self.ram.write_u32(off, value))
            .unwrap_or(false);
        if wrote {
            Ok(())
        } else {
            Err(Cause::StoreAccessFault)
        }
    }

    fn classify(&self, addr: u32) -> Region {
        if addr >= RAM_IMAGE_OFFSET {
            if addr - RAM_IMAGE_OFFSET < self.ram.len() {
                Region::Ram
            } else {
                Region::OutOfRange
            }
        } else {
            Region::Mmio
        }
    }

    fn ram_offset(&self, addr: u32) -> Option<u32> {
        addr.checked_sub(RAM_IMAGE_OFFSET)
            .filter(|&off| off < self.ram.len())
    }

    fn read_ram(&self, offset: u32, width: Width) -> Option<u32> {
        match width {
            Width::Byte => self.ram.read_u8(offset).map(u32::from),
            Width::Half => self.ram.read_u16(offset).map(u32::from),
            Width::Word => self.ram.read_u32(offset),
        }
    }

    fn write_ram(&mut self, offset: u32, width: Width, value: u32) -> bool {
        match width {
            Width::Byte => self.ram.write_u8(offset, value as u8),
            Width::Half => self.ram.write_u16(offset, value as u16),
            Width::Word => self.ram.write_u32(offset, value),
        }
    }
}

enum Region {
    Ram,
    Mmio,
    OutOfRange,
}

fn aligned(addr: u32, width: Width) -> bool {
    addr % width.len() == 0
}

fn width_mask(width: Width) -> u32 {
    match width {
        Width::Byte => 0xFF,
        Width::Half => 0xFFFF,
        Width::Word => 0xFFFF_FFFF,
    }
}

// The UART and SYSCON addresses are not special-cased here beyond being "not
// RAM, not CLINT": they pass straight through to the host via `control_load`/
// `control_store`, which is all `HartMemory` owes them. MTIME_LOW/HIGH *are*
// special-cased, in `DispatchingHost::control_load` above, since they read
// the hart's own counter rather than anything the host owns.
#[allow(dead_code)]
const _DOCUMENTED_MMIO_ADDRESSES: [u32; 3] = [UART_DATA, UART_LSR, SYSCON];

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHost {
        stores: Vec<(u32, u32)>,
        load_value: u32,
    }
    impl MmioHost for RecordingHost {
        fn control_store(&mut self, addr: u32, val: u32) -> u32 {
            self.stores.push((addr, val));
            if addr == SYSCON {
                val
            } else {
                0
            }
        }
        fn control_load(&mut self, _addr: u32) -> u32 {
            self.load_value
        }
    }

    #[test]
    fn uart_store_reaches_host_unchanged() {
        let mut ram = Ram::new(16);
        let mut host = RecordingHost {
            stores: vec![],
            load_value: 0,
        };
        let mut mem = HartMemory::new(&mut ram, &mut host);
        mem.store(Width::Byte, UART_DATA, 0x41).unwrap();
        assert_eq!(host.stores, vec![(UART_DATA, 0x41)]);
        assert_eq!(mem.take_host_exit(), None);
    }

    #[test]
    fn syscon_store_latches_exit_code() {
        let mut ram = Ram::new(16);
        let mut host = RecordingHost {
            stores: vec![],
            load_value: 0,
        };
        let mut mem = HartMemory::new(&mut ram, &mut host);
        mem.store(Width::Word, SYSCON, 0x5555).unwrap();
        assert_eq!(mem.take_host_exit(), Some(0x5555));
    }

    #[test]
    fn ram_round_trips() {
        let mut ram = Ram::new(16);
        let mut host = RecordingHost {
            stores: vec![],
            load_value: 0,
        };
        let mut mem = HartMemory::new(&mut ram, &mut host);
        mem.store(Width::Word, RAM_IMAGE_OFFSET + 4, 0xCAFEBABE)
            .unwrap();
        assert_eq!(
            mem.load(Width::Word, RAM_IMAGE_OFFSET + 4).unwrap(),
            0xCAFEBABE
        );
    }

    #[test]
    fn access_above_ram_faults() {
        let mut ram = Ram::new(16);
        let mut host = RecordingHost {
            stores: vec![],
            load_value: 0,
        };
        let mut mem = HartMemory::new(&mut ram, &mut host);
        assert_eq!(
            mem.load(Width::Word, RAM_IMAGE_OFFSET + 1000),
            Err(Cause::LoadAccessFault)
        );
    }

    #[test]
    fn mtime_load_reads_hart_cycle_not_host() {
        let mut host = RecordingHost {
            stores: vec![],
            load_value: 0xDEAD_BEEF,
        };
        let mut dispatching = DispatchingHost {
            host: &mut host,
            clint: &mut Clint::new(),
            cyclel: 0x1234_5678,
            cycleh: 0x0000_0001,
        };
        assert_eq!(dispatching.control_load(MTIME_LOW), 0x1234_5678);
        assert_eq!(dispatching.control_load(MTIME_HIGH), 0x0000_0001);
        // Any other address still falls through to the real host unchanged.
        assert_eq!(dispatching.control_load(UART_DATA), 0xDEAD_BEEF);
    }

    #[test]
    fn misaligned_ram_load_faults() {
        let mut ram = Ram::new(16);
        let mut host = RecordingHost {
            stores: vec![],
            load_value: 0,
        };
        let mut mem = HartMemory::new(&mut ram, &mut host);
        assert_eq!(
            mem.load(Width::Word, RAM_IMAGE_OFFSET + 1),
            Err(Cause::LoadAddressMisaligned)
        );
    }
}
