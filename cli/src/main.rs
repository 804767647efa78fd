use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use crossterm::event::{self, Event, KeyCode};
use crossterm::terminal;
use log::{info, warn};
use rv32ima_core::{Board, MmioHost, StepResult, RAM_IMAGE_OFFSET};

const UART_DATA: u32 = 0x1000_0000;
const UART_LSR: u32 = 0x1000_0005;
const SYSCON_POWEROFF: u32 = 0x5555;
const SYSCON_REBOOT: u32 = 0x7777;

/// Instructions to retire per call to `Board::step` before yielding back to
/// the host loop to poll the keyboard and recompute elapsed time.
const INSNS_PER_SLICE: u32 = 4096;

#[derive(Parser, Debug)]
#[command(version, about = "Runs a raw RV32IMA binary image", long_about = None)]
struct Args {
    /// Flat binary image loaded at the start of RAM.
    image: PathBuf,

    /// Device tree blob, loaded near the top of RAM and pointed to by a1 on reset.
    #[arg(long)]
    dtb: Option<PathBuf>,

    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    ram_size: u32,

    /// End a step batch on the first unrecovered trap instead of continuing
    /// from mtvec.
    #[arg(long)]
    strict: bool,
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let image = fs::read(&args.image)?;
    if image.len() as u32 > args.ram_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "image is larger than --ram-size",
        ));
    }

    let dtb = args.dtb.map(fs::read).transpose()?;
    let dtb_addr = dtb
        .as_ref()
        .map(|d| RAM_IMAGE_OFFSET + args.ram_size - d.len() as u32)
        .unwrap_or(0);

    let mut board = Board::new(args.ram_size, 0, dtb_addr);
    board.ram_mut().load(0, &image);
    if let Some(dtb) = &dtb {
        board.ram_mut().load(args.ram_size - dtb.len() as u32, dtb);
    }

    info!(
        "loaded {} byte image ({} byte ram, dtb at {dtb_addr:#010x})",
        image.len(),
        args.ram_size
    );

    let _raw_mode = RawModeGuard::enable()?;
    let mut host = Console::default();
    let mut last_tick = Instant::now();

    loop {
        pump_keyboard(&mut host.rx)?;

        let elapsed_us = last_tick.elapsed().as_micros().min(u32::MAX as u128) as u32;
        last_tick = Instant::now();

        match board.step(&mut host, elapsed_us, INSNS_PER_SLICE, args.strict) {
            StepResult::Completed | StepResult::Idle => {}
            StepResult::HostExit(SYSCON_REBOOT) => {
                info!("guest requested reboot");
                return Ok(());
            }
            StepResult::HostExit(code) => {
                info!("guest halted with code {code:#x}");
                return Ok(());
            }
            StepResult::Fault => {
                warn!("unrecovered fault at pc {:#010x}, stopping", board.hart().pc());
                return Ok(());
            }
        }
    }
}

fn pump_keyboard(rx: &mut VecDeque<u8>) -> io::Result<()> {
    while event::poll(std::time::Duration::from_millis(0))? {
        if let Event::Key(key) = event::read()? {
            match key.code {
                KeyCode::Char(c) => {
                    let mut buf = [0u8; 4];
                    for b in c.encode_utf8(&mut buf).as_bytes() {
                        rx.push_back(*b);
                    }
                }
                KeyCode::Enter => rx.push_back(b'\r'),
                KeyCode::Backspace => rx.push_back(0x7f),
                KeyCode::Esc => rx.push_back(0x1b),
                _ => {}
            }
        }
    }
    Ok(())
}

/// The host side of the UART and SYSCON: keyboard bytes in, console bytes
/// out, reboot/poweroff codes surfaced as [`StepResult::HostExit`].
#[derive(Default)]
struct Console {
    rx: VecDeque<u8>,
}

impl MmioHost for Console {
    fn control_store(&mut self, addr: u32, val: u32) -> u32 {
        match addr {
            UART_DATA => {
                let mut stdout = io::stdout();
                let _ = stdout.write_all(&[val as u8]);
                let _ = stdout.flush();
                0
            }
            _ if addr == SYSCON_ADDR => match val {
                SYSCON_POWEROFF => SYSCON_POWEROFF,
                SYSCON_REBOOT => SYSCON_REBOOT,
                other => other,
            },
            _ => 0,
        }
    }

    fn control_load(&mut self, addr: u32) -> u32 {
        match addr {
            UART_DATA => self.rx.pop_front().map(u32::from).unwrap_or(0),
            UART_LSR => 0x60 | u32::from(!self.rx.is_empty()),
            _ => 0,
        }
    }
}

const SYSCON_ADDR: u32 = 0x1110_0000;

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
