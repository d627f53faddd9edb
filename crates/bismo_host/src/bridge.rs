//! Hardware-in-the-loop transport to a register-level accelerator
//! simulation.
//!
//! The simulation listens on TCP and serves single-word register and memory
//! transactions. Every transaction is one opcode byte followed by
//! little-endian 32-bit fields, and is answered with one 32-bit word.

use anyhow::Result;
use bismo_core::AccelError;
use bismo_core::admission::AdmitMode;
use bismo_core::driver::AccelDriver;
use bismo_core::platform::{AccelBuffer, Platform, SpinLimit};
use bismo_core::validate::FETCH_ALIGN;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use tracing::{debug, info};

/// Write one word: address, data. Answered with an acknowledgment word.
const CMD_WRITE: u8 = 0x02;

/// Read one word: address. Answered with the value.
const CMD_READ: u8 = 0x03;

/// Bus address of register 0. Registers are one word apart.
const REG_WINDOW: u32 = 0x4000_0000;

/// Bus address of accelerator external memory address 0.
const MEM_WINDOW: u32 = 0x8000_0000;

/// Size of the external memory the bridge allocates from.
const MEM_BYTES: u64 = 0x1000_0000;

pub struct HardwareBridge {
    stream: TcpStream,
    next_addr: u64,
}

impl HardwareBridge {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        info!(addr, "connected to accelerator simulation");
        Ok(Self {
            stream,
            next_addr: 0,
        })
    }

    fn write_word(&mut self, addr: u32, data: u32) -> io::Result<()> {
        self.stream.write_all(&[CMD_WRITE])?;
        self.stream.write_all(&addr.to_le_bytes())?;
        self.stream.write_all(&data.to_le_bytes())?;
        let mut ack = [0u8; 4];
        self.stream.read_exact(&mut ack)
    }

    fn read_word(&mut self, addr: u32) -> io::Result<u32> {
        self.stream.write_all(&[CMD_READ])?;
        self.stream.write_all(&addr.to_le_bytes())?;
        let mut data = [0u8; 4];
        self.stream.read_exact(&mut data)?;
        Ok(u32::from_le_bytes(data))
    }
}

fn reg_addr(reg: u32) -> u32 {
    REG_WINDOW + reg * 4
}

fn link_error(what: &str, e: io::Error) -> AccelError {
    AccelError::transport(format!("{}: {}", what, e))
}

impl Platform for HardwareBridge {
    fn write_reg(&mut self, reg: u32, value: u32) -> bismo_core::Result<()> {
        self.write_word(reg_addr(reg), value)
            .map_err(|e| link_error("register write", e))
    }

    fn read_reg(&mut self, reg: u32) -> bismo_core::Result<u32> {
        self.read_word(reg_addr(reg))
            .map_err(|e| link_error("register read", e))
    }

    fn alloc_accel_buffer(&mut self, bytes: usize) -> bismo_core::Result<AccelBuffer> {
        let addr = self.next_addr.next_multiple_of(FETCH_ALIGN);
        let end = addr + bytes as u64;
        if end > MEM_BYTES {
            return Err(AccelError::transport(format!(
                "accelerator memory exhausted allocating {} bytes",
                bytes
            )));
        }
        self.next_addr = end;
        debug!(addr, bytes, "accelerator buffer allocated");
        Ok(AccelBuffer { addr, len: bytes })
    }

    fn copy_host_to_accel(&mut self, src: &[u8], dst: AccelBuffer) -> bismo_core::Result<()> {
        if src.len() > dst.len {
            return Err(AccelError::transport(format!(
                "copy of {} bytes exceeds {}-byte buffer",
                src.len(),
                dst.len
            )));
        }
        for (i, chunk) in src.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            let addr = MEM_WINDOW + dst.addr as u32 + (i * 4) as u32;
            self.write_word(addr, u32::from_le_bytes(word))
                .map_err(|e| link_error("memory write", e))?;
        }
        Ok(())
    }

    fn platform_id(&self) -> &str {
        "tcp-bridge"
    }
}

/// Discovers the simulated accelerator, primes it and optionally runs a
/// stream file on it in immediate mode.
pub fn run_hil(addr: &str, stream: Option<PathBuf>, spin: SpinLimit) -> Result<()> {
    let bridge = HardwareBridge::connect(addr)?;
    let mut drv = AccelDriver::new(bridge)?.with_spin_limit(spin);
    print!("{}", drv.caps());

    drv.reset()?;
    drv.init_resource_pools()?;
    println!("Token pools primed.");

    if let Some(path) = stream {
        let instrs = bismo_io::loader::load_instr_file(&path)?;
        drv.set_stage_enables(true, true, true)?;
        drv.push_stream(&instrs, AdmitMode::Immediate)?;
        drv.wait_idle()?;
        println!("{} instructions completed.", instrs.len());
    }
    Ok(())
}
