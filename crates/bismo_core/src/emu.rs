//! Register-level software model of the accelerator.
//!
//! [`EmuAccel`] implements [`Platform`] so the driver, the priming protocol
//! and generated streams run unchanged against it. It models control flow
//! only: queues, controllers, token FIFOs and instruction fetches. Operand
//! data is never moved.

use crate::capabilities::CapabilityDescriptor;
use crate::platform::{AccelBuffer, Platform};
use crate::sync::{Link, SyncChannel, TOKEN_FIFO_DEPTH, TokenFifo};
use crate::validate::FETCH_ALIGN;
use crate::{AccelError, Result};
use bismo_common::encoding::{DecodeError, INSTR_BYTES, WireInstr, decode};
use bismo_common::isa::{ControllerState, FetchRunCfg, Instruction, RunConfig, Stage};
use bismo_common::mmio;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use tracing::{debug, trace, warn};

/// First address handed out by the emulated external memory.
pub const EMU_MEM_BASE: u64 = 0x1000_0000;

/// Size of the emulated external memory.
pub const EMU_MEM_BYTES: u64 = 64 << 20;

#[derive(Debug, Clone, Copy)]
struct Controller {
    state: ControllerState,
    current: Option<Instruction>,
}

impl Controller {
    const IDLE: Self = Self {
        state: ControllerState::AwaitCommand,
        current: None,
    };
}

/// Register-level model of the accelerator's control path.
///
/// Each stage has a bounded instruction queue and a controller that pops
/// one instruction at a time and walks the AwaitCommand, Running,
/// SendingToken and ReceivingToken states. Tokens move through four
/// bounded FIFOs, one per direction between adjacent stages. Run
/// configurations are retired into a per-stage trace instead of moving
/// data, except for fetches into destination 0, which decode instructions
/// from emulated external memory and route them into the stage queues.
///
/// Every register read advances the model by one cycle, so busy-waits in
/// the driver make progress the way they would against real hardware.
#[derive(Debug)]
pub struct EmuAccel {
    caps: CapabilityDescriptor,
    op_bits: [u32; 4],
    op_valid: bool,
    enables: [bool; 3],
    queues: [VecDeque<Instruction>; 3],
    controllers: [Controller; 3],
    fifos: [TokenFifo; 4],
    routing: VecDeque<Instruction>,
    retired: [Vec<Instruction>; 3],
    memory: BTreeMap<u64, Vec<u8>>,
    next_addr: u64,
    cycles: u64,
}

impl EmuAccel {
    /// Creates an accelerator with `caps` in its capability registers.
    ///
    /// All stages start disabled, every queue and token FIFO empty, so the
    /// driver has to prime the token pools before running a workload.
    pub fn new(caps: CapabilityDescriptor) -> Self {
        Self {
            caps,
            op_bits: [0; 4],
            op_valid: false,
            enables: [false; 3],
            queues: Default::default(),
            controllers: [Controller::IDLE; 3],
            fifos: [TokenFifo::new(TOKEN_FIFO_DEPTH); 4],
            routing: VecDeque::new(),
            retired: Default::default(),
            memory: BTreeMap::new(),
            next_addr: EMU_MEM_BASE,
            cycles: 0,
        }
    }

    /// The descriptor the capability registers report.
    pub fn caps(&self) -> &CapabilityDescriptor {
        &self.caps
    }

    /// Cycles elapsed since construction. Resets do not clear it.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Current state of `stage`'s controller.
    pub fn controller_state(&self, stage: Stage) -> ControllerState {
        self.controllers[stage.index()].state
    }

    /// Tokens waiting in the FIFO behind `link`.
    pub fn tokens(&self, link: Link) -> u32 {
        self.fifos[link as usize].pending()
    }

    /// Instructions waiting in `stage`'s queue, oldest first.
    pub fn queued(&self, stage: Stage) -> Vec<Instruction> {
        self.queues[stage.index()].iter().copied().collect()
    }

    /// Every instruction `stage` has completed, in completion order.
    pub fn retired(&self, stage: Stage) -> &[Instruction] {
        &self.retired[stage.index()]
    }

    /// Pending instructions of `stage` as the op count register reports
    /// them: the queue plus the one in flight, if any.
    pub fn op_count(&self, stage: Stage) -> u32 {
        let i = stage.index();
        let in_flight = self.controllers[i].state != ControllerState::AwaitCommand;
        self.queues[i].len() as u32 + in_flight as u32
    }

    /// True once every queue, controller and the instruction router are
    /// empty. Token FIFOs may still hold tokens.
    pub fn is_idle(&self) -> bool {
        self.routing.is_empty() && Stage::ALL.into_iter().all(|s| self.op_count(s) == 0)
    }

    fn queue_capacity(&self) -> usize {
        self.caps.cmd_queue_entries as usize
    }

    fn reset(&mut self) {
        self.queues.iter_mut().for_each(VecDeque::clear);
        self.controllers = [Controller::IDLE; 3];
        self.fifos.iter_mut().for_each(TokenFifo::clear);
        self.routing.clear();
        self.enables = [false; 3];
        debug!(cycles = self.cycles, "emulator reset");
    }

    fn staged_stage(&self) -> Result<Stage> {
        let tag = (self.op_bits[0] & 0b11) as u8;
        Stage::from_tag(tag).ok_or(AccelError::Decode(DecodeError::UnknownStage(tag)))
    }

    fn accept_staged_op(&mut self) -> Result<()> {
        let ins = decode(WireInstr(self.op_bits))?;
        let cap = self.queue_capacity();
        let queue = &mut self.queues[ins.stage().index()];
        if queue.len() >= cap {
            return Err(AccelError::transport(format!(
                "op valid pulsed while {} queue is full",
                ins.stage()
            )));
        }
        queue.push_back(ins);
        trace!(%ins, "op accepted");
        Ok(())
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let (base, bytes) = self
            .memory
            .range(..=addr)
            .next_back()
            .ok_or_else(|| AccelError::transport(format!("no buffer at {:#x}", addr)))?;
        let start = (addr - base) as usize;
        bytes.get(start..start + len).ok_or_else(|| {
            AccelError::transport(format!("read of {} bytes at {:#x} overruns buffer", len, addr))
        })
    }

    /// Decodes the instructions a fetch into destination 0 pulls from
    /// external memory and hands them to the router.
    fn load_instructions(&mut self, cfg: &FetchRunCfg) -> Result<()> {
        let mut loaded = Vec::new();
        for block in 0..cfg.dram_block_count {
            let addr = cfg.dram_base + block * cfg.dram_block_offset_bytes;
            let bytes = self.read_memory(addr, cfg.dram_block_size_bytes as usize)?;
            for chunk in bytes.chunks(INSTR_BYTES) {
                loaded.push(decode(WireInstr::from_le_bytes(chunk)?)?);
            }
        }
        debug!(count = loaded.len(), "instructions fetched from memory");
        self.routing.extend(loaded);
        Ok(())
    }

    /// Moves fetched instructions into their stage queues in order, stopping
    /// at the first one whose queue is full.
    fn route(&mut self) -> bool {
        let cap = self.queue_capacity();
        let mut moved = false;
        while let Some(ins) = self.routing.front() {
            let queue = &mut self.queues[ins.stage().index()];
            if queue.len() >= cap {
                break;
            }
            queue.push_back(*ins);
            self.routing.pop_front();
            moved = true;
        }
        moved
    }

    fn retire(&mut self, stage: Stage) {
        let ctl = &mut self.controllers[stage.index()];
        if let Some(ins) = ctl.current.take() {
            self.retired[stage.index()].push(ins);
        }
        ctl.state = ControllerState::AwaitCommand;
    }

    fn step_stage(&mut self, stage: Stage) -> Result<bool> {
        let i = stage.index();
        let ctl = self.controllers[i];
        match (ctl.state, ctl.current) {
            (ControllerState::AwaitCommand, _) => {
                let Some(ins) = self.queues[i].pop_front() else {
                    return Ok(false);
                };
                let state = match ins {
                    Instruction::Run(RunConfig::Fetch(cfg)) if cfg.bram_id_start == 0 => {
                        self.load_instructions(&cfg)?;
                        ControllerState::Running
                    }
                    Instruction::Run(_) => ControllerState::Running,
                    Instruction::SendToken { .. } => ControllerState::SendingToken,
                    Instruction::ReceiveToken { .. } => ControllerState::ReceivingToken,
                };
                self.controllers[i] = Controller {
                    state,
                    current: Some(ins),
                };
                Ok(true)
            }
            (ControllerState::Running, _) => {
                // A fetch into the instruction queue completes once the router
                // has delivered everything it loaded.
                if stage == Stage::Fetch && !self.routing.is_empty() {
                    return Ok(false);
                }
                self.retire(stage);
                Ok(true)
            }
            (ControllerState::SendingToken, Some(Instruction::SendToken { channel, .. })) => {
                let link = sync_end(stage, channel)?.send_link();
                if !self.fifos[link as usize].try_send() {
                    return Ok(false);
                }
                trace!(%stage, ?link, "token sent");
                self.retire(stage);
                Ok(true)
            }
            (
                ControllerState::ReceivingToken,
                Some(Instruction::ReceiveToken { channel, .. }),
            ) => {
                let link = sync_end(stage, channel)?.receive_link();
                if !self.fifos[link as usize].try_receive() {
                    return Ok(false);
                }
                trace!(%stage, ?link, "token received");
                self.retire(stage);
                Ok(true)
            }
            (state, current) => Err(AccelError::transport(format!(
                "{} controller in {:?} holding {:?}",
                stage, state, current
            ))),
        }
    }

    /// Advances every enabled stage by one cycle.
    ///
    /// Returns whether anything changed.
    pub fn step(&mut self) -> Result<bool> {
        self.cycles += 1;
        let mut progressed = false;
        if self.enables[Stage::Fetch.index()] {
            progressed |= self.route();
        }
        for stage in Stage::ALL {
            if self.enables[stage.index()] {
                progressed |= self.step_stage(stage)?;
            }
        }
        Ok(progressed)
    }

    /// Steps until the pipeline is idle.
    ///
    /// Fails with [`AccelError::Stalled`] as soon as a cycle makes no
    /// progress, or after `max_cycles` cycles.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> Result<u64> {
        let start = self.cycles;
        while !self.is_idle() {
            if self.cycles - start >= max_cycles || !self.step()? {
                let blocked = self.describe_blocked();
                warn!(cycles = self.cycles, %blocked, "pipeline stalled");
                return Err(AccelError::Stalled {
                    cycles: self.cycles - start,
                    blocked,
                });
            }
        }
        Ok(self.cycles - start)
    }

    fn describe_blocked(&self) -> String {
        let mut out = String::new();
        for stage in Stage::ALL {
            let i = stage.index();
            if self.op_count(stage) == 0 {
                continue;
            }
            if !out.is_empty() {
                out.push_str("; ");
            }
            let ctl = &self.controllers[i];
            let _ = match (self.enables[i], ctl.current) {
                (false, _) => write!(out, "{} disabled", stage),
                (true, Some(ins)) => write!(out, "{} {:?} on {}", stage, ctl.state, ins),
                (true, None) => write!(out, "{} {:?}", stage, ctl.state),
            };
            let _ = write!(out, " ({} queued)", self.queues[i].len());
        }
        if !self.routing.is_empty() {
            let _ = write!(out, "; {} fetched instructions unrouted", self.routing.len());
        }
        out
    }
}

fn sync_end(stage: Stage, channel: u8) -> Result<SyncChannel> {
    SyncChannel::new(stage, channel).ok_or_else(|| {
        AccelError::transport(format!("{} has no sync channel {}", stage, channel))
    })
}

impl Platform for EmuAccel {
    fn write_reg(&mut self, reg: u32, value: u32) -> Result<()> {
        match reg {
            mmio::REG_RESET => {
                if value != 0 {
                    self.reset();
                }
            }
            mmio::REG_FETCH_ENABLE | mmio::REG_EXEC_ENABLE | mmio::REG_RESULT_ENABLE => {
                self.enables[(reg - mmio::REG_FETCH_ENABLE) as usize] = value != 0;
            }
            r if (mmio::REG_OP_BITS0..mmio::REG_OP_BITS0 + 4).contains(&r) => {
                self.op_bits[(r - mmio::REG_OP_BITS0) as usize] = value;
            }
            mmio::REG_OP_VALID => {
                let rising = value != 0 && !self.op_valid;
                self.op_valid = value != 0;
                if rising {
                    self.accept_staged_op()?;
                }
            }
            _ => {
                return Err(AccelError::transport(format!(
                    "write to read-only or unmapped register {}",
                    reg
                )));
            }
        }
        Ok(())
    }

    fn read_reg(&mut self, reg: u32) -> Result<u32> {
        self.step()?;
        let value = match reg {
            mmio::REG_OP_READY => {
                let stage = self.staged_stage()?;
                (self.queues[stage.index()].len() < self.queue_capacity()) as u32
            }
            mmio::REG_FETCH_OP_COUNT => self.op_count(Stage::Fetch),
            mmio::REG_EXEC_OP_COUNT => self.op_count(Stage::Execute),
            mmio::REG_RESULT_OP_COUNT => self.op_count(Stage::Result),
            mmio::REG_FETCH_ENABLE | mmio::REG_EXEC_ENABLE | mmio::REG_RESULT_ENABLE => {
                self.enables[(reg - mmio::REG_FETCH_ENABLE) as usize] as u32
            }
            _ => {
                let v = self.caps.register_value(reg).ok_or_else(|| {
                    AccelError::transport(format!("read of unmapped register {}", reg))
                })?;
                u32::try_from(v).map_err(|_| {
                    AccelError::transport(format!("register {} value {} exceeds 32 bits", reg, v))
                })?
            }
        };
        Ok(value)
    }

    fn alloc_accel_buffer(&mut self, bytes: usize) -> Result<AccelBuffer> {
        let addr = self.next_addr.next_multiple_of(FETCH_ALIGN);
        let end = addr + bytes as u64;
        if end > EMU_MEM_BASE + EMU_MEM_BYTES {
            return Err(AccelError::transport(format!(
                "out of emulated memory allocating {} bytes",
                bytes
            )));
        }
        self.next_addr = end;
        self.memory.insert(addr, vec![0; bytes]);
        Ok(AccelBuffer { addr, len: bytes })
    }

    fn copy_host_to_accel(&mut self, src: &[u8], dst: AccelBuffer) -> Result<()> {
        let buf = self
            .memory
            .get_mut(&dst.addr)
            .ok_or_else(|| AccelError::transport(format!("no buffer at {:#x}", dst.addr)))?;
        let target = buf.get_mut(..src.len()).ok_or_else(|| {
            AccelError::transport(format!(
                "copy of {} bytes exceeds {}-byte buffer",
                src.len(),
                dst.len
            ))
        })?;
        target.copy_from_slice(src);
        Ok(())
    }

    fn platform_id(&self) -> &str {
        "emulated"
    }
}
