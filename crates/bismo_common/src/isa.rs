//! Instruction set of the bit-serial matrix multiplication accelerator.
//!
//! Each of the three pipeline stages consumes its own FIFO of instructions.
//! An instruction either runs the stage with a stage-specific configuration
//! or moves one token on a synchronization channel shared with an adjacent
//! stage.

use core::fmt;

/// Pipeline stage targeted by an instruction.
///
/// The discriminant is the stage tag carried in the wire encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Moves operand data from external memory into on-chip buffers.
    Fetch = 0,
    /// Runs bit-serial partial products on the systolic array.
    Execute = 1,
    /// Writes accumulated results back to external memory.
    Result = 2,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Fetch, Stage::Execute, Stage::Result];

    /// Index used for per-stage register and queue arrays.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Stage::Fetch),
            1 => Some(Stage::Execute),
            2 => Some(Stage::Result),
            _ => None,
        }
    }

    /// Number of sync channels this stage's controller is wired to.
    ///
    /// Fetch and Result each border one stage; Execute sits between both.
    pub const fn num_sync_channels(self) -> u8 {
        match self {
            Stage::Fetch | Stage::Result => 1,
            Stage::Execute => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Execute => "exec",
            Stage::Result => "result",
        };
        f.pad(name)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Run = 0,
    SendToken = 1,
    ReceiveToken = 2,
}

/// Controller states of every stage.
///
/// AwaitCommand decodes the next queued instruction. Running performs the
/// stage's work for a run configuration. SendingToken and ReceivingToken
/// block until the paired token FIFO can accept or supply a token. Every
/// other state returns to AwaitCommand; there is no terminal state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    AwaitCommand = 0,
    Running = 1,
    SendingToken = 2,
    ReceivingToken = 3,
}

/// Opcode plus sync channel, the stage-independent half of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub opcode: Opcode,
    pub sync_channel: u8,
}

impl Op {
    /// Run the stage with the accompanying configuration.
    pub const fn run() -> Self {
        Self {
            opcode: Opcode::Run,
            sync_channel: 0,
        }
    }

    /// Hand one token to the partner stage on `channel`.
    pub const fn send(channel: u8) -> Self {
        Self {
            opcode: Opcode::SendToken,
            sync_channel: channel,
        }
    }

    /// Wait for one token from the partner stage on `channel`.
    pub const fn receive(channel: u8) -> Self {
        Self {
            opcode: Opcode::ReceiveToken,
            sync_channel: channel,
        }
    }
}

/// Run configuration of the Fetch stage.
///
/// Copies `dram_block_count` blocks of `dram_block_size_bytes` bytes, the
/// blocks spaced `dram_block_offset_bytes` apart starting at `dram_base`,
/// into on-chip buffers `bram_id_start ..= bram_id_start + bram_id_range`
/// starting at `bram_addr_base`. Buffer id 0 is the instruction queue
/// itself; left-hand side buffers follow, then right-hand side buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchRunCfg {
    pub bram_addr_base: u64,
    pub bram_id_start: u64,
    pub bram_id_range: u64,
    pub dram_base: u64,
    pub dram_block_offset_bytes: u64,
    pub dram_block_size_bytes: u64,
    pub dram_block_count: u64,
    pub tiles_per_row: u64,
}

/// Run configuration of the Execute stage.
///
/// Multiplies `num_tiles` tiles of single-bit operands starting at
/// `lhs_offset`/`rhs_offset`, shifts the partial product left by
/// `shift_amount` and adds it to the accumulators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecRunCfg {
    pub lhs_offset: u64,
    pub rhs_offset: u64,
    /// Owned by the Execute stage's arithmetic. Signed operands are not
    /// generated yet, so stream generation always leaves this clear.
    pub negate: bool,
    pub num_tiles: u64,
    pub shift_amount: u64,
    pub clear_before_first_accumulation: bool,
    pub write_en: bool,
    pub write_addr: u64,
}

/// Run configuration of the Result stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultRunCfg {
    pub dram_base: u64,
    pub dram_skip: u64,
    pub resmem_addr: u64,
    pub wait_complete: bool,
    pub wait_complete_bytes: u64,
}

/// Stage-specific run configuration. The variant determines the target stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunConfig {
    Fetch(FetchRunCfg),
    Execute(ExecRunCfg),
    Result(ResultRunCfg),
}

impl RunConfig {
    pub const fn stage(&self) -> Stage {
        match self {
            RunConfig::Fetch(_) => Stage::Fetch,
            RunConfig::Execute(_) => Stage::Execute,
            RunConfig::Result(_) => Stage::Result,
        }
    }
}

/// A single accelerator instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Run(RunConfig),
    SendToken { stage: Stage, channel: u8 },
    ReceiveToken { stage: Stage, channel: u8 },
}

impl Instruction {
    pub const fn stage(&self) -> Stage {
        match self {
            Instruction::Run(cfg) => cfg.stage(),
            Instruction::SendToken { stage, .. } | Instruction::ReceiveToken { stage, .. } => {
                *stage
            }
        }
    }

    pub const fn opcode(&self) -> Opcode {
        match self {
            Instruction::Run(_) => Opcode::Run,
            Instruction::SendToken { .. } => Opcode::SendToken,
            Instruction::ReceiveToken { .. } => Opcode::ReceiveToken,
        }
    }

    /// Builds an instruction from a typed op. The configuration is only
    /// used for [`Opcode::Run`]; token ops target `cfg`'s stage.
    pub const fn from_op(op: Op, cfg: RunConfig) -> Self {
        let stage = cfg.stage();
        match op.opcode {
            Opcode::Run => Instruction::Run(cfg),
            Opcode::SendToken => Instruction::SendToken {
                stage,
                channel: op.sync_channel,
            },
            Opcode::ReceiveToken => Instruction::ReceiveToken {
                stage,
                channel: op.sync_channel,
            },
        }
    }

    pub const fn exec(cfg: ExecRunCfg) -> Self {
        Instruction::Run(RunConfig::Execute(cfg))
    }
}

impl fmt::Display for FetchRunCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bram_id={}+{} bram_addr={} dram_base={:#x} bsize={} boffset={} bcount={} tiles_per_row={}",
            self.bram_id_start,
            self.bram_id_range,
            self.bram_addr_base,
            self.dram_base,
            self.dram_block_size_bytes,
            self.dram_block_offset_bytes,
            self.dram_block_count,
            self.tiles_per_row
        )
    }
}

impl fmt::Display for ExecRunCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lhs={} rhs={} tiles={} shift={} neg={} clear={} write={} waddr={}",
            self.lhs_offset,
            self.rhs_offset,
            self.num_tiles,
            self.shift_amount,
            self.negate as u8,
            self.clear_before_first_accumulation as u8,
            self.write_en as u8,
            self.write_addr
        )
    }
}

impl fmt::Display for ResultRunCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dram_base={:#x} skip={} resmem={} wait={} wait_bytes={}",
            self.dram_base,
            self.dram_skip,
            self.resmem_addr,
            self.wait_complete as u8,
            self.wait_complete_bytes
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Run(RunConfig::Fetch(c)) => write!(f, "fetch  run  {}", c),
            Instruction::Run(RunConfig::Execute(c)) => write!(f, "exec   run  {}", c),
            Instruction::Run(RunConfig::Result(c)) => write!(f, "result run  {}", c),
            Instruction::SendToken { stage, channel } => {
                write!(f, "{:<6} send chan={}", stage, channel)
            }
            Instruction::ReceiveToken { stage, channel } => {
                write!(f, "{:<6} recv chan={}", stage, channel)
            }
        }
    }
}
