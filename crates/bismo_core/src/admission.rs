//! Getting encoded instructions into the accelerator's stage queues.
//!
//! Immediate admission writes one instruction at a time through the op
//! staging registers. Batched admission collects instructions in a
//! [`StagedInstrs`] buffer that the accelerator pulls in with a single
//! bootstrap fetch.

use crate::capabilities::CapabilityDescriptor;
use crate::platform::{AccelBuffer, Platform, SpinLimit, spin_until};
use crate::{AccelError, Result};
use bismo_common::encoding::{INSTR_BYTES, WireInstr, encode};
use bismo_common::isa::{FetchRunCfg, Instruction};
use bismo_common::mmio::{REG_OP_BITS0, REG_OP_READY, REG_OP_VALID};
use tracing::trace;

/// Largest number of instructions the host-side staging buffer holds.
pub const MAX_DRAM_INSTRS: usize = 1024;

/// How an instruction reaches its stage queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitMode {
    /// Written through the op staging registers as soon as the target
    /// queue has room.
    Immediate,
    /// Appended to the host-side staging buffer, uploaded and fetched by
    /// the accelerator later.
    Batched,
}

/// Host-side buffer of encoded instructions awaiting bulk transfer.
///
/// The accelerator pulls the whole buffer into its stage queues with a
/// single fetch, so the buffer can never hold more than one queue's worth
/// of instructions.
#[derive(Debug)]
pub struct StagedInstrs {
    words: Vec<WireInstr>,
    limit: usize,
}

impl StagedInstrs {
    /// Creates an empty buffer sized for `caps`.
    ///
    /// The limit is the smaller of [`MAX_DRAM_INSTRS`] and the command
    /// queue depth.
    pub fn new(caps: &CapabilityDescriptor) -> Self {
        let limit = MAX_DRAM_INSTRS.min(caps.cmd_queue_entries as usize);
        Self {
            words: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Encodes and appends `ins`, or fails without touching the buffer if
    /// it is already full.
    pub fn push(&mut self, ins: &Instruction) -> Result<()> {
        self.extend(std::slice::from_ref(ins))
    }

    /// Encodes and appends every instruction of `stream`.
    ///
    /// All or nothing: if the whole stream does not fit, the buffer is left
    /// exactly as it was.
    ///
    /// # Returns
    ///
    /// [`AccelError::QueueCapacity`] with the count the buffer would have
    /// reached.
    pub fn extend(&mut self, stream: &[Instruction]) -> Result<()> {
        let count = self.words.len().saturating_add(stream.len());
        if count > self.limit {
            return Err(AccelError::QueueCapacity {
                count,
                limit: self.limit,
            });
        }
        self.words.extend(stream.iter().map(encode));
        Ok(())
    }

    /// Most instructions the buffer accepts.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Instructions currently staged.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Drops every staged instruction.
    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// The staged instructions in admission order, already encoded.
    pub fn words(&self) -> &[WireInstr] {
        &self.words
    }

    /// Size of the staged instructions in external memory.
    pub fn byte_len(&self) -> usize {
        self.words.len() * INSTR_BYTES
    }

    /// The staged instructions as they are laid out in external memory:
    /// each one [`INSTR_BYTES`] long, words little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// Pushes one encoded instruction through the op staging registers.
///
/// Spins on the op-ready signal of the queue the instruction targets, then
/// pulses op-valid. The spin is bounded only by `spin`; with
/// [`SpinLimit::Unbounded`] it waits as long as the accelerator takes to
/// make room.
pub fn push_immediate<P: Platform + ?Sized>(
    platform: &mut P,
    wire: WireInstr,
    spin: SpinLimit,
) -> Result<()> {
    for (i, word) in wire.0.iter().enumerate() {
        platform.write_reg(REG_OP_BITS0 + i as u32, *word)?;
    }
    let polls = spin_until(spin, "op queue space", || {
        Ok(platform.read_reg(REG_OP_READY)? == 1)
    })?;
    platform.write_reg(REG_OP_VALID, 1)?;
    platform.write_reg(REG_OP_VALID, 0)?;
    trace!(polls, "op pushed");
    Ok(())
}

/// The Fetch run that pulls `bytes` of staged instructions from `buf`.
///
/// Always a single block into fetch destination 0, the instruction queue.
pub fn bootstrap_fetch(buf: AccelBuffer, bytes: usize) -> FetchRunCfg {
    FetchRunCfg {
        bram_addr_base: 0,
        bram_id_start: 0,
        bram_id_range: 0,
        dram_base: buf.addr,
        dram_block_offset_bytes: 0,
        dram_block_size_bytes: bytes as u64,
        dram_block_count: 1,
        tiles_per_row: 0,
    }
}
