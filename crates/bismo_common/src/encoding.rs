//! 128-bit instruction wire format.
//!
//! An instruction is four little-endian 32-bit words. Bits 0-1 carry the
//! stage tag and bit 2 tells run configurations from token ops. Token ops
//! put the send flag in bit 3 and the channel in bits 4-5; run
//! configurations are laid out from bit 3 up by the per-stage field tables
//! below. Unused bits are always zero.

use crate::isa::{ExecRunCfg, FetchRunCfg, Instruction, ResultRunCfg, RunConfig, Stage};
use crate::limits::*;
use bitvec::prelude::*;
use core::fmt;

/// Number of 32-bit words in one encoded instruction.
pub const INSTR_WORDS: usize = 4;

/// Size of one encoded instruction in external memory.
pub const INSTR_BYTES: usize = INSTR_WORDS * 4;

type Bits = BitArray<[u32; INSTR_WORDS], Lsb0>;

/// One encoded instruction, least significant word first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WireInstr(pub [u32; INSTR_WORDS]);

impl WireInstr {
    /// The instruction as it is laid out in external memory.
    pub fn to_le_bytes(self) -> [u8; INSTR_BYTES] {
        let mut out = [0u8; INSTR_BYTES];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.0) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Reads one instruction back from its memory layout.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Exactly [`INSTR_BYTES`] bytes, least significant word
    ///   first.
    ///
    /// # Returns
    ///
    /// [`DecodeError::BadLength`] for any other length.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != INSTR_BYTES {
            return Err(DecodeError::BadLength(bytes.len()));
        }
        let mut words = [0u32; INSTR_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self(words))
    }
}

/// Why a word sequence is not an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The stage tag does not name a pipeline stage.
    UnknownStage(u8),
    /// A byte buffer was not exactly one instruction long.
    BadLength(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownStage(tag) => write!(f, "unknown stage tag {}", tag),
            DecodeError::BadLength(len) => {
                write!(f, "expected {} instruction bytes, got {}", INSTR_BYTES, len)
            }
        }
    }
}

impl core::error::Error for DecodeError {}

/// A bit range `[lo, lo + bits)` inside the instruction word.
#[derive(Clone, Copy)]
struct Field {
    lo: usize,
    bits: u32,
}

impl Field {
    const fn at(lo: usize, bits: u32) -> Self {
        Self { lo, bits }
    }

    /// The field of width `bits` placed directly above this one.
    const fn next(self, bits: u32) -> Self {
        Self {
            lo: self.lo + self.bits as usize,
            bits,
        }
    }

    const fn hi(self) -> usize {
        self.lo + self.bits as usize
    }

    fn store(self, word: &mut Bits, value: u64) {
        word[self.lo..self.hi()].store_le::<u64>(value);
    }

    fn load(self, word: &Bits) -> u64 {
        word[self.lo..self.hi()].load_le::<u64>()
    }
}

// Header shared by every instruction.
const TARGET_STAGE: Field = Field::at(0, STAGE_BITS);
const IS_RUN_CFG: usize = 2;

// Token instructions.
const IS_SEND_TOKEN: usize = 3;
const CHAN_ID: Field = Field::at(4, CHANID_BITS);

// Fetch run configuration.
const F_BRAM_ID_START: Field = Field::at(3, FETCHID_BITS);
const F_BRAM_ID_RANGE: Field = F_BRAM_ID_START.next(FETCHID_BITS);
const F_BRAM_ADDR_BASE: Field = F_BRAM_ID_RANGE.next(INBUFADDR_BITS);
const F_DRAM_BASE: Field = F_BRAM_ADDR_BASE.next(DRAMADDR_BITS);
const F_DRAM_BLOCK_SIZE: Field = F_DRAM_BASE.next(DRAM_BSIZE_BITS);
const F_DRAM_BLOCK_OFFSET: Field = F_DRAM_BLOCK_SIZE.next(DRAM_BSIZE_BITS);
const F_DRAM_BLOCK_COUNT: Field = F_DRAM_BLOCK_OFFSET.next(DRAM_BCNT_BITS);
const F_TILES_PER_ROW: Field = F_DRAM_BLOCK_COUNT.next(INBUFADDR_BITS);

// Execute run configuration.
const E_LHS_OFFSET: Field = Field::at(3, INBUFADDR_BITS);
const E_RHS_OFFSET: Field = E_LHS_OFFSET.next(INBUFADDR_BITS);
const E_NUM_TILES: Field = E_RHS_OFFSET.next(INBUFADDR_BITS);
const E_SHIFT_AMOUNT: Field = E_NUM_TILES.next(MAXSHIFT_BITS);
const E_NEGATE: usize = E_SHIFT_AMOUNT.hi();
const E_CLEAR: usize = E_NEGATE + 1;
const E_WRITE_EN: usize = E_CLEAR + 1;
const E_WRITE_ADDR: Field = Field::at(E_WRITE_EN + 1, RESADDR_BITS);

// Result run configuration.
const R_WAIT_COMPLETE: usize = 3;
const R_RESMEM_ADDR: Field = Field::at(4, RESADDR_BITS);
const R_DRAM_BASE: Field = R_RESMEM_ADDR.next(DRAMADDR_BITS);
const R_DRAM_SKIP: Field = R_DRAM_BASE.next(DRAM_BSIZE_BITS);
const R_WAIT_COMPLETE_BYTES: Field = R_DRAM_SKIP.next(DRAM_BSIZE_BITS);

const _: () = assert!(F_TILES_PER_ROW.hi() <= INSTR_WORDS * 32);
const _: () = assert!(E_WRITE_ADDR.hi() <= INSTR_WORDS * 32);
const _: () = assert!(R_WAIT_COMPLETE_BYTES.hi() <= INSTR_WORDS * 32);

/// Packs an instruction into its wire representation.
///
/// Unused bits are zero. Field values must already fit their declared
/// widths; wider values are truncated to the field, which is why nothing
/// should reach this function without passing validation first.
pub fn encode(ins: &Instruction) -> WireInstr {
    let mut w = Bits::ZERO;
    TARGET_STAGE.store(&mut w, ins.stage() as u64);

    match ins {
        Instruction::SendToken { channel, .. } | Instruction::ReceiveToken { channel, .. } => {
            w.set(IS_RUN_CFG, false);
            w.set(IS_SEND_TOKEN, matches!(ins, Instruction::SendToken { .. }));
            CHAN_ID.store(&mut w, *channel as u64);
        }
        Instruction::Run(cfg) => {
            w.set(IS_RUN_CFG, true);
            match cfg {
                RunConfig::Fetch(c) => {
                    F_BRAM_ID_START.store(&mut w, c.bram_id_start);
                    F_BRAM_ID_RANGE.store(&mut w, c.bram_id_range);
                    F_BRAM_ADDR_BASE.store(&mut w, c.bram_addr_base);
                    F_DRAM_BASE.store(&mut w, c.dram_base);
                    F_DRAM_BLOCK_SIZE.store(&mut w, c.dram_block_size_bytes);
                    F_DRAM_BLOCK_OFFSET.store(&mut w, c.dram_block_offset_bytes);
                    F_DRAM_BLOCK_COUNT.store(&mut w, c.dram_block_count);
                    F_TILES_PER_ROW.store(&mut w, c.tiles_per_row);
                }
                RunConfig::Execute(c) => {
                    E_LHS_OFFSET.store(&mut w, c.lhs_offset);
                    E_RHS_OFFSET.store(&mut w, c.rhs_offset);
                    E_NUM_TILES.store(&mut w, c.num_tiles);
                    E_SHIFT_AMOUNT.store(&mut w, c.shift_amount);
                    w.set(E_NEGATE, c.negate);
                    w.set(E_CLEAR, c.clear_before_first_accumulation);
                    w.set(E_WRITE_EN, c.write_en);
                    E_WRITE_ADDR.store(&mut w, c.write_addr);
                }
                RunConfig::Result(c) => {
                    w.set(R_WAIT_COMPLETE, c.wait_complete);
                    R_RESMEM_ADDR.store(&mut w, c.resmem_addr);
                    R_DRAM_BASE.store(&mut w, c.dram_base);
                    R_DRAM_SKIP.store(&mut w, c.dram_skip);
                    R_WAIT_COMPLETE_BYTES.store(&mut w, c.wait_complete_bytes);
                }
            }
        }
    }

    WireInstr(w.into_inner())
}

/// Unpacks a wire instruction. Inverse of [`encode`] for every instruction
/// whose fields fit their declared widths.
pub fn decode(wire: WireInstr) -> Result<Instruction, DecodeError> {
    let w = Bits::new(wire.0);
    let tag = TARGET_STAGE.load(&w) as u8;
    let stage = Stage::from_tag(tag).ok_or(DecodeError::UnknownStage(tag))?;

    if !w[IS_RUN_CFG] {
        let channel = CHAN_ID.load(&w) as u8;
        return Ok(if w[IS_SEND_TOKEN] {
            Instruction::SendToken { stage, channel }
        } else {
            Instruction::ReceiveToken { stage, channel }
        });
    }

    let cfg = match stage {
        Stage::Fetch => RunConfig::Fetch(FetchRunCfg {
            bram_id_start: F_BRAM_ID_START.load(&w),
            bram_id_range: F_BRAM_ID_RANGE.load(&w),
            bram_addr_base: F_BRAM_ADDR_BASE.load(&w),
            dram_base: F_DRAM_BASE.load(&w),
            dram_block_size_bytes: F_DRAM_BLOCK_SIZE.load(&w),
            dram_block_offset_bytes: F_DRAM_BLOCK_OFFSET.load(&w),
            dram_block_count: F_DRAM_BLOCK_COUNT.load(&w),
            tiles_per_row: F_TILES_PER_ROW.load(&w),
        }),
        Stage::Execute => RunConfig::Execute(ExecRunCfg {
            lhs_offset: E_LHS_OFFSET.load(&w),
            rhs_offset: E_RHS_OFFSET.load(&w),
            num_tiles: E_NUM_TILES.load(&w),
            shift_amount: E_SHIFT_AMOUNT.load(&w),
            negate: w[E_NEGATE],
            clear_before_first_accumulation: w[E_CLEAR],
            write_en: w[E_WRITE_EN],
            write_addr: E_WRITE_ADDR.load(&w),
        }),
        Stage::Result => RunConfig::Result(ResultRunCfg {
            wait_complete: w[R_WAIT_COMPLETE],
            resmem_addr: R_RESMEM_ADDR.load(&w),
            dram_base: R_DRAM_BASE.load(&w),
            dram_skip: R_DRAM_SKIP.load(&w),
            wait_complete_bytes: R_WAIT_COMPLETE_BYTES.load(&w),
        }),
    };
    Ok(Instruction::Run(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_instruction_sets_only_header_bits() {
        let wire = encode(&Instruction::SendToken {
            stage: Stage::Execute,
            channel: 1,
        });
        // stage=1, run=0, send=1, chan=1
        assert_eq!(wire.0, [0b01_1_0_01, 0, 0, 0]);
    }

    #[test]
    fn receive_and_send_differ_only_in_send_bit() {
        let recv = encode(&Instruction::ReceiveToken {
            stage: Stage::Result,
            channel: 0,
        });
        let send = encode(&Instruction::SendToken {
            stage: Stage::Result,
            channel: 0,
        });
        assert_eq!(recv.0[0] ^ send.0[0], 1 << IS_SEND_TOKEN);
    }

    #[test]
    fn fetch_fields_spanning_word_boundaries_survive() {
        let cfg = FetchRunCfg {
            bram_addr_base: 0xABCD,
            bram_id_start: 3,
            bram_id_range: 1,
            dram_base: 0xDEAD_BEC0,
            dram_block_offset_bytes: 0xFFC0,
            dram_block_size_bytes: 0x1238,
            dram_block_count: 0xFFFF,
            tiles_per_row: 0x7FFF,
        };
        let ins = Instruction::Run(RunConfig::Fetch(cfg));
        assert_eq!(decode(encode(&ins)), Ok(ins));
    }

    #[test]
    fn exec_flags_are_independent_bits() {
        let base = ExecRunCfg {
            lhs_offset: 5,
            rhs_offset: 9,
            num_tiles: 2,
            shift_amount: 31,
            write_addr: 63,
            ..Default::default()
        };
        let plain = encode(&Instruction::exec(base));
        let cleared = encode(&Instruction::exec(ExecRunCfg {
            clear_before_first_accumulation: true,
            ..base
        }));
        let written = encode(&Instruction::exec(ExecRunCfg {
            write_en: true,
            ..base
        }));
        assert_ne!(plain, cleared);
        assert_ne!(cleared, written);
        assert_eq!(decode(written), Ok(Instruction::exec(ExecRunCfg { write_en: true, ..base })));
    }

    #[test]
    fn unknown_stage_tag_is_rejected() {
        assert_eq!(decode(WireInstr([0b11, 0, 0, 0])), Err(DecodeError::UnknownStage(3)));
    }

    #[test]
    fn bytes_are_little_endian_words() {
        let wire = WireInstr([0x0403_0201, 0, 0, 0x1000_0000]);
        let bytes = wire.to_le_bytes();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(bytes[15], 0x10);
        assert_eq!(WireInstr::from_le_bytes(&bytes), Ok(wire));
        assert_eq!(
            WireInstr::from_le_bytes(&bytes[..15]),
            Err(DecodeError::BadLength(15))
        );
    }
}
