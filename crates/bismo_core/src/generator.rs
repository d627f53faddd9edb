//! Instruction streams for tiled bit-serial matrix multiplication.
//!
//! Multi-bit operands are stored as stacked bit-planes. The product of an
//! `l`-th LHS bit-plane and an `r`-th RHS bit-plane contributes with weight
//! `2^(l + r)`, so the Execute stage accumulates every plane pair of one
//! output tile into the same accumulator, shifting each partial product by
//! `l + r`. The accumulator is cleared by the first pair and written out by
//! the last; all pairs of one output tile run back to back because the
//! accelerator has a single accumulator slot per tile position.

use crate::sync::{CHAN_INPUT_BUFFERS, CHAN_RESULT_BUFFERS};
use crate::{AccelError, Result};
use bismo_common::isa::{ExecRunCfg, FetchRunCfg, Instruction, ResultRunCfg, RunConfig, Stage};
use bismo_common::limits::{INBUFADDR_BITS, MAXSHIFT_BITS, RESADDR_BITS, fits};

/// Shape and placement of one bit-serial matrix multiplication.
///
/// Tile counts are in units of the systolic array dimensions; offsets and
/// bases are on-chip buffer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecStreamParams {
    pub tiles_m: u64,
    pub tiles_k: u64,
    pub tiles_n: u64,
    pub bits_l: u64,
    pub bits_r: u64,
    pub base_l: u64,
    pub base_r: u64,
    pub base_res: u64,
    /// Result buffers written round-robin so a slow write-back of one
    /// output tile does not hold up the next.
    pub nbufs_res: u64,
}

impl ExecStreamParams {
    /// Checks that the parameters describe a stream every instruction of
    /// which fits its encoded fields.
    ///
    /// Runs before any instruction is emitted, so [`generate`] either
    /// returns the whole stream or nothing.
    ///
    /// # Returns
    ///
    /// [`AccelError::InvalidStreamParams`] when `nbufs_res` or either bit
    /// depth is zero, when the stream length overflows, or when the largest
    /// operand offset, tile count, shift or result address does not fit its
    /// field.
    pub fn check(&self) -> Result<()> {
        let invalid = |reason| Err(AccelError::InvalidStreamParams { reason });
        if self.nbufs_res == 0 {
            return invalid("at least one result buffer is required");
        }
        if self.bits_l == 0 || self.bits_r == 0 {
            return invalid("operands need at least one bit-plane");
        }
        let Some(runs) = self.checked_run_count() else {
            return invalid("stream length overflows");
        };
        if self
            .checked_output_tiles()
            .and_then(|t| t.checked_mul(2))
            .and_then(|t| t.checked_add(runs))
            .and_then(|n| n.checked_add(2))
            .and_then(|n| usize::try_from(n).ok())
            .is_none()
        {
            return invalid("stream length overflows");
        }
        if runs == 0 {
            return Ok(());
        }

        // Last plane of the last row block: (tiles * bits - 1) blocks past base.
        let last_offset = |base: u64, tiles: u64, bits: u64| {
            tiles
                .checked_mul(bits)
                .and_then(|blocks| self.tiles_k.checked_mul(blocks - 1))
                .and_then(|o| o.checked_add(base))
        };
        let in_field = |v: Option<u64>, bits| v.is_some_and(|v| fits(v, bits));

        if !in_field(last_offset(self.base_l, self.tiles_m, self.bits_l), INBUFADDR_BITS) {
            return invalid("lhs offset exceeds the on-chip buffer address field");
        }
        if !in_field(last_offset(self.base_r, self.tiles_n, self.bits_r), INBUFADDR_BITS) {
            return invalid("rhs offset exceeds the on-chip buffer address field");
        }
        if !fits(self.tiles_k, INBUFADDR_BITS) {
            return invalid("tiles_k exceeds the tile count field");
        }
        if !fits(self.bits_l - 1 + (self.bits_r - 1), MAXSHIFT_BITS) {
            return invalid("bit depths exceed the shift field");
        }
        let last_res = (self.nbufs_res - 1).min(runs);
        if !in_field(self.base_res.checked_add(last_res), RESADDR_BITS) {
            return invalid("result address exceeds the result buffer address field");
        }
        Ok(())
    }

    pub fn output_tiles(&self) -> u64 {
        self.tiles_m.saturating_mul(self.tiles_n)
    }

    /// Length of the stream [`generate`] emits for these parameters.
    ///
    /// Saturates for parameters [`ExecStreamParams::check`] rejects.
    pub fn instruction_count(&self) -> u64 {
        let per_tile = self.bits_l.saturating_mul(self.bits_r).saturating_add(2);
        self.output_tiles()
            .saturating_mul(per_tile)
            .saturating_add(2)
    }

    fn checked_output_tiles(&self) -> Option<u64> {
        self.tiles_m.checked_mul(self.tiles_n)
    }

    /// Execute runs in the stream, one per bit-plane pair per output tile.
    fn checked_run_count(&self) -> Option<u64> {
        self.checked_output_tiles()?
            .checked_mul(self.bits_l.checked_mul(self.bits_r)?)
    }
}

/// Emits the Execute stage instruction stream for one matrix multiplication.
///
/// Identical parameters always produce identical streams.
///
/// # Returns
///
/// The stream, or [`AccelError::InvalidStreamParams`] when
/// [`ExecStreamParams::check`] rejects `p`.
pub fn generate(p: &ExecStreamParams) -> Result<Vec<Instruction>> {
    p.check()?;
    let mut out = Vec::with_capacity(p.instruction_count() as usize);
    generate_into(p, &mut out)?;
    Ok(out)
}

/// Appends the Execute stream for `p` to `out`.
pub fn generate_into(p: &ExecStreamParams, out: &mut Vec<Instruction>) -> Result<()> {
    p.check()?;
    let acquire = |channel| Instruction::ReceiveToken {
        stage: Stage::Execute,
        channel,
    };
    let release = |channel| Instruction::SendToken {
        stage: Stage::Execute,
        channel,
    };

    out.push(acquire(CHAN_INPUT_BUFFERS));
    let mut offset_res = 0;
    for m in 0..p.tiles_m {
        for n in 0..p.tiles_n {
            out.push(acquire(CHAN_RESULT_BUFFERS));
            for l in 0..p.bits_l {
                for r in 0..p.bits_r {
                    let tile_first = l == 0 && r == 0;
                    let tile_last = l == p.bits_l - 1 && r == p.bits_r - 1;
                    offset_res = (offset_res + 1) % p.nbufs_res;
                    out.push(Instruction::exec(ExecRunCfg {
                        lhs_offset: p.base_l + p.tiles_k * (m + l * p.tiles_m),
                        rhs_offset: p.base_r + p.tiles_k * (n + r * p.tiles_n),
                        negate: false,
                        num_tiles: p.tiles_k,
                        shift_amount: l + r,
                        clear_before_first_accumulation: tile_first,
                        write_en: tile_last,
                        write_addr: p.base_res + offset_res,
                    }));
                }
            }
            out.push(release(CHAN_RESULT_BUFFERS));
        }
    }
    out.push(release(CHAN_INPUT_BUFFERS));
    Ok(())
}

/// Result buffer offset (relative to `base_res`) each output tile is
/// written to, in the order the Execute stream finishes them.
pub fn result_rotation(p: &ExecStreamParams) -> Result<Vec<u64>> {
    p.check()?;
    let per_tile = p.bits_l * p.bits_r;
    Ok((1..=p.output_tiles())
        .map(|t| (t * per_tile) % p.nbufs_res)
        .collect())
}

/// Where the Result stage puts finished output tiles in external memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultStreamLayout {
    /// Address of the first output tile.
    pub dram_base: u64,
    /// Distance between consecutive output tiles.
    pub tile_stride_bytes: u64,
    /// Row skip handed to every Result run.
    pub dram_skip: u64,
}

/// Result stage stream matching the Execute stream for `p`.
///
/// One ReceiveToken per output tile waits for Execute to finish it, the run
/// writes the result buffer Execute used, and the SendToken gives the
/// buffer back.
pub fn result_stream(p: &ExecStreamParams, layout: ResultStreamLayout) -> Result<Vec<Instruction>> {
    let rotation = result_rotation(p)?;
    let mut out = Vec::with_capacity(rotation.len() * 3);
    for (tile, offset) in rotation.into_iter().enumerate() {
        out.push(Instruction::ReceiveToken {
            stage: Stage::Result,
            channel: 0,
        });
        out.push(Instruction::Run(RunConfig::Result(ResultRunCfg {
            dram_base: layout.dram_base + tile as u64 * layout.tile_stride_bytes,
            dram_skip: layout.dram_skip,
            resmem_addr: p.base_res + offset,
            wait_complete: false,
            wait_complete_bytes: 0,
        })));
        out.push(Instruction::SendToken {
            stage: Stage::Result,
            channel: 0,
        });
    }
    Ok(out)
}

/// Fetch stage stream filling one set of operand buffers.
///
/// Waits for an empty buffer set, runs every fetch, and hands the filled
/// set to Execute.
pub fn fetch_stream(fetches: &[FetchRunCfg]) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(fetches.len() + 2);
    out.push(Instruction::ReceiveToken {
        stage: Stage::Fetch,
        channel: 0,
    });
    out.extend(
        fetches
            .iter()
            .map(|f| Instruction::Run(RunConfig::Fetch(*f))),
    );
    out.push(Instruction::SendToken {
        stage: Stage::Fetch,
        channel: 0,
    });
    out
}
