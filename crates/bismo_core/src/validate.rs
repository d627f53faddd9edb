//! Run configuration validation.
//!
//! The accelerator does no bounds checking of its own: an out-of-range
//! field silently corrupts addressing. Every instruction is checked here
//! before it is encoded, and the first violation is reported.

use crate::capabilities::CapabilityDescriptor;
use crate::{AccelError, Result};
use bismo_common::isa::{ExecRunCfg, FetchRunCfg, Instruction, ResultRunCfg, RunConfig, Stage};
use bismo_common::limits::*;
use thiserror::Error;

/// Fetch external memory base address alignment in bytes.
pub const FETCH_ADDRALIGN: u64 = 64;

/// Fetch external memory block size alignment in bytes.
pub const FETCH_SIZEALIGN: u64 = 8;

/// Alignment applied to fetch base addresses and block offsets.
pub const FETCH_ALIGN: u64 = if FETCH_ADDRALIGN > FETCH_SIZEALIGN {
    FETCH_ADDRALIGN
} else {
    FETCH_SIZEALIGN
};

/// Result stage external memory alignment in bytes.
pub const RESULT_ALIGN: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigViolation {
    #[error("{field} = {value} does not fit in {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },

    #[error("{field} = {value:#x} is not a multiple of {align}")]
    Misaligned {
        field: &'static str,
        value: u64,
        align: u64,
    },

    #[error("buffer ids {start}..={end} exceed the {nodes} fetch destinations")]
    BufferIdOutOfRange { start: u64, end: u64, nodes: u64 },

    #[error("buffer address {addr} is past the {limit} addressable entries")]
    BufferAddrOutOfRange { addr: u64, limit: u64 },

    #[error("sync channel {channel} does not exist, stage has {available}")]
    ChannelOutOfRange { channel: u8, available: u8 },
}

fn bits(field: &'static str, value: u64, bits: u32) -> std::result::Result<(), ConfigViolation> {
    if fits(value, bits) {
        Ok(())
    } else {
        Err(ConfigViolation::FieldOverflow { field, value, bits })
    }
}

fn aligned(field: &'static str, value: u64, align: u64) -> std::result::Result<(), ConfigViolation> {
    if value % align == 0 {
        Ok(())
    } else {
        Err(ConfigViolation::Misaligned { field, value, align })
    }
}

/// Checks any instruction against the declared widths and `caps`.
pub fn validate(ins: &Instruction, caps: &CapabilityDescriptor) -> Result<()> {
    let checked = match ins {
        Instruction::Run(RunConfig::Fetch(cfg)) => check_fetch(cfg, caps),
        Instruction::Run(RunConfig::Execute(cfg)) => check_exec(cfg),
        Instruction::Run(RunConfig::Result(cfg)) => check_result(cfg),
        Instruction::SendToken { stage, channel } | Instruction::ReceiveToken { stage, channel } => {
            check_channel(*stage, *channel)
        }
    };
    checked.map_err(|violation| AccelError::invalid_config(ins.stage(), violation))
}

pub fn validate_fetch(cfg: &FetchRunCfg, caps: &CapabilityDescriptor) -> Result<()> {
    check_fetch(cfg, caps).map_err(|v| AccelError::invalid_config(Stage::Fetch, v))
}

pub fn validate_exec(cfg: &ExecRunCfg) -> Result<()> {
    check_exec(cfg).map_err(|v| AccelError::invalid_config(Stage::Execute, v))
}

pub fn validate_result(cfg: &ResultRunCfg) -> Result<()> {
    check_result(cfg).map_err(|v| AccelError::invalid_config(Stage::Result, v))
}

fn check_channel(stage: Stage, channel: u8) -> std::result::Result<(), ConfigViolation> {
    bits("chan_id", channel as u64, CHANID_BITS)?;
    let available = stage.num_sync_channels();
    if channel >= available {
        return Err(ConfigViolation::ChannelOutOfRange { channel, available });
    }
    Ok(())
}

fn check_fetch(
    f: &FetchRunCfg,
    caps: &CapabilityDescriptor,
) -> std::result::Result<(), ConfigViolation> {
    bits("bram_id_start", f.bram_id_start, FETCHID_BITS)?;
    bits("bram_id_range", f.bram_id_range, FETCHID_BITS)?;
    bits("bram_addr_base", f.bram_addr_base, INBUFADDR_BITS)?;
    bits("dram_base", f.dram_base, DRAMADDR_BITS)?;
    bits("dram_block_size_bytes", f.dram_block_size_bytes, DRAM_BSIZE_BITS)?;
    bits("dram_block_offset_bytes", f.dram_block_offset_bytes, DRAM_BSIZE_BITS)?;
    bits("dram_block_count", f.dram_block_count, DRAM_BCNT_BITS)?;
    bits("tiles_per_row", f.tiles_per_row, INBUFADDR_BITS)?;

    aligned("dram_base", f.dram_base, FETCH_ALIGN)?;
    aligned("dram_block_offset_bytes", f.dram_block_offset_bytes, FETCH_ALIGN)?;
    aligned("dram_block_size_bytes", f.dram_block_size_bytes, FETCH_SIZEALIGN)?;

    let nodes = caps.num_fetch_nodes();
    let end = f.bram_id_start + f.bram_id_range;
    if f.bram_id_start >= nodes || end >= nodes {
        return Err(ConfigViolation::BufferIdOutOfRange {
            start: f.bram_id_start,
            end,
            nodes,
        });
    }

    let entries = if f.bram_id_start < caps.first_rhs_id() {
        caps.lhs_entries_per_mem
    } else {
        caps.rhs_entries_per_mem
    };
    let limit = entries.saturating_mul(caps.exec_to_fetch_width_ratio());
    if f.bram_addr_base >= limit {
        return Err(ConfigViolation::BufferAddrOutOfRange {
            addr: f.bram_addr_base,
            limit,
        });
    }
    Ok(())
}

// Flags are bools and cannot overflow their single bit.
fn check_exec(e: &ExecRunCfg) -> std::result::Result<(), ConfigViolation> {
    bits("lhs_offset", e.lhs_offset, INBUFADDR_BITS)?;
    bits("rhs_offset", e.rhs_offset, INBUFADDR_BITS)?;
    bits("num_tiles", e.num_tiles, INBUFADDR_BITS)?;
    bits("shift_amount", e.shift_amount, MAXSHIFT_BITS)?;
    bits("write_addr", e.write_addr, RESADDR_BITS)?;
    Ok(())
}

fn check_result(r: &ResultRunCfg) -> std::result::Result<(), ConfigViolation> {
    bits("resmem_addr", r.resmem_addr, RESADDR_BITS)?;
    bits("dram_base", r.dram_base, DRAMADDR_BITS)?;
    bits("dram_skip", r.dram_skip, DRAM_BSIZE_BITS)?;
    bits("wait_complete_bytes", r.wait_complete_bytes, DRAM_BSIZE_BITS)?;
    aligned("dram_base", r.dram_base, RESULT_ALIGN)?;
    aligned("dram_skip", r.dram_skip, RESULT_ALIGN)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn caps() -> CapabilityDescriptor {
        CapabilityDescriptor::default_emulated()
    }

    fn fetch_ok() -> FetchRunCfg {
        FetchRunCfg {
            bram_addr_base: 10,
            bram_id_start: 1,
            bram_id_range: 1,
            dram_base: 0x1000,
            dram_block_offset_bytes: 128,
            dram_block_size_bytes: 64,
            dram_block_count: 4,
            tiles_per_row: 2,
        }
    }

    fn violation(r: Result<()>) -> ConfigViolation {
        match r {
            Err(AccelError::InvalidConfig { violation, .. }) => violation,
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn accepts_aligned_in_range_fetch() {
        validate_fetch(&fetch_ok(), &caps()).unwrap();
    }

    #[test]
    fn fetch_alignment_uses_the_wider_constraint() {
        let c = FetchRunCfg {
            dram_base: 0x1008,
            ..fetch_ok()
        };
        assert_eq!(
            violation(validate_fetch(&c, &caps())),
            ConfigViolation::Misaligned {
                field: "dram_base",
                value: 0x1008,
                align: 64
            }
        );

        let c = FetchRunCfg {
            dram_block_offset_bytes: 8,
            ..fetch_ok()
        };
        assert!(matches!(
            violation(validate_fetch(&c, &caps())),
            ConfigViolation::Misaligned { field: "dram_block_offset_bytes", .. }
        ));

        let c = FetchRunCfg {
            dram_block_size_bytes: 12,
            ..fetch_ok()
        };
        assert!(matches!(
            violation(validate_fetch(&c, &caps())),
            ConfigViolation::Misaligned { align: 8, .. }
        ));
    }

    #[test]
    fn fetch_buffer_ids_stay_within_nodes() {
        // 1 + 2 + 2 = 5 endpoints, so the last addressable id is 4.
        let ok = FetchRunCfg {
            bram_id_start: 3,
            bram_id_range: 1,
            ..fetch_ok()
        };
        validate_fetch(&ok, &caps()).unwrap();

        let past = FetchRunCfg {
            bram_id_start: 3,
            bram_id_range: 2,
            ..fetch_ok()
        };
        assert_eq!(
            violation(validate_fetch(&past, &caps())),
            ConfigViolation::BufferIdOutOfRange {
                start: 3,
                end: 5,
                nodes: 5
            }
        );
    }

    #[test]
    fn fetch_address_bound_depends_on_side() {
        let mut caps = caps();
        caps.lhs_entries_per_mem = 16;
        caps.rhs_entries_per_mem = 64;

        let lhs = FetchRunCfg {
            bram_id_start: 1,
            bram_addr_base: 16,
            ..fetch_ok()
        };
        assert_eq!(
            violation(validate_fetch(&lhs, &caps)),
            ConfigViolation::BufferAddrOutOfRange { addr: 16, limit: 16 }
        );

        let rhs = FetchRunCfg {
            bram_id_start: 3,
            bram_id_range: 0,
            bram_addr_base: 16,
            ..fetch_ok()
        };
        validate_fetch(&rhs, &caps).unwrap();
    }

    #[test]
    fn address_bound_scales_with_width_ratio() {
        let mut caps = caps();
        caps.lhs_entries_per_mem = 16;
        caps.dpa_dim_common = 256;
        let c = FetchRunCfg {
            bram_addr_base: 63,
            ..fetch_ok()
        };
        validate_fetch(&c, &caps).unwrap();
    }

    #[test]
    fn each_exec_field_is_width_checked() {
        let ok = ExecRunCfg {
            lhs_offset: 0xFFFF,
            rhs_offset: 0xFFFF,
            num_tiles: 0xFFFF,
            shift_amount: 31,
            write_addr: 63,
            negate: true,
            clear_before_first_accumulation: true,
            write_en: true,
        };
        validate_exec(&ok).unwrap();

        let overflows = [
            ExecRunCfg { lhs_offset: 0x1_0000, ..ok },
            ExecRunCfg { rhs_offset: 0x1_0000, ..ok },
            ExecRunCfg { num_tiles: 0x1_0000, ..ok },
            ExecRunCfg { shift_amount: 32, ..ok },
            ExecRunCfg { write_addr: 64, ..ok },
        ];
        for cfg in overflows {
            assert!(matches!(
                violation(validate_exec(&cfg)),
                ConfigViolation::FieldOverflow { .. }
            ));
        }
    }

    #[test]
    fn result_addresses_must_be_eight_byte_aligned() {
        let ok = ResultRunCfg {
            dram_base: 0x2000,
            dram_skip: 16,
            resmem_addr: 1,
            wait_complete: false,
            wait_complete_bytes: 0,
        };
        validate_result(&ok).unwrap();

        let skewed = ResultRunCfg { dram_skip: 12, ..ok };
        assert!(matches!(
            violation(validate_result(&skewed)),
            ConfigViolation::Misaligned { field: "dram_skip", .. }
        ));

        let far = ResultRunCfg {
            wait_complete_bytes: 1 << 16,
            ..ok
        };
        assert!(matches!(
            violation(validate_result(&far)),
            ConfigViolation::FieldOverflow { field: "wait_complete_bytes", .. }
        ));
    }

    #[test]
    fn token_channels_are_per_stage() {
        let caps = caps();
        let exec1 = Instruction::ReceiveToken {
            stage: Stage::Execute,
            channel: 1,
        };
        validate(&exec1, &caps).unwrap();

        let fetch1 = Instruction::SendToken {
            stage: Stage::Fetch,
            channel: 1,
        };
        match validate(&fetch1, &caps) {
            Err(AccelError::InvalidConfig { stage, violation }) => {
                assert_eq!(stage, Stage::Fetch);
                assert_eq!(
                    violation,
                    ConfigViolation::ChannelOutOfRange {
                        channel: 1,
                        available: 1
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn random_in_width_exec_configs_are_accepted_and_encode_distinctly() {
        use bismo_common::encoding::{decode, encode};
        use std::collections::HashMap;

        let mut rng = rand::thread_rng();
        let mut seen: HashMap<[u32; 4], Instruction> = HashMap::new();
        for _ in 0..500 {
            let cfg = ExecRunCfg {
                lhs_offset: rng.gen_range(0..1 << INBUFADDR_BITS),
                rhs_offset: rng.gen_range(0..1 << INBUFADDR_BITS),
                num_tiles: rng.gen_range(0..1 << INBUFADDR_BITS),
                shift_amount: rng.gen_range(0..1 << MAXSHIFT_BITS),
                write_addr: rng.gen_range(0..1 << RESADDR_BITS),
                negate: rng.r#gen(),
                clear_before_first_accumulation: rng.r#gen(),
                write_en: rng.r#gen(),
            };
            validate_exec(&cfg).unwrap();

            let ins = Instruction::exec(cfg);
            let wire = encode(&ins);
            assert_eq!(decode(wire), Ok(ins));
            if let Some(prev) = seen.insert(wire.0, ins) {
                assert_eq!(prev, ins);
            }
        }
    }

    #[test]
    fn single_field_overflow_rejects_otherwise_valid_fetch() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut cfg = fetch_ok();
            match rng.gen_range(0..4) {
                0 => cfg.dram_base = (1 << DRAMADDR_BITS) + 64 * rng.gen_range(0..16u64),
                1 => cfg.dram_block_count = (1 << DRAM_BCNT_BITS) + rng.gen_range(0..16u64),
                2 => cfg.tiles_per_row = (1 << INBUFADDR_BITS) + rng.gen_range(0..16u64),
                _ => cfg.bram_id_start = (1 << FETCHID_BITS) + rng.gen_range(0..16u64),
            }
            assert!(matches!(
                violation(validate_fetch(&cfg, &caps())),
                ConfigViolation::FieldOverflow { .. }
            ));
        }
    }
}
