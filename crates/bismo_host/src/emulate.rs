//! End-to-end runs against the software emulated accelerator.

use crate::stats::LatencyStats;
use anyhow::{Context, Result};
use bismo_common::isa::{FetchRunCfg, Instruction, Stage};
use bismo_core::admission::AdmitMode;
use bismo_core::capabilities::CapabilityDescriptor;
use bismo_core::driver::AccelDriver;
use bismo_core::emu::EmuAccel;
use bismo_core::generator::{
    ExecStreamParams, ResultStreamLayout, fetch_stream, generate, result_stream,
};
use bismo_core::platform::{Platform, SpinLimit};
use bismo_core::sync::Link;
use bismo_core::validate::{FETCH_ALIGN, RESULT_ALIGN};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

pub struct RunOptions {
    pub caps: CapabilityDescriptor,
    pub params: ExecStreamParams,
    pub stream: Option<PathBuf>,
    pub mode: AdmitMode,
    pub spin: SpinLimit,
    pub max_cycles: u64,
}

/// Prints the hardware summary as discovered through the register file.
pub fn print_hwcfg(caps: CapabilityDescriptor, out: Option<PathBuf>) -> Result<()> {
    let drv = AccelDriver::new(EmuAccel::new(caps))?;
    let caps = *drv.caps();
    println!("# {} accelerator", drv.platform().platform_id());
    print!("{}", caps);
    println!("# fetch destinations: {}", drv.num_fetch_nodes());
    println!(
        "# lhs buffers: ids {}.. {} bytes; rhs buffers: ids {}.. {} bytes",
        drv.first_lhs_id(),
        drv.lhs_total_bram_bytes(),
        drv.first_rhs_id(),
        drv.rhs_total_bram_bytes()
    );
    if let Some(path) = out {
        bismo_io::hwcfg::save_hwcfg(&path, &caps)?;
        println!("# written to {}", path.display());
    }
    Ok(())
}

/// The two operand fetches for `p`: every LHS row buffer, then every RHS
/// row buffer, each row one block of `tiles_k` words per bit-plane.
fn operand_fetches(
    caps: &CapabilityDescriptor,
    p: &ExecStreamParams,
    lhs_base: u64,
    rhs_base: u64,
) -> [FetchRunCfg; 2] {
    let row_bytes = p.tiles_k * caps.dpa_dim_common / 8;
    let stride = row_bytes.next_multiple_of(FETCH_ALIGN);
    let lhs = FetchRunCfg {
        bram_addr_base: p.base_l,
        bram_id_start: caps.first_lhs_id(),
        bram_id_range: caps.dpa_dim_lhs - 1,
        dram_base: lhs_base,
        dram_block_offset_bytes: stride,
        dram_block_size_bytes: row_bytes,
        dram_block_count: p.tiles_m * caps.dpa_dim_lhs * p.bits_l,
        tiles_per_row: p.tiles_k,
    };
    let rhs = FetchRunCfg {
        bram_addr_base: p.base_r,
        bram_id_start: caps.first_rhs_id(),
        bram_id_range: caps.dpa_dim_rhs - 1,
        dram_base: rhs_base,
        dram_block_count: p.tiles_n * caps.dpa_dim_rhs * p.bits_r,
        ..lhs
    };
    [lhs, rhs]
}

/// Fetch, execute and result streams for one matrix multiplication, with
/// operand and result memory allocated on the accelerator.
fn matmul_streams(drv: &mut AccelDriver<EmuAccel>, p: &ExecStreamParams) -> Result<Vec<Instruction>> {
    let caps = *drv.caps();
    let row_bytes = (p.tiles_k * caps.dpa_dim_common / 8).next_multiple_of(FETCH_ALIGN);
    let lhs_rows = p.tiles_m * caps.dpa_dim_lhs * p.bits_l;
    let rhs_rows = p.tiles_n * caps.dpa_dim_rhs * p.bits_r;
    let tile_bytes = (caps.dpa_dim_lhs * caps.dpa_dim_rhs * caps.acc_width / 8)
        .next_multiple_of(RESULT_ALIGN);

    let platform = drv.platform_mut();
    let lhs = platform.alloc_accel_buffer((lhs_rows * row_bytes) as usize)?;
    let rhs = platform.alloc_accel_buffer((rhs_rows * row_bytes) as usize)?;
    let res = platform.alloc_accel_buffer((p.output_tiles() * tile_bytes) as usize)?;

    let layout = ResultStreamLayout {
        dram_base: res.addr,
        tile_stride_bytes: tile_bytes,
        dram_skip: (caps.dpa_dim_rhs * caps.acc_width / 8).next_multiple_of(RESULT_ALIGN),
    };
    // Result first: its receives block until execute hands over a buffer,
    // so admitting it early never holds the other queues back.
    let mut out = result_stream(p, layout)?;
    out.extend(fetch_stream(&operand_fetches(&caps, p, lhs.addr, rhs.addr)));
    out.extend(generate(p)?);
    Ok(out)
}

pub fn run_emulated(opts: &RunOptions) -> Result<()> {
    let mut drv = AccelDriver::new(EmuAccel::new(opts.caps))?.with_spin_limit(opts.spin);
    drv.init_resource_pools().context("Failed to prime token pools")?;

    let stream = match &opts.stream {
        Some(path) => bismo_io::loader::load_instr_file(path)?,
        None => matmul_streams(&mut drv, &opts.params)?,
    };
    info!(instructions = stream.len(), mode = ?opts.mode, "admitting stream");

    let start_cycle = drv.platform().cycles();
    let mut admission = LatencyStats::new(1_000);
    match opts.mode {
        AdmitMode::Immediate => {
            drv.set_stage_enables(true, true, true)?;
            for ins in &stream {
                let t0 = Instant::now();
                drv.push_instruction(*ins, AdmitMode::Immediate)?;
                admission.update(t0.elapsed().as_nanos() as u64);
            }
        }
        AdmitMode::Batched => {
            drv.push_stream(&stream, AdmitMode::Batched)?;
            drv.flush_batched()?;
            drv.set_stage_enables(true, true, true)?;
        }
    }

    drv.platform_mut()
        .run_until_idle(opts.max_cycles)
        .context("Emulated run did not complete")?;
    drv.clear_instr_buf();

    let emu = drv.platform();
    println!("Emulated run");
    println!("Instructions: {}", stream.len());
    println!("Cycles:       {}", emu.cycles() - start_cycle);
    for stage in Stage::ALL {
        let retired = emu.retired(stage);
        let runs = retired
            .iter()
            .filter(|i| matches!(i, Instruction::Run(_)))
            .count();
        println!(
            "{:>7}: {} retired, {} runs",
            stage,
            retired.len(),
            runs
        );
    }
    for link in Link::ALL {
        println!("{:?}: {} tokens", link, emu.tokens(link));
    }
    if opts.mode == AdmitMode::Immediate {
        admission.print_report("Admission latency");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ExecStreamParams {
        ExecStreamParams {
            tiles_m: 2,
            tiles_k: 2,
            tiles_n: 1,
            bits_l: 2,
            bits_r: 1,
            nbufs_res: 2,
            ..Default::default()
        }
    }

    fn opts(mode: AdmitMode, queue: u64) -> RunOptions {
        let mut caps = CapabilityDescriptor::default_emulated();
        caps.cmd_queue_entries = queue;
        RunOptions {
            caps,
            params: params(),
            stream: None,
            mode,
            spin: SpinLimit::Iterations(100_000),
            max_cycles: 10_000,
        }
    }

    #[test]
    fn generated_matmul_runs_immediately() {
        run_emulated(&opts(AdmitMode::Immediate, 16)).unwrap();
    }

    #[test]
    fn generated_matmul_runs_batched_with_a_deep_queue() {
        run_emulated(&opts(AdmitMode::Batched, 64)).unwrap();
    }

    #[test]
    fn operand_fetches_pass_validation() {
        let caps = CapabilityDescriptor::default_emulated();
        for f in operand_fetches(&caps, &params(), 0x1000, 0x2000) {
            bismo_core::validate::validate_fetch(&f, &caps).unwrap();
        }
    }
}
