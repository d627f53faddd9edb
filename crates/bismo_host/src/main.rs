mod bridge;
mod emulate;
mod generator;
mod stats;
mod throughput;

use anyhow::Result;
use bismo_core::admission::AdmitMode;
use bismo_core::capabilities::CapabilityDescriptor;
use bismo_core::generator::ExecStreamParams;
use bismo_core::platform::SpinLimit;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bismo", about = "Bit-serial matrix multiplication accelerator host tools")]
struct Cli {
    /// Give up busy-waits after this many polls instead of spinning forever.
    #[arg(long, global = true)]
    spin_limit: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

/// Tiling of one bit-serial matrix multiplication.
#[derive(Args, Clone, Copy)]
struct MatmulArgs {
    /// Output tile rows.
    #[arg(short = 'm', long, default_value_t = 2)]
    tiles_m: u64,
    /// Tiles along the common dimension.
    #[arg(short = 'k', long, default_value_t = 1)]
    tiles_k: u64,
    /// Output tile columns.
    #[arg(short = 'n', long, default_value_t = 2)]
    tiles_n: u64,
    #[arg(long, default_value_t = 2)]
    bits_l: u64,
    #[arg(long, default_value_t = 2)]
    bits_r: u64,
    #[arg(long, default_value_t = 0)]
    base_l: u64,
    #[arg(long, default_value_t = 0)]
    base_r: u64,
    #[arg(long, default_value_t = 0)]
    base_res: u64,
    /// Result buffers the execute stage rotates through.
    #[arg(long, default_value_t = 2)]
    nbufs_res: u64,
}

impl From<MatmulArgs> for ExecStreamParams {
    fn from(a: MatmulArgs) -> Self {
        Self {
            tiles_m: a.tiles_m,
            tiles_k: a.tiles_k,
            tiles_n: a.tiles_n,
            bits_l: a.bits_l,
            bits_r: a.bits_r,
            base_l: a.base_l,
            base_r: a.base_r,
            base_res: a.base_res,
            nbufs_res: a.nbufs_res,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hardware summary of an emulated accelerator.
    Hwcfg {
        /// Hardware config file; the built-in configuration if omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Also write the discovered configuration to this file.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Generate an execute instruction stream file.
    Gen {
        #[command(flatten)]
        matmul: MatmulArgs,
        #[arg(short, long, default_value = "exec.bin")]
        out: PathBuf,
        /// Print the generated instructions.
        #[arg(long)]
        list: bool,
    },
    /// Run a matrix multiplication, or a stream file, on the emulator.
    Run {
        #[command(flatten)]
        matmul: MatmulArgs,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Push this instruction file instead of generated streams.
        #[arg(short, long)]
        stream: Option<PathBuf>,
        /// Stage instructions and let the accelerator fetch them in bulk.
        #[arg(long)]
        batched: bool,
        #[arg(long, default_value_t = 1_000_000)]
        max_cycles: u64,
    },
    /// Measure parallel stream generation and encoding throughput.
    Bench {
        #[command(flatten)]
        matmul: MatmulArgs,
        #[arg(long, default_value_t = 10_000)]
        iterations: usize,
    },
    /// Drive an accelerator simulation over TCP.
    Hil {
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
        /// Push this instruction file after priming.
        #[arg(short, long)]
        stream: Option<PathBuf>,
    },
}

fn load_caps(config: Option<PathBuf>) -> Result<CapabilityDescriptor> {
    match config {
        Some(path) => bismo_io::hwcfg::load_hwcfg(path),
        None => Ok(CapabilityDescriptor::default_emulated()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let spin = cli.spin_limit.map_or(SpinLimit::Unbounded, SpinLimit::Iterations);

    match cli.command {
        Commands::Hwcfg { config, out } => {
            emulate::print_hwcfg(load_caps(config)?, out)?;
        }
        Commands::Gen { matmul, out, list } => {
            generator::write_exec_stream(&matmul.into(), &out, list)?;
        }
        Commands::Run {
            matmul,
            config,
            stream,
            batched,
            max_cycles,
        } => {
            let opts = emulate::RunOptions {
                caps: load_caps(config)?,
                params: matmul.into(),
                stream,
                mode: if batched {
                    AdmitMode::Batched
                } else {
                    AdmitMode::Immediate
                },
                spin,
                max_cycles,
            };
            emulate::run_emulated(&opts)?;
        }
        Commands::Bench { matmul, iterations } => {
            throughput::run_benchmark(&matmul.into(), iterations)?;
        }
        Commands::Hil { addr, stream } => {
            bridge::run_hil(&addr, stream, spin)?;
        }
    }
    Ok(())
}
