use crate::stats::LatencyStats;
use anyhow::Result;
use bismo_common::encoding::encode;
use bismo_core::AccelError;
use bismo_core::generator::{ExecStreamParams, generate_into};
use rayon::prelude::*;
use std::time::Instant;

/// Generates and encodes `iterations` execute streams in parallel.
///
/// Each iteration shifts the operand and result bases so no two streams are
/// identical. Reports instruction throughput and per-stream latency.
pub fn run_benchmark(params: &ExecStreamParams, iterations: usize) -> Result<()> {
    params.check()?;
    println!(
        "Generating {} streams of {} instructions (Parallel - Rayon)...",
        iterations,
        params.instruction_count()
    );

    let start = Instant::now();
    let (instructions, stats) = (0..iterations)
        .into_par_iter()
        .map_init(Vec::new, |buf, i| {
            let p = ExecStreamParams {
                base_l: params.base_l + (i as u64 % 64),
                base_r: params.base_r + (i as u64 % 32),
                base_res: params.base_res + (i as u64 % 4),
                ..*params
            };
            let t0 = Instant::now();
            buf.clear();
            generate_into(&p, buf)?;
            let words = buf.iter().map(|ins| encode(ins).0[0] as u64).sum::<u64>();
            std::hint::black_box(words);
            let mut stats = LatencyStats::new(1_000);
            stats.update(t0.elapsed().as_nanos() as u64);
            Ok::<_, AccelError>((buf.len() as u64, stats))
        })
        .try_reduce(
            || (0, LatencyStats::new(1_000)),
            |(n1, s1), (n2, s2)| Ok((n1 + n2, s1.merge(s2))),
        )?;

    let seconds = start.elapsed().as_secs_f64();
    println!("Results");
    println!("Time: {:.4} s", seconds);
    println!("Instructions: {}", instructions);
    println!("Throughput: {:.2} instructions/s", instructions as f64 / seconds);
    stats.print_report("Per-stream latency");
    Ok(())
}
