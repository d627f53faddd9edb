use anyhow::{Context, Result};
use bismo_core::generator::{ExecStreamParams, generate, result_rotation};
use bismo_io::loader::save_instr_file;
use std::path::Path;

/// Generates the execute stream for `params` and writes it to `out`.
pub fn write_exec_stream(params: &ExecStreamParams, out: &Path, list: bool) -> Result<()> {
    let stream = generate(params).context("Failed to generate execute stream")?;
    save_instr_file(out, &stream)?;

    println!(
        "{}x{}x{} tiles, {}x{} bits: {} instructions -> {}",
        params.tiles_m,
        params.tiles_k,
        params.tiles_n,
        params.bits_l,
        params.bits_r,
        stream.len(),
        out.display()
    );
    let rotation = result_rotation(params)?;
    println!("Result buffer per output tile: {:?}", rotation);

    if list {
        for (i, ins) in stream.iter().enumerate() {
            println!("{:5}  {}", i, ins);
        }
    }
    Ok(())
}
