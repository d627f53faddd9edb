use anyhow::{Context, Result, bail};
use bismo_common::encoding::{INSTR_BYTES, WireInstr, decode, encode};
use bismo_common::isa::Instruction;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Decodes a stream of back-to-back encoded instructions.
pub fn read_instrs<R: Read>(mut reader: R) -> Result<Vec<Instruction>> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    if buffer.len() % INSTR_BYTES != 0 {
        bail!(
            "stream is {} bytes, not a multiple of {}",
            buffer.len(),
            INSTR_BYTES
        );
    }

    buffer
        .chunks_exact(INSTR_BYTES)
        .enumerate()
        .map(|(i, chunk)| {
            WireInstr::from_le_bytes(chunk)
                .and_then(decode)
                .with_context(|| format!("instruction {}", i))
        })
        .collect()
}

pub fn write_instrs<W: Write>(mut writer: W, stream: &[Instruction]) -> Result<()> {
    for ins in stream {
        writer.write_all(&encode(ins).to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Loads an instruction stream file.
pub fn load_instr_file<P: AsRef<Path>>(path: P) -> Result<Vec<Instruction>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open instruction file {}", path.display()))?;
    read_instrs(file).with_context(|| format!("Invalid instruction file {}", path.display()))
}

pub fn save_instr_file<P: AsRef<Path>>(path: P, stream: &[Instruction]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("Failed to create instruction file {}", path.display()))?;
    write_instrs(BufWriter::new(file), stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bismo_common::isa::{ExecRunCfg, Stage};

    fn stream() -> Vec<Instruction> {
        vec![
            Instruction::ReceiveToken {
                stage: Stage::Execute,
                channel: 1,
            },
            Instruction::exec(ExecRunCfg {
                lhs_offset: 3,
                rhs_offset: 7,
                num_tiles: 2,
                shift_amount: 1,
                write_en: true,
                write_addr: 5,
                ..Default::default()
            }),
        ]
    }

    #[test]
    fn stream_survives_a_file() {
        let path = std::env::temp_dir().join(format!("bismo-loader-{}.bin", std::process::id()));
        save_instr_file(&path, &stream()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * INSTR_BYTES as u64);
        let loaded = load_instr_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, stream());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut bytes = Vec::new();
        write_instrs(&mut bytes, &stream()).unwrap();
        bytes.pop();
        let err = read_instrs(bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("not a multiple of 16"));
    }

    #[test]
    fn bad_stage_tag_names_the_instruction() {
        let mut bytes = Vec::new();
        write_instrs(&mut bytes, &stream()).unwrap();
        bytes[INSTR_BYTES] |= 0b11;
        let err = read_instrs(bytes.as_slice()).unwrap_err();
        assert_eq!(err.to_string(), "instruction 1");
    }

    #[test]
    fn missing_file_has_context() {
        let err = load_instr_file("/nonexistent/stream.bin").unwrap_err();
        assert!(err.to_string().contains("Failed to open instruction file"));
    }
}
