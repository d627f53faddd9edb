use bismo_common::isa::{FetchRunCfg, Instruction, RunConfig, Stage};
use bismo_core::AccelError;
use bismo_core::admission::AdmitMode;
use bismo_core::capabilities::CapabilityDescriptor;
use bismo_core::driver::AccelDriver;
use bismo_core::emu::EmuAccel;
use bismo_core::generator::{
    ExecStreamParams, ResultStreamLayout, fetch_stream, generate, result_stream,
};
use bismo_core::platform::SpinLimit;
use bismo_core::sync::{EXECRES_TOKENS, FETCHEXEC_TOKENS, Link};

const SPIN: SpinLimit = SpinLimit::Iterations(50_000);

fn driver(queue_entries: u64) -> AccelDriver<EmuAccel> {
    let mut caps = CapabilityDescriptor::default_emulated();
    caps.cmd_queue_entries = queue_entries;
    AccelDriver::new(EmuAccel::new(caps))
        .unwrap()
        .with_spin_limit(SPIN)
}

fn params() -> ExecStreamParams {
    ExecStreamParams {
        tiles_m: 2,
        tiles_k: 1,
        tiles_n: 2,
        bits_l: 2,
        bits_r: 2,
        base_l: 0,
        base_r: 0,
        base_res: 0,
        nbufs_res: 2,
    }
}

fn operand_fetches(caps: &CapabilityDescriptor) -> Vec<FetchRunCfg> {
    let lhs = FetchRunCfg {
        bram_id_start: caps.first_lhs_id(),
        bram_id_range: caps.dpa_dim_lhs - 1,
        dram_base: 0x2000,
        dram_block_size_bytes: 64,
        dram_block_count: 4,
        dram_block_offset_bytes: 64,
        tiles_per_row: 1,
        ..Default::default()
    };
    let rhs = FetchRunCfg {
        bram_id_start: caps.first_rhs_id(),
        dram_base: 0x4000,
        ..lhs
    };
    vec![lhs, rhs]
}

struct Streams {
    fetch: Vec<Instruction>,
    exec: Vec<Instruction>,
    result: Vec<Instruction>,
}

fn streams(caps: &CapabilityDescriptor) -> Streams {
    let p = params();
    Streams {
        fetch: fetch_stream(&operand_fetches(caps)),
        exec: generate(&p).unwrap(),
        result: result_stream(
            &p,
            ResultStreamLayout {
                dram_base: 0x8000,
                tile_stride_bytes: 64,
                dram_skip: 0,
            },
        )
        .unwrap(),
    }
}

fn runs(retired: &[Instruction]) -> usize {
    retired
        .iter()
        .filter(|i| matches!(i, Instruction::Run(_)))
        .count()
}

fn assert_pools_restored(drv: &AccelDriver<EmuAccel>) {
    let emu = drv.platform();
    assert_eq!(emu.tokens(Link::ExecToFetch), FETCHEXEC_TOKENS);
    assert_eq!(emu.tokens(Link::ResultToExec), EXECRES_TOKENS);
    assert_eq!(emu.tokens(Link::FetchToExec), 0);
    assert_eq!(emu.tokens(Link::ExecToResult), 0);
}

#[test]
fn priming_drains_every_queue_and_fills_the_pools() {
    let mut drv = driver(16);
    drv.init_resource_pools().unwrap();
    for stage in Stage::ALL {
        assert_eq!(drv.opcount(stage).unwrap(), 0);
    }
    assert_pools_restored(&drv);
}

#[test]
fn immediate_streams_complete_without_deadlock() {
    let mut drv = driver(256);
    drv.init_resource_pools().unwrap();
    let s = streams(drv.caps());
    drv.push_stream(&s.fetch, AdmitMode::Immediate).unwrap();
    drv.push_stream(&s.exec, AdmitMode::Immediate).unwrap();
    drv.push_stream(&s.result, AdmitMode::Immediate).unwrap();

    drv.set_stage_enables(true, true, true).unwrap();
    drv.wait_idle().unwrap();

    let emu = drv.platform();
    assert_eq!(runs(emu.retired(Stage::Fetch)), 2);
    assert_eq!(runs(emu.retired(Stage::Execute)), 16);
    assert_eq!(runs(emu.retired(Stage::Result)), 4);
    assert_pools_restored(&drv);
}

#[test]
fn immediate_push_waits_for_queue_space() {
    let mut drv = driver(16);
    drv.init_resource_pools().unwrap();
    let s = streams(drv.caps());
    assert!(s.exec.len() > 16);

    drv.set_stage_enables(true, true, true).unwrap();
    drv.push_stream(&s.result, AdmitMode::Immediate).unwrap();
    drv.push_stream(&s.fetch, AdmitMode::Immediate).unwrap();
    drv.push_stream(&s.exec, AdmitMode::Immediate).unwrap();
    drv.wait_idle().unwrap();

    assert!(drv.platform().retired(Stage::Execute).ends_with(&s.exec));
    assert_pools_restored(&drv);
}

#[test]
fn batched_streams_complete_without_deadlock() {
    let mut drv = driver(256);
    drv.init_resource_pools().unwrap();
    let s = streams(drv.caps());
    for stream in [&s.fetch, &s.exec, &s.result] {
        drv.push_stream(stream, AdmitMode::Batched).unwrap();
    }
    let total = s.fetch.len() + s.exec.len() + s.result.len();
    assert_eq!(drv.staged_count(), total);

    drv.flush_batched().unwrap();
    drv.set_stage_enables(true, true, true).unwrap();
    drv.wait_idle().unwrap();
    drv.clear_instr_buf();

    let emu = drv.platform();
    // The bootstrap fetch retires alongside the operand fetches.
    assert_eq!(runs(emu.retired(Stage::Fetch)), 3);
    // Priming tokens retire first on Execute and Result.
    assert!(emu.retired(Stage::Execute).ends_with(&s.exec));
    assert!(emu.retired(Stage::Result).ends_with(&s.result));
    assert_eq!(drv.staged_count(), 0);
    assert_pools_restored(&drv);
}

#[test]
fn batch_larger_than_the_queue_is_refused_before_upload() {
    let mut drv = driver(16);
    drv.init_resource_pools().unwrap();
    let s = streams(drv.caps());
    assert_eq!(s.exec.len(), 26);
    let err = drv.push_stream(&s.exec, AdmitMode::Batched).unwrap_err();
    assert!(matches!(
        err,
        AccelError::QueueCapacity {
            count: 26,
            limit: 16
        }
    ));
    assert!(drv.platform().is_idle());
    assert_eq!(drv.staged_count(), 0);

    // Flushing after the refusal uploads an empty batch and leaves no
    // half-stream holding a token channel.
    drv.flush_batched().unwrap();
    drv.set_stage_enables(true, true, true).unwrap();
    drv.platform_mut().run_until_idle(1_000).unwrap();
    assert_eq!(runs(drv.platform().retired(Stage::Execute)), 0);
    assert_pools_restored(&drv);
}

#[test]
fn unmatched_receive_never_completes() {
    let mut drv = driver(16);
    drv.init_resource_pools().unwrap();
    drv.push_immediate(Instruction::ReceiveToken {
        stage: Stage::Result,
        channel: 0,
    })
    .unwrap();
    drv.set_stage_enables(true, true, true).unwrap();

    let err = drv.wait_idle().unwrap_err();
    assert!(matches!(err, AccelError::SpinTimeout { .. }));

    let err = drv.platform_mut().run_until_idle(1_000).unwrap_err();
    assert!(matches!(err, AccelError::Stalled { .. }));
    assert_eq!(drv.result_opcount().unwrap(), 1);
}

#[test]
fn reset_requires_priming_again() {
    let mut drv = driver(16);
    drv.init_resource_pools().unwrap();
    drv.reset().unwrap();
    assert_eq!(drv.platform().tokens(Link::ExecToFetch), 0);

    drv.init_resource_pools().unwrap();
    assert_pools_restored(&drv);
}

#[test]
fn invalid_instruction_in_a_stream_stops_admission() {
    let mut drv = driver(16);
    let bad = Instruction::Run(RunConfig::Fetch(FetchRunCfg {
        bram_id_start: 1,
        dram_base: 0x2001,
        dram_block_size_bytes: 64,
        dram_block_count: 1,
        ..Default::default()
    }));
    let stream = [
        Instruction::ReceiveToken {
            stage: Stage::Fetch,
            channel: 0,
        },
        bad,
    ];
    let err = drv.push_stream(&stream, AdmitMode::Immediate).unwrap_err();
    assert!(matches!(
        err,
        AccelError::InvalidConfig {
            stage: Stage::Fetch,
            ..
        }
    ));
    assert_eq!(drv.platform().queued(Stage::Fetch), &stream[..1]);
}
