//! Driver handle for one accelerator instance.
//!
//! All accelerator state is reached through an [`AccelDriver`]: it owns the
//! transport, the capability descriptor discovered at construction, and the
//! host-side staging buffer with its accelerator-side mirror.

use crate::admission::{self, AdmitMode, StagedInstrs};
use crate::capabilities::CapabilityDescriptor;
use crate::platform::{AccelBuffer, Platform, SpinLimit, spin_until};
use crate::sync::{self, DEFAULT_PRIMING};
use crate::validate::validate;
use crate::Result;
use bismo_common::encoding::{INSTR_BYTES, encode};
use bismo_common::isa::{
    ExecRunCfg, FetchRunCfg, Instruction, Op, ResultRunCfg, RunConfig, Stage,
};
use bismo_common::mmio;
use tracing::{debug, info};

pub struct AccelDriver<P: Platform> {
    platform: P,
    caps: CapabilityDescriptor,
    staged: StagedInstrs,
    accel_instr_buf: AccelBuffer,
    spin: SpinLimit,
}

impl<P: Platform> AccelDriver<P> {
    /// Discovers the accelerator's capabilities and allocates the
    /// accelerator-side buffer for batched instructions.
    pub fn new(mut platform: P) -> Result<Self> {
        let caps = CapabilityDescriptor::discover(&mut platform)?;
        let staged = StagedInstrs::new(&caps);
        let accel_instr_buf = platform.alloc_accel_buffer(staged.limit() * INSTR_BYTES)?;
        info!(
            addr = %format_args!("{:#x}", accel_instr_buf.addr),
            len = accel_instr_buf.len,
            "allocated instruction buffer"
        );
        Ok(Self {
            platform,
            caps,
            staged,
            accel_instr_buf,
            spin: SpinLimit::Unbounded,
        })
    }

    /// Bounds every busy-wait the driver performs.
    pub fn with_spin_limit(mut self, spin: SpinLimit) -> Self {
        self.spin = spin;
        self
    }

    /// The bound applied to every busy-wait.
    pub fn spin_limit(&self) -> SpinLimit {
        self.spin
    }

    /// Capabilities discovered when the driver was created.
    pub fn caps(&self) -> &CapabilityDescriptor {
        &self.caps
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn into_platform(self) -> P {
        self.platform
    }

    /// Resets the controllers, their queues and token FIFOs.
    ///
    /// Tokens are lost; [`AccelDriver::init_resource_pools`] must run again
    /// before any workload.
    pub fn reset(&mut self) -> Result<()> {
        self.platform.write_reg(mmio::REG_RESET, 1)?;
        self.platform.write_reg(mmio::REG_RESET, 0)?;
        debug!("accelerator reset");
        Ok(())
    }

    /// Writes the three stage enable registers in pipeline order.
    pub fn set_stage_enables(&mut self, fetch: bool, exec: bool, result: bool) -> Result<()> {
        for (stage, on) in Stage::ALL.into_iter().zip([fetch, exec, result]) {
            self.platform
                .write_reg(mmio::enable_reg(stage.index()), on as u32)?;
        }
        Ok(())
    }

    /// Enables `stage` and disables the other two.
    pub fn enable_only(&mut self, stage: Stage) -> Result<()> {
        self.set_stage_enables(
            stage == Stage::Fetch,
            stage == Stage::Execute,
            stage == Stage::Result,
        )
    }

    /// Instructions pending in `stage`'s queue.
    pub fn opcount(&mut self, stage: Stage) -> Result<u32> {
        self.platform.read_reg(mmio::op_count_reg(stage.index()))
    }

    pub fn fetch_opcount(&mut self) -> Result<u32> {
        self.opcount(Stage::Fetch)
    }

    pub fn exec_opcount(&mut self) -> Result<u32> {
        self.opcount(Stage::Execute)
    }

    pub fn result_opcount(&mut self) -> Result<u32> {
        self.opcount(Stage::Result)
    }

    /// True while the queue targeted by the staged op has no room.
    pub fn op_full(&mut self) -> Result<bool> {
        Ok(self.platform.read_reg(mmio::REG_OP_READY)? != 1)
    }

    /// Validates, encodes and admits one instruction.
    ///
    /// Validation and capacity failures are returned before anything is
    /// encoded or written to the platform.
    pub fn push_instruction(&mut self, ins: Instruction, mode: AdmitMode) -> Result<()> {
        validate(&ins, &self.caps)?;
        match mode {
            AdmitMode::Immediate => {
                admission::push_immediate(&mut self.platform, encode(&ins), self.spin)?
            }
            AdmitMode::Batched => self.staged.push(&ins)?,
        }
        debug!(?mode, "admitted {}", ins);
        Ok(())
    }

    pub fn push_immediate(&mut self, ins: Instruction) -> Result<()> {
        self.push_instruction(ins, AdmitMode::Immediate)
    }

    /// Admits a whole stream in order.
    ///
    /// Immediate admission stops at the first failure; instructions before
    /// it are already in their queues. Batched admission validates the
    /// whole stream and checks it fits before staging any of it, so a
    /// failure leaves the staging buffer as it was.
    pub fn push_stream(&mut self, stream: &[Instruction], mode: AdmitMode) -> Result<()> {
        match mode {
            AdmitMode::Immediate => {
                for ins in stream {
                    self.push_instruction(*ins, mode)?;
                }
            }
            AdmitMode::Batched => {
                for ins in stream {
                    validate(ins, &self.caps)?;
                }
                self.staged.extend(stream)?;
                debug!(count = stream.len(), staged = self.staged.len(), "stream staged");
            }
        }
        Ok(())
    }

    pub fn push_fetch_op(&mut self, op: Op, cfg: FetchRunCfg) -> Result<()> {
        self.push_immediate(Instruction::from_op(op, RunConfig::Fetch(cfg)))
    }

    pub fn push_exec_op(&mut self, op: Op, cfg: ExecRunCfg) -> Result<()> {
        self.push_immediate(Instruction::from_op(op, RunConfig::Execute(cfg)))
    }

    pub fn push_result_op(&mut self, op: Op, cfg: ResultRunCfg) -> Result<()> {
        self.push_immediate(Instruction::from_op(op, RunConfig::Result(cfg)))
    }

    /// Drops all batched instructions not yet uploaded.
    pub fn clear_instr_buf(&mut self) {
        self.staged.clear();
    }

    /// Instructions staged for the next batched upload.
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Bytes the staged instructions occupy in external memory.
    pub fn dram_instr_bytes(&self) -> usize {
        self.staged.byte_len()
    }

    /// Copies the staged instructions to the accelerator-side buffer.
    pub fn sync_instrs(&mut self) -> Result<()> {
        let bytes = self.staged.to_bytes();
        self.platform
            .copy_host_to_accel(&bytes, self.accel_instr_buf)?;
        debug!(bytes = bytes.len(), "staged instructions uploaded");
        Ok(())
    }

    /// Pushes the Fetch run that makes the accelerator pull the uploaded
    /// instructions into its stage queues.
    pub fn add_dram_instr_fetch(&mut self) -> Result<()> {
        let cfg = admission::bootstrap_fetch(self.accel_instr_buf, self.dram_instr_bytes());
        self.push_immediate(Instruction::Run(RunConfig::Fetch(cfg)))
    }

    /// Uploads the staged batch and pushes its bootstrap fetch.
    ///
    /// The host copy stays staged; clear it with
    /// [`AccelDriver::clear_instr_buf`] once the accelerator has fetched it.
    pub fn flush_batched(&mut self) -> Result<()> {
        self.sync_instrs()?;
        self.add_dram_instr_fetch()
    }

    /// Primes the token FIFOs with the default pool sizes.
    pub fn init_resource_pools(&mut self) -> Result<()> {
        sync::init_resource_pools(self, &DEFAULT_PRIMING)
    }

    /// Spins until all three stage queues are empty.
    pub fn wait_idle(&mut self) -> Result<()> {
        let spin = self.spin;
        spin_until(spin, "pipeline idle", || {
            for stage in Stage::ALL {
                if self.opcount(stage)? != 0 {
                    return Ok(false);
                }
            }
            Ok(true)
        })?;
        Ok(())
    }

    pub fn num_fetch_nodes(&self) -> u64 {
        self.caps.num_fetch_nodes()
    }

    pub fn first_lhs_id(&self) -> u64 {
        self.caps.first_lhs_id()
    }

    pub fn first_rhs_id(&self) -> u64 {
        self.caps.first_rhs_id()
    }

    pub fn lhs_total_bram_bytes(&self) -> u64 {
        self.caps.lhs_total_bram_bytes()
    }

    pub fn rhs_total_bram_bytes(&self) -> u64 {
        self.caps.rhs_total_bram_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccelError;
    use crate::emu::EmuAccel;

    /// Counts transport calls made after construction.
    struct Recording {
        inner: EmuAccel,
        writes: usize,
        copies: usize,
    }

    impl Platform for Recording {
        fn write_reg(&mut self, reg: u32, value: u32) -> Result<()> {
            self.writes += 1;
            self.inner.write_reg(reg, value)
        }
        fn read_reg(&mut self, reg: u32) -> Result<u32> {
            self.inner.read_reg(reg)
        }
        fn alloc_accel_buffer(&mut self, bytes: usize) -> Result<AccelBuffer> {
            self.inner.alloc_accel_buffer(bytes)
        }
        fn copy_host_to_accel(&mut self, src: &[u8], dst: AccelBuffer) -> Result<()> {
            self.copies += 1;
            self.inner.copy_host_to_accel(src, dst)
        }
        fn platform_id(&self) -> &str {
            "recording"
        }
    }

    fn recording_driver() -> AccelDriver<Recording> {
        AccelDriver::new(Recording {
            inner: EmuAccel::new(CapabilityDescriptor::default_emulated()),
            writes: 0,
            copies: 0,
        })
        .unwrap()
    }

    fn token(channel: u8) -> Instruction {
        Instruction::SendToken {
            stage: Stage::Execute,
            channel,
        }
    }

    #[test]
    fn batched_overflow_fails_before_any_transport_call() {
        let mut drv = recording_driver();
        let limit = drv.caps().cmd_queue_entries as usize;
        for i in 0..limit {
            drv.push_instruction(token(i as u8 % 2), AdmitMode::Batched)
                .unwrap();
        }
        let err = drv
            .push_instruction(token(0), AdmitMode::Batched)
            .unwrap_err();
        assert!(matches!(err, AccelError::QueueCapacity { .. }));
        assert_eq!(drv.platform().writes, 0);
        assert_eq!(drv.platform().copies, 0);
        assert_eq!(drv.staged_count(), limit);
    }

    #[test]
    fn batched_stream_with_a_bad_instruction_stages_nothing() {
        let mut drv = recording_driver();
        let bad = Instruction::exec(ExecRunCfg {
            shift_amount: 1 << 5,
            ..Default::default()
        });
        let stream = [token(0), token(1), bad, token(0)];
        let err = drv.push_stream(&stream, AdmitMode::Batched).unwrap_err();
        assert!(matches!(err, AccelError::InvalidConfig { .. }));
        assert_eq!(drv.staged_count(), 0);

        drv.push_stream(&stream[..2], AdmitMode::Batched).unwrap();
        assert_eq!(drv.staged_count(), 2);
    }

    #[test]
    fn invalid_config_never_reaches_the_platform() {
        let mut drv = recording_driver();
        let bad = ExecRunCfg {
            shift_amount: 1 << 5,
            ..Default::default()
        };
        let err = drv.push_exec_op(Op::run(), bad).unwrap_err();
        assert!(matches!(
            err,
            AccelError::InvalidConfig {
                stage: Stage::Execute,
                ..
            }
        ));
        assert_eq!(drv.platform().writes, 0);
    }

    #[test]
    fn immediate_push_lands_in_the_target_queue() {
        let mut drv = recording_driver();
        drv.push_exec_op(Op::send(1), ExecRunCfg::default()).unwrap();
        drv.push_result_op(Op::receive(0), ResultRunCfg::default())
            .unwrap();
        assert_eq!(drv.exec_opcount().unwrap(), 1);
        assert_eq!(drv.result_opcount().unwrap(), 1);
        assert_eq!(drv.fetch_opcount().unwrap(), 0);
        assert!(!drv.op_full().unwrap());
    }

    #[test]
    fn bootstrap_covers_the_whole_staged_batch() {
        let mut drv = recording_driver();
        drv.push_instruction(token(0), AdmitMode::Batched).unwrap();
        drv.push_instruction(token(1), AdmitMode::Batched).unwrap();
        assert_eq!(drv.dram_instr_bytes(), 2 * INSTR_BYTES);
        drv.flush_batched().unwrap();
        assert_eq!(drv.platform().copies, 1);

        let queued = drv.platform().inner.queued(Stage::Fetch);
        match queued.as_slice() {
            [Instruction::Run(RunConfig::Fetch(cfg))] => {
                assert_eq!(cfg.bram_id_start, 0);
                assert_eq!(cfg.dram_block_count, 1);
                assert_eq!(cfg.dram_block_size_bytes, 2 * INSTR_BYTES as u64);
            }
            other => panic!("unexpected fetch queue {:?}", other),
        }
    }

    #[test]
    fn geometry_helpers_follow_capabilities() {
        let drv = recording_driver();
        assert_eq!(drv.num_fetch_nodes(), 5);
        assert_eq!(drv.first_lhs_id(), 1);
        assert_eq!(drv.first_rhs_id(), 3);
        assert_eq!(drv.rhs_total_bram_bytes(), 2 * 1024 * 8);
    }
}
