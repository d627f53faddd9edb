use crate::{AccelError, Result};

/// Accelerator-side buffer handed out by [`Platform::alloc_accel_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelBuffer {
    /// Address of the buffer in the accelerator's external memory.
    pub addr: u64,
    /// Size of the buffer in bytes.
    pub len: usize,
}

/// Register-level transport to one accelerator instance.
///
/// Implementations are assumed reliable and synchronous: a call that
/// returns `Ok` has fully taken effect, with no partial transfers.
pub trait Platform {
    /// Writes a 32-bit value to the register at index `reg`.
    fn write_reg(&mut self, reg: u32, value: u32) -> Result<()>;

    /// Reads the 32-bit register at index `reg`.
    fn read_reg(&mut self, reg: u32) -> Result<u32>;

    /// Allocates `bytes` of accelerator-visible external memory, aligned
    /// to the Fetch stage's address alignment.
    fn alloc_accel_buffer(&mut self, bytes: usize) -> Result<AccelBuffer>;

    /// Copies `src` into the start of `dst`.
    fn copy_host_to_accel(&mut self, src: &[u8], dst: AccelBuffer) -> Result<()>;

    /// Short name of the platform, used in logs.
    fn platform_id(&self) -> &str;
}

impl<P: Platform + ?Sized> Platform for &mut P {
    fn write_reg(&mut self, reg: u32, value: u32) -> Result<()> {
        (**self).write_reg(reg, value)
    }

    fn read_reg(&mut self, reg: u32) -> Result<u32> {
        (**self).read_reg(reg)
    }

    fn alloc_accel_buffer(&mut self, bytes: usize) -> Result<AccelBuffer> {
        (**self).alloc_accel_buffer(bytes)
    }

    fn copy_host_to_accel(&mut self, src: &[u8], dst: AccelBuffer) -> Result<()> {
        (**self).copy_host_to_accel(src, dst)
    }

    fn platform_id(&self) -> &str {
        (**self).platform_id()
    }
}

/// Upper bound on a busy-wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpinLimit {
    /// Poll until the predicate holds, however long that takes.
    #[default]
    Unbounded,
    /// Give up with [`AccelError::SpinTimeout`] after this many polls.
    Iterations(u64),
}

/// Polls `ready` until it returns true.
///
/// Every blocking point of the control plane goes through here: waiting for
/// room in a stage queue and waiting for a queue to drain while priming.
/// The predicate is injectable so tests can drive the wait against an
/// emulated accelerator instead of hardware.
///
/// # Returns
///
/// The number of polls it took, or the first error raised by `ready`.
pub fn spin_until<F>(limit: SpinLimit, what: &'static str, mut ready: F) -> Result<u64>
where
    F: FnMut() -> Result<bool>,
{
    let mut polls = 0u64;
    loop {
        polls += 1;
        if ready()? {
            return Ok(polls);
        }
        if let SpinLimit::Iterations(max) = limit {
            if polls >= max {
                return Err(AccelError::SpinTimeout {
                    what,
                    iterations: polls,
                });
            }
        }
        core::hint::spin_loop();
    }
}
