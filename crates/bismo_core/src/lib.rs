//! Host-side control plane for the bit-serial matrix multiplication
//! accelerator.
//!
//! The accelerator runs three independent pipeline stages (Fetch, Execute,
//! Result), each draining its own instruction queue. This crate validates
//! and admits instructions into those queues, primes and follows the token
//! protocol that keeps stages from trampling each other's buffers, and
//! generates the Execute instruction stream for tiled bit-serial matrix
//! multiplication.

use bismo_common::encoding::DecodeError;
use bismo_common::isa::Stage;
use thiserror::Error;

/// Instruction admission into the accelerator's stage queues.
///
/// Delivers encoded instructions either directly through the op staging
/// registers (immediate mode) or into a host-side buffer that the
/// accelerator fetches in one block transfer (batched mode).
pub mod admission;

/// Hardware capability descriptor.
///
/// Immutable snapshot of the accelerator's dimensions read once from its
/// `HW_*` registers. Every validation bound derives from it.
pub mod capabilities;

/// Driver handle owning the platform, the capability descriptor and the
/// staged instruction buffer.
pub mod driver;

/// Software emulation of the accelerator's control path.
///
/// Models the stage queues, controller state machines and token FIFOs at
/// register level so the driver, priming protocol and generated streams can
/// be exercised without hardware.
pub mod emu;

/// Tiled bit-serial matrix multiplication instruction stream generation.
pub mod generator;

/// Transport abstraction between the driver and the accelerator.
///
/// Register reads and writes, accelerator buffer allocation and host to
/// accelerator copies, plus the polling helper used for every busy-wait.
pub mod platform;

/// Token synchronization channels and resource pool priming.
pub mod sync;

/// Run configuration checks against declared widths and the capability
/// descriptor.
pub mod validate;

pub use validate::ConfigViolation;

/// Errors returned by the accelerator control plane.
///
/// Configuration, capacity and stream parameter errors are precondition
/// violations: they are reported before anything reaches the accelerator
/// and must not be retried or clamped by the caller.
#[derive(Debug, Error)]
pub enum AccelError {
    /// A run configuration or token op failed validation.
    #[error("invalid {stage} instruction: {violation}")]
    InvalidConfig {
        stage: Stage,
        violation: ConfigViolation,
    },

    /// Staging would take the buffer past its limit. `count` is the number
    /// of instructions the buffer would have held.
    #[error("staged instruction buffer full: {count} instructions, limit {limit}")]
    QueueCapacity { count: usize, limit: usize },

    /// Stream generation parameters describe no valid computation.
    #[error("invalid stream parameters: {reason}")]
    InvalidStreamParams { reason: &'static str },

    /// The discovered capability descriptor is unusable.
    #[error("invalid capability descriptor: {reason}")]
    InvalidCapabilities { reason: String },

    /// A stage queue did not hold the expected number of priming tokens.
    #[error("priming {stage}: expected {expected} pending tokens, found {actual}")]
    PrimingMismatch {
        stage: Stage,
        expected: u32,
        actual: u32,
    },

    /// A bounded spin gave up before its predicate held.
    #[error("waiting for {what} gave up after {iterations} polls")]
    SpinTimeout { what: &'static str, iterations: u64 },

    /// The emulated pipeline stopped making progress.
    #[error("pipeline stalled after {cycles} cycles: {blocked}")]
    Stalled { cycles: u64, blocked: String },

    #[error("instruction decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// The transport collaborator failed.
    #[error("transport error: {reason}")]
    Transport { reason: String },
}

impl AccelError {
    pub fn invalid_config(stage: Stage, violation: ConfigViolation) -> Self {
        Self::InvalidConfig { stage, violation }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;
