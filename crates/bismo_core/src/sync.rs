//! Token synchronization between adjacent pipeline stages.
//!
//! Adjacent stages share on-chip buffers. Ownership of those buffers moves
//! between stages as tokens: a SendToken instruction hands one buffer to the
//! partner stage, a ReceiveToken instruction waits until the partner has
//! handed one over. The token counts live in hardware FIFOs; the host only
//! decides the order in which instructions are issued.
//!
//! Channel topology:
//!
//! ```text
//!   Fetch ch0  <->  Execute ch0     operand (input) buffers
//!   Execute ch1 <-> Result ch0      accumulator (result) buffers
//! ```

use crate::driver::AccelDriver;
use crate::platform::{Platform, spin_until};
use crate::{AccelError, Result};
use bismo_common::isa::{Instruction, Stage};
use tracing::{debug, info};

/// Execute channel guarding the operand buffers filled by Fetch.
pub const CHAN_INPUT_BUFFERS: u8 = 0;

/// Execute channel guarding the result buffers drained by Result.
pub const CHAN_RESULT_BUFFERS: u8 = 1;

/// Tokens primed on the Fetch/Execute boundary.
pub const FETCHEXEC_TOKENS: u32 = 2;

/// Tokens primed on the Execute/Result boundary.
pub const EXECRES_TOKENS: u32 = 2;

/// Depth of each hardware token FIFO.
pub const TOKEN_FIFO_DEPTH: u32 = 16;

/// One end of a token channel: a stage and its local channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncChannel {
    pub stage: Stage,
    pub channel: u8,
}

impl SyncChannel {
    /// Returns `None` if `stage` has no channel with that id.
    pub fn new(stage: Stage, channel: u8) -> Option<Self> {
        (channel < stage.num_sync_channels()).then_some(Self { stage, channel })
    }

    /// The other end of this channel.
    pub fn peer(&self) -> SyncChannel {
        match (self.stage, self.channel) {
            (Stage::Fetch, _) => SyncChannel {
                stage: Stage::Execute,
                channel: CHAN_INPUT_BUFFERS,
            },
            (Stage::Execute, CHAN_INPUT_BUFFERS) => SyncChannel {
                stage: Stage::Fetch,
                channel: 0,
            },
            (Stage::Execute, _) => SyncChannel {
                stage: Stage::Result,
                channel: 0,
            },
            (Stage::Result, _) => SyncChannel {
                stage: Stage::Execute,
                channel: CHAN_RESULT_BUFFERS,
            },
        }
    }

    /// FIFO a SendToken on this end writes into.
    pub fn send_link(&self) -> Link {
        Link::between(self.stage, self.peer().stage)
    }

    /// FIFO a ReceiveToken on this end reads from.
    pub fn receive_link(&self) -> Link {
        Link::between(self.peer().stage, self.stage)
    }
}

/// Directed token FIFO between two adjacent stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    FetchToExec = 0,
    ExecToFetch = 1,
    ExecToResult = 2,
    ResultToExec = 3,
}

impl Link {
    pub const ALL: [Link; 4] = [
        Link::FetchToExec,
        Link::ExecToFetch,
        Link::ExecToResult,
        Link::ResultToExec,
    ];

    fn between(from: Stage, to: Stage) -> Self {
        match (from, to) {
            (Stage::Fetch, _) => Link::FetchToExec,
            (Stage::Execute, Stage::Fetch) => Link::ExecToFetch,
            (Stage::Execute, _) => Link::ExecToResult,
            (Stage::Result, _) => Link::ResultToExec,
        }
    }
}

/// Counting semaphore backing one [`Link`].
///
/// The count can never go negative: a receive on an empty FIFO does not
/// happen, it blocks the receiving controller until a send arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFifo {
    count: u32,
    capacity: u32,
}

impl TokenFifo {
    pub const fn new(capacity: u32) -> Self {
        Self { count: 0, capacity }
    }

    /// Adds a token. Returns false, leaving the count unchanged, if full.
    pub fn try_send(&mut self) -> bool {
        if self.count < self.capacity {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Takes a token. Returns false, leaving the count unchanged, if empty.
    pub fn try_receive(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> u32 {
        self.count
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }
}

/// One step of resource pool priming: `tokens` SendToken ops pushed into
/// `stage`'s queue on `channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimingStep {
    pub stage: Stage,
    pub channel: u8,
    pub tokens: u32,
}

/// Execute hands Fetch its empty operand buffers, then Result hands
/// Execute its free result buffers.
pub const DEFAULT_PRIMING: [PrimingStep; 2] = [
    PrimingStep {
        stage: Stage::Execute,
        channel: CHAN_INPUT_BUFFERS,
        tokens: FETCHEXEC_TOKENS,
    },
    PrimingStep {
        stage: Stage::Result,
        channel: 0,
        tokens: EXECRES_TOKENS,
    },
];

/// Loads the initial tokens into the hardware FIFOs.
///
/// Stages come out of reset owning no buffers, so the first ReceiveToken of
/// any workload would block forever. For each step, with every stage
/// disabled, the step's SendToken ops are queued and counted, then only the
/// sending stage is enabled until its queue drains, which proves its FIFO
/// took every token. All stages are left disabled afterwards.
///
/// Must run once after every reset and before any workload instruction is
/// admitted.
pub fn init_resource_pools<P: Platform>(
    drv: &mut AccelDriver<P>,
    steps: &[PrimingStep],
) -> Result<()> {
    for step in steps {
        drv.set_stage_enables(false, false, false)?;
        let send = Instruction::SendToken {
            stage: step.stage,
            channel: step.channel,
        };
        for _ in 0..step.tokens {
            drv.push_immediate(send)?;
        }

        let queued = drv.opcount(step.stage)?;
        if queued != step.tokens {
            return Err(AccelError::PrimingMismatch {
                stage: step.stage,
                expected: step.tokens,
                actual: queued,
            });
        }
        debug!(stage = %step.stage, tokens = step.tokens, "priming tokens queued");

        drv.enable_only(step.stage)?;
        let spin = drv.spin_limit();
        spin_until(spin, "priming drain", || Ok(drv.opcount(step.stage)? == 0))?;
        drv.set_stage_enables(false, false, false)?;
    }
    info!(steps = steps.len(), "resource pools primed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_symmetric() {
        for stage in Stage::ALL {
            for channel in 0..stage.num_sync_channels() {
                let end = SyncChannel::new(stage, channel).unwrap();
                assert_eq!(end.peer().peer(), end);
                assert_eq!(end.send_link(), end.peer().receive_link());
            }
        }
    }

    #[test]
    fn execute_channels_reach_both_neighbours() {
        let input = SyncChannel::new(Stage::Execute, CHAN_INPUT_BUFFERS).unwrap();
        let result = SyncChannel::new(Stage::Execute, CHAN_RESULT_BUFFERS).unwrap();
        assert_eq!(input.peer().stage, Stage::Fetch);
        assert_eq!(result.peer().stage, Stage::Result);
        assert_eq!(input.receive_link(), Link::FetchToExec);
        assert_eq!(result.send_link(), Link::ExecToResult);
        assert!(SyncChannel::new(Stage::Result, 1).is_none());
    }

    #[test]
    fn token_count_never_goes_negative() {
        let mut fifo = TokenFifo::new(2);
        assert!(!fifo.try_receive());
        assert_eq!(fifo.pending(), 0);
        assert!(fifo.try_send());
        assert!(fifo.try_send());
        assert!(!fifo.try_send());
        assert_eq!(fifo.pending(), 2);
        assert!(fifo.try_receive());
        assert!(fifo.try_receive());
        assert!(!fifo.try_receive());
        assert_eq!(fifo.pending(), 0);
    }
}
