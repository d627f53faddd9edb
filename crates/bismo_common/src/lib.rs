//! Common definitions shared by the bit-serial matrix multiplication
//! accelerator host stack.
//!
//! This crate provides the accelerator's register map, the instruction set
//! seen by its three pipeline stages, the declared bit widths of every
//! instruction field, and the 128-bit wire encoding. It is `no_std` so the
//! same definitions can be linked into emulators, host tools and embedded
//! drivers alike.

#![no_std]

// Register map of the accelerator's control interface.
//
// Registers are addressed by index and are 32 bits wide. The layout matches
// the accelerator wrapper's register file; both the software emulator and
// the TCP simulation bridge decode the same indices.
pub mod mmio {
    /// Writing 1 then 0 resets all three controllers and their queues.
    pub const REG_RESET: u32 = 0;

    /// Run enable for the Fetch stage controller.
    ///
    /// A disabled controller keeps its queued instructions but does not
    /// dequeue or execute any of them.
    pub const REG_FETCH_ENABLE: u32 = 1;

    /// Run enable for the Execute stage controller.
    pub const REG_EXEC_ENABLE: u32 = 2;

    /// Run enable for the Result stage controller.
    pub const REG_RESULT_ENABLE: u32 = 3;

    /// First of four staging registers holding the instruction to push.
    ///
    /// `REG_OP_BITS0 + i` holds wire word `i`, least significant word first.
    pub const REG_OP_BITS0: u32 = 4;

    /// Rising edge pushes the staged instruction into its target stage queue.
    pub const REG_OP_VALID: u32 = 8;

    /// Reads 1 while the queue targeted by the staged instruction has room.
    pub const REG_OP_READY: u32 = 9;

    /// Number of instructions pending in the Fetch queue, including the
    /// one the controller is currently working on.
    pub const REG_FETCH_OP_COUNT: u32 = 10;

    /// Number of instructions pending in the Execute queue.
    pub const REG_EXEC_OP_COUNT: u32 = 11;

    /// Number of instructions pending in the Result queue.
    pub const REG_RESULT_OP_COUNT: u32 = 12;

    /// Accumulator width in bits.
    pub const REG_HW_ACC_WIDTH: u32 = 13;
    /// Depth of each stage's command queue.
    pub const REG_HW_CMD_QUEUE_ENTRIES: u32 = 14;
    /// Systolic array size along the common (dot product) dimension.
    pub const REG_HW_DPA_DIM_COMMON: u32 = 15;
    /// Systolic array size along the left-hand side rows.
    pub const REG_HW_DPA_DIM_LHS: u32 = 16;
    /// Systolic array size along the right-hand side rows.
    pub const REG_HW_DPA_DIM_RHS: u32 = 17;
    /// Entries per left-hand side on-chip memory.
    pub const REG_HW_LHS_ENTRIES_PER_MEM: u32 = 18;
    /// Largest accumulator shift the Execute stage supports.
    pub const REG_HW_MAX_SHIFT_STEPS: u32 = 19;
    /// External memory read channel width in bits.
    pub const REG_HW_READ_CHAN_WIDTH: u32 = 20;
    /// Entries per right-hand side on-chip memory.
    pub const REG_HW_RHS_ENTRIES_PER_MEM: u32 = 21;
    /// External memory write channel width in bits.
    pub const REG_HW_WRITE_CHAN_WIDTH: u32 = 22;

    /// Total number of registers in the map.
    pub const NUM_REGS: u32 = 23;

    /// Returns the op count register for a stage index (Fetch=0, Execute=1, Result=2).
    pub const fn op_count_reg(stage_index: usize) -> u32 {
        REG_FETCH_OP_COUNT + stage_index as u32
    }

    /// Returns the run enable register for a stage index.
    pub const fn enable_reg(stage_index: usize) -> u32 {
        REG_FETCH_ENABLE + stage_index as u32
    }
}

/// Declared bit widths of instruction fields.
///
/// A value `v` fits a field of width `w` iff `v < 2^w`. The validator checks
/// every run configuration against these widths before anything is encoded;
/// the encoder relies on that and never truncates.
pub mod limits {
    /// Target stage tag.
    pub const STAGE_BITS: u32 = 2;
    /// Sync channel id carried by token instructions.
    pub const CHANID_BITS: u32 = 2;
    /// Fetch destination id (on-chip buffer endpoint).
    pub const FETCHID_BITS: u32 = 5;
    /// On-chip input buffer address, also used for tile counts.
    pub const INBUFADDR_BITS: u32 = 16;
    /// External memory address.
    pub const DRAMADDR_BITS: u32 = 32;
    /// External memory block size, offset and stride in bytes.
    pub const DRAM_BSIZE_BITS: u32 = 16;
    /// External memory block count.
    pub const DRAM_BCNT_BITS: u32 = 16;
    /// Accumulator shift amount.
    pub const MAXSHIFT_BITS: u32 = 5;
    /// On-chip result buffer address.
    pub const RESADDR_BITS: u32 = 6;

    /// Returns true if `value` is representable in `bits` bits.
    #[inline(always)]
    pub const fn fits(value: u64, bits: u32) -> bool {
        bits >= 64 || value >> bits == 0
    }
}

/// Instruction set of the three pipeline stages.
pub mod isa;

/// Fixed-width wire encoding of instructions.
///
/// Packs an [`isa::Instruction`] into four 32-bit words and unpacks it again.
/// The encoder is purely combinational and trusts that its input has been
/// validated against [`limits`].
pub mod encoding;
