use crate::platform::Platform;
use crate::{AccelError, Result};
use bismo_common::mmio;
use std::fmt;
use tracing::info;

/// Capability registers in summary order, with the names the hardware
/// summary and config files use for them.
pub const HW_REGISTERS: [(&str, u32); 10] = [
    ("accWidth", mmio::REG_HW_ACC_WIDTH),
    ("cmdQueueEntries", mmio::REG_HW_CMD_QUEUE_ENTRIES),
    ("dpaDimCommon", mmio::REG_HW_DPA_DIM_COMMON),
    ("dpaDimLHS", mmio::REG_HW_DPA_DIM_LHS),
    ("dpaDimRHS", mmio::REG_HW_DPA_DIM_RHS),
    ("lhsEntriesPerMem", mmio::REG_HW_LHS_ENTRIES_PER_MEM),
    ("maxShiftSteps", mmio::REG_HW_MAX_SHIFT_STEPS),
    ("readChanWidth", mmio::REG_HW_READ_CHAN_WIDTH),
    ("rhsEntriesPerMem", mmio::REG_HW_RHS_ENTRIES_PER_MEM),
    ("writeChanWidth", mmio::REG_HW_WRITE_CHAN_WIDTH),
];

/// Dimensions of one accelerator instance.
///
/// Read once when the driver is constructed and never modified afterwards.
/// Widths are in bits, entry counts in words of the on-chip memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub acc_width: u64,
    pub cmd_queue_entries: u64,
    pub dpa_dim_common: u64,
    pub dpa_dim_lhs: u64,
    pub dpa_dim_rhs: u64,
    pub lhs_entries_per_mem: u64,
    pub max_shift_steps: u64,
    pub read_chan_width: u64,
    pub rhs_entries_per_mem: u64,
    pub write_chan_width: u64,
}

impl CapabilityDescriptor {
    /// Reads every `HW_*` register of the platform.
    ///
    /// The read itself has no side effects. A descriptor that would make
    /// validation meaningless (zero sizes, a read channel that does not
    /// divide the common dimension) is rejected here so nothing downstream
    /// has to re-check it.
    pub fn discover<P: Platform + ?Sized>(platform: &mut P) -> Result<Self> {
        let mut caps = Self::zeroed();
        for (name, reg) in HW_REGISTERS {
            let value = platform.read_reg(reg)? as u64;
            if let Some(field) = caps.field_mut(name) {
                *field = value;
            }
        }
        caps.check()?;
        info!(
            platform = platform.platform_id(),
            dpa = %format_args!("{}x{}x{}", caps.dpa_dim_lhs, caps.dpa_dim_common, caps.dpa_dim_rhs),
            queue = caps.cmd_queue_entries,
            "discovered accelerator capabilities"
        );
        Ok(caps)
    }

    /// The configuration the software emulator instantiates by default.
    pub const fn default_emulated() -> Self {
        Self {
            acc_width: 32,
            cmd_queue_entries: 16,
            dpa_dim_common: 64,
            dpa_dim_lhs: 2,
            dpa_dim_rhs: 2,
            lhs_entries_per_mem: 1024,
            max_shift_steps: 16,
            read_chan_width: 64,
            rhs_entries_per_mem: 1024,
            write_chan_width: 64,
        }
    }

    pub const fn zeroed() -> Self {
        Self {
            acc_width: 0,
            cmd_queue_entries: 0,
            dpa_dim_common: 0,
            dpa_dim_lhs: 0,
            dpa_dim_rhs: 0,
            lhs_entries_per_mem: 0,
            max_shift_steps: 0,
            read_chan_width: 0,
            rhs_entries_per_mem: 0,
            write_chan_width: 0,
        }
    }

    /// Rejects zero sizes, values a 32-bit capability register cannot
    /// hold, and a read channel that does not divide the common dimension.
    pub fn check(&self) -> Result<()> {
        if let Some((name, _)) = self.fields().iter().find(|(_, v)| *v == 0) {
            return Err(AccelError::InvalidCapabilities {
                reason: format!("{} is zero", name),
            });
        }
        if let Some((name, v)) = self.fields().iter().find(|(_, v)| u32::try_from(*v).is_err()) {
            return Err(AccelError::InvalidCapabilities {
                reason: format!("{} = {} does not fit a 32-bit register", name, v),
            });
        }
        if self.dpa_dim_common % self.read_chan_width != 0 {
            return Err(AccelError::InvalidCapabilities {
                reason: format!(
                    "dpaDimCommon {} is not a multiple of readChanWidth {}",
                    self.dpa_dim_common, self.read_chan_width
                ),
            });
        }
        Ok(())
    }

    /// All fields paired with their register names.
    pub fn fields(&self) -> [(&'static str, u64); 10] {
        [
            ("accWidth", self.acc_width),
            ("cmdQueueEntries", self.cmd_queue_entries),
            ("dpaDimCommon", self.dpa_dim_common),
            ("dpaDimLHS", self.dpa_dim_lhs),
            ("dpaDimRHS", self.dpa_dim_rhs),
            ("lhsEntriesPerMem", self.lhs_entries_per_mem),
            ("maxShiftSteps", self.max_shift_steps),
            ("readChanWidth", self.read_chan_width),
            ("rhsEntriesPerMem", self.rhs_entries_per_mem),
            ("writeChanWidth", self.write_chan_width),
        ]
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut u64> {
        let field = match name {
            "accWidth" => &mut self.acc_width,
            "cmdQueueEntries" => &mut self.cmd_queue_entries,
            "dpaDimCommon" => &mut self.dpa_dim_common,
            "dpaDimLHS" => &mut self.dpa_dim_lhs,
            "dpaDimRHS" => &mut self.dpa_dim_rhs,
            "lhsEntriesPerMem" => &mut self.lhs_entries_per_mem,
            "maxShiftSteps" => &mut self.max_shift_steps,
            "readChanWidth" => &mut self.read_chan_width,
            "rhsEntriesPerMem" => &mut self.rhs_entries_per_mem,
            "writeChanWidth" => &mut self.write_chan_width,
            _ => return None,
        };
        Some(field)
    }

    /// Value of the capability register `reg`, if it is one.
    pub fn register_value(&self, reg: u32) -> Option<u64> {
        let name = HW_REGISTERS.iter().find(|(_, r)| *r == reg)?.0;
        self.fields()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Number of addressable Fetch destinations: the instruction queue, one
    /// buffer per LHS row and one per RHS row.
    pub fn num_fetch_nodes(&self) -> u64 {
        self.dpa_dim_lhs.saturating_add(self.dpa_dim_rhs).saturating_add(1)
    }

    pub fn first_lhs_id(&self) -> u64 {
        1
    }

    pub fn first_rhs_id(&self) -> u64 {
        self.dpa_dim_lhs.saturating_add(1)
    }

    /// How many read-channel words make up one on-chip buffer entry.
    pub fn exec_to_fetch_width_ratio(&self) -> u64 {
        self.dpa_dim_common / self.read_chan_width
    }

    /// Total LHS on-chip buffer size in bytes, saturating at `u64::MAX`.
    pub fn lhs_total_bram_bytes(&self) -> u64 {
        total_bram_bytes(self.dpa_dim_lhs, self.lhs_entries_per_mem, self.dpa_dim_common)
    }

    /// Total RHS on-chip buffer size in bytes, saturating at `u64::MAX`.
    pub fn rhs_total_bram_bytes(&self) -> u64 {
        total_bram_bytes(self.dpa_dim_rhs, self.rhs_entries_per_mem, self.dpa_dim_common)
    }
}

fn total_bram_bytes(rows: u64, entries: u64, width_bits: u64) -> u64 {
    rows.saturating_mul(entries).saturating_mul(width_bits) / 8
}

impl Default for CapabilityDescriptor {
    fn default() -> Self {
        Self::default_emulated()
    }
}

impl fmt::Display for CapabilityDescriptor {
    /// One `name = value` line per capability, the format config files use.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.fields() {
            writeln!(f, "{} = {}", name, value)?;
        }
        Ok(())
    }
}
