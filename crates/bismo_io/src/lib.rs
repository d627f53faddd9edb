//! File formats of the accelerator toolchain.
//!
//! Hardware configuration files describe an accelerator instance for the
//! emulator, and instruction stream files carry encoded instructions
//! between the generator and the driver.

/// Hardware configuration text files.
///
/// One `name = value` capability per line, the same format the hardware
/// summary prints, with `#` comments and blank lines allowed.
pub mod hwcfg;

/// Instruction stream files: encoded instructions back to back, 16 bytes
/// each, in the same little-endian layout the accelerator fetches.
pub mod loader;
