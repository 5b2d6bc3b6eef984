//! Error Handling
//!
//! This module provides the error types for the workbench core using `thiserror`.
//!
//! # Error Categories
//! - **Decode errors**: bytes that cannot be parsed as an instruction
//! - **Memory errors**: unmapped or permission-violating accesses
//! - **Emulation errors**: unsupported instructions, undefined flags, mode violations
//! - **Flow errors**: code-flow configuration mistakes

use thiserror::Error;

/// Workbench error types.
///
/// Decode failures and unmapped memory are recoverable: the code-flow
/// analyzer logs them and continues past the offending address or branch.
/// The remaining variants are invariant violations and surface to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevflowError {
    /// Bytes at a virtual address cannot be decoded as an instruction.
    #[error("invalid instruction at 0x{va:08X} (word 0x{word:08X})")]
    InvalidInstruction { va: u64, word: u32 },

    /// The emulator has no handler for a decoded mnemonic.
    #[error("unsupported instruction {mnem} at 0x{va:08X}")]
    UnsupportedInstruction { va: u64, mnem: &'static str },

    /// A condition-flag read was attempted while the CPSR is undefined.
    #[error("flag read from undefined CPSR")]
    UndefinedFlag,

    /// A register whose value is required for control flow is undefined.
    #[error("register {0} holds an undefined value")]
    UndefinedRegister(u32),

    /// Flag-setting write to r15 while the processor is in user or system
    /// mode; those modes have no SPSR to restore.
    #[error("exception return at 0x{va:08X} in user/system mode")]
    ExceptionReturn { va: u64 },

    /// Coprocessor index out of the sixteen-slot range.
    #[error("invalid coprocessor index: {0} (must be 0-15)")]
    InvalidCoprocessor(u8),

    /// Memory access outside any mapped region.
    #[error("unmapped memory access: 0x{va:08X} ({size} bytes)")]
    UnmappedMemory { va: u64, size: usize },

    /// Memory access denied by the map's permission bits.
    #[error("access violation at 0x{va:08X}")]
    AccessViolation { va: u64 },

    /// An instruction carried an operand the handler cannot use.
    #[error("bad operand {oper} for instruction at 0x{va:08X}")]
    BadOperand { va: u64, oper: usize },

    /// A new memory map overlaps an existing one.
    #[error("memory map at 0x{base:08X} overlaps an existing map")]
    MapOverlap { base: u64 },

    /// A dynamic-branch resolver was registered twice under one name.
    #[error("dynamic branch handler already registered: {0}")]
    DuplicateHandler(&'static str),

    /// Executable image could not be parsed into a memory image.
    #[error("image parse error: {0}")]
    ImageParse(String),
}

pub type Result<T> = std::result::Result<T, RevflowError>;
