//! revflow-core
//!
//! The analysis core of a reverse-engineering workbench: code-flow
//! disassembly, ARM emulation and control-flow-graph layout over a shared
//! memory-image model.
//!
//! # Components
//! - [`memory`] - byte-addressable image with permissioned maps
//! - [`loader`] - ELF segment loading into a memory image
//! - [`opcode`] - decoded instruction model and the ARM decoder
//! - [`registers`] - banked register file with meta-register fields
//! - [`codeflow`] - worklist-driven cross-branch code discovery
//! - [`emu`] - ARM interpreter with coprocessor dispatch
//! - [`graph`] - hierarchical code-block graph
//! - [`layout`] - row/column grid layout and polyline edge routing
//!
//! Display rendering, user input, persistence and transport are the
//! surrounding application's concern; everything here is synchronous and
//! single-threaded per instance.

pub mod codeflow;
pub mod emu;
pub mod error;
pub mod graph;
pub mod layout;
pub mod loader;
pub mod memory;
pub mod opcode;
pub mod registers;

pub use error::{Result, RevflowError};

// Commonly used types
pub use codeflow::{CodeFlowContext, CodeFlowSink, FlowMemory, FunctionMeta};
pub use emu::ArmEmulator;
pub use graph::HierGraph;
pub use layout::reflow::ReflowLayout;
pub use memory::{Endian, MemoryImage, MemoryMap, Perm};
pub use opcode::{Arch, Opcode, Operand};
pub use registers::RegisterContext;
