//! # elfscope
//!
//! Interactive live-binary inspector for 64-bit Linux executables:
//! - ELF image parsing (sections, symbols, embedded strings, functions)
//! - Annotated disassembly with cross-references resolved to names and
//!   string literals
//! - Ptrace-driven observation of selected functions in a running process,
//!   recording registers, stack windows and call arguments
//!
//! ## Architecture
//!
//! ```text
//! +------------------+
//! |   ELF reader     |  image -> sections, symbols, strings, functions
//! +------------------+
//!          |
//! +------------------+
//! |   Disassembler   |  bytes -> annotated instruction lines
//! +------------------+
//!          |
//! +------------------+
//! |   Tracer         |  breakpoints, single-stepping, runtime trace
//! +------------------+
//! ```
//!
//! The reader and disassembler are purely synchronous; the tracer drives one
//! tracee per instance through the ptrace primitives in [`ptrace`]. Process
//! discovery lives in [`process`].
//!
//! ## Security Note
//!
//! Tracing rewrites tracee memory. Only observe processes you own or have
//! permission to debug.

pub mod breakpoint;
pub mod disasm;
pub mod elf;
pub mod error;
pub mod process;
pub mod ptrace;
pub mod tracer;

#[cfg(test)]
mod testutil;

pub use breakpoint::{Breakpoint, TRAP_OPCODE};
pub use disasm::{call_sites, Disassembler, InstructionLine};
pub use elf::{
    ElfImage, EmbeddedString, Function, ImageHeader, PltRelocation, Section, SectionKind, Symbol,
    SymbolBinding, SymbolKind,
};
pub use error::{InspectError, InspectResult};
pub use tracer::{CallArguments, Registers, StackSnapshot, Tracer, STACK_DEPTH};
