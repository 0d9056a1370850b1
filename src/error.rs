//! # Error Types
//!
//! One variant per failure the core can surface. The image reader and
//! disassembler propagate these to the caller; the tracer distinguishes
//! fatal errors from the observable end of a run (see `tracer`).

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the inspector core.
#[derive(Error, Debug)]
pub enum InspectError {
    /// The on-disk image could not be opened or read
    #[error("failed to open image {}", path.display())]
    ImageOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The image is not a well-formed ELF object
    #[error("invalid image: {0}")]
    ImageParse(#[from] goblin::error::Error),

    /// A section was looked up by name and is not in the table
    #[error("missing section: {0}")]
    MissingSection(String),

    /// A symbol was looked up by name and is not in the static table
    #[error("missing symbol: {0}")]
    MissingSymbol(String),

    /// A section index referenced past the end of the section table
    #[error("section index {index} out of bounds (table has {count} entries)")]
    SectionIndexOutOfBounds { index: usize, count: usize },

    /// An underlying tracing syscall failed
    #[error("{call} failed on tracee")]
    TraceSyscall {
        call: &'static str,
        #[source]
        source: nix::Error,
    },

    /// The tracee exited or was signalled while being single-stepped
    #[error("tracee {0} died mid-step")]
    TraceeDied(i32),

    /// A breakpoint fired at an address no observed function starts at
    #[error("no observed function at breakpoint address {0:#x}")]
    UnknownBreakpoint(u64),

    /// The disassembly engine could not be initialised
    #[error("disassembler open failed: {0}")]
    DisassemblerOpen(String),

    /// The disassembly engine rejected the byte buffer
    #[error("disassembler parse failed: {0}")]
    DisassemblerParse(String),

    /// No running process matched the requested name
    #[error("no process named {0}")]
    ProcessNotFound(String),

    /// IO error outside the image-open path
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type InspectResult<T> = Result<T, InspectError>;
