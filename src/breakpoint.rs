//! # Software Breakpoint
//!
//! One installed trap in a tracee. The original instruction word is captured
//! before patching and restored verbatim on clear; dropping the value clears
//! it best-effort so a dead tracee cannot poison teardown.

use log::debug;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::error::InspectResult;
use crate::ptrace;

/// The one-byte trap opcode. After the CPU executes it, the instruction
/// pointer sits one byte past the patched address.
pub const TRAP_OPCODE: u64 = 0xCC;

/// An installed breakpoint. Not `Clone`: exactly one owner may restore the
/// saved word.
#[derive(Debug)]
pub struct Breakpoint {
    address: u64,
    pid: Pid,
    original_code: u64,
}

impl Breakpoint {
    /// Capture the word at `address` and install the trap.
    pub fn new(address: u64, pid: Pid) -> InspectResult<Self> {
        let original_code = ptrace::read_word(pid, address)?;
        let breakpoint = Self {
            address,
            pid,
            original_code,
        };
        breakpoint.install()?;
        debug!("breakpoint installed at {address:#x} (pid {pid})");
        Ok(breakpoint)
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Rewrite the low byte of the target word to the trap opcode, keeping
    /// the remaining seven bytes intact.
    pub fn install(&self) -> InspectResult<()> {
        let patched = (self.original_code & !0xff) | TRAP_OPCODE;
        ptrace::write_word(self.pid, self.address, patched)
    }

    /// Restore the original word.
    pub fn clear(&self) -> InspectResult<()> {
        ptrace::write_word(self.pid, self.address, self.original_code)
    }

    /// True while the word in the tracee differs from the saved original.
    pub fn is_installed(&self) -> InspectResult<bool> {
        Ok(ptrace::read_word(self.pid, self.address)? != self.original_code)
    }

    /// True iff the tracee is stopped with its instruction pointer one byte
    /// past this breakpoint's address.
    pub fn is_hit(&self, status: WaitStatus) -> InspectResult<bool> {
        if !matches!(status, WaitStatus::Stopped(_, _)) {
            return Ok(false);
        }
        let registers = ptrace::read_registers(self.pid)?;
        Ok(registers.rip == self.address + 1)
    }
}

impl Drop for Breakpoint {
    fn drop(&mut self) {
        // best effort; the tracee may already be gone
        let _ = self.clear();
    }
}
