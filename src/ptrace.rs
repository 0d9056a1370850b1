//! # Low-Level Tracing Primitives
//!
//! Thin typed wrappers over the ptrace calls the tracer drives a tracee
//! with. All operations are blocking and synchronous; each maps its errno
//! onto [`InspectError::TraceSyscall`] with the failing request named.

use libc::{c_void, user_regs_struct};
use nix::sys::ptrace as pt;
use nix::unistd::Pid;

use crate::error::{InspectError, InspectResult};

fn syscall_error(call: &'static str) -> impl Fn(nix::Error) -> InspectError {
    move |source| InspectError::TraceSyscall { call, source }
}

/// Full register snapshot of a stopped tracee.
pub fn read_registers(pid: Pid) -> InspectResult<user_regs_struct> {
    pt::getregs(pid).map_err(syscall_error("PTRACE_GETREGS"))
}

pub fn write_registers(pid: Pid, registers: user_regs_struct) -> InspectResult<()> {
    pt::setregs(pid, registers).map_err(syscall_error("PTRACE_SETREGS"))
}

/// One 64-bit word of tracee memory.
pub fn read_word(pid: Pid, address: u64) -> InspectResult<u64> {
    pt::read(pid, address as pt::AddressType)
        .map(|word| word as u64)
        .map_err(syscall_error("PTRACE_PEEKTEXT"))
}

pub fn write_word(pid: Pid, address: u64, word: u64) -> InspectResult<()> {
    // SAFETY: writes to a tracee we are attached to, at an address the
    // caller obtained from the tracee's own image or registers.
    unsafe { pt::write(pid, address as pt::AddressType, word as *mut c_void) }
        .map_err(syscall_error("PTRACE_POKETEXT"))
}

/// Execute one instruction, leaving the tracee stopped again.
pub fn single_step(pid: Pid) -> InspectResult<()> {
    pt::step(pid, None).map_err(syscall_error("PTRACE_SINGLESTEP"))
}

/// Resume normal execution.
pub fn resume(pid: Pid) -> InspectResult<()> {
    pt::cont(pid, None).map_err(syscall_error("PTRACE_CONT"))
}

/// Become the tracer of a running process. The resulting stop is left for
/// the caller to observe.
pub fn attach(pid: Pid) -> InspectResult<()> {
    pt::attach(pid).map_err(syscall_error("PTRACE_ATTACH"))
}

/// Release the tracee and let it run free.
pub fn detach(pid: Pid) -> InspectResult<()> {
    pt::detach(pid, None).map_err(syscall_error("PTRACE_DETACH"))
}
