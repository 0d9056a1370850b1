//! # Tracer
//!
//! Drives a live tracee through selected functions: installs entry
//! breakpoints, polls for hits, steps past the trap, and records a runtime
//! trace of registers, stack windows and call arguments.
//!
//! The step pump is non-blocking and meant to be polled from an outer event
//! loop: each invocation advances the tracee by at most one hit. Once the
//! tracee is observed gone, the pump goes inert.

use std::collections::HashMap;
use std::fs;

use libc::user_regs_struct;
use log::{debug, info, warn};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::breakpoint::Breakpoint;
use crate::elf::{ElfImage, Symbol};
use crate::error::{InspectError, InspectResult};
use crate::ptrace;

/// Number of 32-bit words captured below the frame pointer per step.
pub const STACK_DEPTH: usize = 10;

/// Serialisable register snapshot. The instruction pointer is rebased by the
/// image load base, so it reads as an on-disk address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl From<user_regs_struct> for Registers {
    fn from(r: user_regs_struct) -> Self {
        Self {
            r15: r.r15,
            r14: r.r14,
            r13: r.r13,
            r12: r.r12,
            rbp: r.rbp,
            rbx: r.rbx,
            r11: r.r11,
            r10: r.r10,
            r9: r.r9,
            r8: r.r8,
            rax: r.rax,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            orig_rax: r.orig_rax,
            rip: r.rip,
            cs: r.cs,
            eflags: r.eflags,
            rsp: r.rsp,
            ss: r.ss,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
        }
    }
}

/// Frame-pointer value and the words read at `rbp, rbp-4, rbp-8, ...` for
/// one recorded step. Empty when the frame pointer was zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSnapshot {
    pub frame_pointer: u64,
    pub words: Vec<u32>,
}

/// The first three integer-argument registers at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallArguments {
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
}

/// Observes one tracee. One instance per tracee; instances are independent
/// and may run on separate threads.
pub struct Tracer {
    pid: Pid,
    base_address: u64,
    breakpoints: Vec<Breakpoint>,
    registers: Vec<Registers>,
    stacks: Vec<StackSnapshot>,
    arguments: HashMap<String, CallArguments>,
    dead: bool,
}

impl Tracer {
    /// Attach to a running process. The attach stop is left pending for the
    /// first pump call to observe.
    pub fn attach(pid: i32) -> InspectResult<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)?;
        Self::build(pid)
    }

    /// Adopt a process that is already a tracee of this process (a
    /// `traceme` child, or a previously attached pid).
    pub fn from_traced(pid: i32) -> InspectResult<Self> {
        Self::build(Pid::from_raw(pid))
    }

    fn build(pid: Pid) -> InspectResult<Self> {
        let (base_address, dead) = load_base(pid)?;
        info!("tracing pid {pid}, load base {base_address:#x}");
        Ok(Self {
            pid,
            base_address,
            breakpoints: Vec::new(),
            registers: Vec::new(),
            stacks: Vec::new(),
            arguments: HashMap::new(),
            dead,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Sticky: once the tracee is observed gone, every pump call returns
    /// without action.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn registers(&self) -> &[Registers] {
        &self.registers
    }

    pub fn stacks(&self) -> &[StackSnapshot] {
        &self.stacks
    }

    pub fn arguments(&self) -> &HashMap<String, CallArguments> {
        &self.arguments
    }

    /// Step pump: observe entries into any of `functions`.
    ///
    /// Non-blocking. First armed call installs one breakpoint per function
    /// entry and resumes the tracee; each later call handles at most one
    /// hit: record the call arguments, record one step past the trap,
    /// re-arm, resume.
    pub fn run_functions(&mut self, functions: &[Symbol]) -> InspectResult<()> {
        let status = match self.poll_status()? {
            Some(status) => status,
            None => return Ok(()),
        };

        if self.breakpoints.is_empty() {
            self.arm(functions.iter().map(|function| function.value))?;
            return ptrace::resume(self.pid);
        }

        let hit = match self.hit_breakpoint(status)? {
            Some(index) => index,
            None => return Ok(()),
        };

        let entry_address = self.breakpoints[hit].address();
        self.record_arguments(functions, entry_address)?;
        self.step_past(hit)?;
        ptrace::resume(self.pid)
    }

    /// Step pump variant: observe one function instruction by instruction.
    ///
    /// Breakpoints go on the function entry and every given call site. On a
    /// hit the tracer records a step per instruction for as long as the
    /// instruction pointer stays inside the function's byte range, then
    /// re-arms and resumes.
    pub fn run_function(&mut self, function: &Symbol, call_sites: &[u64]) -> InspectResult<()> {
        let status = match self.poll_status()? {
            Some(status) => status,
            None => return Ok(()),
        };

        if self.breakpoints.is_empty() {
            self.arm(std::iter::once(function.value).chain(call_sites.iter().copied()))?;
            return ptrace::resume(self.pid);
        }

        let hit = match self.hit_breakpoint(status)? {
            Some(index) => index,
            None => return Ok(()),
        };

        let mut registers = ptrace::read_registers(self.pid)?;
        registers.rip -= 1;
        ptrace::write_registers(self.pid, registers)?;
        self.breakpoints[hit].clear()?;

        while registers.rip >= function.value
            && registers.rip <= function.value + function.size
        {
            self.record_step()?;
            registers = ptrace::read_registers(self.pid)?;
        }

        self.breakpoints[hit].install()?;
        ptrace::resume(self.pid)
    }

    /// Clear all breakpoints and release the tracee.
    pub fn detach(mut self) -> InspectResult<()> {
        self.breakpoints.clear();
        ptrace::detach(self.pid)
    }

    /// Non-blocking wait. `None` means there is nothing to act on: the
    /// tracer is inert, the tracee is running, or it is gone.
    fn poll_status(&mut self) -> InspectResult<Option<WaitStatus>> {
        if self.dead {
            return Ok(None);
        }

        let status = waitpid(
            self.pid,
            Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED),
        )
        .map_err(|source| InspectError::TraceSyscall {
            call: "waitpid",
            source,
        })?;

        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                warn!("tracee {} is gone: {status:?}", self.pid);
                self.dead = true;
                Ok(None)
            }
            WaitStatus::Stopped(..) => Ok(Some(status)),
            _ => Ok(None),
        }
    }

    fn arm(&mut self, addresses: impl Iterator<Item = u64>) -> InspectResult<()> {
        for address in addresses {
            // one breakpoint per address: a second install would capture the
            // patched word as the original
            if self.breakpoints.iter().any(|b| b.address() == address) {
                continue;
            }
            self.breakpoints.push(Breakpoint::new(address, self.pid)?);
        }
        debug!("{} breakpoints armed for pid {}", self.breakpoints.len(), self.pid);
        Ok(())
    }

    fn hit_breakpoint(&self, status: WaitStatus) -> InspectResult<Option<usize>> {
        for (index, breakpoint) in self.breakpoints.iter().enumerate() {
            if breakpoint.is_hit(status)? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Snapshot `rdi`/`rsi`/`rdx` under the function whose entry address the
    /// hit breakpoint sits at. A later hit of the same function overwrites.
    fn record_arguments(
        &mut self,
        functions: &[Symbol],
        entry_address: u64,
    ) -> InspectResult<()> {
        let function = functions
            .iter()
            .find(|function| function.value == entry_address)
            .ok_or(InspectError::UnknownBreakpoint(entry_address))?;

        let registers = ptrace::read_registers(self.pid)?;
        debug!(
            "{} entered: rdi={:#x} rsi={:#x} rdx={:#x}",
            function.name, registers.rdi, registers.rsi, registers.rdx
        );
        self.arguments.insert(
            function.name.clone(),
            CallArguments {
                rdi: registers.rdi,
                rsi: registers.rsi,
                rdx: registers.rdx,
            },
        );
        Ok(())
    }

    /// Re-point the instruction pointer at the original byte, lift the trap,
    /// record one step over it, and put the trap back.
    fn step_past(&mut self, hit: usize) -> InspectResult<()> {
        let mut registers = ptrace::read_registers(self.pid)?;
        registers.rip -= 1;
        ptrace::write_registers(self.pid, registers)?;
        self.breakpoints[hit].clear()?;
        self.record_step()?;
        self.breakpoints[hit].install()
    }

    /// Record one step: register snapshot (instruction pointer rebased),
    /// stack window below the frame pointer, then a single-step and a
    /// blocking wait for the stop.
    fn record_step(&mut self) -> InspectResult<()> {
        let raw = ptrace::read_registers(self.pid)?;
        let mut snapshot = Registers::from(raw);
        snapshot.rip = snapshot.rip.wrapping_sub(self.base_address);
        self.registers.push(snapshot);

        let frame_pointer = raw.rbp;
        let mut words = Vec::with_capacity(STACK_DEPTH);
        if frame_pointer != 0 {
            for slot in 0..STACK_DEPTH as u64 {
                let word = ptrace::read_word(self.pid, frame_pointer - slot * 4)?;
                words.push(word as u32);
            }
        }
        self.stacks.push(StackSnapshot {
            frame_pointer,
            words,
        });

        ptrace::single_step(self.pid)?;
        let status = waitpid(self.pid, None).map_err(|source| InspectError::TraceSyscall {
            call: "waitpid",
            source,
        })?;
        if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
            self.dead = true;
            return Err(InspectError::TraceeDied(self.pid.as_raw()));
        }
        Ok(())
    }
}

/// Runtime load base of the tracee's image: zero for fixed-load images,
/// otherwise the start of the first mapped region. An unreadable or empty
/// maps file marks the tracer dead.
fn load_base(pid: Pid) -> InspectResult<(u64, bool)> {
    let image = ElfImage::open(format!("/proc/{pid}/exe"))?;
    if !image.is_position_independent() {
        return Ok((0, false));
    }

    let maps = match fs::read_to_string(format!("/proc/{pid}/maps")) {
        Ok(content) => content,
        Err(_) => return Ok((0, true)),
    };
    match maps.lines().next().and_then(parse_maps_line) {
        Some(base) => Ok((base, false)),
        None => Ok((0, true)),
    }
}

/// First hex field of a maps line: the region's starting virtual address.
fn parse_maps_line(line: &str) -> Option<u64> {
    let pattern = Regex::new(r"^([0-9a-f]+)-").ok()?;
    let captures = pattern.captures(line)?;
    u64::from_str_radix(&captures[1], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{kill_child, spawn_traced_child, traced_target, wait_for_stop};
    use std::thread::sleep;
    use std::time::Duration;

    fn observed_symbol(size: u64) -> Symbol {
        use crate::elf::{SymbolBinding, SymbolKind};
        Symbol {
            name: "traced_target".to_string(),
            kind: SymbolKind::Function,
            binding: SymbolBinding::Global,
            section_index: 0,
            value: traced_target as usize as u64,
            size,
        }
    }

    fn pump<F: FnMut(&mut Tracer) -> InspectResult<()>>(
        tracer: &mut Tracer,
        mut advance: F,
        mut done: impl FnMut(&Tracer) -> bool,
    ) {
        for _ in 0..5000 {
            advance(tracer).unwrap();
            if done(tracer) || tracer.is_dead() {
                return;
            }
            sleep(Duration::from_millis(1));
        }
        panic!("tracee never reached the observed state");
    }

    #[test]
    fn test_parse_maps_line() {
        assert_eq!(
            parse_maps_line("5555d4e0a000-5555d4e32000 r--p 00000000 08:02 131 /usr/bin/ls"),
            Some(0x5555d4e0a000)
        );
        assert_eq!(parse_maps_line(""), None);
        assert_eq!(parse_maps_line("not a mapping"), None);
    }

    #[test]
    fn test_base_address_matches_first_mapping() {
        let pid = spawn_traced_child();
        let tracer = Tracer::from_traced(pid.as_raw()).unwrap();

        let maps = fs::read_to_string(format!("/proc/{pid}/maps")).unwrap();
        let first = maps.lines().next().and_then(parse_maps_line).unwrap();
        let image = ElfImage::open(format!("/proc/{pid}/exe")).unwrap();
        if image.is_position_independent() {
            assert_eq!(tracer.base_address(), first);
        } else {
            assert_eq!(tracer.base_address(), 0);
        }
        assert!(!tracer.is_dead());

        kill_child(pid);
    }

    #[test]
    fn test_run_functions_captures_arguments() {
        let pid = spawn_traced_child();
        let mut tracer = Tracer::from_traced(pid.as_raw()).unwrap();
        let functions = vec![observed_symbol(24)];

        pump(
            &mut tracer,
            |t| t.run_functions(&functions),
            |t| !t.arguments().is_empty(),
        );

        let recorded = tracer.arguments().get("traced_target").unwrap();
        assert_eq!(
            *recorded,
            CallArguments {
                rdi: 11,
                rsi: 22,
                rdx: 33
            }
        );
        assert!(!tracer.registers().is_empty());
        assert_eq!(tracer.registers().len(), tracer.stacks().len());

        kill_child(pid);
    }

    #[test]
    fn test_run_function_records_in_range_steps() {
        let pid = spawn_traced_child();
        let mut tracer = Tracer::from_traced(pid.as_raw()).unwrap();
        let function = observed_symbol(24);

        pump(
            &mut tracer,
            |t| t.run_function(&function, &[]),
            |t| !t.registers().is_empty(),
        );

        assert_eq!(tracer.registers().len(), tracer.stacks().len());
        let base = tracer.base_address();
        for step in tracer.registers() {
            let runtime_rip = step.rip.wrapping_add(base);
            assert!(
                runtime_rip >= function.value && runtime_rip <= function.value + function.size,
                "step at {runtime_rip:#x} outside the observed function"
            );
        }

        kill_child(pid);
    }

    #[test]
    fn test_dead_flag_is_sticky() {
        let pid = spawn_traced_child();
        let mut tracer = Tracer::from_traced(pid.as_raw()).unwrap();
        // consume the initial stop, then kill without reaping: the pump's
        // own wait must observe the death
        wait_for_stop(pid);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();

        let functions = vec![observed_symbol(24)];
        for _ in 0..10 {
            tracer.run_functions(&functions).unwrap();
            if tracer.is_dead() {
                break;
            }
            sleep(Duration::from_millis(1));
        }
        assert!(tracer.is_dead());

        // inert from here on: no arming, no recording
        tracer.run_functions(&functions).unwrap();
        assert!(tracer.registers().is_empty());
        assert!(tracer.arguments().is_empty());
    }
}
