//! Helpers for tracee-backed tests: fork a child that volunteers for
//! tracing, stops itself, then runs a known function.

use nix::sys::ptrace::traceme;
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Function observed by tracee tests. Never inlined so its entry address is
/// a stable breakpoint target in both parent and forked child.
#[no_mangle]
#[inline(never)]
pub extern "C" fn traced_target(a: u64, b: u64, c: u64) -> u64 {
    let mut total = a.wrapping_add(b).wrapping_add(c);
    for i in 0..4u64 {
        total = std::hint::black_box(total.wrapping_add(i));
    }
    total
}

/// Fork a child that enters `traceme`, raises `SIGSTOP`, calls
/// `traced_target(11, 22, 33)` and exits cleanly.
pub fn spawn_traced_child() -> Pid {
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            traceme().expect("traceme");
            raise(Signal::SIGSTOP).expect("raise");
            std::hint::black_box(traced_target(11, 22, 33));
            unsafe { libc::_exit(0) }
        }
        ForkResult::Parent { child } => child,
    }
}

/// Block until the child reports a stop.
pub fn wait_for_stop(pid: Pid) -> WaitStatus {
    waitpid(pid, Some(WaitPidFlag::WUNTRACED)).expect("waitpid")
}

/// Tear the child down and reap it. Pending stop notifications are drained
/// until the termination itself is observed.
pub fn kill_child(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    for _ in 0..8 {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}
