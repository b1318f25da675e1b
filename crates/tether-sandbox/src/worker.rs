//! Handle to a running worker process.
//!
//! A [`Worker`] uniquely owns one sandboxee: its pid, a pidfd for
//! signalling and exit detection, the comms endpoint (until the RPC layer
//! takes it), and a lazily started watchdog thread that enforces the wall
//! clock by delivering SIGKILL through the pidfd.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustix::process::{Pid, PidfdFlags, Signal, pidfd_open, pidfd_send_signal};

use crate::comms::Comms;
use crate::error::SandboxError;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal (SIGSYS means the policy fired).
    Signaled(i32),
    /// Killed by the watchdog after overrunning the wall clock.
    TimedOut,
}

/// Final result of an awaited worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationResult {
    pub status: TermStatus,
}

impl TerminationResult {
    pub fn is_clean(&self) -> bool {
        matches!(self.status, TermStatus::Exited(0))
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self.status, TermStatus::Signaled(sig) if sig == libc::SIGSYS)
    }
}

impl std::fmt::Display for TerminationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            TermStatus::Exited(code) => write!(f, "exited with code {code}"),
            TermStatus::Signaled(sig) if sig == libc::SIGSYS => {
                write!(f, "killed by policy (SIGSYS)")
            }
            TermStatus::Signaled(sig) => write!(f, "killed by signal {sig}"),
            TermStatus::TimedOut => write!(f, "killed by wall-time limit"),
        }
    }
}

#[derive(Debug)]
pub struct Worker {
    pid: libc::pid_t,
    pidfd: OwnedFd,
    comms: Option<Comms>,
    watchdog: Watchdog,
    result: Option<TerminationResult>,
}

impl Worker {
    /// Take ownership of an already-forked worker. The process must be a
    /// direct child of the calling process for exit collection to work
    /// (the fork server guarantees this by cloning with `CLONE_PARENT`).
    pub fn adopt(pid: libc::pid_t, comms: Comms) -> Result<Worker, SandboxError> {
        // SAFETY: pid comes from a successful fork/spawn and is positive.
        let rpid = unsafe { Pid::from_raw_unchecked(pid) };
        let pidfd = pidfd_open(rpid, PidfdFlags::empty()).map_err(SandboxError::Pidfd)?;
        Ok(Worker {
            pid,
            pidfd,
            comms: Some(comms),
            watchdog: Watchdog::new(),
            result: None,
        })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Hand the comms endpoint to the RPC layer. Returns `None` if it was
    /// already taken.
    pub fn take_comms(&mut self) -> Option<Comms> {
        self.comms.take()
    }

    /// Deliver SIGKILL. Harmless if the worker already exited.
    pub fn kill(&self) {
        if let Err(err) = pidfd_send_signal(&self.pidfd, Signal::KILL) {
            tracing::debug!(pid = self.pid, %err, "kill after exit");
        }
    }

    /// True once the process has exited (whether or not it was awaited).
    pub fn is_terminated(&self) -> bool {
        if self.result.is_some() {
            return true;
        }
        // A pidfd polls readable when the process exits.
        let mut pfd = libc::pollfd {
            fd: self.pidfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        ret > 0 && pfd.revents & libc::POLLIN != 0
    }

    /// Arm (or clear) the wall-clock watchdog. When the deadline passes
    /// the worker is killed and the final result reads `TimedOut`.
    pub fn set_wall_time_limit(&mut self, limit: Option<Duration>) -> io::Result<()> {
        self.watchdog.arm(&self.pidfd, limit)
    }

    /// Block until the worker exits and classify the result. Idempotent:
    /// later calls return the cached result.
    pub fn await_result(&mut self) -> io::Result<TerminationResult> {
        if let Some(result) = self.result {
            return Ok(result);
        }

        let (exit_code, signal) = wait_for_exit(self.pidfd.as_raw_fd())?;
        self.watchdog.disarm();

        let status = match (exit_code, signal) {
            (Some(code), _) => TermStatus::Exited(code),
            (None, Some(sig)) if sig == libc::SIGKILL && self.watchdog.fired() => {
                TermStatus::TimedOut
            }
            (None, Some(sig)) => TermStatus::Signaled(sig),
            (None, None) => TermStatus::Signaled(0),
        };

        let result = TerminationResult { status };
        self.result = Some(result);
        Ok(result)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.result.is_none() {
            self.kill();
            if let Err(err) = self.await_result() {
                tracing::warn!(pid = self.pid, %err, "failed to reap worker");
            }
        }
    }
}

pub(crate) fn wait_for_exit(pidfd: libc::c_int) -> io::Result<(Option<i32>, Option<i32>)> {
    let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::waitid(
            libc::P_PIDFD,
            pidfd as libc::id_t,
            &mut siginfo,
            libc::WEXITED,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let code = siginfo.si_code;
    let status = unsafe { siginfo.si_status() };

    match code {
        libc::CLD_EXITED => Ok((Some(status), None)),
        libc::CLD_KILLED | libc::CLD_DUMPED => Ok((None, Some(status))),
        _ => Ok((None, None)),
    }
}

#[derive(Debug, Default)]
struct WatchdogState {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct WatchdogShared {
    state: Mutex<WatchdogState>,
    cond: Condvar,
    fired: AtomicBool,
}

/// One lazily started thread per worker; sleeps until the deadline or a
/// state change, then kills through its own pidfd clone.
#[derive(Debug)]
struct Watchdog {
    shared: Arc<WatchdogShared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn new() -> Self {
        Self {
            shared: Arc::new(WatchdogShared::default()),
            thread: None,
        }
    }

    fn arm(&mut self, pidfd: &OwnedFd, limit: Option<Duration>) -> io::Result<()> {
        if self.thread.is_none() && limit.is_some() {
            let pidfd = pidfd.try_clone()?;
            let shared = Arc::clone(&self.shared);
            self.thread = Some(std::thread::spawn(move || watchdog_main(&pidfd, &shared)));
        }

        let mut state = lock(&self.shared.state);
        state.deadline = limit.map(|d| Instant::now() + d);
        drop(state);
        self.shared.cond.notify_one();
        Ok(())
    }

    fn disarm(&self) {
        let mut state = lock(&self.shared.state);
        state.deadline = None;
        drop(state);
        self.shared.cond.notify_one();
    }

    fn fired(&self) -> bool {
        self.shared.fired.load(Ordering::Relaxed)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
        }
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn lock(mutex: &Mutex<WatchdogState>) -> MutexGuard<'_, WatchdogState> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn watchdog_main(pidfd: &OwnedFd, shared: &WatchdogShared) {
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    state.deadline = None;
                    shared.fired.store(true, Ordering::Relaxed);
                    drop(state);
                    if let Err(err) = pidfd_send_signal(pidfd, Signal::KILL) {
                        tracing::debug!(%err, "watchdog kill after exit");
                    }
                    state = lock(&shared.state);
                } else {
                    let (guard, _) = shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }
    }
}
