//! Fork-server startup and the spawn protocol.
//!
//! The supervisor launches the worker binary once, in fork-server mode:
//! a long-lived process that pre-initializes the target library and
//! `fork`s a fresh worker for every spawn request. Spawn requests travel
//! over a dedicated comms channel as MessagePack frames; each reply
//! carries the new worker's pid and its comms endpoint as ancillary data.
//!
//! The fork server clones workers with `CLONE_PARENT`, so every worker is
//! a direct child of the supervisor and can be awaited through a pidfd.
//! The fork server itself needs no management: it exits when the spawn
//! channel closes.

use std::ffi::CString;
use std::io::{self, Write as _};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::comms::Comms;
use crate::embed;
use crate::error::SandboxError;
use crate::executor::Executor;
use crate::policy::{MountSpec, Policy};
use crate::worker::Worker;

/// Channel fd number the worker binary expects, also named in the
/// `TETHER_COMMS_FD` environment variable.
pub const COMMS_FD: i32 = 3;

const MSG_SPAWN: u32 = 1;
const MSG_SPAWN_REPLY: u32 = MSG_SPAWN | 0x100;

/// The worker binary to launch.
#[derive(Debug)]
pub enum Binary {
    Path(PathBuf),
    /// An embedded binary materialized as a memfd.
    Fd(OwnedFd),
}

/// Everything the fork server needs to produce one worker.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Packed seccomp-BPF program, 8 bytes per instruction.
    pub filter: Vec<u8>,
    pub mounts: Vec<MountSpec>,
    pub cwd: String,
    pub wall_time_ms: Option<u64>,
    pub rlimit_cpu: Option<u64>,
    pub rlimit_as: Option<u64>,
    /// Worker-side fd numbers for the descriptors sent after this frame,
    /// in order.
    pub fd_targets: Vec<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnReply {
    pub pid: i32,
    pub error: Option<String>,
}

/// Produces workers. The production implementation is [`ForkClient`];
/// tests substitute their own.
pub trait Spawner: Send {
    fn spawn_worker(&mut self, policy: &Policy, executor: &Executor)
    -> Result<Worker, SandboxError>;
}

/// Supervisor-side endpoint of a running fork server.
#[derive(Debug)]
pub struct ForkServer;

impl ForkServer {
    /// Launch the worker binary in fork-server mode.
    ///
    /// `args[0]` is the library path by convention; extra arguments and
    /// environment entries are passed through verbatim.
    pub fn start(
        binary: Binary,
        args: Vec<String>,
        envs: Vec<String>,
    ) -> Result<ForkClient, SandboxError> {
        let exec_path = match &binary {
            Binary::Path(path) => {
                if !path.is_file() {
                    return Err(SandboxError::BinaryNotFound(path.display().to_string()));
                }
                path.display().to_string()
            }
            Binary::Fd(fd) => embed::exec_path(fd),
        };

        if let Err(e) = tether_sys::check() {
            return Err(SandboxError::SystemCheck(e.to_string()));
        }

        // Everything the child needs is prepared before the fork; the
        // child itself only calls dup2/execve/_exit.
        let exec_cstr = to_cstring(&exec_path)?;
        let argv: Vec<CString> = args
            .iter()
            .map(|a| to_cstring(a))
            .collect::<Result<_, _>>()?;
        let mut envp: Vec<CString> = envs
            .iter()
            .map(|e| to_cstring(e))
            .collect::<Result<_, _>>()?;
        envp.push(to_cstring(&format!("TETHER_COMMS_FD={COMMS_FD}"))?);

        let argv_ptrs: Vec<*const libc::c_char> = argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs: Vec<*const libc::c_char> = envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let (parent_comms, child_comms) = Comms::pair()?;

        let child_pid = unsafe { libc::fork() };
        if child_pid < 0 {
            return Err(SandboxError::Fork(tether_sys::last_errno()));
        }

        if child_pid == 0 {
            // In the child. Wire the spawn channel to its fixed number
            // (dup2 clears CLOEXEC) and exec the fork server.
            unsafe {
                let raw = child_comms.as_raw_fd();
                if raw == COMMS_FD {
                    libc::fcntl(raw, libc::F_SETFD, 0);
                } else if libc::dup2(raw, COMMS_FD) < 0 {
                    libc::_exit(126);
                }
                libc::execve(exec_cstr.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                writeln!(io::stderr(), "fork server exec failed: {exec_path}").ok();
                libc::_exit(127);
            }
        }

        drop(child_comms);
        tracing::info!(pid = child_pid, binary = %exec_path, "fork server started");

        Ok(ForkClient {
            comms: Some(parent_comms),
            pid: child_pid,
        })
    }
}

/// Client half of the spawn channel. Dropping it closes the channel,
/// which is the fork server's signal to exit.
#[derive(Debug)]
pub struct ForkClient {
    comms: Option<Comms>,
    pid: libc::pid_t,
}

impl ForkClient {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    fn comms(&mut self) -> Result<&mut Comms, SandboxError> {
        // Only None mid-drop.
        self.comms
            .as_mut()
            .ok_or_else(|| SandboxError::Protocol("spawn channel already closed".into()))
    }
}

impl Spawner for ForkClient {
    fn spawn_worker(
        &mut self,
        policy: &Policy,
        executor: &Executor,
    ) -> Result<Worker, SandboxError> {
        let request = SpawnRequest {
            filter: policy.filter_bytes().to_vec(),
            mounts: policy.mounts().to_vec(),
            cwd: executor.cwd().to_string(),
            wall_time_ms: executor
                .wall_time_limit()
                .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64),
            rlimit_cpu: executor.rlimit_cpu(),
            rlimit_as: executor.rlimit_as(),
            fd_targets: executor.fd_maps().iter().map(|m| m.target_fd).collect(),
        };
        let payload = rmp_serde::to_vec(&request)
            .map_err(|e| SandboxError::Protocol(format!("encode spawn request: {e}")))?;

        let fd_maps = executor.fd_maps().to_vec();
        let comms = self.comms()?;
        comms.send_msg(MSG_SPAWN, &payload)?;
        for map in &fd_maps {
            comms.send_fd(map.local_fd)?;
        }

        let (kind, payload) = comms.recv_msg()?;
        if kind != MSG_SPAWN_REPLY {
            return Err(SandboxError::Protocol(format!(
                "unexpected spawn reply kind {kind:#x}"
            )));
        }
        let reply: SpawnReply = rmp_serde::from_slice(&payload)
            .map_err(|e| SandboxError::Protocol(format!("decode spawn reply: {e}")))?;
        if let Some(error) = reply.error {
            return Err(SandboxError::SpawnRejected(error));
        }

        let worker_fd = comms.recv_fd()?;
        tracing::debug!(pid = reply.pid, "worker spawned");
        Worker::adopt(reply.pid, Comms::from_fd(worker_fd))
    }
}

impl Drop for ForkClient {
    fn drop(&mut self) {
        // Closing the channel asks the fork server to exit; reap it so it
        // does not linger as a zombie.
        self.comms.take();
        for _ in 0..10 {
            let mut status = 0;
            let ret = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
            if ret != 0 {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
            let mut status = 0;
            libc::waitpid(self.pid, &mut status, 0);
        }
    }
}

fn to_cstring(s: &str) -> Result<CString, SandboxError> {
    CString::new(s.as_bytes())
        .map_err(|_| SandboxError::Protocol(format!("NUL byte in argument: {s:?}")))
}
