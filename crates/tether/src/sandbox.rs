//! The sandbox controller.
//!
//! A [`Sandbox`] drives one worker process: it starts the fork server on
//! first [`Sandbox::init`], composes the syscall policy, spawns a worker
//! and speaks the call protocol to it. Library-specific knobs hang off a
//! [`SandboxHooks`] implementation: where the worker binary lives, extra
//! argv/env entries, policy and executor adjustments.
//!
//! The call engine lives here too: [`Sandbox::call`] packs an argument
//! list, pushes `Before`-synced pointees, performs the exchange, unpacks
//! the return value and pulls `After`-synced pointees back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_sandbox::{
    Binary, Executor, ForkServer, PolicyBuilder, Spawner, TerminationResult, embed,
};

use crate::error::{Error, Result};
use crate::rpc::RpcChannel;
use crate::vars::{Arg, RemoteAddr, SyncPolicy, Type, Var};
use crate::wire::{FuncCall, MAX_ARGS};

/// Where the worker binary comes from.
#[derive(Debug, Clone)]
pub enum LibSource {
    /// On disk. Relative paths resolve against `TETHER_RUNFILES`, then
    /// the supervisor executable's directory.
    Path(PathBuf),
    /// Compiled into the supervisor; materialized as a sealed memfd.
    Embedded {
        name: &'static str,
        bytes: &'static [u8],
    },
}

/// Per-library configuration points. Only the binary location is
/// mandatory; everything else defaults to no-ops.
pub trait SandboxHooks {
    fn lib_source(&self) -> LibSource;

    /// Extra worker arguments (after the library path in `argv[0]`).
    fn args(&self, _argv: &mut Vec<String>) {}

    /// Extra worker environment entries, `KEY=value`.
    fn envs(&self, _envp: &mut Vec<String>) {}

    /// Adjust the default syscall policy.
    fn modify_policy(&self, _builder: &mut PolicyBuilder) {}

    /// Adjust the executor, e.g. fd maps or resource limits.
    fn modify_executor(&self, _executor: &mut Executor) {}
}

/// Hooks for the common case of a library with no special needs.
#[derive(Debug)]
struct PathHooks {
    path: PathBuf,
}

impl SandboxHooks for PathHooks {
    fn lib_source(&self) -> LibSource {
        LibSource::Path(self.path.clone())
    }
}

/// The policy most single-threaded libraries get by: basic I/O, memory,
/// identity and time queries, signal handling, the comms channel's
/// sendmsg/recvmsg, a read-only `/etc/localtime` and a capped tmpfs.
pub fn default_policy_builder() -> PolicyBuilder {
    let mut builder = PolicyBuilder::new();
    builder
        .allow_read()
        .allow_write()
        .allow_exit()
        .allow_getrlimit()
        .allow_get_ids()
        .allow_tcgets()
        .allow_time()
        .allow_open()
        .allow_stat()
        .allow_handle_signals()
        .allow_system_malloc()
        .allow_safe_fcntl()
        .allow_syscalls([
            libc::SYS_recvmsg,
            libc::SYS_sendmsg,
            libc::SYS_futex,
            libc::SYS_close,
            libc::SYS_lseek,
            libc::SYS_getpid,
            libc::SYS_getppid,
            libc::SYS_gettid,
            libc::SYS_clock_nanosleep,
            libc::SYS_nanosleep,
            libc::SYS_uname,
            libc::SYS_getrandom,
            libc::SYS_kill,
            libc::SYS_tgkill,
            libc::SYS_tkill,
        ])
        .add_file("/etc/localtime")
        .add_tmpfs("/tmp", 1 << 30);
    #[cfg(not(target_arch = "aarch64"))]
    builder.allow_syscall(libc::SYS_readlink);
    #[cfg(target_arch = "x86_64")]
    builder.allow_syscall(libc::SYS_arch_prctl);
    #[cfg(feature = "sanitizers")]
    {
        tracing::warn!("allowing additional syscalls for the LLVM sanitizers");
        builder.allow_llvm_sanitizers();
    }
    builder
}

pub struct Sandbox {
    hooks: Box<dyn SandboxHooks>,
    spawner: Option<Box<dyn Spawner>>,
    worker: Option<tether_sandbox::Worker>,
    rpc: Option<RpcChannel>,
    result: Option<TerminationResult>,
}

impl Sandbox {
    pub fn new(hooks: Box<dyn SandboxHooks>) -> Sandbox {
        Sandbox {
            hooks,
            spawner: None,
            worker: None,
            rpc: None,
            result: None,
        }
    }

    /// A sandbox for a worker binary with default policy and executor.
    pub fn for_library(path: impl Into<PathBuf>) -> Sandbox {
        Sandbox::new(Box::new(PathHooks { path: path.into() }))
    }

    /// A sandbox with a custom worker source. The spawner takes the
    /// fork-server slot, so `init` never launches one.
    pub fn with_spawner(hooks: Box<dyn SandboxHooks>, spawner: Box<dyn Spawner>) -> Sandbox {
        Sandbox {
            hooks,
            spawner: Some(spawner),
            worker: None,
            rpc: None,
            result: None,
        }
    }

    /// Bring the sandbox up. A no-op when already active. The fork
    /// server starts once, on the first call; every later `init` only
    /// spawns a fresh worker from it.
    pub fn init(&mut self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        // A dead worker from an earlier run is reaped before respawning.
        if self.worker.is_some() {
            self.terminate(false);
        }

        if self.spawner.is_none() {
            self.spawner = Some(self.start_fork_server()?);
        }

        let mut builder = default_policy_builder();
        self.hooks.modify_policy(&mut builder);
        let policy = builder.build();

        let mut executor = Executor::default();
        self.hooks.modify_executor(&mut executor);

        let spawner = self
            .spawner
            .as_mut()
            .ok_or_else(|| Error::Internal("fork server slot is empty".into()))?;
        let mut worker = spawner
            .spawn_worker(&policy, &executor)
            .map_err(|e| Error::Unavailable(format!("could not spawn worker: {e}")))?;

        let Some(comms) = worker.take_comms() else {
            // Dropping the handle kills and reaps the stray process.
            drop(worker);
            return Err(Error::Internal("spawned worker has no comms".into()));
        };

        let pid = worker.pid();
        self.rpc = Some(RpcChannel::new(comms));
        self.worker = Some(worker);
        tracing::info!(pid, "sandbox worker ready");
        Ok(())
    }

    fn start_fork_server(&self) -> Result<Box<dyn Spawner>> {
        let (binary, lib_path) = match self.hooks.lib_source() {
            LibSource::Path(path) => {
                let resolved = resolve_lib_path(&path)?;
                let display = resolved.display().to_string();
                (Binary::Path(resolved), display)
            }
            LibSource::Embedded { name, bytes } => {
                let fd = embed::create_memfd(name, bytes).map_err(|e| {
                    Error::Unavailable(format!("could not materialize embedded worker: {e}"))
                })?;
                (Binary::Fd(fd), name.to_string())
            }
        };

        let mut argv = vec![lib_path];
        self.hooks.args(&mut argv);
        let mut envp = Vec::new();
        self.hooks.envs(&mut envp);

        let client = ForkServer::start(binary, argv, envp)
            .map_err(|e| Error::Unavailable(format!("could not start fork server: {e}")))?;
        Ok(Box::new(client))
    }

    pub fn is_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_terminated())
    }

    /// Worker pid while a worker exists.
    pub fn pid(&self) -> Option<i32> {
        self.worker.as_ref().map(|w| w.pid())
    }

    /// Final termination result, once the worker has been awaited.
    pub fn result(&self) -> Option<&TerminationResult> {
        self.result.as_ref()
    }

    /// Bring the sandbox down. Idempotent. With `graceful`, the worker
    /// gets a one-second wall clock and a polite exit request first; a
    /// failed request falls back to SIGKILL.
    pub fn terminate(&mut self, graceful: bool) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let rpc = self.rpc.take();

        if !worker.is_terminated() {
            if graceful {
                if let Err(err) = worker.set_wall_time_limit(Some(Duration::from_secs(1))) {
                    tracing::warn!(%err, "could not arm exit deadline");
                }
                let exited = rpc.as_ref().is_some_and(|r| r.exit().is_ok());
                if !exited {
                    tracing::warn!(pid = worker.pid(), "exit request failed, killing worker");
                    worker.kill();
                }
            } else {
                worker.kill();
            }
        }

        match worker.await_result() {
            Ok(result) => {
                if result.is_clean() {
                    tracing::info!(%result, "sandbox finished");
                } else {
                    tracing::warn!(%result, "sandbox finished");
                }
                self.result = Some(result);
            }
            Err(err) => tracing::warn!(%err, "failed to await worker"),
        }

        if let Some(rpc) = rpc {
            rpc.mark_dead();
        }
    }

    /// Give the worker `limit` of wall-clock time, or remove the limit.
    pub fn set_wall_time_limit(&mut self, limit: Option<Duration>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Unavailable("sandbox is not active".into()));
        }
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| Error::Unavailable("sandbox is not active".into()))?;
        worker
            .set_wall_time_limit(limit)
            .map_err(|e| Error::Internal(format!("could not arm watchdog: {e}")))
    }

    /// The channel to the current worker. Fails unless active.
    pub fn rpc_channel(&self) -> Result<&RpcChannel> {
        if !self.is_active() {
            return Err(Error::Unavailable("sandbox is not active".into()));
        }
        self.rpc
            .as_ref()
            .ok_or_else(|| Error::Unavailable("sandbox is not active".into()))
    }

    pub fn allocate(&self, var: &mut dyn Var, auto_free: bool) -> Result<()> {
        var.allocate(self.rpc_channel()?, auto_free)
    }

    pub fn free(&self, var: &mut dyn Var) -> Result<()> {
        var.free(self.rpc_channel()?)
    }

    pub fn transfer_to_sandboxee(&self, var: &mut dyn Var) -> Result<()> {
        var.transfer_to_sandboxee(self.rpc_channel()?)
    }

    pub fn transfer_from_sandboxee(&self, var: &mut dyn Var) -> Result<()> {
        var.transfer_from_sandboxee(self.rpc_channel()?)
    }

    /// Look up a symbol in the worker's loaded library.
    pub fn symbol(&self, name: &str) -> Result<RemoteAddr> {
        self.rpc_channel()?.symbol(name)
    }

    /// Invoke `func` in the worker.
    ///
    /// Arguments are processed left to right: descriptors and pointer
    /// sizes are recorded, `Before`-synced pointees are allocated (with
    /// automatic free) and pushed, inline values are copied. The reply
    /// fills `ret`, then `After`-synced pointees are pulled. The first
    /// failure short-circuits; later arguments are untouched and no
    /// post-sync runs.
    pub fn call(&mut self, func: &str, ret: &mut dyn Var, args: &mut [Arg<'_>]) -> Result<()> {
        let rpc = self.rpc_channel()?.clone();

        if args.len() > MAX_ARGS {
            return Err(Error::InvalidArgument(format!(
                "{} arguments, the protocol carries at most {MAX_ARGS}",
                args.len()
            )));
        }

        let mut rfcall = FuncCall::new(func)?;
        rfcall.argc = args.len() as u32;
        tracing::debug!(func, argc = args.len(), "call entry");

        for (i, arg) in args.iter_mut().enumerate() {
            match arg {
                Arg::Val(var) => {
                    let ty = var.var_type();
                    if !matches!(ty, Type::Int | Type::Float) {
                        return Err(Error::InvalidArgument(format!(
                            "argument {i} ({ty:?}) cannot be passed by value; pass a pointer"
                        )));
                    }
                    rfcall.arg_type[i] = ty as u32;
                    rfcall.arg_size[i] = var.size();
                    rfcall.arg_val[i] = var.value_bits();
                }
                Arg::Ptr { pointee, sync } => {
                    rfcall.arg_type[i] = Type::Pointer as u32;
                    rfcall.arg_size[i] = size_of::<u64>() as u64;
                    rfcall.aux_type[i] = pointee.var_type() as u32;
                    rfcall.aux_size[i] = pointee.size();

                    // Allocation happens for any synchronized pointer;
                    // bytes only move for Before/Both.
                    if *sync != SyncPolicy::None && pointee.size() > 0 {
                        if pointee.remote().is_none() {
                            pointee.allocate(&rpc, true)?;
                        }
                        if sync.syncs_before() {
                            tracing::debug!(arg = i, "synchronizing pointee to worker");
                            pointee.transfer_to_sandboxee(&rpc)?;
                        }
                    }
                    rfcall.arg_val[i] = pointee.remote().map_or(0, RemoteAddr::value);
                }
                Arg::Fd(fd_var) => {
                    rfcall.arg_type[i] = Type::Fd as u32;
                    rfcall.arg_size[i] = fd_var.size();
                    if fd_var.remote_fd().is_none() {
                        fd_var.transfer_to_sandboxee(&rpc)?;
                    }
                    rfcall.arg_val[i] = fd_var.value_bits();
                }
            }
            tracing::debug!(
                arg = i,
                ty = rfcall.arg_type[i],
                size = rfcall.arg_size[i],
                "call argument"
            );
        }

        rfcall.ret_type = ret.var_type() as u32;
        rfcall.ret_size = ret.size();

        let fret = rpc.call(&rfcall, ret.var_type())?;
        ret.set_value_bits(fret.value)?;
        if ret.var_type() == Type::Fd {
            ret.transfer_from_sandboxee(&rpc)?;
        }

        for (i, arg) in args.iter_mut().enumerate() {
            let Arg::Ptr { pointee, sync } = arg else {
                continue;
            };
            if !sync.syncs_after() || pointee.size() == 0 {
                continue;
            }
            if pointee.remote().is_none() {
                return Err(Error::FailedPrecondition(format!(
                    "argument {i} has no remote allocation to synchronize from"
                )));
            }
            tracing::debug!(arg = i, "synchronizing pointee from worker");
            pointee.transfer_from_sandboxee(&rpc)?;
        }

        tracing::debug!(func, ret = rfcall.ret_type, "call exit");
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.terminate(true);
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("active", &self.is_active())
            .field("pid", &self.pid())
            .finish()
    }
}

fn resolve_lib_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::FailedPrecondition("no library path given".into()));
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    if let Ok(runfiles) = std::env::var("TETHER_RUNFILES") {
        return Ok(PathBuf::from(runfiles).join(path));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            return Ok(dir.join(path));
        }
    }
    Ok(path.to_path_buf())
}
