//! Stub worker for integration tests.
//!
//! The production worker is a separate binary; tests stand in a stub
//! that speaks the same wire protocol. Its process identity is a forked
//! child that only ever calls `read` and `_exit` (so the fork is safe in
//! a threaded test harness); the protocol itself is served by a thread
//! holding the far end of the comms pair and real `malloc`ed memory, so
//! allocation, bulk transfer and buffer-reshaping semantics are the real
//! thing.

#![allow(dead_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use tether::Sandbox;
use tether::sandbox::{LibSource, SandboxHooks};
use tether::wire::{FuncCall, FuncRet, MsgKind};
use tether_sandbox::{Comms, Executor, Policy, SandboxError, Spawner, Worker};

/// Message type for the pb_* stub functions.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct StringOp {
    pub input: String,
    pub output: String,
}

/// Spawns stub workers; counts spawns so tests can observe respawning.
pub struct StubSpawner {
    pub spawns: Arc<AtomicUsize>,
}

impl StubSpawner {
    pub fn new() -> StubSpawner {
        StubSpawner {
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct StubHooks;

impl SandboxHooks for StubHooks {
    fn lib_source(&self) -> LibSource {
        // Never consulted: the spawner slot is pre-filled.
        LibSource::Path("/unused/libstub.so".into())
    }
}

/// A sandbox backed by the stub, plus the spawn counter.
pub fn stub_sandbox() -> (Sandbox, Arc<AtomicUsize>) {
    let spawner = StubSpawner::new();
    let spawns = Arc::clone(&spawner.spawns);
    let sandbox = Sandbox::with_spawner(Box::new(StubHooks), Box::new(spawner));
    (sandbox, spawns)
}

impl Spawner for StubSpawner {
    fn spawn_worker(
        &mut self,
        _policy: &Policy,
        _executor: &Executor,
    ) -> Result<Worker, SandboxError> {
        self.spawns.fetch_add(1, Ordering::Relaxed);

        let (sup_comms, stub_comms) = Comms::pair()?;
        let (ctl_read, ctl_write) = pipe()?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(SandboxError::Protocol(format!(
                "fork failed: {}",
                io::Error::last_os_error()
            )));
        }

        if pid == 0 {
            // Child: wait for an exit code on the control pipe. Nothing
            // but read/_exit runs here.
            unsafe {
                let mut buf = [0u8; 1];
                let n = libc::read(ctl_read.as_raw_fd(), buf.as_mut_ptr().cast(), 1);
                if n <= 0 {
                    libc::_exit(0);
                }
                libc::_exit(i32::from(buf[0]));
            }
        }

        drop(ctl_read);
        std::thread::spawn(move || stub_serve(stub_comms, ctl_write));
        Worker::adopt(pid, sup_comms)
    }
}

fn pipe() -> Result<(OwnedFd, OwnedFd), SandboxError> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(SandboxError::Comms(io::Error::last_os_error()));
    }
    // SAFETY: pipe() returned two fresh descriptors we now own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn exit_child(ctl: &OwnedFd, code: u8) {
    let buf = [code];
    unsafe {
        libc::write(ctl.as_raw_fd(), buf.as_ptr().cast(), 1);
    }
}

fn stub_serve(mut comms: Comms, ctl: OwnedFd) {
    let mut held_fds: Vec<OwnedFd> = Vec::new();

    loop {
        let Ok((kind, payload)) = comms.recv_msg() else {
            // Supervisor went away; shut the identity child down.
            exit_child(&ctl, 0);
            return;
        };

        let result = match kind {
            k if k == MsgKind::Allocate as u32 => {
                let size = u64::from_le_bytes(payload[..8].try_into().unwrap());
                let ptr = unsafe { libc::malloc(size.max(1) as usize) } as u64;
                comms.send_msg(MsgKind::Allocate.reply(), &ptr.to_le_bytes())
            }
            k if k == MsgKind::Free as u32 => {
                let addr = u64::from_le_bytes(payload[..8].try_into().unwrap());
                unsafe { libc::free(addr as *mut libc::c_void) };
                comms.send_msg(MsgKind::Free.reply(), &0u32.to_le_bytes())
            }
            k if k == MsgKind::TransferTo as u32 => {
                let addr = u64::from_le_bytes(payload[..8].try_into().unwrap());
                let size = u64::from_le_bytes(payload[8..16].try_into().unwrap()) as usize;
                assert_eq!(payload.len(), 16 + size);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload[16..].as_ptr(),
                        addr as *mut u8,
                        size,
                    );
                }
                comms.send_msg(MsgKind::TransferTo.reply(), &0u32.to_le_bytes())
            }
            k if k == MsgKind::TransferFrom as u32 => {
                let addr = u64::from_le_bytes(payload[..8].try_into().unwrap());
                let size = u64::from_le_bytes(payload[8..16].try_into().unwrap()) as usize;
                let bytes =
                    unsafe { std::slice::from_raw_parts(addr as *const u8, size) }.to_vec();
                comms.send_msg(MsgKind::TransferFrom.reply(), &bytes)
            }
            k if k == MsgKind::Symbol as u32 => {
                let name = String::from_utf8_lossy(&payload);
                let addr = symbol_table(&name);
                comms.send_msg(MsgKind::Symbol.reply(), &addr.to_le_bytes())
            }
            k if k == MsgKind::FdTo as u32 => {
                let fd = comms.recv_fd().expect("fd after FdTo frame");
                let raw = fd.as_raw_fd() as u64;
                held_fds.push(fd);
                comms.send_msg(MsgKind::FdTo.reply(), &raw.to_le_bytes())
            }
            k if k == MsgKind::FdFrom as u32 => {
                let fd = u64::from_le_bytes(payload[..8].try_into().unwrap()) as i32;
                comms
                    .send_msg(MsgKind::FdFrom.reply(), &0u32.to_le_bytes())
                    .and_then(|()| comms.send_fd(fd))
            }
            k if k == MsgKind::Call as u32 => {
                let call = FuncCall::decode(&payload).expect("well-formed call frame");
                match dispatch(&call, &mut held_fds) {
                    Some(fret) => comms.send_msg(MsgKind::Call.reply(), &fret.encode()),
                    None => {
                        // "die": the worker vanishes mid-call.
                        exit_child(&ctl, 42);
                        return;
                    }
                }
            }
            k if k == MsgKind::Exit as u32 => {
                exit_child(&ctl, 0);
                return;
            }
            other => panic!("stub received unknown message kind {other:#x}"),
        };

        if result.is_err() {
            exit_child(&ctl, 0);
            return;
        }
    }
}

fn symbol_table(name: &str) -> u64 {
    const KNOWN: &[&str] = &[
        "add",
        "scale",
        "increment",
        "reverse_string",
        "duplicate_string",
        "pb_reverse_string",
        "pb_duplicate_string",
        "write_greeting",
        "open_devnull",
    ];
    KNOWN
        .iter()
        .position(|&k| k == name)
        .map_or(0, |i| 0x1000 + i as u64)
}

struct LenValImage {
    header: u64,
    len: usize,
    data: u64,
}

fn read_lenval(header: u64) -> LenValImage {
    unsafe {
        LenValImage {
            header,
            len: std::ptr::read_unaligned(header as *const u64) as usize,
            data: std::ptr::read_unaligned((header + 8) as *const u64),
        }
    }
}

impl LenValImage {
    fn bytes(&self) -> &[u8] {
        if self.data == 0 || self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data as *const u8, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        if self.data == 0 || self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.data as *mut u8, self.len) }
    }

    /// Free the old buffer and install `bytes` in a fresh one, the way a
    /// callee reallocating the value would.
    fn replace(&mut self, bytes: &[u8]) {
        unsafe {
            if self.data != 0 {
                libc::free(self.data as *mut libc::c_void);
            }
            let new = libc::malloc(bytes.len().max(1)) as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), new, bytes.len());
            self.len = bytes.len();
            self.data = new as u64;
            std::ptr::write_unaligned(self.header as *mut u64, self.len as u64);
            std::ptr::write_unaligned((self.header + 8) as *mut u64, self.data);
        }
    }
}

fn int_ret(call: &FuncCall, value: i64) -> FuncRet {
    FuncRet {
        ret_type: call.ret_type,
        value: value as u64,
    }
}

fn dispatch(call: &FuncCall, held_fds: &mut Vec<OwnedFd>) -> Option<FuncRet> {
    match call.func() {
        "add" => {
            let a = call.arg_val[0] as i64;
            let b = call.arg_val[1] as i64;
            Some(int_ret(call, a + b))
        }
        "scale" => {
            let a = f64::from_bits(call.arg_val[0]);
            let b = f64::from_bits(call.arg_val[1]);
            Some(FuncRet {
                ret_type: call.ret_type,
                value: (a * b).to_bits(),
            })
        }
        "store_answer" => {
            let addr = call.arg_val[0];
            assert_ne!(addr, 0, "store_answer needs allocated memory");
            unsafe { std::ptr::write_unaligned(addr as *mut i32, 42) };
            Some(int_ret(call, 0))
        }
        "increment" => {
            let addr = call.arg_val[0];
            if addr == 0 {
                return Some(int_ret(call, -1));
            }
            let value = unsafe { std::ptr::read_unaligned(addr as *const i32) } + 1;
            unsafe { std::ptr::write_unaligned(addr as *mut i32, value) };
            Some(int_ret(call, i64::from(value)))
        }
        "reverse_string" => {
            let mut image = read_lenval(call.arg_val[0]);
            image.bytes_mut().reverse();
            Some(int_ret(call, 1))
        }
        "duplicate_string" => {
            let mut image = read_lenval(call.arg_val[0]);
            let mut doubled = image.bytes().to_vec();
            doubled.extend_from_slice(image.bytes());
            image.replace(&doubled);
            Some(int_ret(call, 1))
        }
        "pb_reverse_string" => {
            let mut image = read_lenval(call.arg_val[0]);
            let Ok(mut op) = rmp_serde::from_slice::<StringOp>(image.bytes()) else {
                return Some(int_ret(call, 0));
            };
            op.output = op.input.chars().rev().collect();
            image.replace(&rmp_serde::to_vec(&op).unwrap());
            Some(int_ret(call, 1))
        }
        "pb_duplicate_string" => {
            let mut image = read_lenval(call.arg_val[0]);
            let Ok(mut op) = rmp_serde::from_slice::<StringOp>(image.bytes()) else {
                return Some(int_ret(call, 0));
            };
            op.output = format!("{}{}", op.input, op.input);
            image.replace(&rmp_serde::to_vec(&op).unwrap());
            Some(int_ret(call, 1))
        }
        "write_greeting" => {
            let fd = call.arg_val[0] as i64 as i32;
            let n = unsafe { libc::write(fd, b"hello\n".as_ptr().cast(), 6) };
            Some(int_ret(call, n as i64))
        }
        "open_devnull" => {
            let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY) };
            assert!(fd >= 0);
            // Keep it open for the FdFrom fetch that follows.
            held_fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            Some(int_ret(call, i64::from(fd)))
        }
        "die" => None,
        _ => Some(int_ret(call, 0)),
    }
}
