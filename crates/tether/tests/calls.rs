//! Call engine behavior: inline values, pointer synchronization,
//! descriptor shuttling.

mod common;

use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};

use tether::vars::{FdVar, LenVal, Scalar, Var};
use tether::{Arg, Error, SyncPolicy};

#[test]
fn integer_arguments_inline() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let a = Scalar::new(40i64);
    let b = Scalar::new(2i64);
    let mut ret = Scalar::new(0i64);
    sandbox
        .call("add", &mut ret, &mut [Arg::val(&a), Arg::val(&b)])
        .unwrap();
    assert_eq!(ret.value(), 42);
}

#[test]
fn negative_integers_survive_the_slot() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let a = Scalar::new(-100i32);
    let b = Scalar::new(58i32);
    let mut ret = Scalar::new(0i64);
    sandbox
        .call("add", &mut ret, &mut [Arg::val(&a), Arg::val(&b)])
        .unwrap();
    assert_eq!(ret.value(), -42);
}

#[test]
fn float_arguments_inline() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let a = Scalar::new(2.5f64);
    let b = Scalar::new(4.0f64);
    let mut ret = Scalar::new(0.0f64);
    sandbox
        .call("scale", &mut ret, &mut [Arg::val(&a), Arg::val(&b)])
        .unwrap();
    assert_eq!(ret.value(), 10.0);
}

#[test]
fn pointer_sync_both_roundtrips_scalar() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let mut counter = Scalar::new(41i32);
    let mut ret = Scalar::new(0i32);
    sandbox
        .call("increment", &mut ret, &mut [Arg::ptr_both(&mut counter)])
        .unwrap();
    assert_eq!(ret.value(), 42);
    assert_eq!(counter.value(), 42);
    // The pre-sync allocation stays with the variable for reuse.
    assert!(counter.remote().is_some());

    sandbox
        .call("increment", &mut ret, &mut [Arg::ptr_both(&mut counter)])
        .unwrap();
    assert_eq!(counter.value(), 43);
}

#[test]
fn sync_none_passes_null_for_unallocated_pointee() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let mut counter = Scalar::new(7i32);
    let mut ret = Scalar::new(0i32);
    sandbox
        .call("increment", &mut ret, &mut [Arg::ptr_none(&mut counter)])
        .unwrap();
    // The stub answers -1 for a null pointer; the local value is untouched.
    assert_eq!(ret.value(), -1);
    assert_eq!(counter.value(), 7);
    assert!(counter.remote().is_none());
}

#[test]
fn sync_after_pulls_without_pushing() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    // After-only: the pointee is allocated but its bytes are not pushed;
    // the callee writes, and post-sync brings the value home.
    let mut out = Scalar::new(0i32);
    let mut ret = Scalar::new(0i32);
    sandbox
        .call(
            "store_answer",
            &mut ret,
            &mut [Arg::ptr(&mut out, SyncPolicy::After)],
        )
        .unwrap();
    assert_eq!(out.value(), 42);
    assert!(out.remote().is_some());
}

#[test]
fn struct_by_value_rejected() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let buf = LenVal::new(*b"abc");
    let mut ret = Scalar::new(0i32);
    let err = sandbox
        .call("add", &mut ret, &mut [Arg::val(&buf)])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn too_many_arguments_rejected() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let vars: Vec<Scalar<i64>> = (0..13).map(Scalar::new).collect();
    let mut args: Vec<Arg<'_>> = vars.iter().map(|v| Arg::val(v)).collect();
    let mut ret = Scalar::new(0i64);
    let err = sandbox.call("add", &mut ret, &mut args).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn call_on_inactive_sandbox_is_unavailable() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    let mut ret = Scalar::new(0i64);
    let err = sandbox.call("add", &mut ret, &mut []).unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
}

#[test]
fn descriptor_argument_reaches_the_worker() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    // SAFETY: fresh descriptors from pipe().
    let (read_fd, write_fd) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let mut fd_var = FdVar::new(write_fd);
    let mut ret = Scalar::new(0i64);
    sandbox
        .call("write_greeting", &mut ret, &mut [Arg::fd(&mut fd_var)])
        .unwrap();
    assert_eq!(ret.value(), 6);
    assert!(fd_var.remote_fd().is_some());

    // What the worker wrote arrives through the duplicated descriptor.
    // The worker keeps its duplicate open, so read exactly what was
    // written instead of waiting for EOF.
    let mut file = std::fs::File::from(read_fd);
    let mut out = [0u8; 6];
    file.read_exact(&mut out).unwrap();
    assert_eq!(&out, b"hello\n");
}

#[test]
fn descriptor_return_value_is_pulled_back() {
    let (mut sandbox, _spawns) = common::stub_sandbox();
    sandbox.init().unwrap();

    let mut ret = FdVar::for_return();
    sandbox.call("open_devnull", &mut ret, &mut []).unwrap();
    assert!(ret.remote_fd().is_some());

    let fd = ret.take_fd().expect("descriptor fetched");
    // The fetched descriptor is usable: /dev/null accepts writes.
    let n = unsafe { libc::write(std::os::fd::AsRawFd::as_raw_fd(&fd), b"x".as_ptr().cast(), 1) };
    assert_eq!(n, 1);
}
