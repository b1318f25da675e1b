//! Framed duplex channel between supervisor and worker.
//!
//! Messages travel over an `AF_UNIX SOCK_STREAM` socketpair as
//! `{kind: u32, payload_len: u32}` little-endian headers followed by the
//! payload. The channel is strictly half-duplex per exchange: the caller
//! sends one message and reads one reply before sending the next.
//!
//! File descriptors cross the boundary out-of-band: a one-byte message
//! carrying the descriptor as `SCM_RIGHTS` ancillary data, sent adjacent
//! to the frame that announces it.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Upper bound on a single frame payload. Bulk memory transfers are
/// chunked below this by the caller.
pub const MAX_PAYLOAD: usize = 1 << 20;

const HEADER_LEN: usize = 8;

#[derive(Debug)]
pub struct Comms {
    stream: UnixStream,
}

impl Comms {
    /// Create a connected pair. One end stays with the supervisor, the
    /// other is handed to a child process.
    pub fn pair() -> io::Result<(Comms, Comms)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Comms { stream: a }, Comms { stream: b }))
    }

    pub fn from_fd(fd: OwnedFd) -> Comms {
        Comms {
            stream: UnixStream::from(fd),
        }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.stream.into()
    }

    pub fn send_msg(&mut self, kind: u32, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload too large: {} bytes", payload.len()),
            ));
        }
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&kind.to_le_bytes());
        header[4..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.stream.write_all(&header)?;
        self.stream.write_all(payload)?;
        self.stream.flush()
    }

    pub fn recv_msg(&mut self) -> io::Result<(u32, Vec<u8>)> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header)?;

        let kind = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {len} bytes"),
            ));
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok((kind, payload))
    }

    /// Send a file descriptor using `SCM_RIGHTS`. The frame body is a
    /// single marker byte; the descriptor rides in the control block.
    pub fn send_fd(&mut self, fd: RawFd) -> io::Result<()> {
        let marker = [FD_MARKER];
        let mut iov = libc::iovec {
            iov_base: marker.as_ptr() as *mut libc::c_void,
            iov_len: marker.len(),
        };
        let mut control = [0u8; CONTROL_CAPACITY];
        debug_assert!(fd_control_space() <= CONTROL_CAPACITY);

        let mut hdr = blank_msghdr();
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = control.as_mut_ptr().cast();
        hdr.msg_controllen = fd_control_space();

        // SAFETY: hdr references live stack buffers for the duration of
        // the call, and the CMSG_* macros only walk the control block
        // attached just above.
        unsafe {
            let slot = libc::CMSG_FIRSTHDR(&hdr);
            if slot.is_null() {
                return Err(io::Error::other("control block cannot hold a descriptor"));
            }
            (*slot).cmsg_level = libc::SOL_SOCKET;
            (*slot).cmsg_type = libc::SCM_RIGHTS;
            (*slot).cmsg_len = fd_control_len();
            libc::CMSG_DATA(slot).cast::<RawFd>().write_unaligned(fd);
        }

        if unsafe { libc::sendmsg(self.stream.as_raw_fd(), &hdr, 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive a file descriptor sent with [`Comms::send_fd`].
    pub fn recv_fd(&mut self) -> io::Result<OwnedFd> {
        let mut marker = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: marker.as_mut_ptr().cast(),
            iov_len: marker.len(),
        };
        let mut control = [0u8; CONTROL_CAPACITY];

        let mut hdr = blank_msghdr();
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = control.as_mut_ptr().cast();
        hdr.msg_controllen = CONTROL_CAPACITY;

        let received = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut hdr, 0) };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        if received == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed while waiting for fd",
            ));
        }
        if hdr.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "descriptor control block truncated",
            ));
        }

        // Walk the control chain for the rights message; the kernel may
        // in principle deliver others alongside it.
        //
        // SAFETY: recvmsg filled in the control block attached above and
        // the CMSG_* macros stay within hdr.msg_controllen of it.
        unsafe {
            let mut slot = libc::CMSG_FIRSTHDR(&hdr);
            while !slot.is_null() {
                if (*slot).cmsg_level == libc::SOL_SOCKET
                    && (*slot).cmsg_type == libc::SCM_RIGHTS
                    && (*slot).cmsg_len >= fd_control_len()
                {
                    let fd = libc::CMSG_DATA(slot).cast::<RawFd>().read_unaligned();
                    return Ok(OwnedFd::from_raw_fd(fd));
                }
                slot = libc::CMSG_NXTHDR(&hdr, slot);
            }
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame carried no descriptor",
        ))
    }
}

/// Body byte accompanying a descriptor transfer; stream sockets refuse
/// ancillary data on an empty send.
const FD_MARKER: u8 = 0x5f;

/// Room for one rights message. `CMSG_SPACE(4)` is 24 on 64-bit Linux;
/// the slack keeps the constant platform-independent.
const CONTROL_CAPACITY: usize = 64;

fn blank_msghdr() -> libc::msghdr {
    // SAFETY: msghdr is plain data; all-zero is the empty message.
    unsafe { std::mem::zeroed() }
}

fn fd_control_space() -> usize {
    // SAFETY: CMSG_SPACE is a pure size computation.
    unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) as usize }
}

fn fd_control_len() -> usize {
    // SAFETY: CMSG_LEN is a pure size computation.
    unsafe { libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize }
}

impl AsRawFd for Comms {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
