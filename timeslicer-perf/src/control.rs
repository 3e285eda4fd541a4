//! The control protocol between tasks in the subject and the collector: a
//! stream socket carrying an eight-byte inline header (task id + command)
//! and, for registrations, the counter-group fds as SCM_RIGHTS ancillary
//! data, leader first, auxiliaries in configured event order.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

pub const CMD_REGISTER: u32 = 1;
pub const CMD_UNREGISTER: u32 = 2;

/// Upper bound on fds per message; one leader plus a generous number of
/// auxiliary events.
pub const MAX_CONTROL_FDS: usize = 64;

const HEADER_LEN: usize = 8;

#[derive(Debug)]
pub struct ControlMessage {
    pub tid: u32,
    pub cmd: u32,
    pub fds: Vec<OwnedFd>,
}

#[derive(Debug)]
pub enum ControlEvent {
    Message(ControlMessage),
    /// The peer closed its end; no further registrations will arrive.
    Closed,
    /// Nothing pending on a non-blocking socket.
    WouldBlock,
}

#[repr(align(8))]
struct CmsgBuffer([u8; 512]);

fn encode_header(tid: u32, cmd: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&tid.to_ne_bytes());
    header[4..].copy_from_slice(&cmd.to_ne_bytes());
    header
}

/// Send one control message. `fds` must be empty for `CMD_UNREGISTER`.
pub fn send_message(sock: BorrowedFd, tid: u32, cmd: u32, fds: &[RawFd]) -> io::Result<()> {
    assert!(fds.len() <= MAX_CONTROL_FDS);
    let mut header = encode_header(tid, cmd);
    let mut iov = libc::iovec {
        iov_base: header.as_mut_ptr() as *mut libc::c_void,
        iov_len: HEADER_LEN,
    };

    let mut cmsg = CmsgBuffer([0; 512]);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let payload_len = (fds.len() * mem::size_of::<RawFd>()) as u32;
        msg.msg_control = cmsg.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(payload_len) } as _;
        let hdr = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        unsafe {
            (*hdr).cmsg_level = libc::SOL_SOCKET;
            (*hdr).cmsg_type = libc::SCM_RIGHTS;
            (*hdr).cmsg_len = libc::CMSG_LEN(payload_len) as _;
            ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(hdr),
                payload_len as usize,
            );
        }
    }

    let sent = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn send_register(sock: BorrowedFd, tid: u32, fds: &[RawFd]) -> io::Result<()> {
    send_message(sock, tid, CMD_REGISTER, fds)
}

pub fn send_unregister(sock: BorrowedFd, tid: u32) -> io::Result<()> {
    send_message(sock, tid, CMD_UNREGISTER, &[])
}

/// Receive one control message. Received fds get close-on-exec set before
/// they are visible to anyone else.
pub fn recv_message(sock: BorrowedFd) -> io::Result<ControlEvent> {
    let mut header = [0u8; HEADER_LEN];
    let mut iov = libc::iovec {
        iov_base: header.as_mut_ptr() as *mut libc::c_void,
        iov_len: HEADER_LEN,
    };
    let mut cmsg = CmsgBuffer([0; 512]);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg.0.len() as _;

    let received = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if received < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(ControlEvent::WouldBlock);
        }
        return Err(err);
    }
    if received == 0 {
        return Ok(ControlEvent::Closed);
    }
    if received as usize != HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control header was {received} bytes, expected {HEADER_LEN}"),
        ));
    }

    let tid = u32::from_ne_bytes(header[..4].try_into().unwrap());
    let cmd = u32::from_ne_bytes(header[4..].try_into().unwrap());

    let mut fds = Vec::new();
    let mut hdr = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !hdr.is_null() {
        let (level, kind, len) = unsafe { ((*hdr).cmsg_level, (*hdr).cmsg_type, (*hdr).cmsg_len) };
        if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
            let payload_len = len as usize - unsafe { libc::CMSG_LEN(0) } as usize;
            let count = payload_len / mem::size_of::<RawFd>();
            let mut raw = vec![0 as RawFd; count];
            unsafe {
                ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(hdr) as *const u8,
                    raw.as_mut_ptr() as *mut u8,
                    payload_len,
                );
            }
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
        hdr = unsafe { libc::CMSG_NXTHDR(&msg, hdr) };
    }

    Ok(ControlEvent::Message(ControlMessage { tid, cmd, fds }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    fn stream_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let ok = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ok, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn register_carries_fds_across_the_socket() {
        let (tx, rx) = stream_pair();
        let (pipe_r, pipe_w) = pipe_pair();
        let sent = [pipe_r.as_raw_fd(), pipe_w.as_raw_fd()];

        send_register(tx.as_fd(), 4321, &sent).unwrap();
        let event = recv_message(rx.as_fd()).unwrap();
        let ControlEvent::Message(msg) = event else {
            panic!("expected a message");
        };
        assert_eq!(msg.tid, 4321);
        assert_eq!(msg.cmd, CMD_REGISTER);
        assert_eq!(msg.fds.len(), 2);

        // The received descriptors are live duplicates: writing into the
        // sent pipe must surface on the received read end.
        let payload = [7u8; 3];
        let wrote = unsafe {
            libc::write(
                msg.fds[1].as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(wrote, 3);
        let mut buf = [0u8; 3];
        let read = unsafe {
            libc::read(
                pipe_r.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(read, 3);
        assert_eq!(buf, payload);
    }

    #[test]
    fn unregister_carries_no_fds() {
        let (tx, rx) = stream_pair();
        send_unregister(tx.as_fd(), 99).unwrap();
        let ControlEvent::Message(msg) = recv_message(rx.as_fd()).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(msg.tid, 99);
        assert_eq!(msg.cmd, CMD_UNREGISTER);
        assert!(msg.fds.is_empty());
    }

    #[test]
    fn closed_peer_reports_eof() {
        let (tx, rx) = stream_pair();
        drop(tx);
        assert!(matches!(
            recv_message(rx.as_fd()).unwrap(),
            ControlEvent::Closed
        ));
    }

    #[test]
    fn empty_nonblocking_socket_would_block() {
        let (_tx, rx) = stream_pair();
        let flags = unsafe { libc::fcntl(rx.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags, -1);
        let ok = unsafe { libc::fcntl(rx.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
        assert_ne!(ok, -1);
        assert!(matches!(
            recv_message(rx.as_fd()).unwrap(),
            ControlEvent::WouldBlock
        ));
    }
}
