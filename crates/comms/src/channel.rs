// crates/comms/src/channel.rs
#![allow(unsafe_code)]

use std::io::{self, Write};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use crate::frames::{Frame, FrameCodec};
use crate::request::Message;

/// Descriptor slot where a process launched by the fork server finds its
/// channel back to the supervisor. Part of the wire contract with the
/// helper binary; the launcher dups the child end onto this slot before
/// replacing the image.
pub const CLIENT_COMMS_FD: RawFd = 1022;

/// At most exec + child-comms + user-namespace descriptors per request.
pub const MAX_PASSED_FDS: usize = 3;

const CMSG_BUF_LEN: usize = 64;

// Aligned backing store for the SCM_RIGHTS control message.
#[repr(C)]
union CmsgBuf {
    buf: [u8; CMSG_BUF_LEN],
    _align: libc::cmsghdr,
}

/// One end of the supervisor-helper channel.
///
/// Frames travel as plain stream writes; descriptors escort them in a
/// separate one-byte `SCM_RIGHTS` message. Once a send or receive observes
/// the peer gone, `is_terminated` reports it forever; the channel itself is
/// never torn down here.
pub struct Comms {
    stream: UnixStream,
    terminated: bool,
}

impl Comms {
    /// Connected pair of channel ends, close-on-exec on both.
    pub fn pair() -> io::Result<(Comms, Comms)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(io::Error::from)?;
        Ok((Comms::from_owned_fd(a), Comms::from_owned_fd(b)))
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Comms {
        Comms {
            stream: UnixStream::from(fd),
            terminated: false,
        }
    }

    /// Adopt the well-known slot a fork-server process is started with.
    pub fn client() -> io::Result<Comms> {
        // SAFETY: FD_GETFD probes existence without side effects.
        if unsafe { libc::fcntl(CLIENT_COMMS_FD, libc::F_GETFD) } == -1 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no channel on descriptor {CLIENT_COMMS_FD}"),
            ));
        }
        // The slot arrives without close-on-exec (it had to survive our own
        // exec); restore it so processes we spawn don't inherit it.
        // SAFETY: the launch contract reserves this slot for us; nothing
        // else in the process owns it.
        unsafe {
            libc::fcntl(CLIENT_COMMS_FD, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        let fd = unsafe { OwnedFd::from_raw_fd(CLIENT_COMMS_FD) };
        Ok(Comms::from_owned_fd(fd))
    }

    /// True once a send or receive has observed the peer disconnected.
    /// Sticky: never reset.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn send_message(&mut self, msg: &Message, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        let mut buf = Vec::new();
        msg.to_frame().encode(&mut buf)?;
        let res = self.stream.write_all(&buf);
        self.track(res)?;
        if !fds.is_empty() {
            self.send_fds(fds)?;
        }
        Ok(())
    }

    pub fn recv_message(&mut self) -> io::Result<(Message, Vec<OwnedFd>)> {
        // Unbuffered on purpose: the descriptor escort must stay aligned
        // with the stream position.
        let frame = {
            let res = Frame::decode(&mut self.stream);
            self.track(res)?
        };
        let msg = Message::from_frame(frame)?;
        let fds = match &msg {
            Message::Spawn(payload) if payload.fd_count() > 0 => {
                self.recv_fds(payload.fd_count())?
            }
            _ => Vec::new(),
        };
        Ok((msg, fds))
    }

    fn send_fds(&mut self, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        if fds.len() > MAX_PASSED_FDS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot pass {} descriptors", fds.len()),
            ));
        }
        let raw: Vec<libc::c_int> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let data_len = raw.len() * mem::size_of::<libc::c_int>();

        let mut escort = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: escort.as_mut_ptr().cast(),
            iov_len: escort.len(),
        };
        let mut cmsg: CmsgBuf = unsafe { mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        // SAFETY: control buffer is aligned for cmsghdr and large enough for
        // MAX_PASSED_FDS descriptors; pointers stay valid for the call.
        let rc = unsafe {
            msg.msg_control = cmsg.buf.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(data_len as u32) as _;
            let hdr = libc::CMSG_FIRSTHDR(&msg);
            (*hdr).cmsg_level = libc::SOL_SOCKET;
            (*hdr).cmsg_type = libc::SCM_RIGHTS;
            (*hdr).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            ptr::copy_nonoverlapping(raw.as_ptr().cast::<u8>(), libc::CMSG_DATA(hdr), data_len);
            loop {
                let rc = libc::sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL);
                if rc == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break rc;
            }
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            self.note_disconnect(&err);
            return Err(err);
        }
        Ok(())
    }

    fn recv_fds(&mut self, expected: usize) -> io::Result<Vec<OwnedFd>> {
        let mut escort = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: escort.as_mut_ptr().cast(),
            iov_len: escort.len(),
        };
        let mut cmsg: CmsgBuf = unsafe { mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        // SAFETY: as in send_fds; received descriptors are moved into
        // OwnedFd immediately so they cannot leak on the error paths.
        unsafe {
            msg.msg_control = cmsg.buf.as_mut_ptr().cast();
            msg.msg_controllen = CMSG_BUF_LEN as _;
            let rc = loop {
                let rc = libc::recvmsg(
                    self.stream.as_raw_fd(),
                    &mut msg,
                    libc::MSG_CMSG_CLOEXEC,
                );
                if rc == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break rc;
            };
            if rc == -1 {
                let err = io::Error::last_os_error();
                self.note_disconnect(&err);
                return Err(err);
            }
            if rc == 0 {
                self.terminated = true;
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed while expecting descriptors",
                ));
            }
            if msg.msg_flags & libc::MSG_CTRUNC != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "control message truncated",
                ));
            }
            let hdr = libc::CMSG_FIRSTHDR(&msg);
            if hdr.is_null()
                || (*hdr).cmsg_level != libc::SOL_SOCKET
                || (*hdr).cmsg_type != libc::SCM_RIGHTS
            {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "missing descriptor control message",
                ));
            }
            let data_len = (*hdr).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
            let count = data_len / mem::size_of::<libc::c_int>();
            let mut raw = [-1 as libc::c_int; MAX_PASSED_FDS];
            if count > MAX_PASSED_FDS {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("received {count} descriptors"),
                ));
            }
            ptr::copy_nonoverlapping(
                libc::CMSG_DATA(hdr).cast_const(),
                raw.as_mut_ptr().cast::<u8>(),
                data_len,
            );
            let fds: Vec<OwnedFd> = raw[..count]
                .iter()
                .map(|&fd| OwnedFd::from_raw_fd(fd))
                .collect();
            if fds.len() != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected {expected} descriptors, got {}", fds.len()),
                ));
            }
            Ok(fds)
        }
    }

    fn track<T>(&mut self, res: io::Result<T>) -> io::Result<T> {
        if let Err(err) = &res {
            self.note_disconnect(err);
        }
        res
    }

    fn note_disconnect(&mut self, err: &io::Error) {
        if matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        ) {
            self.terminated = true;
        }
    }
}

impl AsFd for Comms {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Comms {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
