// crates/forkserver/src/serve.rs
#![allow(unsafe_code)]

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use nix::fcntl::OFlag;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, fork, getpid, pipe2};

use comms::{
    CLIENT_COMMS_FD, Comms, FD_COMMS, FD_EXEC, FD_USER_NS, Message, SpawnPayload, SpawnReply,
};

/// Helper side of the protocol: serve spawn requests until the supervisor
/// closes the channel, then return.
pub fn serve(mut comms: Comms) -> io::Result<()> {
    // Children are reaped by the kernel; replies must not block on
    // collecting them.
    // SAFETY: replacing the disposition with SIG_IGN races with nothing.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.map_err(io::Error::from)?;
    loop {
        let (msg, fds) = match comms.recv_message() {
            Ok(v) => v,
            Err(_) if comms.is_terminated() => {
                tracing::debug!("supervisor closed the channel");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let Message::Spawn(payload) = msg else {
            tracing::warn!("ignoring non-request message");
            continue;
        };
        let reply = handle_request(&payload, &fds);
        if let Err(err) = comms.send_message(&Message::Reply(reply), &[]) {
            if comms.is_terminated() {
                tracing::debug!("supervisor went away before the reply");
                return Ok(());
            }
            return Err(err);
        }
    }
}

fn handle_request(payload: &SpawnPayload, fds: &[OwnedFd]) -> SpawnReply {
    let mut it = fds.iter();
    let mut take = |bit: u8| {
        if payload.fd_mask & bit != 0 {
            it.next().map(|fd| fd.as_raw_fd())
        } else {
            None
        }
    };
    let exec_fd = take(FD_EXEC);
    let comms_fd = take(FD_COMMS);
    let user_ns_fd = take(FD_USER_NS);

    let Some(exec_fd) = exec_fd else {
        // Nothing to execute: answer as a liveness probe.
        return SpawnReply {
            pid: getpid().as_raw(),
            init_pid: -1,
        };
    };
    match spawn_child(payload, exec_fd, comms_fd, user_ns_fd) {
        Ok((pid, init_pid)) => SpawnReply { pid, init_pid },
        Err(err) => {
            tracing::error!(?err, "spawn failed");
            SpawnReply {
                pid: -1,
                init_pid: -1,
            }
        }
    }
}

fn c_strings(strs: &[OsString]) -> io::Result<Vec<CString>> {
    strs.iter()
        .map(|s| {
            CString::new(s.as_bytes())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL"))
        })
        .collect()
}

fn spawn_child(
    payload: &SpawnPayload,
    exec_fd: RawFd,
    comms_fd: Option<RawFd>,
    user_ns_fd: Option<RawFd>,
) -> io::Result<(libc::pid_t, libc::pid_t)> {
    let argv_c = c_strings(&payload.request.args)?;
    if argv_c.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
    }
    let envp_c = c_strings(&payload.request.envs)?;

    // Pointer tables are built before the fork; the child only reads them.
    let mut argv: Vec<*const libc::c_char> = argv_c.iter().map(|s| s.as_ptr()).collect();
    argv.push(ptr::null());
    let mut envp: Vec<*const libc::c_char> = envp_c.iter().map(|s| s.as_ptr()).collect();
    envp.push(ptr::null());

    if payload.want_init {
        spawn_with_init(exec_fd, comms_fd, user_ns_fd, &argv, &envp)
    } else {
        // SAFETY: the child path only performs async-signal-safe calls and
        // never returns.
        match unsafe { fork() }.map_err(io::Error::from)? {
            ForkResult::Child => unsafe { exec_child(exec_fd, comms_fd, user_ns_fd, &argv, &envp) },
            ForkResult::Parent { child } => Ok((child.as_raw(), -1)),
        }
    }
}

/// Spawn behind an intermediate process that parents the real child,
/// reports its pid over a pipe and reaps it.
fn spawn_with_init(
    exec_fd: RawFd,
    comms_fd: Option<RawFd>,
    user_ns_fd: Option<RawFd>,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> io::Result<(libc::pid_t, libc::pid_t)> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    // SAFETY: as in spawn_child; the intermediate additionally forks and
    // waits, both async-signal-safe.
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Child => {
            let write_raw = write_end.as_raw_fd();
            unsafe {
                if let Some(ns) = user_ns_fd {
                    if libc::setns(ns, libc::CLONE_NEWUSER) == -1 {
                        libc::_exit(124);
                    }
                }
                match libc::fork() {
                    -1 => libc::_exit(123),
                    0 => exec_child(exec_fd, comms_fd, None, argv, envp),
                    pid => {
                        let bytes = pid.to_be_bytes();
                        libc::write(write_raw, bytes.as_ptr().cast(), bytes.len());
                        // SIGCHLD is ignored, so this blocks until the
                        // child is gone and then fails with ECHILD.
                        let mut status = 0;
                        while libc::waitpid(pid, &mut status, 0) == -1
                            && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
                        {}
                        libc::_exit(0)
                    }
                }
            }
        }
        ForkResult::Parent { child } => {
            drop(write_end);
            let mut pipe = File::from(read_end);
            let mut buf = [0u8; 4];
            pipe.read_exact(&mut buf)?;
            Ok((i32::from_be_bytes(buf), child.as_raw()))
        }
    }
}

/// # Safety
/// Must run in a freshly forked child. Performs raw descriptor and
/// namespace calls on descriptors prepared by the parent, then replaces
/// the image or exits; it never returns into shared code.
unsafe fn exec_child(
    exec_fd: RawFd,
    comms_fd: Option<RawFd>,
    user_ns_fd: Option<RawFd>,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    unsafe {
        if let Some(ns) = user_ns_fd {
            if libc::setns(ns, libc::CLONE_NEWUSER) == -1 {
                libc::_exit(124);
            }
        }
        if let Some(fd) = comms_fd {
            if fd == CLIENT_COMMS_FD {
                libc::fcntl(fd, libc::F_SETFD, 0);
            } else if libc::dup2(fd, CLIENT_COMMS_FD) == -1 {
                libc::_exit(125);
            }
        }
        libc::fexecve(exec_fd, argv.as_ptr(), envp.as_ptr());
        libc::_exit(126)
    }
}
