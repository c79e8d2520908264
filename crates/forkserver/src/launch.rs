// crates/forkserver/src/launch.rs
#![allow(unsafe_code)]

use std::os::fd::AsRawFd;
use std::ptr;

use nix::unistd::{ForkResult, fork};

use comms::{CLIENT_COMMS_FD, Comms};

use crate::client::ForkClient;
use crate::error::StartupError;
use crate::image::HelperImage;

/// One live helper process: its pid, the supervisor end of the channel and
/// the request client bound to it. At most one exists per process, owned by
/// the supervisor; dropping it closes the channel, which the helper
/// observes as shutdown.
pub struct HelperHandle {
    pid: libc::pid_t,
    client: ForkClient,
}

impl HelperHandle {
    pub fn new(pid: libc::pid_t, comms: Comms) -> Self {
        HelperHandle {
            pid,
            client: ForkClient::new(comms),
        }
    }

    /// The pid recorded at launch; never re-queried from the OS.
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn client_mut(&mut self) -> &mut ForkClient {
        &mut self.client
    }

    pub fn is_terminated(&self) -> bool {
        self.client.is_terminated()
    }
}

/// Brings up a helper process. Swappable so tests can substitute an
/// in-memory fake for the real fork/exec path.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<HelperHandle, StartupError>;
}

/// The production launcher: socketpair, fork, exec of the helper image.
pub struct ForkLauncher {
    image: Box<dyn HelperImage>,
}

impl ForkLauncher {
    pub fn new(image: impl HelperImage + 'static) -> Self {
        ForkLauncher {
            image: Box::new(image),
        }
    }
}

impl Launcher for ForkLauncher {
    fn launch(&self) -> Result<HelperHandle, StartupError> {
        let exec_fd = self.image.open_image().map_err(StartupError::Image)?;
        let (parent_end, child_end) = Comms::pair().map_err(StartupError::ChannelPair)?;

        // Everything the child needs is prepared before the fork; between
        // fork and exec only async-signal-safe calls are allowed.
        let argv: [*const libc::c_char; 2] = [c"sandfork-helper".as_ptr(), ptr::null()];
        let envp: [*const libc::c_char; 1] = [ptr::null()];
        let exec_raw = exec_fd.as_raw_fd();
        let child_raw = child_end.as_raw_fd();

        // SAFETY: the child never returns into shared code; it moves its
        // channel end onto the reserved slot and replaces the image, or
        // exits.
        match unsafe { fork() }.map_err(StartupError::Fork)? {
            ForkResult::Child => unsafe {
                if child_raw == CLIENT_COMMS_FD {
                    // Already in the right slot; just clear close-on-exec.
                    libc::fcntl(child_raw, libc::F_SETFD, 0);
                } else if libc::dup2(child_raw, CLIENT_COMMS_FD) == -1 {
                    // dup2 leaves close-on-exec clear on the new slot.
                    libc::_exit(125);
                }
                libc::fexecve(exec_raw, argv.as_ptr(), envp.as_ptr());
                // Only reached when the image replacement failed.
                let msg = b"sandfork: could not launch forkserver binary\n";
                libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
                libc::_exit(126)
            },
            ForkResult::Parent { child } => {
                drop(child_end);
                Ok(HelperHandle::new(child.as_raw(), parent_end))
            }
        }
    }
}
