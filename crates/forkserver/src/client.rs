// crates/forkserver/src/client.rs
use std::os::fd::BorrowedFd;

use comms::{Comms, FD_COMMS, FD_EXEC, FD_USER_NS, Message, SpawnPayload, SpawnRequest};

/// Request side of the fork-server protocol.
///
/// A failed exchange yields the `-1` sentinel rather than an error: a gone
/// helper is observed via [`ForkClient::is_terminated`], not acted upon.
pub struct ForkClient {
    comms: Comms,
}

impl ForkClient {
    pub fn new(comms: Comms) -> Self {
        ForkClient { comms }
    }

    pub fn is_terminated(&self) -> bool {
        self.comms.is_terminated()
    }

    /// Forward a spawn request. The descriptors are borrowed for the
    /// duration of the call only; `init_pid` receives the intermediate
    /// process id when one was requested and created.
    pub fn send_request(
        &mut self,
        request: &SpawnRequest,
        exec_fd: Option<BorrowedFd<'_>>,
        comms_fd: Option<BorrowedFd<'_>>,
        user_ns_fd: Option<BorrowedFd<'_>>,
        init_pid: Option<&mut libc::pid_t>,
    ) -> libc::pid_t {
        let mut fd_mask = 0u8;
        let mut fds = Vec::with_capacity(3);
        if let Some(fd) = exec_fd {
            fd_mask |= FD_EXEC;
            fds.push(fd);
        }
        if let Some(fd) = comms_fd {
            fd_mask |= FD_COMMS;
            fds.push(fd);
        }
        if let Some(fd) = user_ns_fd {
            fd_mask |= FD_USER_NS;
            fds.push(fd);
        }
        let msg = Message::Spawn(SpawnPayload {
            request: request.clone(),
            fd_mask,
            want_init: init_pid.is_some(),
        });
        if let Err(err) = self.comms.send_message(&msg, &fds) {
            tracing::error!(?err, "sending spawn request failed");
            return -1;
        }
        let reply = match self.comms.recv_message() {
            Ok((Message::Reply(reply), _)) => reply,
            Ok((other, _)) => {
                tracing::error!(?other, "unexpected answer to spawn request");
                return -1;
            }
            Err(err) => {
                tracing::error!(?err, "receiving spawn reply failed");
                return -1;
            }
        };
        if let Some(out) = init_pid {
            *out = reply.init_pid;
        }
        reply.pid
    }
}
