// crates/forkserver/tests/supervisor.rs
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serial_test::serial;

use comms::{Comms, Message, SpawnReply, SpawnRequest};
use forkserver::{
    DISABLE_ENV, GlobalForkClient, HelperHandle, Launcher, StartMode, StartModeSet, StartupError,
    SupervisorError,
};

fn with_env_var<K, V, F, R>(key: K, value: V, f: F) -> R
where
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
    F: FnOnce() -> R,
{
    let key = key.as_ref().to_os_string();
    let prev = std::env::var_os(&key);
    unsafe { std::env::set_var(&key, value) };
    struct Guard {
        key: OsString,
        prev: Option<OsString>,
    }
    impl Drop for Guard {
        fn drop(&mut self) {
            if let Some(val) = &self.prev {
                unsafe { std::env::set_var(&self.key, val) };
            } else {
                unsafe { std::env::remove_var(&self.key) };
            }
        }
    }
    let guard = Guard {
        key: key.clone(),
        prev,
    };
    let result = f();
    drop(guard);
    result
}

/// In-memory launcher: the "helper" is a thread running the real serve
/// loop over the other end of the pair. Handles get fake pids 1000, 1001…
struct CountingLauncher {
    launches: Arc<AtomicUsize>,
}

impl CountingLauncher {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let launches = Arc::new(AtomicUsize::new(0));
        (
            CountingLauncher {
                launches: Arc::clone(&launches),
            },
            launches,
        )
    }
}

impl Launcher for CountingLauncher {
    fn launch(&self) -> Result<HelperHandle, StartupError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        let (sup_end, helper_end) = Comms::pair().map_err(StartupError::ChannelPair)?;
        thread::spawn(move || {
            let _ = forkserver::serve(helper_end);
        });
        Ok(HelperHandle::new(1000 + n as i32, sup_end))
    }
}

/// Launcher whose helper answers exactly one request and then hangs up.
struct OneShotLauncher;

impl Launcher for OneShotLauncher {
    fn launch(&self) -> Result<HelperHandle, StartupError> {
        let (sup_end, mut helper_end) = Comms::pair().map_err(StartupError::ChannelPair)?;
        thread::spawn(move || {
            if let Ok((Message::Spawn(_), _)) = helper_end.recv_message() {
                let reply = Message::Reply(SpawnReply {
                    pid: 7777,
                    init_pid: -1,
                });
                let _ = helper_end.send_message(&reply, &[]);
            }
        });
        Ok(HelperHandle::new(4321, sup_end))
    }
}

fn on_demand() -> StartModeSet {
    StartModeSet::from(StartMode::OnDemand)
}

#[test]
#[serial]
fn concurrent_first_callers_share_one_launch() {
    let (launcher, launches) = CountingLauncher::new();
    let sup = Arc::new(GlobalForkClient::new(on_demand(), launcher));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sup = Arc::clone(&sup);
            thread::spawn(move || {
                sup.ensure_started(true).expect("ensure_started");
                sup.pid().expect("pid")
            })
        })
        .collect();
    let pids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert!(pids.iter().all(|&pid| pid == 1000), "pids: {pids:?}");
}

#[test]
#[serial]
fn never_mode_refuses_to_start() {
    let (launcher, launches) = CountingLauncher::new();
    let sup = GlobalForkClient::new(StartModeSet::EMPTY, launcher);

    let err = sup
        .send_request(&SpawnRequest::default(), None, None, None, None)
        .expect_err("send_request without permission");
    assert!(matches!(err, SupervisorError::NotRunning));
    assert!(matches!(
        sup.pid().expect_err("pid"),
        SupervisorError::NotRunning
    ));
    assert_eq!(launches.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn ensure_started_without_permission_is_passive() {
    let (launcher, launches) = CountingLauncher::new();
    let sup = GlobalForkClient::new(on_demand(), launcher);

    assert!(!sup.ensure_started(false).expect("ensure_started"));
    assert_eq!(launches.load(Ordering::SeqCst), 0);

    assert!(sup.ensure_started(true).expect("ensure_started"));
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn shutdown_starts_a_new_generation() {
    let (launcher, launches) = CountingLauncher::new();
    let sup = GlobalForkClient::new(on_demand(), launcher);

    assert_eq!(sup.pid().expect("pid"), 1000);
    assert_eq!(sup.pid().expect("pid"), 1000);
    sup.shutdown();
    assert_eq!(sup.pid().expect("pid"), 1001);
    assert_eq!(launches.load(Ordering::SeqCst), 2);

    // Shutting down twice is a no-op.
    sup.shutdown();
    sup.shutdown();
    assert_eq!(launches.load(Ordering::SeqCst), 2);
}

#[test]
#[serial]
fn disable_env_blocks_start() {
    with_env_var(DISABLE_ENV, "1", || {
        let (launcher, launches) = CountingLauncher::new();
        let sup = GlobalForkClient::new(on_demand(), launcher);

        assert!(!sup.ensure_started(true).expect("ensure_started"));
        assert!(matches!(
            sup.pid().expect_err("pid"),
            SupervisorError::NotRunning
        ));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    });
}

#[test]
#[serial]
fn disable_env_is_read_fresh_per_attempt() {
    let (launcher, launches) = CountingLauncher::new();
    let sup = GlobalForkClient::new(on_demand(), launcher);

    with_env_var(DISABLE_ENV, "", || {
        assert!(!sup.ensure_started(true).expect("ensure_started"));
    });
    // Variable gone again: the same supervisor may now start.
    assert!(sup.ensure_started(true).expect("ensure_started"));
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn hangup_is_observed_but_not_acted_upon() {
    let sup = GlobalForkClient::new(on_demand(), OneShotLauncher);
    let req = SpawnRequest::default();

    let pid = sup
        .send_request(&req, None, None, None, None)
        .expect("first request");
    assert_eq!(pid, 7777);

    // The helper hung up; forwarding now yields the sentinel, but the
    // handle stays until an explicit shutdown.
    let pid = sup
        .send_request(&req, None, None, None, None)
        .expect("second request");
    assert_eq!(pid, -1);
    assert_eq!(sup.pid().expect("pid"), 4321);

    // A new generation works again.
    sup.shutdown();
    let pid = sup
        .send_request(&req, None, None, None, None)
        .expect("request after restart");
    assert_eq!(pid, 7777);
}
