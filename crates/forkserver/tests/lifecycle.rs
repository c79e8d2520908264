// crates/forkserver/tests/lifecycle.rs
//
// End-to-end lifecycle against the real helper binary.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use comms::SpawnRequest;
use forkserver::{ForkLauncher, GlobalForkClient, HelperImage, StartMode, StartModeSet};

struct TestImage;

impl HelperImage for TestImage {
    fn open_image(&self) -> io::Result<OwnedFd> {
        let file = File::open(env!("CARGO_BIN_EXE_sandfork-helper"))?;
        Ok(file.into())
    }
}

fn supervisor() -> GlobalForkClient {
    GlobalForkClient::new(
        StartModeSet::from(StartMode::OnDemand),
        ForkLauncher::new(TestImage),
    )
}

fn probe(sup: &GlobalForkClient) -> i32 {
    sup.send_request(&SpawnRequest::default(), None, None, None, None)
        .expect("send_request")
}

#[test]
fn on_demand_start_and_restart() {
    let sup = supervisor();

    let pid = probe(&sup);
    assert!(pid > 0);
    assert_eq!(sup.pid().expect("pid"), pid);
    // Idempotent while populated.
    assert_eq!(sup.pid().expect("pid"), pid);

    sup.shutdown();
    let pid2 = probe(&sup);
    assert!(pid2 > 0);
    assert_ne!(pid2, pid, "shutdown must yield a fresh helper");
    sup.shutdown();
}

#[test]
fn spawns_a_real_child() {
    let sup = supervisor();
    let exec = File::open("/bin/true").expect("open /bin/true");

    let pid = sup
        .send_request(
            &SpawnRequest::new(["true"]),
            Some(exec.as_fd()),
            None,
            None,
            None,
        )
        .expect("send_request");
    assert!(pid > 0);
    assert_ne!(pid, sup.pid().expect("pid"));

    // The child is the helper's to reap; it should be gone shortly.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Path::new(&format!("/proc/{pid}")).exists() {
        assert!(Instant::now() < deadline, "spawned child did not exit");
        sleep(Duration::from_millis(10));
    }
    sup.shutdown();
}

#[test]
fn reports_intermediate_pid_when_asked() {
    let sup = supervisor();
    let exec = File::open("/bin/true").expect("open /bin/true");

    let mut init_pid = -1;
    let pid = sup
        .send_request(
            &SpawnRequest::new(["true"]),
            Some(exec.as_fd()),
            None,
            None,
            Some(&mut init_pid),
        )
        .expect("send_request");
    assert!(pid > 0);
    assert!(init_pid > 0);
    assert_ne!(pid, init_pid);
    sup.shutdown();
}

#[test]
fn killed_helper_is_observed_not_replaced() {
    let sup = supervisor();
    let helper_pid = sup.pid().expect("pid");
    assert!(helper_pid > 0);

    kill(Pid::from_raw(helper_pid), Signal::SIGKILL).expect("kill helper");
    sleep(Duration::from_millis(100));

    // Forwarding fails with the sentinel and is logged, but the stale
    // handle stays in place until an explicit shutdown.
    let pid = probe(&sup);
    assert_eq!(pid, -1);
    assert_eq!(sup.pid().expect("pid"), helper_pid);

    sup.shutdown();
    let fresh = probe(&sup);
    assert!(fresh > 0);
    assert_ne!(fresh, helper_pid);
    sup.shutdown();
}
