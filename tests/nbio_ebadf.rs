//! §8 scenario 4: NBIO with a closed fd. Two tasks wait, via the cluster's
//! poller, on distinct pipe read-ends with no timeout. One fd is closed
//! behind the waiting tasks' backs (outside the runtime entirely), which
//! makes the shared `select()` call fail with `EBADF`; per §4.J's
//! failure table every registered waiter — not just the one on the bad
//! fd — is woken with an error, since `select()` doesn't say which fd
//! was at fault.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corort::{Mask, Task, WaitOutcome};

fn pipe_fds() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    (fds[0], fds[1])
}

#[test]
fn closed_fd_wakes_every_waiter_with_bad_fd() {
    let _ = env_logger::builder().is_test(true).try_init();

    let runtime = corort::startup(vec![corort::ClusterConfig {
        name: "nbio-ebadf".into(),
        num_processors: 2,
        ..Default::default()
    }]);
    let cluster = runtime.clusters().into_iter().next().unwrap();

    let (read_a, write_a) = pipe_fds();
    let (read_b, write_b) = pipe_fds();

    let outcomes: Arc<Mutex<Vec<(&'static str, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let cluster = cluster.clone();
        let outcomes = outcomes.clone();
        Task::spawn(&cluster, "waiter-a", 0, move || {
            let outcome = cluster.wait_fd(read_a, Mask::READ, None);
            outcomes
                .lock()
                .unwrap()
                .push(("a", matches!(outcome, WaitOutcome::BadFd)));
        });
    }

    {
        let cluster = cluster.clone();
        let outcomes = outcomes.clone();
        Task::spawn(&cluster, "waiter-b", 0, move || {
            let outcome = cluster.wait_fd(read_b, Mask::READ, None);
            outcomes
                .lock()
                .unwrap()
                .push(("b", matches!(outcome, WaitOutcome::BadFd)));
        });
    }

    // Give both tasks a chance to register with the poller before either
    // fd is yanked out from under it.
    std::thread::sleep(Duration::from_millis(40));

    // Close `read_a` directly, bypassing the runtime entirely — the next
    // `select()` call naming it in its read-fd-set will fail EBADF.
    unsafe {
        libc::close(read_a);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if outcomes.lock().unwrap().len() == 2 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "waiters were never retired");
        std::thread::sleep(Duration::from_millis(5));
    }

    let results = outcomes.lock().unwrap();
    assert!(results.iter().all(|&(_, bad_fd)| bad_fd), "every waiter should observe BadFd: {:?}", *results);

    unsafe {
        libc::close(write_a);
        libc::close(read_b);
        libc::close(write_b);
    }

    corort::finishup();
}
