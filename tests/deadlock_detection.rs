//! §8 scenario 6: deadlock detection (uniprocessor). Two tasks wait on
//! each other's semaphore with no pending timer or NBIO event to ever
//! wake either of them; with only the uniprocessor idle branch active
//! (the `multiprocessor` feature disabled), the sole processor's idle
//! step must recognize this is unrecoverable and abort with a
//! diagnostic rather than spin forever.
//!
//! Only meaningful in a uniprocessor build (`cargo test --no-default-features`);
//! the multiprocessor idle branch never runs `is_globally_deadlocked`.

#![cfg(not(feature = "multiprocessor"))]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corort::{Semaphore, Task};

#[test]
fn mutual_wait_with_no_pending_event_aborts() {
    let _ = env_logger::builder().is_test(true).try_init();

    let deadlock_detected = Arc::new(AtomicBool::new(false));
    let flag = deadlock_detected.clone();
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if info.to_string().contains("deadlock") {
            flag.store(true, Ordering::Release);
        }
        previous_hook(info);
    }));

    let runtime = corort::startup(vec![corort::ClusterConfig {
        name: "deadlock".into(),
        num_processors: 1,
        ..Default::default()
    }]);
    let cluster = runtime.clusters().into_iter().next().unwrap();

    // Never signaled by anyone: waiting on either one blocks forever.
    let sem_a = Arc::new(Semaphore::new(0));
    let sem_b = Arc::new(Semaphore::new(0));

    {
        let sem_b = sem_b.clone();
        Task::spawn(&cluster, "waits-on-b", 0, move || {
            sem_b.wait();
        });
    }
    {
        let sem_a = sem_a.clone();
        Task::spawn(&cluster, "waits-on-a", 0, move || {
            sem_a.wait();
        });
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !deadlock_detected.load(Ordering::Acquire) {
        assert!(std::time::Instant::now() < deadline, "deadlock was never detected");
        std::thread::sleep(Duration::from_millis(5));
    }

    // The sole processor's KT has already panicked and unwound off its
    // own stack by this point; not calling `finishup()` here; the
    // cluster is in a deliberately unrecoverable state and the process
    // is about to exit anyway.
}
