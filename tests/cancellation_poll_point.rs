//! §8 scenario 5: cancellation honored at an explicit poll point. A task
//! loops indefinitely, checking `poll_cancellation()` once per iteration
//! (its only checkpoint — cancellation is never honored mid-iteration);
//! once another task calls `cancel()` on it, it must unwind within the
//! next iteration and the reaper must observe it reach `Terminate`.

use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corort::{AsyncEvent, Task, ThreadState};

#[test]
fn cancellation_is_observed_at_next_poll_point() {
    let _ = env_logger::builder().is_test(true).try_init();

    let runtime = corort::startup(vec![corort::ClusterConfig {
        name: "cancellation".into(),
        num_processors: 2,
        ..Default::default()
    }]);
    let cluster = runtime.clusters().into_iter().next().unwrap();

    let iterations = Arc::new(AtomicU32::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));

    let target = {
        let iterations = iterations.clone();
        let cancelled = cancelled.clone();
        Task::spawn(&cluster, "cancellable", 0, move || {
            let me = corort::current_task().expect("running under a processor");
            loop {
                if let Some(AsyncEvent::UnwindStack) = me.poll_cancellation() {
                    cancelled.store(true, Ordering::Release);
                    return;
                }
                iterations.fetch_add(1, Ordering::Relaxed);
                corort::yield_now();
            }
        })
    };

    // Let the loop run for a while so it isn't cancelled on its very
    // first checkpoint — this is exercising "cancel while in flight",
    // not "cancel before it ever starts".
    std::thread::sleep(Duration::from_millis(30));
    let before_cancel = iterations.load(Ordering::Relaxed);
    assert!(before_cancel > 0, "task should have made progress before cancellation");

    target.cancel();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while target.state() != ThreadState::Terminate {
        assert!(std::time::Instant::now() < deadline, "cancelled task never terminated");
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(cancelled.load(Ordering::Acquire), "task should have observed UnwindStack");

    corort::finishup();
}
