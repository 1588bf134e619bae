//! §8 scenario 3: priority inheritance. Low-priority task L takes an
//! owner lock; high-priority task H blocks on it, bumping L's active
//! priority above medium-priority task M; L must therefore finish (and
//! release the lock) before M, even though M outranks L's own base
//! priority. H then runs (it outranks M) before M finally runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corort::lock::OwnerLock;
use corort::Task;

const LOW: i32 = 0;
const MEDIUM: i32 = 5;
const HIGH: i32 = 10;

#[test]
fn priority_inheritance_orders_low_before_medium() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Single processor, priority-ordered ready queue, no preemption: the
    // running task only ever yields voluntarily, so the ready queue's
    // priority order is the only thing deciding who runs next.
    let runtime = corort::startup(vec![corort::ClusterConfig {
        name: "priority-inheritance".into(),
        num_processors: 1,
        prioritized: true,
        ..Default::default()
    }]);
    let cluster = runtime.clusters().into_iter().next().unwrap();

    let owner = Arc::new(OwnerLock::new());
    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let l_holds_lock = Arc::new(AtomicBool::new(false));
    let release_l = Arc::new(AtomicBool::new(false));

    {
        let owner = owner.clone();
        let order = order.clone();
        let l_holds_lock = l_holds_lock.clone();
        let release_l = release_l.clone();
        Task::spawn(&cluster, "low", LOW, move || {
            owner.acquire();
            l_holds_lock.store(true, Ordering::Release);
            // Busy-wait for the go-ahead, yielding each iteration so the
            // scheduler gets to pick whoever is highest-priority-ready.
            // While H is blocked on `owner`, L's inherited priority (10)
            // keeps L winning over M's base priority (5) every time.
            while !release_l.load(Ordering::Acquire) {
                corort::yield_now();
            }
            order.lock().unwrap().push("low");
            owner.release();
        });
    }

    // Wait (from a real OS thread, outside the runtime) until L has
    // actually taken the lock before spawning H, so H's `acquire()` is
    // guaranteed to observe contention rather than racing L for it.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !l_holds_lock.load(Ordering::Acquire) {
        assert!(std::time::Instant::now() < deadline, "L never acquired the lock");
        std::thread::sleep(Duration::from_millis(1));
    }

    {
        let owner = owner.clone();
        let order = order.clone();
        Task::spawn(&cluster, "high", HIGH, move || {
            owner.acquire();
            order.lock().unwrap().push("high");
            owner.release();
        });
    }

    {
        let order = order.clone();
        Task::spawn(&cluster, "medium", MEDIUM, move || {
            order.lock().unwrap().push("medium");
        });
    }

    // Give H a moment to register its blocked acquire (and bump L's
    // priority) before telling L to finish up.
    std::thread::sleep(Duration::from_millis(40));
    release_l.store(true, Ordering::Release);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if order.lock().unwrap().len() == 3 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "scenario did not complete in time");
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(*order.lock().unwrap(), vec!["low", "high", "medium"]);

    corort::finishup();
}
