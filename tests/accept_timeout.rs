//! §8 scenario 2: accept-with-timeout. Task A enters a monitor's "session"
//! member, then runs `_Accept(poke)` with a 10ms timeout; no caller
//! arrives, so the timeout branch fires and A continues. A subsequent
//! `poke()` call from task B is then serviced normally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corort::Serial;
use corort::Task;

// Bits 0 (timeout) and 1 (destructor) are reserved by the serial itself
// (§4.G). User-defined members start at bit 2.
const BIT_SESSION: u32 = 2;
const BIT_POKE: u32 = 3;

#[test]
fn accept_with_timeout_then_normal_call() {
    let _ = env_logger::builder().is_test(true).try_init();

    let runtime = corort::startup(vec![corort::ClusterConfig {
        name: "accept-timeout".into(),
        num_processors: 2,
        ..Default::default()
    }]);
    let cluster = runtime.clusters().into_iter().next().unwrap();

    let monitor = Serial::new();
    let timed_out = Arc::new(AtomicBool::new(false));
    let a_done = Arc::new(AtomicBool::new(false));
    let poke_serviced = Arc::new(AtomicBool::new(false));

    {
        let monitor = monitor.clone();
        let timed_out = timed_out.clone();
        let a_done = a_done.clone();
        Task::spawn(&cluster, "task-a", 0, move || {
            monitor.enter(BIT_SESSION).expect("monitor is alive");
            let accepted = monitor
                .accept(&[BIT_POKE], Some(Duration::from_millis(10)), false)
                .expect("monitor is alive");
            // Bit 0 is the reserved timeout member.
            timed_out.store(accepted == Some(0), Ordering::Release);
            monitor.leave();
            a_done.store(true, Ordering::Release);
        });
    }

    // Give A a head start so its `accept` call is actually blocked (no
    // caller pending) before B ever tries to poke it.
    std::thread::sleep(Duration::from_millis(40));
    assert!(timed_out.load(Ordering::Acquire), "accept should have timed out");
    assert!(a_done.load(Ordering::Acquire), "task A should have continued past the timeout");

    {
        let monitor = monitor.clone();
        let poke_serviced = poke_serviced.clone();
        Task::spawn(&cluster, "task-b", 0, move || {
            monitor.enter(BIT_POKE).expect("poke should be serviced normally");
            poke_serviced.store(true, Ordering::Release);
            monitor.leave();
        });
    }

    std::thread::sleep(Duration::from_millis(40));
    assert!(poke_serviced.load(Ordering::Acquire), "B's poke() should be serviced after A's timeout");

    corort::finishup();
}
