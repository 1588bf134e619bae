//! §8 scenario 1: producer/consumer via an owner lock plus a condition
//! variable. 1000 pushes of 0..999, 1000 pops; the popped sequence must
//! equal 0..999 in order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corort::lock::OwnerLock;
use corort::{Condition, Task};

const COUNT: u64 = 1000;

#[test]
fn producer_consumer_condition() {
    let _ = env_logger::builder().is_test(true).try_init();

    let runtime = corort::startup(vec![corort::ClusterConfig {
        name: "producer-consumer".into(),
        num_processors: 2,
        ..Default::default()
    }]);
    let cluster = runtime.clusters().into_iter().next().unwrap();

    let owner = Arc::new(OwnerLock::new());
    let not_empty = Arc::new(Condition::new());
    let buf = Arc::new(Mutex::new(VecDeque::<u64>::new()));
    let popped = Arc::new(Mutex::new(Vec::<u64>::new()));
    let done = Arc::new((Mutex::new(0u32), std::sync::Condvar::new()));

    {
        let owner = owner.clone();
        let not_empty = not_empty.clone();
        let buf = buf.clone();
        let done = done.clone();
        Task::spawn(&cluster, "producer", 0, move || {
            for i in 0..COUNT {
                owner.acquire();
                buf.lock().unwrap().push_back(i);
                not_empty.signal();
                owner.release();
            }
            *done.0.lock().unwrap() += 1;
            done.1.notify_all();
        });
    }

    {
        let owner = owner.clone();
        let not_empty = not_empty.clone();
        let buf = buf.clone();
        let popped = popped.clone();
        let done = done.clone();
        Task::spawn(&cluster, "consumer", 0, move || {
            for _ in 0..COUNT {
                owner.acquire();
                while buf.lock().unwrap().is_empty() {
                    not_empty.wait(&owner).expect("condition not destroyed");
                }
                let value = buf.lock().unwrap().pop_front().unwrap();
                owner.release();
                popped.lock().unwrap().push(value);
            }
            *done.0.lock().unwrap() += 1;
            done.1.notify_all();
        });
    }

    let (lock, cvar) = &*done;
    let mut finished = lock.lock().unwrap();
    while *finished < 2 {
        let (guard, timeout) = cvar.wait_timeout(finished, Duration::from_secs(10)).unwrap();
        finished = guard;
        assert!(!timeout.timed_out(), "producer/consumer did not finish in time");
    }

    let result = popped.lock().unwrap();
    let expected: Vec<u64> = (0..COUNT).collect();
    assert_eq!(*result, expected);

    corort::finishup();
}
