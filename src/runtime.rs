//! Global runtime state (§9 "Global mutable state").
//!
//! Mirrors `constance_port_std::State`: a single process-wide handle built
//! once in [`startup`] and torn down in [`finishup`], rather than scattering
//! `static`s across modules. The cluster list, processor list, the boot
//! task, and the system processor all live here; every other module reaches
//! them through `Runtime::global()` instead of keeping its own statics.

use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::cluster::{Cluster, ClusterConfig};
use crate::processor::ProcessorId;
use crate::task::Task;
use crate::timer::EventList;

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// The process-wide singleton (§9). Constructed once by [`startup`].
pub struct Runtime {
    clusters: Mutex<Vec<Arc<Cluster>>>,
    /// Owned by the system processor (§5 "Shared resources"): other
    /// processors post timed events here under the list's own spin lock
    /// and signal the system processor's KT via `SIGUSR1`/`SIGALRM`.
    pub(crate) events: EventList,
    /// The KT that owns `SIGALRM` and the preemption tick for uniprocessor
    /// deadlock/NBIO fallback (§4.I step 4).
    system_processor: Mutex<Option<ProcessorId>>,
    boot_task: Mutex<Option<Arc<Task>>>,
    #[cfg(feature = "stats")]
    pub(crate) stats: crate::stats::Stats,
}

impl Runtime {
    pub fn global() -> &'static Runtime {
        RUNTIME.get().expect("runtime not started; call startup() first")
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters.lock().unwrap().clone()
    }

    pub(crate) fn register_cluster(&self, cluster: Arc<Cluster>) {
        self.clusters.lock().unwrap().push(cluster);
    }

    pub fn system_processor(&self) -> Option<ProcessorId> {
        *self.system_processor.lock().unwrap()
    }

    pub(crate) fn set_system_processor(&self, id: ProcessorId) {
        let mut slot = self.system_processor.lock().unwrap();
        if slot.is_none() {
            *slot = Some(id);
        }
    }

    pub fn boot_task(&self) -> Option<Arc<Task>> {
        self.boot_task.lock().unwrap().clone()
    }

    /// Records `task` as the boot task the first time this is called;
    /// later calls are no-ops, mirroring [`Runtime::set_system_processor`]
    /// (only the first task spawned process-wide counts as the boot
    /// task, §9 "Global mutable state").
    pub(crate) fn set_boot_task(&self, task: Arc<Task>) {
        let mut slot = self.boot_task.lock().unwrap();
        if slot.is_none() {
            *slot = Some(task);
        }
    }

    /// §8 "Deadlock detection (uniprocessor)": no cluster has ready work, no
    /// processor is inside a poller `select`, and the event list is empty.
    /// Called by the uniprocessor scheduling branch before it would
    /// otherwise spin forever.
    pub(crate) fn is_globally_deadlocked(&self) -> bool {
        let clusters = self.clusters();
        let all_empty = clusters.iter().all(|c| c.ready_queue_is_empty() && !c.has_viable_poller());
        all_empty && self.events.is_empty()
    }
}

/// Build the singleton `Runtime` and register `clusters`. Must be called
/// exactly once, before any processor is started. Mirrors the teacher's
/// `use_port!`-generated `State::new`, minus the const-context plumbing a
/// hosted runtime has no need for.
pub fn startup(cluster_configs: Vec<ClusterConfig>) -> &'static Runtime {
    let runtime = Runtime {
        clusters: Mutex::new(Vec::new()),
        events: EventList::new(),
        system_processor: Mutex::new(None),
        boot_task: Mutex::new(None),
        #[cfg(feature = "stats")]
        stats: crate::stats::Stats::default(),
    };
    RUNTIME.set(runtime).unwrap_or_else(|_| panic!("startup() called twice"));
    let runtime = Runtime::global();
    for cfg in cluster_configs {
        runtime.register_cluster(Cluster::new(cfg));
    }
    log::debug!("runtime started with {} cluster(s)", runtime.clusters().len());
    runtime
}

/// Tear down the runtime: join every processor's KT and drop the
/// clusters. Intended for tests; a production `main` typically just lets
/// the process exit via `_exit` per §6 "Process exit".
pub fn finishup() {
    let runtime = Runtime::global();
    for cluster in runtime.clusters() {
        cluster.shutdown();
    }
    log::debug!("runtime shut down");
}
