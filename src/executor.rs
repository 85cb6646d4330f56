//! The process-wide scheduler: resource-class thread pools and strands.
//!
//! Work is partitioned by resource class, each class backed by its own
//! small tokio runtime. A [`Strand`] is a serial execution region on top
//! of one class: tasks posted to the same strand never run concurrently,
//! while different strands proceed in parallel.
//!
//! Every posted task is counted against a master work counter;
//! [`Scheduler::wait_for_finish`] blocks until the counter reaches zero.
//! Tasks themselves never block on the scheduler — they run to
//! completion and schedule continuations by posting.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{format_err, Error};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The resource classes work is partitioned into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Cpu,
    Disk,
    UplinkNetwork,
    DownlinkNetwork,
    StateMachine,
    UserInterface,
}

const ALL_CLASSES: [ResourceClass; 6] = [
    ResourceClass::Cpu,
    ResourceClass::Disk,
    ResourceClass::UplinkNetwork,
    ResourceClass::DownlinkNetwork,
    ResourceClass::StateMachine,
    ResourceClass::UserInterface,
];

impl ResourceClass {
    fn index(self) -> usize {
        match self {
            ResourceClass::Cpu => 0,
            ResourceClass::Disk => 1,
            ResourceClass::UplinkNetwork => 2,
            ResourceClass::DownlinkNetwork => 3,
            ResourceClass::StateMachine => 4,
            ResourceClass::UserInterface => 5,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ResourceClass::Cpu => "cpu",
            ResourceClass::Disk => "disk",
            ResourceClass::UplinkNetwork => "uplink",
            ResourceClass::DownlinkNetwork => "downlink",
            ResourceClass::StateMachine => "statemachine",
            ResourceClass::UserInterface => "ui",
        }
    }
}

/// Master counter of outstanding tasks. Incremented when a task is
/// posted, decremented when it completes.
pub struct WorkTracker {
    outstanding: Mutex<u64>,
    finished: Condvar,
}

impl WorkTracker {
    fn new() -> Self {
        Self {
            outstanding: Mutex::new(0),
            finished: Condvar::new(),
        }
    }

    fn add(&self) {
        *self.outstanding.lock().unwrap() += 1;
    }

    fn complete(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        debug_assert!(*outstanding > 0);
        *outstanding -= 1;
        if *outstanding == 0 {
            self.finished.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        while *outstanding > 0 {
            outstanding = self.finished.wait(outstanding).unwrap();
        }
    }
}

pub const DEFAULT_WORKERS_PER_CLASS: usize = 2;

pub struct Scheduler {
    runtimes: Vec<Runtime>,
    tracker: Arc<WorkTracker>,
}

impl Scheduler {
    pub fn new() -> Result<Arc<Self>, Error> {
        Self::with_workers(DEFAULT_WORKERS_PER_CLASS)
    }

    pub fn with_workers(workers_per_class: usize) -> Result<Arc<Self>, Error> {
        let mut runtimes = Vec::with_capacity(ALL_CLASSES.len());
        for class in ALL_CLASSES {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers_per_class)
                .thread_name(format!("pex-{}", class.name()))
                .enable_all()
                .build()
                .map_err(|err| format_err!("unable to build {} runtime - {}", class.name(), err))?;
            runtimes.push(runtime);
        }
        Ok(Arc::new(Self {
            runtimes,
            tracker: Arc::new(WorkTracker::new()),
        }))
    }

    /// Post a task onto some worker of the given class.
    pub fn post<F>(&self, class: ResourceClass, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.add();
        let tracker = Arc::clone(&self.tracker);
        self.runtimes[class.index()].spawn(async move {
            task.await;
            tracker.complete();
        });
    }

    /// Run a closure on the given class and await its result. Disk- and
    /// CPU-bound work hops classes through this; the closure may block
    /// one of the class's worker threads.
    pub async fn run<T, F>(&self, class: ResourceClass, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(class, async move {
            let _ = tx.send(f());
        });
        rx.await
            .map_err(|_| format_err!("{} task dropped before completing", class.name()))
    }

    /// Obtain a new strand bound to the given class.
    pub fn new_strand(&self, class: ResourceClass) -> Strand {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let tracker = Arc::clone(&self.tracker);
        self.runtimes[class.index()].spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
                tracker.complete();
            }
        });
        Strand {
            tx,
            tracker: Arc::clone(&self.tracker),
        }
    }

    /// Block until no tasks are queued or running on any class.
    pub fn wait_for_finish(&self) {
        self.tracker.wait_zero();
    }

    /// Tear the worker pools down without waiting for the strand driver
    /// loops (which run until their senders drop).
    pub fn shutdown(self: Arc<Self>) {
        if let Ok(scheduler) = Arc::try_unwrap(self) {
            for runtime in scheduler.runtimes {
                runtime.shutdown_background();
            }
        }
    }
}

/// A serial execution region. Tasks posted to the same strand run one at
/// a time, in posting order, on the strand's resource class.
#[derive(Clone)]
pub struct Strand {
    tx: mpsc::UnboundedSender<Task>,
    tracker: Arc<WorkTracker>,
}

impl Strand {
    /// Post a task; it runs after all previously posted tasks finish.
    pub fn post<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.add();
        if self.tx.send(Box::pin(task)).is_err() {
            // Driver is gone; account for the task we will never run.
            self.tracker.complete();
            log::error!("strand driver terminated; dropping posted task");
        }
    }

    /// Run a closure serially on the strand and await its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(async move {
            let _ = tx.send(f());
        });
        rx.await
            .map_err(|_| format_err!("strand task dropped before completing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_for_finish_sees_posted_chains() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&counter);
        let chained = Arc::clone(&scheduler);
        scheduler.post(ResourceClass::Cpu, async move {
            inner.fetch_add(1, Ordering::SeqCst);
            let inner2 = Arc::clone(&inner);
            chained.post(ResourceClass::Disk, async move {
                inner2.fetch_add(1, Ordering::SeqCst);
            });
        });

        scheduler.wait_for_finish();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn strand_tasks_are_serial() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let strand = scheduler.new_strand(ResourceClass::StateMachine);

        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let total = Arc::clone(&total);
            strand.post(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_micros(100));
                active.fetch_sub(1, Ordering::SeqCst);
                total.fetch_add(1, Ordering::SeqCst);
            });
        }

        scheduler.wait_for_finish();
        assert_eq!(total.load(Ordering::SeqCst), 50);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_returns_closure_result() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let doubled = {
            let scheduler = Arc::clone(&scheduler);
            let handle = std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                runtime.block_on(scheduler.run(ResourceClass::Cpu, || 21 * 2))
            });
            handle.join().unwrap().unwrap()
        };
        assert_eq!(doubled, 42);
    }
}
