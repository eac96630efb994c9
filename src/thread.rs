use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

/// Soft deadline: the worker is asked to stop cooperatively.
pub const SOFT_TIMEOUT_MS: u64 = 3000;
/// Hard deadline: the whole child process exits with status 1.
pub const HARD_TIMEOUT_MS: u64 = 5000;

/// Requested stack for the execution thread. Small enough that runaway guest
/// recursion faults quickly; the platform may round it up to its minimum.
pub const WORKER_STACK_BYTES: usize = 32 * 1024;

/// The body a worker runs. Implemented by the JIT harness; tests use
/// lightweight stand-ins.
pub trait GuestTask: Send + Sync {
    /// Runs to completion and reports 0 for a normal return, 1 for a halt.
    fn run(&self, tid: u64) -> i32;

    /// Asks the running guest to stop at its next host call.
    fn request_halt(&self) {}

    /// Clones the task for a guest-created thread starting at `entry`.
    fn fork_at(&self, _entry: usize) -> Option<Arc<dyn GuestTask>> {
        None
    }

    /// Guest memory window for host-side file transfers.
    fn memory_window(&self) -> Option<(*mut u8, usize)> {
        None
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_WORKER: Cell<u64> = const { Cell::new(0) };
}

fn registry() -> &'static Mutex<HashMap<u64, Arc<Worker>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<Worker>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One guest thread: a watcher on a normal stack enforcing the two-phase
/// deadline, and an execution thread with a bounded stack running the task.
/// Registered for the whole span between spawn and watcher exit.
pub struct Worker {
    id: u64,
    should_stop: AtomicBool,
    task: Arc<dyn GuestTask>,
    watcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(task: Arc<dyn GuestTask>) -> io::Result<Arc<Worker>> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(Worker {
            id,
            should_stop: AtomicBool::new(false),
            task,
            watcher: Mutex::new(None),
        });

        registry()
            .lock()
            .expect("thread registry lock poisoned")
            .insert(id, worker.clone());

        let watched = worker.clone();
        let handle = thread::Builder::new()
            .name(format!("evm2-watch-{id}"))
            .spawn(move || watch(watched));
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                registry()
                    .lock()
                    .expect("thread registry lock poisoned")
                    .remove(&id);
                return Err(err);
            }
        };
        *worker.watcher.lock().expect("worker handle lock poisoned") = Some(handle);
        Ok(worker)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task(&self) -> &Arc<dyn GuestTask> {
        &self.task
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    /// Blocks until the worker has fully exited. Safe to call once; later
    /// calls and calls after exit return immediately.
    pub fn join(&self) {
        let handle = self
            .watcher
            .lock()
            .expect("worker handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn get(tid: u64) -> Option<Arc<Worker>> {
        registry()
            .lock()
            .expect("thread registry lock poisoned")
            .get(&tid)
            .cloned()
    }

    /// The worker the calling thread belongs to, if any.
    pub fn current() -> Option<Arc<Worker>> {
        let id = CURRENT_WORKER.get();
        if id == 0 { None } else { Self::get(id) }
    }
}

fn watch(worker: Arc<Worker>) {
    let id = worker.id;
    debug!("worker {id} starting");

    let (tx, rx) = mpsc::channel();
    let task = worker.task.clone();
    let exec = thread::Builder::new()
        .name(format!("evm2-{id}"))
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || {
            CURRENT_WORKER.set(id);
            crate::sandbox::install_signal_stack();
            let status = task.run(id);
            let _ = tx.send(status);
        });
    let exec = match exec {
        Ok(handle) => handle,
        Err(err) => {
            warn!("worker {id} failed to start: {err}");
            registry()
                .lock()
                .expect("thread registry lock poisoned")
                .remove(&id);
            return;
        }
    };

    match rx.recv_timeout(Duration::from_millis(SOFT_TIMEOUT_MS)) {
        Ok(status) => report(id, status),
        Err(RecvTimeoutError::Timeout) => {
            debug!("worker {id} soft deadline expired, requesting stop");
            worker.request_stop();
            match rx.recv_timeout(Duration::from_millis(HARD_TIMEOUT_MS - SOFT_TIMEOUT_MS)) {
                Ok(status) => report(id, status),
                Err(RecvTimeoutError::Timeout) => {
                    eprintln!("worker {id} not responding, terminating");
                    std::process::exit(1);
                }
                Err(RecvTimeoutError::Disconnected) => {}
            }
        }
        Err(RecvTimeoutError::Disconnected) => {}
    }

    let _ = exec.join();
    registry()
        .lock()
        .expect("thread registry lock poisoned")
        .remove(&id);
    debug!("worker {id} exited");
}

fn report(id: u64, status: i32) {
    if status == 1 {
        debug!("worker {id} halted");
    } else {
        debug!("worker {id} completed normally");
    }
}

/// A guest-visible lock. Lock and unlock arrive as independent host calls,
/// so the state is an explicit flag under a condvar rather than a held
/// MutexGuard.
struct NamedLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl NamedLock {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut held = self.held.lock().expect("guest lock poisoned");
        while *held {
            held = self.released.wait(held).expect("guest lock poisoned");
        }
        *held = true;
    }

    fn release(&self) {
        *self.held.lock().expect("guest lock poisoned") = false;
        self.released.notify_one();
    }
}

fn lock_table() -> &'static Mutex<HashMap<u64, Arc<NamedLock>>> {
    static LOCKS: OnceLock<Mutex<HashMap<u64, Arc<NamedLock>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Blocks until the lock with this id is available, creating it on first
/// use.
pub fn lock_object(id: u64) {
    let lock = lock_table()
        .lock()
        .expect("lock table poisoned")
        .entry(id)
        .or_insert_with(|| Arc::new(NamedLock::new()))
        .clone();
    lock.acquire();
}

/// Releases the lock with this id. Unknown ids are a warning, not a fault.
pub fn unlock_object(id: u64) {
    let lock = lock_table()
        .lock()
        .expect("lock table poisoned")
        .get(&id)
        .cloned();
    match lock {
        Some(lock) => lock.release(),
        None => warn!("unlock on unknown lock id {id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        runs: AtomicUsize,
    }

    impl GuestTask for CountingTask {
        fn run(&self, _tid: u64) -> i32 {
            self.runs.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[test]
    fn worker_runs_task_and_unregisters() {
        let task = Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
        });
        let worker = Worker::spawn(task.clone()).expect("worker should spawn");
        let id = worker.id();
        worker.join();
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert!(Worker::get(id).is_none(), "worker must unregister on exit");
    }

    #[test]
    fn worker_ids_are_monotonic() {
        let first = Worker::spawn(Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
        }))
        .expect("worker should spawn");
        let second = Worker::spawn(Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
        }))
        .expect("worker should spawn");
        assert!(second.id() > first.id());
        first.join();
        second.join();
    }

    #[test]
    fn join_after_exit_returns_immediately() {
        let worker = Worker::spawn(Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
        }))
        .expect("worker should spawn");
        worker.join();
        worker.join();
    }

    #[test]
    fn current_is_none_outside_workers() {
        assert!(Worker::current().is_none());
    }

    #[test]
    fn named_locks_serialize_critical_sections() {
        const LOCK_ID: u64 = 900;
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    lock_object(LOCK_ID);
                    let value = counter.load(Ordering::SeqCst);
                    thread::yield_now();
                    counter.store(value + 1, Ordering::SeqCst);
                    unlock_object(LOCK_ID);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("locker thread should finish");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn unlock_of_unknown_id_is_harmless() {
        unlock_object(u64::MAX);
    }
}
