//! Fixed-size thread pool executing blocking file syscalls off the loop thread.
//!
//! Grounded on the teacher's `notify.rs`/`channel.rs` cross-thread rendezvous (a shared queue
//! guarded by a mutex, with a readiness object used to wake the loop) and on
//! `JimFawcett-RustCommWithThreadPool`'s blocking-queue worker pool (FIFO submission queue,
//! condvar-parked workers, explicit submit/drain split). The rendezvous point is a
//! `(TaskId, TaskResult)` pair: workers never see the loop-side continuation (it captures
//! `Rc`/`RefCell` state and is not `Send`), so it stays behind on the loop thread in a side
//! table keyed by `TaskId`, and only the boxed result crosses the thread boundary.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::reactor::Loop;

pub(crate) type TaskId = u64;
type TaskResult = Box<dyn Any + Send>;

/// Tuning knobs for [`Pool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Number of worker threads. Defaults to the number of available CPUs, floored at 1.
    pub workers: usize,
    /// Maximum number of tasks that may be queued awaiting a free worker before `submit`
    /// returns [`Error::PoolBusy`].
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            queue_capacity: 4096,
        }
    }
}

struct QueuedTask {
    id: TaskId,
    work: Box<dyn FnOnce() -> TaskResult + Send>,
}

struct Shared {
    queue: Mutex<Queue>,
    condvar: Condvar,
    waker: Arc<mio::Waker>,
    shutdown: AtomicBool,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<QueuedTask>,
    completions: VecDeque<(TaskId, TaskResult)>,
    capacity: usize,
}

/// A fixed worker-thread pool bridged into a [`Loop`] via its [`Waker`](mio::Waker).
///
/// Unlike the C source, where the pool is process-global and never torn down, a `Pool` here is
/// tied to the `Loop` that created it (via [`Pool::new`]): `Drop` signals shutdown and joins
/// every worker, so tests can spin up an isolated `Loop` + `Pool` per run without leaking
/// threads into the next test. Started lazily — callers only construct one when the first
/// `File` attaches.
pub struct Pool {
    shared: Arc<Shared>,
    workers: RefCell<Vec<JoinHandle<()>>>,
    continuations: RefCell<HashMap<TaskId, Box<dyn FnOnce(TaskResult, &mut Loop)>>>,
    next_id: Cell<TaskId>,
}

impl Pool {
    /// Build a pool and install its completion drain as `lp`'s wake handler. Only one `Pool`
    /// may be wired to a given `Loop` (the loop exposes a single wake-handler slot, per
    /// SPEC_FULL §4.1).
    pub fn new(lp: &mut Loop, config: PoolConfig) -> Result<Rc<Pool>> {
        let waker = lp.waker();
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue { capacity: config.queue_capacity, ..Queue::default() }),
            condvar: Condvar::new(),
            waker,
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..config.workers.max(1))
            .map(|idx| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("evloop-pool-{idx}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn pool worker thread")
            })
            .collect();

        let pool = Rc::new(Pool {
            shared,
            workers: RefCell::new(workers),
            continuations: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        });

        let drain_target = Rc::clone(&pool);
        lp.set_wake_handler(move |lp| drain_target.drain(lp));

        Ok(pool)
    }

    /// Run `work` on a worker thread; once it completes, `continuation` runs on the loop
    /// thread with the result. Exactly one task per logical category should be in flight at a
    /// time per the owning `File`'s own bookkeeping — the pool itself has no notion of
    /// categories, it only guarantees FIFO execution and a single delivery per submission.
    pub(crate) fn submit<F, R, C>(&self, work: F, continuation: C) -> Result<()>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        C: FnOnce(R, &mut Loop) + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.pending.len() >= queue.capacity {
                return Err(Error::PoolBusy);
            }
            queue.pending.push_back(QueuedTask {
                id,
                work: Box::new(move || Box::new(work()) as TaskResult),
            });
        }
        self.shared.condvar.notify_one();

        self.continuations.borrow_mut().insert(
            id,
            Box::new(move |result: TaskResult, lp: &mut Loop| {
                let value = *result
                    .downcast::<R>()
                    .expect("task result type did not match its continuation");
                continuation(value, lp);
            }),
        );

        Ok(())
    }

    /// Discard a continuation without running it, e.g. because its owning `File` is being
    /// destroyed. The worker may still be mid-task; its result is simply dropped on arrival
    /// since no continuation remains registered for its id.
    pub(crate) fn orphan(&self, id: TaskId) {
        self.continuations.borrow_mut().remove(&id);
    }

    fn drain(&self, lp: &mut Loop) {
        let completions: Vec<_> = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.completions.drain(..).collect()
        };
        for (id, result) in completions {
            if let Some(continuation) = self.continuations.borrow_mut().remove(&id) {
                continuation(result, lp);
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        for worker in self.workers.borrow_mut().drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pending.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = shared.condvar.wait(queue).unwrap();
            }
        };

        let Some(task) = task else { return };
        let result = (task.work)();

        {
            let mut queue = shared.queue.lock().unwrap();
            queue.completions.push_back((task.id, result));
        }
        let _ = shared.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn submitted_task_runs_continuation_on_loop_thread() {
        let mut lp = Loop::new().unwrap();
        let pool = Pool::new(&mut lp, PoolConfig { workers: 2, ..PoolConfig::default() }).unwrap();

        let observed = Rc::new(StdRefCell::new(None));
        let observed2 = Rc::clone(&observed);
        pool.submit(
            || 1 + 1,
            move |result: i32, _lp: &mut Loop| {
                *observed2.borrow_mut() = Some(result);
            },
        )
        .unwrap();

        lp.run_until(|| observed.borrow().is_some(), 1000).unwrap();
        assert_eq!(*observed.borrow(), Some(2));
    }

    #[test]
    fn queue_capacity_rejects_excess_submissions() {
        let mut lp = Loop::new().unwrap();
        let pool = Pool::new(&mut lp, PoolConfig { workers: 1, queue_capacity: 0 }).unwrap();
        let err = pool.submit(|| (), |_: (), _: &mut Loop| {});
        assert!(matches!(err, Err(Error::PoolBusy)));
    }
}
