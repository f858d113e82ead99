use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The two actions a combo can schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionId {
    Held,
    Released,
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionId::Held => f.write_str("held"),
            ActionId::Released => f.write_str("released"),
        }
    }
}

/// Identifies one scheduled job; only delayed jobs can be canceled with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    seq: u64,
    id: ActionId,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingFailure {
    #[error("worker queue is full ({capacity} jobs pending)")]
    QueueFull { capacity: usize },

    #[error("worker has shut down")]
    ShutDown,
}

struct Entry {
    handle: JobHandle,
    ready_at: Instant,
    job: Job,
}

#[derive(Default)]
struct Queue {
    delayed: Vec<Entry>,
    immediate: VecDeque<Entry>,
    next_seq: u64,
    stopping: bool,
}

impl Queue {
    fn len(&self) -> usize {
        self.delayed.len() + self.immediate.len()
    }

    /// Remove and return the job that became ready first, if any is ready at `now`.
    fn take_ready(&mut self, now: Instant) -> Option<Entry> {
        let delayed = self
            .delayed
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ready_at <= now)
            .min_by_key(|(_, e)| (e.ready_at, e.handle.seq))
            .map(|(i, e)| (i, e.ready_at));

        let front = self.immediate.front().map(|e| e.ready_at);

        match (delayed, front) {
            (Some((i, due)), Some(posted)) if due < posted => Some(self.delayed.remove(i)),
            (_, Some(_)) => self.immediate.pop_front(),
            (Some((i, _)), None) => Some(self.delayed.remove(i)),
            (None, None) => None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.iter().map(|e| e.ready_at).min()
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Runs scheduled actions one at a time on a dedicated worker thread.
///
/// A delayed job is either canceled or taken by the worker, never both: the worker
/// removes a job from the pending set under the same lock `cancel` uses.
pub struct DeferredActionScheduler {
    shared: Arc<Shared>,
    capacity: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredActionScheduler {
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("keycombo-worker".into())
            .spawn(move || run_worker(&worker_shared))?;

        Ok(Self {
            shared,
            capacity: capacity.max(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn schedule_delayed(
        &self,
        id: ActionId,
        delay: Duration,
        job: Job,
    ) -> Result<JobHandle, SchedulingFailure> {
        self.push(id, Instant::now() + delay, job, true)
    }

    pub fn schedule_immediate(&self, id: ActionId, job: Job) -> Result<JobHandle, SchedulingFailure> {
        self.push(id, Instant::now(), job, false)
    }

    fn push(
        &self,
        id: ActionId,
        ready_at: Instant,
        job: Job,
        delayed: bool,
    ) -> Result<JobHandle, SchedulingFailure> {
        let mut queue = self.shared.queue.lock();
        if queue.stopping {
            return Err(SchedulingFailure::ShutDown);
        }
        if queue.len() >= self.capacity {
            return Err(SchedulingFailure::QueueFull {
                capacity: self.capacity,
            });
        }

        queue.next_seq += 1;
        let handle = JobHandle {
            seq: queue.next_seq,
            id,
        };
        let entry = Entry {
            handle,
            ready_at,
            job,
        };
        if delayed {
            queue.delayed.push(entry);
        } else {
            queue.immediate.push_back(entry);
        }
        drop(queue);

        self.shared.wake.notify_one();
        Ok(handle)
    }

    /// Remove a delayed job before it starts. Returns false once the worker has taken it.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        let mut queue = self.shared.queue.lock();
        match queue.delayed.iter().position(|e| e.handle == *handle) {
            Some(i) => {
                queue.delayed.remove(i);
                debug!(action = %handle.id, "canceled before start");
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop accepting work, drop delayed jobs, run the posted immediate ones and join.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.stopping {
                queue.stopping = true;
                let dropped = queue.delayed.len();
                queue.delayed.clear();
                if dropped > 0 {
                    debug!(dropped, "dropped delayed jobs at shutdown");
                }
            }
        }
        self.shared.wake.notify_all();

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            warn!("scheduler shut down from its own worker, not joining");
            return;
        }
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
    }
}

impl Drop for DeferredActionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(entry) = queue.take_ready(Instant::now()) {
                    break Some(entry);
                }
                if queue.stopping && queue.immediate.is_empty() {
                    break None;
                }
                match queue.next_deadline() {
                    Some(deadline) => {
                        shared.wake.wait_until(&mut queue, deadline);
                    }
                    None => shared.wake.wait(&mut queue),
                }
            }
        };

        let Some(entry) = entry else {
            debug!("worker exiting");
            return;
        };

        debug!(action = %entry.handle.id, "running action");
        if panic::catch_unwind(AssertUnwindSafe(entry.job)).is_err() {
            error!(action = %entry.handle.id, "action panicked");
        }
    }
}
