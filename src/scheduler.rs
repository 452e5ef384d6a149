//! Clocks and a virtual-time event loop.
//!
//! Everything that happens "later" (synthetic activity, client ticks,
//! reconnect retries) is a [`Task`] on an [`EventLoop`]. The loop advances a
//! [`ManualClock`], so tests move time forward explicitly and never sleep.

use crate::types::Timestamp;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    micros: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: Arc::new(AtomicI64::new(start.0)),
        }
    }

    /// Move to `at`. Time never goes backwards.
    pub fn set(&self, at: Timestamp) {
        self.micros.fetch_max(at.0, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let target = self.now().after(by);
        self.set(target);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.micros.load(Ordering::SeqCst))
    }
}

/// Work scheduled on the event loop.
pub trait Task: Send {
    /// Name used in logs. Read once, when the task is spawned.
    fn name(&self) -> Cow<'_, str>;

    /// Run once at `now`. Returns the delay until the next run, or `None`
    /// when the task is finished.
    fn run(&mut self, now: Timestamp) -> Option<Duration>;
}

impl<T: Task + ?Sized> Task for Arc<Mutex<T>> {
    fn name(&self) -> Cow<'_, str> {
        // the name cannot outlive the guard
        Cow::Owned(self.lock().name().into_owned())
    }

    fn run(&mut self, now: Timestamp) -> Option<Duration> {
        self.lock().run(now)
    }
}

/// Identifier of a scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Timestamp,
    /// Scheduling order; breaks deadline ties.
    seq: u64,
    task: TaskId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Smallest step a periodic task can take, so a zero delay cannot stall
/// the loop.
const MIN_STEP: Duration = Duration::from_millis(1);

/// A live task and the name it was spawned under.
struct Scheduled {
    name: String,
    task: Box<dyn Task>,
}

/// Single-threaded cooperative event loop over virtual time.
pub struct EventLoop {
    clock: ManualClock,
    queue: BinaryHeap<Reverse<Entry>>,
    tasks: HashMap<TaskId, Scheduled>,
    next_seq: u64,
    next_task: u64,
}

impl EventLoop {
    /// Create a loop driving `clock`.
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            queue: BinaryHeap::new(),
            tasks: HashMap::new(),
            next_seq: 0,
            next_task: 1,
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Schedule `task` to first run after `delay`.
    pub fn spawn(&mut self, delay: Duration, task: impl Task + 'static) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        let name = task.name().into_owned();
        trace!(task = %name, id = id.0, "spawned task");
        self.tasks.insert(
            id,
            Scheduled {
                name,
                task: Box::new(task),
            },
        );
        self.enqueue(id, self.now().after(delay));
        id
    }

    /// Name of a live task.
    pub fn task_name(&self, id: TaskId) -> Option<&str> {
        self.tasks.get(&id).map(|s| s.name.as_str())
    }

    /// Cancel a task. Returns false if it was not scheduled.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        // stale heap entries are skipped when popped
        self.tasks.remove(&id).is_some()
    }

    /// Number of live tasks.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Deadline of the next live task.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.queue
            .iter()
            .filter(|Reverse(entry)| self.tasks.contains_key(&entry.task))
            .map(|Reverse(entry)| entry.deadline)
            .min()
    }

    /// Advance virtual time by `by`, running every task that comes due in
    /// deadline order. Returns how many task runs happened.
    pub fn advance(&mut self, by: Duration) -> usize {
        let target = self.now().after(by);
        let mut runs = 0;

        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.deadline > target {
                break;
            }
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            let Some(mut scheduled) = self.tasks.remove(&entry.task) else {
                continue;
            };

            self.clock.set(entry.deadline);
            trace!(task = %scheduled.name, at = entry.deadline.0, "running task");
            runs += 1;

            if let Some(delay) = scheduled.task.run(entry.deadline) {
                let next = entry.deadline.after(delay.max(MIN_STEP));
                self.tasks.insert(entry.task, scheduled);
                self.enqueue(entry.task, next);
            }
        }

        self.clock.set(target);
        runs
    }

    fn enqueue(&mut self, task: TaskId, deadline: Timestamp) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Entry {
            deadline,
            seq,
            task,
        }));
    }
}
