// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Timed task submission, abstracted behind a [`Scheduler`] trait so that message-layer
//! retransmission, block-wise timeouts, and observer notification cadence can be driven by
//! either a real async runtime or a virtual clock under deterministic test control.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An opaque handle to a previously scheduled task. Dropping it has no effect; call
/// [`TaskHandle::cancel`] explicitly to stop the task from firing.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    inner: Arc<dyn Cancellable>,
}

impl TaskHandle {
    /// Cancels the task, if it has not already fired.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

trait Cancellable: fmt::Debug + Send + Sync {
    fn cancel(&self);
}

/// A boxed, `'static`, `Send` closure run when a scheduled deadline is reached.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Abstraction over timed task submission, so that the protocol core can run identically
/// atop a real runtime or a virtual clock in tests.
pub trait Scheduler: Send + Sync {
    /// Returns the current time, as understood by this scheduler.
    fn now(&self) -> std::time::Instant;

    /// Schedules `task` to run after `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;

    /// Schedules `task` to run repeatedly, once every `period`, starting after the first
    /// `period` has elapsed. Returns a handle that stops the repetition when cancelled.
    fn schedule_at_fixed_rate(&self, period: Duration, task: Arc<dyn Fn() + Send + Sync>) -> TaskHandle;

    /// Shuts the scheduler down, preventing any further tasks from firing.
    fn shutdown(&self);
}

/// A [`Scheduler`] backed by the Tokio runtime's timers.
#[derive(Debug, Default)]
pub struct TokioScheduler;

#[derive(Debug)]
struct TokioTaskHandle {
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Cancellable for TokioTaskHandle {
    fn cancel(&self) {
        if let Some(join) = self.join.lock().unwrap().take() {
            join.abort();
        }
    }
}

impl TokioScheduler {
    /// Creates a new scheduler backed by the currently running Tokio runtime.
    pub fn new() -> TokioScheduler {
        TokioScheduler
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TaskHandle {
            inner: Arc::new(TokioTaskHandle {
                join: Mutex::new(Some(join)),
            }),
        }
    }

    fn schedule_at_fixed_rate(&self, period: Duration, task: Arc<dyn Fn() + Send + Sync>) -> TaskHandle {
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // First tick fires immediately; skip it.
            loop {
                interval.tick().await;
                task();
            }
        });
        TaskHandle {
            inner: Arc::new(TokioTaskHandle {
                join: Mutex::new(Some(join)),
            }),
        }
    }

    fn shutdown(&self) {
        // Individual task handles own their own `JoinHandle`s; there is no central
        // registry to drain for the Tokio-backed scheduler.
    }
}

struct ScheduledEntry {
    deadline: Duration,
    seq: u64,
    task: FakeTask,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

enum FakeTask {
    Once(Mutex<Option<Task>>),
    Repeating { period: Duration, task: Arc<dyn Fn() + Send + Sync> },
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for ScheduledEntry {}
impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Debug)]
struct FakeCancelHandle {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Cancellable for FakeCancelHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A [`Scheduler`] driven entirely by explicit calls to [`FakeScheduler::advance`], for
/// deterministic tests of retransmission timing, block-wise timeouts, and observer cadence.
pub struct FakeScheduler {
    now: Mutex<Duration>,
    queue: Mutex<BinaryHeap<Reverse<ScheduledEntryOrd>>>,
    seq: AtomicU64,
    shutdown: std::sync::atomic::AtomicBool,
}

struct ScheduledEntryOrd(ScheduledEntry);
impl PartialEq for ScheduledEntryOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}
impl Eq for ScheduledEntryOrd {}
impl PartialOrd for ScheduledEntryOrd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}
impl Ord for ScheduledEntryOrd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for FakeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeScheduler")
            .field("now", &*self.now.lock().unwrap())
            .finish()
    }
}

impl Default for FakeScheduler {
    fn default() -> Self {
        FakeScheduler {
            now: Mutex::new(Duration::ZERO),
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl FakeScheduler {
    /// Creates a new fake scheduler with its virtual clock at zero.
    pub fn new() -> Arc<FakeScheduler> {
        Arc::new(FakeScheduler::default())
    }

    /// Returns the current virtual time, as a `Duration` since the scheduler was created.
    pub fn virtual_now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    /// Advances the virtual clock by `delta`, running every task (and re-queuing every
    /// repeating task) whose deadline falls at or before the new time, in deadline order.
    /// Re-enters until no further tasks are due, so a task that schedules another task in
    /// the same window also fires within this call.
    pub fn advance(&self, delta: Duration) {
        let target = *self.now.lock().unwrap() + delta;

        loop {
            let due = {
                let mut queue = self.queue.lock().unwrap();
                match queue.peek() {
                    Some(Reverse(entry)) if entry.0.deadline <= target => {
                        queue.pop().map(|Reverse(e)| e.0)
                    }
                    _ => None,
                }
            };

            let Some(entry) = due else { break };

            *self.now.lock().unwrap() = entry.deadline;

            if entry.cancelled.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                continue;
            }

            match entry.task {
                FakeTask::Once(task) => {
                    if let Some(task) = task.lock().unwrap().take() {
                        task();
                    }
                }
                FakeTask::Repeating { period, task } => {
                    task();
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    self.queue.lock().unwrap().push(Reverse(ScheduledEntryOrd(ScheduledEntry {
                        deadline: entry.deadline + period,
                        seq,
                        task: FakeTask::Repeating { period, task },
                        cancelled: entry.cancelled,
                    })));
                }
            }
        }

        *self.now.lock().unwrap() = target;
    }
}

impl Scheduler for FakeScheduler {
    fn now(&self) -> std::time::Instant {
        // The fake scheduler tracks virtual time as a `Duration`; callers that need an
        // `Instant` (rather than comparing virtual durations directly) should prefer
        // `virtual_now()`. This returns the process start time as a stable placeholder.
        std::time::Instant::now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let deadline = *self.now.lock().unwrap() + delay;
        self.queue.lock().unwrap().push(Reverse(ScheduledEntryOrd(ScheduledEntry {
            deadline,
            seq,
            task: FakeTask::Once(Mutex::new(Some(task))),
            cancelled: cancelled.clone(),
        })));
        TaskHandle {
            inner: Arc::new(FakeCancelHandle { cancelled }),
        }
    }

    fn schedule_at_fixed_rate(&self, period: Duration, task: Arc<dyn Fn() + Send + Sync>) -> TaskHandle {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let deadline = *self.now.lock().unwrap() + period;
        self.queue.lock().unwrap().push(Reverse(ScheduledEntryOrd(ScheduledEntry {
            deadline,
            seq,
            task: FakeTask::Repeating { period, task },
            cancelled: cancelled.clone(),
        })));
        TaskHandle {
            inner: Arc::new(FakeCancelHandle { cancelled }),
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn fires_tasks_in_deadline_order() {
        let sched = FakeScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let log = log.clone();
            sched.schedule(Duration::from_millis(200), Box::new(move || log.lock().unwrap().push(2)));
        }
        {
            let log = log.clone();
            sched.schedule(Duration::from_millis(100), Box::new(move || log.lock().unwrap().push(1)));
        }

        sched.advance(Duration::from_millis(300));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn cancelled_task_never_fires() {
        let sched = FakeScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let handle = {
            let fired = fired.clone();
            sched.schedule(Duration::from_millis(100), Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }))
        };
        handle.cancel();
        sched.advance(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeating_task_fires_at_fixed_rate_until_cancelled() {
        let sched = FakeScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let handle = {
            let count = count.clone();
            sched.schedule_at_fixed_rate(
                Duration::from_millis(1000),
                Arc::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        sched.advance(Duration::from_millis(3000));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        sched.advance(Duration::from_millis(5000));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn advance_is_idle_safe_with_no_pending_tasks() {
        let sched = FakeScheduler::new();
        sched.advance(Duration::from_millis(500));
        assert_eq!(sched.virtual_now(), Duration::from_millis(500));
    }
}
