//! Timed update-check triggers.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::updater::Signal;

/// Largest delay the scheduler accepts, in milliseconds.
pub const MAX_DELAY_MILLIS: u64 = i32::MAX as u64;

/// Shortest period a repeating task may use.
const MIN_REPEAT_PERIOD: Duration = Duration::from_millis(1);

/// Handle of a scheduled task. Ids start at 1 and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ScheduledTask {
    repeated: bool,
    timer: JoinHandle<()>,
}

/// Set of pending timers that post [`Signal::ScheduleFired`] when due.
///
/// Timers run as tokio tasks, but only the owning updater mutates the task
/// table: a firing for an id that is no longer present is dropped, which
/// makes cancellation take effect immediately.
pub(crate) struct Scheduler {
    tx: mpsc::UnboundedSender<Signal>,
    next_id: NonZeroU64,
    tasks: HashMap<TaskId, ScheduledTask>,
}

impl Scheduler {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            tx,
            next_id: NonZeroU64::MIN,
            tasks: HashMap::new(),
        }
    }

    /// Fire after `delay`, and every `delay` after that when `repeated`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn start_schedule(&mut self, delay: Duration, repeated: bool) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        let tx = self.tx.clone();
        let start = Instant::now() + delay;

        let timer = if repeated {
            let period = delay.max(MIN_REPEAT_PERIOD);
            tokio::spawn(async move {
                let mut ticker = time::interval_at(start, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if tx.send(Signal::ScheduleFired(id)).is_err() {
                        break;
                    }
                }
            })
        } else {
            tokio::spawn(async move {
                time::sleep_until(start).await;
                let _ = tx.send(Signal::ScheduleFired(id));
            })
        };

        debug!(task = %id, delay_ms = delay.as_millis() as u64, repeated, "scheduled update check");
        self.tasks.insert(id, ScheduledTask { repeated, timer });
        id
    }

    /// Fire once at `when`. Times in the past fire as soon as possible.
    pub(crate) fn start_schedule_at(&mut self, when: DateTime<Utc>) -> TaskId {
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.start_schedule(delay, false)
    }

    /// Cancel a pending task. Returns whether anything was cancelled.
    pub(crate) fn cancel_schedule(&mut self, id: TaskId) -> bool {
        match self.tasks.remove(&id) {
            Some(task) => {
                task.timer.abort();
                debug!(task = %id, "cancelled scheduled update check");
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_scheduled(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Account for a firing. Returns whether the task was still live.
    ///
    /// One-shot tasks are consumed here; repeating tasks stay armed.
    pub(crate) fn fire(&mut self, id: TaskId) -> bool {
        let repeated = match self.tasks.get(&id) {
            Some(task) => task.repeated,
            None => {
                trace!(task = %id, "ignoring firing of a cancelled task");
                return false;
            }
        };
        if !repeated {
            self.tasks.remove(&id);
        }
        true
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn scheduler() -> (Scheduler, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Scheduler::new(tx), rx)
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(scheduler: &mut Scheduler, rx: &mut mpsc::UnboundedReceiver<Signal>) -> Vec<TaskId> {
        let mut fired = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let Signal::ScheduleFired(id) = signal {
                if scheduler.fire(id) {
                    fired.push(id);
                }
            }
        }
        fired
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_monotonic_and_nonzero() {
        let (mut scheduler, _rx) = scheduler();
        let first = scheduler.start_schedule(Duration::from_secs(1), false);
        let second = scheduler.start_schedule(Duration::from_secs(1), true);
        assert_eq!(first.get(), 1);
        assert!(second > first);

        scheduler.cancel_schedule(first);
        let third = scheduler.start_schedule(Duration::from_secs(1), false);
        assert!(third > second);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_and_is_consumed() {
        let (mut scheduler, mut rx) = scheduler();
        let id = scheduler.start_schedule(Duration::from_secs(10), false);

        time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert!(drain(&mut scheduler, &mut rx).is_empty());

        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(drain(&mut scheduler, &mut rx), vec![id]);
        assert!(!scheduler.is_scheduled(id));

        time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(drain(&mut scheduler, &mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_rearms_until_cancelled() {
        let (mut scheduler, mut rx) = scheduler();
        let period = Duration::from_secs(5);
        let id = scheduler.start_schedule(period, true);

        let mut fired = 0;
        for _ in 0..2 {
            time::advance(period).await;
            settle().await;
            fired += drain(&mut scheduler, &mut rx).len();
        }
        assert_eq!(fired, 2);
        assert!(scheduler.is_scheduled(id));

        assert!(scheduler.cancel_schedule(id));
        time::advance(period * 3).await;
        settle().await;
        assert!(drain(&mut scheduler, &mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn firing_queued_before_cancel_is_ignored() {
        let (mut scheduler, mut rx) = scheduler();
        let id = scheduler.start_schedule(Duration::from_millis(100), false);

        time::advance(Duration::from_millis(100)).await;
        settle().await;
        scheduler.cancel_schedule(id);
        assert!(drain(&mut scheduler, &mut rx).is_empty());
        assert!(!scheduler.cancel_schedule(id));
    }

    #[tokio::test(start_paused = true)]
    async fn absolute_time_in_the_past_fires_immediately() {
        let (mut scheduler, mut rx) = scheduler();
        let id = scheduler.start_schedule_at(Utc::now() - TimeDelta::hours(1));

        tokio::task::yield_now().await;
        settle().await;
        assert_eq!(drain(&mut scheduler, &mut rx), vec![id]);
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn absolute_time_in_the_future_waits() {
        let (mut scheduler, mut rx) = scheduler();
        let id = scheduler.start_schedule_at(Utc::now() + TimeDelta::seconds(30));

        time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert!(drain(&mut scheduler, &mut rx).is_empty());

        time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(drain(&mut scheduler, &mut rx), vec![id]);
    }
}
