//! Monotonic clock and the background timer used by the idle monitor.

use crate::error::{HostError, HostResult};
use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::OnceLock;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info_span};

/// Milliseconds on a monotonic clock shared by the whole process.
pub fn now_ms() -> i64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// Task run by a [`MonitorScheduler`].
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay.
pub trait MonitorScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: TimerTask);
}

enum Command {
    Schedule(Instant, TimerTask),
    Shutdown,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    task: TimerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A single background thread running delayed tasks in deadline order.
///
/// Tasks still pending when the timer is dropped are discarded.
pub struct ThreadTimer {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadTimer {
    pub fn new(name: impl Into<String>) -> HostResult<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Command>();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _span = info_span!("timer", name = %thread_name).entered();
                let mut heap = BinaryHeap::new();
                let mut seq = 0u64;

                loop {
                    let now = Instant::now();
                    while heap
                        .peek()
                        .is_some_and(|entry: &Entry| entry.deadline <= now)
                    {
                        if let Some(entry) = heap.pop() {
                            (entry.task)();
                        }
                    }

                    let command = match heap.peek() {
                        Some(entry) => {
                            let wait = entry.deadline.saturating_duration_since(Instant::now());
                            match rx.recv_timeout(wait) {
                                Ok(command) => command,
                                Err(RecvTimeoutError::Timeout) => continue,
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        None => match rx.recv() {
                            Ok(command) => command,
                            Err(_) => break,
                        },
                    };

                    match command {
                        Command::Schedule(deadline, task) => {
                            seq += 1;
                            heap.push(Entry {
                                deadline,
                                seq,
                                task,
                            });
                        }
                        Command::Shutdown => break,
                    }
                }
                debug!(discarded = heap.len(), "Timer stopped");
            })
            .map_err(|e| HostError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }
}

impl MonitorScheduler for ThreadTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        let _ = self
            .tx
            .send(Command::Schedule(Instant::now() + delay, task));
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            // A task dropping the last handle runs on the timer thread itself.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_now_ms_is_monotonic() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(2));
        assert!(now_ms() >= a);
    }

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let timer = ThreadTimer::new("test-timer").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::bounded(3);

        for (label, delay) in [("late", 60), ("early", 10), ("middle", 30)] {
            let order = order.clone();
            let tx = tx.clone();
            timer.schedule(
                Duration::from_millis(delay),
                Box::new(move || {
                    order.lock().push(label);
                    let _ = tx.send(());
                }),
            );
        }

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_drop_discards_pending_tasks() {
        let ran = Arc::new(Mutex::new(false));
        {
            let timer = ThreadTimer::new("test-timer-drop").unwrap();
            let ran = ran.clone();
            timer.schedule(Duration::from_secs(60), Box::new(move || *ran.lock() = true));
        }
        assert!(!*ran.lock());
    }
}
