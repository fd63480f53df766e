//! Per-thread run loop.
//!
//! Every engine is bound to one [`EventLoop`]. Other threads hand work to the
//! engine by posting tasks; the thread running the loop executes them in
//! order. When the queue is empty the loop blocks for at most one wait slice
//! and tells its observers about the idle window, which is how the idle GC
//! heuristic learns about the host's activity.

use crate::error::{HostError, HostResult};
use crate::timer::now_ms;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default upper bound on a single blocking wait.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(100);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// A unit of work posted to a loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

/// Observes a loop going idle and waking up again.
pub trait LoopObserver: Send + Sync {
    /// The loop is about to block for up to `budget_ms`.
    fn before_wait(&self, timestamp_ms: i64, budget_ms: i64);

    /// The loop woke up.
    fn after_wait(&self, timestamp_ms: i64);
}

/// Handle returned by [`EventLoop::add_observer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct LoopShared {
    id: u64,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    running_on: Mutex<Option<ThreadId>>,
    closed: AtomicBool,
    observers: RwLock<Vec<(ListenerId, Arc<dyn LoopObserver>)>>,
    next_listener: AtomicU64,
    wait_slice: Duration,
}

/// Cloneable handle to a run loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.shared.id)
            .field("pending", &self.shared.rx.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_wait_slice(DEFAULT_WAIT_SLICE)
    }

    pub fn with_wait_slice(wait_slice: Duration) -> Self {
        let (tx, rx) = unbounded();
        Self {
            shared: Arc::new(LoopShared {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                tx,
                rx,
                running_on: Mutex::new(None),
                closed: AtomicBool::new(false),
                observers: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                wait_slice: wait_slice.max(Duration::from_millis(1)),
            }),
        }
    }

    /// The calling thread's loop, created on first use and recreated if the
    /// previous one was closed.
    pub fn current() -> Self {
        CURRENT.with_borrow_mut(|current| match current {
            Some(event_loop) if !event_loop.is_closed() => event_loop.clone(),
            _ => {
                if current.is_some() {
                    debug!("Reinitializing closed thread loop");
                }
                let event_loop = Self::new();
                *current = Some(event_loop.clone());
                event_loop
            }
        })
    }

    /// Make this loop the one [`EventLoop::current`] returns on this thread.
    pub(crate) fn make_current(&self) {
        CURRENT.with_borrow_mut(|current| *current = Some(self.clone()));
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn wait_slice(&self) -> Duration {
        self.shared.wait_slice
    }

    /// Queue a task. Fails once the loop has been closed.
    pub fn post<F>(&self, task: F) -> HostResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(HostError::LoopClosed);
        }
        self.shared
            .tx
            .send(Message::Run(Box::new(task)))
            .map_err(|_| HostError::LoopClosed)
    }

    /// Ask [`EventLoop::run`] to return after the tasks queued before this call.
    pub fn stop(&self) {
        let _ = self.shared.tx.send(Message::Stop);
    }

    /// Refuse further tasks.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            trace!(event_loop = self.id(), "Loop closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running_on.lock().is_some()
    }

    /// Whether the calling thread is inside [`EventLoop::run`] or
    /// [`EventLoop::run_pending`] of this loop.
    pub fn is_running_on_current_thread(&self) -> bool {
        *self.shared.running_on.lock() == Some(std::thread::current().id())
    }

    /// Tasks queued and not yet run.
    pub fn pending_tasks(&self) -> usize {
        self.shared.rx.len()
    }

    pub fn add_observer(&self, observer: Arc<dyn LoopObserver>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.observers.write().push((id, observer));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_observer(&self, id: ListenerId) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|(listener, _)| *listener != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.read().len()
    }

    /// Run tasks until [`EventLoop::stop`] is called.
    pub fn run(&self) {
        let _running = self.enter();
        let wait_slice = self.shared.wait_slice;
        let budget_ms = wait_slice.as_millis() as i64;
        let mut waiting = false;

        loop {
            match self.shared.rx.try_recv() {
                Ok(Message::Run(task)) => {
                    task();
                    continue;
                }
                Ok(Message::Stop) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            // One idle window spans every empty slice until work arrives.
            if !waiting {
                self.notify_before_wait(now_ms(), budget_ms);
                waiting = true;
            }
            match self.shared.rx.recv_timeout(wait_slice) {
                Ok(Message::Run(task)) => {
                    self.notify_after_wait(now_ms());
                    waiting = false;
                    task();
                }
                Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        if waiting {
            self.notify_after_wait(now_ms());
        }
    }

    /// Run every task already queued without blocking. Stops early at a stop
    /// request. Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let _running = self.enter();
        let mut ran = 0;
        while let Ok(message) = self.shared.rx.try_recv() {
            match message {
                Message::Run(task) => {
                    task();
                    ran += 1;
                }
                Message::Stop => break,
            }
        }
        ran
    }

    fn enter(&self) -> scopeguard::ScopeGuard<Option<ThreadId>, impl FnOnce(Option<ThreadId>) + '_> {
        let this_thread = std::thread::current().id();
        let previous = self.shared.running_on.lock().replace(this_thread);
        if let Some(other) = previous {
            if other != this_thread {
                warn!(event_loop = self.id(), "Loop entered while running on another thread");
            }
        }
        scopeguard::guard(previous, move |previous| {
            *self.shared.running_on.lock() = previous;
        })
    }

    fn observers(&self) -> Vec<Arc<dyn LoopObserver>> {
        self.shared
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }

    fn notify_before_wait(&self, timestamp_ms: i64, budget_ms: i64) {
        for observer in self.observers() {
            observer.before_wait(timestamp_ms, budget_ms);
        }
    }

    fn notify_after_wait(&self, timestamp_ms: i64) {
        for observer in self.observers() {
            observer.after_wait(timestamp_ms);
        }
    }
}
