//! Dedicated engine threads.

use crate::engine::LifecycleStats;
use crate::error::{HostError, HostResult};
use crate::event_loop::EventLoop;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info_span, warn};

/// A thread that runs one [`EventLoop`] until asked to stop.
///
/// Dropping a runner stops its loop without waiting for the thread.
pub struct LoopRunner {
    name: String,
    event_loop: EventLoop,
    thread: Option<JoinHandle<()>>,
}

impl LoopRunner {
    /// Spawn a thread named `name` running a fresh loop.
    pub fn spawn(
        name: impl Into<String>,
        wait_slice: Duration,
        stats: Arc<LifecycleStats>,
    ) -> HostResult<Self> {
        let name = name.into();
        let event_loop = EventLoop::with_wait_slice(wait_slice);
        let thread_loop = event_loop.clone();
        let thread_name = name.clone();
        let live = stats.clone();

        stats.dedicated_threads_live.fetch_add(1, Ordering::Relaxed);
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _exit = scopeguard::guard(thread_loop.clone(), |event_loop| {
                    event_loop.close();
                    live.dedicated_threads_live.fetch_sub(1, Ordering::Relaxed);
                });
                let _span = info_span!("engine_loop", name = %thread_name).entered();
                debug!("Engine loop starting");

                thread_loop.make_current();
                thread_loop.run();

                debug!("Engine loop stopped");
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                stats.dedicated_threads_live.fetch_sub(1, Ordering::Relaxed);
                return Err(HostError::ThreadSpawn(e.to_string()));
            }
        };

        Ok(Self {
            name,
            event_loop,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Stop the loop and wait for the thread to exit.
    pub fn stop_and_join(mut self) {
        self.event_loop.stop();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            warn!(thread = %self.name, "Runner joined from its own thread, detaching");
            return;
        }
        if thread.join().is_err() {
            error!(thread = %self.name, "Engine loop thread panicked");
        }
    }

    /// Stop the loop without waiting for the thread.
    pub fn detach(mut self) {
        self.event_loop.stop();
        self.thread.take();
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        if self.thread.take().is_some() {
            self.event_loop.stop();
        }
    }
}
