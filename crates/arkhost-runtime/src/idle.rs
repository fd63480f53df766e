//! Idle GC heuristic.
//!
//! The host's run loop reports every idle window it enters
//! ([`IdleMonitor::notify_idle_start`]) and every wake-up
//! ([`IdleMonitor::notify_idle_end`]). Two decisions are made from that stream:
//!
//! - **Idle GC.** Once the ring of recent inter-arrival intervals is full, an
//!   idle window that arrives at a regular cadence (longer than the minimum,
//!   shorter than `average * multiplier`) is offered to the VM as idle GC time.
//! - **Compacting GC.** A periodic check ([`IdleMonitor::interval_monitor_at`])
//!   tracks two streaks: periods with few idle notifications, and periods that
//!   were almost entirely idle. When both streaks reach the required length
//!   (shorter in the background) the VM is asked for a full and a shared-heap
//!   compacting collection, all statistics are cleared and the check backs off
//!   to the long sleep interval.
//!
//! Counters are independent atomics so notifications never take a lock. The
//! periodic check reads and resets several of them non-atomically; a
//! notification racing with it is at worst counted one period late.

use crate::config::IdleConfig;
use crate::event_loop::LoopObserver;
use crate::timer::{MonitorScheduler, now_ms};
use crate::vm::GcKind;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Number of intervals averaged for cadence detection.
pub const INTERVAL_RING_CAPACITY: usize = 4;

const NO_TIMESTAMP: i64 = i64::MIN;

/// Receives the GC requests the monitor decides on.
pub trait GcTrigger: Send + Sync {
    fn notify_idle_gc(&self, timestamp_ms: i64, budget_ms: i64);

    fn trigger_compacting_gc(&self, kind: GcKind);
}

/// Lock-free counters in the manner of engine stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleStatsSnapshot {
    pub idle: bool,
    pub background: bool,
    pub notify_count: u32,
    pub total_idle_ms: i64,
    pub low_notify_streak: u32,
    pub idle_ratio_streak: u32,
    pub idle_gc_requests: u64,
    pub compacting_gc_requests: u64,
}

pub struct IdleMonitor {
    config: IdleConfig,

    idle: AtomicBool,
    background: AtomicBool,
    notify_count: AtomicU32,
    total_idle_ms: AtomicI64,
    notify_ts: AtomicI64,
    idle_span_start: AtomicI64,
    period_start: AtomicI64,

    intervals: [AtomicI64; INTERVAL_RING_CAPACITY],
    ring_pos: AtomicUsize,
    ring_len: AtomicUsize,

    low_notify_streak: AtomicU32,
    idle_ratio_streak: AtomicU32,
    deferred_freeze: AtomicBool,

    idle_gc_requests: AtomicU64,
    compacting_gc_requests: AtomicU64,

    target: RwLock<Option<Arc<dyn GcTrigger>>>,
    scheduler: Option<Arc<dyn MonitorScheduler>>,
    running: AtomicBool,
}

impl IdleMonitor {
    /// A monitor without a timer backend. The periodic check never runs on its
    /// own; callers may still drive [`IdleMonitor::interval_monitor_at`].
    pub fn new(config: IdleConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_scheduler(config: IdleConfig, scheduler: Arc<dyn MonitorScheduler>) -> Self {
        Self::build(config, Some(scheduler))
    }

    fn build(config: IdleConfig, scheduler: Option<Arc<dyn MonitorScheduler>>) -> Self {
        Self {
            config,
            idle: AtomicBool::new(false),
            background: AtomicBool::new(false),
            notify_count: AtomicU32::new(0),
            total_idle_ms: AtomicI64::new(0),
            notify_ts: AtomicI64::new(NO_TIMESTAMP),
            idle_span_start: AtomicI64::new(NO_TIMESTAMP),
            period_start: AtomicI64::new(NO_TIMESTAMP),
            intervals: std::array::from_fn(|_| AtomicI64::new(0)),
            ring_pos: AtomicUsize::new(0),
            ring_len: AtomicUsize::new(0),
            low_notify_streak: AtomicU32::new(0),
            idle_ratio_streak: AtomicU32::new(0),
            deferred_freeze: AtomicBool::new(false),
            idle_gc_requests: AtomicU64::new(0),
            compacting_gc_requests: AtomicU64::new(0),
            target: RwLock::new(None),
            scheduler,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &IdleConfig {
        &self.config
    }

    /// Route GC requests to `target`, replacing any previous one.
    pub fn set_target(&self, target: Arc<dyn GcTrigger>) {
        *self.target.write() = Some(target);
    }

    pub fn clear_target(&self) {
        *self.target.write() = None;
    }

    pub fn has_scheduler(&self) -> bool {
        self.scheduler.is_some()
    }

    /// The loop entered an idle window of `budget_ms` at `timestamp_ms`.
    pub fn notify_idle_start(&self, timestamp_ms: i64, budget_ms: i64) {
        self.idle.store(true, Ordering::Release);
        self.notify_count.fetch_add(1, Ordering::Relaxed);
        // Idle time is accounted for every window, whatever its budget.
        self.idle_span_start.store(timestamp_ms, Ordering::Relaxed);

        let min = self.config.min_trigger_interval_ms;
        if budget_ms < min {
            return;
        }
        let previous = self.notify_ts.swap(timestamp_ms, Ordering::AcqRel);
        if previous == NO_TIMESTAMP {
            return;
        }

        let interval = timestamp_ms.saturating_sub(previous);
        let Some(average) = self.push_interval(interval) else {
            return;
        };

        if interval > min && interval < average.saturating_mul(self.config.interval_multiplier) {
            trace!(interval, average, budget_ms, "Regular idle cadence");
            self.idle_gc_requests.fetch_add(1, Ordering::Relaxed);
            if let Some(target) = self.target.read().clone() {
                target.notify_idle_gc(timestamp_ms, budget_ms);
            }
        }
    }

    /// The loop woke up at `timestamp_ms`.
    pub fn notify_idle_end(&self, timestamp_ms: i64) {
        self.idle.store(false, Ordering::Release);
        let start = self.idle_span_start.swap(NO_TIMESTAMP, Ordering::AcqRel);
        if start != NO_TIMESTAMP && timestamp_ms > start {
            self.total_idle_ms
                .fetch_add(timestamp_ms.saturating_sub(start), Ordering::Relaxed);
        }
    }

    /// Switch between foreground and background. Clears all statistics.
    pub fn notify_change_background_state(&self, in_background: bool) {
        let was = self.background.swap(in_background, Ordering::AcqRel);
        if was != in_background {
            debug!(in_background, "Idle monitor background state changed");
        }
        self.clear_stats();
    }

    /// Record a freeze request from the backgrounding policy.
    pub fn set_deferred_freeze(&self, deferred: bool) {
        self.deferred_freeze.store(deferred, Ordering::Release);
    }

    pub fn is_deferred_freeze(&self) -> bool {
        self.deferred_freeze.load(Ordering::Acquire)
    }

    /// Take the pending freeze request, if any.
    pub fn take_deferred_freeze(&self) -> bool {
        self.deferred_freeze.swap(false, Ordering::AcqRel)
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::Acquire)
    }

    /// Idle time accumulated in the current period.
    pub fn total_idle_duration(&self) -> Duration {
        Duration::from_millis(self.total_idle_ms.load(Ordering::Relaxed).max(0) as u64)
    }

    pub fn notify_count(&self) -> u32 {
        self.notify_count.load(Ordering::Relaxed)
    }

    pub fn low_notify_streak(&self) -> u32 {
        self.low_notify_streak.load(Ordering::Relaxed)
    }

    pub fn idle_ratio_streak(&self) -> u32 {
        self.idle_ratio_streak.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IdleStatsSnapshot {
        IdleStatsSnapshot {
            idle: self.is_idle(),
            background: self.is_background(),
            notify_count: self.notify_count(),
            total_idle_ms: self.total_idle_ms.load(Ordering::Relaxed),
            low_notify_streak: self.low_notify_streak(),
            idle_ratio_streak: self.idle_ratio_streak(),
            idle_gc_requests: self.idle_gc_requests.load(Ordering::Relaxed),
            compacting_gc_requests: self.compacting_gc_requests.load(Ordering::Relaxed),
        }
    }

    /// Periodic low-activity check at `now_ms`. Returns the delay until the
    /// next check.
    pub fn interval_monitor_at(&self, now_ms: i64) -> Duration {
        let period_start = match self.period_start.swap(now_ms, Ordering::AcqRel) {
            NO_TIMESTAMP => now_ms - self.config.monitoring_interval_ms as i64,
            start => start,
        };

        // Fold the idle window still in progress, clipped to this period.
        if self.idle.load(Ordering::Acquire) {
            let span_start = self.idle_span_start.load(Ordering::Acquire);
            if span_start != NO_TIMESTAMP {
                let from = span_start.max(period_start);
                if now_ms > from {
                    self.total_idle_ms.fetch_add(now_ms.saturating_sub(from), Ordering::Relaxed);
                }
                let _ = self.idle_span_start.compare_exchange(
                    span_start,
                    now_ms,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }

        let notifies = self.notify_count.swap(0, Ordering::Relaxed);
        let idle_ms = self.total_idle_ms.swap(0, Ordering::Relaxed);
        let period_ms = now_ms - period_start;

        let background = self.is_background();
        let (ratio_threshold, required) = if background {
            (self.config.background_idle_ratio, self.config.background_check_cycles)
        } else {
            (self.config.foreground_idle_ratio, self.config.foreground_check_cycles)
        };

        let low_notify = if notifies <= self.config.low_notify_threshold {
            self.low_notify_streak.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.low_notify_streak.store(0, Ordering::Relaxed);
            0
        };

        let idle_ratio = if period_ms <= 0 {
            warn!(period_ms, "Non-positive idle monitor period, resetting ratio streak");
            self.idle_ratio_streak.store(0, Ordering::Relaxed);
            0
        } else if idle_ms as f64 / period_ms as f64 >= ratio_threshold {
            self.idle_ratio_streak.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.idle_ratio_streak.store(0, Ordering::Relaxed);
            0
        };

        trace!(notifies, idle_ms, period_ms, low_notify, idle_ratio, background, "Idle monitor period");

        if low_notify >= required && idle_ratio >= required {
            self.trigger_compacting_gc();
            self.clear_stats();
            return self.config.sleep_interval();
        }
        self.config.monitoring_interval()
    }

    /// Start the periodic check on the scheduler. Returns false, leaving the
    /// monitor inert, when there is no scheduler.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(scheduler) = &self.scheduler else {
            debug!("No timer backend, idle monitor is inert");
            return false;
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.period_start.store(now_ms(), Ordering::Release);
        schedule_tick(scheduler, Arc::downgrade(self), self.config.monitoring_interval());
        info!(interval_ms = self.config.monitoring_interval_ms, "Idle monitor started");
        true
    }

    /// Stop rescheduling the periodic check.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("Idle monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn trigger_compacting_gc(&self) {
        self.compacting_gc_requests.fetch_add(1, Ordering::Relaxed);
        let freeze = self.take_deferred_freeze();
        info!(background = self.is_background(), deferred_freeze = freeze, "Sustained low activity, requesting compacting GC");
        if let Some(target) = self.target.read().clone() {
            target.trigger_compacting_gc(GcKind::Full);
            target.trigger_compacting_gc(GcKind::SharedCompacting);
        }
    }

    /// Push an interval, returning the ring's average once it is full.
    fn push_interval(&self, interval: i64) -> Option<i64> {
        let slot = self.ring_pos.fetch_add(1, Ordering::Relaxed) % INTERVAL_RING_CAPACITY;
        self.intervals[slot].store(interval, Ordering::Relaxed);
        let len = self
            .ring_len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                Some((len + 1).min(INTERVAL_RING_CAPACITY))
            })
            .map_or(INTERVAL_RING_CAPACITY, |len| (len + 1).min(INTERVAL_RING_CAPACITY));

        if len < INTERVAL_RING_CAPACITY {
            return None;
        }
        let sum = self
            .intervals
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .fold(0i64, i64::saturating_add);
        Some(sum / INTERVAL_RING_CAPACITY as i64)
    }

    fn clear_stats(&self) {
        self.notify_count.store(0, Ordering::Relaxed);
        self.total_idle_ms.store(0, Ordering::Relaxed);
        self.notify_ts.store(NO_TIMESTAMP, Ordering::Relaxed);
        self.ring_pos.store(0, Ordering::Relaxed);
        self.ring_len.store(0, Ordering::Relaxed);
        for slot in &self.intervals {
            slot.store(0, Ordering::Relaxed);
        }
        self.low_notify_streak.store(0, Ordering::Relaxed);
        self.idle_ratio_streak.store(0, Ordering::Relaxed);
    }
}

fn schedule_tick(scheduler: &Arc<dyn MonitorScheduler>, monitor: Weak<IdleMonitor>, delay: Duration) {
    let next = scheduler.clone();
    scheduler.schedule(
        delay,
        Box::new(move || {
            let Some(monitor) = monitor.upgrade() else {
                return;
            };
            if !monitor.is_running() {
                return;
            }
            let delay = monitor.interval_monitor_at(now_ms());
            schedule_tick(&next, Arc::downgrade(&monitor), delay);
        }),
    );
}

impl LoopObserver for IdleMonitor {
    fn before_wait(&self, timestamp_ms: i64, budget_ms: i64) {
        self.notify_idle_start(timestamp_ms, budget_ms);
    }

    fn after_wait(&self, timestamp_ms: i64) {
        self.notify_idle_end(timestamp_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        idle: Mutex<Vec<(i64, i64)>>,
        compacting: Mutex<Vec<GcKind>>,
    }

    impl GcTrigger for RecordingTarget {
        fn notify_idle_gc(&self, timestamp_ms: i64, budget_ms: i64) {
            self.idle.lock().push((timestamp_ms, budget_ms));
        }

        fn trigger_compacting_gc(&self, kind: GcKind) {
            self.compacting.lock().push(kind);
        }
    }

    fn monitor() -> (IdleMonitor, Arc<RecordingTarget>) {
        let monitor = IdleMonitor::new(IdleConfig::default());
        let target = Arc::new(RecordingTarget::default());
        monitor.set_target(target.clone());
        (monitor, target)
    }

    #[test]
    fn test_ring_average_needs_full_buffer() {
        let (monitor, _) = monitor();
        assert_eq!(monitor.push_interval(100), None);
        assert_eq!(monitor.push_interval(200), None);
        assert_eq!(monitor.push_interval(300), None);
        assert_eq!(monitor.push_interval(400), Some(250));
        // Oldest entry is overwritten.
        assert_eq!(monitor.push_interval(800), Some(425));
    }

    #[test]
    fn test_short_budget_is_ignored() {
        let (monitor, target) = monitor();
        for i in 0..10 {
            monitor.notify_idle_start(i * 100, 5);
            monitor.notify_idle_end(i * 100 + 50);
        }
        assert!(target.idle.lock().is_empty());
        assert_eq!(monitor.notify_count(), 10);
        assert_eq!(monitor.total_idle_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_irregular_interval_does_not_trigger() {
        let (monitor, target) = monitor();
        for ts in [0, 100, 200, 300, 400] {
            monitor.notify_idle_start(ts, 20);
        }
        assert_eq!(target.idle.lock().len(), 1);

        // Much longer than twice the average.
        monitor.notify_idle_start(5_000, 20);
        assert_eq!(target.idle.lock().len(), 1);
    }

    #[test]
    fn test_short_budget_leaves_cadence_untouched() {
        let (monitor, target) = monitor();
        for ts in [0, 100, 200, 300] {
            monitor.notify_idle_start(ts, 20);
        }
        // Too short to count: the next interval is still measured from 300.
        monitor.notify_idle_start(350, 5);
        monitor.notify_idle_start(400, 20);
        assert_eq!(target.idle.lock().clone(), vec![(400, 20)]);
        assert_eq!(monitor.notify_count(), 6);
    }

    #[test]
    fn test_extreme_timestamps_saturate() {
        let (monitor, target) = monitor();
        for ts in [i64::MIN + 1, -1, 0, i64::MAX - 1, i64::MAX] {
            monitor.notify_idle_start(ts, i64::MAX);
            monitor.notify_idle_end(ts);
        }
        monitor.notify_idle_start(i64::MIN + 1, 20);
        monitor.notify_idle_end(i64::MAX);
        assert!(target.idle.lock().len() <= 1);
    }

    #[test]
    fn test_non_positive_period_resets_ratio_streak() {
        let (monitor, _) = monitor();
        monitor.notify_idle_start(0, 20);
        monitor.interval_monitor_at(1_000);
        assert_eq!(monitor.idle_ratio_streak(), 1);

        // Clock went backwards.
        monitor.interval_monitor_at(500);
        assert_eq!(monitor.idle_ratio_streak(), 0);
    }

    #[test]
    fn test_deferred_freeze_consumed_by_compacting_gc() {
        let config = IdleConfig {
            foreground_check_cycles: 1,
            ..IdleConfig::default()
        };
        let monitor = IdleMonitor::new(config);
        monitor.set_deferred_freeze(true);
        assert!(monitor.is_deferred_freeze());

        monitor.notify_idle_start(0, 20);
        let next = monitor.interval_monitor_at(1_000);
        assert_eq!(next, Duration::from_secs(90));
        assert!(!monitor.take_deferred_freeze());
        assert_eq!(monitor.snapshot().compacting_gc_requests, 1);
    }

    #[test]
    fn test_start_without_scheduler_is_inert() {
        let monitor = Arc::new(IdleMonitor::new(IdleConfig::default()));
        assert!(!monitor.start());
        assert!(!monitor.is_running());
    }
}
