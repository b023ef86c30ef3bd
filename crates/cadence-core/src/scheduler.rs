//! Click scheduling engine: cyclic deadline loop + forced-click path.
//!
//! The loop runs on its own thread and keeps an absolute schedule: each
//! click pushes the deadline forward by the next interval in the cycle, so
//! timing error never accumulates across clicks. The forced-click path used
//! for resynchronization enters the same critical section as the tick loop.

use crate::{ConfigError, IntervalPattern, Point};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Trait for moving the pointer and synthesizing a left click at an
/// absolute screen coordinate (implemented by cadence-platform).
pub trait ClickInjector: Send + Sync {
    fn click(&self, x: i32, y: i32) -> Result<(), String>;
}

/// Events emitted by the scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    /// Emitted after every tick, whether or not a click fired.
    Tick(SchedulerSnapshot),
    /// A click was injected at a deadline, or out-of-band when `forced`.
    Clicked { clicks: u64, forced: bool },
    /// A transient failure; the loop keeps running.
    Error { message: String },
}

/// Observable scheduler state, refreshed every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub elapsed: Duration,
    pub clicks: u64,
    pub until_next: Duration,
}

impl SchedulerSnapshot {
    /// Run time as HH:MM:SS.
    pub fn elapsed_display(&self) -> String {
        let total = self.elapsed.as_secs();
        format!(
            "{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        )
    }

    /// Time to the next click in seconds, one decimal.
    pub fn countdown_display(&self) -> String {
        format!("{:.1}s", self.until_next.as_secs_f64())
    }
}

/// Schedule state shared between the tick loop and the forced-click path.
/// Every mutation happens under the one mutex wrapping this struct.
#[derive(Debug)]
pub(crate) struct SchedulerState {
    started_at: Instant,
    pattern: Vec<Duration>,
    original: Vec<Duration>,
    index: usize,
    deadline: Instant,
    clicks: u64,
}

impl SchedulerState {
    pub(crate) fn new(now: Instant, pattern: &IntervalPattern) -> Self {
        let intervals = pattern.intervals().to_vec();
        let deadline = now + intervals[0];
        Self {
            started_at: now,
            original: intervals.clone(),
            pattern: intervals,
            index: 0,
            deadline,
            clicks: 0,
        }
    }

    /// Inclusive deadline check: a click due exactly now fires now.
    pub(crate) fn due(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Record a deadline click: advance the cyclic index and push the
    /// deadline forward by the new interval.
    pub(crate) fn record_click(&mut self) {
        self.clicks += 1;
        self.index = (self.index + 1) % self.pattern.len();
        self.deadline += self.pattern[self.index];
    }

    /// Record a forced click and resynchronize: original pattern, index 0,
    /// next deadline one full first interval from now.
    pub(crate) fn force_reset(&mut self, now: Instant) {
        self.clicks += 1;
        self.pattern = self.original.clone();
        self.index = 0;
        self.deadline = now + self.pattern[0];
    }

    pub(crate) fn snapshot(&self, now: Instant) -> SchedulerSnapshot {
        SchedulerSnapshot {
            elapsed: now.duration_since(self.started_at),
            clicks: self.clicks,
            until_next: self.deadline.saturating_duration_since(now),
        }
    }
}

/// Sleep coarsely far from the deadline and finely near it, bounding the
/// worst-case click-time error to about the smallest granularity.
fn tick_sleep(until_next: Duration) -> Duration {
    if until_next > Duration::from_secs(1) {
        Duration::from_millis(100)
    } else if until_next > Duration::from_millis(100) {
        Duration::from_millis(10)
    } else {
        Duration::from_millis(1)
    }
}

/// Cloneable control surface for a running scheduler.
#[derive(Clone)]
pub struct SchedulerController {
    shared: Arc<Mutex<SchedulerState>>,
    target: Point,
    injector: Arc<dyn ClickInjector>,
    event_tx: Sender<SchedulerEvent>,
    running: Arc<AtomicBool>,
}

impl SchedulerController {
    /// Click immediately, bypassing the deadline, and reset the cycle to
    /// its original configuration. Takes the same lock as the tick loop, so
    /// a forced click can never interleave with a deadline click.
    pub fn force_click(&self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("forced click ignored: scheduler not running");
            return;
        }
        let mut state = self.shared.lock().unwrap();
        match self.injector.click(self.target.x, self.target.y) {
            Ok(()) => {
                let now = Instant::now();
                state.force_reset(now);
                debug!(clicks = state.clicks, "forced click, cycle reset");
                self.emit(SchedulerEvent::Clicked {
                    clicks: state.clicks,
                    forced: true,
                });
                self.emit(SchedulerEvent::Tick(state.snapshot(now)));
            }
            Err(e) => {
                warn!(error = %e, "forced click injection failed");
                self.emit(SchedulerEvent::Error {
                    message: format!("injection failed: {e}"),
                });
            }
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.shared.lock().unwrap().snapshot(Instant::now())
    }

    /// Request the loop to stop at its next tick. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SchedulerEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("scheduler event dropped (receiver full or gone)");
        }
    }
}

/// Handle to a running scheduler thread.
pub struct SchedulerHandle {
    controller: SchedulerController,
    event_rx: Receiver<SchedulerEvent>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn controller(&self) -> SchedulerController {
        self.controller.clone()
    }

    pub fn events(&self) -> Receiver<SchedulerEvent> {
        self.event_rx.clone()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Option<SchedulerEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.controller.snapshot()
    }

    pub fn force_click(&self) {
        self.controller.force_click()
    }

    pub fn stop(&self) {
        self.controller.stop()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stop and wait for the loop thread to exit.
    pub fn shutdown(mut self) {
        self.controller.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.controller.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Click scheduler: owns the deadline loop on a dedicated thread.
pub struct ClickScheduler;

impl ClickScheduler {
    /// Validate the pattern and start a run. No state is created when
    /// validation fails.
    pub fn spawn(
        injector: Arc<dyn ClickInjector>,
        target: Point,
        pattern: &IntervalPattern,
    ) -> Result<SchedulerHandle, ConfigError> {
        pattern.validate()?;

        let (event_tx, event_rx) = bounded(256);
        let shared = Arc::new(Mutex::new(SchedulerState::new(Instant::now(), pattern)));
        let running = Arc::new(AtomicBool::new(true));

        let controller = SchedulerController {
            shared,
            target,
            injector,
            event_tx,
            running,
        };

        let worker = controller.clone();
        let thread = thread::spawn(move || run_loop(worker));

        Ok(SchedulerHandle {
            controller,
            event_rx,
            thread: Some(thread),
        })
    }
}

fn run_loop(ctl: SchedulerController) {
    info!(target = ?ctl.target, "scheduler thread started");

    while ctl.running.load(Ordering::SeqCst) {
        let snapshot = {
            let mut state = ctl.shared.lock().unwrap();
            let now = Instant::now();
            if state.due(now) {
                match ctl.injector.click(ctl.target.x, ctl.target.y) {
                    Ok(()) => {
                        state.record_click();
                        debug!(clicks = state.clicks, "deadline click");
                        ctl.emit(SchedulerEvent::Clicked {
                            clicks: state.clicks,
                            forced: false,
                        });
                    }
                    Err(e) => {
                        // Deadline stays due; retried on the next tick.
                        warn!(error = %e, "click injection failed");
                        ctl.emit(SchedulerEvent::Error {
                            message: format!("injection failed: {e}"),
                        });
                    }
                }
            }
            state.snapshot(Instant::now())
        };

        ctl.emit(SchedulerEvent::Tick(snapshot));
        thread::sleep(tick_sleep(snapshot.until_next));
    }

    info!("scheduler thread exiting");
}
