//! Coordinator: owns both loops, starts/stops them as a unit, and wires the
//! sustained-match hand-off into the scheduler's forced-click path.
//!
//! Events from both workers are drained by a pump thread into a single
//! outward mailbox, so the embedding shell observes one ordered stream and
//! the sustained-match dispatch cannot race a concurrent scheduler tick.

use crate::matcher::{
    MatcherConfig, MatcherEvent, MatcherHandle, ScreenCaptureClient, TemplateMatcher,
};
use crate::scheduler::{
    ClickInjector, ClickScheduler, SchedulerController, SchedulerEvent, SchedulerHandle,
    SchedulerSnapshot,
};
use crate::template::TemplateImage;
use crate::{ConfigError, IntervalPattern, Point, Region};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    /// No loops running; configuration is open.
    Idle,
    /// Both loops running as a unit; configuration is locked.
    Running,
}

/// Optional detection setup. The scheduler runs unconditionally; detection
/// only when a region and template are both configured.
pub struct DetectionConfig {
    pub region: Region,
    pub template: TemplateImage,
    pub config: MatcherConfig,
}

/// Merged outward event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    /// Scheduler observable state, refreshed every scheduler tick.
    Schedule(SchedulerSnapshot),
    /// A click happened (deadline, or out-of-band when `forced`).
    Clicked { clicks: u64, forced: bool },
    /// Current match classification, refreshed every detector tick.
    Match { matched: bool, score: f64 },
    /// A sustained match triggered the out-of-band click and cycle reset.
    Resynchronized { clicks: u64 },
    /// Human-readable status/error line.
    Status { message: String },
}

struct RunHandles {
    scheduler: SchedulerHandle,
    matcher: Option<MatcherHandle>,
    pump: Option<JoinHandle<()>>,
    pump_running: Arc<AtomicBool>,
    event_rx: Receiver<RunEvent>,
}

/// Owns both workers and starts/stops them as a unit.
pub struct Coordinator {
    injector: Arc<dyn ClickInjector>,
    capture: Arc<dyn ScreenCaptureClient>,
    target: Option<Point>,
    pattern: IntervalPattern,
    detection: Option<DetectionConfig>,
    run: Option<RunHandles>,
}

impl Coordinator {
    pub fn new(injector: Arc<dyn ClickInjector>, capture: Arc<dyn ScreenCaptureClient>) -> Self {
        Self {
            injector,
            capture,
            target: None,
            pattern: IntervalPattern::default(),
            detection: None,
            run: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        if self.run.is_some() {
            CoordinatorState::Running
        } else {
            CoordinatorState::Idle
        }
    }

    fn ensure_idle(&self) -> Result<(), ConfigError> {
        match self.run {
            Some(_) => Err(ConfigError::RunInProgress),
            None => Ok(()),
        }
    }

    /// Set the click target. Locked while a run is active.
    pub fn set_target(&mut self, target: Point) -> Result<(), ConfigError> {
        self.ensure_idle()?;
        self.target = Some(target);
        Ok(())
    }

    pub fn target(&self) -> Option<Point> {
        self.target
    }

    /// Replace the interval pattern. Locked while a run is active. The
    /// validated pattern is what a sustained-match reset restores.
    pub fn set_pattern(&mut self, pattern: IntervalPattern) -> Result<(), ConfigError> {
        self.ensure_idle()?;
        pattern.validate()?;
        self.pattern = pattern;
        Ok(())
    }

    pub fn pattern(&self) -> &IntervalPattern {
        &self.pattern
    }

    /// Configure detection. Locked while a run is active.
    pub fn set_detection(
        &mut self,
        region: Region,
        template: TemplateImage,
        config: MatcherConfig,
    ) -> Result<(), ConfigError> {
        self.ensure_idle()?;
        region.validate()?;
        self.detection = Some(DetectionConfig {
            region,
            template,
            config,
        });
        Ok(())
    }

    pub fn clear_detection(&mut self) -> Result<(), ConfigError> {
        self.ensure_idle()?;
        self.detection = None;
        Ok(())
    }

    /// Start both loops as a unit. Fails without creating any run state
    /// when the target is missing, a run is already active, or either
    /// worker rejects its configuration.
    pub fn start_all(&mut self) -> Result<(), ConfigError> {
        self.ensure_idle()?;
        let target = self.target.ok_or(ConfigError::MissingTarget)?;

        let matcher = match &self.detection {
            Some(d) => Some(TemplateMatcher::spawn(
                self.capture.clone(),
                d.region,
                d.template.clone(),
                d.config,
            )?),
            None => None,
        };

        let scheduler = match ClickScheduler::spawn(self.injector.clone(), target, &self.pattern) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(matcher) = matcher {
                    matcher.shutdown();
                }
                return Err(e);
            }
        };

        let (out_tx, out_rx) = bounded(256);
        let pump_running = Arc::new(AtomicBool::new(true));
        let pump = spawn_pump(
            scheduler.controller(),
            scheduler.events(),
            matcher.as_ref().map(|m| m.events()),
            out_tx,
            pump_running.clone(),
        );

        info!(?target, detection = self.detection.is_some(), "run started");
        self.run = Some(RunHandles {
            scheduler,
            matcher,
            pump: Some(pump),
            pump_running,
            event_rx: out_rx,
        });
        Ok(())
    }

    /// Stop both loops and wait for every thread to exit before returning.
    /// Idempotent; no event is delivered after this returns.
    pub fn stop_all(&mut self) {
        let Some(run) = self.run.take() else { return };
        let RunHandles {
            scheduler,
            matcher,
            mut pump,
            pump_running,
            ..
        } = run;

        // Pump first, so no queued sustained-match dispatch can land on a
        // scheduler that is tearing down.
        pump_running.store(false, Ordering::SeqCst);
        if let Some(pump) = pump.take() {
            let _ = pump.join();
        }

        if let Some(matcher) = matcher {
            matcher.shutdown();
        }
        scheduler.shutdown();
        info!("run stopped");
    }

    /// Drain one outward event, if any.
    pub fn try_recv(&self) -> Option<RunEvent> {
        self.run.as_ref().and_then(|r| r.event_rx.try_recv().ok())
    }

    /// Scheduler observable state for the active run.
    pub fn snapshot(&self) -> Option<SchedulerSnapshot> {
        self.run.as_ref().map(|r| r.scheduler.snapshot())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn spawn_pump(
    scheduler: SchedulerController,
    scheduler_rx: Receiver<SchedulerEvent>,
    matcher_rx: Option<Receiver<MatcherEvent>>,
    out_tx: Sender<RunEvent>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        debug!("event pump started");

        while running.load(Ordering::SeqCst) {
            if let Some(rx) = &matcher_rx {
                while let Ok(event) = rx.try_recv() {
                    match event {
                        MatcherEvent::SustainedMatch => {
                            // Out-of-band click + cycle reset, dispatched
                            // synchronously before any further event.
                            scheduler.force_click();
                            let clicks = scheduler.snapshot().clicks;
                            forward(&out_tx, RunEvent::Resynchronized { clicks });
                            forward(
                                &out_tx,
                                RunEvent::Status {
                                    message: "sustained match: clicked and reset the cycle".into(),
                                },
                            );
                        }
                        MatcherEvent::Tick { matched, score } => {
                            forward(&out_tx, RunEvent::Match { matched, score });
                        }
                        MatcherEvent::Error { message } | MatcherEvent::Terminated { message } => {
                            forward(&out_tx, RunEvent::Status { message });
                        }
                    }
                }
            }

            while let Ok(event) = scheduler_rx.try_recv() {
                match event {
                    SchedulerEvent::Tick(snapshot) => {
                        forward(&out_tx, RunEvent::Schedule(snapshot));
                    }
                    SchedulerEvent::Clicked { clicks, forced } => {
                        forward(&out_tx, RunEvent::Clicked { clicks, forced });
                    }
                    SchedulerEvent::Error { message } => {
                        forward(&out_tx, RunEvent::Status { message });
                    }
                }
            }

            thread::sleep(Duration::from_millis(10));
        }

        debug!("event pump exiting");
    })
}

fn forward(tx: &Sender<RunEvent>, event: RunEvent) {
    if tx.try_send(event).is_err() {
        debug!("run event dropped (mailbox full or closed)");
    }
}
