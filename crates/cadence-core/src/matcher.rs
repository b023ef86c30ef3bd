//! Template-match detector: capture polling loop + sustained-episode
//! tracking.
//!
//! Each tick captures the configured region, scores it against the
//! reference template, and classifies matched/unmatched against a
//! threshold. A match held continuously for the sustain window raises a
//! one-shot event, after which the continuity timer restarts from scratch.

use crate::template::TemplateImage;
use crate::{ConfigError, Region};
use crossbeam_channel::{bounded, Receiver, Sender};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Trait for capturing a screen region as a pixel buffer (implemented by
/// cadence-platform).
pub trait ScreenCaptureClient: Send + Sync {
    fn capture(&self, region: &Region) -> Result<RgbaImage, String>;
}

/// Detector tuning. Defaults: 100 ms tick, 0.9 threshold, 5 s sustain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Similarity threshold; a score exactly equal to it counts as matched.
    pub threshold: f64,
    /// Polling period.
    pub tick: Duration,
    /// How long a match must hold continuously before the one-shot event.
    pub sustain: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            tick: Duration::from_millis(100),
            sustain: Duration::from_secs(5),
        }
    }
}

/// Events emitted by the detector loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MatcherEvent {
    /// Emitted every tick with the current classification.
    Tick { matched: bool, score: f64 },
    /// A match held continuously for the sustain window. One-shot per
    /// episode; a fresh full window must accrue before the next one.
    SustainedMatch,
    /// Transient capture trouble; the loop keeps running.
    Error { message: String },
    /// The run cannot continue; the loop has ended.
    Terminated { message: String },
}

/// Tracks how long a match has been continuously true.
#[derive(Debug)]
pub(crate) struct MatchTracker {
    sustain: Duration,
    match_start: Option<Instant>,
}

impl MatchTracker {
    pub(crate) fn new(sustain: Duration) -> Self {
        Self {
            sustain,
            match_start: None,
        }
    }

    /// Feed one classified sample. Returns true exactly once per continuous
    /// episode that reaches the sustain window; the timer then resets so a
    /// fresh full window must accrue before the next firing. Any unmatched
    /// sample breaks the episode.
    pub(crate) fn observe(&mut self, matched: bool, now: Instant) -> bool {
        if !matched {
            self.match_start = None;
            return false;
        }
        match self.match_start {
            None => {
                self.match_start = Some(now);
                false
            }
            Some(start) if now.duration_since(start) >= self.sustain => {
                self.match_start = None;
                true
            }
            Some(_) => false,
        }
    }
}

/// Handle to a running detector thread.
pub struct MatcherHandle {
    event_rx: Receiver<MatcherEvent>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MatcherHandle {
    pub fn events(&self) -> Receiver<MatcherEvent> {
        self.event_rx.clone()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Option<MatcherEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Request the loop to stop at its next tick. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop and wait for the loop thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MatcherHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Template matcher: owns the detection loop on a dedicated thread.
pub struct TemplateMatcher;

impl TemplateMatcher {
    /// Validate the region against the template and start the detection
    /// loop. No state is created when validation fails.
    pub fn spawn(
        capture: Arc<dyn ScreenCaptureClient>,
        region: Region,
        template: TemplateImage,
        config: MatcherConfig,
    ) -> Result<MatcherHandle, ConfigError> {
        region.validate()?;
        if region.width() < template.width() || region.height() < template.height() {
            return Err(ConfigError::RegionSmallerThanTemplate {
                region,
                width: template.width(),
                height: template.height(),
            });
        }

        let (event_tx, event_rx) = bounded(256);
        let running = Arc::new(AtomicBool::new(true));

        let worker_running = running.clone();
        let thread = thread::spawn(move || {
            run_loop(capture, region, template, config, event_tx, worker_running);
        });

        Ok(MatcherHandle {
            event_rx,
            running,
            thread: Some(thread),
        })
    }
}

fn run_loop(
    capture: Arc<dyn ScreenCaptureClient>,
    region: Region,
    template: TemplateImage,
    config: MatcherConfig,
    event_tx: Sender<MatcherEvent>,
    running: Arc<AtomicBool>,
) {
    info!(?region, threshold = config.threshold, "detector thread started");
    let mut tracker = MatchTracker::new(config.sustain);

    while running.load(Ordering::SeqCst) {
        match capture.capture(&region) {
            Ok(frame) => {
                let gray = image::DynamicImage::ImageRgba8(frame).to_luma8();
                match template.best_score(&gray) {
                    Some(score) => {
                        let matched = score >= config.threshold;
                        if tracker.observe(matched, Instant::now()) {
                            info!(score, "sustained match");
                            emit(&event_tx, MatcherEvent::SustainedMatch);
                        }
                        emit(&event_tx, MatcherEvent::Tick { matched, score });
                    }
                    None => {
                        // The frame no longer fits the template; retrying
                        // cannot help.
                        warn!("captured frame smaller than template, ending run");
                        emit(
                            &event_tx,
                            MatcherEvent::Terminated {
                                message: "captured frame is smaller than the template".into(),
                            },
                        );
                        break;
                    }
                }
            }
            Err(e) => {
                // Transient: report it and leave the episode timer as-is; a
                // missed sample is not evidence the match broke.
                warn!(error = %e, "capture failed");
                emit(
                    &event_tx,
                    MatcherEvent::Error {
                        message: format!("capture failed: {e}"),
                    },
                );
            }
        }

        thread::sleep(config.tick);
    }

    running.store(false, Ordering::SeqCst);
    info!("detector thread exiting");
}

fn emit(tx: &Sender<MatcherEvent>, event: MatcherEvent) {
    if tx.try_send(event).is_err() {
        debug!("matcher event dropped (receiver full or gone)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    struct FrameCapture {
        frame: RgbaImage,
    }

    impl ScreenCaptureClient for FrameCapture {
        fn capture(&self, _region: &Region) -> Result<RgbaImage, String> {
            Ok(self.frame.clone())
        }
    }

    struct BrokenCapture;

    impl ScreenCaptureClient for BrokenCapture {
        fn capture(&self, _region: &Region) -> Result<RgbaImage, String> {
            Err("display disconnected".into())
        }
    }

    fn textured(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 29 + y * 13 + 3) % 239) as u8])
        })
    }

    fn to_rgba(gray: &GrayImage) -> RgbaImage {
        image::DynamicImage::ImageLuma8(gray.clone()).to_rgba8()
    }

    fn fast_config() -> MatcherConfig {
        MatcherConfig {
            threshold: 0.9,
            tick: Duration::from_millis(5),
            sustain: Duration::from_millis(30),
        }
    }

    #[test]
    fn sustained_episode_fires_once_then_resets() {
        let t0 = Instant::now();
        let mut tracker = MatchTracker::new(Duration::from_secs(5));

        assert!(!tracker.observe(true, t0));
        assert!(!tracker.observe(true, t0 + Duration::from_secs(3)));
        // Exactly at the window boundary: fires.
        assert!(tracker.observe(true, t0 + Duration::from_secs(5)));
        // Timer restarted; the same instant starts a new episode.
        assert!(!tracker.observe(true, t0 + Duration::from_secs(5)));
        assert!(!tracker.observe(true, t0 + Duration::from_secs(9)));
        assert!(tracker.observe(true, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn broken_continuity_requires_fresh_window() {
        let t0 = Instant::now();
        let mut tracker = MatchTracker::new(Duration::from_secs(5));

        assert!(!tracker.observe(true, t0));
        // Drops out just before the window closes...
        assert!(!tracker.observe(false, t0 + Duration::from_millis(4900)));
        // ...and resumes shortly after: no event, the clock restarted.
        assert!(!tracker.observe(true, t0 + Duration::from_millis(4950)));
        assert!(!tracker.observe(true, t0 + Duration::from_millis(9000)));
        assert!(tracker.observe(true, t0 + Duration::from_millis(9950)));
    }

    #[test]
    fn unmatched_samples_never_fire() {
        let t0 = Instant::now();
        let mut tracker = MatchTracker::new(Duration::from_millis(10));
        for k in 0..20 {
            assert!(!tracker.observe(false, t0 + Duration::from_secs(k)));
        }
    }

    #[test]
    fn degenerate_region_is_rejected() {
        let template = TemplateImage::from_gray(textured(4, 4)).unwrap();
        let result = TemplateMatcher::spawn(
            Arc::new(BrokenCapture),
            Region::new(10, 10, 10, 50),
            template,
            MatcherConfig::default(),
        );
        assert!(matches!(result, Err(ConfigError::DegenerateRegion(_))));
    }

    #[test]
    fn region_smaller_than_template_is_rejected() {
        let template = TemplateImage::from_gray(textured(30, 30)).unwrap();
        let result = TemplateMatcher::spawn(
            Arc::new(BrokenCapture),
            Region::new(0, 0, 20, 20),
            template,
            MatcherConfig::default(),
        );
        assert!(matches!(
            result,
            Err(ConfigError::RegionSmallerThanTemplate { .. })
        ));
    }

    #[test]
    fn matching_frame_raises_sustained_match() {
        let gray = textured(16, 16);
        let capture = Arc::new(FrameCapture {
            frame: to_rgba(&gray),
        });
        let template = TemplateImage::from_gray(gray).unwrap();
        let handle = TemplateMatcher::spawn(
            capture,
            Region::new(0, 0, 16, 16),
            template,
            fast_config(),
        )
        .unwrap();

        let events = handle.events();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut fired = false;
        let mut saw_matched_tick = false;
        while Instant::now() < deadline && !fired {
            match events.recv_timeout(Duration::from_millis(50)) {
                Ok(MatcherEvent::SustainedMatch) => fired = true,
                Ok(MatcherEvent::Tick { matched, score }) => {
                    assert!(matched, "matching frame classified unmatched ({score})");
                    saw_matched_tick = true;
                }
                Ok(_) => {}
                Err(_) => {}
            }
        }
        assert!(saw_matched_tick);
        assert!(fired, "no sustained match within the deadline");
        handle.shutdown();
    }

    #[test]
    fn score_equal_to_threshold_counts_as_matched() {
        // Set the threshold to the exact score the detector computes for
        // this frame, so the inclusive comparison sits on the boundary.
        let gray = textured(12, 12);
        let frame = to_rgba(&gray);
        let observed = image::DynamicImage::ImageRgba8(frame.clone()).to_luma8();
        let template = TemplateImage::from_gray(gray).unwrap();
        let threshold = template.best_score(&observed).unwrap();

        let capture = Arc::new(FrameCapture { frame });
        let config = MatcherConfig {
            threshold,
            ..fast_config()
        };
        let handle = TemplateMatcher::spawn(
            capture,
            Region::new(0, 0, 12, 12),
            template,
            config,
        )
        .unwrap();

        let events = handle.events();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut matched_tick = false;
        while Instant::now() < deadline && !matched_tick {
            if let Ok(MatcherEvent::Tick { matched, .. }) =
                events.recv_timeout(Duration::from_millis(50))
            {
                matched_tick = matched;
            }
        }
        assert!(matched_tick);
        handle.shutdown();
    }

    #[test]
    fn capture_failure_reports_and_keeps_running() {
        let template = TemplateImage::from_gray(textured(4, 4)).unwrap();
        let handle = TemplateMatcher::spawn(
            Arc::new(BrokenCapture),
            Region::new(0, 0, 8, 8),
            template,
            fast_config(),
        )
        .unwrap();

        let events = handle.events();
        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, MatcherEvent::Error { .. }));
        assert!(handle.is_running());
        handle.shutdown();
    }

    #[test]
    fn shrunken_frame_terminates_the_run() {
        // Region says 16x16 but the client hands back a 4x4 frame.
        let capture = Arc::new(FrameCapture {
            frame: to_rgba(&textured(4, 4)),
        });
        let template = TemplateImage::from_gray(textured(8, 8)).unwrap();
        let handle = TemplateMatcher::spawn(
            capture,
            Region::new(0, 0, 16, 16),
            template,
            fast_config(),
        )
        .unwrap();

        let events = handle.events();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut terminated = false;
        while Instant::now() < deadline && !terminated {
            if let Ok(MatcherEvent::Terminated { .. }) =
                events.recv_timeout(Duration::from_millis(50))
            {
                terminated = true;
            }
        }
        assert!(terminated);
        // The loop marks itself stopped on a terminal failure.
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_running());
        handle.shutdown();
    }
}
