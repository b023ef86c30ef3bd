//! cadence-core: click scheduling + template detection engine.
//!
//! Design goal: keep this crate UI-agnostic and platform-agnostic.
//! Platform specific I/O (inject/capture) lives in `cadence-platform`;
//! the core only talks to it through the [`ClickInjector`] and
//! [`ScreenCaptureClient`] traits, so every loop in here runs unchanged
//! against fakes in tests.

mod coordinator;
mod matcher;
mod scheduler;
mod template;

pub use coordinator::{Coordinator, CoordinatorState, DetectionConfig, RunEvent};
pub use matcher::{
    MatcherConfig, MatcherEvent, MatcherHandle, ScreenCaptureClient, TemplateMatcher,
};
pub use scheduler::{
    ClickInjector, ClickScheduler, SchedulerController, SchedulerEvent, SchedulerHandle,
    SchedulerSnapshot,
};
pub use template::{TemplateError, TemplateImage};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Absolute screen coordinate used as the click target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Screen rectangle watched by the template matcher, in absolute
/// coordinates. Valid when x1 < x2 and y1 < y2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Region {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    /// Reject rectangles with zero or negative extent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.x1 < self.x2 && self.y1 < self.y2 {
            Ok(())
        } else {
            Err(ConfigError::DegenerateRegion(*self))
        }
    }
}

/// Cyclic list of wait durations between successive clicks. After the last
/// element the schedule wraps back to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalPattern(Vec<Duration>);

impl IntervalPattern {
    /// Wrap a list of intervals. Validation happens when a run starts, so
    /// an empty or zero-length pattern is representable but never runnable.
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self(intervals)
    }

    /// Convenience constructor from fractional seconds.
    pub fn from_secs_f64(secs: &[f64]) -> Self {
        Self(secs.iter().map(|&s| Duration::from_secs_f64(s)).collect())
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A runnable pattern has at least one interval and every interval is
    /// strictly positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.0.is_empty() {
            return Err(ConfigError::EmptyPattern);
        }
        for (index, interval) in self.0.iter().enumerate() {
            if interval.is_zero() {
                return Err(ConfigError::NonPositiveInterval { index });
            }
        }
        Ok(())
    }
}

impl Default for IntervalPattern {
    /// The stock alternating 9 s / 10 s cycle.
    fn default() -> Self {
        Self::from_secs_f64(&[9.0, 10.0])
    }
}

/// Configuration errors. Raised synchronously before any run state is
/// created or mutated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("interval pattern is empty")]
    EmptyPattern,
    #[error("interval {index} is not positive")]
    NonPositiveInterval { index: usize },
    #[error("match region {0:?} has no area")]
    DegenerateRegion(Region),
    #[error("match region {region:?} is smaller than the {width}x{height} template")]
    RegionSmallerThanTemplate {
        region: Region,
        width: u32,
        height: u32,
    },
    #[error("no click target configured")]
    MissingTarget,
    #[error("configuration is locked while a run is active")]
    RunInProgress,
}
