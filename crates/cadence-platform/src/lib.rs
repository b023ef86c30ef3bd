//! cadence-platform: OS I/O boundary for cadence.
//!
//! This crate provides:
//! - Click injection via `enigo`
//! - Screen region capture via `screenshots`
//!
//! Both adapters implement the traits `cadence-core` polls through
//! ([`cadence_core::ClickInjector`], [`cadence_core::ScreenCaptureClient`]),
//! so the core never touches an OS API directly.

mod capture;
mod error;
mod injector;

pub use capture::MonitorCapture;
pub use error::{PlatformError, PlatformResult};
pub use injector::{EnigoInjector, NoopInjector};
