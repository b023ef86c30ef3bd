//! Click injection implementations.

use crate::{PlatformError, PlatformResult};
use cadence_core::ClickInjector;
use enigo::{Button, Coordinate, Direction, Enigo, Mouse, Settings};
use std::sync::Mutex;
use tracing::debug;

/// Minimal no-op injector for early development / dry runs.
pub struct NoopInjector;

impl ClickInjector for NoopInjector {
    fn click(&self, x: i32, y: i32) -> Result<(), String> {
        debug!(x, y, "NoopInjector: would click");
        Ok(())
    }
}

/// Real click injector using the `enigo` crate.
pub struct EnigoInjector {
    enigo: Mutex<Enigo>,
}

impl EnigoInjector {
    pub fn new() -> PlatformResult<Self> {
        let settings = Settings::default();
        let enigo = Enigo::new(&settings).map_err(|e| {
            PlatformError::InjectionFailed(format!("failed to create Enigo: {e}"))
        })?;
        Ok(Self {
            enigo: Mutex::new(enigo),
        })
    }

    /// Move the pointer and click the left button: press immediately
    /// followed by release, completed before this returns.
    fn left_click(&self, x: i32, y: i32) -> PlatformResult<()> {
        let mut enigo = self.enigo.lock().unwrap();
        debug!(x, y, "injecting left click");
        enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(|e| PlatformError::InjectionFailed(e.to_string()))?;
        enigo
            .button(Button::Left, Direction::Click)
            .map_err(|e| PlatformError::InjectionFailed(e.to_string()))?;
        Ok(())
    }
}

impl ClickInjector for EnigoInjector {
    fn click(&self, x: i32, y: i32) -> Result<(), String> {
        self.left_click(x, y).map_err(|e| e.to_string())
    }
}
