//! Screen region capture over the `screenshots` crate.

use crate::{PlatformError, PlatformResult};
use cadence_core::{Region, ScreenCaptureClient};
use image::RgbaImage;
use screenshots::Screen;
use tracing::debug;

/// Captures absolute-coordinate regions from whichever display contains the
/// region origin.
pub struct MonitorCapture;

impl MonitorCapture {
    pub fn new() -> Self {
        Self
    }

    fn capture_region(&self, region: &Region) -> PlatformResult<RgbaImage> {
        let screen = Screen::from_point(region.x1, region.y1).map_err(|e| {
            PlatformError::CaptureFailed(format!(
                "no display at ({}, {}): {e}",
                region.x1, region.y1
            ))
        })?;

        let (x, y) = display_relative(region, screen.display_info.x, screen.display_info.y);
        debug!(?region, display = screen.display_info.id, "capturing region");

        screen
            .capture_area(x, y, region.width(), region.height())
            .map_err(|e| PlatformError::CaptureFailed(e.to_string()))
    }
}

impl Default for MonitorCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenCaptureClient for MonitorCapture {
    fn capture(&self, region: &Region) -> Result<RgbaImage, String> {
        self.capture_region(region).map_err(|e| e.to_string())
    }
}

/// `screenshots` works in display-relative coordinates; regions are
/// absolute.
fn display_relative(region: &Region, display_x: i32, display_y: i32) -> (i32, i32) {
    (region.x1 - display_x, region.y1 - display_y)
}
