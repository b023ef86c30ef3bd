//! Reference template loading and similarity scoring.
//!
//! Scoring is zero-mean normalized cross-correlation of the template slid
//! over every placement in the captured frame; the best placement's score is
//! reported, in [-1, 1].

use image::GrayImage;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors from loading a reference template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to load template: {0}")]
    Load(#[from] image::ImageError),
    #[error("template image has no pixels")]
    EmptyImage,
}

/// A reference image reduced to single-channel intensity, matched against
/// captured frames. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct TemplateImage {
    gray: GrayImage,
}

impl TemplateImage {
    /// Load a template from any raster format the `image` crate decodes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let gray = image::open(path)?.to_luma8();
        debug!(?path, width = gray.width(), height = gray.height(), "loaded template");
        Self::from_gray(gray)
    }

    /// Wrap an already-grayscale image.
    pub fn from_gray(gray: GrayImage) -> Result<Self, TemplateError> {
        if gray.width() == 0 || gray.height() == 0 {
            return Err(TemplateError::EmptyImage);
        }
        Ok(Self { gray })
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    /// Best correlation score of this template over every placement in
    /// `frame`. None when the frame is smaller than the template in either
    /// dimension.
    pub fn best_score(&self, frame: &GrayImage) -> Option<f64> {
        zncc_best(frame, &self.gray)
    }
}

/// Sliding-window ZNCC. Flat windows and flat templates score 0.0: with no
/// variance there is nothing to correlate against.
fn zncc_best(frame: &GrayImage, template: &GrayImage) -> Option<f64> {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = template.dimensions();
    if fw < tw || fh < th {
        return None;
    }

    let n = (tw * th) as f64;
    let tpl: Vec<f64> = template.as_raw().iter().map(|&p| p as f64).collect();
    let tpl_mean = tpl.iter().sum::<f64>() / n;
    let tpl_dev: Vec<f64> = tpl.iter().map(|v| v - tpl_mean).collect();
    let tpl_denom = tpl_dev.iter().map(|d| d * d).sum::<f64>().sqrt();
    if tpl_denom == 0.0 {
        return Some(0.0);
    }

    let fdata = frame.as_raw();
    let mut best = f64::NEG_INFINITY;

    for oy in 0..=(fh - th) {
        for ox in 0..=(fw - tw) {
            let mut sum = 0.0;
            for y in 0..th {
                let row = ((oy + y) * fw + ox) as usize;
                for x in 0..tw as usize {
                    sum += fdata[row + x] as f64;
                }
            }
            let window_mean = sum / n;

            let mut num = 0.0;
            let mut window_sq = 0.0;
            for y in 0..th {
                let row = ((oy + y) * fw + ox) as usize;
                let tpl_row = (y * tw) as usize;
                for x in 0..tw as usize {
                    let dev = fdata[row + x] as f64 - window_mean;
                    num += dev * tpl_dev[tpl_row + x];
                    window_sq += dev * dev;
                }
            }

            let score = if window_sq == 0.0 {
                0.0
            } else {
                num / (window_sq.sqrt() * tpl_denom)
            };
            if score > best {
                best = score;
            }
        }
    }

    Some(best.clamp(-1.0, 1.0))
}
