//! Bounding-box arithmetic: IoU, containment, and ROI extraction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BBox;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("invalid box: width {width} / height {height} must both be positive")]
    InvalidBox { width: f32, height: f32 },
    #[error("degenerate ROI: shorter side {side} below minimum {min_side}")]
    DegenerateRoi { side: f32, min_side: f32 },
}

/// ROI extraction parameters.
///
/// Fractions are relative to the person box height: the head ROI spans the
/// top `head_frac`, the torso ROI spans `torso_start` to the bottom. Both
/// span the full width.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoiConfig {
    pub head_frac: f32,
    pub torso_start: f32,
    /// ROIs whose shorter side falls below this are too small to verify.
    pub min_roi_side: f32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            head_frac: 0.4,
            torso_start: 0.2,
            min_roi_side: 20.0,
        }
    }
}

fn require_valid(b: &BBox) -> Result<(), GeometryError> {
    if b.is_valid() {
        Ok(())
    } else {
        Err(GeometryError::InvalidBox {
            width: b.width(),
            height: b.height(),
        })
    }
}

/// Intersection-over-union of two boxes, in `[0, 1]`.
///
/// Fails with `InvalidBox` when either box has non-positive extent; never
/// divides by zero.
pub fn iou(a: &BBox, b: &BBox) -> Result<f32, GeometryError> {
    require_valid(a)?;
    require_valid(b)?;

    let x_min = a.x_min.max(b.x_min);
    let y_min = a.y_min.max(b.y_min);
    let x_max = a.x_max.min(b.x_max);
    let y_max = a.y_max.min(b.y_max);

    let inter_w = (x_max - x_min).max(0.0);
    let inter_h = (y_max - y_min).max(0.0);
    let intersection = inter_w * inter_h;
    if intersection == 0.0 {
        return Ok(0.0);
    }

    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        Ok(intersection / union)
    } else {
        Ok(0.0)
    }
}

/// Fraction of `inner`'s area that lies inside `outer`, in `[0, 1]`.
///
/// Used to associate an equipment detection with the person wearing it:
/// a helmet box sits mostly inside its person box even though their IoU
/// is tiny.
pub fn containment(inner: &BBox, outer: &BBox) -> Result<f32, GeometryError> {
    require_valid(inner)?;
    require_valid(outer)?;

    let x_min = inner.x_min.max(outer.x_min);
    let y_min = inner.y_min.max(outer.y_min);
    let x_max = inner.x_max.min(outer.x_max);
    let y_max = inner.y_max.min(outer.y_max);

    let inter_w = (x_max - x_min).max(0.0);
    let inter_h = (y_max - y_min).max(0.0);
    Ok(inter_w * inter_h / inner.area())
}

/// Head region of a person box: top `head_frac` of height, full width.
pub fn head_roi(person: &BBox, cfg: &RoiConfig) -> Result<BBox, GeometryError> {
    require_valid(person)?;
    let roi = BBox::new(
        person.x_min,
        person.y_min,
        person.x_max,
        person.y_min + person.height() * cfg.head_frac,
    );
    check_roi_size(roi, cfg)
}

/// Torso region of a person box: from `torso_start` of height to the
/// bottom, full width.
pub fn torso_roi(person: &BBox, cfg: &RoiConfig) -> Result<BBox, GeometryError> {
    require_valid(person)?;
    let roi = BBox::new(
        person.x_min,
        person.y_min + person.height() * cfg.torso_start,
        person.x_max,
        person.y_max,
    );
    check_roi_size(roi, cfg)
}

fn check_roi_size(roi: BBox, cfg: &RoiConfig) -> Result<BBox, GeometryError> {
    let side = roi.width().min(roi.height());
    if side < cfg.min_roi_side {
        return Err(GeometryError::DegenerateRoi {
            side,
            min_side: cfg.min_roi_side,
        });
    }
    Ok(roi)
}
