//! Vision detector adapter.
//!
//! The coordinator treats detection as a pure function from image bytes and
//! a camera id to traffic metrics; whatever model sits behind it must not
//! touch coordinator state. [`RoiDetector`] is the built-in estimator: it
//! knows each camera's region of interest and road geometry from
//! configuration and derives the four metrics from a coarse occupancy
//! estimate of the frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Assumed footprint of an average vehicle, in square meters.
const VEHICLE_AREA_M2: f64 = 5.0;
/// Nominal lane width used to spread a queue across lanes.
const LANE_WIDTH_M: f64 = 3.5;
/// Queue-ratio weight in the pressure score.
const PRESSURE_QUEUE_WEIGHT: f64 = 0.6;
/// Density weight in the pressure score.
const PRESSURE_DENSITY_WEIGHT: f64 = 0.4;

/// Metrics produced for one camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub vehicle_counts: u32,
    pub queue_length_m: f64,
    pub density: f64,
    pub pressure: f64,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    /// No region of interest is registered for this camera.
    #[error("unknown camera: {0}")]
    UnknownCamera(String),

    /// The uploaded bytes cannot be interpreted as a frame.
    #[error("unreadable image for camera {camera_id}: {reason}")]
    UnreadableImage { camera_id: String, reason: String },
}

/// Pure detection function over one frame.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &[u8], camera_id: &str) -> Result<Detection, DetectorError>;
}

/// Region-of-interest calibration for one camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraRoi {
    /// Real-world length of the observed road stretch.
    pub road_length_m: f64,
    /// Real-world width of the observed road stretch.
    pub road_width_m: f64,
    /// Fraction of the frame covered by the road polygon, in `(0, 1]`.
    #[serde(default = "default_roi_fraction")]
    pub roi_fraction: f64,
}

fn default_roi_fraction() -> f64 {
    1.0
}

/// Occupancy-based detector over a per-camera ROI registry.
///
/// Vehicle pixels are darker than empty asphalt in the calibrated frames,
/// so the occupied fraction of the ROI is estimated from the share of
/// low-luminance samples. Crude next to a real model, but it is
/// deterministic, dependency-free, and exercises the full metric pipeline.
pub struct RoiDetector {
    cameras: HashMap<String, CameraRoi>,
}

/// Grayscale threshold below which a sample counts as occupied.
const OCCUPIED_LUMA_THRESHOLD: u8 = 96;

impl RoiDetector {
    pub fn new(cameras: HashMap<String, CameraRoi>) -> Self {
        Self { cameras }
    }

    fn occupancy(image: &[u8], roi_fraction: f64) -> f64 {
        let occupied = image
            .iter()
            .filter(|&&b| b < OCCUPIED_LUMA_THRESHOLD)
            .count();
        occupied as f64 / image.len() as f64 * roi_fraction
    }
}

impl Detector for RoiDetector {
    fn detect(&self, image: &[u8], camera_id: &str) -> Result<Detection, DetectorError> {
        let roi = self
            .cameras
            .get(camera_id)
            .ok_or_else(|| DetectorError::UnknownCamera(camera_id.to_string()))?;

        if image.is_empty() {
            return Err(DetectorError::UnreadableImage {
                camera_id: camera_id.to_string(),
                reason: "empty body".to_string(),
            });
        }

        let road_area_m2 = roi.road_length_m * roi.road_width_m;
        let occupied_area_m2 = Self::occupancy(image, roi.roi_fraction) * road_area_m2;
        let count = (occupied_area_m2 / VEHICLE_AREA_M2).round() as u32;

        Ok(metrics_from_count(count, roi))
    }
}

/// Derives the metric set from a vehicle count and road geometry.
///
/// Queue length assumes vehicles pack bumper-to-bumper across the
/// available lanes; pressure blends the queue-to-length ratio with
/// density and saturates at 1.
pub fn metrics_from_count(count: u32, roi: &CameraRoi) -> Detection {
    let road_area_m2 = roi.road_length_m * roi.road_width_m;
    let density = round4(f64::from(count) * VEHICLE_AREA_M2 / road_area_m2).min(1.0);

    let queue_length_m = if count > 0 {
        let lanes = roi.road_width_m / LANE_WIDTH_M;
        round2(f64::from(count) * VEHICLE_AREA_M2 / lanes)
    } else {
        0.0
    };

    let queue_ratio = (queue_length_m / roi.road_length_m).min(1.0);
    let pressure = PRESSURE_QUEUE_WEIGHT * queue_ratio + PRESSURE_DENSITY_WEIGHT * density;
    let pressure = round4(pressure.min(1.0));

    Detection {
        vehicle_counts: count,
        queue_length_m,
        density,
        pressure,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Detector returning canned metrics per camera; unknown cameras still
/// fail, which makes it a drop-in for error-path tests.
#[cfg(test)]
pub(crate) struct FixedDetector {
    pub results: HashMap<String, Detection>,
}

#[cfg(test)]
impl Detector for FixedDetector {
    fn detect(&self, _image: &[u8], camera_id: &str) -> Result<Detection, DetectorError> {
        self.results
            .get(camera_id)
            .copied()
            .ok_or_else(|| DetectorError::UnknownCamera(camera_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi() -> CameraRoi {
        CameraRoi {
            road_length_m: 100.0,
            road_width_m: 7.0,
            roi_fraction: 1.0,
        }
    }

    fn detector() -> RoiDetector {
        RoiDetector::new(HashMap::from([("CC_01".to_string(), roi())]))
    }

    #[test]
    fn test_unknown_camera_is_typed_error() {
        let err = detector().detect(&[1, 2, 3], "CC_99").unwrap_err();
        assert!(matches!(err, DetectorError::UnknownCamera(id) if id == "CC_99"));
    }

    #[test]
    fn test_empty_image_is_unreadable() {
        let err = detector().detect(&[], "CC_01").unwrap_err();
        assert!(matches!(err, DetectorError::UnreadableImage { .. }));
    }

    #[test]
    fn test_bright_frame_reports_empty_road() {
        let frame = vec![200u8; 4096];
        let detection = detector().detect(&frame, "CC_01").unwrap();
        assert_eq!(detection.vehicle_counts, 0);
        assert_eq!(detection.queue_length_m, 0.0);
        assert_eq!(detection.density, 0.0);
        assert_eq!(detection.pressure, 0.0);
    }

    #[test]
    fn test_darker_frame_reports_more_vehicles() {
        let mut light = vec![200u8; 4096];
        light[..512].fill(10); // 12.5% occupied
        let mut heavy = vec![200u8; 4096];
        heavy[..2048].fill(10); // 50% occupied

        let d_light = detector().detect(&light, "CC_01").unwrap();
        let d_heavy = detector().detect(&heavy, "CC_01").unwrap();
        assert!(d_heavy.vehicle_counts > d_light.vehicle_counts);
        assert!(d_heavy.pressure > d_light.pressure);
    }

    #[test]
    fn test_metric_formulas_match_calibration() {
        // 10 vehicles on a 100 m x 7 m stretch: 50 m2 occupied.
        let detection = metrics_from_count(10, &roi());
        assert_eq!(detection.vehicle_counts, 10);
        assert!((detection.density - 0.0714).abs() < 1e-9);
        assert_eq!(detection.queue_length_m, 25.0); // 10 * 5.0 / (7 / 3.5)
        // 0.6 * 0.25 + 0.4 * 0.0714 = 0.1786 (rounded)
        assert!((detection.pressure - 0.1786).abs() < 1e-4);
    }

    #[test]
    fn test_pressure_and_density_saturate_at_one() {
        let detection = metrics_from_count(500, &roi());
        assert!(detection.density <= 1.0);
        assert!(detection.pressure <= 1.0);
    }
}
