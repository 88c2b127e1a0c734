//! HSV colour-segmentation marker detector.
//!
//! Per frame: convert RGB to HSV (OpenCV scale, H ∈ [0, 179]), threshold
//! against the active [HsvRange] (taking the union of two hue slices when
//! the range wraps), clean the mask with a morphological open then close,
//! label connected components, and report the pixel-mass centroid of the
//! largest component at or above the minimum area.

use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::time::Instant;
use tracing::trace;

use steadyscript_types::HsvRange;

/// Components smaller than this many pixels are treated as speckle.
pub const MIN_MARKER_AREA: u32 = 50;

/// L∞ radius of the morphology structuring element (a 5×5 square).
const MORPH_RADIUS: u8 = 2;

/// Result of running the detector on one frame.
///
/// Invariant: `detected() ⇔ position.is_some()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerObservation {
    pub position: Option<(i32, i32)>,
    pub timestamp: Instant,
}

impl MarkerObservation {
    pub fn detected(&self) -> bool {
        self.position.is_some()
    }
}

/// Convert one RGB pixel to HSV on the OpenCV 8-bit scale.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f64, g as f64, b as f64);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let v = max;
    let s = if max == 0.0 { 0.0 } else { 255.0 * delta / max };
    let h_deg = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    let h_deg = if h_deg < 0.0 { h_deg + 360.0 } else { h_deg };

    let h = ((h_deg / 2.0).round() as u16 % 180) as u8;
    (h, s.round() as u8, v.round() as u8)
}

pub struct MarkerDetector {
    hsv: HsvRange,
    min_area: u32,
}

impl MarkerDetector {
    pub fn new(hsv: HsvRange) -> Self {
        Self {
            hsv,
            min_area: MIN_MARKER_AREA,
        }
    }

    pub fn hsv_range(&self) -> HsvRange {
        self.hsv
    }

    /// Swap the active range. Callers apply this between frames only, so a
    /// frame is never thresholded against a half-updated range.
    pub fn set_hsv(&mut self, hsv: HsvRange) {
        trace!("hsv range updated to {hsv:?}");
        self.hsv = hsv;
    }

    /// The post-morphology binary mask, for the debug view.
    pub fn mask(&self, frame: &RgbImage) -> GrayImage {
        let mut mask = GrayImage::new(frame.width(), frame.height());
        for (x, y, pixel) in frame.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let (h, s, v) = rgb_to_hsv(r, g, b);
            if self.hsv.contains(h, s, v) {
                mask.put_pixel(x, y, Luma([255u8]));
            }
        }
        // Open suppresses speckle, close fills pinholes.
        let mask = imageproc::morphology::open(&mask, Norm::LInf, MORPH_RADIUS);
        imageproc::morphology::close(&mask, Norm::LInf, MORPH_RADIUS)
    }

    /// Detect the marker in a frame.
    pub fn detect(&self, frame: &RgbImage) -> MarkerObservation {
        let timestamp = Instant::now();
        let mask = self.mask(frame);
        let position = largest_component_centroid(&mask, self.min_area);
        MarkerObservation {
            position,
            timestamp,
        }
    }
}

/// Centroid (m10/m00, m01/m00) of the largest connected component with at
/// least `min_area` pixels, rounded to integer pixels. Ties go to the
/// first-labelled (raster-order) component.
fn largest_component_centroid(mask: &GrayImage, min_area: u32) -> Option<(i32, i32)> {
    let labelled = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    // Per-label pixel count and coordinate sums. Labels are assigned in
    // raster order starting at 1; 0 is background.
    let mut stats: Vec<(u64, u64, u64)> = Vec::new();
    for (x, y, pixel) in labelled.enumerate_pixels() {
        let label = pixel.0[0] as usize;
        if label == 0 {
            continue;
        }
        if stats.len() < label {
            stats.resize(label, (0, 0, 0));
        }
        let entry = &mut stats[label - 1];
        entry.0 += 1;
        entry.1 += x as u64;
        entry.2 += y as u64;
    }

    let mut best: Option<(u64, u64, u64)> = None;
    for &(count, sx, sy) in &stats {
        if count < min_area as u64 {
            continue;
        }
        // Strict comparison keeps the first-encountered component on ties.
        if best.map_or(true, |(best_count, _, _)| count > best_count) {
            best = Some((count, sx, sy));
        }
    }

    best.map(|(count, sx, sy)| {
        let cx = (sx as f64 / count as f64).round() as i32;
        let cy = (sy as f64 / count as f64).round() as i32;
        (cx, cy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use steadyscript_types::PenColor;

    fn blank(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([0, 0, 0]))
    }

    fn fill_square(img: &mut RgbImage, x0: u32, y0: u32, side: u32, color: Rgb<u8>) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.put_pixel(x, y, color);
            }
        }
    }

    #[test]
    fn hsv_conversion_matches_opencv_convention() {
        // Pure blue: H 120, full saturation and value.
        assert_eq!(rgb_to_hsv(0, 0, 255), (120, 255, 255));
        // Pure green: H 60.
        assert_eq!(rgb_to_hsv(0, 255, 0), (60, 255, 255));
        // Pure red: H 0.
        assert_eq!(rgb_to_hsv(255, 0, 0), (0, 255, 255));
        // Black and white have zero saturation.
        assert_eq!(rgb_to_hsv(0, 0, 0).1, 0);
        assert_eq!(rgb_to_hsv(255, 255, 255), (0, 0, 255));
    }

    #[test]
    fn detects_blue_square_centroid() {
        let mut img = blank(640, 480);
        // 11x11 square centred on (320, 240).
        fill_square(&mut img, 315, 235, 11, Rgb([0, 0, 255]));

        let detector = MarkerDetector::new(PenColor::Blue.hsv_range());
        let obs = detector.detect(&img);
        assert!(obs.detected());
        assert_eq!(obs.position, Some((320, 240)));
    }

    #[test]
    fn small_speckle_is_rejected() {
        let mut img = blank(160, 120);
        // 5x5 = 25 px, below the 50 px minimum area.
        fill_square(&mut img, 60, 60, 5, Rgb([0, 0, 255]));

        let detector = MarkerDetector::new(PenColor::Blue.hsv_range());
        let obs = detector.detect(&img);
        assert!(!obs.detected());
        assert_eq!(obs.position, None);
    }

    #[test]
    fn largest_component_wins() {
        let mut img = blank(320, 240);
        fill_square(&mut img, 20, 20, 10, Rgb([0, 0, 255]));
        fill_square(&mut img, 200, 100, 20, Rgb([0, 0, 255]));

        let detector = MarkerDetector::new(PenColor::Blue.hsv_range());
        let obs = detector.detect(&img);
        // Centre of the 20x20 square at (200..219, 100..119).
        assert_eq!(obs.position, Some((210, 110)));
    }

    #[test]
    fn hue_wrap_detects_both_slices() {
        // Range wrapping hue zero: [170, 10].
        let range = HsvRange::new([170, 100, 100], [10, 255, 255]);
        let detector = MarkerDetector::new(range);

        // Pure red sits at H=0, inside the upper slice.
        let mut img = blank(320, 240);
        fill_square(&mut img, 50, 50, 12, Rgb([255, 0, 0]));
        assert!(detector.detect(&img).detected());

        // A magenta-leaning red sits just below 180, inside the lower slice.
        // rgb(255, 0, 40) -> hue ~351 deg -> H ~175.
        let mut img = blank(320, 240);
        fill_square(&mut img, 50, 50, 12, Rgb([255, 0, 40]));
        assert!(detector.detect(&img).detected());

        // Green is in neither slice.
        let mut img = blank(320, 240);
        fill_square(&mut img, 50, 50, 12, Rgb([0, 255, 0]));
        assert!(!detector.detect(&img).detected());
    }

    #[test]
    fn empty_frame_not_detected() {
        let detector = MarkerDetector::new(PenColor::Green.hsv_range());
        let obs = detector.detect(&blank(640, 480));
        assert!(!obs.detected());
    }

    #[test]
    fn morphology_open_removes_isolated_pixels() {
        let mut img = blank(160, 120);
        // Scatter isolated marker-coloured pixels; open() should clear them.
        for i in 0..40 {
            img.put_pixel(3 * i + 2, (7 * i) % 118, Rgb([0, 0, 255]));
        }
        let detector = MarkerDetector::new(PenColor::Blue.hsv_range());
        let mask = detector.mask(&img);
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }
}
