//! HUD overlay and JPEG encoding.
//!
//! Draws the status header, marker dot, calibration ring, FOLLOW target
//! and completion banner onto a copy of the captured frame, then encodes
//! JPEG at quality 80.

use eyre::eyre;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut, draw_text_mut,
};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};

use steadyscript_types::{Calibration, ExerciseMode, SessionState};

pub const JPEG_QUALITY: u8 = 80;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const CYAN: Rgb<u8> = Rgb([0, 255, 255]);
const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const GREY: Rgb<u8> = Rgb([200, 200, 200]);
const PANEL: Rgb<u8> = Rgb([30, 30, 30]);

/// Everything the renderer needs to know about the current tick.
#[derive(Debug, Clone)]
pub struct Hud {
    pub mode: ExerciseMode,
    pub state: SessionState,
    pub camera_live: bool,
    pub marker: Option<(i32, i32)>,
    pub calibration: Option<Calibration>,
    pub inside: bool,
    pub elapsed: f64,
    pub remaining: f64,
    pub bpm: u32,
    pub beats: u64,
    pub target: Option<(f64, f64)>,
    pub final_score: Option<f64>,
}

pub struct OverlayRenderer {
    font: Font<'static>,
}

impl OverlayRenderer {
    pub fn new() -> eyre::Result<Self> {
        let font = Font::try_from_bytes(ttf_firacode::REGULAR)
            .ok_or_else(|| eyre!("embedded font failed to parse"))?;
        Ok(Self { font })
    }

    fn mode_color(mode: ExerciseMode) -> Rgb<u8> {
        match mode {
            ExerciseMode::Hold => CYAN,
            ExerciseMode::Follow => ORANGE,
        }
    }

    /// Draw the HUD onto a copy of the frame.
    pub fn render(&self, frame: &RgbImage, hud: &Hud) -> RgbImage {
        let mut img = frame.clone();
        let (w, h) = (img.width() as i32, img.height() as i32);
        let scale = Scale::uniform(18.0);
        let small = Scale::uniform(14.0);

        // Header strip: connection dot, mode label, timer.
        draw_filled_rect_mut(&mut img, Rect::at(0, 0).of_size(img.width(), 36), PANEL);
        let dot = if hud.camera_live { GREEN } else { RED };
        draw_filled_circle_mut(&mut img, (14, 18), 6, dot);
        draw_text_mut(
            &mut img,
            Self::mode_color(hud.mode),
            30,
            9,
            scale,
            &self.font,
            &format!("Mode: {}", hud.mode),
        );
        if hud.mode == ExerciseMode::Follow {
            draw_text_mut(
                &mut img,
                GREY,
                190,
                9,
                scale,
                &self.font,
                &format!("BPM: {}  Beat: {}", hud.bpm, hud.beats),
            );
        }
        match hud.state {
            SessionState::Running => {
                draw_text_mut(
                    &mut img,
                    GREEN,
                    w - 260,
                    9,
                    scale,
                    &self.font,
                    &format!("{:.1}s / {:.1}s left", hud.elapsed, hud.remaining),
                );
            }
            SessionState::Complete => {
                draw_text_mut(&mut img, CYAN, w - 180, 9, scale, &self.font, "COMPLETE");
            }
            SessionState::Idle => {}
        }

        // Calibration ring (HOLD).
        if hud.mode == ExerciseMode::Hold {
            if let Some(cal) = &hud.calibration {
                let ring = if hud.inside { GREEN } else { RED };
                let r = cal.radius.round() as i32;
                for dr in -1..=1 {
                    draw_hollow_circle_mut(&mut img, cal.center, (r + dr).max(1), ring);
                }
            }
        }

        // FOLLOW target dot.
        if let Some((tx, ty)) = hud.target {
            draw_filled_circle_mut(&mut img, (tx.round() as i32, ty.round() as i32), 8, ORANGE);
        }

        // Marker dot in mode colour, or a notice when it is lost.
        match hud.marker {
            Some(pos) => {
                let color = Self::mode_color(hud.mode);
                draw_filled_circle_mut(&mut img, pos, 5, color);
                draw_hollow_circle_mut(&mut img, pos, 12, color);
            }
            None => {
                draw_text_mut(
                    &mut img,
                    RED,
                    10,
                    h - 24,
                    small,
                    &self.font,
                    "Marker: NOT FOUND",
                );
            }
        }

        // Final score banner for one second after completion.
        if let Some(score) = hud.final_score {
            let bw = 260u32;
            let bx = (w - bw as i32) / 2;
            let by = h / 2 - 24;
            draw_filled_rect_mut(&mut img, Rect::at(bx, by).of_size(bw, 48), PANEL);
            let color = if score >= 80.0 {
                GREEN
            } else if score >= 50.0 {
                YELLOW
            } else {
                RED
            };
            draw_text_mut(
                &mut img,
                color,
                bx + 20,
                by + 14,
                scale,
                &self.font,
                &format!("Score: {score:.0}/100"),
            );
        }

        img
    }

    /// Render and JPEG-encode in one step.
    pub fn render_jpeg(&self, frame: &RgbImage, hud: &Hud) -> eyre::Result<Vec<u8>> {
        let img = self.render(frame, hud);
        encode_jpeg(&img)
    }
}

pub fn encode_jpeg(img: &RgbImage) -> eyre::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    encoder.encode_image(img)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hud() -> Hud {
        Hud {
            mode: ExerciseMode::Hold,
            state: SessionState::Running,
            camera_live: true,
            marker: Some((320, 240)),
            calibration: Some(Calibration {
                center: (320, 240),
                radius: 40.0,
            }),
            inside: true,
            elapsed: 3.2,
            remaining: 6.8,
            bpm: 60,
            beats: 0,
            target: None,
            final_score: None,
        }
    }

    #[test]
    fn renders_and_encodes_jpeg() {
        let renderer = OverlayRenderer::new().unwrap();
        let frame = RgbImage::from_pixel(640, 480, Rgb([10, 10, 10]));
        let jpeg = renderer.render_jpeg(&frame, &test_hud()).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(jpeg.len() > 1000);
    }

    #[test]
    fn marker_dot_uses_mode_color() {
        let renderer = OverlayRenderer::new().unwrap();
        let frame = RgbImage::from_pixel(640, 480, Rgb([0, 0, 0]));
        let img = renderer.render(&frame, &test_hud());
        assert_eq!(img.get_pixel(320, 240).0, CYAN.0);
    }

    #[test]
    fn follow_target_drawn() {
        let renderer = OverlayRenderer::new().unwrap();
        let frame = RgbImage::from_pixel(640, 480, Rgb([0, 0, 0]));
        let mut hud = test_hud();
        hud.mode = ExerciseMode::Follow;
        hud.calibration = None;
        hud.target = Some((440.0, 240.0));
        let img = renderer.render(&frame, &hud);
        assert_eq!(img.get_pixel(440, 240).0, ORANGE.0);
    }

    #[test]
    fn lost_marker_notice_is_rendered() {
        let renderer = OverlayRenderer::new().unwrap();
        let frame = RgbImage::from_pixel(640, 480, Rgb([0, 0, 0]));
        let mut hud = test_hud();
        hud.marker = None;
        // Must not panic; the notice text lands near the bottom left.
        let img = renderer.render(&frame, &hud);
        let changed = (440u32..480)
            .flat_map(|y| (0u32..220).map(move |x| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y).0 != [0, 0, 0])
            .count();
        assert!(changed > 0);
    }
}
