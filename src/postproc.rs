//! Drawing detections and the throughput overlay onto frames.
//!
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect, draw_text},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::nn::Bbox;

/// Well-known locations of the overlay font.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
];

const TEXT_SCALE: Scale = Scale { x: 16.0, y: 16.0 };

/// How annotated frames are rendered.
pub struct OverlayOptions {
    /// Detections at or below this confidence are not drawn.
    pub confidence_threshold: f32,
    /// Margin in pixels that drawn boxes are clamped into.
    pub inset: u32,
    /// Font for confidence and throughput text; without one, only boxes are
    /// drawn.
    pub font: Option<Font<'static>>,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            inset: 10,
            font: None,
        }
    }
}

/// Load the overlay font from an explicit path or a well-known location.
pub fn load_overlay_font(explicit: Option<&Path>) -> Option<Font<'static>> {
    let explicit = explicit.map(Path::to_path_buf);
    let candidates = explicit
        .into_iter()
        .chain(FONT_CANDIDATES.iter().copied().map(PathBuf::from));

    for path in candidates {
        match std::fs::read(&path) {
            Ok(bytes) => match Font::try_from_vec(bytes) {
                Some(font) => {
                    log::info!("Using overlay font {}", path.display());
                    return Some(font);
                }
                None => log::warn!("{} is not a usable font", path.display()),
            },
            Err(err) => log::debug!("No font at {}: {err}", path.display()),
        }
    }

    log::warn!("No overlay font found, drawing boxes without text");
    None
}

/// Draw confident detections and the current throughput onto a frame.
///
/// Boxes are clamped into the inset margin on both axes whatever their raw
/// coordinates. Detections at or below the confidence threshold leave the
/// frame untouched.
pub fn annotate_frame(
    frame: RgbImage,
    detections: &[(Bbox, f32)],
    fps: f32,
    opts: &OverlayOptions,
) -> RgbImage {
    let (width, height) = frame.dimensions();
    let color = Rgb::from([0, 255, 0]);

    let mut frame = frame;
    for (bbox, confidence) in detections.iter() {
        if *confidence <= opts.confidence_threshold {
            continue;
        }

        let rect = clamp_to_inset(bbox, width, height, opts.inset);
        frame = draw_hollow_rect(&frame, rect, color);

        if let Some(font) = &opts.font {
            frame = draw_text(
                &frame,
                color,
                rect.left(),
                rect.top(),
                TEXT_SCALE,
                font,
                &format!("{:.2}%", confidence * 100.0),
            );
        }
    }

    if let Some(font) = &opts.font {
        frame = draw_text(
            &frame,
            color,
            opts.inset as i32,
            opts.inset as i32,
            TEXT_SCALE,
            font,
            &format!("{fps:.1} fps"),
        );
    }

    frame
}

/// Map a normalized bounding box to pixel coordinates, clamped into the inset
/// margin of the frame.
fn clamp_to_inset(bbox: &Bbox, width: u32, height: u32, inset: u32) -> Rect {
    let (width, height) = (width as f32, height as f32);
    let inset = inset as f32;

    let x_tl = (bbox[0] * width).clamp(inset, (width - inset - 1.0).max(inset));
    let y_tl = (bbox[1] * height).clamp(inset, (height - inset - 1.0).max(inset));
    let x_br = (bbox[2] * width).clamp(x_tl + 1.0, (width - inset).max(x_tl + 1.0));
    let y_br = (bbox[3] * height).clamp(y_tl + 1.0, (height - inset).max(y_tl + 1.0));

    Rect::at(x_tl as i32, y_tl as i32).of_size((x_br - x_tl) as u32, (y_br - y_tl) as u32)
}

#[cfg(test)]
mod test {
    use super::*;

    fn black_frame(width: u32, height: u32) -> RgbImage {
        RgbImage::new(width, height)
    }

    #[test]
    fn detections_at_or_below_threshold_draw_nothing() {
        let frame = black_frame(100, 80);
        let detections = vec![([0.2, 0.2, 0.6, 0.6], 0.5), ([0.1, 0.1, 0.3, 0.3], 0.2)];

        let annotated = annotate_frame(frame.clone(), &detections, 12.3, &OverlayOptions::default());

        assert_eq!(annotated.as_raw(), frame.as_raw());
    }

    #[test]
    fn out_of_range_box_is_drawn_inside_the_margin() {
        let frame = black_frame(100, 80);
        let detections = vec![([-0.5, -0.5, 1.5, 1.5], 0.9)];

        let annotated = annotate_frame(frame, &detections, 0.0, &OverlayOptions::default());

        let mut touched = 0;
        for (x, y, pixel) in annotated.enumerate_pixels() {
            if pixel.0 != [0, 0, 0] {
                touched += 1;
                assert!((10..90).contains(&x), "pixel x={x} outside margin");
                assert!((10..70).contains(&y), "pixel y={y} outside margin");
            }
        }
        assert!(touched > 0);
    }

    #[test]
    fn clamped_rect_stays_within_margin_for_wild_coordinates() {
        for bbox in [
            [-3.0, -3.0, 4.0, 4.0],
            [0.0, 0.0, 0.05, 0.05],
            [0.97, 0.97, 0.99, 0.99],
            [0.8, 0.1, 0.2, 0.9],
        ] {
            let rect = clamp_to_inset(&bbox, 100, 80, 10);
            assert!(rect.left() >= 10);
            assert!(rect.top() >= 10);
            assert!(rect.right() <= 90);
            assert!(rect.bottom() <= 70);
            assert!(rect.width() >= 1 && rect.height() >= 1);
        }
    }

    #[test]
    fn box_inside_the_margin_is_untouched_by_clamping() {
        let rect = clamp_to_inset(&[0.25, 0.25, 0.5, 0.5], 100, 80, 10);
        assert_eq!((rect.left(), rect.top()), (25, 20));
        assert_eq!((rect.width(), rect.height()), (25, 20));
    }
}
