//! Drawing of recognized text boxes over the input image.
//!
//! Produces the per-service annotated PNG: the normalized page with word,
//! line and paragraph polygons overlaid, and the recognized text next to
//! each box when a font is available. Without a font only the geometry is
//! drawn.

use std::path::Path;

use ab_glyph::FontVec;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_line_segment_mut, draw_text_mut};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{BoxKind, TextBox};

const WORD_COLOR: Rgb<u8> = Rgb([230, 50, 50]);
const LINE_COLOR: Rgb<u8> = Rgb([50, 120, 230]);
const PARAGRAPH_COLOR: Rgb<u8> = Rgb([50, 180, 80]);
const TEXT_COLOR: Rgb<u8> = Rgb([120, 20, 120]);
const FONT_SCALE: f32 = 14.0;

pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// A missing or unparsable font is not fatal: annotation degrades to
    /// boxes without labels.
    pub fn new(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(data) => match FontVec::try_from_vec(data) {
                Ok(font) => {
                    info!("Using annotation font {}", path.display());
                    Some(font)
                }
                Err(_) => {
                    debug!("Cannot parse font file {}; drawing boxes only", path.display());
                    None
                }
            },
            Err(e) => {
                debug!("Cannot read font file {}: {e}; drawing boxes only", path.display());
                None
            }
        });
        Self { font }
    }

    /// Render `boxes` over the image at `source` and write the result to
    /// `dest` as PNG.
    pub fn annotate(&self, source: &Path, boxes: &[TextBox], dest: &Path) -> Result<()> {
        let img = image::ImageReader::open(source)?.decode()?;
        let mut canvas = img.to_rgb8();

        // Paragraphs first so word and line outlines stay visible on top.
        for kind in [BoxKind::Paragraph, BoxKind::Line, BoxKind::Word] {
            for text_box in boxes.iter().filter(|b| b.kind == kind) {
                draw_polygon(&mut canvas, &text_box.polygon, color_for(kind));
            }
        }

        if let Some(ref font) = self.font {
            for text_box in boxes.iter().filter(|b| b.kind == BoxKind::Word) {
                draw_label(&mut canvas, text_box, font);
            }
        }

        canvas.save(dest)?;
        debug!("Wrote annotated image {}", dest.display());
        Ok(())
    }
}

fn color_for(kind: BoxKind) -> Rgb<u8> {
    match kind {
        BoxKind::Word => WORD_COLOR,
        BoxKind::Line => LINE_COLOR,
        BoxKind::Paragraph => PARAGRAPH_COLOR,
    }
}

/// Outline a polygon by connecting consecutive corners, closing back to the
/// first. Degenerate polygons with fewer than two corners draw nothing.
fn draw_polygon(canvas: &mut RgbImage, polygon: &[(f32, f32)], color: Rgb<u8>) {
    if polygon.len() < 2 {
        return;
    }
    for i in 0..polygon.len() {
        let start = polygon[i];
        let end = polygon[(i + 1) % polygon.len()];
        draw_line_segment_mut(canvas, start, end, color);
    }
}

fn draw_label(canvas: &mut RgbImage, text_box: &TextBox, font: &FontVec) {
    if text_box.text.is_empty() {
        return;
    }
    let Some(&(x, y)) = text_box.polygon.first() else {
        return;
    };
    // Label sits just above the upper-left corner, clamped into the image.
    let label_x = (x.max(0.0)) as i32;
    let label_y = ((y - FONT_SCALE).max(0.0)) as i32;
    if label_x < canvas.width() as i32 && label_y < canvas.height() as i32 {
        draw_text_mut(
            canvas,
            TEXT_COLOR,
            label_x,
            label_y,
            FONT_SCALE,
            font,
            &text_box.text,
        );
    }
}
