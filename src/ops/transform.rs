// ============================================================================
// TRANSFORM OPERATIONS — flip, rotate, resize for the whole canvas
// ============================================================================
//
// All of these touch every layer of every frame.  Each one drops any active
// selection and returns a snapshot action; undo restores the selection.

use image::{ImageBuffer, Rgba, imageops};
use rayon::prelude::*;

use crate::canvas::{CanvasState, MAX_CANVAS_DIM, TiledImage};
use crate::color::Color;
use crate::components::history::{CanvasSnapshot, HistoryAction};
use crate::error::{EngineError, Result};

/// Interpolation method for resize operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos3,
}

impl Interpolation {
    pub fn label(&self) -> &'static str {
        match self {
            Interpolation::Nearest => "Nearest",
            Interpolation::Bilinear => "Bilinear",
            Interpolation::Bicubic => "Bicubic",
            Interpolation::Lanczos3 => "Lanczos3",
        }
    }

    pub fn all() -> &'static [Interpolation] {
        &[
            Interpolation::Nearest,
            Interpolation::Bilinear,
            Interpolation::Bicubic,
            Interpolation::Lanczos3,
        ]
    }

    pub fn from_name(name: &str) -> Option<Interpolation> {
        Self::all().iter().copied().find(|i| i.label().eq_ignore_ascii_case(name.trim()))
    }

    pub fn to_filter(&self) -> imageops::FilterType {
        match self {
            Interpolation::Nearest => imageops::FilterType::Nearest,
            Interpolation::Bilinear => imageops::FilterType::Triangle,
            Interpolation::Bicubic => imageops::FilterType::CatmullRom,
            Interpolation::Lanczos3 => imageops::FilterType::Lanczos3,
        }
    }
}

/// Where the old content sits inside a resized canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Anchor {
    #[default]
    TopLeft,
    Top,
    TopRight,
    Left,
    Center,
    Right,
    BottomLeft,
    Bottom,
    BottomRight,
}

impl Anchor {
    const NAMES: [(&'static str, Anchor); 9] = [
        ("top-left", Anchor::TopLeft),
        ("top", Anchor::Top),
        ("top-right", Anchor::TopRight),
        ("left", Anchor::Left),
        ("center", Anchor::Center),
        ("right", Anchor::Right),
        ("bottom-left", Anchor::BottomLeft),
        ("bottom", Anchor::Bottom),
        ("bottom-right", Anchor::BottomRight),
    ];

    pub fn from_name(name: &str) -> Option<Anchor> {
        let name = name.trim().to_ascii_lowercase().replace('_', "-");
        Self::NAMES.iter().find(|(n, _)| *n == name).map(|(_, a)| *a)
    }

    /// (column, row) each in {0, 1, 2} = start / centre / end.
    fn factors(&self) -> (i64, i64) {
        match self {
            Anchor::TopLeft => (0, 0),
            Anchor::Top => (1, 0),
            Anchor::TopRight => (2, 0),
            Anchor::Left => (0, 1),
            Anchor::Center => (1, 1),
            Anchor::Right => (2, 1),
            Anchor::BottomLeft => (0, 2),
            Anchor::Bottom => (1, 2),
            Anchor::BottomRight => (2, 2),
        }
    }

    fn offset(&self, old: u32, new: u32, factor: i64) -> i64 {
        let diff = new as i64 - old as i64;
        match factor {
            0 => 0,
            1 => diff / 2,
            _ => diff,
        }
    }
}

fn check_size(w: u32, h: u32) -> Result<()> {
    if w == 0 || h == 0 || w > MAX_CANVAS_DIM || h > MAX_CANVAS_DIM {
        return Err(EngineError::invalid(format!(
            "canvas size {}x{} outside 1..={}",
            w, h, MAX_CANVAS_DIM
        )));
    }
    Ok(())
}

/// Run `f` between two snapshots and package the result as one action.
fn snapshot_op(
    state: &mut CanvasState,
    description: &str,
    f: impl FnOnce(&mut CanvasState),
) -> HistoryAction {
    state.clear_preview();
    // The selection is part of `before` so undo brings it back.
    let before = CanvasSnapshot::capture(state);
    state.clear_selection(None);
    f(state);
    state.mark_dirty(None);
    let after = CanvasSnapshot::capture(state);
    HistoryAction::canvas(description, before, after)
}

fn map_layers(state: &mut CanvasState, f: impl Fn(&TiledImage) -> TiledImage + Sync) {
    for frame in &mut state.frames {
        frame.layers.par_iter_mut().for_each(|layer| {
            layer.pixels = f(&layer.pixels);
        });
    }
}

// ---------------------------------------------------------------------------
//  Whole-canvas transforms
// ---------------------------------------------------------------------------

/// Flip the entire canvas horizontally (mirror left↔right).
pub fn flip_horizontal(state: &mut CanvasState) -> HistoryAction {
    snapshot_op(state, "Flip Horizontal", |s| map_layers(s, TiledImage::flipped_horizontal))
}

/// Flip the entire canvas vertically (mirror top↔bottom).
pub fn flip_vertical(state: &mut CanvasState) -> HistoryAction {
    snapshot_op(state, "Flip Vertical", |s| map_layers(s, TiledImage::flipped_vertical))
}

/// Rotate the entire canvas 90° clockwise (swaps W↔H).
pub fn rotate_90cw(state: &mut CanvasState) -> HistoryAction {
    snapshot_op(state, "Rotate 90° CW", |s| {
        map_layers(s, TiledImage::rotated_90cw);
        std::mem::swap(&mut s.width, &mut s.height);
    })
}

/// Rotate the entire canvas 90° counter-clockwise (swaps W↔H).
pub fn rotate_90ccw(state: &mut CanvasState) -> HistoryAction {
    snapshot_op(state, "Rotate 90° CCW", |s| {
        map_layers(s, TiledImage::rotated_90ccw);
        std::mem::swap(&mut s.width, &mut s.height);
    })
}

pub fn rotate_180(state: &mut CanvasState) -> HistoryAction {
    snapshot_op(state, "Rotate 180°", |s| map_layers(s, TiledImage::rotated_180))
}

/// Scale every layer to `new_w × new_h` with the given interpolation.
pub fn resize_image(state: &mut CanvasState, new_w: u32, new_h: u32, interp: Interpolation) -> Result<HistoryAction> {
    check_size(new_w, new_h)?;
    let filter = interp.to_filter();
    Ok(snapshot_op(state, "Resize Image", |s| {
        map_layers(s, |src| {
            if src.is_empty() {
                return TiledImage::new(new_w, new_h);
            }
            let flat = to_rgba32f(src);
            let resized = imageops::resize(&flat, new_w, new_h, filter);
            let pixels: Vec<Color> = resized.pixels().map(|p| Color::from(*p).clamped()).collect();
            TiledImage::from_pixels(new_w, new_h, &pixels)
        });
        s.width = new_w;
        s.height = new_h;
    }))
}

/// Change the canvas dimensions without scaling, placing the old content
/// at `anchor`.  New area is transparent; content pushed outside is cropped.
pub fn resize_canvas(state: &mut CanvasState, new_w: u32, new_h: u32, anchor: Anchor) -> Result<HistoryAction> {
    check_size(new_w, new_h)?;
    let (old_w, old_h) = (state.width, state.height);
    let (fx, fy) = anchor.factors();
    let dx = anchor.offset(old_w, new_w, fx);
    let dy = anchor.offset(old_h, new_h, fy);
    Ok(snapshot_op(state, "Resize Canvas", |s| {
        map_layers(s, |src| src.shifted(new_w, new_h, dx, dy));
        s.width = new_w;
        s.height = new_h;
    }))
}

fn to_rgba32f(src: &TiledImage) -> ImageBuffer<Rgba<f32>, Vec<f32>> {
    let (w, h) = (src.width(), src.height());
    ImageBuffer::from_fn(w, h, |x, y| Rgba::<f32>::from(src.get_pixel(x, y)))
}
