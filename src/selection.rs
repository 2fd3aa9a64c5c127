// ============================================================================
// SELECTION SYSTEM — pixel-set selection with take / move / rotate / commit
// ============================================================================
//
// Lifecycle:  Empty → Selecting → Selected → {Moving, Rotating} → Selected
//
// While Moving or Rotating the selection owns the lifted ("taken") colors;
// the layer underneath shows a transparent hole until commit, reset or clear.

use std::collections::{BTreeMap, BTreeSet};

use crate::blend::{BlendMode, blend};
use crate::canvas::{CanvasState, LayerRef, PixelRect, TiledImage, write_recorded};
use crate::color::Color;
use crate::components::history::HistoryAction;
use crate::error::{EngineError, Result};
use crate::log_warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionState {
    #[default]
    Empty,
    Selecting,
    Selected,
    Moving,
    Rotating,
}

/// Persistent part of a selection, stored in history entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectionSnapshot {
    pub pixels: BTreeSet<(u32, u32)>,
    pub rotation_center: (f32, f32),
}

#[derive(Clone, Debug)]
struct TakenPixels {
    layer: LayerRef,
    /// Colors as lifted, keyed by their original position.
    source: BTreeMap<(i32, i32), Color>,
    /// Colors after rotation, keyed by position before `offset` is applied.
    projected: BTreeMap<(i32, i32), Color>,
    angle: f32,
}

#[derive(Clone, Debug, Default)]
pub struct Selection {
    state: SelectionState,
    pixels: BTreeSet<(u32, u32)>,
    offset: (i32, i32),
    rotation_center: (f32, f32),
    taken: Option<TakenPixels>,
}


impl Selection {
    pub fn state(&self) -> SelectionState {
        self.state
    }

    pub fn offset(&self) -> (i32, i32) {
        self.offset
    }

    pub fn rotation_center(&self) -> (f32, f32) {
        self.rotation_center
    }

    pub fn set_rotation_center(&mut self, x: f32, y: f32) {
        self.rotation_center = (x, y);
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty() && self.taken.is_none()
    }

    /// True while taken pixels are detached from the layer.
    pub fn is_transforming(&self) -> bool {
        self.taken.is_some()
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.pixels.contains(&(x, y))
    }

    /// Selected coordinates, ordered by x then y.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.pixels.iter().copied()
    }

    /// Bounding box of the selection.  While transforming this is the box of
    /// the projected pixels at the current offset, clipped to the canvas.
    pub fn bounds(&self, width: u32, height: u32) -> Option<PixelRect> {
        if let Some(taken) = &self.taken {
            let (ox, oy) = self.offset;
            let mut it = taken.projected.keys().map(|&(x, y)| (x + ox, y + oy));
            let (fx, fy) = it.next()?;
            let (lx, ly, hx, hy) = it.fold((fx, fy, fx, fy), |(lx, ly, hx, hy), (x, y)| {
                (lx.min(x), ly.min(y), hx.max(x), hy.max(y))
            });
            return PixelRect::clipped(lx, ly, hx, hy, width, height);
        }
        let mut it = self.pixels.iter();
        let &(fx, fy) = it.next()?;
        let (lx, ly, hx, hy) = it.fold((fx, fy, fx, fy), |(lx, ly, hx, hy), &(x, y)| {
            (lx.min(x), ly.min(y), hx.max(x), hy.max(y))
        });
        Some(PixelRect::new(lx, ly, hx, hy))
    }

    pub fn snapshot(&self) -> SelectionSnapshot {
        SelectionSnapshot { pixels: self.pixels.clone(), rotation_center: self.rotation_center }
    }

    /// Replace the selection with a stored one.  Any taken pixels are
    /// dropped; the caller restores layer contents separately.
    pub fn restore(&mut self, snap: &SelectionSnapshot) {
        self.pixels = snap.pixels.clone();
        self.rotation_center = snap.rotation_center;
        self.offset = (0, 0);
        self.taken = None;
        self.state = if self.pixels.is_empty() { SelectionState::Empty } else { SelectionState::Selected };
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        if self.taken.is_some() {
            return Err(EngineError::invalid(format!("cannot {} while a selection is being transformed", what)));
        }
        Ok(())
    }

    fn recenter(&mut self) {
        if let Some(b) = self.bounds(u32::MAX, u32::MAX) {
            self.rotation_center = ((b.min_x + b.max_x) as f32 * 0.5, (b.min_y + b.max_y) as f32 * 0.5);
        }
    }

    // ---- building ----------------------------------------------------------

    pub fn select_rect(&mut self, rect: PixelRect) -> Result<()> {
        self.ensure_idle("select")?;
        self.pixels = rect.pixels().collect();
        self.offset = (0, 0);
        self.state = SelectionState::Selected;
        self.recenter();
        Ok(())
    }

    pub fn select_all(&mut self, width: u32, height: u32) -> Result<()> {
        self.select_rect(PixelRect::full(width, height))
    }

    pub fn begin_selecting(&mut self) -> Result<()> {
        self.ensure_idle("start a selection")?;
        self.pixels.clear();
        self.offset = (0, 0);
        self.state = SelectionState::Selecting;
        Ok(())
    }

    /// Add a pixel while Selecting.  Idle selections switch to Selecting
    /// and grow from their current contents.
    pub fn add_pixel(&mut self, x: u32, y: u32) {
        if self.taken.is_some() {
            return;
        }
        self.state = SelectionState::Selecting;
        self.pixels.insert((x, y));
    }

    pub fn finish_selecting(&mut self) {
        if self.state != SelectionState::Selecting {
            return;
        }
        self.state = if self.pixels.is_empty() { SelectionState::Empty } else { SelectionState::Selected };
        self.recenter();
    }

    /// Start a point-origin selection at `(x, y)`, logging the selection
    /// change into `action`.
    pub fn set_pixel_with_history(
        &mut self,
        x: u32,
        y: u32,
        action: Option<&mut HistoryAction>,
    ) -> Result<()> {
        self.ensure_idle("select")?;
        let before = self.snapshot();
        self.pixels.clear();
        self.pixels.insert((x, y));
        self.offset = (0, 0);
        self.state = SelectionState::Selected;
        self.rotation_center = (x as f32, y as f32);
        if let Some(action) = action {
            action.record_selection(before, self.snapshot());
        }
        Ok(())
    }

    // ---- transform ---------------------------------------------------------

    /// Lift the selected pixels off `layer`, leaving transparency behind.
    pub fn take_selected_colors(
        &mut self,
        layer: &mut TiledImage,
        r: LayerRef,
        mut action: Option<&mut HistoryAction>,
    ) -> Result<()> {
        self.ensure_idle("take pixels")?;
        if self.pixels.is_empty() {
            return Err(EngineError::invalid("nothing is selected"));
        }
        let mut source = BTreeMap::new();
        for &(x, y) in &self.pixels {
            source.insert((x as i32, y as i32), layer.get_pixel(x, y));
            write_recorded(layer, r, x, y, Color::TRANSPARENT, action.as_deref_mut());
        }
        self.taken = Some(TakenPixels { layer: r, projected: source.clone(), source, angle: 0.0 });
        self.offset = (0, 0);
        self.state = SelectionState::Moving;
        Ok(())
    }

    pub fn move_by(&mut self, dx: i32, dy: i32) -> Result<()> {
        if self.taken.is_none() {
            return Err(EngineError::invalid("move requires taken pixels"));
        }
        self.offset = (self.offset.0 + dx, self.offset.1 + dy);
        self.state = SelectionState::Moving;
        Ok(())
    }

    /// Paint the taken pixels back at the current offset and rotation.
    /// Transparent destinations receive the taken color unchanged; others
    /// get it composited source-over.
    pub fn commit_selected_colors(
        &mut self,
        layer: &mut TiledImage,
        mut action: Option<&mut HistoryAction>,
    ) -> Result<()> {
        let Some(taken) = self.taken.take() else {
            return Err(EngineError::invalid("commit requires taken pixels"));
        };
        let (ox, oy) = self.offset;
        let (w, h) = (layer.width() as i32, layer.height() as i32);
        let mut landed = BTreeSet::new();

        for (&(x, y), &color) in &taken.projected {
            let (dx, dy) = (x + ox, y + oy);
            if dx < 0 || dy < 0 || dx >= w || dy >= h {
                continue;
            }
            let (dx, dy) = (dx as u32, dy as u32);
            let existing = layer.get_pixel(dx, dy);
            let out = if existing.a <= 0.0 { color } else { blend(existing, color, BlendMode::Normal, 1.0) };
            write_recorded(layer, taken.layer, dx, dy, out, action.as_deref_mut());
            landed.insert((dx, dy));
        }

        self.pixels = landed;
        self.rotation_center = (self.rotation_center.0 + ox as f32, self.rotation_center.1 + oy as f32);
        self.offset = (0, 0);
        self.state = if self.pixels.is_empty() { SelectionState::Empty } else { SelectionState::Selected };
        Ok(())
    }

    /// Put the taken pixels back where they came from.
    pub fn reset(&mut self, layer: &mut TiledImage, mut action: Option<&mut HistoryAction>) -> Result<()> {
        let Some(taken) = self.taken.take() else {
            return Err(EngineError::invalid("reset requires taken pixels"));
        };
        for (&(x, y), &color) in &taken.source {
            write_recorded(layer, taken.layer, x as u32, y as u32, color, action.as_deref_mut());
        }
        self.offset = (0, 0);
        self.state = if self.pixels.is_empty() { SelectionState::Empty } else { SelectionState::Selected };
        Ok(())
    }

    /// Drop the selection without committing.  Taken pixels are restored
    /// first.  Safe to call repeatedly.
    pub fn clear(&mut self, layer: Option<&mut TiledImage>, action: Option<&mut HistoryAction>) {
        if let Some(layer) = layer
            && self.taken.is_some()
            && let Err(e) = self.reset(layer, action)
        {
            log_warn!("Could not restore taken pixels: {}", e);
        }
        self.taken = None;
        self.pixels.clear();
        self.offset = (0, 0);
        self.state = SelectionState::Empty;
    }

    /// Layer the taken pixels were lifted from.
    pub fn taken_layer(&self) -> Option<LayerRef> {
        self.taken.as_ref().map(|t| t.layer)
    }

    /// Rotate the taken pixels by `angle_degrees` (clockwise, accumulating
    /// with earlier rotations) about the rotation center.
    ///
    /// Each source pixel is forward-mapped to its rounded destination.  With
    /// `interpolate_empty`, holes inside the rotated bounding box are filled
    /// by inverse-mapping into the source and bilinearly weighting the four
    /// neighbouring source pixels; `ignore_empty_colors` drops fully
    /// transparent neighbours from that weighting.
    pub fn rotate_selection(
        &mut self,
        angle_degrees: f32,
        interpolate_empty: bool,
        ignore_empty_colors: bool,
    ) -> Result<()> {
        let (cx, cy) = self.rotation_center;
        let Some(taken) = self.taken.as_mut() else {
            return Err(EngineError::invalid("rotate requires taken pixels"));
        };
        taken.angle = (taken.angle + angle_degrees).rem_euclid(360.0);
        let (sin, cos) = taken.angle.to_radians().sin_cos();

        let mut projected = BTreeMap::new();
        for (&(x, y), &color) in &taken.source {
            let (rx, ry) = (x as f32 - cx, y as f32 - cy);
            let nx = (cx + rx * cos - ry * sin).round() as i32;
            let ny = (cy + rx * sin + ry * cos).round() as i32;
            projected.insert((nx, ny), color);
        }

        if interpolate_empty && !projected.is_empty() {
            let (mut lx, mut ly, mut hx, mut hy) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
            for &(x, y) in projected.keys() {
                lx = lx.min(x);
                ly = ly.min(y);
                hx = hx.max(x);
                hy = hy.max(y);
            }
            let mut fills = Vec::new();
            for y in ly..=hy {
                for x in lx..=hx {
                    if projected.contains_key(&(x, y)) {
                        continue;
                    }
                    // Inverse rotation back into source space.
                    let (rx, ry) = (x as f32 - cx, y as f32 - cy);
                    let sx = cx + rx * cos + ry * sin;
                    let sy = cy - rx * sin + ry * cos;
                    if let Some(c) = sample_bilinear(&taken.source, sx, sy, ignore_empty_colors) {
                        fills.push(((x, y), c));
                    }
                }
            }
            projected.extend(fills);
        }

        taken.projected = projected;
        self.state = SelectionState::Rotating;
        Ok(())
    }
}

/// Weighted average of the four source pixels around `(sx, sy)`.  Missing
/// neighbours (and transparent ones when `ignore_empty`) carry no weight;
/// `None` when nothing contributes.
fn sample_bilinear(
    source: &BTreeMap<(i32, i32), Color>,
    sx: f32,
    sy: f32,
    ignore_empty: bool,
) -> Option<Color> {
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let mut acc = [0.0f32; 4];
    let mut total = 0.0f32;
    for (dx, dy, w) in [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ] {
        let Some(c) = source.get(&(x0 + dx, y0 + dy)) else { continue };
        if w <= 0.0 || (ignore_empty && c.a <= 0.0) {
            continue;
        }
        acc[0] += c.r * w;
        acc[1] += c.g * w;
        acc[2] += c.b * w;
        acc[3] += c.a * w;
        total += w;
    }
    (total > 0.0).then(|| Color::new(acc[0] / total, acc[1] / total, acc[2] / total, acc[3] / total))
}

// ============================================================================
// Canvas-level wrappers: resolve the layer and keep dirty tracking in sync
// ============================================================================

impl CanvasState {
    fn selection_and_layer(&mut self, r: LayerRef) -> Result<(&mut Selection, &mut TiledImage)> {
        let layer = self
            .frames
            .get_mut(r.frame)
            .and_then(|f| f.layers.get_mut(r.layer))
            .ok_or_else(|| EngineError::invalid(format!("no layer {} in frame {}", r.layer, r.frame)))?;
        Ok((&mut self.selection, &mut layer.pixels))
    }

    pub fn take_selection(&mut self, action: Option<&mut HistoryAction>) -> Result<()> {
        let r = self.current_ref();
        let (sel, layer) = self.selection_and_layer(r)?;
        sel.take_selected_colors(layer, r, action)?;
        self.mark_dirty(None);
        Ok(())
    }

    pub fn commit_selection(&mut self, action: Option<&mut HistoryAction>) -> Result<()> {
        let r = self
            .selection
            .taken_layer()
            .ok_or_else(|| EngineError::invalid("commit requires taken pixels"))?;
        let (sel, layer) = self.selection_and_layer(r)?;
        sel.commit_selected_colors(layer, action)?;
        self.mark_dirty(None);
        Ok(())
    }

    pub fn reset_selection(&mut self, action: Option<&mut HistoryAction>) -> Result<()> {
        let r = self
            .selection
            .taken_layer()
            .ok_or_else(|| EngineError::invalid("reset requires taken pixels"))?;
        let (sel, layer) = self.selection_and_layer(r)?;
        sel.reset(layer, action)?;
        self.mark_dirty(None);
        Ok(())
    }

    /// Cancel rollback: restore any taken pixels and drop the selection.
    pub fn clear_selection(&mut self, action: Option<&mut HistoryAction>) {
        if let Some(r) = self.selection.taken_layer()
            && let Ok((sel, layer)) = self.selection_and_layer(r)
        {
            sel.clear(Some(layer), action);
        } else {
            self.selection.clear(None, None);
        }
        self.mark_dirty(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::history::ActionKind;

    fn checker(w: u32, h: u32) -> CanvasState {
        let mut c = CanvasState::new(w, h);
        for y in 0..h as i32 {
            for x in 0..w as i32 {
                let v = ((x + y) % 2) as f32;
                c.set_pixel(x, y, Color::new(v, 0.5, 1.0 - v, 1.0));
            }
        }
        c
    }

    #[test]
    fn take_commit_at_zero_offset_is_exact() {
        let mut c = checker(6, 6);
        let before = c.active_layer().unwrap().pixels.to_pixels();
        c.selection.select_rect(PixelRect::new(1, 1, 4, 3)).unwrap();
        let mut action = HistoryAction::new(ActionKind::SelectionTransform, "Move", c.current_ref());
        c.take_selection(Some(&mut action)).unwrap();
        assert_eq!(c.get_pixel(2, 2), Color::TRANSPARENT);
        c.commit_selection(Some(&mut action)).unwrap();
        assert_eq!(c.active_layer().unwrap().pixels.to_pixels(), before);
        assert!(action.is_empty());
        assert_eq!(c.selection.state(), SelectionState::Selected);
    }

    #[test]
    fn commit_without_take_is_rejected() {
        let mut c = checker(4, 4);
        c.selection.select_rect(PixelRect::new(0, 0, 1, 1)).unwrap();
        assert!(matches!(c.commit_selection(None), Err(EngineError::InvalidOperation(_))));
        assert!(matches!(c.selection.move_by(1, 0), Err(EngineError::InvalidOperation(_))));
    }

    #[test]
    fn move_shifts_pixels_and_selection() {
        let mut c = CanvasState::new(5, 5);
        c.set_pixel(1, 1, Color::RED);
        c.selection.select_rect(PixelRect::point(1, 1)).unwrap();
        c.take_selection(None).unwrap();
        c.selection.move_by(2, 1).unwrap();
        c.commit_selection(None).unwrap();
        assert_eq!(c.get_pixel(1, 1), Color::TRANSPARENT);
        assert_eq!(c.get_pixel(3, 2), Color::RED);
        assert!(c.selection.contains(3, 2));
        assert!(!c.selection.contains(1, 1));
    }

    #[test]
    fn clear_restores_taken_pixels_and_is_idempotent() {
        let mut c = checker(4, 4);
        let before = c.active_layer().unwrap().pixels.to_pixels();
        c.selection.select_all(4, 4).unwrap();
        c.take_selection(None).unwrap();
        c.selection.move_by(1, 1).unwrap();
        c.clear_selection(None);
        c.clear_selection(None);
        assert_eq!(c.active_layer().unwrap().pixels.to_pixels(), before);
        assert_eq!(c.selection.state(), SelectionState::Empty);
    }

    #[test]
    fn rotate_quarter_turn_swaps_extent() {
        let mut c = CanvasState::new(9, 9);
        for x in 3..6 {
            c.set_pixel(x, 4, Color::GREEN);
        }
        c.selection.select_rect(PixelRect::new(3, 4, 5, 4)).unwrap();
        c.take_selection(None).unwrap();
        c.selection.rotate_selection(90.0, false, false).unwrap();
        assert_eq!(c.selection.state(), SelectionState::Rotating);
        c.commit_selection(None).unwrap();
        for y in 3..6 {
            assert_eq!(c.get_pixel(4, y), Color::GREEN);
        }
        assert_eq!(c.selection.bounds(9, 9), Some(PixelRect::new(4, 3, 4, 5)));
    }

    #[test]
    fn full_turn_is_identity() {
        let mut c = checker(7, 7);
        let before = c.active_layer().unwrap().pixels.to_pixels();
        c.selection.select_rect(PixelRect::new(1, 2, 5, 4)).unwrap();
        c.take_selection(None).unwrap();
        c.selection.rotate_selection(180.0, true, false).unwrap();
        c.selection.rotate_selection(180.0, true, false).unwrap();
        c.commit_selection(None).unwrap();
        assert_eq!(c.active_layer().unwrap().pixels.to_pixels(), before);
    }

    #[test]
    fn interpolation_fills_rotation_holes() {
        let mut c = CanvasState::new(20, 20);
        c.selection.select_rect(PixelRect::new(5, 5, 12, 12)).unwrap();
        for (x, y) in PixelRect::new(5, 5, 12, 12).pixels() {
            c.set_pixel(x as i32, y as i32, Color::BLUE);
        }
        c.take_selection(None).unwrap();
        c.selection.rotate_selection(45.0, false, false).unwrap();
        let sparse = c.selection.taken.as_ref().unwrap().projected.len();
        c.selection.rotate_selection(0.0, true, false).unwrap();
        let dense = c.selection.taken.as_ref().unwrap().projected.len();
        assert!(dense > sparse);
    }

    #[test]
    fn point_selection_records_history() {
        let mut c = CanvasState::new(4, 4);
        let mut action = HistoryAction::new(ActionKind::Selection, "Select", c.current_ref());
        c.selection.set_pixel_with_history(2, 3, Some(&mut action)).unwrap();
        assert!(!action.is_empty());
        assert!(c.selection.contains(2, 3));
        assert_eq!(c.selection.len(), 1);
    }
}
