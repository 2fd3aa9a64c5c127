use std::collections::BTreeSet;

use crate::blend::{BlendMode, blend};
use crate::canvas::{CanvasState, LayerRef, PixelRect};
use crate::color::Color;
use crate::components::history::{ActionKind, HistoryAction};

// ============================================================================
// TOOL PROPERTIES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BrushShape {
    #[default]
    Circle,
    Square,
}

/// Where a brush write lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BrushPixelType {
    /// Real write into the current layer, recorded in the action.
    #[default]
    Paint,
    /// Ephemeral overlay; never recorded.
    Preview,
    /// Marks the pixel into the selection (magic selection).
    Selection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GradientType {
    #[default]
    Linear,
    Radial,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DitherPattern {
    #[default]
    Checkerboard,
    /// 4×4 ordered matrix; `level` in 0..=16 is how many of the 16 cells
    /// take the first color.
    Bayer { level: u8 },
}

const BAYER_4X4: [[u8; 4]; 4] = [[0, 8, 2, 10], [12, 4, 14, 6], [3, 11, 1, 9], [15, 7, 13, 5]];

impl DitherPattern {
    /// True when `(x, y)` takes the first color.
    pub fn picks_first(&self, x: i32, y: i32) -> bool {
        match self {
            DitherPattern::Checkerboard => (x + y).rem_euclid(2) == 0,
            DitherPattern::Bayer { level } => {
                BAYER_4X4[y.rem_euclid(4) as usize][x.rem_euclid(4) as usize] < (*level).min(16)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolProperties {
    pub size: u32,
    pub shape: BrushShape,
    pub blend_mode: BlendMode,
    pub opacity: f32,
}

impl Default for ToolProperties {
    fn default() -> Self {
        Self { size: 1, shape: BrushShape::Circle, blend_mode: BlendMode::Normal, opacity: 1.0 }
    }
}

/// Offsets covered by a footprint of `size` centred on the origin.
pub fn footprint(size: u32, shape: BrushShape) -> Vec<(i32, i32)> {
    let size = size.max(1) as i32;
    let lo = -(size - 1) / 2;
    let hi = size / 2;
    let centre = (lo + hi) as f32 * 0.5;
    let r = size as f32 * 0.5;

    let mut out = Vec::with_capacity((size * size) as usize);
    for dy in lo..=hi {
        for dx in lo..=hi {
            let inside = match shape {
                BrushShape::Square => true,
                BrushShape::Circle => {
                    let fx = dx as f32 - centre;
                    let fy = dy as f32 - centre;
                    fx * fx + fy * fy <= r * r
                }
            };
            if inside {
                out.push((dx, dy));
            }
        }
    }
    out
}

/// Bresenham traversal from `p1` to `p2`, both ends inclusive.
///
/// Steps run in `i64` so any pair of `i32` endpoints is safe; callers
/// clip with [`clip_segment`] first to keep the walk short.
pub fn bresenham(p1: (i32, i32), p2: (i32, i32)) -> Vec<(i32, i32)> {
    let (mut x0, mut y0) = (p1.0 as i64, p1.1 as i64);
    let (x1, y1) = (p2.0 as i64, p2.1 as i64);
    let dx = (x1 - x0).abs();
    let dy = (y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx - dy;

    let mut points = Vec::with_capacity((dx.max(dy) + 1).min(4096) as usize);
    loop {
        points.push((x0 as i32, y0 as i32));
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 > -dy {
            err -= dy;
            x0 += sx;
        }
        if e2 < dx {
            err += dx;
            y0 += sy;
        }
    }
    points
}

/// Clip segment `p1 → p2` to the inclusive box `min..=max` (Liang–Barsky).
/// Endpoints already inside are kept exactly; `None` when the segment
/// misses the box.
pub fn clip_segment(
    p1: (i32, i32),
    p2: (i32, i32),
    min: (i64, i64),
    max: (i64, i64),
) -> Option<((i32, i32), (i32, i32))> {
    let inside = |p: (i32, i32)| {
        let (x, y) = (p.0 as i64, p.1 as i64);
        x >= min.0 && x <= max.0 && y >= min.1 && y <= max.1
    };
    if inside(p1) && inside(p2) {
        return Some((p1, p2));
    }

    let (x0, y0) = (p1.0 as f64, p1.1 as f64);
    let (dx, dy) = (p2.0 as f64 - x0, p2.1 as f64 - y0);
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    let edges = [
        (-dx, x0 - min.0 as f64),
        (dx, max.0 as f64 - x0),
        (-dy, y0 - min.1 as f64),
        (dy, max.1 as f64 - y0),
    ];
    for (p, q) in edges {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            if t > t1 {
                return None;
            }
            t0 = t0.max(t);
        } else {
            if t < t0 {
                return None;
            }
            t1 = t1.min(t);
        }
    }

    let at = |t: f64| {
        let x = (x0 + t * dx).round().clamp(min.0 as f64, max.0 as f64);
        let y = (y0 + t * dy).round().clamp(min.1 as f64, max.1 as f64);
        (x as i32, y as i32)
    };
    let a = if t0 == 0.0 { p1 } else { at(t0) };
    let b = if t1 == 1.0 { p2 } else { at(t1) };
    Some((a, b))
}

/// Gradient parameter for `(px, py)` along `a → b`, clamped to [0, 1].
#[inline(always)]
pub fn compute_t(kind: GradientType, px: f32, py: f32, ax: f32, ay: f32, bx: f32, by: f32) -> f32 {
    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    if len_sq < 1e-6 {
        return 0.0;
    }
    match kind {
        GradientType::Linear => (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0),
        GradientType::Radial => {
            let dist = ((px - ax) * (px - ax) + (py - ay) * (py - ay)).sqrt();
            (dist / len_sq.sqrt()).clamp(0.0, 1.0)
        }
    }
}

// ============================================================================
// BRUSH ENGINE
// ============================================================================

/// Brush algorithms bound to one canvas and one set of tool properties.
/// Built per call while the canvas lock is held.
pub struct BrushEngine<'a> {
    canvas: &'a mut CanvasState,
    props: &'a ToolProperties,
}

impl<'a> BrushEngine<'a> {
    pub fn new(canvas: &'a mut CanvasState, props: &'a ToolProperties) -> Self {
        Self { canvas, props }
    }

    /// The single writer every brush goes through.
    ///
    /// Paint writes are clipped to an active selection and blended against
    /// the value the pixel had when `action` first touched it, so
    /// overlapping stamps within one stroke do not build up opacity.
    fn write_pixel(
        &mut self,
        x: i32,
        y: i32,
        color: Color,
        pixel_type: BrushPixelType,
        action: Option<&mut HistoryAction>,
    ) -> bool {
        if !self.canvas.in_bounds(x, y) {
            return false;
        }
        match pixel_type {
            BrushPixelType::Preview => {
                let base = self.canvas.get_pixel(x, y);
                let shown = blend(base, color, self.props.blend_mode, self.props.opacity);
                self.canvas.set_preview_pixel(x, y, shown);
                true
            }
            BrushPixelType::Selection => {
                self.canvas.selection.add_pixel(x as u32, y as u32);
                self.canvas.mark_dirty(Some(PixelRect::point(x as u32, y as u32)));
                true
            }
            BrushPixelType::Paint => {
                let sel = &self.canvas.selection;
                if sel.len() > 0 && !sel.contains(x as u32, y as u32) {
                    return false;
                }
                let r = self.canvas.current_ref();
                let current = self.canvas.get_pixel_at(r, x, y);
                let base = action
                    .as_deref()
                    .and_then(|a| a.recorded_old(r, x as u32, y as u32))
                    .unwrap_or(current);
                let new = blend(base, color, self.props.blend_mode, self.props.opacity);
                self.canvas.set_pixel_recorded(r, x, y, new, action)
            }
        }
    }

    fn stamp(
        &mut self,
        centres: &[(i32, i32)],
        shape: BrushShape,
        mut pick: impl FnMut(i32, i32) -> Color,
        pixel_type: BrushPixelType,
        mut action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        let offsets = footprint(self.props.size, shape);
        let mut targets = BTreeSet::new();
        for &(cx, cy) in centres {
            for &(dx, dy) in &offsets {
                targets.insert((cy.saturating_add(dy), cx.saturating_add(dx)));
            }
        }
        let mut touched = Vec::with_capacity(targets.len());
        for (y, x) in targets {
            let color = pick(x, y);
            if self.write_pixel(x, y, color, pixel_type, action.as_deref_mut()) {
                touched.push((x, y));
            }
        }
        touched
    }

    /// Stamp the brush footprint at `pos`.
    pub fn pencil(
        &mut self,
        pos: (i32, i32),
        color: Color,
        pixel_type: BrushPixelType,
        action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        self.stamp(&[pos], self.props.shape, |_, _| color, pixel_type, action)
    }

    /// Bresenham centres from `p1` to `p2`, limited to the part of the
    /// segment whose footprint can still reach the canvas.
    fn path(&self, p1: (i32, i32), p2: (i32, i32)) -> Vec<(i32, i32)> {
        let reach = self.props.size as i64 / 2 + 1;
        let min = (-reach, -reach);
        let max = (self.canvas.width as i64 - 1 + reach, self.canvas.height as i64 - 1 + reach);
        match clip_segment(p1, p2, min, max) {
            Some((a, b)) => bresenham(a, b),
            None => Vec::new(),
        }
    }

    /// Footprint stamped at every Bresenham step from `p1` to `p2`.
    pub fn line(
        &mut self,
        p1: (i32, i32),
        p2: (i32, i32),
        color: Color,
        pixel_type: BrushPixelType,
        action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        let centres = self.path(p1, p2);
        self.stamp(&centres, self.props.shape, |_, _| color, pixel_type, action)
    }

    pub fn line_of_squares(
        &mut self,
        p1: (i32, i32),
        p2: (i32, i32),
        color: Color,
        pixel_type: BrushPixelType,
        action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        let centres = self.path(p1, p2);
        self.stamp(&centres, BrushShape::Square, |_, _| color, pixel_type, action)
    }

    /// Single-pixel hover marker on the preview overlay.
    pub fn dot(&mut self, pos: (i32, i32), color: Color) -> Vec<(i32, i32)> {
        if self.write_pixel(pos.0, pos.1, color, BrushPixelType::Preview, None) {
            vec![pos]
        } else {
            Vec::new()
        }
    }

    pub fn clear_preview(&mut self, touched: &[(i32, i32)]) {
        let Some(preview) = self.canvas.preview_layer.as_mut() else { return };
        for &(x, y) in touched {
            if x >= 0 && y >= 0 {
                preview.put_pixel(x as u32, y as u32, Color::TRANSPARENT);
            }
        }
        if preview.is_blank() {
            self.canvas.preview_layer = None;
        }
        self.canvas.mark_dirty(None);
    }

    pub fn clear_preview_all(&mut self) {
        self.canvas.clear_preview();
    }

    /// Region fill from `pos`.  A neighbour joins when its distance to the
    /// seed color is within `threshold`; colors come from the composite when
    /// `merge_layers`, else from the current layer.  Returns the pixels written.
    #[allow(clippy::too_many_arguments)]
    pub fn flood(
        &mut self,
        pos: (i32, i32),
        color: Color,
        threshold: f32,
        diagonal: bool,
        merge_layers: bool,
        pixel_type: BrushPixelType,
        mut action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        if !self.canvas.in_bounds(pos.0, pos.1) {
            return Vec::new();
        }
        let region = self.flood_region(pos, threshold.clamp(0.0, 1.0), diagonal, merge_layers);
        let mut touched = Vec::with_capacity(region.len());
        for (x, y) in region {
            if self.write_pixel(x, y, color, pixel_type, action.as_deref_mut()) {
                touched.push((x, y));
            }
        }
        touched
    }

    /// DFS over a snapshot of the comparison colors, Vec stack + visited mask.
    fn flood_region(&self, pos: (i32, i32), threshold: f32, diagonal: bool, merge_layers: bool) -> Vec<(i32, i32)> {
        let w = self.canvas.width as usize;
        let h = self.canvas.height as usize;
        let colors: Vec<Color> = if merge_layers {
            self.canvas.composite()
        } else {
            match self.canvas.active_layer() {
                Some(layer) => layer.pixels.to_pixels(),
                None => return Vec::new(),
            }
        };

        let seed_idx = pos.1 as usize * w + pos.0 as usize;
        let seed = colors[seed_idx];
        let mut visited = vec![false; w * h];
        let mut stack: Vec<usize> = Vec::with_capacity(4096);
        let mut region = Vec::new();
        visited[seed_idx] = true;
        stack.push(seed_idx);

        const ORTHO: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
        const DIAG: [(i32, i32); 4] = [(-1, -1), (1, -1), (-1, 1), (1, 1)];

        while let Some(idx) = stack.pop() {
            let x = (idx % w) as i32;
            let y = (idx / w) as i32;
            region.push((x, y));

            let extra: &[(i32, i32)] = if diagonal { &DIAG } else { &[] };
            for &(dx, dy) in ORTHO.iter().chain(extra) {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx as usize >= w || ny as usize >= h {
                    continue;
                }
                let ni = ny as usize * w + nx as usize;
                if !visited[ni] && seed.distance(&colors[ni]) <= threshold {
                    visited[ni] = true;
                    stack.push(ni);
                }
            }
        }
        region
    }

    /// Linear or radial gradient over the selection bounds (or the whole
    /// canvas), `t = 0` at `p1` giving `color_a`.
    #[allow(clippy::too_many_arguments)]
    pub fn gradient(
        &mut self,
        p1: (i32, i32),
        p2: (i32, i32),
        color_a: Color,
        color_b: Color,
        kind: GradientType,
        pixel_type: BrushPixelType,
        mut action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        let region = self
            .canvas
            .selection
            .bounds(self.canvas.width, self.canvas.height)
            .unwrap_or_else(|| PixelRect::full(self.canvas.width, self.canvas.height));
        let (ax, ay, bx, by) = (p1.0 as f32, p1.1 as f32, p2.0 as f32, p2.1 as f32);

        let mut touched = Vec::with_capacity((region.width() * region.height()) as usize);
        for (x, y) in region.pixels() {
            let (x, y) = (x as i32, y as i32);
            let t = compute_t(kind, x as f32, y as f32, ax, ay, bx, by);
            if self.write_pixel(x, y, color_a.lerp(color_b, t), pixel_type, action.as_deref_mut()) {
                touched.push((x, y));
            }
        }
        touched
    }

    /// Two-tone stipple inside the footprint at `pos`.
    #[allow(clippy::too_many_arguments)]
    pub fn dither(
        &mut self,
        pos: (i32, i32),
        color_a: Color,
        color_b: Color,
        pattern: DitherPattern,
        square: bool,
        pixel_type: BrushPixelType,
        action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        self.dither_line(pos, pos, color_a, color_b, pattern, square, pixel_type, action)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn dither_line(
        &mut self,
        p1: (i32, i32),
        p2: (i32, i32),
        color_a: Color,
        color_b: Color,
        pattern: DitherPattern,
        square: bool,
        pixel_type: BrushPixelType,
        action: Option<&mut HistoryAction>,
    ) -> Vec<(i32, i32)> {
        let shape = if square { BrushShape::Square } else { self.props.shape };
        let pick = |x, y| if pattern.picks_first(x, y) { color_a } else { color_b };
        let centres = self.path(p1, p2);
        self.stamp(&centres, shape, pick, pixel_type, action)
    }

    /// Rewrite every pixel matching the current-layer color at `pos` to
    /// `new_color`.  Scope grows from the current layer to every layer of
    /// the current frame (`all_layers`) and then to every frame
    /// (`all_frames`).  With `ignore_opacity` only RGB is compared,
    /// transparent pixels are skipped and each pixel keeps its alpha.
    /// Returns the number of pixels rewritten.
    pub fn replace_color(
        &mut self,
        pos: (i32, i32),
        new_color: Color,
        all_layers: bool,
        all_frames: bool,
        ignore_opacity: bool,
        mut action: Option<&mut HistoryAction>,
    ) -> usize {
        if !self.canvas.in_bounds(pos.0, pos.1) {
            return 0;
        }
        let target = self.canvas.get_pixel(pos.0, pos.1);
        if ignore_opacity && target.a <= 0.0 {
            return 0;
        }
        let target_rgb = target.with_alpha(1.0).to_rgba8();

        let current = self.canvas.current_ref();
        let frames: Vec<usize> = if all_frames { (0..self.canvas.frame_count()).collect() } else { vec![current.frame] };
        let layers: Vec<usize> =
            if all_layers || all_frames { (0..self.canvas.layer_count()).collect() } else { vec![current.layer] };

        let mut count = 0;
        for &frame in &frames {
            for &layer in &layers {
                let r = LayerRef { frame, layer };
                let Some(pixels) = self.canvas.layer(r).map(|l| l.pixels.to_pixels()) else { continue };
                let w = self.canvas.width as usize;
                for (i, p) in pixels.into_iter().enumerate() {
                    let hit = if ignore_opacity {
                        p.a > 0.0 && p.with_alpha(1.0).to_rgba8() == target_rgb
                    } else {
                        p.same_rgba8(&target)
                    };
                    if !hit {
                        continue;
                    }
                    let out = if ignore_opacity { new_color.with_alpha(p.a) } else { new_color };
                    self.canvas.set_pixel_recorded(r, (i % w) as i32, (i / w) as i32, out, action.as_deref_mut());
                    count += 1;
                }
            }
        }
        count
    }

    /// Pure read of the color under `pos`: merged composite or the current
    /// layer, with layer opacity applied unless `ignore_layer_opacity`.
    pub fn sample_color(&self, pos: (i32, i32), ignore_layer_opacity: bool, merge_layers: bool) -> Color {
        sample_color(&*self.canvas, pos, ignore_layer_opacity, merge_layers)
    }
}

pub fn sample_color(canvas: &CanvasState, pos: (i32, i32), ignore_layer_opacity: bool, merge_layers: bool) -> Color {
    let (x, y) = pos;
    if !canvas.in_bounds(x, y) {
        return Color::TRANSPARENT;
    }
    if merge_layers {
        return canvas.layers().iter().filter(|l| l.visible).fold(Color::TRANSPARENT, |acc, l| {
            let opacity = if ignore_layer_opacity { 1.0 } else { l.opacity };
            blend(acc, l.pixels.get_pixel(x as u32, y as u32), l.blend_mode, opacity)
        });
    }
    match canvas.active_layer() {
        Some(layer) => {
            let p = layer.pixels.get_pixel(x as u32, y as u32);
            if ignore_layer_opacity { p } else { p.with_alpha(p.a * layer.opacity) }
        }
        None => Color::TRANSPARENT,
    }
}

// ============================================================================
// STROKE TRACKER — one history entry per pointer-down → pointer-up
// ============================================================================

/// Accumulates the diff of an in-progress stroke.
#[derive(Default)]
pub struct StrokeTracker {
    action: Option<HistoryAction>,
    /// Last stamped position, for connecting successive stroke segments.
    pub last_pos: Option<(i32, i32)>,
    /// Accumulated bounds of everything written in this stroke.
    pub bounds: Option<PixelRect>,
}

impl StrokeTracker {
    pub fn start(&mut self, kind: ActionKind, description: &str, at: LayerRef) {
        self.action = Some(HistoryAction::new(kind, description, at));
        self.last_pos = None;
        self.bounds = None;
    }

    pub fn is_active(&self) -> bool {
        self.action.is_some()
    }

    pub fn action_mut(&mut self) -> Option<&mut HistoryAction> {
        self.action.as_mut()
    }

    pub fn expand_bounds(&mut self, touched: &[(i32, i32)]) {
        for &(x, y) in touched {
            if x < 0 || y < 0 {
                continue;
            }
            let p = PixelRect::point(x as u32, y as u32);
            self.bounds = Some(self.bounds.map_or(p, |b| b.union(&p)));
        }
    }

    /// End the stroke, handing back the completed action.
    pub fn finish(&mut self) -> Option<HistoryAction> {
        self.last_pos = None;
        self.bounds = None;
        self.action.take()
    }

    /// Abandon the stroke.  The partially recorded action is returned so the
    /// caller can roll its pixels back.
    pub fn cancel(&mut self) -> Option<HistoryAction> {
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_canvas(w: u32, h: u32) -> CanvasState {
        CanvasState::new(w, h)
    }

    #[test]
    fn footprint_sizes() {
        assert_eq!(footprint(1, BrushShape::Circle), vec![(0, 0)]);
        assert_eq!(footprint(2, BrushShape::Circle).len(), 4);
        assert_eq!(footprint(3, BrushShape::Square).len(), 9);
        assert_eq!(footprint(5, BrushShape::Circle).len(), 21);
    }

    #[test]
    fn bresenham_is_gap_free_for_steep_lines() {
        let pts = bresenham((0, 0), (2, 7));
        assert_eq!(pts.first(), Some(&(0, 0)));
        assert_eq!(pts.last(), Some(&(2, 7)));
        for pair in pts.windows(2) {
            assert!((pair[0].0 - pair[1].0).abs() <= 1 && (pair[0].1 - pair[1].1).abs() <= 1);
        }
        assert_eq!(pts.len(), 8);
    }

    #[test]
    fn clip_segment_keeps_inner_ends_and_trims_outer_ones() {
        let (min, max) = ((0, 0), (9, 9));
        assert_eq!(clip_segment((1, 2), (8, 3), min, max), Some(((1, 2), (8, 3))));
        assert_eq!(clip_segment((-10, 5), (20, 5), min, max), Some(((0, 5), (9, 5))));
        assert_eq!(clip_segment((4, 4), (4, 1000), min, max), Some(((4, 4), (4, 9))));
        assert_eq!(clip_segment((-5, -1), (20, -1), min, max), None);
        assert_eq!(clip_segment((-5, 20), (20, 30), min, max), None);
    }

    #[test]
    fn far_off_canvas_lines_stay_bounded() {
        let mut c = engine_canvas(8, 4);
        let props = ToolProperties { size: 1, ..Default::default() };
        let mut engine = BrushEngine::new(&mut c, &props);

        let miss = engine.line((-2_000_000_000, -50), (2_000_000_000, -50), Color::RED, BrushPixelType::Paint, None);
        assert!(miss.is_empty());
        let corner = engine.line((i32::MIN, i32::MIN), (i32::MAX, i32::MIN), Color::RED, BrushPixelType::Paint, None);
        assert!(corner.is_empty());
        let stamp = engine.pencil((i32::MAX, i32::MAX), Color::RED, BrushPixelType::Paint, None);
        assert!(stamp.is_empty());
        assert!(c.active_layer().unwrap().pixels.is_empty());

        let mut engine = BrushEngine::new(&mut c, &props);
        let across = engine.line((-2_000_000_000, 0), (2_000_000_000, 0), Color::RED, BrushPixelType::Paint, None);
        assert_eq!(across.len(), 8);
        assert!((0..8).all(|x| c.get_pixel(x, 0) == Color::RED));
        assert_eq!(c.get_pixel(0, 1), Color::TRANSPARENT);
    }

    #[test]
    fn pencil_clips_to_selection() {
        let mut c = engine_canvas(5, 5);
        c.selection.select_rect(PixelRect::new(0, 0, 1, 4)).unwrap();
        let props = ToolProperties { size: 3, shape: BrushShape::Square, ..Default::default() };
        let touched = BrushEngine::new(&mut c, &props).pencil((2, 2), Color::RED, BrushPixelType::Paint, None);
        assert_eq!(touched.len(), 3);
        assert_eq!(c.get_pixel(1, 2), Color::RED);
        assert_eq!(c.get_pixel(2, 2), Color::TRANSPARENT);
    }

    #[test]
    fn overlapping_stamps_do_not_stack_opacity() {
        let mut c = engine_canvas(4, 1);
        let props = ToolProperties { size: 1, opacity: 0.5, ..Default::default() };
        let mut action = HistoryAction::new(ActionKind::Stroke, "Pencil", c.current_ref());
        let mut engine = BrushEngine::new(&mut c, &props);
        engine.pencil((1, 0), Color::BLACK, BrushPixelType::Paint, Some(&mut action));
        engine.pencil((1, 0), Color::BLACK, BrushPixelType::Paint, Some(&mut action));
        assert!((c.get_pixel(1, 0).a - 0.5).abs() < 1e-6);
        assert_eq!(action.pixel_count(), 1);
    }

    #[test]
    fn preview_never_touches_layer() {
        let mut c = engine_canvas(3, 3);
        let props = ToolProperties::default();
        let mut engine = BrushEngine::new(&mut c, &props);
        let touched = engine.line((0, 0), (2, 2), Color::RED, BrushPixelType::Preview, None);
        assert_eq!(touched.len(), 3);
        engine.clear_preview(&touched);
        assert!(c.preview_layer.is_none());
        assert!(c.active_layer().unwrap().pixels.is_empty());
    }

    #[test]
    fn flood_respects_connectivity() {
        let mut c = engine_canvas(3, 3);
        // Diagonal wall splits the corner (0,0) from the rest in 4-connectivity.
        c.set_pixel(1, 0, Color::BLACK);
        c.set_pixel(0, 1, Color::BLACK);
        let props = ToolProperties::default();
        let four = BrushEngine::new(&mut c, &props).flood((2, 2), Color::RED, 0.0, false, false, BrushPixelType::Preview, None);
        assert_eq!(four.len(), 6);
        c.clear_preview();
        let eight = BrushEngine::new(&mut c, &props).flood((2, 2), Color::RED, 0.0, true, false, BrushPixelType::Preview, None);
        assert_eq!(eight.len(), 7);
    }

    #[test]
    fn flood_threshold_admits_near_colors() {
        let mut c = engine_canvas(3, 1);
        c.set_pixel(0, 0, Color::rgb(0.5, 0.5, 0.5));
        c.set_pixel(1, 0, Color::rgb(0.55, 0.5, 0.5));
        c.set_pixel(2, 0, Color::rgb(0.9, 0.5, 0.5));
        let props = ToolProperties::default();
        let filled = BrushEngine::new(&mut c, &props).flood((0, 0), Color::RED, 0.1, false, false, BrushPixelType::Paint, None);
        assert_eq!(filled.len(), 2);
    }

    #[test]
    fn magic_selection_marks_pixels() {
        let mut c = engine_canvas(4, 4);
        c.set_pixel(3, 3, Color::WHITE);
        c.selection.begin_selecting().unwrap();
        let props = ToolProperties::default();
        BrushEngine::new(&mut c, &props).flood((0, 0), Color::WHITE, 0.0, false, false, BrushPixelType::Selection, None);
        c.selection.finish_selecting();
        assert_eq!(c.selection.len(), 15);
        assert!(!c.selection.contains(3, 3));
        assert!(c.active_layer().unwrap().pixels.get_pixel(0, 0) == Color::TRANSPARENT);
    }

    #[test]
    fn radial_gradient_distance_ratio() {
        assert_eq!(compute_t(GradientType::Radial, 0.0, 0.0, 0.0, 0.0, 4.0, 0.0), 0.0);
        assert!((compute_t(GradientType::Radial, 0.0, 2.0, 0.0, 0.0, 4.0, 0.0) - 0.5).abs() < 1e-6);
        assert_eq!(compute_t(GradientType::Radial, 9.0, 9.0, 0.0, 0.0, 4.0, 0.0), 1.0);
        assert_eq!(compute_t(GradientType::Linear, 5.0, 5.0, 1.0, 1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn dither_alternates_colors() {
        let mut c = engine_canvas(4, 4);
        let props = ToolProperties { size: 2, ..Default::default() };
        BrushEngine::new(&mut c, &props).dither((1, 1), Color::BLACK, Color::WHITE, DitherPattern::Checkerboard, true, BrushPixelType::Paint, None);
        assert_eq!(c.get_pixel(1, 1), Color::BLACK);
        assert_eq!(c.get_pixel(2, 1), Color::WHITE);
        assert_eq!(c.get_pixel(2, 2), Color::BLACK);
    }

    #[test]
    fn bayer_levels_cover_extremes() {
        let none = DitherPattern::Bayer { level: 0 };
        let all = DitherPattern::Bayer { level: 16 };
        let half = DitherPattern::Bayer { level: 8 };
        let mut n = 0;
        for y in 0..4 {
            for x in 0..4 {
                assert!(!none.picks_first(x, y));
                assert!(all.picks_first(x, y));
                n += half.picks_first(x, y) as usize;
            }
        }
        assert_eq!(n, 8);
    }

    #[test]
    fn replace_color_scopes() {
        let mut c = engine_canvas(2, 1);
        c.set_pixel(0, 0, Color::RED);
        c.set_pixel(1, 0, Color::RED.with_alpha(0.5));
        let props = ToolProperties::default();

        let n = BrushEngine::new(&mut c, &props).replace_color((0, 0), Color::BLUE, false, false, false, None);
        assert_eq!(n, 1);
        assert_eq!(c.get_pixel(1, 0), Color::RED.with_alpha(0.5));

        c.set_pixel(0, 0, Color::RED);
        let n = BrushEngine::new(&mut c, &props).replace_color((0, 0), Color::GREEN, false, false, true, None);
        assert_eq!(n, 2);
        assert_eq!(c.get_pixel(1, 0), Color::GREEN.with_alpha(0.5));
    }

    #[test]
    fn sample_color_applies_layer_opacity() {
        let mut c = engine_canvas(1, 1);
        c.set_pixel(0, 0, Color::RED);
        c.frames[0].layers[0].opacity = 0.5;
        assert!((sample_color(&c, (0, 0), false, false).a - 0.5).abs() < 1e-6);
        assert_eq!(sample_color(&c, (0, 0), true, false), Color::RED);
        assert!((sample_color(&c, (0, 0), false, true).a - 0.5).abs() < 1e-6);
        assert_eq!(sample_color(&c, (0, 0), true, true), Color::RED);
    }
}
