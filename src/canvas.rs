use std::sync::{Arc, Mutex, MutexGuard};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::blend::{BlendMode, blend};
use crate::color::Color;
use crate::components::history::HistoryAction;
use crate::log_warn;
use crate::selection::Selection;

/// Longest edge accepted for a canvas, in pixels.
pub const MAX_CANVAS_DIM: u32 = 32768;

// ============================================================================
// PIXEL RECT — inclusive integer bounds used for dirty tracking and regions
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl PixelRect {
    /// Rect spanning two corners in any order.
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    pub fn point(x: u32, y: u32) -> Self {
        Self { min_x: x, min_y: y, max_x: x, max_y: y }
    }

    /// Rect from signed corners clipped to a `w × h` grid; `None` when it
    /// lies entirely outside.
    pub fn clipped(x0: i32, y0: i32, x1: i32, y1: i32, w: u32, h: u32) -> Option<Self> {
        let (lx, hx) = (x0.min(x1), x0.max(x1));
        let (ly, hy) = (y0.min(y1), y0.max(y1));
        if hx < 0 || hy < 0 || lx >= w as i32 || ly >= h as i32 {
            return None;
        }
        Some(Self {
            min_x: lx.max(0) as u32,
            min_y: ly.max(0) as u32,
            max_x: (hx as u32).min(w - 1),
            max_y: (hy as u32).min(h - 1),
        })
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width.saturating_sub(1), height.saturating_sub(1))
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn union(&self, other: &PixelRect) -> PixelRect {
        PixelRect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Every coordinate in the rect, row-major.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.min_y..=self.max_y).flat_map(move |y| (self.min_x..=self.max_x).map(move |x| (x, y)))
    }
}

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;
pub(crate) const CHUNK_LEN: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Sparse tiled image backed by a flat `Vec<Option<Arc<Vec<Color>>>>`.
/// Chunk coordinates map to a flat index via `cy * chunks_per_row + cx`.
///
/// Chunks sit behind `Arc` for copy-on-write: cloning an image (history
/// snapshots, frame duplication) only bumps reference counts, and a write
/// clones just the touched chunk through `Arc::make_mut`.
#[derive(Clone, Debug)]
pub struct TiledImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<Vec<Color>>>>,
}

impl TiledImage {
    /// Empty (fully transparent) image.  Zero dimensions are raised to 1.
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.clamp(1, MAX_CANVAS_DIM);
        let height = height.clamp(1, MAX_CANVAS_DIM);
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; (chunks_per_row * chunks_per_col) as usize],
        }
    }

    pub fn new_filled(width: u32, height: u32, color: Color) -> Self {
        let mut img = Self::new(width, height);
        img.fill(color);
        img
    }

    /// Build from a row-major `width × height` pixel slice.  Only chunks with
    /// visible content are stored.  Missing trailing pixels read as
    /// transparent.
    pub fn from_pixels(width: u32, height: u32, data: &[Color]) -> Self {
        let mut img = Self::new(width, height);
        let (width, height) = (img.width, img.height);
        let chunks_x = img.chunks_per_row as usize;

        let built: Vec<(usize, Option<Arc<Vec<Color>>>)> = (0..img.chunks.len())
            .into_par_iter()
            .map(|flat| {
                let base_x = (flat % chunks_x) as u32 * CHUNK_SIZE;
                let base_y = (flat / chunks_x) as u32 * CHUNK_SIZE;
                let cw = CHUNK_SIZE.min(width - base_x);
                let ch = CHUNK_SIZE.min(height - base_y);

                let mut chunk = vec![Color::TRANSPARENT; CHUNK_LEN];
                let mut has_content = false;
                for ly in 0..ch {
                    for lx in 0..cw {
                        let src = ((base_y + ly) * width + base_x + lx) as usize;
                        let px = data.get(src).copied().unwrap_or_default();
                        if px != Color::TRANSPARENT {
                            has_content = true;
                        }
                        chunk[(ly * CHUNK_SIZE + lx) as usize] = px;
                    }
                }
                (flat, has_content.then(|| Arc::new(chunk)))
            })
            .collect();

        for (idx, chunk) in built {
            img.chunks[idx] = chunk;
        }
        img
    }

    /// Flatten to a row-major pixel vector.
    pub fn to_pixels(&self) -> Vec<Color> {
        let w = self.width as usize;
        let mut out = vec![Color::TRANSPARENT; w * self.height as usize];
        for (cx, cy) in self.chunk_keys() {
            let Some(chunk) = self.get_chunk(cx, cy) else { continue };
            let base_x = cx * CHUNK_SIZE;
            let base_y = cy * CHUNK_SIZE;
            let cw = CHUNK_SIZE.min(self.width - base_x) as usize;
            let ch = CHUNK_SIZE.min(self.height - base_y);
            for ly in 0..ch {
                let src = (ly * CHUNK_SIZE) as usize;
                let dst = (base_y + ly) as usize * w + base_x as usize;
                out[dst..dst + cw].copy_from_slice(&chunk[src..src + cw]);
            }
        }
        out
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn locate(&self, x: u32, y: u32) -> (usize, usize) {
        let ci = ((y / CHUNK_SIZE) * self.chunks_per_row + x / CHUNK_SIZE) as usize;
        let li = ((y % CHUNK_SIZE) * CHUNK_SIZE + x % CHUNK_SIZE) as usize;
        (ci, li)
    }

    /// Transparent black outside the image or in an unallocated chunk.
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> Color {
        if x >= self.width || y >= self.height {
            return Color::TRANSPARENT;
        }
        let (ci, li) = self.locate(x, y);
        match &self.chunks[ci] {
            Some(chunk) => chunk[li],
            None => Color::TRANSPARENT,
        }
    }

    /// Out-of-bounds writes are ignored.
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }
        let (ci, li) = self.locate(x, y);
        let slot = &mut self.chunks[ci];
        if slot.is_none() && color == Color::TRANSPARENT {
            return;
        }
        let chunk = slot.get_or_insert_with(|| Arc::new(vec![Color::TRANSPARENT; CHUNK_LEN]));
        Arc::make_mut(chunk)[li] = color;
    }

    /// Fill every pixel.  All chunks share one allocation until written.
    pub fn fill(&mut self, color: Color) {
        if color == Color::TRANSPARENT {
            self.clear();
            return;
        }
        let shared = Arc::new(vec![color; CHUNK_LEN]);
        for slot in &mut self.chunks {
            *slot = Some(Arc::clone(&shared));
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.chunks {
            *slot = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_none())
    }

    /// True when no stored pixel has any alpha.
    pub fn is_blank(&self) -> bool {
        self.chunks.iter().flatten().all(|c| c.iter().all(|p| p.a <= 0.0))
    }

    /// Coordinates of allocated chunks.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(move |(i, _)| (i as u32 % cpr, i as u32 / cpr))
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&[Color]> {
        let idx = self.chunk_index(cx, cy)?;
        self.chunks[idx].as_ref().map(|c| c.as_slice())
    }

    /// Install a whole chunk.  Returns false when the coordinates fall
    /// outside the image or the buffer is not `CHUNK_SIZE²` long.
    pub fn set_chunk(&mut self, cx: u32, cy: u32, pixels: Vec<Color>) -> bool {
        if pixels.len() != CHUNK_LEN {
            return false;
        }
        let Some(idx) = self.chunk_index(cx, cy) else { return false };
        self.chunks[idx] = Some(Arc::new(pixels));
        true
    }

    /// Flat slot index for chunk `(cx, cy)`, or `None` outside the grid.
    fn chunk_index(&self, cx: u32, cy: u32) -> Option<usize> {
        let rows = self.height.div_ceil(CHUNK_SIZE);
        if cx >= self.chunks_per_row || cy >= rows {
            return None;
        }
        Some(cy as usize * self.chunks_per_row as usize + cx as usize)
    }

    /// Re-map every stored pixel into a fresh `new_w × new_h` image.
    /// `map` receives source coordinates and returns the destination.
    fn remapped(&self, new_w: u32, new_h: u32, map: impl Fn(u32, u32) -> (u32, u32)) -> TiledImage {
        let mut dst = TiledImage::new(new_w, new_h);
        for (cx, cy) in self.chunk_keys() {
            let Some(chunk) = self.get_chunk(cx, cy) else { continue };
            let base_x = cx * CHUNK_SIZE;
            let base_y = cy * CHUNK_SIZE;
            let cw = CHUNK_SIZE.min(self.width - base_x);
            let ch = CHUNK_SIZE.min(self.height - base_y);
            for ly in 0..ch {
                for lx in 0..cw {
                    let px = chunk[(ly * CHUNK_SIZE + lx) as usize];
                    if px == Color::TRANSPARENT {
                        continue;
                    }
                    let (dx, dy) = map(base_x + lx, base_y + ly);
                    dst.put_pixel(dx, dy, px);
                }
            }
        }
        dst
    }

    pub fn flipped_horizontal(&self) -> TiledImage {
        let w = self.width;
        self.remapped(w, self.height, |x, y| (w - 1 - x, y))
    }

    pub fn flipped_vertical(&self) -> TiledImage {
        let h = self.height;
        self.remapped(self.width, h, |x, y| (x, h - 1 - y))
    }

    /// 90° clockwise: W×H becomes H×W.
    pub fn rotated_90cw(&self) -> TiledImage {
        let h = self.height;
        self.remapped(h, self.width, |x, y| (h - 1 - y, x))
    }

    pub fn rotated_90ccw(&self) -> TiledImage {
        let w = self.width;
        self.remapped(self.height, w, |x, y| (y, w - 1 - x))
    }

    pub fn rotated_180(&self) -> TiledImage {
        let (w, h) = (self.width, self.height);
        self.remapped(w, h, |x, y| (w - 1 - x, h - 1 - y))
    }

    /// Copy into a differently sized image, shifting content by `(dx, dy)`.
    pub fn shifted(&self, new_w: u32, new_h: u32, dx: i64, dy: i64) -> TiledImage {
        let mut dst = TiledImage::new(new_w, new_h);
        for (cx, cy) in self.chunk_keys() {
            let Some(chunk) = self.get_chunk(cx, cy) else { continue };
            let base_x = cx * CHUNK_SIZE;
            let base_y = cy * CHUNK_SIZE;
            let cw = CHUNK_SIZE.min(self.width - base_x);
            let ch = CHUNK_SIZE.min(self.height - base_y);
            for ly in 0..ch {
                for lx in 0..cw {
                    let nx = (base_x + lx) as i64 + dx;
                    let ny = (base_y + ly) as i64 + dy;
                    if nx < 0 || ny < 0 || nx > u32::MAX as i64 || ny > u32::MAX as i64 {
                        continue;
                    }
                    dst.put_pixel(nx as u32, ny as u32, chunk[(ly * CHUNK_SIZE + lx) as usize]);
                }
            }
        }
        dst
    }

    /// Bytes held by chunks not shared with any snapshot.
    pub fn memory_bytes(&self) -> usize {
        let chunk_bytes = CHUNK_LEN * std::mem::size_of::<Color>();
        self.chunks
            .iter()
            .filter_map(|c| c.as_ref())
            .map(|arc| if Arc::strong_count(arc) == 1 { chunk_bytes } else { std::mem::size_of::<usize>() * 2 })
            .sum()
    }
}

// ============================================================================
// LAYERS / FRAMES
// ============================================================================

#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub pixels: TiledImage,
}

impl Layer {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            pixels: TiledImage::new(width, height),
        }
    }
}

/// One animation frame: a layer stack in paint order (first = bottom).
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub layers: Vec<Layer>,
}

/// Explicit (frame, layer) address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerRef {
    pub frame: usize,
    pub layer: usize,
}

/// Undoable pixel write shared by brushes and the selection system.
/// Stores `color` clamped, logs old → new into `action` and returns the
/// previous value.
pub fn write_recorded(
    layer: &mut TiledImage,
    r: LayerRef,
    x: u32,
    y: u32,
    color: Color,
    action: Option<&mut HistoryAction>,
) -> Color {
    let color = color.clamped();
    let old = layer.get_pixel(x, y);
    layer.put_pixel(x, y, color);
    if let Some(action) = action {
        action.record_pixel(r, x, y, old, color);
    }
    old
}

// ============================================================================
// CANVAS STATE
// ============================================================================

pub struct CanvasState {
    pub width: u32,
    pub height: u32,
    /// Every frame holds the same number of layers.
    pub frames: Vec<Frame>,
    pub current_frame: usize,
    pub active_layer_index: usize,
    /// Ephemeral overlay for hover and in-progress previews.  Never recorded.
    pub preview_layer: Option<TiledImage>,
    pub selection: Selection,
    pub dirty: bool,
    /// Monotonically increasing counter, bumped on each `mark_dirty` call.
    pub dirty_generation: u64,
    pub dirty_rect: Option<PixelRect>,
}

impl CanvasState {
    /// A canvas with one frame holding one transparent layer.
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.clamp(1, MAX_CANVAS_DIM);
        let height = height.clamp(1, MAX_CANVAS_DIM);
        Self {
            width,
            height,
            frames: vec![Frame { layers: vec![Layer::new("Layer 1", width, height)] }],
            current_frame: 0,
            active_layer_index: 0,
            preview_layer: None,
            selection: Selection::default(),
            dirty: true,
            dirty_generation: 0,
            dirty_rect: None,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.frames.first().map_or(0, |f| f.layers.len())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn current_ref(&self) -> LayerRef {
        LayerRef { frame: self.current_frame, layer: self.active_layer_index }
    }

    /// Layers of the current frame.
    pub fn layers(&self) -> &[Layer] {
        self.frames.get(self.current_frame).map_or(&[], |f| f.layers.as_slice())
    }

    pub fn layer(&self, r: LayerRef) -> Option<&Layer> {
        self.frames.get(r.frame)?.layers.get(r.layer)
    }

    pub fn layer_mut(&mut self, r: LayerRef) -> Option<&mut Layer> {
        self.frames.get_mut(r.frame)?.layers.get_mut(r.layer)
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.layer(self.current_ref())
    }

    pub fn active_layer_mut(&mut self) -> Option<&mut Layer> {
        let r = self.current_ref();
        self.layer_mut(r)
    }

    #[inline]
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    /// Current-layer pixel; transparent black out of bounds.
    pub fn get_pixel(&self, x: i32, y: i32) -> Color {
        self.get_pixel_at(self.current_ref(), x, y)
    }

    /// Replace a current-layer pixel.  Out-of-bounds writes are dropped.
    pub fn set_pixel(&mut self, x: i32, y: i32, color: Color) {
        self.set_pixel_at(self.current_ref(), x, y, color);
    }

    pub fn get_pixel_at(&self, r: LayerRef, x: i32, y: i32) -> Color {
        if !self.in_bounds(x, y) {
            return Color::TRANSPARENT;
        }
        self.layer(r).map_or(Color::TRANSPARENT, |l| l.pixels.get_pixel(x as u32, y as u32))
    }

    pub fn set_pixel_at(&mut self, r: LayerRef, x: i32, y: i32, color: Color) {
        if !self.in_bounds(x, y) {
            return;
        }
        if let Some(layer) = self.layer_mut(r) {
            layer.pixels.put_pixel(x as u32, y as u32, color.clamped());
            self.mark_dirty(Some(PixelRect::point(x as u32, y as u32)));
        }
    }

    /// [`write_recorded`] on a canvas layer with bounds checks and dirty
    /// tracking.  Returns false when nothing was written.
    pub fn set_pixel_recorded(
        &mut self,
        r: LayerRef,
        x: i32,
        y: i32,
        color: Color,
        action: Option<&mut HistoryAction>,
    ) -> bool {
        if !self.in_bounds(x, y) {
            return false;
        }
        let Some(layer) = self.layer_mut(r) else { return false };
        write_recorded(&mut layer.pixels, r, x as u32, y as u32, color, action);
        self.mark_dirty(Some(PixelRect::point(x as u32, y as u32)));
        true
    }

    pub fn preview_pixel(&self, x: i32, y: i32) -> Color {
        match &self.preview_layer {
            Some(p) if self.in_bounds(x, y) => p.get_pixel(x as u32, y as u32),
            _ => Color::TRANSPARENT,
        }
    }

    pub fn set_preview_pixel(&mut self, x: i32, y: i32, color: Color) {
        if !self.in_bounds(x, y) {
            return;
        }
        let (w, h) = (self.width, self.height);
        self.preview_layer
            .get_or_insert_with(|| TiledImage::new(w, h))
            .put_pixel(x as u32, y as u32, color.clamped());
        self.mark_dirty(Some(PixelRect::point(x as u32, y as u32)));
    }

    pub fn clear_preview(&mut self) {
        if self.preview_layer.take().is_some() {
            self.mark_dirty(None);
        }
    }

    /// Record that a region changed.  `None` means the whole canvas.
    pub fn mark_dirty(&mut self, rect: Option<PixelRect>) {
        let new_rect = rect.unwrap_or_else(|| PixelRect::full(self.width, self.height));
        self.dirty_rect = Some(match self.dirty_rect {
            Some(existing) => existing.union(&new_rect),
            None => new_rect,
        });
        self.dirty = true;
        self.dirty_generation = self.dirty_generation.wrapping_add(1);
    }

    /// Hand the accumulated dirty region to the display sink and reset it.
    pub fn take_dirty(&mut self) -> Option<PixelRect> {
        self.dirty = false;
        self.dirty_rect.take()
    }

    /// Display composite of the current frame, row-major.
    ///
    /// Visible layers are multiplied bottom to top, all four channels:
    /// the first visible layer with content at a pixel seeds the value and
    /// every later visible non-transparent pixel multiplies into it.  The
    /// preview overlay is drawn on top with normal blending.
    pub fn flatten(&self) -> Vec<Color> {
        let w = self.width as usize;
        let layers = self.layers();
        let preview = self.preview_layer.as_ref();
        let mut out = vec![Color::TRANSPARENT; w * self.height as usize];

        out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            let y = y as u32;
            for (x, slot) in row.iter_mut().enumerate() {
                let x = x as u32;
                let mut acc: Option<Color> = None;
                for layer in layers.iter().filter(|l| l.visible) {
                    let p = layer.pixels.get_pixel(x, y);
                    if p.a <= 0.0 {
                        continue;
                    }
                    acc = Some(match acc {
                        None => p,
                        Some(a) => Color { r: a.r * p.r, g: a.g * p.g, b: a.b * p.b, a: a.a * p.a },
                    });
                }
                let mut px = acc.unwrap_or(Color::TRANSPARENT);
                if let Some(preview) = preview {
                    px = blend(px, preview.get_pixel(x, y), BlendMode::Normal, 1.0);
                }
                *slot = px;
            }
        });
        out
    }

    /// Porter-Duff composite of the current frame using every visible
    /// layer's blend mode and opacity.
    pub fn composite(&self) -> Vec<Color> {
        self.composite_frame(self.current_frame)
    }

    pub fn composite_frame(&self, frame: usize) -> Vec<Color> {
        let w = self.width as usize;
        let mut out = vec![Color::TRANSPARENT; w * self.height as usize];
        let Some(frame) = self.frames.get(frame) else { return out };
        let layers = frame.layers.as_slice();

        out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            for (x, slot) in row.iter_mut().enumerate() {
                *slot = composite_layers(layers, x as u32, y as u32);
            }
        });
        out
    }

    /// Composite color of a single pixel of the current frame.
    pub fn composite_pixel(&self, x: i32, y: i32) -> Color {
        if !self.in_bounds(x, y) {
            return Color::TRANSPARENT;
        }
        composite_layers(self.layers(), x as u32, y as u32)
    }

    /// Bytes held by unshared chunks across every frame and layer.
    pub fn memory_bytes(&self) -> usize {
        self.frames
            .iter()
            .flat_map(|f| f.layers.iter())
            .map(|l| l.pixels.memory_bytes())
            .sum()
    }

    /// First unused "Layer N" name.
    pub fn next_layer_name(&self) -> String {
        let mut n = self.layer_count() + 1;
        loop {
            let name = format!("Layer {}", n);
            if !self.layers().iter().any(|l| l.name == name) {
                return name;
            }
            n += 1;
        }
    }
}

fn composite_layers(layers: &[Layer], x: u32, y: u32) -> Color {
    layers
        .iter()
        .filter(|l| l.visible)
        .fold(Color::TRANSPARENT, |acc, l| blend(acc, l.pixels.get_pixel(x, y), l.blend_mode, l.opacity))
}

// ============================================================================
// CHUNK LOCK — the single guard between brush writers and canvas readers
// ============================================================================

/// Owns the canvas behind one mutex.  Brush operations hold it for exactly
/// one call; display, export and autosave take it to read.
pub struct ChunkLock {
    inner: Mutex<CanvasState>,
}

impl ChunkLock {
    pub fn new(canvas: CanvasState) -> Self {
        Self { inner: Mutex::new(canvas) }
    }

    fn guard(&self) -> MutexGuard<'_, CanvasState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log_warn!("Canvas lock poisoned by a panicked writer; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut CanvasState) -> R) -> R {
        let mut guard = self.guard();
        f(&mut guard)
    }

    pub fn read<R>(&self, f: impl FnOnce(&CanvasState) -> R) -> R {
        let guard = self.guard();
        f(&guard)
    }

    /// Swap in a whole new canvas (project load), returning the old one.
    pub fn replace(&self, canvas: CanvasState) -> CanvasState {
        std::mem::replace(&mut *self.guard(), canvas)
    }

    pub fn dirty_generation(&self) -> u64 {
        self.read(|c| c.dirty_generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_is_silent() {
        let mut c = CanvasState::new(4, 4);
        c.set_pixel(-1, 0, Color::RED);
        c.set_pixel(4, 0, Color::RED);
        assert_eq!(c.get_pixel(-1, 0), Color::TRANSPARENT);
        assert_eq!(c.get_pixel(0, 99), Color::TRANSPARENT);
        assert!(c.active_layer().unwrap().pixels.is_empty());
    }

    #[test]
    fn set_pixel_marks_dirty() {
        let mut c = CanvasState::new(100, 100);
        c.take_dirty();
        let gen0 = c.dirty_generation;
        c.set_pixel(10, 20, Color::BLUE);
        c.set_pixel(70, 5, Color::BLUE);
        assert!(c.dirty);
        assert_eq!(c.dirty_generation, gen0 + 2);
        assert_eq!(c.take_dirty(), Some(PixelRect::new(10, 5, 70, 20)));
        assert!(!c.dirty);
    }

    #[test]
    fn set_chunk_rejects_coordinates_outside_the_grid() {
        let mut img = TiledImage::new(130, 70);
        let full = || vec![Color::RED; CHUNK_LEN];
        assert!(img.set_chunk(2, 1, full()));
        assert!(!img.set_chunk(3, 0, full()));
        // cy past the last row must not alias into another row's slot.
        assert!(!img.set_chunk(0, 2, full()));
        assert!(!img.set_chunk(0, u32::MAX, full()));
        assert!(!img.set_chunk(u32::MAX, u32::MAX, full()));
        assert!(!img.set_chunk(0, 0, vec![Color::RED; 3]));
        assert!(img.get_chunk(0, u32::MAX).is_none());
        assert_eq!(img.chunk_keys().count(), 1);
    }

    #[test]
    fn recorded_writes_clamp_and_log_one_change_per_pixel() {
        use crate::components::history::{ActionKind, HistoryAction};

        let mut c = CanvasState::new(4, 4);
        let r = c.current_ref();
        let mut action = HistoryAction::new(ActionKind::Stroke, "Pencil", r);
        assert!(c.set_pixel_recorded(r, 1, 1, Color::RED, Some(&mut action)));
        assert!(c.set_pixel_recorded(r, 1, 1, Color { r: 0.0, g: 2.0, b: 0.0, a: 1.0 }, Some(&mut action)));
        assert!(!c.set_pixel_recorded(r, 4, 0, Color::RED, Some(&mut action)));
        assert!(!c.set_pixel_recorded(LayerRef { frame: 0, layer: 9 }, 0, 0, Color::RED, Some(&mut action)));

        assert_eq!(c.get_pixel(1, 1), Color::GREEN);
        assert_eq!(action.pixel_count(), 1);
        assert_eq!(action.recorded_old(r, 1, 1), Some(Color::TRANSPARENT));

        action.undo(&mut c);
        assert_eq!(c.get_pixel(1, 1), Color::TRANSPARENT);
    }

    #[test]
    fn pixels_cross_chunk_boundaries() {
        let mut img = TiledImage::new(130, 70);
        img.put_pixel(63, 0, Color::RED);
        img.put_pixel(64, 0, Color::GREEN);
        img.put_pixel(129, 69, Color::BLUE);
        assert_eq!(img.chunk_count(), 3);
        let flat = img.to_pixels();
        let rebuilt = TiledImage::from_pixels(130, 70, &flat);
        assert_eq!(rebuilt.get_pixel(64, 0), Color::GREEN);
        assert_eq!(rebuilt.get_pixel(129, 69), Color::BLUE);
        assert_eq!(rebuilt.chunk_count(), 3);
    }

    #[test]
    fn filled_chunks_copy_on_write() {
        let mut img = TiledImage::new_filled(128, 64, Color::WHITE);
        let snapshot = img.clone();
        img.put_pixel(0, 0, Color::BLACK);
        assert_eq!(snapshot.get_pixel(0, 0), Color::WHITE);
        assert_eq!(img.get_pixel(0, 0), Color::BLACK);
        assert_eq!(img.get_pixel(100, 10), Color::WHITE);
    }

    #[test]
    fn rotate_and_flip_map_corners() {
        let mut img = TiledImage::new(3, 2);
        img.put_pixel(0, 0, Color::RED);
        let cw = img.rotated_90cw();
        assert_eq!((cw.width(), cw.height()), (2, 3));
        assert_eq!(cw.get_pixel(1, 0), Color::RED);
        let ccw = img.rotated_90ccw();
        assert_eq!(ccw.get_pixel(0, 2), Color::RED);
        assert_eq!(img.rotated_180().get_pixel(2, 1), Color::RED);
        assert_eq!(img.flipped_horizontal().get_pixel(2, 0), Color::RED);
        assert_eq!(img.flipped_vertical().get_pixel(0, 1), Color::RED);
    }

    #[test]
    fn flatten_single_layer_is_identity() {
        let mut c = CanvasState::new(2, 2);
        c.set_pixel(0, 0, Color::new(0.2, 0.4, 0.6, 0.8));
        let flat = c.flatten();
        assert_eq!(flat[0], Color::new(0.2, 0.4, 0.6, 0.8));
        assert_eq!(flat[3], Color::TRANSPARENT);
    }

    #[test]
    fn flatten_multiplies_visible_layers() {
        let mut c = CanvasState::new(1, 1);
        c.set_pixel(0, 0, Color::new(0.5, 1.0, 1.0, 1.0));
        c.frames[0].layers.push(Layer::new("top", 1, 1));
        c.active_layer_index = 1;
        c.set_pixel(0, 0, Color::new(0.5, 0.5, 1.0, 1.0));
        assert!(c.flatten()[0].approx_eq(&Color::new(0.25, 0.5, 1.0, 1.0), 1e-6));

        c.frames[0].layers[1].visible = false;
        assert!(c.flatten()[0].approx_eq(&Color::new(0.5, 1.0, 1.0, 1.0), 1e-6));
    }

    #[test]
    fn composite_respects_opacity_and_mode() {
        let mut c = CanvasState::new(1, 1);
        c.set_pixel(0, 0, Color::BLACK);
        let mut top = Layer::new("top", 1, 1);
        top.pixels.put_pixel(0, 0, Color::WHITE);
        top.opacity = 0.5;
        c.frames[0].layers.push(top);
        assert!(c.composite_pixel(0, 0).approx_eq(&Color::new(0.5, 0.5, 0.5, 1.0), 1e-6));

        c.frames[0].layers[1].blend_mode = BlendMode::Multiply;
        c.frames[0].layers[1].opacity = 1.0;
        assert!(c.composite()[0].approx_eq(&Color::BLACK, 1e-6));
    }

    #[test]
    fn chunk_lock_read_write() {
        let lock = ChunkLock::new(CanvasState::new(8, 8));
        lock.write(|c| c.set_pixel(1, 1, Color::RED));
        assert_eq!(lock.read(|c| c.get_pixel(1, 1)), Color::RED);
        assert!(lock.dirty_generation() > 0);
    }

    #[test]
    fn pixel_rect_clipping() {
        assert_eq!(PixelRect::clipped(-5, -5, 2, 1, 4, 4), Some(PixelRect::new(0, 0, 2, 1)));
        assert_eq!(PixelRect::clipped(5, 5, 9, 9, 4, 4), None);
        assert_eq!(PixelRect::new(1, 1, 2, 3).pixels().count(), 6);
    }
}
