use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::blend::BlendMode;
use crate::canvas::{CanvasState, ChunkLock, PixelRect};
use crate::color::Color;
use crate::components::history::{ActionKind, History, HistoryAction};
use crate::components::tools::{
    BrushEngine, BrushPixelType, BrushShape, DitherPattern, GradientType, StrokeTracker, ToolProperties,
};
use crate::error::{EngineError, Result};
use crate::io;
use crate::ops::canvas_ops;
use crate::ops::transform::{self, Anchor, Interpolation};
use crate::settings::EngineSettings;
use crate::worker::{AnimationPlayer, Autosave, Ticker};
use crate::{log_info, log_warn};

/// Which paint color a pointer button maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Button {
    #[default]
    Primary,
    Secondary,
}

/// Freehand tools driven by pointer-down / move / up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrokeKind {
    Pencil,
    Squares,
    Dither(DitherPattern),
}

impl StrokeKind {
    fn action(&self) -> (ActionKind, &'static str) {
        match self {
            StrokeKind::Pencil => (ActionKind::Stroke, "Pencil"),
            StrokeKind::Squares => (ActionKind::Stroke, "Squares"),
            StrokeKind::Dither(_) => (ActionKind::Dither, "Dither"),
        }
    }
}

/// Log a rejected operation and pass the error on.
fn logged<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        log_warn!("{}", e);
    }
    result
}

/// Single open document: the explicit context every engine call goes
/// through.  The canvas sits behind a [`ChunkLock`] shared with display
/// and background readers; everything else is owned by the interactive
/// thread.
pub struct Project {
    pub id: Uuid,
    /// Display name (derived from path or "Untitled-X")
    pub name: String,
    /// `None` for unsaved/untitled files.
    pub path: Option<PathBuf>,
    pub is_dirty: bool,

    canvas: Arc<ChunkLock>,
    pub history: History,
    pub tools: ToolProperties,
    pub settings: EngineSettings,
    pub primary_color: Color,
    pub secondary_color: Color,

    stroke: StrokeTracker,
    stroke_kind: Option<(StrokeKind, Button)>,
    /// Open take → move/rotate → commit action.
    transform: Option<HistoryAction>,
    /// Pixels currently showing the hover footprint.
    hover: Vec<(i32, i32)>,
}

impl Project {
    pub fn new_untitled(untitled_counter: usize, width: u32, height: u32, settings: EngineSettings) -> Self {
        let name = format!("Untitled-{}", untitled_counter);
        Self::with_canvas(name, None, CanvasState::new(width, height), settings)
    }

    pub fn from_file(path: PathBuf, canvas: CanvasState, settings: EngineSettings) -> Self {
        let name = display_name(&path);
        Self::with_canvas(name, Some(path), canvas, settings)
    }

    /// Open a `.pcp` project or import a raster image.
    pub fn open(path: &Path, settings: EngineSettings) -> Result<Self> {
        let canvas = io::open_any(path)?;
        let is_project = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(io::PROJECT_EXTENSION));
        let mut project = Self::from_file(path.to_path_buf(), canvas, settings);
        if !is_project {
            // Imported images are saved as new projects, never over the source.
            project.path = None;
        }
        Ok(project)
    }

    fn with_canvas(name: String, path: Option<PathBuf>, canvas: CanvasState, settings: EngineSettings) -> Self {
        let settings = settings.clamped();
        let tools = ToolProperties { size: settings.default_brush_size, ..ToolProperties::default() };
        Self {
            id: Uuid::new_v4(),
            name,
            path,
            is_dirty: false,
            canvas: Arc::new(ChunkLock::new(canvas)),
            history: History::new(settings.history_capacity),
            tools,
            primary_color: settings.primary_color,
            secondary_color: settings.secondary_color,
            settings,
            stroke: StrokeTracker::default(),
            stroke_kind: None,
            transform: None,
            hover: Vec::new(),
        }
    }

    // ---- document bookkeeping ---------------------------------------------

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    pub fn update_name_from_path(&mut self) {
        if let Some(ref path) = self.path {
            self.name = display_name(path);
        }
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty { format!("{}*", self.name) } else { self.name.clone() }
    }

    /// Shared handle for display and background readers.
    pub fn canvas(&self) -> Arc<ChunkLock> {
        Arc::clone(&self.canvas)
    }

    /// Run a read-only closure against the canvas under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&CanvasState) -> R) -> R {
        self.canvas.read(f)
    }

    /// Display pull: the current frame's flattened grid.
    pub fn flatten(&self) -> Vec<Color> {
        self.canvas.read(|c| c.flatten())
    }

    pub fn composite(&self) -> Vec<Color> {
        self.canvas.read(|c| c.composite())
    }

    pub fn color_for(&self, button: Button) -> Color {
        match button {
            Button::Primary => self.primary_color,
            Button::Secondary => self.secondary_color,
        }
    }

    pub fn set_history_capacity(&mut self, capacity: usize) {
        self.settings.history_capacity = capacity;
        self.settings = self.settings.clone().clamped();
        self.history.set_capacity(self.settings.history_capacity);
    }

    fn record(&mut self, action: HistoryAction) -> bool {
        let description = action.description.clone();
        let kept = self.history.add_action(action);
        if kept {
            self.is_dirty = true;
        } else {
            log_info!("Discarded no-op action '{}'", description);
        }
        kept
    }

    fn ensure_no_stroke(&self) -> Result<()> {
        if self.stroke.is_active() {
            return Err(EngineError::invalid("a stroke is in progress"));
        }
        Ok(())
    }

    // ---- freehand strokes --------------------------------------------------

    /// Pointer-down: open a stroke action and stamp the first footprint.
    pub fn begin_stroke(&mut self, kind: StrokeKind, button: Button, pos: (i32, i32)) -> Result<()> {
        logged(self.ensure_no_stroke())?;
        self.commit_transform_if_any()?;
        self.clear_hover();
        let (action_kind, desc) = kind.action();
        let at = self.canvas.read(|c| c.current_ref());
        self.stroke.start(action_kind, desc, at);
        self.stroke_kind = Some((kind, button));
        self.stroke_segment(pos, pos);
        Ok(())
    }

    /// Pointer-move while down: connect the previous position to `pos`.
    pub fn stroke(&mut self, pos: (i32, i32)) -> Result<()> {
        if !self.stroke.is_active() {
            return logged(Err(EngineError::invalid("no stroke in progress")));
        }
        let from = self.stroke.last_pos.unwrap_or(pos);
        self.stroke_segment(from, pos);
        Ok(())
    }

    fn stroke_segment(&mut self, from: (i32, i32), to: (i32, i32)) {
        let Some((kind, button)) = self.stroke_kind else { return };
        let color = self.color_for(button);
        let (primary, secondary) = (self.primary_color, self.secondary_color);
        let props = &self.tools;
        let tracker = &mut self.stroke;
        let touched = self.canvas.write(|c| {
            let mut engine = BrushEngine::new(c, props);
            let action = tracker.action_mut();
            match kind {
                StrokeKind::Pencil => engine.line(from, to, color, BrushPixelType::Paint, action),
                StrokeKind::Squares => engine.line_of_squares(from, to, color, BrushPixelType::Paint, action),
                StrokeKind::Dither(pattern) => {
                    let (a, b) = if button == Button::Primary { (primary, secondary) } else { (secondary, primary) };
                    let square = props.shape == BrushShape::Square;
                    engine.dither_line(from, to, a, b, pattern, square, BrushPixelType::Paint, action)
                }
            }
        });
        self.stroke.expand_bounds(&touched);
        self.stroke.last_pos = Some(to);
    }

    /// Pointer-up: hand the completed stroke to history.  Returns whether
    /// anything was recorded.
    pub fn end_stroke(&mut self) -> Result<bool> {
        self.stroke_kind = None;
        match self.stroke.finish() {
            Some(action) => Ok(self.record(action)),
            None => logged(Err(EngineError::invalid("no stroke in progress"))),
        }
    }

    /// Hover feedback: show the brush footprint at `pos` on the preview
    /// overlay, replacing the previous one.  No-op when live preview is off.
    pub fn preview(&mut self, pos: (i32, i32), button: Button) {
        if !self.settings.live_preview || self.stroke.is_active() {
            return;
        }
        let color = self.color_for(button);
        let props = &self.tools;
        let old = std::mem::take(&mut self.hover);
        self.hover = self.canvas.write(|c| {
            let mut engine = BrushEngine::new(c, props);
            engine.clear_preview(&old);
            if props.size <= 1 {
                engine.dot(pos, color)
            } else {
                engine.pencil(pos, color, BrushPixelType::Preview, None)
            }
        });
    }

    fn clear_hover(&mut self) {
        if self.hover.is_empty() {
            return;
        }
        let props = &self.tools;
        let old = std::mem::take(&mut self.hover);
        self.canvas.write(|c| BrushEngine::new(c, props).clear_preview(&old));
    }

    /// Cancel key.  Rolls back, in priority order: an in-progress stroke, an
    /// open selection transform, the selection itself.  Always clears the
    /// preview overlay.
    pub fn cancel(&mut self) {
        self.hover.clear();
        if let Some(action) = self.stroke.cancel() {
            self.stroke_kind = None;
            self.canvas.write(|c| {
                action.undo(c);
                c.clear_preview();
            });
            log_info!("Cancelled stroke '{}'", action.description);
            return;
        }
        if self.transform.is_some() {
            self.rollback_transform();
            self.canvas.write(|c| c.clear_preview());
            return;
        }
        let has_selection = self.canvas.read(|c| !c.selection.is_empty());
        if has_selection && let Err(e) = self.deselect() {
            log_warn!("Cancel could not clear the selection: {}", e);
        }
        self.canvas.write(|c| c.clear_preview());
    }

    // ---- one-shot brushes --------------------------------------------------

    fn one_shot<R>(
        &mut self,
        kind: ActionKind,
        description: &str,
        f: impl FnOnce(&mut BrushEngine<'_>, &mut HistoryAction) -> R,
    ) -> Result<R> {
        logged(self.ensure_no_stroke())?;
        self.commit_transform_if_any()?;
        self.clear_hover();
        let props = &self.tools;
        let (result, action) = self.canvas.write(|c| {
            let mut action = HistoryAction::new(kind, description, c.current_ref());
            let result = f(&mut BrushEngine::new(c, props), &mut action);
            (result, action)
        });
        self.record(action);
        Ok(result)
    }

    pub fn draw_line(&mut self, p1: (i32, i32), p2: (i32, i32), button: Button) -> Result<usize> {
        let color = self.color_for(button);
        let square = self.tools.shape == BrushShape::Square;
        self.one_shot(ActionKind::Stroke, "Line", |e, a| {
            let touched = if square {
                e.line_of_squares(p1, p2, color, BrushPixelType::Paint, Some(a))
            } else {
                e.line(p1, p2, color, BrushPixelType::Paint, Some(a))
            };
            touched.len()
        })
    }

    /// Flood fill from `pos`; returns the number of pixels written.
    pub fn fill(
        &mut self,
        pos: (i32, i32),
        button: Button,
        threshold: f32,
        diagonal: bool,
        merge_layers: bool,
    ) -> Result<usize> {
        let color = self.color_for(button);
        self.one_shot(ActionKind::Fill, "Fill", |e, a| {
            e.flood(pos, color, threshold, diagonal, merge_layers, BrushPixelType::Paint, Some(a)).len()
        })
    }

    /// Primary → secondary gradient from `p1` to `p2`.
    pub fn gradient(&mut self, p1: (i32, i32), p2: (i32, i32), kind: GradientType) -> Result<usize> {
        let (a, b) = (self.primary_color, self.secondary_color);
        self.one_shot(ActionKind::Gradient, "Gradient", |e, action| {
            e.gradient(p1, p2, a, b, kind, BrushPixelType::Paint, Some(action)).len()
        })
    }

    /// Single dither stamp at `pos`.
    pub fn dither(&mut self, pos: (i32, i32), pattern: DitherPattern, square: bool) -> Result<usize> {
        let (a, b) = (self.primary_color, self.secondary_color);
        self.one_shot(ActionKind::Dither, "Dither", |e, action| {
            e.dither(pos, a, b, pattern, square, BrushPixelType::Paint, Some(action)).len()
        })
    }

    /// Replace the color under `pos` with the primary color.
    pub fn replace_color(
        &mut self,
        pos: (i32, i32),
        all_layers: bool,
        all_frames: bool,
        ignore_opacity: bool,
    ) -> Result<usize> {
        let color = self.primary_color;
        self.one_shot(ActionKind::ReplaceColor, "Replace Color", |e, a| {
            e.replace_color(pos, color, all_layers, all_frames, ignore_opacity, Some(a))
        })
    }

    /// Eyedropper: read the color at `pos` into the chosen paint slot.
    pub fn sample_color(&mut self, pos: (i32, i32), ignore_layer_opacity: bool, merge_layers: bool, button: Button) -> Color {
        let color = self
            .canvas
            .read(|c| crate::components::tools::sample_color(c, pos, ignore_layer_opacity, merge_layers));
        match button {
            Button::Primary => self.primary_color = color,
            Button::Secondary => self.secondary_color = color,
        }
        color
    }

    // ---- selection ---------------------------------------------------------

    fn selection_change(
        &mut self,
        description: &str,
        f: impl FnOnce(&mut CanvasState) -> Result<()>,
    ) -> Result<bool> {
        logged(self.ensure_no_stroke())?;
        self.commit_transform_if_any()?;
        let action = self.canvas.write(|c| -> Result<HistoryAction> {
            let before = c.selection.snapshot();
            let mut action = HistoryAction::new(ActionKind::Selection, description, c.current_ref());
            f(c)?;
            action.record_selection(before, c.selection.snapshot());
            c.mark_dirty(None);
            Ok(action)
        });
        let action = logged(action)?;
        Ok(self.record(action))
    }

    /// Point-origin selection at `pos`.
    pub fn select_point(&mut self, pos: (i32, i32)) -> Result<bool> {
        self.selection_change("Select Point", |c| {
            if !c.in_bounds(pos.0, pos.1) {
                return Err(EngineError::invalid(format!("point ({}, {}) is outside the canvas", pos.0, pos.1)));
            }
            c.selection.set_pixel_with_history(pos.0 as u32, pos.1 as u32, None)
        })
    }

    /// Rectangle between two corners, clipped to the canvas.
    pub fn select_rect(&mut self, p1: (i32, i32), p2: (i32, i32)) -> Result<bool> {
        self.selection_change("Select Rectangle", |c| {
            let (x0, x1) = (p1.0.min(p2.0), p1.0.max(p2.0));
            let (y0, y1) = (p1.1.min(p2.1), p1.1.max(p2.1));
            let rect = PixelRect::clipped(x0, y0, x1, y1, c.width, c.height)
                .ok_or_else(|| EngineError::invalid("rectangle lies outside the canvas"))?;
            c.selection.select_rect(rect)
        })
    }

    pub fn select_all(&mut self) -> Result<bool> {
        self.selection_change("Select All", |c| {
            let (w, h) = (c.width, c.height);
            c.selection.select_all(w, h)
        })
    }

    /// Magic selection: flood from `pos` writing into the selection.
    pub fn magic_select(&mut self, pos: (i32, i32), threshold: f32, diagonal: bool, merge_layers: bool) -> Result<bool> {
        let props = self.tools.clone();
        self.selection_change("Magic Select", |c| {
            c.selection.begin_selecting()?;
            BrushEngine::new(c, &props).flood(
                pos,
                Color::TRANSPARENT,
                threshold,
                diagonal,
                merge_layers,
                BrushPixelType::Selection,
                None,
            );
            c.selection.finish_selecting();
            Ok(())
        })
    }

    pub fn deselect(&mut self) -> Result<bool> {
        self.selection_change("Deselect", |c| {
            c.clear_selection(None);
            Ok(())
        })
    }

    /// Lift the selected pixels off the current layer.
    pub fn take_selection(&mut self) -> Result<()> {
        logged(self.ensure_no_stroke())?;
        if self.transform.is_some() {
            return logged(Err(EngineError::invalid("selection is already taken")));
        }
        let action = self.canvas.write(|c| -> Result<HistoryAction> {
            let mut action = HistoryAction::new(ActionKind::SelectionTransform, "Move Selection", c.current_ref());
            action.record_selection(c.selection.snapshot(), c.selection.snapshot());
            c.take_selection(Some(&mut action))?;
            Ok(action)
        });
        self.transform = Some(logged(action)?);
        Ok(())
    }

    pub fn move_selection(&mut self, dx: i32, dy: i32) -> Result<()> {
        if self.transform.is_none() {
            return logged(Err(EngineError::invalid("move requires taken pixels")));
        }
        logged(self.canvas.write(|c| -> Result<()> {
            c.selection.move_by(dx, dy)?;
            c.mark_dirty(None);
            Ok(())
        }))
    }

    pub fn rotate_selection(&mut self, angle_degrees: f32, interpolate_empty: bool, ignore_empty_colors: bool) -> Result<()> {
        if self.transform.is_none() {
            return logged(Err(EngineError::invalid("rotate requires taken pixels")));
        }
        if let Some(action) = self.transform.as_mut() {
            action.description = "Rotate Selection".to_string();
        }
        logged(self.canvas.write(|c| -> Result<()> {
            c.selection.rotate_selection(angle_degrees, interpolate_empty, ignore_empty_colors)?;
            c.mark_dirty(None);
            Ok(())
        }))
    }

    /// Paint the taken pixels back at their offset and record the whole
    /// take → commit sequence as one action.
    pub fn commit_selection(&mut self) -> Result<bool> {
        let Some(mut action) = self.transform.take() else {
            return logged(Err(EngineError::invalid("commit requires taken pixels")));
        };
        let result = self.canvas.write(|c| -> Result<()> {
            c.commit_selection(Some(&mut action))?;
            let after = c.selection.snapshot();
            action.record_selection(after.clone(), after);
            Ok(())
        });
        if let Err(e) = result {
            self.transform = Some(action);
            return logged(Err(e));
        }
        Ok(self.record(action))
    }

    /// Put taken pixels back where they were without recording anything.
    pub fn reset_selection(&mut self) -> Result<()> {
        if self.transform.is_none() {
            return logged(Err(EngineError::invalid("reset requires taken pixels")));
        }
        self.rollback_transform();
        Ok(())
    }

    fn rollback_transform(&mut self) {
        if let Some(action) = self.transform.take() {
            self.canvas.write(|c| {
                if c.reset_selection(None).is_err() {
                    action.undo(c);
                }
            });
            log_info!("Rolled back '{}'", action.description);
        }
    }

    fn commit_transform_if_any(&mut self) -> Result<()> {
        if self.transform.is_some() {
            self.commit_selection()?;
        }
        Ok(())
    }

    // ---- history -----------------------------------------------------------

    fn settle_for_history(&mut self) {
        if let Some(action) = self.stroke.cancel() {
            self.stroke_kind = None;
            self.canvas.write(|c| action.undo(c));
        }
        self.rollback_transform();
        self.clear_hover();
    }

    pub fn undo(&mut self) -> Result<String> {
        self.settle_for_history();
        let history = &mut self.history;
        let desc = logged(self.canvas.write(|c| history.undo(c)))?;
        self.is_dirty = true;
        Ok(desc)
    }

    pub fn redo(&mut self) -> Result<String> {
        self.settle_for_history();
        let history = &mut self.history;
        let desc = logged(self.canvas.write(|c| history.redo(c)))?;
        self.is_dirty = true;
        Ok(desc)
    }

    // ---- layers / frames / canvas -----------------------------------------

    fn structural(&mut self, f: impl FnOnce(&mut CanvasState) -> Result<HistoryAction>) -> Result<()> {
        logged(self.ensure_no_stroke())?;
        self.commit_transform_if_any()?;
        self.clear_hover();
        let action = logged(self.canvas.write(f))?;
        self.record(action);
        Ok(())
    }

    pub fn add_layer(&mut self) -> Result<()> {
        self.structural(canvas_ops::add_layer)
    }

    pub fn delete_layer(&mut self, index: usize) -> Result<()> {
        self.structural(|c| canvas_ops::delete_layer(c, index))
    }

    pub fn duplicate_layer(&mut self, index: usize) -> Result<()> {
        self.structural(|c| canvas_ops::duplicate_layer(c, index))
    }

    pub fn move_layer(&mut self, from: usize, to: usize) -> Result<()> {
        self.structural(|c| canvas_ops::move_layer(c, from, to))
    }

    pub fn set_layer_opacity(&mut self, index: usize, opacity: f32) -> Result<()> {
        self.structural(|c| canvas_ops::set_layer_opacity(c, index, opacity))
    }

    pub fn set_layer_visibility(&mut self, index: usize, visible: bool) -> Result<()> {
        self.structural(|c| canvas_ops::set_layer_visibility(c, index, visible))
    }

    pub fn set_layer_blend_mode(&mut self, index: usize, mode: BlendMode) -> Result<()> {
        self.structural(|c| canvas_ops::set_layer_blend_mode(c, index, mode))
    }

    pub fn rename_layer(&mut self, index: usize, name: &str) -> Result<()> {
        self.structural(|c| canvas_ops::rename_layer(c, index, name))
    }

    pub fn select_layer(&mut self, index: usize) -> Result<()> {
        logged(self.ensure_no_stroke())?;
        self.commit_transform_if_any()?;
        logged(self.canvas.write(|c| canvas_ops::select_layer(c, index)))
    }

    pub fn add_frame(&mut self) -> Result<()> {
        self.structural(canvas_ops::add_frame)
    }

    pub fn duplicate_frame(&mut self) -> Result<()> {
        self.structural(canvas_ops::duplicate_frame)
    }

    pub fn delete_frame(&mut self, index: usize) -> Result<()> {
        self.structural(|c| canvas_ops::delete_frame(c, index))
    }

    pub fn set_current_frame(&mut self, index: usize) -> Result<()> {
        logged(self.ensure_no_stroke())?;
        self.commit_transform_if_any()?;
        self.clear_hover();
        logged(self.canvas.write(|c| canvas_ops::set_current_frame(c, index)))
    }

    pub fn flip_horizontal(&mut self) -> Result<()> {
        self.structural(|c| Ok(transform::flip_horizontal(c)))
    }

    pub fn flip_vertical(&mut self) -> Result<()> {
        self.structural(|c| Ok(transform::flip_vertical(c)))
    }

    pub fn rotate_90cw(&mut self) -> Result<()> {
        self.structural(|c| Ok(transform::rotate_90cw(c)))
    }

    pub fn rotate_90ccw(&mut self) -> Result<()> {
        self.structural(|c| Ok(transform::rotate_90ccw(c)))
    }

    pub fn rotate_180(&mut self) -> Result<()> {
        self.structural(|c| Ok(transform::rotate_180(c)))
    }

    pub fn resize_image(&mut self, width: u32, height: u32, interp: Interpolation) -> Result<()> {
        self.structural(|c| transform::resize_image(c, width, height, interp))
    }

    pub fn resize_canvas(&mut self, width: u32, height: u32, anchor: Anchor) -> Result<()> {
        self.structural(|c| transform::resize_canvas(c, width, height, anchor))
    }

    // ---- persistence -------------------------------------------------------

    /// Save as a `.pcp` project to `path`, or to the current path.
    pub fn save(&mut self, path: Option<&Path>) -> Result<()> {
        let target = match path.map(Path::to_path_buf).or_else(|| self.path.clone()) {
            Some(p) => p,
            None => return logged(Err(EngineError::invalid("project has no file path"))),
        };
        logged(self.ensure_no_stroke())?;
        self.commit_transform_if_any()?;
        let data = self.canvas.read(io::build_project);
        logged(io::write_project(&data, &target))?;
        log_info!("Saved '{}' to {}", self.name, target.display());
        self.path = Some(target);
        self.update_name_from_path();
        self.mark_clean();
        Ok(())
    }

    pub fn export_png(&self, path: &Path) -> Result<()> {
        logged(self.canvas.read(|c| io::export_png(c, path)))
    }

    pub fn export_image(&self, path: &Path, quality: u8) -> Result<()> {
        let format = io::SaveFormat::from_path(path)
            .ok_or_else(|| EngineError::invalid(format!("unsupported export format: {}", path.display())));
        let format = logged(format)?;
        logged(self.canvas.read(|c| io::export_image(c, path, format, quality)))
    }

    // ---- background workers ------------------------------------------------

    /// Autosave ticker per `settings.autosave_minutes`; `None` when disabled.
    pub fn start_autosave(&self) -> Result<Option<Ticker>> {
        Autosave::new(self.canvas(), &io::autosave_dir(), &self.name).start(self.settings.autosave_minutes)
    }

    /// Loop the frames at `settings.animation_fps` until the ticker is dropped.
    pub fn start_playback(&self) -> Result<Ticker> {
        AnimationPlayer::new(self.canvas()).start(self.settings.animation_fps)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(w: u32, h: u32) -> Project {
        Project::new_untitled(1, w, h, EngineSettings::default())
    }

    fn px(p: &Project, x: i32, y: i32) -> Color {
        p.read(|c| c.get_pixel(x, y))
    }

    #[test]
    fn stroke_is_one_history_entry() {
        let mut p = project(10, 10);
        p.primary_color = Color::RED;
        p.begin_stroke(StrokeKind::Pencil, Button::Primary, (1, 1)).unwrap();
        p.stroke((5, 1)).unwrap();
        p.stroke((5, 5)).unwrap();
        assert!(p.end_stroke().unwrap());
        assert_eq!(p.history.len(), 1);
        assert_eq!(px(&p, 3, 1), Color::RED);
        assert_eq!(px(&p, 5, 3), Color::RED);
        assert!(p.is_dirty);

        p.undo().unwrap();
        assert_eq!(px(&p, 3, 1), Color::TRANSPARENT);
        p.redo().unwrap();
        assert_eq!(px(&p, 5, 5), Color::RED);
    }

    #[test]
    fn cancel_rolls_back_an_open_stroke() {
        let mut p = project(6, 6);
        p.begin_stroke(StrokeKind::Squares, Button::Primary, (0, 0)).unwrap();
        p.stroke((5, 5)).unwrap();
        assert_eq!(px(&p, 3, 3), Color::BLACK);
        p.cancel();
        assert_eq!(px(&p, 3, 3), Color::TRANSPARENT);
        assert!(p.history.is_empty());
        assert!(p.stroke((1, 1)).is_err());
    }

    #[test]
    fn preview_never_touches_layers_or_history() {
        let mut p = project(8, 8);
        p.tools.size = 3;
        p.preview((4, 4), Button::Primary);
        assert!(p.read(|c| c.preview_pixel(4, 4)).a > 0.0);
        p.preview((0, 0), Button::Primary);
        assert_eq!(p.read(|c| c.preview_pixel(4, 4)), Color::TRANSPARENT);
        assert_eq!(px(&p, 0, 0), Color::TRANSPARENT);
        assert!(p.history.is_empty());

        p.settings.live_preview = false;
        p.cancel();
        p.preview((4, 4), Button::Primary);
        assert!(p.read(|c| c.preview_layer.is_none()));
    }

    #[test]
    fn take_move_commit_is_one_undoable_action() {
        let mut p = project(6, 6);
        p.canvas().write(|c| c.set_pixel(1, 1, Color::BLUE));
        p.select_rect((1, 1), (1, 1)).unwrap();
        p.take_selection().unwrap();
        assert_eq!(px(&p, 1, 1), Color::TRANSPARENT);
        p.move_selection(2, 0).unwrap();
        assert!(p.commit_selection().unwrap());
        assert_eq!(px(&p, 3, 1), Color::BLUE);
        assert_eq!(px(&p, 1, 1), Color::TRANSPARENT);
        assert!(p.read(|c| c.selection.contains(3, 1)));

        p.undo().unwrap();
        assert_eq!(px(&p, 1, 1), Color::BLUE);
        assert_eq!(px(&p, 3, 1), Color::TRANSPARENT);
        assert!(p.read(|c| c.selection.contains(1, 1)));
    }

    #[test]
    fn commit_without_take_is_rejected() {
        let mut p = project(4, 4);
        assert!(matches!(p.commit_selection(), Err(EngineError::InvalidOperation(_))));
        assert!(p.move_selection(1, 1).is_err());
        assert!(p.take_selection().is_err());
    }

    #[test]
    fn cancel_during_transform_restores_pixels() {
        let mut p = project(4, 4);
        p.canvas().write(|c| c.set_pixel(0, 0, Color::GREEN));
        p.select_all().unwrap();
        p.take_selection().unwrap();
        p.move_selection(1, 1).unwrap();
        p.cancel();
        assert_eq!(px(&p, 0, 0), Color::GREEN);
        assert_eq!(p.history.len(), 1);
    }

    #[test]
    fn magic_select_then_fill_is_clipped() {
        let mut p = project(4, 4);
        p.canvas().write(|c| {
            for y in 0..4 {
                c.set_pixel(2, y, Color::WHITE);
            }
        });
        p.magic_select((0, 0), 0.0, false, false).unwrap();
        assert_eq!(p.read(|c| c.selection.len()), 8);
        p.primary_color = Color::RED;
        p.fill((0, 0), Button::Primary, 1.0, false, false).unwrap();
        assert_eq!(px(&p, 1, 1), Color::RED);
        assert_eq!(px(&p, 2, 1), Color::WHITE);
        assert_eq!(px(&p, 3, 1), Color::TRANSPARENT);
    }

    #[test]
    fn sample_color_sets_slot() {
        let mut p = project(2, 2);
        p.canvas().write(|c| c.set_pixel(1, 0, Color::BLUE));
        let c = p.sample_color((1, 0), false, false, Button::Secondary);
        assert_eq!(c, Color::BLUE);
        assert_eq!(p.secondary_color, Color::BLUE);
        assert!(p.history.is_empty());
    }

    #[test]
    fn layer_ops_go_through_history() {
        let mut p = project(3, 3);
        p.add_layer().unwrap();
        p.set_layer_opacity(1, 0.5).unwrap();
        assert_eq!(p.read(|c| c.layer_count()), 2);
        p.undo().unwrap();
        p.undo().unwrap();
        assert_eq!(p.read(|c| c.layer_count()), 1);
        assert!(p.delete_layer(0).is_err());
    }

    #[test]
    fn save_requires_a_path_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = project(3, 3);
        assert!(p.save(None).is_err());
        p.canvas().write(|c| c.set_pixel(2, 2, Color::RED));
        p.mark_dirty();
        let path = dir.path().join("doc.pcp");
        p.save(Some(&path)).unwrap();
        assert!(!p.is_dirty);
        assert_eq!(p.name, "doc.pcp");

        let reopened = Project::open(&path, EngineSettings::default()).unwrap();
        assert_eq!(reopened.read(|c| c.get_pixel(2, 2)), Color::RED);
        assert_eq!(reopened.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn reselecting_the_current_frame_drops_the_hover_marker() {
        let mut p = project(4, 4);
        p.preview((1, 1), Button::Primary);
        assert!(p.read(|c| c.preview_layer.is_some()));
        p.set_current_frame(0).unwrap();
        assert!(p.hover.is_empty());
        assert!(p.read(|c| c.preview_layer.is_none()));
    }

    #[test]
    fn cancel_with_a_plain_selection_records_a_deselect() {
        let mut p = project(4, 4);
        p.select_rect((0, 0), (1, 1)).unwrap();
        p.cancel();
        assert!(p.read(|c| c.selection.is_empty()));
        assert_eq!(p.history.undo_description(), Some("Deselect"));
        p.undo().unwrap();
        assert_eq!(p.read(|c| c.selection.len()), 4);
    }

    #[test]
    fn autosave_is_off_by_default_and_playback_ticks() {
        let mut p = project(2, 2);
        assert!(p.start_autosave().unwrap().is_none());

        p.add_frame().unwrap();
        p.set_current_frame(0).unwrap();
        p.settings.animation_fps = 60.0;
        let ticker = p.start_playback().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut advanced = false;
        while !advanced && std::time::Instant::now() < deadline {
            advanced = p.read(|c| c.current_frame) == 1;
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        ticker.stop();
        assert!(advanced);
    }
}
