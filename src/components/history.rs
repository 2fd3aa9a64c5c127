use std::collections::{BTreeMap, VecDeque};

use crate::blend::BlendMode;
use crate::canvas::{CanvasState, Frame, Layer, LayerRef};
use crate::color::Color;
use crate::error::{EngineError, Result};
use crate::selection::SelectionSnapshot;

// ============================================================================
// HISTORY ACTION — one reversible user operation
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Stroke,
    Fill,
    Gradient,
    Dither,
    ReplaceColor,
    Selection,
    SelectionTransform,
    Layer,
    Frame,
    Canvas,
}

/// Diff key: (frame, layer, x, y).
pub type PixelKey = (usize, usize, u32, u32);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelChange {
    pub old: Color,
    pub new: Color,
}

/// Layer properties that can change without touching pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerProps {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
}

impl LayerProps {
    pub fn of(layer: &Layer) -> Self {
        Self {
            name: layer.name.clone(),
            visible: layer.visible,
            opacity: layer.opacity,
            blend_mode: layer.blend_mode,
        }
    }

    fn apply(&self, layer: &mut Layer) {
        layer.name = self.name.clone();
        layer.visible = self.visible;
        layer.opacity = self.opacity;
        layer.blend_mode = self.blend_mode;
    }
}

/// Structural edits to the layer stack or frame list.  Layer edits apply
/// to the same index in every frame so layer counts stay equal.
#[derive(Clone, Debug)]
pub enum LayerOperation {
    /// An empty layer was inserted at `index`.
    Add { index: usize, name: String },
    /// The layer at `index` was removed; one copy per frame for restore.
    Delete { index: usize, layers: Vec<Layer> },
    /// Copies of `source_index` were inserted at `new_index`.
    Duplicate { source_index: usize, new_index: usize, layers: Vec<Layer> },
    Move { from_index: usize, to_index: usize },
    /// Name/visibility/opacity/blend change; `before` holds one entry per frame.
    Properties { index: usize, before: Vec<LayerProps>, after: LayerProps },
    AddFrame { index: usize, frame: Frame },
    DeleteFrame { index: usize, frame: Frame },
}

impl LayerOperation {
    /// Apply the operation forwards.
    pub fn redo(&self, canvas: &mut CanvasState) {
        match self {
            LayerOperation::Add { index, name } => {
                let (w, h) = (canvas.width, canvas.height);
                for frame in &mut canvas.frames {
                    let at = (*index).min(frame.layers.len());
                    frame.layers.insert(at, Layer::new(name.clone(), w, h));
                }
                canvas.active_layer_index = *index;
            }
            LayerOperation::Delete { index, .. } => {
                remove_layer(canvas, *index);
            }
            LayerOperation::Duplicate { new_index, layers, .. } => {
                for (frame, layer) in canvas.frames.iter_mut().zip(layers) {
                    let at = (*new_index).min(frame.layers.len());
                    frame.layers.insert(at, layer.clone());
                }
                canvas.active_layer_index = *new_index;
            }
            LayerOperation::Move { from_index, to_index } => {
                move_layer(canvas, *from_index, *to_index);
            }
            LayerOperation::Properties { index, after, .. } => {
                for frame in &mut canvas.frames {
                    if let Some(layer) = frame.layers.get_mut(*index) {
                        after.apply(layer);
                    }
                }
            }
            LayerOperation::AddFrame { index, frame } => {
                let at = (*index).min(canvas.frames.len());
                canvas.frames.insert(at, frame.clone());
                canvas.current_frame = at;
            }
            LayerOperation::DeleteFrame { index, .. } => {
                remove_frame(canvas, *index);
            }
        }
        canvas.clamp_indices();
        canvas.mark_dirty(None);
    }

    /// Reverse the operation.
    pub fn undo(&self, canvas: &mut CanvasState) {
        match self {
            LayerOperation::Add { index, .. } => {
                remove_layer(canvas, *index);
            }
            LayerOperation::Delete { index, layers } => {
                for (frame, layer) in canvas.frames.iter_mut().zip(layers) {
                    let at = (*index).min(frame.layers.len());
                    frame.layers.insert(at, layer.clone());
                }
                canvas.active_layer_index = *index;
            }
            LayerOperation::Duplicate { new_index, source_index, .. } => {
                remove_layer(canvas, *new_index);
                canvas.active_layer_index = *source_index;
            }
            LayerOperation::Move { from_index, to_index } => {
                move_layer(canvas, *to_index, *from_index);
            }
            LayerOperation::Properties { index, before, .. } => {
                for (frame, props) in canvas.frames.iter_mut().zip(before) {
                    if let Some(layer) = frame.layers.get_mut(*index) {
                        props.apply(layer);
                    }
                }
            }
            LayerOperation::AddFrame { index, .. } => {
                remove_frame(canvas, *index);
            }
            LayerOperation::DeleteFrame { index, frame } => {
                let at = (*index).min(canvas.frames.len());
                canvas.frames.insert(at, frame.clone());
                canvas.current_frame = at;
            }
        }
        canvas.clamp_indices();
        canvas.mark_dirty(None);
    }

    pub fn description(&self) -> String {
        match self {
            LayerOperation::Add { name, .. } => format!("Add Layer: {}", name),
            LayerOperation::Delete { layers, .. } => {
                format!("Delete Layer: {}", layers.first().map_or("", |l| l.name.as_str()))
            }
            LayerOperation::Duplicate { layers, .. } => {
                format!("Duplicate: {}", layers.first().map_or("", |l| l.name.as_str()))
            }
            LayerOperation::Move { from_index, to_index } => format!("Move Layer {} → {}", from_index, to_index),
            LayerOperation::Properties { after, .. } => format!("Layer Properties: {}", after.name),
            LayerOperation::AddFrame { index, .. } => format!("Add Frame {}", index),
            LayerOperation::DeleteFrame { index, .. } => format!("Delete Frame {}", index),
        }
    }

    fn memory_size(&self) -> usize {
        match self {
            LayerOperation::Delete { layers, .. } | LayerOperation::Duplicate { layers, .. } => {
                layers.iter().map(|l| l.pixels.memory_bytes() + l.name.len()).sum()
            }
            LayerOperation::AddFrame { frame, .. } | LayerOperation::DeleteFrame { frame, .. } => {
                frame.layers.iter().map(|l| l.pixels.memory_bytes()).sum()
            }
            _ => std::mem::size_of::<LayerOperation>(),
        }
    }
}

fn remove_layer(canvas: &mut CanvasState, index: usize) {
    for frame in &mut canvas.frames {
        if index < frame.layers.len() && frame.layers.len() > 1 {
            frame.layers.remove(index);
        }
    }
}

fn move_layer(canvas: &mut CanvasState, from: usize, to: usize) {
    for frame in &mut canvas.frames {
        if from < frame.layers.len() {
            let layer = frame.layers.remove(from);
            let at = to.min(frame.layers.len());
            frame.layers.insert(at, layer);
        }
    }
    canvas.active_layer_index = to;
}

fn remove_frame(canvas: &mut CanvasState, index: usize) {
    if index < canvas.frames.len() && canvas.frames.len() > 1 {
        canvas.frames.remove(index);
    }
}

impl CanvasState {
    /// Keep the current layer/frame indices inside the stacks.
    pub fn clamp_indices(&mut self) {
        self.current_frame = self.current_frame.min(self.frames.len().saturating_sub(1));
        self.active_layer_index = self.active_layer_index.min(self.layer_count().saturating_sub(1));
    }
}

// ============================================================================
// CANVAS SNAPSHOT — whole-canvas undo for resize / flip / rotate
// ============================================================================

/// Cheap to take: layer pixels are copy-on-write chunk handles.
#[derive(Clone, Debug)]
pub struct CanvasSnapshot {
    pub width: u32,
    pub height: u32,
    pub frames: Vec<Frame>,
    pub current_frame: usize,
    pub active_layer_index: usize,
    pub selection: SelectionSnapshot,
}

impl CanvasSnapshot {
    pub fn capture(state: &CanvasState) -> Self {
        Self {
            width: state.width,
            height: state.height,
            frames: state.frames.clone(),
            current_frame: state.current_frame,
            active_layer_index: state.active_layer_index,
            selection: state.selection.snapshot(),
        }
    }

    pub fn restore_into(&self, state: &mut CanvasState) {
        state.width = self.width;
        state.height = self.height;
        state.frames = self.frames.clone();
        state.current_frame = self.current_frame;
        state.active_layer_index = self.active_layer_index;
        state.selection.restore(&self.selection);
        state.preview_layer = None;
        state.dirty_rect = None;
        state.mark_dirty(None);
    }

    fn memory_bytes(&self) -> usize {
        self.frames
            .iter()
            .flat_map(|f| f.layers.iter())
            .map(|l| l.pixels.memory_bytes() + l.name.len())
            .sum()
    }
}

// ============================================================================
// HISTORY ACTION
// ============================================================================

#[derive(Clone, Debug)]
pub struct HistoryAction {
    pub kind: ActionKind,
    pub description: String,
    /// Frame and layer current when the action started.
    pub frame: usize,
    pub layer: usize,
    pixels: BTreeMap<PixelKey, PixelChange>,
    selection: Option<(SelectionSnapshot, SelectionSnapshot)>,
    structure: Option<LayerOperation>,
    snapshot: Option<(CanvasSnapshot, CanvasSnapshot)>,
}

impl HistoryAction {
    pub fn new(kind: ActionKind, description: impl Into<String>, at: LayerRef) -> Self {
        Self {
            kind,
            description: description.into(),
            frame: at.frame,
            layer: at.layer,
            pixels: BTreeMap::new(),
            selection: None,
            structure: None,
            snapshot: None,
        }
    }

    pub fn structural(op: LayerOperation, at: LayerRef) -> Self {
        let kind = match op {
            LayerOperation::AddFrame { .. } | LayerOperation::DeleteFrame { .. } => ActionKind::Frame,
            _ => ActionKind::Layer,
        };
        let mut action = Self::new(kind, op.description(), at);
        action.structure = Some(op);
        action
    }

    pub fn canvas(description: impl Into<String>, before: CanvasSnapshot, after: CanvasSnapshot) -> Self {
        let at = LayerRef { frame: before.current_frame, layer: before.active_layer_index };
        let mut action = Self::new(ActionKind::Canvas, description, at);
        action.snapshot = Some((before, after));
        action
    }

    /// Log a pixel write.  The first `old` seen for a pixel is kept; `new`
    /// always tracks the latest write.
    pub fn record_pixel(&mut self, r: LayerRef, x: u32, y: u32, old: Color, new: Color) {
        self.pixels
            .entry((r.frame, r.layer, x, y))
            .and_modify(|c| c.new = new)
            .or_insert(PixelChange { old, new });
    }

    /// Value the pixel had before this action first touched it.
    pub fn recorded_old(&self, r: LayerRef, x: u32, y: u32) -> Option<Color> {
        self.pixels.get(&(r.frame, r.layer, x, y)).map(|c| c.old)
    }

    /// Log a selection change.  The first `before` is kept.
    pub fn record_selection(&mut self, before: SelectionSnapshot, after: SelectionSnapshot) {
        match &mut self.selection {
            Some((_, a)) => *a = after,
            None => self.selection = Some((before, after)),
        }
    }

    pub fn pixel_changes(&self) -> impl Iterator<Item = (&PixelKey, &PixelChange)> {
        self.pixels.iter()
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    /// True when applying the action would change nothing.
    pub fn is_empty(&self) -> bool {
        self.structure.is_none()
            && self.snapshot.is_none()
            && self.selection.as_ref().is_none_or(|(b, a)| b == a)
            && self.pixels.values().all(|c| c.old == c.new)
    }

    pub fn undo(&self, canvas: &mut CanvasState) {
        if let Some((before, _)) = &self.snapshot {
            before.restore_into(canvas);
        }
        for (&(frame, layer, x, y), change) in self.pixels.iter().rev() {
            canvas.set_pixel_at(LayerRef { frame, layer }, x as i32, y as i32, change.old);
        }
        if let Some(op) = &self.structure {
            op.undo(canvas);
            canvas.current_frame = self.frame;
            canvas.active_layer_index = self.layer;
            canvas.clamp_indices();
        }
        if let Some((before, _)) = &self.selection {
            canvas.selection.restore(before);
        }
    }

    pub fn redo(&self, canvas: &mut CanvasState) {
        if let Some(op) = &self.structure {
            op.redo(canvas);
        }
        for (&(frame, layer, x, y), change) in &self.pixels {
            canvas.set_pixel_at(LayerRef { frame, layer }, x as i32, y as i32, change.new);
        }
        if let Some((_, after)) = &self.selection {
            canvas.selection.restore(after);
        }
        if let Some((_, after)) = &self.snapshot {
            after.restore_into(canvas);
        }
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<(PixelKey, PixelChange)>()
            + self.description.len()
            + self.selection.as_ref().map_or(0, |(b, a)| (b.pixels.len() + a.pixels.len()) * 8)
            + self.structure.as_ref().map_or(0, |op| op.memory_size())
            + self.snapshot.as_ref().map_or(0, |(b, a)| b.memory_bytes() + a.memory_bytes())
    }
}

// ============================================================================
// HISTORY — bounded undo/redo log with a cursor
// ============================================================================

/// Entries `[0, cursor)` are applied; `[cursor, len)` form the redo tail.
pub struct History {
    entries: VecDeque<HistoryAction>,
    cursor: usize,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(250)
    }
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::new(), cursor: 0, capacity: capacity.max(1) }
    }

    /// Append a completed action, dropping the redo tail and evicting the
    /// oldest entries past capacity.  Actions that change nothing are
    /// discarded; returns whether the action was kept.
    pub fn add_action(&mut self, action: HistoryAction) -> bool {
        if action.is_empty() {
            return false;
        }
        self.entries.truncate(self.cursor);
        self.entries.push_back(action);
        self.cursor = self.entries.len();
        self.prune();
        true
    }

    pub fn undo(&mut self, canvas: &mut CanvasState) -> Result<String> {
        if self.cursor == 0 {
            return Err(EngineError::invalid("nothing to undo"));
        }
        self.cursor -= 1;
        let action = &self.entries[self.cursor];
        action.undo(canvas);
        Ok(action.description.clone())
    }

    pub fn redo(&mut self, canvas: &mut CanvasState) -> Result<String> {
        let Some(action) = self.entries.get(self.cursor) else {
            return Err(EngineError::invalid("nothing to redo"));
        };
        action.redo(canvas);
        self.cursor += 1;
        Ok(action.description.clone())
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.prune();
    }

    fn prune(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.cursor = self.cursor.saturating_sub(1);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.cursor.checked_sub(1).and_then(|i| self.entries.get(i)).map(|a| a.description.as_str())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.entries.get(self.cursor).map(|a| a.description.as_str())
    }

    /// All entry descriptions, oldest first.
    pub fn descriptions(&self) -> Vec<String> {
        self.entries.iter().map(|a| a.description.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    pub fn memory_usage(&self) -> usize {
        self.entries.iter().map(|a| a.memory_size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paint(canvas: &mut CanvasState, x: i32, color: Color, label: &str) -> HistoryAction {
        let r = canvas.current_ref();
        let mut action = HistoryAction::new(ActionKind::Stroke, label, r);
        let old = canvas.get_pixel(x, 0);
        canvas.set_pixel(x, 0, color);
        action.record_pixel(r, x as u32, 0, old, color);
        action
    }

    #[test]
    fn record_keeps_first_old_and_last_new() {
        let r = LayerRef { frame: 0, layer: 0 };
        let mut a = HistoryAction::new(ActionKind::Stroke, "s", r);
        a.record_pixel(r, 1, 1, Color::BLACK, Color::RED);
        a.record_pixel(r, 1, 1, Color::RED, Color::BLUE);
        assert_eq!(a.pixel_count(), 1);
        assert_eq!(a.recorded_old(r, 1, 1), Some(Color::BLACK));
        let (_, c) = a.pixel_changes().next().unwrap();
        assert_eq!(c.new, Color::BLUE);
    }

    #[test]
    fn undo_redo_walks_the_cursor() {
        let mut c = CanvasState::new(4, 1);
        let mut h = History::new(10);
        let a = paint(&mut c, 0, Color::RED, "one");
        h.add_action(a);
        let b = paint(&mut c, 1, Color::BLUE, "two");
        h.add_action(b);

        assert_eq!(h.undo(&mut c).unwrap(), "two");
        assert_eq!(c.get_pixel(1, 0), Color::TRANSPARENT);
        assert_eq!(h.undo(&mut c).unwrap(), "one");
        assert!(matches!(h.undo(&mut c), Err(EngineError::InvalidOperation(_))));
        assert_eq!(h.redo(&mut c).unwrap(), "one");
        assert_eq!(c.get_pixel(0, 0), Color::RED);
        assert_eq!(h.redo_description(), Some("two"));
    }

    #[test]
    fn new_action_truncates_redo_tail() {
        let mut c = CanvasState::new(4, 1);
        let mut h = History::new(10);
        let a = paint(&mut c, 0, Color::RED, "one");
        h.add_action(a);
        h.undo(&mut c).unwrap();
        let b = paint(&mut c, 2, Color::GREEN, "two");
        h.add_action(b);
        assert!(!h.can_redo());
        assert_eq!(h.descriptions(), vec!["two".to_string()]);
    }

    #[test]
    fn noop_actions_are_discarded() {
        let mut h = History::new(5);
        let r = LayerRef { frame: 0, layer: 0 };
        let mut a = HistoryAction::new(ActionKind::Stroke, "same", r);
        a.record_pixel(r, 0, 0, Color::RED, Color::RED);
        assert!(!h.add_action(a));
        assert!(h.is_empty());
    }

    #[test]
    fn layer_operations_round_trip() {
        let mut c = CanvasState::new(2, 2);
        let op = LayerOperation::Add { index: 1, name: "Layer 2".into() };
        op.redo(&mut c);
        assert_eq!(c.layer_count(), 2);
        assert_eq!(c.active_layer_index, 1);
        op.undo(&mut c);
        assert_eq!(c.layer_count(), 1);
        assert_eq!(c.active_layer_index, 0);
    }

    #[test]
    fn snapshot_restores_dimensions() {
        let mut c = CanvasState::new(3, 2);
        c.set_pixel(2, 1, Color::RED);
        let before = CanvasSnapshot::capture(&c);
        c.width = 9;
        c.frames[0].layers[0].pixels = crate::canvas::TiledImage::new(9, 9);
        let after = CanvasSnapshot::capture(&c);
        let action = HistoryAction::canvas("Resize", before, after);
        action.undo(&mut c);
        assert_eq!(c.width, 3);
        assert_eq!(c.get_pixel(2, 1), Color::RED);
        action.redo(&mut c);
        assert_eq!(c.width, 9);
    }
}
