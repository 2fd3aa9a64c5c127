// ============================================================================
// CANVAS-LEVEL OPERATIONS — layer stack and animation frames
// ============================================================================
//
// Every operation validates first, then applies a `LayerOperation` through
// its own `redo` so doing and redoing share one code path.  The returned
// `HistoryAction` is handed to the caller's `History`.

use crate::blend::BlendMode;
use crate::canvas::{CanvasState, Frame, Layer};
use crate::components::history::{HistoryAction, LayerOperation, LayerProps};
use crate::error::{EngineError, Result};

fn apply(state: &mut CanvasState, op: LayerOperation) -> HistoryAction {
    let at = state.current_ref();
    op.redo(state);
    HistoryAction::structural(op, at)
}

fn check_layer(state: &CanvasState, index: usize) -> Result<()> {
    if index >= state.layer_count() {
        return Err(EngineError::invalid(format!(
            "layer index {} out of range (0..{})",
            index,
            state.layer_count()
        )));
    }
    Ok(())
}

fn check_frame(state: &CanvasState, index: usize) -> Result<()> {
    if index >= state.frame_count() {
        return Err(EngineError::invalid(format!(
            "frame index {} out of range (0..{})",
            index,
            state.frame_count()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
//  Layers
// ---------------------------------------------------------------------------

/// Add a new transparent layer above the active layer.
pub fn add_layer(state: &mut CanvasState) -> Result<HistoryAction> {
    let index = (state.active_layer_index + 1).min(state.layer_count());
    let name = state.next_layer_name();
    Ok(apply(state, LayerOperation::Add { index, name }))
}

/// Delete the layer at `index` in every frame.  At least one layer must remain.
pub fn delete_layer(state: &mut CanvasState, index: usize) -> Result<HistoryAction> {
    check_layer(state, index)?;
    if state.layer_count() <= 1 {
        return Err(EngineError::invalid("cannot delete the last layer"));
    }
    let layers: Vec<Layer> = state.frames.iter().map(|f| f.layers[index].clone()).collect();
    Ok(apply(state, LayerOperation::Delete { index, layers }))
}

/// Duplicate the layer at `index` directly above itself.
pub fn duplicate_layer(state: &mut CanvasState, index: usize) -> Result<HistoryAction> {
    check_layer(state, index)?;
    let layers: Vec<Layer> = state
        .frames
        .iter()
        .map(|f| {
            let mut dup = f.layers[index].clone();
            dup.name = format!("{} Copy", dup.name);
            dup
        })
        .collect();
    Ok(apply(
        state,
        LayerOperation::Duplicate { source_index: index, new_index: index + 1, layers },
    ))
}

/// Move a layer from one stack position to another.
pub fn move_layer(state: &mut CanvasState, from: usize, to: usize) -> Result<HistoryAction> {
    check_layer(state, from)?;
    check_layer(state, to)?;
    if from == to {
        return Err(EngineError::invalid("layer is already at that position"));
    }
    Ok(apply(state, LayerOperation::Move { from_index: from, to_index: to }))
}

fn set_properties(
    state: &mut CanvasState,
    index: usize,
    edit: impl FnOnce(&mut LayerProps),
) -> Result<HistoryAction> {
    check_layer(state, index)?;
    let before: Vec<LayerProps> = state.frames.iter().map(|f| LayerProps::of(&f.layers[index])).collect();
    let current = before.get(state.current_frame).or(before.first()).cloned();
    let mut after = current.ok_or_else(|| EngineError::invalid("canvas has no frames"))?;
    edit(&mut after);
    Ok(apply(state, LayerOperation::Properties { index, before, after }))
}

pub fn set_layer_opacity(state: &mut CanvasState, index: usize, opacity: f32) -> Result<HistoryAction> {
    let opacity = if opacity.is_nan() { 1.0 } else { opacity.clamp(0.0, 1.0) };
    set_properties(state, index, |p| p.opacity = opacity)
}

pub fn set_layer_visibility(state: &mut CanvasState, index: usize, visible: bool) -> Result<HistoryAction> {
    set_properties(state, index, |p| p.visible = visible)
}

pub fn set_layer_blend_mode(state: &mut CanvasState, index: usize, mode: BlendMode) -> Result<HistoryAction> {
    set_properties(state, index, |p| p.blend_mode = mode)
}

pub fn rename_layer(state: &mut CanvasState, index: usize, name: &str) -> Result<HistoryAction> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::invalid("layer name cannot be empty"));
    }
    set_properties(state, index, |p| p.name = name.to_string())
}

/// Make `index` the active layer.  Not recorded in history.
pub fn select_layer(state: &mut CanvasState, index: usize) -> Result<()> {
    check_layer(state, index)?;
    state.active_layer_index = index;
    Ok(())
}

// ---------------------------------------------------------------------------
//  Frames
// ---------------------------------------------------------------------------

/// Insert an empty frame after the current one.  Its layers mirror the
/// names and properties of the current stack but hold no pixels.
pub fn add_frame(state: &mut CanvasState) -> Result<HistoryAction> {
    let (w, h) = (state.width, state.height);
    let layers = state
        .layers()
        .iter()
        .map(|l| Layer {
            name: l.name.clone(),
            visible: l.visible,
            opacity: l.opacity,
            blend_mode: l.blend_mode,
            ..Layer::new("", w, h)
        })
        .collect();
    let index = (state.current_frame + 1).min(state.frame_count());
    Ok(apply(state, LayerOperation::AddFrame { index, frame: Frame { layers } }))
}

/// Insert a copy of the current frame right after it.
pub fn duplicate_frame(state: &mut CanvasState) -> Result<HistoryAction> {
    check_frame(state, state.current_frame)?;
    let frame = state.frames[state.current_frame].clone();
    let index = state.current_frame + 1;
    Ok(apply(state, LayerOperation::AddFrame { index, frame }))
}

/// Delete frame `index`.  At least one frame must remain.
pub fn delete_frame(state: &mut CanvasState, index: usize) -> Result<HistoryAction> {
    check_frame(state, index)?;
    if state.frame_count() <= 1 {
        return Err(EngineError::invalid("cannot delete the last frame"));
    }
    let frame = state.frames[index].clone();
    Ok(apply(state, LayerOperation::DeleteFrame { index, frame }))
}

/// Switch the frame that painting and display target.  Not recorded.
pub fn set_current_frame(state: &mut CanvasState, index: usize) -> Result<()> {
    check_frame(state, index)?;
    if state.current_frame != index {
        state.current_frame = index;
        state.clear_preview();
        state.mark_dirty(None);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::components::history::History;

    #[test]
    fn add_layer_goes_above_active_in_every_frame() {
        let mut c = CanvasState::new(4, 4);
        add_frame(&mut c).unwrap();
        c.current_frame = 0;
        let action = add_layer(&mut c).unwrap();
        assert_eq!(c.layer_count(), 2);
        assert!(c.frames.iter().all(|f| f.layers.len() == 2));
        assert_eq!(c.active_layer_index, 1);
        action.undo(&mut c);
        assert!(c.frames.iter().all(|f| f.layers.len() == 1));
    }

    #[test]
    fn cannot_delete_last_layer_or_frame() {
        let mut c = CanvasState::new(2, 2);
        assert!(matches!(delete_layer(&mut c, 0), Err(EngineError::InvalidOperation(_))));
        assert!(matches!(delete_frame(&mut c, 0), Err(EngineError::InvalidOperation(_))));
        assert!(delete_layer(&mut c, 3).is_err());
        assert_eq!(c.layer_count(), 1);
    }

    #[test]
    fn delete_layer_undo_restores_pixels() {
        let mut c = CanvasState::new(3, 3);
        add_layer(&mut c).unwrap();
        c.set_pixel(1, 1, Color::RED);
        let mut history = History::new(10);
        history.add_action(delete_layer(&mut c, 1).unwrap());
        assert_eq!(c.layer_count(), 1);
        history.undo(&mut c).unwrap();
        assert_eq!(c.layer_count(), 2);
        assert_eq!(c.frames[0].layers[1].pixels.get_pixel(1, 1), Color::RED);
    }

    #[test]
    fn duplicate_and_move() {
        let mut c = CanvasState::new(2, 2);
        c.set_pixel(0, 0, Color::BLUE);
        duplicate_layer(&mut c, 0).unwrap();
        assert_eq!(c.layers()[1].name, "Layer 1 Copy");
        assert_eq!(c.layers()[1].pixels.get_pixel(0, 0), Color::BLUE);
        let action = move_layer(&mut c, 1, 0).unwrap();
        assert_eq!(c.layers()[0].name, "Layer 1 Copy");
        action.undo(&mut c);
        assert_eq!(c.layers()[0].name, "Layer 1");
        assert!(move_layer(&mut c, 0, 0).is_err());
    }

    #[test]
    fn properties_round_trip() {
        let mut c = CanvasState::new(2, 2);
        let a = set_layer_opacity(&mut c, 0, 0.25).unwrap();
        let b = set_layer_visibility(&mut c, 0, false).unwrap();
        assert_eq!(c.layers()[0].opacity, 0.25);
        assert!(!c.layers()[0].visible);
        b.undo(&mut c);
        a.undo(&mut c);
        assert_eq!(c.layers()[0].opacity, 1.0);
        assert!(c.layers()[0].visible);
        assert!(rename_layer(&mut c, 0, "  ").is_err());
    }

    #[test]
    fn undoing_frame_ops_restores_the_current_frame() {
        let mut c = CanvasState::new(2, 2);
        duplicate_frame(&mut c).unwrap();
        c.current_frame = 0;
        let mut history = History::new(10);

        history.add_action(add_frame(&mut c).unwrap());
        assert_eq!((c.frame_count(), c.current_frame), (3, 1));
        history.undo(&mut c).unwrap();
        assert_eq!((c.frame_count(), c.current_frame), (2, 0));

        c.current_frame = 1;
        history.add_action(delete_frame(&mut c, 0).unwrap());
        assert_eq!((c.frame_count(), c.current_frame), (1, 0));
        history.undo(&mut c).unwrap();
        assert_eq!((c.frame_count(), c.current_frame), (2, 1));
    }

    #[test]
    fn frames_add_duplicate_delete() {
        let mut c = CanvasState::new(2, 2);
        c.set_pixel(0, 0, Color::GREEN);
        duplicate_frame(&mut c).unwrap();
        assert_eq!(c.frame_count(), 2);
        assert_eq!(c.current_frame, 1);
        assert_eq!(c.get_pixel(0, 0), Color::GREEN);
        add_frame(&mut c).unwrap();
        assert_eq!(c.frame_count(), 3);
        assert_eq!(c.get_pixel(0, 0), Color::TRANSPARENT);
        let action = delete_frame(&mut c, 0).unwrap();
        assert_eq!(c.frame_count(), 2);
        action.undo(&mut c);
        assert_eq!(c.frames[0].layers[0].pixels.get_pixel(0, 0), Color::GREEN);
        assert!(set_current_frame(&mut c, 9).is_err());
        set_current_frame(&mut c, 2).unwrap();
        assert_eq!(c.current_frame, 2);
    }
}
