use std::collections::VecDeque;

use image::GrayImage;

use crate::canvas::{CanvasState, LayerNode, LayerPath};

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// Trait for undoable/redoable commands.
pub trait Command: Send + Sync {
    fn undo(&self, canvas: &mut CanvasState);
    fn redo(&self, canvas: &mut CanvasState);
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
}

// ============================================================================
// HISTORY MANAGER - Manages undo/redo stacks with memory limits
// ============================================================================

/// Undo/redo history manager with memory limits.
pub struct HistoryManager {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: VecDeque<Box<dyn Command>>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50)
    }
}

impl HistoryManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size,
            max_memory_bytes: Some(100 * 1024 * 1024), // 100 MB default limit
            total_memory: 0,
        }
    }

    pub fn with_memory_limit(mut self, max_bytes: Option<usize>) -> Self {
        self.max_memory_bytes = max_bytes;
        self
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        // A new action invalidates everything that could be redone
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }

        self.total_memory += command.memory_size();
        self.undo_stack.push_back(command);
        self.prune();
    }

    pub fn undo(&mut self, canvas: &mut CanvasState) -> Option<String> {
        let command = self.undo_stack.pop_back()?;
        let description = command.description();
        command.undo(canvas);
        self.redo_stack.push_back(command);
        Some(description)
    }

    pub fn redo(&mut self, canvas: &mut CanvasState) -> Option<String> {
        let command = self.redo_stack.pop_back()?;
        let description = command.description();
        command.redo(canvas);
        self.undo_stack.push_back(command);
        Some(description)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|c| c.description())
    }

    /// Get all undo descriptions (most recent first)
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|c| c.description()).collect()
    }

    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }

        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }
}

// ============================================================================
// SNAPSHOT COMMAND - whole-document undo for one helper run
// ============================================================================

/// Stores a complete document snapshot for undo/redo of a helper run.
pub struct SnapshotCommand {
    description: String,
    before: CanvasSnapshot,
    after: Option<CanvasSnapshot>,
}

/// Layer tree, selection and dimensions at one point in time.
///
/// Layer pixels are `TiledImage`s, so cloning the tree only bumps chunk
/// reference counts until one side writes.
#[derive(Clone)]
pub struct CanvasSnapshot {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<LayerNode>,
    pub active_layer: LayerPath,
    pub selection_mask: Option<GrayImage>,
}

impl CanvasSnapshot {
    pub fn capture(state: &CanvasState) -> Self {
        Self {
            width: state.width,
            height: state.height,
            layers: state.layers.clone(),
            active_layer: state.active_layer.clone(),
            selection_mask: state.selection_mask.clone(),
        }
    }

    pub fn restore_into(&self, state: &mut CanvasState) {
        state.width = self.width;
        state.height = self.height;
        state.layers = self.layers.clone();
        state.active_layer = self.active_layer.clone();
        state.selection_mask = self.selection_mask.clone();
    }

    fn memory_bytes(&self) -> usize {
        let mut total = self.selection_mask.as_ref().map_or(0, |m| m.as_raw().len());
        let mut stack: Vec<&LayerNode> = self.layers.iter().collect();
        while let Some(node) = stack.pop() {
            match node {
                LayerNode::Layer(l) => total += l.pixels.memory_bytes() + l.name.len(),
                LayerNode::Group(g) => {
                    total += g.name.len();
                    stack.extend(g.children.iter());
                }
            }
        }
        total
    }
}

impl SnapshotCommand {
    /// Create a snapshot command. Call BEFORE performing the operation.
    /// After the operation, call `set_after()`.
    pub fn new(description: impl Into<String>, state: &CanvasState) -> Self {
        Self {
            description: description.into(),
            before: CanvasSnapshot::capture(state),
            after: None,
        }
    }

    /// Capture the "after" state. Call this AFTER the operation completes.
    pub fn set_after(&mut self, state: &CanvasState) {
        self.after = Some(CanvasSnapshot::capture(state));
    }
}

impl Command for SnapshotCommand {
    fn undo(&self, canvas: &mut CanvasState) {
        self.before.restore_into(canvas);
    }

    fn redo(&self, canvas: &mut CanvasState) {
        if let Some(ref after) = self.after {
            after.restore_into(canvas);
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before.memory_bytes() + self.after.as_ref().map_or(0, |a| a.memory_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Layer, SelectionMode, Surface};
    use image::Rgba;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    fn paint_run(state: &mut CanvasState, color: Rgba<u8>) -> SnapshotCommand {
        let mut cmd = SnapshotCommand::new("Paint", state);
        let path = LayerPath::root(0);
        state.select_color(&Surface::Layer(path.clone()), Rgba([255, 255, 255, 255]), SelectionMode::Replace, 0.0);
        state.fill_selection(&path, color);
        cmd.set_after(state);
        cmd
    }

    #[test]
    fn test_snapshot_undo_redo_restores_pixels_and_selection() {
        let mut state = CanvasState::new(4, 4);
        let mut history = HistoryManager::default();

        let cmd = paint_run(&mut state, RED);
        history.push(Box::new(cmd));
        assert_eq!(state.pick_color(&LayerPath::root(0), 0, 0), Some(RED));
        assert!(state.has_selection());

        assert_eq!(history.undo(&mut state).as_deref(), Some("Paint"));
        assert_eq!(state.pick_color(&LayerPath::root(0), 0, 0), Some(Rgba([255, 255, 255, 255])));
        assert!(!state.has_selection());

        history.redo(&mut state);
        assert_eq!(state.pick_color(&LayerPath::root(0), 3, 3), Some(RED));
        assert!(state.has_selection());
    }

    #[test]
    fn test_push_clears_redo() {
        let mut state = CanvasState::new(2, 2);
        let mut history = HistoryManager::default();
        let cmd = paint_run(&mut state, RED);
        history.push(Box::new(cmd));
        history.undo(&mut state);
        assert!(history.can_redo());

        let cmd = paint_run(&mut state, BLUE);
        history.push(Box::new(cmd));
        assert!(!history.can_redo());
        assert_eq!(history.undo_count(), 1);
    }

    #[test]
    fn test_count_limit_drops_oldest() {
        let mut state = CanvasState::new(2, 2);
        let mut history = HistoryManager::new(2);
        for name in ["one", "two", "three"] {
            history.push(Box::new(SnapshotCommand::new(name, &state)));
        }
        assert_eq!(history.undo_history(), vec!["three".to_string(), "two".to_string()]);
        history.undo(&mut state);
        assert_eq!(history.undo_description().as_deref(), Some("two"));
    }

    #[test]
    fn test_memory_limit_keeps_latest() {
        let state = CanvasState::with_layers(128, 128, vec![Layer::new("big", 128, 128, RED).into()]);
        let mut history = HistoryManager::new(10).with_memory_limit(Some(1));
        history.push(Box::new(SnapshotCommand::new("a", &state)));
        history.push(Box::new(SnapshotCommand::new("b", &state)));
        assert_eq!(history.undo_count(), 1);
        assert!(history.memory_usage() > 0);
        history.clear();
        assert_eq!(history.memory_usage(), 0);
    }
}
