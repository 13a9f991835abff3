use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::canvas::{CanvasState, LayerPath};
use crate::components::history::{HistoryManager, SnapshotCommand};
use crate::config::HelperConfig;
use crate::io;
use crate::log_info;
use crate::ops::special_colors::{self, HelperError, RunSummary};

/// How a run request ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// The user declined the confirmation; nothing was touched.
    Cancelled,
}

/// Single open document.
pub struct Project {
    pub id: Uuid,
    pub canvas_state: CanvasState,
    pub history: HistoryManager,
    /// `None` for documents that were never loaded from or saved to disk.
    pub path: Option<PathBuf>,
    pub is_dirty: bool,

    /// Display name (derived from path or "Untitled-X")
    pub name: String,
}

impl Project {
    pub fn new_untitled(untitled_counter: usize, width: u32, height: u32) -> Self {
        Self::from_canvas(format!("Untitled-{}", untitled_counter), None, CanvasState::new(width, height))
    }

    pub fn from_file(path: PathBuf, canvas_state: CanvasState) -> Self {
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        Self::from_canvas(name, Some(path), canvas_state)
    }

    /// Load `path` with [`io::load_image_sync`].
    pub fn open(path: PathBuf) -> Result<Self, String> {
        let canvas_state = io::load_image_sync(&path)?;
        Ok(Self::from_file(path, canvas_state))
    }

    fn from_canvas(name: String, path: Option<PathBuf>, canvas_state: CanvasState) -> Self {
        Self {
            id: Uuid::new_v4(),
            canvas_state,
            history: HistoryManager::new(50), // Default 50 history steps
            path,
            is_dirty: false,
            name,
        }
    }

    /// Write the document to `output` and make it the document's path.
    ///
    /// Project files keep the layer tree and selection; any other extension
    /// gets the flattened composite.
    pub fn save_as(&mut self, output: &Path) -> Result<(), String> {
        if io::is_project_path(output) {
            io::save_project(&self.canvas_state, output).map_err(|e| format!("project save failed: {}", e))?;
        } else {
            io::encode_and_write(&self.canvas_state.composite(), output)?;
        }

        self.path = Some(output.to_path_buf());
        if let Some(name) = output.file_name() {
            self.name = name.to_string_lossy().to_string();
        }
        self.mark_clean();
        log_info!("Saved {} [{}]", output.display(), self.id);
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Resolve `--layer` style names to paths. An empty list means the active layer.
    pub fn resolve_drawables(&self, names: &[String]) -> Result<Vec<LayerPath>, HelperError> {
        if names.is_empty() {
            return Ok(vec![self.canvas_state.active_layer.clone()]);
        }
        names
            .iter()
            .map(|name| {
                self.canvas_state
                    .find_layer(name)
                    .ok_or_else(|| HelperError::UnknownLayer(name.clone()))
            })
            .collect()
    }

    /// Run the special-colors helper as one undo step.
    ///
    /// `confirm` is asked once before anything happens. A failed run leaves
    /// no history entry behind.
    pub fn run_special_colors<C>(
        &mut self,
        drawables: &[LayerPath],
        config: &HelperConfig,
        confirm: C,
    ) -> Result<RunOutcome, HelperError>
    where
        C: FnOnce(&HelperConfig) -> bool,
    {
        if !confirm(config) {
            log_info!("{}: cancelled for {}", config.operation.label(), self.name);
            return Ok(RunOutcome::Cancelled);
        }

        log_info!("{}: {} [{}]", config.operation.label(), self.display_title(), self.id);
        let mut cmd = SnapshotCommand::new(config.operation.label(), &self.canvas_state);
        let summary = special_colors::run(&mut self.canvas_state, drawables, config, io::load_image_sync)?;
        cmd.set_after(&self.canvas_state);
        self.history.push(Box::new(cmd));
        self.mark_dirty();
        Ok(RunOutcome::Completed(summary))
    }
}
