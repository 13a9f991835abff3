//! The special-colors engine.
//!
//! One run walks every target surface and, inside it, every color of the
//! working palette. Each (surface, color) pair produces a color-match
//! selection that is either accumulated (`select`) or used as the mask for a
//! repaint (`remove`, `repair`, `lighten`, `darken`, `lookup`). The selection
//! that existed before the run is saved up front and merged back at the end.

use std::path::{Path, PathBuf};

use image::{GrayImage, Rgba};
use thiserror::Error;

use crate::canvas::{CanvasState, LayerPath, SelectionMode, Surface};
use crate::config::{HelperConfig, LayersOption, Operation, SelectMode};
use crate::ops::lookup::LookupReference;
use crate::palette::{WorkingPalette, to_hex};
use crate::{log_info, log_warn};

#[derive(Debug, Error)]
pub enum HelperError {
    /// `lookup` was chosen without a reference image.
    #[error("Lookup image must not be None for convert operation.")]
    MissingLookupFile,
    #[error("could not load lookup image '{}': {reason}", path.display())]
    LookupLoad { path: PathBuf, reason: String },
    #[error("threshold {0} is outside 0-255")]
    InvalidThreshold(f64),
    #[error("no layer named '{0}'")]
    UnknownLayer(String),
}

/// What a finished run did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    /// Operation actually performed (`merged` forces `select`).
    pub operation: Operation,
    pub surfaces: usize,
    pub colors: usize,
    /// Pixels repainted across all surfaces.
    pub pixels_changed: usize,
    pub message: String,
}

/// Target-surface scope before resolution.
#[derive(Clone, Copy, Debug)]
pub enum SurfaceScope<'a> {
    Explicit(&'a [LayerPath]),
    AllFlattened,
    MergedComposite,
}

/// Expand a scope into the flat, ordered surface list the engine iterates.
pub fn resolve_surfaces(state: &CanvasState, scope: SurfaceScope<'_>) -> Vec<Surface> {
    match scope {
        SurfaceScope::Explicit(paths) => paths.iter().cloned().map(Surface::Layer).collect(),
        SurfaceScope::AllFlattened => state.flatten_layer_tree().into_iter().map(Surface::Layer).collect(),
        SurfaceScope::MergedComposite => vec![Surface::Merged],
    }
}

/// Move every RGB channel one step away from its special value: zero goes up,
/// anything else goes down. Alpha is kept.
pub fn nudge_off_special(color: Rgba<u8>) -> Rgba<u8> {
    let step = |c: u8| if c > 0 { c - 1 } else { 1 };
    Rgba([step(color[0]), step(color[1]), step(color[2]), color[3]])
}

/// Replacement for a matched swatch under a repainting operation.
/// `None` for operations that do not repaint matches, and for the first
/// entry of a lighten/darken ramp.
fn repaint_color(operation: Operation, palette: &WorkingPalette, index: usize, color: Rgba<u8>) -> Option<Rgba<u8>> {
    match operation {
        Operation::Remove => Some(nudge_off_special(color)),
        Operation::Repair => Some(color),
        Operation::Darken | Operation::Lighten => palette.previous(index),
        Operation::Select | Operation::Lookup => None,
    }
}

/// Run the helper over `state`.
///
/// `drawables` are the caller's selected layers (used for
/// [`LayersOption::Selected`]). `load_reference` opens the lookup image; it is
/// only called for `lookup`, and the image is dropped before returning.
///
/// On error nothing in `state` has been modified.
pub fn run<L>(
    state: &mut CanvasState,
    drawables: &[LayerPath],
    config: &HelperConfig,
    load_reference: L,
) -> Result<RunSummary, HelperError>
where
    L: FnOnce(&Path) -> Result<CanvasState, String>,
{
    config.validate()?;

    let palette = WorkingPalette::assemble(&config.groups, config.operation);

    let (operation, surfaces) = match config.layers_option {
        LayersOption::Selected => (config.operation, resolve_surfaces(state, SurfaceScope::Explicit(drawables))),
        LayersOption::All => (config.operation, resolve_surfaces(state, SurfaceScope::AllFlattened)),
        LayersOption::Merged => (Operation::Select, resolve_surfaces(state, SurfaceScope::MergedComposite)),
    };

    let mut reference = match operation {
        Operation::Lookup => {
            let path = config.lookup_file.as_deref().ok_or(HelperError::MissingLookupFile)?;
            let canvas = load_reference(path).map_err(|reason| HelperError::LookupLoad {
                path: path.to_path_buf(),
                reason,
            })?;
            let reference = LookupReference::new(canvas).ok_or_else(|| HelperError::LookupLoad {
                path: path.to_path_buf(),
                reason: "image has no layers".to_string(),
            })?;
            log_info!(
                "Lookup image {} opened ({})",
                path.display(),
                if reference.is_vertical() { "vertical" } else { "horizontal" }
            );
            Some(reference)
        }
        _ => None,
    };

    log_info!(
        "{}: {} colors over {} surfaces, select mode {}",
        operation.label(),
        palette.len(),
        surfaces.len(),
        config.select_mode
    );

    let saved_selection: Option<GrayImage> = if state.has_selection() {
        state.selection_mask.clone()
    } else {
        None
    };
    let threshold = if operation == Operation::Repair { config.threshold_fraction() } else { 0.0 };

    if operation == Operation::Select && config.select_mode != SelectMode::Add {
        state.clear_selection();
    }

    // Restrict the current match to the pre-existing selection when asked to.
    let gate = |state: &mut CanvasState| {
        if config.select_mode == SelectMode::Intersect
            && let Some(saved) = saved_selection.as_ref()
        {
            state.select_mask(saved, SelectionMode::Intersect);
        }
    };

    // Flatten once; the composite does not change while only the selection moves.
    let merged_flat = surfaces.contains(&Surface::Merged).then(|| state.composite());

    let mut pixels_changed = 0;
    for (n, surface) in surfaces.iter().enumerate() {
        log_info!("Surface {}/{}: {:?}", n + 1, surfaces.len(), surface);
        for (index, &color) in palette.colors().iter().enumerate() {
            match operation {
                Operation::Select => match (surface, merged_flat.as_ref()) {
                    (Surface::Merged, Some(flat)) => state.select_color_in(flat, color, SelectionMode::Add, 0.0),
                    _ => state.select_color(surface, color, SelectionMode::Add, 0.0),
                },
                Operation::Lookup => {
                    let Some(source) = reference.as_mut().and_then(|r| r.resolve(color)) else {
                        log_warn!("No lookup match for {}, skipped", to_hex(color));
                        continue;
                    };
                    state.select_color(surface, source, SelectionMode::Replace, 0.0);
                    gate(state);
                    if !state.has_selection() {
                        continue;
                    }
                    pixels_changed += fill_surface(state, surface, color);
                }
                Operation::Remove | Operation::Repair | Operation::Darken | Operation::Lighten => {
                    state.select_color(surface, color, SelectionMode::Replace, threshold);
                    if !state.has_selection() {
                        continue;
                    }
                    gate(state);
                    if !state.has_selection() {
                        continue;
                    }
                    let Some(paint) = repaint_color(operation, &palette, index, color) else {
                        continue;
                    };
                    pixels_changed += fill_surface(state, surface, paint);
                }
            }
        }
    }

    if reference.take().is_some() {
        log_info!("Lookup image closed");
    }

    match saved_selection {
        None => {
            if operation != Operation::Select {
                state.clear_selection();
            }
        }
        Some(saved) => match operation {
            Operation::Select => match config.select_mode {
                SelectMode::Intersect => state.select_mask(&saved, SelectionMode::Intersect),
                SelectMode::Subtract => state.select_mask(&saved, SelectionMode::Subtract),
                // Add accumulated on top of the live selection already
                SelectMode::Replace | SelectMode::Add => {}
            },
            _ => state.select_mask(&saved, SelectionMode::Add),
        },
    }

    let message = format!("Operation done successfully for {} layers.", surfaces.len());
    log_info!("{} ({} pixels changed)", message, pixels_changed);

    Ok(RunSummary {
        operation,
        surfaces: surfaces.len(),
        colors: palette.len(),
        pixels_changed,
        message,
    })
}

fn fill_surface(state: &mut CanvasState, surface: &Surface, color: Rgba<u8>) -> usize {
    match surface {
        Surface::Layer(path) => state.fill_selection(path, color),
        Surface::Merged => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Layer, LayerGroup, LayerNode};
    use crate::palette::{EnabledGroups, PaletteGroup, parse_hex};
    use image::Luma;

    fn hex(s: &str) -> Rgba<u8> {
        parse_hex(s).unwrap()
    }

    fn no_reference(_: &Path) -> Result<CanvasState, String> {
        panic!("lookup image must not be opened");
    }

    fn flat(w: u32, h: u32, color: &str) -> CanvasState {
        CanvasState::with_layers(w, h, vec![Layer::new("sprite", w, h, hex(color)).into()])
    }

    fn config(operation: Operation, group: PaletteGroup) -> HelperConfig {
        HelperConfig { groups: EnabledGroups::only(group), ..HelperConfig::new(operation) }
    }

    fn left_half(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([if x < w / 2 { 255 } else { 0 }]))
    }

    fn run_on_active(state: &mut CanvasState, config: &HelperConfig) -> RunSummary {
        let drawables = vec![state.active_layer.clone()];
        run(state, &drawables, config, no_reference).unwrap()
    }

    #[test]
    fn test_nudge_stays_in_range() {
        assert_eq!(nudge_off_special(Rgba([0, 255, 1, 255])), Rgba([1, 254, 0, 255]));
        assert_eq!(nudge_off_special(Rgba([0x01, 0xDD, 0x01, 128])), Rgba([0, 0xDC, 0, 128]));
    }

    #[test]
    fn test_darken_shifts_one_step() {
        let mut state = flat(6, 4, "#6084A7");
        let summary = run_on_active(&mut state, &config(Operation::Darken, PaletteGroup::PrimaryPlayer));
        assert_eq!(state.pick_color(&LayerPath::root(0), 3, 2), Some(hex("#4C7191")));
        assert_eq!(summary.pixels_changed, 24);
        assert!(!state.has_selection());
    }

    #[test]
    fn test_darken_first_entry_is_noop() {
        let mut state = flat(4, 4, "#244B67");
        let summary = run_on_active(&mut state, &config(Operation::Darken, PaletteGroup::PrimaryPlayer));
        assert_eq!(summary.pixels_changed, 0);
        assert_eq!(state.pick_color(&LayerPath::root(0), 0, 0), Some(hex("#244B67")));
    }

    #[test]
    fn test_lighten_last_entry_is_noop() {
        let mut state = flat(4, 4, "#B0D2FF");
        let summary = run_on_active(&mut state, &config(Operation::Lighten, PaletteGroup::PrimaryPlayer));
        assert_eq!(summary.pixels_changed, 0);

        let mut state = flat(4, 4, "#9CBEE9");
        run_on_active(&mut state, &config(Operation::Lighten, PaletteGroup::PrimaryPlayer));
        assert_eq!(state.pick_color(&LayerPath::root(0), 1, 1), Some(hex("#B0D2FF")));
    }

    #[test]
    fn test_darken_does_not_cascade_within_a_surface() {
        // Darkening #6084A7 -> #4C7191 must not be darkened again on the same pass,
        // because #4C7191 is processed before #6084A7.
        let mut state = flat(2, 2, "#6084A7");
        run_on_active(&mut state, &config(Operation::Darken, PaletteGroup::PrimaryPlayer));
        assert_eq!(state.pick_color(&LayerPath::root(0), 0, 0), Some(hex("#4C7191")));
    }

    #[test]
    fn test_remove_nudges_each_channel() {
        let mut state = flat(3, 3, "#01DD01");
        run_on_active(&mut state, &config(Operation::Remove, PaletteGroup::Lights));
        let after = state.pick_color(&LayerPath::root(0), 2, 2).unwrap();
        assert_eq!(after, Rgba([0x00, 0xDC, 0x00, 255]));
    }

    #[test]
    fn test_repair_snaps_near_matches() {
        let mut state = flat(4, 1, "#000000");
        let path = LayerPath::root(0);
        let near = Rgba([0x6B + 10, 0x6B - 5, 0x6B, 255]);
        let far = Rgba([0x6B + 16, 0x6B, 0x6B, 255]);
        if let Some(layer) = state.layer_mut(&path) {
            layer.pixels.put_pixel(0, 0, near);
            layer.pixels.put_pixel(1, 0, far);
        }
        run_on_active(&mut state, &config(Operation::Repair, PaletteGroup::NonDarkeningGreys));
        assert_eq!(state.pick_color(&path, 0, 0), Some(hex("#6B6B6B")));
        assert_eq!(state.pick_color(&path, 1, 0), Some(far));
    }

    #[test]
    fn test_only_repair_tolerates_near_matches() {
        let path = LayerPath::root(0);
        let off_grey = Rgba([0x6C, 0x6B, 0x6B, 255]);
        let mut state = flat(2, 2, "#000000");
        state.layer_mut(&path).unwrap().pixels.put_pixel(0, 0, off_grey);
        let remove = HelperConfig { threshold: 40.0, ..config(Operation::Remove, PaletteGroup::NonDarkeningGreys) };
        let summary = run_on_active(&mut state, &remove);
        assert_eq!(summary.pixels_changed, 0);
        assert_eq!(state.pick_color(&path, 0, 0), Some(off_grey));

        let off_blue = Rgba([0x60, 0x84, 0xA8, 255]);
        let mut state = flat(2, 2, "#000000");
        state.layer_mut(&path).unwrap().pixels.put_pixel(1, 1, off_blue);
        let darken = HelperConfig { threshold: 40.0, ..config(Operation::Darken, PaletteGroup::PrimaryPlayer) };
        let summary = run_on_active(&mut state, &darken);
        assert_eq!(summary.pixels_changed, 0);
        assert_eq!(state.pick_color(&path, 1, 1), Some(off_blue));
    }

    #[test]
    fn test_replace_mode_repaints_everywhere_and_adds_selection_back() {
        // Last grey of the ramp in columns 0..4, existing selection on columns 2..6
        let mut state = flat(8, 1, "#000000");
        let path = LayerPath::root(0);
        for x in 0..4 {
            state.layer_mut(&path).unwrap().pixels.put_pixel(x, 0, hex("#DFDFDF"));
        }
        let existing = GrayImage::from_fn(8, 1, |x, _| Luma([if (2..6).contains(&x) { 255 } else { 0 }]));
        state.select_mask(&existing, SelectionMode::Replace);

        let summary = run_on_active(&mut state, &config(Operation::Remove, PaletteGroup::NonDarkeningGreys));
        assert_eq!(summary.pixels_changed, 4);
        assert_eq!(state.pick_color(&path, 0, 0), Some(hex("#DEDEDE")));
        assert_eq!(state.pick_color(&path, 3, 0), Some(hex("#DEDEDE")));

        // Match left by the last color, plus the selection that was there before
        let mask = state.selection_mask.as_ref().unwrap();
        let selected: Vec<u32> = (0..8).filter(|&x| mask.get_pixel(x, 0).0[0] > 0).collect();
        assert_eq!(selected, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_remove_only_in_current_selection() {
        let mut state = flat(4, 2, "#FF211D");
        state.select_mask(&left_half(4, 2), SelectionMode::Replace);
        let config = HelperConfig {
            select_mode: SelectMode::Intersect,
            ..config(Operation::Remove, PaletteGroup::Lights)
        };
        run_on_active(&mut state, &config);

        let path = LayerPath::root(0);
        assert_eq!(state.pick_color(&path, 0, 0), Some(Rgba([0xFE, 0x20, 0x1C, 255])));
        assert_eq!(state.pick_color(&path, 3, 0), Some(hex("#FF211D")));
        // Original selection is back
        assert_eq!(state.selection_bounds(), Some((0, 0, 2, 2)));
    }

    #[test]
    fn test_select_accumulates_across_colors() {
        let mut state = flat(4, 1, "#000000");
        let path = LayerPath::root(0);
        if let Some(layer) = state.layer_mut(&path) {
            layer.pixels.put_pixel(1, 0, hex("#4D4D4D"));
            layer.pixels.put_pixel(3, 0, hex("#E3E3FF"));
        }
        let summary = run_on_active(&mut state, &config(Operation::Select, PaletteGroup::WindowColors));
        assert_eq!(summary.pixels_changed, 0);
        let mask = state.selection_mask.as_ref().unwrap();
        let picked: Vec<u8> = (0..4).map(|x| mask.get_pixel(x, 0).0[0]).collect();
        assert_eq!(picked, [0, 255, 0, 255]);
    }

    #[test]
    fn test_select_reconciles_with_existing_selection() {
        // Special color everywhere in columns 0..4 of an 8-wide image
        let mut state = flat(8, 1, "#000000");
        let path = LayerPath::root(0);
        for x in 0..4 {
            state.layer_mut(&path).unwrap().pixels.put_pixel(x, 0, hex("#C9C9C9"));
        }
        // Existing selection: columns 2..6
        let existing = GrayImage::from_fn(8, 1, |x, _| Luma([if (2..6).contains(&x) { 255 } else { 0 }]));
        let selected = |state: &CanvasState| -> Vec<u32> {
            let Some(mask) = state.selection_mask.as_ref() else { return Vec::new() };
            (0..8).filter(|&x| mask.get_pixel(x, 0).0[0] > 0).collect()
        };

        let expectations = [
            (SelectMode::Replace, vec![0, 1, 2, 3]),
            (SelectMode::Add, vec![0, 1, 2, 3, 4, 5]),
            (SelectMode::Intersect, vec![2, 3]),
            (SelectMode::Subtract, vec![0, 1]),
        ];
        for (mode, expected) in expectations {
            state.select_mask(&existing, SelectionMode::Replace);
            let config = HelperConfig {
                select_mode: mode,
                ..config(Operation::Select, PaletteGroup::NonDarkeningGreys)
            };
            run_on_active(&mut state, &config);
            assert_eq!(selected(&state), expected, "mode {}", mode);
        }
    }

    #[test]
    fn test_all_layers_walks_groups() {
        let leaf = |name: &str| -> LayerNode { Layer::new(name, 2, 2, hex("#ECE20B")).into() };
        let group = LayerGroup::new("group", vec![leaf("a"), leaf("b")]);
        let mut state = CanvasState::with_layers(2, 2, vec![leaf("base"), group.into()]);
        let config = HelperConfig {
            layers_option: LayersOption::All,
            ..config(Operation::Darken, PaletteGroup::SecondaryPlayer)
        };
        let summary = run(&mut state, &[], &config, no_reference).unwrap();
        assert_eq!(summary.surfaces, 3);
        for path in state.flatten_layer_tree() {
            assert_eq!(state.pick_color(&path, 0, 0), Some(hex("#D9CB0A")));
        }
    }

    #[test]
    fn test_merged_forces_select_without_repainting() {
        let mut state = flat(3, 3, "#6084A7");
        let config = HelperConfig {
            layers_option: LayersOption::Merged,
            ..config(Operation::Lookup, PaletteGroup::PrimaryPlayer)
        };
        let summary = run(&mut state, &[], &config, no_reference).unwrap();
        assert_eq!(summary.operation, Operation::Select);
        assert_eq!(summary.surfaces, 1);
        assert_eq!(state.pick_color(&LayerPath::root(0), 0, 0), Some(hex("#6084A7")));
        assert_eq!(state.selection_bounds(), Some((0, 0, 3, 3)));
    }

    #[test]
    fn test_lookup_without_file_fails_before_mutation() {
        let mut state = flat(2, 2, "#6084A7");
        state.select_mask(&left_half(2, 2), SelectionMode::Replace);
        let config = config(Operation::Lookup, PaletteGroup::PrimaryPlayer);
        let drawables = vec![LayerPath::root(0)];
        let err = run(&mut state, &drawables, &config, no_reference).unwrap_err();
        assert!(matches!(err, HelperError::MissingLookupFile));
        assert_eq!(state.selection_bounds(), Some((0, 0, 1, 2)));
    }

    #[test]
    fn test_lookup_converts_ordinary_color() {
        let ordinary = Rgba([0x30, 0x60, 0x90, 255]);
        let special = hex("#6084A7");
        let mut state = flat(2, 2, "#000000");
        state.layer_mut(&LayerPath::root(0)).unwrap().pixels.put_pixel(1, 1, ordinary);

        // Wide reference: special color in column 0, ordinary color after it
        let load = move |_: &Path| -> Result<CanvasState, String> {
            let mut layer = Layer::new("lookup", 6, 2, ordinary);
            layer.pixels.put_pixel(0, 0, special);
            layer.pixels.put_pixel(0, 1, special);
            Ok(CanvasState::with_layers(6, 2, vec![layer.into()]))
        };
        let config = HelperConfig {
            lookup_file: Some(PathBuf::from("lookup.png")),
            ..config(Operation::Lookup, PaletteGroup::PrimaryPlayer)
        };
        let drawables = vec![LayerPath::root(0)];
        let summary = run(&mut state, &drawables, &config, load).unwrap();
        assert_eq!(summary.pixels_changed, 1);
        assert_eq!(state.pick_color(&LayerPath::root(0), 1, 1), Some(special));
        assert_eq!(state.pick_color(&LayerPath::root(0), 0, 0), Some(hex("#000000")));
    }

    #[test]
    fn test_lookup_load_failure_is_reported() {
        let mut state = flat(2, 2, "#000000");
        let config = HelperConfig {
            lookup_file: Some(PathBuf::from("missing.png")),
            ..config(Operation::Lookup, PaletteGroup::PrimaryPlayer)
        };
        let err = run(&mut state, &[], &config, |_| Err("not found".to_string())).unwrap_err();
        assert!(err.to_string().contains("missing.png"));
    }

    #[test]
    fn test_empty_palette_still_reconciles() {
        let mut state = flat(2, 2, "#6084A7");
        state.select_mask(&left_half(2, 2), SelectionMode::Replace);
        let config = HelperConfig { groups: EnabledGroups::none(), ..HelperConfig::new(Operation::Darken) };
        let summary = run_on_active(&mut state, &config);
        assert_eq!(summary.colors, 0);
        assert_eq!(summary.pixels_changed, 0);
        assert_eq!(state.selection_bounds(), Some((0, 0, 1, 2)));

        // Select with an empty palette and replace mode ends with nothing selected
        let config = HelperConfig { groups: EnabledGroups::none(), ..HelperConfig::new(Operation::Select) };
        run_on_active(&mut state, &config);
        assert!(!state.has_selection());
    }
}
