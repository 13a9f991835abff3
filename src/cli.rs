// ============================================================================
// SimuColors CLI: batch special-color processing
// ============================================================================
//
// Usage examples:
//   simucolors -i house.png --operation darken -o house_dark.png
//   simucolors -i "sprites/*.png" --operation remove --lights true --output-dir out/ -y
//   simucolors -i depot.scproj --operation repair --threshold 20 --layer Roof
//   simucolors -i tram.png --operation lookup --lookup lookup.png
//   simucolors -i tram.png --select-mode intersect --selection in.png --selection-out sel.png
//
// Every file is one document and one undo step. Files are processed in order
// on the current thread; pixel matching inside a run is parallel.

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{ArgAction, Parser};
use image::GrayImage;

use crate::canvas::SelectionMode;
use crate::config::{DEFAULT_THRESHOLD, HelperConfig, LayersOption, Operation, SelectMode};
use crate::io::{PROJECT_EXTENSION, is_project_path, load_selection_mask, save_selection_mask};
use crate::ops::special_colors::RunSummary;
use crate::palette::{EnabledGroups, PaletteGroup};
use crate::project::{Project, RunOutcome};
use crate::{log_err, log_info};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// Select, strip, repair, shift or convert Simutrans special colors.
#[derive(Parser, Debug)]
#[command(
    name = "simucolors",
    about = "Simutrans special colors helper",
    long_about = "Select, remove, repair, lighten, darken or convert the special colors\n\
                  Simutrans treats differently from ordinary pixels (player colors,\n\
                  windows, non-darkening greys, lights, transparency).\n\n\
                  Example:\n  \
                  simucolors -i house.png --operation darken -o house_dark.png\n  \
                  simucolors -i \"sprites/*.png\" --operation remove --output-dir out/ -y"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "sprites/*.scproj").
    /// Project files keep their layers; all other formats load as one layer.
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// select, remove, repair, lighten, darken or lookup (op_* ids accepted).
    #[arg(long, default_value = "select", value_name = "OPERATION")]
    pub operation: Operation,

    /// Non-darkening greys.
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub greys: Option<bool>,

    /// Window colors.
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub windows: Option<bool>,

    /// Primary player colors.
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub primary: Option<bool>,

    /// Secondary player colors.
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub secondary: Option<bool>,

    /// Lights (ignored by lighten and darken).
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub lights: Option<bool>,

    /// Transparent marker color (ignored by lighten and darken).
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub transparent: Option<bool>,

    /// selected, all or merged (layer_* ids accepted).
    #[arg(long, default_value = "selected", value_name = "LAYERS")]
    pub layers: LayersOption,

    /// Layer to process with `--layers selected`. Repeatable; defaults to the
    /// active layer.
    #[arg(long = "layer", value_name = "NAME")]
    pub layer: Vec<String>,

    /// replace, intersect, add or subtract (sel_* ids accepted).
    #[arg(long, default_value = "replace", value_name = "MODE")]
    pub select_mode: SelectMode,

    /// Repair tolerance, 0-255.
    #[arg(long, default_value_t = DEFAULT_THRESHOLD, value_name = "0-255")]
    pub threshold: f64,

    /// Lookup image for the lookup operation.
    #[arg(long, value_name = "FILE")]
    pub lookup: Option<PathBuf>,

    /// Greyscale PNG used as the selection that exists before the run.
    #[arg(long, value_name = "MASK.png")]
    pub selection: Option<PathBuf>,

    /// Write the selection left after the run as a greyscale PNG.
    /// Only valid for single-file input.
    #[arg(long, value_name = "MASK.png")]
    pub selection_out: Option<PathBuf>,

    /// Do not ask for confirmation.
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Print per-file timing and pixel counts.
    #[arg(short, long)]
    pub verbose: bool,

    /// Session log file (default: platform data directory).
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

impl CliArgs {
    /// Option bundle for one run, group toggles layered over the defaults.
    pub fn helper_config(&self) -> HelperConfig {
        let mut groups = EnabledGroups::default();
        let toggles = [
            (PaletteGroup::NonDarkeningGreys, self.greys),
            (PaletteGroup::WindowColors, self.windows),
            (PaletteGroup::PrimaryPlayer, self.primary),
            (PaletteGroup::SecondaryPlayer, self.secondary),
            (PaletteGroup::Lights, self.lights),
            (PaletteGroup::Transparent, self.transparent),
        ];
        for (group, enabled) in toggles {
            if let Some(enabled) = enabled {
                groups.set(group, enabled);
            }
        }

        HelperConfig {
            operation: self.operation,
            groups,
            layers_option: self.layers,
            select_mode: self.select_mode,
            threshold: self.threshold,
            lookup_file: self.lookup.clone(),
        }
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = every file succeeded or was declined, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir alone to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }
    if inputs.len() > 1 && args.selection_out.is_some() {
        eprintln!("error: --selection-out only accepts a single input file.");
        return ExitCode::FAILURE;
    }

    let config = args.helper_config();
    if let Err(e) = config.validate() {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let interactive = !args.yes && std::io::stdin().is_terminal();
    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }

        let file_start = Instant::now();

        let Some(output_path) = build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref())
        else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        let confirm = |config: &HelperConfig| {
            !interactive || prompt_yes_no(&format!("{} in {}?", config.operation.label(), input_path.display()))
        };

        match run_one(input_path, &output_path, &args, &config, confirm) {
            Ok(Some(summary)) => {
                println!("{}", summary.message);
                if args.verbose {
                    println!(
                        "  {} colors, {} pixels changed → {} ({:.0}ms)",
                        summary.colors,
                        summary.pixels_changed,
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Ok(None) => {
                println!("  skipped");
            }
            Err(e) => {
                log_err!("{}: {}", input_path.display(), e);
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

// ============================================================================
// Per-file processing pipeline
// ============================================================================

/// Load, run, save. `Ok(None)` when the user declined.
fn run_one<C>(
    input: &Path,
    output: &Path,
    args: &CliArgs,
    config: &HelperConfig,
    confirm: C,
) -> Result<Option<RunSummary>, String>
where
    C: FnOnce(&HelperConfig) -> bool,
{
    // -- Step 1: Load ----------------------------------------------------
    let mut project = Project::open(input.to_path_buf()).map_err(|e| format!("load failed: {}", e))?;
    log_info!("Opened {} ({}x{})", input.display(), project.canvas_state.width, project.canvas_state.height);

    if let Some(sel_path) = &args.selection {
        let state = &mut project.canvas_state;
        let mask = load_selection_mask(sel_path, state.width, state.height)?;
        state.select_mask(&mask, SelectionMode::Replace);
    }

    // -- Step 2: Run -----------------------------------------------------
    let drawables = project.resolve_drawables(&args.layer).map_err(|e| e.to_string())?;
    let summary = match project.run_special_colors(&drawables, config, confirm) {
        Ok(RunOutcome::Completed(summary)) => summary,
        Ok(RunOutcome::Cancelled) => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };

    // -- Step 3: Save ----------------------------------------------------
    project.save_as(output)?;

    if let Some(sel_out) = &args.selection_out {
        let state = &project.canvas_state;
        let mask = state
            .selection_mask
            .clone()
            .unwrap_or_else(|| GrayImage::new(state.width, state.height));
        save_selection_mask(&mask, sel_out)?;
    }

    Ok(Some(summary))
}

// ============================================================================
// Helpers
// ============================================================================

/// Ask a yes/no question on stdin. Anything but `y`/`yes` declines.
fn prompt_yes_no(question: &str) -> bool {
    print!("{} [y/N] ", question);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, single-file input only)
/// 2. `--output-dir` (batch directory, keeps the input file name)
/// 3. Fallback: next to the input with `_out` appended to the stem
///
/// Project inputs stay project files; every other input is written as PNG.
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }

    let ext = if is_project_path(input) { PROJECT_EXTENSION } else { "png" };
    let stem = input.file_stem()?.to_string_lossy().into_owned();

    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{}.{}", stem, ext)));
    }

    let parent = input.parent().unwrap_or(Path::new("."));
    Some(parent.join(format!("{}_out.{}", stem, ext)))
}
