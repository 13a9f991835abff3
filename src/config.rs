//! Options bundle for one special-colors run.
//!
//! Every enum accepts both a short name (`darken`) and the prefixed choice
//! id (`op_darken`, `layer_all`, `sel_current`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::ops::special_colors::HelperError;
use crate::palette::EnabledGroups;

/// Default fuzzy threshold for `repair`, on the 0-255 scale.
pub const DEFAULT_THRESHOLD: f64 = 15.0;

/// What the run does to each matched color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Operation {
    /// Accumulate every matching pixel into the selection.
    #[default]
    Select,
    /// Nudge matches one step off the special value so the game ignores them.
    Remove,
    /// Snap near-matches back onto the exact special value.
    Repair,
    /// Shift each ramp color one step lighter.
    Lighten,
    /// Shift each ramp color one step darker.
    Darken,
    /// Convert ordinary colors to special colors through a lookup image.
    Lookup,
}

impl Operation {
    pub fn all() -> &'static [Operation] {
        &[
            Operation::Select,
            Operation::Remove,
            Operation::Repair,
            Operation::Lighten,
            Operation::Darken,
            Operation::Lookup,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Remove => "remove",
            Operation::Repair => "repair",
            Operation::Lighten => "lighten",
            Operation::Darken => "darken",
            Operation::Lookup => "lookup",
        }
    }

    /// Human label used for the undo step.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Select => "Select special colors",
            Operation::Remove => "Remove special colors",
            Operation::Repair => "Repair special colors",
            Operation::Lighten => "Lighten special colors",
            Operation::Darken => "Darken special colors",
            Operation::Lookup => "Convert to special colors",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.to_lowercase();
        match key.strip_prefix("op_").unwrap_or(&key) {
            "select" => Ok(Operation::Select),
            "remove" => Ok(Operation::Remove),
            "repair" => Ok(Operation::Repair),
            "lighten" => Ok(Operation::Lighten),
            "darken" => Ok(Operation::Darken),
            "lookup" | "convert" => Ok(Operation::Lookup),
            _ => Err(format!(
                "unknown operation '{}' (expected select, remove, repair, lighten, darken or lookup)",
                s
            )),
        }
    }
}

/// Which drawables a run targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LayersOption {
    /// The caller-supplied layers.
    #[default]
    Selected,
    /// Every leaf layer of the document, groups expanded.
    All,
    /// The visible composite; forces `select`.
    Merged,
}

impl fmt::Display for LayersOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayersOption::Selected => "selected",
            LayersOption::All => "all",
            LayersOption::Merged => "merged",
        })
    }
}

impl FromStr for LayersOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.to_lowercase();
        match key.strip_prefix("layer_").unwrap_or(&key) {
            "selected" => Ok(LayersOption::Selected),
            "all" => Ok(LayersOption::All),
            "merged" => Ok(LayersOption::Merged),
            _ => Err(format!("unknown layers option '{}' (expected selected, all or merged)", s)),
        }
    }
}

/// How each color match combines with the selection that existed before the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectMode {
    #[default]
    Replace,
    /// Only inside the current selection.
    Intersect,
    /// Add to the current selection (select only).
    Add,
    /// Subtract from the current selection (select only).
    Subtract,
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectMode::Replace => "replace",
            SelectMode::Intersect => "intersect",
            SelectMode::Add => "add",
            SelectMode::Subtract => "subtract",
        })
    }
}

impl FromStr for SelectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.to_lowercase();
        match key.strip_prefix("sel_").unwrap_or(&key) {
            "replace" => Ok(SelectMode::Replace),
            "intersect" | "current" => Ok(SelectMode::Intersect),
            "add" => Ok(SelectMode::Add),
            "subtract" => Ok(SelectMode::Subtract),
            _ => Err(format!(
                "unknown selection mode '{}' (expected replace, intersect, add or subtract)",
                s
            )),
        }
    }
}

/// Full option set for a run.
#[derive(Clone, Debug, PartialEq)]
pub struct HelperConfig {
    pub operation: Operation,
    pub groups: EnabledGroups,
    pub layers_option: LayersOption,
    pub select_mode: SelectMode,
    /// Repair tolerance on the 0-255 scale.
    pub threshold: f64,
    pub lookup_file: Option<PathBuf>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            operation: Operation::default(),
            groups: EnabledGroups::default(),
            layers_option: LayersOption::default(),
            select_mode: SelectMode::default(),
            threshold: DEFAULT_THRESHOLD,
            lookup_file: None,
        }
    }
}

impl HelperConfig {
    pub fn new(operation: Operation) -> Self {
        Self { operation, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), HelperError> {
        if !(0.0..=255.0).contains(&self.threshold) {
            return Err(HelperError::InvalidThreshold(self.threshold));
        }
        Ok(())
    }

    /// Threshold as a 0.0-1.0 fraction.
    pub fn threshold_fraction(&self) -> f32 {
        (self.threshold / 255.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let config = HelperConfig::default();
        assert_eq!(config.operation, Operation::Select);
        assert_eq!(config.layers_option, LayersOption::Selected);
        assert_eq!(config.select_mode, SelectMode::Replace);
        assert_eq!(config.threshold, 15.0);
        assert!(config.groups.primary_player_colors);
        assert!(!config.groups.lights);
        assert!(config.lookup_file.is_none());
    }

    #[test]
    fn test_parse_choice_ids() {
        assert_eq!("op_darken".parse::<Operation>(), Ok(Operation::Darken));
        assert_eq!("Convert".parse::<Operation>(), Ok(Operation::Lookup));
        assert_eq!("layer_all".parse::<LayersOption>(), Ok(LayersOption::All));
        assert_eq!("sel_current".parse::<SelectMode>(), Ok(SelectMode::Intersect));
        assert!("op_blur".parse::<Operation>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for op in Operation::all() {
            assert_eq!(op.to_string().parse::<Operation>(), Ok(*op));
        }
    }

    #[test]
    fn test_threshold_bounds() {
        let mut config = HelperConfig::new(Operation::Repair);
        assert!(config.validate().is_ok());
        config.threshold = 255.5;
        assert!(config.validate().is_err());
        config.threshold = f64::NAN;
        assert!(config.validate().is_err());
        config.threshold = 255.0;
        assert!((config.threshold_fraction() - 1.0).abs() < f32::EPSILON);
    }
}
