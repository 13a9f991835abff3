//! Simutrans special color tables and working-palette assembly.
//!
//! The game treats a handful of exact RGB values specially: greys that never
//! darken at night, window glass, two player-recolorable ramps, blinking
//! lights and the transparency marker. Order inside each group is the ramp
//! order (darkest first), which is what lighten/darken walk along.

use image::Rgba;
use thiserror::Error;

use crate::config::Operation;

// ============================================================================
// CONSTANT GROUPS
// ============================================================================

pub const NON_DARKENING_GREYS: [&str; 5] = ["#6B6B6B", "#9B9B9B", "#B3B3B3", "#C9C9C9", "#DFDFDF"];

pub const WINDOW_COLORS: [&str; 4] = ["#4D4D4D", "#57656F", "#C1B1D1", "#E3E3FF"];

pub const PRIMARY_PLAYER_COLORS: [&str; 8] = [
    "#244B67", "#395E7C", "#4C7191", "#6084A7", "#7497BD", "#88ABD3", "#9CBEE9", "#B0D2FF",
];

pub const SECONDARY_PLAYER_COLORS: [&str; 8] = [
    "#7B5803", "#8E6F04", "#A18605", "#B49D07", "#C6B408", "#D9CB0A", "#ECE20B", "#FFF90D",
];

pub const LIGHTS: [&str; 6] = ["#7F9BF1", "#FFFF53", "#FF211D", "#01DD01", "#FF017F", "#0101FF"];

pub const TRANSPARENT_COLOR: [&str; 1] = ["#E7FFFF"];

/// One of the fixed special color groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaletteGroup {
    NonDarkeningGreys,
    WindowColors,
    PrimaryPlayer,
    SecondaryPlayer,
    Lights,
    Transparent,
}

impl PaletteGroup {
    /// Declaration order, which is also concatenation order.
    pub fn all() -> &'static [PaletteGroup] {
        &[
            PaletteGroup::NonDarkeningGreys,
            PaletteGroup::WindowColors,
            PaletteGroup::PrimaryPlayer,
            PaletteGroup::SecondaryPlayer,
            PaletteGroup::Lights,
            PaletteGroup::Transparent,
        ]
    }

    pub fn swatches(&self) -> &'static [&'static str] {
        match self {
            PaletteGroup::NonDarkeningGreys => &NON_DARKENING_GREYS,
            PaletteGroup::WindowColors => &WINDOW_COLORS,
            PaletteGroup::PrimaryPlayer => &PRIMARY_PLAYER_COLORS,
            PaletteGroup::SecondaryPlayer => &SECONDARY_PLAYER_COLORS,
            PaletteGroup::Lights => &LIGHTS,
            PaletteGroup::Transparent => &TRANSPARENT_COLOR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaletteGroup::NonDarkeningGreys => "non-darkening greys",
            PaletteGroup::WindowColors => "windows",
            PaletteGroup::PrimaryPlayer => "player colors (primary)",
            PaletteGroup::SecondaryPlayer => "player colors (secondary)",
            PaletteGroup::Lights => "lights",
            PaletteGroup::Transparent => "transparent",
        }
    }

    /// Lights and the transparent marker have no ramp, so they never take part
    /// in lighten/darken.
    pub fn is_ramp(&self) -> bool {
        !matches!(self, PaletteGroup::Lights | PaletteGroup::Transparent)
    }
}

/// Which groups the caller switched on for this run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnabledGroups {
    pub non_darkening_greys: bool,
    pub window_colors: bool,
    pub primary_player_colors: bool,
    pub secondary_player_colors: bool,
    pub lights: bool,
    pub transparent_color: bool,
}

impl Default for EnabledGroups {
    fn default() -> Self {
        Self {
            non_darkening_greys: true,
            window_colors: true,
            primary_player_colors: true,
            secondary_player_colors: true,
            lights: false,
            transparent_color: false,
        }
    }
}

impl EnabledGroups {
    pub fn none() -> Self {
        Self {
            non_darkening_greys: false,
            window_colors: false,
            primary_player_colors: false,
            secondary_player_colors: false,
            lights: false,
            transparent_color: false,
        }
    }

    pub fn only(group: PaletteGroup) -> Self {
        let mut groups = Self::none();
        groups.set(group, true);
        groups
    }

    pub fn contains(&self, group: PaletteGroup) -> bool {
        match group {
            PaletteGroup::NonDarkeningGreys => self.non_darkening_greys,
            PaletteGroup::WindowColors => self.window_colors,
            PaletteGroup::PrimaryPlayer => self.primary_player_colors,
            PaletteGroup::SecondaryPlayer => self.secondary_player_colors,
            PaletteGroup::Lights => self.lights,
            PaletteGroup::Transparent => self.transparent_color,
        }
    }

    pub fn set(&mut self, group: PaletteGroup, enabled: bool) {
        match group {
            PaletteGroup::NonDarkeningGreys => self.non_darkening_greys = enabled,
            PaletteGroup::WindowColors => self.window_colors = enabled,
            PaletteGroup::PrimaryPlayer => self.primary_player_colors = enabled,
            PaletteGroup::SecondaryPlayer => self.secondary_player_colors = enabled,
            PaletteGroup::Lights => self.lights = enabled,
            PaletteGroup::Transparent => self.transparent_color = enabled,
        }
    }
}

// ============================================================================
// HEX COLORS
// ============================================================================

/// Error type for swatch parsing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ColorError {
    #[error("color must start with '#'")]
    MissingHash,
    #[error("invalid color length {0}, expected 6 or 8")]
    InvalidLength(usize),
    #[error("invalid hex character '{0}'")]
    InvalidHex(char),
}

/// Parse `#RRGGBB` (opaque) or `#RRGGBBAA`.
pub fn parse_hex(s: &str) -> Result<Rgba<u8>, ColorError> {
    let hex = s.strip_prefix('#').ok_or(ColorError::MissingHash)?;
    if let Some(c) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(ColorError::InvalidHex(c));
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ColorError::InvalidLength(hex.len()));
    match hex.len() {
        6 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        n => Err(ColorError::InvalidLength(n)),
    }
}

/// Format as `#RRGGBB`, appending alpha only when it is not opaque.
pub fn to_hex(color: Rgba<u8>) -> String {
    if color[3] == 255 {
        format!("#{:02X}{:02X}{:02X}", color[0], color[1], color[2])
    } else {
        format!("#{:02X}{:02X}{:02X}{:02X}", color[0], color[1], color[2], color[3])
    }
}

// ============================================================================
// WORKING PALETTE
// ============================================================================

/// Ordered colors processed by one run.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct WorkingPalette {
    colors: Vec<Rgba<u8>>,
}

impl WorkingPalette {
    /// Concatenate the enabled groups for `operation`.
    ///
    /// Ramp groups come first in declaration order. `Darken` keeps that order,
    /// `Lighten` reverses it so the preceding entry is one step lighter, and
    /// every other operation appends lights then the transparent marker.
    pub fn assemble(enabled: &EnabledGroups, operation: Operation) -> Self {
        let mut colors: Vec<Rgba<u8>> = PaletteGroup::all()
            .iter()
            .filter(|g| g.is_ramp() && enabled.contains(**g))
            .flat_map(|g| g.swatches().iter().map(|hex| swatch(hex)))
            .collect();

        match operation {
            Operation::Darken => {}
            Operation::Lighten => colors.reverse(),
            _ => {
                for group in [PaletteGroup::Lights, PaletteGroup::Transparent] {
                    if enabled.contains(group) {
                        colors.extend(group.swatches().iter().map(|hex| swatch(hex)));
                    }
                }
            }
        }

        Self { colors }
    }

    pub fn colors(&self) -> &[Rgba<u8>] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Entry just before `index`, `None` at the head of the palette.
    pub fn previous(&self, index: usize) -> Option<Rgba<u8>> {
        index.checked_sub(1).and_then(|i| self.colors.get(i)).copied()
    }
}

/// The constant tables are validated by tests, so a bad entry is a build bug.
fn swatch(hex: &str) -> Rgba<u8> {
    parse_hex(hex).unwrap_or(Rgba([0, 0, 0, 255]))
}
