//! Simutrans special colors helper.
//!
//! Simutrans renders a fixed set of exact RGB values specially: player
//! recolor ramps, window glass, greys that never darken at night, blinking
//! lights and the transparency marker. This crate selects, removes,
//! repairs, lightens, darkens and converts those colors across the layers of
//! a small layered document model.

pub mod logger;

pub mod canvas;
pub mod cli;
pub mod components;
pub mod config;
pub mod io;
pub mod ops;
pub mod palette;
pub mod project;
