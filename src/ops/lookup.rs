use image::Rgba;

use crate::canvas::{CanvasState, LayerPath, SelectionMode, Surface};

/// A reference image that maps special colors to the ordinary colors they
/// replace.
///
/// The image is a stack of color bands. A special color marks a seed region;
/// walking both far corners of that region's bounding box along the image's
/// long axis eventually lands both probes inside one solid band, and that
/// band's color is what the special color stands for.
pub struct LookupReference {
    canvas: CanvasState,
    layer: LayerPath,
    vertical: bool,
}

impl LookupReference {
    /// Wrap a loaded image, probing its first leaf layer.
    /// Returns `None` when the image has no pixel layer at all.
    pub fn new(canvas: CanvasState) -> Option<Self> {
        let layer = canvas.flatten_layer_tree().into_iter().next()?;
        let vertical = canvas.height > canvas.width;
        Some(Self { canvas, layer, vertical })
    }

    /// Probes advance along y when the image is taller than wide.
    pub fn is_vertical(&self) -> bool {
        self.vertical
    }

    /// Resolve the color `target` maps to, or `None` when `target` does not
    /// occur in the reference or the probes never converge.
    pub fn resolve(&mut self, target: Rgba<u8>) -> Option<Rgba<u8>> {
        self.canvas.select_color(&Surface::Layer(self.layer.clone()), target, SelectionMode::Replace, 0.0);
        let bounds = self.canvas.selection_bounds();
        self.canvas.clear_selection();

        let (x1, y1, x2, y2) = bounds?;
        self.probe((x1, y1), (x2 - 1, y2 - 1)).map(|(color, _)| color)
    }

    /// Step both probes one pixel at a time until they read the same color.
    /// Returns that color and the number of steps taken.
    fn probe(&self, mut first: (u32, u32), mut second: (u32, u32)) -> Option<(Rgba<u8>, u32)> {
        let (width, height) = (self.canvas.width, self.canvas.height);
        let mut steps = 0;
        loop {
            steps += 1;
            if self.vertical {
                first.1 += 1;
                second.1 += 1;
            } else {
                first.0 += 1;
                second.0 += 1;
            }

            let a = self.canvas.pick_color(&self.layer, first.0, first.1);
            let b = self.canvas.pick_color(&self.layer, second.0, second.1);
            if let (Some(a), Some(b)) = (a, b)
                && a == b
            {
                return Some((a, steps));
            }

            let edge_reached = if self.vertical {
                first.1 >= height || second.1 >= height
            } else {
                first.0 >= width || second.0 >= width
            };
            if edge_reached {
                return None;
            }
        }
    }
}
