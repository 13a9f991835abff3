use std::sync::Arc;

use image::{GrayImage, Luma, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::log_warn;

/// Groups nested deeper than this are not descended into.
pub const MAX_GROUP_DEPTH: usize = 64;

// ============================================================================
// SELECTION SYSTEM
// ============================================================================

/// How a new pixel mask interacts with the existing selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Clear any existing selection, then set the new mask.
    #[default]
    Replace,
    /// Union – add to the existing mask.
    Add,
    /// Difference – subtract from the existing mask.
    Subtract,
    /// Keep only pixels present in both the existing mask AND the new one.
    Intersect,
}

impl SelectionMode {
    /// Combine one existing mask value with one incoming value.
    #[inline]
    pub fn combine(self, old: u8, new: u8) -> u8 {
        match self {
            SelectionMode::Replace => new,
            SelectionMode::Add => old.max(new),
            SelectionMode::Subtract => old.saturating_sub(new),
            SelectionMode::Intersect => old.min(new),
        }
    }
}

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Sparse tiled image backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`.
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and mutations via `put_pixel` / `fill`
/// use `Arc::make_mut` to COW-clone only the touched chunks. Undo snapshots
/// rely on this.
#[derive(Clone)]
pub struct TiledImage {
    pub width: u32,
    pub height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl TiledImage {
    // ---- construction -------------------------------------------------------

    /// Create an empty (fully transparent) tiled image.
    pub fn new(width: u32, height: u32) -> Self {
        // Sanity: clamp dimensions to prevent overflow (max ~256 megapixels)
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total > 256_000_000 || width == 0 || height == 0 {
                log_warn!("TiledImage::new: dimensions {}x{} out of range, clamped to 1x1", width, height);
                (1, 1)
            } else {
                (width, height)
            }
        };
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        let total = (chunks_per_row * chunks_per_col) as usize;
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; total],
        }
    }

    /// Fill the entire image with `color`. A transparent fill costs nothing.
    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        let mut img = Self::new(width, height);
        if color[3] > 0 {
            img.fill(color);
        }
        img
    }

    /// Import from a flat `RgbaImage`.  Only non-transparent chunks are stored.
    pub fn from_rgba_image(src: &RgbaImage) -> Self {
        let width = src.width();
        let height = src.height();
        let mut img = Self::new(width, height);
        if img.width != width || img.height != height {
            return img;
        }

        let chunks_x = img.chunks_per_row as usize;
        let total_chunks = img.chunks.len();
        let src_raw = src.as_raw();

        let chunk_results: Vec<(usize, Option<Arc<RgbaImage>>)> = (0..total_chunks)
            .into_par_iter()
            .map(|flat| {
                let cx = (flat % chunks_x) as u32;
                let cy = (flat / chunks_x) as u32;
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;

                let cw = CHUNK_SIZE.min(width - base_x);
                let ch = CHUNK_SIZE.min(height - base_y);
                let chunk_stride = CHUNK_SIZE as usize * 4;
                let mut chunk_data = vec![0u8; chunk_stride * CHUNK_SIZE as usize];
                let mut has_content = false;

                for ly in 0..ch {
                    let src_start = ((base_y + ly) * width + base_x) as usize * 4;
                    let dst_start = ly as usize * chunk_stride;
                    let byte_len = cw as usize * 4;
                    chunk_data[dst_start..dst_start + byte_len]
                        .copy_from_slice(&src_raw[src_start..src_start + byte_len]);

                    if !has_content {
                        has_content = chunk_data[dst_start..dst_start + byte_len]
                            .chunks_exact(4)
                            .any(|px| px[3] != 0);
                    }
                }

                let chunk = if has_content {
                    RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, chunk_data).map(Arc::new)
                } else {
                    None
                };
                (flat, chunk)
            })
            .collect();

        for (idx, chunk) in chunk_results {
            img.chunks[idx] = chunk;
        }
        img
    }

    /// Flatten back to a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        let out_stride = self.width as usize * 4;
        let out_raw: &mut [u8] = &mut out;
        for (cx, cy) in self.chunk_keys() {
            if let Some(chunk) = self.get_chunk(cx, cy) {
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                let cw = (CHUNK_SIZE.min(self.width.saturating_sub(base_x))) as usize;
                let ch = CHUNK_SIZE.min(self.height.saturating_sub(base_y));
                let chunk_raw = chunk.as_raw();
                let chunk_stride = CHUNK_SIZE as usize * 4;
                for ly in 0..ch as usize {
                    let src_start = ly * chunk_stride;
                    let src_end = src_start + cw * 4;
                    let dst_start = (base_y as usize + ly) * out_stride + base_x as usize * 4;
                    let dst_end = dst_start + cw * 4;
                    out_raw[dst_start..dst_end].copy_from_slice(&chunk_raw[src_start..src_end]);
                }
            }
        }
        out
    }

    // ---- indexing helpers ----------------------------------------------------

    #[inline(always)]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    #[inline(always)]
    fn chunk_coord(x: u32, y: u32) -> (u32, u32) { (x / CHUNK_SIZE, y / CHUNK_SIZE) }

    #[inline(always)]
    fn local(x: u32, y: u32) -> (u32, u32) { (x % CHUNK_SIZE, y % CHUNK_SIZE) }

    // ---- pixel access -------------------------------------------------------

    /// Read a pixel (returns `&TRANSPARENT_PIXEL` for missing chunks).
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height { return &TRANSPARENT_PIXEL; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        self.chunks[idx].as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height { return; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).put_pixel(lx, ly, pixel);
    }

    /// Read-only access to a chunk (if it exists).
    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        let idx = self.flat_index(cx, cy);
        self.chunks.get(idx).and_then(|c| c.as_deref())
    }

    /// Place a fully-built chunk at the given chunk coordinate.
    pub fn set_chunk(&mut self, cx: u32, cy: u32, chunk: RgbaImage) {
        if cx >= self.chunks_per_row {
            return;
        }
        let idx = self.flat_index(cx, cy);
        if idx < self.chunks.len() {
            self.chunks[idx] = Some(Arc::new(chunk));
        }
    }

    /// Iterator over populated chunk coordinates.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks.iter().enumerate().filter_map(move |(i, slot)| {
            slot.as_ref().map(|_| ((i as u32) % cpr, (i as u32) / cpr))
        })
    }

    // ---- bulk operations ----------------------------------------------------

    /// Fill every pixel with `color`.
    pub fn fill(&mut self, color: Rgba<u8>) {
        for slot in &mut self.chunks {
            let arc = slot.get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
            let chunk = Arc::make_mut(arc);
            for pixel in chunk.pixels_mut() {
                *pixel = color;
            }
        }
    }

    /// Approximate memory usage in bytes.
    /// Shared (COW) chunks are counted at minimal cost (Arc pointer only)
    /// since their pixel data is shared with undo snapshots.
    pub fn memory_bytes(&self) -> usize {
        let chunk_byte_size = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
        self.chunks.iter()
            .filter_map(|c| c.as_ref())
            .map(|arc| {
                if Arc::strong_count(arc) == 1 {
                    chunk_byte_size
                } else {
                    std::mem::size_of::<usize>() * 2
                }
            })
            .sum()
    }
}

// ============================================================================
// LAYER TREE
// ============================================================================

#[derive(Clone)]
pub struct Layer {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub pixels: TiledImage,
}

impl Layer {
    pub fn new(name: impl Into<String>, width: u32, height: u32, fill_color: Rgba<u8>) -> Self {
        Self {
            name: name.into(),
            visible: true,
            opacity: 1.0,
            pixels: TiledImage::new_filled(width, height, fill_color),
        }
    }
}

#[derive(Clone)]
pub struct LayerGroup {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    /// Bottom to top, like the document root.
    pub children: Vec<LayerNode>,
}

impl LayerGroup {
    pub fn new(name: impl Into<String>, children: Vec<LayerNode>) -> Self {
        Self { name: name.into(), visible: true, opacity: 1.0, children }
    }
}

/// A node of the document's layer tree.
#[derive(Clone)]
pub enum LayerNode {
    Layer(Layer),
    Group(LayerGroup),
}

impl LayerNode {
    pub fn name(&self) -> &str {
        match self {
            LayerNode::Layer(l) => &l.name,
            LayerNode::Group(g) => &g.name,
        }
    }
}

impl From<Layer> for LayerNode {
    fn from(layer: Layer) -> Self {
        LayerNode::Layer(layer)
    }
}

impl From<LayerGroup> for LayerNode {
    fn from(group: LayerGroup) -> Self {
        LayerNode::Group(group)
    }
}

/// Child indices from the document root down to a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct LayerPath(pub Vec<usize>);

impl LayerPath {
    pub fn root(index: usize) -> Self {
        LayerPath(vec![index])
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        LayerPath(indices)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

/// A drawing surface the engine can color-match against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Surface {
    Layer(LayerPath),
    /// The visible composite of the whole document (sample merged).
    Merged,
}

// ============================================================================
// CANVAS STATE
// ============================================================================

pub struct CanvasState {
    pub width: u32,
    pub height: u32,
    /// Top-level nodes, bottom to top.
    pub layers: Vec<LayerNode>,
    pub active_layer: LayerPath,
    /// Selection mask – 0 = unselected, 255 = fully selected.
    /// Dimensions match (width, height). `None` means nothing is selected.
    pub selection_mask: Option<GrayImage>,
}

impl CanvasState {
    pub fn new(width: u32, height: u32) -> Self {
        let white = Rgba([255, 255, 255, 255]);
        let background = Layer::new("Background", width, height, white);
        Self::with_layers(width, height, vec![background.into()])
    }

    pub fn with_layers(width: u32, height: u32, layers: Vec<LayerNode>) -> Self {
        let mut state = Self {
            width,
            height,
            layers,
            active_layer: LayerPath::default(),
            selection_mask: None,
        };
        state.active_layer = state.flatten_layer_tree().pop().unwrap_or_default();
        state
    }

    // ---- tree navigation ----------------------------------------------------

    pub fn node(&self, path: &LayerPath) -> Option<&LayerNode> {
        let (first, rest) = path.0.split_first()?;
        let mut node = self.layers.get(*first)?;
        for &i in rest {
            node = match node {
                LayerNode::Group(g) => g.children.get(i)?,
                LayerNode::Layer(_) => return None,
            };
        }
        Some(node)
    }

    pub fn layer(&self, path: &LayerPath) -> Option<&Layer> {
        match self.node(path)? {
            LayerNode::Layer(l) => Some(l),
            LayerNode::Group(_) => None,
        }
    }

    pub fn layer_mut(&mut self, path: &LayerPath) -> Option<&mut Layer> {
        layer_in_mut(&mut self.layers, path)
    }

    /// Paths of every leaf layer, groups replaced by their children, in
    /// pre-order (bottom to top within each level).
    pub fn flatten_layer_tree(&self) -> Vec<LayerPath> {
        let mut leaves = Vec::new();
        let mut stack: Vec<(LayerPath, &LayerNode)> = self.layers.iter()
            .enumerate()
            .rev()
            .map(|(i, node)| (LayerPath::root(i), node))
            .collect();

        while let Some((path, node)) = stack.pop() {
            match node {
                LayerNode::Layer(_) => leaves.push(path),
                LayerNode::Group(group) => {
                    if path.depth() >= MAX_GROUP_DEPTH {
                        log_warn!("Group '{}' nested deeper than {} levels, skipped", group.name, MAX_GROUP_DEPTH);
                        continue;
                    }
                    for (i, child) in group.children.iter().enumerate().rev() {
                        stack.push((path.child(i), child));
                    }
                }
            }
        }
        leaves
    }

    /// First leaf layer (in tree order) called `name`.
    pub fn find_layer(&self, name: &str) -> Option<LayerPath> {
        self.flatten_layer_tree()
            .into_iter()
            .find(|p| self.layer(p).is_some_and(|l| l.name == name))
    }

    // ---- compositing --------------------------------------------------------

    /// Normal-blend composite of every visible layer, bottom to top.
    pub fn composite(&self) -> RgbaImage {
        let mut visible: Vec<(&TiledImage, f32)> = Vec::new();
        collect_visible(&self.layers, 1.0, 0, &mut visible);

        let mut result = RgbaImage::new(self.width, self.height);
        let stride = self.width as usize * 4;
        if stride == 0 {
            return result;
        }
        let raw: &mut [u8] = &mut result;
        raw.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let mut acc = Rgba([0u8, 0, 0, 0]);
                for (pixels, opacity) in &visible {
                    acc = blend_normal(acc, *pixels.get_pixel(x as u32, y as u32), *opacity);
                }
                px.copy_from_slice(&acc.0);
            }
        });
        result
    }

    // ---- host operations ------------------------------------------------------

    /// Binary mask of pixels on `surface` within `threshold` (0.0-1.0) of `color`.
    ///
    /// A pixel matches when its largest per-channel RGBA difference is at most
    /// `threshold * 255`; threshold 0 means bit-identical.
    pub fn color_match_mask(&self, surface: &Surface, color: Rgba<u8>, threshold: f32) -> GrayImage {
        let limit = match_limit(threshold);
        let mut mask = GrayImage::new(self.width, self.height);
        match surface {
            Surface::Layer(path) => {
                if let Some(layer) = self.layer(path) {
                    fill_match_rows(&mut mask, |x, y| *layer.pixels.get_pixel(x, y), color, limit);
                }
            }
            Surface::Merged => {
                let flat = self.composite();
                fill_match_rows(&mut mask, |x, y| *flat.get_pixel(x, y), color, limit);
            }
        }
        mask
    }

    /// Select by color and merge the match into the selection with `mode`.
    pub fn select_color(&mut self, surface: &Surface, color: Rgba<u8>, mode: SelectionMode, threshold: f32) {
        let mask = self.color_match_mask(surface, color, threshold);
        self.select_mask(&mask, mode);
    }

    /// Like [`select_color`](Self::select_color) on [`Surface::Merged`], but
    /// against a composite the caller already flattened.
    pub fn select_color_in(&mut self, flat: &RgbaImage, color: Rgba<u8>, mode: SelectionMode, threshold: f32) {
        let mut mask = GrayImage::new(self.width, self.height);
        if flat.dimensions() == (self.width, self.height) {
            fill_match_rows(&mut mask, |x, y| *flat.get_pixel(x, y), color, match_limit(threshold));
        }
        self.select_mask(&mask, mode);
    }

    /// Merge a saved channel into the selection with `mode`.
    pub fn select_mask(&mut self, mask: &GrayImage, mode: SelectionMode) {
        if mask.width() != self.width || mask.height() != self.height {
            log_warn!(
                "select_mask: {}x{} mask does not match {}x{} canvas, ignored",
                mask.width(), mask.height(), self.width, self.height
            );
            return;
        }

        let mut merged = match (mode, self.selection_mask.take()) {
            (SelectionMode::Replace, _) => mask.clone(),
            (_, Some(current)) => current,
            (_, None) => GrayImage::new(self.width, self.height),
        };
        if mode != SelectionMode::Replace {
            for (dst, src) in merged.pixels_mut().zip(mask.pixels()) {
                *dst = Luma([mode.combine(dst.0[0], src.0[0])]);
            }
        }

        self.selection_mask = if merged.pixels().any(|p| p.0[0] > 0) { Some(merged) } else { None };
    }

    /// Remove the current selection.
    pub fn clear_selection(&mut self) {
        self.selection_mask = None;
    }

    /// Returns `true` when at least one pixel is selected.
    pub fn has_selection(&self) -> bool {
        self.selection_mask
            .as_ref()
            .is_some_and(|m| m.pixels().any(|p| p.0[0] > 0))
    }

    /// Bounding box of the selection as `(x1, y1, x2, y2)`, x2/y2 exclusive.
    pub fn selection_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let mask = self.selection_mask.as_ref()?;
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in mask.enumerate_pixels() {
            if p.0[0] == 0 {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x + 1, y + 1),
                Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x + 1), y2.max(y + 1)),
            });
        }
        bounds
    }

    /// Color of one layer pixel, `None` when the layer or coordinate is invalid.
    pub fn pick_color(&self, path: &LayerPath, x: u32, y: u32) -> Option<Rgba<u8>> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.layer(path).map(|l| *l.pixels.get_pixel(x, y))
    }

    /// Paint `color` into the selected pixels of one layer.
    /// Returns the number of pixels touched.
    pub fn fill_selection(&mut self, path: &LayerPath, color: Rgba<u8>) -> usize {
        let Some(mask) = self.selection_mask.as_ref() else {
            return 0;
        };
        let Some(layer) = layer_in_mut(&mut self.layers, path) else {
            return 0;
        };

        let mut touched = 0;
        for (x, y, sel) in mask.enumerate_pixels() {
            let sel = sel.0[0];
            if sel == 0 {
                continue;
            }
            let p = *layer.pixels.get_pixel(x, y);
            let painted = if sel == 255 {
                color
            } else {
                // Blend proportionally.
                let t = sel as f32 / 255.0;
                let blend = |old: u8, new: u8| -> u8 {
                    ((old as f32) * (1.0 - t) + (new as f32) * t).round() as u8
                };
                Rgba([
                    blend(p[0], color[0]),
                    blend(p[1], color[1]),
                    blend(p[2], color[2]),
                    blend(p[3], color[3]),
                ])
            };
            layer.pixels.put_pixel(x, y, painted);
            touched += 1;
        }
        touched
    }
}

/// Walk `nodes` down `path` to a leaf layer.
fn layer_in_mut<'a>(nodes: &'a mut [LayerNode], path: &LayerPath) -> Option<&'a mut Layer> {
    let (first, rest) = path.0.split_first()?;
    let mut node = nodes.get_mut(*first)?;
    for &i in rest {
        node = match node {
            LayerNode::Group(g) => g.children.get_mut(i)?,
            LayerNode::Layer(_) => return None,
        };
    }
    match node {
        LayerNode::Layer(l) => Some(l),
        LayerNode::Group(_) => None,
    }
}

fn collect_visible<'a>(nodes: &'a [LayerNode], opacity: f32, depth: usize, out: &mut Vec<(&'a TiledImage, f32)>) {
    if depth >= MAX_GROUP_DEPTH {
        return;
    }
    for node in nodes {
        match node {
            LayerNode::Layer(l) if l.visible => out.push((&l.pixels, opacity * l.opacity)),
            LayerNode::Group(g) if g.visible => collect_visible(&g.children, opacity * g.opacity, depth + 1, out),
            _ => {}
        }
    }
}

fn match_limit(threshold: f32) -> u8 {
    (threshold.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn fill_match_rows<F>(mask: &mut GrayImage, sample: F, target: Rgba<u8>, limit: u8)
where
    F: Fn(u32, u32) -> Rgba<u8> + Sync,
{
    let w = mask.width() as usize;
    if w == 0 {
        return;
    }
    let raw: &mut [u8] = &mut **mask;
    raw.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        for (x, m) in row.iter_mut().enumerate() {
            if channel_distance(sample(x as u32, y as u32), target) <= limit {
                *m = 255;
            }
        }
    });
}

/// Largest absolute per-channel difference.
#[inline]
pub fn channel_distance(a: Rgba<u8>, b: Rgba<u8>) -> u8 {
    a.0.iter().zip(b.0.iter()).map(|(x, y)| x.abs_diff(*y)).max().unwrap_or(0)
}

/// Source-over of `top` onto `base` with an extra layer opacity.
pub fn blend_normal(base: Rgba<u8>, top: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel, nothing to blend
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }
    // Fast path: full opacity, fully opaque top pixel, just overwrite
    if opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let top_a = (top[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
    let base_a = base[3] as f32 / 255.0;
    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mix = |b: u8, t: u8| -> u8 {
        let v = (t as f32 * top_a + b as f32 * base_a * (1.0 - top_a)) / out_a;
        v.round().clamp(0.0, 255.0) as u8
    };
    Rgba([
        mix(base[0], top[0]),
        mix(base[1], top[1]),
        mix(base[2], top[2]),
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}
