use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::bmp::BmpEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{GrayImage, ImageError, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canvas::{CHUNK_SIZE, CanvasState, Layer, LayerGroup, LayerNode, LayerPath, MAX_GROUP_DEPTH, TiledImage};

// ============================================================================
// SCPROJ PROJECT FILE FORMAT
// ============================================================================

/// Magic header of the layered project format.
const PROJECT_MAGIC: &str = "SCP1";

/// File extension of layered project files.
pub const PROJECT_EXTENSION: &str = "scproj";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layer-tree nodes (layers and groups) in a project file.
const MAX_NODES: usize = 256;

#[derive(Serialize, Deserialize)]
struct ProjectFile {
    magic: String,
    width: u32,
    height: u32,
    active_layer: Vec<usize>,
    nodes: Vec<NodeData>,
    /// Raw L8 selection, `width * height` bytes.
    selection: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
enum NodeData {
    Layer {
        name: String,
        visible: bool,
        opacity: f32,
        chunks: Vec<ChunkData>,
    },
    Group {
        name: String,
        visible: bool,
        opacity: f32,
        children: Vec<NodeData>,
    },
}

/// A single serialisable chunk (64×64 × 4 bytes = 16 384 bytes of pixel data)
#[derive(Serialize, Deserialize)]
struct ChunkData {
    cx: u32,
    cy: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProjectFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

impl From<Box<bincode::ErrorKind>> for ProjectFileError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ProjectFileError::Serialize(e.to_string())
    }
}

/// Save a document as a `.scproj` project file.
pub fn save_project(state: &CanvasState, path: &Path) -> Result<(), ProjectFileError> {
    let project = ProjectFile {
        magic: PROJECT_MAGIC.to_string(),
        width: state.width,
        height: state.height,
        active_layer: state.active_layer.0.clone(),
        nodes: state.layers.iter().map(node_to_data).collect(),
        selection: state.selection_mask.as_ref().map(|m| m.as_raw().clone()),
    };
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &project)?;
    Ok(())
}

fn node_to_data(node: &LayerNode) -> NodeData {
    match node {
        LayerNode::Layer(layer) => NodeData::Layer {
            name: layer.name.clone(),
            visible: layer.visible,
            opacity: layer.opacity,
            chunks: layer
                .pixels
                .chunk_keys()
                .filter_map(|(cx, cy)| {
                    let chunk = layer.pixels.get_chunk(cx, cy)?;
                    Some(ChunkData { cx, cy, pixels: chunk.as_raw().clone() })
                })
                .collect(),
        },
        LayerNode::Group(group) => NodeData::Group {
            name: group.name.clone(),
            visible: group.visible,
            opacity: group.opacity,
            children: group.children.iter().map(node_to_data).collect(),
        },
    }
}

/// Load a `.scproj` project file.
pub fn load_project(path: &Path) -> Result<CanvasState, ProjectFileError> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 {
        return Err(ProjectFileError::InvalidFormat("File too small".into()));
    }

    // bincode encodes a String as: 8-byte length prefix + UTF-8 data.
    // The magic is 4 chars, so bytes 8..12 hold it.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != PROJECT_MAGIC {
        return Err(ProjectFileError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }

    let project: ProjectFile = bincode::deserialize(&raw)?;

    if project.width == 0 || project.height == 0 {
        return Err(ProjectFileError::InvalidFormat("Canvas dimensions cannot be zero".into()));
    }
    if project.width > MAX_CANVAS_DIM || project.height > MAX_CANVAS_DIM {
        return Err(ProjectFileError::InvalidFormat(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            project.width, project.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    let node_count = count_nodes(&project.nodes);
    if node_count > MAX_NODES {
        return Err(ProjectFileError::InvalidFormat(format!(
            "Project contains {} layers and groups, which exceeds the maximum of {}",
            node_count, MAX_NODES
        )));
    }

    let mut layers = Vec::with_capacity(project.nodes.len());
    for node in project.nodes {
        layers.push(data_to_node(node, project.width, project.height, 1)?);
    }
    if layers.is_empty() {
        return Err(ProjectFileError::InvalidFormat("Project contains no layers".into()));
    }

    let mut state = CanvasState::with_layers(project.width, project.height, layers);
    let active = LayerPath(project.active_layer);
    if state.layer(&active).is_some() {
        state.active_layer = active;
    }

    if let Some(bytes) = project.selection {
        let mask = GrayImage::from_raw(project.width, project.height, bytes).ok_or_else(|| {
            ProjectFileError::InvalidFormat("Selection does not match canvas size".into())
        })?;
        state.selection_mask = Some(mask);
    }

    Ok(state)
}

fn count_nodes(nodes: &[NodeData]) -> usize {
    let mut count = 0;
    let mut stack: Vec<&NodeData> = nodes.iter().collect();
    while let Some(node) = stack.pop() {
        count += 1;
        if let NodeData::Group { children, .. } = node {
            stack.extend(children.iter());
        }
    }
    count
}

fn data_to_node(data: NodeData, width: u32, height: u32, depth: usize) -> Result<LayerNode, ProjectFileError> {
    if depth > MAX_GROUP_DEPTH {
        return Err(ProjectFileError::InvalidFormat(format!(
            "Groups nested deeper than {} levels",
            MAX_GROUP_DEPTH
        )));
    }

    match data {
        NodeData::Layer { name, visible, opacity, chunks } => {
            let expected_chunk_bytes = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
            let mut tiled = TiledImage::new(width, height);
            for cd in chunks {
                if cd.pixels.len() != expected_chunk_bytes {
                    return Err(ProjectFileError::InvalidFormat(format!(
                        "Chunk ({},{}) in layer '{}' has {} bytes, expected {}",
                        cd.cx,
                        cd.cy,
                        name,
                        cd.pixels.len(),
                        expected_chunk_bytes,
                    )));
                }
                let chunk_img = RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, cd.pixels).ok_or_else(|| {
                    ProjectFileError::InvalidFormat(format!(
                        "Failed to reconstruct chunk ({},{}) for layer '{}'",
                        cd.cx, cd.cy, name
                    ))
                })?;
                tiled.set_chunk(cd.cx, cd.cy, chunk_img);
            }
            Ok(LayerNode::Layer(Layer { name, visible, opacity, pixels: tiled }))
        }
        NodeData::Group { name, visible, opacity, children } => {
            let children = children
                .into_iter()
                .map(|child| data_to_node(child, width, height, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(LayerNode::Group(LayerGroup { name, visible, opacity, children }))
        }
    }
}

// ============================================================================
// SYNCHRONOUS IMAGE LOADER
// ============================================================================

/// Synchronously load a document.
///
/// Supported inputs:
/// - `.scproj`: layered project (layer tree and selection preserved)
/// - All standard raster formats supported by the `image` crate, loaded as a
///   single layer named after the file stem
pub fn load_image_sync(path: &Path) -> Result<CanvasState, String> {
    if is_project_path(path) {
        return load_project(path).map_err(|e| e.to_string());
    }

    let img: RgbaImage = image::open(path).map_err(|e| e.to_string())?.to_rgba8();
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Background")
        .to_string();

    let layer = Layer {
        name,
        visible: true,
        opacity: 1.0,
        pixels: TiledImage::from_rgba_image(&img),
    };
    Ok(CanvasState::with_layers(img.width(), img.height(), vec![layer.into()]))
}

/// `true` for paths ending in `.scproj`, any case.
pub fn is_project_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PROJECT_EXTENSION))
}

/// Encode and write a flat image, picking the format from the extension
/// (`bmp`, `tga`, anything else PNG).
pub fn encode_and_write(image: &RgbaImage, path: &Path) -> Result<(), String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let write = || -> Result<(), ImageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        match ext.as_str() {
            "bmp" => {
                let mut encoder = BmpEncoder::new(&mut writer);
                encoder.encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgba8)?;
            }
            "tga" => {
                let encoder = TgaEncoder::new(&mut writer);
                encoder.encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgba8)?;
            }
            _ => {
                let encoder = PngEncoder::new(&mut writer);
                #[allow(deprecated)]
                encoder.encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgba8)?;
            }
        }
        Ok(())
    };
    write().map_err(|e| format!("could not write {}: {}", path.display(), e))
}

// ============================================================================
// SELECTION CHANNELS
// ============================================================================

/// Load a greyscale selection channel. Any non-zero value counts as selected
/// to that degree; the image must match the document size.
pub fn load_selection_mask(path: &Path, width: u32, height: u32) -> Result<GrayImage, String> {
    let mask = image::open(path)
        .map_err(|e| format!("could not read selection {}: {}", path.display(), e))?
        .to_luma8();
    if mask.width() != width || mask.height() != height {
        return Err(format!(
            "selection {} is {}x{}, document is {}x{}",
            path.display(),
            mask.width(),
            mask.height(),
            width,
            height
        ));
    }
    Ok(mask)
}

/// Write a selection channel as an 8-bit greyscale PNG.
pub fn save_selection_mask(mask: &GrayImage, path: &Path) -> Result<(), String> {
    let write = || -> Result<(), ImageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let encoder = PngEncoder::new(&mut writer);
        #[allow(deprecated)]
        encoder.encode(mask.as_raw(), mask.width(), mask.height(), image::ColorType::L8)?;
        Ok(())
    };
    write().map_err(|e| format!("could not write selection {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    const TEAL: Rgba<u8> = Rgba([0x24, 0x4B, 0x67, 255]);

    fn layered() -> CanvasState {
        let mut top = Layer::new("top", 70, 5, Rgba([0, 0, 0, 0]));
        top.pixels.put_pixel(66, 4, TEAL);
        top.opacity = 0.5;
        let mut group = LayerGroup::new("group", vec![top.into()]);
        group.visible = false;
        let mut state = CanvasState::with_layers(
            70,
            5,
            vec![Layer::new("base", 70, 5, Rgba([9, 9, 9, 255])).into(), group.into()],
        );
        state.active_layer = LayerPath::root(0);
        state.selection_mask = Some(GrayImage::from_fn(70, 5, |x, _| Luma([if x == 3 { 255 } else { 0 }])));
        state
    }

    #[test]
    fn test_project_round_trip_keeps_tree_and_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprite.scproj");
        save_project(&layered(), &path).unwrap();

        let loaded = load_image_sync(&path).unwrap();
        assert_eq!((loaded.width, loaded.height), (70, 5));
        assert_eq!(loaded.active_layer, LayerPath::root(0));
        let LayerNode::Group(group) = &loaded.layers[1] else {
            panic!("expected group");
        };
        assert!(!group.visible);
        assert_eq!(group.children[0].name(), "top");

        let top = LayerPath(vec![1, 0]);
        assert_eq!(loaded.pick_color(&top, 66, 4), Some(TEAL));
        assert_eq!(loaded.pick_color(&top, 0, 0), Some(Rgba([0, 0, 0, 0])));
        assert_eq!(loaded.layer(&top).map(|l| l.opacity), Some(0.5));
        assert_eq!(loaded.selection_bounds(), Some((3, 0, 4, 5)));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.scproj");
        std::fs::write(&path, b"\x04\0\0\0\0\0\0\0PFE1 and some more bytes").unwrap();
        assert!(matches!(load_project(&path), Err(ProjectFileError::InvalidFormat(_))));

        std::fs::write(&path, b"tiny").unwrap();
        assert!(matches!(load_project(&path), Err(ProjectFileError::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_too_many_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.scproj");
        let layers: Vec<LayerNode> = (0..MAX_NODES + 1).map(|i| Layer::new(format!("l{}", i), 1, 1, TEAL).into()).collect();
        save_project(&CanvasState::with_layers(1, 1, layers), &path).unwrap();
        let Err(err) = load_project(&path) else {
            panic!("oversized project loaded");
        };
        assert!(err.to_string().contains("exceeds the maximum"));
    }

    #[test]
    fn test_raster_loads_as_single_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("house.png");
        let img = RgbaImage::from_pixel(3, 2, TEAL);
        encode_and_write(&img, &path).unwrap();

        let loaded = load_image_sync(&path).unwrap();
        assert_eq!(loaded.layers.len(), 1);
        assert_eq!(loaded.layers[0].name(), "house");
        assert_eq!(loaded.composite(), img);
    }

    #[test]
    fn test_selection_mask_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let mask = GrayImage::from_fn(4, 3, |x, y| Luma([(x * 60 + y) as u8]));
        save_selection_mask(&mask, &path).unwrap();
        assert_eq!(load_selection_mask(&path, 4, 3).unwrap(), mask);
        assert!(load_selection_mask(&path, 5, 3).is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let Err(err) = load_image_sync(Path::new("/nonexistent/lookup.png")) else {
            panic!("missing file loaded");
        };
        assert!(!err.is_empty());
    }
}
