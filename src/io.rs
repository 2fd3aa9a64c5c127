use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{DynamicImage, RgbaImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::blend::BlendMode;
use crate::canvas::{CanvasState, Frame, Layer, MAX_CANVAS_DIM, TiledImage};
use crate::color::Color;
use crate::error::{EngineError, Result};
use crate::{log_info, log_warn};

// ============================================================================
// PCP PROJECT FILE FORMAT
// ============================================================================

/// Magic header for the sparse tiled project format.
const PCP_MAGIC_V1: &str = "PCP1";
/// File extension used for native projects.
pub const PROJECT_EXTENSION: &str = "pcp";

/// Maximum number of layers per frame in a project file.
const MAX_LAYERS: usize = 256;
/// Maximum number of animation frames in a project file.
const MAX_FRAMES: usize = 4096;

/// Serializable project file: canvas size plus every frame's layer stack.
#[derive(Serialize, Deserialize)]
pub(crate) struct ProjectFileV1 {
    magic: String,
    width: u32,
    height: u32,
    current_frame: usize,
    active_layer_index: usize,
    frames: Vec<FrameData>,
}

#[derive(Serialize, Deserialize)]
struct FrameData {
    layers: Vec<LayerData>,
}

/// Layer properties plus only the chunks that were ever written.
#[derive(Serialize, Deserialize)]
struct LayerData {
    name: String,
    visible: bool,
    opacity: f32,
    blend_mode: u8,
    chunks: Vec<ChunkData>,
}

/// One 64×64 chunk of straight-alpha float pixels.
#[derive(Serialize, Deserialize)]
struct ChunkData {
    cx: u32,
    cy: u32,
    pixels: Vec<Color>,
}

/// Save every frame and layer as a `.pcp` project file.
pub fn save_project(state: &CanvasState, path: &Path) -> Result<()> {
    let project = build_project(state);
    write_project(&project, path)?;
    log_info!(
        "Saved project {} ({}x{}, {} frame(s), {} layer(s))",
        path.display(),
        state.width,
        state.height,
        state.frame_count(),
        state.layer_count()
    );
    Ok(())
}

/// Copy chunk data out of the canvas.  Cheap enough to run under the chunk
/// lock; serialization can then happen without holding it.
pub(crate) fn build_project(state: &CanvasState) -> ProjectFileV1 {
    let frames = state
        .frames
        .iter()
        .map(|frame| FrameData {
            layers: frame.layers.iter().map(layer_data).collect(),
        })
        .collect();

    ProjectFileV1 {
        magic: PCP_MAGIC_V1.to_string(),
        width: state.width,
        height: state.height,
        current_frame: state.current_frame,
        active_layer_index: state.active_layer_index,
        frames,
    }
}

fn layer_data(layer: &Layer) -> LayerData {
    let chunks = layer
        .pixels
        .chunk_keys()
        .filter_map(|(cx, cy)| {
            let pixels = layer.pixels.get_chunk(cx, cy)?;
            Some(ChunkData { cx, cy, pixels: pixels.to_vec() })
        })
        .collect();

    LayerData {
        name: layer.name.clone(),
        visible: layer.visible,
        opacity: layer.opacity,
        blend_mode: layer.blend_mode.to_u8(),
        chunks,
    }
}

pub(crate) fn write_project(project: &ProjectFileV1, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, project)?;
    Ok(())
}

/// Load a `.pcp` project file.
pub fn load_project(path: &Path) -> Result<CanvasState> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 {
        return Err(EngineError::InvalidProject("file too small".into()));
    }

    // bincode writes a String as an 8-byte length prefix plus UTF-8 bytes,
    // so the 4-char magic sits at 8..12.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != PCP_MAGIC_V1 {
        return Err(EngineError::InvalidProject(format!("unknown magic '{}'", magic)));
    }

    let project: ProjectFileV1 = bincode::deserialize(&raw)?;
    let state = project_to_canvas(project)?;
    log_info!(
        "Loaded project {} ({}x{}, {} frame(s), {} layer(s))",
        path.display(),
        state.width,
        state.height,
        state.frame_count(),
        state.layer_count()
    );
    Ok(state)
}

fn project_to_canvas(project: ProjectFileV1) -> Result<CanvasState> {
    let (w, h) = (project.width, project.height);
    if w == 0 || h == 0 || w > MAX_CANVAS_DIM || h > MAX_CANVAS_DIM {
        return Err(EngineError::InvalidProject(format!(
            "canvas dimensions {}x{} out of range (max {})",
            w, h, MAX_CANVAS_DIM
        )));
    }
    if project.frames.is_empty() || project.frames.len() > MAX_FRAMES {
        return Err(EngineError::InvalidProject(format!(
            "frame count {} out of range (1..={})",
            project.frames.len(),
            MAX_FRAMES
        )));
    }
    let layer_count = project.frames[0].layers.len();
    if layer_count == 0 || layer_count > MAX_LAYERS {
        return Err(EngineError::InvalidProject(format!(
            "layer count {} out of range (1..={})",
            layer_count, MAX_LAYERS
        )));
    }
    if project.frames.iter().any(|f| f.layers.len() != layer_count) {
        return Err(EngineError::InvalidProject("frames have differing layer counts".into()));
    }

    let mut state = CanvasState::new(w, h);
    state.frames = project
        .frames
        .into_iter()
        .map(|frame| {
            let layers = frame
                .layers
                .into_iter()
                .map(|ld| layer_from_data(ld, w, h))
                .collect::<Result<Vec<_>>>()?;
            Ok(Frame { layers })
        })
        .collect::<Result<Vec<_>>>()?;
    state.current_frame = project.current_frame;
    state.active_layer_index = project.active_layer_index;
    state.clamp_indices();
    state.mark_dirty(None);
    Ok(state)
}

fn layer_from_data(ld: LayerData, w: u32, h: u32) -> Result<Layer> {
    let mut pixels = TiledImage::new(w, h);
    for chunk in ld.chunks {
        let (cx, cy) = (chunk.cx, chunk.cy);
        let mut data = chunk.pixels;
        let mut repaired = 0usize;
        for px in data.iter_mut() {
            let clean = px.clamped();
            if clean != *px {
                repaired += 1;
            }
            *px = clean;
        }
        if repaired > 0 {
            log_warn!(
                "Clamped {} out-of-range pixel(s) in chunk ({}, {}) of layer '{}'",
                repaired,
                cx,
                cy,
                ld.name
            );
        }
        if !pixels.set_chunk(cx, cy, data) {
            return Err(EngineError::InvalidProject(format!(
                "bad chunk ({}, {}) in layer '{}'",
                cx, cy, ld.name
            )));
        }
    }
    let opacity = if ld.opacity.is_nan() { 1.0 } else { ld.opacity.clamp(0.0, 1.0) };
    Ok(Layer {
        name: ld.name,
        visible: ld.visible,
        opacity,
        blend_mode: BlendMode::from_u8(ld.blend_mode),
        pixels,
    })
}

/// Directory for timed autosaves, next to the session log.
///
/// `%APPDATA%\PaintCore\autosave\`       (Windows)
/// `~/.local/share/PaintCore/autosave/`  (Linux)
/// `~/Library/Application Support/PaintCore/autosave/`  (macOS)
pub fn autosave_dir() -> PathBuf {
    crate::logger::data_dir().join("PaintCore").join("autosave")
}

// ============================================================================
// RASTER IMPORT / EXPORT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveFormat {
    Png,
    Jpeg,
    Bmp,
    Tga,
}

impl SaveFormat {
    pub fn from_path(path: &Path) -> Option<SaveFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(SaveFormat::Png),
            "jpg" | "jpeg" => Some(SaveFormat::Jpeg),
            "bmp" => Some(SaveFormat::Bmp),
            "tga" => Some(SaveFormat::Tga),
            _ => None,
        }
    }
}

/// The current frame's display composite as 8-bit RGBA.
pub fn composite_image(state: &CanvasState) -> RgbaImage {
    let bytes: Vec<u8> = state.composite().iter().flat_map(|c| c.to_rgba8()).collect();
    RgbaImage::from_raw(state.width, state.height, bytes)
        .unwrap_or_else(|| RgbaImage::new(state.width, state.height))
}

/// Write the composite of the current frame as a PNG.
pub fn export_png(state: &CanvasState, path: &Path) -> Result<()> {
    export_image(state, path, SaveFormat::Png, 90)
}

/// Write the composite of the current frame in `format`.
pub fn export_image(state: &CanvasState, path: &Path, format: SaveFormat, quality: u8) -> Result<()> {
    let image = composite_image(state);
    encode_and_write(&image, path, format, quality)?;
    log_info!("Exported {:?} {}", format, path.display());
    Ok(())
}

/// Encode and write an image to a file.
pub fn encode_and_write(image: &RgbaImage, path: &Path, format: SaveFormat, quality: u8) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match format {
        SaveFormat::Png => {
            let encoder = PngEncoder::new(&mut writer);
            #[allow(deprecated)]
            encoder.encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgba8)?;
        }
        SaveFormat::Jpeg => {
            let rgb_image = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
            encoder.encode(
                rgb_image.as_raw(),
                rgb_image.width(),
                rgb_image.height(),
                image::ColorType::Rgb8,
            )?;
        }
        SaveFormat::Bmp => {
            let mut encoder = BmpEncoder::new(&mut writer);
            encoder.encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgba8)?;
        }
        SaveFormat::Tga => {
            let encoder = TgaEncoder::new(&mut writer);
            encoder.encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgba8)?;
        }
    }
    Ok(())
}

/// Decode a raster image into a single-layer canvas named after the file.
pub fn import_image(path: &Path) -> Result<CanvasState> {
    let img = image::open(path)?.to_rgba8();
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || w > MAX_CANVAS_DIM || h > MAX_CANVAS_DIM {
        return Err(EngineError::InvalidProject(format!(
            "image dimensions {}x{} out of range (max {})",
            w, h, MAX_CANVAS_DIM
        )));
    }
    let pixels: Vec<Color> = img.pixels().map(|p| Color::from(*p)).collect();
    let mut state = CanvasState::new(w, h);
    if let Some(layer) = state.active_layer_mut() {
        layer.pixels = TiledImage::from_pixels(w, h, &pixels);
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            layer.name = stem.to_string();
        }
    }
    log_info!("Imported {} ({}x{})", path.display(), w, h);
    Ok(state)
}

/// Open either a native project or any raster format the `image` crate reads.
pub fn open_any(path: &Path) -> Result<CanvasState> {
    let is_project = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PROJECT_EXTENSION));
    let result = if is_project { load_project(path) } else { import_image(path) };
    if let Err(e) = &result {
        log_warn!("Failed to open {}: {}", path.display(), e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::LayerRef;

    #[test]
    fn project_round_trip_keeps_frames_and_props() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("art.pcp");

        let mut c = CanvasState::new(70, 5);
        c.set_pixel(69, 4, Color::RED);
        c.frames[0].layers[0].opacity = 0.5;
        c.frames[0].layers[0].blend_mode = BlendMode::Screen;
        c.frames.push(c.frames[0].clone());
        c.set_pixel_at(LayerRef { frame: 1, layer: 0 }, 0, 0, Color::BLUE);
        c.current_frame = 1;

        save_project(&c, &path).unwrap();
        let loaded = load_project(&path).unwrap();

        assert_eq!((loaded.width, loaded.height), (70, 5));
        assert_eq!(loaded.frame_count(), 2);
        assert_eq!(loaded.current_frame, 1);
        let l0 = &loaded.frames[0].layers[0];
        assert_eq!(l0.opacity, 0.5);
        assert_eq!(l0.blend_mode, BlendMode::Screen);
        assert_eq!(l0.pixels.get_pixel(69, 4), Color::RED);
        assert_eq!(l0.pixels.get_pixel(0, 0), Color::TRANSPARENT);
        assert_eq!(loaded.frames[1].layers[0].pixels.get_pixel(0, 0), Color::BLUE);
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.pcp");
        std::fs::write(&path, b"definitely not a project file").unwrap();
        assert!(matches!(load_project(&path), Err(EngineError::InvalidProject(_))));
        std::fs::write(&path, b"tiny").unwrap();
        assert!(matches!(load_project(&path), Err(EngineError::InvalidProject(_))));
    }

    fn one_chunk_project(cx: u32, cy: u32, pixels: Vec<Color>) -> ProjectFileV1 {
        let mut project = build_project(&CanvasState::new(70, 5));
        project.frames[0].layers[0].chunks = vec![ChunkData { cx, cy, pixels }];
        project
    }

    #[test]
    fn rejects_chunks_outside_the_canvas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad_chunk.pcp");
        let full = vec![Color::RED; crate::canvas::CHUNK_LEN];

        for (cx, cy) in [(2, 0), (0, 1), (0, u32::MAX), (u32::MAX, u32::MAX)] {
            write_project(&one_chunk_project(cx, cy, full.clone()), &path).unwrap();
            assert!(
                matches!(load_project(&path), Err(EngineError::InvalidProject(_))),
                "chunk ({}, {}) accepted",
                cx,
                cy
            );
        }

        write_project(&one_chunk_project(0, 0, vec![Color::RED; 7]), &path).unwrap();
        assert!(matches!(load_project(&path), Err(EngineError::InvalidProject(_))));
    }

    #[test]
    fn clamps_non_finite_chunk_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nan.pcp");
        let mut data = vec![Color::TRANSPARENT; crate::canvas::CHUNK_LEN];
        data[0] = Color { r: f32::NAN, g: 7.5, b: -3.0, a: f32::INFINITY };
        data[1] = Color { r: 0.25, g: 0.5, b: 0.75, a: 1.0 };
        write_project(&one_chunk_project(1, 0, data), &path).unwrap();

        let loaded = load_project(&path).unwrap();
        let img = &loaded.frames[0].layers[0].pixels;
        let px = img.get_pixel(64, 0);
        assert_eq!(px, Color { r: 0.0, g: 1.0, b: 0.0, a: 1.0 });
        assert_eq!(img.get_pixel(65, 0), Color { r: 0.25, g: 0.5, b: 0.75, a: 1.0 });
    }

    #[test]
    fn png_export_then_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let mut c = CanvasState::new(3, 2);
        c.set_pixel(1, 1, Color::GREEN);
        export_png(&c, &path).unwrap();

        let back = open_any(&path).unwrap();
        assert_eq!((back.width, back.height), (3, 2));
        assert_eq!(back.layer_count(), 1);
        assert_eq!(back.layers()[0].name, "out");
        assert_eq!(back.get_pixel(1, 1).to_rgba8(), [0, 255, 0, 255]);
        assert_eq!(back.get_pixel(0, 0).to_rgba8(), [0, 0, 0, 0]);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(SaveFormat::from_path(Path::new("a.JPG")), Some(SaveFormat::Jpeg));
        assert_eq!(SaveFormat::from_path(Path::new("a.webp")), None);
    }
}
