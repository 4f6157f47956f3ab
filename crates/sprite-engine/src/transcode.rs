//! Sprite sheet → looping GIF.
//!
//! A sheet is an N×N grid of equally sized cells read in row-major order.
//! Each cell is cropped, scaled with nearest-neighbour sampling, stripped of
//! its anti-aliased alpha fringe and quantized to a paletted GIF frame. GIF
//! has no per-pixel alpha, so background pixels are painted with a reserved
//! sentinel colour whose palette slot becomes the frame's transparent index.

use std::borrow::Cow;
use std::collections::HashMap;

use color_quant::NeuQuant;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use sprite_contracts::prompts::{clamp_grid, DEFAULT_GRID};
use thiserror::Error;

pub const SENTINEL: [u8; 3] = [255, 0, 255];
pub const DEFAULT_FRAME_SIZE: u32 = 200;
pub const DEFAULT_FPS: u32 = 16;

const MAX_PALETTE: usize = 256;
const NEUQUANT_SAMPLE_FACTOR: i32 = 10;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("unreadable sprite sheet: {0}")]
    Decode(#[from] image::ImageError),
    #[error("{width}x{height} sheet is too small for a {grid}x{grid} grid")]
    EmptyFrame { width: u32, height: u32, grid: u32 },
    #[error("frame size {0} is outside 1..=65535")]
    FrameSize(u32),
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("gif encoding failed: {0}")]
    Encode(#[from] gif::EncodingError),
}

/// Fringe removal knobs. `threshold` is the alpha below which a pixel counts
/// as background; each pass grows the background by one pixel (4-connected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlphaCleanup {
    pub threshold: u8,
    pub passes: u32,
}

impl Default for AlphaCleanup {
    fn default() -> Self {
        Self {
            threshold: 200,
            passes: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub grid_size: u32,
    pub frame_size: u32,
    pub fps: u32,
    pub cleanup: AlphaCleanup,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID,
            frame_size: DEFAULT_FRAME_SIZE,
            fps: DEFAULT_FPS,
            cleanup: AlphaCleanup::default(),
        }
    }
}

impl TranscodeOptions {
    pub fn frame_delay_ms(&self) -> u32 {
        (1000.0 / f64::from(self.fps.max(1))).round() as u32
    }

    /// GIF delays are stored in hundredths of a second.
    fn frame_delay_centis(&self) -> u16 {
        (f64::from(self.frame_delay_ms()) / 10.0).round() as u16
    }
}

/// One grid cell of the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub index: u32,
    pub column: u32,
    pub row: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Cell geometry of a sheet. Remainder pixels on the right and bottom edges
/// belong to no cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGrid {
    grid_size: u32,
    frame_width: u32,
    frame_height: u32,
}

pub fn decompose_grid(image_width: u32, image_height: u32, grid_size: u32) -> FrameGrid {
    let grid_size = clamp_grid(grid_size);
    FrameGrid {
        grid_size,
        frame_width: image_width / grid_size,
        frame_height: image_height / grid_size,
    }
}

impl FrameGrid {
    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    pub fn frame_width(&self) -> u32 {
        self.frame_width
    }

    pub fn frame_height(&self) -> u32 {
        self.frame_height
    }

    pub fn frame_count(&self) -> u32 {
        self.grid_size * self.grid_size
    }

    pub fn is_degenerate(&self) -> bool {
        self.frame_width == 0 || self.frame_height == 0
    }

    pub fn frame(&self, index: u32) -> Frame {
        let column = index % self.grid_size;
        let row = index / self.grid_size;
        Frame {
            index,
            column,
            row,
            x: column * self.frame_width,
            y: row * self.frame_height,
            width: self.frame_width,
            height: self.frame_height,
        }
    }

    pub fn frames(&self) -> Frames {
        Frames {
            grid: *self,
            next: 0,
        }
    }
}

impl IntoIterator for FrameGrid {
    type Item = Frame;
    type IntoIter = Frames;

    fn into_iter(self) -> Frames {
        self.frames()
    }
}

#[derive(Debug, Clone)]
pub struct Frames {
    grid: FrameGrid,
    next: u32,
}

impl Iterator for Frames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.next >= self.grid.frame_count() {
            return None;
        }
        let frame = self.grid.frame(self.next);
        self.next += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.grid.frame_count().saturating_sub(self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Frames {}

/// Per-pixel background flags for one frame; `true` is transparent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlphaMask {
    width: u32,
    height: u32,
    transparent: Vec<bool>,
}

impl AlphaMask {
    pub fn from_alpha(
        rgba: &[u8],
        width: u32,
        height: u32,
        threshold: u8,
    ) -> Result<Self, TranscodeError> {
        check_rgba_len(rgba, width, height)?;
        Ok(Self {
            width,
            height,
            transparent: rgba.chunks_exact(4).map(|px| px[3] < threshold).collect(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_transparent(&self, x: u32, y: u32) -> bool {
        self.transparent[(y * self.width + x) as usize]
    }

    pub fn transparent_count(&self) -> usize {
        self.transparent.iter().filter(|flag| **flag).count()
    }

    /// One 4-connected erosion pass of the opaque region. Reads from a
    /// snapshot so a pass grows the background by exactly one pixel.
    pub fn erode(&mut self) {
        let (w, h) = (self.width as usize, self.height as usize);
        let source = self.transparent.clone();
        for y in 0..h {
            for x in 0..w {
                let idx = y * w + x;
                if source[idx] {
                    continue;
                }
                let touches = (x > 0 && source[idx - 1])
                    || (x + 1 < w && source[idx + 1])
                    || (y > 0 && source[idx - w])
                    || (y + 1 < h && source[idx + w]);
                if touches {
                    self.transparent[idx] = true;
                }
            }
        }
    }
}

pub fn clean_frame_alpha(
    rgba: &[u8],
    width: u32,
    height: u32,
    cleanup: AlphaCleanup,
) -> Result<AlphaMask, TranscodeError> {
    let mut mask = AlphaMask::from_alpha(rgba, width, height, cleanup.threshold)?;
    for _ in 0..cleanup.passes {
        mask.erode();
    }
    Ok(mask)
}

/// Opaque RGBA buffer: masked pixels become the sentinel, the rest keep
/// their colour. Alpha is 255 everywhere.
pub fn composite_with_sentinel(rgba: &[u8], mask: &AlphaMask) -> Result<Vec<u8>, TranscodeError> {
    check_rgba_len(rgba, mask.width, mask.height)?;
    let mut out = Vec::with_capacity(rgba.len());
    for (px, transparent) in rgba.chunks_exact(4).zip(&mask.transparent) {
        if *transparent {
            out.extend_from_slice(&SENTINEL);
        } else {
            out.extend_from_slice(&px[..3]);
        }
        out.push(255);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFrame {
    pub palette: Vec<[u8; 3]>,
    pub indices: Vec<u8>,
    pub transparent_index: Option<u8>,
}

/// Quantizes a sentinel-composited buffer to at most 256 colours.
///
/// The sentinel never competes for palette space: opaque colours get up to
/// 255 slots (exact when they fit, NeuQuant otherwise) and the sentinel, when
/// present, takes the last slot.
pub fn quantize_frame(pixels: &[u8]) -> IndexedFrame {
    let has_sentinel = pixels.chunks_exact(4).any(|px| px[..3] == SENTINEL);
    let opaque_slots = if has_sentinel {
        MAX_PALETTE - 1
    } else {
        MAX_PALETTE
    };

    let (mut palette, mut indices) = match exact_palette(pixels, opaque_slots) {
        Some(exact) => exact,
        None => neuquant_palette(pixels, opaque_slots),
    };

    if has_sentinel {
        palette.push(SENTINEL);
        let reserved = (palette.len() - 1) as u8;
        for (index, px) in indices.iter_mut().zip(pixels.chunks_exact(4)) {
            if px[..3] == SENTINEL {
                *index = reserved;
            }
        }
    }
    let transparent_index = if has_sentinel {
        palette
            .iter()
            .rposition(|colour| *colour == SENTINEL)
            .map(|idx| idx as u8)
    } else {
        None
    };

    IndexedFrame {
        palette,
        indices,
        transparent_index,
    }
}

fn exact_palette(pixels: &[u8], slots: usize) -> Option<(Vec<[u8; 3]>, Vec<u8>)> {
    let mut lookup: HashMap<[u8; 3], u8> = HashMap::new();
    let mut palette = Vec::new();
    let mut indices = Vec::with_capacity(pixels.len() / 4);
    for px in pixels.chunks_exact(4) {
        let rgb = [px[0], px[1], px[2]];
        if rgb == SENTINEL {
            indices.push(0);
            continue;
        }
        let index = match lookup.get(&rgb) {
            Some(index) => *index,
            None => {
                if palette.len() == slots {
                    return None;
                }
                let index = palette.len() as u8;
                lookup.insert(rgb, index);
                palette.push(rgb);
                index
            }
        };
        indices.push(index);
    }
    Some((palette, indices))
}

fn neuquant_palette(pixels: &[u8], slots: usize) -> (Vec<[u8; 3]>, Vec<u8>) {
    let opaque: Vec<u8> = pixels
        .chunks_exact(4)
        .filter(|px| px[..3] != SENTINEL)
        .flatten()
        .copied()
        .collect();
    let quantizer = NeuQuant::new(NEUQUANT_SAMPLE_FACTOR, slots, &opaque);
    let palette = quantizer
        .color_map_rgb()
        .chunks_exact(3)
        .map(|rgb| [rgb[0], rgb[1], rgb[2]])
        .collect();
    let indices = pixels
        .chunks_exact(4)
        .map(|px| {
            if px[..3] == SENTINEL {
                0
            } else {
                quantizer.index_of(px) as u8
            }
        })
        .collect();
    (palette, indices)
}

/// Encodes every cell of `sheet` as one GIF frame, in index order, looping
/// forever.
pub fn encode_loop(
    sheet: &RgbaImage,
    grid: FrameGrid,
    options: &TranscodeOptions,
) -> Result<Vec<u8>, TranscodeError> {
    if grid.is_degenerate() {
        return Err(TranscodeError::EmptyFrame {
            width: sheet.width(),
            height: sheet.height(),
            grid: grid.grid_size(),
        });
    }
    let size = u16::try_from(options.frame_size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or(TranscodeError::FrameSize(options.frame_size))?;
    let delay = options.frame_delay_centis();

    let mut bytes = Vec::new();
    {
        let mut encoder = gif::Encoder::new(&mut bytes, size, size, &[])?;
        encoder.set_repeat(gif::Repeat::Infinite)?;
        for cell in grid.frames() {
            let cropped =
                imageops::crop_imm(sheet, cell.x, cell.y, cell.width, cell.height).to_image();
            let scaled = imageops::resize(
                &cropped,
                options.frame_size,
                options.frame_size,
                FilterType::Nearest,
            );
            let mask = clean_frame_alpha(
                scaled.as_raw(),
                options.frame_size,
                options.frame_size,
                options.cleanup,
            )?;
            let composited = composite_with_sentinel(scaled.as_raw(), &mask)?;
            let indexed = quantize_frame(&composited);

            let mut frame = gif::Frame::default();
            frame.width = size;
            frame.height = size;
            frame.delay = delay;
            frame.dispose = gif::DisposalMethod::Background;
            frame.transparent = indexed.transparent_index;
            frame.palette = Some(indexed.palette.iter().flatten().copied().collect());
            frame.buffer = Cow::Owned(indexed.indices);
            encoder.write_frame(&frame)?;
        }
    }
    Ok(bytes)
}

pub fn transcode_sprite_sheet(
    bytes: &[u8],
    options: &TranscodeOptions,
) -> Result<Vec<u8>, TranscodeError> {
    let sheet = image::load_from_memory(bytes)?.to_rgba8();
    let grid = decompose_grid(sheet.width(), sheet.height(), options.grid_size);
    encode_loop(&sheet, grid, options)
}

fn check_rgba_len(rgba: &[u8], width: u32, height: u32) -> Result<(), TranscodeError> {
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        return Err(TranscodeError::BufferSize {
            expected,
            actual: rgba.len(),
        });
    }
    Ok(())
}
