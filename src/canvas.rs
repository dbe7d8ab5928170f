use crate::kind::{ImageKind, ModeRules, OutputFormat, Padding};
use crate::planner::{self, ScalePlan, ScalePolicy};
use color_quant::NeuQuant;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, ImageFormat, RgbaImage};
use rexif::{parse_buffer_quiet, ExifData, ExifTag, TagValue};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Below this many pixels the palette quantizer has too few samples to learn from.
const MIN_QUANTIZE_PIXELS: u64 = 1024;
const MAX_PALETTE_COLORS: usize = 256;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("image decoding failed: {0}")]
    Decode(String),
    #[error("image has zero area ({width}x{height})")]
    InvalidImage { width: u32, height: u32 },
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
}

/// Facts about the source image that survive decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub color: ColorType,
    pub format: ImageFormat,
    /// Distinct colors of a palette-indexed source, capped at 256.
    pub palette_colors: Option<usize>,
}

#[derive(Debug)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub source: SourceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Outcome of logo padding removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trim {
    NotRequested,
    Unchanged,
    FullyTransparent,
    Cropped { from: (u32, u32) },
}

impl Trim {
    pub fn cropped(self) -> bool {
        matches!(self, Trim::Cropped { .. })
    }
}

/// Decoded, oriented and planned image, ready to be rendered.
#[derive(Debug)]
pub struct Prepared {
    pub image: DynamicImage,
    pub source: SourceInfo,
    pub trim: Trim,
    pub plan: ScalePlan,
}

impl Prepared {
    /// True when the original bytes can be kept as they are.
    pub fn keeps_original(&self) -> bool {
        self.plan.is_no_scale() && !self.trim.cropped()
    }
}

/// Result of the pure normalization step for one image. `rendered` is `None`
/// when the original bytes can be kept as they are.
#[derive(Debug)]
pub struct Normalized {
    pub plan: ScalePlan,
    pub trim: Trim,
    pub source: SourceInfo,
    pub rendered: Option<Rendered>,
}

/// Decodes, corrects orientation and plans. No I/O.
pub fn prepare(bytes: &[u8], rules: &ModeRules) -> Result<Prepared, CanvasError> {
    let decoded = decode(bytes)?;
    let (image, trim) = if rules.kind == ImageKind::Logo && rules.padding == Padding::Remove {
        trim_transparent_border(decoded.image, rules.padding_remove_sensitivity)
    } else {
        (decoded.image, Trim::NotRequested)
    };

    let plan = planner::plan(
        (image.width(), image.height()),
        (rules.width, rules.height),
        rules.fit(),
        ScalePolicy {
            allow_upscale: rules.allow_upscale,
            allow_downscale: rules.allow_downscale,
        },
    );

    Ok(Prepared {
        image,
        source: decoded.source,
        trim,
        plan,
    })
}

/// Builds the output for a prepared image, or `None` when no rebuild is needed.
pub fn render(prepared: &Prepared, rules: &ModeRules) -> Result<Option<Rendered>, CanvasError> {
    if prepared.keeps_original() {
        return Ok(None);
    }
    build(&prepared.image, &prepared.source, &prepared.plan, rules).map(Some)
}

/// `prepare` followed by `render`.
pub fn normalize(bytes: &[u8], rules: &ModeRules) -> Result<Normalized, CanvasError> {
    let prepared = prepare(bytes, rules)?;
    let rendered = render(&prepared, rules)?;
    Ok(Normalized {
        plan: prepared.plan,
        trim: prepared.trim,
        source: prepared.source,
        rendered,
    })
}

pub fn decode(bytes: &[u8]) -> Result<DecodedImage, CanvasError> {
    let format = image::guess_format(bytes).map_err(|e| CanvasError::Decode(e.to_string()))?;
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| CanvasError::Decode(e.to_string()))?;
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(CanvasError::InvalidImage { width, height });
    }

    let palette_colors = if png_is_indexed(bytes) {
        Some(palette_color_count(&image))
    } else {
        None
    };
    let color = image.color();

    let orientation = exif_block(bytes, format)
        .and_then(|exif| parse_buffer_quiet(exif).0.ok())
        .as_ref()
        .and_then(exif_orientation);
    let image = match orientation.and_then(|o| orientation_to_apply(o, width, height)) {
        Some(orientation) => {
            debug!("  -> applying EXIF orientation {}", orientation);
            apply_orientation(image, orientation)
        }
        None => image,
    };

    Ok(DecodedImage {
        source: SourceInfo {
            width: image.width(),
            height: image.height(),
            color,
            format,
            palette_colors,
        },
        image,
    })
}

/// Builds the output for one kind from an already oriented image.
pub fn build(
    image: &DynamicImage,
    source: &SourceInfo,
    plan: &ScalePlan,
    rules: &ModeRules,
) -> Result<Rendered, CanvasError> {
    match rules.kind {
        ImageKind::Logo => build_logo(image, source, plan, rules),
        ImageKind::Thumb => build_thumb(image, plan, rules),
        ImageKind::Backdrop => build_backdrop(image, plan, rules),
        ImageKind::Profile => build_profile(image, plan, rules),
    }
}

fn build_logo(
    image: &DynamicImage,
    source: &SourceInfo,
    plan: &ScalePlan,
    rules: &ModeRules,
) -> Result<Rendered, CanvasError> {
    let rgba = image.to_rgba8();
    let resized = if rgba.dimensions() == (plan.target_width, plan.target_height) {
        rgba
    } else {
        imageops::resize(
            &rgba,
            plan.target_width,
            plan.target_height,
            FilterType::Lanczos3,
        )
    };

    let canvas = if rules.padding == Padding::Add {
        let mut canvas = RgbaImage::new(rules.width, rules.height);
        imageops::replace(
            &mut canvas,
            &resized,
            centered_offset(rules.width, resized.width()),
            centered_offset(rules.height, resized.height()),
        );
        canvas
    } else {
        resized
    };

    if let (Some(count), OutputFormat::Png) = (source.palette_colors, rules.output) {
        let colors = count.clamp(2, MAX_PALETTE_COLORS);
        if let Some(paletted) = quantize(&canvas, colors) {
            debug!("  -> Built paletted logo with ~{} colors", colors);
            return encode_indexed(&paletted);
        }
    }

    let output = if matches!(source.color, ColorType::La8 | ColorType::La16) {
        debug!("  -> Built logo in LA (grayscale + alpha)");
        DynamicImage::ImageLumaA8(DynamicImage::ImageRgba8(canvas).to_luma_alpha8())
    } else {
        DynamicImage::ImageRgba8(canvas)
    };
    encode(&output, rules.output)
}

fn build_thumb(
    image: &DynamicImage,
    plan: &ScalePlan,
    rules: &ModeRules,
) -> Result<Rendered, CanvasError> {
    let opaque = DynamicImage::ImageRgb8(image.to_rgb8());
    encode(&cover_and_crop(opaque, plan, rules), rules.output)
}

/// Same cover crop as thumbnails; every backdrop of an entity lands on the
/// same canvas.
fn build_backdrop(
    image: &DynamicImage,
    plan: &ScalePlan,
    rules: &ModeRules,
) -> Result<Rendered, CanvasError> {
    let opaque = DynamicImage::ImageRgb8(image.to_rgb8());
    encode(&cover_and_crop(opaque, plan, rules), rules.output)
}

fn build_profile(
    image: &DynamicImage,
    plan: &ScalePlan,
    rules: &ModeRules,
) -> Result<Rendered, CanvasError> {
    let with_alpha = DynamicImage::ImageRgba8(image.to_rgba8());
    encode(&cover_and_crop(with_alpha, plan, rules), rules.output)
}

/// Resizes to the planned size, then centers on the exact canvas. Overflow is
/// cropped; a source that was not allowed to grow is padded.
fn cover_and_crop(image: DynamicImage, plan: &ScalePlan, rules: &ModeRules) -> DynamicImage {
    let resized = if (image.width(), image.height()) == (plan.target_width, plan.target_height) {
        image
    } else {
        image.resize_exact(plan.target_width, plan.target_height, FilterType::Lanczos3)
    };

    let (width, height) = (rules.width, rules.height);
    if resized.width() >= width && resized.height() >= height {
        let left = (resized.width() - width) / 2;
        let top = (resized.height() - height) / 2;
        return resized.crop_imm(left, top, width, height);
    }

    let mut canvas = DynamicImage::new(width, height, resized.color());
    imageops::replace(
        &mut canvas,
        &resized,
        centered_offset(width, resized.width()),
        centered_offset(height, resized.height()),
    );
    canvas
}

fn centered_offset(canvas: u32, content: u32) -> i64 {
    if canvas >= content {
        i64::from((canvas - content) / 2)
    } else {
        -i64::from((content - canvas) / 2)
    }
}

/// Crops borders whose alpha is at or below `sensitivity`.
pub fn trim_transparent_border(image: DynamicImage, sensitivity: u8) -> (DynamicImage, Trim) {
    let rgba = image.to_rgba8();
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in rgba.enumerate_pixels() {
        if pixel[3] <= sensitivity {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    let Some((x0, y0, x1, y1)) = bounds else {
        return (image, Trim::FullyTransparent);
    };
    let (width, height) = (x1 - x0 + 1, y1 - y0 + 1);
    let from = (image.width(), image.height());
    if (width, height) == from {
        return (image, Trim::Unchanged);
    }
    (image.crop_imm(x0, y0, width, height), Trim::Cropped { from })
}

/// Palette-reduced image: RGBA palette entries and one index per pixel.
struct Paletted {
    width: u32,
    height: u32,
    palette: Vec<u8>,
    indices: Vec<u8>,
}

fn quantize(canvas: &RgbaImage, colors: usize) -> Option<Paletted> {
    if u64::from(canvas.width()) * u64::from(canvas.height()) < MIN_QUANTIZE_PIXELS {
        return None;
    }
    let quant = NeuQuant::new(10, colors, canvas.as_raw());
    let indices = canvas
        .pixels()
        .map(|pixel| quant.index_of(&pixel.0) as u8)
        .collect();
    Some(Paletted {
        width: canvas.width(),
        height: canvas.height(),
        palette: quant.color_map_rgba(),
        indices,
    })
}

/// Writes a color-type 3 PNG with a tRNS chunk carrying the palette alpha.
fn encode_indexed(paletted: &Paletted) -> Result<Rendered, CanvasError> {
    let (rgb, alpha): (Vec<[u8; 3]>, Vec<u8>) = paletted
        .palette
        .chunks_exact(4)
        .map(|entry| ([entry[0], entry[1], entry[2]], entry[3]))
        .unzip();
    let png_error = |e: png::EncodingError| CanvasError::Encode(format!("png: {}", e));

    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, paletted.width, paletted.height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::High);
        encoder.set_palette(rgb.concat());
        encoder.set_trns(alpha);
        let mut writer = encoder.write_header().map_err(png_error)?;
        writer.write_image_data(&paletted.indices).map_err(png_error)?;
        writer.finish().map_err(png_error)?;
    }
    Ok(Rendered {
        bytes: buf,
        content_type: "image/png",
        width: paletted.width,
        height: paletted.height,
    })
}

fn palette_color_count(image: &DynamicImage) -> usize {
    let mut seen = HashSet::new();
    for pixel in image.to_rgba8().pixels() {
        seen.insert(pixel.0);
        if seen.len() >= MAX_PALETTE_COLORS {
            break;
        }
    }
    seen.len()
}

fn png_is_indexed(bytes: &[u8]) -> bool {
    const SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
    const PALETTE_COLOR_TYPE: u8 = 3;
    bytes.len() > 25
        && bytes.starts_with(SIGNATURE)
        && &bytes[12..16] == b"IHDR"
        && bytes[25] == PALETTE_COLOR_TYPE
}

fn encode(image: &DynamicImage, format: OutputFormat) -> Result<Rendered, CanvasError> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilterType::Adaptive);
            image
                .write_with_encoder(encoder)
                .map_err(|e| CanvasError::Encode(e.to_string()))?;
        }
        OutputFormat::Jpeg { quality } => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            image
                .write_with_encoder(encoder)
                .map_err(|e| CanvasError::Encode(e.to_string()))?;
        }
        OutputFormat::WebP { quality, method } => {
            buf = encode_webp(image, quality, method)?;
        }
    }
    Ok(Rendered {
        bytes: buf,
        content_type: format.content_type(),
        width: image.width(),
        height: image.height(),
    })
}

fn encode_webp(image: &DynamicImage, quality: u8, method: u8) -> Result<Vec<u8>, CanvasError> {
    let rgba = image.to_rgba8();
    let encoder = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height());
    let mut config = webp::WebPConfig::new()
        .map_err(|_| CanvasError::Encode("failed to initialise webp config".into()))?;
    config.lossless = 0;
    config.quality = f32::from(quality);
    config.method = i32::from(method);
    let memory = encoder
        .encode_advanced(&config)
        .map_err(|e| CanvasError::Encode(format!("webp: {:?}", e)))?;
    Ok(memory.to_vec())
}

/// Orientation to apply, if any. Rotations that swap width and height are
/// skipped for images that are already at least as tall as they are wide.
fn orientation_to_apply(orientation: u16, width: u32, height: u32) -> Option<u16> {
    match orientation {
        5..=8 if height >= width => None,
        2..=8 => Some(orientation),
        _ => None,
    }
}

fn apply_orientation(image: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// The bytes rexif should parse: the whole file for JPEG, the TIFF block of
/// a PNG `eXIf` or WebP `EXIF` chunk otherwise.
fn exif_block(bytes: &[u8], format: ImageFormat) -> Option<&[u8]> {
    match format {
        ImageFormat::Jpeg => Some(bytes),
        ImageFormat::Png => png_chunk(bytes, b"eXIf"),
        ImageFormat::WebP => webp_chunk(bytes, b"EXIF")
            .map(|data| data.strip_prefix(b"Exif\0\0").unwrap_or(data)),
        _ => None,
    }
}

fn png_chunk<'a>(bytes: &'a [u8], name: &[u8; 4]) -> Option<&'a [u8]> {
    let mut pos = 8;
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().ok()?) as usize;
        let kind = &bytes[pos + 4..pos + 8];
        let data = bytes.get(pos + 8..pos + 8 + len)?;
        if kind == name {
            return Some(data);
        }
        if kind == b"IDAT" || kind == b"IEND" {
            return None;
        }
        pos += 12 + len;
    }
    None
}

fn webp_chunk<'a>(bytes: &'a [u8], name: &[u8; 4]) -> Option<&'a [u8]> {
    if bytes.len() < 12 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return None;
    }
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let kind = &bytes[pos..pos + 4];
        let len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().ok()?) as usize;
        let data = bytes.get(pos + 8..pos + 8 + len)?;
        if kind == name {
            return Some(data);
        }
        pos += 8 + len + (len & 1);
    }
    None
}

fn exif_orientation(exif: &ExifData) -> Option<u16> {
    exif.entries
        .iter()
        .find(|entry| entry.tag == ExifTag::Orientation)
        .and_then(|entry| tag_value_to_u16(&entry.value))
}

fn tag_value_to_u16(value: &TagValue) -> Option<u16> {
    match value {
        TagValue::U16(values) => values.first().copied(),
        TagValue::U8(values) => values.first().copied().map(u16::from),
        TagValue::U32(values) => values
            .first()
            .copied()
            .map(|v| v.min(u16::MAX as u32) as u16),
        TagValue::I16(values) => values
            .first()
            .copied()
            .map(|v| if v < 0 { 0 } else { v as u16 }),
        TagValue::I32(values) => values
            .first()
            .copied()
            .map(|v| if v < 0 { 0 } else { v as u16 }),
        _ => None,
    }
}

/// Rejects payloads the server labelled as something other than an image,
/// such as an HTML error page. Untyped binary is left to the decoder.
pub fn ensure_image_content_type(content_type: &str) -> Result<(), CanvasError> {
    let ct = content_type.trim().to_ascii_lowercase();
    if ct.starts_with("image/") || ct.starts_with("application/octet-stream") {
        Ok(())
    } else {
        Err(CanvasError::UnsupportedContentType(content_type.to_string()))
    }
}

pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("png") {
        Some("png")
    } else if ct.contains("jpeg") || ct.contains("jpg") {
        Some("jpg")
    } else if ct.contains("webp") {
        Some("webp")
    } else if ct.contains("gif") {
        Some("gif")
    } else {
        None
    }
}

pub fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}
