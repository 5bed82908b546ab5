use crate::format::OutputFormat;
use crate::transform::Fit;
use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::{WebPDecoder, WebPEncoder};
use image::imageops::FilterType;
use image::{
    AnimationDecoder, DynamicImage, ExtendedColorType, Frame, ImageDecoder, ImageEncoder,
    ImageFormat, ImageReader, Rgb, RgbImage, Rgba, RgbaImage,
};
use std::io::Cursor;

pub const DEFAULT_QUALITY: u8 = 80;
const AVIF_SPEED: u8 = 8;
const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("jpeg source is truncated")]
    Truncated,
    #[error("image of {width}x{height} exceeds the pixel limit")]
    TooLarge { width: u32, height: u32 },
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),
    #[error("codec task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct CodecRequest {
    /// Format suggested by the URL or the origin's content type; only used
    /// when the bytes themselves are not recognizable.
    pub source_format: Option<OutputFormat>,
    pub target: OutputFormat,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Fit,
    pub position: String,
    pub quality: Option<u8>,
}

/// Pixel decode, resize and encode.
#[async_trait]
pub trait ImageCodec: Send + Sync {
    async fn transform(&self, source: Bytes, request: CodecRequest) -> Result<Bytes, CodecError>;
}

pub struct RasterCodec {
    max_pixels: u64,
}

impl RasterCodec {
    pub fn new(max_pixels: u64) -> Self {
        Self { max_pixels }
    }
}

#[async_trait]
impl ImageCodec for RasterCodec {
    async fn transform(&self, source: Bytes, request: CodecRequest) -> Result<Bytes, CodecError> {
        let max_pixels = self.max_pixels;
        tokio::task::spawn_blocking(move || transform_blocking(&source, &request, max_pixels))
            .await
            .map_err(|err| CodecError::Task(err.to_string()))?
    }
}

fn transform_blocking(
    source: &[u8],
    request: &CodecRequest,
    max_pixels: u64,
) -> Result<Bytes, CodecError> {
    let detected = image::guess_format(source).ok();
    let is_jpeg = match detected {
        Some(format) => format == ImageFormat::Jpeg,
        None => request.source_format == Some(OutputFormat::Jpeg),
    };
    if is_jpeg && is_truncated_jpeg(source) {
        return Err(CodecError::Truncated);
    }

    let geometry = Geometry {
        width: request.width,
        height: request.height,
        fit: request.fit,
        anchor: Anchor::parse(&request.position),
        max_pixels,
    };

    if request.target == OutputFormat::Gif {
        if let Some(frames) = decode_animation(source, detected, max_pixels)? {
            let frames = frames
                .into_iter()
                .map(|frame| {
                    let delay = frame.delay();
                    let image = geometry.apply(DynamicImage::ImageRgba8(frame.into_buffer()))?;
                    Ok(Frame::from_parts(image.to_rgba8(), 0, 0, delay))
                })
                .collect::<Result<Vec<_>, CodecError>>()?;
            return encode_gif(frames).map(Bytes::from);
        }
    }

    let image = decode_still(source, detected, request.source_format, max_pixels)?;
    let image = geometry.apply(image)?;
    encode_still(&image, request.target, request.quality).map(Bytes::from)
}

/// A JPEG without its end-of-image marker was cut off in transit.
fn is_truncated_jpeg(bytes: &[u8]) -> bool {
    let end = bytes
        .iter()
        .rposition(|byte| *byte != 0 && !byte.is_ascii_whitespace())
        .map(|index| index + 1)
        .unwrap_or(0);
    !bytes[..end].ends_with(&[0xFF, 0xD9])
}

fn decode_animation(
    source: &[u8],
    detected: Option<ImageFormat>,
    max_pixels: u64,
) -> Result<Option<Vec<Frame>>, CodecError> {
    let frames = match detected {
        Some(ImageFormat::Gif) => {
            let mut decoder = GifDecoder::new(Cursor::new(source)).map_err(decode_error)?;
            decoder
                .set_limits(raster_limits(max_pixels))
                .map_err(decode_error)?;
            check_pixels(decoder.dimensions(), max_pixels)?;
            decoder.into_frames().collect_frames()
        }
        Some(ImageFormat::WebP) => {
            let mut decoder = WebPDecoder::new(Cursor::new(source)).map_err(decode_error)?;
            if !decoder.has_animation() {
                return Ok(None);
            }
            decoder
                .set_limits(raster_limits(max_pixels))
                .map_err(decode_error)?;
            check_pixels(decoder.dimensions(), max_pixels)?;
            decoder.into_frames().collect_frames()
        }
        _ => return Ok(None),
    };
    frames.map(Some).map_err(decode_error)
}

fn decode_still(
    source: &[u8],
    detected: Option<ImageFormat>,
    hint: Option<OutputFormat>,
    max_pixels: u64,
) -> Result<DynamicImage, CodecError> {
    let format = detected
        .or_else(|| hint.map(image_format))
        .ok_or_else(|| CodecError::UnsupportedFormat("unrecognized image data".to_string()))?;
    let mut reader = ImageReader::new(Cursor::new(source));
    reader.set_format(format);
    reader.limits(raster_limits(max_pixels));
    let image = reader.decode().map_err(decode_error)?;
    check_pixels((image.width(), image.height()), max_pixels)?;
    Ok(image)
}

fn raster_limits(max_pixels: u64) -> image::Limits {
    let max_dim = max_pixels.min(u32::MAX as u64) as u32;
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(max_dim);
    limits.max_image_height = Some(max_dim);
    limits.max_alloc = Some(max_pixels.saturating_mul(4));
    limits
}

fn check_pixels((width, height): (u32, u32), max_pixels: u64) -> Result<(), CodecError> {
    if (width as u64).saturating_mul(height as u64) > max_pixels {
        return Err(CodecError::TooLarge { width, height });
    }
    Ok(())
}

fn image_format(format: OutputFormat) -> ImageFormat {
    match format {
        OutputFormat::Png => ImageFormat::Png,
        OutputFormat::Jpeg => ImageFormat::Jpeg,
        OutputFormat::Gif => ImageFormat::Gif,
        OutputFormat::Webp => ImageFormat::WebP,
        OutputFormat::Avif => ImageFormat::Avif,
    }
}

fn decode_error(err: image::ImageError) -> CodecError {
    CodecError::Decode(err.to_string())
}

fn encode_error(err: image::ImageError) -> CodecError {
    CodecError::Encode(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Start,
    Center,
    End,
}

impl Align {
    fn offset(self, extra: u32) -> u32 {
        match self {
            Self::Start => 0,
            Self::Center => extra / 2,
            Self::End => extra,
        }
    }
}

/// Where the kept region sits when cropping (cover) or where the image sits
/// on the canvas when padding (contain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    horizontal: Align,
    vertical: Align,
}

impl Anchor {
    const CENTER: Self = Self {
        horizontal: Align::Center,
        vertical: Align::Center,
    };

    fn parse(position: &str) -> Self {
        let position = position.trim().to_ascii_lowercase();
        let (horizontal, vertical) = match position.as_str() {
            "north" => (Align::Center, Align::Start),
            "northeast" => (Align::End, Align::Start),
            "east" => (Align::End, Align::Center),
            "southeast" => (Align::End, Align::End),
            "south" => (Align::Center, Align::End),
            "southwest" => (Align::Start, Align::End),
            "west" => (Align::Start, Align::Center),
            "northwest" => (Align::Start, Align::Start),
            words => {
                let mut anchor = Self::CENTER;
                for word in words.split(|ch: char| ch.is_whitespace() || ch == '-' || ch == '_') {
                    match word {
                        "left" => anchor.horizontal = Align::Start,
                        "right" => anchor.horizontal = Align::End,
                        "top" => anchor.vertical = Align::Start,
                        "bottom" => anchor.vertical = Align::End,
                        _ => {}
                    }
                }
                return anchor;
            }
        };
        Self {
            horizontal,
            vertical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Keep,
    Crop(u32, u32),
    Pad(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResizePlan {
    scaled: (u32, u32),
    finish: Finish,
}

/// Works out the resize for a source of `source` pixels. A single requested
/// dimension keeps the aspect ratio whatever the fit mode.
fn plan_resize(
    source: (u32, u32),
    width: Option<u32>,
    height: Option<u32>,
    fit: Fit,
) -> Option<ResizePlan> {
    let source_w = source.0.max(1) as f64;
    let source_h = source.1.max(1) as f64;
    let keep = |scaled| ResizePlan {
        scaled,
        finish: Finish::Keep,
    };
    let (target_w, target_h) = match (width, height) {
        (None, None) => return None,
        (Some(w), None) => return Some(keep((w, scale_dim(source_h, w as f64 / source_w)))),
        (None, Some(h)) => return Some(keep((scale_dim(source_w, h as f64 / source_h), h))),
        (Some(w), Some(h)) => (w, h),
    };
    let width_ratio = target_w as f64 / source_w;
    let height_ratio = target_h as f64 / source_h;
    let inside = if width_ratio <= height_ratio {
        (target_w, scale_dim(source_h, width_ratio))
    } else {
        (scale_dim(source_w, height_ratio), target_h)
    };
    let outside = if width_ratio >= height_ratio {
        (target_w, scale_dim(source_h, width_ratio))
    } else {
        (scale_dim(source_w, height_ratio), target_h)
    };
    Some(match fit {
        Fit::Fill => keep((target_w, target_h)),
        Fit::Inside => keep(inside),
        Fit::Outside => keep(outside),
        Fit::Cover => ResizePlan {
            scaled: outside,
            finish: Finish::Crop(target_w, target_h),
        },
        Fit::Contain => ResizePlan {
            scaled: inside,
            finish: Finish::Pad(target_w, target_h),
        },
    })
}

fn scale_dim(length: f64, ratio: f64) -> u32 {
    ((length * ratio).round() as u32).max(1)
}

struct Geometry {
    width: Option<u32>,
    height: Option<u32>,
    fit: Fit,
    anchor: Anchor,
    max_pixels: u64,
}

impl Geometry {
    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, CodecError> {
        let Some(plan) = plan_resize(
            (image.width(), image.height()),
            self.width,
            self.height,
            self.fit,
        ) else {
            return Ok(image);
        };
        check_pixels(plan.scaled, self.max_pixels)?;
        let (scaled_w, scaled_h) = plan.scaled;
        let resized = if (scaled_w, scaled_h) == (image.width(), image.height()) {
            image
        } else {
            image.resize_exact(scaled_w, scaled_h, RESIZE_FILTER)
        };
        Ok(match plan.finish {
            Finish::Keep => resized,
            Finish::Crop(width, height) => {
                let width = width.min(scaled_w);
                let height = height.min(scaled_h);
                let x = self.anchor.horizontal.offset(scaled_w - width);
                let y = self.anchor.vertical.offset(scaled_h - height);
                resized.crop_imm(x, y, width, height)
            }
            Finish::Pad(width, height) => {
                check_pixels((width, height), self.max_pixels)?;
                let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
                let x = self.anchor.horizontal.offset(width.saturating_sub(scaled_w));
                let y = self.anchor.vertical.offset(height.saturating_sub(scaled_h));
                image::imageops::overlay(&mut canvas, &resized.to_rgba8(), x as i64, y as i64);
                DynamicImage::ImageRgba8(canvas)
            }
        })
    }
}

fn encode_still(
    image: &DynamicImage,
    format: OutputFormat,
    quality: Option<u8>,
) -> Result<Vec<u8>, CodecError> {
    let quality = quality.unwrap_or(DEFAULT_QUALITY);
    let mut bytes = Vec::new();
    match format {
        OutputFormat::Png => {
            image
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .map_err(encode_error)?;
        }
        OutputFormat::Jpeg => {
            let rgb = flatten_onto_white(image);
            let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
            encoder
                .encode(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ExtendedColorType::Rgb8,
                )
                .map_err(encode_error)?;
        }
        OutputFormat::Webp => {
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut bytes)
                .encode(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .map_err(encode_error)?;
        }
        OutputFormat::Avif => {
            let rgba = image.to_rgba8();
            AvifEncoder::new_with_speed_quality(&mut bytes, AVIF_SPEED, quality)
                .write_image(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .map_err(encode_error)?;
        }
        OutputFormat::Gif => return encode_gif(vec![Frame::new(image.to_rgba8())]),
    }
    Ok(bytes)
}

fn encode_gif(frames: Vec<Frame>) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut bytes);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(encode_error)?;
        encoder.encode_frames(frames).map_err(encode_error)?;
    }
    Ok(bytes)
}

/// JPEG has no alpha channel; composite transparent areas over white.
fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let alpha = a as u16;
        let blend = |channel: u8| ((channel as u16 * alpha + 255 * (255 - alpha)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}
