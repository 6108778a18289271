use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{GenericImageView, ImageFormat, codecs::jpeg::JpegEncoder, imageops::FilterType};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::model::ImageRef;

/// Every normalized image is re-encoded to this format.
pub const NORMALIZED_MIME_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality, 1-100.
    pub quality: u8,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_width: 1024,
            max_height: 1024,
            quality: 85,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub original_size: usize,
    /// Output bytes divided by input bytes.
    pub compression_ratio: f64,
}

impl NormalizedImage {
    pub fn into_image_ref(self) -> ImageRef {
        ImageRef::Inline {
            mime_type: self.mime_type,
            data: self.data,
        }
    }
}

/// Result of [`normalize`]: either the re-encoded image or the untouched input.
#[derive(Debug, Clone)]
pub enum Normalized {
    Resized(NormalizedImage),
    Original(ImageRef),
}

impl Normalized {
    pub fn is_original(&self) -> bool {
        matches!(self, Normalized::Original(_))
    }

    pub fn into_image_ref(self) -> ImageRef {
        match self {
            Normalized::Resized(image) => image.into_image_ref(),
            Normalized::Original(image) => image,
        }
    }
}

/// Bounds and re-encodes an image before it is sent to the provider.
///
/// Never fails: if the source cannot be fetched, decoded or encoded the
/// original reference is handed back unchanged.
pub async fn normalize(http: &Client, image: ImageRef, options: NormalizeOptions) -> Normalized {
    let (mime_hint, bytes) = match &image {
        ImageRef::Inline { mime_type, data } => (Some(mime_type.clone()), data.clone()),
        ImageRef::Remote(url) => match fetch_image_bytes(http, url.as_str()).await {
            Ok((mime_type, bytes)) => (Some(mime_type), bytes),
            Err(err) => {
                warn!(error = %err, "normalize: fetch failed, using original reference");
                return Normalized::Original(image);
            }
        },
    };

    let transformed =
        tokio::task::spawn_blocking(move || normalize_bytes(&bytes, mime_hint.as_deref(), options))
            .await;
    match transformed {
        Ok(Ok(normalized)) => {
            info!(
                original_size = normalized.original_size,
                normalized_size = normalized.data.len(),
                original_dimensions = %format!("{}x{}", normalized.original_width, normalized.original_height),
                dimensions = %format!("{}x{}", normalized.width, normalized.height),
                compression_ratio = normalized.compression_ratio,
                "image normalized"
            );
            Normalized::Resized(normalized)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "normalize: transform failed, using original reference");
            Normalized::Original(image)
        }
        Err(err) => {
            warn!(error = %err, "normalize: worker failed, using original reference");
            Normalized::Original(image)
        }
    }
}

/// Decodes, downsamples (never upscales) and re-encodes to JPEG.
pub fn normalize_bytes(
    bytes: &[u8],
    mime_hint: Option<&str>,
    options: NormalizeOptions,
) -> Result<NormalizedImage> {
    if bytes.is_empty() {
        return Err(anyhow!("image is empty"));
    }
    let format = match detect_mime_type(bytes) {
        Some(mime_type) => mime_to_format(mime_type)?,
        None => mime_to_format(mime_hint.ok_or_else(|| anyhow!("unknown image type"))?)?,
    };
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|err| anyhow!("decode image failed: {err}"))?;
    let (original_width, original_height) = decoded.dimensions();
    let (width, height) = fit_dimensions(
        original_width,
        original_height,
        options.max_width,
        options.max_height,
    );
    let resized = if (width, height) == (original_width, original_height) {
        decoded
    } else {
        decoded.resize_exact(width, height, FilterType::Lanczos3)
    };

    let rgb = resized.to_rgb8();
    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, options.quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| anyhow!("encode jpeg failed: {err}"))?;

    let compression_ratio = output.len() as f64 / bytes.len() as f64;
    debug!(width, height, "normalized image encoded");
    Ok(NormalizedImage {
        mime_type: NORMALIZED_MIME_TYPE.to_string(),
        data: output,
        width,
        height,
        original_width,
        original_height,
        original_size: bytes.len(),
        compression_ratio,
    })
}

/// Largest size that fits in the bounds while keeping the aspect ratio.
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return (width, height);
    }
    let scale = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    );
    let scaled = |value: u32| ((f64::from(value) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

/// Splits `data:<mime>;base64,<payload>` into its mime type and bytes.
pub fn parse_data_uri(raw: &str) -> Result<(String, Vec<u8>)> {
    let rest = raw
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data uri"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data uri has no payload"))?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow!("only base64 data uris are supported"))?;
    let mime_type = if mime_type.is_empty() {
        "application/octet-stream"
    } else {
        mime_type
    };
    let data = STANDARD
        .decode(payload.trim())
        .context("decode data uri payload")?;
    Ok((mime_type.to_ascii_lowercase(), data))
}

pub fn to_data_uri(mime_type: &str, data: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(data))
}

/// Downloads an image and works out its mime type, preferring the bytes
/// over the `Content-Type` header.
pub async fn fetch_image_bytes(http: &Client, url: &str) -> Result<(String, Vec<u8>)> {
    let response = http.get(url).send().await.context("fetch image")?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("fetch image failed: HTTP {status}"));
    }
    let mime_from_header = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
    let bytes = response.bytes().await.context("read image bytes")?;
    let mime_type = detect_mime_type(bytes.as_ref())
        .map(str::to_string)
        .or(mime_from_header)
        .ok_or_else(|| anyhow!("unsupported image type"))?;
    Ok((mime_type, bytes.to_vec()))
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && bytes[8..12] == *b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn mime_to_format(mime_type: &str) -> Result<ImageFormat> {
    match mime_type {
        "image/png" => Ok(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Ok(ImageFormat::Jpeg),
        "image/gif" => Ok(ImageFormat::Gif),
        "image/webp" => Ok(ImageFormat::WebP),
        "image/bmp" => Ok(ImageFormat::Bmp),
        _ => Err(anyhow!("unsupported mime type: {mime_type}")),
    }
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    let mut output = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut std::io::Cursor::new(&mut output), ImageFormat::Png)
        .unwrap();
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_keeps_aspect_ratio_and_never_upscales() {
        assert_eq!(fit_dimensions(4000, 2000, 1024, 1024), (1024, 512));
        assert_eq!(fit_dimensions(1000, 3000, 1024, 1024), (341, 1024));
        assert_eq!(fit_dimensions(300, 200, 1024, 1024), (300, 200));
        assert_eq!(fit_dimensions(5000, 1, 100, 100), (100, 1));
    }

    #[test]
    fn large_png_is_downscaled_to_jpeg() {
        let png = sample_png(400, 200);
        let options = NormalizeOptions {
            max_width: 100,
            max_height: 100,
            quality: 80,
        };
        let normalized = normalize_bytes(&png, None, options).unwrap();
        assert_eq!(normalized.mime_type, "image/jpeg");
        assert_eq!((normalized.width, normalized.height), (100, 50));
        assert_eq!((normalized.original_width, normalized.original_height), (400, 200));
        assert_eq!(detect_mime_type(&normalized.data), Some("image/jpeg"));
        assert!(normalized.compression_ratio > 0.0);
    }

    #[test]
    fn corrupt_bytes_are_an_error() {
        let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(b"not really a png");
        assert!(normalize_bytes(&bytes, None, NormalizeOptions::default()).is_err());
        assert!(normalize_bytes(b"", Some("image/png"), NormalizeOptions::default()).is_err());
    }

    #[tokio::test]
    async fn normalize_falls_back_to_original_on_corrupt_input() {
        let original = ImageRef::inline("image/png", b"definitely not an image".to_vec());
        let result = normalize(&Client::new(), original.clone(), NormalizeOptions::default()).await;
        assert!(result.is_original());
        assert_eq!(result.into_image_ref(), original);
    }

    #[tokio::test]
    async fn normalize_reencodes_valid_inline_image() {
        let original = ImageRef::inline("image/png", sample_png(64, 32));
        let result = normalize(&Client::new(), original, NormalizeOptions::default()).await;
        match result {
            Normalized::Resized(image) => {
                assert_eq!((image.width, image.height), (64, 32));
                assert_eq!(image.mime_type, NORMALIZED_MIME_TYPE);
            }
            Normalized::Original(_) => panic!("expected a normalized image"),
        }
    }

    #[test]
    fn data_uri_round_trip() {
        let uri = to_data_uri("image/png", b"abc");
        let (mime_type, data) = parse_data_uri(&uri).unwrap();
        assert_eq!(mime_type, "image/png");
        assert_eq!(data, b"abc");
        assert!(parse_data_uri("data:image/png,abc").is_err());
        assert!(parse_data_uri("data:image/png;base64").is_err());
    }
}
