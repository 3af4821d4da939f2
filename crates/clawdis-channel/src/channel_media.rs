//! Media loading, sniffing, and recompression for outbound delivery.
//!
//! Sources are URLs or local paths. Mime detection prefers magic bytes, then
//! the declared header, then the file extension. Images are recompressed to
//! JPEG under the channel budget; GIFs pass through byte-for-byte.

use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use serde::Serialize;

pub const IMAGE_MAX_SIDE_PX: u32 = 2_048;
pub const DEFAULT_MEDIA_MAX_MB: u32 = 5;
pub const HARD_IMAGE_CAP_MB: u32 = 6;

const MB: u64 = 1024 * 1024;
const JPEG_QUALITY_LADDER: [u8; 4] = [85, 75, 65, 50];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MediaKind` values.
pub enum MediaKind {
    Image,
    Gif,
    Audio,
    Video,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Per-kind size ceilings, overridable per channel.
pub struct MediaLimits {
    pub image_max_bytes: u64,
    pub audio_video_max_bytes: u64,
    pub document_max_bytes: u64,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            image_max_bytes: HARD_IMAGE_CAP_MB as u64 * MB,
            audio_video_max_bytes: 16 * MB,
            document_max_bytes: 100 * MB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `PreparedMedia` used across Clawdis components.
pub struct PreparedMedia {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub kind: MediaKind,
    pub file_name: String,
}

/// Magic bytes → declared header → extension.
pub fn sniff_mime(bytes: &[u8], declared: Option<&str>, ext: Option<&str>) -> String {
    if let Some(mime) = sniff_magic(bytes) {
        return mime.to_string();
    }
    if let Some(declared) = declared.map(str::trim).filter(|value| value.contains('/')) {
        return declared.to_string();
    }
    mime_for_extension(ext.unwrap_or_default())
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn sniff_magic(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("image/png");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WAVE" {
        return Some("audio/wav");
    }
    if bytes.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    if bytes.starts_with(b"OggS") {
        return Some("audio/ogg");
    }
    if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        return Some("audio/mpeg");
    }
    if &bytes[4..8] == b"ftyp" {
        return Some("video/mp4");
    }
    None
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        "mp3" => Some("audio/mpeg"),
        "ogg" | "opus" => Some("audio/ogg"),
        "wav" => Some("audio/wav"),
        "m4a" => Some("audio/mp4"),
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "txt" => Some("text/plain"),
        "json" => Some("application/json"),
        _ => None,
    }
}

pub fn media_kind_for_mime(mime: &str) -> MediaKind {
    let lowered = mime.to_ascii_lowercase();
    if lowered == "image/gif" {
        MediaKind::Gif
    } else if lowered.starts_with("image/") {
        MediaKind::Image
    } else if lowered.starts_with("audio/") {
        MediaKind::Audio
    } else if lowered.starts_with("video/") {
        MediaKind::Video
    } else {
        MediaKind::Document
    }
}

fn source_file_name(source: &str) -> String {
    let trimmed = source.split(['?', '#']).next().unwrap_or(source);
    Path::new(trimmed)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

fn source_extension(source: &str) -> Option<String> {
    let name = source_file_name(source);
    Path::new(&name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_string)
}

/// Fetches or reads raw media bytes, enforcing `max_bytes`.
pub async fn load_media_bytes(
    source: &str,
    client: &reqwest::Client,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let bytes: Vec<u8> = if source.starts_with("http://") || source.starts_with("https://") {
        let response = client
            .get(source)
            .send()
            .await
            .with_context(|| format!("failed to fetch media {source}"))?;
        if !response.status().is_success() {
            bail!("media fetch {} returned {}", source, response.status());
        }
        response
            .bytes()
            .await
            .with_context(|| format!("failed to read media body {source}"))?
            .to_vec()
    } else {
        tokio::fs::read(source)
            .await
            .with_context(|| format!("failed to read media file {source}"))?
    };

    if bytes.len() as u64 > max_bytes {
        bail!(
            "media {} is {} bytes, above the {} byte limit",
            source,
            bytes.len(),
            max_bytes
        );
    }
    Ok(bytes)
}

/// Loads and normalizes one media source for sending.
pub async fn prepare_media(
    source: &str,
    declared_mime: Option<&str>,
    media_max_mb: u32,
    limits: MediaLimits,
    client: &reqwest::Client,
) -> Result<PreparedMedia> {
    let bytes = load_media_bytes(source, client, limits.document_max_bytes).await?;
    let mime = sniff_mime(&bytes, declared_mime, source_extension(source).as_deref());
    let kind = media_kind_for_mime(&mime);
    let file_name = source_file_name(source);

    match kind {
        MediaKind::Gif => Ok(PreparedMedia {
            bytes,
            mime: "image/gif".to_string(),
            kind,
            file_name,
        }),
        MediaKind::Image => {
            let target_bytes =
                u64::from(media_max_mb.clamp(1, HARD_IMAGE_CAP_MB)) * MB;
            let (bytes, mime) = recompress_image(bytes, mime, target_bytes)
                .with_context(|| format!("failed to prepare image {source}"))?;
            if bytes.len() as u64 > limits.image_max_bytes {
                bail!(
                    "image {} is {} bytes after compression, above the {} byte cap",
                    source,
                    bytes.len(),
                    limits.image_max_bytes
                );
            }
            Ok(PreparedMedia {
                bytes,
                mime,
                kind,
                file_name,
            })
        }
        MediaKind::Audio | MediaKind::Video => {
            if bytes.len() as u64 > limits.audio_video_max_bytes {
                bail!(
                    "media {} is {} bytes, above the {} byte audio/video limit",
                    source,
                    bytes.len(),
                    limits.audio_video_max_bytes
                );
            }
            Ok(PreparedMedia {
                bytes,
                mime,
                kind,
                file_name,
            })
        }
        MediaKind::Document => Ok(PreparedMedia {
            bytes,
            mime,
            kind,
            file_name,
        }),
    }
}

/// Re-encodes an image as JPEG under `target_bytes`, capping the longest side
/// at 2048 px. Images already within budget pass through untouched.
fn recompress_image(bytes: Vec<u8>, mime: String, target_bytes: u64) -> Result<(Vec<u8>, String)> {
    let decoded = image::load_from_memory(&bytes).context("failed to decode image")?;
    let max_side = decoded.width().max(decoded.height());
    let within_budget = bytes.len() as u64 <= target_bytes;
    if within_budget && max_side <= IMAGE_MAX_SIDE_PX {
        return Ok((bytes, mime));
    }

    let resized = if max_side > IMAGE_MAX_SIDE_PX {
        decoded.resize(IMAGE_MAX_SIDE_PX, IMAGE_MAX_SIDE_PX, FilterType::Triangle)
    } else {
        decoded
    };
    let rgb = image::DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut last = Vec::new();
    for quality in JPEG_QUALITY_LADDER {
        let mut out = Cursor::new(Vec::new());
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
            .context("failed to encode jpeg")?;
        last = out.into_inner();
        if last.len() as u64 <= target_bytes {
            return Ok((last, "image/jpeg".to_string()));
        }
    }
    if last.len() as u64 <= HARD_IMAGE_CAP_MB as u64 * MB {
        return Ok((last, "image/jpeg".to_string()));
    }
    bail!(
        "image is {} bytes even at the lowest jpeg quality",
        last.len()
    )
}
