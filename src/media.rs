//! Attachment mirroring: download, transcode to WebP, upload, describe.
//!
//! The pipeline is stateless. A failed attachment is logged and skipped; the
//! enclosing post is persisted without it. Object keys are content-addressed
//! (`YYYY/MM/<hash16>.webp`) so re-processing the same bytes lands on the
//! same key and reruns keep stable URLs.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use futures_util::StreamExt;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::MIRROR_USER_AGENT;
use crate::platform::Attachment;

/// Attachment extensions the pipeline accepts (query string ignored).
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg"];

/// WebP re-encode quality.
const WEBP_QUALITY: f32 = 85.0;

/// Blob storage the pipeline uploads into.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a blob under `key` with immutable-cache headers.
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        original_filename: &str,
    ) -> Result<()>;

    /// Public URL for a stored key.
    fn public_url(&self, key: &str) -> String;
}

/// One successfully mirrored image.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// Output of the CPU-side transcode step.
#[derive(Debug)]
pub struct Transcoded {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Download → transform → upload pipeline for post attachments.
pub struct MediaPipeline {
    http: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    max_bytes: u64,
    max_w: u32,
    max_h: u32,
}

impl MediaPipeline {
    /// Build a pipeline over the given store.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(store: Arc<dyn ObjectStore>, max_mb: u64, max_w: u32, max_h: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to build media HTTP client")?;
        Ok(Self {
            http,
            store,
            max_bytes: max_mb * 1024 * 1024,
            max_w,
            max_h,
        })
    }

    /// Mirror a message's attachments, skipping any that fail.
    ///
    /// Cancellation is abort-and-skip: remaining attachments are dropped and
    /// whatever already uploaded is returned.
    pub async fn process_attachments(
        &self,
        attachments: &[Attachment],
        cancel: &CancellationToken,
    ) -> Vec<ProcessedImage> {
        let mut processed = Vec::new();
        for attachment in attachments {
            if cancel.is_cancelled() {
                debug!("Cancellation requested, skipping remaining attachments");
                break;
            }
            match self.process_one(attachment).await {
                Ok(img) => processed.push(img),
                Err(e) => {
                    warn!(url = %attachment.url, "Failed to mirror attachment: {e:#}");
                }
            }
        }
        processed
    }

    async fn process_one(&self, attachment: &Attachment) -> Result<ProcessedImage> {
        let Some(ext) = allowed_extension(&attachment.url) else {
            bail!("unsupported attachment extension: {}", attachment.url);
        };
        debug!(url = %attachment.url, ext = %ext, "Downloading attachment");

        let bytes = self.download_bounded(&attachment.url).await?;

        let (max_w, max_h) = (self.max_w, self.max_h);
        let transcoded = spawn_blocking(move || transcode(&bytes, max_w, max_h))
            .await
            .context("Transcode task panicked")??;

        let key = object_key(&transcoded.bytes, Utc::now());
        self.store
            .put_object(&key, &transcoded.bytes, "image/webp", &attachment.filename)
            .await
            .with_context(|| format!("Failed to upload {key}"))?;

        Ok(ProcessedImage {
            url: self.store.public_url(&key),
            width: transcoded.width,
            height: transcoded.height,
            size_bytes: transcoded.bytes.len() as u64,
        })
    }

    async fn download_bounded(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .header("User-Agent", MIRROR_USER_AGENT)
            .send()
            .await
            .context("Failed to fetch attachment")?;

        if !response.status().is_success() {
            bail!("attachment fetch returned HTTP {}", response.status());
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                bail!("attachment is {len} bytes, over the {} byte cap", self.max_bytes);
            }
        }

        // Content-Length can lie or be absent; enforce the cap on the stream.
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed while streaming attachment")?;
            if bytes.len() as u64 + chunk.len() as u64 > self.max_bytes {
                bail!("attachment exceeded the {} byte cap mid-stream", self.max_bytes);
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

/// Extension of a URL's path if the pipeline accepts it, query string ignored.
#[must_use]
pub fn allowed_extension(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let path = parsed.path();
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    if path.contains('.') && ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Some(ext)
    } else {
        None
    }
}

/// Decode, auto-rotate, bound, and re-encode an image as WebP.
///
/// All metadata is dropped by the decode/re-encode round trip. Images already
/// inside the bounding box are not enlarged.
pub fn transcode(bytes: &[u8], max_w: u32, max_h: u32) -> Result<Transcoded> {
    let orientation = exif_orientation(bytes);

    let mut img = image::load_from_memory(bytes).context("Failed to decode image")?;
    img = apply_orientation(img, orientation);

    if img.width() > max_w || img.height() > max_h {
        img = img.resize(max_w, max_h, image::imageops::FilterType::Triangle);
    }

    let (width, height) = (img.width(), img.height());
    // The WebP encoder only accepts 8-bit RGB/RGBA buffers.
    let img = DynamicImage::ImageRgba8(img.to_rgba8());
    let encoder = webp::Encoder::from_image(&img)
        .map_err(|reason| anyhow::anyhow!("WebP encoding rejected image: {reason}"))?;
    let bytes = encoder.encode(WEBP_QUALITY).to_vec();

    Ok(Transcoded {
        bytes,
        width,
        height,
    })
}

/// EXIF orientation value (1-8), defaulting to 1 when absent or unreadable.
fn exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|data| {
            data.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1)
}

/// Rotate/flip per the EXIF orientation spec.
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.fliph().rotate270(),
        6 => img.rotate90(),
        7 => img.fliph().rotate90(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Content-addressed object key: `YYYY/MM/<sha256(content)[:16]>.webp`.
#[must_use]
pub fn object_key(content: &[u8], now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hex::encode(hasher.finalize());
    format!("{}/{:02}/{}.webp", now.year(), now.month(), &digest[..16])
}
