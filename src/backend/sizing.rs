//! Output-size resolution for image generation.
//!
//! When the caller asks for `"original"` sizing, the first attached image is
//! probed for its pixel dimensions and, if it is too small for the provider,
//! scaled up uniformly until it meets the minimum pixel count.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use base64::Engine;
use image::ImageReader;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Requested output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageSize {
    /// Match the first input image (scaled up to the provider minimum).
    Original,
    /// Explicit `WIDTHxHEIGHT`.
    Fixed { width: u32, height: u32 },
}

impl ImageSize {
    pub fn fixed(width: u32, height: u32) -> Self {
        ImageSize::Fixed { width, height }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSize::Original => f.write_str("original"),
            ImageSize::Fixed { width, height } => write!(f, "{}x{}", width, height),
        }
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("original") {
            return Ok(ImageSize::Original);
        }
        let (w, h) = s
            .split_once(['x', 'X', '*'])
            .ok_or_else(|| format!("invalid image size '{}', expected WIDTHxHEIGHT or original", s))?;
        let width = w.trim().parse::<u32>().map_err(|e| format!("invalid width '{}': {}", w, e))?;
        let height = h.trim().parse::<u32>().map_err(|e| format!("invalid height '{}': {}", h, e))?;
        if width == 0 || height == 0 {
            return Err(format!("image size '{}' has a zero dimension", s));
        }
        Ok(ImageSize::Fixed { width, height })
    }
}

impl TryFrom<String> for ImageSize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageSize> for String {
    fn from(size: ImageSize) -> Self {
        size.to_string()
    }
}

/// Sizing constants for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingPolicy {
    /// Smallest pixel count the provider accepts.
    pub min_pixels: u64,
    /// Size used when nothing can be probed.
    pub default_width: u32,
    pub default_height: u32,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            min_pixels: 921_600,
            default_width: 1024,
            default_height: 1024,
        }
    }
}

impl SizingPolicy {
    pub fn default_size(&self) -> (u32, u32) {
        (self.default_width, self.default_height)
    }

    /// Scale `(width, height)` uniformly so the area reaches `min_pixels`.
    ///
    /// Dimensions already at or above the minimum are returned unchanged.
    /// Both sides are rounded up, so the result never falls below the minimum.
    pub fn scale_to_minimum(&self, width: u32, height: u32) -> (u32, u32) {
        let actual = u64::from(width) * u64::from(height);
        if actual == 0 || actual >= self.min_pixels {
            return (width, height);
        }
        let factor = (self.min_pixels as f64 / actual as f64).sqrt();
        let scale = |side: u32| (f64::from(side) * factor).ceil() as u32;
        (scale(width), scale(height))
    }

    /// Decide the output size for one call.
    ///
    /// Only `Original` with at least one input image triggers a probe.
    pub async fn resolve(
        &self,
        requested: Option<ImageSize>,
        images: &[String],
        client: &Client,
        probe: &dyn DimensionProbe,
    ) -> (u32, u32) {
        match requested {
            Some(ImageSize::Fixed { width, height }) => (width, height),
            None => self.default_size(),
            Some(ImageSize::Original) => {
                let Some(first) = images.first() else {
                    return self.default_size();
                };
                match probe.dimensions(client, first).await {
                    Some((w, h)) if w > 0 && h > 0 => self.scale_to_minimum(w, h),
                    _ => self.default_size(),
                }
            }
        }
    }
}

/// Reads the pixel dimensions of an input image.
#[async_trait]
pub trait DimensionProbe: Send + Sync {
    /// `None` when the dimensions cannot be determined.
    async fn dimensions(&self, client: &Client, source: &str) -> Option<(u32, u32)>;
}

/// Probe that fetches `http(s)` URLs or decodes `data:` URIs, reading only
/// the image header.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProbe;

#[async_trait]
impl DimensionProbe for HttpProbe {
    async fn dimensions(&self, client: &Client, source: &str) -> Option<(u32, u32)> {
        match probe_source(client, source).await {
            Ok(dims) => {
                tracing::debug!(width = dims.0, height = dims.1, "Probed input image");
                Some(dims)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not read input image dimensions, using default size");
                None
            }
        }
    }
}

async fn probe_source(client: &Client, source: &str) -> anyhow::Result<(u32, u32)> {
    let bytes = if source.starts_with("data:") {
        decode_data_uri(source)?
    } else if source.starts_with("http://") || source.starts_with("https://") {
        let resp = client
            .get(source)
            .send()
            .await
            .context("fetching input image")?
            .error_for_status()
            .context("fetching input image")?;
        resp.bytes().await.context("reading input image")?.to_vec()
    } else {
        bail!("unsupported image source scheme");
    };
    header_dimensions(&bytes)
}

/// Decode the payload of a base64 `data:` URI.
fn decode_data_uri(uri: &str) -> anyhow::Result<Vec<u8>> {
    let (meta, payload) = uri
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .ok_or_else(|| anyhow!("malformed data URI"))?;
    if !meta.ends_with(";base64") {
        bail!("data URI is not base64 encoded");
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("decoding base64 image payload")
}

fn header_dimensions(bytes: &[u8]) -> anyhow::Result<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("guessing image format")?
        .into_dimensions()
        .context("reading image header")
}
