use std::io::Read;
use std::time::Duration;

use image::DynamicImage;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, HeaderName};

use super::config::GroupingConfig;
use super::error::FetchError;

/// ETag and size reported by a HEAD request
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MediaMetadata {
    pub validator: Option<String>,
    pub length: Option<u64>,
}

impl MediaMetadata {
    /// Key identifying the remote bytes. Only a strong ETag qualifies: weak
    /// ETags and `Last-Modified` dates are shared by different bodies.
    pub fn content_key(&self) -> Option<(String, u64)> {
        let validator = self.validator.as_deref()?;
        if !validator.starts_with('"') || !validator.ends_with('"') || validator.len() < 3 {
            return None;
        }
        Some((validator.to_string(), self.length?))
    }
}

/// Turns media URLs into decoded pixels.
///
/// Implementations are shared by all precompute workers.
pub trait MediaFetcher: Send + Sync {
    /// Best-effort HEAD probe. Never fails; unknown fields are `None`.
    fn probe_metadata(&self, url: &str) -> MediaMetadata;

    fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError>;

    /// Up to `n_samples` frames at evenly spaced interior timestamps, in
    /// temporal order. Returns an empty list if the stream cannot be opened.
    fn sample_video_frames(&self, url: &str, n_samples: usize) -> Vec<DynamicImage>;
}

/// `MediaFetcher` over HTTP(S), with ffmpeg for video streams
#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    client: Client,
    probe_timeout: Duration,
    image_timeout: Duration,
    video_open_timeout: Duration,
    max_image_bytes: u64,
}

impl HttpMediaFetcher {
    pub fn new(config: &GroupingConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("adset-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self::with_client(client, config))
    }

    /// Reuse a preconfigured client (proxies, TLS roots, pooling)
    pub fn with_client(client: Client, config: &GroupingConfig) -> Self {
        Self {
            client,
            probe_timeout: config.probe_timeout(),
            image_timeout: config.image_timeout(),
            video_open_timeout: config.video_open_timeout(),
            max_image_bytes: config.max_image_bytes,
        }
    }
}

fn metadata_from_headers(headers: &HeaderMap) -> MediaMetadata {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    MediaMetadata {
        validator: header(ETAG),
        length: header(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
    }
}

impl MediaFetcher for HttpMediaFetcher {
    fn probe_metadata(&self, url: &str) -> MediaMetadata {
        let response = match self.client.head(url).timeout(self.probe_timeout).send() {
            Ok(response) => response,
            Err(e) => {
                log::debug!("HEAD {} failed: {}", url, e);
                return MediaMetadata::default();
            }
        };

        if !response.status().is_success() {
            log::debug!("HEAD {} answered {}", url, response.status());
            return MediaMetadata::default();
        }

        metadata_from_headers(response.headers())
    }

    fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.image_timeout)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let limit = self.max_image_bytes;
        if let Some(length) = metadata_from_headers(response.headers()).length {
            if length > limit {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit,
                });
            }
        }

        let mut bytes = Vec::new();
        response
            .take(limit + 1)
            .read_to_end(&mut bytes)
            .map_err(|source| FetchError::Body {
                url: url.to_string(),
                source,
            })?;
        if bytes.len() as u64 > limit {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit,
            });
        }

        image::load_from_memory(&bytes).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    #[cfg(feature = "ffmpeg")]
    fn sample_video_frames(&self, url: &str, n_samples: usize) -> Vec<DynamicImage> {
        match super::video::sample_frames(url, n_samples, self.video_open_timeout) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("Failed to sample video {}: {:#}", url, e);
                Vec::new()
            }
        }
    }

    #[cfg(not(feature = "ffmpeg"))]
    fn sample_video_frames(&self, url: &str, _n_samples: usize) -> Vec<DynamicImage> {
        log::warn!(
            "Built without the ffmpeg feature, cannot sample {} (open timeout {:?})",
            url,
            self.video_open_timeout
        );
        Vec::new()
    }
}
