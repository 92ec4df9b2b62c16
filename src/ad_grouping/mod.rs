pub mod cache;
pub mod compare;
pub mod config;
pub mod error;
pub mod fetch;
pub mod grouping;
pub mod hash;
pub mod precompute;
#[cfg(feature = "ffmpeg")]
pub mod video;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use hash::ImageHash;

/// Creative format reported by the ad library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Carousel,
    #[default]
    #[serde(other)]
    Unknown,
}

impl From<&str> for MediaKind {
    fn from(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "image" => MediaKind::Image,
            "video" => MediaKind::Video,
            "carousel" => MediaKind::Carousel,
            _ => MediaKind::Unknown,
        }
    }
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Carousel => "carousel",
            MediaKind::Unknown => "unknown",
        }
    }
}

/// Scraped ad creative, as handed over by ingestion.
///
/// `image_urls[0]` doubles as the video thumbnail. For `video_urls` the
/// scraper puts the high-quality rendition at index 0 and the low-quality
/// rendition (the one we sample frames from) at index 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ad {
    pub id: String,
    #[serde(default)]
    pub media_kind: MediaKind,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub video_urls: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn non_empty(url: Option<&String>) -> Option<&str> {
    url.map(|u| u.trim()).filter(|u| !u.is_empty())
}

impl Ad {
    /// Single-image ad
    pub fn image(id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: id.into(),
            media_kind: MediaKind::Image,
            media_url: Some(url.clone()),
            image_urls: vec![url],
            video_urls: Vec::new(),
            title: None,
            body: None,
        }
    }

    /// Video ad with its thumbnail and both renditions
    pub fn video(
        id: impl Into<String>,
        hq_url: impl Into<String>,
        thumbnail_url: Option<&str>,
        sd_url: Option<&str>,
    ) -> Self {
        let hq_url = hq_url.into();
        let mut video_urls = vec![hq_url.clone()];
        video_urls.extend(sd_url.map(str::to_string));
        Self {
            id: id.into(),
            media_kind: MediaKind::Video,
            media_url: Some(hq_url),
            image_urls: thumbnail_url.map(str::to_string).into_iter().collect(),
            video_urls,
            title: None,
            body: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// URL compared and hashed for image-like creatives
    pub fn primary_image_url(&self) -> Option<&str> {
        non_empty(self.media_url.as_ref()).or_else(|| non_empty(self.image_urls.first()))
    }

    pub fn thumbnail_url(&self) -> Option<&str> {
        non_empty(self.image_urls.first())
    }

    pub fn hq_video_url(&self) -> Option<&str> {
        non_empty(self.video_urls.first()).or_else(|| non_empty(self.media_url.as_ref()))
    }

    pub fn sd_video_url(&self) -> Option<&str> {
        non_empty(self.video_urls.get(1))
    }
}

/// Perceptual fingerprint of one media URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaHash {
    Image(ImageHash),
    /// One hash per sampled timestamp, in temporal order. May be empty.
    /// Shared so lookups during the pairwise pass do not copy the samples.
    Video(Arc<[ImageHash]>),
}

/// Ads considered the same creative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSet {
    pub id: String,
    pub name: String,
    pub representative_id: String,
    pub ad_ids: Vec<String>,
}

/// Row written back by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub ad_id: String,
    pub set_id: String,
    pub is_representative: bool,
}

impl AdSet {
    pub fn len(&self) -> usize {
        self.ad_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ad_ids.is_empty()
    }

    pub fn contains(&self, ad_id: &str) -> bool {
        self.ad_ids.iter().any(|id| id == ad_id)
    }

    pub fn assignments(&self) -> impl Iterator<Item = Assignment> + '_ {
        self.ad_ids.iter().map(move |ad_id| Assignment {
            ad_id: ad_id.clone(),
            set_id: self.id.clone(),
            is_representative: *ad_id == self.representative_id,
        })
    }
}
