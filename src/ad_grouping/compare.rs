use serde::{Deserialize, Serialize};

use super::cache::HashCache;
use super::config::GroupingConfig;
use super::hash::ImageHash;
use super::{Ad, MediaKind};

/// Which stage of the cascade produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// Identical image URL
    Url,
    /// Image hashes within the cutoff
    ImageHash,
    /// Identical high-quality video URL
    VideoUrl,
    /// Video thumbnails within the cutoff
    Thumbnail,
    /// Sampled low-quality stream frames above the similarity threshold
    VideoStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_match: bool,
    /// 1.0 for exact or hash matches; the frame-match ratio for streams.
    /// On a non-match, the best ratio seen while cascading (0.0 if none).
    pub score: f64,
    pub tier: Option<MatchTier>,
}

impl Verdict {
    fn matched(tier: MatchTier, score: f64) -> Self {
        Self {
            is_match: true,
            score,
            tier: Some(tier),
        }
    }

    fn no_match(score: f64) -> Self {
        Self {
            is_match: false,
            score,
            tier: None,
        }
    }
}

/// Fraction of positions whose hashes are within `cutoff`, over the shorter
/// list. `None` when either list is empty.
pub fn positional_score(a: &[ImageHash], b: &[ImageHash], cutoff: u32) -> Option<f64> {
    let len = a.len().min(b.len());
    if len == 0 {
        return None;
    }
    let close = a
        .iter()
        .zip(b)
        .filter(|(x, y)| x.distance(y) <= cutoff)
        .count();
    Some(close as f64 / len as f64)
}

/// Pairwise same-creative decision. Reads only the hash cache, never the network.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityComparator<'a> {
    cache: &'a HashCache,
    image_hash_cutoff: u32,
    video_similarity_threshold: f64,
}

impl<'a> SimilarityComparator<'a> {
    pub fn new(cache: &'a HashCache, config: &GroupingConfig) -> Self {
        Self {
            cache,
            image_hash_cutoff: config.image_hash_cutoff,
            video_similarity_threshold: config.video_similarity_threshold,
        }
    }

    pub fn compare(&self, a: &Ad, b: &Ad) -> Verdict {
        if a.media_kind != b.media_kind {
            return Verdict::no_match(0.0);
        }

        match a.media_kind {
            MediaKind::Image | MediaKind::Carousel => self.compare_images(a, b),
            MediaKind::Video => self.compare_videos(a, b),
            MediaKind::Unknown => match (a.primary_image_url(), b.primary_image_url()) {
                (Some(x), Some(y)) if x == y => Verdict::matched(MatchTier::Url, 1.0),
                _ => Verdict::no_match(0.0),
            },
        }
    }

    pub fn is_similar(&self, a: &Ad, b: &Ad) -> bool {
        self.compare(a, b).is_match
    }

    /// Hash distance rule shared by images and thumbnails. Missing hashes fail closed.
    fn hashes_close(&self, url_a: &str, url_b: &str) -> bool {
        match (self.cache.image_hash(url_a), self.cache.image_hash(url_b)) {
            (Some(x), Some(y)) => x.distance(&y) <= self.image_hash_cutoff,
            _ => false,
        }
    }

    fn compare_images(&self, a: &Ad, b: &Ad) -> Verdict {
        let (Some(url_a), Some(url_b)) = (a.primary_image_url(), b.primary_image_url()) else {
            return Verdict::no_match(0.0);
        };

        if url_a == url_b {
            return Verdict::matched(MatchTier::Url, 1.0);
        }
        if self.hashes_close(url_a, url_b) {
            return Verdict::matched(MatchTier::ImageHash, 1.0);
        }
        Verdict::no_match(0.0)
    }

    fn compare_videos(&self, a: &Ad, b: &Ad) -> Verdict {
        if let (Some(x), Some(y)) = (a.hq_video_url(), b.hq_video_url()) {
            if x == y {
                return Verdict::matched(MatchTier::VideoUrl, 1.0);
            }
        }

        if let (Some(x), Some(y)) = (a.thumbnail_url(), b.thumbnail_url()) {
            if self.hashes_close(x, y) {
                return Verdict::matched(MatchTier::Thumbnail, 1.0);
            }
        }

        let (Some(x), Some(y)) = (a.sd_video_url(), b.sd_video_url()) else {
            return Verdict::no_match(0.0);
        };
        let (Some(hashes_a), Some(hashes_b)) =
            (self.cache.video_hashes(x), self.cache.video_hashes(y))
        else {
            return Verdict::no_match(0.0);
        };

        match positional_score(&hashes_a, &hashes_b, self.image_hash_cutoff) {
            Some(score) if score >= self.video_similarity_threshold => {
                Verdict::matched(MatchTier::VideoStream, score)
            }
            Some(score) => Verdict::no_match(score),
            None => Verdict::no_match(0.0),
        }
    }
}
