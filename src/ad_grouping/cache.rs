use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::MediaHash;
use super::hash::ImageHash;

/// Concurrent URL -> hash store shared by precompute workers.
///
/// Entries are write-once: the first value stored for a URL is kept. Two
/// workers racing on the same URL hash the same remote bytes, so dropping
/// the second value loses nothing.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: DashMap<String, MediaHash>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<MediaHash> {
        self.entries.get(url).map(|entry| entry.value().clone())
    }

    /// Image hash for `url`, if one was stored as an image
    pub fn image_hash(&self, url: &str) -> Option<ImageHash> {
        match self.entries.get(url)?.value() {
            MediaHash::Image(hash) => Some(*hash),
            MediaHash::Video(_) => None,
        }
    }

    /// Sampled frame hashes for `url`, if one was stored as a video
    pub fn video_hashes(&self, url: &str) -> Option<Arc<[ImageHash]>> {
        match self.entries.get(url)?.value() {
            MediaHash::Video(hashes) => Some(Arc::clone(hashes)),
            MediaHash::Image(_) => None,
        }
    }

    /// Returns true if the value was stored
    pub fn put_if_absent(&self, url: &str, value: MediaHash) -> bool {
        match self.entries.entry(url.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
