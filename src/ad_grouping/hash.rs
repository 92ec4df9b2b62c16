use anyhow::{Context, Result};
use image::DynamicImage;
use img_hash::{HashAlg, HasherConfig, image as img_hash_image};
use serde::{Deserialize, Serialize};

/// Grid edge used for the average hash (8x8 = 64 bits)
pub const HASH_GRID: u32 = 8;

/// 64-bit average hash of one image or frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageHash(pub u64);

impl ImageHash {
    /// Hamming distance (number of differing bits)
    pub fn distance(&self, other: &ImageHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

/// Average-hash computation over decoded pixels.
///
/// `img_hash` still links against image 0.23, so frames decoded with the
/// newer `image` crate are handed over as raw RGBA buffers.
#[derive(Debug, Clone, Copy)]
pub struct PerceptualHasher {
    filter: img_hash_image::imageops::FilterType,
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self {
            filter: img_hash_image::imageops::FilterType::Triangle,
        }
    }
}

impl PerceptualHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash_image(&self, img: &DynamicImage) -> Result<ImageHash> {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            anyhow::bail!("Cannot hash an empty image ({}x{})", width, height);
        }

        let buffer = img_hash_image::RgbaImage::from_raw(width, height, rgba.into_raw())
            .context("Failed to create image buffer for hashing")?;
        let dynamic_img = img_hash_image::DynamicImage::ImageRgba8(buffer);

        // The hasher is not Sync, so each call builds its own.
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Mean)
            .hash_size(HASH_GRID, HASH_GRID)
            .resize_filter(self.filter)
            .to_hasher();

        let hash = hasher.hash_image(&dynamic_img);
        let bytes: [u8; 8] = hash
            .as_bytes()
            .try_into()
            .context("Average hash is not 64 bits wide")?;

        Ok(ImageHash(u64::from_be_bytes(bytes)))
    }

    /// Hashes each sampled frame in order. Frames that fail to hash are
    /// dropped, so the result can be shorter than the input.
    pub fn hash_video_samples(&self, frames: &[DynamicImage]) -> Vec<ImageHash> {
        frames
            .iter()
            .enumerate()
            .filter_map(|(index, frame)| match self.hash_image(frame) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    log::warn!("Skipping frame {}: {:#}", index, e);
                    None
                }
            })
            .collect()
    }
}
