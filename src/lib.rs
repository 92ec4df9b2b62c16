#![deny(clippy::all)]

pub mod ad_grouping;
#[cfg(feature = "node")]
mod node;

pub use ad_grouping::cache::HashCache;
pub use ad_grouping::compare::{MatchTier, SimilarityComparator, Verdict};
pub use ad_grouping::config::{GroupingConfig, GroupingMode};
pub use ad_grouping::error::{ConfigError, FetchError};
pub use ad_grouping::fetch::{HttpMediaFetcher, MediaFetcher, MediaMetadata};
pub use ad_grouping::grouping::{AdSetGrouper, Placement, group_ads, precompute_and_group};
pub use ad_grouping::hash::{ImageHash, PerceptualHasher};
pub use ad_grouping::precompute::{ParallelPrecomputeScheduler, PrecomputeReport};
pub use ad_grouping::{Ad, AdSet, Assignment, MediaHash, MediaKind};
