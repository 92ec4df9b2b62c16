use napi::bindgen_prelude::*;
use napi_derive::napi;

use crate::ad_grouping::config::{GroupingConfig, GroupingMode};
use crate::ad_grouping::fetch::HttpMediaFetcher;
use crate::ad_grouping::grouping::precompute_and_group;
use crate::ad_grouping::{Ad, AdSet, MediaKind};

#[napi(object)]
#[derive(Debug, Clone)]
pub struct JsAd {
    pub id: String,
    pub media_kind: String,
    pub media_url: Option<String>,
    pub image_urls: Option<Vec<String>>,
    pub video_urls: Option<Vec<String>>,
    pub title: Option<String>,
    pub body: Option<String>,
}

#[napi(object)]
#[derive(Debug, Clone, Default)]
pub struct JsGroupingOptions {
    pub image_hash_cutoff: Option<u32>,
    pub video_similarity_threshold: Option<f64>,
    pub video_sample_count: Option<u32>,
    pub max_parallel_workers: Option<u32>,
    pub mode: Option<String>,
}

#[napi(object)]
#[derive(Debug, Clone)]
pub struct JsAdSet {
    pub id: String,
    pub name: String,
    pub representative_id: String,
    pub ad_ids: Vec<String>,
}

impl From<JsAd> for Ad {
    fn from(ad: JsAd) -> Self {
        Ad {
            id: ad.id,
            media_kind: MediaKind::from(ad.media_kind.as_str()),
            media_url: ad.media_url,
            image_urls: ad.image_urls.unwrap_or_default(),
            video_urls: ad.video_urls.unwrap_or_default(),
            title: ad.title,
            body: ad.body,
        }
    }
}

impl From<AdSet> for JsAdSet {
    fn from(set: AdSet) -> Self {
        JsAdSet {
            id: set.id,
            name: set.name,
            representative_id: set.representative_id,
            ad_ids: set.ad_ids,
        }
    }
}

fn to_config(options: JsGroupingOptions) -> Result<GroupingConfig> {
    let mut config = GroupingConfig::default();
    if let Some(cutoff) = options.image_hash_cutoff {
        config.image_hash_cutoff = cutoff;
    }
    if let Some(threshold) = options.video_similarity_threshold {
        config.video_similarity_threshold = threshold;
    }
    if let Some(samples) = options.video_sample_count {
        config.video_sample_count = samples as usize;
    }
    if let Some(workers) = options.max_parallel_workers {
        config.max_parallel_workers = workers as usize;
    }
    if let Some(mode) = options.mode {
        config.mode = mode.parse::<GroupingMode>().map_err(Error::from_reason)?;
    }
    config
        .validate()
        .map_err(|e| Error::from_reason(e.to_string()))?;
    Ok(config)
}

/// Download, hash and group a batch of scraped ads.
///
/// Blocks the calling thread for the duration of all media downloads.
#[napi]
pub fn group_ads(ads: Vec<JsAd>, options: Option<JsGroupingOptions>) -> Result<Vec<JsAdSet>> {
    let config = to_config(options.unwrap_or_default())?;
    let fetcher = HttpMediaFetcher::new(&config).map_err(|e| Error::from_reason(e.to_string()))?;
    let ads: Vec<Ad> = ads.into_iter().map(Ad::from).collect();

    let (sets, report) =
        precompute_and_group(&ads, &fetcher, &config).map_err(|e| Error::from_reason(e.to_string()))?;
    log::info!(
        "Grouped {} ads into {} sets ({} media failed)",
        ads.len(),
        sets.len(),
        report.failed.len()
    );

    Ok(sets.into_iter().map(JsAdSet::from).collect())
}
