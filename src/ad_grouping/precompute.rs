use std::collections::{HashMap, HashSet};
use std::sync::{Arc, mpsc};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::cache::HashCache;
use super::config::GroupingConfig;
use super::error::ConfigError;
use super::fetch::MediaFetcher;
use super::hash::{ImageHash, PerceptualHasher};
use super::{Ad, MediaHash, MediaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Image,
    Video,
}

/// Every unique (url, kind) the comparator may look up, in first-seen order
pub fn candidate_urls(ads: &[Ad]) -> Vec<(String, HashKind)> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    let mut push = |url: Option<&str>, kind: HashKind| {
        if let Some(url) = url {
            if seen.insert((url.to_string(), kind)) {
                candidates.push((url.to_string(), kind));
            }
        }
    };

    for ad in ads {
        match ad.media_kind {
            MediaKind::Image | MediaKind::Carousel => push(ad.primary_image_url(), HashKind::Image),
            MediaKind::Video => {
                push(ad.thumbnail_url(), HashKind::Image);
                push(ad.sd_video_url(), HashKind::Video);
            }
            MediaKind::Unknown => {}
        }
    }

    candidates
}

/// One unit of work. A video job may cover several URLs that serve the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HashJob {
    Image(String),
    Video(Vec<String>),
}

enum JobOutcome {
    Image { url: String, error: Option<String> },
    Video { urls: Vec<String>, samples: usize },
}

/// What a precompute run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecomputeReport {
    pub jobs: usize,
    pub already_cached: usize,
    pub images_hashed: usize,
    /// Stream URLs cached with at least one frame hash
    pub videos_hashed: usize,
    /// Stream URLs that piggybacked on another URL's sampling job
    pub coalesced_urls: usize,
    /// Videos with fewer usable samples than requested (possibly zero)
    pub partial_videos: Vec<String>,
    /// URLs left out of the cache, with the reason
    pub failed: Vec<(String, String)>,
}

impl PrecomputeReport {
    fn record(&mut self, outcome: JobOutcome, wanted_samples: usize) {
        match outcome {
            JobOutcome::Image { error: None, .. } => self.images_hashed += 1,
            JobOutcome::Image {
                url,
                error: Some(reason),
            } => self.failed.push((url, reason)),
            JobOutcome::Video { urls, samples } => {
                if samples > 0 {
                    self.videos_hashed += urls.len();
                }
                if samples < wanted_samples {
                    self.partial_videos.extend(urls);
                }
            }
        }
    }
}

fn build_pbar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pbar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("Hashing media [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len}")
    {
        pbar.set_style(style);
    }
    pbar
}

/// Fills a `HashCache` for a batch of ads on a bounded worker pool, so the
/// grouping pass never touches the network.
pub struct ParallelPrecomputeScheduler {
    config: GroupingConfig,
    hasher: PerceptualHasher,
    pool: ThreadPool,
}

impl ParallelPrecomputeScheduler {
    pub fn new(config: &GroupingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.max_parallel_workers)
            .thread_name(|i| format!("adset-hash-{}", i))
            .build()?;

        Ok(Self {
            config: config.clone(),
            hasher: PerceptualHasher::new(),
            pool,
        })
    }

    fn plan_jobs<F: MediaFetcher + ?Sized>(
        &self,
        candidates: Vec<(String, HashKind)>,
        fetcher: &F,
        report: &mut PrecomputeReport,
    ) -> Vec<HashJob> {
        let mut jobs = Vec::new();
        let mut video_urls = Vec::new();
        for (url, kind) in candidates {
            match kind {
                HashKind::Image => jobs.push(HashJob::Image(url)),
                HashKind::Video => video_urls.push(url),
            }
        }

        if !self.config.coalesce_by_metadata || video_urls.len() < 2 {
            jobs.extend(video_urls.into_iter().map(|url| HashJob::Video(vec![url])));
            return jobs;
        }

        let probed: Vec<(String, Option<(String, u64)>)> = self.pool.install(|| {
            video_urls
                .into_par_iter()
                .map(|url| {
                    let key = fetcher.probe_metadata(&url).content_key();
                    (url, key)
                })
                .collect()
        });

        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut by_key: HashMap<(String, u64), usize> = HashMap::new();
        for (url, key) in probed {
            match key {
                Some(key) => match by_key.get(&key) {
                    Some(&index) => {
                        log::debug!("{} serves the same bytes as {}", url, groups[index][0]);
                        report.coalesced_urls += 1;
                        groups[index].push(url);
                    }
                    None => {
                        by_key.insert(key, groups.len());
                        groups.push(vec![url]);
                    }
                },
                None => groups.push(vec![url]),
            }
        }

        jobs.extend(groups.into_iter().map(HashJob::Video));
        jobs
    }

    fn run_job<F: MediaFetcher + ?Sized>(&self, job: HashJob, fetcher: &F, cache: &HashCache) -> JobOutcome {
        match job {
            HashJob::Image(url) => {
                let hashed = fetcher
                    .fetch_image(&url)
                    .map_err(|e| e.to_string())
                    .and_then(|img| self.hasher.hash_image(&img).map_err(|e| format!("{:#}", e)));

                match hashed {
                    Ok(hash) => {
                        cache.put_if_absent(&url, MediaHash::Image(hash));
                        JobOutcome::Image { url, error: None }
                    }
                    Err(reason) => {
                        log::warn!("Hash unavailable for {}: {}", url, reason);
                        JobOutcome::Image {
                            url,
                            error: Some(reason),
                        }
                    }
                }
            }
            HashJob::Video(urls) => {
                let wanted = self.config.video_sample_count;
                let frames = fetcher.sample_video_frames(&urls[0], wanted);
                let hashes = self.hasher.hash_video_samples(&frames);
                if hashes.len() < wanted {
                    log::warn!(
                        "Only {}/{} usable samples for {}",
                        hashes.len(),
                        wanted,
                        urls[0]
                    );
                }

                let samples = hashes.len();
                let hashes: Arc<[ImageHash]> = hashes.into();
                for url in &urls {
                    cache.put_if_absent(url, MediaHash::Video(Arc::clone(&hashes)));
                }
                JobOutcome::Video { urls, samples }
            }
        }
    }

    /// Hash every media URL referenced by `ads` that is not already cached.
    ///
    /// Fetch failures never abort the run; the URL is just missing from the cache.
    pub fn run<F: MediaFetcher + ?Sized>(&self, ads: &[Ad], fetcher: &F, cache: &HashCache) -> PrecomputeReport {
        let start = Instant::now();
        let mut report = PrecomputeReport::default();

        let candidates: Vec<(String, HashKind)> = candidate_urls(ads)
            .into_iter()
            .filter(|(url, _)| {
                let cached = cache.contains(url);
                report.already_cached += cached as usize;
                !cached
            })
            .collect();

        let jobs = self.plan_jobs(candidates, fetcher, &mut report);
        report.jobs = jobs.len();

        log::info!(
            "Hashing {} unique media for {} ads on {} workers",
            jobs.len(),
            ads.len(),
            self.config.max_parallel_workers
        );

        let pbar = build_pbar(jobs.len(), self.config.show_progress);
        let wanted = self.config.video_sample_count;
        let (tx, rx) = mpsc::channel();

        self.pool.in_place_scope(|scope| {
            for job in jobs {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let outcome = self.run_job(job, fetcher, cache);
                    let _ = tx.send(outcome);
                });
            }
            drop(tx);

            // completion order
            for outcome in rx.iter() {
                report.record(outcome, wanted);
                pbar.inc(1);
            }
        });
        pbar.finish_and_clear();

        log::info!(
            "Hashed {} images and {} videos in {:.2?} ({} failed, {} partial)",
            report.images_hashed,
            report.videos_hashed,
            start.elapsed(),
            report.failed.len(),
            report.partial_videos.len()
        );

        report
    }
}
