use super::cache::HashCache;
use super::compare::SimilarityComparator;
use super::config::{GroupingConfig, GroupingMode};
use super::error::ConfigError;
use super::fetch::MediaFetcher;
use super::precompute::{ParallelPrecomputeScheduler, PrecomputeReport};
use super::{Ad, AdSet};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

const MAX_SET_NAME_CHARS: usize = 80;

static DIMENSION_SUFFIX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[_\-\s|]*\(?(\d{2,4})\s*[xX×:]\s*(\d{2,4})\)?$").ok());

static PLACEMENT_SUFFIX: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)[_\-\s|]*(post|story|stories|feed|reels?|square|vertical|horizontal)$").ok()
});

static WHITESPACE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s+").ok());

fn strip(re: &Lazy<Option<Regex>>, text: &str) -> String {
    match &**re {
        Some(re) => re.replace(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Display name for a set, from its representative's copy
pub fn set_name(ad: &Ad) -> String {
    let text = ad
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or(ad.body.as_deref())
        .unwrap_or("");

    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let collapsed = match &*WHITESPACE {
        Some(re) => re.replace_all(first_line.trim(), " ").into_owned(),
        None => first_line.trim().to_string(),
    };
    let name = strip(&PLACEMENT_SUFFIX, &strip(&DIMENSION_SUFFIX, &collapsed));
    let name: String = name.trim().chars().take(MAX_SET_NAME_CHARS).collect();

    if name.is_empty() { ad.id.clone() } else { name }
}

/// Outcome of placing one ad
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Joined { set_id: String },
    Created { set_id: String },
    /// Transitive mode only: the ad bridged several sets, which were folded
    /// into `set_id`
    Merged { set_id: String, absorbed: Vec<String> },
}

impl Placement {
    pub fn set_id(&self) -> &str {
        match self {
            Placement::Joined { set_id }
            | Placement::Created { set_id }
            | Placement::Merged { set_id, .. } => set_id,
        }
    }
}

struct OpenSet {
    set: AdSet,
    members: Vec<Ad>,
    representative: usize,
    live: bool,
}

impl OpenSet {
    fn new(ad: Ad) -> Self {
        let set = AdSet {
            id: uuid::Uuid::new_v4().to_string(),
            name: set_name(&ad),
            representative_id: ad.id.clone(),
            ad_ids: vec![ad.id.clone()],
        };
        Self {
            set,
            members: vec![ad],
            representative: 0,
            live: true,
        }
    }

    fn push(&mut self, ad: Ad) {
        self.set.ad_ids.push(ad.id.clone());
        self.members.push(ad);
    }
}

/// Disjoint-set forest over ad indices
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, x: usize, y: usize) {
        let (rx, ry) = (self.find(x), self.find(y));
        if rx == ry {
            return;
        }
        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] += 1;
            }
        }
    }
}

/// Partitions ads into ad sets with the pairwise comparator.
///
/// Single pass in input order. The first ad of a set is its representative.
/// Because matching is a threshold test, A~B and B~C does not imply A~C; in
/// `Representative` and `AnyMember` modes the outcome of such chains depends
/// on input order. `Transitive` mode takes connected components instead.
pub struct AdSetGrouper<'a> {
    comparator: SimilarityComparator<'a>,
    mode: GroupingMode,
    sets: Vec<OpenSet>,
    assigned: HashMap<String, usize>,
}

impl<'a> AdSetGrouper<'a> {
    pub fn new(cache: &'a HashCache, config: &GroupingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            comparator: SimilarityComparator::new(cache, config),
            mode: config.mode,
            sets: Vec::new(),
            assigned: HashMap::new(),
        })
    }

    /// Load a set persisted by an earlier run so new ads can join it
    pub fn seed(&mut self, set: AdSet, members: Vec<Ad>) {
        if members.is_empty() {
            log::warn!("Ignoring ad set {} with no members", set.id);
            return;
        }
        let representative = members
            .iter()
            .position(|ad| ad.id == set.representative_id)
            .unwrap_or(0);

        let index = self.sets.len();
        for ad in &members {
            self.assigned.insert(ad.id.clone(), index);
        }
        let set = AdSet {
            representative_id: members[representative].id.clone(),
            ad_ids: members.iter().map(|ad| ad.id.clone()).collect(),
            ..set
        };
        self.sets.push(OpenSet {
            set,
            members,
            representative,
            live: true,
        });
    }

    fn set_matches(&self, open: &OpenSet, ad: &Ad) -> bool {
        let candidates: &[Ad] = match self.mode {
            GroupingMode::Representative => std::slice::from_ref(&open.members[open.representative]),
            GroupingMode::AnyMember | GroupingMode::Transitive => &open.members,
        };

        candidates.iter().any(|member| {
            let verdict = self.comparator.compare(member, ad);
            log::debug!(
                "Comparing {} \"{}\" vs \"{}\": score={:.3}, tier={:?}, similar={}",
                ad.media_kind.as_str(),
                member.id,
                ad.id,
                verdict.score,
                verdict.tier,
                verdict.is_match
            );
            verdict.is_match
        })
    }

    /// Assign one ad to an existing set or open a new one
    pub fn place(&mut self, ad: Ad) -> Placement {
        if let Some(&index) = self.assigned.get(&ad.id) {
            log::debug!("Ad {} already assigned", ad.id);
            return Placement::Joined {
                set_id: self.sets[index].set.id.clone(),
            };
        }

        let stop_at_first = self.mode != GroupingMode::Transitive;
        let mut matched = Vec::new();
        for (index, open) in self.sets.iter().enumerate() {
            if open.live && self.set_matches(open, &ad) {
                matched.push(index);
                if stop_at_first {
                    break;
                }
            }
        }

        let Some((&target, rest)) = matched.split_first() else {
            let index = self.sets.len();
            self.assigned.insert(ad.id.clone(), index);
            let open = OpenSet::new(ad);
            let set_id = open.set.id.clone();
            self.sets.push(open);
            return Placement::Created { set_id };
        };

        self.assigned.insert(ad.id.clone(), target);
        self.sets[target].push(ad);

        let mut absorbed = Vec::new();
        for &index in rest {
            let members = std::mem::take(&mut self.sets[index].members);
            self.sets[index].live = false;
            absorbed.push(self.sets[index].set.id.clone());
            for member in members {
                self.assigned.insert(member.id.clone(), target);
                self.sets[target].push(member);
            }
        }

        let set_id = self.sets[target].set.id.clone();
        if absorbed.is_empty() {
            Placement::Joined { set_id }
        } else {
            log::info!("Merged {} ad sets into {}", absorbed.len(), set_id);
            Placement::Merged { set_id, absorbed }
        }
    }

    /// Connected components of the full match graph. Each component lists
    /// ads in input order; the first one is the representative.
    fn transitive_components(&self, ads: &[Ad]) -> Vec<Vec<usize>> {
        let mut uf = UnionFind::new(ads.len());
        for i in 0..ads.len() {
            for j in (i + 1)..ads.len() {
                if uf.find(i) != uf.find(j) && self.comparator.is_similar(&ads[i], &ads[j]) {
                    uf.union(i, j);
                }
            }
        }

        let mut by_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<usize>> = Vec::new();
        for i in 0..ads.len() {
            let root = uf.find(i);
            let slot = *by_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(i);
        }
        components
    }

    /// Group a batch of ads and return every set, seeded ones included
    pub fn group(mut self, ads: &[Ad]) -> Vec<AdSet> {
        let unique: Vec<&Ad> = {
            let mut seen = std::collections::HashSet::new();
            ads.iter()
                .filter(|ad| !self.assigned.contains_key(&ad.id) && seen.insert(ad.id.as_str()))
                .collect()
        };

        if self.mode == GroupingMode::Transitive && self.sets.is_empty() {
            let ads: Vec<Ad> = unique.into_iter().cloned().collect();
            for component in self.transitive_components(&ads) {
                let mut members = component.into_iter().map(|i| ads[i].clone());
                if let Some(first) = members.next() {
                    let mut open = OpenSet::new(first);
                    members.for_each(|ad| open.push(ad));
                    self.sets.push(open);
                }
            }
        } else {
            for ad in unique {
                self.place(ad.clone());
            }
        }

        let sets = self.into_sets();
        log::info!("Created {} ad sets from {} ads", sets.len(), ads.len());
        sets
    }

    pub fn into_sets(self) -> Vec<AdSet> {
        self.sets
            .into_iter()
            .filter(|open| open.live)
            .map(|open| open.set)
            .collect()
    }
}

/// Group ads against an already populated cache
pub fn group_ads(ads: &[Ad], cache: &HashCache, config: &GroupingConfig) -> Result<Vec<AdSet>, ConfigError> {
    Ok(AdSetGrouper::new(cache, config)?.group(ads))
}

/// Precompute media hashes for the batch, then group it
pub fn precompute_and_group<F: MediaFetcher + ?Sized>(
    ads: &[Ad],
    fetcher: &F,
    config: &GroupingConfig,
) -> Result<(Vec<AdSet>, PrecomputeReport), ConfigError> {
    let cache = HashCache::new();
    let report = ParallelPrecomputeScheduler::new(config)?.run(ads, fetcher, &cache);
    let sets = group_ads(ads, &cache, config)?;
    Ok((sets, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad_grouping::MediaHash;
    use crate::ad_grouping::error::FetchError;
    use crate::ad_grouping::fetch::MediaMetadata;
    use crate::ad_grouping::hash::ImageHash;
    use image::{DynamicImage, Rgb, RgbImage};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn bits(n: u32) -> ImageHash {
        ImageHash((1u64 << n) - 1)
    }

    fn partition(sets: &[AdSet]) -> Vec<Vec<String>> {
        sets.iter().map(|s| s.ad_ids.clone()).collect()
    }

    fn sorted_partition(sets: &[AdSet]) -> Vec<Vec<String>> {
        let mut out: Vec<Vec<String>> = sets
            .iter()
            .map(|s| {
                let mut ids = s.ad_ids.clone();
                ids.sort();
                ids
            })
            .collect();
        out.sort();
        out
    }

    fn ids(groups: &[&[&str]]) -> Vec<Vec<String>> {
        groups
            .iter()
            .map(|g| g.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    fn config(mode: GroupingMode) -> GroupingConfig {
        GroupingConfig {
            mode,
            ..GroupingConfig::default()
        }
    }

    /// ad1/ad2 share an image, ad3 stands alone, ad4/ad5 share a stream
    fn five_ads(cache: &HashCache) -> Vec<Ad> {
        cache.put_if_absent("t3", MediaHash::Image(ImageHash(0)));
        cache.put_if_absent("t4", MediaHash::Image(ImageHash(u64::MAX)));
        cache.put_if_absent("t5", MediaHash::Image(ImageHash(0xFFFF_0000_FFFF_0000)));
        let stream: Vec<ImageHash> = (0..20).map(|i| ImageHash(i * 0x0101)).collect();
        let mut near = stream.clone();
        near[7] = ImageHash(!near[7].0);
        cache.put_if_absent("sd3", MediaHash::Video(vec![ImageHash(0x00FF_00FF); 20].into()));
        cache.put_if_absent("sd4", MediaHash::Video(stream.into()));
        cache.put_if_absent("sd5", MediaHash::Video(near.into()));

        vec![
            Ad::image("ad1", "https://cdn/shared.jpg"),
            Ad::image("ad2", "https://cdn/shared.jpg"),
            Ad::video("ad3", "hq3", Some("t3"), Some("sd3")),
            Ad::video("ad4", "hq4", Some("t4"), Some("sd4")),
            Ad::video("ad5", "hq5", Some("t5"), Some("sd5")),
        ]
    }

    #[test]
    fn test_five_ad_scenario() {
        init_logs();
        let cache = HashCache::new();
        let ads = five_ads(&cache);
        let sets = group_ads(&ads, &cache, &GroupingConfig::default()).unwrap();

        assert_eq!(partition(&sets), ids(&[&["ad1", "ad2"], &["ad3"], &["ad4", "ad5"]]));
        let reps: Vec<&str> = sets.iter().map(|s| s.representative_id.as_str()).collect();
        assert_eq!(reps, vec!["ad1", "ad3", "ad4"]);
    }

    #[test]
    fn test_grouping_is_deterministic() {
        let cache = HashCache::new();
        let ads = five_ads(&cache);
        let first = group_ads(&ads, &cache, &GroupingConfig::default()).unwrap();
        let second = group_ads(&ads, &cache, &GroupingConfig::default()).unwrap();
        assert_eq!(partition(&first), partition(&second));
    }

    /// a~b and b~c, but a and c are 8 bits apart
    fn chain(cache: &HashCache) -> (Ad, Ad, Ad) {
        cache.put_if_absent("a", MediaHash::Image(ImageHash(0)));
        cache.put_if_absent("b", MediaHash::Image(bits(4)));
        cache.put_if_absent("c", MediaHash::Image(bits(8)));
        (Ad::image("A", "a"), Ad::image("B", "b"), Ad::image("C", "c"))
    }

    #[test]
    fn test_chain_depends_on_mode() {
        let cache = HashCache::new();
        let (a, b, c) = chain(&cache);
        let ads = vec![a, b, c];

        let rep = group_ads(&ads, &cache, &config(GroupingMode::Representative)).unwrap();
        assert_eq!(partition(&rep), ids(&[&["A", "B"], &["C"]]));

        let any = group_ads(&ads, &cache, &config(GroupingMode::AnyMember)).unwrap();
        assert_eq!(partition(&any), ids(&[&["A", "B", "C"]]));

        let transitive = group_ads(&ads, &cache, &config(GroupingMode::Transitive)).unwrap();
        assert_eq!(partition(&transitive), ids(&[&["A", "B", "C"]]));
    }

    #[test]
    fn test_chain_depends_on_order() {
        let cache = HashCache::new();
        let (a, b, c) = chain(&cache);
        let ads = vec![a, c, b];

        let any = group_ads(&ads, &cache, &config(GroupingMode::AnyMember)).unwrap();
        assert_eq!(partition(&any), ids(&[&["A", "B"], &["C"]]));

        let transitive = group_ads(&ads, &cache, &config(GroupingMode::Transitive)).unwrap();
        assert_eq!(partition(&transitive), ids(&[&["A", "C", "B"]]));
        assert_eq!(transitive[0].representative_id, "A");
    }

    #[test]
    fn test_incremental_transitive_matches_batch() {
        let cache = HashCache::new();
        let (a, b, c) = chain(&cache);
        let ads = vec![a, c, b];
        let cfg = config(GroupingMode::Transitive);

        let mut grouper = AdSetGrouper::new(&cache, &cfg).unwrap();
        assert!(matches!(grouper.place(ads[0].clone()), Placement::Created { .. }));
        assert!(matches!(grouper.place(ads[1].clone()), Placement::Created { .. }));
        let bridged = grouper.place(ads[2].clone());
        match &bridged {
            Placement::Merged { absorbed, .. } => assert_eq!(absorbed.len(), 1),
            other => panic!("expected merge, got {:?}", other),
        }

        let incremental = grouper.into_sets();
        assert_eq!(incremental.len(), 1);
        assert_eq!(incremental[0].id, bridged.set_id());
        assert_eq!(incremental[0].representative_id, "A");

        let batch = group_ads(&ads, &cache, &cfg).unwrap();
        assert_eq!(sorted_partition(&incremental), sorted_partition(&batch));
    }

    #[test]
    fn test_place_against_seeded_sets() {
        let cache = HashCache::new();
        cache.put_if_absent("old", MediaHash::Image(ImageHash(0)));
        cache.put_if_absent("new_close", MediaHash::Image(bits(2)));
        cache.put_if_absent("new_far", MediaHash::Image(bits(30)));

        let persisted = AdSet {
            id: "set-1".into(),
            name: "Spring launch".into(),
            representative_id: "old".into(),
            ad_ids: vec!["old".into()],
        };
        let mut grouper = AdSetGrouper::new(&cache, &GroupingConfig::default()).unwrap();
        grouper.seed(persisted, vec![Ad::image("old", "old")]);

        assert_eq!(
            grouper.place(Ad::image("n1", "new_close")),
            Placement::Joined { set_id: "set-1".into() }
        );
        let created = grouper.place(Ad::image("n2", "new_far"));
        assert!(matches!(created, Placement::Created { .. }));
        assert_eq!(
            grouper.place(Ad::image("n1", "new_close")),
            Placement::Joined { set_id: "set-1".into() }
        );

        let sets = grouper.into_sets();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].ad_ids, vec!["old", "n1"]);
        assert_eq!(sets[0].name, "Spring launch");
        let rows: Vec<_> = sets[0].assignments().collect();
        assert!(rows[0].is_representative && !rows[1].is_representative);
    }

    #[test]
    fn test_missing_hashes_give_singletons() {
        let cache = HashCache::new();
        let ads = vec![
            Ad::image("1", "u1"),
            Ad::image("2", "u2"),
            Ad::video("3", "h3", Some("t3"), Some("s3")),
            Ad::video("4", "h4", Some("t4"), Some("s4")),
        ];
        let sets = group_ads(&ads, &cache, &GroupingConfig::default()).unwrap();
        assert_eq!(sets.len(), 4);
        assert!(sets.iter().all(|s| s.len() == 1));
    }

    #[test]
    fn test_duplicate_ids_grouped_once() {
        let cache = HashCache::new();
        let ads = vec![Ad::image("1", "u1"), Ad::image("1", "u1"), Ad::image("2", "u2")];
        let sets = group_ads(&ads, &cache, &GroupingConfig::default()).unwrap();
        let total: usize = sets.iter().map(AdSet::len).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let cache = HashCache::new();
        let cfg = GroupingConfig {
            video_similarity_threshold: -0.1,
            ..GroupingConfig::default()
        };
        assert!(matches!(
            group_ads(&[], &cache, &cfg),
            Err(ConfigError::Invalid { field: "video_similarity_threshold", .. })
        ));
    }

    #[test]
    fn test_set_name() {
        let ad = Ad::image("123", "u").with_title("  Summer   Sale 50% off - Story 1080x1920");
        assert_eq!(set_name(&ad), "Summer Sale 50% off");

        let ad = Ad::image("123", "u").with_title("Big launch_square");
        assert_eq!(set_name(&ad), "Big launch");

        let mut ad = Ad::image("123", "u");
        ad.body = Some("\n\nFree shipping today\nsecond line".into());
        assert_eq!(set_name(&ad), "Free shipping today");

        assert_eq!(set_name(&Ad::image("987", "u")), "987");
    }

    struct PatternFetcher;

    impl MediaFetcher for PatternFetcher {
        fn probe_metadata(&self, _url: &str) -> MediaMetadata {
            MediaMetadata::default()
        }

        fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
            let dark_left = url.contains("left");
            if url.contains("missing") {
                return Err(FetchError::Timeout { url: url.to_string() });
            }
            let width = if url.contains("large") { 400 } else { 100 };
            Ok(DynamicImage::ImageRgb8(RgbImage::from_fn(width, width, |x, _| {
                let dark = (x < width / 2) == dark_left;
                let v = if dark { 10 } else { 240 };
                Rgb([v, v, v])
            })))
        }

        fn sample_video_frames(&self, _url: &str, _n_samples: usize) -> Vec<DynamicImage> {
            Vec::new()
        }
    }

    #[test]
    fn test_precompute_and_group_end_to_end() {
        init_logs();
        let ads = vec![
            Ad::image("a", "https://cdn/left.jpg"),
            Ad::image("b", "https://cdn/left_large.jpg"),
            Ad::image("c", "https://cdn/right.jpg"),
            Ad::image("d", "https://cdn/missing_left.jpg"),
        ];
        let cfg = GroupingConfig {
            max_parallel_workers: 2,
            ..GroupingConfig::default()
        };
        let (sets, report) = precompute_and_group(&ads, &PatternFetcher, &cfg).unwrap();

        assert_eq!(report.images_hashed, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(partition(&sets), ids(&[&["a", "b"], &["c"], &["d"]]));
    }
}
