use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::hash::HASH_GRID;

pub const DEFAULT_IMAGE_HASH_CUTOFF: u32 = 5;
pub const DEFAULT_VIDEO_SIMILARITY_THRESHOLD: f64 = 0.90;
pub const DEFAULT_VIDEO_SAMPLE_COUNT: usize = 6;
pub const DEFAULT_MAX_PARALLEL_WORKERS: usize = 16;

const ENV_PREFIX: &str = "ADSET_";

/// How a new ad is matched against the sets built so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    /// Compare only with each set's representative
    #[default]
    Representative,
    /// Compare with every member of each set
    AnyMember,
    /// Connected components of the full pairwise match graph
    Transitive,
}

impl FromStr for GroupingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "representative" => Ok(GroupingMode::Representative),
            "any_member" => Ok(GroupingMode::AnyMember),
            "transitive" => Ok(GroupingMode::Transitive),
            other => Err(format!("unknown grouping mode {other:?}")),
        }
    }
}

/// Tuning knobs for one grouping run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Max Hamming distance (inclusive) for two images to match
    pub image_hash_cutoff: u32,
    /// Min fraction (inclusive) of matching sampled frames for two videos to match
    pub video_similarity_threshold: f64,
    pub video_sample_count: usize,
    pub max_parallel_workers: usize,
    pub probe_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub video_open_timeout_secs: u64,
    pub max_image_bytes: u64,
    /// Share one sampling job between stream URLs whose HEAD validators agree
    pub coalesce_by_metadata: bool,
    pub mode: GroupingMode,
    pub show_progress: bool,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            image_hash_cutoff: DEFAULT_IMAGE_HASH_CUTOFF,
            video_similarity_threshold: DEFAULT_VIDEO_SIMILARITY_THRESHOLD,
            video_sample_count: DEFAULT_VIDEO_SAMPLE_COUNT,
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            probe_timeout_secs: 5,
            image_timeout_secs: 10,
            video_open_timeout_secs: 15,
            max_image_bytes: 20 * 1024 * 1024,
            coalesce_by_metadata: true,
            mode: GroupingMode::Representative,
            show_progress: false,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    let var = format!("{ENV_PREFIX}{name}");
    match lookup(&var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}

impl GroupingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_bits = HASH_GRID * HASH_GRID;
        if self.image_hash_cutoff > max_bits {
            return Err(invalid(
                "image_hash_cutoff",
                format!("{} exceeds the {}-bit hash width", self.image_hash_cutoff, max_bits),
            ));
        }
        let threshold = self.video_similarity_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "video_similarity_threshold",
                format!("{threshold} is not within [0, 1]"),
            ));
        }
        if self.video_sample_count == 0 {
            return Err(invalid("video_sample_count", "must be at least 1"));
        }
        if self.max_parallel_workers == 0 {
            return Err(invalid("max_parallel_workers", "must be at least 1"));
        }
        for (field, secs) in [
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("image_timeout_secs", self.image_timeout_secs),
            ("video_open_timeout_secs", self.video_open_timeout_secs),
        ] {
            if secs == 0 {
                return Err(invalid(field, "timeout must be non-zero"));
            }
        }
        if self.max_image_bytes == 0 {
            return Err(invalid("max_image_bytes", "must be non-zero"));
        }
        Ok(())
    }

    /// Defaults overridden by `ADSET_*` variables, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "IMAGE_HASH_CUTOFF")? {
            config.image_hash_cutoff = v;
        }
        if let Some(v) = parse_var(&lookup, "VIDEO_SIMILARITY_THRESHOLD")? {
            config.video_similarity_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "VIDEO_SAMPLE_COUNT")? {
            config.video_sample_count = v;
        }
        if let Some(v) = parse_var(&lookup, "MAX_PARALLEL_WORKERS")? {
            config.max_parallel_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "COALESCE_BY_METADATA")? {
            config.coalesce_by_metadata = v;
        }
        if let Some(v) = parse_var(&lookup, "GROUPING_MODE")? {
            config.mode = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: GroupingConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    pub fn video_open_timeout(&self) -> Duration {
        Duration::from_secs(self.video_open_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GroupingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.image_hash_cutoff, 5);
        assert_eq!(config.video_sample_count, 6);
        assert_eq!(config.max_parallel_workers, 16);
        assert!((config.video_similarity_threshold - 0.90).abs() < f64::EPSILON);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut config = GroupingConfig::default();
        config.video_similarity_threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "video_similarity_threshold", .. })));

        let mut config = GroupingConfig::default();
        config.video_similarity_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = GroupingConfig::default();
        config.image_hash_cutoff = 65;
        assert!(config.validate().is_err());

        let mut config = GroupingConfig::default();
        config.max_parallel_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = GroupingConfig::from_lookup(lookup(&[
            ("ADSET_IMAGE_HASH_CUTOFF", "8"),
            ("ADSET_VIDEO_SIMILARITY_THRESHOLD", "0.75"),
            ("ADSET_GROUPING_MODE", "any-member"),
            ("ADSET_VIDEO_SAMPLE_COUNT", ""),
        ]))
        .unwrap();
        assert_eq!(config.image_hash_cutoff, 8);
        assert_eq!(config.video_similarity_threshold, 0.75);
        assert_eq!(config.mode, GroupingMode::AnyMember);
        assert_eq!(config.video_sample_count, DEFAULT_VIDEO_SAMPLE_COUNT);
    }

    #[test]
    fn test_negative_cutoff_from_env_is_error() {
        let err = GroupingConfig::from_lookup(lookup(&[("ADSET_IMAGE_HASH_CUTOFF", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_yaml_file_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "image_hash_cutoff: 3\nmode: transitive\nmax_parallel_workers: 4").unwrap();

        let config = GroupingConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.image_hash_cutoff, 3);
        assert_eq!(config.mode, GroupingMode::Transitive);
        assert_eq!(config.max_parallel_workers, 4);
        assert_eq!(config.video_sample_count, DEFAULT_VIDEO_SAMPLE_COUNT);
    }

    #[test]
    fn test_yaml_negative_cutoff_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "image_hash_cutoff: -2").unwrap();
        assert!(matches!(
            GroupingConfig::from_yaml_file(file.path()),
            Err(ConfigError::Yaml(_))
        ));
    }
}
