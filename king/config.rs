// ========================================================================================
//                                 Run configuration
// ========================================================================================
//
// Settings come from three layers, lowest precedence first: the defaults below, an
// optional TOML file, and command-line flags applied by the binary.

use crate::pipeline::PipelineError;
use serde::Deserialize;
use std::fs;
use std::ops::Range;
use std::path::Path;

/// The KING cutoff for third-degree relatives or closer.
pub const DEFAULT_KIN_THRESHOLD: f32 = 0.0442;
/// The default number of reservoir slots.
pub const DEFAULT_MAX_RESULTS: usize = 10_000_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Location of the JSON sample map (sample id → container path).
    pub sample_map: Option<String>,
    /// Location the relatedness document is written to.
    pub output: Option<String>,
    /// Capacity of the result reservoir.
    pub max_results: usize,
    /// Number of reader threads.
    pub num_threads: usize,
    /// Only pairs with a coefficient strictly above this value are reported.
    pub kin_threshold: f32,
    /// Optional `[begin, end)` restriction of the kernel's row sample index.
    pub sample_range: Option<[usize; 2]>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sample_map: None,
            output: None,
            max_results: DEFAULT_MAX_RESULTS,
            num_threads: num_cpus::get().max(1),
            kin_threshold: DEFAULT_KIN_THRESHOLD,
            sample_range: None,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        toml::from_str(text)
            .map_err(|e| PipelineError::Config(format!("Invalid configuration: {e}")))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Cannot read configuration file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
            .map_err(|e| e.with_context(&format!("in '{}'", path.display())))
    }

    /// Checks everything that can be checked before the sample map is loaded.
    pub fn validate(&self) -> Result<ValidatedConfig, PipelineError> {
        let sample_map = self
            .sample_map
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PipelineError::Config("A sample map location is required".to_string()))?;
        let output = self
            .output
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PipelineError::Config("An output location is required".to_string()))?;
        if self.max_results == 0 {
            return Err(PipelineError::Config("max_results must be at least 1".to_string()));
        }
        if self.num_threads == 0 {
            return Err(PipelineError::Config("num_threads must be at least 1".to_string()));
        }
        if !self.kin_threshold.is_finite() {
            return Err(PipelineError::Config(format!(
                "kin_threshold must be finite, got {}",
                self.kin_threshold
            )));
        }
        let sample_range = match self.sample_range {
            Some([begin, end]) if begin >= end => {
                return Err(PipelineError::Config(format!(
                    "sample_range [{begin}, {end}) is empty or inverted"
                )));
            }
            Some([begin, end]) => Some(begin..end),
            None => None,
        };
        Ok(ValidatedConfig {
            sample_map,
            output,
            max_results: self.max_results,
            num_threads: self.num_threads,
            kin_threshold: self.kin_threshold,
            sample_range,
        })
    }
}

/// A configuration that passed `RunConfig::validate`. Required locations are present
/// and every numeric setting is usable.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub sample_map: String,
    pub output: String,
    pub max_results: usize,
    pub num_threads: usize,
    pub kin_threshold: f32,
    pub sample_range: Option<Range<usize>>,
}

impl ValidatedConfig {
    /// Resolves the kernel's row range against the loaded sample count.
    pub fn rows(&self, num_samples: usize) -> Result<Range<usize>, PipelineError> {
        match &self.sample_range {
            None => Ok(0..num_samples),
            Some(range) if range.end <= num_samples => Ok(range.clone()),
            Some(range) => Err(PipelineError::Config(format!(
                "sample_range [{}, {}) exceeds the {num_samples} samples in the sample map",
                range.start, range.end
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RunConfig {
        RunConfig {
            sample_map: Some("map.json".to_string()),
            output: Some("out.json".to_string()),
            ..RunConfig::default()
        }
    }

    #[test]
    fn defaults_need_only_locations() {
        let cfg = base().validate().unwrap();
        assert_eq!(cfg.max_results, DEFAULT_MAX_RESULTS);
        assert_eq!(cfg.kin_threshold, DEFAULT_KIN_THRESHOLD);
        assert!(cfg.num_threads >= 1);
        assert_eq!(cfg.rows(7).unwrap(), 0..7);
    }

    #[test]
    fn missing_locations_are_config_errors() {
        assert!(matches!(RunConfig::default().validate(), Err(PipelineError::Config(_))));
        let cfg = RunConfig {
            output: None,
            ..base()
        };
        assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn invalid_numbers_are_config_errors() {
        for cfg in [
            RunConfig { max_results: 0, ..base() },
            RunConfig { num_threads: 0, ..base() },
            RunConfig { kin_threshold: f32::NAN, ..base() },
            RunConfig { sample_range: Some([4, 4]), ..base() },
        ] {
            assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))), "{cfg:?}");
        }
    }

    #[test]
    fn sample_range_is_checked_against_the_sample_count() {
        let cfg = RunConfig {
            sample_range: Some([2, 5]),
            ..base()
        }
        .validate()
        .unwrap();
        assert_eq!(cfg.rows(5).unwrap(), 2..5);
        assert!(matches!(cfg.rows(4), Err(PipelineError::Config(_))));
    }

    #[test]
    fn toml_layers_over_defaults() {
        let cfg = RunConfig::from_toml_str(
            r#"
            sample_map = "gs://bucket/map.json"
            kin_threshold = 0.1
            sample_range = [0, 100]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sample_map.as_deref(), Some("gs://bucket/map.json"));
        assert_eq!(cfg.kin_threshold, 0.1);
        assert_eq!(cfg.max_results, DEFAULT_MAX_RESULTS);
        assert_eq!(cfg.sample_range, Some([0, 100]));

        assert!(RunConfig::from_toml_str("unknown_key = 1").is_err());
    }
}
