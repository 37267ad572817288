use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::completion::CompletionCriteria;

pub const BOOK_CONFIG_FILE: &str = "autobook.yaml";
pub const DEFAULT_POOL_SIZE: usize = 2;
pub const MAX_RETRIES_PER_CHAPTER: u32 = 10;
pub const MAX_RECOVERY_ATTEMPTS_PER_CHAPTER: u32 = 5;

/// Per-run parameters. Fixed once a run starts; the run record stores a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoCompletionConfig {
    pub target_word_count: u64,
    pub target_chapter_count: u32,
    pub minimum_quality_score: f64,
    pub max_retries_per_chapter: u32,
    pub auto_pause_on_failure: bool,
    pub context_improvement_enabled: bool,
    pub max_recovery_attempts_per_chapter: u32,
    pub generation_timeout_secs: u64,
    pub assessment_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_word_count: Option<u64>,
    pub minimum_conclusion_score: f64,
}

impl Default for AutoCompletionConfig {
    fn default() -> Self {
        Self {
            target_word_count: 80_000,
            target_chapter_count: 20,
            minimum_quality_score: 75.0,
            max_retries_per_chapter: 2,
            auto_pause_on_failure: false,
            context_improvement_enabled: true,
            max_recovery_attempts_per_chapter: 1,
            generation_timeout_secs: 600,
            assessment_timeout_secs: 300,
            maximum_word_count: None,
            minimum_conclusion_score: 7.0,
        }
    }
}

impl AutoCompletionConfig {
    pub fn target_words_per_chapter(&self) -> u64 {
        let chapters = u64::from(self.target_chapter_count.max(1));
        (self.target_word_count / chapters).max(1)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn assessment_timeout(&self) -> Duration {
        Duration::from_secs(self.assessment_timeout_secs)
    }

    pub fn completion_criteria(&self) -> CompletionCriteria {
        let minimum_word_count = self.target_word_count;
        let maximum_word_count = self
            .maximum_word_count
            .unwrap_or(minimum_word_count + minimum_word_count / 8);
        CompletionCriteria {
            minimum_word_count,
            maximum_word_count,
            minimum_chapter_count: self.target_chapter_count,
            minimum_conclusion_score: self.minimum_conclusion_score,
        }
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(value) = overrides.target_word_count {
            self.target_word_count = value;
        }
        if let Some(value) = overrides.target_chapter_count {
            self.target_chapter_count = value;
        }
        if let Some(value) = overrides.minimum_quality_score {
            self.minimum_quality_score = value;
        }
        if let Some(value) = overrides.max_retries_per_chapter {
            self.max_retries_per_chapter = value;
        }
        if let Some(value) = overrides.auto_pause_on_failure {
            self.auto_pause_on_failure = value;
        }
        if let Some(value) = overrides.context_improvement_enabled {
            self.context_improvement_enabled = value;
        }
        if let Some(value) = overrides.max_recovery_attempts_per_chapter {
            self.max_recovery_attempts_per_chapter = value;
        }
        if let Some(value) = overrides.generation_timeout_secs {
            self.generation_timeout_secs = value;
        }
        if let Some(value) = overrides.assessment_timeout_secs {
            self.assessment_timeout_secs = value;
        }
        if let Some(value) = overrides.maximum_word_count {
            self.maximum_word_count = Some(value);
        }
        if let Some(value) = overrides.minimum_conclusion_score {
            self.minimum_conclusion_score = value;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target_chapter_count == 0 {
            anyhow::bail!("target chapter count must be > 0");
        }
        if self.target_word_count == 0 {
            anyhow::bail!("target word count must be > 0");
        }
        if !(0.0..=100.0).contains(&self.minimum_quality_score) {
            anyhow::bail!(
                "minimum quality score must be within 0..=100 (got {})",
                self.minimum_quality_score
            );
        }
        if !(0.0..=10.0).contains(&self.minimum_conclusion_score) {
            anyhow::bail!(
                "minimum conclusion score must be within 0..=10 (got {})",
                self.minimum_conclusion_score
            );
        }
        if self.max_retries_per_chapter > MAX_RETRIES_PER_CHAPTER {
            anyhow::bail!(
                "max retries per chapter must be at most {MAX_RETRIES_PER_CHAPTER} (got {})",
                self.max_retries_per_chapter
            );
        }
        if self.max_recovery_attempts_per_chapter > MAX_RECOVERY_ATTEMPTS_PER_CHAPTER {
            anyhow::bail!(
                "max recovery attempts per chapter must be at most \
                 {MAX_RECOVERY_ATTEMPTS_PER_CHAPTER} (got {})",
                self.max_recovery_attempts_per_chapter
            );
        }
        if self.generation_timeout_secs == 0 || self.assessment_timeout_secs == 0 {
            anyhow::bail!("collaborator timeouts must be > 0 seconds");
        }
        let criteria = self.completion_criteria();
        if criteria.maximum_word_count < criteria.minimum_word_count {
            anyhow::bail!(
                "maximum word count ({}) is below target word count ({})",
                criteria.maximum_word_count,
                criteria.minimum_word_count
            );
        }
        Ok(())
    }
}

/// Sparse overlay used both for `autobook.yaml` and for CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub target_word_count: Option<u64>,
    pub target_chapter_count: Option<u32>,
    pub minimum_quality_score: Option<f64>,
    pub max_retries_per_chapter: Option<u32>,
    pub auto_pause_on_failure: Option<bool>,
    pub context_improvement_enabled: Option<bool>,
    pub max_recovery_attempts_per_chapter: Option<u32>,
    pub generation_timeout_secs: Option<u64>,
    pub assessment_timeout_secs: Option<u64>,
    pub maximum_word_count: Option<u64>,
    pub minimum_conclusion_score: Option<f64>,
}

impl ConfigOverrides {
    pub fn read(path: &Path) -> anyhow::Result<Option<Self>> {
        let yaml = match std::fs::read_to_string(path) {
            Ok(yaml) => yaml,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read config: {}", path.display()));
            }
        };
        if yaml.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        let overrides = serde_yaml::from_str(&yaml)
            .with_context(|| format!("parse config: {}", path.display()))?;
        Ok(Some(overrides))
    }
}

/// Defaults, then `<book>/autobook.yaml`, then CLI flags.
pub fn load_book_config(
    book_dir: &Path,
    cli: &ConfigOverrides,
) -> anyhow::Result<AutoCompletionConfig> {
    let mut config = AutoCompletionConfig::default();
    let path = book_dir.join(BOOK_CONFIG_FILE);
    if let Some(file) = ConfigOverrides::read(&path)? {
        tracing::debug!(path = %path.display(), "apply book config");
        config.apply(&file);
    }
    config.apply(cli);
    config
        .validate()
        .with_context(|| format!("invalid config for book: {}", book_dir.display()))?;
    Ok(config)
}

pub fn pool_size_from_env() -> anyhow::Result<usize> {
    let Ok(raw) = std::env::var("AUTOBOOK_MAX_CONCURRENCY") else {
        return Ok(DEFAULT_POOL_SIZE);
    };
    parse_pool_size(&raw)
        .with_context(|| format!("invalid AUTOBOOK_MAX_CONCURRENCY={raw:?}. expected a positive integer"))
}

fn parse_pool_size(raw: &str) -> anyhow::Result<usize> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(DEFAULT_POOL_SIZE);
    }
    let value: usize = raw.parse().context("parse integer")?;
    if value == 0 {
        anyhow::bail!("pool size must be > 0");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_criteria_allow_an_eighth_over_target() {
        let config = AutoCompletionConfig::default();
        let criteria = config.completion_criteria();
        assert_eq!(criteria.minimum_word_count, 80_000);
        assert_eq!(criteria.maximum_word_count, 90_000);
        assert_eq!(criteria.minimum_chapter_count, 20);
        assert_eq!(config.target_words_per_chapter(), 4_000);
    }

    #[test]
    fn overrides_apply_only_present_fields() {
        let mut config = AutoCompletionConfig::default();
        config.apply(&ConfigOverrides {
            target_chapter_count: Some(3),
            auto_pause_on_failure: Some(true),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.target_chapter_count, 3);
        assert!(config.auto_pause_on_failure);
        assert_eq!(config.max_retries_per_chapter, 2);
    }

    #[test]
    fn book_yaml_is_layered_under_cli_flags() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        std::fs::write(
            temp.path().join(BOOK_CONFIG_FILE),
            "target_chapter_count: 12\nminimum_quality_score: 60\n",
        )?;

        let config = load_book_config(
            temp.path(),
            &ConfigOverrides {
                minimum_quality_score: Some(70.0),
                ..ConfigOverrides::default()
            },
        )?;
        assert_eq!(config.target_chapter_count, 12);
        assert_eq!(config.minimum_quality_score, 70.0);
        Ok(())
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        std::fs::write(temp.path().join(BOOK_CONFIG_FILE), "chapters: 3\n")?;
        let err = load_book_config(temp.path(), &ConfigOverrides::default()).unwrap_err();
        assert!(format!("{err:#}").contains("parse config"));
        Ok(())
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let config = AutoCompletionConfig {
            minimum_quality_score: 120.0,
            ..AutoCompletionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_bounds_retry_and_recovery_budgets() {
        let at_limit = AutoCompletionConfig {
            max_retries_per_chapter: MAX_RETRIES_PER_CHAPTER,
            max_recovery_attempts_per_chapter: MAX_RECOVERY_ATTEMPTS_PER_CHAPTER,
            ..AutoCompletionConfig::default()
        };
        assert!(at_limit.validate().is_ok());

        let retries = AutoCompletionConfig {
            max_retries_per_chapter: u32::MAX,
            ..AutoCompletionConfig::default()
        };
        let err = retries.validate().unwrap_err();
        assert!(err.to_string().contains("max retries per chapter"));

        let recoveries = AutoCompletionConfig {
            max_recovery_attempts_per_chapter: MAX_RECOVERY_ATTEMPTS_PER_CHAPTER + 1,
            ..AutoCompletionConfig::default()
        };
        assert!(recoveries.validate().is_err());
    }

    #[test]
    fn parse_pool_size_variants() {
        assert_eq!(parse_pool_size("").unwrap(), DEFAULT_POOL_SIZE);
        assert_eq!(parse_pool_size(" 4 ").unwrap(), 4);
        assert!(parse_pool_size("0").is_err());
        assert!(parse_pool_size("many").is_err());
    }
}
