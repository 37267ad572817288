use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;

use crate::manuscript::count_words;
use crate::text;

pub const RUBRIC_WEIGHT: f64 = 0.5;
pub const ENGAGEMENT_WEIGHT: f64 = 0.3;
pub const GATE_WEIGHT: f64 = 0.2;

/// Assessment of one chapter. Sub-scores are opaque collaborator outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// 0..=100
    pub rubric_score: f64,
    /// 0..=10
    pub engagement_score: f64,
    /// 0..=10
    pub gate_score: f64,
    /// Category name to 0..=10 score.
    #[serde(default)]
    pub categories: BTreeMap<String, f64>,
}

impl QualityReport {
    /// Weighted 0..=100 blend: 50% rubric, 30% engagement, 20% gate validator.
    pub fn overall_score(&self) -> f64 {
        blend_scores(self.rubric_score, self.engagement_score, self.gate_score)
    }

    pub fn passes(&self, minimum_quality_score: f64) -> bool {
        self.overall_score() >= minimum_quality_score
    }

    /// Lowest-scoring category; ties resolve to the alphabetically first name.
    pub fn weakest_category(&self) -> Option<(&str, f64)> {
        self.categories
            .iter()
            .fold(None, |best: Option<(&str, f64)>, (name, score)| match best {
                Some((_, best_score)) if best_score <= *score => best,
                _ => Some((name.as_str(), *score)),
            })
    }
}

pub fn blend_scores(rubric_score: f64, engagement_score: f64, gate_score: f64) -> f64 {
    rubric_score * RUBRIC_WEIGHT
        + engagement_score * 10.0 * ENGAGEMENT_WEIGHT
        + gate_score * 10.0 * GATE_WEIGHT
}

#[async_trait]
pub trait QualityAssessor: Send + Sync {
    /// Must be deterministic for the same text.
    async fn assess(&self, chapter_text: &str, chapter_number: u32)
    -> anyhow::Result<QualityReport>;
}

/// Structural scorer: length, paragraphing, dialogue, sentence and vocabulary variety.
#[derive(Debug, Clone)]
pub struct HeuristicAssessor {
    target_words: u64,
}

impl HeuristicAssessor {
    pub fn new(target_words: u64) -> Self {
        Self {
            target_words: target_words.max(1),
        }
    }

    pub fn score(&self, chapter_text: &str) -> QualityReport {
        let plain = text::plain_text(chapter_text);
        let words = count_words(&plain);
        let paragraphs = text::paragraphs(chapter_text);
        let sentences = text::sentences(&plain);

        let length = {
            let ratio = words as f64 / self.target_words as f64;
            // Full marks within 80%..=120% of target.
            let distance = if ratio < 0.8 {
                0.8 - ratio
            } else if ratio > 1.2 {
                ratio - 1.2
            } else {
                0.0
            };
            (10.0 - distance * 12.5).clamp(0.0, 10.0)
        };

        let structure = if words == 0 {
            0.0
        } else {
            // Roughly one paragraph per 60..=180 words reads well.
            let per_paragraph = words as f64 / paragraphs.len().max(1) as f64;
            if (60.0..=180.0).contains(&per_paragraph) {
                10.0
            } else if per_paragraph < 60.0 {
                (per_paragraph / 6.0).clamp(0.0, 10.0)
            } else {
                (10.0 - (per_paragraph - 180.0) / 30.0).clamp(0.0, 10.0)
            }
        };

        let dialogue = if paragraphs.is_empty() {
            0.0
        } else {
            let with_dialogue = paragraphs
                .iter()
                .filter(|p| p.contains('"') || p.contains('“'))
                .count();
            let share = with_dialogue as f64 / paragraphs.len() as f64;
            // Peaks at a 40% share of dialogue paragraphs.
            (10.0 - (share - 0.4).abs() * 20.0).clamp(0.0, 10.0)
        };

        let pacing = {
            let lengths: Vec<f64> = sentences
                .iter()
                .map(|s| s.split_whitespace().count() as f64)
                .collect();
            if lengths.len() < 2 {
                0.0
            } else {
                let mean = lengths.iter().sum::<f64>() / lengths.len() as f64;
                let variance =
                    lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lengths.len() as f64;
                (variance.sqrt() * 1.25).clamp(0.0, 10.0)
            }
        };

        let vocabulary = {
            let lowered = plain.to_lowercase();
            let tokens: Vec<&str> = lowered
                .split(|c: char| !c.is_alphanumeric() && c != '\'')
                .filter(|w| !w.is_empty())
                .collect();
            if tokens.is_empty() {
                0.0
            } else {
                let unique: std::collections::HashSet<&str> = tokens.iter().copied().collect();
                // Type/token ratio over 0.5 is full marks for chapter-length text.
                (unique.len() as f64 / tokens.len() as f64 * 20.0).clamp(0.0, 10.0)
            }
        };

        let categories = BTreeMap::from([
            ("dialogue".to_owned(), round1(dialogue)),
            ("length".to_owned(), round1(length)),
            ("pacing".to_owned(), round1(pacing)),
            ("structure".to_owned(), round1(structure)),
            ("vocabulary".to_owned(), round1(vocabulary)),
        ]);
        let mean = categories.values().sum::<f64>() / categories.len() as f64;

        QualityReport {
            rubric_score: round1(mean * 10.0),
            engagement_score: round1((dialogue + pacing) / 2.0),
            gate_score: round1(length.min(structure)),
            categories,
        }
    }
}

#[async_trait]
impl QualityAssessor for HeuristicAssessor {
    async fn assess(
        &self,
        chapter_text: &str,
        chapter_number: u32,
    ) -> anyhow::Result<QualityReport> {
        let report = self.score(chapter_text);
        tracing::debug!(
            assessor = "heuristic",
            chapter = chapter_number,
            overall = report.overall_score(),
            "quality assessed"
        );
        Ok(report)
    }
}

/// Runs an external program: chapter text on stdin, a JSON [`QualityReport`] on stdout.
#[derive(Debug, Clone)]
pub struct CommandAssessor {
    program: String,
    args: Vec<String>,
}

impl CommandAssessor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl QualityAssessor for CommandAssessor {
    async fn assess(
        &self,
        chapter_text: &str,
        chapter_number: u32,
    ) -> anyhow::Result<QualityReport> {
        tracing::debug!(
            assessor = "command",
            command = %self.program,
            chapter = chapter_number,
            "quality assess"
        );

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("AUTOBOOK_CHAPTER_NUMBER", chapter_number.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn assessor command: {}", self.program))?;

        {
            let mut stdin = child.stdin.take().context("open assessor stdin")?;
            stdin
                .write_all(chapter_text.as_bytes())
                .await
                .context("write assessor stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("wait assessor process")?;
        if !output.status.success() {
            anyhow::bail!(
                "assessor command failed: {} ({})",
                self.program,
                output.status
            );
        }

        let report: QualityReport =
            serde_json::from_slice(&output.stdout).context("parse assessor report json")?;
        Ok(report)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
