//! Decides whether the manuscript on disk reads as a finished book.
//!
//! Nothing is cached: every analysis rescans `chapters/`, so the verdict can
//! never drift from what is actually written.

use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::manuscript::{self, BookLayout};
use crate::text;

const WORD_WEIGHT: f64 = 25.0;
const CHAPTER_WEIGHT: f64 = 15.0;
const PLOT_WEIGHT: f64 = 30.0;
const CHARACTER_WEIGHT: f64 = 20.0;
const CONCLUSION_WEIGHT: f64 = 10.0;

const CONCLUSION_SHARE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Incomplete,
    ReadyToComplete,
    Completed,
    OverTarget,
    NeedsRevision,
}

impl CompletionStatus {
    pub fn should_continue(self) -> bool {
        matches!(self, Self::Incomplete | Self::ReadyToComplete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::ReadyToComplete => "ready_to_complete",
            Self::Completed => "completed",
            Self::OverTarget => "over_target",
            Self::NeedsRevision => "needs_revision",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionCriteria {
    pub minimum_word_count: u64,
    pub maximum_word_count: u64,
    pub minimum_chapter_count: u32,
    pub minimum_conclusion_score: f64,
}

/// Raw measurements the status decision runs on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetrics {
    pub word_count: u64,
    pub chapter_count: u32,
    /// 0..=10
    pub plot_resolution_score: f64,
    /// 0..=10
    pub character_arc_score: f64,
    /// 0..=10
    pub conclusion_quality_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionAnalysis {
    pub status: CompletionStatus,
    pub word_count: u64,
    pub chapter_count: u32,
    pub word_progress_percent: f64,
    pub chapter_progress_percent: f64,
    pub plot_resolution_score: f64,
    pub character_arc_score: f64,
    pub conclusion_quality_score: f64,
    pub completeness_score: f64,
}

impl CompletionAnalysis {
    pub fn from_metrics(metrics: &CompletionMetrics, criteria: &CompletionCriteria) -> Self {
        let word_ratio = ratio(metrics.word_count as f64, criteria.minimum_word_count as f64);
        let chapter_ratio = ratio(
            f64::from(metrics.chapter_count),
            f64::from(criteria.minimum_chapter_count),
        );
        let completeness = completeness_score(metrics, criteria);
        Self {
            status: decide_status(metrics, criteria, completeness),
            word_count: metrics.word_count,
            chapter_count: metrics.chapter_count,
            word_progress_percent: word_ratio * 100.0,
            chapter_progress_percent: chapter_ratio * 100.0,
            plot_resolution_score: metrics.plot_resolution_score,
            character_arc_score: metrics.character_arc_score,
            conclusion_quality_score: metrics.conclusion_quality_score,
            completeness_score: completeness,
        }
    }
}

fn ratio(value: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 1.0;
    }
    value / target
}

/// 0..=100; every component contributes at most its weight.
pub fn completeness_score(metrics: &CompletionMetrics, criteria: &CompletionCriteria) -> f64 {
    let words = ratio(metrics.word_count as f64, criteria.minimum_word_count as f64).min(1.0);
    let chapters = ratio(
        f64::from(metrics.chapter_count),
        f64::from(criteria.minimum_chapter_count),
    )
    .min(1.0);
    let scaled = |score: f64, weight: f64| score.clamp(0.0, 10.0) / 10.0 * weight;

    words * WORD_WEIGHT
        + chapters * CHAPTER_WEIGHT
        + scaled(metrics.plot_resolution_score, PLOT_WEIGHT)
        + scaled(metrics.character_arc_score, CHARACTER_WEIGHT)
        + scaled(metrics.conclusion_quality_score, CONCLUSION_WEIGHT)
}

/// First matching rule wins.
pub fn decide_status(
    metrics: &CompletionMetrics,
    criteria: &CompletionCriteria,
    completeness: f64,
) -> CompletionStatus {
    let words = metrics.word_count;
    let chapters = metrics.chapter_count;
    let min_words = criteria.minimum_word_count;
    let min_chapters = criteria.minimum_chapter_count;

    if words > criteria.maximum_word_count {
        return CompletionStatus::OverTarget;
    }

    let floor = criteria.minimum_conclusion_score;
    if words >= min_words
        && chapters >= min_chapters
        && metrics.plot_resolution_score >= floor
        && metrics.character_arc_score >= floor
        && metrics.conclusion_quality_score >= floor
    {
        return CompletionStatus::Completed;
    }

    if words as f64 >= 0.9 * min_words as f64
        && chapters >= min_chapters.saturating_sub(2)
        && completeness >= 80.0
    {
        return CompletionStatus::ReadyToComplete;
    }

    if words >= min_words
        && (metrics.plot_resolution_score < 5.0 || metrics.character_arc_score < 5.0)
    {
        return CompletionStatus::NeedsRevision;
    }

    CompletionStatus::Incomplete
}

struct PatternFamily {
    regex: &'static LazyLock<Regex>,
    weight: f64,
}

macro_rules! family {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($regex_str).expect(stringify!($name)));
    };
}

family!(
    RE_RESOLUTION,
    r"\b(resolved|resolution|at last|finally|in the end|it was over|peace returned|truth came out|answered|reconciled|forgave|reunited)\b"
);
family!(
    RE_REVELATION,
    r"\b(revealed|realized|understood now|the truth was|confessed|discovered that)\b"
);
family!(
    RE_CLOSURE,
    r"\b(the end|epilogue|years later|ever after|home again|closed the door|laid to rest)\b"
);
family!(
    RE_CLIFFHANGER,
    r"\b(to be continued|cliffhanger|unanswered|still unknown|would never know|yet to come|not over yet|remained a mystery)\b"
);
family!(
    RE_GROWTH,
    r"\b(learned|grown|changed|no longer|for the first time|became|transformed|had become|accepted|let go|stronger|wiser)\b"
);
family!(
    RE_REFLECTION,
    r"\b(looked back|remembered who|who (she|he|they) (was|were|had been)|understood (herself|himself|themselves)|made peace)\b"
);

static PLOT_FAMILIES: &[PatternFamily] = &[
    PatternFamily {
        regex: &RE_RESOLUTION,
        weight: 1.0,
    },
    PatternFamily {
        regex: &RE_REVELATION,
        weight: 0.75,
    },
    PatternFamily {
        regex: &RE_CLOSURE,
        weight: 1.25,
    },
];

static INCOMPLETE_FAMILIES: &[PatternFamily] = &[PatternFamily {
    regex: &RE_CLIFFHANGER,
    weight: 1.5,
}];

static CHARACTER_FAMILIES: &[PatternFamily] = &[
    PatternFamily {
        regex: &RE_GROWTH,
        weight: 1.0,
    },
    PatternFamily {
        regex: &RE_REFLECTION,
        weight: 1.5,
    },
];

fn weighted_hits(text: &str, families: &[PatternFamily]) -> f64 {
    families
        .iter()
        .map(|f| f.regex.find_iter(text).count() as f64 * f.weight)
        .sum()
}

/// Weighted hits per thousand words, scaled to 0..=10.
fn density_score(hits: f64, words: u64, per_thousand_for_full_marks: f64) -> f64 {
    if words == 0 {
        return 0.0;
    }
    let per_thousand = hits * 1000.0 / words as f64;
    (per_thousand / per_thousand_for_full_marks * 10.0).clamp(0.0, 10.0)
}

pub fn plot_resolution_score(normalized: &str, words: u64) -> f64 {
    let hits = weighted_hits(normalized, PLOT_FAMILIES);
    let penalty = weighted_hits(normalized, INCOMPLETE_FAMILIES);
    density_score((hits - penalty).max(0.0), words, 1.0)
}

pub fn character_arc_score(normalized: &str, words: u64) -> f64 {
    density_score(weighted_hits(normalized, CHARACTER_FAMILIES), words, 1.5)
}

/// Resolution and growth language within the closing section only.
pub fn conclusion_quality_score(ending: &str, words: u64) -> f64 {
    let hits = weighted_hits(ending, PLOT_FAMILIES) + weighted_hits(ending, CHARACTER_FAMILIES);
    let penalty = weighted_hits(ending, INCOMPLETE_FAMILIES);
    density_score((hits - penalty).max(0.0), words, 4.0)
}

pub fn measure(layout: &BookLayout) -> anyhow::Result<CompletionMetrics> {
    let mut manuscript = String::new();
    let mut chapter_count = 0u32;
    for (_, path) in manuscript::list_chapters(&layout.chapters_dir())? {
        let markdown = std::fs::read_to_string(&path)
            .with_context(|| format!("read chapter: {}", path.display()))?;
        manuscript.push_str(&text::normalize(&markdown));
        manuscript.push(' ');
        chapter_count += 1;
    }

    let word_count = manuscript::count_words(&manuscript);
    let tail_len = ((word_count as f64) * CONCLUSION_SHARE).ceil() as usize;
    let ending = text::tail_words(&manuscript, tail_len);
    let ending_words = manuscript::count_words(&ending);

    Ok(CompletionMetrics {
        word_count,
        chapter_count,
        plot_resolution_score: plot_resolution_score(&manuscript, word_count),
        character_arc_score: character_arc_score(&manuscript, word_count),
        conclusion_quality_score: conclusion_quality_score(&ending, ending_words),
    })
}

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    layout: BookLayout,
    criteria: CompletionCriteria,
}

impl CompletionDetector {
    pub fn new(layout: BookLayout, criteria: CompletionCriteria) -> Self {
        Self { layout, criteria }
    }

    pub fn criteria(&self) -> &CompletionCriteria {
        &self.criteria
    }

    pub fn analyze_completion_status(&self) -> anyhow::Result<CompletionAnalysis> {
        let metrics = measure(&self.layout).context("measure manuscript")?;
        Ok(CompletionAnalysis::from_metrics(&metrics, &self.criteria))
    }

    pub fn should_continue_generation(&self) -> anyhow::Result<bool> {
        Ok(self.analyze_completion_status()?.status.should_continue())
    }
}
