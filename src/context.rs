//! Story continuity carried from one chapter to the next.
//!
//! The filesystem manager keeps everything in `state/context.json` and re-reads
//! it on every call, so a recovery restore is visible to the next build.

use std::collections::{BTreeMap, HashMap, HashSet, btree_map};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::manuscript::{self, BookLayout};
use crate::quality::QualityReport;
use crate::text;

const SUMMARY_WORDS: usize = 60;
const HANDOFF_WORDS: usize = 150;
const MAX_SUMMARIES: usize = 10;
const MAX_CHARACTERS: usize = 12;
const MAX_THREADS: usize = 6;
const MAX_QUESTIONS: usize = 5;

const THEME_LEXICON: &[&str] = &[
    "betrayal",
    "courage",
    "family",
    "freedom",
    "grief",
    "home",
    "identity",
    "loss",
    "love",
    "memory",
    "power",
    "redemption",
    "revenge",
    "truth",
    "war",
];

const THREAD_MARKERS: &[&str] = &[
    "must ", "promised", "plan", "secret", "swore", "needed to", "would have to",
];

const NOT_NAMES: &[&str] = &[
    "The", "And", "But", "She", "Her", "His", "They", "Then", "When", "What", "Where", "Why",
    "How", "This", "That", "There", "Their", "Chapter", "Yes", "Not", "For", "With", "You",
    "Our", "Its", "Now", "Just", "Maybe", "Perhaps", "Still", "Even", "Once",
];

/// What the generator sees for one chapter attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterContext {
    pub chapter_number: u32,
    pub attempt: u32,
    pub story_so_far: Option<String>,
    pub previous_chapter_ending: Option<String>,
    pub characters: Vec<String>,
    pub plot_threads: Vec<String>,
    pub themes: Vec<String>,
    pub unresolved_questions: Vec<String>,
    pub retry_guidance: Option<String>,
    pub focus_improvement: Option<String>,
}

impl ChapterContext {
    pub fn with_focus_improvement(mut self, category: &str, score: f64) -> Self {
        self.focus_improvement = Some(format!(
            "The previous draft scored {score:.1}/10 on {category}; make {category} the priority of this draft."
        ));
        self
    }
}

/// Value snapshot handed to the recovery system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub document: serde_json::Value,
    /// 0..=1; recorded on recovery points and used to pick the best-known-good point.
    pub continuity_quality: f64,
}

#[async_trait]
pub trait ContextManager: Send + Sync {
    async fn build_context(&self, chapter_number: u32, attempt: u32)
    -> anyhow::Result<ChapterContext>;
    async fn record_chapter(
        &self,
        chapter_number: u32,
        chapter_text: &str,
        quality: &QualityReport,
    ) -> anyhow::Result<()>;
    async fn snapshot(&self) -> anyhow::Result<ContextSnapshot>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryContext {
    pub chapters: BTreeMap<u32, ChapterNotes>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterNotes {
    pub summary: String,
    pub names: BTreeMap<String, u32>,
    pub threads: Vec<String>,
    pub questions: Vec<String>,
    pub themes: BTreeMap<String, u32>,
    pub word_count: u64,
    pub quality_score: f64,
}

impl StoryContext {
    fn before(&self, chapter_number: u32) -> btree_map::Range<'_, u32, ChapterNotes> {
        self.chapters.range(..chapter_number)
    }

    pub fn characters_before(&self, chapter_number: u32) -> Vec<String> {
        let mut totals: HashMap<&str, (u32, u32)> = HashMap::new();
        for (_, notes) in self.before(chapter_number) {
            for (name, count) in &notes.names {
                let entry = totals.entry(name.as_str()).or_default();
                entry.0 += count;
                entry.1 += 1;
            }
        }
        let mut names: Vec<(&str, u32)> = totals
            .into_iter()
            .filter(|(_, (mentions, chapters))| *mentions >= 3 || *chapters >= 2)
            .map(|(name, (mentions, _))| (name, mentions))
            .collect();
        names.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        names
            .into_iter()
            .take(MAX_CHARACTERS)
            .map(|(name, _)| name.to_owned())
            .collect()
    }

    pub fn themes_before(&self, chapter_number: u32) -> Vec<String> {
        let mut totals: BTreeMap<&str, u32> = BTreeMap::new();
        for (_, notes) in self.before(chapter_number) {
            for (theme, count) in &notes.themes {
                *totals.entry(theme.as_str()).or_default() += count;
            }
        }
        let mut themes: Vec<(&str, u32)> = totals.into_iter().filter(|(_, c)| *c >= 2).collect();
        themes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        themes.into_iter().take(3).map(|(t, _)| t.to_owned()).collect()
    }

    /// Newest chapters' entries first.
    fn recent<'a>(
        &'a self,
        chapter_number: u32,
        pick: impl Fn(&'a ChapterNotes) -> &'a Vec<String>,
        limit: usize,
    ) -> Vec<String> {
        let mut seen: HashSet<&String> = HashSet::new();
        self.before(chapter_number)
            .rev()
            .flat_map(|(_, notes)| pick(notes).iter())
            .filter(|item| seen.insert(*item))
            .take(limit)
            .cloned()
            .collect()
    }

    /// 0..=1 richness of the tracked continuity.
    pub fn continuity_quality(&self) -> f64 {
        if self.chapters.is_empty() {
            return 0.0;
        }
        let latest = self.chapters.keys().max().copied().unwrap_or(0);
        let coverage = self.chapters.len() as f64 / latest.max(1) as f64;
        let next = latest + 1;
        let characters = (self.characters_before(next).len().min(5) as f64) / 5.0;
        let threads = (self.recent(next, |n| &n.threads, MAX_THREADS).len().min(3) as f64) / 3.0;
        let quality = self.chapters.values().map(|n| n.quality_score).sum::<f64>()
            / self.chapters.len() as f64
            / 100.0;
        ((coverage + characters + threads + quality) / 4.0).clamp(0.0, 1.0)
    }
}

pub fn extract_notes(chapter_text: &str, quality_score: f64) -> ChapterNotes {
    let plain = text::plain_text(chapter_text);
    let sentences = text::sentences(&plain);

    let summary = match sentences.as_slice() {
        [] => text::head_words(&plain, SUMMARY_WORDS),
        [only] => text::head_words(only, SUMMARY_WORDS),
        [first, .., last] => text::head_words(&format!("{first} … {last}"), SUMMARY_WORDS),
    };

    let mut names: BTreeMap<String, u32> = BTreeMap::new();
    for sentence in &sentences {
        for raw in sentence.split_whitespace().skip(1) {
            let word = raw.trim_matches(|c: char| !c.is_alphabetic());
            let mut chars = word.chars();
            let Some(first) = chars.next() else {
                continue;
            };
            if !first.is_uppercase()
                || word.chars().count() < 3
                || !chars.all(char::is_lowercase)
                || NOT_NAMES.contains(&word)
            {
                continue;
            }
            *names.entry(word.to_owned()).or_default() += 1;
        }
    }

    let threads = sentences
        .iter()
        .filter(|s| {
            let lowered = s.to_lowercase();
            THREAD_MARKERS.iter().any(|m| lowered.contains(m))
        })
        .take(3)
        .map(|s| s.to_string())
        .collect();

    let questions = sentences
        .iter()
        .filter(|s| s.trim_end_matches(['"', '\'', '”', '’', ')']).ends_with('?'))
        .rev()
        .take(3)
        .map(|s| s.to_string())
        .collect();

    let lowered = plain.to_lowercase();
    let mut themes = BTreeMap::new();
    for theme in THEME_LEXICON {
        let count = lowered.matches(theme).count() as u32;
        if count > 0 {
            themes.insert((*theme).to_owned(), count);
        }
    }

    ChapterNotes {
        summary,
        names,
        threads,
        questions,
        themes,
        word_count: manuscript::count_words(&plain),
        quality_score,
    }
}

#[derive(Debug, Clone)]
pub struct LocalFsContextManager {
    layout: BookLayout,
}

impl LocalFsContextManager {
    pub fn new(layout: BookLayout) -> Self {
        Self { layout }
    }

    pub fn load(&self) -> anyhow::Result<StoryContext> {
        Ok(manuscript::read_json_file(&self.layout.context_path())
            .context("load story context")?
            .unwrap_or_default())
    }

    fn save(&self, story: &StoryContext) -> anyhow::Result<()> {
        manuscript::write_json_file(&self.layout.context_path(), story)
            .context("save story context")
    }
}

#[async_trait]
impl ContextManager for LocalFsContextManager {
    async fn build_context(
        &self,
        chapter_number: u32,
        attempt: u32,
    ) -> anyhow::Result<ChapterContext> {
        let story = self.load()?;

        let summaries: Vec<String> = story
            .before(chapter_number)
            .rev()
            .take(MAX_SUMMARIES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|(n, notes)| format!("Chapter {n}: {}", notes.summary))
            .collect();
        let story_so_far = (!summaries.is_empty()).then(|| summaries.join("\n"));

        let previous_chapter_ending = if chapter_number > 1 {
            manuscript::read_chapter(&self.layout, chapter_number - 1)?
                .map(|text| text::tail_words(&text::plain_text(&text), HANDOFF_WORDS))
                .filter(|tail| !tail.is_empty())
        } else {
            None
        };

        let retry_guidance = (attempt > 0).then(|| {
            format!(
                "Attempt {} for this chapter: the previous draft did not clear the quality gate. \
                 Keep every established fact and improve the weak areas rather than changing the story.",
                attempt + 1
            )
        });

        Ok(ChapterContext {
            chapter_number,
            attempt,
            story_so_far,
            previous_chapter_ending,
            characters: story.characters_before(chapter_number),
            plot_threads: story.recent(chapter_number, |n| &n.threads, MAX_THREADS),
            themes: story.themes_before(chapter_number),
            unresolved_questions: story.recent(chapter_number, |n| &n.questions, MAX_QUESTIONS),
            retry_guidance,
            focus_improvement: None,
        })
    }

    async fn record_chapter(
        &self,
        chapter_number: u32,
        chapter_text: &str,
        quality: &QualityReport,
    ) -> anyhow::Result<()> {
        let mut story = self.load()?;
        let notes = extract_notes(chapter_text, quality.overall_score());
        tracing::debug!(
            chapter = chapter_number,
            names = notes.names.len(),
            threads = notes.threads.len(),
            questions = notes.questions.len(),
            "context recorded"
        );
        story.chapters.insert(chapter_number, notes);
        self.save(&story)
    }

    async fn snapshot(&self) -> anyhow::Result<ContextSnapshot> {
        let story = self.load()?;
        Ok(ContextSnapshot {
            continuity_quality: story.continuity_quality(),
            document: serde_json::to_value(&story).context("serialize story context")?,
        })
    }
}
