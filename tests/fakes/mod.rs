use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use autobook::app::run_store::{LocalFsRunStore, RunStore as _};
use autobook::config::AutoCompletionConfig;
use autobook::context::LocalFsContextManager;
use autobook::generator::{ChapterGenerator, GeneratedChapter, GenerationRequest};
use autobook::manuscript::BookLayout;
use autobook::model::ControlRequest;
use autobook::orchestrator::{Collaborators, Orchestrator};
use autobook::quality::{QualityAssessor, QualityReport};

type GenerateFn = dyn Fn(&GenerationRequest, usize) -> anyhow::Result<String> + Send + Sync;
type AssessFn = dyn Fn(u32, usize) -> QualityReport + Send + Sync;

/// Generator driven by a closure of (request, earlier calls for this chapter).
pub struct ScriptedGenerator {
    script: Box<GenerateFn>,
    calls: Mutex<Vec<GenerationRequest>>,
    control: Option<(BookLayout, u32, ControlRequest)>,
}

#[allow(dead_code)]
impl ScriptedGenerator {
    pub fn new(
        script: impl Fn(&GenerationRequest, usize) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            control: None,
        }
    }

    pub fn always_writes() -> Self {
        Self::new(|request, _| Ok(chapter_text(request.chapter_number)))
    }

    /// Files a pause/stop request while generating `chapter`, like a second process would.
    pub fn with_control(mut self, layout: &BookLayout, chapter: u32, request: ControlRequest) -> Self {
        self.control = Some((layout.clone(), chapter, request));
        self
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn chapters_called(&self) -> Vec<u32> {
        self.calls().iter().map(|r| r.chapter_number).collect()
    }
}

#[async_trait]
impl ChapterGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedChapter> {
        let earlier = {
            let mut calls = self.calls.lock().unwrap();
            let earlier = calls
                .iter()
                .filter(|r| r.chapter_number == request.chapter_number)
                .count();
            calls.push(request.clone());
            earlier
        };
        if let Some((layout, chapter, control)) = &self.control
            && *chapter == request.chapter_number
        {
            LocalFsRunStore::new(layout).request_control(*control).await?;
        }
        let content = (self.script)(request, earlier)?;
        Ok(GeneratedChapter { content })
    }
}

/// Assessor driven by a closure of (chapter, earlier assessments of that chapter).
pub struct ScriptedAssessor {
    script: Box<AssessFn>,
    calls: Mutex<Vec<u32>>,
}

#[allow(dead_code)]
impl ScriptedAssessor {
    pub fn new(script: impl Fn(u32, usize) -> QualityReport + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(report: QualityReport) -> Self {
        Self::new(move |_, _| report.clone())
    }
}

#[async_trait]
impl QualityAssessor for ScriptedAssessor {
    async fn assess(&self, _chapter_text: &str, chapter_number: u32) -> anyhow::Result<QualityReport> {
        let earlier = {
            let mut calls = self.calls.lock().unwrap();
            let earlier = calls.iter().filter(|c| **c == chapter_number).count();
            calls.push(chapter_number);
            earlier
        };
        Ok((self.script)(chapter_number, earlier))
    }
}

#[allow(dead_code)]
pub fn report(rubric: f64, engagement: f64, gate: f64) -> QualityReport {
    let categories = BTreeMap::from([
        ("dialogue".to_owned(), engagement),
        ("pacing".to_owned(), gate - 1.0),
        ("structure".to_owned(), gate),
    ]);
    QualityReport {
        rubric_score: rubric,
        engagement_score: engagement,
        gate_score: gate,
        categories,
    }
}

#[allow(dead_code)]
pub fn passing() -> QualityReport {
    report(80.0, 7.0, 7.0)
}

#[allow(dead_code)]
pub fn failing() -> QualityReport {
    report(30.0, 2.0, 3.0)
}

pub fn chapter_text(chapter: u32) -> String {
    format!(
        "# Chapter {chapter}\n\n\
         The lighthouse keeper counted the ships again. Later Ilsa climbed the stairs \
         with a lamp and a letter she had promised to deliver.\n\n\
         \"Who sent this?\" she asked. Nobody on the island would answer her.\n"
    )
}

/// Small config: three chapters, no completion-detector stop before the end.
#[allow(dead_code)]
pub fn config(chapters: u32) -> AutoCompletionConfig {
    AutoCompletionConfig {
        target_chapter_count: chapters,
        target_word_count: 50_000,
        minimum_quality_score: passing().overall_score(),
        max_retries_per_chapter: 1,
        ..AutoCompletionConfig::default()
    }
}

#[allow(dead_code)]
pub fn orchestrator(
    layout: &BookLayout,
    config: AutoCompletionConfig,
    generator: Arc<ScriptedGenerator>,
    assessor: Arc<ScriptedAssessor>,
) -> Orchestrator {
    Orchestrator::new(layout.clone(), config, collaborators(layout, generator, assessor))
}

#[allow(dead_code)]
pub fn collaborators(
    layout: &BookLayout,
    generator: Arc<ScriptedGenerator>,
    assessor: Arc<ScriptedAssessor>,
) -> Collaborators {
    Collaborators {
        generator,
        assessor,
        context: Arc::new(LocalFsContextManager::new(layout.clone())),
    }
}
