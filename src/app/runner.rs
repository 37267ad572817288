use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;

use crate::app::queue::JobPool;
use crate::app::run_store::{LocalFsRunStore, RunStore as _};
use crate::cli::{AssessorEngine, EngineArgs, GeneratorEngine};
use crate::config::{self, AutoCompletionConfig, ConfigOverrides};
use crate::context::LocalFsContextManager;
use crate::error::OrchestratorError;
use crate::generator::{ChapterGenerator, CommandGenerator, OpenAiGenerator};
use crate::manuscript::BookLayout;
use crate::model::RunSummary;
use crate::openai::ResponsesClient;
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::quality::{CommandAssessor, HeuristicAssessor, QualityAssessor};

/// Wires engine flags into orchestrators for one or more books.
#[derive(Debug, Clone)]
pub struct BookRunner {
    engine: EngineArgs,
}

impl BookRunner {
    pub fn new(engine: EngineArgs) -> Self {
        Self { engine }
    }

    pub fn collaborators(
        &self,
        layout: &BookLayout,
        config: &AutoCompletionConfig,
    ) -> anyhow::Result<Collaborators> {
        let generator: Arc<dyn ChapterGenerator> = match self.engine.engine {
            GeneratorEngine::Command => {
                let program = self
                    .engine
                    .generator_cmd
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--generator-cmd is required with --engine command"))?;
                Arc::new(CommandGenerator::new(program, self.engine.generator_args.clone()))
            }
            GeneratorEngine::Openai => {
                let client = ResponsesClient::from_env(
                    &self.engine.openai_base_url,
                    self.engine.openai_model.clone(),
                    self.engine.openai_temperature,
                    config.generation_timeout(),
                )
                .context("configure OpenAI client")?;
                Arc::new(OpenAiGenerator::new(client))
            }
        };

        let assessor: Arc<dyn QualityAssessor> = match self.engine.assessor {
            AssessorEngine::Heuristic => {
                Arc::new(HeuristicAssessor::new(config.target_words_per_chapter()))
            }
            AssessorEngine::Command => {
                let program = self
                    .engine
                    .assessor_cmd
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--assessor-cmd is required with --assessor command"))?;
                Arc::new(CommandAssessor::new(program, self.engine.assessor_args.clone()))
            }
        };

        Ok(Collaborators {
            generator,
            assessor,
            context: Arc::new(LocalFsContextManager::new(layout.clone())),
        })
    }

    pub async fn start(&self, book_dir: &Path, overrides: &ConfigOverrides) -> anyhow::Result<RunSummary> {
        let config = config::load_book_config(book_dir, overrides)?;
        let layout = BookLayout::new(book_dir);
        let collaborators = self.collaborators(&layout, &config)?;
        tracing::info!(
            book = %book_dir.display(),
            chapters = config.target_chapter_count,
            words = config.target_word_count,
            min_quality = config.minimum_quality_score,
            "start run"
        );
        Orchestrator::new(layout, config, collaborators).start().await
    }

    /// Reopens the book's persisted run with collaborators sized from the
    /// run's stored config rather than the current `autobook.yaml`.
    pub async fn open(&self, book_dir: &Path) -> anyhow::Result<Orchestrator> {
        let layout = BookLayout::new(book_dir);
        let run = LocalFsRunStore::new(&layout)
            .load()
            .await
            .context("load run")?
            .ok_or_else(|| OrchestratorError::NoRun {
                path: layout.run_path(),
            })?;
        let collaborators = self.collaborators(&layout, &run.config)?;
        Orchestrator::open(layout, collaborators).await
    }

    pub async fn resume(&self, book_dir: &Path, force: bool) -> anyhow::Result<RunSummary> {
        let mut orchestrator = self.open(book_dir).await?;
        tracing::info!(
            book = %book_dir.display(),
            state = %orchestrator.state(),
            force,
            "resume run"
        );
        orchestrator.resume_with(force).await
    }

    /// Starts every book through `pool`. Results come back in input order.
    pub async fn start_batch(
        &self,
        pool: &JobPool,
        books: &[PathBuf],
        overrides: &ConfigOverrides,
    ) -> anyhow::Result<Vec<(PathBuf, anyhow::Result<RunSummary>)>> {
        tracing::info!(books = books.len(), workers = pool.workers(), "start batch");
        let mut handles = Vec::with_capacity(books.len());
        for book in books {
            let runner = self.clone();
            let book_dir = book.clone();
            let overrides = overrides.clone();
            let handle = pool
                .submit(async move { runner.start(&book_dir, &overrides).await })
                .await?;
            handles.push((book.clone(), handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (book, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => Err(anyhow::anyhow!("book task panicked: {err}")),
            };
            results.push((book, result));
        }
        Ok(results)
    }
}
