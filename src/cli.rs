use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ConfigOverrides;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Log at debug level (RUST_LOG still wins).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a new run and block until it completes, pauses, or is stopped.
    Start(StartArgs),
    /// Print the state and progress of the book's run.
    Status(BookArgs),
    /// Ask a generating run to pause after the current chapter.
    Pause(BookArgs),
    /// Continue a paused (or interrupted) run.
    Resume(ResumeArgs),
    /// Stop a run; a paused run is cancelled immediately.
    Stop(BookArgs),
    /// Run several books through a bounded worker pool.
    Batch(BatchArgs),
    /// Print the completion analysis of a manuscript.
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct BookArgs {
    /// Book directory (holds `chapters/`, `state/` and `autobook.yaml`).
    #[arg(long, default_value = ".")]
    pub book: PathBuf,
}

#[derive(Debug, Args)]
pub struct StartArgs {
    #[command(flatten)]
    pub book: BookArgs,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Args)]
pub struct ResumeArgs {
    #[command(flatten)]
    pub book: BookArgs,

    /// Take over a run whose lease still looks held by a live process.
    #[arg(long)]
    pub force: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// Book directories; each is started with its own `autobook.yaml`.
    #[arg(required = true)]
    pub books: Vec<PathBuf>,

    /// Worker count (default: `AUTOBOOK_MAX_CONCURRENCY`, else 2).
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub book: BookArgs,

    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Per-run overrides layered over `autobook.yaml`.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Target chapter count.
    #[arg(long)]
    pub chapters: Option<u32>,

    /// Target word count for the whole book.
    #[arg(long)]
    pub words: Option<u64>,

    /// Word count above which the book is over target (default: target × 1.125).
    #[arg(long)]
    pub max_words: Option<u64>,

    /// Quality gate threshold (0-100).
    #[arg(long)]
    pub min_quality: Option<f64>,

    /// Retries per chapter after the first attempt.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Pause the run after any chapter fails.
    #[arg(long)]
    pub auto_pause: bool,

    /// Retry with the same context instead of focusing the weakest category.
    #[arg(long)]
    pub no_context_improvement: bool,

    /// Seconds allowed per generator call.
    #[arg(long)]
    pub generation_timeout_secs: Option<u64>,

    /// Seconds allowed per quality assessment.
    #[arg(long)]
    pub assessment_timeout_secs: Option<u64>,
}

impl ConfigArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            target_word_count: self.words,
            target_chapter_count: self.chapters,
            minimum_quality_score: self.min_quality,
            max_retries_per_chapter: self.max_retries,
            auto_pause_on_failure: self.auto_pause.then_some(true),
            context_improvement_enabled: self.no_context_improvement.then_some(false),
            generation_timeout_secs: self.generation_timeout_secs,
            assessment_timeout_secs: self.assessment_timeout_secs,
            maximum_word_count: self.max_words,
            ..ConfigOverrides::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GeneratorEngine {
    /// Spawn `--generator-cmd`: prompt on stdin, chapter Markdown on stdout.
    Command,
    /// OpenAI Responses API (`OPENAI_API_KEY`).
    Openai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AssessorEngine {
    /// Built-in structural scorer.
    Heuristic,
    /// Spawn `--assessor-cmd`: chapter on stdin, JSON report on stdout.
    Command,
}

#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    #[arg(long, value_enum, default_value_t = GeneratorEngine::Command)]
    pub engine: GeneratorEngine,

    /// Generator program for `--engine command`.
    #[arg(long)]
    pub generator_cmd: Option<String>,

    /// Argument passed to the generator program (repeatable).
    #[arg(long = "generator-arg", allow_hyphen_values = true)]
    pub generator_args: Vec<String>,

    #[arg(long, value_enum, default_value_t = AssessorEngine::Heuristic)]
    pub assessor: AssessorEngine,

    /// Assessor program for `--assessor command`.
    #[arg(long)]
    pub assessor_cmd: Option<String>,

    /// Argument passed to the assessor program (repeatable).
    #[arg(long = "assessor-arg", allow_hyphen_values = true)]
    pub assessor_args: Vec<String>,

    /// OpenAI API base URL.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// OpenAI model.
    #[arg(long, default_value = "gpt-4.1-mini")]
    pub openai_model: String,

    /// Sampling temperature (ignored by GPT-5 models).
    #[arg(long, default_value_t = 0.7)]
    pub openai_temperature: f32,
}
