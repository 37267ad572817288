//! Run state machine and the quality-gated per-chapter protocol.
//!
//! Chapters are generated strictly one at a time in ascending order; each
//! chapter's context is built from the committed text of the ones before it.
//! Pause/stop requests and the completion detector are consulted only between
//! chapters, never while a collaborator call is in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::Utc;

use crate::app::lease::RunLease;
use crate::app::run_store::{LocalFsRunStore, RunStore};
use crate::completion::CompletionDetector;
use crate::config::AutoCompletionConfig;
use crate::context::ContextManager;
use crate::error::OrchestratorError;
use crate::generator::{ChapterGenerator, GenerationRequest};
use crate::manuscript::{self, BookLayout};
use crate::model::{
    ChapterJob, ChapterJobStatus, ChapterOutcome, ControlRequest, PauseDetails, RunRecord,
    RunState, RunSummary,
};
use crate::quality::{QualityAssessor, QualityReport};
use crate::recovery::RecoverySystem;

/// The three external services a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn ChapterGenerator>,
    pub assessor: Arc<dyn QualityAssessor>,
    pub context: Arc<dyn ContextManager>,
}

pub struct Orchestrator {
    layout: BookLayout,
    config: AutoCompletionConfig,
    store: Arc<dyn RunStore>,
    collaborators: Collaborators,
    recovery: RecoverySystem,
    detector: CompletionDetector,
    run: Option<RunRecord>,
}

enum Attempt {
    Passed { report: QualityReport, word_count: u64 },
    Rejected {
        reason: String,
        report: Option<QualityReport>,
    },
}

impl Orchestrator {
    pub fn new(layout: BookLayout, config: AutoCompletionConfig, collaborators: Collaborators) -> Self {
        let store: Arc<dyn RunStore> = Arc::new(LocalFsRunStore::new(&layout));
        Self {
            recovery: RecoverySystem::new(layout.clone()),
            detector: CompletionDetector::new(layout.clone(), config.completion_criteria()),
            layout,
            config,
            store,
            collaborators,
            run: None,
        }
    }

    /// Reloads the run persisted in `state/run.json`, using its stored config.
    pub async fn open(layout: BookLayout, collaborators: Collaborators) -> anyhow::Result<Self> {
        let store = LocalFsRunStore::new(&layout);
        let Some(mut run) = store.load().await.context("load run")? else {
            return Err(OrchestratorError::NoRun {
                path: layout.run_path(),
            }
            .into());
        };

        requeue_orphans(&mut run);

        let mut orchestrator = Self::new(layout, run.config.clone(), collaborators);
        orchestrator.store = Arc::new(store);
        orchestrator.run = Some(run);
        Ok(orchestrator)
    }

    pub fn state(&self) -> RunState {
        self.run.as_ref().map_or(RunState::NotStarted, |r| r.state)
    }

    pub fn run_record(&self) -> Option<&RunRecord> {
        self.run.as_ref()
    }

    pub fn config(&self) -> &AutoCompletionConfig {
        &self.config
    }

    pub fn recovery(&self) -> &RecoverySystem {
        &self.recovery
    }

    /// Initializes a fresh run and drives it until it completes, pauses, or is stopped.
    pub async fn start(&mut self) -> anyhow::Result<RunSummary> {
        if let Some(run) = &self.run {
            return Err(OrchestratorError::AlreadyStarted {
                run_id: run.run_id.clone(),
                state: run.state,
            }
            .into());
        }
        if let Some(existing) = self.store.load().await.context("load run")?
            && !existing.state.is_terminal()
        {
            return Err(OrchestratorError::RunInProgress {
                run_id: existing.run_id,
                state: existing.state,
            }
            .into());
        }
        self.config.validate().context("validate config")?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let lease = RunLease::acquire(&self.layout, &run_id, false)?;
        let result = self.start_leased(run_id).await;
        lease.release().await;
        result
    }

    async fn start_leased(&mut self, run_id: String) -> anyhow::Result<RunSummary> {
        let now = Utc::now();
        self.run = Some(RunRecord {
            run_id,
            state: RunState::NotStarted,
            config: self.config.clone(),
            jobs: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            stop_reason: None,
            pause: None,
            error: None,
        });
        self.transition(RunState::Initializing)?;
        self.persist().await?;

        match self.initialize().await {
            Ok(()) => self.drive().await,
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        // A request left over from an earlier run must not hit this one.
        if let Some(stale) = self.store.take_control().await? {
            tracing::debug!(?stale, "discarded stale control request");
        }

        let target = self.config.target_chapter_count;
        let mut jobs = Vec::new();
        for chapter in 1..=target {
            if !self.layout.chapter_path(chapter).is_file() {
                jobs.push(ChapterJob::pending(chapter));
            }
        }

        let run = self.run_mut()?;
        run.jobs = jobs;
        tracing::info!(
            run_id = %run.run_id,
            target_chapters = target,
            queued = run.jobs.len(),
            "run initialized"
        );
        self.transition(RunState::Generating)?;
        self.persist().await
    }

    /// Continues a paused run, or a run whose process died while generating.
    pub async fn resume(&mut self) -> anyhow::Result<RunSummary> {
        self.resume_with(false).await
    }

    /// Like [`Orchestrator::resume`]; `force` takes over a lease that still
    /// looks live.
    pub async fn resume_with(&mut self, force: bool) -> anyhow::Result<RunSummary> {
        let run_id = self.run_ref()?.run_id.clone();
        let lease = RunLease::acquire(&self.layout, &run_id, force)?;
        let result = self.resume_leased(run_id).await;
        lease.release().await;
        result
    }

    async fn resume_leased(&mut self, run_id: String) -> anyhow::Result<RunSummary> {
        // Another process may have stopped the run since it was loaded.
        if let Some(mut stored) = self.store.load().await.context("load run")?
            && stored.run_id == run_id
        {
            requeue_orphans(&mut stored);
            self.run = Some(stored);
        }

        let run = self.run_mut()?;
        match run.state {
            RunState::Paused => {
                run.pause = None;
                self.transition(RunState::Generating)?;
            }
            RunState::Generating => {
                tracing::warn!(run_id = %run.run_id, "resuming run interrupted while generating");
            }
            state => {
                return Err(OrchestratorError::NotResumable {
                    run_id: run.run_id.clone(),
                    state,
                }
                .into());
            }
        }
        self.persist().await?;
        self.drive().await
    }

    pub async fn summary(&self) -> anyhow::Result<RunSummary> {
        let run = self
            .run
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("run not started"))?;
        summarize(&self.layout, run)
    }

    async fn drive(&mut self) -> anyhow::Result<RunSummary> {
        match self.run_loop().await {
            Ok(()) => self.summary().await,
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        loop {
            match self.store.take_control().await.context("read control request")? {
                Some(ControlRequest::Pause) => {
                    return self.pause(None, "pause requested".to_owned()).await;
                }
                Some(ControlRequest::Stop) => return self.cancel("stop requested").await,
                None => {}
            }

            let analysis = self
                .detector
                .analyze_completion_status()
                .context("analyze completion")?;
            if !analysis.status.should_continue() {
                tracing::info!(
                    status = analysis.status.as_str(),
                    words = analysis.word_count,
                    chapters = analysis.chapter_count,
                    "completion detector stopped the run"
                );
                self.run_mut()?.stop_reason =
                    Some(format!("completion detector: {}", analysis.status.as_str()));
                return self.finish().await;
            }

            let Some(chapter) = self.run_ref()?.next_pending() else {
                return self.finish().await;
            };

            match self.generate_chapter_with_quality_gates(chapter).await? {
                ChapterOutcome::Completed {
                    word_count,
                    quality_score,
                    attempt,
                    generation_time_secs,
                } => {
                    tracing::info!(
                        chapter,
                        words = word_count,
                        score = quality_score,
                        attempt,
                        secs = generation_time_secs,
                        "chapter completed"
                    );
                }
                ChapterOutcome::Recovered => {
                    tracing::info!(chapter, "chapter recovered; re-attempting");
                }
                ChapterOutcome::Failed { reason } => {
                    tracing::warn!(chapter, %reason, "chapter failed");
                    if self.config.auto_pause_on_failure {
                        return self.pause(Some(chapter), reason).await;
                    }
                }
            }
        }
    }

    /// Runs up to `max_retries_per_chapter + 1` attempts. Attempt failures are
    /// absorbed here; only I/O on the book's own files escapes as `Err`.
    pub async fn generate_chapter_with_quality_gates(
        &mut self,
        chapter: u32,
    ) -> anyhow::Result<ChapterOutcome> {
        let started = Instant::now();
        {
            let job = self.job_mut(chapter)?;
            job.status = ChapterJobStatus::Generating;
            job.start_time = Some(Utc::now());
            job.failure_reason = None;
        }
        self.persist().await?;

        let max_retries = self.config.max_retries_per_chapter;
        let mut focus: Option<(String, f64)> = None;
        let mut last_failure = String::new();

        for attempt in 0..=max_retries {
            if attempt > 0 {
                self.job_mut(chapter)?.retry_count = attempt;
                self.persist().await?;
            }

            match self.attempt_chapter(chapter, attempt, focus.as_ref()).await? {
                Attempt::Passed { report, word_count } => {
                    let quality_score = report.overall_score();
                    self.commit_chapter(chapter, &report).await?;
                    return Ok(ChapterOutcome::Completed {
                        word_count,
                        quality_score,
                        attempt,
                        generation_time_secs: started.elapsed().as_secs_f64(),
                    });
                }
                Attempt::Rejected { reason, report } => {
                    tracing::warn!(chapter, attempt, %reason, "chapter attempt failed");
                    last_failure = reason;
                    if self.config.context_improvement_enabled
                        && let Some(report) = report
                    {
                        focus = report
                            .weakest_category()
                            .map(|(category, score)| (category.to_owned(), score));
                    }
                }
            }
        }

        let attempts = max_retries.saturating_add(1);
        let reason = format!("chapter {chapter} failed after {attempts} attempts: {last_failure}");
        self.fail_chapter(chapter, reason).await
    }

    async fn attempt_chapter(
        &self,
        chapter: u32,
        attempt: u32,
        focus: Option<&(String, f64)>,
    ) -> anyhow::Result<Attempt> {
        let mut context = match self
            .collaborators
            .context
            .build_context(chapter, attempt)
            .await
        {
            Ok(context) => context,
            Err(err) => {
                return Ok(Attempt::Rejected {
                    reason: format!("context build failed: {err:#}"),
                    report: None,
                });
            }
        };
        if let Some((category, score)) = focus {
            context = context.with_focus_improvement(category, *score);
        }

        let request = GenerationRequest {
            chapter_number: chapter,
            target_words: self.config.target_words_per_chapter(),
            context,
        };
        let generated = match with_timeout(
            self.config.generation_timeout(),
            "generation",
            self.collaborators.generator.generate(&request),
        )
        .await
        {
            Ok(generated) => generated,
            Err(err) => {
                return Ok(Attempt::Rejected {
                    reason: format!("{err:#}"),
                    report: None,
                });
            }
        };

        manuscript::write_chapter(&self.layout, chapter, &generated.content)
            .with_context(|| format!("write chapter {chapter}"))?;

        let report = match with_timeout(
            self.config.assessment_timeout(),
            "quality assessment",
            self.collaborators.assessor.assess(&generated.content, chapter),
        )
        .await
        {
            Ok(report) => report,
            Err(err) => {
                return Ok(Attempt::Rejected {
                    reason: format!("{err:#}"),
                    report: None,
                });
            }
        };

        let score = report.overall_score();
        tracing::debug!(chapter, attempt, score, "chapter assessed");
        if report.passes(self.config.minimum_quality_score) {
            return Ok(Attempt::Passed {
                word_count: manuscript::count_words(&generated.content),
                report,
            });
        }
        Ok(Attempt::Rejected {
            reason: format!(
                "quality gate not met: score {score:.1} below {:.1}",
                self.config.minimum_quality_score
            ),
            report: Some(report),
        })
    }

    /// Marks the job completed, feeds the context manager, then checkpoints.
    async fn commit_chapter(&mut self, chapter: u32, report: &QualityReport) -> anyhow::Result<()> {
        let text = manuscript::read_chapter(&self.layout, chapter)?
            .ok_or_else(|| anyhow::anyhow!("chapter {chapter} vanished before commit"))?;
        self.collaborators
            .context
            .record_chapter(chapter, &text, report)
            .await
            .with_context(|| format!("record chapter {chapter} in context"))?;
        let snapshot = self
            .collaborators
            .context
            .snapshot()
            .await
            .context("snapshot context")?;
        self.recovery
            .create_recovery_point(chapter, &snapshot)
            .with_context(|| format!("checkpoint chapter {chapter}"))?;

        let job = self.job_mut(chapter)?;
        job.status = ChapterJobStatus::Completed;
        job.completion_time = Some(Utc::now());
        job.quality_score = Some(report.overall_score());
        self.persist().await
    }

    /// Retries are exhausted: shelve the last draft, record the failure, and
    /// run automated recovery when the severity calls for it.
    async fn fail_chapter(&mut self, chapter: u32, reason: String) -> anyhow::Result<ChapterOutcome> {
        if let Some(draft) = manuscript::shelve_chapter(&self.layout, chapter)? {
            tracing::info!(chapter, draft = %draft.display(), "rejected draft shelved");
        }
        {
            let job = self.job_mut(chapter)?;
            job.status = ChapterJobStatus::Failed;
            job.failure_reason = Some(reason.clone());
        }
        self.persist().await?;

        let snapshot = match self.collaborators.context.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(chapter, ?err, "context snapshot unavailable for failure analysis");
                None
            }
        };
        let mut event = self
            .recovery
            .analyze_failure(chapter, &reason, snapshot.as_ref())
            .context("analyze failure")?;
        if !event.severity.warrants_recovery() {
            return Ok(ChapterOutcome::Failed { reason });
        }

        let cap = self.config.max_recovery_attempts_per_chapter;
        let used = self.job_mut(chapter)?.recovery_attempts;
        if used >= cap {
            tracing::warn!(chapter, used, cap, "recovery attempts exhausted");
            return Ok(ChapterOutcome::Failed { reason });
        }
        self.job_mut(chapter)?.recovery_attempts = used + 1;

        let actions = self.recovery.suggest_recovery_actions(&event);
        let recovered = self.recovery.execute_recovery(&mut event, &actions);
        tracing::info!(
            chapter,
            severity = ?event.severity,
            actions = actions.len(),
            recovered,
            "recovery executed"
        );
        if !recovered {
            self.persist().await?;
            return Ok(ChapterOutcome::Failed { reason });
        }

        self.job_mut(chapter)?.reset_to_pending();
        self.reconcile_with_disk()?;
        self.persist().await?;
        Ok(ChapterOutcome::Recovered)
    }

    /// Requeues every chapter a restore took off disk.
    fn reconcile_with_disk(&mut self) -> anyhow::Result<()> {
        let target = self.config.target_chapter_count;
        let layout = self.layout.clone();
        let run = self.run_mut()?;
        for chapter in 1..=target {
            if layout.chapter_path(chapter).is_file() {
                continue;
            }
            match run.job_mut(chapter) {
                Some(job) if job.status == ChapterJobStatus::Completed => {
                    tracing::info!(chapter, "completed chapter removed by recovery; requeued");
                    job.reset_to_pending();
                }
                Some(_) => {}
                None => run.jobs.push(ChapterJob::pending(chapter)),
            }
        }
        run.jobs.sort_by_key(|j| j.chapter_number);
        Ok(())
    }

    async fn pause(&mut self, chapter: Option<u32>, reason: String) -> anyhow::Result<()> {
        self.transition(RunState::Paused)?;
        let run = self.run_mut()?;
        tracing::info!(run_id = %run.run_id, ?chapter, %reason, "run paused");
        run.pause = Some(PauseDetails {
            chapter_number: chapter,
            reason,
            paused_at: Utc::now(),
        });
        self.persist().await
    }

    async fn cancel(&mut self, reason: &str) -> anyhow::Result<()> {
        self.transition(RunState::Cancelled)?;
        let run = self.run_mut()?;
        tracing::info!(run_id = %run.run_id, reason, "run cancelled");
        run.stop_reason = Some(reason.to_owned());
        run.finished_at = Some(Utc::now());
        self.persist().await
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        self.transition(RunState::Completed)?;
        let run = self.run_mut()?;
        run.finished_at = Some(Utc::now());
        tracing::info!(
            run_id = %run.run_id,
            completed = run.count(ChapterJobStatus::Completed),
            failed = run.count(ChapterJobStatus::Failed),
            "run completed"
        );
        self.persist().await
    }

    /// Best effort: the original error is what the caller sees.
    async fn fail(&mut self, err: &anyhow::Error) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        tracing::error!(run_id = %run.run_id, ?err, "run failed");
        if !run.state.can_transition_to(RunState::Failed) {
            return;
        }
        run.state = RunState::Failed;
        run.error = Some(format!("{err:#}"));
        run.finished_at = Some(Utc::now());
        if let Err(persist_err) = self.persist().await {
            tracing::error!(?persist_err, "persist failed run");
        }
    }

    fn transition(&mut self, to: RunState) -> anyhow::Result<()> {
        let run = self.run_mut()?;
        let from = run.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition { from, to }.into());
        }
        tracing::debug!(run_id = %run.run_id, %from, %to, "run state transition");
        run.state = to;
        Ok(())
    }

    async fn persist(&mut self) -> anyhow::Result<()> {
        let run = self.run_mut()?;
        run.updated_at = Utc::now();
        let run = run.clone();
        self.store.put(&run).await.context("save run")
    }

    fn run_ref(&self) -> anyhow::Result<&RunRecord> {
        self.run
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("run not started"))
    }

    fn run_mut(&mut self) -> anyhow::Result<&mut RunRecord> {
        self.run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("run not started"))
    }

    fn job_mut(&mut self, chapter: u32) -> anyhow::Result<&mut ChapterJob> {
        self.run_mut()?
            .job_mut(chapter)
            .ok_or_else(|| anyhow::anyhow!("no job for chapter {chapter}"))
    }
}

/// Jobs left `generating` by a process that died mid-chapter go back to `pending`.
fn requeue_orphans(run: &mut RunRecord) {
    if run.state.is_terminal() {
        return;
    }
    for job in run
        .jobs
        .iter_mut()
        .filter(|j| j.status == ChapterJobStatus::Generating)
    {
        tracing::warn!(
            run_id = %run.run_id,
            chapter = job.chapter_number,
            "orphaned chapter job reset to pending"
        );
        job.reset_to_pending();
    }
}

/// Out-of-process handle on a book's run: what `status`, `pause` and `stop`
/// need, without any collaborators.
#[derive(Debug, Clone)]
pub struct RunControl {
    layout: BookLayout,
    store: LocalFsRunStore,
}

impl RunControl {
    pub fn new(layout: BookLayout) -> Self {
        Self {
            store: LocalFsRunStore::new(&layout),
            layout,
        }
    }

    pub async fn load(&self) -> anyhow::Result<RunRecord> {
        self.store
            .load()
            .await
            .context("load run")?
            .ok_or_else(|| {
                OrchestratorError::NoRun {
                    path: self.layout.run_path(),
                }
                .into()
            })
    }

    pub async fn status(&self) -> anyhow::Result<RunSummary> {
        summarize(&self.layout, &self.load().await?)
    }

    /// Asks a generating run to pause at the next chapter boundary.
    pub async fn pause(&self) -> anyhow::Result<RunState> {
        let run = self.load().await?;
        if run.state != RunState::Generating {
            return Err(OrchestratorError::InvalidTransition {
                from: run.state,
                to: RunState::Paused,
            }
            .into());
        }
        self.store.request_control(ControlRequest::Pause).await?;
        tracing::info!(run_id = %run.run_id, "pause requested");
        Ok(run.state)
    }

    /// A generating run is asked to stop at the next chapter boundary; a
    /// paused run has no loop to observe the request and is cancelled here.
    pub async fn stop(&self) -> anyhow::Result<RunState> {
        let mut run = self.load().await?;
        match run.state {
            RunState::Generating => {
                self.store.request_control(ControlRequest::Stop).await?;
                tracing::info!(run_id = %run.run_id, "stop requested");
                Ok(RunState::Generating)
            }
            RunState::Paused => {
                let now = Utc::now();
                run.state = RunState::Cancelled;
                run.stop_reason = Some("stop requested while paused".to_owned());
                run.finished_at = Some(now);
                run.updated_at = now;
                self.store.put(&run).await?;
                tracing::info!(run_id = %run.run_id, "paused run cancelled");
                Ok(RunState::Cancelled)
            }
            from => Err(OrchestratorError::InvalidTransition {
                from,
                to: RunState::Cancelled,
            }
            .into()),
        }
    }
}

/// A collaborator call bounded by `limit`; expiry is an error mentioning "timeout".
async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    call: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "{what} timeout after {}s",
            limit.as_secs_f64()
        )),
    }
}

pub fn summarize(layout: &BookLayout, run: &RunRecord) -> anyhow::Result<RunSummary> {
    let stats = manuscript::manuscript_stats(layout)?;
    let target = run.config.target_chapter_count.max(1);
    let chapters_failed = run.count(ChapterJobStatus::Failed);
    Ok(RunSummary {
        run_id: run.run_id.clone(),
        state: run.state,
        completed_with_failures: run.state == RunState::Completed && chapters_failed > 0,
        chapters_on_disk: stats.chapter_count,
        chapters_completed: run.count(ChapterJobStatus::Completed),
        chapters_failed,
        chapters_pending: run.count(ChapterJobStatus::Pending),
        total_words: stats.word_count,
        progress_percent: (stats.chapter_count.min(target) * 100) / target,
        stop_reason: run.stop_reason.clone(),
        pause: run.pause.clone(),
        error: run.error.clone(),
    })
}
