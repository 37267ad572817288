//! Checkpoints of manuscript + state, failure classification and rollback.
//!
//! A recovery point is taken after every accepted chapter. Its payload lives in
//! `backups/<stamp>-chNN/` and holds a full copy of `chapters/` plus the
//! tracked state documents at that moment.

mod backup;
pub mod classify;

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use classify::{FailureType, RecoveryAction, Severity};

use crate::context::ContextSnapshot;
use crate::manuscript::{self, BookLayout, CHAPTERS_DIR, STATE_DIR};

pub const DEFAULT_RETENTION: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub timestamp: DateTime<Utc>,
    pub chapter_number: u32,
    pub total_chapters: u32,
    pub total_word_count: u64,
    pub quality_scores: Vec<f64>,
    pub context_hash: String,
    pub state_hash: String,
    /// Path relative to the book root -> SHA-256 hex.
    pub file_checksums: BTreeMap<String, String>,
    pub context_quality: f64,
    /// Directory name under `backups/`.
    pub backup_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub chapter_number: u32,
    pub failure_type: FailureType,
    pub error_message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_hash: Option<String>,
    pub recovery_actions_taken: Vec<RecoveryAction>,
    pub recovery_success: bool,
    pub recovery_duration_secs: Option<f64>,
}

/// How a restore target is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointSelection {
    /// Highest `chapter_number` strictly below the given chapter.
    LatestBefore(u32),
    /// Newest by timestamp.
    MostRecent,
    /// Best-known-good: highest recorded `context_quality`, not recency.
    MaxContextQuality,
}

#[derive(Debug, Clone)]
pub struct RecoverySystem {
    layout: BookLayout,
    retention: usize,
}

impl RecoverySystem {
    pub fn new(layout: BookLayout) -> Self {
        Self::with_retention(layout, DEFAULT_RETENTION)
    }

    pub fn with_retention(layout: BookLayout, retention: usize) -> Self {
        Self {
            layout,
            retention: retention.max(1),
        }
    }

    pub fn recovery_points(&self) -> anyhow::Result<Vec<RecoveryPoint>> {
        Ok(manuscript::read_json_file(&self.layout.recovery_points_path())
            .context("load recovery points")?
            .unwrap_or_default())
    }

    fn save_points(&self, points: &[RecoveryPoint]) -> anyhow::Result<()> {
        manuscript::write_json_file(&self.layout.recovery_points_path(), &points)
            .context("save recovery points")
    }

    pub fn failure_log(&self) -> anyhow::Result<Vec<FailureEvent>> {
        Ok(manuscript::read_json_file(&self.layout.failure_log_path())
            .context("load failure log")?
            .unwrap_or_default())
    }

    fn upsert_failure(&self, event: &FailureEvent) -> anyhow::Result<()> {
        let mut log = self.failure_log()?;
        match log.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => log.push(event.clone()),
        }
        manuscript::write_json_file(&self.layout.failure_log_path(), &log)
            .context("save failure log")
    }

    pub fn create_recovery_point(
        &self,
        chapter_number: u32,
        snapshot: &ContextSnapshot,
    ) -> anyhow::Result<RecoveryPoint> {
        let mut points = self.recovery_points()?;

        let stats = manuscript::manuscript_stats(&self.layout)?;
        let file_checksums = self.checksum_files()?;
        let context_bytes =
            serde_json::to_vec(&snapshot.document).context("serialize context snapshot")?;
        let checksum_bytes = serde_json::to_vec(&file_checksums).context("serialize checksums")?;

        // Strictly increasing timestamps keep "most recent" unambiguous.
        let mut timestamp = Utc::now();
        if let Some(last) = points.iter().map(|p| p.timestamp).max()
            && timestamp <= last
        {
            timestamp = last + Duration::microseconds(1);
        }
        let backup_dir = format!(
            "{}-ch{chapter_number:02}",
            timestamp.format("%Y%m%dT%H%M%S%.6fZ")
        );
        self.write_backup(&backup_dir)
            .with_context(|| format!("back up manuscript for chapter {chapter_number}"))?;

        let point = RecoveryPoint {
            timestamp,
            chapter_number,
            total_chapters: stats.chapter_count,
            total_word_count: stats.word_count,
            quality_scores: quality_scores(&snapshot.document),
            context_hash: manuscript::sha256_hex(&context_bytes),
            state_hash: manuscript::sha256_hex(&checksum_bytes),
            file_checksums,
            context_quality: snapshot.continuity_quality,
            backup_dir,
        };

        points.push(point.clone());
        self.prune(&mut points)?;
        self.save_points(&points)?;

        tracing::info!(
            chapter = chapter_number,
            backup = %point.backup_dir,
            words = point.total_word_count,
            retained = points.len(),
            "recovery point created"
        );
        Ok(point)
    }

    fn checksum_files(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let mut checksums = BTreeMap::new();
        for (_, path) in manuscript::list_chapters(&self.layout.chapters_dir())? {
            let bytes =
                std::fs::read(&path).with_context(|| format!("read: {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            checksums.insert(
                format!("{CHAPTERS_DIR}/{name}"),
                manuscript::sha256_hex(&bytes),
            );
        }
        for name in self.layout.tracked_state_files()? {
            let path = self.layout.state_dir().join(&name);
            let bytes =
                std::fs::read(&path).with_context(|| format!("read: {}", path.display()))?;
            checksums.insert(format!("{STATE_DIR}/{name}"), manuscript::sha256_hex(&bytes));
        }
        Ok(checksums)
    }

    fn write_backup(&self, backup_dir: &str) -> anyhow::Result<()> {
        let backups = self.layout.backups_dir();
        let staging = backups.join(format!(".staging.{}", uuid::Uuid::new_v4().simple()));
        let result = (|| -> anyhow::Result<()> {
            let chapters = self.layout.chapters_dir();
            if chapters.is_dir() {
                backup::copy_dir_recursive(&chapters, &staging.join(CHAPTERS_DIR))?;
            } else {
                std::fs::create_dir_all(staging.join(CHAPTERS_DIR))?;
            }
            let state = staging.join(STATE_DIR);
            std::fs::create_dir_all(&state)?;
            for name in self.layout.tracked_state_files()? {
                let from = self.layout.state_dir().join(&name);
                std::fs::copy(&from, state.join(&name))
                    .with_context(|| format!("copy {}", from.display()))?;
            }
            std::fs::rename(&staging, backups.join(backup_dir))
                .with_context(|| format!("finalize backup {backup_dir}"))?;
            Ok(())
        })();
        if result.is_err() {
            let _ = backup::remove_dir_if_exists(&staging);
        }
        result
    }

    /// Keeps the newest `retention` points and deletes backups nothing references.
    fn prune(&self, points: &mut Vec<RecoveryPoint>) -> anyhow::Result<()> {
        points.sort_by_key(|p| p.timestamp);
        if points.len() > self.retention {
            let excess = points.len() - self.retention;
            points.drain(..excess);
        }

        let backups = self.layout.backups_dir();
        let entries = match std::fs::read_dir(&backups) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("read dir: {}", backups.display()));
            }
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            if points.iter().any(|p| p.backup_dir == name) {
                continue;
            }
            tracing::debug!(backup = %name, "prune recovery backup");
            backup::remove_dir_if_exists(&entry.path())?;
        }
        Ok(())
    }

    pub fn select_point(&self, selection: PointSelection) -> anyhow::Result<Option<RecoveryPoint>> {
        let points = self.recovery_points()?;
        let chosen = match selection {
            PointSelection::LatestBefore(chapter) => points
                .into_iter()
                .filter(|p| p.chapter_number < chapter)
                .max_by_key(|p| (p.chapter_number, p.timestamp)),
            PointSelection::MostRecent => points.into_iter().max_by_key(|p| p.timestamp),
            PointSelection::MaxContextQuality => points.into_iter().max_by(|a, b| {
                a.context_quality
                    .total_cmp(&b.context_quality)
                    .then(a.chapter_number.cmp(&b.chapter_number))
                    .then(a.timestamp.cmp(&b.timestamp))
            }),
        };
        Ok(chosen)
    }

    pub fn find_recovery_point_before_chapter(
        &self,
        chapter: u32,
    ) -> anyhow::Result<Option<RecoveryPoint>> {
        self.select_point(PointSelection::LatestBefore(chapter))
    }

    pub fn analyze_failure(
        &self,
        chapter_number: u32,
        error_message: &str,
        snapshot: Option<&ContextSnapshot>,
    ) -> anyhow::Result<FailureEvent> {
        let context_hash = match snapshot {
            Some(snapshot) => Some(manuscript::sha256_hex(
                &serde_json::to_vec(&snapshot.document).context("serialize context snapshot")?,
            )),
            None => None,
        };
        let event = FailureEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            chapter_number,
            failure_type: classify::classify_failure_type(error_message),
            error_message: error_message.to_owned(),
            severity: classify::classify_severity(error_message),
            context_hash,
            recovery_actions_taken: Vec::new(),
            recovery_success: false,
            recovery_duration_secs: None,
        };
        self.upsert_failure(&event)?;

        tracing::warn!(
            chapter = chapter_number,
            failure_type = ?event.failure_type,
            severity = ?event.severity,
            error = %error_message,
            "chapter failure analyzed"
        );
        Ok(event)
    }

    pub fn suggest_recovery_actions(&self, event: &FailureEvent) -> Vec<RecoveryAction> {
        classify::suggest_actions(event.severity, event.chapter_number, &event.error_message)
    }

    /// Runs every action in order; the result is the AND of all of them. Never errors.
    pub fn execute_recovery(&self, event: &mut FailureEvent, actions: &[RecoveryAction]) -> bool {
        let started = Instant::now();
        let mut success = true;
        for action in actions {
            let ok = match self.execute_action(*action) {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::error!(?action, ?err, "recovery action errored");
                    false
                }
            };
            tracing::info!(chapter = event.chapter_number, ?action, ok, "recovery action");
            event.recovery_actions_taken.push(*action);
            success &= ok;
        }
        event.recovery_success = success;
        event.recovery_duration_secs = Some(started.elapsed().as_secs_f64());

        if let Err(err) = self.upsert_failure(event) {
            tracing::error!(?err, "persist failure event");
        }
        success
    }

    pub fn execute_action(&self, action: RecoveryAction) -> anyhow::Result<bool> {
        match action {
            RecoveryAction::RepairCorruption => self.repair_corruption(),
            RecoveryAction::EmergencyReset => self.emergency_reset(),
            RecoveryAction::RollbackChapter { chapter } => self.rollback_chapter(chapter),
            RecoveryAction::RollbackMultipleChapters { from, count } => {
                self.rollback_multiple_chapters(from, count)
            }
            RecoveryAction::RestoreContext { chapter } => self.restore_context(chapter),
            RecoveryAction::RestoreState { chapter } => self.restore_state(chapter),
        }
    }

    /// Deletes chapter `n` and restores tracked state from the point before it.
    pub fn rollback_chapter(&self, chapter: u32) -> anyhow::Result<bool> {
        let Some(point) = self.find_recovery_point_before_chapter(chapter)? else {
            tracing::warn!(chapter, "rollback: no recovery point before chapter");
            return Ok(false);
        };
        manuscript::remove_chapter(&self.layout, chapter)?;
        self.restore_state_files(&point, None)?;
        Ok(true)
    }

    /// Deletes chapters `max(1, from - count)..=from` and fully restores from
    /// the point before the window start.
    pub fn rollback_multiple_chapters(&self, from: u32, count: u32) -> anyhow::Result<bool> {
        let start = classify::rollback_window_start(from, count);
        let Some(point) = self.find_recovery_point_before_chapter(start)? else {
            tracing::warn!(from, start, "rollback: no recovery point before window");
            return Ok(false);
        };
        for chapter in start..=from {
            manuscript::remove_chapter(&self.layout, chapter)?;
        }
        self.restore_full(&point)?;
        Ok(true)
    }

    pub fn restore_context(&self, chapter: u32) -> anyhow::Result<bool> {
        let Some(point) = self.find_recovery_point_before_chapter(chapter)? else {
            return Ok(false);
        };
        self.restore_state_files(&point, Some(manuscript::CONTEXT_FILE))?;
        Ok(true)
    }

    pub fn restore_state(&self, chapter: u32) -> anyhow::Result<bool> {
        let Some(point) = self.find_recovery_point_before_chapter(chapter)? else {
            return Ok(false);
        };
        self.restore_full(&point)?;
        Ok(true)
    }

    /// Restores every tracked state document that no longer parses as JSON
    /// from the newest recovery point.
    pub fn repair_corruption(&self) -> anyhow::Result<bool> {
        let corrupt: Vec<String> = self
            .layout
            .tracked_state_files()?
            .into_iter()
            .filter(|name| {
                let path = self.layout.state_dir().join(name);
                std::fs::read(&path)
                    .map(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).is_err())
                    .unwrap_or(true)
            })
            .collect();
        if corrupt.is_empty() {
            return Ok(true);
        }

        let Some(point) = self.select_point(PointSelection::MostRecent)? else {
            tracing::error!(files = ?corrupt, "corrupt state and no recovery point");
            return Ok(false);
        };
        let backup_state = self.backup_path(&point).join(STATE_DIR);

        let mut repaired_all = true;
        for name in corrupt {
            let from = backup_state.join(&name);
            let repaired = match std::fs::read(&from) {
                Ok(bytes) if serde_json::from_slice::<serde_json::Value>(&bytes).is_ok() => {
                    manuscript::write_atomic(&self.layout.state_dir().join(&name), &bytes)?;
                    true
                }
                _ => false,
            };
            tracing::info!(file = %name, repaired, backup = %point.backup_dir, "repair state file");
            repaired_all &= repaired;
        }
        Ok(repaired_all)
    }

    /// Full restore from the best-known-good point (see [`PointSelection::MaxContextQuality`]).
    pub fn emergency_reset(&self) -> anyhow::Result<bool> {
        let Some(point) = self.select_point(PointSelection::MaxContextQuality)? else {
            tracing::error!("emergency reset: no recovery points");
            return Ok(false);
        };
        tracing::warn!(
            chapter = point.chapter_number,
            context_quality = point.context_quality,
            backup = %point.backup_dir,
            "emergency reset"
        );
        self.restore_full(&point)?;
        Ok(true)
    }

    fn backup_path(&self, point: &RecoveryPoint) -> std::path::PathBuf {
        self.layout.backups_dir().join(&point.backup_dir)
    }

    fn restore_full(&self, point: &RecoveryPoint) -> anyhow::Result<()> {
        let backup = self.backup_path(point);
        if !backup.is_dir() {
            anyhow::bail!("backup missing for recovery point: {}", backup.display());
        }
        backup::replace_dir_atomic(&backup.join(CHAPTERS_DIR), &self.layout.chapters_dir())
            .context("restore chapters")?;
        self.restore_state_files(point, None)
    }

    /// Writes back the backed-up state documents (all, or only `only`); documents
    /// absent from the backup are removed.
    fn restore_state_files(&self, point: &RecoveryPoint, only: Option<&str>) -> anyhow::Result<()> {
        let backup_state = self.backup_path(point).join(STATE_DIR);
        if !backup_state.is_dir() {
            anyhow::bail!("backup missing for recovery point: {}", backup_state.display());
        }

        let mut names: Vec<String> = self.layout.tracked_state_files()?;
        for entry in std::fs::read_dir(&backup_state)
            .with_context(|| format!("read dir: {}", backup_state.display()))?
        {
            let name = entry?.file_name().to_string_lossy().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if let Some(only) = only {
            names.retain(|n| n == only);
            if names.is_empty() {
                names.push(only.to_owned());
            }
        }

        for name in names {
            let target = self.layout.state_dir().join(&name);
            match std::fs::read(backup_state.join(&name)) {
                Ok(bytes) => manuscript::write_atomic(&target, &bytes)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    match std::fs::remove_file(&target) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("remove: {}", target.display()));
                        }
                    }
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("read backup of {name}"));
                }
            }
        }
        Ok(())
    }
}

fn quality_scores(document: &serde_json::Value) -> Vec<f64> {
    document
        .get("chapters")
        .and_then(|c| c.as_object())
        .map(|chapters| {
            let mut scores: Vec<(u32, f64)> = chapters
                .iter()
                .filter_map(|(k, v)| {
                    Some((k.parse().ok()?, v.get("quality_score")?.as_f64()?))
                })
                .collect();
            scores.sort_by_key(|(n, _)| *n);
            scores.into_iter().map(|(_, s)| s).collect()
        })
        .unwrap_or_default()
}
