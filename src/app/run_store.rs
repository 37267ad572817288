use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::manuscript::{self, BookLayout};
use crate::model::{ControlRequest, RunRecord};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<RunRecord>>;
    async fn put(&self, run: &RunRecord) -> anyhow::Result<()>;
    async fn request_control(&self, request: ControlRequest) -> anyhow::Result<()>;
    async fn pending_control(&self) -> anyhow::Result<Option<ControlRequest>>;
    /// Reads and clears the pending request.
    async fn take_control(&self) -> anyhow::Result<Option<ControlRequest>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControlDocument {
    request: ControlRequest,
    requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LocalFsRunStore {
    run_path: PathBuf,
    control_path: PathBuf,
}

impl LocalFsRunStore {
    pub fn new(layout: &BookLayout) -> Self {
        Self {
            run_path: layout.run_path(),
            control_path: layout.control_path(),
        }
    }

    async fn read_control(&self) -> anyhow::Result<Option<ControlDocument>> {
        let path = self.control_path.clone();
        blocking(move || manuscript::read_json_file::<ControlDocument>(&path)).await
    }
}

#[async_trait]
impl RunStore for LocalFsRunStore {
    async fn load(&self) -> anyhow::Result<Option<RunRecord>> {
        let path = self.run_path.clone();
        blocking(move || manuscript::read_json_file::<RunRecord>(&path)).await
    }

    async fn put(&self, run: &RunRecord) -> anyhow::Result<()> {
        let path = self.run_path.clone();
        let run = run.clone();
        blocking(move || manuscript::write_json_file(&path, &run))
            .await
            .context("write run.json")
    }

    async fn request_control(&self, request: ControlRequest) -> anyhow::Result<()> {
        let existing = self.read_control().await?;
        // Stop is never downgraded to pause.
        if let Some(existing) = existing
            && existing.request == ControlRequest::Stop
        {
            return Ok(());
        }
        let doc = ControlDocument {
            request,
            requested_at: Utc::now(),
        };
        let path = self.control_path.clone();
        blocking(move || manuscript::write_json_file(&path, &doc))
            .await
            .context("write control.json")
    }

    async fn pending_control(&self) -> anyhow::Result<Option<ControlRequest>> {
        Ok(self.read_control().await?.map(|d| d.request))
    }

    async fn take_control(&self) -> anyhow::Result<Option<ControlRequest>> {
        let request = self.pending_control().await?;
        if request.is_some() {
            match fs::remove_file(&self.control_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("remove control file: {}", self.control_path.display())
                    });
                }
            }
        }
        Ok(request)
    }
}

/// File I/O for the run documents goes through the shared JSON helpers on
/// the blocking pool.
async fn blocking<T, F>(task: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("join file task")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_request_is_consumed_once() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsRunStore::new(&BookLayout::new(temp.path()));

        assert_eq!(store.take_control().await?, None);
        store.request_control(ControlRequest::Pause).await?;
        assert_eq!(store.pending_control().await?, Some(ControlRequest::Pause));
        assert_eq!(store.take_control().await?, Some(ControlRequest::Pause));
        assert_eq!(store.take_control().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn stop_is_not_downgraded_by_a_later_pause() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsRunStore::new(&BookLayout::new(temp.path()));

        store.request_control(ControlRequest::Stop).await?;
        store.request_control(ControlRequest::Pause).await?;
        assert_eq!(store.take_control().await?, Some(ControlRequest::Stop));
        Ok(())
    }

    #[tokio::test]
    async fn run_record_is_written_through_the_manuscript_helpers() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let layout = BookLayout::new(temp.path());
        let store = LocalFsRunStore::new(&layout);
        let now = Utc::now();
        let run = RunRecord {
            run_id: "r1".to_owned(),
            state: crate::model::RunState::Generating,
            config: crate::config::AutoCompletionConfig::default(),
            jobs: vec![crate::model::ChapterJob::pending(1)],
            created_at: now,
            updated_at: now,
            finished_at: None,
            stop_reason: None,
            pause: None,
            error: None,
        };

        store.put(&run).await?;
        store.put(&run).await?;
        let on_disk: Option<RunRecord> = manuscript::read_json_file(&layout.run_path())?;
        assert_eq!(on_disk.as_ref(), Some(&run));
        assert_eq!(store.load().await?, Some(run));

        let names: Vec<String> = std::fs::read_dir(layout.run_path().parent().expect("state dir"))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec!["run.json".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_run_loads_as_none() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsRunStore::new(&BookLayout::new(temp.path()));
        assert!(store.load().await?.is_none());
        Ok(())
    }
}
