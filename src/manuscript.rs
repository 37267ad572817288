use std::path::{Path, PathBuf};

use anyhow::Context as _;
use sha2::Digest as _;

pub const CHAPTERS_DIR: &str = "chapters";
pub const STATE_DIR: &str = "state";
pub const BACKUPS_DIR: &str = "backups";
pub const DRAFTS_DIR: &str = "drafts";

pub const RUN_FILE: &str = "run.json";
pub const CONTROL_FILE: &str = "control.json";
pub const CONTEXT_FILE: &str = "context.json";
pub const LEASE_FILE: &str = "lease.json";

/// State documents owned by the orchestrator; never captured or restored by recovery.
pub const ORCHESTRATOR_STATE_FILES: &[&str] = &[RUN_FILE, CONTROL_FILE, LEASE_FILE];

/// Paths of one book workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookLayout {
    root: PathBuf,
}

impl BookLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chapters_dir(&self) -> PathBuf {
        self.root.join(CHAPTERS_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    /// Rejected drafts of failed chapters; never read back by the pipeline.
    pub fn drafts_dir(&self) -> PathBuf {
        self.root.join(DRAFTS_DIR)
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.state_dir().join("recovery")
    }

    pub fn run_path(&self) -> PathBuf {
        self.state_dir().join(RUN_FILE)
    }

    pub fn control_path(&self) -> PathBuf {
        self.state_dir().join(CONTROL_FILE)
    }

    /// Held by the one process currently driving the run.
    pub fn lease_path(&self) -> PathBuf {
        self.state_dir().join(LEASE_FILE)
    }

    pub fn context_path(&self) -> PathBuf {
        self.state_dir().join(CONTEXT_FILE)
    }

    pub fn recovery_points_path(&self) -> PathBuf {
        self.recovery_dir().join("points.json")
    }

    pub fn failure_log_path(&self) -> PathBuf {
        self.recovery_dir().join("failures.json")
    }

    pub fn chapter_path(&self, chapter_number: u32) -> PathBuf {
        self.chapters_dir().join(chapter_file_name(chapter_number))
    }

    /// Top-level `*.json` documents in `state/` that recovery snapshots and restores.
    pub fn tracked_state_files(&self) -> anyhow::Result<Vec<String>> {
        let state_dir = self.state_dir();
        let entries = match std::fs::read_dir(&state_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read state dir: {}", state_dir.display()));
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || ORCHESTRATOR_STATE_FILES.contains(&name.as_str()) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

pub fn chapter_file_name(chapter_number: u32) -> String {
    format!("chapter-{chapter_number:02}.md")
}

pub fn parse_chapter_file_name(file_name: &str) -> Option<u32> {
    let digits = file_name.strip_prefix("chapter-")?.strip_suffix(".md")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}

/// Chapter files on disk, ascending by chapter number.
pub fn list_chapters(chapters_dir: &Path) -> anyhow::Result<Vec<(u32, PathBuf)>> {
    let entries = match std::fs::read_dir(chapters_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read chapters dir: {}", chapters_dir.display()));
        }
    };

    let mut chapters = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(number) = parse_chapter_file_name(&name.to_string_lossy()) else {
            continue;
        };
        chapters.push((number, entry.path()));
    }
    chapters.sort_by_key(|(number, _)| *number);
    Ok(chapters)
}

pub fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManuscriptStats {
    pub chapter_count: u32,
    pub word_count: u64,
}

pub fn manuscript_stats(layout: &BookLayout) -> anyhow::Result<ManuscriptStats> {
    let mut stats = ManuscriptStats::default();
    for (_, path) in list_chapters(&layout.chapters_dir())? {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read chapter: {}", path.display()))?;
        stats.chapter_count += 1;
        stats.word_count += count_words(&text);
    }
    Ok(stats)
}

pub fn read_chapter(layout: &BookLayout, chapter_number: u32) -> anyhow::Result<Option<String>> {
    let path = layout.chapter_path(chapter_number);
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read chapter: {}", path.display())),
    }
}

pub fn write_chapter(
    layout: &BookLayout,
    chapter_number: u32,
    text: &str,
) -> anyhow::Result<PathBuf> {
    let path = layout.chapter_path(chapter_number);
    write_atomic(&path, text.as_bytes())?;
    Ok(path)
}

/// Returns whether a file was removed.
pub fn remove_chapter(layout: &BookLayout, chapter_number: u32) -> anyhow::Result<bool> {
    let path = layout.chapter_path(chapter_number);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove chapter: {}", path.display())),
    }
}

/// Moves chapter `n` out of the manuscript into `drafts/`, stamped so earlier
/// rejects are kept. Returns the new path, or `None` when there was no file.
pub fn shelve_chapter(layout: &BookLayout, chapter_number: u32) -> anyhow::Result<Option<PathBuf>> {
    let path = layout.chapter_path(chapter_number);
    if !path.is_file() {
        return Ok(None);
    }
    let drafts = layout.drafts_dir();
    std::fs::create_dir_all(&drafts)
        .with_context(|| format!("create drafts dir: {}", drafts.display()))?;
    let target = drafts.join(format!(
        "chapter-{chapter_number:02}.{}.md",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
    ));
    std::fs::rename(&path, &target)
        .with_context(|| format!("shelve chapter draft: {}", path.display()))?;
    Ok(Some(target))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(bytes))
}

pub fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read: {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse json: {}", path.display()))?;
    Ok(Some(value))
}

pub fn write_json_file<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    write_atomic(path, &data)
}

/// Writes through a sibling temp file and renames it over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?
        .to_string_lossy();
    let tmp_path = parent.join(format!(
        ".{file_name}.tmp.{}",
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&tmp_path, data)
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
