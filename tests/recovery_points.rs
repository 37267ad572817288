use autobook::context::ContextSnapshot;
use autobook::manuscript::{self, BookLayout};
use autobook::recovery::{PointSelection, RecoveryAction, RecoverySystem};

fn snapshot(quality: f64) -> ContextSnapshot {
    ContextSnapshot {
        document: serde_json::json!({ "chapters": {} }),
        continuity_quality: quality,
    }
}

fn write_context(layout: &BookLayout, marker: u32) -> anyhow::Result<()> {
    manuscript::write_json_file(
        &layout.context_path(),
        &serde_json::json!({ "chapters": {}, "marker": marker }),
    )
}

fn context_marker(layout: &BookLayout) -> anyhow::Result<Option<u64>> {
    let value: Option<serde_json::Value> = manuscript::read_json_file(&layout.context_path())?;
    Ok(value.and_then(|v| v.get("marker").and_then(|m| m.as_u64())))
}

/// Writes chapters 1..=n, checkpointing after each.
fn build(layout: &BookLayout, recovery: &RecoverySystem, n: u32) -> anyhow::Result<()> {
    for chapter in 1..=n {
        manuscript::write_chapter(layout, chapter, &format!("chapter {chapter} text"))?;
        write_context(layout, chapter)?;
        let point = recovery.create_recovery_point(chapter, &snapshot(f64::from(chapter) / 100.0))?;
        assert_eq!(point.chapter_number, chapter);
    }
    Ok(())
}

#[test]
fn retention_keeps_the_twenty_newest_points_and_their_backups() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    build(&layout, &recovery, 25)?;

    let points = recovery.recovery_points()?;
    assert_eq!(points.len(), 20);
    let chapters: Vec<u32> = points.iter().map(|p| p.chapter_number).collect();
    assert_eq!(chapters, (6..=25).collect::<Vec<_>>());
    assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let mut backups: Vec<String> = std::fs::read_dir(layout.backups_dir())?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
        .collect::<Result<_, _>>()?;
    backups.sort();
    let mut expected: Vec<String> = points.iter().map(|p| p.backup_dir.clone()).collect();
    expected.sort();
    assert_eq!(backups, expected);
    Ok(())
}

#[test]
fn point_records_manuscript_fingerprints() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    build(&layout, &recovery, 2)?;

    let point = recovery
        .select_point(PointSelection::MostRecent)?
        .expect("point");
    assert_eq!(point.total_chapters, 2);
    assert_eq!(point.total_word_count, 6);
    assert!(point.file_checksums.contains_key("chapters/chapter-01.md"));
    assert!(point.file_checksums.contains_key("state/context.json"));
    assert!(!point.file_checksums.keys().any(|k| k.ends_with("run.json")));
    assert_eq!(point.context_hash.len(), 64);
    assert_eq!(point.state_hash.len(), 64);
    Ok(())
}

#[test]
fn find_before_chapter_is_max_strictly_below() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    assert!(recovery.find_recovery_point_before_chapter(5)?.is_none());
    build(&layout, &recovery, 3)?;

    assert!(recovery.find_recovery_point_before_chapter(1)?.is_none());
    let first = recovery.find_recovery_point_before_chapter(3)?.expect("point");
    assert_eq!(first.chapter_number, 2);
    let again = recovery.find_recovery_point_before_chapter(3)?.expect("point");
    assert_eq!(first, again);
    assert_eq!(
        recovery
            .find_recovery_point_before_chapter(99)?
            .map(|p| p.chapter_number),
        Some(3)
    );
    Ok(())
}

#[test]
fn rollback_chapter_removes_it_and_restores_state() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    build(&layout, &recovery, 3)?;

    assert!(recovery.execute_action(RecoveryAction::RollbackChapter { chapter: 3 })?);
    assert!(manuscript::read_chapter(&layout, 3)?.is_none());
    assert!(manuscript::read_chapter(&layout, 2)?.is_some());
    assert_eq!(context_marker(&layout)?, Some(2));
    Ok(())
}

#[test]
fn rollback_multiple_chapters_restores_the_window_start() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    build(&layout, &recovery, 5)?;
    // An unsaved draft that a full restore must discard.
    manuscript::write_chapter(&layout, 6, "draft")?;

    assert!(recovery.rollback_multiple_chapters(5, 2)?);
    let left: Vec<u32> = manuscript::list_chapters(&layout.chapters_dir())?
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert_eq!(left, vec![1, 2]);
    assert_eq!(context_marker(&layout)?, Some(2));

    // No point precedes a window starting at chapter 1.
    assert!(!recovery.rollback_multiple_chapters(2, 2)?);
    Ok(())
}

#[test]
fn restore_context_leaves_chapters_alone() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    build(&layout, &recovery, 3)?;
    write_context(&layout, 42)?;

    assert!(recovery.restore_context(3)?);
    assert_eq!(context_marker(&layout)?, Some(2));
    assert!(manuscript::read_chapter(&layout, 3)?.is_some());
    Ok(())
}

#[test]
fn emergency_reset_prefers_best_context_quality_over_recency() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());

    for (chapter, quality) in [(1, 0.4), (2, 0.9), (3, 0.2)] {
        manuscript::write_chapter(&layout, chapter, "words")?;
        write_context(&layout, chapter)?;
        recovery.create_recovery_point(chapter, &snapshot(quality))?;
    }

    let best = recovery
        .select_point(PointSelection::MaxContextQuality)?
        .expect("point");
    assert_eq!(best.chapter_number, 2);

    assert!(recovery.emergency_reset()?);
    assert!(manuscript::read_chapter(&layout, 3)?.is_none());
    assert_eq!(context_marker(&layout)?, Some(2));
    Ok(())
}

#[test]
fn repair_corruption_restores_unparseable_state() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    assert!(!{
        std::fs::create_dir_all(layout.state_dir())?;
        std::fs::write(layout.context_path(), "{ not json")?;
        recovery.repair_corruption()?
    });

    build(&layout, &recovery, 2)?;
    std::fs::write(layout.context_path(), "{ truncated")?;
    assert!(recovery.repair_corruption()?);
    assert_eq!(context_marker(&layout)?, Some(2));
    Ok(())
}

#[test]
fn corruption_message_prepends_repair() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let recovery = RecoverySystem::new(BookLayout::new(temp.path()));
    let event = recovery.analyze_failure(4, "state corruption detected", None)?;
    assert_eq!(
        recovery.suggest_recovery_actions(&event),
        vec![RecoveryAction::RepairCorruption, RecoveryAction::EmergencyReset]
    );
    Ok(())
}

fn chapters_on_disk(layout: &BookLayout) -> anyhow::Result<Vec<u32>> {
    Ok(manuscript::list_chapters(&layout.chapters_dir())?
        .into_iter()
        .map(|(n, _)| n)
        .collect())
}

#[test]
fn rollbacks_repeat_as_no_op_successes() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let layout = BookLayout::new(temp.path());
    let recovery = RecoverySystem::new(layout.clone());
    build(&layout, &recovery, 5)?;

    let action = RecoveryAction::RollbackChapter { chapter: 5 };
    assert!(recovery.execute_action(action)?);
    let after_first = (chapters_on_disk(&layout)?, context_marker(&layout)?);
    assert_eq!(after_first, (vec![1, 2, 3, 4], Some(4)));
    assert!(recovery.execute_action(action)?);
    assert_eq!((chapters_on_disk(&layout)?, context_marker(&layout)?), after_first);

    assert!(recovery.rollback_multiple_chapters(4, 2)?);
    let after_first = (chapters_on_disk(&layout)?, context_marker(&layout)?);
    assert_eq!(after_first, (vec![1], Some(1)));
    assert!(recovery.rollback_multiple_chapters(4, 2)?);
    assert_eq!((chapters_on_disk(&layout)?, context_marker(&layout)?), after_first);
    Ok(())
}
