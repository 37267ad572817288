use predicates::prelude::*;

const GENERATOR: &str = "cat >/dev/null; \
printf '# Chapter %s\\n\\nMara crossed the bridge at dawn. \"Who goes there?\" asked Tomas.\\n\\nShe kept walking toward the tower.\\n' \
\"$AUTOBOOK_CHAPTER_NUMBER\"";

fn start_cmd(book: &std::path::Path, min_quality: &str) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    cmd.args([
        "start",
        "--book",
        book.to_str().expect("utf-8 path"),
        "--chapters",
        "2",
        "--words",
        "5000",
        "--max-retries",
        "0",
        "--min-quality",
        min_quality,
        "--generator-cmd",
        "sh",
        "--generator-arg",
        "-c",
        "--generator-arg",
        GENERATOR,
    ]);
    cmd
}

#[test]
fn start_writes_chapters_and_status_reports_completion() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;

    start_cmd(temp.path(), "0")
        .assert()
        .success()
        .stdout(predicate::str::contains("state: COMPLETED\n"))
        .stdout(predicate::str::contains("progress: 100%"));

    assert!(temp.path().join("chapters/chapter-01.md").is_file());
    assert!(temp.path().join("chapters/chapter-02.md").is_file());
    assert!(temp.path().join("state/run.json").is_file());
    assert!(temp.path().join("state/recovery/points.json").is_file());

    let mut status = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    status
        .args(["status", "--book", temp.path().to_str().expect("utf-8 path")])
        .assert()
        .success()
        .stdout(predicate::str::contains("state: COMPLETED"))
        .stdout(predicate::str::contains("jobs: 2 completed, 0 failed, 0 pending"));

    // Terminal runs cannot be paused.
    let mut pause = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    pause
        .args(["pause", "--book", temp.path().to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid state transition"));
    Ok(())
}

#[test]
fn unreachable_quality_gate_completes_with_failures() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;

    start_cmd(temp.path(), "100")
        .assert()
        .success()
        .stdout(predicate::str::contains("state: COMPLETED (with failures)"))
        .stdout(predicate::str::contains("jobs: 0 completed, 2 failed"));

    assert!(!temp.path().join("chapters/chapter-01.md").exists());
    let failures = std::fs::read_to_string(temp.path().join("state/recovery/failures.json"))?;
    let events: serde_json::Value = serde_json::from_str(&failures)?;
    assert_eq!(events.as_array().map(Vec::len), Some(2));
    assert_eq!(events[0]["severity"], "medium");
    assert_eq!(events[0]["failure_type"], "quality");
    Ok(())
}

#[test]
fn book_config_file_is_layered_under_flags() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    std::fs::write(
        temp.path().join("autobook.yaml"),
        "target_chapter_count: 1\nminimum_quality_score: 0\n",
    )?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    cmd.args([
        "start",
        "--book",
        temp.path().to_str().expect("utf-8 path"),
        "--words",
        "5000",
        "--generator-cmd",
        "sh",
        "--generator-arg",
        "-c",
        "--generator-arg",
        GENERATOR,
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("state: COMPLETED"));

    assert!(temp.path().join("chapters/chapter-01.md").is_file());
    assert!(!temp.path().join("chapters/chapter-02.md").exists());
    Ok(())
}

#[test]
fn status_without_a_run_fails() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    cmd.args(["status", "--book", temp.path().to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no run found"));
    Ok(())
}

#[test]
fn command_engine_requires_a_program() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    cmd.args(["start", "--book", temp.path().to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--generator-cmd is required"));
    Ok(())
}

#[test]
fn analyze_prints_completion_json() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let chapters = temp.path().join("chapters");
    std::fs::create_dir_all(&chapters)?;
    std::fs::write(chapters.join("chapter-01.md"), "# One\n\nA short start.\n")?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    cmd.args([
        "analyze",
        "--book",
        temp.path().to_str().expect("utf-8 path"),
        "--chapters",
        "10",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"status\": \"incomplete\""))
    .stdout(predicate::str::contains("\"chapter_count\": 1"));
    Ok(())
}

#[test]
fn batch_runs_each_book() -> anyhow::Result<()> {
    let first = tempfile::TempDir::new()?;
    let second = tempfile::TempDir::new()?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    cmd.args([
        "batch",
        first.path().to_str().expect("utf-8 path"),
        second.path().to_str().expect("utf-8 path"),
        "--max-concurrency",
        "1",
        "--chapters",
        "1",
        "--words",
        "5000",
        "--min-quality",
        "0",
        "--generator-cmd",
        "sh",
        "--generator-arg",
        "-c",
        "--generator-arg",
        GENERATOR,
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains(format!("== {}", first.path().display())))
    .stdout(predicate::str::contains(format!("== {}", second.path().display())));

    assert!(first.path().join("chapters/chapter-01.md").is_file());
    assert!(second.path().join("chapters/chapter-01.md").is_file());
    Ok(())
}

#[test]
fn verbose_emits_debug_logs_to_stderr() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("autobook");
    cmd.env_remove("RUST_LOG")
        .args(["--verbose", "status", "--book", temp.path().to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
