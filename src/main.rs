use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use autobook::app::queue::JobPool;
use autobook::app::runner::BookRunner;
use autobook::cli::{Cli, Command};
use autobook::completion::CompletionDetector;
use autobook::config;
use autobook::manuscript::BookLayout;
use autobook::model::{RunState, RunSummary};
use autobook::orchestrator::RunControl;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    autobook::logging::init(if cli.verbose { "debug" } else { "info" })
        .context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Start(args) => {
            let book = args.book.book;
            let runner = BookRunner::new(args.engine);
            let overrides = args.config.overrides();
            let summary = interruptible(&book, runner.start(&book, &overrides))
                .await
                .context("start")?;
            print!("{summary}");
            Ok(exit_code(&summary))
        }
        Command::Resume(args) => {
            let book = args.book.book;
            let runner = BookRunner::new(args.engine);
            let summary = interruptible(&book, runner.resume(&book, args.force))
                .await
                .context("resume")?;
            print!("{summary}");
            Ok(exit_code(&summary))
        }
        Command::Status(args) => {
            let summary = RunControl::new(BookLayout::new(&args.book))
                .status()
                .await
                .context("status")?;
            print!("{summary}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Pause(args) => {
            RunControl::new(BookLayout::new(&args.book))
                .pause()
                .await
                .context("pause")?;
            println!("pause requested");
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop(args) => {
            let state = RunControl::new(BookLayout::new(&args.book))
                .stop()
                .await
                .context("stop")?;
            match state {
                RunState::Cancelled => println!("run cancelled"),
                _ => println!("stop requested"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Batch(args) => {
            let pool = match args.max_concurrency {
                Some(workers) => JobPool::new(workers),
                None => JobPool::from_env()?,
            };
            let runner = BookRunner::new(args.engine);
            let results = runner
                .start_batch(&pool, &args.books, &args.config.overrides())
                .await
                .context("batch")?;

            let mut code = ExitCode::SUCCESS;
            for (book, result) in results {
                println!("== {}", book.display());
                match result {
                    Ok(summary) => {
                        print!("{summary}");
                        if summary.state == RunState::Failed {
                            code = ExitCode::FAILURE;
                        }
                    }
                    Err(err) => {
                        println!("error: {err:#}");
                        code = ExitCode::FAILURE;
                    }
                }
            }
            Ok(code)
        }
        Command::Analyze(args) => {
            let config = config::load_book_config(&args.book.book, &args.config.overrides())?;
            let detector = CompletionDetector::new(
                BookLayout::new(&args.book.book),
                config.completion_criteria(),
            );
            let analysis = detector.analyze_completion_status().context("analyze")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&analysis).context("serialize analysis")?
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    match summary.state {
        RunState::Failed => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

/// Ctrl-C turns into a stop request honored at the next chapter boundary.
async fn interruptible<F>(book: &Path, run: F) -> anyhow::Result<RunSummary>
where
    F: std::future::Future<Output = anyhow::Result<RunSummary>>,
{
    let control = RunControl::new(BookLayout::new(PathBuf::from(book)));
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current chapter");
            if let Err(err) = control.stop().await {
                tracing::error!(?err, "request stop");
            }
        }
    });
    let result = run.await;
    watcher.abort();
    result
}
