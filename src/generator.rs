use std::fmt::Write as _;
use std::process::Stdio;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;

use crate::context::ChapterContext;
use crate::openai::ResponsesClient;

const INSTRUCTIONS: &str = "You are writing one chapter of a long-form novel. \
Continue the story faithfully from the context you are given. \
Return only the chapter as Markdown, starting with a `# Chapter N` heading. \
Do not add commentary before or after the chapter.";

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub chapter_number: u32,
    pub target_words: u64,
    pub context: ChapterContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedChapter {
    pub content: String,
}

/// Produces chapter text. Every call may cost tokens, so callers decide when to retry.
#[async_trait]
pub trait ChapterGenerator: Send + Sync {
    /// Returns `Err` rather than empty content on failure.
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedChapter>;
}

pub fn render_prompt(request: &GenerationRequest) -> String {
    let ctx = &request.context;
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "Write chapter {} (about {} words).",
        request.chapter_number, request.target_words
    );

    if let Some(story) = &ctx.story_so_far {
        let _ = writeln!(prompt, "\n## Story so far\n{story}");
    }
    if let Some(ending) = &ctx.previous_chapter_ending {
        let _ = writeln!(prompt, "\n## How the previous chapter ended\n{ending}");
    }
    push_list(&mut prompt, "Characters", &ctx.characters);
    push_list(&mut prompt, "Open plot threads", &ctx.plot_threads);
    push_list(&mut prompt, "Themes", &ctx.themes);
    push_list(&mut prompt, "Unresolved questions", &ctx.unresolved_questions);

    if let Some(guidance) = &ctx.retry_guidance {
        let _ = writeln!(prompt, "\n## Revision guidance\n{guidance}");
    }
    if let Some(focus) = &ctx.focus_improvement {
        let _ = writeln!(prompt, "\n## Focus\n{focus}");
    }
    prompt
}

fn push_list(prompt: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "\n## {heading}");
    for item in items {
        let _ = writeln!(prompt, "- {item}");
    }
}

fn ensure_content(content: String) -> anyhow::Result<GeneratedChapter> {
    if content.trim().is_empty() {
        anyhow::bail!("generator returned empty content");
    }
    Ok(GeneratedChapter { content })
}

/// Spawns a program with the prompt on stdin and reads the chapter from stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ChapterGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedChapter> {
        tracing::info!(
            engine = "command",
            command = %self.program,
            chapter = request.chapter_number,
            attempt = request.context.attempt,
            "generate chapter"
        );

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("AUTOBOOK_CHAPTER_NUMBER", request.chapter_number.to_string())
            .env("AUTOBOOK_TARGET_WORDS", request.target_words.to_string())
            .env("AUTOBOOK_ATTEMPT", request.context.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn generator command: {}", self.program))?;

        {
            let mut stdin = child.stdin.take().context("open generator stdin")?;
            stdin
                .write_all(render_prompt(request).as_bytes())
                .await
                .context("write generator stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("wait generator process")?;
        if !output.status.success() {
            anyhow::bail!(
                "generator command failed: {} ({})",
                self.program,
                output.status
            );
        }

        let stdout =
            String::from_utf8(output.stdout).context("generator stdout is not valid UTF-8")?;
        ensure_content(stdout)
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: ResponsesClient,
}

impl OpenAiGenerator {
    pub fn new(client: ResponsesClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChapterGenerator for OpenAiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedChapter> {
        tracing::info!(
            engine = "openai",
            model = %self.client.model(),
            chapter = request.chapter_number,
            attempt = request.context.attempt,
            "generate chapter"
        );
        let content = self
            .client
            .complete(INSTRUCTIONS, &render_prompt(request))
            .await
            .with_context(|| format!("generate chapter {} via OpenAI", request.chapter_number))?;
        ensure_content(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(context: ChapterContext) -> GenerationRequest {
        GenerationRequest {
            chapter_number: 4,
            target_words: 3000,
            context,
        }
    }

    #[test]
    fn prompt_skips_empty_sections() {
        let prompt = render_prompt(&request(ChapterContext::default()));
        assert!(prompt.starts_with("Write chapter 4 (about 3000 words)."));
        assert!(!prompt.contains("## Characters"));
        assert!(!prompt.contains("## Revision guidance"));
    }

    #[test]
    fn prompt_includes_retry_guidance_and_focus() {
        let context = ChapterContext {
            attempt: 1,
            characters: vec!["Ilsa".to_owned()],
            retry_guidance: Some("try again".to_owned()),
            ..ChapterContext::default()
        }
        .with_focus_improvement("pacing", 2.0);
        let prompt = render_prompt(&request(context));
        assert!(prompt.contains("## Characters\n- Ilsa"));
        assert!(prompt.contains("## Revision guidance\ntry again"));
        assert!(prompt.contains("## Focus"));
    }

    #[tokio::test]
    async fn command_generator_reads_stdout_and_env() -> anyhow::Result<()> {
        let generator = CommandGenerator::new(
            "sh",
            vec![
                "-c".to_owned(),
                "cat >/dev/null; printf '# Chapter %s\\n\\n%s words.\\n' \"$AUTOBOOK_CHAPTER_NUMBER\" \"$AUTOBOOK_TARGET_WORDS\"".to_owned(),
            ],
        );
        let out = generator.generate(&request(ChapterContext::default())).await?;
        assert_eq!(out.content, "# Chapter 4\n\n3000 words.\n");
        Ok(())
    }

    #[tokio::test]
    async fn command_generator_rejects_blank_output() {
        let generator = CommandGenerator::new(
            "sh",
            vec!["-c".to_owned(), "cat >/dev/null; printf '  \\n'".to_owned()],
        );
        let err = generator
            .generate(&request(ChapterContext::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty content"));
    }

    #[tokio::test]
    async fn command_generator_surfaces_exit_status() {
        let generator = CommandGenerator::new(
            "sh",
            vec!["-c".to_owned(), "cat >/dev/null; exit 3".to_owned()],
        );
        let err = generator
            .generate(&request(ChapterContext::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("generator command failed"));
    }
}
