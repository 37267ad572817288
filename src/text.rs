use std::sync::LazyLock;

use pulldown_cmark::{Event, Parser, TagEnd};
use regex::Regex;

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^.!?]+[.!?]+["'”’)]*"#).expect("sentence regex"));

/// Markdown rendered down to its text, one block per line.
pub fn plain_text(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    for event in Parser::new(markdown) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item) => out.push('\n'),
            _ => {}
        }
    }
    out
}

/// Lowercased plain text with whitespace collapsed.
pub fn normalize(markdown: &str) -> String {
    plain_text(markdown)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn sentences(text: &str) -> Vec<&str> {
    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn paragraphs(markdown: &str) -> Vec<&str> {
    markdown
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.starts_with('#'))
        .collect()
}

/// Last `count` whitespace-separated words of `text`.
pub fn tail_words(text: &str, count: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(count);
    words[start..].join(" ")
}

pub fn head_words(text: &str, count: usize) -> String {
    text.split_whitespace()
        .take(count)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_drops_markdown_syntax() {
        let text = plain_text("# Chapter 1\n\nShe *ran* to the [door](x).\n");
        assert_eq!(text, "Chapter 1\nShe ran to the door.\n");
    }

    #[test]
    fn normalize_lowercases_and_collapses() {
        assert_eq!(normalize("The  END\n\nIs *Near*"), "the end is near");
    }

    #[test]
    fn sentences_keep_closing_quotes() {
        let got = sentences("\"Stop!\" she said. Why now? Because.");
        assert_eq!(got, vec!["\"Stop!\"", "she said.", "Why now?", "Because."]);
    }

    #[test]
    fn tail_and_head_words() {
        assert_eq!(tail_words("a b c d", 2), "c d");
        assert_eq!(tail_words("a", 5), "a");
        assert_eq!(head_words("a b c d", 3), "a b c");
    }
}
