//! Interactive Session
//!
//! Reads one line at a time. Slash directives and `!` shell commands go to the
//! command router, a few local directives inspect the response history, and
//! anything else is sent to the model as a chat turn.

use crate::state::AppState;
use aidis_core::{
    history::HistoryStats,
    router::{DirectiveResult, FailureKind},
};
use anyhow::Result;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error};

const PROMPT: &str = "aidis> ";

/// How a line of user input is handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Exit,
    /// `/history`: buffer statistics.
    Stats,
    /// `/search <pattern>`: regex search over buffered responses.
    Search(&'a str),
    /// `/clear`: drop buffered responses and chat context.
    Clear,
    /// Anything else starting with `/`, or a `!` shell command.
    Directive(&'a str),
    Prompt(&'a str),
}

pub fn classify(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if let Some(command) = line.strip_prefix('!') {
        return Input::Directive(command.trim());
    }
    if !line.starts_with('/') {
        return Input::Prompt(line);
    }
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    match head {
        "/exit" | "/quit" => Input::Exit,
        "/history" => Input::Stats,
        "/search" => Input::Search(rest.trim()),
        "/clear" => Input::Clear,
        _ => Input::Directive(line),
    }
}

/// Human-readable rendering of a directive outcome.
pub fn render_result(result: &DirectiveResult) -> String {
    if result.success {
        return result.output.clone().unwrap_or_default();
    }
    let error = result.error.as_deref().unwrap_or("Unknown error");
    match result.failure {
        Some(FailureKind::Safety) => format!("⛔ {error}"),
        Some(FailureKind::Timeout) => format!("⏱ {error}"),
        _ => format!("✗ {error}"),
    }
}

fn render_stats(stats: &HistoryStats, capacity: usize) -> String {
    let mut out = format!(
        "Buffered responses: {}/{}\nTotal content: {} chars\nAverage response time: {:.0} ms",
        stats.total_responses, capacity, stats.total_content_length, stats.average_response_time_ms
    );
    if let (Some(oldest), Some(newest)) = (stats.oldest_timestamp, stats.newest_timestamp) {
        out.push_str(&format!(
            "\nOldest: {}\nNewest: {}",
            oldest.to_rfc3339(),
            newest.to_rfc3339()
        ));
    }
    out
}

/// Runs the read-eval-print loop until `/exit`, end of input, or a failed
/// write to `out`. The service connection is closed on every exit.
pub async fn run<R, W>(state: &mut AppState, input: R, out: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let result = session(state, input, out).await;
    state.router.client_mut().disconnect();
    result
}

async fn session<R, W>(state: &mut AppState, input: R, out: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match classify(&line) {
            Input::Empty => continue,
            Input::Exit => break,
            Input::Stats => {
                let history = state.history.read().await;
                writeln!(out, "{}", render_stats(&history.stats(), history.capacity()))?;
            }
            Input::Search(pattern) if pattern.is_empty() => {
                writeln!(out, "✗ Usage: /search <pattern>")?;
            }
            Input::Search(pattern) => match state.history.read().await.search_pattern(pattern) {
                Ok(matches) if matches.is_empty() => writeln!(out, "No matches for '{pattern}'")?,
                Ok(matches) => {
                    for m in matches {
                        writeln!(
                            out,
                            "[{}] {}: {}",
                            m.timestamp.to_rfc3339(),
                            m.metadata.model_id,
                            m.context_snippet
                        )?;
                    }
                }
                Err(e) => writeln!(out, "✗ Invalid pattern: {e}")?,
            },
            Input::Clear => {
                state.history.write().await.clear();
                if let Some(conversation) = state.conversation.as_mut() {
                    conversation.reset();
                }
                writeln!(out, "History cleared")?;
            }
            Input::Directive(directive) => {
                debug!(directive, "Dispatching directive");
                let result = state.router.dispatch(directive).await;
                writeln!(out, "{}", render_result(&result))?;
            }
            Input::Prompt(text) => match state.conversation.as_mut() {
                Some(conversation) => {
                    let mut write_error = None;
                    let sent = conversation
                        .send(text, |chunk| {
                            if write_error.is_none()
                                && let Err(e) = write!(out, "{chunk}").and_then(|()| out.flush())
                            {
                                write_error = Some(e);
                            }
                        })
                        .await;
                    if let Some(e) = write_error {
                        return Err(anyhow::Error::new(e).context("Failed to write model response"));
                    }
                    writeln!(out)?;
                    if let Err(e) = sent {
                        error!(error = ?e, "Chat turn failed");
                        writeln!(out, "✗ {e:#}")?;
                    }
                }
                None => writeln!(
                    out,
                    "✗ Chat is disabled: no API key configured for {:?}",
                    state.config.provider
                )?,
            },
        }
    }

    Ok(())
}
