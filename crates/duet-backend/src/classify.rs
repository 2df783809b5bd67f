//! Data-driven classification of CLI and worker output.
//!
//! Every table here is a list of regexes; the functions are pure so they can
//! be tested without spawning anything.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;

use duet_types::text::truncate_chars;

use crate::backend::Backend;
use crate::runner::CliOutput;

/// Longest failure summary shown to a user.
pub const SUMMARY_CHARS: usize = 600;

/// Outputs longer than this are treated as real answers even if they mention
/// an auth or rate-limit phrase.
const SIGNATURE_SCAN_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CliFailure {
    #[error("rate-limited")]
    RateLimited,
    #[error("authentication required")]
    AuthRequired,
    #[error("timed out")]
    Timeout,
    #[error("failed")]
    Generic,
}

fn rate_limit_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)rate[ _-]?limit",
            r"(?i)usage limit",
            r"(?i)quota (exceeded|exhausted)",
            r"(?i)too many requests",
            r"\b429\b",
            r"(?i)overloaded",
            r"(?i)credit balance is too low",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Auth phrases common to every backend, checked alongside each backend's own.
fn generic_auth_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)not logged in",
            r"(?i)invalid api key",
            r"(?i)missing bearer",
            r"(?i)authentication (failed|required)",
            r"(?i)please (log ?in|authenticate)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Lines that are stack-trace noise rather than a message.
fn noise_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^\s+at\s",
            r"^\s*\S+\.(js|mjs|cjs|ts|tsx|py|rs):\d+(:\d+)?\s*$",
            r"^\s*\^+\s*$",
            r"node:internal/",
            r#"^\s*File ".*", line \d+"#,
            r"^note: run with `RUST_BACKTRACE",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Shapes of text that are a CLI complaining rather than answering.
fn cli_error_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?im)^\s*(error|fatal|panic)\b",
            r"(?im)^\s*usage:",
            r"(?i)command not found",
            r"Traceback \(most recent call last\)",
            r"panicked at",
            r"(?i)unknown (option|argument|flag)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

pub fn is_rate_limited(text: &str) -> bool {
    rate_limit_patterns().iter().any(|re| re.is_match(text))
}

/// The output line that says `backend` needs re-authentication, if any.
pub fn auth_signature<'a>(backend: &Backend, text: &'a str) -> Option<&'a str> {
    backend.auth_failure_line(text).or_else(|| {
        text.lines()
            .find(|line| generic_auth_patterns().iter().any(|re| re.is_match(line)))
            .map(str::trim)
    })
}

/// Whether `text` is about credentials or quota rather than a code fault.
pub fn is_account_problem(text: &str) -> bool {
    is_rate_limited(text) || generic_auth_patterns().iter().any(|re| re.is_match(text))
}

/// Short text that is an error message, not a genuine answer.
pub fn looks_like_cli_error(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return true;
    }
    if text.chars().count() > SIGNATURE_SCAN_CHARS {
        return false;
    }
    cli_error_patterns().iter().any(|re| re.is_match(text))
        || is_rate_limited(text)
        || generic_auth_patterns().iter().any(|re| re.is_match(text))
}

/// Classify a run that did not produce a usable answer.
pub fn classify(backend: &Backend, output: &CliOutput) -> CliFailure {
    if output.timed_out {
        return CliFailure::Timeout;
    }
    let text = output.combined();
    if auth_signature(backend, &text).is_some() {
        CliFailure::AuthRequired
    } else if is_rate_limited(&text) {
        CliFailure::RateLimited
    } else {
        CliFailure::Generic
    }
}

/// Whether a zero-exit output is really a disguised auth or quota error.
pub fn is_disguised_failure(backend: &Backend, text: &str) -> bool {
    let text = text.trim();
    text.chars().count() <= SIGNATURE_SCAN_CHARS
        && (auth_signature(backend, text).is_some() || is_rate_limited(text))
}

/// Drop stack-trace noise and blank runs, then truncate.
pub fn summarize_failure(text: &str, max_chars: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        if noise_patterns().iter().any(|re| re.is_match(line)) {
            continue;
        }
        if line.trim().is_empty() && kept.last().map_or(true, |l| l.trim().is_empty()) {
            continue;
        }
        kept.push(line.trim_end());
    }
    truncate_chars(kept.join("\n").trim(), max_chars)
}

/// Turn one CLI run into the string handed back to the requester: the answer
/// on success, otherwise user-facing guidance for the failure kind.
pub fn render_output(backend: &Backend, output: &CliOutput) -> String {
    let name = backend.name();
    let stdout = output.stdout.trim();
    if output.success() && !stdout.is_empty() && !is_disguised_failure(backend, stdout) {
        return stdout.to_string();
    }
    match classify(backend, output) {
        CliFailure::Timeout => format!(
            "⏱️ {name} did not finish within {}s and was stopped. Try a smaller request.",
            output.elapsed.as_secs()
        ),
        CliFailure::RateLimited => format!(
            "⚠️ {name} is rate-limited or out of quota right now. Try again later, or switch with /backend <name>."
        ),
        CliFailure::AuthRequired => {
            let combined = output.combined();
            let line = auth_signature(backend, &combined).unwrap_or("authentication required");
            format!("🔑 {name} needs to sign in again: {line}")
        }
        CliFailure::Generic => {
            if !stdout.is_empty() && !looks_like_cli_error(stdout) {
                return stdout.to_string();
            }
            let summary = summarize_failure(&output.combined(), SUMMARY_CHARS);
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            if summary.is_empty() {
                format!("❌ {name} failed (exit {code}) without any output.")
            } else {
                format!("❌ {name} failed (exit {code}):\n{summary}")
            }
        }
    }
}

/// Fatal-error patterns over a process's error stream.
#[derive(Debug, Clone)]
pub struct ErrorPatterns(Vec<Regex>);

impl ErrorPatterns {
    pub fn compile(patterns: &[String]) -> Result<Self> {
        patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid error pattern: {p}")))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    /// The pattern text of the first match, if any.
    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.0.iter().find(|re| re.is_match(text)).map(|re| re.as_str())
    }

    /// Like [`first_match`](Self::first_match), line by line, ignoring the
    /// process's own non-error log records and account problems.
    pub fn fatal_match(&self, text: &str) -> Option<&str> {
        text.lines()
            .filter(|line| !is_log_record(line) && !is_account_problem(line))
            .find_map(|line| self.first_match(line))
    }
}

/// A `tracing` fmt record below ERROR, e.g.
/// `2026-01-01T00:00:00.000000Z  WARN duet_worker::handler: ...`.
pub fn is_log_record(line: &str) -> bool {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    static RECORD: OnceLock<Regex> = OnceLock::new();
    let ansi = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());
    let record = RECORD.get_or_init(|| Regex::new(r"^(\S+\s+)?(TRACE|DEBUG|INFO|WARN)\s").unwrap());
    record.is_match(&ansi.replace_all(line, ""))
}
