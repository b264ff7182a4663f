//! Test case model and run report.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use owo_colors::OwoColorize;

use crate::dispatch::Handlers;
use crate::error::Failure;
use crate::matcher::{StreamKind, TranscriptLine};
use crate::pattern::Automaton;

/// How the daemon is expected to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    Success,
    /// A non-zero exit code.
    Failure,
}

/// One declarative scenario.
#[derive(Debug, Clone, Default)]
pub struct TestCase {
    name: Option<String>,
    pub args: Vec<String>,
    /// Layered on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Defaults to the directory holding the daemon binary.
    pub dir: Option<PathBuf>,
    pub stdin: String,
    pub stdout: Automaton,
    pub stderr: Automaton,
    pub handlers: Handlers,
    pub expect: Outcome,
}

impl TestCase {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = payload.into();
        self
    }

    pub fn stdout(mut self, automaton: Automaton) -> Self {
        self.stdout = automaton;
        self
    }

    pub fn stderr(mut self, automaton: Automaton) -> Self {
        self.stderr = automaton;
        self
    }

    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn expect_failure(mut self) -> Self {
        self.expect = Outcome::Failure;
        self
    }

    /// The explicit name, or the arguments joined by spaces.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.args.join(" "))
    }
}

/// Result of one run: every accumulated failure plus the diagnostics needed
/// to understand it without rerunning.
#[derive(Debug)]
pub struct Report {
    pub name: String,
    pub failures: Vec<Failure>,
    pub trailing: Vec<(StreamKind, Vec<String>)>,
    /// Both streams merged by arrival time.
    pub transcript: Vec<TranscriptLine>,
    pub exit: ExitStatus,
    pub elapsed: Duration,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn timed_out(&self) -> bool {
        self.failures.iter().any(Failure::is_timeout)
    }

    /// Human-readable failure dump: failures, trailing output verbatim, then
    /// the transcript.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} failure(s) in '{}':", self.failures.len(), self.name);
        for failure in &self.failures {
            let _ = writeln!(out, "  {} {failure}", "-".red());
        }
        for (stream, lines) in &self.trailing {
            if !lines.is_empty() {
                let _ = writeln!(out, "\nRemaining {stream}:\n{}", lines.join("\n"));
            }
        }
        if !self.transcript.is_empty() {
            out.push_str("\n=== Transcript ===\n");
            for line in &self.transcript {
                let prefix = match line.stream {
                    StreamKind::Stdout => format!("{}", "[out]".green()),
                    StreamKind::Stderr => format!("{}", "[err]".yellow()),
                };
                let mark = match &line.matched {
                    Some(label) => format!("{}", format!("({label})").dimmed()),
                    None => format!("{}", "(unmatched)".red()),
                };
                let _ = writeln!(
                    out,
                    "{:>8.5}s {prefix} {} {mark}",
                    line.at.as_secs_f64(),
                    line.line
                );
            }
        }
        let _ = writeln!(out, "\nexit status: {}", self.exit);
        out
    }
}
