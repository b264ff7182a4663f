//! Per-stream line matcher.
//!
//! One [`StreamMatcher`] task runs per output stream. It reads
//! newline-delimited text, steps its [`Automaton`] on every line and pushes a
//! [`MatchEvent`] into the shared dispatcher queue for every accepted line.
//! Rejected lines are recorded as failures and scanning continues.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Failure;
use crate::pattern::{Automaton, MatchOutput, Pattern, State};

/// Which output stream of the daemon a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful match, moved from a matcher to the dispatcher.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub stream: StreamKind,
    pub pattern: Pattern,
    pub output: MatchOutput,
}

/// One observed line, kept for failure diagnostics.
#[derive(Debug, Clone)]
pub struct TranscriptLine {
    pub at: Duration,
    pub stream: StreamKind,
    pub line: String,
    /// Label of the pattern that accepted the line, if any.
    pub matched: Option<String>,
}

/// Everything a matcher hands back to the harness once its stream closed.
#[derive(Debug)]
pub struct StreamOutcome {
    pub stream: StreamKind,
    pub failures: Vec<Failure>,
    /// Lines after the first mismatch, plus any unterminated final fragment.
    pub trailing: Vec<String>,
    pub transcript: Vec<TranscriptLine>,
}

/// Automaton state for one stream of one run.
pub struct StreamMatcher {
    stream: StreamKind,
    automaton: Automaton,
    state: State,
    failures: Vec<Failure>,
    trailing: Vec<String>,
    transcript: Vec<TranscriptLine>,
}

impl StreamMatcher {
    pub fn new(stream: StreamKind, automaton: Automaton) -> Self {
        Self {
            stream,
            automaton,
            state: State::Start,
            failures: Vec::new(),
            trailing: Vec::new(),
            transcript: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Step the automaton on one line.
    ///
    /// On a match the state advances to the matched pattern. On a mismatch
    /// the state is left alone so later lines are still tested against the
    /// same unmet expectations.
    pub fn match_line(&mut self, line: &str) -> Result<MatchEvent, Failure> {
        match self.automaton.step(self.state, line) {
            Some((pattern, output)) => {
                let pattern = pattern.clone();
                self.state = State::After(pattern.id());
                Ok(MatchEvent {
                    stream: self.stream,
                    pattern,
                    output,
                })
            }
            None => Err(Failure::Unmatched {
                stream: self.stream,
                line: line.to_owned(),
                state: self.state,
                expected: self
                    .automaton
                    .candidates(self.state)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            }),
        }
    }

    /// Consume `reader` until end of input, sending accepted lines to `events`.
    pub async fn run<R>(
        mut self,
        reader: R,
        events: mpsc::UnboundedSender<MatchEvent>,
        start: Instant,
    ) -> StreamOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) if buf.last() != Some(&b'\n') => {
                    // Unterminated output at end of input is kept, never matched.
                    self.trailing.push(String::from_utf8_lossy(&buf).into_owned());
                    break;
                }
                Ok(_) => {
                    let line = decode_line(&buf);
                    self.feed(line, start.elapsed(), &events);
                }
                Err(source) => {
                    warn!(stream = %self.stream, error = %source, "read failed");
                    self.failures.push(Failure::StreamRead {
                        stream: self.stream,
                        source,
                    });
                    break;
                }
            }
        }

        if !self.trailing.is_empty() {
            info!(
                stream = %self.stream,
                "Remaining {}:\n{}",
                self.stream,
                self.trailing.join("\n")
            );
        }

        StreamOutcome {
            stream: self.stream,
            failures: self.failures,
            trailing: self.trailing,
            transcript: self.transcript,
        }
    }

    fn feed(&mut self, line: String, at: Duration, events: &mpsc::UnboundedSender<MatchEvent>) {
        let failed_before = !self.failures.is_empty();
        match self.match_line(&line) {
            Ok(event) => {
                debug!(stream = %self.stream, pattern = event.pattern.label(), %line, "matched");
                self.transcript.push(TranscriptLine {
                    at,
                    stream: self.stream,
                    line: line.clone(),
                    matched: Some(event.pattern.label().to_owned()),
                });
                if events.send(event).is_err() {
                    debug!(stream = %self.stream, "dispatcher gone, event dropped");
                }
            }
            Err(failure) => {
                warn!("{failure}");
                self.transcript.push(TranscriptLine {
                    at,
                    stream: self.stream,
                    line: line.clone(),
                    matched: None,
                });
                self.failures.push(failure);
            }
        }
        if failed_before {
            self.trailing.push(line);
        }
    }
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily.
fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
