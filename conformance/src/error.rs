//! Failure and error types.
//!
//! [`Failure`] is a recorded, non-fatal verdict: the run keeps going and
//! every failure ends up in the [`Report`](crate::testcase::Report).
//! [`HarnessError`] aborts the current test case.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use crate::matcher::StreamKind;
use crate::pattern::State;
use crate::probe::ProbeError;

/// A single accumulated verdict against a test case.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// A line matched none of the candidates of the current state.
    #[error("unexpected {stream} line {line:?} in state {state}; expected one of:{}", bullet_list(.expected))]
    Unmatched {
        stream: StreamKind,
        line: String,
        state: State,
        expected: Vec<String>,
    },

    #[error("failed to read {stream}: {source}")]
    StreamRead {
        stream: StreamKind,
        #[source]
        source: io::Error,
    },

    /// A DNS probe failed in transport or verdict.
    #[error("{transport} query {query} to {addr}: {source}")]
    Probe {
        transport: String,
        addr: String,
        query: String,
        #[source]
        source: ProbeError,
    },

    /// A handler received matcher output it cannot use.
    #[error("handler {handler}: {message}")]
    Handler { handler: String, message: String },

    #[error("failed to send {signal} to pid {pid}: {message}")]
    Signal {
        signal: &'static str,
        pid: u32,
        message: String,
    },

    /// A matcher or dispatcher task panicked; its results are lost.
    #[error("{task} task failed: {message}")]
    Task { task: &'static str, message: String },

    /// The run deadline expired before the expected sequence completed.
    #[error("timeout: run did not complete within {0:?}")]
    Timeout(Duration),

    #[error("unexpected exit: {message} (status: {status})")]
    UnexpectedExit { status: ExitStatus, message: String },
}

impl Failure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return " (nothing, stream must stay silent here)".to_string();
    }
    items.iter().map(|item| format!("\n  - {item}")).collect()
}

/// Setup errors that abort one test case.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} of the child process was not captured")]
    MissingPipe(&'static str),

    #[error("failed to write stdin: {0}")]
    Stdin(#[source] io::Error),

    #[error("failed to wait for the child process: {0}")]
    Wait(#[source] io::Error),
}
