//! Process harness.
//!
//! Runs one [`TestCase`] against the daemon binary: spawn, feed stdin, match
//! both output streams, dispatch handlers, wait for exit and check it. Every
//! wait is bounded by one run deadline; when it expires the daemon is killed
//! and the sequence carries on so the report is still complete.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::Settings;
use crate::dispatch::{Dispatcher, HandlerContext};
use crate::error::{Failure, HarnessError};
use crate::matcher::{StreamKind, StreamMatcher, StreamOutcome};
use crate::probe::ProbeClient;
use crate::process::ProcessHandle;
use crate::testcase::{Outcome, Report, TestCase};

/// How long a task may keep running once the daemon has been killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Spawned,
    StreamsDraining,
    QueueClosed,
    DispatcherDrained,
    ProcessExited,
    Verified,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spawned => "spawned",
            Self::StreamsDraining => "streams draining",
            Self::QueueClosed => "queue closed",
            Self::DispatcherDrained => "dispatcher drained",
            Self::ProcessExited => "process exited",
            Self::Verified => "verified",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Harness {
    binary: PathBuf,
    settings: Settings,
}

impl Harness {
    pub fn new(binary: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            binary: binary.into(),
            settings,
        }
    }

    /// Run `case` to completion.
    ///
    /// Verdicts accumulate in the returned [`Report`]; only setup problems
    /// (spawn, pipes, stdin, wait) are errors. A panicked matcher or
    /// dispatcher task is recorded as a failure.
    pub async fn run(&self, case: &TestCase) -> Result<Report, HarnessError> {
        let name = case.name();
        self.execute(case, name.clone())
            .instrument(info_span!("case", %name))
            .await
    }

    async fn execute(&self, case: &TestCase, name: String) -> Result<Report, HarnessError> {
        let started = std::time::Instant::now();
        let deadline = Instant::now() + self.settings.run_timeout;

        let mut command = Command::new(&self.binary);
        command
            .args(&case.args)
            .envs(case.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.working_dir(case) {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            path: self.binary.clone(),
            source,
        })?;
        let process = ProcessHandle::new(child.id());
        let stdin = child.stdin.take().ok_or(HarnessError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(HarnessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(HarnessError::MissingPipe("stderr"))?;
        info!(pid = ?process.pid(), args = ?case.args, "{}", Phase::Spawned);

        let mut sup = Supervisor {
            child,
            deadline,
            limit: self.settings.run_timeout,
            expired: false,
            crashed: Vec::new(),
        };

        match sup.bounded(write_stdin(stdin, case.stdin.as_bytes())).await {
            Some(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("daemon closed stdin before reading it all");
            }
            Some(Err(e)) => return Err(HarnessError::Stdin(e)),
            Some(Ok(())) | None => {}
        }

        let (events, queue) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(
            StreamMatcher::new(StreamKind::Stdout, case.stdout.clone())
                .run(stdout, events.clone(), started)
                .in_current_span(),
        );
        let stderr_task = tokio::spawn(
            StreamMatcher::new(StreamKind::Stderr, case.stderr.clone())
                .run(stderr, events.clone(), started)
                .in_current_span(),
        );
        let ctx = HandlerContext::new(
            process,
            ProbeClient::new(deadline, self.settings.probe_timeout),
        );
        let dispatcher = tokio::spawn(
            Dispatcher::new(case.handlers.clone(), ctx)
                .run(queue)
                .in_current_span(),
        );

        info!("{}", Phase::StreamsDraining);
        let stdout_outcome = sup.join("stdout matcher", stdout_task).await;
        let stderr_outcome = sup.join("stderr matcher", stderr_task).await;
        drop(events);
        info!("{}", Phase::QueueClosed);

        let handler_failures = sup.join("dispatcher", dispatcher).await.unwrap_or_default();
        info!(
            failures = handler_failures.len(),
            "{}",
            Phase::DispatcherDrained
        );

        let status = sup.wait_exit().await?;
        info!(%status, "{}", Phase::ProcessExited);

        let mut failures = Vec::new();
        let mut trailing = Vec::new();
        let mut transcript = Vec::new();
        for outcome in [stdout_outcome, stderr_outcome].into_iter().flatten() {
            let StreamOutcome {
                stream,
                failures: stream_failures,
                trailing: lines,
                transcript: seen,
            } = outcome;
            failures.extend(stream_failures);
            trailing.push((stream, lines));
            transcript.extend(seen);
        }
        transcript.sort_by_key(|line| line.at);
        failures.extend(handler_failures);
        failures.append(&mut sup.crashed);
        if let Some(failure) = check_exit(case.expect, status) {
            warn!("{failure}");
            failures.push(failure);
        }
        if sup.expired {
            failures.push(Failure::Timeout(self.settings.run_timeout));
        }
        info!(failures = failures.len(), "{}", Phase::Verified);

        Ok(Report {
            name,
            failures,
            trailing,
            transcript,
            exit: status,
            elapsed: started.elapsed(),
        })
    }

    fn working_dir<'a>(&'a self, case: &'a TestCase) -> Option<&'a Path> {
        case.dir
            .as_deref()
            .or_else(|| self.binary.parent())
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// Write the whole payload; dropping the handle closes the pipe.
async fn write_stdin(mut stdin: ChildStdin, payload: &[u8]) -> io::Result<()> {
    if !payload.is_empty() {
        stdin.write_all(payload).await?;
        stdin.flush().await?;
    }
    Ok(())
}

/// Owns the child and the run deadline.
struct Supervisor {
    child: Child,
    deadline: Instant,
    limit: Duration,
    expired: bool,
    /// Matcher or dispatcher tasks that panicked.
    crashed: Vec<Failure>,
}

impl Supervisor {
    fn expire(&mut self) {
        if self.expired {
            return;
        }
        self.expired = true;
        warn!(limit = ?self.limit, "deadline expired, killing daemon");
        if let Err(error) = self.child.start_kill() {
            debug!(%error, "kill after deadline failed");
        }
    }

    /// Await `fut` until the deadline. Returns `None` once expired.
    async fn bounded<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        if self.expired {
            return None;
        }
        match timeout_at(self.deadline, fut).await {
            Ok(output) => Some(output),
            Err(_) => {
                self.expire();
                None
            }
        }
    }

    /// Join a task. After the deadline the task gets [`KILL_GRACE`] to notice
    /// the dead daemon and is abandoned after that.
    async fn join<T>(&mut self, task: &'static str, mut handle: JoinHandle<T>) -> Option<T> {
        if !self.expired {
            match timeout_at(self.deadline, &mut handle).await {
                Ok(joined) => return self.joined(task, joined),
                Err(_) => self.expire(),
            }
        }
        match timeout(KILL_GRACE, &mut handle).await {
            Ok(joined) => self.joined(task, joined),
            Err(_) => {
                warn!(task, "still running after kill, abandoned");
                handle.abort();
                None
            }
        }
    }

    fn joined<T>(&mut self, task: &'static str, joined: Result<T, JoinError>) -> Option<T> {
        match joined {
            Ok(output) => Some(output),
            Err(error) => {
                let failure = Failure::Task {
                    task,
                    message: error.to_string(),
                };
                warn!("{failure}");
                self.crashed.push(failure);
                None
            }
        }
    }

    async fn wait_exit(&mut self) -> Result<ExitStatus, HarnessError> {
        if !self.expired {
            match timeout_at(self.deadline, self.child.wait()).await {
                Ok(status) => return status.map_err(HarnessError::Wait),
                Err(_) => self.expire(),
            }
        }
        self.child.wait().await.map_err(HarnessError::Wait)
    }
}

/// Compare the exit status with the declared outcome.
fn check_exit(expect: Outcome, status: ExitStatus) -> Option<Failure> {
    let message = match (expect, status.code()) {
        (Outcome::Success, _) if status.success() => return None,
        (Outcome::Success, _) => "expected a successful exit",
        (Outcome::Failure, Some(code)) if code != 0 => return None,
        (Outcome::Failure, Some(_)) => "expected a non-zero exit code",
        (Outcome::Failure, None) => {
            "expected a non-zero exit code, terminated by a signal instead"
        }
    };
    Some(Failure::UnexpectedExit {
        status,
        message: message.to_string(),
    })
}
