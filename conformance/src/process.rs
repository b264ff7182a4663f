//! Signal handle for the daemon under test.
//!
//! The harness owns the [`tokio::process::Child`]; handlers only get a
//! [`ProcessHandle`] carrying the pid, which is enough to interrupt or kill.

use tracing::info;

use crate::error::Failure;

#[derive(Debug, Clone, Copy)]
pub struct ProcessHandle {
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the daemon to shut down gracefully (SIGINT).
    pub fn interrupt(&self) -> Result<(), Failure> {
        self.send(Signal::Interrupt)
    }

    /// Forcibly terminate the daemon (SIGKILL).
    pub fn kill(&self) -> Result<(), Failure> {
        self.send(Signal::Kill)
    }

    fn send(&self, signal: Signal) -> Result<(), Failure> {
        let Some(pid) = self.pid else {
            return Err(Failure::Signal {
                signal: signal.name(),
                pid: 0,
                message: "process already reaped".to_string(),
            });
        };
        info!(pid, signal = signal.name(), "signaling daemon");
        deliver(pid, signal).map_err(|message| Failure::Signal {
            signal: signal.name(),
            pid,
            message,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Kill,
}

impl Signal {
    fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Kill => "SIGKILL",
        }
    }
}

#[cfg(unix)]
fn deliver(pid: u32, signal: Signal) -> Result<(), String> {
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    let signal = match signal {
        Signal::Interrupt => NixSignal::SIGINT,
        Signal::Kill => NixSignal::SIGKILL,
    };
    signal::kill(Pid::from_raw(raw), signal).map_err(|errno| errno.to_string())
}

#[cfg(not(unix))]
fn deliver(_pid: u32, signal: Signal) -> Result<(), String> {
    Err(format!("{} is not supported on this platform", signal.name()))
}
