//! Black-box functional conformance suite for `dnscrypt-proxy`.
//!
//! Each [`TestCase`] spawns the daemon with arguments, environment and a
//! configuration on stdin, then checks its stdout and stderr line by line
//! against a per-stream [`Automaton`]. Matched lines can trigger a
//! [`Handler`](dispatch::Handler); the stock one probes the listeners the
//! daemon announces with real DNS queries over UDP and TCP and signals the
//! daemon when done. Every run is bounded by one deadline.
//!
//! ```bash
//! dnscrypt-conformance --list
//! dnscrypt-conformance --case "query example cloaking"
//! BINPATH=/opt/dnscrypt dnscrypt-conformance --all --format json
//! ```
//!
//! The runner exits with:
//! - 0: every selected case passed
//! - 1: at least one case failed
//! - 2: setup error (daemon not found, bad settings, unknown case)

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fixtures;
pub mod handlers;
pub mod harness;
pub mod locate;
pub mod matcher;
pub mod pattern;
pub mod probe;
pub mod process;
pub mod suite;
pub mod testcase;

pub use config::Settings;
pub use error::{Failure, HarnessError};
pub use harness::Harness;
pub use locate::{LocateError, locate};
pub use pattern::{Automaton, MatchOutput, Pattern};
pub use testcase::{Outcome, Report, TestCase};
