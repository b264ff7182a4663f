//! `dnscrypt-proxy` conformance runner.
//!
//! List the cases:
//! ```bash
//! dnscrypt-conformance --list
//! ```
//!
//! Run one case, or all of them:
//! ```bash
//! dnscrypt-conformance --case -version
//! dnscrypt-conformance --all --format json
//! ```
//!
//! # Exit Codes
//!
//! - 0: all selected cases passed
//! - 1: at least one case failed
//! - 2: setup error, or no selected case could be run

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use dnscrypt_conformance::{
    Harness, HarnessError, Outcome, Report, Settings, TestCase, locate, suite,
};
use owo_colors::OwoColorize;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "dnscrypt-conformance")]
#[command(about = "Black-box functional tests for dnscrypt-proxy")]
struct Args {
    /// Run a specific case (e.g. "query example cloaking")
    #[arg(long, allow_hyphen_values = true)]
    case: Option<String>,

    /// Run every case
    #[arg(long, conflicts_with = "case")]
    all: bool,

    /// List available cases
    #[arg(long)]
    list: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Daemon binary, or the directory containing it (overrides BINPATH)
    #[arg(long)]
    binpath: Option<PathBuf>,

    /// Deadline for each run, in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,

    /// Deadline for each DNS query, in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    probe_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

/// JSON output for a case listing.
#[derive(serde::Serialize)]
struct CaseJson {
    name: String,
    args: Vec<String>,
    expect_failure: bool,
}

/// JSON output for a case result.
#[derive(serde::Serialize)]
struct ResultJson {
    case: String,
    passed: bool,
    timed_out: bool,
    failures: Vec<String>,
    exit_code: Option<i32>,
    elapsed_ms: u128,
    /// Set when the case could not be run at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&Report> for ResultJson {
    fn from(report: &Report) -> Self {
        Self {
            case: report.name.clone(),
            passed: report.passed(),
            timed_out: report.timed_out(),
            failures: report.failures.iter().map(ToString::to_string).collect(),
            exit_code: report.exit.code(),
            elapsed_ms: report.elapsed.as_millis(),
            error: None,
        }
    }
}

impl ResultJson {
    fn errored(case: &TestCase, error: &HarnessError) -> Self {
        Self {
            case: case.name(),
            passed: false,
            timed_out: false,
            failures: Vec::new(),
            exit_code: None,
            elapsed_ms: 0,
            error: Some(error.to_string()),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    if let Some(binpath) = &args.binpath {
        settings.binpath = Some(binpath.clone());
    }
    for (secs, slot) in [
        (args.timeout_secs, &mut settings.run_timeout),
        (args.probe_timeout_secs, &mut settings.probe_timeout),
    ] {
        if let Some(secs) = secs {
            *slot = Duration::from_secs(secs);
        }
    }

    let binary = locate(&settings);

    if args.list {
        let dir = binary
            .as_deref()
            .ok()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        return list_cases(&dir, args.format);
    }

    if args.case.is_none() && !args.all {
        eprintln!("Usage: dnscrypt-conformance --case <name>");
        eprintln!("       dnscrypt-conformance --all");
        eprintln!("       dnscrypt-conformance --list");
        return ExitCode::from(2);
    }

    let binary = match binary {
        Ok(binary) => binary,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let dir = binary.parent().map(Path::to_path_buf).unwrap_or_default();
    let cases = match suite::basic(&dir) {
        Ok(cases) => cases,
        Err(e) => {
            error!("invalid pattern in suite: {e}");
            return ExitCode::from(2);
        }
    };
    let selected: Vec<TestCase> = match &args.case {
        Some(name) => {
            let found: Vec<_> = cases.into_iter().filter(|c| &c.name() == name).collect();
            if found.is_empty() {
                eprintln!("unknown case: {name}");
                return ExitCode::from(2);
            }
            found
        }
        None => cases,
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to create runtime: {e}");
            return ExitCode::from(2);
        }
    };

    let harness = Harness::new(binary, settings);
    let start = Instant::now();
    let mut results = Vec::new();
    let mut passed = true;
    let mut errored = 0usize;
    for case in &selected {
        let report = match rt.block_on(harness.run(case)) {
            Ok(report) => report,
            Err(e) => {
                error!(case = %case.name(), "{e}");
                passed = false;
                errored += 1;
                match args.format {
                    Format::Text => print_error(case, &e, start),
                    Format::Json => results.push(ResultJson::errored(case, &e)),
                }
                continue;
            }
        };
        passed &= report.passed();
        match args.format {
            Format::Text => print_report(&report, start),
            Format::Json => results.push(ResultJson::from(&report)),
        }
    }

    if args.format == Format::Json {
        match serde_json::to_string(&results) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!("failed to encode results: {e}");
                return ExitCode::from(2);
            }
        }
    }

    if errored == selected.len() {
        ExitCode::from(2)
    } else if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn list_cases(dir: &Path, format: Format) -> ExitCode {
    let cases = match suite::basic(dir) {
        Ok(cases) => cases,
        Err(e) => {
            error!("invalid pattern in suite: {e}");
            return ExitCode::from(2);
        }
    };

    match format {
        Format::Json => {
            let output: Vec<CaseJson> = cases
                .iter()
                .map(|c| CaseJson {
                    name: c.name(),
                    args: c.args.clone(),
                    expect_failure: c.expect == Outcome::Failure,
                })
                .collect();
            match serde_json::to_string(&output) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    error!("failed to encode case list: {e}");
                    return ExitCode::from(2);
                }
            }
        }
        Format::Text => {
            println!("Available cases:\n");
            for case in &cases {
                println!("  {}", case.name());
            }
            println!("\nTotal: {} cases", cases.len());
        }
    }
    ExitCode::SUCCESS
}

/// Format elapsed time as an uptime-style stamp (e.g. "0.00123s").
fn format_uptime(start: Instant) -> String {
    format!("{:>8.5}s", start.elapsed().as_secs_f64())
}

fn print_report(report: &Report, start: Instant) {
    if report.passed() {
        eprintln!(
            "{} {} {} {} ({:.2?})",
            format_uptime(start),
            "[harn]".cyan(),
            "PASS".green(),
            report.name,
            report.elapsed
        );
    } else {
        eprintln!(
            "{} {} {} {} ({:.2?})",
            format_uptime(start),
            "[harn]".cyan(),
            "FAIL".red(),
            report.name,
            report.elapsed
        );
        eprintln!("{}", report.render());
    }
}

fn print_error(case: &TestCase, error: &HarnessError, start: Instant) {
    eprintln!(
        "{} {} {} {} ({error})",
        format_uptime(start),
        "[harn]".cyan(),
        "FAIL".red(),
        case.name()
    );
}
