//! Harness tests against `/bin/sh` scripts standing in for the daemon.
#![cfg(unix)]

use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dnscrypt_conformance::dispatch::{Handler, HandlerContext, HandlerFuture, Handlers};
use dnscrypt_conformance::handlers::Listening;
use dnscrypt_conformance::matcher::StreamKind;
use dnscrypt_conformance::probe::{DnsQuery, ProbeError};
use dnscrypt_conformance::{
    Automaton, Failure, Harness, MatchOutput, Pattern, Report, Settings, TestCase,
};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

static TRACING_INIT: AtomicBool = AtomicBool::new(false);

fn init_tracing() {
    if TRACING_INIT
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

const PREFIX: &str = "[2019-11-10 12:00:00] [NOTICE]";

/// Write an executable shell script named `fake-daemon` into `dir`.
fn daemon(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("fake-daemon");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn settings(run: Duration, probe: Duration) -> Settings {
    Settings {
        run_timeout: run,
        probe_timeout: probe,
        ..Settings::default()
    }
}

async fn run(binary: &Path, settings: Settings, case: &TestCase) -> Report {
    init_tracing();
    Harness::new(binary, settings).run(case).await.unwrap()
}

fn regex(label: &str, re: &str) -> Pattern {
    Pattern::regex(label, re).unwrap()
}

fn unmatched(report: &Report) -> Vec<&str> {
    report
        .failures
        .iter()
        .filter_map(|f| match f {
            Failure::Unmatched { line, .. } => Some(line.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn version_case_passes() {
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(&dir, "echo 2.0.31");
    let version = regex("version", r"^\d+\.\d+\.\d+$");
    let case = TestCase::new(["-version"]).stdout(Automaton::new().start([version]));

    let report = run(&bin, Settings::default(), &case).await;
    assert!(report.passed(), "{}", report.render());
    assert_eq!(report.exit.code(), Some(0));
    assert_eq!(report.transcript.len(), 1);
    assert_eq!(report.transcript[0].matched.as_deref(), Some("version"));
}

#[tokio::test]
async fn declared_failure_requires_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(
        &dir,
        &format!("echo '{PREFIX} Unable to load the configuration file' >&2\nexit 255"),
    );
    let no_config = regex(
        "no config",
        r"^\[[^\]]+\]\s\[[^\]]+\]\sUnable to load the configuration file",
    );
    let case = TestCase::new(["-check"]).stderr(Automaton::new().start([no_config]));

    let report = run(&bin, Settings::default(), &case.clone().expect_failure()).await;
    assert!(report.passed(), "{}", report.render());

    let report = run(&bin, Settings::default(), &case).await;
    assert!(matches!(
        report.failures.as_slice(),
        [Failure::UnexpectedExit { .. }]
    ));
}

#[tokio::test]
async fn every_unmatched_line_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(&dir, "echo 2.0.31\necho bogus\necho more\nprintf partial");
    let version = regex("version", r"^\d+\.\d+\.\d+$");
    let case = TestCase::new(["-version"]).stdout(Automaton::new().start([version]));

    let report = run(&bin, Settings::default(), &case).await;
    assert_eq!(unmatched(&report), ["bogus", "more"]);
    let (_, stdout) = report
        .trailing
        .iter()
        .find(|(stream, _)| *stream == StreamKind::Stdout)
        .unwrap();
    assert_eq!(stdout, &["more", "partial"]);
    assert!(report.render().contains("Remaining stdout:\nmore\npartial"));
}

#[tokio::test]
async fn silent_stream_must_stay_silent() {
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(&dir, "echo noise >&2");
    let report = run(&bin, Settings::default(), &TestCase::new(["-quiet"])).await;
    assert_eq!(unmatched(&report), ["noise"]);
    assert!(report.failures[0].to_string().contains("must stay silent"));
}

#[tokio::test]
async fn deadline_expiry_is_reported_as_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(&dir, "echo 2.0.31\nexec sleep 30");
    let version = regex("version", r"^\d+\.\d+\.\d+$");
    let case = TestCase::new(["-version"]).stdout(Automaton::new().start([version]));

    let limit = settings(Duration::from_secs(1), Duration::from_secs(1));
    let report = run(&bin, limit, &case).await;
    assert!(report.timed_out());
    assert!(matches!(report.failures.last(), Some(Failure::Timeout(_))));
    // Killed by the harness, so the exit check fails too.
    assert!(
        report
            .failures
            .iter()
            .any(|f| matches!(f, Failure::UnexpectedExit { .. }))
    );
    assert!(report.elapsed < Duration::from_secs(10));
}

#[tokio::test]
async fn deadline_expiry_while_stdin_is_blocked() {
    let dir = tempfile::tempdir().unwrap();
    // Never reads stdin, so the pipe fills up.
    let bin = daemon(&dir, "exec sleep 30");
    let case = TestCase::new(["-config", "/dev/stdin"]).stdin("#".repeat(1 << 20));

    let limit = settings(Duration::from_secs(1), Duration::from_secs(1));
    let report = run(&bin, limit, &case).await;
    assert!(matches!(report.failures.last(), Some(Failure::Timeout(_))));
    assert_eq!(report.exit.code(), None);
    assert!(report.elapsed < Duration::from_secs(10));
}

/// Panics on every match it is handed.
struct Panicking;

impl Handler for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn handle<'a>(
        &'a self,
        output: &'a MatchOutput,
        _ctx: &'a mut HandlerContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            assert!(output.captures().is_some(), "cannot use {output:?}");
        })
    }
}

#[tokio::test]
async fn panicked_dispatcher_is_recorded_and_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(&dir, "echo ready");
    let ready = Pattern::exact("ready", "ready");
    let case = TestCase::new(["-ready"])
        .stdout(Automaton::new().start([ready.clone()]))
        .handlers(Handlers::new().on(&ready, Panicking));

    let report = run(&bin, Settings::default(), &case).await;
    assert!(
        matches!(
            report.failures.as_slice(),
            [Failure::Task {
                task: "dispatcher",
                ..
            }]
        ),
        "{}",
        report.render()
    );
    // The exit check still ran.
    assert_eq!(report.exit.code(), Some(0));
}

#[tokio::test]
async fn stdin_env_and_working_dir_reach_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bin = daemon(&dir, "read line\necho \"$line\"\necho \"$GREETING\"\npwd -P");
    let work_path = work.path().canonicalize().unwrap();

    let lines = [
        Pattern::exact("stdin", "offline_mode = true"),
        Pattern::exact("env", "hello"),
        Pattern::exact("dir", work_path.display().to_string()),
    ];
    let stdout = Automaton::new()
        .start([lines[0].clone()])
        .after(&lines[0], [lines[1].clone()])
        .after(&lines[1], [lines[2].clone()]);
    let case = TestCase::new(["-config", "/dev/stdin"])
        .stdin("offline_mode = true\n")
        .env("GREETING", "hello")
        .dir(&work_path)
        .stdout(stdout);

    let report = run(&bin, Settings::default(), &case).await;
    assert!(report.passed(), "{}", report.render());
}

#[tokio::test]
async fn working_dir_defaults_to_binary_dir() {
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(&dir, "pwd -P");
    let here = Pattern::exact("dir", dir.path().canonicalize().unwrap().display().to_string());
    let case = TestCase::new(["-where"]).stdout(Automaton::new().start([here]));

    let report = run(&bin, Settings::default(), &case).await;
    assert!(report.passed(), "{}", report.render());
}

#[tokio::test]
async fn streams_are_matched_independently() {
    let dir = tempfile::tempdir().unwrap();
    let out = Pattern::exact("out", "to stdout");
    let err = Pattern::exact("err", "to stderr");
    let case = TestCase::new(["-both"])
        .stdout(Automaton::new().start([out]))
        .stderr(Automaton::new().start([err]));

    for body in [
        "echo 'to stdout'\necho 'to stderr' >&2",
        "echo 'to stderr' >&2\necho 'to stdout'",
    ] {
        let bin = daemon(&dir, body);
        let report = run(&bin, Settings::default(), &case).await;
        assert!(report.passed(), "{}", report.render());
    }
}

/// Answers `localhost. A` with 127.0.0.1 and everything else with NXDOMAIN.
fn answer(request: &[u8]) -> Vec<u8> {
    let request = Message::from_vec(request).unwrap();
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .add_queries(request.queries().to_vec());
    let query = &request.queries()[0];
    if query.name().to_ascii() == "localhost." && query.query_type() == RecordType::A {
        response.add_answer(Record::from_rdata(
            query.name().clone(),
            600,
            RData::A(A::new(127, 0, 0, 1)),
        ));
    } else {
        response.set_response_code(ResponseCode::NXDomain);
    }
    response.to_vec().unwrap()
}

struct FakeDns {
    udp: SocketAddr,
    tcp: SocketAddr,
}

async fn fake_dns() -> FakeDns {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addrs = FakeDns {
        udp: udp.local_addr().unwrap(),
        tcp: tcp.local_addr().unwrap(),
    };

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = udp.recv_from(&mut buf).await {
            let _ = udp.send_to(&answer(&buf[..n]), peer).await;
        }
    });
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = tcp.accept().await {
            tokio::spawn(async move {
                let mut len = [0u8; 2];
                if stream.read_exact(&mut len).await.is_err() {
                    return;
                }
                let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                let reply = answer(&body);
                let mut frame = (reply.len() as u16).to_be_bytes().to_vec();
                frame.extend_from_slice(&reply);
                let _ = stream.write_all(&frame).await;
            });
        }
    });
    addrs
}

/// Announces both listeners, then idles until interrupted.
fn listening_daemon(dir: &TempDir, udp: SocketAddr, tcp: SocketAddr) -> PathBuf {
    daemon(
        dir,
        &format!(
            "trap 'echo \"{PREFIX} Stopped.\" >&2; exit 0' INT\n\
             echo '{PREFIX} Now listening to {udp} [UDP]' >&2\n\
             echo '{PREFIX} Now listening to {tcp} [TCP]' >&2\n\
             while true; do sleep 0.1; done"
        ),
    )
}

fn listening_case(query: DnsQuery) -> TestCase {
    let listening = regex(
        "listening",
        r"^\[[^\]]+\]\s\[[^\]]+\]\sNow listening to (\d+\.\d+\.\d+\.\d+:\d+) \[([^\]]+)\]$",
    );
    let stopped = regex("stopped", r"^\[[^\]]+\]\s\[[^\]]+\]\sStopped\.$");
    let stderr = Automaton::new()
        .start([listening.clone()])
        .after(&listening, [listening.clone(), stopped]);
    TestCase::new(["-config", "/dev/stdin"])
        .stderr(stderr)
        .handlers(Handlers::new().on(&listening, Listening::new([query])))
}

#[tokio::test]
async fn tcp_probe_success_interrupts_daemon() {
    let dns = fake_dns().await;
    let dir = tempfile::tempdir().unwrap();
    let bin = listening_daemon(&dir, dns.udp, dns.tcp);
    let query = DnsQuery::new(
        "localhost",
        RecordType::A,
        "CLOAK",
        "-",
        ResponseCode::NoError,
        &[r"^localhost\.\s600\sIN\sA\s127\.0\.0\.1$"],
    )
    .unwrap();

    let report = run(
        &bin,
        settings(Duration::from_secs(10), Duration::from_secs(2)),
        &listening_case(query),
    )
    .await;
    assert!(report.passed(), "{}", report.render());
    assert_eq!(report.exit.code(), Some(0));
    assert_eq!(
        report.transcript.last().and_then(|l| l.matched.as_deref()),
        Some("stopped")
    );
}

#[tokio::test]
async fn failed_probe_kills_daemon() {
    let dns = fake_dns().await;
    let dir = tempfile::tempdir().unwrap();
    let bin = listening_daemon(&dir, dns.udp, dns.tcp);
    let query = DnsQuery::new(
        "eth0.me",
        RecordType::A,
        "REJECT",
        "-",
        ResponseCode::NoError,
        &[r"^eth0\.me\.\s1\sIN\sHINFO\s.+$"],
    )
    .unwrap();

    let report = run(
        &bin,
        settings(Duration::from_secs(10), Duration::from_secs(2)),
        &listening_case(query),
    )
    .await;
    assert!(!report.timed_out(), "{}", report.render());
    assert!(matches!(
        report.failures.first(),
        Some(Failure::Probe {
            source: ProbeError::ResponseCode {
                actual: ResponseCode::NXDomain,
                ..
            },
            ..
        })
    ));
    // SIGKILL, so no exit code.
    assert_eq!(report.exit.code(), None);
}

#[tokio::test]
async fn unanswered_probe_times_out() {
    // Bound but never read.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let addr = silent.local_addr().unwrap();
    let bin = listening_daemon(&dir, addr, addr);
    let query =
        DnsQuery::new("localhost", RecordType::A, "CLOAK", "-", ResponseCode::NoError, &[])
            .unwrap();

    let report = run(
        &bin,
        settings(Duration::from_secs(10), Duration::from_millis(300)),
        &listening_case(query),
    )
    .await;
    assert!(!report.timed_out(), "{}", report.render());
    assert!(matches!(
        report.failures.first(),
        Some(Failure::Probe {
            source: ProbeError::Timeout(_),
            ..
        })
    ));
    drop(silent);
}

#[tokio::test]
async fn deadline_expiry_during_dns_query() {
    // Accepts connections and never answers.
    let mute = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = mute.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = mute.accept().await {
            held.push(stream);
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let bin = daemon(
        &dir,
        &format!(
            "echo '{PREFIX} Now listening to {addr} [TCP]' >&2\n\
             while true; do sleep 0.1; done"
        ),
    );
    let query = DnsQuery::new(
        "localhost",
        RecordType::A,
        "CLOAK",
        "-",
        ResponseCode::NoError,
        &[],
    )
    .unwrap();

    // The run deadline comes first, so it bounds the probe.
    let report = run(
        &bin,
        settings(Duration::from_secs(1), Duration::from_secs(30)),
        &listening_case(query),
    )
    .await;
    assert!(matches!(report.failures.last(), Some(Failure::Timeout(_))));
    assert!(
        report.failures.iter().any(|f| matches!(
            f,
            Failure::Probe {
                source: ProbeError::Timeout(_),
                ..
            }
        )),
        "{}",
        report.render()
    );
    assert!(report.elapsed < Duration::from_secs(10));
}
