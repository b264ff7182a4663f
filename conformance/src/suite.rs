//! The basic functionality suite for `dnscrypt-proxy`.

use std::path::Path;

use crate::dispatch::Handlers;
use crate::fixtures::{self, LogLines, Queries};
use crate::handlers::Listening;
use crate::pattern::{Automaton, Pattern};
use crate::probe::DnsQuery;
use crate::testcase::TestCase;

/// Each pattern follows the previous one, starting with the first.
fn chain(patterns: &[&Pattern]) -> Automaton {
    let mut automaton = Automaton::new();
    let mut previous: Option<&Pattern> = None;
    for &pattern in patterns {
        automaton = match previous {
            None => automaton.start([pattern.clone()]),
            Some(prev) => automaton.after(prev, [pattern.clone()]),
        };
        previous = Some(pattern);
    }
    automaton
}

/// One or more log lines, each drawn from `logs`, in any order.
fn query_logs(logs: &[&Pattern]) -> Automaton {
    let logs: Vec<Pattern> = logs.iter().map(|&p| p.clone()).collect();
    logs.iter()
        .fold(Automaton::new().start(logs.clone()), |automaton, log| {
            automaton.after(log, logs.clone())
        })
}

/// Startup through the listeners, then more listeners or the shutdown line.
fn serving(lines: &LogLines, loaded: &[&Pattern]) -> Automaton {
    let mut steps = vec![&lines.name_version, &lines.connectivity, &lines.load_firefox];
    steps.extend_from_slice(loaded);
    steps.push(&lines.listening);
    chain(&steps).after(
        &lines.listening,
        [lines.listening.clone(), lines.stopped.clone()],
    )
}

fn probing(lines: &LogLines, queries: &[&DnsQuery]) -> Handlers {
    Handlers::new().on(
        &lines.listening,
        Listening::new(queries.iter().map(|&q| q.clone())),
    )
}

/// Every scenario of the suite. `binary_dir` holds the example rule files
/// shipped next to the daemon.
pub fn basic(binary_dir: &Path) -> Result<Vec<TestCase>, regex::Error> {
    let lines = LogLines::compile()?;
    let q = Queries::compile()?;
    let listen = format!("{}{}", fixtures::OFFLINE, fixtures::LISTEN);

    Ok(vec![
        TestCase::new(["-version"]).stdout(chain(&[&lines.version])),
        TestCase::new(["-check"])
            .stderr(chain(&[&lines.no_config]))
            .expect_failure(),
        TestCase::new(["-help"])
            .stderr(
                chain(&[&lines.help_header, &lines.help_item, &lines.help_text]).after(
                    &lines.help_text,
                    [lines.help_item.clone(), lines.help_text.clone()],
                ),
            )
            .expect_failure(),
        TestCase::new(["-config", "/dev/null"])
            .stderr(chain(&[
                &lines.name_version,
                &lines.connectivity,
                &lines.no_servers,
            ]))
            .expect_failure(),
        TestCase::new(["-check", "-config", "/dev/stdin"])
            .named("check offline")
            .stdin(fixtures::OFFLINE)
            .stderr(chain(&[
                &lines.name_version,
                &lines.connectivity,
                &lines.checked,
            ])),
        TestCase::new(["-show-certs", "-config", "/dev/stdin"])
            .named("show-certs offline")
            .stdin(fixtures::OFFLINE)
            .stderr(chain(&[
                &lines.name_version,
                &lines.connectivity,
                &lines.load_firefox,
            ])),
        TestCase::new(["-config", "/dev/stdin"])
            .named("query firefox plugin")
            .stdin(format!("{listen}{}", fixtures::QUERY_LOG))
            .stdout(query_logs(&[&q.firefox.log]))
            .stderr(serving(&lines, &[]))
            .handlers(probing(&lines, &[&q.firefox])),
        TestCase::new(["-config", "/dev/stdin"])
            .named("query block_ipv6")
            .stdin(format!(
                "{listen}{}{}",
                fixtures::BLOCK_IPV6,
                fixtures::QUERY_LOG
            ))
            .stdout(query_logs(&[&q.block_ipv6.log]))
            .stderr(serving(&lines, &[]))
            .handlers(probing(&lines, &[&q.block_ipv6])),
        // A and AAAA logs may interleave across the UDP and TCP rounds.
        TestCase::new(["-config", "/dev/stdin"])
            .named("query example cloaking")
            .stdin(format!(
                "{listen}{}{}",
                fixtures::cloaking_rules(&binary_dir.join("example-cloaking-rules.txt")),
                fixtures::QUERY_LOG
            ))
            .stdout(query_logs(&[&q.example_cloak.log, &q.example_cloak_v6.log]))
            .stderr(serving(&lines, &[&lines.load_cloak]))
            .handlers(probing(&lines, &[&q.example_cloak, &q.example_cloak_v6])),
        TestCase::new(["-config", "/dev/stdin"])
            .named("query example blacklist")
            .stdin(format!(
                "{listen}{}{}",
                fixtures::QUERY_LOG,
                fixtures::blacklist(&binary_dir.join("example-blacklist.txt"))
            ))
            .stdout(query_logs(&[&q.example_blacklist.log]))
            .stderr(serving(&lines, &[&lines.load_block]))
            .handlers(probing(&lines, &[&q.example_blacklist])),
    ])
}
