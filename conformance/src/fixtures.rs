//! Configuration snippets, log-line patterns and DNS queries shared by the
//! scenarios in [`suite`](crate::suite).

use std::path::Path;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

use crate::pattern::Pattern;
use crate::probe::DnsQuery;

// Configuration fed to the daemon on stdin.
pub const OFFLINE: &str = "offline_mode = true\n";
pub const LISTEN: &str = "listen_addresses = ['127.0.0.1:0']\n";
pub const BLOCK_IPV6: &str = "block_ipv6 = true\n";
pub const QUERY_LOG: &str = "[query_log]\nfile = '/dev/stdout'\n";

pub fn cloaking_rules(file: &Path) -> String {
    format!("cloaking_rules = '{}'\n", file.display())
}

pub fn blacklist(file: &Path) -> String {
    format!("[blacklist]\nblacklist_file = '{}'\n", file.display())
}

/// `[<timestamp>] [<level>] `
const LOG_PREFIX: &str = r"^\[[^\]]+\]\s\[[^\]]+\]\s";
const VERSION: &str = r"\d+\.\d+\.\d+";
const IP: &str = r"\d+\.\d+\.\d+\.\d+";

fn log_line(label: &str, message: &str) -> Result<Pattern, regex::Error> {
    Pattern::regex(label, &format!("{LOG_PREFIX}{message}"))
}

/// Lines the daemon prints on stdout and stderr.
#[derive(Debug, Clone)]
pub struct LogLines {
    pub version: Pattern,
    pub help_header: Pattern,
    pub help_item: Pattern,
    pub help_text: Pattern,
    pub no_config: Pattern,
    pub name_version: Pattern,
    pub connectivity: Pattern,
    pub no_servers: Pattern,
    pub checked: Pattern,
    pub load_firefox: Pattern,
    pub load_cloak: Pattern,
    pub load_block: Pattern,
    /// Captures the listener address and protocol.
    pub listening: Pattern,
    pub stopped: Pattern,
}

impl LogLines {
    pub fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            version: Pattern::regex("version", &format!("^{VERSION}$"))?,
            help_header: Pattern::regex("help header", r"^Usage of [^:]+:$")?,
            help_item: Pattern::regex("help item", r"^  -.+$")?,
            help_text: Pattern::regex("help text", r"^    \t.+$")?,
            no_config: log_line("no config", "Unable to load the configuration file")?,
            name_version: log_line("name and version", &format!("dnscrypt-proxy {VERSION}"))?,
            connectivity: log_line("connectivity", "Network connectivity detected$")?,
            no_servers: log_line("no servers", "No servers configured$")?,
            checked: log_line("checked", "Configuration successfully checked$")?,
            load_firefox: log_line("firefox workaround", "Firefox workaround initialized$")?,
            load_cloak: log_line("cloaking rules", "Loading the set of cloaking rules")?,
            load_block: log_line("blocking rules", "Loading the set of blocking rules")?,
            listening: log_line(
                "listening",
                &format!(r"Now listening to ({IP}:\d+) \[([^\]]+)\]$"),
            )?,
            stopped: log_line("stopped", r"Stopped\.$")?,
        })
    }
}

/// Queries sent to a listening daemon, with their expected responses.
#[derive(Debug, Clone)]
pub struct Queries {
    pub firefox: DnsQuery,
    pub block_ipv6: DnsQuery,
    pub example_cloak: DnsQuery,
    pub example_cloak_v6: DnsQuery,
    pub example_blacklist: DnsQuery,
}

impl Queries {
    pub fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            firefox: DnsQuery::new(
                "use-application-dns.net",
                RecordType::A,
                "SYNTH",
                "-",
                ResponseCode::NXDomain,
                &[],
            )?,
            block_ipv6: DnsQuery::new(
                "dnscrypt.info",
                RecordType::AAAA,
                "SYNTH",
                "-",
                ResponseCode::NoError,
                &[
                    r#"^dnscrypt\.info\.\s86400\sIN\sHINFO\s"AAAA queries have been locally blocked by dnscrypt-proxy" "Set block_ipv6 to false to disable this feature"$"#,
                ],
            )?,
            example_cloak: DnsQuery::new(
                "localhost",
                RecordType::A,
                "CLOAK",
                "-",
                ResponseCode::NoError,
                &[r"^localhost\.\s600\sIN\sA\s127\.0\.0\.1$"],
            )?,
            example_cloak_v6: DnsQuery::new(
                "localhost",
                RecordType::AAAA,
                "CLOAK",
                "-",
                ResponseCode::NoError,
                &[r"^localhost\.\s600\sIN\sAAAA\s::1$"],
            )?,
            example_blacklist: DnsQuery::new(
                "eth0.me",
                RecordType::A,
                "REJECT",
                "-",
                ResponseCode::NoError,
                &[
                    r#"^eth0\.me\.\s1\sIN\sHINFO\s"This query has been locally blocked" "by dnscrypt-proxy"$"#,
                ],
            )?,
        })
    }
}
