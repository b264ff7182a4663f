//! DNS probe client.
//!
//! Sends one query per exchange to the daemon's advertised listener and
//! checks the response against a [`DnsQuery`]. UDP is a single datagram
//! round trip; TCP opens a fresh connection per query, writes one
//! length-prefixed message, reads exactly one response and drops the
//! connection.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::pattern::Pattern;

/// Largest UDP response we accept.
const MAX_UDP_RESPONSE: usize = 4096;

static NEXT_QUERY_ID: AtomicU16 = AtomicU16::new(1);

/// Transport used for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl FromStr for Transport {
    type Err = ProbeError;

    /// Parses the protocol label the daemon prints (`UDP`, `TCP`).
    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label {
            "UDP" => Ok(Self::Udp),
            "TCP" => Ok(Self::Tcp),
            other => Err(ProbeError::UnsupportedTransport(other.to_owned())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        })
    }
}

/// Why a probe failed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("unimplemented DNS transport protocol: {0}")]
    UnsupportedTransport(String),

    #[error("invalid domain {domain:?}: {source}")]
    InvalidDomain {
        domain: String,
        #[source]
        source: ProtoError,
    },

    #[error("failed to encode query: {0}")]
    Encode(#[source] ProtoError),

    #[error("failed to decode response: {0}")]
    Decode(#[source] ProtoError),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("query too large for TCP framing: {0} bytes")]
    Oversized(usize),

    #[error("DNS rcode: expected {expected}, got {actual}\n{response}")]
    ResponseCode {
        expected: ResponseCode,
        actual: ResponseCode,
        response: String,
    },

    #[error("DNS answers: expected {expected}, got {actual}\n{response}")]
    AnswerCount {
        expected: usize,
        actual: usize,
        response: String,
    },

    #[error("DNS answer #{index}: {actual:?} does not match /{expected}/")]
    Answer {
        index: usize,
        expected: String,
        actual: String,
    },
}

impl ProbeError {
    fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { op, source }
    }
}

/// A DNS query to send and the outcome expected from it.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub domain: String,
    pub record_type: RecordType,
    /// Matches the daemon's query-log line for this query.
    pub log: Pattern,
    pub rcode: ResponseCode,
    /// One pattern per expected answer record, in order.
    pub answers: Vec<Pattern>,
}

/// Query-log line template: domain, type, result code, server label.
const QUERY_LOG_LINE: &str =
    r"^\[[^\]]+\]\s127\.0\.0\.1\s{domain}\s{rtype}\s{result}\s\d+ms\s{server}$";

impl DnsQuery {
    /// Build a query and compile its log-line and answer patterns.
    ///
    /// `log_result` is the result code the daemon writes to its query log
    /// (`SYNTH`, `CLOAK`, ...) and `log_server` the server label.
    pub fn new(
        domain: &str,
        record_type: RecordType,
        log_result: &str,
        log_server: &str,
        rcode: ResponseCode,
        answers: &[&str],
    ) -> Result<Self, regex::Error> {
        let log = QUERY_LOG_LINE
            .replace("{domain}", &regex::escape(domain))
            .replace("{rtype}", &regex::escape(&record_type.to_string()))
            .replace("{result}", &regex::escape(log_result))
            .replace("{server}", &regex::escape(log_server));
        let answers = answers
            .iter()
            .enumerate()
            .map(|(i, re)| Pattern::regex(format!("{domain} {record_type} answer #{i}"), re))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            domain: domain.to_owned(),
            record_type,
            log: Pattern::regex(format!("query log {domain} {record_type}"), &log)?,
            rcode,
            answers,
        })
    }

    /// Encode the request message for this query.
    pub fn to_message(&self) -> Result<Message, ProbeError> {
        let mut name = Name::from_ascii(&self.domain)
            .map_err(|source| ProbeError::InvalidDomain {
                domain: self.domain.clone(),
                source,
            })?;
        name.set_fqdn(true);

        let mut message = Message::new();
        message
            .set_id(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, self.record_type));
        Ok(message)
    }

    /// Check a response against the expected code and answers.
    pub fn verify(&self, response: &Message) -> Result<(), ProbeError> {
        if response.response_code() != self.rcode {
            return Err(ProbeError::ResponseCode {
                expected: self.rcode,
                actual: response.response_code(),
                response: response.to_string(),
            });
        }
        let answers = response.answers();
        if answers.len() != self.answers.len() {
            return Err(ProbeError::AnswerCount {
                expected: self.answers.len(),
                actual: answers.len(),
                response: response.to_string(),
            });
        }
        for (index, (record, expected)) in answers.iter().zip(&self.answers).enumerate() {
            let actual = render_record(record);
            if expected.test(&actual).is_none() {
                return Err(ProbeError::Answer {
                    index,
                    expected: expected.source().to_owned(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for DnsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.domain, self.record_type)
    }
}

/// Canonical text of an answer record: `<name> <ttl> <class> <type> <rdata>`.
///
/// HINFO character-strings are quoted, as in zone-file presentation format.
pub fn render_record(record: &Record) -> String {
    let head = format!(
        "{} {} {} {}",
        record.name(),
        record.ttl(),
        record.dns_class(),
        record.record_type()
    );
    match record.data() {
        Some(RData::HINFO(hinfo)) => format!(
            "{head} {} {}",
            quote(&String::from_utf8_lossy(hinfo.cpu())),
            quote(&String::from_utf8_lossy(hinfo.os()))
        ),
        Some(rdata) => format!("{head} {rdata}"),
        None => head,
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Sends queries with every wait bounded by the run deadline and a
/// per-query timeout, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct ProbeClient {
    deadline: Instant,
    probe_timeout: Duration,
}

impl ProbeClient {
    pub fn new(deadline: Instant, probe_timeout: Duration) -> Self {
        Self {
            deadline,
            probe_timeout,
        }
    }

    fn query_deadline(&self) -> Instant {
        self.deadline.min(Instant::now() + self.probe_timeout)
    }

    /// Send `query` and check the response against it.
    pub async fn check(
        &self,
        transport: Transport,
        addr: SocketAddr,
        query: &DnsQuery,
    ) -> Result<Message, ProbeError> {
        let response = self.exchange(transport, addr, query).await?;
        debug!(%transport, %addr, %query, "response:\n{response}");
        query.verify(&response)?;
        Ok(response)
    }

    /// Send `query` and return the raw response.
    pub async fn exchange(
        &self,
        transport: Transport,
        addr: SocketAddr,
        query: &DnsQuery,
    ) -> Result<Message, ProbeError> {
        let request = query.to_message()?;
        let deadline = self.query_deadline();
        let waited = deadline.saturating_duration_since(Instant::now());
        let exchange = async {
            match transport {
                Transport::Udp => exchange_udp(addr, &request).await,
                Transport::Tcp => exchange_tcp(addr, &request).await,
            }
        };
        timeout_at(deadline, exchange)
            .await
            .map_err(|_| ProbeError::Timeout(waited))?
    }
}

async fn exchange_udp(addr: SocketAddr, request: &Message) -> Result<Message, ProbeError> {
    let bytes = request.to_vec().map_err(ProbeError::Encode)?;
    let local: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(ProbeError::io("UDP bind"))?;
    socket
        .connect(addr)
        .await
        .map_err(ProbeError::io("UDP connect"))?;
    socket
        .send(&bytes)
        .await
        .map_err(ProbeError::io("UDP send"))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE];
    loop {
        let n = socket
            .recv(&mut buf)
            .await
            .map_err(ProbeError::io("UDP receive"))?;
        let response = Message::from_vec(&buf[..n]).map_err(ProbeError::Decode)?;
        if response.id() == request.id() {
            return Ok(response);
        }
        debug!(
            expected = request.id(),
            got = response.id(),
            "ignoring stray UDP response"
        );
    }
}

async fn exchange_tcp(addr: SocketAddr, request: &Message) -> Result<Message, ProbeError> {
    let bytes = request.to_vec().map_err(ProbeError::Encode)?;
    let len = u16::try_from(bytes.len())
        .map_err(|_| ProbeError::Oversized(bytes.len()))?;

    // Dropped on every return path, which closes the connection.
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(ProbeError::io("TCP dial"))?;

    let mut frame = Vec::with_capacity(bytes.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&bytes);
    stream
        .write_all(&frame)
        .await
        .map_err(ProbeError::io("TCP write"))?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(ProbeError::io("TCP read"))?;
    let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(ProbeError::io("TCP read"))?;

    Message::from_vec(&body).map_err(ProbeError::Decode)
}
