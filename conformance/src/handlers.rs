//! Scenario handlers.

use std::net::SocketAddr;

use tracing::info;

use crate::dispatch::{Handler, HandlerContext, HandlerFuture};
use crate::error::Failure;
use crate::pattern::MatchOutput;
use crate::probe::{DnsQuery, ProbeError, Transport};

/// Reacts to the daemon's "Now listening to <addr> [<proto>]" line by
/// probing the announced socket with each query in order.
///
/// The first failed query is recorded and the daemon is killed, since the
/// lines it would have logged for the rest will never arrive. After every
/// query succeeded over TCP the daemon is interrupted so the run ends.
#[derive(Debug, Clone)]
pub struct Listening {
    queries: Vec<DnsQuery>,
}

impl Listening {
    pub fn new(queries: impl IntoIterator<Item = DnsQuery>) -> Self {
        Self {
            queries: queries.into_iter().collect(),
        }
    }

    async fn run(&self, output: &MatchOutput, ctx: &mut HandlerContext) {
        let Some([_, addr, proto]) = output.captures() else {
            ctx.record(Failure::Handler {
                handler: self.name().to_string(),
                message: format!("expected (line, address, protocol) captures, got {output:?}"),
            });
            return;
        };

        for query in &self.queries {
            if let Err(source) = probe(ctx, addr, proto, query).await {
                ctx.record(Failure::Probe {
                    transport: proto.clone(),
                    addr: addr.clone(),
                    query: query.to_string(),
                    source,
                });
                if let Err(failure) = ctx.process.kill() {
                    ctx.record(failure);
                }
                return;
            }
            info!(%proto, %addr, %query, "probe passed");
        }

        // The TCP listener is announced after the UDP one.
        if proto == "TCP" {
            if let Err(failure) = ctx.process.interrupt() {
                ctx.record(failure);
            }
        }
    }
}

async fn probe(
    ctx: &HandlerContext,
    addr: &str,
    proto: &str,
    query: &DnsQuery,
) -> Result<(), ProbeError> {
    let transport: Transport = proto.parse()?;
    let addr: SocketAddr = addr.parse().map_err(|e| ProbeError::Io {
        op: "parse listener address",
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })?;
    ctx.probe.check(transport, addr, query).await.map(drop)
}

impl Handler for Listening {
    fn name(&self) -> &str {
        "listening"
    }

    fn handle<'a>(
        &'a self,
        output: &'a MatchOutput,
        ctx: &'a mut HandlerContext,
    ) -> HandlerFuture<'a> {
        Box::pin(self.run(output, ctx))
    }
}
