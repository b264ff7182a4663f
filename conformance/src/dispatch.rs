//! Serialized dispatch of match events to handlers.
//!
//! Both stream matchers feed one queue; the [`Dispatcher`] is its only
//! consumer. Handlers run to completion one at a time, so a handler can
//! signal the daemon or wait on the network without racing another handler.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Failure;
use crate::matcher::MatchEvent;
use crate::pattern::{MatchOutput, Pattern, PatternId};
use crate::probe::ProbeClient;
use crate::process::ProcessHandle;

/// The future a handler returns.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Side-effecting reaction to a matched pattern.
pub trait Handler: Send + Sync {
    /// Name used in logs and failure messages.
    fn name(&self) -> &str;

    /// React to one match. Failures go to [`HandlerContext::record`].
    fn handle<'a>(
        &'a self,
        output: &'a MatchOutput,
        ctx: &'a mut HandlerContext,
    ) -> HandlerFuture<'a>;
}

/// What a handler may touch while it runs.
pub struct HandlerContext {
    pub process: ProcessHandle,
    pub probe: ProbeClient,
    failures: Vec<Failure>,
}

impl HandlerContext {
    pub fn new(process: ProcessHandle, probe: ProbeClient) -> Self {
        Self {
            process,
            probe,
            failures: Vec::new(),
        }
    }

    /// Record a failure against the running test case.
    pub fn record(&mut self, failure: Failure) {
        warn!("{failure}");
        self.failures.push(failure);
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }
}

/// Handler table keyed by pattern identity.
#[derive(Clone, Default)]
pub struct Handlers(HashMap<PatternId, Arc<dyn Handler>>);

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for matches of `pattern`, replacing any previous one.
    pub fn on(mut self, pattern: &Pattern, handler: impl Handler + 'static) -> Self {
        self.0.insert(pattern.id(), Arc::new(handler));
        self
    }

    pub fn get(&self, id: PatternId) -> Option<&Arc<dyn Handler>> {
        self.0.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(id, handler)| (id, handler.name())))
            .finish()
    }
}

pub struct Dispatcher {
    handlers: Handlers,
    ctx: HandlerContext,
}

impl Dispatcher {
    pub fn new(handlers: Handlers, ctx: HandlerContext) -> Self {
        Self { handlers, ctx }
    }

    /// Drain `events` until every sender is gone, then return the failures
    /// the handlers recorded.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<MatchEvent>) -> Vec<Failure> {
        let mut dispatched = 0usize;
        while let Some(event) = events.recv().await {
            let Some(handler) = self.handlers.get(event.pattern.id()).cloned() else {
                trace!(stream = %event.stream, pattern = event.pattern.label(), "no handler");
                continue;
            };
            debug!(
                stream = %event.stream,
                pattern = event.pattern.label(),
                handler = handler.name(),
                "dispatching"
            );
            handler.handle(&event.output, &mut self.ctx).await;
            dispatched += 1;
        }
        debug!(dispatched, "event queue drained");
        self.ctx.failures
    }
}
