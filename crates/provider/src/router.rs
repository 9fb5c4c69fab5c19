//! Model router and failover engine.
//!
//! Dispatch runs in four stages:
//! 1. **Resolve**: the most specific route pattern matching the model wins.
//!    Exact names beat globs, and longer glob prefixes beat shorter ones.
//! 2. **Filter**: candidates whose executor is unknown or lacks a required
//!    capability are dropped and recorded as skipped.
//! 3. **Dispatch**: candidates run one at a time by ascending priority, ties
//!    in declaration order. A transient failure advances to the next
//!    candidate. A permanent failure returns at once.
//! 4. **Exhausted**: if every candidate failed transiently, their errors are
//!    aggregated into [`GatewayError::Exhausted`].
//!
//! For streams, failover stops once an executor has returned a
//! [`ChunkStream`]; later failures arrive in-stream.

use crate::registry::{ExecutorEntry, ExecutorRegistry};
use keygate_config::{Config, RouteConfig};
use keygate_types::{
    AttemptError, Capability, ChunkStream, ErrorClass, GatewayError, Request, Response, Result,
};
use std::{
    collections::HashSet,
    fmt,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// A route pattern: an exact model name or a prefix followed by `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] for an empty pattern or a `*`
    /// anywhere but the end.
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = || GatewayError::Config(format!("invalid route pattern {pattern:?}"));
        match pattern.strip_suffix('*') {
            _ if pattern.is_empty() => Err(invalid()),
            Some(prefix) if prefix.contains('*') => Err(invalid()),
            Some(prefix) => Ok(Self::Prefix(prefix.to_string())),
            None if pattern.contains('*') => Err(invalid()),
            None => Ok(Self::Exact(pattern.to_string())),
        }
    }

    #[must_use]
    pub fn matches(&self, model: &str) -> bool {
        match self {
            Self::Exact(name) => name == model,
            Self::Prefix(prefix) => model.starts_with(prefix.as_str()),
        }
    }

    /// Orders patterns by specificity: exact first, then longer prefixes.
    fn specificity(&self) -> (bool, usize) {
        match self {
            Self::Exact(name) => (true, name.len()),
            Self::Prefix(prefix) => (false, prefix.len()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub executor: String,
    /// Lower runs first.
    pub priority: u32,
    /// Capabilities required on top of those the request implies.
    pub requires: Vec<Capability>,
}

impl Candidate {
    pub fn new(executor: impl Into<String>, priority: u32) -> Self {
        Self {
            executor: executor.into(),
            priority,
            requires: Vec::new(),
        }
    }

    #[must_use]
    pub fn requiring(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.requires.extend(capabilities);
        self
    }
}

/// A pattern and its candidates, sorted by priority at construction.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pattern: Pattern,
    candidates: Vec<Candidate>,
}

impl ModelRoute {
    /// # Errors
    ///
    /// See [`Pattern::parse`]. Also returns [`GatewayError::Config`] when an
    /// executor is listed more than once.
    pub fn new(pattern: &str, mut candidates: Vec<Candidate>) -> Result<Self> {
        let pattern = Pattern::parse(pattern)?;
        let mut seen = HashSet::with_capacity(candidates.len());
        if let Some(dup) = candidates.iter().find(|c| !seen.insert(c.executor.as_str())) {
            return Err(GatewayError::Config(format!(
                "route {pattern}: executor {} listed more than once",
                dup.executor
            )));
        }
        candidates.sort_by_key(|c| c.priority);
        Ok(Self { pattern, candidates })
    }

    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }
}

impl TryFrom<&RouteConfig> for ModelRoute {
    type Error = GatewayError;

    fn try_from(rc: &RouteConfig) -> Result<Self> {
        let candidates = rc
            .candidates
            .iter()
            .map(|c| Candidate::new(&c.executor, c.priority).requiring(c.requires.iter().copied()))
            .collect();
        Self::new(&rc.pattern, candidates)
    }
}

/// Why a candidate was dropped before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownExecutor,
    MissingCapabilities(Vec<Capability>),
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed {
        class: ErrorClass,
        /// `false` when this failure ended the dispatch.
        failover: bool,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub executor: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Ordered record of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchTrace {
    pub model: String,
    /// Pattern of the resolved route, if any matched.
    pub route: Option<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub attempts: Vec<Attempt>,
}

impl DispatchTrace {
    /// Attempted executor ids, in order.
    #[must_use]
    pub fn attempted(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.executor.as_str()).collect()
    }

    /// Executor that produced the result, if any succeeded.
    #[must_use]
    pub fn winner(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.outcome == Outcome::Success)
            .map(|a| a.executor.as_str())
    }
}

/// A dispatch result with its trace. The trace is produced even on failure.
#[derive(Debug)]
pub struct Dispatch<T> {
    pub result: Result<T>,
    pub trace: DispatchTrace,
}

impl<T> Dispatch<T> {
    /// Discards the trace.
    ///
    /// # Errors
    ///
    /// Returns the dispatch error.
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

enum Output {
    Complete(Response),
    Stream(ChunkStream),
}

pub struct ModelRouter {
    registry: ExecutorRegistry,
    routes: Vec<ModelRoute>,
}

impl ModelRouter {
    #[must_use]
    pub fn new(registry: ExecutorRegistry, routes: Vec<ModelRoute>) -> Self {
        Self { registry, routes }
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] for a malformed route pattern.
    pub fn from_config(config: &Config, registry: ExecutorRegistry) -> Result<Self> {
        let routes = config
            .routes
            .iter()
            .map(ModelRoute::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(registry, routes))
    }

    #[must_use]
    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    #[must_use]
    pub fn routes(&self) -> &[ModelRoute] {
        &self.routes
    }

    /// Most specific route matching `model`. The first declared wins a tie.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnsupportedModel`] if no pattern matches.
    pub fn resolve(&self, model: &str) -> Result<&ModelRoute> {
        let mut best: Option<&ModelRoute> = None;
        for route in self.routes.iter().filter(|r| r.pattern.matches(model)) {
            if best.is_none_or(|b| route.pattern.specificity() > b.pattern.specificity()) {
                best = Some(route);
            }
        }
        best.ok_or_else(|| GatewayError::UnsupportedModel(model.to_string()))
    }

    /// Performs a blocking request with failover.
    pub async fn dispatch(&self, ctx: &CancellationToken, request: &Request) -> Dispatch<Response> {
        let Dispatch { result, trace } = self.run(ctx, request, false).await;
        let result = result.and_then(|out| match out {
            Output::Complete(resp) => Ok(resp),
            Output::Stream(_) => Err(GatewayError::Protocol("unexpected stream output".into())),
        });
        Dispatch { result, trace }
    }

    /// Starts a streaming request with failover up to stream acceptance.
    pub async fn dispatch_stream(&self, ctx: &CancellationToken, request: &Request) -> Dispatch<ChunkStream> {
        let Dispatch { result, trace } = self.run(ctx, request, true).await;
        let result = result.and_then(|out| match out {
            Output::Stream(stream) => Ok(stream),
            Output::Complete(_) => Err(GatewayError::Protocol("unexpected complete output".into())),
        });
        Dispatch { result, trace }
    }

    fn eligible<'a>(
        &'a self,
        route: &'a ModelRoute,
        implied: &[Capability],
        trace: &mut DispatchTrace,
    ) -> Vec<&'a ExecutorEntry> {
        let mut eligible = Vec::with_capacity(route.candidates.len());
        for candidate in &route.candidates {
            let Some(entry) = self.registry.get(&candidate.executor) else {
                tracing::warn!(executor = %candidate.executor, "route names an unknown executor");
                trace
                    .skipped
                    .push((candidate.executor.clone(), SkipReason::UnknownExecutor));
                continue;
            };
            let missing: Vec<Capability> = implied
                .iter()
                .chain(&candidate.requires)
                .copied()
                .filter(|c| !entry.executor.capabilities().contains(c))
                .collect();
            if missing.is_empty() {
                eligible.push(entry);
            } else {
                tracing::debug!(executor = %candidate.executor, ?missing, "candidate lacks capabilities");
                trace
                    .skipped
                    .push((candidate.executor.clone(), SkipReason::MissingCapabilities(missing)));
            }
        }
        eligible
    }

    async fn run(&self, ctx: &CancellationToken, request: &Request, streaming: bool) -> Dispatch<Output> {
        let mut trace = DispatchTrace {
            model: request.model.clone(),
            ..DispatchTrace::default()
        };
        let route = match self.resolve(&request.model) {
            Ok(route) => route,
            Err(e) => return Dispatch { result: Err(e), trace },
        };
        trace.route = Some(route.pattern.to_string());

        let mut implied = request.required_capabilities();
        if streaming && !implied.contains(&Capability::Streaming) {
            implied.push(Capability::Streaming);
        }
        let candidates = self.eligible(route, &implied, &mut trace);
        if candidates.is_empty() {
            let err = GatewayError::UnsupportedModel(format!(
                "{}: no eligible executor for route {}",
                request.model, route.pattern
            ));
            return Dispatch { result: Err(err), trace };
        }

        let mut failures = Vec::new();
        for entry in candidates {
            if trace.attempts.iter().any(|a| a.executor == entry.id()) {
                continue;
            }
            if ctx.is_cancelled() {
                return Dispatch {
                    result: Err(GatewayError::Cancelled),
                    trace,
                };
            }
            let started = Instant::now();
            let result = if streaming {
                entry
                    .executor
                    .execute_stream(ctx, &entry.credential, request)
                    .await
                    .map(Output::Stream)
            } else {
                entry
                    .executor
                    .execute(ctx, &entry.credential, request)
                    .await
                    .map(Output::Complete)
            };
            let elapsed = started.elapsed();
            match result {
                Ok(output) => {
                    tracing::info!(executor = %entry.id(), model = %request.model, ?elapsed, "dispatch succeeded");
                    trace.attempts.push(Attempt {
                        executor: entry.id().to_string(),
                        outcome: Outcome::Success,
                        elapsed,
                    });
                    return Dispatch {
                        result: Ok(output),
                        trace,
                    };
                }
                Err(error) => {
                    let failover = error.is_failover_eligible();
                    trace.attempts.push(Attempt {
                        executor: entry.id().to_string(),
                        outcome: Outcome::Failed {
                            class: error.class(),
                            failover,
                            message: error.to_string(),
                        },
                        elapsed,
                    });
                    if !failover {
                        tracing::debug!(executor = %entry.id(), error = %error, "permanent failure, not failing over");
                        return Dispatch {
                            result: Err(error),
                            trace,
                        };
                    }
                    tracing::warn!(executor = %entry.id(), model = %request.model, error = %error, "candidate failed, failing over");
                    failures.push(AttemptError {
                        executor: entry.id().to_string(),
                        error,
                    });
                }
            }
        }

        Dispatch {
            result: Err(GatewayError::Exhausted {
                model: request.model.clone(),
                attempts: failures,
            }),
            trace,
        }
    }
}

impl fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRouter")
            .field("executors", &self.registry.ids())
            .field("routes", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keygate_types::{CredentialRef, Executor, ProtocolFormat, ProviderId, channel};
    use serde_json::json;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// Executor that replies with a canned outcome and counts calls.
    struct Scripted {
        id: String,
        caps: Vec<Capability>,
        status: Option<u16>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(id: &str) -> Arc<Self> {
            Self::with(id, None)
        }

        fn failing(id: &str, status: u16) -> Arc<Self> {
            Self::with(id, Some(status))
        }

        fn with(id: &str, status: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                caps: vec![Capability::OpenaiInput, Capability::Streaming],
                status,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn outcome(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.status {
                None => Ok(()),
                Some(s) => Err(GatewayError::upstream(s, "scripted")),
            }
        }
    }

    #[async_trait]
    impl Executor for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }

        async fn execute(&self, _: &CancellationToken, _: &CredentialRef, _: &Request) -> Result<Response> {
            self.outcome()?;
            Ok(Response {
                payload: json!({"from": self.id}),
                format: ProtocolFormat::OpenAI,
            })
        }

        async fn execute_stream(
            &self,
            _: &CancellationToken,
            _: &CredentialRef,
            _: &Request,
        ) -> Result<ChunkStream> {
            self.outcome()?;
            let (tx, rx) = channel(1);
            drop(tx);
            Ok(rx)
        }
    }

    fn router(executors: &[Arc<Scripted>], routes: Vec<ModelRoute>) -> ModelRouter {
        let mut registry = ExecutorRegistry::new();
        for ex in executors {
            registry
                .register(ex.clone(), CredentialRef::new(ProviderId::claude(), "default"))
                .unwrap();
        }
        ModelRouter::new(registry, routes)
    }

    fn request(model: &str) -> Request {
        Request::openai(json!({"model": model, "messages": []})).unwrap()
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!(Pattern::parse("gpt-4o").unwrap(), Pattern::Exact("gpt-4o".into()));
        assert_eq!(Pattern::parse("claude-*").unwrap(), Pattern::Prefix("claude-".into()));
        assert_eq!(Pattern::parse("*").unwrap(), Pattern::Prefix(String::new()));
        for bad in ["", "a*b", "**", "*x"] {
            assert!(Pattern::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_resolve_most_specific() {
        let r = router(
            &[],
            vec![
                ModelRoute::new("*", vec![Candidate::new("any", 0)]).unwrap(),
                ModelRoute::new("claude-*", vec![Candidate::new("short", 0)]).unwrap(),
                ModelRoute::new("claude-opus-*", vec![Candidate::new("long", 0)]).unwrap(),
                ModelRoute::new("claude-opus-4-5", vec![Candidate::new("exact", 0)]).unwrap(),
            ],
        );
        let first = |m: &str| r.resolve(m).unwrap().candidates()[0].executor.clone();
        assert_eq!(first("claude-opus-4-5"), "exact");
        assert_eq!(first("claude-opus-4-6"), "long");
        assert_eq!(first("claude-haiku"), "short");
        assert_eq!(first("gpt-4o"), "any");
    }

    #[test]
    fn test_resolve_unknown_model() {
        let r = router(&[], vec![ModelRoute::new("claude-*", vec![Candidate::new("a", 0)]).unwrap()]);
        assert!(matches!(r.resolve("gpt-4o"), Err(GatewayError::UnsupportedModel(_))));
    }

    #[test]
    fn test_candidates_sorted_stably() {
        let route = ModelRoute::new(
            "m",
            vec![Candidate::new("c", 2), Candidate::new("a", 1), Candidate::new("b", 1)],
        )
        .unwrap();
        let order: Vec<&str> = route.candidates().iter().map(|c| c.executor.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn test_route_rejects_repeated_executor() {
        let err = ModelRoute::new("m", vec![Candidate::new("a", 0), Candidate::new("a", 1)]).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn test_failover_never_repeats_an_executor() {
        let a = Scripted::failing("a", 503);
        let b = Scripted::ok("b");
        // Built directly so the repeated candidate reaches dispatch.
        let route = ModelRoute {
            pattern: Pattern::parse("m").unwrap(),
            candidates: vec![Candidate::new("a", 0), Candidate::new("a", 1), Candidate::new("b", 2)],
        };
        let r = router(&[a.clone(), b.clone()], vec![route]);
        let Dispatch { result, trace } = r.dispatch(&CancellationToken::new(), &request("m")).await;
        assert_eq!(result.unwrap().payload["from"], "b");
        assert_eq!(trace.attempted(), ["a", "b"]);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_failover_on_503() {
        let a = Scripted::failing("a", 503);
        let b = Scripted::ok("b");
        let r = router(
            &[a.clone(), b.clone()],
            vec![ModelRoute::new("m", vec![Candidate::new("a", 0), Candidate::new("b", 1)]).unwrap()],
        );
        let Dispatch { result, trace } = r.dispatch(&CancellationToken::new(), &request("m")).await;
        assert_eq!(result.unwrap().payload["from"], "b");
        assert_eq!(trace.attempted(), ["a", "b"]);
        assert_eq!(trace.winner(), Some("b"));
        assert!(matches!(
            trace.attempts[0].outcome,
            Outcome::Failed { class: ErrorClass::Upstream, failover: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_400_short_circuits() {
        let a = Scripted::failing("a", 400);
        let b = Scripted::ok("b");
        let r = router(
            &[a.clone(), b.clone()],
            vec![ModelRoute::new("m", vec![Candidate::new("a", 0), Candidate::new("b", 1)]).unwrap()],
        );
        let Dispatch { result, trace } = r.dispatch(&CancellationToken::new(), &request("m")).await;
        assert!(matches!(result, Err(GatewayError::Upstream { status: 400, .. })));
        assert_eq!(trace.attempted(), ["a"]);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_429_and_408_fail_over() {
        for status in [408, 429, 401] {
            let a = Scripted::failing("a", status);
            let b = Scripted::ok("b");
            let r = router(
                &[a, b.clone()],
                vec![ModelRoute::new("m", vec![Candidate::new("a", 0), Candidate::new("b", 0)]).unwrap()],
            );
            let d = r.dispatch(&CancellationToken::new(), &request("m")).await;
            assert!(d.result.is_ok(), "{status}");
            assert_eq!(b.calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_exhausted_aggregates_all() {
        let r = router(
            &[Scripted::failing("a", 500), Scripted::failing("b", 502)],
            vec![ModelRoute::new("m", vec![Candidate::new("a", 0), Candidate::new("b", 1)]).unwrap()],
        );
        let Dispatch { result, trace } = r.dispatch(&CancellationToken::new(), &request("m")).await;
        let Err(GatewayError::Exhausted { model, attempts }) = result else {
            panic!("expected exhausted");
        };
        assert_eq!(model, "m");
        let ids: Vec<&str> = attempts.iter().map(|a| a.executor.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(trace.winner().is_none());
    }

    #[tokio::test]
    async fn test_priority_order_not_declaration_order() {
        let a = Scripted::ok("a");
        let b = Scripted::ok("b");
        let r = router(
            &[a.clone(), b.clone()],
            vec![ModelRoute::new("m", vec![Candidate::new("a", 5), Candidate::new("b", 1)]).unwrap()],
        );
        let d = r.dispatch(&CancellationToken::new(), &request("m")).await;
        assert_eq!(d.trace.attempted(), ["b"]);
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_filter_skips_unknown_and_incapable() {
        let a = Scripted::ok("a");
        let r = router(
            &[a.clone()],
            vec![
                ModelRoute::new(
                    "m",
                    vec![
                        Candidate::new("ghost", 0),
                        Candidate::new("a", 1).requiring([Capability::Tools]),
                    ],
                )
                .unwrap(),
            ],
        );
        let Dispatch { result, trace } = r.dispatch(&CancellationToken::new(), &request("m")).await;
        assert!(matches!(result, Err(GatewayError::UnsupportedModel(_))));
        assert!(trace.attempts.is_empty());
        assert_eq!(trace.skipped[0], ("ghost".into(), SkipReason::UnknownExecutor));
        assert_eq!(
            trace.skipped[1],
            ("a".into(), SkipReason::MissingCapabilities(vec![Capability::Tools]))
        );
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_implied_capabilities() {
        let a = Scripted::ok("a");
        let r = router(&[a.clone()], vec![ModelRoute::new("m", vec![Candidate::new("a", 0)]).unwrap()]);
        let req = Request::anthropic(json!({"model": "m", "messages": []})).unwrap();
        let d = r.dispatch(&CancellationToken::new(), &req).await;
        assert!(d.result.is_err());
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_failover() {
        let r = router(
            &[Scripted::failing("a", 529), Scripted::ok("b")],
            vec![ModelRoute::new("m", vec![Candidate::new("a", 0), Candidate::new("b", 1)]).unwrap()],
        );
        let d = r.dispatch_stream(&CancellationToken::new(), &request("m")).await;
        assert!(d.result.is_ok());
        assert_eq!(d.trace.attempted(), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let a = Scripted::ok("a");
        let r = router(&[a.clone()], vec![ModelRoute::new("m", vec![Candidate::new("a", 0)]).unwrap()]);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let d = r.dispatch(&ctx, &request("m")).await;
        assert!(matches!(d.result, Err(GatewayError::Cancelled)));
        assert_eq!(a.calls(), 0);
    }

    #[test]
    fn test_from_default_config() {
        let registry = ExecutorRegistry::new();
        let r = ModelRouter::from_config(&Config::default(), registry).unwrap();
        assert_eq!(r.resolve("claude-opus-4-5").unwrap().pattern().to_string(), "claude-*");
    }
}
