//! Backend endpoint discovery.
//!
//! The desktop shell spawns the backend service, so its listening port is not
//! known at process start. `EndpointResolver` is the single source of truth
//! for "where is the backend reachable": it coalesces discovery attempts,
//! accepts passive readiness notifications, and exposes a blocking
//! `wait_for_resolution` with a hard ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Interval between address re-checks while waiting for discovery.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hard ceiling on `wait_for_resolution`.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the idle bootstrap refetch fires.
pub const BOOTSTRAP_DELAY: Duration = Duration::from_millis(100);

/// Outcome of a host-runtime port query.
#[derive(Debug, Clone)]
pub struct PortQuery {
    pub success: bool,
    pub port: Option<u16>,
}

/// Readiness notifications could not be subscribed to.
#[derive(Debug, Error)]
#[error("ready notifications unavailable: {0}")]
pub struct SubscribeError(pub String);

/// Errors surfaced by `wait_for_resolution`.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Discovery never produced an address within the ceiling.
    #[error("backend address still unknown after {0} seconds")]
    Timeout(u64),
}

/// Contract with the process that owns the backend service.
///
/// `query_port` is an active ask ("what port is the backend listening on");
/// `subscribe_ready` yields the port pushed once the backend signals
/// readiness on its own, which may never fire.
#[async_trait]
pub trait BackendRuntime: Send + Sync + 'static {
    async fn query_port(&self) -> PortQuery;

    fn subscribe_ready(&self) -> Result<broadcast::Receiver<u16>, SubscribeError>;
}

type DiscoveryFuture = Shared<BoxFuture<'static, ()>>;

struct ResolverState {
    address: Option<String>,
    inflight: Option<DiscoveryFuture>,
    /// Bumped on `reset` so completions of older attempts are discarded.
    epoch: u64,
}

/// Process-wide resolver for the backend base address.
///
/// Created once and shared; callers only read the address and trigger
/// discovery. Three producers write to the shared state (explicit `refetch`,
/// the readiness listener, the idle bootstrap) and all serialize through the
/// one-discovery-in-flight invariant.
pub struct EndpointResolver {
    runtime: Arc<dyn BackendRuntime>,
    state: Arc<Mutex<ResolverState>>,
    listener_registered: AtomicBool,
}

impl EndpointResolver {
    pub fn new(runtime: Arc<dyn BackendRuntime>) -> Arc<Self> {
        let resolver = Arc::new(Self {
            runtime,
            state: Arc::new(Mutex::new(ResolverState {
                address: None,
                inflight: None,
                epoch: 0,
            })),
            listener_registered: AtomicBool::new(false),
        });
        resolver.register_ready_listener();
        resolver
    }

    /// Last known base address, if discovery has succeeded.
    pub fn address(&self) -> Option<String> {
        lock(&self.state).address.clone()
    }

    /// Trigger one discovery attempt.
    ///
    /// If an attempt is already in flight the same future is returned, so any
    /// number of concurrent callers observe a single port query. The
    /// in-flight marker is cleared by the attempt itself on every completion
    /// path, allowing a later call to retry after failure.
    pub fn refetch(&self) -> DiscoveryFuture {
        let mut state = lock(&self.state);
        if let Some(inflight) = &state.inflight {
            return inflight.clone();
        }

        let (tx, rx) = oneshot::channel::<()>();
        let runtime = Arc::clone(&self.runtime);
        let task_state = Arc::clone(&self.state);
        let epoch = state.epoch;
        tokio::spawn(async move {
            let query = runtime.query_port().await;
            {
                let mut state = lock(&task_state);
                // An attempt abandoned by reset must not touch shared state;
                // the marker it would clear may belong to a newer attempt.
                if state.epoch == epoch {
                    match query {
                        PortQuery {
                            success: true,
                            port: Some(port),
                        } => {
                            debug!(port, "discovered backend address");
                            state.address = Some(base_url(port));
                        }
                        _ => debug!("port query returned no address"),
                    }
                    state.inflight = None;
                }
            }
            let _ = tx.send(());
        });

        // The attempt completes the oneshot whether it succeeds, fails, or
        // panics (sender drop), so waiters are never stranded.
        let shared = rx.map(|_| ()).boxed().shared();
        state.inflight = Some(shared.clone());
        shared
    }

    /// Wait until the backend address is known, up to the hard ceiling.
    ///
    /// Fast path when the address is already set; otherwise one refetch, then
    /// a poll loop that also observes addresses published by the passive
    /// notification path, then exactly one last-resort refetch at the
    /// ceiling.
    pub async fn wait_for_resolution(&self) -> Result<String, ResolveError> {
        if let Some(address) = self.address() {
            return Ok(address);
        }

        // The clock covers the initial refetch too, so a slow discovery
        // round-trip counts toward the ceiling instead of extending it.
        let started = tokio::time::Instant::now();
        self.refetch().await;
        if let Some(address) = self.address() {
            return Ok(address);
        }

        while started.elapsed() < RESOLVE_TIMEOUT {
            tokio::time::sleep(POLL_INTERVAL).await;
            if let Some(address) = self.address() {
                return Ok(address);
            }
        }

        // One more attempt at the ceiling before giving up.
        self.refetch().await;
        if let Some(address) = self.address() {
            return Ok(address);
        }
        Err(ResolveError::Timeout(RESOLVE_TIMEOUT.as_secs()))
    }

    /// Schedule the idle bootstrap refetch for a newly created consumer.
    ///
    /// Guards against the readiness notification never arriving and against
    /// discovery never having been triggered. Skipped if the address is
    /// already known when the delay elapses.
    pub fn spawn_idle_bootstrap(self: &Arc<Self>) {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(BOOTSTRAP_DELAY).await;
            if resolver.address().is_none() {
                resolver.refetch().await;
            }
        });
    }

    /// Publish an address as if a refetch had succeeded.
    ///
    /// Used by the passive notification path; a fresher notification may
    /// overwrite an earlier address.
    pub fn publish_port(&self, port: u16) {
        debug!(port, "backend signaled ready");
        lock(&self.state).address = Some(base_url(port));
    }

    /// Clear all discovery state. Test isolation only.
    ///
    /// Discovery attempts still running keep going but their completions no
    /// longer apply (epoch mismatch), so a reset resolver cannot be
    /// resurrected by an abandoned attempt.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.address = None;
        state.inflight = None;
        state.epoch += 1;
    }

    /// Subscribe to readiness notifications, at most once per process
    /// lifetime. If subscription setup fails the flag is cleared so a later
    /// registration may retry; the caller is never crashed.
    fn register_ready_listener(self: &Arc<Self>) {
        if self.listener_registered.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.runtime.subscribe_ready() {
            Ok(mut rx) => {
                let resolver = Arc::clone(self);
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(port) => resolver.publish_port(port),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "could not subscribe to backend readiness notifications");
                self.listener_registered.store(false, Ordering::SeqCst);
            }
        }
    }
}

fn lock(state: &Mutex<ResolverState>) -> MutexGuard<'_, ResolverState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn base_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Notify;

    use super::*;

    /// Scriptable `BackendRuntime` double.
    ///
    /// Queries pop scripted responses (the last one repeats); an optional
    /// gate holds each query open until released so tests can observe
    /// in-flight coalescing.
    struct MockRuntime {
        responses: Mutex<VecDeque<PortQuery>>,
        queries: AtomicUsize,
        gate: Option<Arc<Notify>>,
        delay: Option<Duration>,
        ready_tx: broadcast::Sender<u16>,
        fail_subscribe: bool,
    }

    impl MockRuntime {
        fn new(responses: Vec<PortQuery>) -> Arc<Self> {
            let (ready_tx, _) = broadcast::channel(4);
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                queries: AtomicUsize::new(0),
                gate: None,
                delay: None,
                ready_tx,
                fail_subscribe: false,
            })
        }

        fn gated(responses: Vec<PortQuery>, gate: Arc<Notify>) -> Arc<Self> {
            let (ready_tx, _) = broadcast::channel(4);
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                queries: AtomicUsize::new(0),
                gate: Some(gate),
                delay: None,
                ready_tx,
                fail_subscribe: false,
            })
        }

        /// Every query takes `delay` to answer.
        fn delayed(responses: Vec<PortQuery>, delay: Duration) -> Arc<Self> {
            let (ready_tx, _) = broadcast::channel(4);
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                queries: AtomicUsize::new(0),
                gate: None,
                delay: Some(delay),
                ready_tx,
                fail_subscribe: false,
            })
        }

        fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendRuntime for MockRuntime {
        async fn query_port(&self) -> PortQuery {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap_or(PortQuery {
                    success: false,
                    port: None,
                })
            }
        }

        fn subscribe_ready(&self) -> Result<broadcast::Receiver<u16>, SubscribeError> {
            if self.fail_subscribe {
                return Err(SubscribeError("event bridge offline".into()));
            }
            Ok(self.ready_tx.subscribe())
        }
    }

    fn success(port: u16) -> PortQuery {
        PortQuery {
            success: true,
            port: Some(port),
        }
    }

    fn failure() -> PortQuery {
        PortQuery {
            success: false,
            port: None,
        }
    }

    #[tokio::test]
    async fn query_success_resolves_base_url() {
        let runtime = MockRuntime::new(vec![success(5000)]);
        let resolver = EndpointResolver::new(runtime);

        let address = resolver.wait_for_resolution().await.unwrap();
        assert_eq!(address, "http://localhost:5000");
    }

    #[tokio::test]
    async fn concurrent_refetches_share_one_query() {
        let gate = Arc::new(Notify::new());
        let runtime = MockRuntime::gated(vec![success(5000)], Arc::clone(&gate));
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        let first = resolver.refetch();
        let second = resolver.refetch();
        let third = resolver.refetch();

        // All callers are waiting on the single in-flight attempt.
        tokio::task::yield_now().await;
        assert_eq!(runtime.query_count(), 1);

        gate.notify_waiters();
        futures::future::join3(first, second, third).await;

        assert_eq!(runtime.query_count(), 1);
        assert_eq!(resolver.address().as_deref(), Some("http://localhost:5000"));
    }

    #[tokio::test]
    async fn resolved_address_is_a_fast_path() {
        let runtime = MockRuntime::new(vec![success(5000)]);
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        resolver.wait_for_resolution().await.unwrap();
        let queries_after_first = runtime.query_count();

        for _ in 0..5 {
            resolver.wait_for_resolution().await.unwrap();
        }
        assert_eq!(runtime.query_count(), queries_after_first);
    }

    #[tokio::test]
    async fn failed_refetch_leaves_address_unset_and_allows_retry() {
        let runtime = MockRuntime::new(vec![failure(), success(5003)]);
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        resolver.refetch().await;
        assert!(resolver.address().is_none());

        resolver.refetch().await;
        assert_eq!(resolver.address().as_deref(), Some("http://localhost:5003"));
        assert_eq!(runtime.query_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_after_ten_seconds() {
        let runtime = MockRuntime::new(vec![failure()]);
        let resolver = EndpointResolver::new(runtime);

        let started = tokio::time::Instant::now();
        let err = resolver.wait_for_resolution().await.unwrap_err();

        assert!(started.elapsed() >= RESOLVE_TIMEOUT);
        assert!(err.to_string().contains("10 seconds"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_queries_count_toward_the_ceiling() {
        let round_trip = Duration::from_secs(1);
        let runtime = MockRuntime::delayed(vec![failure()], round_trip);
        let resolver = EndpointResolver::new(runtime);

        let started = tokio::time::Instant::now();
        resolver.wait_for_resolution().await.unwrap_err();

        // The ceiling plus at most one last-resort round-trip, never the
        // ceiling plus two.
        let elapsed = started.elapsed();
        assert!(elapsed >= RESOLVE_TIMEOUT);
        assert!(elapsed <= RESOLVE_TIMEOUT + round_trip);
    }

    #[tokio::test(start_paused = true)]
    async fn passive_notification_resolves_mid_poll() {
        let runtime = MockRuntime::new(vec![failure()]);
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        let notifier = Arc::clone(&runtime);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = notifier.ready_tx.send(5001);
        });

        let started = tokio::time::Instant::now();
        let address = resolver.wait_for_resolution().await.unwrap();

        assert_eq!(address, "http://localhost:5001");
        assert!(started.elapsed() < RESOLVE_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bootstrap_discovers_when_nothing_else_does() {
        let runtime = MockRuntime::new(vec![success(5002)]);
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        resolver.spawn_idle_bootstrap();
        tokio::time::sleep(BOOTSTRAP_DELAY * 2).await;

        assert_eq!(resolver.address().as_deref(), Some("http://localhost:5002"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bootstrap_skips_when_address_known() {
        let runtime = MockRuntime::new(vec![success(5002)]);
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        resolver.publish_port(5005);
        resolver.spawn_idle_bootstrap();
        tokio::time::sleep(BOOTSTRAP_DELAY * 2).await;

        assert_eq!(runtime.query_count(), 0);
        assert_eq!(resolver.address().as_deref(), Some("http://localhost:5005"));
    }

    #[tokio::test]
    async fn abandoned_attempt_cannot_resurrect_after_reset() {
        let gate = Arc::new(Notify::new());
        let runtime = MockRuntime::gated(vec![success(5000)], Arc::clone(&gate));
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        let attempt = resolver.refetch();
        resolver.reset();

        // Let the discovery task park on the gate before releasing it.
        tokio::task::yield_now().await;
        gate.notify_waiters();
        attempt.await;

        assert!(resolver.address().is_none());
    }

    #[tokio::test]
    async fn abandoned_attempt_leaves_newer_inflight_marker_alone() {
        let gate = Arc::new(Notify::new());
        let runtime = MockRuntime::gated(vec![success(5000), success(5001)], Arc::clone(&gate));
        let resolver = EndpointResolver::new(Arc::clone(&runtime) as Arc<dyn BackendRuntime>);

        let abandoned = resolver.refetch();
        tokio::task::yield_now().await;
        resolver.reset();

        let fresh = resolver.refetch();
        tokio::task::yield_now().await;

        // Waiters wake in park order: this releases only the abandoned
        // attempt. Its completion must not clear the fresh attempt's
        // in-flight marker.
        gate.notify_one();
        abandoned.await;

        let third = resolver.refetch();
        tokio::task::yield_now().await;
        assert_eq!(runtime.query_count(), 2);

        gate.notify_one();
        futures::future::join(fresh, third).await;
        assert_eq!(resolver.address().as_deref(), Some("http://localhost:5001"));
    }

    #[tokio::test]
    async fn failed_subscription_clears_registered_flag() {
        let (ready_tx, _) = broadcast::channel(4);
        let runtime = Arc::new(MockRuntime {
            responses: Mutex::new(VecDeque::from(vec![failure()])),
            queries: AtomicUsize::new(0),
            gate: None,
            delay: None,
            ready_tx,
            fail_subscribe: true,
        });
        let resolver = EndpointResolver::new(runtime as Arc<dyn BackendRuntime>);

        assert!(!resolver.listener_registered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fresher_notification_overwrites_address() {
        let runtime = MockRuntime::new(vec![failure()]);
        let resolver = EndpointResolver::new(runtime);

        resolver.publish_port(5000);
        resolver.publish_port(5001);

        assert_eq!(resolver.address().as_deref(), Some("http://localhost:5001"));
    }
}
