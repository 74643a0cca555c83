use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::database::metrics::{MetricsAggregator, PoolDelta};
use crate::database::session::{Session, SessionBackend, PROBE_TIMEOUT};
use crate::error::retry::{with_retry, RetryConfig};
use crate::error::AppError;

/// Consecutive probe failures before the pool reports itself degraded.
const MAX_PROBE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Initializing,
    Ready,
    Degraded,
    Closing,
    Closed,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Initializing => "initializing",
            PoolState::Ready => "ready",
            PoolState::Degraded => "degraded",
            PoolState::Closing => "closing",
            PoolState::Closed => "closed",
        }
    }
}

/// O(1) snapshot of the pool's counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub total: u32,
    pub idle: u32,
    pub waiting: u32,
    pub current_max: u32,
    pub last_resize_at: Option<Instant>,
    pub state: PoolState,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Box<dyn Session>>,
}

struct PoolInner {
    idle: VecDeque<Box<dyn Session>>,
    total: u32,
    current_max: u32,
    waiters: VecDeque<Waiter>,
    state: PoolState,
    last_resize_at: Option<Instant>,
    next_waiter_id: u64,
}

struct PoolShared {
    backend: Arc<dyn SessionBackend>,
    config: Arc<ConfigHandle>,
    metrics: Arc<MetricsAggregator>,
    inner: Mutex<PoolInner>,
    drained: Notify,
    probe_failures: AtomicU32,
    probe_ok: AtomicBool,
    last_healthy_at: Mutex<Option<Instant>>,
}

impl PoolShared {
    /// Hand a session back to the pool. Runs on every exit path of a lease,
    /// including panics, because the guard's `Drop` calls it.
    fn release(self: &Arc<Self>, mut session: Box<dyn Session>) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        match inner.state {
            PoolState::Closing | PoolState::Closed => {
                inner.total = inner.total.saturating_sub(1);
                self.metrics.record_pool_delta(PoolDelta::SessionClosed);
                if inner.total == 0 {
                    self.drained.notify_waiters();
                }
            }
            _ => {
                if inner.total > inner.current_max {
                    // The pool shrank while this session was out; close it
                    // instead of returning it.
                    inner.total -= 1;
                    self.metrics.record_pool_delta(PoolDelta::SessionClosed);
                    return;
                }
                loop {
                    match inner.waiters.pop_front() {
                        Some(waiter) => match waiter.tx.send(session) {
                            Ok(()) => return,
                            // Receiver timed out or was cancelled; try the next
                            // waiter in FIFO order.
                            Err(returned) => session = returned,
                        },
                        None => {
                            inner.idle.push_back(session);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// A leased session. Dereferences to [`Session`]; returning it to the pool is
/// automatic and happens exactly once.
pub struct PooledSession {
    session: Option<Box<dyn Session>>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").finish_non_exhaustive()
    }
}

impl Deref for PooledSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_deref().expect("session already released")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_deref_mut().expect("session already released")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.shared.release(session);
        }
    }
}

/// Owns the session pool: acquisition with deadlines and FIFO waiting, runtime
/// resizes, health probing and graceful shutdown. The controller is the only
/// component that opens or closes sessions.
pub struct PoolController {
    shared: Arc<PoolShared>,
}

impl PoolController {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        config: Arc<ConfigHandle>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        let current_max = config.load().autoscale.max_sessions;
        Self {
            shared: Arc::new(PoolShared {
                backend,
                config,
                metrics,
                inner: Mutex::new(PoolInner {
                    idle: VecDeque::new(),
                    total: 0,
                    current_max,
                    waiters: VecDeque::new(),
                    state: PoolState::Initializing,
                    last_resize_at: None,
                    next_waiter_id: 0,
                }),
                drained: Notify::new(),
                probe_failures: AtomicU32::new(0),
                probe_ok: AtomicBool::new(true),
                last_healthy_at: Mutex::new(None),
            }),
        }
    }

    /// Warm the pool up to `min_sessions` and move it to `ready`. Connection
    /// failures during warm-up are logged, not fatal; sessions open lazily on
    /// demand afterwards.
    pub async fn initialize(&self) {
        let config = self.shared.config.load();
        let target = config.autoscale.min_sessions;
        let mut opened = 0;

        for _ in 0..target {
            {
                let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
                if inner.total >= inner.current_max {
                    break;
                }
                inner.total += 1;
            }
            match self.shared.backend.connect(&config).await {
                Ok(session) => {
                    self.shared.metrics.record_pool_delta(PoolDelta::SessionOpened);
                    let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
                    inner.idle.push_back(session);
                    opened += 1;
                }
                Err(e) => {
                    let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
                    inner.total -= 1;
                    drop(inner);
                    self.shared.metrics.record_error(e.kind());
                    warn!(error = %e, "Session warm-up connect failed");
                }
            }
        }

        let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
        inner.state = PoolState::Ready;
        drop(inner);
        info!(opened, target, "Session pool warm-up completed");
    }

    /// Acquire a session, waiting until `deadline` at the latest.
    ///
    /// Fast path: an idle session is available. Otherwise a new session is
    /// opened while `total < current_max`, or the caller joins a FIFO wait
    /// queue. A timed-out waiter frees its queue slot before returning.
    pub async fn acquire(&self, deadline: Instant) -> Result<PooledSession, AppError> {
        let (waiter_id, mut rx) = {
            let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
            match inner.state {
                PoolState::Closing | PoolState::Closed => return Err(AppError::ShuttingDown),
                _ => {}
            }

            if let Some(session) = inner.idle.pop_front() {
                drop(inner);
                return Ok(self.lease(session));
            }

            if inner.total < inner.current_max {
                inner.total += 1;
                drop(inner);
                return self.open_session(deadline).await;
            }

            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        self.shared.metrics.record_pool_delta(PoolDelta::AcquireWaited);

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(session)) => Ok(self.lease(session)),
            Ok(Err(_)) => Err(AppError::ShuttingDown),
            Err(_) => {
                {
                    let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
                    inner.waiters.retain(|w| w.id != waiter_id);
                }
                // A release may have raced the timeout and already handed us a
                // session; put it back rather than leak it.
                match rx.try_recv() {
                    Ok(session) => Ok(self.lease(session)),
                    Err(_) => {
                        self.shared.metrics.record_pool_delta(PoolDelta::AcquireTimedOut);
                        Err(AppError::Timeout(format!(
                            "no session became available within the deadline (waiting at capacity {})",
                            self.status().current_max
                        )))
                    }
                }
            }
        }
    }

    /// Acquire with exponential backoff (`backoff_base * 2^k`, capped at 5s).
    /// Only transient `ConnectFailed` and `Timeout` are retried; `ShuttingDown`
    /// is terminal.
    pub async fn acquire_with_retry(
        &self,
        attempts: u32,
        backoff_base: Duration,
    ) -> Result<PooledSession, AppError> {
        let per_attempt = self.shared.config.load().connect_timeout;
        with_retry(
            "pool_acquire",
            RetryConfig::for_acquire(attempts, backoff_base),
            || async { self.acquire(Instant::now() + per_attempt).await },
        )
        .await
    }

    async fn open_session(&self, deadline: Instant) -> Result<PooledSession, AppError> {
        let config = self.shared.config.load();
        let connect_deadline = deadline.min(Instant::now() + config.connect_timeout);

        let connected = timeout_at(connect_deadline, self.shared.backend.connect(&config)).await;
        match connected {
            Ok(Ok(session)) => {
                self.shared.metrics.record_pool_delta(PoolDelta::SessionOpened);
                Ok(self.lease(session))
            }
            Ok(Err(e)) => {
                self.abandon_slot();
                self.shared.metrics.record_error(e.kind());
                Err(e)
            }
            Err(_) => {
                self.abandon_slot();
                self.shared.metrics.record_error("connect_timeout");
                Err(AppError::Timeout("session connect exceeded the deadline".into()))
            }
        }
    }

    fn abandon_slot(&self) {
        let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
        inner.total = inner.total.saturating_sub(1);
    }

    fn lease(&self, session: Box<dyn Session>) -> PooledSession {
        PooledSession {
            session: Some(session),
            shared: self.shared.clone(),
        }
    }

    /// Change the effective session cap. The target is clamped to the
    /// configured `[min_sessions, max_sessions]`; shrinking closes excess
    /// idle sessions immediately and in-use sessions lazily on release.
    /// Never blocks acquire callers.
    pub fn resize(&self, new_max: u32) -> Result<u32, AppError> {
        let config = self.shared.config.load();
        let clamped = config.autoscale.clamp_sessions(new_max);

        let spawn_fill = {
            let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
            match inner.state {
                PoolState::Closing | PoolState::Closed => return Err(AppError::ShuttingDown),
                _ => {}
            }

            let old = inner.current_max;
            inner.current_max = clamped;
            inner.last_resize_at = Some(Instant::now());

            while inner.total > inner.current_max {
                if let Some(session) = inner.idle.pop_front() {
                    drop(session);
                    inner.total -= 1;
                    self.shared.metrics.record_pool_delta(PoolDelta::SessionClosed);
                } else {
                    break;
                }
            }

            debug!(old_max = old, new_max = clamped, "Pool resized");
            !inner.waiters.is_empty() && inner.total < inner.current_max
        };

        if spawn_fill {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                Self::fill_waiters(shared).await;
            });
        }

        Ok(clamped)
    }

    /// After a grow, open sessions for queued waiters so they don't sit out
    /// the rest of their deadlines.
    async fn fill_waiters(shared: Arc<PoolShared>) {
        loop {
            let config = shared.config.load();
            {
                let mut inner = shared.inner.lock().expect("pool lock poisoned");
                let can_open = matches!(inner.state, PoolState::Ready | PoolState::Degraded)
                    && !inner.waiters.is_empty()
                    && inner.total < inner.current_max;
                if !can_open {
                    return;
                }
                inner.total += 1;
            }

            match shared.backend.connect(&config).await {
                Ok(session) => {
                    shared.metrics.record_pool_delta(PoolDelta::SessionOpened);
                    shared.release(session);
                }
                Err(e) => {
                    let mut inner = shared.inner.lock().expect("pool lock poisoned");
                    inner.total = inner.total.saturating_sub(1);
                    drop(inner);
                    shared.metrics.record_error(e.kind());
                    warn!(error = %e, "Waiter backfill connect failed");
                    return;
                }
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.shared.inner.lock().expect("pool lock poisoned");
        PoolStatus {
            total: inner.total,
            idle: inner.idle.len() as u32,
            waiting: inner.waiters.len() as u32,
            current_max: inner.current_max,
            last_resize_at: inner.last_resize_at,
            state: inner.state,
        }
    }

    /// Trivial round-trip with a 2s budget. Three consecutive failures move
    /// the pool to `degraded`; one success brings it back to `ready`.
    pub async fn health_probe(&self) -> bool {
        let deadline = Instant::now() + PROBE_TIMEOUT;
        let result = match self.acquire(deadline).await {
            Ok(mut lease) => match timeout_at(deadline, lease.ping()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AppError::Timeout("probe round-trip exceeded 2s".into())),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.shared.probe_failures.store(0, Ordering::Relaxed);
                self.shared.probe_ok.store(true, Ordering::Relaxed);
                *self.shared.last_healthy_at.lock().expect("pool lock poisoned") =
                    Some(Instant::now());

                let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
                if inner.state == PoolState::Degraded {
                    inner.state = PoolState::Ready;
                    info!("Pool recovered after successful probe");
                }
                true
            }
            Err(e) => {
                let failures = self.shared.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
                self.shared.metrics.record_error("probe_failed");
                warn!(failures, error = %e, "Health probe failed");

                if failures >= MAX_PROBE_FAILURES {
                    self.shared.probe_ok.store(false, Ordering::Relaxed);
                    let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
                    if inner.state == PoolState::Ready {
                        inner.state = PoolState::Degraded;
                        warn!(failures, "Pool marked degraded after consecutive probe failures");
                    }
                }
                false
            }
        }
    }

    /// Whether the probe is currently passing (fewer than three consecutive
    /// failures). This is the `probe_ok` input to the health evaluator.
    pub fn probe_ok(&self) -> bool {
        self.shared.probe_ok.load(Ordering::Relaxed)
    }

    pub fn last_healthy_age(&self) -> Option<Duration> {
        self.shared
            .last_healthy_at
            .lock()
            .expect("pool lock poisoned")
            .map(|at| at.elapsed())
    }

    /// Stop accepting acquires, wait up to `grace` for leased sessions to come
    /// back, then close everything. Returns the number of leaked sessions.
    pub async fn shutdown(&self, grace: Duration) -> u32 {
        let leased = {
            let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
            if matches!(inner.state, PoolState::Closing | PoolState::Closed) {
                return 0;
            }
            inner.state = PoolState::Closing;

            // Dropping the senders fails every queued waiter with ShuttingDown.
            inner.waiters.clear();

            let idle_count = inner.idle.len() as u32;
            inner.idle.clear();
            inner.total -= idle_count;
            for _ in 0..idle_count {
                self.shared.metrics.record_pool_delta(PoolDelta::SessionClosed);
            }
            inner.total
        };

        if leased > 0 {
            info!(leased, "Waiting for leased sessions to drain");
            let drain = async {
                loop {
                    let notified = self.shared.drained.notified();
                    if self.shared.inner.lock().expect("pool lock poisoned").total == 0 {
                        break;
                    }
                    notified.await;
                }
            };
            let _ = timeout(grace, drain).await;
        }

        let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
        inner.state = PoolState::Closed;
        let leaked = inner.total;
        drop(inner);

        if leaked > 0 {
            warn!(leaked, "Pool closed with sessions still leased");
        } else {
            info!("Pool closed cleanly");
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{AutoscalePolicy, DatabaseSettings, PoolRuntimeConfig};
    use crate::database::session::{FetchedRow, SqlQuery};

    struct MockSession;

    #[async_trait]
    impl Session for MockSession {
        async fn ping(&mut self) -> Result<(), AppError> {
            Ok(())
        }

        async fn fetch_properties(&mut self, _query: &SqlQuery) -> Result<Vec<FetchedRow>, AppError> {
            Ok(Vec::new())
        }
    }

    struct MockBackend {
        connects: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn failing_first(n: usize) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(n),
            }
        }
    }

    #[async_trait]
    impl SessionBackend for MockBackend {
        async fn connect(&self, _config: &PoolRuntimeConfig) -> Result<Box<dyn Session>, AppError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::ConnectFailed("mock refused".into()));
            }
            Ok(Box::new(MockSession))
        }
    }

    fn pool_with(backend: Arc<MockBackend>, min: u32, max: u32) -> PoolController {
        let mut db = DatabaseSettings::default();
        db.autoscale = AutoscalePolicy {
            min_sessions: min,
            max_sessions: max,
            ..Default::default()
        };
        let config = Arc::new(ConfigHandle::new(PoolRuntimeConfig::from_settings(&db)));
        PoolController::new(backend, config, Arc::new(MetricsAggregator::new()))
    }

    fn deadline_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn test_initialize_opens_min_sessions() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool_with(backend.clone(), 3, 10);
        pool.initialize().await;

        let status = pool.status();
        assert_eq!(status.state, PoolState::Ready);
        assert_eq!(status.total, 3);
        assert_eq!(status.idle, 3);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_sessions() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool_with(backend.clone(), 1, 5);
        pool.initialize().await;

        {
            let _lease = pool.acquire(deadline_ms(100)).await.unwrap();
            assert_eq!(pool.status().idle, 0);
        }
        assert_eq!(pool.status().idle, 1);

        let _lease = pool.acquire(deadline_ms(100)).await.unwrap();
        // Reused the warm session instead of opening a second one.
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_capacity_without_leaking_waiter() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool_with(backend, 1, 1);
        pool.initialize().await;

        let held = pool.acquire(deadline_ms(100)).await.unwrap();
        let err = pool.acquire(deadline_ms(50)).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(pool.status().waiting, 0);
        drop(held);
    }

    #[tokio::test]
    async fn test_waiters_are_served_fifo() {
        let backend = Arc::new(MockBackend::new());
        let pool = Arc::new(pool_with(backend, 1, 1));
        pool.initialize().await;

        let held = pool.acquire(deadline_ms(500)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(deadline_ms(2000)).await.unwrap();
                order.lock().unwrap().push(i);
                drop(lease);
            }));
            // Give each spawned task a moment to join the queue in order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pool.status().waiting, 3);
        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_resize_clamps_to_policy_bounds() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool_with(backend, 2, 20);
        pool.initialize().await;

        assert_eq!(pool.resize(100).unwrap(), 20);
        assert_eq!(pool.resize(0).unwrap(), 2);
        assert_eq!(pool.resize(7).unwrap(), 7);
        assert_eq!(pool.status().current_max, 7);
        assert!(pool.status().last_resize_at.is_some());
    }

    #[tokio::test]
    async fn test_shrink_closes_idle_and_then_released_sessions() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool_with(backend, 2, 10);
        pool.initialize().await;

        // Grow to four sessions: three leased, one idle.
        let lease_a = pool.acquire(deadline_ms(100)).await.unwrap();
        let lease_b = pool.acquire(deadline_ms(100)).await.unwrap();
        let lease_c = pool.acquire(deadline_ms(100)).await.unwrap();
        let lease_d = pool.acquire(deadline_ms(100)).await.unwrap();
        drop(lease_d);
        assert_eq!(pool.status().total, 4);
        assert_eq!(pool.status().idle, 1);

        // Shrink to 2: the idle session closes immediately; leased sessions
        // are never terminated in flight.
        pool.resize(2).unwrap();
        let status = pool.status();
        assert_eq!(status.current_max, 2);
        assert_eq!(status.total, 3);
        assert_eq!(status.idle, 0);

        // The first release is over capacity and closes lazily; later ones
        // return to the idle set.
        drop(lease_a);
        assert_eq!(pool.status().total, 2);
        drop(lease_b);
        drop(lease_c);
        let status = pool.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.idle, 2);
    }

    #[tokio::test]
    async fn test_resize_growth_backfills_waiters() {
        let backend = Arc::new(MockBackend::new());
        let pool = Arc::new(pool_with(backend, 1, 10));
        pool.initialize().await;
        pool.resize(1).unwrap();

        let held = pool.acquire(deadline_ms(100)).await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool.acquire(deadline_ms(2000)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.status().waiting, 1);

        pool.resize(2).unwrap();
        let lease = waiter.await.unwrap().unwrap();
        drop(lease);
        drop(held);
    }

    #[tokio::test]
    async fn test_acquire_with_retry_recovers_from_transient_connect_failure() {
        let backend = Arc::new(MockBackend::failing_first(2));
        let pool = pool_with(backend.clone(), 1, 5);
        {
            let mut inner = pool.shared.inner.lock().unwrap();
            inner.state = PoolState::Ready;
        }

        let lease = pool
            .acquire_with_retry(3, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(backend.connects.load(Ordering::SeqCst), 3);
        drop(lease);
    }

    #[tokio::test]
    async fn test_connect_failure_does_not_leak_capacity() {
        let backend = Arc::new(MockBackend::failing_first(1));
        let pool = pool_with(backend, 1, 1);
        {
            let mut inner = pool.shared.inner.lock().unwrap();
            inner.state = PoolState::Ready;
        }

        let err = pool.acquire(deadline_ms(100)).await.unwrap_err();
        assert!(matches!(err, AppError::ConnectFailed(_)));
        assert_eq!(pool.status().total, 0);

        // The slot is free again, so the next acquire succeeds.
        let lease = pool.acquire(deadline_ms(100)).await.unwrap();
        drop(lease);
    }

    #[tokio::test]
    async fn test_probe_failures_flip_degraded_and_recover() {
        let backend = Arc::new(MockBackend::failing_first(3));
        let pool = pool_with(backend, 1, 1);
        {
            let mut inner = pool.shared.inner.lock().unwrap();
            inner.state = PoolState::Ready;
        }

        for _ in 0..3 {
            assert!(!pool.health_probe().await);
        }
        assert!(!pool.probe_ok());
        assert_eq!(pool.status().state, PoolState::Degraded);

        assert!(pool.health_probe().await);
        assert!(pool.probe_ok());
        assert_eq!(pool.status().state, PoolState::Ready);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquires_and_leaks_nothing() {
        let backend = Arc::new(MockBackend::new());
        let pool = Arc::new(pool_with(backend, 2, 5));
        pool.initialize().await;

        let lease = pool.acquire(deadline_ms(100)).await.unwrap();

        let shutdown_pool = pool.clone();
        let shutdown = tokio::spawn(async move {
            shutdown_pool.shutdown(Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pool.acquire(deadline_ms(50)).await.unwrap_err();
        assert!(matches!(err, AppError::ShuttingDown));

        drop(lease);
        let leaked = shutdown.await.unwrap();
        assert_eq!(leaked, 0);
        assert_eq!(pool.status().state, PoolState::Closed);
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_waiters() {
        let backend = Arc::new(MockBackend::new());
        let pool = Arc::new(pool_with(backend, 1, 1));
        pool.initialize().await;

        let held = pool.acquire(deadline_ms(100)).await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool.acquire(deadline_ms(5000)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let shutdown_pool = pool.clone();
        let shutdown = tokio::spawn(async move {
            shutdown_pool.shutdown(Duration::from_secs(1)).await
        });

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AppError::ShuttingDown)));

        drop(held);
        assert_eq!(shutdown.await.unwrap(), 0);
    }
}
