//! Server readiness: health checks and the wake-up sequence for scale-to-zero backends.
//!
//! A successful check marks the server warm for `health_check_interval`; within that window
//! [`ServerReadiness::ensure_ready`] returns without touching the network. Only one wake-up runs
//! at a time; a concurrent caller gets [`ReadyOutcome::AlreadyWaking`] instead of a second sequence.

use crate::client::{RequestExecutor, RetryController};
use crate::config::ReadinessConfig;
use crate::error::ChatError;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub const STATUS_CHECKING: &str = "Checking server status…";
pub const STATUS_CONNECTING: &str = "Attempting to connect…";
pub const STATUS_READY: &str = "Server is ready!";
pub const STATUS_FAILED: &str = "Failed to start server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Unknown,
    Waking,
    Ready,
    /// Last wake-up failed; the next `ensure_ready` starts a new one.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerState {
    pub is_awake: bool,
    pub last_health_check_at: Option<Instant>,
    pub is_waking_up: bool,
}

/// What `ensure_ready` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Recent successful check; no request was made.
    Warm,
    /// A wake-up sequence ran and the server answered.
    Woken,
    /// Another wake-up is in flight; readiness is not established by this call.
    AlreadyWaking,
}

impl ReadyOutcome {
    pub fn is_ready(self) -> bool {
        !matches!(self, ReadyOutcome::AlreadyWaking)
    }
}

struct Inner {
    phase: ReadinessState,
    server: ServerState,
}

pub struct ServerReadiness {
    executor: RequestExecutor,
    retry: RetryController,
    health_path: String,
    interval: Duration,
    wake_max_retries: u32,
    inner: Mutex<Inner>,
}

/// Clears `is_waking_up` even if the wake future is dropped mid-flight.
struct WakeGuard<'a>(&'a Mutex<Inner>);

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        let mut g = self.0.lock().unwrap_or_else(|e| e.into_inner());
        g.server.is_waking_up = false;
        if g.phase == ReadinessState::Waking {
            g.phase = ReadinessState::Unknown;
        }
    }
}

impl ServerReadiness {
    pub fn new(
        executor: RequestExecutor,
        retry: RetryController,
        health_path: impl Into<String>,
        config: &ReadinessConfig,
    ) -> Self {
        Self {
            executor,
            retry,
            health_path: health_path.into(),
            interval: config.health_check_interval(),
            wake_max_retries: config.wake_max_retries,
            inner: Mutex::new(Inner {
                phase: ReadinessState::Unknown,
                server: ServerState {
                    is_awake: false,
                    last_health_check_at: None,
                    is_waking_up: false,
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ReadinessState {
        self.lock().phase
    }

    pub fn server_state(&self) -> ServerState {
        self.lock().server
    }

    /// Ready and checked within the staleness window.
    pub fn is_ready(&self) -> bool {
        let g = self.lock();
        g.phase == ReadinessState::Ready && self.is_fresh(&g.server)
    }

    fn is_fresh(&self, server: &ServerState) -> bool {
        server.is_awake
            && server
                .last_health_check_at
                .map(|at| at.elapsed() < self.interval)
                .unwrap_or(false)
    }

    /// Force the next `ensure_ready` to re-check the server.
    pub fn invalidate(&self) {
        let mut g = self.lock();
        g.server.last_health_check_at = None;
    }

    /// One GET to the health endpoint. Success refreshes the last-check time.
    pub async fn health_check(&self) -> Result<(), ChatError> {
        self.executor.probe(&self.health_path).await?;
        self.lock().server.last_health_check_at = Some(Instant::now());
        Ok(())
    }

    /// Make sure the backend is awake, waking it if needed. Progress strings are passed to `progress`.
    pub async fn ensure_ready(
        &self,
        progress: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ReadyOutcome, ChatError> {
        {
            let mut g = self.lock();
            if g.phase == ReadinessState::Ready && self.is_fresh(&g.server) {
                return Ok(ReadyOutcome::Warm);
            }
            if g.server.is_waking_up {
                log::debug!("readiness: wake-up already in progress, skipping");
                return Ok(ReadyOutcome::AlreadyWaking);
            }
            g.server.is_waking_up = true;
            g.phase = ReadinessState::Waking;
        }
        let _guard = WakeGuard(&self.inner);
        log::info!("readiness: waking server via {}", self.health_path);
        progress(STATUS_CHECKING);

        let result = {
            let this = self;
            let progress = &mut *progress;
            let mut attempt = 0u32;
            self.retry
                .run(
                    move || {
                        attempt += 1;
                        if attempt == 2 {
                            progress(STATUS_CONNECTING);
                        }
                        this.health_check()
                    },
                    Some(self.wake_max_retries),
                )
                .await
        };

        match result {
            Ok(()) => {
                {
                    let mut g = self.lock();
                    g.server.is_awake = true;
                    g.server.last_health_check_at = Some(Instant::now());
                    g.phase = ReadinessState::Ready;
                }
                log::info!("readiness: server is ready");
                progress(STATUS_READY);
                Ok(ReadyOutcome::Woken)
            }
            Err(e) => {
                {
                    let mut g = self.lock();
                    g.server.is_awake = false;
                    g.phase = ReadinessState::Error;
                }
                log::error!("readiness: server failed to start: {}", e);
                progress(STATUS_FAILED);
                Err(ChatError::startup_failed(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::{HttpRequest, HttpResponse, RetryPolicy, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Health endpoint that fails the first `failures` calls.
    pub(crate) struct FlakyHealth {
        pub failures: usize,
        pub calls: AtomicUsize,
        pub delay: Duration,
    }

    impl FlakyHealth {
        pub fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Transport for FlakyHealth {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ChatError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.failures {
                Ok(HttpResponse {
                    status: 503,
                    body: "starting".to_string(),
                })
            } else {
                Ok(HttpResponse {
                    status: 200,
                    body: "ok".to_string(),
                })
            }
        }
    }

    fn readiness(t: Arc<FlakyHealth>, wake_max_retries: u32) -> ServerReadiness {
        let executor = RequestExecutor::new(t, "http://backend.test", Duration::from_secs(5));
        let retry = RetryController::new(RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        });
        ServerReadiness::new(
            executor,
            retry,
            "/health",
            &ReadinessConfig {
                health_check_interval_ms: 60_000,
                wake_max_retries,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_after_three_failures() {
        let t = FlakyHealth::new(3);
        let r = readiness(t.clone(), 5);
        let mut seen = Vec::new();
        let outcome = r
            .ensure_ready(&mut |s: &str| seen.push(s.to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, ReadyOutcome::Woken);
        assert_eq!(t.calls.load(Ordering::SeqCst), 4);
        assert_eq!(r.state(), ReadinessState::Ready);
        let server = r.server_state();
        assert!(server.is_awake);
        assert!(!server.is_waking_up);
        assert_eq!(seen, vec![STATUS_CHECKING, STATUS_CONNECTING, STATUS_READY]);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_server_is_not_rechecked_within_interval() {
        let t = FlakyHealth::new(0);
        let r = readiness(t.clone(), 5);
        r.ensure_ready(&mut |_: &str| {}).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let outcome = r.ensure_ready(&mut |_: &str| {}).await.unwrap();
        assert_eq!(outcome, ReadyOutcome::Warm);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_check_goes_back_to_the_network() {
        let t = FlakyHealth::new(0);
        let r = readiness(t.clone(), 5);
        r.ensure_ready(&mut |_: &str| {}).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!r.is_ready());
        let outcome = r.ensure_ready(&mut |_: &str| {}).await.unwrap();
        assert_eq!(outcome, ReadyOutcome::Woken);
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_recheck() {
        let t = FlakyHealth::new(0);
        let r = readiness(t.clone(), 5);
        r.ensure_ready(&mut |_: &str| {}).await.unwrap();
        r.invalidate();
        r.ensure_ready(&mut |_: &str| {}).await.unwrap();
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_wake_is_startup_failure() {
        let t = FlakyHealth::new(usize::MAX);
        let r = readiness(t.clone(), 2);
        let mut seen = Vec::new();
        let err = r
            .ensure_ready(&mut |s: &str| seen.push(s.to_string()))
            .await
            .unwrap_err();
        match err {
            ChatError::ServerStartupFailed { source } => {
                assert!(matches!(*source, ChatError::Http { status: 503, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
        assert_eq!(r.state(), ReadinessState::Error);
        assert!(!r.server_state().is_awake);
        assert!(!r.server_state().is_waking_up);
        assert_eq!(seen.last().map(String::as_str), Some(STATUS_FAILED));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_wake_is_skipped() {
        let t = Arc::new(FlakyHealth {
            failures: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(500),
        });
        let r = readiness(t.clone(), 5);
        let mut p1 = |_: &str| {};
        let mut p2 = |_: &str| {};
        let (a, b) = tokio::join!(r.ensure_ready(&mut p1), r.ensure_ready(&mut p2));
        assert_eq!(a.unwrap(), ReadyOutcome::Woken);
        assert_eq!(b.unwrap(), ReadyOutcome::AlreadyWaking);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
        assert!(!r.server_state().is_waking_up);
    }
}
