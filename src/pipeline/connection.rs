//! Connection manager: owns the single upstream connection slot
//!
//! A connection is owned by exactly one session task (continuous streaming or
//! a transient screenshot). The slot stores that task's abort handle, so
//! closing the connection means aborting the task, which drops the HTTP body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::capture::{Connection, Connector};
use crate::error::{CameraError, ConnectionError};
use crate::{Metrics, ReconnectConfig};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Continuous streaming started by `start()`
    Streaming,
    /// One-frame screenshot session
    Transient,
}

struct ActiveSession {
    id: SessionId,
    kind: SessionKind,
    task: AbortHandle,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectConfig,
    metrics: Arc<Metrics>,
    active: Mutex<Option<ActiveSession>>,
    next_session: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            connector,
            policy,
            metrics,
            active: Mutex::new(None),
            next_session: AtomicU64::new(0),
        }
    }

    /// Open one upstream stream. Retrying is the caller's business.
    pub async fn open(&self) -> Result<Connection, ConnectionError> {
        let connection = self.connector.connect().await?;
        self.metrics.connection_opened();
        Ok(connection)
    }

    /// Claim the connection slot and spawn the task that will own the connection.
    ///
    /// `spawn` runs while the slot is locked, so the task cannot release the
    /// slot before its abort handle is stored. A streaming claim supersedes a
    /// transient one; every other overlap is `AlreadyConnected`.
    pub fn claim<F>(&self, kind: SessionKind, spawn: F) -> Result<SessionId, CameraError>
    where
        F: FnOnce(SessionId) -> AbortHandle,
    {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            match (current.kind, kind) {
                (SessionKind::Transient, SessionKind::Streaming) => {
                    info!(session = current.id, "Streaming supersedes transient session");
                    current.task.abort();
                }
                _ => return Err(CameraError::AlreadyConnected),
            }
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let task = spawn(id);
        *active = Some(ActiveSession { id, kind, task });
        debug!(session = id, ?kind, "Connection slot claimed");
        Ok(id)
    }

    /// Abort whichever session currently holds the connection.
    ///
    /// Returns `NotConnected` when the slot is already empty; the slot ends up
    /// empty either way.
    pub fn close(&self) -> Result<(SessionId, SessionKind), CameraError> {
        let session = self.active.lock().take().ok_or(CameraError::NotConnected)?;
        session.task.abort();
        debug!(session = session.id, kind = ?session.kind, "Connection closed");
        Ok((session.id, session.kind))
    }

    /// Abort `id` if it still holds the slot
    pub fn abort(&self, id: SessionId) -> bool {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(session) if session.id == id => {
                session.task.abort();
                *active = None;
                true
            }
            _ => false,
        }
    }

    /// Give the slot back from inside a session task that finished on its own
    pub fn release(&self, id: SessionId) -> bool {
        self.release_with(id, || ()).is_some()
    }

    /// Run `f` while `id` still holds the slot, then give the slot back.
    ///
    /// Nothing can claim the slot while `f` runs. Returns `None` without
    /// calling `f` when `id` was already closed or superseded.
    pub fn release_with<T>(&self, id: SessionId, f: impl FnOnce() -> T) -> Option<T> {
        let mut active = self.active.lock();
        if !active.as_ref().is_some_and(|session| session.id == id) {
            return None;
        }
        let out = f();
        *active = None;
        Some(out)
    }

    pub fn is_connected(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn active_kind(&self) -> Option<SessionKind> {
        self.active.lock().as_ref().map(|session| session.kind)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.policy.clone())
    }
}

/// Capped exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectConfig) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
        {
            return None;
        }
        self.attempt += 1;

        let initial = self.policy.initial_delay_ms as f64;
        let cap = self.policy.max_delay_ms.max(self.policy.initial_delay_ms) as f64;
        let growth = self
            .policy
            .multiplier
            .max(1.0)
            .powi(self.attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let base = (initial * growth).min(cap);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - rand::thread_rng().gen_range(0.0..=jitter)
        } else {
            1.0
        };

        Some(Duration::from_millis((base * factor) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> Result<Connection, ConnectionError> {
            Err(ConnectionError::Closed)
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(Refusing),
            ReconnectConfig::default(),
            Arc::new(Metrics::new("test")),
        )
    }

    fn idle_task() -> AbortHandle {
        tokio::spawn(std::future::pending::<()>()).abort_handle()
    }

    fn policy(initial: u64, max: u64, max_attempts: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(policy(100, 1_000, None));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn backoff_gives_up_after_max_attempts() {
        let mut backoff = Backoff::new(policy(10, 100, Some(2)));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn immediate_policy_never_waits() {
        let mut backoff = Backoff::new(ReconnectConfig::immediate());
        for _ in 0..50 {
            assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        }
    }

    #[test]
    fn jitter_only_shortens() {
        let mut config = policy(1_000, 1_000, None);
        config.jitter = 0.5;
        let mut backoff = Backoff::new(config);
        for _ in 0..20 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1_000));
        }
    }

    #[tokio::test]
    async fn close_without_connection_reports_not_connected() {
        let manager = manager();
        assert!(matches!(manager.close(), Err(CameraError::NotConnected)));
        assert!(matches!(manager.close(), Err(CameraError::NotConnected)));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn close_aborts_owning_task() {
        let manager = manager();
        let task = tokio::spawn(std::future::pending::<()>());
        let handle = task.abort_handle();
        let id = manager.claim(SessionKind::Streaming, move |_| handle).unwrap();

        assert_eq!(manager.close().unwrap(), (id, SessionKind::Streaming));
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn second_streaming_claim_is_rejected() {
        let manager = manager();
        let first = manager.claim(SessionKind::Streaming, |_| idle_task()).unwrap();
        let second = manager.claim(SessionKind::Streaming, |_| idle_task());

        assert!(matches!(second, Err(CameraError::AlreadyConnected)));
        assert_eq!(manager.active_kind(), Some(SessionKind::Streaming));
        assert!(manager.release(first));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn streaming_supersedes_transient() {
        let manager = manager();
        let transient = tokio::spawn(std::future::pending::<()>());
        let handle = transient.abort_handle();
        let old = manager.claim(SessionKind::Transient, move |_| handle).unwrap();

        let new = manager.claim(SessionKind::Streaming, |_| idle_task()).unwrap();

        assert_ne!(old, new);
        assert!(transient.await.unwrap_err().is_cancelled());
        assert!(!manager.release(old));
        assert_eq!(manager.active_kind(), Some(SessionKind::Streaming));
    }

    #[tokio::test]
    async fn release_with_runs_only_for_the_holder() {
        let manager = manager();
        let old = manager.claim(SessionKind::Transient, |_| idle_task()).unwrap();
        let new = manager.claim(SessionKind::Streaming, |_| idle_task()).unwrap();

        let mut ran = false;
        assert_eq!(manager.release_with(old, || ran = true), None);
        assert!(!ran);
        assert_eq!(manager.active_kind(), Some(SessionKind::Streaming));

        assert_eq!(manager.release_with(new, || 7), Some(7));
        assert!(!manager.is_connected());
        assert_eq!(manager.release_with(new, || 7), None);
    }

    #[tokio::test]
    async fn abort_ignores_stale_session() {
        let manager = manager();
        let id = manager.claim(SessionKind::Transient, |_| idle_task()).unwrap();
        assert!(!manager.abort(id + 1));
        assert!(manager.is_connected());
        assert!(manager.abort(id));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn open_failure_is_not_counted() {
        let metrics = Arc::new(Metrics::new("test"));
        let manager = ConnectionManager::new(
            Arc::new(Refusing),
            ReconnectConfig::default(),
            Arc::clone(&metrics),
        );
        assert!(manager.open().await.is_err());
        assert_eq!(metrics.snapshot().connections_opened, 0);
    }
}
