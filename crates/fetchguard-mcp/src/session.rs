//! C8 — Session Layer: slot reservation, admission control, initialisation
//! timeout, protocol-version negotiation, idle-TTL eviction.
//!
//! This crate's stdio-only local mode has no session concept to adapt;
//! the reserve/release accounting here follows an RAII-guard shape
//! (`SlotGuard`'s `Drop` releases exactly once, covering success, failure
//! and early-return) and the `Mutex<HashMap<..>>` + LRU-by-timestamp shape
//! already used by `fetchguard-local::cache::Cache`.
use fetchguard_core::jsonrpc::JsonRpcError;
use fetchguard_core::{ErrorKind, FetchError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2025-11-25"];
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// Maps an `mcp-protocol-version` header to the version that should govern
/// the rest of the exchange, or an invalid-request error if the client named
/// an unsupported one.
pub fn negotiate_protocol_version(header: Option<&str>) -> Result<String, JsonRpcError> {
    match header {
        None => Ok(DEFAULT_PROTOCOL_VERSION.to_string()),
        Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => Ok(v.to_string()),
        Some(v) => Err(JsonRpcError::invalid_request(format!("Unsupported MCP-Protocol-Version: {v}"))),
    }
}

pub struct Session {
    pub id: String,
    pub protocol_version: String,
    pub created_at: Instant,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn new(id: String, protocol_version: String) -> Self {
        let now = Instant::now();
        Self { id, protocol_version, created_at: now, last_seen: Mutex::new(now) }
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// Released exactly once, whether initialisation succeeds, fails, or the
/// future holding it is dropped (panic/early-return) — the RAII guard the
/// design notes ask for in place of a manual paired reserve/release.
pub struct SlotGuard<'a> {
    store: &'a SessionStore,
    active: bool,
}

impl SlotGuard<'_> {
    fn release(&mut self) {
        if self.active {
            self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.active = false;
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    in_flight: AtomicUsize,
    max_sessions: usize,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(max_sessions: usize, ttl: Duration) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), in_flight: AtomicUsize::new(0), max_sessions, ttl }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned();
        if let Some(s) = &session {
            s.touch();
        }
        session
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(id)
    }

    pub fn size(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_seen()) < self.ttl);
        before - sessions.len()
    }

    /// Removes the single session with the lowest `last_seen`, ties broken
    /// by iteration order (spec §5). Returns its id if one was evicted.
    fn evict_oldest(&self) -> Option<String> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let oldest = sessions.iter().min_by_key(|(_, s)| s.last_seen()).map(|(id, _)| id.clone());
        if let Some(id) = &oldest {
            sessions.remove(id);
        }
        oldest
    }

    /// Admission per spec §4.8: sweep expired sessions, then if the store is
    /// at capacity attempt exactly one eviction; fail with `SERVER_BUSY` if
    /// that doesn't free room.
    fn admit(&self) -> Result<SlotGuard<'_>, FetchError> {
        self.evict_expired();
        let occupied = self.size() + self.in_flight.load(Ordering::SeqCst);
        if occupied >= self.max_sessions && self.evict_oldest().is_none() {
            return Err(FetchError::new(ErrorKind::ServerBusy, "no session capacity available").with_status(503));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(SlotGuard { store: self, active: true })
    }

    /// Reserves a slot, runs `init` bound by `timeout`, and on success
    /// registers the new session under a freshly minted id. The slot is
    /// released on every path (success, failure, or timeout) via the guard's
    /// `Drop`.
    pub async fn initialize_session<F, Fut>(
        &self,
        protocol_version: String,
        init_timeout: Duration,
        init: F,
    ) -> Result<Arc<Session>, FetchError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), FetchError>>,
    {
        let _guard = self.admit()?;
        let id = Uuid::new_v4().to_string();

        match tokio::time::timeout(init_timeout, init(id.clone())).await {
            Ok(Ok(())) => {
                let session = Arc::new(Session::new(id.clone(), protocol_version));
                self.sessions.lock().unwrap_or_else(|e| e.into_inner()).insert(id, session.clone());
                Ok(session)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!("session initialisation timed out");
                Err(FetchError::new(ErrorKind::Timeout, "session initialisation timed out").with_status(504))
            }
        }
    }

    pub async fn run_cleanup_loop(store: Arc<SessionStore>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = store.evict_expired();
            if reaped > 0 {
                tracing::debug!(reaped, "session cleanup reaped expired sessions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok_init(_id: String) -> Result<(), FetchError> {
        Ok(())
    }

    #[test]
    fn unknown_protocol_version_is_rejected() {
        assert!(negotiate_protocol_version(Some("1999-01-01")).is_err());
    }

    #[test]
    fn absent_protocol_version_defaults() {
        assert_eq!(negotiate_protocol_version(None).unwrap(), DEFAULT_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn slot_is_released_after_successful_initialisation() {
        let store = SessionStore::new(10, Duration::from_secs(60));
        store
            .initialize_session(DEFAULT_PROTOCOL_VERSION.to_string(), Duration::from_secs(1), ok_init)
            .await
            .unwrap();
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(store.size(), 1);
    }

    #[tokio::test]
    async fn slot_is_released_after_failed_initialisation() {
        let store = SessionStore::new(10, Duration::from_secs(60));
        let result = store
            .initialize_session(DEFAULT_PROTOCOL_VERSION.to_string(), Duration::from_secs(1), |_id| async {
                Err(FetchError::new(ErrorKind::InternalError, "boom"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(store.size(), 0);
    }

    #[tokio::test]
    async fn capacity_pressure_evicts_oldest() {
        let store = SessionStore::new(2, Duration::from_secs(60));
        let s1 = store.initialize_session(DEFAULT_PROTOCOL_VERSION.to_string(), Duration::from_secs(1), ok_init).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _s2 = store.initialize_session(DEFAULT_PROTOCOL_VERSION.to_string(), Duration::from_secs(1), ok_init).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _s3 = store.initialize_session(DEFAULT_PROTOCOL_VERSION.to_string(), Duration::from_secs(1), ok_init).await.unwrap();

        assert_eq!(store.size(), 2);
        assert!(store.get(&s1.id).is_none(), "oldest session should have been evicted");
    }

    #[tokio::test]
    async fn initialisation_timeout_releases_the_slot() {
        let store = SessionStore::new(10, Duration::from_secs(60));
        let result = store
            .initialize_session(DEFAULT_PROTOCOL_VERSION.to_string(), Duration::from_millis(5), |_id| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn evict_expired_sweeps_stale_sessions() {
        let store = SessionStore::new(10, Duration::from_millis(0));
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(store.initialize_session(DEFAULT_PROTOCOL_VERSION.to_string(), Duration::from_secs(1), ok_init)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.size(), 0);
    }
}
