use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, duration_ms};

const SESSION_ID_BYTES: usize = 32;
const SESSION_ID_MIN_LEN: usize = 16;
const SESSION_ID_MAX_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub created_at_ms: i64,
    pub last_accessed_at_ms: i64,
    pub call_history: VecDeque<i64>,
}

impl Session {
    pub fn new(id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            created_at_ms: now_ms,
            last_accessed_at_ms: now_ms,
            call_history: VecDeque::new(),
        }
    }

    fn is_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_accessed_at_ms) >= timeout_ms
    }
}

/// What a store should do with an entry after [`SessionStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Keep,
    Evict,
}

/// Keyed session storage. Implementations must run `update` atomically with
/// respect to other operations on the same id.
pub trait SessionStore: Send + Sync {
    fn put(&self, session: Session);

    /// Stores `session` unless an entry with the same id exists. Returns whether
    /// it was inserted.
    fn put_if_absent(&self, session: Session) -> bool;

    fn get(&self, session_id: &str) -> Option<Session>;

    fn delete(&self, session_id: &str) -> Option<Session>;

    /// Runs `edit` against the stored session while holding its entry lock.
    /// Returns `false` when nothing is stored under `session_id`.
    fn update(&self, session_id: &str, edit: &mut dyn FnMut(&mut Session) -> Retention) -> bool;

    fn retain(&self, keep: &mut dyn FnMut(&Session) -> bool);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn put(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    fn put_if_absent(&self, session: Session) -> bool {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                true
            }
        }
    }

    fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    fn delete(&self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id).map(|(_, session)| session)
    }

    fn update(&self, session_id: &str, edit: &mut dyn FnMut(&mut Session) -> Retention) -> bool {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if edit(occupied.get_mut()) == Retention::Evict {
                    occupied.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    fn retain(&self, keep: &mut dyn FnMut(&Session) -> bool) {
        self.sessions.retain(|_, session| keep(session));
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Valid,
    Expired,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub timeout: Duration,
    pub max_sessions: usize,
    /// How far back call history is kept; matches the rate-limit window.
    pub history_window: Duration,
    pub recreate_unknown: bool,
}

/// Owns session lifecycle and expiry on top of an injected [`SessionStore`].
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, policy: SessionPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timeout(&self) -> Duration {
        self.policy.timeout
    }

    pub fn create_session(&self) -> Session {
        let now = self.clock.now_ms();

        if self.store.len() >= self.policy.max_sessions {
            self.purge_expired();
            self.evict_least_recently_used(now);
        }

        let session = Session::new(new_session_id(), now);
        self.store.put(session.clone());
        crate::metrics::set_active_sessions(self.store.len());

        tracing::debug!("session created");
        session
    }

    /// Returns `true` and refreshes the access time iff the session exists and
    /// has not expired.
    pub fn validate(&self, session_id: &str) -> bool {
        self.check(session_id) == SessionStatus::Valid
    }

    pub fn check(&self, session_id: &str) -> SessionStatus {
        if !is_well_formed_session_id(session_id) {
            return SessionStatus::NotFound;
        }

        let now = self.clock.now_ms();
        let timeout_ms = duration_ms(self.policy.timeout);
        let mut status = SessionStatus::NotFound;

        let found = self.store.update(session_id, &mut |session| {
            if session.is_expired(now, timeout_ms) {
                status = SessionStatus::Expired;
                Retention::Evict
            } else {
                session.last_accessed_at_ms = session.last_accessed_at_ms.max(now);
                status = SessionStatus::Valid;
                Retention::Keep
            }
        });

        if !found && self.policy.recreate_unknown {
            self.store
                .put_if_absent(Session::new(session_id.to_string(), now));
            tracing::info!("unknown session re-registered");
            return SessionStatus::Valid;
        }

        if status == SessionStatus::Expired {
            crate::metrics::set_active_sessions(self.store.len());
            tracing::info!("session expired");
        }

        status
    }

    /// Appends a call timestamp, dropping history older than the configured
    /// window. Returns `false` if the session does not exist.
    pub fn record_call(&self, session_id: &str, timestamp_ms: i64) -> bool {
        let window_ms = duration_ms(self.policy.history_window);
        self.store.update(session_id, &mut |session| {
            session.call_history.push_back(timestamp_ms);
            prune_history(&mut session.call_history, timestamp_ms, window_ms);
            Retention::Keep
        })
    }

    pub fn end(&self, session_id: &str) -> bool {
        let removed = self.store.delete(session_id).is_some();
        if removed {
            crate::metrics::set_active_sessions(self.store.len());
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.store.get(session_id)
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let timeout_ms = duration_ms(self.policy.timeout);
        let before = self.store.len();
        self.store
            .retain(&mut |session| !session.is_expired(now, timeout_ms));
        let after = self.store.len();
        crate::metrics::set_active_sessions(after);
        before.saturating_sub(after)
    }

    fn evict_least_recently_used(&self, now: i64) {
        let len = self.store.len();
        if len < self.policy.max_sessions {
            return;
        }

        let overflow = len + 1 - self.policy.max_sessions;
        let mut candidates = Vec::with_capacity(len);
        self.store.retain(&mut |session| {
            candidates.push((session.last_accessed_at_ms, session.id.clone()));
            true
        });
        candidates.sort();

        for (last_accessed, id) in candidates.into_iter().take(overflow) {
            self.store.delete(&id);
            tracing::warn!(
                idle_ms = now.saturating_sub(last_accessed),
                "session evicted at capacity"
            );
        }
    }
}

/// Drops timestamps that fall outside `(now - window, now]`.
pub(crate) fn prune_history(history: &mut VecDeque<i64>, now_ms: i64, window_ms: i64) {
    while let Some(front) = history.front() {
        if now_ms.saturating_sub(*front) >= window_ms {
            history.pop_front();
        } else {
            break;
        }
    }
}

/// Random URL-safe token carrying 32 bytes of entropy.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn is_well_formed_session_id(raw: &str) -> bool {
    (SESSION_ID_MIN_LEN..=SESSION_ID_MAX_LEN).contains(&raw.len())
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'))
}

/// Purges expired sessions every `interval` until `shutdown` fires.
pub fn spawn_session_sweeper(
    sessions: SessionManager,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = sessions.purge_expired();
                    if purged > 0 {
                        tracing::info!(purged, "expired sessions purged");
                    }
                }
            }
        }
    })
}
