use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, duration_ms};
use crate::session::{Retention, SessionStore, prune_history};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    Exceeded { retry_after: Duration },
    UnknownSession,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitError::Exceeded { retry_after } => {
                write!(f, "rate limit exceeded, retry after {}ms", retry_after.as_millis())
            }
            RateLimitError::UnknownSession => write!(f, "rate limit applied to unknown session"),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Sliding-window limiter over each session's call history.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Admits the call and records it in the session history when fewer than
    /// `max_calls` calls fall inside the trailing `window`. A limit of zero
    /// disables limiting.
    pub fn admit(
        &self,
        session_id: &str,
        max_calls: u32,
        window: Duration,
    ) -> Result<(), RateLimitError> {
        let now = self.clock.now_ms();
        let window_ms = duration_ms(window);
        let mut outcome = Ok(());

        let found = self.store.update(session_id, &mut |session| {
            let history = &mut session.call_history;
            prune_history(history, now, window_ms);

            if max_calls > 0 && history.len() >= max_calls as usize {
                let oldest = history.front().copied().unwrap_or(now);
                let retry_after_ms = window_ms.saturating_sub(now.saturating_sub(oldest)).max(0);
                outcome = Err(RateLimitError::Exceeded {
                    retry_after: Duration::from_millis(retry_after_ms as u64),
                });
            } else {
                history.push_back(now);
                outcome = Ok(());
            }
            Retention::Keep
        });

        if !found {
            return Err(RateLimitError::UnknownSession);
        }
        if outcome.is_err() {
            crate::metrics::inc_rate_limit_denied();
        }
        outcome
    }
}
