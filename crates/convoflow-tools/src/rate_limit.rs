//! Sliding-window rate limiting.
//!
//! The limiter is the one piece of mutable state shared across sessions.
//! Windows live in a [`DashMap`] keyed by `tool id × scope key`, so
//! concurrent sessions contend only on the shard holding their key.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::definition::{RateLimitScope, RateLimitSpec};

/// Checks between two sweeps of idle buckets.
const SWEEP_EVERY: usize = 256;

/// Identity used to pick the quota bucket.
#[derive(Debug, Clone, Copy)]
pub struct QuotaSubject<'a> {
    pub session_id: &'a str,
    pub user_id: Option<&'a str>,
}

#[derive(Debug, Default)]
struct Window {
    span: Duration,
    calls: VecDeque<Instant>,
}

impl Window {
    fn expire(&mut self, now: Instant) {
        while self
            .calls
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.span)
        {
            self.calls.pop_front();
        }
    }
}

/// Shared sliding-window counters.  Cloning shares the same windows.
///
/// Buckets whose window has emptied are dropped, so per-session keys do
/// not outlive their sessions.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    checks: Arc<AtomicUsize>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one call now.
    pub fn check(&self, tool_id: &str, spec: &RateLimitSpec, subject: QuotaSubject<'_>) -> bool {
        self.check_at(tool_id, spec, subject, Instant::now())
    }

    /// Admit or reject one call at `now`.  A call is recorded only when it
    /// is admitted.
    pub fn check_at(
        &self,
        tool_id: &str,
        spec: &RateLimitSpec,
        subject: QuotaSubject<'_>,
        now: Instant,
    ) -> bool {
        let key = bucket_key(tool_id, spec.scope, subject);

        let admitted = {
            let mut window = self.windows.entry(key.clone()).or_default();
            window.span = Duration::from_millis(spec.window_ms);
            window.expire(now);
            if window.calls.len() >= spec.requests as usize {
                tracing::debug!(tool = %tool_id, in_window = window.calls.len(), "rate limit reached");
                false
            } else {
                window.calls.push_back(now);
                true
            }
        };
        if !admitted {
            self.windows.remove_if(&key, |_, w| w.calls.is_empty());
        }

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_at(now);
        }
        admitted
    }

    /// Drop every bucket with no call left inside its window at `now`.
    pub fn sweep_at(&self, now: Instant) {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.expire(now);
            !window.calls.is_empty()
        });
        let dropped = before.saturating_sub(self.windows.len());
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.windows.len(), "idle rate-limit buckets dropped");
        }
    }

    /// Number of calls currently counted for a bucket.
    pub fn in_window(&self, tool_id: &str, scope: RateLimitScope, subject: QuotaSubject<'_>) -> usize {
        self.windows
            .get(&bucket_key(tool_id, scope, subject))
            .map_or(0, |window| window.calls.len())
    }

    /// Number of buckets currently held.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

fn bucket_key(tool_id: &str, scope: RateLimitScope, subject: QuotaSubject<'_>) -> String {
    match scope {
        RateLimitScope::Global => format!("{tool_id}|*"),
        RateLimitScope::Session => format!("{tool_id}|s:{}", subject.session_id),
        RateLimitScope::User => format!("{tool_id}|u:{}", subject.user_id.unwrap_or("anonymous")),
    }
}
