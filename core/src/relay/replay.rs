//! Replay guard: freshness window plus single-use nonces.

use super::rejection::Rejection;
use crate::message::Envelope;
use std::collections::HashMap;

/// Default replay window: 15 seconds
pub const DEFAULT_REPLAY_WINDOW_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy)]
struct NonceRecord {
    first_seen: u64,
    /// Last instant at which the envelope could still pass the freshness test
    retain_until: u64,
}

/// Tracks recently seen nonces for one participant.
///
/// An envelope with timestamp `T` is fresh at `now` iff
/// `now - T <= window` and `T - now <= skew`. Its nonce is retained until
/// `max(now, T) + window`, the point after which the envelope is stale
/// anyway, so no nonce is forgotten while a replay of it could still pass.
#[derive(Debug)]
pub struct ReplayGuard {
    window_ms: u64,
    skew_ms: u64,
    seen: HashMap<String, NonceRecord>,
}

impl ReplayGuard {
    /// Guard with a symmetric window: accepts iff `|now - T| <= window_ms`.
    pub fn new(window_ms: u64) -> Self {
        Self::with_skew(window_ms, window_ms)
    }

    /// Guard with a separate tolerance for timestamps ahead of `now`.
    pub fn with_skew(window_ms: u64, skew_ms: u64) -> Self {
        Self {
            window_ms,
            skew_ms,
            seen: HashMap::new(),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Admit or reject `nonce` at `timestamp`, recording it on success.
    pub fn check(&mut self, nonce: &str, timestamp: u64, now: u64) -> Result<(), Rejection> {
        self.sweep(now);

        if timestamp <= now {
            if now - timestamp > self.window_ms {
                return Err(Rejection::Stale);
            }
        } else if timestamp - now > self.skew_ms {
            return Err(Rejection::FromFuture);
        }

        if nonce.is_empty() {
            return Err(Rejection::MalformedEnvelope);
        }
        if self.seen.contains_key(nonce) {
            return Err(Rejection::ReplayedNonce);
        }

        self.seen.insert(
            nonce.to_string(),
            NonceRecord {
                first_seen: now,
                retain_until: now.max(timestamp).saturating_add(self.window_ms),
            },
        );
        Ok(())
    }

    /// Boolean form of [`ReplayGuard::check`].
    pub fn admit(&mut self, envelope: &Envelope, now: u64) -> bool {
        self.check(&envelope.nonce, envelope.timestamp, now).is_ok()
    }

    /// Evict nonces whose envelopes can no longer be fresh. Returns the
    /// number evicted.
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, record| record.retain_until >= now);
        before - self.seen.len()
    }

    /// When `nonce` was first admitted, if it is still retained.
    pub fn first_seen(&self, nonce: &str) -> Option<u64> {
        self.seen.get(nonce).map(|record| record.first_seen)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW_MS)
    }
}
