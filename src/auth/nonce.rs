//! Short-lived memory of nonces that have already been accepted.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Bounded cache of used nonces, each remembered for `ttl_secs`.
///
/// Entries outlive the freshness window, so a captured request cannot be
/// replayed while its timestamp would still be accepted.
pub struct NonceCache {
    ttl_secs: i64,
    capacity: usize,
    inner: Mutex<NonceState>,
}

#[derive(Default)]
struct NonceState {
    expires: HashMap<String, i64>,
    order: VecDeque<(String, i64)>,
}

impl NonceState {
    fn prune(&mut self, now: i64) {
        while let Some((_, expires_at)) = self.order.front() {
            if *expires_at > now {
                break;
            }
            if let Some((nonce, expires_at)) = self.order.pop_front() {
                if self.expires.get(&nonce) == Some(&expires_at) {
                    self.expires.remove(&nonce);
                }
            }
        }
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (nonce, expires_at) = self.order.pop_front()?;
        if self.expires.get(&nonce) == Some(&expires_at) {
            self.expires.remove(&nonce);
        }
        Some(nonce)
    }
}

impl NonceCache {
    pub fn new(ttl_secs: i64, capacity: usize) -> Self {
        Self {
            ttl_secs,
            capacity: capacity.max(1),
            inner: Mutex::new(NonceState::default()),
        }
    }

    /// Record `nonce` as used at `now`. Returns `false` if it was already
    /// used within the TTL.
    pub fn insert_if_fresh(&self, nonce: &str, now: i64) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.prune(now);

        if state.expires.contains_key(nonce) {
            return false;
        }

        while state.expires.len() >= self.capacity {
            match state.evict_oldest() {
                Some(evicted) => {
                    tracing::warn!(nonce = %evicted, "Nonce cache full, evicting oldest entry");
                }
                None => break,
            }
        }

        let expires_at = now + self.ttl_secs;
        state.expires.insert(nonce.to_string(), expires_at);
        state.order.push_back((nonce.to_string(), expires_at));
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).expires.len()
    }
}
