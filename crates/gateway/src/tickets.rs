use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use lru::LruCache;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::Instant;

use crate::metrics;

const TICKET_BYTES: usize = 32;

/// Single-use admission tickets for the WebSocket side channel.
///
/// A ticket is valid for `ttl` after issuance and is consumed by the first
/// validation, successful or not. Past capacity the oldest ticket is dropped.
#[derive(Clone)]
pub struct TicketCache {
    issued: Arc<Mutex<LruCache<String, Instant>>>,
    ttl: Duration,
}

impl TicketCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            issued: Arc::new(Mutex::new(LruCache::new(capacity))),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Instant>> {
        match self.issued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn issue(&self) -> String {
        let mut bytes = [0u8; TICKET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let ticket = URL_SAFE_NO_PAD.encode(bytes);

        // Entries are never promoted, so LRU order is write order.
        self.lock().push(ticket.clone(), Instant::now());
        ticket
    }

    pub fn validate(&self, ticket: &str) -> bool {
        let issued_at = self.lock().pop(ticket);
        let valid = issued_at.is_some_and(|at| at.elapsed() < self.ttl);

        metrics::observe_ticket_validation(match (issued_at, valid) {
            (None, _) => "unknown",
            (Some(_), false) => "expired",
            (Some(_), true) => "accepted",
        });
        valid
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tickets(capacity: usize) -> TicketCache {
        TicketCache::new(NonZeroUsize::new(capacity).unwrap(), Duration::from_secs(60))
    }

    #[test]
    fn tickets_are_fixed_length_url_safe_text() {
        let cache = tickets(10);
        let a = cache.issue();
        let b = cache.issue();

        assert_eq!(a.len(), 43);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_is_single_use() {
        let cache = tickets(10);
        let ticket = cache.issue();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cache.validate(&ticket));
        assert!(!cache.validate(&ticket));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_expires_without_validation() {
        let cache = tickets(10);
        let ticket = cache.issue();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cache.validate(&ticket));
    }

    #[test]
    fn unknown_ticket_is_rejected() {
        let cache = tickets(10);
        assert!(!cache.validate("not-a-ticket"));
        assert!(!cache.validate(""));
    }

    #[test]
    fn oldest_ticket_is_dropped_past_capacity() {
        let cache = tickets(2);
        let first = cache.issue();
        let second = cache.issue();
        let third = cache.issue();

        assert_eq!(cache.len(), 2);
        assert!(!cache.validate(&first));
        assert!(cache.validate(&second));
        assert!(cache.validate(&third));
    }
}
