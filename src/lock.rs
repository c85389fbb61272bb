//! Distributed lock abstraction
//!
//! A lock is a (key, token) pair with a TTL. Acquire succeeds when the
//! key is unheld, held past its expiry, or held by the same token (which
//! refreshes the TTL). Release succeeds only with the holding token;
//! releasing a missing key reports success so crashed holders do not
//! wedge their callers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

/// Cooperative mutual exclusion across processes
///
/// Implementations swallow infrastructure errors and report them as a
/// failed acquire; callers treat `false` as "someone else holds it".
#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to take `key` with `token` for `expire`; refreshes the TTL
    /// when the same token already holds the key.
    async fn acquire(&self, key: &str, token: &str, expire: Duration) -> bool;

    /// Give up `key`; true when the key is free afterwards
    async fn release(&self, key: &str, token: &str) -> bool;
}

/// In-process locker for tests and single-node deployments
#[derive(Default)]
pub struct MemoryLocker {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn acquire(&self, key: &str, token: &str, expire: Duration) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match held.get(key) {
            Some((holder, deadline)) if *deadline > now && holder != token => {
                debug!(key, token, "lock held elsewhere");
                false
            }
            _ => {
                held.insert(key.to_string(), (token.to_string(), now + expire));
                true
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get(key) {
            None => true,
            Some((holder, _)) if holder == token => {
                held.remove(key);
                true
            }
            Some(_) => false,
        }
    }
}
