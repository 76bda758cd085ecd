//! Round-robin rotation over LLM API keys with per-key cooldowns.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::{GeneratorError, Provider};

/// Longest wait between two availability checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Default)]
struct KeyRing {
    keys: VecDeque<String>,
    /// Keys on cooldown, with the instant they become usable again.
    cooldowns: HashMap<String, Instant>,
    last_issued: Option<String>,
}

impl KeyRing {
    fn release_expired(&mut self, now: Instant) {
        self.cooldowns.retain(|_, deadline| *deadline > now);
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.cooldowns.values().min().copied()
    }

    fn available(&self) -> usize {
        self.keys
            .iter()
            .filter(|key| !self.cooldowns.contains_key(*key))
            .count()
    }
}

/// Hands out API keys in turn, skipping the ones cooling down after a
/// rate limit.
#[derive(Debug)]
pub struct ApiKeyManager {
    provider: Provider,
    ring: Mutex<KeyRing>,
}

impl ApiKeyManager {
    /// Create a manager from raw keys. Keys not shaped like the provider's
    /// are dropped.
    pub fn new<I, S>(provider: Provider, keys: I) -> Result<Self, GeneratorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut accepted = VecDeque::new();

        for key in keys.into_iter().map(Into::into) {
            if !provider.accepts(&key) {
                tracing::warn!(%provider, "ignoring API key with unexpected prefix");
            } else if !accepted.contains(&key) {
                accepted.push_back(key);
            }
        }

        if accepted.is_empty() {
            return Err(GeneratorError::NoApiKeys(provider));
        }

        tracing::debug!(%provider, keys = accepted.len(), "API keys loaded");

        Ok(Self {
            provider,
            ring: Mutex::new(KeyRing {
                keys: accepted,
                ..Default::default()
            }),
        })
    }

    fn ring(&self) -> MutexGuard<'_, KeyRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provider the keys belong to.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.ring().keys.len()
    }

    /// Number of keys not cooling down.
    pub fn available(&self) -> usize {
        let mut ring = self.ring();
        ring.release_expired(Instant::now());
        ring.available()
    }

    /// Issue the first available key and move it to the back of the queue.
    /// Otherwise, return how long to wait before trying again.
    fn try_issue(&self) -> Result<String, Duration> {
        let now = Instant::now();
        let mut ring = self.ring();
        ring.release_expired(now);

        let position = ring
            .keys
            .iter()
            .position(|key| !ring.cooldowns.contains_key(key));

        match position.and_then(|index| ring.keys.remove(index)) {
            Some(key) => {
                ring.keys.push_back(key.clone());
                ring.last_issued = Some(key.clone());
                Ok(key)
            },
            None => Err(ring
                .earliest_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(POLL_INTERVAL)
                .min(POLL_INTERVAL)),
        }
    }

    /// Get the next usable key, waiting for a cooldown to end if every key
    /// is resting.
    pub async fn get_available_api_key(&self) -> String {
        loop {
            match self.try_issue() {
                Ok(key) => return key,
                Err(wait) => {
                    tracing::debug!(
                        wait_ms = wait.as_millis() as u64,
                        "no API key available, waiting"
                    );
                    tokio::time::sleep(wait).await;
                },
            }
        }
    }

    /// Wait until at least one key is usable.
    pub async fn wait_for_any_key(&self) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut ring = self.ring();
                ring.release_expired(now);

                if ring.available() > 0 {
                    return;
                }

                ring.earliest_deadline()
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or(POLL_INTERVAL)
                    .min(POLL_INTERVAL)
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Put the most recently issued key on cooldown for `delay`.
    pub fn update_retry_delay(&self, delay: Duration) {
        let mut ring = self.ring();

        if let Some(key) = ring.last_issued.clone() {
            tracing::debug!(delay_secs = delay.as_secs(), "API key cooling down");
            ring.cooldowns.insert(key, Instant::now() + delay);
        }
    }
}
