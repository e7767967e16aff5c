//! Response nonces: generation and replay protection.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::validation::{is_valid_nonce_format, parse_nonce_timestamp};

/// Produces fresh `response_nonce` values.
pub trait NonceGenerator: Send + Sync {
    /// Nonce stamped with `now`.
    fn next_nonce(&self, now: OffsetDateTime) -> String;
}

/// Timestamp followed by 12 random URL-safe characters.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomNonceGenerator;

impl NonceGenerator for RandomNonceGenerator {
    fn next_nonce(&self, now: OffsetDateTime) -> String {
        let mut suffix = [0_u8; 9];
        rand::rng().fill_bytes(&mut suffix);
        format!("{}{}", format_timestamp(now), URL_SAFE_NO_PAD.encode(suffix))
    }
}

/// Formats `at` as `YYYY-MM-DDTHH:MM:SSZ` in UTC.
#[must_use]
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// Replay and freshness check for received nonces.
pub trait NonceValidator: Send + Sync {
    /// Accepts each `(issuer, nonce)` pair at most once, within the age window.
    fn is_valid(&self, issuer: &str, nonce: &str, now: OffsetDateTime) -> bool;
}

/// Replay cache keyed by `(issuer, nonce)`.
///
/// Entries live until their timestamp leaves the acceptance window and are
/// pruned on every check.
pub struct InMemoryNonceValidator {
    max_age: Duration,
    seen: Mutex<HashMap<(String, String), OffsetDateTime>>,
}

impl InMemoryNonceValidator {
    /// Creates a validator accepting nonces at most `max_age` old.
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Number of remembered nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().map_or(0, |guard| guard.len())
    }

    /// Returns true when nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NonceValidator for InMemoryNonceValidator {
    fn is_valid(&self, issuer: &str, nonce: &str, now: OffsetDateTime) -> bool {
        if !is_valid_nonce_format(nonce) {
            tracing::debug!(issuer, nonce, "malformed nonce");
            return false;
        }
        let Some(stamp) = parse_nonce_timestamp(nonce) else {
            return false;
        };
        if stamp > now + self.max_age {
            tracing::debug!(issuer, nonce, "nonce from the future");
            return false;
        }
        let cutoff = now - self.max_age;
        if stamp < cutoff {
            tracing::debug!(issuer, nonce, "expired nonce");
            return false;
        }
        let Ok(mut seen) = self.seen.lock() else {
            return false;
        };
        seen.retain(|_, at| *at >= cutoff);
        let key = (issuer.to_owned(), nonce.to_owned());
        if seen.contains_key(&key) {
            tracing::debug!(issuer, nonce, "replayed nonce");
            return false;
        }
        seen.insert(key, stamp);
        true
    }
}
