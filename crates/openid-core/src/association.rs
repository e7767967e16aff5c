//! Associations: shared MAC secrets between a relying party and a provider.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::config::ProtocolConfig;
use crate::key_exchange::SecretHash;
use crate::security::{SecurityError, calculate_signature, signatures_match};
use crate::validation::is_valid_handle;

/// MAC algorithm of an association.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AssociationType {
    /// HMAC-SHA1 with a 160-bit key.
    #[serde(rename = "HMAC-SHA1")]
    HmacSha1,
    /// HMAC-SHA256 with a 256-bit key.
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

impl AssociationType {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha1 => "HMAC-SHA1",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HMAC-SHA1" => Some(Self::HmacSha1),
            "HMAC-SHA256" => Some(Self::HmacSha256),
            _ => None,
        }
    }

    /// MAC key size in bits.
    #[must_use]
    pub fn key_bits(self) -> usize {
        match self {
            Self::HmacSha1 => 160,
            Self::HmacSha256 => 256,
        }
    }

    /// MAC key size in bytes.
    #[must_use]
    pub fn key_len(self) -> usize {
        self.key_bits() / 8
    }
}

impl Display for AssociationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the MAC key travels in the association response.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// MAC key in the clear (transport must be TLS).
    #[serde(rename = "no-encryption")]
    NoEncryption,
    /// MAC key masked with SHA-1 of the DH secret.
    #[serde(rename = "DH-SHA1")]
    DhSha1,
    /// MAC key masked with SHA-256 of the DH secret.
    #[serde(rename = "DH-SHA256")]
    DhSha256,
}

impl SessionType {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoEncryption => "no-encryption",
            Self::DhSha1 => "DH-SHA1",
            Self::DhSha256 => "DH-SHA256",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no-encryption" => Some(Self::NoEncryption),
            "DH-SHA1" => Some(Self::DhSha1),
            "DH-SHA256" => Some(Self::DhSha256),
            _ => None,
        }
    }

    /// Masking hash, `None` for `no-encryption`.
    #[must_use]
    pub fn hash(self) -> Option<SecretHash> {
        match self {
            Self::NoEncryption => None,
            Self::DhSha1 => Some(SecretHash::Sha1),
            Self::DhSha256 => Some(SecretHash::Sha256),
        }
    }

    /// Returns true for Diffie-Hellman sessions.
    #[must_use]
    pub fn is_dh(self) -> bool {
        self.hash().is_some()
    }

    /// DH hash output must be as long as the MAC key it masks.
    #[must_use]
    pub fn is_compatible_with(self, assoc_type: AssociationType) -> bool {
        self.hash()
            .is_none_or(|hash| hash.output_len() == assoc_type.key_len())
    }
}

impl Display for SessionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Association construction error.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum AssociationError {
    /// MAC key does not match the association type.
    #[error("{assoc_type} requires a {expected}-bit MAC key, got {actual} bits")]
    InvalidKeySize {
        /// Association type.
        assoc_type: AssociationType,
        /// Required size in bits.
        expected: usize,
        /// Actual size in bits.
        actual: usize,
    },
    /// Handle violates the charset/length rule.
    #[error("invalid association handle `{0}`")]
    InvalidHandle(String),
}

/// Shared MAC secret plus metadata. Immutable once built.
#[derive(Clone)]
pub struct Association {
    handle: String,
    assoc_type: AssociationType,
    mac_key: Vec<u8>,
    expires_at: OffsetDateTime,
    entity: String,
    private: bool,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("handle", &self.handle)
            .field("assoc_type", &self.assoc_type)
            .field("mac_key", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("entity", &self.entity)
            .field("private", &self.private)
            .finish()
    }
}

impl Association {
    /// Builds an association, enforcing handle format and key size.
    pub fn new(
        handle: impl Into<String>,
        assoc_type: AssociationType,
        mac_key: Vec<u8>,
        expires_at: OffsetDateTime,
        entity: impl Into<String>,
        private: bool,
    ) -> Result<Self, AssociationError> {
        let handle = handle.into();
        if !is_valid_handle(&handle) {
            return Err(AssociationError::InvalidHandle(handle));
        }
        if mac_key.len() != assoc_type.key_len() {
            return Err(AssociationError::InvalidKeySize {
                assoc_type,
                expected: assoc_type.key_bits(),
                actual: mac_key.len() * 8,
            });
        }
        Ok(Self {
            handle,
            assoc_type,
            mac_key,
            expires_at,
            entity: entity.into(),
            private,
        })
    }

    /// Association handle.
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// MAC algorithm.
    #[must_use]
    pub fn assoc_type(&self) -> AssociationType {
        self.assoc_type
    }

    /// Raw MAC key.
    #[must_use]
    pub fn mac_key(&self) -> &[u8] {
        &self.mac_key
    }

    /// Expiration instant.
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Endpoint URL or realm this association belongs to.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Private associations are only used by a provider to verify its own
    /// signatures.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Returns true once `now` is past the expiration instant.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Whole seconds left, clamped at zero.
    #[must_use]
    pub fn expires_in(&self, now: OffsetDateTime) -> i64 {
        (self.expires_at - now).whole_seconds().max(0)
    }

    /// Base64 HMAC of `data` under this association.
    pub fn sign(&self, data: &[u8]) -> Result<String, SecurityError> {
        calculate_signature(self.assoc_type, &self.mac_key, data)
    }

    /// Constant-time check of a base64 signature.
    pub fn verify(&self, data: &[u8], signature: &str) -> Result<bool, SecurityError> {
        Ok(signatures_match(&self.sign(data)?, signature))
    }
}

/// Source of unguessable association handles.
pub trait IdentifierGenerator: Send + Sync {
    /// Returns a fresh handle (printable ASCII, no whitespace, ≤255 chars).
    fn generate_handle(&self, now: OffsetDateTime) -> String;
}

/// Timestamp-prefixed random handles.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomIdentifierGenerator;

impl IdentifierGenerator for RandomIdentifierGenerator {
    fn generate_handle(&self, now: OffsetDateTime) -> String {
        let mut raw = [0_u8; 18];
        rand::rng().fill_bytes(&mut raw);
        format!("{}-{}", now.unix_timestamp(), URL_SAFE_NO_PAD.encode(raw))
    }
}

/// Creates associations with fresh handles and MAC keys.
#[derive(Clone)]
pub struct AssociationBuilder {
    generator: Arc<dyn IdentifierGenerator>,
}

impl Default for AssociationBuilder {
    fn default() -> Self {
        Self::new(Arc::new(RandomIdentifierGenerator))
    }
}

impl AssociationBuilder {
    /// Creates a builder around a handle generator.
    #[must_use]
    pub fn new(generator: Arc<dyn IdentifierGenerator>) -> Self {
        Self { generator }
    }

    /// Builds an association expiring `lifetime` after `now`.
    pub fn build_association(
        &self,
        assoc_type: AssociationType,
        lifetime: Duration,
        entity: &str,
        private: bool,
        now: OffsetDateTime,
    ) -> Result<Association, AssociationError> {
        Association::new(
            self.generator.generate_handle(now),
            assoc_type,
            generate_mac_key(assoc_type),
            now + lifetime,
            entity,
            private,
        )
    }
}

/// Random MAC key sized for `assoc_type`.
#[must_use]
pub fn generate_mac_key(assoc_type: AssociationType) -> Vec<u8> {
    let mut key = vec![0_u8; assoc_type.key_len()];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Pluggable association persistence.
pub trait AssociationStore: Send + Sync {
    /// Stores an association under its handle.
    fn add(&self, association: Association);
    /// Looks up by handle.
    fn get(&self, handle: &str) -> Option<Association>;
    /// Latest-expiring shared association owned by `entity`.
    fn get_by_entity(&self, entity: &str) -> Option<Association>;
    /// Drops an association that must no longer be used.
    fn invalidate(&self, handle: &str);
    /// Removes and returns an association.
    fn remove(&self, handle: &str) -> Option<Association>;
}

/// Reference store keeping everything in memory.
#[derive(Default)]
pub struct InMemoryAssociationStore {
    by_handle: Mutex<HashMap<String, Association>>,
}

impl InMemoryAssociationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_handle.lock().map_or(0, |guard| guard.len())
    }

    /// Returns true when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AssociationStore for InMemoryAssociationStore {
    fn add(&self, association: Association) {
        if let Ok(mut guard) = self.by_handle.lock() {
            guard.insert(association.handle.clone(), association);
        }
    }

    fn get(&self, handle: &str) -> Option<Association> {
        self.by_handle.lock().ok()?.get(handle).cloned()
    }

    fn get_by_entity(&self, entity: &str) -> Option<Association> {
        self.by_handle
            .lock()
            .ok()?
            .values()
            .filter(|a| !a.private && a.entity == entity)
            .max_by_key(|a| a.expires_at)
            .cloned()
    }

    fn invalidate(&self, handle: &str) {
        if self.remove(handle).is_some() {
            tracing::debug!(handle, "association invalidated");
        }
    }

    fn remove(&self, handle: &str) -> Option<Association> {
        self.by_handle.lock().ok()?.remove(handle)
    }
}

/// Association lifecycle on top of a store.
pub struct AssociationManager<S: AssociationStore> {
    store: S,
    builder: AssociationBuilder,
    lifetime: Duration,
    private_lifetime: Duration,
}

impl<S: AssociationStore> AssociationManager<S> {
    /// Creates a manager using lifetimes from `config`.
    #[must_use]
    pub fn new(store: S, config: &ProtocolConfig) -> Self {
        Self::with_builder(store, config, AssociationBuilder::default())
    }

    /// Creates a manager with a custom builder.
    #[must_use]
    pub fn with_builder(store: S, config: &ProtocolConfig, builder: AssociationBuilder) -> Self {
        Self {
            store,
            builder,
            lifetime: config.association_lifetime(),
            private_lifetime: config.private_association_lifetime(),
        }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Builds and stores a shared association for `entity`.
    pub fn build_association(
        &self,
        assoc_type: AssociationType,
        entity: &str,
        now: OffsetDateTime,
    ) -> Result<Association, AssociationError> {
        self.build(assoc_type, entity, false, now)
    }

    /// Builds and stores a provider-only association.
    pub fn build_private_association(
        &self,
        assoc_type: AssociationType,
        entity: &str,
        now: OffsetDateTime,
    ) -> Result<Association, AssociationError> {
        self.build(assoc_type, entity, true, now)
    }

    fn build(
        &self,
        assoc_type: AssociationType,
        entity: &str,
        private: bool,
        now: OffsetDateTime,
    ) -> Result<Association, AssociationError> {
        let lifetime = if private {
            self.private_lifetime
        } else {
            self.lifetime
        };
        let association = self
            .builder
            .build_association(assoc_type, lifetime, entity, private, now)?;
        tracing::debug!(
            handle = association.handle(),
            assoc_type = %assoc_type,
            private,
            "association created"
        );
        self.store.add(association.clone());
        Ok(association)
    }

    /// Looks up an association regardless of expiry.
    #[must_use]
    pub fn get(&self, handle: &str) -> Option<Association> {
        self.store.get(handle)
    }

    /// Returns the association when it exists and has not expired.
    ///
    /// Expired associations are dropped from the store on the way.
    #[must_use]
    pub fn get_valid(&self, handle: &str, now: OffsetDateTime) -> Option<Association> {
        let association = self.store.get(handle)?;
        if association.is_expired(now) {
            self.store.invalidate(handle);
            return None;
        }
        Some(association)
    }

    /// Returns true for a known, unexpired handle.
    #[must_use]
    pub fn is_valid(&self, handle: &str, now: OffsetDateTime) -> bool {
        self.get_valid(handle, now).is_some()
    }

    /// Invalidates a handle.
    pub fn invalidate(&self, handle: &str) {
        self.store.invalidate(handle);
    }

    /// Removes and returns an association.
    pub fn remove(&self, handle: &str) -> Option<Association> {
        self.store.remove(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_900_000_000).expect("timestamp")
    }

    struct FixedGenerator(&'static str);

    impl IdentifierGenerator for FixedGenerator {
        fn generate_handle(&self, _now: OffsetDateTime) -> String {
            self.0.to_owned()
        }
    }

    #[test]
    fn generated_key_matches_type_size() {
        for assoc_type in [AssociationType::HmacSha1, AssociationType::HmacSha256] {
            let builder = AssociationBuilder::default();
            let association = builder
                .build_association(assoc_type, Duration::hours(1), "https://op", false, now())
                .expect("build");
            assert_eq!(association.mac_key().len() * 8, assoc_type.key_bits());
            assert_eq!(association.expires_at(), now() + Duration::hours(1));
        }
    }

    #[test]
    fn wrong_key_size_is_rejected() {
        let err = Association::new(
            "h",
            AssociationType::HmacSha256,
            vec![0; 20],
            now(),
            "https://op",
            false,
        )
        .expect_err("must fail");
        assert_eq!(
            err,
            AssociationError::InvalidKeySize {
                assoc_type: AssociationType::HmacSha256,
                expected: 256,
                actual: 160,
            }
        );
    }

    #[test]
    fn handle_with_whitespace_is_rejected() {
        let err = Association::new(
            "bad handle",
            AssociationType::HmacSha1,
            vec![0; 20],
            now(),
            "https://op",
            false,
        )
        .expect_err("must fail");
        assert!(matches!(err, AssociationError::InvalidHandle(_)));
    }

    #[test]
    fn store_serializes_concurrent_access() {
        let store = InMemoryAssociationStore::new();
        let builder = AssociationBuilder::default();
        let associations: Vec<Association> = (0..8)
            .map(|_| {
                builder
                    .build_association(
                        AssociationType::HmacSha1,
                        Duration::hours(1),
                        "https://op",
                        false,
                        now(),
                    )
                    .expect("build")
            })
            .collect();
        std::thread::scope(|scope| {
            for (idx, association) in associations.iter().enumerate() {
                let store = &store;
                scope.spawn(move || {
                    store.add(association.clone());
                    assert!(store.get(association.handle()).is_some());
                    if idx % 2 == 1 {
                        store.invalidate(association.handle());
                        assert!(store.get(association.handle()).is_none());
                    }
                });
            }
        });
        assert_eq!(store.len(), 4);
        for (idx, association) in associations.iter().enumerate() {
            assert_eq!(store.get(association.handle()).is_some(), idx % 2 == 0);
        }
        assert!(store.get_by_entity("https://op").is_some());
    }

    #[test]
    fn session_compatibility() {
        assert!(SessionType::DhSha1.is_compatible_with(AssociationType::HmacSha1));
        assert!(!SessionType::DhSha1.is_compatible_with(AssociationType::HmacSha256));
        assert!(SessionType::DhSha256.is_compatible_with(AssociationType::HmacSha256));
        assert!(SessionType::NoEncryption.is_compatible_with(AssociationType::HmacSha1));
    }

    #[test]
    fn random_handles_are_valid_and_distinct() {
        let generator = RandomIdentifierGenerator;
        let a = generator.generate_handle(now());
        let b = generator.generate_handle(now());
        assert!(is_valid_handle(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn manager_expiry_and_invalidation() {
        let config = ProtocolConfig::default();
        let builder = AssociationBuilder::new(Arc::new(FixedGenerator("fixed-handle")));
        let manager =
            AssociationManager::with_builder(InMemoryAssociationStore::new(), &config, builder);
        let association = manager
            .build_association(AssociationType::HmacSha256, "https://op", now())
            .expect("build");
        assert_eq!(association.handle(), "fixed-handle");
        assert!(manager.is_valid("fixed-handle", now()));
        assert!(!manager.is_valid("unknown", now()));

        let later = association.expires_at() + Duration::seconds(1);
        assert!(!manager.is_valid("fixed-handle", later));
        assert!(manager.store().is_empty());

        manager
            .build_association(AssociationType::HmacSha256, "https://op", now())
            .expect("build");
        manager.invalidate("fixed-handle");
        assert!(manager.get("fixed-handle").is_none());
    }

    #[test]
    fn get_by_entity_skips_private_associations() {
        let store = InMemoryAssociationStore::new();
        let shared = Association::new(
            "shared",
            AssociationType::HmacSha1,
            vec![1; 20],
            now(),
            "https://op",
            false,
        )
        .expect("shared");
        let private = Association::new(
            "private",
            AssociationType::HmacSha1,
            vec![2; 20],
            now() + Duration::hours(2),
            "https://op",
            true,
        )
        .expect("private");
        store.add(shared);
        store.add(private);
        let found = store.get_by_entity("https://op").expect("found");
        assert_eq!(found.handle(), "shared");
        assert!(store.get_by_entity("https://other").is_none());
    }

    #[test]
    fn debug_output_hides_mac_key() {
        let association = Association::new(
            "h",
            AssociationType::HmacSha1,
            vec![0xAB; 20],
            now(),
            "https://op",
            false,
        )
        .expect("association");
        let rendered = format!("{association:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("171, 171"));
    }
}
