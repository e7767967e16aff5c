//! Identity provider flows: association, assertion signing, direct verification.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use time::OffsetDateTime;

use crate::association::{
    Association, AssociationError, AssociationManager, AssociationStore, AssociationType,
    SessionType,
};
use crate::config::ProtocolConfig;
use crate::key_exchange::{
    DhKeyPair, DhParameters, KeyExchangeError, decode_btwoc_base64, xor_secret,
};
use crate::message::{Message, MessageKind, field};
use crate::nonce::{NonceGenerator, RandomNonceGenerator};
use crate::security::{SecurityError, sign_message, verify_signature};
use crate::validation::{ValidationError, validate};

/// Provider-side failure that cannot be expressed as a protocol answer.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Operation got the wrong kind of message.
    #[error("expected {expected}, got {actual}")]
    UnexpectedKind {
        /// Kind the operation handles.
        expected: MessageKind,
        /// Kind received.
        actual: MessageKind,
    },
    /// Request broke a protocol rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Association could not be built.
    #[error(transparent)]
    Association(#[from] AssociationError),
    /// Diffie-Hellman exchange failed.
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    /// Signing failed.
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// OpenID provider endpoint state.
pub struct OpenIdProvider<S: AssociationStore> {
    endpoint: String,
    config: ProtocolConfig,
    associations: AssociationManager<S>,
    nonces: Arc<dyn NonceGenerator>,
}

impl<S: AssociationStore> OpenIdProvider<S> {
    /// Creates a provider answering at `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, store: S, config: ProtocolConfig) -> Self {
        let associations = AssociationManager::new(store, &config);
        Self {
            endpoint: endpoint.into(),
            config,
            associations,
            nonces: Arc::new(RandomNonceGenerator),
        }
    }

    /// Replaces the association manager, e.g. to inject a handle generator.
    #[must_use]
    pub fn with_associations(mut self, associations: AssociationManager<S>) -> Self {
        self.associations = associations;
        self
    }

    /// Replaces the nonce generator.
    #[must_use]
    pub fn with_nonce_generator(mut self, nonces: Arc<dyn NonceGenerator>) -> Self {
        self.nonces = nonces;
        self
    }

    /// Endpoint URL (`op_endpoint`).
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Association lifecycle.
    #[must_use]
    pub fn associations(&self) -> &AssociationManager<S> {
        &self.associations
    }

    /// Answers an `associate` request.
    ///
    /// Unknown, disabled or mismatched type pairs get an `unsupported-type`
    /// answer carrying the configured preference. Other rule violations are
    /// errors.
    pub fn associate(
        &self,
        request: &Message,
        now: OffsetDateTime,
    ) -> Result<Message, ProviderError> {
        expect_kind(request, MessageKind::AssociationRequest)?;
        let assoc_type = request.assoc_type().and_then(AssociationType::parse);
        let session_type = request.session_type().and_then(SessionType::parse);
        let (assoc_type, session_type) = match (assoc_type, session_type) {
            (Some(a), Some(s)) if s.is_compatible_with(a) && self.config.allows_session(s) => {
                (a, s)
            }
            _ => {
                tracing::debug!(
                    assoc_type = request.assoc_type().unwrap_or_default(),
                    session_type = request.session_type().unwrap_or_default(),
                    "unsupported association request"
                );
                return Ok(self.unsupported("unsupported association or session type"));
            }
        };
        validate(request)?;

        let exchange = match session_type.hash() {
            Some(hash) => {
                let params = DhParameters::from_base64(request.dh_modulus(), request.dh_gen())?;
                let consumer_public = decode_btwoc_base64(
                    request.dh_consumer_public().unwrap_or_default(),
                    field::DH_CONSUMER_PUBLIC,
                )?;
                let pair = DhKeyPair::generate(&params);
                let mask = pair.masking_secret(&consumer_public, hash)?;
                Some((pair, mask))
            }
            None => None,
        };

        let association = self
            .associations
            .build_association(assoc_type, &self.endpoint, now)?;
        let mut response = Message::association_response(
            association.handle(),
            assoc_type,
            session_type,
            association.expires_in(now),
        );
        match exchange {
            Some((pair, mask)) => {
                let masked = xor_secret(association.mac_key(), &mask)?;
                response.set_dh_server_public(pair.public_key_base64());
                response.set_enc_mac_key(STANDARD.encode(masked));
            }
            None => response.set_mac_key(STANDARD.encode(association.mac_key())),
        }
        Ok(response)
    }

    /// Signs a positive assertion.
    ///
    /// Uses the association the relying party named when it is still valid;
    /// otherwise signs with a fresh private association and reports the
    /// requested handle in `invalidate_handle`. Missing `op_endpoint` and
    /// `response_nonce` are filled in.
    pub fn sign_assertion(
        &self,
        assertion: &mut Message,
        now: OffsetDateTime,
    ) -> Result<Association, ProviderError> {
        expect_kind(assertion, MessageKind::PositiveAssertion)?;
        if assertion.op_endpoint().is_none() {
            assertion.set_op_endpoint(self.endpoint.as_str());
        }
        if assertion.response_nonce().is_none_or(str::is_empty) {
            assertion.set_response_nonce(self.nonces.next_nonce(now));
        }
        assertion.set_alias_prefix(&self.config.extension_alias_prefix);

        let requested = assertion
            .assoc_handle()
            .filter(|handle| !handle.is_empty())
            .map(str::to_owned);
        let shared = requested
            .as_deref()
            .and_then(|handle| self.associations.get_valid(handle, now))
            .filter(|association| !association.is_private());
        let association = match shared {
            Some(association) => association,
            None => {
                let private = self.associations.build_private_association(
                    self.config.preferred_association_type,
                    &self.endpoint,
                    now,
                )?;
                if let Some(handle) = requested {
                    tracing::debug!(
                        handle = handle.as_str(),
                        "requested association unusable, signing privately"
                    );
                    assertion.set_invalidate_handle(handle);
                }
                private
            }
        };
        sign_message(assertion, &association)?;
        Ok(association)
    }

    /// Answers a `check_authentication` request.
    ///
    /// Only private associations verify; each is consumed by its first
    /// verification.
    pub fn verify(&self, request: &Message, now: OffsetDateTime) -> Result<Message, ProviderError> {
        expect_kind(request, MessageKind::VerifyRequest)?;
        validate(request)?;
        let handle = request.assoc_handle().unwrap_or_default();

        let is_valid = match self.associations.get_valid(handle, now) {
            Some(association) if association.is_private() => {
                let mut original = request.clone();
                original.set_mode("id_res");
                self.associations.remove(handle);
                match verify_signature(&original, &association) {
                    Ok(valid) => valid,
                    Err(err) => {
                        tracing::warn!(handle, error = %err, "direct verification failed");
                        false
                    }
                }
            }
            Some(_) => {
                tracing::warn!(handle, "direct verification against a shared association");
                false
            }
            None => false,
        };

        let invalidate = request
            .invalidate_handle()
            .filter(|stale| !self.associations.is_valid(stale, now));
        Ok(Message::verify_response(is_valid, invalidate))
    }

    fn unsupported(&self, error: &str) -> Message {
        Message::association_error(
            error,
            Some((
                self.config.preferred_association_type,
                self.config.preferred_session_type,
            )),
        )
    }
}

fn expect_kind(message: &Message, expected: MessageKind) -> Result<(), ProviderError> {
    if message.kind() == expected {
        Ok(())
    } else {
        Err(ProviderError::UnexpectedKind {
            expected,
            actual: message.kind(),
        })
    }
}
