//! Relying-party flows: establishing associations and checking assertions.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::association::{
    Association, AssociationError, AssociationStore, AssociationType, SessionType,
};
use crate::key_exchange::{
    DhKeyPair, DhParameters, KeyExchangeError, decode_btwoc_base64, xor_secret,
};
use crate::message::{Message, MessageKind, field};
use crate::nonce::NonceValidator;
use crate::security::{SecurityError, verify_signature};
use crate::validation::{ValidationError, validate};

/// Association negotiation failure.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SessionError {
    /// Session hash cannot carry the association's key.
    #[error("session type {session_type} cannot carry {assoc_type} keys")]
    Incompatible {
        /// Requested session type.
        session_type: SessionType,
        /// Requested association type.
        assoc_type: AssociationType,
    },
    /// Provider refused the pairing, possibly suggesting another.
    #[error("provider does not support the requested association: {error}")]
    Unsupported {
        /// Provider's explanation.
        error: String,
        /// Pairing the provider would accept.
        suggestion: Option<(AssociationType, SessionType)>,
    },
    /// Provider answered with a direct error.
    #[error("provider error: {0}")]
    Provider(String),
    /// Response is not an association response.
    #[error("unexpected {0} in association exchange")]
    UnexpectedKind(MessageKind),
    /// Response changed a negotiated value.
    #[error("response `{field}` is `{actual}`, requested `{expected}`")]
    Mismatch {
        /// Field name.
        field: &'static str,
        /// Requested value.
        expected: String,
        /// Returned value.
        actual: String,
    },
    /// Base64 payload could not be decoded.
    #[error("invalid base64 in `{0}`")]
    Base64(&'static str),
    /// `expires_in` does not fit a representable expiry.
    #[error("unusable expires_in `{0}`")]
    InvalidExpiry(String),
    /// Response broke a protocol rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Diffie-Hellman computation failed.
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    /// Resulting association is invalid.
    #[error(transparent)]
    Association(#[from] AssociationError),
}

/// One association exchange with a provider.
#[derive(Clone, Debug)]
pub struct AssociationSession {
    assoc_type: AssociationType,
    session_type: SessionType,
    key_pair: Option<DhKeyPair>,
    request: Message,
}

impl AssociationSession {
    /// Prepares the `associate` request.
    ///
    /// DH sessions draw a fresh key pair over `params` (the default group
    /// when `None`).
    pub fn new(
        assoc_type: AssociationType,
        session_type: SessionType,
        params: Option<&DhParameters>,
    ) -> Result<Self, SessionError> {
        if !session_type.is_compatible_with(assoc_type) {
            return Err(SessionError::Incompatible {
                session_type,
                assoc_type,
            });
        }
        let key_pair = session_type.is_dh().then(|| match params {
            Some(params) => DhKeyPair::generate(params),
            None => DhKeyPair::generate(&DhParameters::default()),
        });
        let request = Message::association_request(assoc_type, session_type, key_pair.as_ref());
        Ok(Self {
            assoc_type,
            session_type,
            key_pair,
            request,
        })
    }

    /// Request to send to the provider.
    #[must_use]
    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Requested association type.
    #[must_use]
    pub fn assoc_type(&self) -> AssociationType {
        self.assoc_type
    }

    /// Requested session type.
    #[must_use]
    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    /// Processes the provider's answer into an association owned by
    /// `op_endpoint`.
    pub fn complete(
        &self,
        response: &Message,
        op_endpoint: &str,
        now: OffsetDateTime,
    ) -> Result<Association, SessionError> {
        match response.kind() {
            MessageKind::AssociationResponse => {}
            MessageKind::AssociationError => {
                validate(response)?;
                let suggestion = response
                    .assoc_type()
                    .and_then(AssociationType::parse)
                    .zip(response.session_type().and_then(SessionType::parse));
                return Err(SessionError::Unsupported {
                    error: response.error().unwrap_or_default().to_owned(),
                    suggestion,
                });
            }
            MessageKind::DirectError => {
                return Err(SessionError::Provider(
                    response.error().unwrap_or_default().to_owned(),
                ));
            }
            other => return Err(SessionError::UnexpectedKind(other)),
        }
        validate(response)?;
        check_echo(field::ASSOC_TYPE, self.assoc_type.as_str(), response.assoc_type())?;
        check_echo(
            field::SESSION_TYPE,
            self.session_type.as_str(),
            response.session_type(),
        )?;

        let mac_key = match (&self.key_pair, self.session_type.hash()) {
            (Some(pair), Some(hash)) => {
                let server_public = decode_btwoc_base64(
                    response.dh_server_public().unwrap_or_default(),
                    field::DH_SERVER_PUBLIC,
                )?;
                let mask = pair.masking_secret(&server_public, hash)?;
                let masked = decode_base64(response.enc_mac_key(), field::ENC_MAC_KEY)?;
                xor_secret(&masked, &mask)?
            }
            _ => decode_base64(response.mac_key(), field::MAC_KEY)?,
        };
        let raw_expiry = response.expires_in().unwrap_or_default();
        let expires_in = raw_expiry
            .parse::<u64>()
            .ok()
            .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX))
            .ok_or_else(|| SessionError::InvalidExpiry(raw_expiry.to_owned()))?;
        let expires_at = now
            .checked_add(Duration::seconds(expires_in))
            .ok_or_else(|| SessionError::InvalidExpiry(raw_expiry.to_owned()))?;
        let association = Association::new(
            response.assoc_handle().unwrap_or_default(),
            self.assoc_type,
            mac_key,
            expires_at,
            op_endpoint,
            false,
        )?;
        tracing::debug!(
            handle = association.handle(),
            op_endpoint,
            expires_in,
            "association established"
        );
        Ok(association)
    }
}

fn check_echo(name: &'static str, expected: &str, actual: Option<&str>) -> Result<(), SessionError> {
    let actual = actual.unwrap_or_default();
    if actual == expected {
        Ok(())
    } else {
        Err(SessionError::Mismatch {
            field: name,
            expected: expected.to_owned(),
            actual: actual.to_owned(),
        })
    }
}

fn decode_base64(value: Option<&str>, name: &'static str) -> Result<Vec<u8>, SessionError> {
    STANDARD
        .decode(value.unwrap_or_default())
        .map_err(|_| SessionError::Base64(name))
}

/// Assertion rejected by the relying party.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum AssertionError {
    /// User cancelled at the provider.
    #[error("authentication cancelled")]
    Cancelled,
    /// Immediate request needs user interaction.
    #[error("provider needs user interaction")]
    SetupNeeded,
    /// Provider reported an error.
    #[error("provider error: {0}")]
    Provider(String),
    /// Message is not an assertion.
    #[error("unexpected {0} in authentication response")]
    UnexpectedKind(MessageKind),
    /// `return_to` does not describe the URL the response arrived at.
    #[error("return_to `{return_to}` does not match received url `{received}`")]
    ReturnToMismatch {
        /// Asserted `return_to`.
        return_to: String,
        /// URL the response arrived at.
        received: String,
    },
    /// Nonce is stale, malformed or replayed.
    #[error("response nonce rejected")]
    InvalidNonce,
    /// Stored association belongs to a different provider.
    #[error("association `{0}` was not issued by this provider")]
    ForeignAssociation(String),
    /// Signature does not verify.
    #[error("signature verification failed")]
    InvalidSignature,
    /// Assertion broke a protocol rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Signature could not be computed.
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// Assertion details that passed every check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedAssertion {
    /// Asserting provider endpoint.
    pub op_endpoint: String,
    /// Claimed identifier, absent for extension-only assertions.
    pub claimed_id: Option<String>,
    /// Provider-local identifier.
    pub identity: Option<String>,
}

impl VerifiedAssertion {
    fn from_message(message: &Message) -> Self {
        Self {
            op_endpoint: message.op_endpoint().unwrap_or_default().to_owned(),
            claimed_id: message.claimed_id().map(str::to_owned),
            identity: message.identity().map(str::to_owned),
        }
    }
}

/// Outcome of local assertion checking.
#[derive(Clone, Debug)]
pub enum Verification {
    /// Signature verified against a stored association.
    Verified(VerifiedAssertion),
    /// No usable association; send this `check_authentication` request.
    NeedsDirectVerification(Message),
}

/// Checks positive assertions received at the relying party.
pub struct AssertionVerifier<S: AssociationStore, N: NonceValidator> {
    associations: S,
    nonces: N,
}

impl<S: AssociationStore, N: NonceValidator> AssertionVerifier<S, N> {
    /// Creates a verifier over the associations established by this party.
    #[must_use]
    pub fn new(associations: S, nonces: N) -> Self {
        Self {
            associations,
            nonces,
        }
    }

    /// Association store.
    #[must_use]
    pub fn associations(&self) -> &S {
        &self.associations
    }

    /// Unexpired shared association to name in requests to `op_endpoint`.
    #[must_use]
    pub fn association_for(&self, op_endpoint: &str, now: OffsetDateTime) -> Option<Association> {
        self.associations
            .get_by_entity(op_endpoint)
            .filter(|association| !association.is_expired(now))
    }

    /// Runs the assertion through rule, return_to, nonce and signature checks.
    ///
    /// `received_url` is the full URL the response arrived at.
    pub fn verify(
        &self,
        message: &Message,
        received_url: &str,
        now: OffsetDateTime,
    ) -> Result<Verification, AssertionError> {
        match message.kind() {
            MessageKind::PositiveAssertion => {}
            MessageKind::Cancel => return Err(AssertionError::Cancelled),
            MessageKind::SetupNeeded => return Err(AssertionError::SetupNeeded),
            MessageKind::IndirectError => {
                return Err(AssertionError::Provider(
                    message.error().unwrap_or_default().to_owned(),
                ));
            }
            other => return Err(AssertionError::UnexpectedKind(other)),
        }
        validate(message)?;

        let return_to = message.return_to().unwrap_or_default();
        if !return_to_matches(return_to, received_url) {
            return Err(AssertionError::ReturnToMismatch {
                return_to: return_to.to_owned(),
                received: received_url.to_owned(),
            });
        }

        let op_endpoint = message.op_endpoint().unwrap_or_default();
        let nonce = message.response_nonce().unwrap_or_default();
        if !self.nonces.is_valid(op_endpoint, nonce, now) {
            return Err(AssertionError::InvalidNonce);
        }

        let handle = message.assoc_handle().unwrap_or_default();
        let Some(association) = self
            .associations
            .get(handle)
            .filter(|association| !association.is_expired(now))
        else {
            tracing::debug!(handle, op_endpoint, "no local association, verifying directly");
            return Ok(Verification::NeedsDirectVerification(
                Message::verify_request(message),
            ));
        };
        if association.entity() != op_endpoint {
            return Err(AssertionError::ForeignAssociation(handle.to_owned()));
        }
        if !verify_signature(message, &association)? {
            return Err(AssertionError::InvalidSignature);
        }
        Ok(Verification::Verified(VerifiedAssertion::from_message(message)))
    }

    /// Interprets the provider's `check_authentication` answer for `assertion`.
    pub fn complete_direct_verification(
        &self,
        assertion: &Message,
        response: &Message,
    ) -> Result<VerifiedAssertion, AssertionError> {
        match response.kind() {
            MessageKind::VerifyResponse => {}
            MessageKind::DirectError => {
                return Err(AssertionError::Provider(
                    response.error().unwrap_or_default().to_owned(),
                ));
            }
            other => return Err(AssertionError::UnexpectedKind(other)),
        }
        validate(response)?;
        if response.is_valid() != Some("true") {
            return Err(AssertionError::InvalidSignature);
        }
        // Only a confirmed answer may retire one of our handles.
        if let Some(stale) = response.invalidate_handle() {
            self.associations.invalidate(stale);
        }
        Ok(VerifiedAssertion::from_message(assertion))
    }
}

/// `return_to` and the received URL share scheme, authority and path, and
/// every `return_to` query pair is present in the received URL.
#[must_use]
pub fn return_to_matches(return_to: &str, received_url: &str) -> bool {
    let (Ok(expected), Ok(actual)) = (Url::parse(return_to), Url::parse(received_url)) else {
        return false;
    };
    if expected.scheme() != actual.scheme()
        || expected.host_str() != actual.host_str()
        || expected.port_or_known_default() != actual.port_or_known_default()
        || expected.path() != actual.path()
    {
        return false;
    }
    let received: Vec<_> = actual.query_pairs().collect();
    expected
        .query_pairs()
        .all(|pair| received.contains(&pair))
}
