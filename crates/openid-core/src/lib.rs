//! OpenID 2.0 protocol core.
//!
//! Message encoding, Diffie-Hellman associations, signing and validation for
//! relying parties and providers. HTTP transport and discovery are left to
//! the host application.

pub mod association;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod encoding;
pub mod extensions;
pub mod key_exchange;
pub mod message;
pub mod namespace;
pub mod nonce;
pub mod parameter;
pub mod provider;
pub mod realm;
pub mod security;
pub mod validation;

use thiserror::Error;

pub use association::{
    Association, AssociationBuilder, AssociationError, AssociationManager, AssociationStore,
    AssociationType, IdentifierGenerator, InMemoryAssociationStore, RandomIdentifierGenerator,
    SessionType,
};
pub use codec::{KeyValueForm, MessageCodec, UrlForm};
pub use config::{ConfigError, ProtocolConfig};
pub use consumer::{
    AssertionError, AssertionVerifier, AssociationSession, SessionError, Verification,
    VerifiedAssertion,
};
pub use encoding::EncodingError;
pub use extensions::{Extension, ExtensionError, ExtensionFactory, ExtensionRegistry};
pub use key_exchange::{DhKeyPair, DhParameters, KeyExchangeError};
pub use message::{IDENTIFIER_SELECT, Message, MessageKind, OPENID2_NS, UnmarshallingError};
pub use namespace::NamespaceMap;
pub use nonce::{InMemoryNonceValidator, NonceGenerator, NonceValidator, RandomNonceGenerator};
pub use parameter::{ParamKey, ParameterMap};
pub use provider::{OpenIdProvider, ProviderError};
pub use security::SecurityError;
pub use validation::ValidationError;

/// Any failure surfaced by this crate.
#[derive(Debug, Error)]
pub enum OpenIdError {
    /// Wire encoding failure.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Parameters do not form a message.
    #[error(transparent)]
    Unmarshalling(#[from] UnmarshallingError),
    /// Protocol rule violated.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Signing or verification failure.
    #[error(transparent)]
    Security(#[from] SecurityError),
    /// Association construction failure.
    #[error(transparent)]
    Association(#[from] AssociationError),
    /// Diffie-Hellman failure.
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Association negotiation failure.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Assertion rejected.
    #[error(transparent)]
    Assertion(#[from] AssertionError),
    /// Provider-side failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Decodes wire text with `codec` and builds a message.
pub fn decode_message<C: MessageCodec>(
    codec: &C,
    input: &str,
    registry: &ExtensionRegistry,
) -> Result<Message, OpenIdError> {
    let params = codec.decode(input)?;
    Ok(Message::unmarshal(params, registry)?)
}

/// Marshals a message and encodes it with `codec`.
pub fn encode_message<C: MessageCodec>(codec: &C, message: &Message) -> Result<String, OpenIdError> {
    Ok(codec.encode(&message.marshal())?)
}
