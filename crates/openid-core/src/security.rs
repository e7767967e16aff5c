//! Canonical signing data and HMAC signatures.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::association::{Association, AssociationType};
use crate::codec::KeyValueForm;
use crate::encoding::{EncodingError, encode_name};
use crate::message::{Message, MessageKind, field};
use crate::parameter::{ParamKey, ParameterMap};

/// Default-namespace fields every positive assertion must sign.
pub const REQUIRED_SIGNED_FIELDS: [&str; 4] = [
    field::OP_ENDPOINT,
    field::RETURN_TO,
    field::RESPONSE_NONCE,
    field::ASSOC_HANDLE,
];

/// Signing/verification failure.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SecurityError {
    /// Signed list names a parameter the message does not carry.
    #[error("signed field `{0}` is not present in the message")]
    MissingSignedField(String),
    /// Message carries no signature or no signed list.
    #[error("message is not signed")]
    Unsigned,
    /// This kind of message is never signed.
    #[error("{0} messages cannot be signed")]
    NotSignable(MessageKind),
    /// MAC key rejected by the HMAC implementation.
    #[error("MAC key rejected")]
    InvalidKey,
    /// Signing data could not be encoded.
    #[error("signing data encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

/// Builds `name:value\n` lines for the signed fields, in list order.
pub fn signing_data(params: &ParameterMap) -> Result<String, SecurityError> {
    let mut out = String::new();
    for key in params.signed_fields() {
        let name = encode_name(key, params.namespaces())?;
        let value = params
            .get(key)
            .ok_or_else(|| SecurityError::MissingSignedField(name.clone()))?;
        KeyValueForm::write_pair(&mut out, &name, value)?;
    }
    Ok(out)
}

/// Base64 HMAC of `data` with the algorithm of `assoc_type`.
pub fn calculate_signature(
    assoc_type: AssociationType,
    key: &[u8],
    data: &[u8],
) -> Result<String, SecurityError> {
    let digest = match assoc_type {
        AssociationType::HmacSha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).map_err(|_| SecurityError::InvalidKey)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        AssociationType::HmacSha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).map_err(|_| SecurityError::InvalidKey)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(STANDARD.encode(digest))
}

/// Constant-time signature comparison.
#[must_use]
pub fn signatures_match(expected: &str, actual: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(actual.as_bytes()))
}

/// Signed list used when the caller did not choose one.
///
/// Core assertion fields that are present, then every extension namespace
/// declaration followed by its parameters.
#[must_use]
pub fn default_signed_fields(params: &ParameterMap) -> Vec<ParamKey> {
    let ns = params.default_namespace();
    let mut out: Vec<ParamKey> = [
        field::OP_ENDPOINT,
        field::CLAIMED_ID,
        field::IDENTITY,
        field::RETURN_TO,
        field::RESPONSE_NONCE,
        field::ASSOC_HANDLE,
    ]
    .into_iter()
    .map(|name| ParamKey::new(ns, name))
    .filter(|key| params.contains(key))
    .collect();
    for (_, uri) in params.namespaces().extensions() {
        out.push(ParamKey::declaration(uri));
        out.extend(
            params
                .namespace_params(uri)
                .map(|(name, _)| ParamKey::new(uri, name)),
        );
    }
    out
}

/// Signs `message` with `association`.
///
/// Sets `assoc_handle`, fills the default signed list when none is set, and
/// stores `sig`.
pub fn sign_message(message: &mut Message, association: &Association) -> Result<(), SecurityError> {
    if !message.kind().is_signable() {
        return Err(SecurityError::NotSignable(message.kind()));
    }
    message.set_assoc_handle(association.handle());
    let mut params = message.marshal();
    params.remove_default(field::SIG);
    if params.signed_fields().is_empty() {
        let signed = default_signed_fields(&params);
        params.set_signed_fields(signed);
    }
    let data = signing_data(&params)?;
    let signature = association.sign(data.as_bytes())?;
    params.set_default(field::SIG, signature);
    message.replace_params(params);
    Ok(())
}

/// Recomputes the signature of a received message.
///
/// Uses the parameters exactly as received. Returns `Ok(false)` on mismatch
/// or when the message names a different association handle.
pub fn verify_signature(message: &Message, association: &Association) -> Result<bool, SecurityError> {
    let signature = message.signature().ok_or(SecurityError::Unsigned)?;
    if message.params().signed_fields().is_empty() {
        return Err(SecurityError::Unsigned);
    }
    if message.assoc_handle() != Some(association.handle()) {
        tracing::warn!(
            expected = association.handle(),
            actual = message.assoc_handle().unwrap_or(""),
            "association handle mismatch"
        );
        return Ok(false);
    }
    let data = signing_data(message.params())?;
    let valid = association.verify(data.as_bytes(), signature)?;
    if !valid {
        tracing::warn!(handle = association.handle(), "signature mismatch");
    }
    Ok(valid)
}
