//! Protocol rule checks for decoded and constructed messages.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::association::{AssociationType, SessionType};
use crate::extensions::ExtensionError;
use crate::key_exchange::decode_btwoc_base64;
use crate::message::{Message, MessageKind, OPENID2_NS, UNSUPPORTED_TYPE, field};
use crate::realm;

/// Longest handle or nonce accepted.
pub const MAX_TOKEN_LEN: usize = 255;

/// Length of the timestamp prefix of a nonce.
pub const NONCE_TIMESTAMP_LEN: usize = 20;

/// A message broke a protocol rule.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ValidationError {
    /// `ns` is absent or not OpenID 2.0.
    #[error("unsupported protocol namespace `{0}`")]
    UnsupportedNamespace(String),
    /// Required field is absent.
    #[error("{kind} is missing required field `{field}`")]
    MissingField {
        /// Message kind.
        kind: MessageKind,
        /// Field name.
        field: &'static str,
    },
    /// Field must not appear in this context.
    #[error("{context} should not contain `{field}`")]
    ShouldNotContain {
        /// Where the field is forbidden.
        context: String,
        /// Field name.
        field: &'static str,
    },
    /// Field value is malformed or unknown.
    #[error("invalid value `{value}` for `{field}`")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
    /// Only one of `claimed_id` / `identity` is present.
    #[error("`claimed_id` and `identity` must both be present or both be absent")]
    IdentifierMismatch,
    /// Authentication request carries neither `return_to` nor `realm`.
    #[error("authentication request needs `return_to` or `realm`")]
    MissingReturnToOrRealm,
    /// `return_to` lies outside `realm`.
    #[error("return_to `{return_to}` does not match realm `{realm}`")]
    ReturnToMismatch {
        /// Realm.
        realm: String,
        /// Return URL.
        return_to: String,
    },
    /// Realm is not a well-formed pattern.
    #[error("invalid realm `{0}`")]
    InvalidRealm(String),
    /// Field is required to be covered by the signature.
    #[error("field `{0}` must be signed")]
    UnsignedField(&'static str),
    /// Decoded MAC key length differs from the association type.
    #[error("{field} decodes to {actual} bytes, {assoc_type} needs {expected}")]
    InvalidMacKeyLength {
        /// `mac_key` or `enc_mac_key`.
        field: &'static str,
        /// Association type.
        assoc_type: AssociationType,
        /// Expected length in bytes.
        expected: usize,
        /// Decoded length in bytes.
        actual: usize,
    },
    /// Session hash cannot mask the association's MAC key.
    #[error("session type {session_type} cannot carry {assoc_type} keys")]
    IncompatibleSession {
        /// Session type.
        session_type: SessionType,
        /// Association type.
        assoc_type: AssociationType,
    },
    /// Nonce breaks the format rule.
    #[error("malformed response nonce `{0}`")]
    InvalidNonce(String),
    /// Handle breaks the format rule.
    #[error("malformed association handle in `{field}`: `{value}`")]
    InvalidHandle {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
    /// An attached extension rejected its payload.
    #[error("extension `{uri}`: {source}")]
    Extension {
        /// Extension namespace.
        uri: String,
        /// Cause.
        source: ExtensionError,
    },
}

/// Checks every rule for the message's kind, stopping at the first failure.
pub fn validate(message: &Message) -> Result<(), ValidationError> {
    match message.namespace() {
        Some(OPENID2_NS) => {}
        other => {
            return Err(ValidationError::UnsupportedNamespace(
                other.unwrap_or_default().to_owned(),
            ));
        }
    }
    match message.kind() {
        MessageKind::AssociationRequest => validate_association_request(message)?,
        MessageKind::AssociationResponse => validate_association_response(message)?,
        MessageKind::AssociationError => validate_association_error(message)?,
        MessageKind::CheckidSetup | MessageKind::CheckidImmediate => {
            validate_auth_request(message)?;
        }
        MessageKind::PositiveAssertion | MessageKind::VerifyRequest => {
            validate_assertion(message)?;
        }
        MessageKind::VerifyResponse => validate_verify_response(message)?,
        MessageKind::IndirectError | MessageKind::DirectError => {
            require(message, field::ERROR)?;
        }
        MessageKind::Cancel | MessageKind::SetupNeeded => {}
    }
    for extension in message.extensions() {
        extension
            .validate()
            .map_err(|source| ValidationError::Extension {
                uri: extension.type_uri().to_owned(),
                source,
            })?;
    }
    Ok(())
}

/// Handle rule: 1..=255 printable, non-whitespace ASCII characters.
#[must_use]
pub fn is_valid_handle(handle: &str) -> bool {
    !handle.is_empty() && handle.len() <= MAX_TOKEN_LEN && is_printable_ascii(handle)
}

/// Nonce rule: handle charset plus a leading `YYYY-MM-DDTHH:MM:SSZ` stamp.
#[must_use]
pub fn is_valid_nonce_format(nonce: &str) -> bool {
    nonce.len() <= MAX_TOKEN_LEN
        && is_printable_ascii(nonce)
        && parse_nonce_timestamp(nonce).is_some()
}

/// Parses the timestamp prefix of a nonce.
#[must_use]
pub fn parse_nonce_timestamp(nonce: &str) -> Option<OffsetDateTime> {
    let stamp = nonce.get(..NONCE_TIMESTAMP_LEN)?;
    if !stamp.ends_with('Z') {
        return None;
    }
    OffsetDateTime::parse(stamp, &Rfc3339).ok()
}

fn is_printable_ascii(text: &str) -> bool {
    text.bytes().all(|b| (33..=126).contains(&b))
}

fn require<'a>(message: &'a Message, name: &'static str) -> Result<&'a str, ValidationError> {
    message.field(name).ok_or(ValidationError::MissingField {
        kind: message.kind(),
        field: name,
    })
}

fn forbid(message: &Message, context: &str, names: &[&'static str]) -> Result<(), ValidationError> {
    match names.iter().find(|name| message.field(name).is_some()) {
        Some(name) => Err(ValidationError::ShouldNotContain {
            context: context.to_owned(),
            field: *name,
        }),
        None => Ok(()),
    }
}

fn check_handle(message: &Message, name: &'static str) -> Result<(), ValidationError> {
    match message.field(name) {
        Some(value) if !is_valid_handle(value) => Err(ValidationError::InvalidHandle {
            field: name,
            value: value.to_owned(),
        }),
        _ => Ok(()),
    }
}

fn parse_types(message: &Message) -> Result<(AssociationType, SessionType), ValidationError> {
    let assoc = require(message, field::ASSOC_TYPE)?;
    let assoc_type = AssociationType::parse(assoc).ok_or_else(|| ValidationError::InvalidValue {
        field: field::ASSOC_TYPE,
        value: assoc.to_owned(),
    })?;
    let session = require(message, field::SESSION_TYPE)?;
    let session_type = SessionType::parse(session).ok_or_else(|| ValidationError::InvalidValue {
        field: field::SESSION_TYPE,
        value: session.to_owned(),
    })?;
    if !session_type.is_compatible_with(assoc_type) {
        return Err(ValidationError::IncompatibleSession {
            session_type,
            assoc_type,
        });
    }
    Ok((assoc_type, session_type))
}

fn check_btwoc(message: &Message, name: &'static str) -> Result<(), ValidationError> {
    if let Some(value) = message.field(name)
        && decode_btwoc_base64(value, name).is_err()
    {
        return Err(ValidationError::InvalidValue {
            field: name,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn check_key_length(
    message: &Message,
    name: &'static str,
    assoc_type: AssociationType,
) -> Result<(), ValidationError> {
    let value = require(message, name)?;
    let decoded = STANDARD
        .decode(value)
        .map_err(|_| ValidationError::InvalidValue {
            field: name,
            value: value.to_owned(),
        })?;
    if decoded.len() != assoc_type.key_len() {
        return Err(ValidationError::InvalidMacKeyLength {
            field: name,
            assoc_type,
            expected: assoc_type.key_len(),
            actual: decoded.len(),
        });
    }
    Ok(())
}

fn validate_association_request(message: &Message) -> Result<(), ValidationError> {
    let (_, session_type) = parse_types(message)?;
    if session_type.is_dh() {
        require(message, field::DH_CONSUMER_PUBLIC)?;
        check_btwoc(message, field::DH_CONSUMER_PUBLIC)?;
        check_btwoc(message, field::DH_MODULUS)?;
        check_btwoc(message, field::DH_GEN)?;
    } else {
        forbid(
            message,
            "no-encryption association request",
            &[field::DH_MODULUS, field::DH_GEN, field::DH_CONSUMER_PUBLIC],
        )?;
    }
    Ok(())
}

fn validate_association_response(message: &Message) -> Result<(), ValidationError> {
    let (assoc_type, session_type) = parse_types(message)?;
    let handle = require(message, field::ASSOC_HANDLE)?;
    if !is_valid_handle(handle) {
        return Err(ValidationError::InvalidHandle {
            field: field::ASSOC_HANDLE,
            value: handle.to_owned(),
        });
    }
    let expires_in = require(message, field::EXPIRES_IN)?;
    if expires_in.parse::<u64>().is_err() {
        return Err(ValidationError::InvalidValue {
            field: field::EXPIRES_IN,
            value: expires_in.to_owned(),
        });
    }
    if session_type.is_dh() {
        forbid(message, "DH association response", &[field::MAC_KEY])?;
        require(message, field::DH_SERVER_PUBLIC)?;
        check_btwoc(message, field::DH_SERVER_PUBLIC)?;
        check_key_length(message, field::ENC_MAC_KEY, assoc_type)?;
    } else {
        forbid(
            message,
            "no-encryption association response",
            &[field::DH_SERVER_PUBLIC, field::ENC_MAC_KEY],
        )?;
        check_key_length(message, field::MAC_KEY, assoc_type)?;
    }
    Ok(())
}

fn validate_association_error(message: &Message) -> Result<(), ValidationError> {
    require(message, field::ERROR)?;
    let code = require(message, field::ERROR_CODE)?;
    if code != UNSUPPORTED_TYPE {
        return Err(ValidationError::InvalidValue {
            field: field::ERROR_CODE,
            value: code.to_owned(),
        });
    }
    if let Some(value) = message.session_type()
        && SessionType::parse(value).is_none()
    {
        return Err(ValidationError::InvalidValue {
            field: field::SESSION_TYPE,
            value: value.to_owned(),
        });
    }
    if let Some(value) = message.assoc_type()
        && AssociationType::parse(value).is_none()
    {
        return Err(ValidationError::InvalidValue {
            field: field::ASSOC_TYPE,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn check_identifiers(message: &Message) -> Result<(), ValidationError> {
    if message.claimed_id().is_some() != message.identity().is_some() {
        return Err(ValidationError::IdentifierMismatch);
    }
    Ok(())
}

fn validate_auth_request(message: &Message) -> Result<(), ValidationError> {
    check_identifiers(message)?;
    let return_to = message.return_to();
    let realm = message.realm();
    if return_to.is_none() && realm.is_none() {
        return Err(ValidationError::MissingReturnToOrRealm);
    }
    if let Some(realm) = realm {
        if !realm::is_valid(realm) {
            return Err(ValidationError::InvalidRealm(realm.to_owned()));
        }
        if let Some(return_to) = return_to
            && !realm::matches_return_to(realm, return_to)
        {
            return Err(ValidationError::ReturnToMismatch {
                realm: realm.to_owned(),
                return_to: return_to.to_owned(),
            });
        }
    }
    check_handle(message, field::ASSOC_HANDLE)
}

fn validate_assertion(message: &Message) -> Result<(), ValidationError> {
    require(message, field::OP_ENDPOINT)?;
    require(message, field::RETURN_TO)?;
    let nonce = require(message, field::RESPONSE_NONCE)?;
    if !is_valid_nonce_format(nonce) {
        return Err(ValidationError::InvalidNonce(nonce.to_owned()));
    }
    let handle = require(message, field::ASSOC_HANDLE)?;
    if !is_valid_handle(handle) {
        return Err(ValidationError::InvalidHandle {
            field: field::ASSOC_HANDLE,
            value: handle.to_owned(),
        });
    }
    if message.signed_fields().is_empty() {
        return Err(ValidationError::MissingField {
            kind: message.kind(),
            field: "signed",
        });
    }
    require(message, field::SIG)?;
    check_identifiers(message)?;

    let mut must_sign = vec![
        field::OP_ENDPOINT,
        field::RETURN_TO,
        field::RESPONSE_NONCE,
        field::ASSOC_HANDLE,
    ];
    if message.claimed_id().is_some() {
        must_sign.extend([field::CLAIMED_ID, field::IDENTITY]);
    }
    if let Some(name) = must_sign.into_iter().find(|name| !message.is_field_signed(name)) {
        return Err(ValidationError::UnsignedField(name));
    }
    check_handle(message, field::INVALIDATE_HANDLE)
}

fn validate_verify_response(message: &Message) -> Result<(), ValidationError> {
    let is_valid = require(message, field::IS_VALID)?;
    if is_valid != "true" && is_valid != "false" {
        return Err(ValidationError::InvalidValue {
            field: field::IS_VALID,
            value: is_valid.to_owned(),
        });
    }
    check_handle(message, field::INVALIDATE_HANDLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_exchange::{DhKeyPair, DhParameters};
    use crate::parameter::ParamKey;

    fn signed_assertion() -> Message {
        let mut message = Message::positive_assertion(
            "https://op.example.com/server",
            "https://rp.example.com/return",
            "2030-01-01T00:00:00Zxyz",
            "handle-1",
        );
        message.set_field(field::SIG, "c2ln");
        let signed = [
            field::OP_ENDPOINT,
            field::RETURN_TO,
            field::RESPONSE_NONCE,
            field::ASSOC_HANDLE,
        ]
        .into_iter()
        .map(|name| ParamKey::new(OPENID2_NS, name))
        .collect();
        let mut params = message.params().clone();
        params.set_signed_fields(signed);
        message.replace_params(params);
        message
    }

    #[test]
    fn handle_charset_and_length() {
        assert!(is_valid_handle("abc-123"));
        assert!(!is_valid_handle(""));
        assert!(!is_valid_handle("has space"));
        assert!(!is_valid_handle("tab\there"));
        assert!(!is_valid_handle("ünïcode"));
        assert!(is_valid_handle(&"a".repeat(255)));
        assert!(!is_valid_handle(&"a".repeat(256)));
    }

    #[test]
    fn nonce_format() {
        assert!(is_valid_nonce_format("2005-05-15T17:11:51ZUNIQUE"));
        assert!(is_valid_nonce_format("2005-05-15T17:11:51Z"));
        assert!(!is_valid_nonce_format("2005-05-15T17:11:51+00:00x"));
        assert!(!is_valid_nonce_format("2005-13-15T17:11:51Zabc"));
        assert!(!is_valid_nonce_format("short"));
        assert!(!is_valid_nonce_format("2005-05-15T17:11:51Z has space"));
        assert_eq!(
            parse_nonce_timestamp("2005-05-15T17:11:51Zabc").map(|t| t.unix_timestamp()),
            Some(1_116_177_111)
        );
    }

    #[test]
    fn wrong_namespace_is_rejected() {
        let mut message = Message::cancel();
        let mut params =
            crate::parameter::ParameterMap::with_default_namespace("http://openid.net/signon/1.1");
        params.set_default(field::MODE, "cancel");
        message.replace_params(params);
        assert!(matches!(
            validate(&message),
            Err(ValidationError::UnsupportedNamespace(_))
        ));
    }

    #[test]
    fn no_encryption_request_rejects_dh_fields() {
        let pair = DhKeyPair::generate(&DhParameters::default());
        let message = Message::association_request(
            AssociationType::HmacSha256,
            SessionType::NoEncryption,
            Some(&pair),
        );
        let err = validate(&message).expect_err("must fail");
        assert!(err.to_string().contains("should not contain"));
    }

    #[test]
    fn dh_request_requires_public_key() {
        let message =
            Message::association_request(AssociationType::HmacSha1, SessionType::DhSha1, None);
        assert_eq!(
            validate(&message),
            Err(ValidationError::MissingField {
                kind: MessageKind::AssociationRequest,
                field: field::DH_CONSUMER_PUBLIC,
            })
        );
    }

    #[test]
    fn mismatched_session_hash_is_rejected() {
        let pair = DhKeyPair::generate(&DhParameters::default());
        let message = Message::association_request(
            AssociationType::HmacSha256,
            SessionType::DhSha1,
            Some(&pair),
        );
        assert!(matches!(
            validate(&message),
            Err(ValidationError::IncompatibleSession { .. })
        ));
    }

    #[test]
    fn response_mac_key_length_is_checked() {
        let mut message = Message::association_response(
            "h",
            AssociationType::HmacSha256,
            SessionType::NoEncryption,
            3600,
        );
        message.set_mac_key(STANDARD.encode([0_u8; 20]));
        assert!(matches!(
            validate(&message),
            Err(ValidationError::InvalidMacKeyLength { expected: 32, actual: 20, .. })
        ));
        message.set_mac_key(STANDARD.encode([0_u8; 32]));
        assert_eq!(validate(&message), Ok(()));
    }

    #[test]
    fn association_error_needs_known_code() {
        let message = Message::association_error(
            "nope",
            Some((AssociationType::HmacSha256, SessionType::DhSha256)),
        );
        assert_eq!(validate(&message), Ok(()));
        let mut bad = message.clone();
        bad.set_error_code("other");
        assert!(matches!(validate(&bad), Err(ValidationError::InvalidValue { .. })));
    }

    #[test]
    fn auth_request_rules() {
        let ok = Message::auth_request(
            false,
            Some("https://www.example.com/return"),
            Some("https://*.example.com/"),
        );
        assert_eq!(validate(&ok), Ok(()));

        let neither = Message::auth_request(true, None, None);
        assert_eq!(validate(&neither), Err(ValidationError::MissingReturnToOrRealm));

        let outside = Message::auth_request(
            false,
            Some("https://evil.example.org/"),
            Some("https://*.example.com/"),
        );
        assert!(matches!(
            validate(&outside),
            Err(ValidationError::ReturnToMismatch { .. })
        ));

        let mut half = ok.clone();
        half.set_claimed_id("https://alice.example.com/");
        assert_eq!(validate(&half), Err(ValidationError::IdentifierMismatch));
    }

    #[test]
    fn assertion_requires_core_fields_signed() {
        let message = signed_assertion();
        assert_eq!(validate(&message), Ok(()));

        let mut with_identity = message.clone();
        with_identity.set_claimed_id("https://alice.example.com/");
        with_identity.set_identity("https://alice.example.com/");
        assert_eq!(
            validate(&with_identity),
            Err(ValidationError::UnsignedField(field::CLAIMED_ID))
        );

        let mut unsigned = message.clone();
        unsigned.remove_field(field::SIG);
        assert!(matches!(
            validate(&unsigned),
            Err(ValidationError::MissingField { field: field::SIG, .. })
        ));
    }

    #[test]
    fn assertion_nonce_must_be_well_formed() {
        let mut message = signed_assertion();
        message.set_response_nonce("not-a-nonce");
        assert!(matches!(validate(&message), Err(ValidationError::InvalidNonce(_))));
    }

    #[test]
    fn verify_response_is_valid_values() {
        assert_eq!(validate(&Message::verify_response(true, None)), Ok(()));
        let mut message = Message::verify_response(false, Some("old"));
        assert_eq!(validate(&message), Ok(()));
        message.set_is_valid("maybe");
        assert!(matches!(validate(&message), Err(ValidationError::InvalidValue { .. })));
    }

    #[test]
    fn errors_need_error_text() {
        let mut message = Message::direct_error("boom");
        assert_eq!(validate(&message), Ok(()));
        message.remove_field(field::ERROR);
        assert!(validate(&message).is_err());
    }
}
