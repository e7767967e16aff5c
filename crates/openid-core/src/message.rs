//! Protocol messages: kind dispatch, constructors, marshalling.

use std::any::Any;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::association::{AssociationType, SessionType};
use crate::extensions::{Extension, ExtensionError, ExtensionRegistry};
use crate::key_exchange::{DhKeyPair, encode_btwoc_base64};
use crate::parameter::{ParamKey, ParameterMap};

/// OpenID 2.0 protocol namespace.
pub const OPENID2_NS: &str = "http://specs.openid.net/auth/2.0";

/// Identifier asking the provider to choose the identity.
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";

/// Error code of an unsuccessful association response.
pub const UNSUPPORTED_TYPE: &str = "unsupported-type";

/// Default-namespace field names.
pub mod field {
    pub const MODE: &str = "mode";
    pub const ASSOC_TYPE: &str = "assoc_type";
    pub const SESSION_TYPE: &str = "session_type";
    pub const DH_MODULUS: &str = "dh_modulus";
    pub const DH_GEN: &str = "dh_gen";
    pub const DH_CONSUMER_PUBLIC: &str = "dh_consumer_public";
    pub const DH_SERVER_PUBLIC: &str = "dh_server_public";
    pub const ASSOC_HANDLE: &str = "assoc_handle";
    pub const EXPIRES_IN: &str = "expires_in";
    pub const MAC_KEY: &str = "mac_key";
    pub const ENC_MAC_KEY: &str = "enc_mac_key";
    pub const ERROR: &str = "error";
    pub const ERROR_CODE: &str = "error_code";
    pub const CONTACT: &str = "contact";
    pub const REFERENCE: &str = "reference";
    pub const CLAIMED_ID: &str = "claimed_id";
    pub const IDENTITY: &str = "identity";
    pub const RETURN_TO: &str = "return_to";
    pub const REALM: &str = "realm";
    pub const OP_ENDPOINT: &str = "op_endpoint";
    pub const RESPONSE_NONCE: &str = "response_nonce";
    pub const INVALIDATE_HANDLE: &str = "invalidate_handle";
    pub const SIG: &str = "sig";
    pub const IS_VALID: &str = "is_valid";
}

/// Closed set of OpenID 2.0 message kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MessageKind {
    /// `associate` request.
    AssociationRequest,
    /// Successful association response (direct, no mode).
    AssociationResponse,
    /// Unsuccessful association response (direct, no mode).
    AssociationError,
    /// `checkid_setup` authentication request.
    CheckidSetup,
    /// `checkid_immediate` authentication request.
    CheckidImmediate,
    /// `id_res` positive assertion.
    PositiveAssertion,
    /// `cancel` negative assertion.
    Cancel,
    /// `setup_needed` negative assertion to an immediate request.
    SetupNeeded,
    /// `check_authentication` direct verification request.
    VerifyRequest,
    /// Direct verification response (no mode).
    VerifyResponse,
    /// `error` indirect error.
    IndirectError,
    /// Direct error response (no mode).
    DirectError,
}

impl MessageKind {
    /// `openid.mode` value, `None` for direct responses.
    #[must_use]
    pub fn mode(self) -> Option<&'static str> {
        match self {
            Self::AssociationRequest => Some("associate"),
            Self::CheckidSetup => Some("checkid_setup"),
            Self::CheckidImmediate => Some("checkid_immediate"),
            Self::PositiveAssertion => Some("id_res"),
            Self::Cancel => Some("cancel"),
            Self::SetupNeeded => Some("setup_needed"),
            Self::VerifyRequest => Some("check_authentication"),
            Self::IndirectError => Some("error"),
            Self::AssociationResponse
            | Self::AssociationError
            | Self::VerifyResponse
            | Self::DirectError => None,
        }
    }

    /// Kind for an explicit mode value.
    #[must_use]
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode {
            "associate" => Some(Self::AssociationRequest),
            "checkid_setup" => Some(Self::CheckidSetup),
            "checkid_immediate" => Some(Self::CheckidImmediate),
            "id_res" => Some(Self::PositiveAssertion),
            "cancel" => Some(Self::Cancel),
            "setup_needed" => Some(Self::SetupNeeded),
            "check_authentication" => Some(Self::VerifyRequest),
            "error" => Some(Self::IndirectError),
            _ => None,
        }
    }

    /// Resolves the kind of a decoded parameter map.
    ///
    /// Direct responses carry no mode and are recognized by their fields.
    pub fn resolve(params: &ParameterMap) -> Result<Self, UnmarshallingError> {
        if let Some(mode) = params.get_default(field::MODE) {
            return Self::from_mode(mode)
                .ok_or_else(|| UnmarshallingError::UnknownMode(mode.to_owned()));
        }
        let has = |name: &str| params.get_default(name).is_some();
        if has(field::IS_VALID) {
            Ok(Self::VerifyResponse)
        } else if has(field::ERROR_CODE) {
            Ok(Self::AssociationError)
        } else if has(field::ASSOC_HANDLE) {
            Ok(Self::AssociationResponse)
        } else if has(field::ERROR) {
            Ok(Self::DirectError)
        } else {
            Err(UnmarshallingError::Unresolvable)
        }
    }

    /// Only assertions carry signatures.
    #[must_use]
    pub fn is_signable(self) -> bool {
        matches!(self, Self::PositiveAssertion | Self::VerifyRequest)
    }

    /// Direct responses travel in Key-Value Form.
    #[must_use]
    pub fn is_direct_response(self) -> bool {
        self.mode().is_none()
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::AssociationRequest => "association request",
            Self::AssociationResponse => "association response",
            Self::AssociationError => "association error",
            Self::CheckidSetup => "checkid_setup request",
            Self::CheckidImmediate => "checkid_immediate request",
            Self::PositiveAssertion => "positive assertion",
            Self::Cancel => "cancel response",
            Self::SetupNeeded => "setup_needed response",
            Self::VerifyRequest => "verification request",
            Self::VerifyResponse => "verification response",
            Self::IndirectError => "indirect error",
            Self::DirectError => "direct error",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parameter map could not be turned into a message.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum UnmarshallingError {
    /// `openid.mode` names no known kind.
    #[error("unknown mode `{0}`")]
    UnknownMode(String),
    /// No mode and no distinguishing direct-response field.
    #[error("cannot determine message kind")]
    Unresolvable,
    /// Structural field missing.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// A registered extension rejected its parameters.
    #[error("extension `{uri}`: {source}")]
    Extension {
        /// Extension namespace.
        uri: String,
        /// Cause.
        source: ExtensionError,
    },
}

/// One protocol message.
#[derive(Clone, Debug)]
pub struct Message {
    kind: MessageKind,
    params: ParameterMap,
    extensions: Vec<Arc<dyn Extension>>,
}

impl Message {
    /// Creates an empty message of `kind` in the OpenID 2.0 namespace.
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        let mut params = ParameterMap::with_default_namespace(OPENID2_NS);
        if let Some(mode) = kind.mode() {
            params.set_default(field::MODE, mode);
        }
        Self {
            kind,
            params,
            extensions: Vec::new(),
        }
    }

    /// `associate` request; DH fields are filled when `key_pair` is given.
    #[must_use]
    pub fn association_request(
        assoc_type: AssociationType,
        session_type: SessionType,
        key_pair: Option<&DhKeyPair>,
    ) -> Self {
        let mut message = Self::new(MessageKind::AssociationRequest);
        message.set_field(field::ASSOC_TYPE, assoc_type.as_str());
        message.set_field(field::SESSION_TYPE, session_type.as_str());
        if let Some(pair) = key_pair {
            if !pair.params().is_default() {
                message.set_field(field::DH_MODULUS, encode_btwoc_base64(&pair.params().modulus));
                message.set_field(field::DH_GEN, encode_btwoc_base64(&pair.params().generator));
            }
            message.set_field(field::DH_CONSUMER_PUBLIC, pair.public_key_base64());
        }
        message
    }

    /// Successful association response without key material.
    #[must_use]
    pub fn association_response(
        handle: &str,
        assoc_type: AssociationType,
        session_type: SessionType,
        expires_in: i64,
    ) -> Self {
        let mut message = Self::new(MessageKind::AssociationResponse);
        message.set_field(field::ASSOC_HANDLE, handle);
        message.set_field(field::SESSION_TYPE, session_type.as_str());
        message.set_field(field::ASSOC_TYPE, assoc_type.as_str());
        message.set_field(field::EXPIRES_IN, expires_in.to_string());
        message
    }

    /// Unsuccessful association response, optionally suggesting a pairing.
    #[must_use]
    pub fn association_error(
        error: &str,
        suggestion: Option<(AssociationType, SessionType)>,
    ) -> Self {
        let mut message = Self::new(MessageKind::AssociationError);
        message.set_field(field::ERROR, error);
        message.set_field(field::ERROR_CODE, UNSUPPORTED_TYPE);
        if let Some((assoc_type, session_type)) = suggestion {
            message.set_field(field::SESSION_TYPE, session_type.as_str());
            message.set_field(field::ASSOC_TYPE, assoc_type.as_str());
        }
        message
    }

    /// `checkid_setup` / `checkid_immediate` request.
    #[must_use]
    pub fn auth_request(immediate: bool, return_to: Option<&str>, realm: Option<&str>) -> Self {
        let kind = if immediate {
            MessageKind::CheckidImmediate
        } else {
            MessageKind::CheckidSetup
        };
        let mut message = Self::new(kind);
        if let Some(return_to) = return_to {
            message.set_field(field::RETURN_TO, return_to);
        }
        if let Some(realm) = realm {
            message.set_field(field::REALM, realm);
        }
        message
    }

    /// Unsigned `id_res` assertion.
    #[must_use]
    pub fn positive_assertion(
        op_endpoint: &str,
        return_to: &str,
        response_nonce: &str,
        assoc_handle: &str,
    ) -> Self {
        let mut message = Self::new(MessageKind::PositiveAssertion);
        message.set_field(field::OP_ENDPOINT, op_endpoint);
        message.set_field(field::RETURN_TO, return_to);
        message.set_field(field::RESPONSE_NONCE, response_nonce);
        message.set_field(field::ASSOC_HANDLE, assoc_handle);
        message
    }

    /// `cancel` negative assertion.
    #[must_use]
    pub fn cancel() -> Self {
        Self::new(MessageKind::Cancel)
    }

    /// `setup_needed` negative assertion.
    #[must_use]
    pub fn setup_needed() -> Self {
        Self::new(MessageKind::SetupNeeded)
    }

    /// `check_authentication` copy of a received assertion.
    ///
    /// Every parameter is carried over verbatim; only the mode changes.
    #[must_use]
    pub fn verify_request(assertion: &Self) -> Self {
        let mut params = assertion.params.clone();
        params.set_default(field::MODE, MessageKind::VerifyRequest.mode().unwrap_or_default());
        Self {
            kind: MessageKind::VerifyRequest,
            params,
            extensions: assertion.extensions.clone(),
        }
    }

    /// Direct verification answer.
    #[must_use]
    pub fn verify_response(is_valid: bool, invalidate_handle: Option<&str>) -> Self {
        let mut message = Self::new(MessageKind::VerifyResponse);
        message.set_field(field::IS_VALID, if is_valid { "true" } else { "false" });
        if let Some(handle) = invalidate_handle {
            message.set_field(field::INVALIDATE_HANDLE, handle);
        }
        message
    }

    /// Indirect (`mode=error`) error.
    #[must_use]
    pub fn indirect_error(error: &str) -> Self {
        let mut message = Self::new(MessageKind::IndirectError);
        message.set_field(field::ERROR, error);
        message
    }

    /// Direct error response.
    #[must_use]
    pub fn direct_error(error: &str) -> Self {
        let mut message = Self::new(MessageKind::DirectError);
        message.set_field(field::ERROR, error);
        message
    }

    /// Builds a message from decoded parameters.
    ///
    /// Registered extensions present in the map are unmarshalled and
    /// attached; unregistered ones stay as raw parameters.
    pub fn unmarshal(
        params: ParameterMap,
        registry: &ExtensionRegistry,
    ) -> Result<Self, UnmarshallingError> {
        if params.namespaces().default_uri().is_none() {
            return Err(UnmarshallingError::MissingField("ns"));
        }
        let kind = MessageKind::resolve(&params)?;
        let mut extensions = Vec::new();
        for (_, uri) in params.namespaces().extensions() {
            let Some(factory) = registry.get(uri) else {
                continue;
            };
            let local: Vec<(String, String)> = params
                .namespace_params(uri)
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect();
            let extension =
                factory
                    .unmarshal(&local)
                    .map_err(|source| UnmarshallingError::Extension {
                        uri: uri.to_owned(),
                        source,
                    })?;
            extensions.push(extension);
        }
        Ok(Self {
            kind,
            params,
            extensions,
        })
    }

    /// Produces the wire parameter map, merging attached extensions.
    #[must_use]
    pub fn marshal(&self) -> ParameterMap {
        let mut params = self.params.clone();
        for extension in &self.extensions {
            let uri = extension.type_uri();
            let alias = params
                .namespaces_mut()
                .register(uri, Some(extension.preferred_alias()));
            params.remove_namespace(uri);
            for (name, value) in extension.to_params() {
                params.set(ParamKey::with_alias(uri, name, alias.as_str()), value);
            }
        }
        params
    }

    /// Message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Parameters as held by the message.
    #[must_use]
    pub fn params(&self) -> &ParameterMap {
        &self.params
    }

    /// Replaces the parameters, keeping kind and extensions.
    pub fn replace_params(&mut self, params: ParameterMap) {
        self.params = params;
    }

    /// Prefix used for extension aliases generated while marshalling.
    pub fn set_alias_prefix(&mut self, prefix: &str) {
        self.params.namespaces_mut().set_alias_prefix(prefix);
    }

    /// Protocol namespace (`openid.ns`).
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.params.namespaces().default_uri()
    }

    /// Default-namespace field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.params.get_default(name)
    }

    /// Sets a default-namespace field.
    pub fn set_field(&mut self, name: &str, value: impl Into<String>) {
        self.params.set_default(name, value);
    }

    /// Removes a default-namespace field.
    pub fn remove_field(&mut self, name: &str) -> Option<String> {
        self.params.remove_default(name)
    }

    /// Signed-field list.
    #[must_use]
    pub fn signed_fields(&self) -> &[ParamKey] {
        self.params.signed_fields()
    }

    /// Returns true when the default-namespace field `name` is signed.
    #[must_use]
    pub fn is_field_signed(&self, name: &str) -> bool {
        let key = ParamKey::new(self.params.default_namespace(), name);
        self.params.is_signed(&key)
    }

    /// Base64 signature (`openid.sig`).
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        self.field(field::SIG)
    }

    /// Attaches an extension, replacing one with the same namespace.
    pub fn add_extension(&mut self, extension: Arc<dyn Extension>) {
        self.extensions
            .retain(|existing| existing.type_uri() != extension.type_uri());
        self.extensions.push(extension);
    }

    /// Attached extensions.
    #[must_use]
    pub fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.extensions
    }

    /// First attached extension of concrete type `T`.
    #[must_use]
    pub fn extension<T: Extension>(&self) -> Option<&T> {
        self.extensions.iter().find_map(|extension| {
            let any: &dyn Any = &**extension;
            any.downcast_ref::<T>()
        })
    }

    /// Raw parameters of any namespace, registered or not.
    #[must_use]
    pub fn extension_params(&self, uri: &str) -> Vec<(String, String)> {
        self.params
            .namespace_params(uri)
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect()
    }
}

macro_rules! field_accessors {
    ($($getter:ident, $setter:ident => $name:path;)*) => {
        impl Message {
            $(
                #[doc = concat!("`openid.", stringify!($getter), "` value.")]
                #[must_use]
                pub fn $getter(&self) -> Option<&str> {
                    self.field($name)
                }

                #[doc = concat!("Sets `openid.", stringify!($getter), "`.")]
                pub fn $setter(&mut self, value: impl Into<String>) {
                    self.set_field($name, value);
                }
            )*
        }
    };
}

field_accessors! {
    mode, set_mode => field::MODE;
    assoc_type, set_assoc_type => field::ASSOC_TYPE;
    session_type, set_session_type => field::SESSION_TYPE;
    dh_modulus, set_dh_modulus => field::DH_MODULUS;
    dh_gen, set_dh_gen => field::DH_GEN;
    dh_consumer_public, set_dh_consumer_public => field::DH_CONSUMER_PUBLIC;
    dh_server_public, set_dh_server_public => field::DH_SERVER_PUBLIC;
    assoc_handle, set_assoc_handle => field::ASSOC_HANDLE;
    expires_in, set_expires_in => field::EXPIRES_IN;
    mac_key, set_mac_key => field::MAC_KEY;
    enc_mac_key, set_enc_mac_key => field::ENC_MAC_KEY;
    error, set_error => field::ERROR;
    error_code, set_error_code => field::ERROR_CODE;
    contact, set_contact => field::CONTACT;
    reference, set_reference => field::REFERENCE;
    claimed_id, set_claimed_id => field::CLAIMED_ID;
    identity, set_identity => field::IDENTITY;
    return_to, set_return_to => field::RETURN_TO;
    realm, set_realm => field::REALM;
    op_endpoint, set_op_endpoint => field::OP_ENDPOINT;
    response_nonce, set_response_nonce => field::RESPONSE_NONCE;
    invalidate_handle, set_invalidate_handle => field::INVALIDATE_HANDLE;
    is_valid, set_is_valid => field::IS_VALID;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KeyValueForm, MessageCodec, UrlForm};
    use crate::extensions::sreg::{SREG_NS, SregResponse};

    fn registry() -> ExtensionRegistry {
        ExtensionRegistry::with_standard_extensions()
    }

    #[test]
    fn mode_round_trips_through_kind() {
        for kind in [
            MessageKind::AssociationRequest,
            MessageKind::CheckidSetup,
            MessageKind::CheckidImmediate,
            MessageKind::PositiveAssertion,
            MessageKind::Cancel,
            MessageKind::SetupNeeded,
            MessageKind::VerifyRequest,
            MessageKind::IndirectError,
        ] {
            let mode = kind.mode().expect("mode");
            assert_eq!(MessageKind::from_mode(mode), Some(kind));
        }
    }

    #[test]
    fn direct_responses_are_sniffed() {
        let cases = [
            ("is_valid:true\n", MessageKind::VerifyResponse),
            ("error:no\nerror_code:unsupported-type\n", MessageKind::AssociationError),
            ("assoc_handle:h\nexpires_in:10\n", MessageKind::AssociationResponse),
            ("error:boom\n", MessageKind::DirectError),
        ];
        for (body, expected) in cases {
            let text = format!("ns:{OPENID2_NS}\n{body}");
            let params = KeyValueForm.decode(&text).expect("decode");
            assert_eq!(MessageKind::resolve(&params), Ok(expected));
        }
    }

    #[test]
    fn unknown_mode_and_empty_map_fail() {
        let params = KeyValueForm
            .decode(&format!("ns:{OPENID2_NS}\nmode:bogus\n"))
            .expect("decode");
        assert_eq!(
            Message::unmarshal(params, &registry()).map(|m| m.kind()),
            Err(UnmarshallingError::UnknownMode("bogus".to_owned()))
        );
        let params = KeyValueForm
            .decode(&format!("ns:{OPENID2_NS}\nfoo:bar\n"))
            .expect("decode");
        assert_eq!(
            Message::unmarshal(params, &registry()).map(|m| m.kind()),
            Err(UnmarshallingError::Unresolvable)
        );
    }

    #[test]
    fn missing_namespace_is_structural_failure() {
        let params = KeyValueForm.decode("mode:cancel\n").expect("decode");
        assert_eq!(
            Message::unmarshal(params, &registry()).map(|m| m.kind()),
            Err(UnmarshallingError::MissingField("ns"))
        );
    }

    #[test]
    fn extensions_are_marshalled_and_unmarshalled() {
        let mut message = Message::positive_assertion(
            "https://op.example.com/server",
            "https://rp.example.com/return",
            "2030-01-01T00:00:00Zabc",
            "handle",
        );
        let mut sreg = SregResponse::default();
        sreg.set("email", "alice@example.com").expect("email");
        message.add_extension(Arc::new(sreg));

        let encoded = UrlForm.encode(&message.marshal()).expect("encode");
        assert!(encoded.contains("openid.ns.sreg="));
        assert!(encoded.contains("openid.sreg.email=alice%40example.com"));

        let decoded = Message::unmarshal(UrlForm.decode(&encoded).expect("decode"), &registry())
            .expect("unmarshal");
        assert_eq!(decoded.kind(), MessageKind::PositiveAssertion);
        let sreg = decoded.extension::<SregResponse>().expect("sreg attached");
        assert_eq!(sreg.get("email"), Some("alice@example.com"));
        assert_eq!(decoded.extension_params(SREG_NS).len(), 1);
    }

    #[test]
    fn unregistered_extension_stays_raw() {
        let text = format!(
            "ns:{OPENID2_NS}\nns.foo:urn:example:foo\nmode:cancel\nfoo.bar:baz\n"
        );
        let params = KeyValueForm.decode(&text).expect("decode");
        let message = Message::unmarshal(params, &ExtensionRegistry::new()).expect("unmarshal");
        assert!(message.extensions().is_empty());
        assert_eq!(
            message.extension_params("urn:example:foo"),
            vec![("bar".to_owned(), "baz".to_owned())]
        );
    }

    #[test]
    fn verify_request_keeps_everything_but_mode() {
        let mut assertion = Message::positive_assertion("https://op", "https://rp", "n", "h");
        assertion.set_claimed_id("https://alice.example.com/");
        let request = Message::verify_request(&assertion);
        assert_eq!(request.kind(), MessageKind::VerifyRequest);
        assert_eq!(request.mode(), Some("check_authentication"));
        assert_eq!(request.claimed_id(), Some("https://alice.example.com/"));
        assert_eq!(request.params().len(), assertion.params().len());
    }
}
