use std::sync::Arc;

use openid_core::extensions::sreg::{SREG_NS, SregRequest, SregResponse};
use openid_core::message::field;
use openid_core::validation::validate;
use openid_core::{
    AssertionError, AssertionVerifier, AssociationSession, AssociationStore, AssociationType,
    DhParameters, Extension, ExtensionError, ExtensionFactory, ExtensionRegistry,
    InMemoryAssociationStore, InMemoryNonceValidator, KeyValueForm, Message, MessageCodec,
    MessageKind, OpenIdError, OpenIdProvider, ProtocolConfig, SessionType, UrlForm,
    ValidationError, Verification, decode_message, encode_message,
};
use time::{Duration, OffsetDateTime};

const OP: &str = "https://op.example.com/server";
const RETURN_TO: &str = "https://rp.example.com/finish?state=xyz";

fn now() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_893_456_000).expect("timestamp")
}

fn registry() -> ExtensionRegistry {
    ExtensionRegistry::with_standard_extensions()
}

fn provider() -> OpenIdProvider<InMemoryAssociationStore> {
    OpenIdProvider::new(OP, InMemoryAssociationStore::new(), ProtocolConfig::default())
}

fn verifier() -> AssertionVerifier<InMemoryAssociationStore, InMemoryNonceValidator> {
    AssertionVerifier::new(
        InMemoryAssociationStore::new(),
        InMemoryNonceValidator::new(Duration::seconds(60)),
    )
}

/// Sends `message` across the wire the way an HTTP adapter would.
fn over_url_form(message: &Message) -> Message {
    let wire = encode_message(&UrlForm, message).expect("encode url form");
    decode_message(&UrlForm, &wire, &registry()).expect("decode url form")
}

fn over_key_value(message: &Message) -> Message {
    let wire = encode_message(&KeyValueForm, message).expect("encode kv form");
    decode_message(&KeyValueForm, &wire, &registry()).expect("decode kv form")
}

fn flip_first_char(signature: &str) -> String {
    let mut chars: Vec<char> = signature.chars().collect();
    chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
    chars.into_iter().collect()
}

#[test]
fn dh_sha256_association_survives_url_form() {
    let session =
        AssociationSession::new(AssociationType::HmacSha256, SessionType::DhSha256, None)
            .expect("session");
    let request = over_url_form(session.request());

    assert_eq!(request.kind(), MessageKind::AssociationRequest);
    assert_eq!(request.mode(), Some("associate"));
    assert_eq!(request.assoc_type(), Some("HMAC-SHA256"));
    assert_eq!(request.session_type(), Some("DH-SHA256"));
    assert_eq!(
        request.dh_consumer_public(),
        session.request().dh_consumer_public()
    );
    assert_eq!(request.dh_modulus(), None);
    assert_eq!(validate(&request), Ok(()));
    let params = DhParameters::from_base64(request.dh_modulus(), request.dh_gen()).expect("params");
    assert!(params.is_default());

    let provider = provider();
    let response = over_key_value(&provider.associate(&request, now()).expect("associate"));
    assert_eq!(response.kind(), MessageKind::AssociationResponse);
    assert!(response.enc_mac_key().is_some());
    assert!(response.mac_key().is_none());

    let association = session.complete(&response, OP, now()).expect("complete");
    let stored = provider
        .associations()
        .get(association.handle())
        .expect("provider copy");
    assert_eq!(association.mac_key(), stored.mac_key());
    assert_eq!(association.mac_key().len() * 8, 256);
    assert_eq!(association.expires_at(), now() + Duration::hours(1));
}

#[test]
fn custom_dh_group_is_transmitted() {
    let params = DhParameters::new(
        num_bigint::BigUint::parse_bytes(b"FFFFFFFFFFFFFFC5", 16).expect("prime"),
        num_bigint::BigUint::from(5_u32),
    )
    .expect("params");
    let session = AssociationSession::new(
        AssociationType::HmacSha1,
        SessionType::DhSha1,
        Some(&params),
    )
    .expect("session");
    let request = over_url_form(session.request());
    assert!(request.dh_modulus().is_some());
    assert!(request.dh_gen().is_some());
    let decoded = DhParameters::from_base64(request.dh_modulus(), request.dh_gen()).expect("params");
    assert_eq!(decoded, params);

    let provider = provider();
    let response = over_key_value(&provider.associate(&request, now()).expect("associate"));
    let association = session.complete(&response, OP, now()).expect("complete");
    assert_eq!(association.mac_key().len(), 20);
}

#[test]
fn private_assertion_verifies_and_tampering_fails() {
    let provider = provider();
    let mut assertion = Message::positive_assertion(OP, RETURN_TO, "", "");
    assertion.set_claimed_id("https://alice.example.com/");
    assertion.set_identity("https://alice.example.com/");
    let private = provider.sign_assertion(&mut assertion, now()).expect("sign");
    assert!(private.is_private());

    let received = over_url_form(&assertion);
    let verifier = verifier();
    let Verification::NeedsDirectVerification(check) = verifier
        .verify(&received, RETURN_TO, now())
        .expect("local checks")
    else {
        panic!("private association is unknown to the relying party");
    };

    let mut forged = check.clone();
    let signature = forged.signature().expect("sig").to_owned();
    forged.set_field(field::SIG, flip_first_char(&signature));
    let answer = over_key_value(
        &provider
            .verify(&over_url_form(&forged), now())
            .expect("forged check"),
    );
    assert_eq!(answer.is_valid(), Some("false"));
    assert_eq!(
        verifier.complete_direct_verification(&received, &answer),
        Err(AssertionError::InvalidSignature)
    );
}

#[test]
fn genuine_private_assertion_passes_direct_verification() {
    let provider = provider();
    let mut assertion = Message::positive_assertion(OP, RETURN_TO, "", "");
    provider.sign_assertion(&mut assertion, now()).expect("sign");

    let received = over_url_form(&assertion);
    let verifier = verifier();
    let Verification::NeedsDirectVerification(check) = verifier
        .verify(&received, RETURN_TO, now())
        .expect("local checks")
    else {
        panic!("private association is unknown to the relying party");
    };
    let answer = over_key_value(&provider.verify(&over_url_form(&check), now()).expect("check"));
    assert_eq!(answer.kind(), MessageKind::VerifyResponse);
    let verified = verifier
        .complete_direct_verification(&received, &answer)
        .expect("verified");
    assert_eq!(verified.op_endpoint, OP);
}

#[test]
fn shared_association_signature_covers_extensions() {
    let provider = provider();
    let verifier = verifier();
    let session =
        AssociationSession::new(AssociationType::HmacSha1, SessionType::DhSha1, None)
            .expect("session");
    let response = provider.associate(session.request(), now()).expect("associate");
    let association = session.complete(&response, OP, now()).expect("complete");
    verifier.associations().add(association.clone());

    let mut sreg = SregResponse::default();
    sreg.set("email", "alice@example.com").expect("email");
    sreg.set("nickname", "alice").expect("nickname");
    let mut assertion = Message::positive_assertion(OP, RETURN_TO, "", association.handle());
    assertion.add_extension(Arc::new(sreg));
    provider.sign_assertion(&mut assertion, now()).expect("sign");

    let wire = encode_message(&UrlForm, &assertion).expect("encode");
    assert!(wire.contains("openid.signed="));
    assert!(wire.contains("ns.sreg%2Csreg.email%2Csreg.nickname"));

    let received = decode_message(&UrlForm, &wire, &registry()).expect("decode");
    let sreg = received.extension::<SregResponse>().expect("sreg");
    assert_eq!(sreg.get("nickname"), Some("alice"));
    let outcome = verifier
        .verify(&received, &format!("{RETURN_TO}&openid.mode=id_res"), now())
        .expect("verify");
    assert!(matches!(outcome, Verification::Verified(_)));

    let tampered_wire = wire.replace("alice%40example.com", "mallory%40example.com");
    let mut tampered = decode_message(&UrlForm, &tampered_wire, &registry()).expect("decode");
    tampered.set_response_nonce(format!(
        "{}fresh",
        &received.response_nonce().expect("nonce")[..20]
    ));
    assert!(matches!(
        verifier.verify(&tampered, RETURN_TO, now()),
        Err(AssertionError::Validation(_)) | Err(AssertionError::InvalidSignature)
    ));
}

#[test]
fn no_encryption_request_with_dh_key_is_rejected() {
    let text = format!(
        "openid.ns={}&openid.mode=associate&openid.assoc_type=HMAC-SHA256\
         &openid.session_type=no-encryption&openid.dh_consumer_public=Ag%3D%3D",
        "http%3A%2F%2Fspecs.openid.net%2Fauth%2F2.0"
    );
    let request = decode_message(&UrlForm, &text, &registry()).expect("decode");
    let err = validate(&request).expect_err("must fail");
    assert!(matches!(err, ValidationError::ShouldNotContain { .. }));
    assert!(err.to_string().contains("should not contain"));

    let provider_err = provider().associate(&request, now()).expect_err("refused");
    assert!(provider_err.to_string().contains("should not contain"));
}

#[test]
fn sreg_request_travels_in_checkid_setup() {
    let mut request = Message::auth_request(false, Some(RETURN_TO), Some("https://*.example.com/"));
    request.set_claimed_id(openid_core::IDENTIFIER_SELECT);
    request.set_identity(openid_core::IDENTIFIER_SELECT);
    let mut sreg = SregRequest::default();
    sreg.request_field("email", true).expect("email");
    sreg.request_field("fullname", false).expect("fullname");
    request.add_extension(Arc::new(sreg.clone()));

    let received = over_url_form(&request);
    assert_eq!(received.kind(), MessageKind::CheckidSetup);
    assert_eq!(validate(&received), Ok(()));
    assert_eq!(received.extension::<SregRequest>(), Some(&sreg));
    assert_eq!(
        received.extension_params(SREG_NS),
        vec![
            ("required".to_owned(), "email".to_owned()),
            ("optional".to_owned(), "fullname".to_owned()),
        ]
    );
}

#[derive(Debug)]
struct Tagged(String);

impl Extension for Tagged {
    fn type_uri(&self) -> &str {
        "urn:example:tag"
    }

    fn preferred_alias(&self) -> &str {
        "bad.alias"
    }

    fn to_params(&self) -> Vec<(String, String)> {
        vec![("value".to_owned(), self.0.clone())]
    }

    fn validate(&self) -> Result<(), ExtensionError> {
        if self.0.is_empty() {
            Err(ExtensionError::MissingField("value".to_owned()))
        } else {
            Ok(())
        }
    }
}

struct TaggedFactory;

impl ExtensionFactory for TaggedFactory {
    fn type_uri(&self) -> &str {
        "urn:example:tag"
    }

    fn unmarshal(&self, params: &[(String, String)]) -> Result<Arc<dyn Extension>, ExtensionError> {
        let value = params
            .iter()
            .find(|(name, _)| name == "value")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        Ok(Arc::new(Tagged(value)))
    }
}

#[test]
fn runtime_extension_uses_configured_alias_prefix() {
    let config = ProtocolConfig::from_toml_str("extension_alias_prefix = \"x\"\n").expect("config");
    let provider = OpenIdProvider::new(OP, InMemoryAssociationStore::new(), config);
    let mut assertion = Message::positive_assertion(OP, RETURN_TO, "", "");
    assertion.add_extension(Arc::new(Tagged("blue".to_owned())));
    provider.sign_assertion(&mut assertion, now()).expect("sign");

    let wire = encode_message(&KeyValueForm, &assertion).expect("encode");
    assert!(wire.contains("ns.x1:urn:example:tag\n"));
    assert!(wire.contains("x1.value:blue\n"));

    let registry = registry();
    registry.register(Arc::new(TaggedFactory));
    let received = decode_message(&KeyValueForm, &wire, &registry).expect("decode");
    assert_eq!(received.extension::<Tagged>().map(|t| t.0.as_str()), Some("blue"));

    let mut empty = received.clone();
    empty.add_extension(Arc::new(Tagged(String::new())));
    assert!(matches!(
        validate(&empty),
        Err(ValidationError::Extension { .. })
    ));

    registry.deregister("urn:example:tag");
    let raw = decode_message(&KeyValueForm, &wire, &registry).expect("decode");
    assert!(raw.extension::<Tagged>().is_none());
    assert_eq!(
        raw.extension_params("urn:example:tag"),
        vec![("value".to_owned(), "blue".to_owned())]
    );
}

#[test]
fn malformed_wire_input_is_reported() {
    let err = decode_message(&KeyValueForm, "mode:id_res\nfoo.bar:baz\n", &registry())
        .expect_err("undeclared alias");
    assert!(matches!(err, OpenIdError::Encoding(_)));

    let err = decode_message(&KeyValueForm, "mode:id_res\n", &registry()).expect_err("no ns");
    assert!(matches!(err, OpenIdError::Unmarshalling(_)));

    let params = KeyValueForm
        .decode("ns:http://specs.openid.net/auth/2.0\nmode:id_res\nmode:cancel\n")
        .map(|_| ());
    assert!(params.is_err());
}
