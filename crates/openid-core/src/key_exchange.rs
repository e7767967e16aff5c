//! Diffie-Hellman key agreement for encrypted association sessions.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use num_bigint::BigUint;
use num_traits::{Num, One, Zero};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// OpenID 2.0 default DH modulus (hex).
pub const DEFAULT_MODULUS_HEX: &str = "dcf93a0b883972ec0e19989ac5a2ce310e1d37717e8d9571bb7623731866e61e\
f75a2e27898b057f9891c2e27a639c3f29b60814581cd3b2ca3986d2683705577d45c2e7e52dc81c7a171876e5cea74b1448bfdfaf18828efd2519f14e45e3826634af1949e5b535cc829a483b8a76223e5d490a257f05bdff16f2fb22c583ab";

/// OpenID 2.0 default DH generator.
pub const DEFAULT_GENERATOR: u32 = 2;

/// Hash applied to the agreed secret before masking.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SecretHash {
    /// SHA-1, 20-byte output.
    Sha1,
    /// SHA-256, 32-byte output.
    Sha256,
}

impl SecretHash {
    /// Output length in bytes.
    #[must_use]
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hashes `data`.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Key exchange parse/arithmetic error.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum KeyExchangeError {
    /// Base64 payload could not be decoded.
    #[error("invalid base64 in `{0}`")]
    Base64(&'static str),
    /// Number is zero or otherwise unusable.
    #[error("degenerate Diffie-Hellman value for `{0}`")]
    Degenerate(&'static str),
    /// XOR operands differ in length.
    #[error("secret length mismatch: {left} != {right}")]
    LengthMismatch {
        /// Left operand length.
        left: usize,
        /// Right operand length.
        right: usize,
    },
}

/// Group parameters `(p, g)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhParameters {
    /// Prime modulus.
    pub modulus: BigUint,
    /// Generator.
    pub generator: BigUint,
}

impl Default for DhParameters {
    fn default() -> Self {
        Self {
            modulus: default_modulus(),
            generator: BigUint::from(DEFAULT_GENERATOR),
        }
    }
}

impl DhParameters {
    /// Builds parameters, rejecting trivially weak values.
    pub fn new(modulus: BigUint, generator: BigUint) -> Result<Self, KeyExchangeError> {
        if modulus <= BigUint::from(3_u32) {
            return Err(KeyExchangeError::Degenerate("dh_modulus"));
        }
        if generator <= BigUint::one() || generator >= modulus {
            return Err(KeyExchangeError::Degenerate("dh_gen"));
        }
        Ok(Self { modulus, generator })
    }

    /// Returns true for the protocol default group.
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Decodes optional base64 btwoc fields, defaulting absent ones.
    pub fn from_base64(
        modulus: Option<&str>,
        generator: Option<&str>,
    ) -> Result<Self, KeyExchangeError> {
        let defaults = Self::default();
        let modulus = modulus
            .map(|m| decode_btwoc_base64(m, "dh_modulus"))
            .transpose()?
            .unwrap_or(defaults.modulus);
        let generator = generator
            .map(|g| decode_btwoc_base64(g, "dh_gen"))
            .transpose()?
            .unwrap_or(defaults.generator);
        Self::new(modulus, generator)
    }
}

/// Ephemeral key pair for one association exchange.
#[derive(Clone, Debug)]
pub struct DhKeyPair {
    params: DhParameters,
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Draws a private exponent in `[1, p - 1)` and derives the public value.
    #[must_use]
    pub fn generate(params: &DhParameters) -> Self {
        let mut raw = vec![0_u8; params.modulus.bits().div_ceil(8) as usize];
        rand::rng().fill_bytes(&mut raw);
        let bound = &params.modulus - BigUint::from(2_u32);
        let private = BigUint::from_bytes_be(&raw) % bound + BigUint::one();
        Self::from_private(params, private)
    }

    /// Rebuilds a key pair from a known private exponent.
    #[must_use]
    pub fn from_private(params: &DhParameters, private: BigUint) -> Self {
        let public = mod_pow(&params.generator, &private, &params.modulus);
        Self {
            params: params.clone(),
            private,
            public,
        }
    }

    /// Group parameters.
    #[must_use]
    pub fn params(&self) -> &DhParameters {
        &self.params
    }

    /// Public value.
    #[must_use]
    pub fn public_key(&self) -> &BigUint {
        &self.public
    }

    /// Public value as base64(btwoc).
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        encode_btwoc_base64(&self.public)
    }

    /// Computes `other^private mod p`.
    pub fn shared_secret(&self, other_public: &BigUint) -> Result<BigUint, KeyExchangeError> {
        let p_minus_one = &self.params.modulus - BigUint::one();
        if other_public.is_zero() || other_public.is_one() || *other_public >= p_minus_one {
            return Err(KeyExchangeError::Degenerate("dh public key"));
        }
        Ok(mod_pow(other_public, &self.private, &self.params.modulus))
    }

    /// Derives the masking secret `H(btwoc(shared))`.
    pub fn masking_secret(
        &self,
        other_public: &BigUint,
        hash: SecretHash,
    ) -> Result<Vec<u8>, KeyExchangeError> {
        let shared = self.shared_secret(other_public)?;
        Ok(hash.digest(&btwoc(&shared)))
    }
}

/// Computes modular exponentiation.
#[must_use]
pub fn mod_pow(base: &BigUint, exp: &BigUint, modulus: &BigUint) -> BigUint {
    base.modpow(exp, modulus)
}

/// Big-endian two's complement of a non-negative integer.
#[must_use]
pub fn btwoc(value: &BigUint) -> Vec<u8> {
    let mut bytes = value.to_bytes_be();
    if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        bytes.insert(0, 0);
    }
    bytes
}

/// Inverse of [`btwoc`].
#[must_use]
pub fn from_btwoc(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// Encodes a number as base64(btwoc(n)).
#[must_use]
pub fn encode_btwoc_base64(value: &BigUint) -> String {
    STANDARD.encode(btwoc(value))
}

/// Decodes base64(btwoc(n)), naming `field` on failure.
pub fn decode_btwoc_base64(input: &str, field: &'static str) -> Result<BigUint, KeyExchangeError> {
    let bytes = STANDARD
        .decode(input)
        .map_err(|_| KeyExchangeError::Base64(field))?;
    if bytes.is_empty() {
        return Err(KeyExchangeError::Degenerate(field));
    }
    Ok(from_btwoc(&bytes))
}

/// XORs two equal-length byte strings.
///
/// Masking and unmasking a MAC key are the same operation.
pub fn xor_secret(key: &[u8], secret: &[u8]) -> Result<Vec<u8>, KeyExchangeError> {
    if key.len() != secret.len() {
        return Err(KeyExchangeError::LengthMismatch {
            left: key.len(),
            right: secret.len(),
        });
    }
    Ok(key.iter().zip(secret).map(|(k, s)| k ^ s).collect())
}

fn default_modulus() -> BigUint {
    // Constant is valid hex.
    BigUint::from_str_radix(DEFAULT_MODULUS_HEX, 16).unwrap_or_else(|_| BigUint::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_modulus_is_1024_bits() {
        let params = DhParameters::default();
        assert_eq!(params.modulus.bits(), 1024);
        assert_eq!(params.generator, BigUint::from(2_u32));
    }

    #[test]
    fn agreement_is_symmetric() {
        let params = DhParameters::default();
        let alice = DhKeyPair::generate(&params);
        let bob = DhKeyPair::generate(&params);
        let left = alice.shared_secret(bob.public_key()).expect("alice");
        let right = bob.shared_secret(alice.public_key()).expect("bob");
        assert_eq!(left, right);
        assert_eq!(
            alice
                .masking_secret(bob.public_key(), SecretHash::Sha256)
                .expect("mask")
                .len(),
            32
        );
    }

    #[test]
    fn small_group_agreement() {
        let params = DhParameters::new(BigUint::from(23_u32), BigUint::from(5_u32)).expect("params");
        let a = DhKeyPair::from_private(&params, BigUint::from(6_u32));
        let b = DhKeyPair::from_private(&params, BigUint::from(15_u32));
        assert_eq!(a.public_key(), &BigUint::from(8_u32));
        assert_eq!(b.public_key(), &BigUint::from(19_u32));
        assert_eq!(a.shared_secret(b.public_key()).expect("a"), BigUint::from(2_u32));
        assert_eq!(b.shared_secret(a.public_key()).expect("b"), BigUint::from(2_u32));
    }

    #[test]
    fn btwoc_pads_high_bit() {
        assert_eq!(btwoc(&BigUint::from(0x7f_u32)), vec![0x7f]);
        assert_eq!(btwoc(&BigUint::from(0x80_u32)), vec![0x00, 0x80]);
        assert_eq!(btwoc(&BigUint::from(0xff00_u32)), vec![0x00, 0xff, 0x00]);
        assert_eq!(from_btwoc(&[0x00, 0x80]), BigUint::from(0x80_u32));
    }

    #[test]
    fn xor_is_self_inverse() {
        let key = b"0123456789abcdefghij";
        let secret = b"zyxwvutsrqponmlkjihg";
        let masked = xor_secret(key, secret).expect("mask");
        assert_ne!(masked.as_slice(), key);
        assert_eq!(xor_secret(&masked, secret).expect("unmask"), key.to_vec());
    }

    #[test]
    fn xor_rejects_length_mismatch() {
        assert_eq!(
            xor_secret(&[1, 2, 3], &[1, 2]),
            Err(KeyExchangeError::LengthMismatch { left: 3, right: 2 })
        );
    }

    #[test]
    fn degenerate_public_key_is_rejected() {
        let params = DhParameters::default();
        let pair = DhKeyPair::generate(&params);
        assert!(pair.shared_secret(&BigUint::one()).is_err());
        assert!(pair.shared_secret(&(&params.modulus - BigUint::one())).is_err());
    }

    #[test]
    fn base64_parameters_round_trip() {
        let defaults = DhParameters::default();
        let modulus = encode_btwoc_base64(&defaults.modulus);
        let generator = encode_btwoc_base64(&defaults.generator);
        assert_eq!(generator, "Ag==");
        let parsed = DhParameters::from_base64(Some(&modulus), Some(&generator)).expect("params");
        assert!(parsed.is_default());
        assert!(DhParameters::from_base64(Some("!!"), None).is_err());
    }

    #[test]
    fn hex_constant_matches_published_prime_prefix() {
        let bytes = btwoc(&DhParameters::default().modulus);
        assert_eq!(hex::encode(&bytes[..4]), "00dcf93a");
    }
}
