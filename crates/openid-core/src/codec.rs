//! Key-Value Form and URL Form message codecs.

use crate::encoding::{EncodingError, FlatParams, flatten, unflatten};
use crate::parameter::ParameterMap;

/// Wire-name prefix for parameters carried in URL Form.
pub const URL_FORM_PREFIX: &str = "openid.";

/// Namespace-aware message codec.
///
/// Implementations only convert between flat pairs and text; the provided
/// methods layer namespace handling on top.
pub trait MessageCodec {
    /// Serializes ordered wire pairs.
    fn encode_flat(&self, pairs: &[(String, String)]) -> Result<String, EncodingError>;

    /// Parses text into ordered wire pairs.
    fn decode_flat(&self, input: &str) -> Result<FlatParams, EncodingError>;

    /// Encodes a parameter map.
    fn encode(&self, params: &ParameterMap) -> Result<String, EncodingError> {
        self.encode_flat(&flatten(params)?)
    }

    /// Decodes text into a parameter map.
    fn decode(&self, input: &str) -> Result<ParameterMap, EncodingError> {
        unflatten(self.decode_flat(input)?)
    }

    /// Decodes raw bytes, rejecting non-UTF-8 input.
    fn decode_bytes(&self, input: &[u8]) -> Result<ParameterMap, EncodingError> {
        let text = std::str::from_utf8(input).map_err(|_| EncodingError::NonUtf8)?;
        self.decode(text)
    }
}

/// `name:value\n` encoding used for direct responses and signing data.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyValueForm;

impl KeyValueForm {
    /// Appends one `name:value\n` line, checking the character rules.
    pub fn write_pair(out: &mut String, name: &str, value: &str) -> Result<(), EncodingError> {
        if name.contains(':') || name.contains('\n') {
            return Err(EncodingError::IllegalCharacter {
                what: "name",
                text: name.to_owned(),
            });
        }
        if value.contains('\n') {
            return Err(EncodingError::IllegalCharacter {
                what: "value",
                text: value.to_owned(),
            });
        }
        out.push_str(name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
        Ok(())
    }
}

impl MessageCodec for KeyValueForm {
    fn encode_flat(&self, pairs: &[(String, String)]) -> Result<String, EncodingError> {
        let mut out = String::new();
        for (name, value) in pairs {
            Self::write_pair(&mut out, name, value)?;
        }
        Ok(out)
    }

    fn decode_flat(&self, input: &str) -> Result<FlatParams, EncodingError> {
        let mut out = FlatParams::new();
        for (line_no, line) in input.split('\n').enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                tracing::warn!(line = line_no + 1, "skipping key-value line without a colon");
                continue;
            };
            out.push((name.to_owned(), value.to_owned()));
        }
        Ok(out)
    }
}

/// `application/x-www-form-urlencoded` encoding used for indirect messages.
///
/// Wire names carry the `openid.` prefix; unprefixed pairs belong to the
/// hosting URL and are ignored when decoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct UrlForm;

impl UrlForm {
    /// Decodes pairs already split out of a query string or form body.
    pub fn decode_pairs<I, K, V>(&self, pairs: I) -> Result<ParameterMap, EncodingError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        unflatten(pairs.into_iter().filter_map(|(name, value)| {
            name.as_ref()
                .strip_prefix(URL_FORM_PREFIX)
                .map(|stripped| (stripped.to_owned(), value.as_ref().to_owned()))
        }))
    }

    /// Encodes a parameter map as prefixed pairs for an HTTP adapter.
    pub fn encode_pairs(&self, params: &ParameterMap) -> Result<FlatParams, EncodingError> {
        Ok(flatten(params)?
            .into_iter()
            .map(|(name, value)| (format!("{URL_FORM_PREFIX}{name}"), value))
            .collect())
    }
}

impl MessageCodec for UrlForm {
    fn encode_flat(&self, pairs: &[(String, String)]) -> Result<String, EncodingError> {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in pairs {
            serializer.append_pair(&format!("{URL_FORM_PREFIX}{name}"), value);
        }
        Ok(serializer.finish())
    }

    fn decode_flat(&self, input: &str) -> Result<FlatParams, EncodingError> {
        let input = input.strip_prefix('?').unwrap_or(input);
        Ok(url::form_urlencoded::parse(input.as_bytes())
            .filter_map(|(name, value)| {
                name.strip_prefix(URL_FORM_PREFIX)
                    .map(|stripped| (stripped.to_owned(), value.into_owned()))
            })
            .collect())
    }
}
