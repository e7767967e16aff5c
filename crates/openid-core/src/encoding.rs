//! Flattening between [`ParameterMap`] and wire-level name/value pairs.
//!
//! Wire names are `ns` / `ns.<alias>` for namespace declarations,
//! `<alias>.<name>` for extension parameters and a bare `<name>` for the
//! default namespace. The `signed` parameter holds the comma-joined wire
//! names of the signed parameters.

use std::collections::HashSet;

use thiserror::Error;

use crate::namespace::NamespaceMap;
use crate::parameter::{ParamKey, ParameterMap};

/// Ordered wire-level `(name, value)` pairs.
pub type FlatParams = Vec<(String, String)>;

/// Wire name of the signed-field list.
pub const SIGNED_PARAM: &str = "signed";

const NS_PARAM: &str = "ns";
const NS_PREFIX: &str = "ns.";

/// Malformed wire input or an unencodable parameter map.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum EncodingError {
    /// Parameter uses an alias that was never declared.
    #[error("undeclared namespace alias `{alias}` in parameter `{name}`")]
    UnknownAlias {
        /// Offending alias.
        alias: String,
        /// Full wire name.
        name: String,
    },
    /// Namespace declaration conflicts with an earlier one.
    #[error("conflicting namespace declaration `{0}`")]
    ConflictingNamespace(String),
    /// A wire name appears more than once.
    #[error("duplicate parameter `{0}`")]
    DuplicateParameter(String),
    /// A key's namespace has no alias in the map.
    #[error("namespace `{0}` is not registered")]
    UnregisteredNamespace(String),
    /// Forbidden character for the chosen wire form.
    #[error("illegal character in {what} `{text}`")]
    IllegalCharacter {
        /// Either "name" or "value".
        what: &'static str,
        /// Offending text.
        text: String,
    },
    /// Entry in the signed list is empty.
    #[error("empty entry in signed field list")]
    EmptySignedEntry,
    /// Input is not valid UTF-8.
    #[error("input is not valid utf-8")]
    NonUtf8,
}

/// Encodes the wire name of `key` through `namespaces`.
pub fn encode_name(key: &ParamKey, namespaces: &NamespaceMap) -> Result<String, EncodingError> {
    let alias = namespaces
        .alias(&key.namespace)
        .ok_or_else(|| EncodingError::UnregisteredNamespace(key.namespace.clone()))?;
    Ok(match (key.is_declaration(), alias.is_empty()) {
        (true, true) => NS_PARAM.to_owned(),
        (true, false) => format!("{NS_PREFIX}{alias}"),
        (false, true) => key.name.clone(),
        (false, false) => format!("{alias}.{}", key.name),
    })
}

/// Resolves a wire name against a complete namespace table.
pub fn decode_name(name: &str, namespaces: &NamespaceMap) -> Result<ParamKey, EncodingError> {
    if name == NS_PARAM {
        return Ok(ParamKey::declaration(namespaces.default_uri().unwrap_or("")));
    }
    if let Some(alias) = name.strip_prefix(NS_PREFIX) {
        let uri = namespaces
            .uri(alias)
            .ok_or_else(|| EncodingError::UnknownAlias {
                alias: alias.to_owned(),
                name: name.to_owned(),
            })?;
        return Ok(ParamKey::with_alias(uri, "", alias));
    }
    match name.split_once('.') {
        Some((alias, local)) => {
            let uri = namespaces
                .uri(alias)
                .filter(|_| !alias.is_empty())
                .ok_or_else(|| EncodingError::UnknownAlias {
                    alias: alias.to_owned(),
                    name: name.to_owned(),
                })?;
            Ok(ParamKey::with_alias(uri, local, alias))
        }
        None => Ok(ParamKey::new(namespaces.default_uri().unwrap_or(""), name)),
    }
}

/// Encodes the signed-field list as comma-joined wire names.
pub fn encode_signed_fields(params: &ParameterMap) -> Result<String, EncodingError> {
    let names = params
        .signed_fields()
        .iter()
        .map(|key| encode_name(key, params.namespaces()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.join(","))
}

/// Decodes a comma-joined signed list through `namespaces`.
pub fn decode_signed_fields(
    value: &str,
    namespaces: &NamespaceMap,
) -> Result<Vec<ParamKey>, EncodingError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(|name| {
            if name.is_empty() {
                return Err(EncodingError::EmptySignedEntry);
            }
            decode_name(name, namespaces)
        })
        .collect()
}

/// Flattens a parameter map into ordered wire pairs.
///
/// Namespace declarations come first, then parameters in insertion order,
/// then the signed list when one is set.
pub fn flatten(params: &ParameterMap) -> Result<FlatParams, EncodingError> {
    let namespaces = params.namespaces();
    let mut out = FlatParams::with_capacity(params.len() + namespaces.extension_count() + 2);
    if let Some(default) = namespaces.default_uri() {
        out.push((NS_PARAM.to_owned(), default.to_owned()));
    }
    for (alias, uri) in namespaces.extensions() {
        out.push((format!("{NS_PREFIX}{alias}"), uri.to_owned()));
    }
    for (key, value) in params.iter() {
        out.push((encode_name(key, namespaces)?, value.to_owned()));
    }
    if !params.signed_fields().is_empty() {
        out.push((SIGNED_PARAM.to_owned(), encode_signed_fields(params)?));
    }
    Ok(out)
}

/// Rebuilds a parameter map from wire pairs.
///
/// Declarations are registered first so parameters may appear before the
/// declaration of their alias.
pub fn unflatten<I, K, V>(pairs: I) -> Result<ParameterMap, EncodingError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut namespaces = NamespaceMap::new();
    let mut rest = Vec::new();
    for (name, value) in pairs {
        let (name, value) = (name.as_ref(), value.as_ref());
        if !seen.insert(name.to_owned()) {
            return Err(EncodingError::DuplicateParameter(name.to_owned()));
        }
        if name == NS_PARAM {
            namespaces.set_default(value);
        } else if let Some(alias) = name.strip_prefix(NS_PREFIX) {
            if !namespaces.declare(alias, value) {
                return Err(EncodingError::ConflictingNamespace(name.to_owned()));
            }
        } else {
            rest.push((name.to_owned(), value.to_owned()));
        }
    }

    let mut signed = None;
    let mut decoded = Vec::with_capacity(rest.len());
    for (name, value) in rest {
        if name == SIGNED_PARAM {
            signed = Some(decode_signed_fields(&value, &namespaces)?);
            continue;
        }
        decoded.push((decode_name(&name, &namespaces)?, value));
    }

    let mut params = ParameterMap::with_namespaces(namespaces);
    for (key, value) in decoded {
        params.set(key, value);
    }
    if let Some(signed) = signed {
        params.set_signed_fields(signed);
    }
    Ok(params)
}
