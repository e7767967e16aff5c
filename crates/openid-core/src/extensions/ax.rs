//! Attribute Exchange 1.0 fetch messages.

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use super::{Extension, ExtensionError, ExtensionFactory, param, split_list};
use crate::namespace::is_usable_alias;

/// AX 1.0 namespace.
pub const AX_NS: &str = "http://openid.net/srv/ax/1.0";

/// Conventional alias.
pub const AX_ALIAS: &str = "ax";

const MODE: &str = "mode";
const FETCH_REQUEST: &str = "fetch_request";
const FETCH_RESPONSE: &str = "fetch_response";
const REQUIRED: &str = "required";
const IF_AVAILABLE: &str = "if_available";
const UPDATE_URL: &str = "update_url";
const TYPE_PREFIX: &str = "type.";
const COUNT_PREFIX: &str = "count.";
const VALUE_PREFIX: &str = "value.";
const UNLIMITED: &str = "unlimited";

/// Number of values requested for one attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AxCount {
    /// At most this many values.
    Limited(u32),
    /// As many as the provider has.
    Unlimited,
}

impl AxCount {
    fn parse(field: &str, value: &str) -> Result<Self, ExtensionError> {
        if value == UNLIMITED {
            return Ok(Self::Unlimited);
        }
        match value.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::Limited(n)),
            _ => Err(invalid(field, value)),
        }
    }
}

impl Display for AxCount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str(UNLIMITED),
        }
    }
}

/// One requested attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeRequest {
    /// Alias local to the AX payload.
    pub alias: String,
    /// Attribute type URI.
    pub type_uri: String,
    /// Requested count, `None` meaning one value.
    pub count: Option<AxCount>,
    /// Listed under `required` rather than `if_available`.
    pub required: bool,
}

/// `fetch_request` payload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FetchRequest {
    attributes: Vec<AttributeRequest>,
    update_url: Option<String>,
}

impl FetchRequest {
    /// Adds an attribute request.
    pub fn add(&mut self, attribute: AttributeRequest) {
        self.attributes.push(attribute);
    }

    /// Requested attributes.
    #[must_use]
    pub fn attributes(&self) -> &[AttributeRequest] {
        &self.attributes
    }

    /// Sets the URL receiving unsolicited updates.
    pub fn set_update_url(&mut self, url: impl Into<String>) {
        self.update_url = Some(url.into());
    }

    /// Update URL.
    #[must_use]
    pub fn update_url(&self) -> Option<&str> {
        self.update_url.as_deref()
    }

    fn parse(params: &[(String, String)]) -> Result<Self, ExtensionError> {
        let required = param(params, REQUIRED).map(split_list).unwrap_or_default();
        let optional = param(params, IF_AVAILABLE).map(split_list).unwrap_or_default();
        let mut request = Self {
            attributes: Vec::new(),
            update_url: param(params, UPDATE_URL).map(str::to_owned),
        };
        for alias in required.iter().chain(&optional) {
            let type_field = format!("{TYPE_PREFIX}{alias}");
            let type_uri = param(params, &type_field)
                .ok_or_else(|| ExtensionError::MissingField(type_field.clone()))?;
            let count_field = format!("{COUNT_PREFIX}{alias}");
            let count = param(params, &count_field)
                .map(|value| AxCount::parse(&count_field, value))
                .transpose()?;
            request.attributes.push(AttributeRequest {
                alias: alias.clone(),
                type_uri: type_uri.to_owned(),
                count,
                required: required.contains(alias),
            });
        }
        request.validate()?;
        Ok(request)
    }
}

impl Extension for FetchRequest {
    fn type_uri(&self) -> &str {
        AX_NS
    }

    fn preferred_alias(&self) -> &str {
        AX_ALIAS
    }

    fn to_params(&self) -> Vec<(String, String)> {
        let mut out = vec![(MODE.to_owned(), FETCH_REQUEST.to_owned())];
        for attribute in &self.attributes {
            out.push((
                format!("{TYPE_PREFIX}{}", attribute.alias),
                attribute.type_uri.clone(),
            ));
            if let Some(count) = attribute.count {
                out.push((format!("{COUNT_PREFIX}{}", attribute.alias), count.to_string()));
            }
        }
        let list = |required: bool| {
            self.attributes
                .iter()
                .filter(|a| a.required == required)
                .map(|a| a.alias.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        let required = list(true);
        if !required.is_empty() {
            out.push((REQUIRED.to_owned(), required));
        }
        let optional = list(false);
        if !optional.is_empty() {
            out.push((IF_AVAILABLE.to_owned(), optional));
        }
        if let Some(url) = &self.update_url {
            out.push((UPDATE_URL.to_owned(), url.clone()));
        }
        out
    }

    fn validate(&self) -> Result<(), ExtensionError> {
        check_aliases(self.attributes.iter().map(|a| a.alias.as_str()))
    }
}

/// Values released for one attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValues {
    /// Alias local to the AX payload.
    pub alias: String,
    /// Attribute type URI.
    pub type_uri: String,
    /// Released values.
    pub values: Vec<String>,
}

/// `fetch_response` payload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FetchResponse {
    attributes: Vec<AttributeValues>,
    update_url: Option<String>,
}

impl FetchResponse {
    /// Adds released values.
    pub fn add(&mut self, attribute: AttributeValues) {
        self.attributes.push(attribute);
    }

    /// Released attributes.
    #[must_use]
    pub fn attributes(&self) -> &[AttributeValues] {
        &self.attributes
    }

    /// Values released for `type_uri`.
    #[must_use]
    pub fn values_for(&self, type_uri: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|a| a.type_uri == type_uri)
            .map(|a| a.values.as_slice())
    }

    /// Echoes the request's update URL.
    pub fn set_update_url(&mut self, url: impl Into<String>) {
        self.update_url = Some(url.into());
    }

    fn parse(params: &[(String, String)]) -> Result<Self, ExtensionError> {
        let mut response = Self {
            attributes: Vec::new(),
            update_url: param(params, UPDATE_URL).map(str::to_owned),
        };
        for (name, type_uri) in params {
            let Some(alias) = name.strip_prefix(TYPE_PREFIX) else {
                continue;
            };
            let count_field = format!("{COUNT_PREFIX}{alias}");
            let values = match param(params, &count_field) {
                Some(raw) => {
                    let count = raw
                        .parse::<usize>()
                        .map_err(|_| invalid(&count_field, raw))?;
                    (1..=count)
                        .map(|n| {
                            let field = format!("{VALUE_PREFIX}{alias}.{n}");
                            param(params, &field)
                                .map(str::to_owned)
                                .ok_or(ExtensionError::MissingField(field))
                        })
                        .collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let field = format!("{VALUE_PREFIX}{alias}");
                    let value =
                        param(params, &field).ok_or(ExtensionError::MissingField(field.clone()))?;
                    vec![value.to_owned()]
                }
            };
            response.attributes.push(AttributeValues {
                alias: alias.to_owned(),
                type_uri: type_uri.clone(),
                values,
            });
        }
        response.validate()?;
        Ok(response)
    }
}

impl Extension for FetchResponse {
    fn type_uri(&self) -> &str {
        AX_NS
    }

    fn preferred_alias(&self) -> &str {
        AX_ALIAS
    }

    fn to_params(&self) -> Vec<(String, String)> {
        let mut out = vec![(MODE.to_owned(), FETCH_RESPONSE.to_owned())];
        for attribute in &self.attributes {
            let alias = &attribute.alias;
            out.push((format!("{TYPE_PREFIX}{alias}"), attribute.type_uri.clone()));
            if let [single] = attribute.values.as_slice() {
                out.push((format!("{VALUE_PREFIX}{alias}"), single.clone()));
                continue;
            }
            out.push((
                format!("{COUNT_PREFIX}{alias}"),
                attribute.values.len().to_string(),
            ));
            for (n, value) in attribute.values.iter().enumerate() {
                out.push((format!("{VALUE_PREFIX}{alias}.{}", n + 1), value.clone()));
            }
        }
        if let Some(url) = &self.update_url {
            out.push((UPDATE_URL.to_owned(), url.clone()));
        }
        out
    }

    fn validate(&self) -> Result<(), ExtensionError> {
        check_aliases(self.attributes.iter().map(|a| a.alias.as_str()))
    }
}

/// Dispatches on `mode` to the fetch payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct AxFactory;

impl ExtensionFactory for AxFactory {
    fn type_uri(&self) -> &str {
        AX_NS
    }

    fn unmarshal(&self, params: &[(String, String)]) -> Result<Arc<dyn Extension>, ExtensionError> {
        match param(params, MODE) {
            Some(FETCH_REQUEST) => Ok(Arc::new(FetchRequest::parse(params)?)),
            Some(FETCH_RESPONSE) => Ok(Arc::new(FetchResponse::parse(params)?)),
            Some(other) => Err(ExtensionError::UnsupportedMode(other.to_owned())),
            None => Err(ExtensionError::MissingField(MODE.to_owned())),
        }
    }
}

fn invalid(field: &str, value: &str) -> ExtensionError {
    ExtensionError::InvalidValue {
        field: field.to_owned(),
        value: value.to_owned(),
    }
}

fn check_aliases<'a>(aliases: impl Iterator<Item = &'a str>) -> Result<(), ExtensionError> {
    let mut seen = HashSet::new();
    for alias in aliases {
        if !is_usable_alias(alias) || !seen.insert(alias) {
            return Err(invalid("alias", alias));
        }
    }
    Ok(())
}
