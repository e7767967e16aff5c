//! Simple Registration 1.1.

use std::sync::Arc;

use super::{Extension, ExtensionError, ExtensionFactory, param, split_list};

/// sreg 1.1 namespace.
pub const SREG_NS: &str = "http://openid.net/extensions/sreg/1.1";

/// Conventional alias.
pub const SREG_ALIAS: &str = "sreg";

/// Profile fields defined by sreg.
pub const SREG_FIELDS: [&str; 9] = [
    "nickname", "email", "fullname", "dob", "gender", "postcode", "country", "language", "timezone",
];

const REQUIRED: &str = "required";
const OPTIONAL: &str = "optional";
const POLICY_URL: &str = "policy_url";

fn check_field(name: &str) -> Result<(), ExtensionError> {
    if SREG_FIELDS.contains(&name) {
        Ok(())
    } else {
        Err(ExtensionError::UnknownField(name.to_owned()))
    }
}

/// Profile fields asked for by the relying party.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SregRequest {
    required: Vec<String>,
    optional: Vec<String>,
    policy_url: Option<String>,
}

impl SregRequest {
    /// Asks for `name`, moving it between lists if already requested.
    pub fn request_field(&mut self, name: &str, required: bool) -> Result<(), ExtensionError> {
        check_field(name)?;
        self.required.retain(|f| f != name);
        self.optional.retain(|f| f != name);
        if required {
            self.required.push(name.to_owned());
        } else {
            self.optional.push(name.to_owned());
        }
        Ok(())
    }

    /// Sets the privacy policy URL.
    pub fn set_policy_url(&mut self, url: impl Into<String>) {
        self.policy_url = Some(url.into());
    }

    /// Required fields.
    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Optional fields.
    #[must_use]
    pub fn optional(&self) -> &[String] {
        &self.optional
    }

    /// Privacy policy URL.
    #[must_use]
    pub fn policy_url(&self) -> Option<&str> {
        self.policy_url.as_deref()
    }

    fn parse(params: &[(String, String)]) -> Result<Self, ExtensionError> {
        let mut request = Self::default();
        for name in param(params, REQUIRED).map(split_list).unwrap_or_default() {
            request.request_field(&name, true)?;
        }
        for name in param(params, OPTIONAL).map(split_list).unwrap_or_default() {
            if !request.required.contains(&name) {
                request.request_field(&name, false)?;
            }
        }
        request.policy_url = param(params, POLICY_URL).map(str::to_owned);
        Ok(request)
    }
}

impl Extension for SregRequest {
    fn type_uri(&self) -> &str {
        SREG_NS
    }

    fn preferred_alias(&self) -> &str {
        SREG_ALIAS
    }

    fn to_params(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if !self.required.is_empty() {
            out.push((REQUIRED.to_owned(), self.required.join(",")));
        }
        if !self.optional.is_empty() {
            out.push((OPTIONAL.to_owned(), self.optional.join(",")));
        }
        if let Some(url) = &self.policy_url {
            out.push((POLICY_URL.to_owned(), url.clone()));
        }
        out
    }

    fn validate(&self) -> Result<(), ExtensionError> {
        for name in self.required.iter().chain(&self.optional) {
            check_field(name)?;
        }
        Ok(())
    }
}

/// Profile values released by the provider.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SregResponse {
    values: Vec<(String, String)>,
}

impl SregResponse {
    /// Sets a profile value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), ExtensionError> {
        check_field(name)?;
        let value = value.into();
        match self.values.iter_mut().find(|(key, _)| key == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name.to_owned(), value)),
        }
        Ok(())
    }

    /// Profile value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        param(&self.values, name)
    }

    /// Released values in order.
    #[must_use]
    pub fn values(&self) -> &[(String, String)] {
        &self.values
    }

    /// Keeps only values the request asked for.
    #[must_use]
    pub fn filtered_for(&self, request: &SregRequest) -> Self {
        Self {
            values: self
                .values
                .iter()
                .filter(|(name, _)| {
                    request.required.contains(name) || request.optional.contains(name)
                })
                .cloned()
                .collect(),
        }
    }
}

impl Extension for SregResponse {
    fn type_uri(&self) -> &str {
        SREG_NS
    }

    fn preferred_alias(&self) -> &str {
        SREG_ALIAS
    }

    fn to_params(&self) -> Vec<(String, String)> {
        self.values.clone()
    }

    fn validate(&self) -> Result<(), ExtensionError> {
        self.values.iter().try_for_each(|(name, _)| check_field(name))
    }
}

/// Parses sreg parameters into a request or a response.
///
/// Any of `required`, `optional` or `policy_url` marks a request.
#[derive(Clone, Copy, Debug, Default)]
pub struct SregFactory;

impl ExtensionFactory for SregFactory {
    fn type_uri(&self) -> &str {
        SREG_NS
    }

    fn unmarshal(&self, params: &[(String, String)]) -> Result<Arc<dyn Extension>, ExtensionError> {
        let is_request = params
            .iter()
            .any(|(name, _)| matches!(name.as_str(), REQUIRED | OPTIONAL | POLICY_URL));
        if is_request {
            return Ok(Arc::new(SregRequest::parse(params)?));
        }
        let mut response = SregResponse::default();
        for (name, value) in params {
            response.set(name, value.as_str())?;
        }
        Ok(Arc::new(response))
    }
}
