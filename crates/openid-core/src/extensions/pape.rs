//! Provider Authentication Policy Extension 1.0.

use std::sync::Arc;

use time::OffsetDateTime;

use super::{Extension, ExtensionError, ExtensionFactory, param};
use crate::nonce::format_timestamp;
use crate::validation::{NONCE_TIMESTAMP_LEN, parse_nonce_timestamp};

/// PAPE 1.0 namespace.
pub const PAPE_NS: &str = "http://specs.openid.net/extensions/pape/1.0";

/// Conventional alias.
pub const PAPE_ALIAS: &str = "pape";

/// Policy URI meaning no policy was satisfied.
pub const POLICY_NONE: &str = "http://schemas.openid.net/pape/policies/2007/06/none";

/// Phishing-resistant authentication.
pub const POLICY_PHISHING_RESISTANT: &str =
    "http://schemas.openid.net/pape/policies/2007/06/phishing-resistant";

/// Multi-factor authentication.
pub const POLICY_MULTI_FACTOR: &str =
    "http://schemas.openid.net/pape/policies/2007/06/multi-factor";

const PREFERRED_AUTH_POLICIES: &str = "preferred_auth_policies";
const MAX_AUTH_AGE: &str = "max_auth_age";
const AUTH_POLICIES: &str = "auth_policies";
const AUTH_TIME: &str = "auth_time";

fn split_policies(value: &str) -> Vec<String> {
    value
        .split(' ')
        .filter(|p| !p.is_empty() && *p != POLICY_NONE && *p != "none")
        .map(str::to_owned)
        .collect()
}

/// Policies the relying party would like applied.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PapeRequest {
    /// Preferred policy URIs, in preference order.
    pub preferred_auth_policies: Vec<String>,
    /// Maximum seconds since the user last authenticated.
    pub max_auth_age: Option<u64>,
}

impl PapeRequest {
    fn parse(params: &[(String, String)]) -> Result<Self, ExtensionError> {
        let policies = param(params, PREFERRED_AUTH_POLICIES)
            .ok_or_else(|| ExtensionError::MissingField(PREFERRED_AUTH_POLICIES.to_owned()))?;
        let max_auth_age = param(params, MAX_AUTH_AGE)
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| ExtensionError::InvalidValue {
                    field: MAX_AUTH_AGE.to_owned(),
                    value: raw.to_owned(),
                })
            })
            .transpose()?;
        Ok(Self {
            preferred_auth_policies: split_policies(policies),
            max_auth_age,
        })
    }
}

impl Extension for PapeRequest {
    fn type_uri(&self) -> &str {
        PAPE_NS
    }

    fn preferred_alias(&self) -> &str {
        PAPE_ALIAS
    }

    fn to_params(&self) -> Vec<(String, String)> {
        let mut out = vec![(
            PREFERRED_AUTH_POLICIES.to_owned(),
            self.preferred_auth_policies.join(" "),
        )];
        if let Some(age) = self.max_auth_age {
            out.push((MAX_AUTH_AGE.to_owned(), age.to_string()));
        }
        out
    }
}

/// Policies the provider applied.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PapeResponse {
    /// Satisfied policy URIs; empty means none.
    pub auth_policies: Vec<String>,
    /// When the user last authenticated.
    pub auth_time: Option<OffsetDateTime>,
}

impl PapeResponse {
    fn parse(params: &[(String, String)]) -> Result<Self, ExtensionError> {
        let policies = param(params, AUTH_POLICIES)
            .ok_or_else(|| ExtensionError::MissingField(AUTH_POLICIES.to_owned()))?;
        let auth_time = match param(params, AUTH_TIME) {
            Some(raw) => Some(
                parse_nonce_timestamp(raw)
                    .filter(|_| raw.len() == NONCE_TIMESTAMP_LEN)
                    .ok_or_else(|| ExtensionError::InvalidValue {
                        field: AUTH_TIME.to_owned(),
                        value: raw.to_owned(),
                    })?,
            ),
            None => None,
        };
        Ok(Self {
            auth_policies: split_policies(policies),
            auth_time,
        })
    }
}

impl Extension for PapeResponse {
    fn type_uri(&self) -> &str {
        PAPE_NS
    }

    fn preferred_alias(&self) -> &str {
        PAPE_ALIAS
    }

    fn to_params(&self) -> Vec<(String, String)> {
        let policies = if self.auth_policies.is_empty() {
            POLICY_NONE.to_owned()
        } else {
            self.auth_policies.join(" ")
        };
        let mut out = vec![(AUTH_POLICIES.to_owned(), policies)];
        if let Some(at) = self.auth_time {
            out.push((AUTH_TIME.to_owned(), format_timestamp(at)));
        }
        out
    }
}

/// `preferred_auth_policies` marks a request; anything else is a response.
#[derive(Clone, Copy, Debug, Default)]
pub struct PapeFactory;

impl ExtensionFactory for PapeFactory {
    fn type_uri(&self) -> &str {
        PAPE_NS
    }

    fn unmarshal(&self, params: &[(String, String)]) -> Result<Arc<dyn Extension>, ExtensionError> {
        if param(params, PREFERRED_AUTH_POLICIES).is_some() {
            Ok(Arc::new(PapeRequest::parse(params)?))
        } else {
            Ok(Arc::new(PapeResponse::parse(params)?))
        }
    }
}
