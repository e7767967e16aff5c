//! Realm patterns and return-to matching.

use url::Url;

const WILDCARD_HOST_PREFIX: &str = "*.";

/// Parsed realm: scheme, host (wildcard stripped), port and path.
#[derive(Clone, Debug, Eq, PartialEq)]
struct RealmPattern {
    url: Url,
    wildcard: bool,
}

impl RealmPattern {
    fn parse(realm: &str) -> Option<Self> {
        let (scheme, rest) = realm.split_once("://")?;
        let (wildcard, rest) = match rest.strip_prefix(WILDCARD_HOST_PREFIX) {
            Some(stripped) => (true, stripped),
            None => (false, rest),
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.contains('*') {
            return None;
        }
        let url = Url::parse(&format!("{scheme}://{rest}")).ok()?;
        if !matches!(url.scheme(), "http" | "https") || url.fragment().is_some() {
            return None;
        }
        url.host_str()?;
        Some(Self { url, wildcard })
    }

    fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Returns true when `realm` is a well-formed http(s) realm.
///
/// A `*` may only appear once, as the first label of the host.
#[must_use]
pub fn is_valid(realm: &str) -> bool {
    RealmPattern::parse(realm).is_some()
}

/// Returns true when `return_to` falls under `realm`.
#[must_use]
pub fn matches_return_to(realm: &str, return_to: &str) -> bool {
    let Some(pattern) = RealmPattern::parse(realm) else {
        return false;
    };
    let Ok(target) = Url::parse(return_to) else {
        return false;
    };
    if pattern.url.scheme() != target.scheme()
        || pattern.url.port_or_known_default() != target.port_or_known_default()
    {
        return false;
    }
    let Some(target_host) = target.host_str() else {
        return false;
    };
    let base = pattern.host();
    let host_matches = if pattern.wildcard {
        target_host == base
            || target_host
                .strip_suffix(base)
                .is_some_and(|head| head.ends_with('.'))
    } else {
        target_host == base
    };
    host_matches
        && with_trailing_slash(target.path())
            .starts_with(with_trailing_slash(pattern.url.path()).as_str())
}

/// Second-level labels that ccTLD registries hand out as public suffixes.
const PUBLIC_SECOND_LEVEL: &[&str] = &["ac", "co", "com", "edu", "gov", "net", "org"];

/// Flags wildcard realms that cover a whole public suffix.
///
/// `*.com`, `*.co.uk` and `*.com.au` are overly general; `*.example.com` is
/// not. Advisory only.
#[must_use]
pub fn is_overly_general(realm: &str) -> bool {
    let Some(pattern) = RealmPattern::parse(realm) else {
        return false;
    };
    if !pattern.wildcard {
        return false;
    }
    let labels: Vec<&str> = pattern.host().split('.').filter(|l| !l.is_empty()).collect();
    match labels.as_slice() {
        [_] => true,
        [second, top] => top.len() == 2 && PUBLIC_SECOND_LEVEL.contains(second),
        _ => false,
    }
}

/// URL to run relying-party discovery against.
///
/// A leading wildcard label becomes `www`.
#[must_use]
pub fn discovery_url(realm: &str) -> String {
    match realm.split_once("://") {
        Some((scheme, rest)) => match rest.strip_prefix(WILDCARD_HOST_PREFIX) {
            Some(stripped) => format!("{scheme}://www.{stripped}"),
            None => realm.to_owned(),
        },
        None => realm.to_owned(),
    }
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_owned()
    } else {
        format!("{path}/")
    }
}
