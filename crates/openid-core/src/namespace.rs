//! Alias <-> namespace URI bindings for one parameter map.

use std::collections::HashMap;

/// Alias prefix used when no caller-supplied prefix is configured.
pub const DEFAULT_ALIAS_PREFIX: &str = "ext";

/// Bidirectional alias/URI table.
///
/// The default namespace is bound to the empty alias. Every other URI gets
/// exactly one alias, either the caller's hint or a generated
/// `<prefix><counter>` alias when the hint is unusable or taken.
#[derive(Clone, Debug)]
pub struct NamespaceMap {
    default_uri: Option<String>,
    alias_to_uri: HashMap<String, String>,
    uri_to_alias: HashMap<String, String>,
    order: Vec<String>,
    alias_prefix: String,
    counter: u32,
}

impl Default for NamespaceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceMap {
    /// Creates an empty map with the default alias prefix.
    #[must_use]
    pub fn new() -> Self {
        Self::with_alias_prefix(DEFAULT_ALIAS_PREFIX)
    }

    /// Creates an empty map generating aliases as `<prefix><n>`.
    #[must_use]
    pub fn with_alias_prefix(prefix: impl Into<String>) -> Self {
        Self {
            default_uri: None,
            alias_to_uri: HashMap::new(),
            uri_to_alias: HashMap::new(),
            order: Vec::new(),
            alias_prefix: prefix.into(),
            counter: 0,
        }
    }

    /// Changes the prefix of aliases generated from now on.
    pub fn set_alias_prefix(&mut self, prefix: impl Into<String>) {
        self.alias_prefix = prefix.into();
    }

    /// Binds `uri` to the reserved empty alias.
    ///
    /// A previous default binding is replaced.
    pub fn set_default(&mut self, uri: impl Into<String>) {
        let uri = uri.into();
        if let Some(alias) = self.uri_to_alias.remove(&uri) {
            self.alias_to_uri.remove(&alias);
            self.order.retain(|u| u != &uri);
        }
        self.default_uri = Some(uri);
    }

    /// Returns the default namespace URI, if declared.
    #[must_use]
    pub fn default_uri(&self) -> Option<&str> {
        self.default_uri.as_deref()
    }

    /// Registers `uri`, returning its alias.
    ///
    /// Existing bindings are returned unchanged. The default namespace always
    /// answers the empty alias.
    pub fn register(&mut self, uri: &str, hint: Option<&str>) -> String {
        if self.default_uri.as_deref() == Some(uri) || uri.is_empty() {
            return String::new();
        }
        if let Some(alias) = self.uri_to_alias.get(uri) {
            return alias.clone();
        }
        let alias = match hint {
            Some(h) if is_usable_alias(h) && !self.alias_to_uri.contains_key(h) => h.to_owned(),
            _ => self.fresh_alias(),
        };
        self.bind(uri, alias.clone());
        alias
    }

    /// Binds `alias` to `uri` exactly as declared on the wire.
    ///
    /// Returns false when either side is already bound to something else.
    pub fn declare(&mut self, alias: &str, uri: &str) -> bool {
        if !is_usable_alias(alias) {
            return false;
        }
        match (self.alias_to_uri.get(alias), self.uri_to_alias.get(uri)) {
            (Some(bound), _) => bound == uri,
            (None, Some(_)) => false,
            (None, None) => {
                if self.default_uri.as_deref() == Some(uri) {
                    return false;
                }
                self.bind(uri, alias.to_owned());
                true
            }
        }
    }

    /// Returns the alias bound to `uri`.
    #[must_use]
    pub fn alias(&self, uri: &str) -> Option<&str> {
        if self.default_uri.as_deref() == Some(uri) {
            return Some("");
        }
        // Undeclared default namespace.
        if uri.is_empty() && self.default_uri.is_none() {
            return Some("");
        }
        self.uri_to_alias.get(uri).map(String::as_str)
    }

    /// Returns the URI bound to `alias` (empty alias is the default namespace).
    #[must_use]
    pub fn uri(&self, alias: &str) -> Option<&str> {
        if alias.is_empty() {
            return self.default_uri.as_deref();
        }
        self.alias_to_uri.get(alias).map(String::as_str)
    }

    /// Returns true when `uri` is the default namespace or has an alias.
    #[must_use]
    pub fn contains_uri(&self, uri: &str) -> bool {
        self.alias(uri).is_some()
    }

    /// Iterates non-default `(alias, uri)` bindings in registration order.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().filter_map(|uri| {
            self.uri_to_alias
                .get(uri)
                .map(|alias| (alias.as_str(), uri.as_str()))
        })
    }

    /// Number of non-default bindings.
    #[must_use]
    pub fn extension_count(&self) -> usize {
        self.order.len()
    }

    fn bind(&mut self, uri: &str, alias: String) {
        self.alias_to_uri.insert(alias.clone(), uri.to_owned());
        self.uri_to_alias.insert(uri.to_owned(), alias);
        self.order.push(uri.to_owned());
    }

    fn fresh_alias(&mut self) -> String {
        while let Some(next) = self.counter.checked_add(1) {
            self.counter = next;
            let candidate = format!("{}{}", self.alias_prefix, self.counter);
            if !self.alias_to_uri.contains_key(&candidate) {
                return candidate;
            }
        }
        // Counter exhausted: one of the first `len + 1` numbers is free.
        let mut n: usize = 1;
        loop {
            let candidate = format!("{}{}", self.alias_prefix, n);
            if !self.alias_to_uri.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Aliases must be non-empty and may not contain `.` or `,`.
#[must_use]
pub fn is_usable_alias(alias: &str) -> bool {
    !alias.is_empty() && !alias.contains('.') && !alias.contains(',')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SREG: &str = "http://openid.net/extensions/sreg/1.1";
    const AX: &str = "http://openid.net/srv/ax/1.0";

    #[test]
    fn hint_is_used_when_free() {
        let mut map = NamespaceMap::new();
        assert_eq!(map.register(SREG, Some("sreg")), "sreg");
        assert_eq!(map.uri("sreg"), Some(SREG));
        assert_eq!(map.alias(SREG), Some("sreg"));
    }

    #[test]
    fn colliding_hint_gets_generated_alias() {
        let mut map = NamespaceMap::with_alias_prefix("e");
        map.register(SREG, Some("x"));
        assert_eq!(map.register(AX, Some("x")), "e1");
        assert_eq!(map.register("urn:other", Some("bad.alias")), "e2");
        assert_eq!(map.register(AX, None), "e1");
    }

    #[test]
    fn exhausted_counter_reuses_free_numbers() {
        let mut map = NamespaceMap::with_alias_prefix("e");
        map.counter = u32::MAX - 1;
        assert!(map.declare(&format!("e{}", u32::MAX), "urn:last"));
        assert_eq!(map.register(SREG, None), "e1");
        assert_eq!(map.register(AX, None), "e2");
        assert_eq!(map.uri("e2"), Some(AX));
    }

    #[test]
    fn generated_alias_skips_declared_names() {
        let mut map = NamespaceMap::new();
        assert!(map.declare("ext1", SREG));
        assert_eq!(map.register(AX, None), "ext2");
    }

    #[test]
    fn default_namespace_uses_empty_alias() {
        let mut map = NamespaceMap::new();
        map.set_default("http://specs.openid.net/auth/2.0");
        assert_eq!(map.alias("http://specs.openid.net/auth/2.0"), Some(""));
        assert_eq!(map.uri(""), Some("http://specs.openid.net/auth/2.0"));
        assert_eq!(map.extension_count(), 0);
    }

    #[test]
    fn prefix_change_applies_to_later_aliases() {
        let mut map = NamespaceMap::new();
        assert_eq!(map.register(SREG, None), "ext1");
        map.set_alias_prefix("x");
        assert_eq!(map.register(AX, None), "x2");
    }

    #[test]
    fn conflicting_declaration_is_refused() {
        let mut map = NamespaceMap::new();
        assert!(map.declare("sreg", SREG));
        assert!(map.declare("sreg", SREG));
        assert!(!map.declare("sreg", AX));
        assert!(!map.declare("other", SREG));
    }
}
