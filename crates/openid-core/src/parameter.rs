//! Namespace-qualified parameter storage.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::namespace::NamespaceMap;

/// Namespace-qualified parameter name.
///
/// Identity is `(namespace, name)`; the alias hint only steers encoding. An
/// empty `name` stands for the namespace declaration itself.
#[derive(Clone, Debug)]
pub struct ParamKey {
    /// Namespace URI.
    pub namespace: String,
    /// Local name within the namespace.
    pub name: String,
    /// Preferred alias when the namespace is first registered.
    pub alias_hint: Option<String>,
}

impl ParamKey {
    /// Creates a key without an alias hint.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            alias_hint: None,
        }
    }

    /// Creates a key carrying a preferred alias.
    #[must_use]
    pub fn with_alias(
        namespace: impl Into<String>,
        name: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            alias_hint: Some(alias.into()),
        }
    }

    /// Key of the namespace-declaration pseudo-parameter for `namespace`.
    #[must_use]
    pub fn declaration(namespace: impl Into<String>) -> Self {
        Self::new(namespace, "")
    }

    /// Returns true for a namespace-declaration pseudo-parameter.
    #[must_use]
    pub fn is_declaration(&self) -> bool {
        self.name.is_empty()
    }
}

impl PartialEq for ParamKey {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl Eq for ParamKey {}

impl Hash for ParamKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

/// Insertion-ordered parameter map with its namespace table and signed list.
#[derive(Clone, Debug, Default)]
pub struct ParameterMap {
    entries: Vec<(ParamKey, String)>,
    index: HashMap<ParamKey, usize>,
    signed: Vec<ParamKey>,
    namespaces: NamespaceMap,
}

impl ParameterMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty map whose default namespace is `uri`.
    #[must_use]
    pub fn with_default_namespace(uri: impl Into<String>) -> Self {
        let mut map = Self::new();
        map.namespaces.set_default(uri);
        map
    }

    /// Creates an empty map around an existing namespace table.
    #[must_use]
    pub fn with_namespaces(namespaces: NamespaceMap) -> Self {
        Self {
            namespaces,
            ..Self::default()
        }
    }

    /// Namespace table.
    #[must_use]
    pub fn namespaces(&self) -> &NamespaceMap {
        &self.namespaces
    }

    /// Mutable namespace table.
    pub fn namespaces_mut(&mut self) -> &mut NamespaceMap {
        &mut self.namespaces
    }

    /// Default namespace URI, or the empty string when undeclared.
    #[must_use]
    pub fn default_namespace(&self) -> &str {
        self.namespaces.default_uri().unwrap_or("")
    }

    /// Inserts or replaces a value, registering the key's namespace.
    ///
    /// Replacing keeps the original position.
    pub fn set(&mut self, key: ParamKey, value: impl Into<String>) {
        self.namespaces
            .register(&key.namespace, key.alias_hint.as_deref());
        let value = value.into();
        if let Some(&idx) = self.index.get(&key) {
            self.entries[idx].1 = value;
            return;
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
    }

    /// Sets a parameter in the default namespace.
    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        let key = ParamKey::new(self.default_namespace(), name);
        self.set(key, value);
    }

    /// Looks up a parameter.
    #[must_use]
    pub fn get(&self, key: &ParamKey) -> Option<&str> {
        if key.is_declaration() {
            let namespaces = &self.namespaces;
            return namespaces
                .alias(&key.namespace)
                .and_then(|alias| namespaces.uri(alias));
        }
        self.index
            .get(key)
            .map(|&idx| self.entries[idx].1.as_str())
    }

    /// Looks up a parameter in the default namespace.
    #[must_use]
    pub fn get_default(&self, name: &str) -> Option<&str> {
        self.get(&ParamKey::new(self.default_namespace(), name))
    }

    /// Returns true when a parameter is present.
    #[must_use]
    pub fn contains(&self, key: &ParamKey) -> bool {
        self.get(key).is_some()
    }

    /// Removes a parameter, returning its value.
    pub fn remove(&mut self, key: &ParamKey) -> Option<String> {
        let idx = self.index.remove(key)?;
        let (_, value) = self.entries.remove(idx);
        for slot in self.index.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(value)
    }

    /// Removes a parameter from the default namespace.
    pub fn remove_default(&mut self, name: &str) -> Option<String> {
        let key = ParamKey::new(self.default_namespace(), name);
        self.remove(&key)
    }

    /// Removes every parameter in `namespace`.
    pub fn remove_namespace(&mut self, namespace: &str) {
        let keys: Vec<ParamKey> = self
            .entries
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Iterates parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &str)> {
        self.entries.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Iterates `(local name, value)` pairs of one namespace in insertion order.
    pub fn namespace_params<'a>(
        &'a self,
        namespace: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.namespace == namespace)
            .map(|(k, v)| (k.name.as_str(), v.as_str()))
    }

    /// Number of parameters (namespace declarations excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no parameters are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered signed-field list.
    #[must_use]
    pub fn signed_fields(&self) -> &[ParamKey] {
        &self.signed
    }

    /// Replaces the signed-field list.
    pub fn set_signed_fields(&mut self, signed: Vec<ParamKey>) {
        for key in &signed {
            self.namespaces
                .register(&key.namespace, key.alias_hint.as_deref());
        }
        self.signed = signed;
    }

    /// Appends a key to the signed-field list unless already listed.
    pub fn sign_field(&mut self, key: ParamKey) {
        if !self.signed.contains(&key) {
            self.namespaces
                .register(&key.namespace, key.alias_hint.as_deref());
            self.signed.push(key);
        }
    }

    /// Returns true when `key` is listed as signed.
    #[must_use]
    pub fn is_signed(&self, key: &ParamKey) -> bool {
        self.signed.contains(key)
    }

    /// Parameter-set equality: same namespaces, values and signed list,
    /// ignoring aliases.
    #[must_use]
    pub fn same_parameters(&self, other: &Self) -> bool {
        self.default_namespace() == other.default_namespace()
            && self.len() == other.len()
            && self.iter().all(|(k, v)| other.get(k) == Some(v))
            && self.signed == other.signed
            && self
                .namespaces
                .extensions()
                .all(|(_, uri)| other.namespaces.contains_uri(uri))
            && self.namespaces.extension_count() == other.namespaces.extension_count()
    }
}
