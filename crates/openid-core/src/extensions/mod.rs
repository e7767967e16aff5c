//! Extension payloads and the namespace-keyed factory registry.

pub mod ax;
pub mod pape;
pub mod sreg;

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Extension payload could not be parsed or is inconsistent.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ExtensionError {
    /// Required extension parameter is absent.
    #[error("missing parameter `{0}`")]
    MissingField(String),
    /// Parameter name is not defined by the extension.
    #[error("unknown parameter `{0}`")]
    UnknownField(String),
    /// Parameter value is malformed.
    #[error("invalid value `{value}` for `{field}`")]
    InvalidValue {
        /// Parameter name.
        field: String,
        /// Offending value.
        value: String,
    },
    /// Extension mode is not supported.
    #[error("unsupported mode `{0}`")]
    UnsupportedMode(String),
}

/// Typed extension data attached to a message.
///
/// Parameters are local names within the extension namespace; aliasing is
/// handled by the message.
pub trait Extension: Any + Debug + Send + Sync {
    /// Namespace URI.
    fn type_uri(&self) -> &str;

    /// Alias requested when the namespace is declared.
    fn preferred_alias(&self) -> &str;

    /// Local `(name, value)` pairs in emission order.
    fn to_params(&self) -> Vec<(String, String)>;

    /// Checks internal consistency.
    fn validate(&self) -> Result<(), ExtensionError> {
        Ok(())
    }
}

/// Builds typed extensions from their raw parameters.
pub trait ExtensionFactory: Send + Sync {
    /// Namespace URI handled by this factory.
    fn type_uri(&self) -> &str;

    /// Parses local `(name, value)` pairs.
    fn unmarshal(&self, params: &[(String, String)]) -> Result<Arc<dyn Extension>, ExtensionError>;
}

/// Runtime registry of extension factories keyed by namespace URI.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ExtensionFactory>>>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with sreg, AX and PAPE.
    #[must_use]
    pub fn with_standard_extensions() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(sreg::SregFactory));
        registry.register(Arc::new(ax::AxFactory));
        registry.register(Arc::new(pape::PapeFactory));
        registry
    }

    /// Registers a factory, replacing any previous one for its namespace.
    pub fn register(&self, factory: Arc<dyn ExtensionFactory>) {
        if let Ok(mut guard) = self.factories.write() {
            tracing::debug!(type_uri = factory.type_uri(), "extension registered");
            guard.insert(factory.type_uri().to_owned(), factory);
        }
    }

    /// Removes the factory for `type_uri`.
    pub fn deregister(&self, type_uri: &str) -> Option<Arc<dyn ExtensionFactory>> {
        self.factories.write().ok()?.remove(type_uri)
    }

    /// Factory for `type_uri`.
    #[must_use]
    pub fn get(&self, type_uri: &str) -> Option<Arc<dyn ExtensionFactory>> {
        self.factories.read().ok()?.get(type_uri).cloned()
    }

    /// Returns true when `type_uri` has a factory.
    #[must_use]
    pub fn contains(&self, type_uri: &str) -> bool {
        self.get(type_uri).is_some()
    }
}

/// Looks up a local parameter.
pub(crate) fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Splits a comma list, dropping empty entries.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_knows_three_namespaces() {
        let registry = ExtensionRegistry::with_standard_extensions();
        assert!(registry.contains(sreg::SREG_NS));
        assert!(registry.contains(ax::AX_NS));
        assert!(registry.contains(pape::PAPE_NS));
        assert!(!registry.contains("urn:unknown"));
    }

    #[test]
    fn deregister_removes_factory() {
        let registry = ExtensionRegistry::with_standard_extensions();
        assert!(registry.deregister(sreg::SREG_NS).is_some());
        assert!(!registry.contains(sreg::SREG_NS));
        assert!(registry.deregister(sreg::SREG_NS).is_none());
    }

    #[test]
    fn registry_accepts_concurrent_registration() {
        let registry = ExtensionRegistry::new();
        std::thread::scope(|scope| {
            scope.spawn(|| registry.register(Arc::new(sreg::SregFactory)));
            scope.spawn(|| registry.register(Arc::new(ax::AxFactory)));
            scope.spawn(|| registry.register(Arc::new(pape::PapeFactory)));
            for _ in 0..4 {
                scope.spawn(|| {
                    if let Some(factory) = registry.get(ax::AX_NS) {
                        assert_eq!(factory.type_uri(), ax::AX_NS);
                    }
                });
            }
        });
        for uri in [sreg::SREG_NS, ax::AX_NS, pape::PAPE_NS] {
            assert!(registry.contains(uri));
        }
    }

    #[test]
    fn split_list_drops_empty_items() {
        assert_eq!(split_list("a,,b,"), vec!["a".to_owned(), "b".to_owned()]);
        assert!(split_list("").is_empty());
    }
}
