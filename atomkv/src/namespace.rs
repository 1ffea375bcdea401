//! Namespaced stores
//!
//! A [`Namespace`] is a key prefix. Instance-scoped namespaces must be
//! bound to a runtime identifier before any key can be derived from them;
//! binding without an identifier fails with
//! `StoreError::NamespaceMissingIdentifier` instead of producing a
//! malformed key.
//!
//! Keys are built with a single delimiter:
//!
//! ```text
//! <prefix>                      global singleton document
//! <prefix>.<id>                 document of one instance
//! <prefix>.<id>.<field>         one field of an instance (one atom each)
//! ```
//!
//! Each field of a [`NamespacedStore`] is its own atom and its own stored
//! key, so writing one field never touches another.

use std::future::Future;

use futures::future::join_all;
use serde_json::{Map, Value};

use crate::atom::{Atom, Status};
use crate::backend::{Backend, Key};
use crate::binding::Binding;
use crate::error::StoreError;
use crate::registry::AtomRegistry;

/// Separator between key parts
pub const DELIMITER: char = '.';

fn validate_part(part: &str) -> Result<(), StoreError> {
    if part.is_empty() || part.contains(DELIMITER) {
        Err(StoreError::InvalidKey(part.to_string()))
    } else {
        Ok(())
    }
}

/// Unbound key prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Bind to a runtime identifier
    ///
    /// # Errors
    ///
    /// `NamespaceMissingIdentifier` if `id` is `None` or blank;
    /// `InvalidKey` if the prefix or identifier is empty or contains the delimiter.
    pub fn bind(&self, id: Option<&str>) -> Result<BoundNamespace, StoreError> {
        validate_part(&self.prefix)?;
        let id = match id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(StoreError::NamespaceMissingIdentifier {
                    prefix: self.prefix.clone(),
                })
            }
        };
        validate_part(id)?;
        Ok(BoundNamespace {
            prefix: self.prefix.clone(),
            id: Some(id.to_string()),
        })
    }

    /// Use the prefix alone, for global singleton documents
    ///
    /// # Errors
    ///
    /// `InvalidKey` if the prefix is empty or contains the delimiter.
    pub fn global(&self) -> Result<BoundNamespace, StoreError> {
        validate_part(&self.prefix)?;
        Ok(BoundNamespace {
            prefix: self.prefix.clone(),
            id: None,
        })
    }
}

/// Namespace with its identifier resolved; keys can be derived from it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundNamespace {
    prefix: String,
    id: Option<String>,
}

impl BoundNamespace {
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Key of the namespace's own document
    #[must_use]
    pub fn key(&self) -> Key {
        match &self.id {
            Some(id) => format!("{}{DELIMITER}{id}", self.prefix),
            None => self.prefix.clone(),
        }
    }

    /// Key of one field
    ///
    /// # Errors
    ///
    /// `InvalidKey` if the field is empty or contains the delimiter.
    pub fn field_key(&self, field: &str) -> Result<Key, StoreError> {
        validate_part(field)?;
        Ok(format!("{}{DELIMITER}{field}", self.key()))
    }

    /// Field name of a key derived from this namespace
    #[must_use]
    pub fn field_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        let field = key
            .strip_prefix(self.key().as_str())?
            .strip_prefix(DELIMITER)?;
        (!field.is_empty() && !field.contains(DELIMITER)).then_some(field)
    }
}

impl std::fmt::Display for BoundNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Scoped view of a registry: one atom per field of a bound namespace
pub struct NamespacedStore<B: Backend> {
    registry: AtomRegistry<B>,
    namespace: BoundNamespace,
}

impl<B: Backend> NamespacedStore<B> {
    /// Store for `prefix` bound to `runtime_id`
    ///
    /// # Errors
    ///
    /// `NamespaceMissingIdentifier` if the identifier is not resolved yet.
    pub fn for_namespace(
        registry: &AtomRegistry<B>,
        prefix: &str,
        runtime_id: Option<&str>,
    ) -> Result<Self, StoreError> {
        let namespace = Namespace::new(prefix).bind(runtime_id)?;
        Ok(Self::new(registry, namespace))
    }

    #[must_use]
    pub fn new(registry: &AtomRegistry<B>, namespace: BoundNamespace) -> Self {
        Self {
            registry: registry.clone(),
            namespace,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &BoundNamespace {
        &self.namespace
    }

    /// Atom of one field
    ///
    /// # Errors
    ///
    /// `InvalidKey` for a malformed field name.
    pub fn get(&self, field: &str, default: Value) -> Result<Atom, StoreError> {
        let key = self.namespace.field_key(field)?;
        Ok(self.registry.get_or_create(key, default))
    }

    /// Set one field, leaving every other field untouched
    pub fn set(
        &self,
        field: &str,
        value: Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let pending = self
            .namespace
            .field_key(field)
            .map(|key| self.registry.set(key, value));
        async move { pending?.await }
    }

    /// Set several fields with one batched write
    ///
    /// Nothing is applied if any field name is malformed.
    pub fn set_fields<S, I>(&self, patch: I) -> impl Future<Output = Result<(), StoreError>> + Send + 'static
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, Value)>,
    {
        let patch: Result<Vec<(Key, Value)>, StoreError> = patch
            .into_iter()
            .map(|(field, value)| Ok((self.namespace.field_key(field.as_ref())?, value)))
            .collect();
        let pending = patch.map(|patch| self.registry.set_many(patch));
        async move { pending?.await }
    }

    /// Remove one field
    pub fn remove(&self, field: &str) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let pending = self
            .namespace
            .field_key(field)
            .map(|key| self.registry.remove(key));
        async move { pending?.await }
    }

    /// Attach a binding to one field
    ///
    /// # Errors
    ///
    /// `InvalidKey` for a malformed field name.
    pub fn bind<F>(&self, field: &str, default: Value, listener: F) -> Result<Binding, StoreError>
    where
        F: Fn(&Value, Status) + Send + Sync + 'static,
    {
        let atom = self.get(field, default)?;
        Ok(Binding::attach(&atom, listener))
    }

    /// Fields of this namespace that have an atom in this context, sorted
    #[must_use]
    pub fn fields(&self) -> Vec<String> {
        self.registry
            .keys()
            .iter()
            .filter_map(|key| self.namespace.field_of(key).map(str::to_string))
            .collect()
    }

    /// Compose the cached values of all known fields into one object
    #[must_use]
    pub fn document(&self) -> Value {
        let mut document = Map::new();
        for field in self.fields() {
            let Ok(key) = self.namespace.field_key(&field) else {
                continue;
            };
            if let Some(atom) = self.registry.get(&key) {
                document.insert(field, atom.value());
            }
        }
        Value::Object(document)
    }

    /// Load the given fields (with defaults) and compose the document once they settle
    ///
    /// # Errors
    ///
    /// `InvalidKey` for a malformed field name, or the first load error.
    pub async fn load_document<S, I>(&self, defaults: I) -> Result<Value, StoreError>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, Value)>,
    {
        let requests = defaults
            .into_iter()
            .map(|(field, default)| Ok((self.namespace.field_key(field.as_ref())?, default)))
            .collect::<Result<Vec<(Key, Value)>, StoreError>>()?;
        let atoms = self.registry.get_many(requests);
        for result in join_all(atoms.iter().map(|atom| atom.ready())).await {
            result?;
        }
        Ok(self.document())
    }
}

impl<B: Backend> std::fmt::Debug for NamespacedStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedStore")
            .field("namespace", &self.namespace.key())
            .field("context", &self.registry.context())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_requires_identifier() {
        let ns = Namespace::new("WidgetStorage");
        assert_eq!(
            ns.bind(None),
            Err(StoreError::NamespaceMissingIdentifier {
                prefix: "WidgetStorage".to_string()
            })
        );
        assert!(matches!(
            ns.bind(Some("  ")),
            Err(StoreError::NamespaceMissingIdentifier { .. })
        ));
    }

    #[test]
    fn test_keys_are_deterministic() {
        let ns = Namespace::new("WidgetStorage").bind(Some("widget-42")).unwrap();
        assert_eq!(ns.key(), "WidgetStorage.widget-42");
        assert_eq!(ns.field_key("title").unwrap(), "WidgetStorage.widget-42.title");
        assert_eq!(ns.field_of("WidgetStorage.widget-42.title"), Some("title"));
        assert_eq!(ns.field_of("WidgetStorage.widget-420.title"), None);
        assert_eq!(ns.field_of("WidgetStorage.widget-42"), None);
    }

    #[test]
    fn test_delimiter_is_rejected_in_parts() {
        let ns = Namespace::new("WidgetStorage");
        assert!(matches!(ns.bind(Some("a.b")), Err(StoreError::InvalidKey(_))));

        let bound = ns.bind(Some("w1")).unwrap();
        assert!(matches!(bound.field_key("x.y"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(bound.field_key(""), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_global_namespace_key_is_prefix() {
        let ns = Namespace::new("FeatureToggles").global().unwrap();
        assert_eq!(ns.key(), "FeatureToggles");
        assert_eq!(ns.id(), None);
        assert_eq!(ns.field_key("beta").unwrap(), "FeatureToggles.beta");
    }
}
