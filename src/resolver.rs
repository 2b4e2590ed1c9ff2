use std::sync::Arc;

use crate::error::DecodeError;
use crate::registry::TypeRegistry;
use crate::value::TypeBinding;

/// Decode-side policy mapping recorded type and interface names to concrete
/// runtime types.
///
/// The codec never resolves names on its own; every named record and proxy
/// in a stream goes through the resolver supplied to
/// [`decode`](crate::decode).
pub trait TypeResolver: Send + Sync {
    /// Resolves a recorded type name to the binding to instantiate.
    /// `recorded` is the field list embedded in the stream by the writer.
    fn resolve_type(
        &self,
        name: &str,
        recorded: &[String],
    ) -> Result<Arc<TypeBinding>, DecodeError>;

    /// Resolves a recorded interface-name set to a generated stand-in type.
    fn resolve_proxy(&self, interfaces: &[String]) -> Result<Arc<TypeBinding>, DecodeError>;
}

/// Resolves against the live resolution context of the *decoding* process,
/// not the context the record was written under.
///
/// Named types are looked up in the ambient registry first; the caller's own
/// registration wins over whatever the writer had in mind. Only when the
/// ambient context has no type of that name does the stream's embedded field
/// list supply a detached fallback binding. Proxy types have no fallback:
/// every named interface must exist in the ambient context.
///
/// The ambient context is found fresh on every call: the calling thread's
/// [`TypeRegistry::scope`] override, else the registry this resolver was
/// constructed with, else the process-global default. No allow-list is
/// applied; any registered name is constructible from a crafted record.
pub struct ContextResolver {
    registry: Option<Arc<TypeRegistry>>,
}

impl ContextResolver {
    /// A resolver using only the ambient context (scoped override or the
    /// process-global default).
    pub fn new() -> Self {
        Self { registry: None }
    }

    /// A resolver carrying its own registry, consulted when no scoped
    /// override is installed.
    pub fn with_registry(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// The registry in effect for this call.
    pub fn context(&self) -> Arc<TypeRegistry> {
        TypeRegistry::scoped()
            .or_else(|| self.registry.clone())
            .unwrap_or_else(TypeRegistry::global)
    }
}

impl Default for ContextResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeResolver for ContextResolver {
    fn resolve_type(
        &self,
        name: &str,
        recorded: &[String],
    ) -> Result<Arc<TypeBinding>, DecodeError> {
        match self.context().lookup_type(name) {
            Some(binding) => Ok(binding),
            None => {
                tracing::debug!(name, "type not in ambient context, using recorded shape");
                Ok(TypeBinding::detached(name, recorded))
            }
        }
    }

    fn resolve_proxy(&self, interfaces: &[String]) -> Result<Arc<TypeBinding>, DecodeError> {
        self.context().proxy(interfaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_ambient_registration_wins() {
        let registry = Arc::new(TypeRegistry::default());
        let own = TypeBinding::record("widget", ["a", "b"]);
        registry.register_type(own.clone());

        let resolver = ContextResolver::with_registry(registry);
        let resolved = resolver.resolve_type("widget", &recorded()).unwrap();
        assert!(Arc::ptr_eq(&resolved, &own));
    }

    #[test]
    fn test_falls_back_to_recorded_shape() {
        let resolver = ContextResolver::with_registry(Arc::new(TypeRegistry::default()));
        let resolved = resolver.resolve_type("widget", &recorded()).unwrap();

        assert_eq!(resolved.name(), "widget");
        match resolved.kind() {
            crate::value::BindingKind::Record {
                fields: Some(fields),
            } => {
                assert_eq!(fields.len(), 2);
                assert_eq!(&*fields[0], "a");
            }
            _ => panic!("expected a detached record binding"),
        }
    }

    #[test]
    fn test_scoped_override_beats_own_registry() {
        let own = Arc::new(TypeRegistry::default());
        own.register_type(TypeBinding::record("widget", ["a"]));

        let scoped = Arc::new(TypeRegistry::default());
        let scoped_binding = TypeBinding::record("widget", ["a", "b"]);
        scoped.register_type(scoped_binding.clone());

        let resolver = ContextResolver::with_registry(own);
        let resolved = TypeRegistry::scope(&scoped, || {
            resolver.resolve_type("widget", &recorded()).unwrap()
        });
        assert!(Arc::ptr_eq(&resolved, &scoped_binding));
    }
}
