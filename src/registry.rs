use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::DecodeError;
use crate::task::ProcessFn;
use crate::value::{Datum, TypeBinding};

thread_local! {
    static SCOPED: RefCell<Vec<Arc<TypeRegistry>>> = const { RefCell::new(Vec::new()) };
}

static GLOBAL: LazyLock<Arc<TypeRegistry>> = LazyLock::new(|| {
    let registry = TypeRegistry::default();
    crate::task::register_builtins(&registry);
    Arc::new(registry)
});

/// An interface a proxy value can implement: a name plus the fields it
/// contributes to the generated stand-in type.
#[derive(Debug)]
pub struct InterfaceDef {
    name: Box<str>,
    fields: Box<[Box<str>]>,
}

impl InterfaceDef {
    pub fn new<N, F, I>(name: N, fields: F) -> Arc<Self>
    where
        N: Into<Box<str>>,
        F: IntoIterator<Item = I>,
        I: Into<Box<str>>,
    {
        Arc::new(Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Box<str>] {
        &self.fields
    }
}

/// A resolution context: the set of types, interfaces, and operations a
/// process knows how to reconstruct.
///
/// Registries are consulted at decode time, never captured at encode time.
/// The "live" registry is found through a three-level fallback: the innermost
/// [`scope`](Self::scope) override on the calling thread, then whatever
/// registry the caller supplied (see
/// [`ContextResolver`](crate::ContextResolver)), then the process-global
/// default, which is pre-seeded with the builtin task types.
///
/// All lookups are read-only and safe to run from concurrent decodes.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<Box<str>, Arc<TypeBinding>>>,
    interfaces: RwLock<HashMap<Box<str>, Arc<InterfaceDef>>>,
    proxies: RwLock<HashMap<Box<[Box<str>]>, Arc<TypeBinding>>>,
    ops: RwLock<HashMap<Box<str>, ProcessFn>>,
}

impl TypeRegistry {
    /// Registers a record type under its binding name, replacing any
    /// previous binding of that name.
    pub fn register_type(&self, binding: Arc<TypeBinding>) {
        let name = binding.name().into();
        self.types.write().unwrap().insert(name, binding);
    }

    pub fn register_interface(&self, def: Arc<InterfaceDef>) {
        let name = def.name().into();
        self.interfaces.write().unwrap().insert(name, def);
    }

    /// Registers a named operation used to invoke rehydrated tasks.
    pub fn register_op<F>(&self, name: impl Into<Box<str>>, op: F)
    where
        F: Fn(&[Datum]) -> anyhow::Result<Datum> + Send + Sync + 'static,
    {
        self.ops.write().unwrap().insert(name.into(), Arc::new(op));
    }

    pub fn lookup_type(&self, name: &str) -> Option<Arc<TypeBinding>> {
        self.types.read().unwrap().get(name).cloned()
    }

    pub fn lookup_interface(&self, name: &str) -> Option<Arc<InterfaceDef>> {
        self.interfaces.read().unwrap().get(name).cloned()
    }

    pub fn lookup_op(&self, name: &str) -> Option<ProcessFn> {
        self.ops.read().unwrap().get(name).cloned()
    }

    /// Fetches or builds the stand-in type implementing exactly the given
    /// ordered interface set.
    ///
    /// The generated binding carries the union of the interfaces' declared
    /// fields and is cached per interface list, so repeated resolution of
    /// the same set yields the same binding instance.
    pub fn proxy(&self, interfaces: &[String]) -> Result<Arc<TypeBinding>, DecodeError> {
        if interfaces.is_empty() {
            return Err(DecodeError::EmptyProxy);
        }

        let key: Box<[Box<str>]> = interfaces.iter().map(|name| name.as_str().into()).collect();
        if let Some(binding) = self.proxies.read().unwrap().get(&key) {
            return Ok(binding.clone());
        }

        let defs = interfaces
            .iter()
            .map(|name| {
                self.lookup_interface(name)
                    .ok_or_else(|| DecodeError::UnknownInterface(name.as_str().into()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for def in &defs {
            for field in def.fields() {
                if seen.insert(&**field) {
                    fields.push(field.clone());
                }
            }
        }

        let name = format!("proxy<{}>", interfaces.join("+"));
        let binding = TypeBinding::proxy(name, key.clone(), fields.into_boxed_slice());

        // Two concurrent builders race benignly, the first insert wins.
        let binding = self
            .proxies
            .write()
            .unwrap()
            .entry(key)
            .or_insert(binding)
            .clone();

        Ok(binding)
    }

    /// Runs `f` with `registry` installed as the calling thread's resolution
    /// context. Scopes nest, the innermost wins.
    pub fn scope<R>(registry: &Arc<TypeRegistry>, f: impl FnOnce() -> R) -> R {
        struct Guard;

        impl Drop for Guard {
            fn drop(&mut self) {
                SCOPED.with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }

        SCOPED.with(|stack| stack.borrow_mut().push(registry.clone()));
        let _guard = Guard;
        f()
    }

    /// The innermost scoped registry on the calling thread, if any.
    pub fn scoped() -> Option<Arc<TypeRegistry>> {
        SCOPED.with(|stack| stack.borrow().last().cloned())
    }

    /// The live resolution context: the scoped override if one is set, else
    /// the process-global default.
    pub fn current() -> Arc<TypeRegistry> {
        Self::scoped().unwrap_or_else(Self::global)
    }

    /// The process-global default registry.
    pub fn global() -> Arc<TypeRegistry> {
        GLOBAL.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> Arc<TypeRegistry> {
        let registry = TypeRegistry::default();
        registry.register_interface(InterfaceDef::new("reader", ["source"]));
        registry.register_interface(InterfaceDef::new("writer", ["sink", "source"]));
        Arc::new(registry)
    }

    #[test]
    fn test_proxy_union_and_cache() {
        let registry = make_registry();
        let names = vec!["reader".to_string(), "writer".to_string()];

        let first = registry.proxy(&names).unwrap();
        assert!(first.is_proxy());
        assert_eq!(first.name(), "proxy<reader+writer>");

        match first.kind() {
            crate::value::BindingKind::Proxy { fields, .. } => {
                // union keeps first-seen order, no duplicates
                assert_eq!(fields.len(), 2);
                assert_eq!(&*fields[0], "source");
                assert_eq!(&*fields[1], "sink");
            }
            _ => panic!("expected proxy binding"),
        }

        let second = registry.proxy(&names).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_proxy_unknown_interface() {
        let registry = make_registry();
        let names = vec!["reader".to_string(), "closer".to_string()];
        assert!(matches!(
            registry.proxy(&names),
            Err(DecodeError::UnknownInterface(name)) if &*name == "closer"
        ));
    }

    #[test]
    fn test_proxy_empty_set() {
        let registry = make_registry();
        assert!(matches!(registry.proxy(&[]), Err(DecodeError::EmptyProxy)));
    }

    #[test]
    fn test_scope_nesting() {
        let outer = make_registry();
        let inner = make_registry();

        assert!(TypeRegistry::scoped().is_none());

        TypeRegistry::scope(&outer, || {
            assert!(Arc::ptr_eq(&TypeRegistry::current(), &outer));

            TypeRegistry::scope(&inner, || {
                assert!(Arc::ptr_eq(&TypeRegistry::current(), &inner));
            });

            assert!(Arc::ptr_eq(&TypeRegistry::current(), &outer));
        });

        assert!(TypeRegistry::scoped().is_none());
    }

    #[test]
    fn test_global_has_builtin_task_types() {
        let global = TypeRegistry::global();
        assert!(global.lookup_type("task.node").is_some());
        assert!(global.lookup_type("task.id").is_some());
    }

    #[test]
    fn test_op_registration() {
        let registry = make_registry();
        registry.register_op("double", |args| match args {
            [Datum::Int(n)] => Ok(Datum::Int(n * 2)),
            _ => anyhow::bail!("expected one integer"),
        });

        let op = registry.lookup_op("double").unwrap();
        let out = op(&[Datum::Int(21)]).unwrap();
        assert!(out.structurally_eq(&Datum::Int(42)));
        assert!(registry.lookup_op("triple").is_none());
    }
}
