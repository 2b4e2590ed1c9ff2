use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A type-erased, thread-safe container.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// A runtime-only payload carried through the value model by reference.
///
/// Opaque values can travel through task arguments and evaluation results,
/// but they have no persisted representation; encoding a graph that reaches
/// one fails with the offending type name.
#[derive(Clone)]
pub struct Opaque {
    name: &'static str,
    value: Dynamic,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl Debug for Opaque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opaque({})", self.name)
    }
}

/// A value in the object-graph model.
///
/// Composite values are held behind `Arc`, so a sub-object referenced from
/// several places is one instance, and the codec preserves that sharing
/// across a round trip.
#[derive(Clone, Debug)]
pub enum Datum {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(Arc<str>),
    Bytes(Arc<[u8]>),
    List(Vec<Datum>),
    Object(Arc<Object>),
    Opaque(Opaque),
}

impl Datum {
    pub fn text(value: impl AsRef<str>) -> Self {
        Datum::Text(Arc::from(value.as_ref()))
    }

    pub fn bytes(value: impl AsRef<[u8]>) -> Self {
        Datum::Bytes(Arc::from(value.as_ref()))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Datum::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Datum::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Structural equivalence: same shape and contents, instance identity
    /// ignored. Floats compare by bit pattern. Opaque values never compare
    /// equal, they have no structure to compare.
    pub fn structurally_eq(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::Unit, Datum::Unit) => true,
            (Datum::Bool(a), Datum::Bool(b)) => a == b,
            (Datum::Int(a), Datum::Int(b)) => a == b,
            (Datum::Float(a), Datum::Float(b)) => a.to_bits() == b.to_bits(),
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Bytes(a), Datum::Bytes(b)) => a == b,
            (Datum::List(a), Datum::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structurally_eq(y))
            }
            (Datum::Object(a), Datum::Object(b)) => {
                a.binding().name() == b.binding().name()
                    && a.fields().len() == b.fields().len()
                    && a.fields().iter().zip(b.fields()).all(|((ka, va), (kb, vb))| {
                        ka == kb && va.structurally_eq(vb)
                    })
            }
            _ => false,
        }
    }
}

/// An instance of a named composite or proxy type, with ordered named fields.
#[derive(Debug)]
pub struct Object {
    binding: Arc<TypeBinding>,
    fields: Vec<(Box<str>, Datum)>,
}

impl Object {
    pub fn new<I, K>(binding: Arc<TypeBinding>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Datum)>,
        K: Into<Box<str>>,
    {
        Self {
            binding,
            fields: fields
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        }
    }

    pub fn binding(&self) -> &Arc<TypeBinding> {
        &self.binding
    }

    pub fn fields(&self) -> &[(Box<str>, Datum)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Datum> {
        self.fields
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| value)
    }
}

/// A concrete runtime type an object can be instantiated with.
///
/// Bindings registered in a resolution context stand for the caller's own
/// types; detached bindings are built from a record's embedded metadata when
/// the ambient context has no type of that name.
#[derive(Debug)]
pub struct TypeBinding {
    name: Box<str>,
    kind: BindingKind,
}

#[derive(Debug)]
pub enum BindingKind {
    /// A named composite; `fields` is the declared field list, `None` for
    /// open records that accept any shape.
    Record { fields: Option<Box<[Box<str>]>> },
    /// A generated stand-in implementing a set of interfaces; `fields` is
    /// the union of the interfaces' declared fields.
    Proxy {
        interfaces: Box<[Box<str>]>,
        fields: Box<[Box<str>]>,
    },
}

impl TypeBinding {
    /// A record type with a declared field list.
    pub fn record<N, F, I>(name: N, fields: F) -> Arc<Self>
    where
        N: Into<Box<str>>,
        F: IntoIterator<Item = I>,
        I: Into<Box<str>>,
    {
        Arc::new(Self {
            name: name.into(),
            kind: BindingKind::Record {
                fields: Some(fields.into_iter().map(Into::into).collect()),
            },
        })
    }

    /// A record type accepting any field shape.
    pub fn open_record(name: impl Into<Box<str>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: BindingKind::Record { fields: None },
        })
    }

    /// A binding reconstructed from a record's own embedded metadata rather
    /// than a resolution context.
    pub fn detached(name: &str, recorded: &[String]) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: BindingKind::Record {
                fields: Some(recorded.iter().map(|field| field.as_str().into()).collect()),
            },
        })
    }

    pub(crate) fn proxy(
        name: impl Into<Box<str>>,
        interfaces: Box<[Box<str>]>,
        fields: Box<[Box<str>]>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: BindingKind::Proxy { interfaces, fields },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &BindingKind {
        &self.kind
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, BindingKind::Proxy { .. })
    }

    /// The interface names a proxy binding implements.
    pub fn interfaces(&self) -> Option<&[Box<str>]> {
        match &self.kind {
            BindingKind::Proxy { interfaces, .. } => Some(interfaces),
            BindingKind::Record { .. } => None,
        }
    }
}
