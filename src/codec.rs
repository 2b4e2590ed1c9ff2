use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::resolver::TypeResolver;
use crate::value::{BindingKind, Datum, Object, TypeBinding};

const FORMAT_VERSION: u16 = 1;

/// Outer frame of a persisted record: a format version, a blake3 digest of
/// the body, and the CBOR-encoded body itself. The digest turns truncation
/// and bit rot into a loud decode failure instead of a quiet misparse.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    digest: [u8; 32],
    body: Vec<u8>,
}

/// The object graph proper: every composite hoisted into a table addressed
/// by slot, so a sub-object referenced from several places is written once
/// and decodes back to a single shared instance.
#[derive(Serialize, Deserialize)]
struct Body {
    objects: Vec<WireObject>,
    root: Wire,
}

#[derive(Serialize, Deserialize)]
enum Wire {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Wire>),
    Slot(u32),
}

/// What the writer knew about an object's type. For records this is the
/// embedded resolution metadata a [`TypeResolver`] may fall back to.
#[derive(Serialize, Deserialize)]
enum WireShape {
    Record { name: String, fields: Vec<String> },
    Proxy { interfaces: Vec<String> },
}

#[derive(Serialize, Deserialize)]
struct WireObject {
    shape: WireShape,
    fields: Vec<(String, Wire)>,
}

/// Serializes a value graph to bytes.
pub fn encode(value: &Datum) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = Vec::new();
    encode_into(value, &mut buffer)?;
    Ok(buffer)
}

/// Serializes a value graph into `sink`. The sink is consumed and dropped on
/// every path, success or failure.
pub fn encode_into<W: Write>(value: &Datum, sink: W) -> Result<(), EncodeError> {
    let body = lower(value)?;

    let mut payload = Vec::new();
    ciborium::into_writer(&body, &mut payload)?;

    let digest: [u8; 32] = blake3::hash(&payload).into();
    let envelope = Envelope {
        version: FORMAT_VERSION,
        digest,
        body: payload,
    };

    ciborium::into_writer(&envelope, sink)?;
    Ok(())
}

/// Reconstructs a value graph from `source`, resolving every recorded type
/// and interface set through `resolver`. The source is consumed and dropped
/// on every path.
pub fn decode<R: Read>(source: R, resolver: &dyn TypeResolver) -> Result<Datum, DecodeError> {
    let envelope: Envelope = ciborium::from_reader(source)?;

    if envelope.version != FORMAT_VERSION {
        return Err(DecodeError::Version(envelope.version));
    }

    let digest: [u8; 32] = blake3::hash(&envelope.body).into();
    if digest != envelope.digest {
        return Err(DecodeError::Digest);
    }

    let body: Body = ciborium::from_reader(envelope.body.as_slice())?;
    raise(&body, resolver)
}

pub fn decode_bytes(bytes: &[u8], resolver: &dyn TypeResolver) -> Result<Datum, DecodeError> {
    decode(bytes, resolver)
}

pub fn decode_file(
    path: impl AsRef<Utf8Path>,
    resolver: &dyn TypeResolver,
) -> Result<Datum, DecodeError> {
    let file = File::open(path.as_ref())?;
    decode(BufReader::new(file), resolver)
}

#[derive(Default)]
struct Lowering {
    slots: HashMap<*const Object, u32>,
    objects: Vec<Option<WireObject>>,
}

impl Lowering {
    fn datum(&mut self, value: &Datum) -> Result<Wire, EncodeError> {
        Ok(match value {
            Datum::Unit => Wire::Unit,
            Datum::Bool(value) => Wire::Bool(*value),
            Datum::Int(value) => Wire::Int(*value),
            Datum::Float(value) => Wire::Float(*value),
            Datum::Text(text) => Wire::Text(text.to_string()),
            Datum::Bytes(bytes) => Wire::Bytes(bytes.to_vec()),
            Datum::List(items) => Wire::List(
                items
                    .iter()
                    .map(|item| self.datum(item))
                    .collect::<Result<_, _>>()?,
            ),
            Datum::Object(object) => Wire::Slot(self.object(object)?),
            Datum::Opaque(opaque) => {
                return Err(EncodeError::Unserializable(opaque.type_name()));
            }
        })
    }

    fn object(&mut self, object: &Arc<Object>) -> Result<u32, EncodeError> {
        let ptr = Arc::as_ptr(object);
        if let Some(&slot) = self.slots.get(&ptr) {
            return Ok(slot);
        }

        // Reserve the slot before descending so a sibling reference to the
        // same instance lands on it.
        let slot = self.objects.len() as u32;
        self.objects.push(None);
        self.slots.insert(ptr, slot);

        let shape = match object.binding().kind() {
            BindingKind::Record { .. } => WireShape::Record {
                name: object.binding().name().to_string(),
                fields: object.fields().iter().map(|(key, _)| key.to_string()).collect(),
            },
            BindingKind::Proxy { interfaces, .. } => WireShape::Proxy {
                interfaces: interfaces.iter().map(|name| name.to_string()).collect(),
            },
        };

        let mut fields = Vec::with_capacity(object.fields().len());
        for (key, value) in object.fields() {
            fields.push((key.to_string(), self.datum(value)?));
        }

        self.objects[slot as usize] = Some(WireObject { shape, fields });
        Ok(slot)
    }
}

fn lower(root: &Datum) -> Result<Body, EncodeError> {
    let mut lowering = Lowering::default();
    let root = lowering.datum(root)?;
    let objects = lowering
        .objects
        .into_iter()
        .map(|object| object.expect("reserved slot left unfilled"))
        .collect();

    Ok(Body { objects, root })
}

enum Slot {
    Empty,
    Busy,
    Done(Arc<Object>),
}

struct Raising<'a> {
    body: &'a Body,
    resolver: &'a dyn TypeResolver,
    slots: Vec<Slot>,
}

impl<'a> Raising<'a> {
    fn datum(&mut self, wire: &'a Wire) -> Result<Datum, DecodeError> {
        Ok(match wire {
            Wire::Unit => Datum::Unit,
            Wire::Bool(value) => Datum::Bool(*value),
            Wire::Int(value) => Datum::Int(*value),
            Wire::Float(value) => Datum::Float(*value),
            Wire::Text(text) => Datum::text(text),
            Wire::Bytes(bytes) => Datum::bytes(bytes),
            Wire::List(items) => Datum::List(
                items
                    .iter()
                    .map(|item| self.datum(item))
                    .collect::<Result<_, _>>()?,
            ),
            Wire::Slot(slot) => Datum::Object(self.object(*slot)?),
        })
    }

    fn object(&mut self, slot: u32) -> Result<Arc<Object>, DecodeError> {
        let index = slot as usize;
        if index >= self.slots.len() {
            return Err(DecodeError::UnknownSlot(slot));
        }

        match &self.slots[index] {
            Slot::Done(object) => return Ok(object.clone()),
            Slot::Busy => return Err(DecodeError::SlotCycle(slot)),
            Slot::Empty => {}
        }
        self.slots[index] = Slot::Busy;

        let body = self.body;
        let record = &body.objects[index];

        let binding = match &record.shape {
            WireShape::Record { name, fields } => self.resolver.resolve_type(name, fields)?,
            WireShape::Proxy { interfaces } => self.resolver.resolve_proxy(interfaces)?,
        };
        check_shape(&binding, record)?;

        let mut fields = Vec::with_capacity(record.fields.len());
        for (key, value) in &record.fields {
            fields.push((key.as_str(), self.datum(value)?));
        }

        let object = Arc::new(Object::new(binding, fields));
        self.slots[index] = Slot::Done(object.clone());
        Ok(object)
    }
}

fn raise(body: &Body, resolver: &dyn TypeResolver) -> Result<Datum, DecodeError> {
    let mut raising = Raising {
        body,
        resolver,
        slots: body.objects.iter().map(|_| Slot::Empty).collect(),
    };

    raising.datum(&body.root)
}

fn check_shape(binding: &TypeBinding, record: &WireObject) -> Result<(), DecodeError> {
    let recorded: HashSet<&str> = record.fields.iter().map(|(key, _)| key.as_str()).collect();

    match binding.kind() {
        BindingKind::Record { fields: None } => Ok(()),
        BindingKind::Record {
            fields: Some(declared),
        } => {
            let declared: HashSet<&str> = declared.iter().map(|field| &**field).collect();
            if recorded != declared {
                let mut expected: Vec<_> = declared.into_iter().collect();
                expected.sort_unstable();
                let mut found: Vec<_> = recorded.into_iter().collect();
                found.sort_unstable();
                return Err(DecodeError::Shape(
                    binding.name().into(),
                    format!(
                        "declared fields [{}], recorded [{}]",
                        expected.join(","),
                        found.join(",")
                    ),
                ));
            }
            Ok(())
        }
        BindingKind::Proxy {
            fields: declared, ..
        } => {
            let declared: HashSet<&str> = declared.iter().map(|field| &**field).collect();
            if let Some(stray) = recorded.iter().find(|key| !declared.contains(*key)) {
                return Err(DecodeError::Shape(
                    binding.name().into(),
                    format!("field '{stray}' is not declared by any implemented interface"),
                ));
            }
            Ok(())
        }
    }
}
