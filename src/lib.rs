#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod codec;
mod context;
mod error;
mod freeze;
mod id;
#[cfg(feature = "logging")]
pub mod logging;
mod registry;
mod resolver;
mod task;
mod thaw;
mod value;

pub use crate::codec::{decode, decode_bytes, decode_file, encode, encode_into};
pub use crate::context::{Caching, EvalContext, Scoped, TaskValue, Traverse};
pub use crate::error::{DecodeError, EncodeError, EvalError, FreezeError, RuntimeError};
pub use crate::freeze::{Freezer, Manifest, freeze};
pub use crate::id::{TaskId, sanitize};
pub use crate::registry::{InterfaceDef, TypeRegistry};
pub use crate::resolver::{ContextResolver, TypeResolver};
pub use crate::task::{ProcessFn, TaskBuilder, TaskNode};
pub use crate::thaw::{run, run_with, thaw, thaw_with};
pub use crate::value::{BindingKind, Datum, Dynamic, Object, Opaque, TypeBinding};
