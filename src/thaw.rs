use std::sync::Arc;

use camino::Utf8Path;

use crate::codec;
use crate::context::{Caching, EvalContext, Scoped, TaskValue, Traverse};
use crate::error::DecodeError;
use crate::registry::TypeRegistry;
use crate::resolver::{ContextResolver, TypeResolver};
use crate::task::TaskNode;

/// Rehydrates a persisted task using the ambient resolution context.
pub fn thaw(path: impl AsRef<Utf8Path>) -> Result<Arc<TaskNode>, DecodeError> {
    thaw_with(path, &ContextResolver::new())
}

/// Rehydrates a persisted task using an explicit resolver.
///
/// The reconstructed graph carries identifiers, captured arguments, and the
/// full input structure of the original, with shared inputs still shared.
/// Process functions come back as operation names; they bind to actual code
/// when the graph is run.
pub fn thaw_with(
    path: impl AsRef<Utf8Path>,
    resolver: &dyn TypeResolver,
) -> Result<Arc<TaskNode>, DecodeError> {
    let datum = codec::decode_file(path, resolver)?;
    TaskNode::from_datum(&datum)
}

/// Evaluates a thawed graph, resolving operations from the ambient
/// resolution context.
pub fn run(root: &Arc<TaskNode>) -> TaskValue {
    let chain = Caching::new(Traverse);
    chain.evaluate(root, &chain)
}

/// Evaluates a thawed graph with `registry` installed as the resolution
/// context on every thread the traversal touches.
pub fn run_with(root: &Arc<TaskNode>, registry: Arc<TypeRegistry>) -> TaskValue {
    let chain = Scoped::new(registry, Caching::new(Traverse));
    chain.evaluate(root, &chain)
}
