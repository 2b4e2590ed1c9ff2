use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::EvalError;
use crate::id::TaskId;
use crate::registry::TypeRegistry;
use crate::task::TaskNode;
use crate::value::Datum;

/// The eagerly-computed outcome of one evaluation request.
pub type TaskValue = Result<Datum, EvalError>;

/// One link in the evaluation chain.
///
/// Contexts compose as decorators: each link owns the next and forwards
/// whatever it does not handle itself. `chain` is always the *outermost*
/// link, so recursive evaluation of a node's inputs re-enters the whole
/// chain, not just the current tail.
pub trait EvalContext: Send + Sync {
    /// Evaluates a node: materialize its inputs, evaluate them through the
    /// chain, then invoke its process function through the chain.
    fn evaluate(&self, node: &Arc<TaskNode>, chain: &dyn EvalContext) -> TaskValue;

    /// Invokes a node's process function with its resolved call arguments.
    fn invoke(&self, node: &Arc<TaskNode>, args: &[Datum], chain: &dyn EvalContext) -> TaskValue;
}

impl<T: EvalContext + ?Sized> EvalContext for Arc<T> {
    fn evaluate(&self, node: &Arc<TaskNode>, chain: &dyn EvalContext) -> TaskValue {
        (**self).evaluate(node, chain)
    }

    fn invoke(&self, node: &Arc<TaskNode>, args: &[Datum], chain: &dyn EvalContext) -> TaskValue {
        (**self).invoke(node, args, chain)
    }
}

/// The terminal link: actually walks the graph.
///
/// Inputs are evaluated in parallel and every branch runs to completion
/// even when a sibling fails, so a traversal visits the whole reachable
/// graph. When branches fail, a genuine failure wins over the
/// "persisted, not executed" sentinel.
pub struct Traverse;

impl EvalContext for Traverse {
    fn evaluate(&self, node: &Arc<TaskNode>, chain: &dyn EvalContext) -> TaskValue {
        let span = tracing::debug_span!("evaluate", task = %node.id());
        let _enter = span.enter();

        let inputs = node.inputs();
        let results: Vec<TaskValue> = inputs
            .par_iter()
            .map(|input| chain.evaluate(input, chain))
            .collect();

        let mut values = Vec::with_capacity(results.len());
        let mut sentinel = None;
        let mut genuine = None;

        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(error) if error.is_persisted() => {
                    if sentinel.is_none() {
                        sentinel = Some(error);
                    }
                }
                Err(error) => {
                    if genuine.is_none() {
                        genuine = Some(error);
                    }
                }
            }
        }

        if let Some(error) = genuine {
            return Err(error);
        }
        if let Some(error) = sentinel {
            return Err(error);
        }

        let mut call_args = node.args().to_vec();
        call_args.extend(values);

        chain.invoke(node, &call_args, chain)
    }

    fn invoke(&self, node: &Arc<TaskNode>, args: &[Datum], _chain: &dyn EvalContext) -> TaskValue {
        let process = node.process_fn()?;
        process(args).map_err(|cause| EvalError::Task {
            id: node.id().clone(),
            cause: Arc::new(cause),
        })
    }
}

/// A memoizing decorator: each distinct task identifier is evaluated once
/// per traversal, concurrent requests for the same identifier wait for the
/// first to finish and share its recorded outcome.
///
/// Without it, a diamond-shaped graph would re-enter the inner chain for
/// every path reaching the shared node.
pub struct Caching {
    inner: Box<dyn EvalContext>,
    cache: Mutex<HashMap<TaskId, Arc<OnceLock<TaskValue>>>>,
}

impl Caching {
    pub fn new(inner: impl EvalContext + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl EvalContext for Caching {
    fn evaluate(&self, node: &Arc<TaskNode>, chain: &dyn EvalContext) -> TaskValue {
        let cell = {
            let mut cache = self.cache.lock().unwrap();
            cache
                .entry(node.id().clone())
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };

        cell.get_or_init(|| self.inner.evaluate(node, chain)).clone()
    }

    fn invoke(&self, node: &Arc<TaskNode>, args: &[Datum], chain: &dyn EvalContext) -> TaskValue {
        self.inner.invoke(node, args, chain)
    }
}

/// A decorator that installs a [`TypeRegistry`] as the scoped resolution
/// context around every chain call it forwards.
///
/// Scopes are thread-local, and a parallel traversal hops threads; routing
/// every re-entry through this link puts the registry in scope on whichever
/// thread ends up resolving a node's operation.
pub struct Scoped {
    inner: Box<dyn EvalContext>,
    registry: Arc<TypeRegistry>,
}

impl Scoped {
    pub fn new(registry: Arc<TypeRegistry>, inner: impl EvalContext + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            registry,
        }
    }
}

impl EvalContext for Scoped {
    fn evaluate(&self, node: &Arc<TaskNode>, chain: &dyn EvalContext) -> TaskValue {
        TypeRegistry::scope(&self.registry, || self.inner.evaluate(node, chain))
    }

    fn invoke(&self, node: &Arc<TaskNode>, args: &[Datum], chain: &dyn EvalContext) -> TaskValue {
        TypeRegistry::scope(&self.registry, || self.inner.invoke(node, args, chain))
    }
}
