use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock};

use crate::error::{DecodeError, EvalError};
use crate::id::TaskId;
use crate::registry::TypeRegistry;
use crate::value::{Datum, Object, TypeBinding};

/// A task's process function: captured arguments followed by the evaluated
/// input values, producing the task's result.
pub type ProcessFn = Arc<dyn Fn(&[Datum]) -> anyhow::Result<Datum> + Send + Sync>;

type InputThunk = Box<dyn FnOnce() -> Vec<Arc<TaskNode>> + Send + Sync>;
type LazyInputs = LazyLock<Vec<Arc<TaskNode>>, InputThunk>;

static TASK_BINDING: LazyLock<Arc<TypeBinding>> =
    LazyLock::new(|| TypeBinding::record("task.node", ["id", "op", "args", "inputs"]));

static ID_BINDING: LazyLock<Arc<TypeBinding>> =
    LazyLock::new(|| TypeBinding::record("task.id", ["name", "args"]));

/// Seeds a registry with the record types every process needs to rehydrate
/// persisted tasks.
pub(crate) fn register_builtins(registry: &TypeRegistry) {
    registry.register_type(TASK_BINDING.clone());
    registry.register_type(ID_BINDING.clone());
}

/// A unit of the dependency graph: an identifier, lazily-expanded input
/// references, and a named operation invoked with the captured arguments
/// and the evaluated input values.
///
/// Inputs are computed on first access and cached; [`inputs`](Self::inputs)
/// is the explicit materialization step a node must go through before its
/// state can be snapshotted.
///
/// The operation is resolved by name from the ambient [`TypeRegistry`] at
/// invocation time, so a rehydrated node runs whatever the *current* process
/// registered under that name. Nodes built in-process may carry an inline
/// closure instead via [`TaskBuilder::process`].
pub struct TaskNode {
    id: TaskId,
    op: Box<str>,
    args: Vec<Datum>,
    inputs: LazyInputs,
    process: Option<ProcessFn>,
}

impl TaskNode {
    pub fn build(id: TaskId, op: impl Into<Box<str>>) -> TaskBuilder {
        TaskBuilder {
            id,
            op: op.into(),
            args: Vec::new(),
            inputs: None,
            process: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn args(&self) -> &[Datum] {
        &self.args
    }

    /// Forces full materialization of the input references and returns them.
    pub fn inputs(&self) -> &[Arc<TaskNode>] {
        self.inputs.as_slice()
    }

    /// The process function to invoke: the inline closure if the node has
    /// one, else the ambient registry's operation of this node's name.
    pub fn process_fn(&self) -> Result<ProcessFn, EvalError> {
        if let Some(process) = &self.process {
            return Ok(process.clone());
        }

        TypeRegistry::current()
            .lookup_op(&self.op)
            .ok_or_else(|| EvalError::UnknownOp(self.op.clone()))
    }

    /// Lowers a node (and transitively its materialized inputs) into the
    /// codec value model. Nodes referenced from several places lower to one
    /// shared object.
    pub fn to_datum(node: &Arc<TaskNode>) -> Datum {
        let mut memo = HashMap::new();
        Datum::Object(lower_node(node, &mut memo))
    }

    /// Rebuilds a node graph from its lowered form, preserving sharing.
    pub fn from_datum(datum: &Datum) -> Result<Arc<TaskNode>, DecodeError> {
        let object = datum
            .as_object()
            .ok_or_else(|| DecodeError::Task("root value is not a task object".to_string()))?;

        let mut memo = HashMap::new();
        raise_node(object, &mut memo)
    }
}

impl Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskNode({})", self.id)
    }
}

pub struct TaskBuilder {
    id: TaskId,
    op: Box<str>,
    args: Vec<Datum>,
    inputs: Option<InputThunk>,
    process: Option<ProcessFn>,
}

impl TaskBuilder {
    /// Appends a captured argument, serialized with the node.
    pub fn arg(mut self, value: Datum) -> Self {
        self.args.push(value);
        self
    }

    /// Sets the thunk producing this node's input references. It runs at
    /// most once, on first materialization.
    pub fn inputs<F>(mut self, thunk: F) -> Self
    where
        F: FnOnce() -> Vec<Arc<TaskNode>> + Send + Sync + 'static,
    {
        self.inputs = Some(Box::new(thunk));
        self
    }

    /// Sets an inline process function, overriding registry lookup.
    pub fn process<F>(mut self, process: F) -> Self
    where
        F: Fn(&[Datum]) -> anyhow::Result<Datum> + Send + Sync + 'static,
    {
        self.process = Some(Arc::new(process));
        self
    }

    pub fn finish(self) -> Arc<TaskNode> {
        let thunk: InputThunk = self.inputs.unwrap_or_else(|| Box::new(Vec::new));

        Arc::new(TaskNode {
            id: self.id,
            op: self.op,
            args: self.args,
            inputs: LazyLock::new(thunk),
            process: self.process,
        })
    }
}

fn id_to_datum(id: &TaskId) -> Datum {
    let args = id
        .args()
        .iter()
        .map(|(key, value)| Datum::List(vec![Datum::text(key), Datum::text(value)]))
        .collect();

    Datum::Object(Arc::new(Object::new(
        ID_BINDING.clone(),
        [
            ("name", Datum::text(id.name())),
            ("args", Datum::List(args)),
        ],
    )))
}

fn id_from_datum(datum: &Datum) -> Result<TaskId, DecodeError> {
    let object = datum
        .as_object()
        .filter(|object| object.binding().name() == "task.id")
        .ok_or_else(|| DecodeError::Task("expected a task.id record".to_string()))?;

    let name = object
        .field("name")
        .and_then(Datum::as_text)
        .ok_or_else(|| DecodeError::Task("task.id record without a name".to_string()))?;

    let mut id = TaskId::new(name);
    let Some(Datum::List(args)) = object.field("args") else {
        return Err(DecodeError::Task(
            "task.id record without an args list".to_string(),
        ));
    };

    for arg in args {
        let pair = match arg {
            Datum::List(pair) if pair.len() == 2 => pair,
            _ => {
                return Err(DecodeError::Task(
                    "task.id argument is not a key/value pair".to_string(),
                ));
            }
        };
        let (Some(key), Some(value)) = (pair[0].as_text(), pair[1].as_text()) else {
            return Err(DecodeError::Task(
                "task.id argument is not textual".to_string(),
            ));
        };
        id = id.with(key, value);
    }

    Ok(id)
}

fn lower_node(
    node: &Arc<TaskNode>,
    memo: &mut HashMap<*const TaskNode, Arc<Object>>,
) -> Arc<Object> {
    let ptr = Arc::as_ptr(node);
    if let Some(object) = memo.get(&ptr) {
        return object.clone();
    }

    let inputs: Vec<Datum> = node
        .inputs()
        .iter()
        .map(|input| Datum::Object(lower_node(input, memo)))
        .collect();

    let object = Arc::new(Object::new(
        TASK_BINDING.clone(),
        [
            ("id", id_to_datum(&node.id)),
            ("op", Datum::text(&*node.op)),
            ("args", Datum::List(node.args.clone())),
            ("inputs", Datum::List(inputs)),
        ],
    ));

    memo.insert(ptr, object.clone());
    object
}

fn raise_node(
    object: &Arc<Object>,
    memo: &mut HashMap<*const Object, Arc<TaskNode>>,
) -> Result<Arc<TaskNode>, DecodeError> {
    let ptr = Arc::as_ptr(object);
    if let Some(node) = memo.get(&ptr) {
        return Ok(node.clone());
    }

    if object.binding().name() != "task.node" {
        return Err(DecodeError::Task(format!(
            "expected a task.node record, found '{}'",
            object.binding().name()
        )));
    }

    let id = id_from_datum(
        object
            .field("id")
            .ok_or_else(|| DecodeError::Task("task.node record without an id".to_string()))?,
    )?;

    let Some(Datum::Text(op)) = object.field("op") else {
        return Err(DecodeError::Task(format!(
            "task '{id}' record without an operation name"
        )));
    };

    let args = match object.field("args") {
        Some(Datum::List(args)) => args.clone(),
        _ => {
            return Err(DecodeError::Task(format!(
                "task '{id}' record without an argument list"
            )));
        }
    };

    let inputs = match object.field("inputs") {
        Some(Datum::List(inputs)) => inputs
            .iter()
            .map(|input| match input {
                Datum::Object(object) => raise_node(object, memo),
                _ => Err(DecodeError::Task(format!(
                    "task '{id}' input is not a task object"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(DecodeError::Task(format!(
                "task '{id}' record without an input list"
            )));
        }
    };

    let thunk: InputThunk = Box::new(move || inputs);
    let node = Arc::new(TaskNode {
        id,
        op: (&**op).into(),
        args,
        inputs: LazyLock::new(thunk),
        process: None,
    });

    memo.insert(ptr, node.clone());
    Ok(node)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn make_leaf(name: &str) -> Arc<TaskNode> {
        TaskNode::build(TaskId::new(name), "noop").finish()
    }

    #[test]
    fn test_inputs_are_lazy() {
        let forced = Arc::new(AtomicUsize::new(0));
        let probe = forced.clone();

        let node = TaskNode::build(TaskId::new("Root"), "noop")
            .inputs(move || {
                probe.fetch_add(1, Ordering::SeqCst);
                vec![make_leaf("Leaf")]
            })
            .finish();

        assert_eq!(forced.load(Ordering::SeqCst), 0);
        assert_eq!(node.inputs().len(), 1);
        assert_eq!(node.inputs().len(), 1);
        assert_eq!(forced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_datum_round_trip() {
        let a = make_leaf("A");
        let b = make_leaf("B");
        let root = TaskNode::build(TaskId::new("Root").with("x", "1"), "combine")
            .arg(Datum::Int(3))
            .inputs(move || vec![a, b])
            .finish();

        let back = TaskNode::from_datum(&TaskNode::to_datum(&root)).unwrap();
        assert_eq!(back.id(), root.id());
        assert_eq!(back.op(), "combine");
        assert_eq!(back.args().len(), 1);
        assert_eq!(back.inputs().len(), 2);
        assert_eq!(back.inputs()[0].id(), &TaskId::new("A"));
    }

    #[test]
    fn test_datum_round_trip_preserves_sharing() {
        let shared = make_leaf("Shared");
        let shared_b = shared.clone();
        let left = TaskNode::build(TaskId::new("Left"), "noop")
            .inputs(move || vec![shared])
            .finish();
        let right = TaskNode::build(TaskId::new("Right"), "noop")
            .inputs(move || vec![shared_b])
            .finish();
        let root = TaskNode::build(TaskId::new("Root"), "noop")
            .inputs(move || vec![left, right])
            .finish();

        let back = TaskNode::from_datum(&TaskNode::to_datum(&root)).unwrap();
        let via_left = &back.inputs()[0].inputs()[0];
        let via_right = &back.inputs()[1].inputs()[0];
        assert!(Arc::ptr_eq(via_left, via_right));
    }

    #[test]
    fn test_process_resolves_from_ambient_registry() {
        let registry = Arc::new(TypeRegistry::default());
        registry.register_op("noop", |_: &[Datum]| Ok(Datum::Unit));

        let node = make_leaf("Solo");
        assert!(matches!(
            node.process_fn(),
            Err(EvalError::UnknownOp(op)) if &*op == "noop"
        ));

        let process = TypeRegistry::scope(&registry, || node.process_fn()).unwrap();
        assert!(process(&[]).unwrap().structurally_eq(&Datum::Unit));
    }

    #[test]
    fn test_inline_process_wins() {
        let node = TaskNode::build(TaskId::new("Inline"), "noop")
            .process(|_| Ok(Datum::Int(1)))
            .finish();

        let process = node.process_fn().unwrap();
        assert!(process(&[]).unwrap().structurally_eq(&Datum::Int(1)));
    }

    #[test]
    fn test_malformed_task_datum() {
        assert!(matches!(
            TaskNode::from_datum(&Datum::Int(1)),
            Err(DecodeError::Task(_))
        ));
    }
}
