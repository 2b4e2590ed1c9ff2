use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::codec;
use crate::context::{Caching, EvalContext, TaskValue, Traverse};
use crate::error::{EvalError, FreezeError};
use crate::id::{TaskId, sanitize};
use crate::task::TaskNode;
use crate::value::Datum;

/// The accumulated mapping of task identifier to persisted file path for one
/// freeze traversal, in visitation order. Under a parallel traversal the
/// order is one valid interleaving, not a cross-run guarantee.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<(TaskId, Utf8PathBuf)>,
}

impl Manifest {
    fn record(&mut self, id: TaskId, path: Utf8PathBuf) {
        self.entries.push((id, path));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Utf8Path> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == id)
            .map(|(_, path)| path.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskId, &Utf8Path)> {
        self.entries.iter().map(|(id, path)| (id, path.as_path()))
    }

    /// Renders the manifest as a JSON array of `{task, file}` entries, in
    /// visitation order.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let entries: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|(id, path)| {
                serde_json::json!({
                    "task": id.to_string(),
                    "file": path.as_str(),
                })
            })
            .collect();

        serde_json::to_string(&entries)
    }
}

/// An [`EvalContext`] decorator that persists every task it is asked to
/// evaluate and never lets one run.
///
/// Each evaluation request materializes the node's lazy inputs, writes the
/// node to `base/<sanitized id>` with exclusive-create semantics, records
/// the manifest entry, and forwards to the inner link so the traversal
/// continues into the inputs. When the engine later asks to invoke the
/// node's process function, the freezer answers with the
/// [`EvalError::Persisted`] sentinel instead, so no task in the tree ever
/// executes.
pub struct Freezer {
    inner: Box<dyn EvalContext>,
    base: Utf8PathBuf,
    manifest: Mutex<Manifest>,
}

impl Freezer {
    pub fn new(base: impl Into<Utf8PathBuf>, inner: impl EvalContext + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            base: base.into(),
            manifest: Mutex::new(Manifest::default()),
        }
    }

    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    /// A snapshot of the accumulated manifest. Complete only once the
    /// triggering evaluation and all its recursive descendants have fully
    /// unwound; earlier reads see a prefix.
    pub fn manifest(&self) -> Manifest {
        self.manifest.lock().unwrap().clone()
    }

    fn persist(&self, node: &Arc<TaskNode>) -> Result<Utf8PathBuf, FreezeError> {
        let path = self.base.join(sanitize(node.id()));

        let bytes =
            codec::encode(&TaskNode::to_datum(node)).map_err(|source| FreezeError::Encode {
                id: node.id().clone(),
                source,
            })?;

        // Exclusive create: a second freeze of the same identifier, or a
        // sanitization collision, fails here instead of overwriting.
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|error| {
                if error.kind() == std::io::ErrorKind::AlreadyExists {
                    FreezeError::AlreadyPersisted {
                        id: node.id().clone(),
                        path: path.clone(),
                    }
                } else {
                    FreezeError::Io {
                        path: path.clone(),
                        source: error,
                    }
                }
            })?;

        {
            let mut manifest = self.manifest.lock().unwrap();
            manifest.record(node.id().clone(), path.clone());
        }

        file.write_all(&bytes).map_err(|source| FreezeError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}

impl EvalContext for Freezer {
    fn evaluate(&self, node: &Arc<TaskNode>, chain: &dyn EvalContext) -> TaskValue {
        // materialize lazy inputs before snapshotting
        node.inputs();

        match self.persist(node) {
            Ok(path) => tracing::debug!(task = %node.id(), file = %path, "persisted task"),
            Err(error) => return Err(error.into()),
        }

        self.inner.evaluate(node, chain)
    }

    fn invoke(&self, node: &Arc<TaskNode>, _args: &[Datum], _chain: &dyn EvalContext) -> TaskValue {
        tracing::info!(task = %node.id(), "will not invoke persisted task");
        Err(EvalError::Persisted(node.id().clone()))
    }
}

/// Freezes the graph reachable from `root` into `base`, one file per task,
/// and returns the manifest of everything persisted.
///
/// The traversal runs over a `Caching(Freezer(Traverse))` chain; the
/// "persisted, not executed" sentinel every branch ends in is the expected
/// outcome and is not surfaced as an error.
pub fn freeze(base: impl Into<Utf8PathBuf>, root: &Arc<TaskNode>) -> Result<Manifest, EvalError> {
    let freezer = Arc::new(Freezer::new(base, Traverse));
    let chain = Caching::new(freezer.clone());

    match chain.evaluate(root, &chain) {
        Ok(_) | Err(EvalError::Persisted(_)) => Ok(freezer.manifest()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::resolver::ContextResolver;
    use crate::value::Opaque;

    fn make_base(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    fn make_counting(id: TaskId, runs: &Arc<AtomicUsize>) -> Arc<TaskNode> {
        let probe = runs.clone();
        TaskNode::build(id, "count")
            .process(move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(Datum::Unit)
            })
            .finish()
    }

    fn make_build_graph(runs: &Arc<AtomicUsize>) -> Arc<TaskNode> {
        let a = make_counting(TaskId::new("Compile").with("file", "a.c"), runs);
        let b = make_counting(TaskId::new("Compile").with("file", "b.c"), runs);
        let probe = runs.clone();
        TaskNode::build(TaskId::new("Build").with("target", "app"), "link")
            .process(move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(Datum::Unit)
            })
            .inputs(move || vec![a, b])
            .finish()
    }

    #[test]
    fn test_freeze_build_graph() {
        let dir = tempfile::tempdir().unwrap();
        let base = make_base(&dir);

        let runs = Arc::new(AtomicUsize::new(0));
        let root = make_build_graph(&runs);

        let manifest = freeze(base.clone(), &root).unwrap();

        assert_eq!(manifest.len(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // the root is visited, and therefore recorded, first
        let (first, _) = manifest.iter().next().unwrap();
        assert_eq!(first, &TaskId::new("Build").with("target", "app"));

        for (expected, id) in [
            ("build_target_app", TaskId::new("Build").with("target", "app")),
            ("compile_file_ac", TaskId::new("Compile").with("file", "a.c")),
            ("compile_file_bc", TaskId::new("Compile").with("file", "b.c")),
        ] {
            let path = manifest.get(&id).unwrap();
            assert_eq!(path, base.join(expected).as_path());
            assert!(path.exists());
        }
    }

    #[test]
    fn test_frozen_files_decode() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let root = make_build_graph(&runs);

        let manifest = freeze(make_base(&dir), &root).unwrap();

        let resolver = ContextResolver::new();
        for (id, path) in manifest.iter() {
            let datum = codec::decode_file(path, &resolver).unwrap();
            let node = TaskNode::from_datum(&datum).unwrap();
            assert_eq!(node.id(), id);
        }

        // the root's record retains its full input structure
        let root_path = manifest.get(root.id()).unwrap();
        let datum = codec::decode_file(root_path, &resolver).unwrap();
        let node = TaskNode::from_datum(&datum).unwrap();
        assert_eq!(node.inputs().len(), 2);
    }

    #[test]
    fn test_invocation_is_withheld() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let node = make_counting(TaskId::new("Once"), &runs);

        let freezer = Freezer::new(make_base(&dir), Traverse);
        let result = freezer.invoke(&node, &[], &Traverse);

        assert!(matches!(result, Err(EvalError::Persisted(id)) if id == TaskId::new("Once")));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_double_write() {
        let dir = tempfile::tempdir().unwrap();
        let base = make_base(&dir);

        let runs = Arc::new(AtomicUsize::new(0));
        let node = make_counting(TaskId::new("Same"), &runs);

        let manifest = freeze(base.clone(), &node).unwrap();
        let path = manifest.get(node.id()).unwrap().to_path_buf();
        let before = fs::read(&path).unwrap();

        let error = freeze(base, &node).unwrap_err();
        assert!(matches!(
            &error,
            EvalError::Freeze(e) if matches!(&**e, FreezeError::AlreadyPersisted { .. })
        ));

        let after = fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_freeze_diamond_once_per_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let shared = make_counting(TaskId::new("Shared"), &runs);
        let shared_b = shared.clone();
        let left = TaskNode::build(TaskId::new("Left"), "noop")
            .process(|_| Ok(Datum::Unit))
            .inputs(move || vec![shared])
            .finish();
        let right = TaskNode::build(TaskId::new("Right"), "noop")
            .process(|_| Ok(Datum::Unit))
            .inputs(move || vec![shared_b])
            .finish();
        let root = TaskNode::build(TaskId::new("Root"), "noop")
            .process(|_| Ok(Datum::Unit))
            .inputs(move || vec![left, right])
            .finish();

        let manifest = freeze(make_base(&dir), &root).unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unserializable_task_fails() {
        let dir = tempfile::tempdir().unwrap();
        let node = TaskNode::build(TaskId::new("Handle"), "noop")
            .arg(Datum::Opaque(Opaque::new(5u32)))
            .finish();

        let error = freeze(make_base(&dir), &node).unwrap_err();
        assert!(matches!(
            &error,
            EvalError::Freeze(e) if matches!(&**e, FreezeError::Encode { .. })
        ));
    }

    #[test]
    fn test_concurrent_freeze_of_same_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let base = make_base(&dir);

        let runs = Arc::new(AtomicUsize::new(0));
        let node = make_counting(TaskId::new("Contended"), &runs);

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let base = base.clone();
                    let node = node.clone();
                    scope.spawn(move || freeze(base, &node))
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);

        let loser = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
        assert!(matches!(
            &loser,
            EvalError::Freeze(e) if matches!(&**e, FreezeError::AlreadyPersisted { .. })
        ));
    }

    #[test]
    fn test_manifest_json_export() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let root = make_build_graph(&runs);

        let manifest = freeze(make_base(&dir), &root).unwrap();
        let json = manifest.to_json().unwrap();

        assert!(json.starts_with("[{"));
        assert!(json.contains("Build(target=app)"));
        assert!(json.contains("build_target_app"));
    }
}
