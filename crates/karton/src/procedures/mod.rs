//! Procedure trees and the flat registry built from them.
//!
//! Applications describe the procedures they expose as a nested
//! [`ProcedureTree`]. [`extract_tree`] flattens it into dotted paths
//! (`"todos.add"`) for registration with an RPC manager.

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub mod proxy;

pub use proxy::{Invoker, RemoteProcedures};

use crate::protocol::{ErrorObject, Value};

/// Outcome of a procedure: a value, or an exception sent back verbatim
pub type ProcedureResult = Result<Value, ErrorObject>;

/// A callable procedure taking its positional parameters
pub type Procedure = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ProcedureResult> + Send + Sync>;

/// Wrap an async function as a [`Procedure`]
pub fn procedure<F, Fut>(handler: F) -> Procedure
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcedureResult> + Send + 'static,
{
    Arc::new(move |parameters| Box::pin(handler(parameters)))
}

/// Join path segments into the registry key
pub fn dotted_path<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|segment| segment.as_ref())
        .collect::<Vec<&str>>()
        .join(".")
}

/// An entry of a procedure tree
#[derive(Clone)]
pub enum ProcedureNode {
    Procedure(Procedure),
    Namespace(ProcedureTree),
    /// A non-callable leaf; ignored by registration and lookup
    Value(Value),
}

impl fmt::Debug for ProcedureNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureNode::Procedure(_) => f.write_str("Procedure(..)"),
            ProcedureNode::Namespace(tree) => f.debug_tuple("Namespace").field(tree).finish(),
            ProcedureNode::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Nested, named procedures supplied by the application
#[derive(Clone, Default, Debug)]
pub struct ProcedureTree {
    nodes: BTreeMap<String, ProcedureNode>,
}

impl ProcedureTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an async procedure under `name`
    pub fn procedure<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcedureResult> + Send + 'static,
    {
        self.insert(name, ProcedureNode::Procedure(procedure(handler)));
        self
    }

    /// Add a procedure whose parameters and result go through serde.
    ///
    /// The parameter list is deserialized as `A`, so a tuple type matches
    /// positional parameters.
    pub fn typed<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorObject>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            name,
            ProcedureNode::Procedure(procedure(move |parameters| {
                let handler = handler.clone();
                async move {
                    let arguments: A = Value::Array(parameters)
                        .deserialize_into()
                        .map_err(ErrorObject::from)?;
                    let result = handler(arguments).await?;
                    Value::from_serialize(&result).map_err(ErrorObject::from)
                }
            })),
        );
        self
    }

    /// Add a nested namespace under `name`
    pub fn namespace(mut self, name: impl Into<String>, tree: ProcedureTree) -> Self {
        self.insert(name, ProcedureNode::Namespace(tree));
        self
    }

    /// Add a plain value; it is carried along but never callable
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, ProcedureNode::Value(value.into()));
        self
    }

    /// Insert a node, returning the one it replaces
    pub fn insert(&mut self, name: impl Into<String>, node: ProcedureNode) -> Option<ProcedureNode> {
        self.nodes.insert(name.into(), node)
    }

    /// Get a direct child by name
    pub fn get(&self, name: &str) -> Option<&ProcedureNode> {
        self.nodes.get(name)
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Flatten a tree into `dotted.path -> procedure`, skipping non-callable leaves
pub fn extract_tree(tree: &ProcedureTree) -> HashMap<String, Procedure> {
    let mut handlers = HashMap::new();
    collect(tree, &mut Vec::new(), &mut handlers);
    handlers
}

fn collect<'a>(
    tree: &'a ProcedureTree,
    prefix: &mut Vec<&'a str>,
    handlers: &mut HashMap<String, Procedure>,
) {
    for (name, node) in &tree.nodes {
        prefix.push(name);
        match node {
            ProcedureNode::Procedure(handler) => {
                handlers.insert(dotted_path(prefix.as_slice()), handler.clone());
            }
            ProcedureNode::Namespace(nested) => collect(nested, prefix, handlers),
            ProcedureNode::Value(_) => {}
        }
        prefix.pop();
    }
}

/// Walk the tree along `path`; `None` if a segment is missing, the target is not
/// callable, or the path is empty
pub fn resolve_path<S: AsRef<str>>(tree: &ProcedureTree, path: &[S]) -> Option<Procedure> {
    let (last, parents) = path.split_last()?;
    let mut current = tree;
    for segment in parents {
        match current.get(segment.as_ref())? {
            ProcedureNode::Namespace(nested) => current = nested,
            _ => return None,
        }
    }
    match current.get(last.as_ref())? {
        ProcedureNode::Procedure(handler) => Some(handler.clone()),
        _ => None,
    }
}

/// Per-manager map from dotted path to procedure
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    handlers: HashMap<String, Procedure>,
}

impl ProcedureRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten a tree into a registry
    pub fn from_tree(tree: &ProcedureTree) -> Self {
        Self {
            handlers: extract_tree(tree),
        }
    }

    /// Register a handler. Returns true if it replaced one.
    pub fn insert(&mut self, path: impl Into<String>, handler: Procedure) -> bool {
        self.handlers.insert(path.into(), handler).is_some()
    }

    /// Remove a handler. Returns false if none was registered.
    pub fn remove(&mut self, path: &str) -> bool {
        self.handlers.remove(path).is_some()
    }

    /// Get a handler by dotted path
    pub fn get(&self, path: &str) -> Option<Procedure> {
        self.handlers.get(path).cloned()
    }

    /// Remove every handler
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.handlers.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("paths", &self.paths())
            .finish()
    }
}
