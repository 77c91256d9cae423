//! Path builder for calling remote procedures.
//!
//! `remote.at("todos").at("add").call(params)` invokes the remote procedure
//! `todos.add`. Building the path never touches the connection; only
//! [`RemoteProcedures::call`] does.

use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::protocol::Value;
use crate::rpc::CallOptions;
use crate::KartonResult;

/// Something that can carry out a remote call for a procedure path
pub trait Invoker: Send + Sync {
    fn invoke(
        &self,
        path: Vec<String>,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> BoxFuture<'static, KartonResult<Value>>;
}

impl<F> Invoker for F
where
    F: Fn(Vec<String>, Vec<Value>, CallOptions) -> BoxFuture<'static, KartonResult<Value>>
        + Send
        + Sync,
{
    fn invoke(
        &self,
        path: Vec<String>,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> BoxFuture<'static, KartonResult<Value>> {
        self(path, parameters, options)
    }
}

/// A position in the remote procedure namespace
#[derive(Clone)]
pub struct RemoteProcedures {
    invoker: Arc<dyn Invoker>,
    path: Vec<String>,
}

impl RemoteProcedures {
    /// The root of a remote namespace
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self {
            invoker,
            path: Vec::new(),
        }
    }

    /// Descend one segment
    pub fn at(&self, segment: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(segment.into());
        Self {
            invoker: self.invoker.clone(),
            path,
        }
    }

    /// Descend along a dotted path such as `"todos.add"`
    pub fn resolve(&self, dotted: &str) -> Self {
        dotted
            .split('.')
            .filter(|segment| !segment.is_empty())
            .fold(self.clone(), |node, segment| node.at(segment))
    }

    /// Path segments of this proxy
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Path joined with dots
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }

    /// Call the procedure at this path with default options
    pub async fn call(&self, parameters: Vec<Value>) -> KartonResult<Value> {
        self.call_with(parameters, CallOptions::default()).await
    }

    /// Call with explicit options
    pub async fn call_with(
        &self,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> KartonResult<Value> {
        self.invoker
            .invoke(self.path.clone(), parameters, options)
            .await
    }
}

impl fmt::Display for RemoteProcedures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str("[remote procedures]")
        } else {
            write!(f, "[remote procedure {}]", self.dotted_path())
        }
    }
}

impl fmt::Debug for RemoteProcedures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcedures")
            .field("path", &self.path)
            .finish()
    }
}
