use crate::{
    types::{Args, Kwargs, TypeMismatch, Value},
    RpcFunction,
};
use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;

/// Something that can serve a call: `(args, kwargs) -> result`.
pub trait Handler: Send + Sync {
    fn call(&self, args: Args, kwargs: Kwargs) -> Result<Value, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Args, Kwargs) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, args: Args, kwargs: Kwargs) -> Result<Value, HandlerError> {
        self(args, kwargs)
    }
}

/// Maps method names to local [`Handler`]s.
///
/// Handlers can be registered as closures with [`insert`](Self::insert) or as
/// named [`RpcFunction`]s with [`add`](Self::add). Once handed to a
/// [`Connection`](crate::Connection) the table is shared read-only.
#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Args, Kwargs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.insert_handler(method, handler)
    }

    pub fn insert_handler<H>(&mut self, method: impl Into<String>, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        let _ = self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn add<RFn>(&mut self, rpc_function: RFn) -> &mut Self
    where
        RFn: RpcFunction + 'static,
    {
        let name = rpc_function.name().to_owned();
        self.insert_handler(name, NamedRpcFunction(rpc_function))
    }

    pub fn resolve(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }

    /// Run the handler for `method`, converting a missing method, a handler
    /// error, or a handler panic into a [`DispatchError`].
    pub fn dispatch(&self, method: &str, args: Args, kwargs: Kwargs) -> CallResult {
        let handler = self
            .resolve(method)
            .ok_or_else(|| DispatchError::MethodNotFound(method.to_owned()))?;
        debug!(method, args = args.len(), kwargs = kwargs.len(), "dispatching call");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.call(args, kwargs)))
            .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));
        outcome.map_err(|source| DispatchError::HandlerExecution {
            method: method.to_owned(),
            source,
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.methods()).finish()
    }
}

struct NamedRpcFunction<RFn>(RFn);

impl<RFn> Handler for NamedRpcFunction<RFn>
where
    RFn: RpcFunction,
{
    fn call(&self, args: Args, kwargs: Kwargs) -> Result<Value, HandlerError> {
        self.0.call(args, kwargs)
    }
}

pub type CallResult = Result<Value, DispatchError>;

/// A handler failure, sent back to the remote caller as the outcome's error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::new(format_args!("panic: {}", panic_message(&*payload)))
    }
}

/// The text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl From<TypeMismatch> for HandlerError {
    fn from(err: TypeMismatch) -> Self {
        Self::new(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("MethodNotFoundError: {0}")]
    MethodNotFound(String),
    #[error("HandlerExecutionError: {source}")]
    HandlerExecution {
        method: String,
        #[source]
        source: HandlerError,
    },
}

impl DispatchError {
    /// The value placed in an outcome's `error` field.
    pub fn descriptor(&self) -> Value {
        Value::String(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{name, types::arg};
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Shout;

    impl RpcFunction for Shout {
        name!("Shout");

        fn call(&self, args: Args, _kwargs: Kwargs) -> Result<Value, HandlerError> {
            let word: String = arg(&args, 0)?;
            Ok(json!(word.to_uppercase()))
        }
    }

    fn table() -> DispatchTable {
        let mut table = DispatchTable::new();
        table
            .insert("Echo", |args, _| Ok(arg::<Value>(&args, 0)?))
            .insert("Fail", |_, _| Err(HandlerError::new("no such container")))
            .insert("Panic", |_, _| panic!("exploded"))
            .add(Shout);
        table
    }

    #[test]
    fn resolves_registered_methods_only() {
        let table = table();
        assert!(table.resolve("Echo").is_some());
        assert!(table.resolve("Nope").is_none());
        assert_eq!(
            table.methods().collect::<Vec<_>>(),
            ["Echo", "Fail", "Panic", "Shout"]
        );
    }

    #[test]
    fn dispatches_to_closures_and_named_functions() {
        let table = table();
        let echoed = table.dispatch("Echo", vec![json!("hi")], Kwargs::new());
        assert_eq!(echoed, Ok(json!("hi")));
        let shouted = table.dispatch("Shout", vec![json!("hi")], Kwargs::new());
        assert_eq!(shouted, Ok(json!("HI")));
    }

    #[test]
    fn missing_method_descriptor() {
        let err = table().dispatch("Nope", vec![], Kwargs::new()).unwrap_err();
        assert_eq!(err, DispatchError::MethodNotFound("Nope".into()));
        assert_eq!(err.descriptor(), json!("MethodNotFoundError: Nope"));
    }

    #[test]
    fn handler_failures_are_contained() {
        let table = table();
        let err = table.dispatch("Fail", vec![], Kwargs::new()).unwrap_err();
        assert_eq!(
            err.descriptor(),
            json!("HandlerExecutionError: no such container")
        );

        let err = table.dispatch("Panic", vec![], Kwargs::new()).unwrap_err();
        assert_matches!(
            err,
            DispatchError::HandlerExecution { ref source, .. } if source.message() == "panic: exploded"
        );

        let err = table.dispatch("Shout", vec![json!(5)], Kwargs::new()).unwrap_err();
        assert_matches!(err, DispatchError::HandlerExecution { ref method, .. } if method == "Shout");
    }
}
