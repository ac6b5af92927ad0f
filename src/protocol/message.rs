use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A call to a named remote function.
///
/// Names are opaque keys: `"examples.getStateName"` is looked up as-is, there
/// is no namespace traversal on the server.
///
/// ```
/// use callme::RpcRequest;
///
/// let req = RpcRequest::new("madd").arg(1).arg(2);
/// assert_eq!(req.function_name(), "madd");
/// assert_eq!(req.args().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    function_name: String,

    #[serde(default)]
    args: Vec<Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    kwargs: Map<String, Value>,
}

impl RpcRequest {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace all positional arguments.
    pub fn args_from(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args = values.into_iter().collect();
        self
    }

    /// Set a keyword argument. A later value for the same name wins.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Split into the function name and the arguments handed to it.
    pub fn into_parts(self) -> (String, CallArgs) {
        (
            self.function_name,
            CallArgs {
                args: self.args,
                kwargs: self.kwargs,
            },
        )
    }
}

/// Failure captured on the server and carried back to the caller.
///
/// `kind` plays the role of an exception type tag; well-known kinds produced
/// by the dispatcher itself are exposed as associated constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    kind: String,
    message: String,
}

impl RemoteFailure {
    /// No function registered under the requested name.
    pub const UNKNOWN_FUNCTION: &'static str = "UnknownFunction";
    /// Arguments did not fit the function (arity or type mismatch).
    pub const ARGUMENT_ERROR: &'static str = "ArgumentError";
    /// The function panicked.
    pub const PANIC: &'static str = "Panic";
    /// Unclassified failure raised by a function.
    pub const ERROR: &'static str = "Error";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Unclassified failure with the given message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Self::ERROR, message)
    }

    pub fn unknown_function(name: &str) -> Self {
        Self::new(Self::UNKNOWN_FUNCTION, format!("no function named '{name}'"))
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(Self::ARGUMENT_ERROR, message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteFailure {}

impl From<serde_json::Error> for RemoteFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::argument(err.to_string())
    }
}

/// Result of one remote invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Err(RemoteFailure),
}

/// Response payload sent back to the caller's reply address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: Outcome,
}

impl RpcResponse {
    pub fn ok(value: Value) -> Self {
        Self {
            result: Outcome::Ok(value),
        }
    }

    pub fn failure(failure: RemoteFailure) -> Self {
        Self {
            result: Outcome::Err(failure),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.result, Outcome::Err(_))
    }

    /// Convert into the caller-facing result.
    pub fn into_result(self) -> crate::Result<Value> {
        match self.result {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(failure) => Err(crate::RpcError::Remote(failure)),
        }
    }
}

impl From<std::result::Result<Value, RemoteFailure>> for RpcResponse {
    fn from(result: std::result::Result<Value, RemoteFailure>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(failure) => Self::failure(failure),
        }
    }
}

/// Arguments as received by a registered function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    /// Deserialize all positional arguments at once, typically into a tuple.
    ///
    /// A length mismatch is reported as an [`ARGUMENT_ERROR`](RemoteFailure::ARGUMENT_ERROR).
    pub fn positional<T: DeserializeOwned>(&self) -> Result<T, RemoteFailure> {
        serde_json::from_value(Value::Array(self.args.clone()))
            .map_err(|e| RemoteFailure::argument(format!("positional arguments: {e}")))
    }

    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, RemoteFailure> {
        let value = self.args.get(index).cloned().ok_or_else(|| {
            RemoteFailure::argument(format!(
                "missing required positional argument {index} (got {})",
                self.args.len()
            ))
        })?;

        serde_json::from_value(value)
            .map_err(|e| RemoteFailure::argument(format!("argument {index}: {e}")))
    }

    /// Deserialize an optional keyword argument.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, RemoteFailure> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| RemoteFailure::argument(format!("keyword argument '{name}': {e}"))),
        }
    }
}
