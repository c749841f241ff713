//! Runtime surface of compiled types: values, handlers and type factories.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Value passed to constructors and produced by script expressions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Int(value) => write!(f, "{value}"),
            Value::Str(value) => f.write_str(value),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

/// Request data handed to a handler instance.
#[derive(Debug, Clone, Default)]
pub struct HandlerRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl HandlerRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl Default for HandlerResponse {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: String::new(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("unknown action `{action}` on `{type_name}`")]
    UnknownAction { type_name: String, action: String },
    #[error("handler `{type_name}` failed: {message}")]
    Runtime { type_name: String, message: String },
}

/// A constructed runtime instance.
pub trait Handler: Send {
    fn type_name(&self) -> &str;

    /// Run the type's entry point.
    fn process(&mut self, request: &HandlerRequest) -> Result<HandlerResponse, InvokeError>;

    /// Run a named action from the type's registry.
    fn invoke_action(
        &mut self,
        action: &str,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, InvokeError>;

    /// Names registered in the action registry.
    fn actions(&self) -> Vec<String>;
}

/// Entry of an artifact's type table.
pub trait TypeFactory: Send + Sync {
    fn construct(&self, args: &[Value]) -> Result<Box<dyn Handler>, String>;
}
