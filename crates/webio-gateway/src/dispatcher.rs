//! Command dispatch for the text channel.
//!
//! Every inbound text frame is a JSON object.  When it carries a string
//! `"command"` field the [`CommandRegistry`] looks up the handler registered
//! under that name and invokes it on the service thread, synchronously, with a
//! borrowed [`CommandPayload`].
//!
//! ```rust
//! use webio_gateway::dispatcher::{CommandPayload, CommandRegistry, DispatchOutcome};
//!
//! let registry = CommandRegistry::new();
//! registry.register("ping", |_payload| Ok(()));
//!
//! let payload = CommandPayload::parse(br#"{"command":"ping"}"#).unwrap();
//! assert!(matches!(registry.dispatch(payload), DispatchOutcome::Handled));
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use webio_types::WebIoError;

/// Field naming the handler to run.
pub const COMMAND_FIELD: &str = "command";

/// A parsed inbound text frame: always a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandPayload(Map<String, Value>);

impl CommandPayload {
    /// Parse one frame.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::Parse`] for malformed JSON or a non-object root.
    pub fn parse(bytes: &[u8]) -> Result<Self, WebIoError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| WebIoError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Wrap an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, WebIoError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(WebIoError::Parse(format!(
                "frame root must be a JSON object, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// The `"command"` field when present and a string.
    pub fn command(&self) -> Option<&str> {
        self.0.get(COMMAND_FIELD).and_then(Value::as_str)
    }

    /// Raw access to any top-level field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Deserialize field `name` into `T`.
    ///
    /// # Errors
    ///
    /// [`CommandError::MissingField`] when absent,
    /// [`CommandError::InvalidField`] when it does not fit `T`.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T, CommandError> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| CommandError::MissingField(name.to_string()))?;
        T::deserialize(value).map_err(|e| CommandError::InvalidField {
            field: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// The whole object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Compact single-line JSON rendering.
    pub fn to_line(&self) -> String {
        self.as_value().to_string()
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Failure reported by a command handler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl From<WebIoError> for CommandError {
    fn from(e: WebIoError) -> Self {
        CommandError::Failed(e.to_string())
    }
}

/// Signature every command handler implements.
pub type CommandHandler = Arc<dyn Fn(&CommandPayload) -> Result<(), CommandError> + Send + Sync>;

/// What happened to a dispatched payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A handler ran and succeeded.
    Handled,
    /// A handler ran and reported an error.
    Failed(CommandError),
    /// The payload named a command nobody registered.
    Unknown(String),
    /// The payload has no string `"command"` field.
    NoCommand,
}

/// Name → handler table plus the most recently dispatched payload.
///
/// Registration may happen from any thread at any time; it never races with
/// an in-flight dispatch because handlers are cloned out of the table before
/// they are invoked.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, CommandHandler>>,
    current: ReentrantMutex<RefCell<Option<CommandPayload>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&CommandPayload) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    /// Remove every handler.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Store `payload` as the current command and run its handler.
    ///
    /// The payload slot stays locked while the handler runs.  The lock is
    /// re-entrant, so the handler may itself read
    /// [`last_payload`][Self::last_payload]; it must not dispatch.
    pub fn dispatch(&self, payload: CommandPayload) -> DispatchOutcome {
        let slot = self.current.lock();
        *slot.borrow_mut() = Some(payload);
        let current = slot.borrow();
        let Some(payload) = current.as_ref() else {
            return DispatchOutcome::NoCommand;
        };

        let Some(name) = payload.command() else {
            return DispatchOutcome::NoCommand;
        };
        let handler = self.handlers.read().get(name).cloned();
        match handler {
            Some(handler) => match handler(payload) {
                Ok(()) => DispatchOutcome::Handled,
                Err(e) => DispatchOutcome::Failed(e),
            },
            None => DispatchOutcome::Unknown(name.to_string()),
        }
    }

    /// Copy of the most recently dispatched payload.
    pub fn last_payload(&self) -> Option<CommandPayload> {
        self.current.lock().borrow().clone()
    }
}
