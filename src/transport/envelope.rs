//! RPC response envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::mediator::{MediatorError, Result};

/// Description of a failure on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    /// Describe a local dispatch failure for the caller.
    pub fn from_error(error: &MediatorError) -> Self {
        let message = match error {
            // The source carries the handler's own message.
            MediatorError::Handler { source, .. } => source.to_string(),
            other => other.to_string(),
        };
        Self {
            message,
            kind: Some(error.kind().to_string()),
        }
    }
}

/// Reply to a dispatched request: a result or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage<T> {
    pub result: Option<T>,
    pub error: Option<ErrorDescriptor>,
}

impl<T> ResponseMessage<T> {
    pub fn ok(result: T) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: ErrorDescriptor) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Unwrap the envelope, turning a remote failure into
    /// `MediatorError::RemoteHandler`.
    ///
    /// An empty envelope decodes the result from JSON `null`, which is how
    /// unit and optional responses travel.
    pub fn into_result(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        match (self.result, self.error) {
            (_, Some(error)) => Err(MediatorError::RemoteHandler {
                message: error.message,
                kind: error.kind,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::from_value(serde_json::Value::Null)?),
        }
    }
}
