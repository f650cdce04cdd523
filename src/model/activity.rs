//! Activity request/result envelope carried in `WorkItem::content`.
//!
//! The wire form is JSON. Value maps are flat string -> string maps, kept in
//! a `BTreeMap` so encodings are stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Flat string-keyed values carried by requests and results.
pub type Values = BTreeMap<String, String>;

/// A request to run one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRequest {
    /// Unique id: `{task}-{uuid}`.
    pub id: String,
    /// Name of the activity to run.
    pub task: String,
    #[serde(default)]
    pub values: Values,
}

impl ActivityRequest {
    pub fn new(task: impl Into<String>) -> Self {
        let task = task.into();
        Self {
            id: format!("{task}-{}", Uuid::new_v4()),
            task,
            values: Values::new(),
        }
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// What running an activity produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    /// Echo of the request id.
    pub request_id: String,
    /// Echo of the request task.
    pub task: String,
    pub succeeded: bool,
    /// Set when `succeeded` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActivityErrorDetail>,
    /// Set when `succeeded` is true.
    #[serde(default)]
    pub values: Values,
}

impl ActivityResult {
    pub fn success(values: Values) -> Self {
        Self {
            request_id: String::new(),
            task: String::new(),
            succeeded: true,
            error: None,
            values,
        }
    }

    pub fn error(id: ActivityErrorId, message: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            task: String::new(),
            succeeded: false,
            error: Some(ActivityErrorDetail {
                id,
                message: message.into(),
                stack_trace: None,
            }),
            values: Values::new(),
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        if let Some(ref mut err) = self.error {
            err.stack_trace = Some(trace.into());
        }
        self
    }

    /// Stamp the request's id and task onto this result.
    pub fn for_request(mut self, request: &ActivityRequest) -> Self {
        self.request_id = request.id.clone();
        self.task = request.task.clone();
        self
    }

    pub fn error_id(&self) -> Option<ActivityErrorId> {
        self.error.as_ref().map(|e| e.id)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Structured error carried by a failed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityErrorDetail {
    pub id: ActivityErrorId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Kind of activity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorId {
    /// Unexpected failure inside the activity.
    GenericError,
    /// A declared required request value was absent.
    MissingRequiredInput,
    /// The activity produced a result key it did not declare.
    UnknownResultValue,
    /// A request value was present but unusable.
    InvalidInput,
    /// No activity is registered under the request's task name.
    UnknownActivity,
    /// A follow-up request could not be submitted.
    SubmitFailed,
}

impl std::fmt::Display for ActivityErrorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityErrorId::GenericError => "generic_error",
            ActivityErrorId::MissingRequiredInput => "missing_required_input",
            ActivityErrorId::UnknownResultValue => "unknown_result_value",
            ActivityErrorId::InvalidInput => "invalid_input",
            ActivityErrorId::UnknownActivity => "unknown_activity",
            ActivityErrorId::SubmitFailed => "submit_failed",
        };
        write!(f, "{s}")
    }
}
