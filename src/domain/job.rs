//! Job request and result types
//!
//! A [`JobRequest`] is the normalized form a backend receives,
//! independent of which capability produced it: a stable list of
//! input/output descriptors with fixed id slots plus an options map.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Whether a descriptor feeds the job or receives its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputRole {
    Input,
    Output,
}

/// Where a descriptor's payload comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Inline text carried in the request
    Text,
    /// A URL the backend fetches
    Url,
    /// An image produced by the backend
    Image,
}

/// One entry of a job's data list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputItem {
    pub id: String,
    pub role: InputRole,
    pub source: SourceKind,
    pub payload: Option<String>,
}

impl InputItem {
    /// Inline text input under a fixed id slot
    pub fn text(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: InputRole::Input,
            source: SourceKind::Text,
            payload: Some(value.into()),
        }
    }

    /// URL input the backend resolves itself
    pub fn url(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: InputRole::Input,
            source: SourceKind::Url,
            payload: Some(uri.into()),
        }
    }

    /// Output slot for an image result
    pub fn output_image(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: InputRole::Output,
            source: SourceKind::Image,
            payload: None,
        }
    }

    /// The backend wire representation with fixed `id`/`type`/`src` fields
    pub fn to_wire(&self) -> Value {
        match (self.role, self.source) {
            (InputRole::Input, SourceKind::Url) => json!({
                "id": self.id,
                "type": "input",
                "src": "url:Image",
                "uri": self.payload.clone().unwrap_or_default(),
            }),
            (InputRole::Input, _) => json!({
                "id": self.id,
                "type": "input",
                "src": "request:text",
                "data": self.payload.clone().unwrap_or_default(),
            }),
            (InputRole::Output, SourceKind::Text) => json!({
                "id": self.id,
                "type": "output",
                "src": "request:text",
            }),
            (InputRole::Output, _) => json!({
                "id": self.id,
                "type": "output",
                "src": "request:image",
            }),
        }
    }
}

/// Normalized job specification handed to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// `<sourceEventId>_<processorName without spaces>`
    pub job_id: String,
    /// Backend-specific routing path, e.g. a module to run
    pub route: String,
    /// Ordered input/output descriptors
    pub data: Vec<InputItem>,
    /// Capability-specific parameters; unknown keys pass through
    pub options: BTreeMap<String, Value>,
}

impl JobRequest {
    /// The submission document: `data` and `options` travel as
    /// serialized strings inside the JSON body
    pub fn to_submission(&self) -> Result<Value, serde_json::Error> {
        let wire_data: Vec<Value> = self.data.iter().map(InputItem::to_wire).collect();
        Ok(json!({
            "jobID": self.job_id,
            "route": self.route,
            "data": serde_json::to_string(&wire_data)?,
            "options": serde_json::to_string(&self.options)?,
        }))
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Failure,
}

/// Result returned by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub outcome: JobOutcome,
    pub content: String,
    pub error: Option<String>,
}

impl JobResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            outcome: JobOutcome::Success,
            content: content.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            outcome: JobOutcome::Failure,
            content: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Success
    }
}

/// Phases a job moves through inside a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Received,
    Validated,
    Translated,
    Dispatched,
    Polling,
    Completed,
    Failed,
}

/// Rejected phase transition
#[derive(Debug, Error)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct PhaseError {
    pub from: JobPhase,
    pub to: JobPhase,
}

impl JobPhase {
    /// Whether the job is finished
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }

    /// Transition table; any non-terminal phase may fail, everything
    /// else advances strictly in order
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        if next == JobPhase::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (JobPhase::Received, JobPhase::Validated)
                | (JobPhase::Validated, JobPhase::Translated)
                | (JobPhase::Translated, JobPhase::Dispatched)
                | (JobPhase::Dispatched, JobPhase::Polling)
                | (JobPhase::Polling, JobPhase::Completed)
        )
    }

    /// Advance to `next`, rejecting transitions that skip a phase
    pub fn advance_to(self, next: JobPhase) -> Result<JobPhase, PhaseError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(PhaseError { from: self, to: next })
        }
    }
}
