//! Immutable view of one received queue message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ListenerError;

/// One message attribute as delivered by the queue service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttribute {
    pub data_type: String,
    pub string_value: Option<String>,
}

/// A received message. Immutable after construction; the receipt handle is
/// only valid for the current reception.
#[derive(Debug, Clone)]
pub struct Message {
    message_id: String,
    receipt_handle: String,
    body: String,
    system_attributes: HashMap<String, String>,
    attributes: HashMap<String, MessageAttribute>,
    json: OnceCell<Result<Value, Arc<serde_json::Error>>>,
}

impl Message {
    pub fn new(
        message_id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
        system_attributes: HashMap<String, String>,
        attributes: HashMap<String, MessageAttribute>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            system_attributes,
            attributes,
            json: OnceCell::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// System attributes (ApproximateReceiveCount, SentTimestamp, ...).
    pub fn system_attributes(&self) -> &HashMap<String, String> {
        &self.system_attributes
    }

    /// User message attributes, name to `{data_type, string_value}`.
    pub fn attributes(&self) -> &HashMap<String, MessageAttribute> {
        &self.attributes
    }

    /// Flattened attribute view: name to string value, dropping attributes
    /// that carry no string payload.
    pub fn attribute_values(&self) -> HashMap<&str, &str> {
        self.attributes
            .iter()
            .filter_map(|(k, v)| v.string_value.as_deref().map(|s| (k.as_str(), s)))
            .collect()
    }

    fn parsed(&self) -> &Result<Value, Arc<serde_json::Error>> {
        self.json
            .get_or_init(|| serde_json::from_str(&self.body).map_err(Arc::new))
    }

    /// Body parsed as JSON. The result is memoized; repeated calls re-use
    /// the first parse.
    pub fn as_json(&self) -> Result<&Value, ListenerError> {
        self.parsed()
            .as_ref()
            .map_err(|e| ListenerError::InvalidPayload(e.to_string()))
    }

    /// Non-failing variant of [`as_json`](Self::as_json): `(value, error)`,
    /// exactly one of which is set.
    pub fn try_json(&self) -> (Option<&Value>, Option<&serde_json::Error>) {
        match self.parsed() {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e.as_ref())),
        }
    }
}

/// Outcome of a batch-mode handler invocation: the receipt handles the
/// handler could not process. Empty means the whole batch succeeded.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    failed: HashSet<String>,
}

impl BatchResult {
    /// All messages succeeded.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail(mut self, receipt_handle: impl Into<String>) -> Self {
        self.failed.insert(receipt_handle.into());
        self
    }

    pub fn mark_failed(&mut self, receipt_handle: impl Into<String>) {
        self.failed.insert(receipt_handle.into());
    }

    pub fn failed_receipt_handles(&self) -> &HashSet<String> {
        &self.failed
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
