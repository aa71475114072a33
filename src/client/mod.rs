//! Narrow interface over the queue service, plus the SQS implementation.
//!
//! The runtime only ever talks to [`QueueClient`]; tests substitute
//! in-memory doubles.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{
    ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry,
    MessageSystemAttributeName, QueueAttributeName,
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::{classify_code, ErrorKind, ListenerError};
use crate::message::{Message, MessageAttribute};

/// Timeout applied to every non-receive call.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ReceiveParams {
    pub max_messages: i32,
    pub wait_time: Duration,
    pub visibility: Duration,
}

/// One entry that the queue service rejected inside an otherwise
/// successful batch call.
#[derive(Debug, Clone)]
pub struct EntryFailure {
    pub receipt_handle: String,
    pub code: String,
    pub kind: ErrorKind,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-poll for up to `params.max_messages` messages. Blocks up to
    /// `params.wait_time`; an empty vec is a normal outcome.
    async fn receive(
        &self,
        queue_url: &str,
        params: &ReceiveParams,
    ) -> Result<Vec<Message>, ListenerError>;

    /// Delete up to 10 handles. Per-entry failures are returned, not
    /// raised.
    async fn delete_batch(
        &self,
        queue_url: &str,
        handles: &[String],
    ) -> Result<Vec<EntryFailure>, ListenerError>;

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility: Duration,
    ) -> Result<(), ListenerError>;

    /// Change visibility for up to 10 handles at once.
    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[(String, Duration)],
    ) -> Result<Vec<EntryFailure>, ListenerError>;

    /// Queue attributes, used at startup for logging and sanity checks.
    async fn queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, ListenerError>;
}

/// [`QueueClient`] backed by the AWS SDK.
#[derive(Clone)]
pub struct SqsQueueClient {
    client: aws_sdk_sqs::Client,
}

impl SqsQueueClient {
    /// Build from environment (AWS_* vars; `SQS_ENDPOINT_URL` overrides
    /// the endpoint for local emulators).
    pub async fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let region = env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".into());
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let Ok(endpoint) = env::var("SQS_ENDPOINT_URL") {
            loader = loader.endpoint_url(endpoint);
        }
        let cfg = loader.load().await;
        Self {
            client: aws_sdk_sqs::Client::new(&cfg),
        }
    }

    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }
}

fn map_sdk_err<E>(op: &str, err: SdkError<E>) -> ListenerError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ErrorKind::Transient
        }
        SdkError::ServiceError(ctx) => {
            if ctx.raw().status().as_u16() >= 500 {
                ErrorKind::Transient
            } else {
                let e = ctx.err();
                classify_code(e.code().unwrap_or(""), e.message().unwrap_or(""))
            }
        }
        _ => ErrorKind::Fatal,
    };
    ListenerError::queue(kind, format!("{op}: {err}"))
}

fn timed_out(op: &str) -> ListenerError {
    ListenerError::queue(ErrorKind::Transient, format!("{op}: client-side timeout"))
}

fn convert_message(m: aws_sdk_sqs::types::Message) -> Option<Message> {
    let message_id = m.message_id?;
    let Some(receipt_handle) = m.receipt_handle else {
        warn!(message_id = %message_id, "message without receipt handle; skipping");
        return None;
    };
    let Some(body) = m.body else {
        warn!(message_id = %message_id, "message without body; skipping");
        return None;
    };

    let system_attributes: HashMap<String, String> = m
        .attributes
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k.as_str().to_string(), v))
        .collect();

    let attributes: HashMap<String, MessageAttribute> = m
        .message_attributes
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            (
                k,
                MessageAttribute {
                    data_type: v.data_type().to_string(),
                    string_value: v.string_value().map(str::to_string),
                },
            )
        })
        .collect();

    Some(Message::new(
        message_id,
        receipt_handle,
        body,
        system_attributes,
        attributes,
    ))
}

/// Map per-entry batch failures back to their receipt handles. Entry ids
/// are the index into the request slice.
fn entry_failures<'a>(
    failed: impl Iterator<Item = (&'a str, &'a str, &'a str)>,
    handles: &[String],
) -> Vec<EntryFailure> {
    failed
        .filter_map(|(id, code, message)| {
            let Some(handle) = id.parse::<usize>().ok().and_then(|i| handles.get(i)) else {
                warn!(id, code, "batch failure entry with unknown id");
                return None;
            };
            Some(EntryFailure {
                receipt_handle: handle.clone(),
                code: code.to_string(),
                kind: classify_code(code, message),
            })
        })
        .collect()
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(
        &self,
        queue_url: &str,
        params: &ReceiveParams,
    ) -> Result<Vec<Message>, ListenerError> {
        // Long poll: give the wire call twice the poll window, with a
        // floor for wait_time_s = 0.
        let deadline = (params.wait_time * 2).max(CALL_TIMEOUT);
        let fut = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(params.max_messages)
            .wait_time_seconds(params.wait_time.as_secs() as i32)
            .visibility_timeout(params.visibility.as_secs() as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send();

        let out = timeout(deadline, fut)
            .await
            .map_err(|_| timed_out("receive"))?
            .map_err(|e| map_sdk_err("receive", e))?;

        let messages: Vec<Message> = out
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(convert_message)
            .collect();
        if !messages.is_empty() {
            debug!(count = messages.len(), "received messages");
        }
        Ok(messages)
    }

    async fn delete_batch(
        &self,
        queue_url: &str,
        handles: &[String],
    ) -> Result<Vec<EntryFailure>, ListenerError> {
        if handles.is_empty() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::with_capacity(handles.len());
        for (i, handle) in handles.iter().enumerate() {
            entries.push(
                DeleteMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(handle)
                    .build()
                    .map_err(|e| {
                        ListenerError::queue(ErrorKind::Fatal, format!("delete entry: {e}"))
                    })?,
            );
        }

        let fut = self
            .client
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send();
        let out = timeout(CALL_TIMEOUT, fut)
            .await
            .map_err(|_| timed_out("delete_batch"))?
            .map_err(|e| map_sdk_err("delete_batch", e))?;

        Ok(entry_failures(
            out.failed()
                .iter()
                .map(|f| (f.id(), f.code(), f.message().unwrap_or(""))),
            handles,
        ))
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility: Duration,
    ) -> Result<(), ListenerError> {
        let fut = self
            .client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility.as_secs() as i32)
            .send();
        timeout(CALL_TIMEOUT, fut)
            .await
            .map_err(|_| timed_out("change_visibility"))?
            .map_err(|e| map_sdk_err("change_visibility", e))?;
        Ok(())
    }

    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[(String, Duration)],
    ) -> Result<Vec<EntryFailure>, ListenerError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let handles: Vec<String> = entries.iter().map(|(h, _)| h.clone()).collect();
        let mut request_entries = Vec::with_capacity(entries.len());
        for (i, (handle, visibility)) in entries.iter().enumerate() {
            request_entries.push(
                ChangeMessageVisibilityBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(handle)
                    .visibility_timeout(visibility.as_secs() as i32)
                    .build()
                    .map_err(|e| {
                        ListenerError::queue(ErrorKind::Fatal, format!("visibility entry: {e}"))
                    })?,
            );
        }

        let fut = self
            .client
            .change_message_visibility_batch()
            .queue_url(queue_url)
            .set_entries(Some(request_entries))
            .send();
        let out = timeout(CALL_TIMEOUT, fut)
            .await
            .map_err(|_| timed_out("change_visibility_batch"))?
            .map_err(|e| map_sdk_err("change_visibility_batch", e))?;

        Ok(entry_failures(
            out.failed()
                .iter()
                .map(|f| (f.id(), f.code(), f.message().unwrap_or(""))),
            &handles,
        ))
    }

    async fn queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, ListenerError> {
        let fut = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::All)
            .send();
        let out = timeout(CALL_TIMEOUT, fut)
            .await
            .map_err(|_| timed_out("get_queue_attributes"))?
            .map_err(|e| map_sdk_err("get_queue_attributes", e))?;

        Ok(out
            .attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k.as_str().to_string(), v))
            .collect())
    }
}
