//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sqs_listener::client::{EntryFailure, QueueClient, ReceiveParams};
use sqs_listener::config::ListenerConfig;
use sqs_listener::errors::{ErrorKind, ListenerError};
use sqs_listener::message::Message;

/// Every call the runtime makes, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Receive,
    DeleteBatch(Vec<String>),
    ChangeVisibility(String, u64),
    ChangeVisibilityBatch(Vec<(String, u64)>),
    QueueAttributes,
}

/// Scripted outcome for successive `receive` calls. Once the script is
/// exhausted, every receive long-polls empty.
pub enum ReceiveStep {
    Batch(Vec<Message>),
    Empty,
    Fail(ErrorKind),
}

#[derive(Default)]
struct Failures {
    map: HashMap<String, (ErrorKind, u32)>,
}

impl Failures {
    fn arm(&mut self, handle: &str, kind: ErrorKind, times: u32) {
        self.map.insert(handle.to_string(), (kind, times));
    }

    fn take(&mut self, handle: &str) -> Option<ErrorKind> {
        match self.map.get_mut(handle) {
            Some((kind, left)) if *left > 0 => {
                *left -= 1;
                Some(*kind)
            }
            _ => None,
        }
    }
}

pub struct FakeQueueClient {
    calls: Mutex<Vec<Call>>,
    receive_script: Mutex<VecDeque<ReceiveStep>>,
    delete_failures: Mutex<Failures>,
    extend_failures: Mutex<Failures>,
    attributes_error: Mutex<Option<ErrorKind>>,
}

impl FakeQueueClient {
    pub fn new(script: Vec<ReceiveStep>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            receive_script: Mutex::new(script.into()),
            delete_failures: Mutex::new(Failures::default()),
            extend_failures: Mutex::new(Failures::default()),
            attributes_error: Mutex::new(None),
        })
    }

    /// Make the next `times` deletes of `handle` fail with `kind`.
    pub fn fail_delete(&self, handle: &str, kind: ErrorKind, times: u32) {
        self.delete_failures.lock().unwrap().arm(handle, kind, times);
    }

    /// Make the next `times` visibility extensions of `handle` fail.
    pub fn fail_extend(&self, handle: &str, kind: ErrorKind, times: u32) {
        self.extend_failures.lock().unwrap().arm(handle, kind, times);
    }

    pub fn fail_attributes(&self, kind: ErrorKind) {
        *self.attributes_error.lock().unwrap() = Some(kind);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn receive_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Receive))
            .count()
    }

    pub fn delete_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::DeleteBatch(handles) => Some(handles),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_handles(&self) -> Vec<String> {
        self.delete_calls().into_iter().flatten().collect()
    }

    pub fn extension_calls(&self) -> Vec<Vec<(String, u64)>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ChangeVisibilityBatch(entries) => Some(entries),
                _ => None,
            })
            .collect()
    }

    pub fn released_handles(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ChangeVisibility(handle, 0) => Some(handle),
                _ => None,
            })
            .collect()
    }

    fn entry_failure(kind: ErrorKind, handle: &str) -> EntryFailure {
        EntryFailure {
            receipt_handle: handle.to_string(),
            code: format!("{kind:?}"),
            kind,
        }
    }
}

#[async_trait]
impl QueueClient for FakeQueueClient {
    async fn receive(
        &self,
        _queue_url: &str,
        params: &ReceiveParams,
    ) -> Result<Vec<Message>, ListenerError> {
        self.calls.lock().unwrap().push(Call::Receive);
        let step = self.receive_script.lock().unwrap().pop_front();
        match step {
            Some(ReceiveStep::Batch(messages)) => Ok(messages),
            Some(ReceiveStep::Fail(kind)) => Err(ListenerError::queue(kind, "scripted failure")),
            Some(ReceiveStep::Empty) | None => {
                tokio::time::sleep(params.wait_time).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_batch(
        &self,
        _queue_url: &str,
        handles: &[String],
    ) -> Result<Vec<EntryFailure>, ListenerError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::DeleteBatch(handles.to_vec()));
        let mut failures = self.delete_failures.lock().unwrap();
        Ok(handles
            .iter()
            .filter_map(|h| failures.take(h).map(|kind| Self::entry_failure(kind, h)))
            .collect())
    }

    async fn change_visibility(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
        visibility: std::time::Duration,
    ) -> Result<(), ListenerError> {
        self.calls.lock().unwrap().push(Call::ChangeVisibility(
            receipt_handle.to_string(),
            visibility.as_secs(),
        ));
        Ok(())
    }

    async fn change_visibility_batch(
        &self,
        _queue_url: &str,
        entries: &[(String, std::time::Duration)],
    ) -> Result<Vec<EntryFailure>, ListenerError> {
        self.calls.lock().unwrap().push(Call::ChangeVisibilityBatch(
            entries
                .iter()
                .map(|(h, d)| (h.clone(), d.as_secs()))
                .collect(),
        ));
        let mut failures = self.extend_failures.lock().unwrap();
        Ok(entries
            .iter()
            .filter_map(|(h, _)| failures.take(h).map(|kind| Self::entry_failure(kind, h)))
            .collect())
    }

    async fn queue_attributes(
        &self,
        _queue_url: &str,
    ) -> Result<HashMap<String, String>, ListenerError> {
        self.calls.lock().unwrap().push(Call::QueueAttributes);
        if let Some(kind) = *self.attributes_error.lock().unwrap() {
            return Err(ListenerError::queue(kind, "scripted attributes failure"));
        }
        Ok(HashMap::from([(
            "ApproximateNumberOfMessages".to_string(),
            "0".to_string(),
        )]))
    }
}

/// `m-{n}` with receipt handle `rh-{n}` and a JSON body.
pub fn msg(n: usize) -> Message {
    Message::new(
        format!("m-{n}"),
        format!("rh-{n}"),
        format!("{{\"id\":{n}}}"),
        HashMap::new(),
        HashMap::new(),
    )
}

pub fn test_config(queue_url: &str) -> ListenerConfig {
    ListenerConfig {
        queue_url: queue_url.to_string(),
        wait_time_s: 1,
        batch_size: 10,
        visibility_s: 10,
        max_extend_s: 60,
        worker_threads: 2,
        idle_sleep_max_s: 0.1,
        release_on_failure: false,
    }
}
