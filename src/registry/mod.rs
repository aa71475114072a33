//! Handler registration.
//!
//! The application builds a [`Registry`] explicitly and hands it to
//! [`run_all`](crate::supervisor::run_all); there is no import-time
//! side-channel. Plain async functions register directly through the
//! blanket impls.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{self, ListenerConfig, ListenerOverrides};
use crate::errors::ListenerError;
use crate::message::{BatchResult, Message};

/// Batch-mode handler: receives the whole receive batch in queue order and
/// reports the handles it could not process.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: Vec<Message>) -> Result<BatchResult, ListenerError>;
}

/// Per-message handler: `Ok(true)` deletes, `Ok(false)` or `Err` leaves the
/// message for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<bool, ListenerError>;
}

#[async_trait]
impl<F, Fut> BatchHandler for F
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BatchResult, ListenerError>> + Send,
{
    async fn handle(&self, batch: Vec<Message>) -> Result<BatchResult, ListenerError> {
        (self)(batch).await
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, ListenerError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<bool, ListenerError> {
        (self)(message).await
    }
}

/// The two handler shapes, tagged. The variant *is* the listener mode.
#[derive(Clone)]
pub enum Handler {
    Batch(Arc<dyn BatchHandler>),
    PerMessage(Arc<dyn MessageHandler>),
}

impl Handler {
    pub fn mode(&self) -> &'static str {
        match self {
            Handler::Batch(_) => "batch",
            Handler::PerMessage(_) => "per_message",
        }
    }
}

/// One registered consumer: resolved config plus its handler.
pub struct Listener {
    pub config: ListenerConfig,
    pub handler: Handler,
}

#[derive(Default)]
pub struct Registry {
    listeners: Vec<Listener>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch<H>(
        self,
        overrides: ListenerOverrides,
        handler: H,
    ) -> Result<Self, ListenerError>
    where
        H: BatchHandler + 'static,
    {
        self.add(overrides, Handler::Batch(Arc::new(handler)))
    }

    pub fn add_per_message<H>(
        self,
        overrides: ListenerOverrides,
        handler: H,
    ) -> Result<Self, ListenerError>
    where
        H: MessageHandler + 'static,
    {
        self.add(overrides, Handler::PerMessage(Arc::new(handler)))
    }

    fn add(mut self, overrides: ListenerOverrides, handler: Handler) -> Result<Self, ListenerError> {
        let config = config::resolve(overrides)?;
        info!(
            queue = %config.queue_url,
            mode = handler.mode(),
            wait_time = config.wait_time_s,
            batch_size = config.batch_size,
            visibility = config.visibility_s,
            threads = config.worker_threads,
            "listener registered"
        );
        self.listeners.push(Listener { config, handler });
        Ok(self)
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn into_listeners(self) -> Vec<Listener> {
        self.listeners
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
