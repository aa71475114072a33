//! Dispatch and settlement.
//!
//! A dispatcher takes one receive batch, runs the user handler in the
//! listener's mode, and settles every message: delete on success, leave
//! (or explicitly release) on failure. Deletes are refused for any handle
//! whose lease was lost or capped while the handler ran.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::client::QueueClient;
use crate::config::ListenerConfig;
use crate::errors::ErrorKind;
use crate::heartbeat::{Heartbeat, HeartbeatConfig, LeaseBoard};
use crate::message::Message;
use crate::registry::{BatchHandler, Handler, MessageHandler};
use crate::retry::{Backoff, SETTLE_ATTEMPTS};

pub struct Dispatcher {
    client: Arc<dyn QueueClient>,
    config: ListenerConfig,
    handler: Handler,
    /// Shared per listener; in per-message mode this caps concurrent
    /// handler invocations across all pollers.
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn QueueClient>,
        config: ListenerConfig,
        handler: Handler,
        semaphore: Arc<Semaphore>,
    ) -> Self {
        Self {
            client,
            config,
            handler,
            semaphore,
        }
    }

    fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            visibility: self.config.visibility(),
            max_extend: self.config.max_extend(),
        }
    }

    /// Process one receive batch to full settlement. Returning is the
    /// poller's completion signal.
    pub async fn dispatch(&self, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        let received_at = Instant::now();
        let board = Arc::new(LeaseBoard::new());
        for m in &batch {
            board.track(m.receipt_handle(), received_at);
        }

        match self.handler.clone() {
            Handler::Batch(h) => self.dispatch_batch(h, batch, board).await,
            Handler::PerMessage(h) => self.dispatch_per_message(h, batch, board).await,
        }
    }

    async fn dispatch_batch(
        &self,
        handler: Arc<dyn BatchHandler>,
        batch: Vec<Message>,
        board: Arc<LeaseBoard>,
    ) {
        let handles: Vec<String> = batch
            .iter()
            .map(|m| m.receipt_handle().to_string())
            .collect();

        // One heartbeat serves the whole batch.
        let heartbeat = Heartbeat::spawn(
            self.client.clone(),
            &self.config.queue_url,
            self.heartbeat_config(),
            board.clone(),
            handles.clone(),
        );

        let failed: HashSet<String> = match handler.handle(batch).await {
            Ok(result) => {
                let known: HashSet<&str> = handles.iter().map(String::as_str).collect();
                let mut failed = HashSet::new();
                for handle in result.failed_receipt_handles() {
                    if known.contains(handle.as_str()) {
                        failed.insert(handle.clone());
                    } else {
                        warn!(
                            handle = handle.as_str(),
                            "handler reported a handle outside this batch; ignoring"
                        );
                    }
                }
                failed
            }
            Err(e) => {
                // Whole-batch failure: nothing gets deleted.
                error!(error = %e, "batch handler failed; no deletes for this batch");
                handles.iter().cloned().collect()
            }
        };

        heartbeat.stop().await;

        let mut to_delete = Vec::new();
        let mut lease_gone = 0usize;
        for handle in &handles {
            if failed.contains(handle) {
                continue;
            }
            if board.deletable(handle) {
                to_delete.push(handle.clone());
            } else {
                lease_gone += 1;
                warn!(
                    state = ?board.state(handle),
                    "lease not intact at settlement; leaving message for redelivery"
                );
            }
        }

        if failed.is_empty() && lease_gone == 0 {
            info!(ok = to_delete.len(), "batch processed");
        } else {
            warn!(
                ok = to_delete.len(),
                failed = failed.len(),
                lease_gone,
                "batch processed with failures"
            );
        }

        self.delete_handles(&to_delete).await;

        if self.config.release_on_failure {
            let releasable: Vec<&String> =
                failed.iter().filter(|h| board.deletable(h)).collect();
            self.release_handles(&releasable).await;
        }
    }

    async fn dispatch_per_message(
        &self,
        handler: Arc<dyn MessageHandler>,
        batch: Vec<Message>,
        board: Arc<LeaseBoard>,
    ) {
        let mut join: JoinSet<(String, bool)> = JoinSet::new();

        for msg in batch {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    error!("worker semaphore closed; abandoning rest of batch");
                    break;
                }
            };
            let client = self.client.clone();
            let queue_url = self.config.queue_url.clone();
            let hb_cfg = self.heartbeat_config();
            let board = board.clone();
            let handler = handler.clone();

            join.spawn(async move {
                let _permit = permit;
                let handle = msg.receipt_handle().to_string();
                let message_id = msg.message_id().to_string();

                // Each message gets its own heartbeat.
                let heartbeat =
                    Heartbeat::spawn(client, queue_url, hb_cfg, board, vec![handle.clone()]);
                let outcome = handler.handle(msg).await;
                heartbeat.stop().await;

                let ok = match outcome {
                    Ok(true) => true,
                    Ok(false) => {
                        debug!(message_id = %message_id, "handler declined; leaving for redelivery");
                        false
                    }
                    Err(e) => {
                        error!(message_id = %message_id, error = %e, "handler failed");
                        false
                    }
                };
                (handle, ok)
            });
        }

        let mut ok_handles = Vec::new();
        let mut failed = 0usize;
        while let Some(res) = join.join_next().await {
            match res {
                Ok((handle, true)) => ok_handles.push(handle),
                Ok((_, false)) => failed += 1,
                Err(e) => {
                    error!(error = %e, "handler task panicked; message left for redelivery");
                    failed += 1;
                }
            }
        }

        let mut to_delete = Vec::new();
        let mut lease_gone = 0usize;
        for handle in ok_handles {
            if board.deletable(&handle) {
                to_delete.push(handle);
            } else {
                lease_gone += 1;
                warn!(
                    state = ?board.state(&handle),
                    "lease not intact at settlement; leaving message for redelivery"
                );
            }
        }

        info!(
            ok = to_delete.len(),
            failed,
            lease_gone,
            "per-message batch settled"
        );

        // Deletes are amortized: one call per 10 settled messages.
        self.delete_handles(&to_delete).await;
    }

    /// Delete handles in chunks of at most 10, retrying transient
    /// failures with backoff.
    async fn delete_handles(&self, handles: &[String]) {
        if handles.is_empty() {
            return;
        }
        let backoff = Backoff::for_settle();
        let mut deleted = 0usize;

        for chunk in handles.chunks(10) {
            let mut pending: Vec<String> = chunk.to_vec();
            let mut attempt = 0u32;

            while !pending.is_empty() {
                match self
                    .client
                    .delete_batch(&self.config.queue_url, &pending)
                    .await
                {
                    Ok(failures) => {
                        deleted += pending.len() - failures.len();
                        let mut retry = Vec::new();
                        for f in failures {
                            match f.kind {
                                ErrorKind::InvalidHandle => {
                                    warn!(
                                        code = %f.code,
                                        "receipt handle dead on delete; redelivery will settle it"
                                    );
                                }
                                k if k.is_retryable() && attempt + 1 < SETTLE_ATTEMPTS => {
                                    retry.push(f.receipt_handle);
                                }
                                _ => {
                                    error!(
                                        code = %f.code,
                                        "delete failed; message will redeliver"
                                    );
                                }
                            }
                        }
                        pending = retry;
                    }
                    Err(e) if e.kind().is_retryable() && attempt + 1 < SETTLE_ATTEMPTS => {
                        warn!(error = %e, "transient delete failure; will retry");
                    }
                    Err(e) => {
                        error!(error = %e, count = pending.len(), "delete failed; messages will redeliver");
                        pending.clear();
                    }
                }

                if pending.is_empty() {
                    break;
                }
                sleep(backoff.delay(attempt)).await;
                attempt += 1;
            }
        }

        if deleted > 0 {
            info!(count = deleted, "deleted messages");
        }
    }

    /// Make failed handles immediately re-deliverable by zeroing their
    /// visibility.
    async fn release_handles(&self, handles: &[&String]) {
        for handle in handles {
            match self
                .client
                .change_visibility(&self.config.queue_url, handle, Duration::ZERO)
                .await
            {
                Ok(()) => debug!("released failed message for immediate redelivery"),
                Err(e) if e.kind() == ErrorKind::InvalidHandle => {
                    debug!(error = %e, "handle already dead on release")
                }
                Err(e) => warn!(error = %e, "failed to release message; visibility will expire"),
            }
        }
    }
}
