//! Per-listener poll loop.
//!
//! A listener runs `worker_threads` pollers against the same queue. Each
//! poller is independent: long-poll, hand the batch to the dispatcher,
//! wait for settlement, repeat. The only shared state is the shutdown
//! token and the listener's worker semaphore (inside the dispatcher).

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::client::{QueueClient, ReceiveParams};
use crate::config::ListenerConfig;
use crate::dispatch::Dispatcher;
use crate::errors::ErrorKind;
use crate::retry::{idle_jitter, Backoff};
use crate::supervisor::Shutdown;

pub struct Poller {
    client: Arc<dyn QueueClient>,
    config: ListenerConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<Shutdown>,
    index: usize,
}

impl Poller {
    pub fn new(
        client: Arc<dyn QueueClient>,
        config: ListenerConfig,
        dispatcher: Arc<Dispatcher>,
        shutdown: Arc<Shutdown>,
        index: usize,
    ) -> Self {
        Self {
            client,
            config,
            dispatcher,
            shutdown,
            index,
        }
    }

    pub async fn run(self) {
        let params = ReceiveParams {
            max_messages: self.config.batch_size,
            wait_time: self.config.wait_time(),
            visibility: self.config.visibility(),
        };
        let backoff = Backoff::for_receive();
        let mut failures = 0u32;

        info!(poller = self.index, queue = %self.config.queue_url, "poller started");

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            // The long poll races the shutdown token so drain does not
            // wait out a full poll window.
            let received = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                r = self.client.receive(&self.config.queue_url, &params) => r,
            };

            match received {
                Ok(batch) if batch.is_empty() => {
                    failures = 0;
                    // Randomized nap so idle pollers drift apart.
                    let nap = idle_jitter(self.config.idle_sleep_max());
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = sleep(nap) => {}
                    }
                }
                Ok(batch) => {
                    failures = 0;
                    self.dispatcher.dispatch(batch).await;
                }
                Err(e) if e.kind().is_retryable() => {
                    failures += 1;
                    // Throttling starts one step deeper into the curve.
                    let step = if e.kind() == ErrorKind::Throttled {
                        failures
                    } else {
                        failures - 1
                    };
                    let delay = backoff.delay(step);
                    warn!(
                        poller = self.index,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "receive failed; backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        poller = self.index,
                        queue = %self.config.queue_url,
                        error = %e,
                        "unrecoverable receive error; stopping poller"
                    );
                    break;
                }
            }
        }

        info!(poller = self.index, "poller stopped");
    }
}
