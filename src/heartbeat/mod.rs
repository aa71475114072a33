//! Visibility-timeout heartbeat.
//!
//! While a handler runs, a heartbeat task keeps re-arming the visibility
//! timeout of every handle it owns, up to a hard cap. The shared
//! [`LeaseBoard`] is the single source of truth for whether a handle may
//! still be deleted: once a lease is lost or capped, settlement refuses
//! the delete and redelivery takes over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::client::QueueClient;
use crate::errors::ErrorKind;
use crate::retry::Backoff;

/// Lease state per in-flight message:
/// `Leased -> (extend ok)* -> {settled | LeaseLost | Capped}`.
/// Settlement is recorded by removing the decision from the board's
/// concern; only `Leased` handles are deletable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Leased,
    LeaseLost,
    Capped,
}

struct LeaseEntry {
    received_at: Instant,
    state: LeaseState,
}

/// Mutex-guarded `handle -> lease` map shared between one dispatcher and
/// its heartbeat tasks. Critical sections are short; no await while held.
#[derive(Default)]
pub struct LeaseBoard {
    leases: Mutex<HashMap<String, LeaseEntry>>,
}

impl LeaseBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, receipt_handle: &str, received_at: Instant) {
        self.leases.lock().unwrap().insert(
            receipt_handle.to_string(),
            LeaseEntry {
                received_at,
                state: LeaseState::Leased,
            },
        );
    }

    pub fn state(&self, receipt_handle: &str) -> Option<LeaseState> {
        self.leases
            .lock()
            .unwrap()
            .get(receipt_handle)
            .map(|e| e.state)
    }

    /// A handle may be deleted only while its lease is intact.
    pub fn deletable(&self, receipt_handle: &str) -> bool {
        self.state(receipt_handle) == Some(LeaseState::Leased)
    }

    pub fn mark_lost(&self, receipt_handle: &str) {
        self.mark(receipt_handle, LeaseState::LeaseLost);
    }

    pub fn mark_capped(&self, receipt_handle: &str) {
        self.mark(receipt_handle, LeaseState::Capped);
    }

    fn mark(&self, receipt_handle: &str, state: LeaseState) {
        if let Some(entry) = self.leases.lock().unwrap().get_mut(receipt_handle) {
            if entry.state == LeaseState::Leased {
                entry.state = state;
            }
        }
    }

    /// The subset of `handles` still leased, with their receive times.
    fn leased_of(&self, handles: &[String]) -> Vec<(String, Instant)> {
        let leases = self.leases.lock().unwrap();
        handles
            .iter()
            .filter_map(|h| {
                leases
                    .get(h)
                    .filter(|e| e.state == LeaseState::Leased)
                    .map(|e| (h.clone(), e.received_at))
            })
            .collect()
    }
}

/// Extension must land this long before the lease would expire.
pub fn safety_margin(visibility: Duration) -> Duration {
    Duration::from_secs(5).max(visibility.mul_f64(0.2))
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub visibility: Duration,
    pub max_extend: Duration,
}

/// Handle to a running heartbeat task. Dropping without `stop` leaves the
/// task running until its handles settle; settlement paths always stop it
/// explicitly.
pub struct Heartbeat {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn a heartbeat owning `handles`. Batch mode passes the whole
    /// batch; per-message mode passes a single handle.
    pub fn spawn(
        client: Arc<dyn QueueClient>,
        queue_url: impl Into<String>,
        cfg: HeartbeatConfig,
        board: Arc<LeaseBoard>,
        handles: Vec<String>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(client, queue_url.into(), cfg, board, handles, stop_rx));
        Self { stop_tx, task }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

async fn run(
    client: Arc<dyn QueueClient>,
    queue_url: String,
    cfg: HeartbeatConfig,
    board: Arc<LeaseBoard>,
    handles: Vec<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let margin = safety_margin(cfg.visibility);
    let interval = cfg
        .visibility
        .saturating_sub(margin)
        .max(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = stop_rx.changed() => return,
        }
        let live = tick(&*client, &queue_url, &cfg, &board, &handles, margin).await;
        if live == 0 {
            return;
        }
    }
}

/// One extension round. Returns how many handles are still leased.
async fn tick(
    client: &dyn QueueClient,
    queue_url: &str,
    cfg: &HeartbeatConfig,
    board: &LeaseBoard,
    handles: &[String],
    margin: Duration,
) -> usize {
    let now = Instant::now();

    // Cap check first: a capped message gets no further extension and can
    // no longer be deleted, because redelivery may already have happened
    // by the time its handler returns.
    for (handle, received_at) in board.leased_of(handles) {
        if now.duration_since(received_at) >= cfg.max_extend {
            warn!(handle = short(&handle), "extension cap reached; lease will expire");
            board.mark_capped(&handle);
        }
    }

    let mut pending: Vec<String> = board
        .leased_of(handles)
        .into_iter()
        .map(|(h, _)| h)
        .collect();
    if pending.is_empty() {
        return 0;
    }

    // Retries must land before the current lease runs out; the margin is
    // the whole budget.
    let deadline = now + margin;
    let backoff = Backoff::for_settle();
    let mut attempt = 0u32;

    while !pending.is_empty() {
        let mut retry: Vec<String> = Vec::new();

        for chunk in pending.chunks(10) {
            let entries: Vec<(String, Duration)> = chunk
                .iter()
                .map(|h| (h.clone(), cfg.visibility))
                .collect();

            match client.change_visibility_batch(queue_url, &entries).await {
                Ok(failures) => {
                    let mut failed_handles = std::collections::HashSet::new();
                    for f in failures {
                        failed_handles.insert(f.receipt_handle.clone());
                        match f.kind {
                            ErrorKind::InvalidHandle | ErrorKind::NotFound => {
                                warn!(
                                    handle = short(&f.receipt_handle),
                                    code = %f.code,
                                    "lease lost during extension"
                                );
                                board.mark_lost(&f.receipt_handle);
                            }
                            k if k.is_retryable() => retry.push(f.receipt_handle),
                            _ => {
                                error!(
                                    handle = short(&f.receipt_handle),
                                    code = %f.code,
                                    "extension failed; treating lease as lost"
                                );
                                board.mark_lost(&f.receipt_handle);
                            }
                        }
                    }
                    for h in chunk.iter().filter(|h| !failed_handles.contains(*h)) {
                        debug!(
                            handle = short(h),
                            visibility_s = cfg.visibility.as_secs(),
                            "visibility extended"
                        );
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::InvalidHandle | ErrorKind::NotFound => {
                        warn!(error = %e, "extension call failed; leases lost");
                        chunk.iter().for_each(|h| board.mark_lost(h));
                    }
                    k if k.is_retryable() => {
                        warn!(error = %e, "transient extension failure; will retry");
                        retry.extend(chunk.iter().cloned());
                    }
                    _ => {
                        error!(error = %e, "extension failed; treating leases as lost");
                        chunk.iter().for_each(|h| board.mark_lost(h));
                    }
                },
            }
        }

        if retry.is_empty() {
            break;
        }

        let delay = backoff.delay(attempt);
        attempt += 1;
        if Instant::now() + delay >= deadline {
            // No retry can land before expiry; give the messages up.
            for h in &retry {
                warn!(handle = short(h), "no time left to extend; lease lost");
                board.mark_lost(h);
            }
            break;
        }
        sleep(delay).await;

        pending = board
            .leased_of(&retry)
            .into_iter()
            .map(|(h, _)| h)
            .collect();
    }

    board.leased_of(handles).len()
}

fn short(handle: &str) -> &str {
    handle.get(..12).unwrap_or(handle)
}
