//! Top-level lifecycle: spawn pollers, watch for the stop signal, drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::client::QueueClient;
use crate::dispatch::Dispatcher;
use crate::errors::ListenerError;
use crate::poller::Poller;
use crate::registry::Registry;

/// Process-wide stop token. Pollers and sleeps observe it between
/// operations; handler invocations are never interrupted.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token trips; immediately if it already has.
    pub async fn notified(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Trip the token on SIGTERM or SIGINT.
    pub fn listen_for_signals(self: &Arc<Self>) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let mut term = match unix_signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            info!("stop signal received; draining");
            shutdown.trigger();
        });
    }
}

/// How a finished run ended; maps onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every poller drained within the grace period.
    Clean,
    /// Drain timed out; still-running handlers were abandoned and their
    /// messages will redeliver.
    GraceExceeded,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Clean => 0,
            RunOutcome::GraceExceeded => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// How long drain may take after the stop signal. The container
    /// stopTimeout should be at least this.
    pub grace_period: Duration,
    /// Fail startup if a queue is unreachable at boot.
    pub strict: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            strict: false,
        }
    }
}

/// Run every registered listener until the shutdown token trips, then
/// drain. Startup errors are returned; the caller maps them to exit
/// code 1.
pub async fn run_all(
    client: Arc<dyn QueueClient>,
    registry: Registry,
    run_cfg: RunConfig,
    shutdown: Arc<Shutdown>,
) -> Result<RunOutcome, ListenerError> {
    if registry.is_empty() {
        return Err(ListenerError::Config(
            "no listeners registered".to_string(),
        ));
    }

    info!(count = registry.len(), "starting listeners");

    // Boot-time sanity check, and the only use of queue attributes.
    for listener in registry.listeners() {
        let queue_url = &listener.config.queue_url;
        match client.queue_attributes(queue_url).await {
            Ok(attrs) => info!(
                queue = %queue_url,
                depth = attrs
                    .get("ApproximateNumberOfMessages")
                    .map(String::as_str)
                    .unwrap_or("?"),
                "queue reachable"
            ),
            Err(e) if run_cfg.strict => {
                error!(queue = %queue_url, error = %e, "queue unreachable at boot");
                return Err(e);
            }
            Err(e) => warn!(
                queue = %queue_url,
                error = %e,
                "queue attributes unavailable at startup"
            ),
        }
    }

    let mut pollers = JoinSet::new();
    for listener in registry.into_listeners() {
        let semaphore = Arc::new(Semaphore::new(listener.config.worker_threads));
        let dispatcher = Arc::new(Dispatcher::new(
            client.clone(),
            listener.config.clone(),
            listener.handler.clone(),
            semaphore,
        ));
        for index in 0..listener.config.worker_threads {
            let poller = Poller::new(
                client.clone(),
                listener.config.clone(),
                dispatcher.clone(),
                shutdown.clone(),
                index,
            );
            pollers.spawn(poller.run());
        }
    }

    info!(pollers = pollers.len(), "all listeners started");

    tokio::select! {
        _ = shutdown.notified() => {}
        _ = join_all(&mut pollers) => {
            // Every poller exited on its own (listener-fatal errors).
            info!("all pollers exited");
            return Ok(RunOutcome::Clean);
        }
    }

    match timeout(run_cfg.grace_period, join_all(&mut pollers)).await {
        Ok(()) => {
            info!("all listeners stopped");
            Ok(RunOutcome::Clean)
        }
        Err(_) => {
            warn!(
                remaining = pollers.len(),
                "grace period exceeded; abandoning in-flight work"
            );
            pollers.abort_all();
            Ok(RunOutcome::GraceExceeded)
        }
    }
}

async fn join_all(pollers: &mut JoinSet<()>) {
    while let Some(res) = pollers.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "poller task join error");
        }
    }
}
