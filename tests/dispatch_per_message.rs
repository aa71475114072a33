//! Per-message dispatch: bool contract, bounded concurrency, amortized
//! deletes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use common::{msg, test_config, FakeQueueClient};
use sqs_listener::client::QueueClient;
use sqs_listener::config::ListenerConfig;
use sqs_listener::dispatch::Dispatcher;
use sqs_listener::errors::ListenerError;
use sqs_listener::message::Message;
use sqs_listener::registry::Handler;

fn dispatcher(
    client: Arc<FakeQueueClient>,
    config: ListenerConfig,
    handler: Handler,
    permits: usize,
) -> Dispatcher {
    Dispatcher::new(
        client as Arc<dyn QueueClient>,
        config,
        handler,
        Arc::new(Semaphore::new(permits)),
    )
}

#[tokio::test]
async fn true_deletes_false_and_error_leave() {
    let client = FakeQueueClient::new(vec![]);
    let handler = Handler::PerMessage(Arc::new(|m: Message| async move {
        match m.message_id() {
            "m-2" => Ok(false),
            "m-3" => Err(ListenerError::Handler("boom".to_string())),
            _ => Ok(true),
        }
    }));
    let d = dispatcher(client.clone(), test_config("q"), handler, 2);

    d.dispatch(vec![msg(1), msg(2), msg(3), msg(4)]).await;

    let mut deleted = client.deleted_handles();
    deleted.sort();
    assert_eq!(deleted, vec!["rh-1", "rh-4"]);
}

#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded_by_worker_threads() {
    let client = FakeQueueClient::new(vec![]);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handler = {
        let current = current.clone();
        let peak = peak.clone();
        Handler::PerMessage(Arc::new(move |_m: Message| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ListenerError>(true)
            }
        }))
    };
    let d = dispatcher(client.clone(), test_config("q"), handler, 2);

    d.dispatch((1..=8).map(msg).collect()).await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(client.deleted_handles().len(), 8);
}

#[tokio::test]
async fn deletes_are_amortized_in_chunks_of_ten() {
    let client = FakeQueueClient::new(vec![]);
    let handler = Handler::PerMessage(Arc::new(|_m: Message| async {
        Ok::<_, ListenerError>(true)
    }));
    let d = dispatcher(client.clone(), test_config("q"), handler, 4);

    d.dispatch((1..=12).map(msg).collect()).await;

    let deletes = client.delete_calls();
    assert_eq!(deletes.len(), 2);
    assert_eq!(deletes[0].len(), 10);
    assert_eq!(deletes[1].len(), 2);
    assert_eq!(client.deleted_handles().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn each_message_gets_its_own_heartbeat() {
    let client = FakeQueueClient::new(vec![]);
    let handler = Handler::PerMessage(Arc::new(|_m: Message| async {
        tokio::time::sleep(Duration::from_secs(12)).await;
        Ok::<_, ListenerError>(true)
    }));
    let d = dispatcher(client.clone(), test_config("q"), handler, 2);

    d.dispatch(vec![msg(1), msg(2)]).await;

    // Two concurrent handlers at 12s each force at least one extension
    // apiece, and every extension call carries exactly one handle.
    let calls = client.extension_calls();
    assert!(calls.len() >= 2);
    assert!(calls.iter().all(|entries| entries.len() == 1));
    assert_eq!(client.deleted_handles().len(), 2);
}
