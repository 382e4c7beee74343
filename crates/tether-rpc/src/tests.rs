use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tether_wire::{ErrorKind, Exception, PipelineOp};

use crate::cap::{Client, IncomingCall, Params, Results, Server};
use crate::queue::ResolutionCell;

/// Echoes the call content back.
struct EchoServer;

impl Server for EchoServer {
    fn dispatch(&self, call: IncomingCall) -> BoxFuture<'static, Result<Results, Exception>> {
        Box::pin(async move { Ok(Results::bytes(call.params.content)) })
    }
}

/// Records the first content byte of every call, in delivery order.
struct OrderServer {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl Server for OrderServer {
    fn dispatch(&self, call: IncomingCall) -> BoxFuture<'static, Result<Results, Exception>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            seen.lock().push(call.params.content[0]);
            Ok(Results::bytes(call.params.content))
        })
    }
}

/// Acks immediately, then waits for an external signal before completing.
struct SlowAckServer {
    release: Arc<tokio::sync::Notify>,
}

impl Server for SlowAckServer {
    fn dispatch(&self, mut call: IncomingCall) -> BoxFuture<'static, Result<Results, Exception>> {
        let release = self.release.clone();
        Box::pin(async move {
            if call.params.content == [1] {
                call.ack();
                release.notified().await;
            }
            Ok(Results::bytes(call.params.content))
        })
    }
}

/// Sends on drop, so tests can observe capability shutdown.
struct ShutdownServer {
    on_drop: mpsc::UnboundedSender<()>,
}

impl Server for ShutdownServer {
    fn dispatch(&self, _call: IncomingCall) -> BoxFuture<'static, Result<Results, Exception>> {
        Box::pin(async move { Ok(Results::default()) })
    }
}

impl Drop for ShutdownServer {
    fn drop(&mut self) {
        let _ = self.on_drop.send(());
    }
}

#[tokio::test]
async fn local_call_round_trips() {
    let client = Client::local(EchoServer);
    let answer = client.call(0, 0, Params::bytes(vec![1, 2, 3]));
    let results = answer.response().await.unwrap();
    assert_eq!(results.content, vec![1, 2, 3]);
}

#[tokio::test]
async fn broken_client_fails_calls_with_its_exception() {
    let client = Client::broken(Exception::overloaded("try later"));
    let err = client
        .call(0, 0, Params::default())
        .response()
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Overloaded);
}

#[tokio::test]
async fn local_calls_are_delivered_serially_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = Client::local(OrderServer { seen: seen.clone() });
    let answers: Vec<_> = (0..5u8)
        .map(|i| client.call(0, 0, Params::bytes(vec![i])))
        .collect();
    for (i, answer) in answers.iter().enumerate() {
        let results = answer.response().await.unwrap();
        assert_eq!(results.content, vec![i as u8]);
    }
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn ack_releases_the_next_call_while_the_handler_runs() {
    let release = Arc::new(tokio::sync::Notify::new());
    let client = Client::local(SlowAckServer {
        release: release.clone(),
    });
    let slow = client.call(0, 0, Params::bytes(vec![1]));
    let fast = client.call(0, 0, Params::bytes(vec![2]));

    // The second call completes even though the first is still running.
    let results = fast.response().await.unwrap();
    assert_eq!(results.content, vec![2]);

    release.notify_one();
    let results = slow.response().await.unwrap();
    assert_eq!(results.content, vec![1]);
}

#[tokio::test]
async fn promise_buffers_calls_and_replays_them_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (promise, resolver) = Client::promise();

    let answers: Vec<_> = (0..4u8)
        .map(|i| promise.call(0, 0, Params::bytes(vec![i])))
        .collect();
    // Nothing is delivered yet.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(seen.lock().is_empty());

    resolver.fulfill(Client::local(OrderServer { seen: seen.clone() }));
    for answer in &answers {
        answer.response().await.unwrap();
    }
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn calls_submitted_during_fulfillment_stay_in_submission_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (promise, resolver) = Client::promise();
    let target = Client::local(OrderServer { seen: seen.clone() });

    let submitter = {
        let promise = promise.clone();
        tokio::spawn(async move {
            let mut answers = Vec::new();
            for i in 0..32u8 {
                answers.push(promise.call(0, 0, Params::bytes(vec![i])));
                if i % 4 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            answers
        })
    };
    tokio::time::sleep(Duration::from_millis(2)).await;
    resolver.fulfill(target);

    let answers = submitter.await.unwrap();
    for answer in &answers {
        answer.response().await.unwrap();
    }
    let seen = seen.lock();
    assert_eq!(*seen, (0..32u8).collect::<Vec<_>>());
}

#[tokio::test]
async fn rejected_promise_fails_buffered_and_future_calls() {
    let (promise, resolver) = Client::promise();
    let buffered = promise.call(0, 0, Params::default());
    resolver.reject(Exception::failed("nope"));

    let err = buffered.response().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
    assert_eq!(err.reason, "nope");

    let later = promise.call(0, 0, Params::default());
    let err = later.response().await.unwrap_err();
    assert_eq!(err.reason, "nope");
}

#[tokio::test]
async fn promise_resolving_to_promise_preserves_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (outer, outer_resolver) = Client::promise();
    let (inner, inner_resolver) = Client::promise();

    let a = outer.call(0, 0, Params::bytes(vec![1]));
    outer_resolver.fulfill(inner.clone());
    let b = outer.call(0, 0, Params::bytes(vec![2]));

    inner_resolver.fulfill(Client::local(OrderServer { seen: seen.clone() }));
    a.response().await.unwrap();
    b.response().await.unwrap();
    assert_eq!(*seen.lock(), vec![1, 2]);
}

#[tokio::test]
async fn when_resolved_wakes_on_fulfillment() {
    let (promise, resolver) = Client::promise();
    let waiter = {
        let promise = promise.clone();
        tokio::spawn(async move { promise.when_resolved().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    resolver.fulfill(Client::local(EchoServer));
    waiter.await.unwrap().unwrap();

    // Settled promises report immediately.
    promise.when_resolved().await.unwrap();
}

#[tokio::test]
async fn when_resolved_reports_rejection() {
    let (promise, resolver) = Client::promise();
    resolver.reject(Exception::disconnected("gone"));
    let err = promise.when_resolved().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disconnected);
}

#[tokio::test]
async fn pipelined_calls_on_local_answers_reach_the_result_capability() {
    struct Provider {
        inner: Client,
    }
    impl Server for Provider {
        fn dispatch(
            &self,
            _call: IncomingCall,
        ) -> BoxFuture<'static, Result<Results, Exception>> {
            let inner = self.inner.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Results::new(Vec::new(), vec![inner]))
            })
        }
    }

    let provider = Client::local(Provider {
        inner: Client::local(EchoServer),
    });
    let answer = provider.call(0, 0, Params::default());
    // Call through the pipeline before the provider has answered.
    let echoed = answer
        .pipeline(vec![])
        .call(0, 0, Params::bytes(vec![9]))
        .response()
        .await
        .unwrap();
    assert_eq!(echoed.content, vec![9]);
}

#[tokio::test]
async fn dropping_the_last_client_shuts_the_server_down() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client::local(ShutdownServer { on_drop: tx });
    let clone = client.clone();
    drop(client);
    assert!(rx.try_recv().is_err());
    drop(clone);
    rx.recv().await.expect("server should be dropped");
}

#[test]
fn transforms_index_the_capability_table() {
    let a = Client::broken(Exception::failed("a"));
    let b = Client::broken(Exception::failed("b"));
    let results = Results::new(Vec::new(), vec![a, b]);

    let root = results.cap_at(&[]).unwrap();
    assert_eq!(root.broken_exception().unwrap().reason, "a");

    let second = results
        .cap_at(&[PipelineOp::Noop, PipelineOp::GetPointerField(1)])
        .unwrap();
    assert_eq!(second.broken_exception().unwrap().reason, "b");

    let err = results
        .cap_at(&[PipelineOp::GetPointerField(7)])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
}

#[tokio::test]
async fn resolution_cell_delivers_to_early_and_late_waiters() {
    let cell = Arc::new(ResolutionCell::new());
    let early = {
        let cell = cell.clone();
        tokio::spawn(async move { cell.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(2)).await;
    cell.resolve(7u32);
    cell.resolve(8u32); // first resolution wins
    assert_eq!(early.await.unwrap(), Some(7));
    assert_eq!(cell.wait().await, Some(7));
    assert_eq!(cell.peek(), Some(7));
}
