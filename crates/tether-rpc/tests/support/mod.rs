#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use tether_rpc::{Exception, IncomingCall, MessageTransport, Results, Server};
use tether_transport_mem::MemTransport;
use tether_wire::Message;

/// Route driver logs to the test harness; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Receive the next message from a scripted peer, failing the test on
/// timeout or close.
pub async fn recv(t: &mut MemTransport) -> Message {
    tokio::time::timeout(Duration::from_secs(5), t.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("transport error")
        .expect("transport closed")
}

pub fn num(n: u64) -> Vec<u8> {
    n.to_le_bytes().to_vec()
}

pub fn read_num(content: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&content[..8]);
    u64::from_le_bytes(bytes)
}

/// Echoes the call content back.
pub struct EchoServer;

impl Server for EchoServer {
    fn dispatch(&self, call: IncomingCall) -> BoxFuture<'static, Result<Results, Exception>> {
        Box::pin(async move { Ok(Results::bytes(call.params.content)) })
    }
}

/// Echoes numbers and records the order they arrived in.
pub struct RecordingServer {
    pub seen: Arc<Mutex<Vec<u64>>>,
}

impl RecordingServer {
    pub fn new() -> (Self, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (Self { seen: seen.clone() }, seen)
    }
}

impl Server for RecordingServer {
    fn dispatch(&self, call: IncomingCall) -> BoxFuture<'static, Result<Results, Exception>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            seen.lock().push(read_num(&call.params.content));
            Ok(Results::bytes(call.params.content))
        })
    }
}
