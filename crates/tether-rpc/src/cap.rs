//! Capability clients: local servers, imported proxies, promises.
//!
//! A [`Client`] is a cheaply cloneable reference to an invocable object. It
//! may point at a server hosted in this vat, at a capability imported over a
//! connection, or at a promise that has not settled yet. Calls submitted
//! through one client arrive at the eventual target in submission order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use tether_wire::{Exception, ImportId, PipelineOp};

use crate::driver::{ConnTask, ConnTx, QuestionRef};
use crate::queue::{
    fail_delivery, local_pipeline_client, pipeline_client, CallStarted, Delivery, ForwardTarget,
    PromiseCore, PromisePeek, QueuedCall, ResponseCell, ResponseSink, Resolution,
};

// ============================================================================
// Call data
// ============================================================================

/// Arguments of a call: opaque content plus the capabilities it references.
///
/// `content` is produced by the external codec; the core moves it verbatim
/// and only interprets `caps`.
#[derive(Default)]
pub struct Params {
    pub content: Vec<u8>,
    pub caps: Vec<Client>,
}

impl Params {
    pub fn new(content: Vec<u8>, caps: Vec<Client>) -> Self {
        Self { content, caps }
    }

    /// Capability-free params.
    pub fn bytes(content: Vec<u8>) -> Self {
        Self {
            content,
            caps: Vec::new(),
        }
    }
}

/// Results of a call, same shape as [`Params`].
#[derive(Default)]
pub struct Results {
    pub content: Vec<u8>,
    pub caps: Vec<Client>,
}

impl std::fmt::Debug for Results {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("content", &self.content)
            .field("caps_len", &self.caps.len())
            .finish()
    }
}

impl Results {
    pub fn new(content: Vec<u8>, caps: Vec<Client>) -> Self {
        Self { content, caps }
    }

    pub fn bytes(content: Vec<u8>) -> Self {
        Self {
            content,
            caps: Vec::new(),
        }
    }

    /// Extract the capability a pipeline transform addresses.
    ///
    /// Content is opaque to the core, so pointer-field steps index the
    /// capability table; the last step decides, and an empty transform
    /// selects the root capability.
    pub fn cap_at(&self, transform: &[PipelineOp]) -> Result<Client, Exception> {
        let mut idx = 0usize;
        for op in transform {
            if let PipelineOp::GetPointerField(n) = op {
                idx = *n as usize;
            }
        }
        self.caps
            .get(idx)
            .cloned()
            .ok_or_else(|| Exception::failed(format!("no capability at pipeline position {idx}")))
    }
}

// ============================================================================
// Server dispatch
// ============================================================================

/// An object hosted in this vat that the RPC layer can invoke.
///
/// Calls on one capability are delivered one at a time in arrival order;
/// implementations clone whatever state the returned future needs. A server
/// observes shutdown through its own `Drop`, which runs once the last
/// [`Client`] referencing it is gone.
pub trait Server: Send + Sync + 'static {
    fn dispatch(&self, call: IncomingCall) -> BoxFuture<'static, Result<Results, Exception>>;
}

/// One call delivered to a [`Server`].
pub struct IncomingCall {
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Params,
    acker: Acker,
}

impl IncomingCall {
    /// Declare that this call's ordering position has been consumed,
    /// releasing the next queued call while this one keeps executing.
    pub fn ack(&mut self) {
        self.acker.ack();
    }
}

struct Acker(Option<oneshot::Sender<()>>);

impl Acker {
    fn ack(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// A reference to an invocable capability.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.inner {
            ClientInner::Local(_) => "Local",
            ClientInner::Remote(_) => "Remote",
            ClientInner::Promise(_) => "Promise",
            ClientInner::Broken(_) => "Broken",
        };
        f.debug_tuple("Client").field(&kind).finish()
    }
}

pub(crate) enum ClientInner {
    /// Hosted in this vat.
    Local(LocalClient),
    /// A settled capability imported over a connection.
    Remote(ImportRef),
    /// A promise: local, imported, or pipelined.
    Promise(Arc<PromiseCore>),
    /// Permanently failed.
    Broken(Exception),
}

/// A capability's current position relative to one connection.
pub(crate) enum PeerPath {
    Import(ImportId),
    Answer {
        question: Arc<QuestionRef>,
        transform: Vec<PipelineOp>,
    },
}

impl Client {
    /// Host a server as a capability.
    pub fn local<S: Server>(server: S) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_local_worker(Arc::new(server), rx);
        Client::from_inner(Arc::new(ClientInner::Local(LocalClient { jobs: tx })))
    }

    /// A capability that fails every call with `err`.
    pub fn broken(err: Exception) -> Client {
        Client::from_inner(Arc::new(ClientInner::Broken(err)))
    }

    /// The null capability.
    pub(crate) fn null() -> Client {
        Client::broken(Exception::failed("called a null capability"))
    }

    /// Create an unsettled promise capability and its resolver.
    ///
    /// Calls made before the resolver fulfills the promise buffer in arrival
    /// order and replay against the eventual target.
    pub fn promise() -> (Client, Resolver) {
        let core = Arc::new(PromiseCore::new_buffering());
        (Client::from_promise(core.clone()), Resolver { core })
    }

    pub(crate) fn from_promise(core: Arc<PromiseCore>) -> Client {
        Client::from_inner(Arc::new(ClientInner::Promise(core)))
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Client {
        Client { inner }
    }

    /// Invoke a method. Returns immediately with an [`Answer`] usable both
    /// for awaiting the response and for pipelining further calls.
    pub fn call(&self, interface_id: u64, method_id: u16, params: Params) -> Answer {
        let cell = Arc::new(ResponseCell::new());
        let qc = QueuedCall {
            interface_id,
            method_id,
            params,
            sink: ResponseSink::Cell(cell.clone()),
        };
        let started = self.start_call(qc);
        Answer {
            cell,
            question: started.question,
            conn: started.conn,
        }
    }

    /// Wait until a promise capability settles, following intermediate
    /// promises all the way to a settled capability or an error.
    pub async fn when_resolved(&self) -> Result<(), Exception> {
        let mut cur = self.clone();
        loop {
            let core = match &*cur.inner {
                ClientInner::Promise(core) => core.clone(),
                ClientInner::Broken(e) => return Err(e.clone()),
                _ => return Ok(()),
            };
            match core.peek() {
                PromisePeek::Resolved(next) => cur = next,
                PromisePeek::Broken(e) => return Err(e),
                PromisePeek::Unsettled(_) => {
                    let (tx, rx) = oneshot::channel();
                    core.on_settle(Box::new(move |result| {
                        let _ = tx.send(result.clone());
                    }));
                    match rx.await {
                        Ok(Ok(next)) => cur = next,
                        Ok(Err(e)) => return Err(e),
                        Err(_) => return Err(Exception::disconnected("promise abandoned")),
                    }
                }
            }
        }
    }

    pub(crate) fn start_call(&self, qc: QueuedCall) -> CallStarted {
        match &*self.inner {
            ClientInner::Local(l) => {
                l.push(Delivery::Call(qc));
                CallStarted::local()
            }
            ClientInner::Remote(r) => r.start_call(qc),
            ClientInner::Promise(core) => core.start_call(qc),
            ClientInner::Broken(e) => {
                qc.sink.complete(Err(e.clone()));
                CallStarted::local()
            }
        }
    }

    pub(crate) fn deliver(&self, delivery: Delivery) {
        match &*self.inner {
            ClientInner::Local(l) => l.push(delivery),
            ClientInner::Remote(r) => r.deliver(delivery),
            ClientInner::Promise(core) => core.deliver(delivery),
            ClientInner::Broken(e) => fail_delivery(delivery, e.clone()),
        }
    }

    /// Chase resolved promises to the innermost known client.
    pub(crate) fn settled(&self) -> Client {
        let mut cur = self.clone();
        loop {
            let next = match &*cur.inner {
                ClientInner::Promise(core) => match core.peek() {
                    PromisePeek::Resolved(c) => c,
                    _ => return cur,
                },
                _ => return cur,
            };
            cur = next;
        }
    }

    /// Identity key for export deduplication: repeated exports of one
    /// capability bump the refcount of one table entry.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Where this capability lives relative to `conn`, if it points back at
    /// that connection's peer.
    pub(crate) fn peer_path(&self, conn: &ConnTx) -> Option<PeerPath> {
        match &*self.inner {
            ClientInner::Remote(r) if r.conn().same(conn) => Some(PeerPath::Import(r.id())),
            ClientInner::Promise(core) => match core.peek() {
                PromisePeek::Unsettled(Some(ForwardTarget::Import(r))) if r.conn().same(conn) => {
                    Some(PeerPath::Import(r.id()))
                }
                PromisePeek::Unsettled(Some(ForwardTarget::Pipeline {
                    conn: c,
                    question,
                    transform,
                })) if c.same(conn) => Some(PeerPath::Answer {
                    question,
                    transform,
                }),
                _ => None,
            },
            _ => None,
        }
    }

    /// True for a promise that has not settled yet.
    pub(crate) fn is_unsettled_promise(&self) -> bool {
        match &*self.inner {
            ClientInner::Promise(core) => matches!(core.peek(), PromisePeek::Unsettled(_)),
            _ => false,
        }
    }

    /// The exception of a permanently failed capability, if it is one.
    pub(crate) fn broken_exception(&self) -> Option<Exception> {
        match &*self.inner {
            ClientInner::Broken(e) => Some(e.clone()),
            ClientInner::Promise(core) => match core.peek() {
                PromisePeek::Broken(e) => Some(e),
                _ => None,
            },
            _ => None,
        }
    }

    pub(crate) fn promise_core(&self) -> Option<Arc<PromiseCore>> {
        match &*self.inner {
            ClientInner::Promise(core) => Some(core.clone()),
            _ => None,
        }
    }
}

/// Settles a promise created with [`Client::promise`].
pub struct Resolver {
    core: Arc<PromiseCore>,
}

impl Resolver {
    /// Point the promise at its final target, replaying buffered calls in
    /// order.
    pub fn fulfill(self, client: Client) {
        self.core.resolve(client);
    }

    /// Fail the promise; buffered and future calls complete with `err`.
    pub fn reject(self, err: Exception) {
        self.core.reject(err);
    }
}

// ============================================================================
// Outstanding answers
// ============================================================================

/// Handle to one submitted call.
pub struct Answer {
    cell: Arc<ResponseCell>,
    question: Option<Arc<QuestionRef>>,
    conn: Option<ConnTx>,
}

impl Answer {
    /// Await the final response.
    pub async fn response(&self) -> Resolution {
        match self.cell.wait().await {
            Some(r) => r,
            None => Err(Exception::disconnected("connection closed")),
        }
    }

    /// A capability inside the eventual results, usable as a call target
    /// right away. While the answer is outstanding on a connection, calls on
    /// it are pipelined on the wire.
    pub fn pipeline(&self, transform: Vec<PipelineOp>) -> Client {
        match (&self.question, &self.conn) {
            (Some(question), Some(conn)) => pipeline_client(
                conn.clone(),
                question.clone(),
                self.cell.clone(),
                transform,
            ),
            _ => local_pipeline_client(self.cell.clone(), transform),
        }
    }
}

// ============================================================================
// Local delivery worker
// ============================================================================

pub(crate) struct LocalClient {
    jobs: mpsc::UnboundedSender<Delivery>,
}

impl LocalClient {
    pub(crate) fn push(&self, delivery: Delivery) {
        if let Err(mpsc::error::SendError(delivery)) = self.jobs.send(delivery) {
            fail_delivery(delivery, Exception::failed("local capability worker is gone"));
        }
    }
}

/// Serial delivery loop for one locally hosted capability.
///
/// Each call runs to completion before the next starts, unless the handler
/// calls [`IncomingCall::ack`], which releases its ordering slot early and
/// detaches the rest of the handler. The server value is dropped when the
/// last client handle goes away, which is how server types observe shutdown.
fn spawn_local_worker(server: Arc<dyn Server>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            match delivery {
                Delivery::Call(qc) => {
                    let QueuedCall {
                        interface_id,
                        method_id,
                        params,
                        sink,
                    } = qc;
                    let (ack_tx, mut ack_rx) = oneshot::channel();
                    let call = IncomingCall {
                        interface_id,
                        method_id,
                        params,
                        acker: Acker(Some(ack_tx)),
                    };
                    let mut fut = server.dispatch(call);
                    tokio::select! {
                        result = &mut fut => {
                            sink.complete(result.map(Arc::new));
                        }
                        ack = &mut ack_rx => {
                            if ack.is_ok() {
                                // Handler gave up its ordering slot; let it
                                // finish concurrently with later calls.
                                tokio::spawn(async move {
                                    let result = fut.await;
                                    sink.complete(result.map(Arc::new));
                                });
                            } else {
                                // Acker dropped without acking; keep the
                                // serial discipline.
                                let result = fut.await;
                                sink.complete(result.map(Arc::new));
                            }
                        }
                    }
                }
                Delivery::Echo { conn, .. } => {
                    warn!("disembargo echo reached a locally hosted capability");
                    let _ = conn.send(ConnTask::ProtocolError {
                        context: "disembargo must target a capability hosted by its sender"
                            .into(),
                    });
                }
            }
        }
    });
}

// ============================================================================
// Imported capabilities
// ============================================================================

/// Shared handle to one import-table entry.
///
/// `wire_refs` accumulates how many times the peer has named this id on the
/// wire toward us. The last local drop sends a single `Release` carrying the
/// accumulated count, which lets the peer free the matching export.
pub(crate) struct ImportShared {
    conn: ConnTx,
    id: ImportId,
    wire_refs: AtomicU32,
}

impl ImportShared {
    pub(crate) fn new(conn: ConnTx, id: ImportId) -> Self {
        Self {
            conn,
            id,
            wire_refs: AtomicU32::new(1),
        }
    }

    pub(crate) fn add_wire_ref(&self) {
        self.wire_refs.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ImportShared {
    fn drop(&mut self) {
        let count = self.wire_refs.load(Ordering::Relaxed);
        let _ = self.conn.send(ConnTask::ReleaseImport {
            id: self.id,
            count,
        });
    }
}

/// A settled imported capability.
#[derive(Clone)]
pub(crate) struct ImportRef {
    shared: Arc<ImportShared>,
}

impl ImportRef {
    pub(crate) fn new(shared: Arc<ImportShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn conn(&self) -> &ConnTx {
        &self.shared.conn
    }

    pub(crate) fn id(&self) -> ImportId {
        self.shared.id
    }

    pub(crate) fn start_call(&self, qc: QueuedCall) -> CallStarted {
        ForwardTarget::Import(self.clone()).start_call(qc)
    }

    pub(crate) fn deliver(&self, delivery: Delivery) {
        ForwardTarget::Import(self.clone()).deliver(delivery);
    }
}
