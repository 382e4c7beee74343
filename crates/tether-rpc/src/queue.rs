//! Call buffering against unresolved targets.
//!
//! A promise capability owns a [`PromiseCore`]: calls made before the promise
//! settles are buffered in arrival order and replayed, still in order, once
//! the target is known. Buffering is also how embargoes hold back direct
//! calls through a freshly shortened path until the matching disembargo echo
//! arrives.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use tether_wire::{AnswerId, EmbargoId, Exception, PipelineOp};

use crate::cap::{Client, ImportRef, Params, Results};
use crate::driver::{ConnTask, ConnTx, EchoTarget, QuestionRef, TaskTarget};

// ============================================================================
// Resolution cells
// ============================================================================

/// A write-once cell that any number of tasks can await.
pub(crate) struct ResolutionCell<T: Clone> {
    inner: Mutex<CellInner<T>>,
}

struct CellInner<T> {
    value: Option<T>,
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T: Clone> ResolutionCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CellInner {
                value: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Set the value. The first resolution wins; later ones are ignored.
    pub fn resolve(&self, value: T) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.value.is_some() {
                return;
            }
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.waiters)
        };
        for w in waiters {
            let _ = w.send(value.clone());
        }
    }

    pub fn peek(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    /// Wait for the value. Returns `None` only if the cell is dropped
    /// unresolved, which the connection teardown path prevents.
    pub async fn wait(&self) -> Option<T> {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(v) = &inner.value {
                return Some(v.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        rx.await.ok()
    }
}

/// Final outcome of one call.
pub(crate) type Resolution = Result<Arc<Results>, Exception>;

/// Cell delivering a call's outcome to whoever is waiting on it.
pub(crate) type ResponseCell = ResolutionCell<Resolution>;

// ============================================================================
// Deliveries
// ============================================================================

/// Where a call's outcome goes.
pub(crate) enum ResponseSink {
    /// A local caller awaiting the response.
    Cell(Arc<ResponseCell>),
    /// An inbound call: the outcome becomes a `Return` to the peer.
    Relay { conn: ConnTx, answer_id: AnswerId },
}

impl ResponseSink {
    pub fn complete(self, result: Resolution) {
        match self {
            ResponseSink::Cell(cell) => cell.resolve(result),
            ResponseSink::Relay { conn, answer_id } => {
                let _ = conn.send(ConnTask::ReturnToPeer { answer_id, result });
            }
        }
    }
}

/// One buffered method invocation.
pub(crate) struct QueuedCall {
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Params,
    pub sink: ResponseSink,
}

/// A unit of work traveling a capability's delivery path.
///
/// Echo jobs ride the same path as calls so that a disembargo echo reaches
/// the wire only after every call queued ahead of it.
pub(crate) enum Delivery {
    Call(QueuedCall),
    Echo { conn: ConnTx, embargo_id: EmbargoId },
}

/// Complete a delivery that can no longer reach a capability.
pub(crate) fn fail_delivery(delivery: Delivery, err: Exception) {
    match delivery {
        Delivery::Call(qc) => qc.sink.complete(Err(err)),
        Delivery::Echo { conn, .. } => {
            let _ = conn.send(ConnTask::ProtocolError {
                context: format!("disembargo echo reached a dead capability path: {err}"),
            });
        }
    }
}

// ============================================================================
// Promise cores
// ============================================================================

/// Result of submitting a call through a client.
///
/// `question` is set when the call went straight out on a connection, in
/// which case pipelined calls can target its eventual answer on the wire.
pub(crate) struct CallStarted {
    pub question: Option<Arc<QuestionRef>>,
    pub conn: Option<ConnTx>,
}

impl CallStarted {
    pub fn local() -> Self {
        Self {
            question: None,
            conn: None,
        }
    }
}

/// Where an unresolved promise currently forwards calls, if anywhere.
pub(crate) enum ForwardTarget {
    /// A promise the peer owns: calls go out targeting the import.
    Import(ImportRef),
    /// A capability inside one of our own pending questions: calls go out
    /// targeting the promised answer.
    Pipeline {
        conn: ConnTx,
        question: Arc<QuestionRef>,
        transform: Vec<PipelineOp>,
    },
}

impl Clone for ForwardTarget {
    fn clone(&self) -> Self {
        match self {
            ForwardTarget::Import(r) => ForwardTarget::Import(r.clone()),
            ForwardTarget::Pipeline {
                conn,
                question,
                transform,
            } => ForwardTarget::Pipeline {
                conn: conn.clone(),
                question: question.clone(),
                transform: transform.clone(),
            },
        }
    }
}

impl ForwardTarget {
    pub fn conn(&self) -> &ConnTx {
        match self {
            ForwardTarget::Import(r) => r.conn(),
            ForwardTarget::Pipeline { conn, .. } => conn,
        }
    }

    /// Push a delivery toward the remote target.
    pub fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Call(qc) => {
                let task = ConnTask::Call {
                    question: None,
                    target: self.task_target(),
                    call: qc,
                };
                if let Err(task) = self.conn().send(task) {
                    if let ConnTask::Call { call, .. } = task {
                        call.sink
                            .complete(Err(Exception::disconnected("connection closed")));
                    }
                }
            }
            Delivery::Echo { embargo_id, .. } => {
                let _ = self.conn().send(ConnTask::DisembargoEcho {
                    embargo_id,
                    target: self.echo_target(),
                });
            }
        }
    }

    fn task_target(&self) -> TaskTarget {
        match self {
            ForwardTarget::Import(r) => TaskTarget::Import(r.clone()),
            ForwardTarget::Pipeline {
                question,
                transform,
                ..
            } => TaskTarget::Pipeline {
                question: question.clone(),
                transform: transform.clone(),
            },
        }
    }

    fn echo_target(&self) -> EchoTarget {
        match self {
            ForwardTarget::Import(r) => EchoTarget::Import(r.id()),
            ForwardTarget::Pipeline {
                question,
                transform,
                ..
            } => EchoTarget::Answer {
                question: question.clone(),
                transform: transform.clone(),
            },
        }
    }

    /// Submit a user call, creating a question for pipelining.
    pub fn start_call(&self, qc: QueuedCall) -> CallStarted {
        let conn = self.conn().clone();
        let question = Arc::new(QuestionRef::new(conn.clone()));
        let task = ConnTask::Call {
            question: Some(question.clone()),
            target: self.task_target(),
            call: qc,
        };
        if let Err(task) = conn.send(task) {
            if let ConnTask::Call { call, .. } = task {
                call.sink
                    .complete(Err(Exception::disconnected("connection closed")));
            }
            return CallStarted::local();
        }
        CallStarted {
            question: Some(question),
            conn: Some(conn),
        }
    }
}

enum PromiseTarget {
    /// No target yet (or embargoed): deliveries wait here in arrival order.
    Buffering(Vec<Delivery>),
    /// Calls are forwarded to the peer while the promise is unresolved.
    Forwarding(ForwardTarget),
    Resolved(Client),
    Broken(Exception),
}

/// Snapshot of a promise's state.
pub(crate) enum PromisePeek {
    Unsettled(Option<ForwardTarget>),
    Resolved(Client),
    Broken(Exception),
}

type SettleFn = Box<dyn FnOnce(&Result<Client, Exception>) + Send>;

struct PromiseInner {
    target: PromiseTarget,
    watchers: Vec<SettleFn>,
    has_forwarded: bool,
}

/// Shared state of one promise capability.
pub(crate) struct PromiseCore {
    state: Mutex<PromiseInner>,
}

impl PromiseCore {
    pub fn new_buffering() -> Self {
        Self::with_target(PromiseTarget::Buffering(Vec::new()))
    }

    pub fn new_forwarding(target: ForwardTarget) -> Self {
        Self::with_target(PromiseTarget::Forwarding(target))
    }

    fn with_target(target: PromiseTarget) -> Self {
        Self {
            state: Mutex::new(PromiseInner {
                target,
                watchers: Vec::new(),
                has_forwarded: false,
            }),
        }
    }

    pub fn peek(&self) -> PromisePeek {
        match &self.state.lock().target {
            PromiseTarget::Buffering(_) => PromisePeek::Unsettled(None),
            PromiseTarget::Forwarding(t) => PromisePeek::Unsettled(Some(t.clone())),
            PromiseTarget::Resolved(c) => PromisePeek::Resolved(c.clone()),
            PromiseTarget::Broken(e) => PromisePeek::Broken(e.clone()),
        }
    }

    pub fn has_forwarded(&self) -> bool {
        self.state.lock().has_forwarded
    }

    /// Route a delivery through the promise.
    pub fn deliver(&self, delivery: Delivery) {
        let mut st = self.state.lock();
        let inner = &mut *st;
        match &mut inner.target {
            PromiseTarget::Buffering(queue) => queue.push(delivery),
            PromiseTarget::Forwarding(t) => {
                inner.has_forwarded = true;
                t.deliver(delivery);
            }
            PromiseTarget::Resolved(c) => {
                let c = c.clone();
                drop(st);
                c.deliver(delivery);
            }
            PromiseTarget::Broken(e) => {
                let e = e.clone();
                drop(st);
                fail_delivery(delivery, e);
            }
        }
    }

    /// Submit a user call through the promise.
    pub fn start_call(&self, qc: QueuedCall) -> CallStarted {
        let mut st = self.state.lock();
        let inner = &mut *st;
        match &mut inner.target {
            PromiseTarget::Buffering(queue) => {
                queue.push(Delivery::Call(qc));
                CallStarted::local()
            }
            PromiseTarget::Forwarding(t) => {
                inner.has_forwarded = true;
                let t = t.clone();
                drop(st);
                t.start_call(qc)
            }
            PromiseTarget::Resolved(c) => {
                let c = c.clone();
                drop(st);
                c.start_call(qc)
            }
            PromiseTarget::Broken(e) => {
                qc.sink.complete(Err(e.clone()));
                CallStarted::local()
            }
        }
    }

    /// Settle the promise on a target and replay buffered deliveries.
    ///
    /// Buffered deliveries are forwarded while the state lock is held, so a
    /// concurrent caller that observes `Resolved` cannot get ahead of them.
    pub fn resolve(&self, target: Client) {
        let watchers = {
            let mut st = self.state.lock();
            let queued = match &mut st.target {
                PromiseTarget::Buffering(queue) => std::mem::take(queue),
                PromiseTarget::Forwarding(_) => Vec::new(),
                // Already settled; a promise settles exactly once.
                PromiseTarget::Resolved(_) | PromiseTarget::Broken(_) => return,
            };
            st.target = PromiseTarget::Resolved(target.clone());
            for delivery in queued {
                target.deliver(delivery);
            }
            std::mem::take(&mut st.watchers)
        };
        let result: Result<Client, Exception> = Ok(target);
        for w in watchers {
            w(&result);
        }
    }

    /// Settle the promise with an error.
    pub fn reject(&self, err: Exception) {
        let (queued, watchers) = {
            let mut st = self.state.lock();
            let queued = match &mut st.target {
                PromiseTarget::Buffering(queue) => std::mem::take(queue),
                PromiseTarget::Forwarding(_) => Vec::new(),
                PromiseTarget::Resolved(_) | PromiseTarget::Broken(_) => return,
            };
            st.target = PromiseTarget::Broken(err.clone());
            (queued, std::mem::take(&mut st.watchers))
        };
        for delivery in queued {
            fail_delivery(delivery, err.clone());
        }
        let result: Result<Client, Exception> = Err(err);
        for w in watchers {
            w(&result);
        }
    }

    /// Stop forwarding and start buffering until a disembargo echo lifts the
    /// embargo. Returns the forward target that was in place, which the
    /// embargo holds alive until the echo arrives.
    pub fn set_embargoed(&self) -> Option<ForwardTarget> {
        let mut st = self.state.lock();
        match &mut st.target {
            PromiseTarget::Forwarding(t) => {
                let t = t.clone();
                st.target = PromiseTarget::Buffering(Vec::new());
                Some(t)
            }
            _ => None,
        }
    }

    /// Register a callback fired when the promise settles. Fires immediately
    /// if it already has.
    pub fn on_settle(&self, f: SettleFn) {
        let settled = {
            let mut st = self.state.lock();
            match &st.target {
                PromiseTarget::Resolved(c) => Some(Ok(c.clone())),
                PromiseTarget::Broken(e) => Some(Err(e.clone())),
                _ => {
                    st.watchers.push(f);
                    return;
                }
            }
        };
        if let Some(result) = settled {
            f(&result);
        }
    }
}

/// Create a promise client that settles when `cell` resolves, extracting the
/// capability at `transform`.
///
/// While the question is outstanding the client forwards calls on the wire as
/// promised-answer targets; settlement is routed through the driver so the
/// path-shortening and embargo rules in the resolver apply.
pub(crate) fn pipeline_client(
    conn: ConnTx,
    question: Arc<QuestionRef>,
    cell: Arc<ResponseCell>,
    transform: Vec<PipelineOp>,
) -> Client {
    let core = Arc::new(PromiseCore::new_forwarding(ForwardTarget::Pipeline {
        conn: conn.clone(),
        question: question.clone(),
        transform: transform.clone(),
    }));
    // The watcher holds only weak references: the client (through its
    // forward target) is what keeps the question alive, so dropping every
    // clone of the client still finishes the question.
    let weak_core = Arc::downgrade(&core);
    let weak_question = Arc::downgrade(&question);
    drop(question);
    tokio::spawn(async move {
        let result = match cell.wait().await {
            Some(r) => r,
            None => Err(Exception::disconnected("connection closed")),
        };
        let Some(core) = weak_core.upgrade() else {
            return;
        };
        let extracted = result.and_then(|res| res.cap_at(&transform));
        let question = match weak_question.upgrade() {
            Some(q) => q,
            None => {
                // Nothing pipelined is left in flight; settle in place.
                match extracted {
                    Ok(c) => core.resolve(c),
                    Err(e) => core.reject(e),
                }
                return;
            }
        };
        let task = ConnTask::PipelineSettled {
            core: core.clone(),
            question,
            transform,
            result: extracted.clone(),
        };
        if conn.send(task).is_err() {
            // Driver is gone; settle locally so the proxy keeps working
            // for targets that shortened into this vat.
            match extracted {
                Ok(c) => core.resolve(c),
                Err(e) => core.reject(e),
            }
        }
    });
    Client::from_promise(core)
}

/// Create a promise client for pipelining on a locally dispatched call.
///
/// There is no wire question to target, so calls buffer until the response
/// cell resolves.
pub(crate) fn local_pipeline_client(
    cell: Arc<ResponseCell>,
    transform: Vec<PipelineOp>,
) -> Client {
    let core = Arc::new(PromiseCore::new_buffering());
    let weak_core = Arc::downgrade(&core);
    tokio::spawn(async move {
        let result = match cell.wait().await {
            Some(r) => r,
            None => Err(Exception::disconnected("call abandoned")),
        };
        let Some(core) = weak_core.upgrade() else {
            return;
        };
        match result.and_then(|res| res.cap_at(&transform)) {
            Ok(c) => core.resolve(c),
            Err(e) => core.reject(e),
        }
    });
    Client::from_promise(core)
}

