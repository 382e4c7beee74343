//! The connection driver.
//!
//! One driver task owns all four tables (questions, answers, imports,
//! exports) and is the only code touching the transport. User-side
//! submissions and internally generated work arrive on a single FIFO task
//! channel; `tokio::select!` multiplexes it with the transport receive. The
//! single-writer discipline is what makes call ordering straightforward: a
//! task enqueued before another reaches the wire before it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use tether_wire::{
    AnswerId, CapDescriptor, DisembargoContext, EmbargoId, Exception, ExportId, ImportId, Message,
    MessageTarget, Payload, PipelineOp, PromisedAnswer, QuestionId, ResolveKind, ReturnKind,
    SendResultsTo,
};

use crate::cap::{Client, ClientInner, ImportRef, ImportShared, Params, Results};
use crate::errors::ConnectionError;
use crate::queue::{
    Delivery, ForwardTarget, PromiseCore, QueuedCall, Resolution, ResponseSink,
};
use crate::tables::SlotTable;
use crate::transport::MessageTransport;
use crate::MAX_PIPELINE_OPS;

// ============================================================================
// Task channel
// ============================================================================

/// Sender half of a connection's task channel.
///
/// The channel is unbounded so that drop handlers and the driver itself can
/// enqueue without blocking; connection-level backpressure comes from the
/// transport writes inside the driver loop.
#[derive(Clone)]
pub(crate) struct ConnTx {
    tx: mpsc::UnboundedSender<ConnTask>,
}

impl ConnTx {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ConnTask>) -> Self {
        Self { tx }
    }

    /// Enqueue a task, handing it back if the driver is gone.
    pub(crate) fn send(&self, task: ConnTask) -> Result<(), ConnTask> {
        self.tx.send(task).map_err(|e| e.0)
    }

    pub(crate) fn same(&self, other: &ConnTx) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Work for the driver.
pub(crate) enum ConnTask {
    /// Ask the peer for its bootstrap capability.
    Bootstrap {
        question: Arc<QuestionRef>,
        sink: ResponseSink,
    },
    /// Send an outgoing call.
    Call {
        /// Present when a caller holds the question for pipelining; absent
        /// for reflected calls the driver relays on its own.
        question: Option<Arc<QuestionRef>>,
        target: TaskTarget,
        call: QueuedCall,
    },
    /// The last user reference to a question dropped.
    FinishQuestion { qid: QuestionId },
    /// A locally dispatched inbound call completed.
    ReturnToPeer {
        answer_id: AnswerId,
        result: Resolution,
    },
    /// The last local handle to an import dropped; release the accumulated
    /// wire references.
    ReleaseImport { id: ImportId, count: u32 },
    /// A promise exported as `senderPromise` settled.
    PromiseSettled { export_id: ExportId },
    /// A pipelined capability's question answered; swing (or embargo) it.
    PipelineSettled {
        core: Arc<PromiseCore>,
        question: Arc<QuestionRef>,
        transform: Vec<PipelineOp>,
        result: Result<Client, Exception>,
    },
    /// A disembargo echo finished traveling a promise path.
    DisembargoEcho {
        embargo_id: EmbargoId,
        target: EchoTarget,
    },
    /// A delivery chain hit a state that only a broken peer produces.
    ProtocolError { context: String },
    /// User-initiated close.
    Close,
}

/// Wire target of an outgoing call, with ids resolved at send time.
pub(crate) enum TaskTarget {
    Import(ImportRef),
    Pipeline {
        question: Arc<QuestionRef>,
        transform: Vec<PipelineOp>,
    },
}

/// Wire target of a disembargo echo, with ids resolved at send time.
pub(crate) enum EchoTarget {
    Import(ImportId),
    Answer {
        question: Arc<QuestionRef>,
        transform: Vec<PipelineOp>,
    },
}

// ============================================================================
// Question references
// ============================================================================

/// Shared handle to one outstanding question.
///
/// The response future and every pipelined client hold one; when the last
/// clone drops, the question is finished. The id is assigned by the driver
/// when it processes the originating call task, which is always before any
/// task that could need it (the task channel is FIFO).
pub(crate) struct QuestionRef {
    conn: ConnTx,
    qid: OnceLock<QuestionId>,
}

impl QuestionRef {
    pub(crate) fn new(conn: ConnTx) -> Self {
        Self {
            conn,
            qid: OnceLock::new(),
        }
    }

    pub(crate) fn set_qid(&self, qid: QuestionId) {
        let _ = self.qid.set(qid);
    }

    pub(crate) fn qid(&self) -> Option<QuestionId> {
        self.qid.get().copied()
    }
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        // The driver ignores finishes for questions it already closed, so
        // this fires for user-held questions exactly once. A question whose
        // id was never assigned was never sent.
        if let Some(&qid) = self.qid.get() {
            let _ = self.conn.send(ConnTask::FinishQuestion { qid });
        }
    }
}

// ============================================================================
// Table entries
// ============================================================================

#[derive(PartialEq, Eq)]
enum QuestionState {
    InFlight,
    Returned,
}

struct QuestionEntry {
    state: QuestionState,
    sink: Option<ResponseSink>,
    param_exports: Vec<u32>,
    finish_sent: bool,
    /// Keeps the call target alive until the question is finished: an
    /// import's Release must not overtake the Finish of calls aimed at it,
    /// and a parent question must outlive its pipelined children.
    #[allow(dead_code)]
    target_hold: Option<TaskTarget>,
}

#[derive(Default)]
struct AnswerEntry {
    return_sent: bool,
    finish_received: bool,
    release_result_caps: bool,
    result: Option<Resolution>,
    result_exports: Vec<u32>,
    /// Promises handed to calls that targeted this answer before it
    /// returned, keyed by transform. Settled when the return goes out.
    pipeline_cores: Vec<(Vec<PipelineOp>, Arc<PromiseCore>)>,
}

struct ExportEntry {
    client: Client,
    refcount: u32,
    is_promise: bool,
    resolve_sent: bool,
    /// Identity key in `exports_by_cap`.
    key: usize,
}

struct ImportEntry {
    client: Weak<ClientInner>,
    shared: Weak<ImportShared>,
    /// Present for `senderPromise` imports; the core to swing on `Resolve`.
    core: Option<Weak<PromiseCore>>,
    resolved: bool,
}

struct EmbargoEntry {
    core: Arc<PromiseCore>,
    target: Client,
    /// The promise's previous forward path, held alive until the echo so the
    /// peer can still route the loopback disembargo through it.
    hold: Option<ForwardTarget>,
}

/// Why the driver loop stopped.
enum Stop {
    /// Peer closed the transport cleanly.
    Clean,
    /// User asked for the connection to close.
    LocalClose,
    PeerAbort(Exception),
    Protocol(String),
    Io(io::Error),
}

// ============================================================================
// Driver
// ============================================================================

/// The connection state machine. Must be spawned (or awaited) to drive the
/// connection; dropping it kills the connection.
pub struct Driver<T> {
    io: T,
    conn: ConnTx,
    tasks: mpsc::UnboundedReceiver<ConnTask>,
    bootstrap: Option<Client>,
    peer: String,
    abort_timeout: Duration,
    /// Messages generated in synchronous table code, flushed by the loop.
    outbox: Vec<Message>,

    questions: SlotTable<QuestionEntry>,
    answers: HashMap<u32, AnswerEntry>,
    exports: SlotTable<ExportEntry>,
    exports_by_cap: HashMap<usize, u32>,
    imports: HashMap<u32, ImportEntry>,
    embargoes: SlotTable<EmbargoEntry>,
}

impl<T: MessageTransport> Driver<T> {
    pub(crate) fn new(
        io: T,
        conn: ConnTx,
        tasks: mpsc::UnboundedReceiver<ConnTask>,
        bootstrap: Option<Client>,
        peer: String,
        abort_timeout: Duration,
    ) -> Self {
        Self {
            io,
            conn,
            tasks,
            bootstrap,
            peer,
            abort_timeout,
            outbox: Vec::new(),
            questions: SlotTable::new(),
            answers: HashMap::new(),
            exports: SlotTable::new(),
            exports_by_cap: HashMap::new(),
            imports: HashMap::new(),
            embargoes: SlotTable::new(),
        }
    }

    /// Run the connection until it closes.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let stop = self.serve().await;
        match stop {
            Stop::Clean => {
                debug!(peer = %self.peer, "peer closed the connection");
                self.teardown(Exception::disconnected("peer disconnected"))
                    .await;
                Ok(())
            }
            Stop::LocalClose => {
                self.send_abort(Exception::failed("connection closed")).await;
                self.teardown(Exception::disconnected("connection closed"))
                    .await;
                Ok(())
            }
            Stop::PeerAbort(e) => {
                warn!(peer = %self.peer, reason = %e, "peer aborted the connection");
                self.teardown(Exception::disconnected(format!(
                    "peer aborted: {}",
                    e.reason
                )))
                .await;
                Err(ConnectionError::Aborted(e))
            }
            Stop::Protocol(context) => {
                warn!(peer = %self.peer, %context, "aborting connection");
                self.send_abort(Exception::failed(context.clone())).await;
                self.teardown(Exception::disconnected(format!(
                    "connection aborted: {context}"
                )))
                .await;
                Err(ConnectionError::ProtocolViolation { context })
            }
            Stop::Io(e) => {
                warn!(peer = %self.peer, error = %e, "transport failed");
                self.teardown(Exception::disconnected("transport failed"))
                    .await;
                Err(ConnectionError::Io(e))
            }
        }
    }

    async fn serve(&mut self) -> Stop {
        loop {
            let step = tokio::select! {
                task = self.tasks.recv() => match task {
                    // The driver holds a ConnTx clone, so the channel cannot
                    // close under us.
                    Some(task) => self.handle_task(task).await,
                    None => Err(Stop::Clean),
                },
                msg = self.io.recv() => match msg {
                    Ok(Some(msg)) => self.handle_message(msg).await,
                    Ok(None) => Err(Stop::Clean),
                    // A message that fails to decode poisons the whole
                    // connection, but the transport itself still works, so
                    // the peer gets a proper abort.
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        Err(Stop::Protocol(format!("message decode error: {e}")))
                    }
                    Err(e) => Err(Stop::Io(e)),
                },
            };
            if let Err(stop) = step {
                return stop;
            }
            if let Err(stop) = self.flush_outbox().await {
                return stop;
            }
        }
    }

    async fn flush_outbox(&mut self) -> Result<(), Stop> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        for msg in std::mem::take(&mut self.outbox) {
            self.io.send(msg).await.map_err(Stop::Io)?;
        }
        Ok(())
    }

    // ========================================================================
    // Task handling (user-side and internal submissions)
    // ========================================================================

    async fn handle_task(&mut self, task: ConnTask) -> Result<(), Stop> {
        match task {
            ConnTask::Bootstrap { question, sink } => {
                let qid = self.questions.push(QuestionEntry {
                    state: QuestionState::InFlight,
                    sink: Some(sink),
                    param_exports: Vec::new(),
                    finish_sent: false,
                    target_hold: None,
                });
                let qid = QuestionId::new(qid);
                question.set_qid(qid);
                trace!(peer = %self.peer, %qid, "sending bootstrap");
                self.io
                    .send(Message::Bootstrap { question_id: qid })
                    .await
                    .map_err(Stop::Io)?;
            }
            ConnTask::Call {
                question,
                target,
                call,
            } => self.task_call(question, target, call).await?,
            ConnTask::FinishQuestion { qid } => self.task_finish_question(qid).await?,
            ConnTask::ReturnToPeer { answer_id, result } => {
                self.send_return_to_peer(answer_id, result).await?;
            }
            ConnTask::ReleaseImport { id, count } => {
                let remove = match self.imports.get(&id.raw()) {
                    Some(entry) => entry.shared.upgrade().is_none(),
                    None => false,
                };
                if remove {
                    self.imports.remove(&id.raw());
                }
                if count > 0 {
                    trace!(peer = %self.peer, %id, count, "releasing import");
                    self.io
                        .send(Message::Release {
                            id,
                            reference_count: count,
                        })
                        .await
                        .map_err(Stop::Io)?;
                }
            }
            ConnTask::PromiseSettled { export_id } => self.task_promise_settled(export_id).await?,
            ConnTask::PipelineSettled {
                core,
                question,
                transform,
                result,
            } => self.task_pipeline_settled(core, question, transform, result).await?,
            ConnTask::DisembargoEcho { embargo_id, target } => {
                let target = match target {
                    EchoTarget::Import(id) => MessageTarget::ImportedCap(id),
                    EchoTarget::Answer {
                        question,
                        transform,
                    } => match question.qid() {
                        Some(qid) => {
                            MessageTarget::PromisedAnswer(PromisedAnswer::new(qid, transform))
                        }
                        None => {
                            warn!(peer = %self.peer, "dropping disembargo echo for unsent question");
                            return Ok(());
                        }
                    },
                };
                self.io
                    .send(Message::Disembargo {
                        target,
                        context: DisembargoContext::ReceiverLoopback(embargo_id),
                    })
                    .await
                    .map_err(Stop::Io)?;
            }
            ConnTask::ProtocolError { context } => return Err(Stop::Protocol(context)),
            ConnTask::Close => return Err(Stop::LocalClose),
        }
        Ok(())
    }

    async fn task_call(
        &mut self,
        question: Option<Arc<QuestionRef>>,
        target: TaskTarget,
        call: QueuedCall,
    ) -> Result<(), Stop> {
        let wire_target = match &target {
            TaskTarget::Import(r) => MessageTarget::ImportedCap(r.id()),
            TaskTarget::Pipeline {
                question: source,
                transform,
            } => match source.qid() {
                Some(qid) => {
                    MessageTarget::PromisedAnswer(PromisedAnswer::new(qid, transform.clone()))
                }
                None => {
                    // The originating call task always precedes anything that
                    // can target its answer; hitting this means the question
                    // died before it was sent.
                    call.sink
                        .complete(Err(Exception::disconnected("call target was never sent")));
                    return Ok(());
                }
            },
        };

        let QueuedCall {
            interface_id,
            method_id,
            params,
            sink,
        } = call;
        let mut cap_table = Vec::with_capacity(params.caps.len());
        let mut param_exports = Vec::new();
        for cap in &params.caps {
            let (desc, export) = self.export_cap(cap);
            cap_table.push(desc);
            if let Some(id) = export {
                param_exports.push(id);
            }
        }

        let qid = self.questions.push(QuestionEntry {
            state: QuestionState::InFlight,
            sink: Some(sink),
            param_exports,
            finish_sent: false,
            target_hold: Some(target),
        });
        let qid = QuestionId::new(qid);
        if let Some(q) = &question {
            q.set_qid(qid);
        }
        trace!(peer = %self.peer, %qid, interface_id, method_id, "sending call");
        self.io
            .send(Message::Call {
                question_id: qid,
                target: wire_target,
                interface_id,
                method_id,
                params: Payload::new(params.content, cap_table),
                send_results_to: SendResultsTo::Caller,
            })
            .await
            .map_err(Stop::Io)?;
        Ok(())
    }

    async fn task_finish_question(&mut self, qid: QuestionId) -> Result<(), Stop> {
        let (erase, release_result_caps, sink) = match self.questions.find(qid.raw()) {
            // Already finished and erased (relay questions, double drops).
            None => return Ok(()),
            Some(entry) => {
                if entry.finish_sent {
                    return Ok(());
                }
                entry.finish_sent = true;
                match entry.state {
                    QuestionState::Returned => (true, false, None),
                    // Cancellation: no local proxies were built for the
                    // result caps, so ask the peer to drop them.
                    QuestionState::InFlight => (false, true, entry.sink.take()),
                }
            }
        };
        if erase {
            self.questions.erase(qid.raw());
        }
        if let Some(sink) = sink {
            sink.complete(Err(Exception::canceled("call canceled")));
        }
        trace!(peer = %self.peer, %qid, release_result_caps, "finishing question");
        self.io
            .send(Message::Finish {
                question_id: qid,
                release_result_caps,
            })
            .await
            .map_err(Stop::Io)?;
        Ok(())
    }

    async fn task_promise_settled(&mut self, export_id: ExportId) -> Result<(), Stop> {
        let client = match self.exports.find(export_id.raw()) {
            // Peer released (or unimplemented-dropped) the export before the
            // promise settled; it must never see a Resolve for it now.
            None => return Ok(()),
            Some(entry) => {
                if !entry.is_promise || entry.resolve_sent {
                    return Ok(());
                }
                // Guard against a reused id whose new occupant is a different,
                // still-pending promise.
                if entry.client.is_unsettled_promise() {
                    return Ok(());
                }
                entry.resolve_sent = true;
                entry.client.clone()
            }
        };
        let settled = client.settled();
        let kind = match settled.broken_exception() {
            Some(e) => ResolveKind::Exception(e),
            None => {
                let (desc, _) = self.export_cap(&settled);
                ResolveKind::Cap(desc)
            }
        };
        debug!(peer = %self.peer, promise = %export_id, "resolving sender promise");
        self.io
            .send(Message::Resolve {
                promise_id: export_id,
                kind,
            })
            .await
            .map_err(Stop::Io)?;
        Ok(())
    }

    async fn task_pipeline_settled(
        &mut self,
        core: Arc<PromiseCore>,
        question: Arc<QuestionRef>,
        transform: Vec<PipelineOp>,
        result: Result<Client, Exception>,
    ) -> Result<(), Stop> {
        match result {
            Err(e) => core.reject(e),
            Ok(target) => {
                let remote = target.settled().peer_path(&self.conn).is_some();
                if remote || !core.has_forwarded() {
                    // Either the capability stays on the peer (calls keep
                    // flowing the same way) or nothing was ever pipelined,
                    // so nothing can be overtaken.
                    core.resolve(target);
                } else {
                    // The answer shortened into this vat while pipelined
                    // calls are still in flight toward the peer; hold direct
                    // calls until the loopback round-trip drains them.
                    let qid = match question.qid() {
                        Some(qid) => qid,
                        None => {
                            core.resolve(target);
                            return Ok(());
                        }
                    };
                    let hold = core.set_embargoed();
                    let embargo_id = EmbargoId::new(self.embargoes.push(EmbargoEntry {
                        core,
                        target,
                        hold,
                    }));
                    debug!(peer = %self.peer, %qid, %embargo_id, "embargoing pipelined capability");
                    self.io
                        .send(Message::Disembargo {
                            target: MessageTarget::PromisedAnswer(PromisedAnswer::new(
                                qid, transform,
                            )),
                            context: DisembargoContext::SenderLoopback(embargo_id),
                        })
                        .await
                        .map_err(Stop::Io)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Inbound message handling
    // ========================================================================

    async fn handle_message(&mut self, msg: Message) -> Result<(), Stop> {
        trace!(peer = %self.peer, kind = msg.kind(), "received message");
        match msg {
            Message::Unimplemented { echoed } => self.handle_unimplemented(*echoed),
            Message::Abort(e) => Err(Stop::PeerAbort(e)),
            Message::Bootstrap { question_id } => self.handle_bootstrap(question_id).await,
            Message::Call { .. } => self.handle_call(msg).await,
            Message::Return {
                answer_id,
                release_param_caps,
                kind,
            } => self.handle_return(answer_id, release_param_caps, kind).await,
            Message::Finish {
                question_id,
                release_result_caps,
            } => self.handle_finish(question_id, release_result_caps),
            Message::Resolve { promise_id, kind } => {
                self.handle_resolve(promise_id, kind).await
            }
            Message::Release {
                id,
                reference_count,
            } => self.handle_release(id, reference_count),
            Message::Disembargo { target, context } => {
                self.handle_disembargo(target, context).await
            }
            Message::Unknown { ordinal } => {
                warn!(peer = %self.peer, ordinal, "unknown message kind");
                self.io
                    .send(Message::Unimplemented {
                        echoed: Box::new(Message::Unknown { ordinal }),
                    })
                    .await
                    .map_err(Stop::Io)
            }
        }
    }

    fn handle_unimplemented(&mut self, echoed: Message) -> Result<(), Stop> {
        match echoed {
            Message::Resolve { promise_id, kind } => {
                // The peer will not track this promise: give back the wire
                // reference the resolution carried and drop the export now,
                // without waiting for a Release that will never come.
                if let ResolveKind::Cap(
                    CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id),
                ) = kind
                {
                    self.drop_export_refs(id.raw(), 1);
                }
                if let Some(entry) = self.exports.erase(promise_id.raw()) {
                    debug!(peer = %self.peer, promise = %promise_id, "peer did not implement resolve; dropping export");
                    self.exports_by_cap.remove(&entry.key);
                }
                Ok(())
            }
            Message::Disembargo { .. } => Err(Stop::Protocol(
                "peer does not implement disembargo, which level 1 requires".into(),
            )),
            other => {
                warn!(peer = %self.peer, kind = other.kind(), "peer did not implement message");
                Ok(())
            }
        }
    }

    async fn handle_bootstrap(&mut self, question_id: QuestionId) -> Result<(), Stop> {
        let id = question_id.raw();
        if self.answers.contains_key(&id) {
            return Err(Stop::Protocol(format!(
                "duplicate question id {question_id} in bootstrap"
            )));
        }
        self.answers.insert(id, AnswerEntry::default());
        let result = match &self.bootstrap {
            Some(client) => Ok(Arc::new(Results::new(Vec::new(), vec![client.clone()]))),
            None => Err(Exception::failed("vat does not expose a bootstrap capability")),
        };
        self.send_return_to_peer(question_id, result).await
    }

    async fn handle_call(&mut self, msg: Message) -> Result<(), Stop> {
        let Message::Call {
            question_id,
            target,
            interface_id,
            method_id,
            params,
            send_results_to,
        } = msg
        else {
            return Ok(());
        };
        let id = question_id.raw();
        if self.answers.contains_key(&id) {
            return Err(Stop::Protocol(format!(
                "duplicate question id {question_id} in call"
            )));
        }
        self.answers.insert(id, AnswerEntry::default());

        if !matches!(send_results_to, SendResultsTo::Caller) {
            self.io
                .send(Message::Unimplemented {
                    echoed: Box::new(Message::Call {
                        question_id,
                        target,
                        interface_id,
                        method_id,
                        params,
                        send_results_to,
                    }),
                })
                .await
                .map_err(Stop::Io)?;
            return self
                .send_return_to_peer(
                    question_id,
                    Err(Exception::unimplemented(
                        "only sendResultsTo = caller is supported",
                    )),
                )
                .await;
        }

        let caps = self.import_cap_table(params.cap_table)?;
        let client = self.resolve_target(target)?;
        trace!(peer = %self.peer, answer = %question_id, interface_id, method_id, "dispatching incoming call");
        client.deliver(Delivery::Call(QueuedCall {
            interface_id,
            method_id,
            params: Params::new(params.content, caps),
            sink: ResponseSink::Relay {
                conn: self.conn.clone(),
                answer_id: question_id,
            },
        }));
        Ok(())
    }

    async fn handle_return(
        &mut self,
        answer_id: AnswerId,
        release_param_caps: bool,
        kind: ReturnKind,
    ) -> Result<(), Stop> {
        let qid = answer_id.raw();
        let (param_exports, finish_sent) = match self.questions.find(qid) {
            None => {
                return Err(Stop::Protocol(format!(
                    "return for unknown question {answer_id}"
                )))
            }
            Some(entry) => {
                if entry.state == QuestionState::Returned {
                    return Err(Stop::Protocol(format!(
                        "duplicate return for question {answer_id}"
                    )));
                }
                (std::mem::take(&mut entry.param_exports), entry.finish_sent)
            }
        };
        if release_param_caps {
            for id in param_exports {
                self.release_export(id, 1)?;
            }
        }

        if finish_sent {
            // We canceled with releaseResultCaps = true; the peer drops any
            // caps this return mentions, and we must not import them.
            self.questions.erase(qid);
            return Ok(());
        }

        let resolution: Resolution = match kind {
            ReturnKind::Results(payload) => {
                let caps = self.import_cap_table(payload.cap_table)?;
                Ok(Arc::new(Results::new(payload.content, caps)))
            }
            ReturnKind::Exception(e) => Err(e),
            other => {
                // Tail calls and third-party returns are beyond level 1.
                self.io
                    .send(Message::Unimplemented {
                        echoed: Box::new(Message::Return {
                            answer_id,
                            release_param_caps,
                            kind: other,
                        }),
                    })
                    .await
                    .map_err(Stop::Io)?;
                Err(Exception::unimplemented("unsupported return variant"))
            }
        };

        let sink = match self.questions.find(qid) {
            Some(entry) => {
                entry.state = QuestionState::Returned;
                entry.sink.take()
            }
            None => None,
        };
        match sink {
            Some(ResponseSink::Cell(cell)) => cell.resolve(resolution),
            Some(ResponseSink::Relay {
                answer_id: relay_to,
                ..
            }) => {
                // A reflected call came home: relay the return, then finish
                // the question ourselves since no user handle exists.
                self.send_return_to_peer(relay_to, resolution).await?;
                self.io
                    .send(Message::Finish {
                        question_id: answer_id,
                        release_result_caps: false,
                    })
                    .await
                    .map_err(Stop::Io)?;
                self.questions.erase(qid);
            }
            None => {}
        }
        Ok(())
    }

    fn handle_finish(
        &mut self,
        question_id: QuestionId,
        release_result_caps: bool,
    ) -> Result<(), Stop> {
        let id = question_id.raw();
        let return_sent = match self.answers.get_mut(&id) {
            None => {
                return Err(Stop::Protocol(format!(
                    "finish for unknown answer {question_id}"
                )))
            }
            Some(entry) => {
                if entry.finish_received {
                    return Err(Stop::Protocol(format!(
                        "duplicate finish for answer {question_id}"
                    )));
                }
                entry.finish_received = true;
                entry.release_result_caps = release_result_caps;
                entry.return_sent
            }
        };
        if return_sent {
            self.finalize_answer(id);
        }
        Ok(())
    }

    async fn handle_resolve(
        &mut self,
        promise_id: ImportId,
        kind: ResolveKind,
    ) -> Result<(), Stop> {
        let key = promise_id.raw();
        let core = match self.imports.get_mut(&key) {
            None => {
                // Import already released; give back the reference the
                // resolution carries.
                self.release_orphan_resolution(&kind);
                return Ok(());
            }
            Some(entry) => {
                if entry.core.is_none() {
                    return Err(Stop::Protocol(format!(
                        "resolve for non-promise import {promise_id}"
                    )));
                }
                if entry.resolved {
                    return Err(Stop::Protocol(format!(
                        "duplicate resolve for promise {promise_id}"
                    )));
                }
                entry.resolved = true;
                entry.core.as_ref().and_then(Weak::upgrade)
            }
        };
        let Some(core) = core else {
            // All local handles are gone; nothing to swing.
            self.release_orphan_resolution(&kind);
            return Ok(());
        };
        match kind {
            ResolveKind::Exception(e) => core.reject(e),
            ResolveKind::Cap(desc) => {
                let loopback = matches!(
                    desc,
                    CapDescriptor::ReceiverHosted(_) | CapDescriptor::ReceiverAnswer(_)
                );
                let target = self.import_descriptor(desc)?;
                if loopback {
                    // The promise shortened into this vat. Hold direct calls
                    // through the short path until the disembargo round-trip
                    // confirms the peer has flushed everything it queued.
                    let hold = core.set_embargoed();
                    let embargo_id = EmbargoId::new(self.embargoes.push(EmbargoEntry {
                        core,
                        target,
                        hold,
                    }));
                    debug!(peer = %self.peer, promise = %promise_id, %embargo_id, "promise resolved to this vat; embargoing");
                    self.io
                        .send(Message::Disembargo {
                            target: MessageTarget::ImportedCap(promise_id),
                            context: DisembargoContext::SenderLoopback(embargo_id),
                        })
                        .await
                        .map_err(Stop::Io)?;
                } else {
                    core.resolve(target);
                }
            }
        }
        Ok(())
    }

    fn handle_release(&mut self, id: ExportId, reference_count: u32) -> Result<(), Stop> {
        self.release_export(id.raw(), reference_count)
    }

    async fn handle_disembargo(
        &mut self,
        target: MessageTarget,
        context: DisembargoContext,
    ) -> Result<(), Stop> {
        match context {
            DisembargoContext::SenderLoopback(embargo_id) => {
                // Ride the same delivery path as calls so the echo reaches
                // the wire only after everything queued ahead of it.
                let client = self.resolve_target(target)?;
                client.deliver(Delivery::Echo {
                    conn: self.conn.clone(),
                    embargo_id,
                });
                Ok(())
            }
            DisembargoContext::ReceiverLoopback(embargo_id) => {
                match self.embargoes.erase(embargo_id.raw()) {
                    None => Err(Stop::Protocol(format!(
                        "disembargo echo for unknown embargo {embargo_id}"
                    ))),
                    Some(entry) => {
                        debug!(peer = %self.peer, %embargo_id, "embargo lifted");
                        entry.core.resolve(entry.target);
                        // Dropping the hold releases the promise's old path.
                        drop(entry.hold);
                        Ok(())
                    }
                }
            }
            DisembargoContext::Accept | DisembargoContext::Provide(_) => {
                self.io
                    .send(Message::Unimplemented {
                        echoed: Box::new(Message::Disembargo { target, context }),
                    })
                    .await
                    .map_err(Stop::Io)
            }
        }
    }

    // ========================================================================
    // Returns and answers
    // ========================================================================

    async fn send_return_to_peer(
        &mut self,
        answer_id: AnswerId,
        result: Resolution,
    ) -> Result<(), Stop> {
        let id = answer_id.raw();
        let pipelines = match self.answers.get_mut(&id) {
            // Torn down or already answered; nothing to do.
            None => return Ok(()),
            Some(entry) => {
                if entry.return_sent {
                    return Ok(());
                }
                entry.return_sent = true;
                std::mem::take(&mut entry.pipeline_cores)
            }
        };

        let (kind, result_exports) = match &result {
            Ok(results) => {
                let mut cap_table = Vec::with_capacity(results.caps.len());
                let mut exports = Vec::new();
                for cap in &results.caps {
                    let (desc, export) = self.export_cap(cap);
                    cap_table.push(desc);
                    if let Some(id) = export {
                        exports.push(id);
                    }
                }
                (
                    ReturnKind::Results(Payload::new(results.content.clone(), cap_table)),
                    exports,
                )
            }
            Err(e) => (ReturnKind::Exception(e.clone()), Vec::new()),
        };

        let finish_received = match self.answers.get_mut(&id) {
            None => return Ok(()),
            Some(entry) => {
                entry.result = Some(result.clone());
                entry.result_exports = result_exports;
                entry.finish_received
            }
        };

        trace!(peer = %self.peer, answer = %answer_id, "sending return");
        self.io
            .send(Message::Return {
                answer_id,
                release_param_caps: false,
                kind,
            })
            .await
            .map_err(Stop::Io)?;

        // Settle promises handed out for pipelined calls on this answer.
        for (transform, core) in pipelines {
            match &result {
                Ok(results) => match results.cap_at(&transform) {
                    Ok(cap) => core.resolve(cap),
                    Err(e) => core.reject(e),
                },
                Err(e) => core.reject(e.clone()),
            }
        }

        if finish_received {
            self.finalize_answer(id);
        }
        Ok(())
    }

    fn finalize_answer(&mut self, id: u32) {
        if let Some(entry) = self.answers.remove(&id) {
            if entry.release_result_caps {
                for export in entry.result_exports {
                    self.drop_export_refs(export, 1);
                }
            }
        }
    }

    // ========================================================================
    // Capability translation
    // ========================================================================

    /// Translate an inbound capability table into clients.
    fn import_cap_table(&mut self, cap_table: Vec<CapDescriptor>) -> Result<Vec<Client>, Stop> {
        cap_table
            .into_iter()
            .map(|desc| self.import_descriptor(desc))
            .collect()
    }

    fn import_descriptor(&mut self, desc: CapDescriptor) -> Result<Client, Stop> {
        match desc {
            CapDescriptor::None => Ok(Client::null()),
            CapDescriptor::SenderHosted(id) => Ok(self.import_cap(id, false)),
            CapDescriptor::SenderPromise(id) => Ok(self.import_cap(id, true)),
            CapDescriptor::ReceiverHosted(id) => match self.exports.find(id.raw()) {
                Some(entry) => Ok(entry.client.clone()),
                None => Err(Stop::Protocol(format!(
                    "receiverHosted descriptor names unknown export {id}"
                ))),
            },
            CapDescriptor::ReceiverAnswer(pa) => self.pipelined_answer_cap(pa),
            CapDescriptor::ThirdPartyHosted => Ok(Client::broken(Exception::unimplemented(
                "thirdPartyHosted capabilities require level 3",
            ))),
        }
    }

    fn import_cap(&mut self, id: ImportId, is_promise: bool) -> Client {
        let key = id.raw();
        if let Some(entry) = self.imports.get(&key) {
            if let (Some(inner), Some(shared)) = (entry.client.upgrade(), entry.shared.upgrade()) {
                shared.add_wire_ref();
                return Client::from_inner(inner);
            }
            if let Some(inner) = entry.client.upgrade() {
                // A promise import that already resolved and released its
                // wire path: reuse what it became and immediately hand the
                // fresh reference back.
                self.outbox.push(Message::Release {
                    id,
                    reference_count: 1,
                });
                return Client::from_inner(inner);
            }
            self.imports.remove(&key);
        }

        let shared = Arc::new(ImportShared::new(self.conn.clone(), id));
        let shared_weak = Arc::downgrade(&shared);
        let (inner, core) = if is_promise {
            let core = Arc::new(PromiseCore::new_forwarding(ForwardTarget::Import(
                ImportRef::new(shared),
            )));
            let weak = Arc::downgrade(&core);
            (Arc::new(ClientInner::Promise(core)), Some(weak))
        } else {
            (
                Arc::new(ClientInner::Remote(ImportRef::new(shared))),
                None,
            )
        };
        self.imports.insert(
            key,
            ImportEntry {
                client: Arc::downgrade(&inner),
                shared: shared_weak,
                core,
                resolved: false,
            },
        );
        Client::from_inner(inner)
    }

    /// Resolve a call (or disembargo) target against the tables.
    fn resolve_target(&mut self, target: MessageTarget) -> Result<Client, Stop> {
        match target {
            MessageTarget::ImportedCap(id) => match self.exports.find(id.raw()) {
                Some(entry) => Ok(entry.client.clone()),
                None => Err(Stop::Protocol(format!(
                    "message target names unknown export {id}"
                ))),
            },
            MessageTarget::PromisedAnswer(pa) => self.pipelined_answer_cap(pa),
        }
    }

    /// A capability inside one of our answers, by transform. Pending answers
    /// hand out a promise that settles when the return goes out.
    fn pipelined_answer_cap(&mut self, pa: PromisedAnswer) -> Result<Client, Stop> {
        if pa.transform.len() > MAX_PIPELINE_OPS {
            return Err(Stop::Protocol(format!(
                "pipeline transform exceeds {MAX_PIPELINE_OPS} operations"
            )));
        }
        let entry = match self.answers.get_mut(&pa.question_id.raw()) {
            Some(entry) => entry,
            None => {
                return Err(Stop::Protocol(format!(
                    "promisedAnswer names unknown answer {}",
                    pa.question_id
                )))
            }
        };
        if entry.finish_received {
            return Err(Stop::Protocol(format!(
                "promisedAnswer names finished answer {}",
                pa.question_id
            )));
        }
        match &entry.result {
            Some(Ok(results)) => {
                Ok(results.cap_at(&pa.transform).unwrap_or_else(Client::broken))
            }
            Some(Err(e)) => Ok(Client::broken(e.clone())),
            None => {
                if let Some((_, core)) = entry
                    .pipeline_cores
                    .iter()
                    .find(|(t, _)| *t == pa.transform)
                {
                    return Ok(Client::from_promise(core.clone()));
                }
                let core = Arc::new(PromiseCore::new_buffering());
                entry
                    .pipeline_cores
                    .push((pa.transform, core.clone()));
                Ok(Client::from_promise(core))
            }
        }
    }

    /// Build the descriptor naming `client` toward the peer, exporting it if
    /// it is not already reachable through the peer's own tables. Returns the
    /// export id this mention counted against, if any.
    fn export_cap(&mut self, client: &Client) -> (CapDescriptor, Option<u32>) {
        let settled = client.settled();

        // Capabilities that point back at the peer need no table entry.
        match settled.peer_path(&self.conn) {
            Some(crate::cap::PeerPath::Import(id)) => {
                return (CapDescriptor::ReceiverHosted(id), None)
            }
            Some(crate::cap::PeerPath::Answer {
                question,
                transform,
            }) => {
                if let Some(qid) = question.qid() {
                    return (
                        CapDescriptor::ReceiverAnswer(PromisedAnswer::new(qid, transform)),
                        None,
                    );
                }
                // Question not sent yet; fall through and export a promise.
            }
            None => {}
        }

        let key = settled.identity();
        if let Some(&id) = self.exports_by_cap.get(&key) {
            if let Some(entry) = self.exports.find(id) {
                entry.refcount += 1;
                let desc = if entry.is_promise && !entry.resolve_sent {
                    CapDescriptor::SenderPromise(ExportId::new(id))
                } else {
                    CapDescriptor::SenderHosted(ExportId::new(id))
                };
                return (desc, Some(id));
            }
        }

        let is_promise = settled.is_unsettled_promise();
        let id = self.exports.push(ExportEntry {
            client: settled.clone(),
            refcount: 1,
            is_promise,
            resolve_sent: false,
            key,
        });
        self.exports_by_cap.insert(key, id);
        if is_promise {
            // Arrange for a Resolve once the promise settles. The callback
            // fires after buffered calls have been replayed, so the resolve
            // never overtakes them on the wire.
            if let Some(core) = settled.promise_core() {
                let conn = self.conn.clone();
                let export_id = ExportId::new(id);
                core.on_settle(Box::new(move |_| {
                    let _ = conn.send(ConnTask::PromiseSettled { export_id });
                }));
            }
            (CapDescriptor::SenderPromise(ExportId::new(id)), Some(id))
        } else {
            (CapDescriptor::SenderHosted(ExportId::new(id)), Some(id))
        }
    }

    /// Strict release driven by the peer; bad counts kill the connection.
    fn release_export(&mut self, id: u32, count: u32) -> Result<(), Stop> {
        let entry = match self.exports.find(id) {
            Some(entry) => entry,
            None => {
                return Err(Stop::Protocol(format!(
                    "release for unknown export {}",
                    ExportId::new(id)
                )))
            }
        };
        if count > entry.refcount {
            return Err(Stop::Protocol(format!(
                "release count {count} exceeds refcount {} of export {}",
                entry.refcount,
                ExportId::new(id)
            )));
        }
        entry.refcount -= count;
        if entry.refcount == 0 {
            let key = entry.key;
            self.exports.erase(id);
            self.exports_by_cap.remove(&key);
        }
        Ok(())
    }

    /// Internal release that tolerates an export already dropped by other
    /// means (for example an unimplemented resolve).
    fn drop_export_refs(&mut self, id: u32, count: u32) {
        if let Some(entry) = self.exports.find(id) {
            entry.refcount = entry.refcount.saturating_sub(count);
            if entry.refcount == 0 {
                let key = entry.key;
                self.exports.erase(id);
                self.exports_by_cap.remove(&key);
            }
        }
    }

    /// Give back the wire reference carried by a resolution we cannot use.
    fn release_orphan_resolution(&mut self, kind: &ResolveKind) {
        if let ResolveKind::Cap(
            CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id),
        ) = kind
        {
            self.outbox.push(Message::Release {
                id: *id,
                reference_count: 1,
            });
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    async fn send_abort(&mut self, reason: Exception) {
        let send = self.io.send(Message::Abort(reason));
        if tokio::time::timeout(self.abort_timeout, send).await.is_err() {
            debug!(peer = %self.peer, "abort emission timed out");
        }
    }

    /// Fail everything outstanding and drop all table state. After this,
    /// every proxy still held by the user reports `Disconnected`.
    async fn teardown(&mut self, reason: Exception) {
        debug!(
            peer = %self.peer,
            questions = self.questions.len(),
            answers = self.answers.len(),
            exports = self.exports.len(),
            imports = self.imports.len(),
            "tearing down connection"
        );
        self.tasks.close();
        while let Ok(task) = self.tasks.try_recv() {
            Self::discard_task(task, &reason);
        }
        for entry in self.questions.drain() {
            if let Some(sink) = entry.sink {
                sink.complete(Err(reason.clone()));
            }
        }
        for (_, entry) in self.answers.drain() {
            for (_, core) in entry.pipeline_cores {
                core.reject(reason.clone());
            }
        }
        for entry in self.embargoes.drain() {
            entry.core.reject(reason.clone());
        }
        // Unsettled imported promises can never resolve now; settled ones
        // (including paths shortened into this vat) are left untouched.
        for (_, entry) in self.imports.drain() {
            if let Some(core) = entry.core.as_ref().and_then(Weak::upgrade) {
                core.reject(reason.clone());
            }
        }
        self.exports.drain();
        self.exports_by_cap.clear();
        self.bootstrap = None;
        self.io.close().await;
    }

    fn discard_task(task: ConnTask, reason: &Exception) {
        match task {
            ConnTask::Bootstrap { sink, .. } => sink.complete(Err(reason.clone())),
            ConnTask::Call { call, .. } => call.sink.complete(Err(reason.clone())),
            ConnTask::PipelineSettled { core, result, .. } => {
                // Still settle local shortening so proxies that resolved into
                // this vat keep working after the connection dies.
                match result {
                    Ok(c) => core.resolve(c),
                    Err(e) => core.reject(e),
                }
            }
            ConnTask::ReturnToPeer { .. }
            | ConnTask::FinishQuestion { .. }
            | ConnTask::ReleaseImport { .. }
            | ConnTask::PromiseSettled { .. }
            | ConnTask::DisembargoEcho { .. }
            | ConnTask::ProtocolError { .. }
            | ConnTask::Close => {}
        }
    }
}
