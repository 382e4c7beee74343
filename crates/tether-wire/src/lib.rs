#![deny(unsafe_code)]

//! Wire-level types for the tether capability-RPC protocol.
//!
//! This crate defines the data model of the protocol: sparse 32-bit table
//! ids, capability descriptors, message targets, and the [`Message`] enum a
//! transport carries. Encoding these values to bytes is the job of an
//! external codec; the connection core only ever sees the typed form.

use std::fmt;

/// Identifies an outstanding call in the sender's question table.
///
/// The same number identifies the call in the receiver's answer table; see
/// [`AnswerId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct QuestionId(pub u32);

impl QuestionId {
    /// Create a new question ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for QuestionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q:{}", self.0)
    }
}

/// The receiver's name for a [`QuestionId`]: the same 32-bit value, read
/// against the answer table instead of the question table.
pub type AnswerId = QuestionId;

/// Identifies a capability in the sender's export table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ExportId(pub u32);

impl ExportId {
    /// Create a new export ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for ExportId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e:{}", self.0)
    }
}

/// The receiver's name for an [`ExportId`]: the same value, read against the
/// import table.
pub type ImportId = ExportId;

/// Identifies an outstanding embargo on the issuing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct EmbargoId(pub u32);

impl EmbargoId {
    /// Create a new embargo ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for EmbargoId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for EmbargoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "em:{}", self.0)
    }
}

/// Broad classification of an [`Exception`].
///
/// These map one-to-one onto the error kinds of the published RPC schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Ordinary method failure. The default kind.
    Failed,
    /// The callee is temporarily out of capacity; retrying later may work.
    Overloaded,
    /// The connection to a required vat is gone.
    Disconnected,
    /// The peer does not implement the message or level that was used.
    Unimplemented,
    /// The call was canceled before producing a result.
    Canceled,
}

/// An error traveling over the wire, or surfaced to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub kind: ErrorKind,
    pub reason: String,
}

impl Exception {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, reason)
    }

    pub fn overloaded(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, reason)
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, reason)
    }

    pub fn unimplemented(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, reason)
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, reason)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for Exception {}

/// One step of a pipeline transform.
///
/// Transforms address a capability inside a not-yet-consumed result. The
/// content of a result is opaque to the connection core, so a
/// `GetPointerField(n)` step addresses entry `n` of the result's capability
/// table; the external codec lays capability pointers out in field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOp {
    /// No-op step, skipped during resolution.
    Noop,
    /// Select the capability at the given pointer-field index.
    GetPointerField(u16),
}

/// A capability addressed inside a pending (or retained) answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromisedAnswer {
    /// The sender's question id (the receiver's answer id).
    pub question_id: QuestionId,
    /// Path from the answer's root to the capability.
    pub transform: Vec<PipelineOp>,
}

impl PromisedAnswer {
    pub fn new(question_id: QuestionId, transform: Vec<PipelineOp>) -> Self {
        Self {
            question_id,
            transform,
        }
    }
}

/// Describes one capability slot in a message's capability table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapDescriptor {
    /// A null capability.
    None,
    /// A settled capability in the sender's export table.
    SenderHosted(ExportId),
    /// A promise in the sender's export table; the sender will follow up
    /// with exactly one `Resolve` for it.
    SenderPromise(ExportId),
    /// A capability the receiver previously exported to the sender.
    ReceiverHosted(ImportId),
    /// A capability inside one of the receiver's pending answers.
    ReceiverAnswer(PromisedAnswer),
    /// Level-3 three-party hand-off. Not supported at Level 1.
    ThirdPartyHosted,
}

/// The target of a `Call` or `Disembargo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// A capability in the receiver's export table.
    ImportedCap(ExportId),
    /// A capability inside one of the receiver's pending answers.
    PromisedAnswer(PromisedAnswer),
}

/// A pointerful message body plus its capability table.
///
/// `content` is produced and consumed by the external codec; the core treats
/// it as opaque bytes and only interprets `cap_table`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub content: Vec<u8>,
    pub cap_table: Vec<CapDescriptor>,
}

impl Payload {
    pub fn new(content: Vec<u8>, cap_table: Vec<CapDescriptor>) -> Self {
        Self { content, cap_table }
    }
}

/// Where the callee should deliver the results of a call.
///
/// Only `Caller` is meaningful at Level 1; the other variants exist so a
/// conforming peer using them gets a well-formed `unimplemented` answer
/// rather than a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendResultsTo {
    #[default]
    Caller,
    Yourself,
    ThirdParty,
}

/// The body of a `Return`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnKind {
    /// The call succeeded; here are its results.
    Results(Payload),
    /// The call failed.
    Exception(Exception),
    /// The call was canceled per the caller's `Finish` before completing.
    Canceled,
    /// Results were delivered elsewhere (`send_results_to` was not `Caller`).
    ResultsSentElsewhere,
    /// Results are the results of some other question (tail calls).
    TakeFromOtherQuestion(QuestionId),
    /// Level-3 three-party hand-off.
    AcceptFromThirdParty,
}

/// The body of a `Resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveKind {
    /// The promise resolved to this capability.
    Cap(CapDescriptor),
    /// The promise failed.
    Exception(Exception),
}

/// Embargo context of a `Disembargo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisembargoContext {
    /// Sent by the side that received a loopback `Resolve`; must be echoed.
    SenderLoopback(EmbargoId),
    /// The echo, carrying the same id as the `SenderLoopback` it answers.
    ReceiverLoopback(EmbargoId),
    /// Level-3 hand-off acceptance.
    Accept,
    /// Level-3 hand-off provision.
    Provide(QuestionId),
}

/// A protocol message.
///
/// The variant set follows the published RPC schema at Level 1; variants the
/// peer may legally send but this level does not support still decode so the
/// core can answer them with `Unimplemented`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Echo of a message the sender did not understand.
    Unimplemented { echoed: Box<Message> },

    /// Terminal error; the connection is dead after this.
    Abort(Exception),

    /// Ask for the receiver's bootstrap capability.
    Bootstrap { question_id: QuestionId },

    /// Invoke a method on a capability.
    Call {
        question_id: QuestionId,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        send_results_to: SendResultsTo,
    },

    /// Complete a question.
    Return {
        answer_id: AnswerId,
        release_param_caps: bool,
        kind: ReturnKind,
    },

    /// The caller is done with a question and its pipelined derivatives.
    Finish {
        question_id: QuestionId,
        release_result_caps: bool,
    },

    /// A previously sent `senderPromise` settled.
    Resolve {
        promise_id: ExportId,
        kind: ResolveKind,
    },

    /// Drop `reference_count` wire references to an export of the receiver.
    Release {
        id: ImportId,
        reference_count: u32,
    },

    /// Flush in-flight calls along a promise path that just shortened.
    Disembargo {
        target: MessageTarget,
        context: DisembargoContext,
    },

    /// A message kind the codec decoded but this level does not know.
    Unknown { ordinal: u16 },
}

impl Message {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Unimplemented { .. } => "unimplemented",
            Message::Abort(_) => "abort",
            Message::Bootstrap { .. } => "bootstrap",
            Message::Call { .. } => "call",
            Message::Return { .. } => "return",
            Message::Finish { .. } => "finish",
            Message::Resolve { .. } => "resolve",
            Message::Release { .. } => "release",
            Message::Disembargo { .. } => "disembargo",
            Message::Unknown { .. } => "unknown",
        }
    }
}
