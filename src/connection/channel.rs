//! Message channel between the engine and the dispatch loop.
//!
//! The engine side never touches local state. A call is turned into an [`Envelope`]
//! (the message plus a one-shot response sink), pushed onto the dispatcher's FIFO, and the
//! caller waits on the sink.
//!
//! # Message Flow
//!
//! ```text
//! Engine thread                         Control task
//! -------------                         ------------
//! 1. call(payload, enactment, corr)
//! 2. push Envelope onto FIFO   ------>
//!                                       3. receive Envelope
//!                                       4. run handler (mutate state)
//!                                       5. answer sink
//! 6. wait on sink              <------
//! 7. return response
//! ```

use crate::error::{WorkflowError, WorkflowResult};
use crate::protocol::{CorrelationId, Message, Payload, Response};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Single-assignment slot for the response to one engine call.
#[derive(Debug)]
pub struct ResponseSink(oneshot::Sender<Response>);

impl ResponseSink {
    /// Fill the slot. Consumes the sink, so it can be answered at most once.
    ///
    /// Returns `false` if the caller stopped waiting.
    pub fn send(self, response: Response) -> bool {
        self.0.send(response).is_ok()
    }
}

/// One queued engine call.
#[derive(Debug)]
pub struct Envelope {
    /// Message from the engine
    pub message: Message,
    /// Where the answer goes
    pub sink: ResponseSink,
}

impl Envelope {
    /// Wrap `message` with a fresh response sink.
    pub fn new(message: Message) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                sink: ResponseSink(tx),
            },
            rx,
        )
    }
}

/// Engine-facing end of the FIFO.
///
/// Cloneable and `Send`; the only cross-thread entry point into the control process.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    tx: mpsc::Sender<Envelope>,
}

impl MessageChannel {
    /// Create a channel and the receiver the dispatcher consumes.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send `payload` and wait for the answer.
    pub async fn call(
        &self,
        payload: Payload,
        enactment_id: &str,
        correlation_id: Option<&str>,
    ) -> Response {
        self.send(Message::from_payload(payload, enactment_id, correlation_id))
            .await
    }

    /// Send an already-built message and wait for the answer.
    ///
    /// If the dispatch loop is gone the call is answered with an abort.
    pub async fn send(&self, message: Message) -> Response {
        let (envelope, rx) = Envelope::new(message);
        if self.tx.send(envelope).await.is_err() {
            return Some(closed_abort());
        }
        rx.await.unwrap_or_else(|_| Some(closed_abort()))
    }

    /// Blocking variant of [`MessageChannel::call`] for engine threads outside the runtime.
    ///
    /// Must not be called from within an async context.
    pub fn call_blocking(
        &self,
        payload: Payload,
        enactment_id: &str,
        correlation_id: Option<&str>,
    ) -> Response {
        let message = Message::from_payload(payload, enactment_id, correlation_id);
        let (envelope, rx) = Envelope::new(message);
        if self.tx.blocking_send(envelope).is_err() {
            return Some(closed_abort());
        }
        rx.blocking_recv().unwrap_or_else(|_| Some(closed_abort()))
    }

    /// Whether the dispatcher side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn closed_abort() -> Payload {
    warn!("Workflow connection closed before the request was answered");
    Payload::abort("workflow connection closed")
}

/// Outstanding requests keyed by correlation id.
///
/// Each id is answered at most once; answering it again is rejected.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: HashMap<CorrelationId, ResponseSink>,
    answered: HashSet<CorrelationId>,
}

impl PendingRequests {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the sink for `id`.
    ///
    /// An id that is still pending or was already answered is refused and the sink is
    /// handed back so the caller can answer it.
    pub fn register(
        &mut self,
        id: CorrelationId,
        sink: ResponseSink,
    ) -> Result<(), (WorkflowError, ResponseSink)> {
        if self.slots.contains_key(&id) {
            return Err((WorkflowError::DuplicateRequest(id), sink));
        }
        if self.answered.contains(&id) {
            return Err((WorkflowError::AlreadyAnswered(id), sink));
        }
        self.slots.insert(id, sink);
        Ok(())
    }

    /// Answer `id` and remove its slot.
    pub fn answer(&mut self, id: &CorrelationId, response: Response) -> WorkflowResult<()> {
        let Some(sink) = self.slots.remove(id) else {
            if self.answered.contains(id) {
                return Err(WorkflowError::AlreadyAnswered(id.clone()));
            }
            return Err(WorkflowError::UnknownRequest(id.clone()));
        };
        self.answered.insert(id.clone());
        if !sink.send(response) {
            debug!(correlation_id = %id, "Engine stopped waiting for response");
        }
        Ok(())
    }

    /// Answer every pending request with an abort. Returns how many were answered.
    pub fn abort_all(&mut self, reason: &str) -> usize {
        let ids: Vec<CorrelationId> = self.slots.keys().cloned().collect();
        for id in &ids {
            warn!(correlation_id = %id, "Aborting pending request: {}", reason);
            // The id was taken from the map, so it is known and unanswered.
            let _ = self.answer(id, Some(Payload::abort(reason)));
        }
        ids.len()
    }

    /// Whether `id` awaits its answer.
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.slots.contains_key(id)
    }

    /// Number of unanswered requests.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Forget answered ids (end of run).
    pub fn reset(&mut self) {
        self.answered.clear();
    }
}
