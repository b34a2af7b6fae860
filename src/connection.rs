//! The connection engine.
//!
//! A [`Connection`] is a cheap, cloneable handle. The transport itself is owned
//! by a driver task that performs every inbound reaction (decoding, resolving
//! outcomes, dispatching calls, running continuations) one at a time. Outbound
//! calls from any task only allocate an id, register a waiter and queue a frame
//! for the driver, so they never block.
//!
//! ```text
//!  invoke/request ──► outbound queue ──┐
//!                                      ▼
//!                              ┌──────────────┐  Outcome  ┌──────────────┐
//!   transport.recv() ────────► │    driver    │ ────────► │ PendingCalls │
//!                              └──────────────┘           └──────────────┘
//!                                  │  Call
//!                                  ▼
//!                           DispatchTable ──► Outcome (tracked calls only) ──► transport.send()
//! ```

use crate::{
    config::ConnectionConfig,
    dispatcher::{panic_message, DispatchTable},
    event::{CloseInfo, ConnectionEvent, ConnectionState},
    message::{self, Call, CallKind, Message, Outcome},
    net::client,
    pending::{Continuation, PendingCalls, RegistryError},
    transport::{Inbound, Transport, TransportError},
    types::{Args, CallId, Kwargs, Value},
};
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runs once, on the driver task, right after the connection becomes [`ConnectionState::Open`].
pub type OnOpen = Box<dyn FnOnce(&Connection) + Send + 'static>;

const EVENT_CAPACITY: usize = 16;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is {0}")]
    NotOpen(ConnectionState),
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failure of an awaited [`Connection::call`].
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("remote error: {error}")]
    Remote { error: Value, result: Value },
    #[error("connection closed before the call was answered")]
    Abandoned,
}

enum Outbound {
    Frame(String),
    Close,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    pending: PendingCalls,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

enum Termination {
    Local,
    Peer(Option<CloseInfo>),
    Failed(TransportError),
    /// The driver stopped without reaching a close, e.g. it panicked or was cancelled.
    Aborted,
}

impl Shared {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Self {
            state: watch::channel(ConnectionState::Connecting).0,
            events,
            pending: PendingCalls::new(),
            next_id: AtomicU64::new(0),
            outbound,
        });
        (shared, outbound_rx)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn queue(&self, text: String) -> Result<(), ConnectionError> {
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| ConnectionError::Closed)
    }

    fn open(&self) {
        let _ = self.state.send_replace(ConnectionState::Open);
        info!("connection open");
        self.emit(ConnectionEvent::Open);
    }

    fn terminate(&self, termination: Termination) {
        // The state flips before the registry is drained; `request` relies on this order.
        let _ = self.state.send_replace(ConnectionState::Closed);
        let abandoned = self.pending.abandon_all();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), ids = ?abandoned, "abandoning pending calls");
        }

        match termination {
            Termination::Local => {
                info!("connection closed");
                self.emit(ConnectionEvent::Closed(None));
            }
            Termination::Peer(close) => {
                info!(code = ?close.as_ref().map(|c| c.code), "connection closed by peer");
                self.emit(ConnectionEvent::Closed(close));
            }
            Termination::Failed(e) => {
                error!(error = %e, "connection failed");
                self.emit(ConnectionEvent::Error(e.to_string()));
                self.emit(ConnectionEvent::Closed(None));
            }
            Termination::Aborted => {
                error!("connection driver stopped");
                self.emit(ConnectionEvent::Error("connection driver stopped".to_owned()));
                self.emit(ConnectionEvent::Closed(None));
            }
        }
    }
}

/// Terminates the connection when the driver finishes, however it finishes.
struct Terminator {
    shared: Arc<Shared>,
    termination: Option<Termination>,
}

impl Drop for Terminator {
    fn drop(&mut self) {
        let termination = self.termination.take().unwrap_or(Termination::Aborted);
        self.shared.terminate(termination);
    }
}

/// A handle to one end of a bidirectional RPC connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start dialing `config` and return at once, in [`ConnectionState::Connecting`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        config: &ConnectionConfig,
        dispatch: impl Into<Arc<DispatchTable>>,
        on_open: Option<OnOpen>,
    ) -> Self {
        let (shared, outbound) = Shared::new();
        let engine = Engine {
            shared: Arc::clone(&shared),
            dispatch: dispatch.into(),
        };
        let config = config.clone();
        let span = info_span!("connection", conn = next_serial(), url = %config.url());

        tokio::spawn(
            async move {
                match client::connect(&config).await {
                    Ok(transport) => engine.run(transport, outbound, on_open).await,
                    Err(e) => engine.shared.terminate(Termination::Failed(e)),
                }
            }
            .instrument(span),
        );
        Self { shared }
    }

    /// Serve an already established transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<T: Transport>(
        transport: T,
        dispatch: impl Into<Arc<DispatchTable>>,
        on_open: Option<OnOpen>,
    ) -> Self {
        let (shared, outbound) = Shared::new();
        let engine = Engine {
            shared: Arc::clone(&shared),
            dispatch: dispatch.into(),
        };
        let span = info_span!("connection", conn = next_serial());
        tokio::spawn(engine.run(transport, outbound, on_open).instrument(span));
        Self { shared }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Wait until the connection leaves [`ConnectionState::Connecting`].
    pub async fn opened(&self) -> Result<(), ConnectionError> {
        let mut state = self.shared.state.subscribe();
        let reached = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s)
            .map_err(|_| ConnectionError::Closed)?;
        match reached {
            ConnectionState::Open => Ok(()),
            other => Err(ConnectionError::NotOpen(other)),
        }
    }

    /// Wait until the connection is [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Lifecycle events from now on. Use [`state`](Self::state) for the current state.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Ids of tracked calls still waiting for an outcome.
    pub fn pending_ids(&self) -> Vec<CallId> {
        self.shared.pending.pending_ids()
    }

    /// Send a notification. No reply is expected and none is ever observed.
    pub fn invoke(
        &self,
        method: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let call = Call::notification(method, args, kwargs);
        debug!(method = %call.method, "sending notification");
        self.shared.queue(call.to_json())
    }

    /// Send a tracked call and return its id immediately.
    ///
    /// `on_success` runs with the outcome once a reply without an error arrives;
    /// `on_error` runs for a reply carrying an error. Neither runs if the
    /// connection closes first.
    pub fn request<F>(
        &self,
        method: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
        on_success: F,
        on_error: Option<Continuation>,
    ) -> Result<CallId, ConnectionError>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.ensure_open()?;
        let call = Call::tracked(method, args, kwargs, self.next_id());
        let id = call.kind.id().unwrap_or_default();
        self.shared
            .pending
            .register(id, call.method.as_str(), Box::new(on_success), on_error)?;

        // A close racing with registration would otherwise strand the entry.
        if let Err(e) = self.ensure_open() {
            let _ = self.shared.pending.remove(id);
            return Err(e);
        }
        if let Err(e) = self.shared.queue(call.to_json()) {
            let _ = self.shared.pending.remove(id);
            return Err(e);
        }
        debug!(id, method = %call.method, "sent tracked call");
        Ok(id)
    }

    /// Send a tracked call and wait for its result.
    pub async fn call(
        &self,
        method: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        let on_success_slot = Arc::new(Mutex::new(Some(tx)));
        let on_error_slot = Arc::clone(&on_success_slot);

        let _ = self.request(
            method,
            args,
            kwargs,
            move |outcome| fulfil(&on_success_slot, Ok(outcome.result)),
            Some(Box::new(move |outcome: Outcome| {
                let error = CallError::Remote {
                    error: outcome.error.unwrap_or_default(),
                    result: outcome.result,
                };
                fulfil(&on_error_slot, Err(error));
            })),
        )?;
        // Abandoning the entry drops both senders.
        rx.await.unwrap_or(Err(CallError::Abandoned))
    }

    /// Ask the driver to close the transport.
    pub fn close(&self) {
        let _ = self.shared.outbound.send(Outbound::Close);
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        match self.shared.state() {
            ConnectionState::Open => Ok(()),
            state => Err(ConnectionError::NotOpen(state)),
        }
    }

    fn next_id(&self) -> CallId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

type ReplySlot = Mutex<Option<oneshot::Sender<Result<Value, CallError>>>>;

fn fulfil(slot: &ReplySlot, reply: Result<Value, CallError>) {
    if let Some(tx) = slot.lock().take() {
        let _ = tx.send(reply);
    }
}

fn next_serial() -> u64 {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

/// The inbound half, owned by the driver task.
struct Engine {
    shared: Arc<Shared>,
    dispatch: Arc<DispatchTable>,
}

enum Step {
    Inbound(Result<Inbound, TransportError>),
    Outbound(Option<Outbound>),
}

impl Engine {
    async fn run<T: Transport>(
        self,
        mut transport: T,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        on_open: Option<OnOpen>,
    ) {
        let mut terminator = Terminator {
            shared: Arc::clone(&self.shared),
            termination: None,
        };
        self.shared.open();
        if let Some(on_open) = on_open {
            let conn = Connection {
                shared: Arc::clone(&self.shared),
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_open(&conn))) {
                warn!(panic = %panic_message(&*payload), "on_open panicked");
            }
        }

        let termination = loop {
            let step = tokio::select! {
                inbound = transport.recv() => Step::Inbound(inbound),
                queued = outbound.recv() => Step::Outbound(queued),
            };

            let reply = match step {
                Step::Inbound(Ok(Inbound::Text(text))) => self.process(text.as_bytes()),
                Step::Inbound(Ok(Inbound::Binary(data))) => self.process(&data),
                Step::Inbound(Ok(Inbound::Closed(close))) => break Termination::Peer(close),
                Step::Inbound(Err(e)) => break Termination::Failed(e),
                Step::Outbound(Some(Outbound::Frame(text))) => Some(text),
                Step::Outbound(Some(Outbound::Close)) | Step::Outbound(None) => {
                    if let Err(e) = transport.close().await {
                        debug!(error = %e, "error while closing transport");
                    }
                    break Termination::Local;
                }
            };

            if let Some(text) = reply {
                if let Err(e) = transport.send(text).await {
                    break Termination::Failed(e);
                }
            }
        };

        terminator.termination = Some(termination);
    }

    /// Handle one inbound frame, returning the reply to send, if any.
    fn process(&self, payload: &[u8]) -> Option<String> {
        match message::decode(payload) {
            Ok(Message::Outcome(outcome)) => {
                self.resolve(outcome);
                None
            }
            Ok(Message::Call(call)) => self.serve(call).map(|outcome| outcome.to_json()),
            Err(e) => {
                warn!(error = %e, len = payload.len(), "dropping undecodable frame");
                None
            }
        }
    }

    fn resolve(&self, outcome: Outcome) {
        let id = outcome.id;
        match self.shared.pending.resolve(outcome) {
            Ok(resolution) => debug!(id, ?resolution, "resolved call"),
            Err(e) => warn!(id, error = %e, "dropping outcome"),
        }
    }

    fn serve(&self, call: Call) -> Option<Outcome> {
        let Call {
            method,
            args,
            kwargs,
            kind,
        } = call;
        let result = self.dispatch.dispatch(&method, args, kwargs);

        match (kind, result) {
            (CallKind::Tracked(id), Ok(value)) => Some(Outcome::success(id, value)),
            (CallKind::Tracked(id), Err(e)) => {
                warn!(id, %method, error = %e, "call failed");
                Some(Outcome::failure(id, e.descriptor()))
            }
            (CallKind::Notification, Ok(_)) => None,
            (CallKind::Notification, Err(e)) => {
                warn!(%method, error = %e, "notification failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch_table, dispatcher::HandlerError, transport::MemoryTransport, types::arg};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn engine(dispatch: DispatchTable) -> Engine {
        let (shared, _outbound) = Shared::new();
        Engine {
            shared,
            dispatch: Arc::new(dispatch),
        }
    }

    fn echo_table(calls: &Arc<AtomicUsize>) -> DispatchTable {
        let calls = Arc::clone(calls);
        dispatch_table! {
            "Echo" => move |args, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(arg::<Value>(&args, 0)?)
            },
            "Fail" => |_, _| Err(HandlerError::new("boom")),
        }
    }

    #[test]
    fn tracked_call_gets_exactly_one_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(echo_table(&calls));
        let reply = engine.process(br#"{"method":"Echo","args":["hi"],"kwargs":{},"id":7}"#);
        assert_eq!(reply.as_deref(), Some(r#"{"id":7,"result":"hi","error":null}"#));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifications_never_reply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(echo_table(&calls));
        assert_eq!(engine.process(br#"{"method":"Echo","args":["hi"]}"#), None);
        assert_eq!(engine.process(br#"{"method":"Fail","args":[],"kwargs":{}}"#), None);
        assert_eq!(engine.process(br#"{"method":"Nope","id":null}"#), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_method_is_reported_to_the_caller() {
        let engine = engine(DispatchTable::new());
        let reply = engine.process(br#"{"method":"Nope","args":[],"kwargs":{},"id":3}"#);
        assert_eq!(
            reply.as_deref(),
            Some(r#"{"id":3,"result":null,"error":"MethodNotFoundError: Nope"}"#)
        );
    }

    #[test]
    fn handler_failure_is_reported_to_the_caller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(echo_table(&calls));
        let reply = engine.process(br#"{"method":"Fail","id":0}"#).unwrap();
        let outcome: Outcome = serde_json::from_str(&reply).unwrap();
        assert_eq!(outcome, Outcome::failure(0, "HandlerExecutionError: boom"));
    }

    #[test]
    fn stray_and_garbage_frames_are_dropped() {
        let engine = engine(DispatchTable::new());
        assert_eq!(engine.process(br#"{"id":41,"result":1,"error":null}"#), None);
        assert_eq!(engine.process(b"not json"), None);
        assert_eq!(engine.process(br#""just a string""#), None);
    }

    #[test]
    fn outcome_resolves_its_waiter() {
        let engine = engine(DispatchTable::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        engine
            .shared
            .pending
            .register(
                5,
                "Echo",
                Box::new(move |outcome: Outcome| seen_in.lock().push(outcome.result)),
                None,
            )
            .unwrap();

        let frame = br#"{"id":5,"result":"hi","error":null}"#;
        assert_eq!(engine.process(frame), None);
        assert_eq!(engine.process(frame), None);
        assert_eq!(*seen.lock(), vec![json!("hi")]);
    }

    #[tokio::test]
    async fn calls_are_refused_until_open() {
        let (shared, _outbound) = Shared::new();
        let conn = Connection { shared };
        assert_matches!(
            conn.invoke("ping", vec![], Kwargs::new()),
            Err(ConnectionError::NotOpen(ConnectionState::Connecting))
        );
        assert_matches!(
            conn.request("ping", vec![], Kwargs::new(), |_| {}, None),
            Err(ConnectionError::NotOpen(ConnectionState::Connecting))
        );
        assert!(conn.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn request_ids_increase() {
        let (local, mut peer) = MemoryTransport::pair();
        let conn = Connection::attach(local, DispatchTable::new(), None);
        conn.opened().await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(conn.request("ping", vec![], Kwargs::new(), |_| {}, None).unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(conn.pending_ids(), ids);

        for expected in ids {
            let Inbound::Text(text) = peer.recv().await.unwrap() else {
                panic!("expected a frame");
            };
            let Message::Call(call) = message::decode(text.as_bytes()).unwrap() else {
                panic!("expected a call");
            };
            assert_eq!(call.kind, CallKind::Tracked(expected));
        }
    }
}
