//! Bidirectional RPC over a single WebSocket connection.
//!
//! Both endpoints of a [`Connection`] can call methods on the other. Outbound
//! calls are either notifications ([`Connection::invoke`]) or tracked calls
//! ([`Connection::request`], [`Connection::call`]) whose [`Outcome`] is matched
//! back by id. Inbound calls are served from a [`DispatchTable`].

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod event;
mod macros;
pub mod message;
pub mod net;
pub mod pending;
pub mod transport;
pub mod types;

pub use config::ConnectionConfig;
pub use connection::{CallError, Connection, ConnectionError, OnOpen};
pub use dispatcher::{DispatchError, DispatchTable, Handler, HandlerError};
pub use event::{CloseInfo, ConnectionEvent, ConnectionState};
pub use message::{Call, CallKind, DecodeError, Message, Outcome};
pub use net::{server::Server, WsTransport};
pub use pending::{Continuation, PendingCalls, RegistryError, Resolution};
pub use transport::{Inbound, MemoryTransport, Transport, TransportError};
pub use types::{Args, CallId, Kwargs, TypeMismatch, Value};

/// A named method that can be registered with [`DispatchTable::add`].
pub trait RpcFunction: Send + Sync {
    fn name(&self) -> &str;

    fn call(&self, args: Args, kwargs: Kwargs) -> Result<Value, HandlerError>;
}
