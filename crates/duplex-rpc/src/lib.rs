//! # duplex-rpc
//!
//! Bidirectional JSON-RPC over any duplex text channel.
//!
//! - [`client`]: the Call Engine, which turns `call(method, params)` into a
//!   settled outcome through an ordered plugin pipeline
//! - [`server`]: endpoints and the Dispatch Engine, which runs incoming
//!   calls through its own pipeline and produces replies
//! - [`transport`]: the transport plugin contract, the pending-call table,
//!   and a transport over an already-open channel
//! - [`router`]: the per-channel Router that tells calls from replies and
//!   owns the session registry and reverse Call Engines
//! - [`channel`]: the channel contract plus an in-memory channel pair
//!
//! Either side of one channel can be caller and callee at once: the Router
//! feeds requests to the Dispatch Engine and replies to the reverse Call
//! Engine of the same session.

#![deny(unsafe_code)]

use std::sync::Arc;

pub mod channel;
pub mod client;
pub mod message;
pub mod metrics;
pub mod router;
pub mod server;
pub mod transport;

pub use channel::{Channel, ChannelEvent, ChannelEvents, MemoryChannel, memory_pair};
pub use client::{CallEngine, ClientPlugin, WeakCallEngine};
pub use message::{DispatchState, IncomingMessage, OutgoingMessage, ReverseClientSource};
pub use router::{CONNECT_TO_ENDPOINT, ReverseClient, Router, Session};
pub use server::{CallContext, DispatchEngine, Endpoint, MethodHandler, ServerPlugin, handler_fn};
pub use transport::{ChannelTransport, PendingCalls, TransportPlugin};

/// Whether two plugin handles point at the same instance.
///
/// Compares data pointers only; vtable pointers of the same type may differ
/// between codegen units.
pub(crate) fn same_plugin<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
