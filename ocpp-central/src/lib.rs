//! # OCPP Central
//!
//! OCPP 1.6-J central system protocol engine.
//!
//! The crate owns the protocol core of a central system: the typed payload
//! model, the action registry, the JSON envelope codec, the inbound
//! dispatcher and the outbound call coordinator. Sockets stay outside; the
//! connection layer hands inbound frames in and receives outbound frames
//! through a [`Transport`].
//!
//! ## Architecture
//!
//! ```text
//! Charge points
//!       │ WebSocket frames (owned by the caller)
//!       ▼
//! ┌──────────────────────────────────────────┐
//! │ CentralSystem                            │
//! │   decode ──► CALL ──► Dispatcher ──┐     │
//! │      │                 handlers    │     │
//! │      └──► CALLRESULT/CALLERROR     │     │
//! │               │                    ▼     │
//! │           Coordinator ◄── issue  Outbox ─┼──► Transport
//! │         (pending calls)            │     │
//! │                                  Audit   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_central::{CentralSystem, ChannelTransport, IdToken, RemoteStartTransactionRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(ChannelTransport::new());
//!     let system = CentralSystem::builder(transport.clone()).build();
//!
//!     // The socket layer drains `_outbound` and feeds `_inbound_tx`
//!     let _outbound = transport.connect("CP1");
//!     let (_inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(64);
//!     system.serve("CP1", inbound_rx);
//!
//!     let request = RemoteStartTransactionRequest::new(IdToken::new("abc")).with_connector(1);
//!     let conf = system.call("CP1", &request).await?;
//!     println!("remote start: {:?}", conf.status);
//!     Ok(())
//! }
//! ```

pub mod central;
pub mod config;
pub mod ocpp;

pub use config::CentralConfig;

// Re-export key types
pub use central::{
    AuditSink, CallContext, CallReply, CentralSystem, ChannelTransport, Direction, Disposition,
    HandlerError, HandlerRegistry, IssueOutcome, MemoryAudit, OutboundError, Transport,
};
pub use ocpp::{
    decode, encode, Action, ActionRegistry, Call, CallError, CallResult, Envelope, ErrorCode,
    IdToken, ParseError, PayloadError, RemoteStartTransactionRequest, Request,
};
