//! Central system engine
//!
//! - `handlers`: inbound CALL handler registration and stock replies
//! - `dispatcher`: CALL in, CALLRESULT/CALLERROR out
//! - `coordinator`: outbound CALLs and reply correlation
//! - `transport`: frame delivery seam and in-process channel transport
//! - `audit`: envelope audit sinks
//! - `system`: the facade wiring it all together

pub mod audit;
pub mod coordinator;
pub mod dispatcher;
pub mod handlers;
pub mod system;
pub mod transport;

pub use audit::{AuditError, AuditRecord, AuditSink, Direction, Exchange, MemoryAudit, NullAudit, TracingAudit};
pub use coordinator::{CallReply, Coordinator, IdSource, IssueOutcome, OutboundError, Resolution};
pub use dispatcher::Dispatcher;
pub use handlers::{CallContext, Handler, HandlerError, HandlerFuture, HandlerRegistry};
pub use system::{CentralSystem, CentralSystemBuilder, Disposition};
pub use transport::{ChannelTransport, Outbox, Transport, TransportError};
