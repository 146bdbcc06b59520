//! OCPP 1.6-J protocol layer
//!
//! - `actions`: registry of action names, origins and payload shapes
//! - `messages`: JSON framing (CALL, CALLRESULT, CALLERROR)
//! - `payload`: typed body serialization contract
//! - `types`: enums and shared complex types
//! - `requests`: request and confirmation bodies per action

pub mod actions;
pub mod messages;
pub mod payload;
pub mod requests;
pub mod types;

pub use actions::{Action, ActionDescriptor, ActionRegistry, Origin, PayloadShape, UnknownAction};
pub use messages::*;
pub use payload::{from_payload, to_payload, PayloadError, Request};
pub use requests::*;
pub use types::*;
