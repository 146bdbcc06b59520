//! Inbound dispatcher
//!
//! Turns a decoded CALL into the CALLRESULT or CALLERROR to send back. Every
//! outcome, including a panicking handler, becomes a reply frame.

use std::panic::AssertUnwindSafe;

use futures_util::future::FutureExt;
use tracing::{debug, error, info, warn};

use super::handlers::{CallContext, HandlerError, HandlerRegistry};
use crate::config::CentralConfig;
use crate::ocpp::{ActionRegistry, Call, CallError, CallResult, Envelope, ErrorCode};

pub struct Dispatcher {
    handlers: HandlerRegistry,
    validate_inbound: bool,
}

impl Dispatcher {
    pub fn new(handlers: HandlerRegistry, config: &CentralConfig) -> Self {
        Self {
            handlers,
            validate_inbound: config.validate_inbound,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Handle one inbound CALL and build its reply
    pub async fn dispatch(&self, device_id: &str, call: Call) -> Envelope {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        let descriptor = match ActionRegistry::resolve(&action) {
            Ok(d) => d,
            Err(e) => {
                warn!("{} sent {}: {}", device_id, message_id, e);
                return CallError::new(
                    message_id,
                    ErrorCode::NotImplemented,
                    format!("Unknown action {}", action),
                )
                .into();
            }
        };

        let Some(handler) = self.handlers.get(descriptor.action) else {
            warn!(
                "No handler for {} from {} ({})",
                descriptor.action, device_id, message_id
            );
            return CallError::new(
                message_id,
                ErrorCode::NotImplemented,
                format!("{} is not supported", descriptor.action),
            )
            .into();
        };

        if self.validate_inbound {
            if let Err(e) = descriptor.request.validate(&payload) {
                info!(
                    "Rejected {} from {} ({}): {}",
                    descriptor.action, device_id, message_id, e
                );
                return CallError::new(message_id, ErrorCode::FormationViolation, e.to_string())
                    .into();
            }
        }

        let ctx = CallContext {
            device_id: device_id.to_string(),
            message_id: message_id.clone(),
            action: descriptor.action,
        };

        // Handlers may panic while building the future or while polling it.
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, payload))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(HandlerError::internal("handler panicked")),
        };

        match result {
            Ok(reply) => {
                debug!(
                    "Handled {} from {} ({})",
                    descriptor.action, device_id, message_id
                );
                CallResult::new(message_id, reply).into()
            }
            Err(e @ HandlerError::Payload(_)) => {
                info!(
                    "Rejected {} from {} ({}): {}",
                    descriptor.action, device_id, message_id, e
                );
                CallError::new(message_id, e.error_code(), e.to_string()).into()
            }
            Err(e) => {
                error!(
                    "Handler for {} failed on {} ({}): {}",
                    descriptor.action, device_id, message_id, e
                );
                CallError::new(message_id, e.error_code(), e.to_string()).into()
            }
        }
    }
}
