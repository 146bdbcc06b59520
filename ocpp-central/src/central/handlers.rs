//! Inbound CALL handlers
//!
//! A [`HandlerRegistry`] maps actions to handler functions. It is built once
//! at startup and shared read-only with the dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::CentralConfig;
use crate::ocpp::*;

/// Identity of the CALL being handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub device_id: String,
    pub message_id: String,
    pub action: Action,
}

/// Handler failures, mapped onto CALLERROR codes by the dispatcher
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn internal(msg: impl Into<String>) -> Self {
        HandlerError::Internal(msg.into())
    }

    /// Converts to the CALLERROR code sent to the device
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HandlerError::Payload(_) => ErrorCode::FormationViolation,
            HandlerError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// Type-erased handler taking the raw payload and returning the raw reply
pub type Handler = Arc<dyn Fn(CallContext, Value) -> HandlerFuture + Send + Sync>;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Action, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock central system replies
    pub fn with_defaults(config: &CentralConfig) -> Self {
        let interval = config.heartbeat_interval;
        let next_transaction = Arc::new(AtomicI32::new(1));

        Self::new()
            .reply_with(Action::Authorize, |_| AuthorizeConf {
                id_tag_info: IdTagInfo::accepted(),
            })
            .reply_with(Action::BootNotification, move |_| BootNotificationConf {
                current_time: Utc::now(),
                interval,
                status: RegistrationStatus::Accepted,
            })
            .reply_with(Action::Heartbeat, |_| HeartbeatConf {
                current_time: Utc::now(),
            })
            .reply_with(Action::StartTransaction, move |_| StartTransactionConf {
                id_tag_info: IdTagInfo::accepted(),
                transaction_id: next_transaction.fetch_add(1, Ordering::Relaxed),
            })
            .reply_with(Action::StopTransaction, |_| StopTransactionConf::default())
            .reply_with(Action::StatusNotification, |_| StatusNotificationConf {})
            .reply_with(Action::MeterValues, |_| MeterValuesConf {})
            .reply_with(Action::FirmwareStatusNotification, |_| {
                FirmwareStatusNotificationConf {}
            })
            .reply_with(Action::DiagnosticsStatusNotification, |_| {
                DiagnosticsStatusNotificationConf {}
            })
            .reply_with(Action::DataTransfer, |_| DataTransferConf {
                status: DataTransferStatus::Accepted,
                data: None,
            })
    }

    /// Register a typed handler. The request type selects the action.
    ///
    /// The payload is decoded into `R` before the handler runs; a payload
    /// that does not fit `R` fails as [`HandlerError::Payload`].
    pub fn on<R, F, Fut>(self, handler: F) -> Self
    where
        R: Request,
        F: Fn(CallContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_raw(R::ACTION, move |ctx, raw| {
            let handler = handler.clone();
            async move {
                let request: R = from_payload(&raw)?;
                let response = handler(ctx, request).await?;
                encode_reply(&response)
            }
        })
    }

    /// Register a handler working on raw JSON payloads
    pub fn on_raw<F, Fut>(mut self, action: Action, handler: F) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: CallContext, raw: Value| handler(ctx, raw).boxed());
        self.handlers.insert(action, handler);
        self
    }

    /// Register a fixed reply that ignores the request body.
    ///
    /// The payload still has to be a JSON object.
    pub fn reply_with<T, F>(self, action: Action, reply: F) -> Self
    where
        T: Serialize,
        F: Fn(&CallContext) -> T + Send + Sync + 'static,
    {
        self.on_raw(action, move |ctx, raw| {
            let result = require_object(&ctx, &raw).and_then(|_| encode_reply(&reply(&ctx)));
            async move { result }
        })
    }

    pub fn get(&self, action: Action) -> Option<Handler> {
        self.handlers.get(&action).cloned()
    }

    pub fn contains(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }

    pub fn remove(mut self, action: Action) -> Self {
        self.handlers.remove(&action);
        self
    }

    pub fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self.handlers.keys().copied().collect();
        actions.sort_by_key(|a| *a as usize);
        actions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}

fn require_object(ctx: &CallContext, raw: &Value) -> Result<(), HandlerError> {
    if raw.is_object() {
        Ok(())
    } else {
        Err(PayloadError::schema(
            ctx.action.descriptor().request.name,
            "payload is not an object",
        )
        .into())
    }
}

// Reply serialization failures are internal errors.
fn encode_reply<T: Serialize>(reply: &T) -> Result<Value, HandlerError> {
    to_payload(reply).map_err(|e| HandlerError::internal(e.to_string()))
}
