//! Central system facade
//!
//! Wires the dispatcher, the coordinator, the transport and the audit sink
//! together. The connection layer feeds every inbound frame to
//! [`CentralSystem::on_receive`], or hands a frame channel to
//! [`CentralSystem::serve`] which does it in a dedicated task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::audit::{AuditSink, Direction, TracingAudit};
use super::coordinator::{CallReply, Coordinator, IdSource, IssueOutcome, OutboundError, Resolution};
use super::dispatcher::Dispatcher;
use super::handlers::HandlerRegistry;
use super::transport::{Outbox, Transport};
use crate::config::CentralConfig;
use crate::ocpp::{decode_bounded, Envelope, ParseError, Request};

/// What the engine did with one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// A CALL was answered with this envelope
    Replied(Envelope),
    /// A reply settled a pending outbound call
    Resolved { message_id: String },
    /// A reply matched no pending call and was discarded
    Orphan { message_id: String },
    /// The frame could not be decoded; nothing was sent back
    Dropped(ParseError),
}

pub struct CentralSystemBuilder {
    config: CentralConfig,
    transport: Arc<dyn Transport>,
    handlers: Option<HandlerRegistry>,
    audit: Arc<dyn AuditSink>,
    ids: Option<IdSource>,
}

impl CentralSystemBuilder {
    pub fn config(mut self, config: CentralConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default handler set
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Draw outbound message ids from `ids` instead of random UUIDs
    pub fn id_source(mut self, ids: IdSource) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Arc<CentralSystem> {
        let handlers = self
            .handlers
            .unwrap_or_else(|| HandlerRegistry::with_defaults(&self.config));
        let outbox = Outbox::new(self.transport, self.audit);
        let coordinator = match self.ids {
            Some(ids) => Coordinator::with_id_source(outbox.clone(), &self.config, ids),
            None => Coordinator::new(outbox.clone(), &self.config),
        };

        Arc::new(CentralSystem {
            dispatcher: Dispatcher::new(handlers, &self.config),
            coordinator,
            outbox,
            config: self.config,
        })
    }
}

pub struct CentralSystem {
    config: CentralConfig,
    dispatcher: Dispatcher,
    coordinator: Coordinator,
    outbox: Outbox,
}

impl CentralSystem {
    /// Start building a central system that sends through `transport`
    pub fn builder(transport: Arc<dyn Transport>) -> CentralSystemBuilder {
        CentralSystemBuilder {
            config: CentralConfig::default(),
            transport,
            handlers: None,
            audit: Arc::new(TracingAudit),
            ids: None,
        }
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        self.dispatcher.handlers()
    }

    /// Process one inbound frame from a device.
    ///
    /// A CALL is answered through the transport before this returns, so
    /// awaiting each call in turn keeps replies in arrival order.
    pub async fn on_receive(&self, device_id: &str, raw: &str) -> Disposition {
        debug!("<- {}: {}", device_id, raw);

        let envelope = match decode_bounded(raw, self.config.max_frame_bytes) {
            Ok(env) => env,
            Err(e) => {
                warn!("Dropping frame from {}: {}", device_id, e);
                return Disposition::Dropped(e);
            }
        };
        self.outbox
            .audit(Direction::ChargePointToCentral, device_id, &envelope);

        match envelope {
            Envelope::Call(call) => {
                let reply = self.dispatcher.dispatch(device_id, call).await;
                if let Err(e) = self.outbox.send(device_id, &reply) {
                    warn!(
                        "Could not deliver reply {} to {}: {}",
                        reply.message_id(),
                        device_id,
                        e
                    );
                }
                Disposition::Replied(reply)
            }
            Envelope::CallResult(result) => self.resolve(device_id, CallReply::Result(result)),
            Envelope::CallError(error) => self.resolve(device_id, CallReply::Error(error)),
        }
    }

    fn resolve(&self, device_id: &str, reply: CallReply) -> Disposition {
        let message_id = reply.message_id().to_string();
        match self.coordinator.resolve(device_id, reply) {
            Resolution::Resolved => Disposition::Resolved { message_id },
            Resolution::Orphan => Disposition::Orphan { message_id },
        }
    }

    /// Spawn the per-device loop feeding `frames` to [`Self::on_receive`].
    ///
    /// The loop ends when the sender side is dropped. A handler that needs
    /// to await a call to the same device must spawn it, since that device's
    /// replies are read by this loop.
    pub fn serve(
        self: &Arc<Self>,
        device_id: impl Into<String>,
        mut frames: mpsc::Receiver<String>,
    ) -> JoinHandle<()> {
        let system = Arc::clone(self);
        let device_id = device_id.into();

        tokio::spawn(async move {
            info!("Serving device {}", device_id);
            while let Some(frame) = frames.recv().await {
                system.on_receive(&device_id, &frame).await;
            }
            info!("Device {} stream closed", device_id);
        })
    }

    /// Issue a CALL by action name; see [`Coordinator::issue`]
    pub async fn issue(
        &self,
        device_id: &str,
        action: &str,
        payload: Value,
        wait: Option<Duration>,
    ) -> Result<IssueOutcome, OutboundError> {
        self.coordinator.issue(device_id, action, payload, wait).await
    }

    /// Issue a typed request with the configured call timeout
    pub async fn call<R: Request>(
        &self,
        device_id: &str,
        request: &R,
    ) -> Result<R::Response, OutboundError> {
        self.coordinator
            .call(device_id, request, self.config.call_timeout)
            .await
    }

    pub async fn call_with_timeout<R: Request>(
        &self,
        device_id: &str,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, OutboundError> {
        self.coordinator.call(device_id, request, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::audit::MemoryAudit;
    use crate::central::transport::ChannelTransport;
    use crate::ocpp::*;

    fn system() -> (Arc<CentralSystem>, Arc<ChannelTransport>, Arc<MemoryAudit>) {
        let transport = Arc::new(ChannelTransport::new());
        let audit = Arc::new(MemoryAudit::new());
        let system = CentralSystem::builder(transport.clone())
            .audit(audit.clone())
            .build();
        (system, transport, audit)
    }

    #[tokio::test]
    async fn test_call_is_answered_and_audited() {
        let (system, transport, audit) = system();
        let mut rx = transport.connect("CP1");

        let disposition = system
            .on_receive("CP1", r#"[2,"hb1","Heartbeat",{}]"#)
            .await;
        assert!(matches!(disposition, Disposition::Replied(Envelope::CallResult(_))));

        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with(r#"[3,"hb1",{"currentTime":""#));

        let exchanges = audit.exchanges_for("CP1");
        assert_eq!(exchanges.len(), 1);
        assert!(exchanges[0].reply.is_some());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_silently() {
        let (system, transport, audit) = system();
        let mut rx = transport.connect("CP1");

        let disposition = system.on_receive("CP1", r#"[2,"m1"]"#).await;
        assert!(matches!(disposition, Disposition::Dropped(ParseError::Arity { .. })));
        assert!(rx.try_recv().is_err());
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_dropped() {
        let transport = Arc::new(ChannelTransport::new());
        let system = CentralSystem::builder(transport.clone())
            .config(CentralConfig::default().with_max_frame_bytes(16))
            .build();
        let mut rx = transport.connect("CP1");

        let disposition = system
            .on_receive("CP1", r#"[2,"m1","Heartbeat",{"padding":"xxxxxxxx"}]"#)
            .await;
        assert!(matches!(disposition, Disposition::Dropped(ParseError::FrameTooLarge { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_orphan_reply() {
        let (system, _transport, audit) = system();
        let disposition = system.on_receive("CP1", r#"[3,"unknown-id",{}]"#).await;
        assert_eq!(
            disposition,
            Disposition::Orphan {
                message_id: "unknown-id".to_string()
            }
        );
        assert_eq!(system.coordinator().pending_count(), 0);
        // Inbound frames are audited even when discarded
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_reply_to_disconnected_device_is_still_reported() {
        let (system, _transport, _audit) = system();
        let disposition = system
            .on_receive("CP1", r#"[2,"m1","Teleport",{}]"#)
            .await;
        match disposition {
            Disposition::Replied(Envelope::CallError(e)) => {
                assert_eq!(e.error_code, ErrorCode::NotImplemented)
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_custom_handlers_replace_defaults() {
        let transport = Arc::new(ChannelTransport::new());
        let handlers = HandlerRegistry::new().reply_with(Action::Heartbeat, |_| HeartbeatConf {
            current_time: chrono::DateTime::parse_from_rfc3339("2021-06-12T10:30:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        });
        let system = CentralSystem::builder(transport.clone())
            .handlers(handlers)
            .build();
        let mut rx = transport.connect("CP1");

        system.on_receive("CP1", r#"[2,"h","Heartbeat",{}]"#).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            r#"[3,"h",{"currentTime":"2021-06-12T10:30:00Z"}]"#
        );

        let disposition = system
            .on_receive("CP1", r#"[2,"b","BootNotification",{}]"#)
            .await;
        assert!(matches!(disposition, Disposition::Replied(Envelope::CallError(_))));
    }
}
