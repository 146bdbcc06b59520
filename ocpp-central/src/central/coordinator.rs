//! Outbound call coordinator
//!
//! Issues CALLs to charge points and pairs them with the CALLRESULT or
//! CALLERROR that comes back. Each awaited call owns a oneshot channel stored
//! in the pending map under `(device, message id)`.
//!
//! Exactly one of two paths settles a pending call. The resolution path
//! removes the entry and fires the channel while holding the map lock; the
//! issuer, on timeout, removes the entry under the same lock. Whoever removes
//! the entry wins. A reply that finds no entry is an orphan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{Outbox, TransportError};
use crate::config::CentralConfig;
use crate::ocpp::*;

/// Outbound call failures
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error(transparent)]
    UnknownAction(#[from] UnknownAction),

    #[error("{0} cannot be originated by the central system")]
    WrongOrigin(Action),

    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no reply from {device_id} to {message_id} within {timeout:?}")]
    CorrelationTimeout {
        device_id: String,
        message_id: String,
        timeout: Duration,
    },

    #[error("no free message id for {device_id} after {attempts} attempts")]
    CorrelationCollision { device_id: String, attempts: u32 },

    #[error("{device_id} answered {code}: {description}")]
    Remote {
        device_id: String,
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl OutboundError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, OutboundError::CorrelationTimeout { .. })
    }
}

/// Reply correlated with an outbound CALL
#[derive(Debug, Clone, PartialEq)]
pub enum CallReply {
    Result(CallResult),
    Error(CallError),
}

impl CallReply {
    pub fn message_id(&self) -> &str {
        match self {
            CallReply::Result(r) => &r.message_id,
            CallReply::Error(e) => &e.message_id,
        }
    }

    /// Payload of a CALLRESULT, or the CALLERROR as [`OutboundError::Remote`]
    pub fn into_payload(self, device_id: &str) -> Result<Value, OutboundError> {
        match self {
            CallReply::Result(r) => Ok(r.payload),
            CallReply::Error(e) => Err(OutboundError::Remote {
                device_id: device_id.to_string(),
                code: e.error_code,
                description: e.error_description,
                details: e.error_details,
            }),
        }
    }
}

/// Outcome of [`Coordinator::issue`]
#[derive(Debug, Clone, PartialEq)]
pub enum IssueOutcome {
    /// Sent without waiting for the reply
    Sent { message_id: String },
    Replied(CallReply),
}

/// What happened to an inbound CALLRESULT or CALLERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    Orphan,
}

pub type IdSource = Arc<dyn Fn() -> String + Send + Sync>;

type PendingKey = (String, String);

struct PendingCall {
    action: Action,
    issued_at: Instant,
    reply_tx: oneshot::Sender<CallReply>,
}

type PendingMap = Mutex<HashMap<PendingKey, PendingCall>>;

/// Removes its pending entry if the issuing future ends without a reply
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    key: Option<PendingKey>,
}

impl PendingGuard<'_> {
    fn take(&mut self) -> Option<PendingCall> {
        let key = self.key.take()?;
        self.pending.lock().remove(&key)
    }

    /// The resolution path already removed the entry
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.pending.lock().remove(&key);
        }
    }
}

pub struct Coordinator {
    pending: PendingMap,
    outbox: Outbox,
    ids: IdSource,
    validate_outbound: bool,
    correlation_attempts: u32,
}

impl Coordinator {
    pub fn new(outbox: Outbox, config: &CentralConfig) -> Self {
        Self::with_id_source(outbox, config, Arc::new(|| Uuid::new_v4().to_string()))
    }

    /// Coordinator drawing message ids from `ids` instead of random UUIDs
    pub fn with_id_source(outbox: Outbox, config: &CentralConfig, ids: IdSource) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            outbox,
            ids,
            validate_outbound: config.validate_outbound,
            correlation_attempts: config.correlation_attempts.max(1),
        }
    }

    /// Issue a CALL to a device.
    ///
    /// With `wait` set, suspends until the correlated reply arrives or the
    /// timeout elapses. Without it, returns once the frame is handed to the
    /// transport.
    pub async fn issue(
        &self,
        device_id: &str,
        action: &str,
        payload: Value,
        wait: Option<Duration>,
    ) -> Result<IssueOutcome, OutboundError> {
        let action = self.check(action, &payload)?;
        match wait {
            None => {
                let message_id = self.send_unawaited(device_id, action, payload)?;
                Ok(IssueOutcome::Sent { message_id })
            }
            Some(timeout) => {
                let reply = self.send_awaited(device_id, action, payload, timeout).await?;
                Ok(IssueOutcome::Replied(reply))
            }
        }
    }

    /// Issue a typed request and decode the confirmation
    pub async fn call<R: Request>(
        &self,
        device_id: &str,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, OutboundError> {
        let payload = to_payload(request)?;
        let action = self.check(R::ACTION.as_str(), &payload)?;
        let reply = self.send_awaited(device_id, action, payload, timeout).await?;
        let payload = reply.into_payload(device_id)?;
        Ok(from_payload(&payload)?)
    }

    /// Route an inbound CALLRESULT or CALLERROR to its pending call
    pub fn resolve(&self, device_id: &str, reply: CallReply) -> Resolution {
        let key = (device_id.to_string(), reply.message_id().to_string());
        let mut pending = self.pending.lock();

        match pending.remove(&key) {
            Some(call) => {
                debug!(
                    "{} reply from {} after {:?}",
                    call.action,
                    device_id,
                    call.issued_at.elapsed()
                );
                // The issuer may have been dropped; nothing to deliver then.
                let _ = call.reply_tx.send(reply);
                Resolution::Resolved
            }
            None => {
                warn!(
                    "Orphan reply {} from {}, no pending call",
                    key.1, device_id
                );
                Resolution::Orphan
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_for(&self, device_id: &str) -> usize {
        self.pending
            .lock()
            .keys()
            .filter(|(device, _)| device == device_id)
            .count()
    }

    fn check(&self, action: &str, payload: &Value) -> Result<Action, OutboundError> {
        let descriptor = ActionRegistry::resolve(action)?;
        if !descriptor.origin.allows_central_system() {
            return Err(OutboundError::WrongOrigin(descriptor.action));
        }
        if self.validate_outbound {
            descriptor.request.validate(payload)?;
        }
        Ok(descriptor.action)
    }

    fn send_unawaited(
        &self,
        device_id: &str,
        action: Action,
        payload: Value,
    ) -> Result<String, OutboundError> {
        let message_id = {
            let pending = self.pending.lock();
            self.fresh_id(device_id, |key| pending.contains_key(key))?
        };
        let call = Call::new(message_id.clone(), action, payload);
        self.outbox.send(device_id, &call.into())?;
        info!("Sent {} to {} ({})", action, device_id, message_id);
        Ok(message_id)
    }

    async fn send_awaited(
        &self,
        device_id: &str,
        action: Action,
        payload: Value,
        timeout: Duration,
    ) -> Result<CallReply, OutboundError> {
        let (reply_tx, mut reply_rx) = oneshot::channel();

        // Register before sending so a fast reply always finds its entry.
        let key = {
            let mut pending = self.pending.lock();
            let message_id = self.fresh_id(device_id, |key| pending.contains_key(key))?;
            let key = (device_id.to_string(), message_id);
            pending.insert(
                key.clone(),
                PendingCall {
                    action,
                    issued_at: Instant::now(),
                    reply_tx,
                },
            );
            key
        };
        let message_id = key.1.clone();
        let mut guard = PendingGuard {
            pending: &self.pending,
            key: Some(key),
        };

        let call = Call::new(message_id.clone(), action, payload);
        self.outbox.send(device_id, &call.into())?;
        info!("Sent {} to {} ({}), awaiting reply", action, device_id, message_id);

        match tokio::time::timeout(timeout, &mut reply_rx).await {
            Ok(Ok(reply)) => {
                guard.disarm();
                Ok(reply)
            }
            Ok(Err(_)) => Err(TransportError::ChannelClosed(device_id.to_string()).into()),
            Err(_) => {
                if guard.take().is_some() {
                    warn!(
                        "{} to {} ({}) timed out after {:?}",
                        action, device_id, message_id, timeout
                    );
                    return Err(OutboundError::CorrelationTimeout {
                        device_id: device_id.to_string(),
                        message_id,
                        timeout,
                    });
                }
                // Resolved while the timer fired; the reply is already queued.
                guard.disarm();
                reply_rx
                    .try_recv()
                    .map_err(|_| TransportError::ChannelClosed(device_id.to_string()).into())
            }
        }
    }

    fn fresh_id(
        &self,
        device_id: &str,
        taken: impl Fn(&PendingKey) -> bool,
    ) -> Result<String, OutboundError> {
        for _ in 0..self.correlation_attempts {
            let message_id = (self.ids)();
            let key = (device_id.to_string(), message_id);
            if !taken(&key) {
                return Ok(key.1);
            }
            warn!("Message id {} already pending for {}, regenerating", key.1, device_id);
        }
        Err(OutboundError::CorrelationCollision {
            device_id: device_id.to_string(),
            attempts: self.correlation_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::audit::NullAudit;
    use crate::central::transport::ChannelTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn setup(config: CentralConfig) -> (Arc<Coordinator>, Arc<ChannelTransport>) {
        let transport = Arc::new(ChannelTransport::new());
        let outbox = Outbox::new(transport.clone(), Arc::new(NullAudit));
        (Arc::new(Coordinator::new(outbox, &config)), transport)
    }

    fn sequential_ids(ids: &'static [&'static str]) -> IdSource {
        let next = AtomicUsize::new(0);
        Arc::new(move || ids[next.fetch_add(1, Ordering::SeqCst) % ids.len()].to_string())
    }

    async fn next_call(rx: &mut mpsc::UnboundedReceiver<String>) -> Call {
        let frame = rx.recv().await.expect("frame sent");
        match decode(&frame).unwrap() {
            Envelope::Call(call) => call,
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_sends_nothing() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let err = coordinator
            .issue("CP1", "Teleport", json!({}), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::UnknownAction(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wrong_origin_sends_nothing() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let err = coordinator
            .issue("CP1", "BootNotification", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::WrongOrigin(Action::BootNotification)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outbound_validation() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let _rx = transport.connect("CP1");
        let err = coordinator
            .issue("CP1", "RemoteStartTransaction", json!({"connectorId": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::Payload(_)));

        let (coordinator, transport) = setup(CentralConfig::default().with_outbound_validation(false));
        let _rx = transport.connect("CP1");
        assert_ok!(
            coordinator
                .issue("CP1", "RemoteStartTransaction", json!({"connectorId": 1}), None)
                .await
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let outcome = coordinator
            .issue("CP1", "ClearCache", json!({}), None)
            .await
            .unwrap();
        let message_id = match outcome {
            IssueOutcome::Sent { message_id } => message_id,
            other => panic!("Expected Sent, got {:?}", other),
        };
        let call = next_call(&mut rx).await;
        assert_eq!(call.message_id, message_id);
        assert_eq!(call.action, "ClearCache");
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_call() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let issuer = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .issue(
                        "CP1",
                        "Reset",
                        json!({"type": "Soft"}),
                        Some(Duration::from_secs(10)),
                    )
                    .await
            })
        };

        let call = next_call(&mut rx).await;
        assert_eq!(coordinator.pending_for("CP1"), 1);
        let reply = CallReply::Result(CallResult::new(call.message_id.clone(), json!({"status": "Accepted"})));
        assert_eq!(coordinator.resolve("CP1", reply.clone()), Resolution::Resolved);

        let outcome = issuer.await.unwrap().unwrap();
        assert_eq!(outcome, IssueOutcome::Replied(reply.clone()));
        assert_eq!(coordinator.pending_count(), 0);

        // A duplicate of the same reply is an orphan
        assert_eq!(coordinator.resolve("CP1", reply), Resolution::Orphan);
    }

    #[tokio::test]
    async fn test_reply_from_other_device_does_not_resolve() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let issuer = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .call("CP1", &ClearCacheRequest {}, Duration::from_secs(10))
                    .await
            })
        };

        let call = next_call(&mut rx).await;
        let reply = |status: &str| {
            CallReply::Result(CallResult::new(call.message_id.clone(), json!({ "status": status })))
        };
        assert_eq!(coordinator.resolve("CP2", reply("Rejected")), Resolution::Orphan);
        assert_eq!(coordinator.resolve("CP1", reply("Accepted")), Resolution::Resolved);

        let conf = assert_ok!(issuer.await.unwrap());
        assert_eq!(conf.status, ClearCacheStatus::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply_is_orphan() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let err = coordinator
            .issue("CP1", "ClearCache", json!({}), Some(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(coordinator.pending_count(), 0);

        let call = next_call(&mut rx).await;
        let late = CallReply::Result(CallResult::new(call.message_id, json!({"status": "Accepted"})));
        assert_eq!(coordinator.resolve("CP1", late), Resolution::Orphan);
    }

    #[tokio::test]
    async fn test_call_error_reply_is_remote_error() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let issuer = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .call(
                        "CP1",
                        &UnlockConnectorRequest { connector_id: 2 },
                        Duration::from_secs(10),
                    )
                    .await
            })
        };

        let call = next_call(&mut rx).await;
        coordinator.resolve(
            "CP1",
            CallReply::Error(CallError::new(call.message_id, ErrorCode::NotSupported, "no lock")),
        );

        match assert_err!(issuer.await.unwrap()) {
            OutboundError::Remote { code, description, .. } => {
                assert_eq!(code, ErrorCode::NotSupported);
                assert_eq!(description, "no lock");
            }
            other => panic!("Expected Remote, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_failure_leaves_nothing_pending() {
        let (coordinator, _transport) = setup(CentralConfig::default());
        let err = coordinator
            .issue("CP9", "ClearCache", json!({}), Some(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::Transport(TransportError::NotConnected(_))));
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_issuer_releases_pending_entry() {
        let (coordinator, transport) = setup(CentralConfig::default());
        let mut rx = transport.connect("CP1");

        let issuer = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .issue("CP1", "ClearCache", json!({}), Some(Duration::from_secs(10)))
                    .await
            })
        };
        let _ = next_call(&mut rx).await;
        assert_eq!(coordinator.pending_count(), 1);

        issuer.abort();
        let _ = issuer.await;
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_id_collision_regenerates_then_gives_up() {
        let config = CentralConfig::default().with_correlation_attempts(2);
        let transport = Arc::new(ChannelTransport::new());
        let outbox = Outbox::new(transport.clone(), Arc::new(NullAudit));
        let coordinator = Arc::new(Coordinator::with_id_source(
            outbox,
            &config,
            sequential_ids(&["a", "a", "b", "a", "b"]),
        ));
        let mut rx = transport.connect("CP1");

        // First call takes "a"
        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .issue("CP1", "ClearCache", json!({}), Some(Duration::from_secs(10)))
                    .await
            })
        };
        assert_eq!(next_call(&mut rx).await.message_id, "a");

        // Second call collides on "a", then takes "b"
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .issue("CP1", "ClearCache", json!({}), Some(Duration::from_secs(10)))
                    .await
            })
        };
        assert_eq!(next_call(&mut rx).await.message_id, "b");

        // Third call sees "a" and "b" both pending
        let err = coordinator
            .issue("CP1", "ClearCache", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::CorrelationCollision { attempts: 2, .. }));

        first.abort();
        second.abort();
    }

    #[tokio::test]
    async fn test_same_id_on_different_devices_is_not_a_collision() {
        let config = CentralConfig::default().with_correlation_attempts(1);
        let transport = Arc::new(ChannelTransport::new());
        let outbox = Outbox::new(transport.clone(), Arc::new(NullAudit));
        let coordinator = Arc::new(Coordinator::with_id_source(outbox, &config, sequential_ids(&["same"])));
        let mut rx1 = transport.connect("CP1");
        let mut rx2 = transport.connect("CP2");

        let mut issuers = Vec::new();
        for device in ["CP1", "CP2"] {
            let coordinator = coordinator.clone();
            issuers.push(tokio::spawn(async move {
                coordinator
                    .issue(device, "ClearCache", json!({}), Some(Duration::from_secs(10)))
                    .await
            }));
        }
        assert_eq!(next_call(&mut rx1).await.message_id, "same");
        assert_eq!(next_call(&mut rx2).await.message_id, "same");

        for (device, status) in [("CP2", "Rejected"), ("CP1", "Accepted")] {
            let reply = CallReply::Result(CallResult::new("same", json!({ "status": status })));
            assert_eq!(coordinator.resolve(device, reply), Resolution::Resolved);
        }

        let mut statuses = Vec::new();
        for issuer in issuers {
            match issuer.await.unwrap().unwrap() {
                IssueOutcome::Replied(CallReply::Result(r)) => statuses.push(r.payload["status"].clone()),
                other => panic!("Expected result, got {:?}", other),
            }
        }
        assert_eq!(statuses, [json!("Accepted"), json!("Rejected")]);
    }
}
