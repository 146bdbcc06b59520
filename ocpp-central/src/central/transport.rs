//! Transport seam
//!
//! The engine never owns sockets. It hands encoded frames to a [`Transport`]
//! and is fed inbound frames by whoever owns the connection.
//!
//! [`ChannelTransport`] keeps one unbounded channel per connected device; a
//! WebSocket layer drains the receiver returned by
//! [`ChannelTransport::connect`] into the socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::audit::{AuditRecord, AuditSink, Direction};
use crate::ocpp::Envelope;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("channel to device {0} is closed")]
    ChannelClosed(String),
}

/// Outbound frame delivery
pub trait Transport: Send + Sync {
    fn send(&self, device_id: &str, frame: String) -> Result<(), TransportError>;
}

/// In-process transport backed by tokio channels
#[derive(Debug, Default)]
pub struct ChannelTransport {
    devices: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return the stream of frames addressed to it.
    ///
    /// Connecting an id that is already connected replaces the old channel.
    pub fn connect(&self, device_id: impl Into<String>) -> mpsc::UnboundedReceiver<String> {
        let device_id = device_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if self.devices.write().insert(device_id.clone(), tx).is_some() {
            warn!("Device {} reconnected, replacing previous channel", device_id);
        } else {
            info!("Device {} connected", device_id);
        }
        rx
    }

    pub fn disconnect(&self, device_id: &str) -> bool {
        let removed = self.devices.write().remove(device_id).is_some();
        if removed {
            info!("Device {} disconnected", device_id);
        }
        removed
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.devices.read().contains_key(device_id)
    }

    pub fn connected(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, device_id: &str, frame: String) -> Result<(), TransportError> {
        let devices = self.devices.read();
        let tx = devices
            .get(device_id)
            .ok_or_else(|| TransportError::NotConnected(device_id.to_string()))?;
        tx.send(frame)
            .map_err(|_| TransportError::ChannelClosed(device_id.to_string()))
    }
}

/// Encodes, audits and delivers outbound envelopes
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn Transport>,
    audit: Arc<dyn AuditSink>,
}

impl Outbox {
    pub fn new(transport: Arc<dyn Transport>, audit: Arc<dyn AuditSink>) -> Self {
        Self { transport, audit }
    }

    pub fn send(&self, device_id: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = envelope.encode();
        debug!("-> {}: {}", device_id, frame);
        self.transport.send(device_id, frame)?;
        self.audit(Direction::CentralToChargePoint, device_id, envelope);
        Ok(())
    }

    /// Offer a frame to the audit sink, logging failures
    pub fn audit(&self, direction: Direction, device_id: &str, envelope: &Envelope) {
        let record = AuditRecord::new(direction, device_id, envelope.clone());
        if let Err(e) = self.audit.record(&record) {
            warn!("Audit sink rejected {} frame: {}", device_id, e);
        }
    }
}
