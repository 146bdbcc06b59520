//! Envelope audit trail
//!
//! Every frame that crosses the engine boundary is offered to an
//! [`AuditSink`]. Recording is fire-and-forget: a failing sink is logged and
//! never changes what is sent to a charge point.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::ocpp::{Envelope, MessageType};

/// Which way a frame travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ChargePointToCentral,
    CentralToChargePoint,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ChargePointToCentral => Direction::CentralToChargePoint,
            Direction::CentralToChargePoint => Direction::ChargePointToCentral,
        }
    }
}

/// One audited frame
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub direction: Direction,
    pub device_id: String,
    pub envelope: Envelope,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(direction: Direction, device_id: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            direction,
            device_id: device_id.into(),
            envelope,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Persistence hook for audited frames
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Sink that writes each frame to the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let arrow = match record.direction {
            Direction::ChargePointToCentral => "<-",
            Direction::CentralToChargePoint => "->",
        };
        debug!(
            "audit {} {} {}",
            arrow,
            record.device_id,
            record.envelope.encode()
        );
        Ok(())
    }
}

/// A CALL and the reply it received, if any
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub call: AuditRecord,
    pub reply: Option<AuditRecord>,
}

/// In-memory sink that keeps every record
#[derive(Debug, Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records in arrival order
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Pair each CALL with the first reply carrying its message id.
    ///
    /// A reply pairs only with a CALL from the same device that travelled the
    /// opposite way. Record order does not matter: a reply recorded before
    /// its CALL still pairs. Replies with no matching CALL are left out.
    pub fn exchanges(&self) -> Vec<Exchange> {
        let records = self.records.lock();
        let mut exchanges: Vec<Exchange> = records
            .iter()
            .filter(|r| r.envelope.message_type() == MessageType::Call)
            .map(|call| Exchange {
                call: call.clone(),
                reply: None,
            })
            .collect();

        let replies = records
            .iter()
            .filter(|r| r.envelope.message_type() != MessageType::Call);
        for reply in replies {
            let open = exchanges.iter_mut().find(|ex| {
                ex.reply.is_none()
                    && ex.call.device_id == reply.device_id
                    && ex.call.direction == reply.direction.reverse()
                    && ex.call.envelope.message_id() == reply.envelope.message_id()
            });
            if let Some(ex) = open {
                ex.reply = Some(reply.clone());
            }
        }

        exchanges
    }

    /// Exchanges involving one device
    pub fn exchanges_for(&self, device_id: &str) -> Vec<Exchange> {
        self.exchanges()
            .into_iter()
            .filter(|ex| ex.call.device_id == device_id)
            .collect()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
