//! OCPP 1.6 action registry
//!
//! The closed vocabulary accepted in the `action` field of a CALL. Every
//! action carries a descriptor naming who may originate it and the payload
//! shapes of its request and confirmation.
//!
//! The registry is a static table: it is built at compile time, never
//! mutated, and can be read from any number of connections without locking.

use serde_json::Value;
use thiserror::Error;

use super::payload::{check_shape, PayloadError};
use super::requests::*;

/// Lookup failure for an action name outside the registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown OCPP action: {0}")]
pub struct UnknownAction(pub String);

/// OCPP 1.6 action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Authorize,
    BootNotification,
    CancelReservation,
    ChangeAvailability,
    ChangeConfiguration,
    ClearCache,
    ClearChargingProfile,
    DataTransfer,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,
    GetCompositeSchedule,
    GetConfiguration,
    GetDiagnostics,
    GetLocalListVersion,
    Heartbeat,
    MeterValues,
    RemoteStartTransaction,
    RemoteStopTransaction,
    ReserveNow,
    Reset,
    SendLocalList,
    SetChargingProfile,
    StartTransaction,
    StatusNotification,
    StopTransaction,
    TriggerMessage,
    UnlockConnector,
    UpdateFirmware,
}

impl Action {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::CancelReservation => "CancelReservation",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::ClearCache => "ClearCache",
            Action::ClearChargingProfile => "ClearChargingProfile",
            Action::DataTransfer => "DataTransfer",
            Action::DiagnosticsStatusNotification => "DiagnosticsStatusNotification",
            Action::FirmwareStatusNotification => "FirmwareStatusNotification",
            Action::GetCompositeSchedule => "GetCompositeSchedule",
            Action::GetConfiguration => "GetConfiguration",
            Action::GetDiagnostics => "GetDiagnostics",
            Action::GetLocalListVersion => "GetLocalListVersion",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::ReserveNow => "ReserveNow",
            Action::Reset => "Reset",
            Action::SendLocalList => "SendLocalList",
            Action::SetChargingProfile => "SetChargingProfile",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
            Action::TriggerMessage => "TriggerMessage",
            Action::UnlockConnector => "UnlockConnector",
            Action::UpdateFirmware => "UpdateFirmware",
        }
    }

    /// Registry entry for this action
    pub fn descriptor(self) -> &'static ActionDescriptor {
        // The table is declared in enum order.
        &DESCRIPTORS[self as usize]
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionRegistry::resolve(s).map(|d| d.action)
    }
}

/// Which side of the connection may send a CALL for an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    ChargePoint,
    CentralSystem,
    Both,
}

impl Origin {
    pub fn allows_charge_point(self) -> bool {
        matches!(self, Origin::ChargePoint | Origin::Both)
    }

    pub fn allows_central_system(self) -> bool {
        matches!(self, Origin::CentralSystem | Origin::Both)
    }
}

/// Shape of a request or confirmation body
#[derive(Clone, Copy, PartialEq)]
pub struct PayloadShape {
    /// Rust type the shape is derived from
    pub name: &'static str,
    check: fn(&Value) -> Result<(), PayloadError>,
}

impl PayloadShape {
    /// Check a raw payload against this shape
    pub fn validate(&self, raw: &Value) -> Result<(), PayloadError> {
        (self.check)(raw)
    }
}

impl std::fmt::Debug for PayloadShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PayloadShape").field(&self.name).finish()
    }
}

/// Registry entry for one action
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionDescriptor {
    pub action: Action,
    pub origin: Origin,
    pub request: PayloadShape,
    pub response: PayloadShape,
}

macro_rules! descriptor {
    ($action:ident, $origin:ident, $req:ty, $conf:ty) => {
        ActionDescriptor {
            action: Action::$action,
            origin: Origin::$origin,
            request: PayloadShape {
                name: stringify!($req),
                check: check_shape::<$req>,
            },
            response: PayloadShape {
                name: stringify!($conf),
                check: check_shape::<$conf>,
            },
        }
    };
}

static DESCRIPTORS: [ActionDescriptor; 28] = [
    descriptor!(Authorize, ChargePoint, AuthorizeRequest, AuthorizeConf),
    descriptor!(BootNotification, ChargePoint, BootNotificationRequest, BootNotificationConf),
    descriptor!(CancelReservation, CentralSystem, CancelReservationRequest, CancelReservationConf),
    descriptor!(ChangeAvailability, CentralSystem, ChangeAvailabilityRequest, ChangeAvailabilityConf),
    descriptor!(ChangeConfiguration, CentralSystem, ChangeConfigurationRequest, ChangeConfigurationConf),
    descriptor!(ClearCache, CentralSystem, ClearCacheRequest, ClearCacheConf),
    descriptor!(ClearChargingProfile, CentralSystem, ClearChargingProfileRequest, ClearChargingProfileConf),
    descriptor!(DataTransfer, Both, DataTransferRequest, DataTransferConf),
    descriptor!(
        DiagnosticsStatusNotification,
        ChargePoint,
        DiagnosticsStatusNotificationRequest,
        DiagnosticsStatusNotificationConf
    ),
    descriptor!(
        FirmwareStatusNotification,
        ChargePoint,
        FirmwareStatusNotificationRequest,
        FirmwareStatusNotificationConf
    ),
    descriptor!(GetCompositeSchedule, CentralSystem, GetCompositeScheduleRequest, GetCompositeScheduleConf),
    descriptor!(GetConfiguration, CentralSystem, GetConfigurationRequest, GetConfigurationConf),
    descriptor!(GetDiagnostics, CentralSystem, GetDiagnosticsRequest, GetDiagnosticsConf),
    descriptor!(GetLocalListVersion, CentralSystem, GetLocalListVersionRequest, GetLocalListVersionConf),
    descriptor!(Heartbeat, ChargePoint, HeartbeatRequest, HeartbeatConf),
    descriptor!(MeterValues, ChargePoint, MeterValuesRequest, MeterValuesConf),
    descriptor!(
        RemoteStartTransaction,
        CentralSystem,
        RemoteStartTransactionRequest,
        RemoteStartTransactionConf
    ),
    descriptor!(
        RemoteStopTransaction,
        CentralSystem,
        RemoteStopTransactionRequest,
        RemoteStopTransactionConf
    ),
    descriptor!(ReserveNow, CentralSystem, ReserveNowRequest, ReserveNowConf),
    descriptor!(Reset, CentralSystem, ResetRequest, ResetConf),
    descriptor!(SendLocalList, CentralSystem, SendLocalListRequest, SendLocalListConf),
    descriptor!(SetChargingProfile, CentralSystem, SetChargingProfileRequest, SetChargingProfileConf),
    descriptor!(StartTransaction, ChargePoint, StartTransactionRequest, StartTransactionConf),
    descriptor!(StatusNotification, ChargePoint, StatusNotificationRequest, StatusNotificationConf),
    descriptor!(StopTransaction, ChargePoint, StopTransactionRequest, StopTransactionConf),
    descriptor!(TriggerMessage, CentralSystem, TriggerMessageRequest, TriggerMessageConf),
    descriptor!(UnlockConnector, CentralSystem, UnlockConnectorRequest, UnlockConnectorConf),
    descriptor!(UpdateFirmware, CentralSystem, UpdateFirmwareRequest, UpdateFirmwareConf),
];

/// Read-only view over the action table
pub struct ActionRegistry;

impl ActionRegistry {
    /// Resolve a wire action name to its descriptor
    pub fn resolve(name: &str) -> Result<&'static ActionDescriptor, UnknownAction> {
        DESCRIPTORS
            .iter()
            .find(|d| d.action.as_str() == name)
            .ok_or_else(|| UnknownAction(name.to_string()))
    }

    /// All registered actions
    pub fn iter() -> impl Iterator<Item = &'static ActionDescriptor> {
        DESCRIPTORS.iter()
    }

    pub fn len() -> usize {
        DESCRIPTORS.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_matches_enum_order() {
        for (i, d) in ActionRegistry::iter().enumerate() {
            assert_eq!(d.action as usize, i, "descriptor for {} out of order", d.action);
            assert_eq!(d.action.descriptor().action, d.action);
        }
        assert_eq!(ActionRegistry::len(), 28);
    }

    #[test]
    fn test_resolve() {
        let d = ActionRegistry::resolve("BootNotification").unwrap();
        assert_eq!(d.action, Action::BootNotification);
        assert_eq!(d.origin, Origin::ChargePoint);

        let d = ActionRegistry::resolve("RemoteStartTransaction").unwrap();
        assert!(d.origin.allows_central_system());
        assert!(!d.origin.allows_charge_point());

        assert_eq!(
            ActionRegistry::resolve("Teleport"),
            Err(UnknownAction("Teleport".to_string()))
        );
        // Names are case sensitive
        assert!(ActionRegistry::resolve("heartbeat").is_err());
    }

    #[test]
    fn test_action_round_trips_through_name() {
        for d in ActionRegistry::iter() {
            let parsed: Action = d.action.to_string().parse().unwrap();
            assert_eq!(parsed, d.action);
        }
    }

    #[test]
    fn test_data_transfer_is_bidirectional() {
        let origin = Action::DataTransfer.descriptor().origin;
        assert!(origin.allows_charge_point());
        assert!(origin.allows_central_system());
    }

    #[test]
    fn test_shape_validation() {
        let shape = Action::RemoteStartTransaction.descriptor().request;
        assert!(shape
            .validate(&json!({"idTag": {"IdToken": "abc"}, "connectorId": 1}))
            .is_ok());
        assert!(shape.validate(&json!({"connectorId": 1})).is_err());

        let shape = Action::Heartbeat.descriptor().response;
        assert!(shape.validate(&json!({"currentTime": "2021-06-12T10:00:00Z"})).is_ok());
        assert!(shape.validate(&json!({"currentTime": 5})).is_err());
    }
}
