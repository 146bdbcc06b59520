//! Request and confirmation bodies for every OCPP 1.6 action
//!
//! Each request type implements [`Request`], which binds it to its action
//! and its confirmation type. Field order follows the protocol tables and is
//! kept on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actions::Action;
use super::payload::Request;
use super::types::*;

macro_rules! bind_request {
    ($($req:ty => $conf:ty, $action:ident;)*) => {
        $(
            impl Request for $req {
                const ACTION: Action = Action::$action;
                type Response = $conf;
            }
        )*
    };
}

bind_request! {
    AuthorizeRequest => AuthorizeConf, Authorize;
    BootNotificationRequest => BootNotificationConf, BootNotification;
    CancelReservationRequest => CancelReservationConf, CancelReservation;
    ChangeAvailabilityRequest => ChangeAvailabilityConf, ChangeAvailability;
    ChangeConfigurationRequest => ChangeConfigurationConf, ChangeConfiguration;
    ClearCacheRequest => ClearCacheConf, ClearCache;
    ClearChargingProfileRequest => ClearChargingProfileConf, ClearChargingProfile;
    DataTransferRequest => DataTransferConf, DataTransfer;
    DiagnosticsStatusNotificationRequest => DiagnosticsStatusNotificationConf, DiagnosticsStatusNotification;
    FirmwareStatusNotificationRequest => FirmwareStatusNotificationConf, FirmwareStatusNotification;
    GetCompositeScheduleRequest => GetCompositeScheduleConf, GetCompositeSchedule;
    GetConfigurationRequest => GetConfigurationConf, GetConfiguration;
    GetDiagnosticsRequest => GetDiagnosticsConf, GetDiagnostics;
    GetLocalListVersionRequest => GetLocalListVersionConf, GetLocalListVersion;
    HeartbeatRequest => HeartbeatConf, Heartbeat;
    MeterValuesRequest => MeterValuesConf, MeterValues;
    RemoteStartTransactionRequest => RemoteStartTransactionConf, RemoteStartTransaction;
    RemoteStopTransactionRequest => RemoteStopTransactionConf, RemoteStopTransaction;
    ReserveNowRequest => ReserveNowConf, ReserveNow;
    ResetRequest => ResetConf, Reset;
    SendLocalListRequest => SendLocalListConf, SendLocalList;
    SetChargingProfileRequest => SetChargingProfileConf, SetChargingProfile;
    StartTransactionRequest => StartTransactionConf, StartTransaction;
    StatusNotificationRequest => StatusNotificationConf, StatusNotification;
    StopTransactionRequest => StopTransactionConf, StopTransaction;
    TriggerMessageRequest => TriggerMessageConf, TriggerMessage;
    UnlockConnectorRequest => UnlockConnectorConf, UnlockConnector;
    UpdateFirmwareRequest => UpdateFirmwareConf, UpdateFirmware;
}

// ============================================================================
// Charge point -> central system
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: IdToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeConf {
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

impl BootNotificationRequest {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            charge_point_vendor: vendor.into(),
            charge_point_model: model.into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: None,
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationConf {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
}

/// Vendor-specific exchange, valid in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    pub message_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferConf {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationRequest {
    pub status: DiagnosticsStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationConf {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareStatusNotificationRequest {
    pub status: FirmwareStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareStatusNotificationConf {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConf {
    pub current_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterValuesConf {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: i32,
    pub id_tag: IdToken,
    pub meter_start: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionConf {
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: i32,
    pub error_code: ChargePointErrorCode,
    pub status: ChargePointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_error_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotificationConf {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<IdToken>,
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_data: Option<Vec<MeterValue>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

// ============================================================================
// Central system -> charge point
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationRequest {
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReservationConf {
    pub status: CancelReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    pub connector_id: i32,
    #[serde(rename = "type")]
    pub kind: AvailabilityType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAvailabilityConf {
    pub status: AvailabilityStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConfigurationConf {
    pub status: ConfigurationStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCacheRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCacheConf {
    pub status: ClearCacheStatus,
}

/// All filters are optional; an empty request clears every profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearChargingProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile_purpose: Option<ChargingProfilePurposeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearChargingProfileConf {
    pub status: ClearChargingProfileStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleRequest {
    pub connector_id: i32,
    pub duration: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_rate_unit: Option<ChargingRateUnitType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleConf {
    pub status: GetCompositeScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_schedule: Option<ChargingSchedule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetConfigurationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_key: Option<Vec<KeyValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_key: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsRequest {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLocalListVersionRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLocalListVersionConf {
    pub list_version: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    pub id_tag: IdToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<ChargingProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
}

impl RemoteStartTransactionRequest {
    pub fn new(id_tag: IdToken) -> Self {
        Self {
            id_tag,
            charging_profile: None,
            connector_id: None,
        }
    }

    pub fn with_connector(mut self, connector_id: i32) -> Self {
        self.connector_id = Some(connector_id);
        self
    }

    pub fn with_profile(mut self, profile: ChargingProfile) -> Self {
        self.charging_profile = Some(profile);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStartTransactionConf {
    pub status: RemoteStartStopStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStopTransactionConf {
    pub status: RemoteStartStopStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveNowRequest {
    pub connector_id: i32,
    pub expiry_date: DateTime<Utc>,
    pub id_tag: IdToken,
    pub reservation_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<IdToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveNowConf {
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetConf {
    pub status: ResetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLocalListRequest {
    pub list_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_authorization_list: Option<Vec<AuthorizationData>>,
    pub update_type: UpdateType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLocalListConf {
    pub status: UpdateStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub connector_id: i32,
    pub cs_charging_profiles: ChargingProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetChargingProfileConf {
    pub status: ChargingProfileStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessageRequest {
    pub requested_message: MessageTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMessageConf {
    pub status: TriggerMessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockConnectorConf {
    pub status: UnlockStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFirmwareRequest {
    pub location: String,
    pub retrieve_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFirmwareConf {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::payload::{from_payload, to_payload};
    use serde_json::json;

    #[test]
    fn test_request_bindings() {
        assert_eq!(<RemoteStartTransactionRequest as Request>::ACTION, Action::RemoteStartTransaction);
        assert_eq!(<HeartbeatRequest as Request>::ACTION, Action::Heartbeat);
        assert_eq!(<ResetRequest as Request>::ACTION, Action::Reset);
    }

    #[test]
    fn test_type_keyword_fields() {
        let value = to_payload(&ChangeAvailabilityRequest {
            connector_id: 0,
            kind: AvailabilityType::Inoperative,
        })
        .unwrap();
        assert_eq!(value, json!({"connectorId": 0, "type": "Inoperative"}));

        let reset: ResetRequest = from_payload(&json!({"type": "Soft"})).unwrap();
        assert_eq!(reset.kind, ResetType::Soft);
    }

    #[test]
    fn test_empty_bodies() {
        assert_eq!(to_payload(&HeartbeatRequest {}).unwrap(), json!({}));
        assert_eq!(to_payload(&ClearChargingProfileRequest::default()).unwrap(), json!({}));
        assert_eq!(to_payload(&StopTransactionConf::default()).unwrap(), json!({}));
    }

    #[test]
    fn test_status_notification_parsing() {
        let req: StatusNotificationRequest = from_payload(&json!({
            "connectorId": 1,
            "errorCode": "NoError",
            "status": "SuspendedEVSE",
            "timestamp": "2021-06-12T10:30:00Z"
        }))
        .unwrap();
        assert_eq!(req.status, ChargePointStatus::SuspendedEVSE);
        assert_eq!(req.error_code, ChargePointErrorCode::NoError);
        assert!(req.info.is_none());
    }

    #[test]
    fn test_boot_notification_requires_vendor_and_model() {
        assert!(from_payload::<BootNotificationRequest>(&json!({"chargePointVendor": "EK"})).is_err());

        let req: BootNotificationRequest = from_payload(&json!({
            "chargePointVendor": "EK",
            "chargePointModel": "EK3",
            "firmwareVersion": "0.1.0"
        }))
        .unwrap();
        assert_eq!(req.firmware_version.as_deref(), Some("0.1.0"));
        assert_eq!(req, {
            let mut expected = BootNotificationRequest::new("EK", "EK3");
            expected.firmware_version = Some("0.1.0".to_string());
            expected
        });
    }

    #[test]
    fn test_set_charging_profile_wire_form() {
        let raw = json!({
            "connectorId": 1,
            "csChargingProfiles": {
                "chargingProfileId": 7,
                "stackLevel": 0,
                "chargingProfilePurpose": "TxDefaultProfile",
                "chargingProfileKind": "Absolute",
                "chargingSchedule": {
                    "chargingRateUnit": "A",
                    "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 16.0}]
                }
            }
        });
        let req: SetChargingProfileRequest = from_payload(&raw).unwrap();
        assert_eq!(req.cs_charging_profiles.charging_profile_id, 7);
        assert_eq!(to_payload(&req).unwrap(), raw);
    }
}
