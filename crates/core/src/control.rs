use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::task::{Direction, NewTransfer};

pub const METHOD_SUBMIT: &str = "transfers.submit";
pub const METHOD_CANCEL: &str = "transfers.cancel";
pub const METHOD_REMOVE: &str = "transfers.remove";
pub const METHOD_RESUBMIT: &str = "transfers.resubmit";
pub const METHOD_GET: &str = "transfers.get";
pub const METHOD_LIST: &str = "transfers.list";
pub const METHOD_CLEAR_FINISHED: &str = "transfers.clearFinished";

pub fn control_ipc_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc").join("control.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ControlError {
    pub fn unavailable(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new("control.unavailable", message, true, details)
    }

    pub fn timeout(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new("control.timeout", message, true, details)
    }

    pub fn invalid_request(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new("control.invalid_request", message, false, details)
    }

    pub fn method_not_found(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new("control.method_not_found", message, false, details)
    }

    fn new(
        code: &str,
        message: impl Into<String>,
        retryable: bool,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable,
            details,
        }
    }
}

impl From<&Error> for ControlError {
    fn from(e: &Error) -> Self {
        let (code, retryable, details) = match e {
            Error::Validation { .. } => ("transfer.validation", false, serde_json::Value::Null),
            Error::Conflict { .. } => ("transfer.conflict", false, serde_json::Value::Null),
            Error::NotFound { id } => ("transfer.not_found", false, serde_json::json!({ "id": id })),
            Error::InvalidState { id, status } => (
                "transfer.invalid_state",
                false,
                serde_json::json!({ "id": id, "status": status }),
            ),
            Error::SchedulerClosed => ("control.unavailable", true, serde_json::Value::Null),
            Error::InvalidConfig { .. } => ("config.invalid", false, serde_json::Value::Null),
            other => (other.class().code(), other.is_transient(), serde_json::Value::Null),
        };
        Self::new(code, e.to_string(), retryable, details)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ControlRequest {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            type_: "control.request".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ControlError) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

pub type SubmitParams = NewTransfer;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// Both directions when absent.
    #[serde(default)]
    pub direction: Option<Direction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearFinishedParams {
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearFinishedResult {
    pub removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TransferStatus;

    #[test]
    fn submit_params_accept_camel_case() {
        let p: SubmitParams = serde_json::from_value(serde_json::json!({
            "direction": "download",
            "localPath": "/tmp/a.bin",
            "remoteRef": "obj-1",
            "fileSize": 12
        }))
        .unwrap();
        assert_eq!(p.direction, Direction::Download);
        assert_eq!(p.remote_ref.as_deref(), Some("obj-1"));
        assert_eq!(p.file_size, Some(12));
    }

    #[test]
    fn list_params_default_to_all_directions() {
        let p: ListParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(p.direction.is_none());
    }

    #[test]
    fn core_errors_map_to_stable_codes() {
        let e = Error::InvalidState {
            id: "xfr_1".to_string(),
            status: TransferStatus::Running,
        };
        let c = ControlError::from(&e);
        assert_eq!(c.code, "transfer.invalid_state");
        assert_eq!(c.details["status"], "running");

        let c = ControlError::from(&Error::SchedulerClosed);
        assert!(c.retryable);
    }

    #[test]
    fn response_omits_empty_fields() {
        let v = serde_json::to_value(ControlResponse::ok("r1", serde_json::json!([]))).unwrap();
        assert_eq!(v["type"], "control.response");
        assert!(v.get("error").is_none());
    }
}
