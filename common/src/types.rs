use chrono::NaiveDate;
use serde::Serialize;

use crate::{error::FetchError, history::FormRecord};

/// Body of `/api/form` and `/api/history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiResponse {
    #[serde(skip)]
    pub status: u16,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: 200,
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(err: &FetchError) -> Self {
        Self {
            status: err.http_status(),
            success: false,
            message: None,
            error: Some(err.user_message().to_string()),
        }
    }
}

/// Read-only snapshot handed to the page renderer.
#[derive(Debug, Clone)]
pub struct DashboardView {
    pub current: Option<FormRecord>,
    pub history: Vec<FormRecord>,
    pub schedule_time: String,
    pub utc_offset: String,
    pub athlete_id: String,
    pub api_key_set: bool,
    pub last_scheduled_fetch: Option<NaiveDate>,
    pub time_synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_message_or_error_only() {
        let ok = serde_json::to_string(&ApiResponse::ok("Loaded 3 days")).unwrap();
        assert_eq!(ok, r#"{"success":true,"message":"Loaded 3 days"}"#);

        let failed = serde_json::to_string(&ApiResponse::failed(&FetchError::Transport(
            "tls handshake".to_string(),
        )))
        .unwrap();
        assert_eq!(
            failed,
            r#"{"success":false,"error":"Failed to reach the analytics service"}"#
        );
    }
}
