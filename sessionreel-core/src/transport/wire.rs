//! Request and response bodies for the collector API
//!
//! Field names are camelCase on the wire. Optional fields are omitted rather
//! than sent as `null`. All timestamps are milliseconds since the UNIX epoch.
//!
//! | Endpoint | Body |
//! |----------|------|
//! | `POST /api/sessions/start` | [`SessionStartRequest`] |
//! | `POST /api/ingest` | [`IngestRequest`] |
//! | `POST /api/sessions/heartbeat` | [`HeartbeatRequest`] |
//! | `POST /api/sessions/end` | [`SessionEndRequest`] |

use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, EventBatch, PageContext};

pub const SESSION_START_PATH: &str = "/api/sessions/start";
pub const INGEST_PATH: &str = "/api/ingest";
pub const HEARTBEAT_PATH: &str = "/api/sessions/heartbeat";
pub const SESSION_END_PATH: &str = "/api/sessions/end";

/// Body for `POST /api/ingest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub session_id: String,
    pub events: EventBatch,
    pub timestamp: i64,
}

/// Response from `POST /api/ingest`
#[derive(Debug, Clone, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub events_received: usize,
}

/// Body for `POST /api/sessions/start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartRequest {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub metadata: SessionMetadata,
}

/// Page description sent with a session start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub user_agent: String,
    pub screen: Dimensions,
    pub viewport: Dimensions,
    pub timestamp: i64,
}

impl SessionMetadata {
    pub fn from_page(page: &PageContext, timestamp: i64) -> Self {
        Self {
            url: page.url.clone(),
            referrer: page.referrer.clone(),
            user_agent: page.user_agent.clone(),
            screen: page.screen,
            viewport: page.viewport,
            timestamp,
        }
    }
}

/// Body for `POST /api/sessions/heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub session_id: String,
    pub timestamp: i64,
    pub event_count: u64,
}

/// Body for `POST /api/sessions/end` (sent as a beacon)
///
/// `api_key` is only filled in by the transport, because the beacon
/// primitive can't carry headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndRequest {
    pub session_id: String,
    pub reason: String,
    pub timestamp: i64,
    pub final_event_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ingest_request_shape() {
        let request = IngestRequest {
            session_id: "session_1_abc".to_string(),
            events: vec![json!({"type": 2, "timestamp": 5})],
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(
            value,
            json!({
                "sessionId": "session_1_abc",
                "events": [{"type": 2, "timestamp": 5}],
                "timestamp": 1_700_000_000_000_i64,
            })
        );
    }

    #[test]
    fn test_session_start_omits_missing_user() {
        let page = PageContext {
            url: "https://shop.example/cart".to_string(),
            referrer: None,
            user_agent: "test-agent".to_string(),
            screen: Dimensions {
                width: 1920,
                height: 1080,
            },
            viewport: Dimensions {
                width: 1280,
                height: 720,
            },
        };
        let request = SessionStartRequest {
            session_id: "session_1_abc".to_string(),
            user_id: None,
            user_email: None,
            metadata: SessionMetadata::from_page(&page, 10),
        };
        let value = serde_json::to_value(&request).unwrap();

        assert!(value.get("userId").is_none());
        assert!(value.get("userEmail").is_none());
        assert!(value["metadata"].get("referrer").is_none());
        assert_eq!(value["metadata"]["userAgent"], "test-agent");
        assert_eq!(value["metadata"]["screen"]["width"], 1920);
        assert_eq!(value["metadata"]["viewport"]["height"], 720);
        assert_eq!(value["metadata"]["timestamp"], 10);
    }

    #[test]
    fn test_session_end_request_shape() {
        let request = SessionEndRequest {
            session_id: "session_1_abc".to_string(),
            reason: "pagehide".to_string(),
            timestamp: 99,
            final_event_count: 12,
            api_key: None,
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["finalEventCount"], 12);
        assert_eq!(value["reason"], "pagehide");
        assert!(value.get("apiKey").is_none());
    }
}
