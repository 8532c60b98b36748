//! Wire types for the replication transport: one JSON line per request,
//! one JSON line per non-streaming response, opaque bytes for the rest.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const ALPN: &[u8] = b"sylve-repl-v1";
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Snapshots,
    Datasets,
    Status,
    Receive,
    Send,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub action: Action,
    pub token: String,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub base_snapshot: Option<String>,
    #[serde(default)]
    pub target_snapshot: Option<String>,
    #[serde(default)]
    pub with_intermediates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub name: String,
    pub guid: String,
    pub createtxg: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    pub guid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub creation: i64,
    pub used: u64,
    pub refer: u64,
    pub avail: u64,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub direction: String,
    pub job_id: Option<u64>,
    pub remote_address: String,
    pub source_dataset: String,
    pub destination_dataset: String,
    pub base_snapshot: Option<String>,
    pub target_snapshot: String,
    pub mode: String,
    pub status: String,
    pub error: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub snapshots: Option<Vec<SnapshotEntry>>,
    #[serde(default)]
    pub datasets: Option<Vec<DatasetEntry>>,
    #[serde(default)]
    pub events: Option<Vec<EventEntry>>,
    #[serde(default)]
    pub target_snapshot: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Clamp `status`'s `limit` field to `[1, 500]`, defaulting to 50.
pub fn clamp_status_limit(limit: Option<u32>) -> usize {
    limit.unwrap_or(50).clamp(1, 500) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = Request {
            version: 1,
            action: Action::Send,
            token: "tok".into(),
            dataset: Some("tank/x".into()),
            prefix: None,
            limit: None,
            force: false,
            base_snapshot: Some("t1".into()),
            target_snapshot: None,
            with_intermediates: false,
        };
        let line = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back.dataset.as_deref(), Some("tank/x"));
        assert!(matches!(back.action, Action::Send));
    }

    #[test]
    fn status_limit_is_clamped() {
        assert_eq!(clamp_status_limit(None), 50);
        assert_eq!(clamp_status_limit(Some(0)), 1);
        assert_eq!(clamp_status_limit(Some(10_000)), 500);
        assert_eq!(clamp_status_limit(Some(10)), 10);
    }

    #[test]
    fn error_response_is_not_ok() {
        let resp = Response::err("boom");
        assert!(!resp.ok);
        assert_eq!(resp.error.as_deref(), Some("boom"));
    }
}
