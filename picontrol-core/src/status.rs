//! Status normalization for device-local services
//!
//! Firmware and helper builds disagree on how they report liveness. The
//! recognized shapes are closed:
//!
//! | body                                   | result    |
//! |----------------------------------------|-----------|
//! | `{"online": true}`                     | `running` |
//! | `{"status": "online" \| "running"}`    | `running` |
//! | `{"online": false}`                    | `stopped` |
//! | `{"status": "offline" \| "stopped"}`   | `stopped` |
//! | anything else answered with 2xx        | `running` |
//!
//! Running indicators take precedence when a body mixes both.

use serde::{Deserialize, Serialize};

/// Two-valued status of a reachable service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizedStatus {
    Running,
    Stopped,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StatusWord {
    Online,
    Running,
    Offline,
    Stopped,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    #[serde(default)]
    online: Option<bool>,
    #[serde(default)]
    status: Option<StatusWord>,
}

impl StatusReport {
    fn normalize(&self) -> NormalizedStatus {
        let says_running =
            self.online == Some(true) || matches!(self.status, Some(StatusWord::Online | StatusWord::Running));
        let says_stopped =
            self.online == Some(false) || matches!(self.status, Some(StatusWord::Offline | StatusWord::Stopped));

        if !says_running && says_stopped {
            NormalizedStatus::Stopped
        } else {
            NormalizedStatus::Running
        }
    }
}

/// Normalize a 2xx status body. Reachability implies running unless the body
/// explicitly says otherwise.
pub fn normalize_status(body: &[u8]) -> NormalizedStatus {
    serde_json::from_slice::<StatusReport>(body)
        .map(|report| report.normalize())
        .unwrap_or(NormalizedStatus::Running)
}

/// Payload returned by status-polling endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusReply {
    Running,
    Stopped,
    /// Unreachable, timed out, or answered with an error status
    Offline { error: String },
}

impl StatusReply {
    pub fn offline(error: impl Into<String>) -> Self {
        StatusReply::Offline { error: error.into() }
    }
}

impl From<NormalizedStatus> for StatusReply {
    fn from(status: NormalizedStatus) -> Self {
        match status {
            NormalizedStatus::Running => StatusReply::Running,
            NormalizedStatus::Stopped => StatusReply::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(value: serde_json::Value) -> NormalizedStatus {
        normalize_status(value.to_string().as_bytes())
    }

    #[test]
    fn test_running_shapes() {
        assert_eq!(normalize(json!({ "online": true })), NormalizedStatus::Running);
        assert_eq!(normalize(json!({ "status": "online" })), NormalizedStatus::Running);
        assert_eq!(normalize(json!({ "status": "running", "distribution": "debian" })), NormalizedStatus::Running);
    }

    #[test]
    fn test_stopped_shapes() {
        assert_eq!(normalize(json!({ "online": false })), NormalizedStatus::Stopped);
        assert_eq!(normalize(json!({ "status": "offline" })), NormalizedStatus::Stopped);
        assert_eq!(normalize(json!({ "status": "stopped" })), NormalizedStatus::Stopped);
    }

    #[test]
    fn test_unrecognized_defaults_to_running() {
        assert_eq!(normalize(json!({ "uptime": 42 })), NormalizedStatus::Running);
        assert_eq!(normalize(json!({ "status": "booting" })), NormalizedStatus::Running);
        assert_eq!(normalize(json!({ "online": "yes" })), NormalizedStatus::Running);
        assert_eq!(normalize(json!([1, 2, 3])), NormalizedStatus::Running);
        assert_eq!(normalize_status(b"OK"), NormalizedStatus::Running);
        assert_eq!(normalize_status(b""), NormalizedStatus::Running);
    }

    #[test]
    fn test_running_wins_on_mixed_body() {
        assert_eq!(normalize(json!({ "online": false, "status": "running" })), NormalizedStatus::Running);
        assert_eq!(normalize(json!({ "online": true, "status": "stopped" })), NormalizedStatus::Running);
    }

    #[test]
    fn test_reply_serialization() {
        assert_eq!(serde_json::to_value(StatusReply::Running).unwrap(), json!({ "status": "running" }));
        assert_eq!(serde_json::to_value(StatusReply::Stopped).unwrap(), json!({ "status": "stopped" }));
        assert_eq!(
            serde_json::to_value(StatusReply::offline("Device unreachable")).unwrap(),
            json!({ "status": "offline", "error": "Device unreachable" })
        );
    }
}
