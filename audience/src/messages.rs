//! Queue message payloads.
//!
//! Both messages are JSON documents. Tasks flow from the scheduler to the workers, change
//! messages flow from the workers to downstream integration services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audience_error;
use crate::error::{AudienceResult, ErrorKind};
use crate::filter::AudienceFilter;
use crate::types::{AudienceId, RequestId};

/// Request to reconcile one audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationTask {
    pub audience_id: AudienceId,
    /// When the task was issued.
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationTask {
    pub fn new(audience_id: AudienceId, timestamp: DateTime<Utc>) -> Self {
        Self {
            audience_id,
            timestamp,
        }
    }

    /// Broker message id. Two tasks issued for the same audience in the same second share it.
    pub fn message_id(&self) -> String {
        format!("{}-{}", self.audience_id, self.timestamp.timestamp())
    }

    pub fn to_payload(&self) -> AudienceResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a task from a delivery payload.
    ///
    /// Any decoding failure is reported as [`ErrorKind::MalformedMessage`], since such a
    /// payload will never become valid.
    pub fn from_payload(payload: &[u8]) -> AudienceResult<Self> {
        serde_json::from_slice(payload).map_err(|err| {
            audience_error!(
                ErrorKind::MalformedMessage,
                "Reconciliation task payload is malformed",
                err.to_string(),
                source: err
            )
        })
    }
}

/// Kind of change announced by an [`AudienceChangeMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Members were appended by a reconciliation.
    Updated,
    /// Members were explicitly removed.
    Pruned,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Updated => "updated",
            ChangeStatus::Pruned => "pruned",
        }
    }
}

/// Notification that the membership of an audience changed.
///
/// Consumers deduplicate on `(audience_id, updated_at)` or `(audience_id, last_request_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceChangeMessage {
    pub audience_id: AudienceId,
    pub updated_at: DateTime<Utc>,
    /// Number of members after the change.
    pub request_count: u64,
    /// Greatest id added by the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_id: Option<RequestId>,
    pub status: ChangeStatus,
    pub filter: AudienceFilter,
    /// Ad cabinets the audience is synchronized to.
    #[serde(default)]
    pub integrations: Vec<String>,
}

impl AudienceChangeMessage {
    pub fn updated(
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        request_count: u64,
        last_request_id: Option<RequestId>,
        filter: AudienceFilter,
        integrations: Vec<String>,
    ) -> Self {
        Self {
            audience_id,
            updated_at,
            request_count,
            last_request_id,
            status: ChangeStatus::Updated,
            filter,
            integrations,
        }
    }

    pub fn pruned(
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        request_count: u64,
        filter: AudienceFilter,
        integrations: Vec<String>,
    ) -> Self {
        Self {
            audience_id,
            updated_at,
            request_count,
            last_request_id: None,
            status: ChangeStatus::Pruned,
            filter,
            integrations,
        }
    }

    pub fn message_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.audience_id,
            self.status.as_str(),
            self.updated_at.timestamp_micros()
        )
    }

    pub fn to_payload(&self) -> AudienceResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn task_payload_shape() {
        let task = ReconciliationTask::new(
            AudienceId::new(7),
            Utc.with_ymd_and_hms(2025, 10, 1, 1, 0, 0).unwrap(),
        );

        let value: serde_json::Value = serde_json::from_slice(&task.to_payload().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "audience_id": 7, "timestamp": "2025-10-01T01:00:00Z" })
        );
        assert_eq!(task.message_id(), "7-1759280400");
    }

    #[test]
    fn malformed_task_payloads_are_classified() {
        for payload in [
            &b"not json"[..],
            br#"{"audience_id":"seven","timestamp":"2025-10-01T01:00:00Z"}"#,
            br#"{"timestamp":"2025-10-01T01:00:00Z"}"#,
        ] {
            let err = ReconciliationTask::from_payload(payload).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedMessage);
        }
    }

    #[test]
    fn change_message_payload_shape() {
        let mut filter = AudienceFilter {
            creation_date_from: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        filter.statuses.insert("rejected".to_string());

        let message = AudienceChangeMessage::updated(
            AudienceId::new(3),
            Utc.with_ymd_and_hms(2025, 10, 1, 1, 0, 5).unwrap(),
            5,
            Some(RequestId::new(5)),
            filter,
            vec!["vk".to_string()],
        );

        let value: serde_json::Value =
            serde_json::from_slice(&message.to_payload().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "audience_id": 3,
                "updated_at": "2025-10-01T01:00:05Z",
                "request_count": 5,
                "last_request_id": 5,
                "status": "updated",
                "filter": {
                    "creation_date_from": "2025-01-01T00:00:00Z",
                    "creation_date_to": null,
                    "statuses": ["rejected"],
                    "rejection_reasons": [],
                    "non_target_reasons": []
                },
                "integrations": ["vk"]
            })
        );
    }

    #[test]
    fn pruned_message_omits_last_request_id() {
        let message = AudienceChangeMessage::pruned(
            AudienceId::new(3),
            Utc.with_ymd_and_hms(2025, 10, 1, 1, 0, 5).unwrap(),
            2,
            AudienceFilter::default(),
            vec![],
        );

        let value: serde_json::Value =
            serde_json::from_slice(&message.to_payload().unwrap()).unwrap();
        assert_eq!(value["status"], "pruned");
        assert!(value.get("last_request_id").is_none());
    }
}
