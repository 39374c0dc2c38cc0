//! Typed job payloads, one shape per job type.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobsError;
use crate::job::JobType;

/// Payload of a job, tagged by its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    DigestGeneration(DigestGenerationPayload),
    RepositorySync(RepositorySyncPayload),
    WebhookProcessing(WebhookPayload),
    Notification(NotificationPayload),
    Cleanup(CleanupPayload),
    HealthCheck(HealthCheckPayload),
    Custom(CustomPayload),
}

/// Build a digest for a subscriber over a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestGenerationPayload {
    pub digest_id: String,
    #[serde(default)]
    pub repository_ids: Vec<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

/// Refresh repository metadata from the upstream host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySyncPayload {
    pub repository_id: String,
    /// `owner/name` form.
    pub full_name: String,
    #[serde(default)]
    pub force: bool,
}

/// An inbound webhook delivery to process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub source: String,
    pub event: String,
    #[serde(default)]
    pub delivery_id: Option<String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
    Email,
    Slack,
    Webhook,
}

/// Deliver a message through one notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub channel: NotificationChannel,
    pub recipient: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub message: String,
    #[serde(default)]
    pub digest_id: Option<String>,
}

/// Purge finished jobs older than a retention period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupPayload {
    #[serde(default = "default_retention_days")]
    pub older_than_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for CleanupPayload {
    fn default() -> Self {
        Self {
            older_than_days: default_retention_days(),
        }
    }
}

/// Check external dependencies. An empty component list checks everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckPayload {
    #[serde(default)]
    pub components: Vec<String>,
}

/// Free-form payload for application-defined job types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPayload {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl JobPayload {
    /// Parse and validate raw JSON as the payload for `job_type`.
    pub fn from_json(job_type: &JobType, value: Value) -> Result<Self, JobsError> {
        // Payload-less types may be created with `null`.
        let value = if value.is_null() {
            Value::Object(Default::default())
        } else {
            value
        };

        let payload = match job_type {
            JobType::DigestGeneration => JobPayload::DigestGeneration(parse(job_type, value)?),
            JobType::RepositorySync => JobPayload::RepositorySync(parse(job_type, value)?),
            JobType::WebhookProcessing => JobPayload::WebhookProcessing(parse(job_type, value)?),
            JobType::Notification => JobPayload::Notification(parse(job_type, value)?),
            JobType::Cleanup => JobPayload::Cleanup(parse(job_type, value)?),
            JobType::HealthCheck => JobPayload::HealthCheck(parse(job_type, value)?),
            JobType::Custom(name) => JobPayload::Custom(CustomPayload {
                name: name.clone(),
                data: value,
            }),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// The job type this payload belongs to.
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::DigestGeneration(_) => JobType::DigestGeneration,
            JobPayload::RepositorySync(_) => JobType::RepositorySync,
            JobPayload::WebhookProcessing(_) => JobType::WebhookProcessing,
            JobPayload::Notification(_) => JobType::Notification,
            JobPayload::Cleanup(_) => JobType::Cleanup,
            JobPayload::HealthCheck(_) => JobType::HealthCheck,
            JobPayload::Custom(custom) => JobType::Custom(custom.name.clone()),
        }
    }

    /// Check semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), JobsError> {
        match self {
            JobPayload::DigestGeneration(p) => {
                require_non_empty("digest_id", &p.digest_id)?;
                if let (Some(since), Some(until)) = (p.since, p.until)
                    && since >= until
                {
                    return Err(JobsError::validation("digest range: since must precede until"));
                }
            }
            JobPayload::RepositorySync(p) => {
                require_non_empty("repository_id", &p.repository_id)?;
                let mut parts = p.full_name.split('/');
                let well_formed = matches!(
                    (parts.next(), parts.next(), parts.next()),
                    (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
                );
                if !well_formed {
                    return Err(JobsError::validation(format!(
                        "full_name '{}' is not of the form owner/name",
                        p.full_name
                    )));
                }
            }
            JobPayload::WebhookProcessing(p) => {
                require_non_empty("source", &p.source)?;
                require_non_empty("event", &p.event)?;
            }
            JobPayload::Notification(p) => {
                require_non_empty("recipient", &p.recipient)?;
                require_non_empty("message", &p.message)?;
                match p.channel {
                    NotificationChannel::Email if !p.recipient.contains('@') => {
                        return Err(JobsError::validation(format!(
                            "'{}' is not an email address",
                            p.recipient
                        )));
                    }
                    NotificationChannel::Webhook
                        if !(p.recipient.starts_with("http://")
                            || p.recipient.starts_with("https://")) =>
                    {
                        return Err(JobsError::validation(format!(
                            "'{}' is not a webhook url",
                            p.recipient
                        )));
                    }
                    _ => {}
                }
            }
            JobPayload::Cleanup(p) => {
                if p.older_than_days == 0 {
                    return Err(JobsError::validation("older_than_days must be at least 1"));
                }
            }
            JobPayload::HealthCheck(_) => {}
            JobPayload::Custom(p) => require_non_empty("name", &p.name)?,
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(job_type: &JobType, value: Value) -> Result<T, JobsError> {
    serde_json::from_value(value)
        .map_err(|e| JobsError::validation(format!("invalid {job_type} payload: {e}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), JobsError> {
    if value.trim().is_empty() {
        Err(JobsError::validation(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_digest_payload() {
        let payload =
            JobPayload::from_json(&JobType::DigestGeneration, json!({ "digest_id": "d-1" }))
                .unwrap();
        assert_eq!(payload.job_type(), JobType::DigestGeneration);
        match payload {
            JobPayload::DigestGeneration(p) => {
                assert_eq!(p.digest_id, "d-1");
                assert!(p.repository_ids.is_empty());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_shapes() {
        let missing = JobPayload::from_json(&JobType::DigestGeneration, json!({}));
        assert!(matches!(missing, Err(JobsError::Validation(_))));

        let bad_repo = JobPayload::from_json(
            &JobType::RepositorySync,
            json!({ "repository_id": "1", "full_name": "no-slash" }),
        );
        assert!(matches!(bad_repo, Err(JobsError::Validation(_))));

        let bad_email = JobPayload::from_json(
            &JobType::Notification,
            json!({ "channel": "email", "recipient": "nobody", "message": "hi" }),
        );
        assert!(matches!(bad_email, Err(JobsError::Validation(_))));
    }

    #[test]
    fn null_payload_uses_defaults() {
        let cleanup = JobPayload::from_json(&JobType::Cleanup, Value::Null).unwrap();
        assert_eq!(cleanup, JobPayload::Cleanup(CleanupPayload::default()));

        let health = JobPayload::from_json(&JobType::HealthCheck, Value::Null).unwrap();
        assert_eq!(health, JobPayload::HealthCheck(HealthCheckPayload::default()));
    }

    #[test]
    fn custom_types_keep_raw_data() {
        let job_type = JobType::Custom("EXPORT".into());
        let payload = JobPayload::from_json(&job_type, json!({ "format": "csv" })).unwrap();
        assert_eq!(payload.job_type(), job_type);
    }
}
