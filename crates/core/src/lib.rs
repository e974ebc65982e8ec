use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use iamrevert_policy::{check_document, PolicyError, RestrictedActions};

/// Benign placeholder installed as the new default version. Grants a single
/// unrelated read-only permission so the policy stays attached but inert.
pub const PLACEHOLDER_DOCUMENT: &str = r#"{"Version": "2012-10-17","Statement": [{ "Sid": "VisualEditor0","Effect": "Allow","Action": "logs:GetLogGroupFields", "Resource": "*"}] }"#;

/// Trigger payload: the offending policy document plus enough metadata to
/// address its versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationEvent {
    /// JSON text of the non-compliant policy document.
    pub policy: String,
    #[serde(rename="policyMeta")]
    pub policy_meta: PolicyMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMeta {
    pub arn: String,
    #[serde(rename="policyName")]
    pub policy_name: String,
    #[serde(rename="defaultVersionId")]
    pub default_version_id: String,
}

impl RemediationEvent {
    pub fn validate(&self) -> Result<(), EventError> {
        if self.policy.trim().is_empty() {
            return Err(EventError::MissingField("policy"));
        }
        if self.policy_meta.arn.trim().is_empty() {
            return Err(EventError::MissingField("policyMeta.arn"));
        }
        if !self.policy_meta.arn.starts_with("arn:") {
            return Err(EventError::BadArn(self.policy_meta.arn.clone()));
        }
        if self.policy_meta.policy_name.trim().is_empty() {
            return Err(EventError::MissingField("policyMeta.policyName"));
        }
        if self.policy_meta.default_version_id.trim().is_empty() {
            return Err(EventError::MissingField("policyMeta.defaultVersionId"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemediationResult {
    pub message: String,
    pub action: ActionTag,
    pub outcome: RemediationOutcome,
}

/// Fixed tag telling the consumer a human must approve or deny the change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all="lowercase")]
pub enum ActionTag {
    Remedy,
}

/// What actually happened upstream, so a consumer can tell "remediated,
/// awaiting approval" from "remediation failed" without the result shape
/// changing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag="status", rename_all="lowercase")]
pub enum RemediationOutcome {
    #[serde(rename_all="camelCase")]
    Applied {
        new_version_id: Option<String>,
        prior_version_deleted: bool,
    },
    Failed {
        error: String,
        transient: bool,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event field '{0}' is missing or empty")]
    MissingField(&'static str),
    #[error("'{0}' is not a policy ARN")]
    BadArn(String),
}

/// Local failures only; upstream API faults are reported in the outcome,
/// never returned as `Err`.
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Identity-API faults, classified so callers can separate retryable from
/// permanent failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("policy not found: {0}")]
    NotFound(String),
    #[error("stored version limit reached for {0}")]
    VersionLimit(String),
    #[error("rejected policy document: {0}")]
    InvalidDocument(String),
    #[error("conflicting change: {0}")]
    Conflict(String),
    #[error("request throttled: {0}")]
    Throttled(String),
    #[error("identity API failure: {0}")]
    Upstream(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Throttled(_) | ApiError::Upstream(_) | ApiError::Transport(_))
    }
}

#[derive(Debug, Clone)]
pub struct CreatedVersion {
    pub version_id: Option<String>,
}

/// Seam to the identity-policy API. The client is stateless and reusable
/// across invocations.
#[async_trait]
pub trait IamPolicies: Send + Sync {
    async fn create_policy_version(&self, arn: &str, document: &str, set_as_default: bool) -> Result<CreatedVersion, ApiError>;
    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct RemediationConfig {
    pub restricted: RestrictedActions,
    /// Also remove the previously-default non-compliant version after the
    /// placeholder is installed. Off by default: deletion is irreversible
    /// and may be a separate human-gated step.
    pub delete_prior_version: bool,
    pub replacement_document: String,
}

impl RemediationConfig {
    pub fn new(restricted: RestrictedActions) -> Self {
        RemediationConfig {
            restricted,
            delete_prior_version: false,
            replacement_document: PLACEHOLDER_DOCUMENT.to_string(),
        }
    }
}

fn remedy_message(event: &RemediationEvent) -> String {
    format!(
        "Policy {} Has been altered and contains restricted Actions: {}, please approve or deny this change",
        event.policy_meta.policy_name, event.policy
    )
}

fn skip_message(event: &RemediationEvent) -> String {
    format!(
        "Policy {} does not contain restricted Actions: {}, no remediation required",
        event.policy_meta.policy_name, event.policy
    )
}

/// Neutralize a non-compliant policy by installing the placeholder document
/// as its new default version, then report back for approval.
///
/// `Err` is returned only for invalid input (bad event, unparseable
/// document). Upstream failures are classified, logged, and carried in the
/// returned outcome.
pub async fn remediate(
    iam: &dyn IamPolicies,
    cfg: &RemediationConfig,
    event: &RemediationEvent,
) -> Result<RemediationResult, RemediationError> {
    event.validate()?;

    let report = check_document(&event.policy, &cfg.restricted)?;
    if report.is_compliant() {
        tracing::info!(policy=%event.policy_meta.policy_name, "no restricted actions allowed, skipping remediation");
        return Ok(RemediationResult {
            message: skip_message(event),
            action: ActionTag::Remedy,
            outcome: RemediationOutcome::Skipped {
                reason: "no restricted actions matched".to_string(),
            },
        });
    }
    tracing::info!(
        policy=%event.policy_meta.policy_name,
        matched=?report.matched,
        "policy allows restricted actions, installing placeholder version"
    );

    let arn = event.policy_meta.arn.as_str();
    let outcome = match iam.create_policy_version(arn, &cfg.replacement_document, true).await {
        Ok(created) => {
            tracing::info!(arn, version=?created.version_id, "placeholder version installed as default");
            let mut prior_version_deleted = false;
            if cfg.delete_prior_version {
                let prior = event.policy_meta.default_version_id.as_str();
                match iam.delete_policy_version(arn, prior).await {
                    Ok(()) => {
                        prior_version_deleted = true;
                        tracing::info!(arn, version=%prior, "deleted the restricted policy version");
                    }
                    Err(e) => {
                        tracing::error!(arn, version=%prior, error=%e, "failed to delete prior policy version");
                    }
                }
            }
            RemediationOutcome::Applied {
                new_version_id: created.version_id,
                prior_version_deleted,
            }
        }
        Err(e) => {
            tracing::error!(arn, error=%e, transient=e.is_transient(), "failed to create placeholder policy version");
            RemediationOutcome::Failed {
                error: e.to_string(),
                transient: e.is_transient(),
            }
        }
    };

    Ok(RemediationResult {
        message: remedy_message(event),
        action: ActionTag::Remedy,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct CreateCall {
        arn: String,
        document: String,
        set_as_default: bool,
    }

    /// Records calls; optionally fails the create step.
    #[derive(Default)]
    struct Recording {
        create_calls: Mutex<Vec<CreateCall>>,
        delete_calls: Mutex<Vec<(String, String)>>,
        fail_create: Option<ApiError>,
        fail_delete: Option<ApiError>,
    }

    #[async_trait]
    impl IamPolicies for Recording {
        async fn create_policy_version(&self, arn: &str, document: &str, set_as_default: bool) -> Result<CreatedVersion, ApiError> {
            self.create_calls.lock().unwrap().push(CreateCall {
                arn: arn.to_string(),
                document: document.to_string(),
                set_as_default,
            });
            match &self.fail_create {
                Some(e) => Err(e.clone()),
                None => Ok(CreatedVersion { version_id: Some("v2".to_string()) }),
            }
        }

        async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), ApiError> {
            self.delete_calls.lock().unwrap().push((arn.to_string(), version_id.to_string()));
            match &self.fail_delete {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    const OFFENDING: &str = r#"{"Version":"2012-10-17","Statement":[{"Sid":"VisualEditor0","Effect":"Allow","Action":["s3:DeleteBucket","s3:AddObject"],"Resource":"*"}]}"#;

    fn event() -> RemediationEvent {
        RemediationEvent {
            policy: OFFENDING.to_string(),
            policy_meta: PolicyMeta {
                arn: "arn:aws:iam::123456789012:policy/ExamplePolicy".to_string(),
                policy_name: "ExamplePolicy".to_string(),
                default_version_id: "v1".to_string(),
            },
        }
    }

    fn config() -> RemediationConfig {
        RemediationConfig::new(RestrictedActions::parse("s3:DeleteBucket,s3:DeleteObject"))
    }

    #[tokio::test]
    async fn installs_placeholder_as_default() {
        let iam = Recording::default();
        let res = remediate(&iam, &config(), &event()).await.unwrap();

        let creates = iam.create_calls.lock().unwrap();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].arn, "arn:aws:iam::123456789012:policy/ExamplePolicy");
        assert_eq!(creates[0].document, PLACEHOLDER_DOCUMENT);
        assert!(creates[0].set_as_default);

        assert_eq!(res.action, ActionTag::Remedy);
        assert_eq!(
            res.outcome,
            RemediationOutcome::Applied { new_version_id: Some("v2".to_string()), prior_version_deleted: false }
        );
    }

    #[tokio::test]
    async fn message_embeds_name_and_document_verbatim() {
        let iam = Recording::default();
        let res = remediate(&iam, &config(), &event()).await.unwrap();
        assert_eq!(
            res.message,
            format!("Policy ExamplePolicy Has been altered and contains restricted Actions: {OFFENDING}, please approve or deny this change")
        );
    }

    #[tokio::test]
    async fn delete_is_never_issued_by_default() {
        let iam = Recording::default();
        remediate(&iam, &config(), &event()).await.unwrap();
        assert!(iam.delete_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gated_delete_targets_prior_default_version() {
        let iam = Recording::default();
        let mut cfg = config();
        cfg.delete_prior_version = true;
        let res = remediate(&iam, &cfg, &event()).await.unwrap();

        let deletes = iam.delete_calls.lock().unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(
            deletes[0],
            ("arn:aws:iam::123456789012:policy/ExamplePolicy".to_string(), "v1".to_string())
        );
        assert!(matches!(
            res.outcome,
            RemediationOutcome::Applied { prior_version_deleted: true, .. }
        ));
    }

    #[tokio::test]
    async fn delete_failure_still_counts_as_applied() {
        let iam = Recording {
            fail_delete: Some(ApiError::Upstream("boom".to_string())),
            ..Recording::default()
        };
        let mut cfg = config();
        cfg.delete_prior_version = true;
        let res = remediate(&iam, &cfg, &event()).await.unwrap();
        assert!(matches!(
            res.outcome,
            RemediationOutcome::Applied { prior_version_deleted: false, .. }
        ));
    }

    #[tokio::test]
    async fn create_failure_is_not_propagated() {
        let iam = Recording {
            fail_create: Some(ApiError::Throttled("slow down".to_string())),
            ..Recording::default()
        };
        let res = remediate(&iam, &config(), &event()).await.unwrap();
        assert_eq!(res.action, ActionTag::Remedy);
        assert_eq!(
            res.outcome,
            RemediationOutcome::Failed { error: "request throttled: slow down".to_string(), transient: true }
        );
        // create failed, so the delete step must not run even when gated on
        assert!(iam.delete_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_create_failure_is_marked_non_transient() {
        let iam = Recording {
            fail_create: Some(ApiError::VersionLimit("arn:aws:iam::123456789012:policy/ExamplePolicy".to_string())),
            ..Recording::default()
        };
        let res = remediate(&iam, &config(), &event()).await.unwrap();
        assert!(matches!(res.outcome, RemediationOutcome::Failed { transient: false, .. }));
    }

    #[tokio::test]
    async fn compliant_policy_skips_all_api_calls() {
        let iam = Recording::default();
        let mut ev = event();
        ev.policy = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":["s3:AddBucket","s3:AddObject"],"Resource":"*"}]}"#.to_string();
        let res = remediate(&iam, &config(), &ev).await.unwrap();

        assert!(iam.create_calls.lock().unwrap().is_empty());
        assert!(iam.delete_calls.lock().unwrap().is_empty());
        assert_eq!(res.action, ActionTag::Remedy);
        assert!(matches!(res.outcome, RemediationOutcome::Skipped { .. }));
        assert!(res.message.contains("ExamplePolicy"));
        assert!(res.message.contains(&ev.policy));
    }

    #[tokio::test]
    async fn invalid_events_are_rejected() {
        let iam = Recording::default();
        let mut ev = event();
        ev.policy_meta.arn = "ExamplePolicy".to_string();
        let err = remediate(&iam, &config(), &ev).await.unwrap_err();
        assert!(matches!(err, RemediationError::Event(EventError::BadArn(_))));

        let mut ev = event();
        ev.policy_meta.default_version_id = String::new();
        assert!(remediate(&iam, &config(), &ev).await.is_err());
        assert!(iam.create_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unparseable_document_is_rejected() {
        let iam = Recording::default();
        let mut ev = event();
        ev.policy = "not a policy".to_string();
        let err = remediate(&iam, &config(), &ev).await.unwrap_err();
        assert!(matches!(err, RemediationError::Policy(_)));
        assert!(iam.create_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn api_error_transience_classification() {
        assert!(ApiError::Throttled("t".to_string()).is_transient());
        assert!(ApiError::Upstream("u".to_string()).is_transient());
        assert!(ApiError::Transport("c".to_string()).is_transient());
        assert!(!ApiError::NotFound("arn".to_string()).is_transient());
        assert!(!ApiError::VersionLimit("arn".to_string()).is_transient());
        assert!(!ApiError::InvalidDocument("d".to_string()).is_transient());
        assert!(!ApiError::Conflict("still the default version".to_string()).is_transient());
    }

    #[test]
    fn event_round_trips_with_wire_names() {
        let json = r#"{
          "policy": "{\"Version\":\"2012-10-17\"}",
          "policyMeta": {
            "arn": "arn:aws:iam::123456789012:policy/ExamplePolicy",
            "policyName": "ExamplePolicy",
            "defaultVersionId": "v1"
          }
        }"#;
        let ev: RemediationEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.policy_meta.policy_name, "ExamplePolicy");
        assert_eq!(ev.policy_meta.default_version_id, "v1");
    }

    #[test]
    fn result_serializes_fixed_action_tag() {
        let res = RemediationResult {
            message: "m".to_string(),
            action: ActionTag::Remedy,
            outcome: RemediationOutcome::Skipped { reason: "r".to_string() },
        };
        let v: serde_json::Value = serde_json::to_value(&res).unwrap();
        assert_eq!(v["action"], "remedy");
        assert_eq!(v["outcome"]["status"], "skipped");
    }
}
