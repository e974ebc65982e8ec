use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_iam::config::Builder as IamConfigBuilder;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_iam::operation::create_policy_version::CreatePolicyVersionError;
use aws_sdk_iam::operation::delete_policy_version::DeletePolicyVersionError;
use aws_types::region::Region;

use iamrevert_core::{ApiError, CreatedVersion, IamPolicies};

/// IAM-backed identity-policy client. Stateless; safe to reuse across
/// invocations.
#[derive(Debug, Clone)]
pub struct IamClient {
    inner: aws_sdk_iam::Client,
}

impl IamClient {
    /// Build a client from the standard credential chain. `endpoint_url`
    /// overrides the IAM endpoint (LocalStack and friends); `region` falls
    /// back to the chain's default when unset.
    pub async fn connect(region: Option<String>, endpoint_url: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(r) = region {
            loader = loader.region(Region::new(r));
        }
        let sdk_config = loader.load().await;

        let mut builder = IamConfigBuilder::from(&sdk_config)
            .retry_config(RetryConfig::standard().with_max_attempts(3));
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url);
        }
        IamClient { inner: aws_sdk_iam::Client::from_conf(builder.build()) }
    }

    pub fn from_client(inner: aws_sdk_iam::Client) -> Self {
        IamClient { inner }
    }
}

#[async_trait]
impl IamPolicies for IamClient {
    async fn create_policy_version(&self, arn: &str, document: &str, set_as_default: bool) -> Result<CreatedVersion, ApiError> {
        tracing::debug!(arn, set_as_default, "CreatePolicyVersion");
        let out = self
            .inner
            .create_policy_version()
            .policy_arn(arn)
            .policy_document(document)
            .set_as_default(set_as_default)
            .send()
            .await
            .map_err(|e| classify_create(arn, e))?;
        let version_id = out
            .policy_version()
            .and_then(|v| v.version_id())
            .map(|v| v.to_string());
        Ok(CreatedVersion { version_id })
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), ApiError> {
        tracing::debug!(arn, version_id, "DeletePolicyVersion");
        self.inner
            .delete_policy_version()
            .policy_arn(arn)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| classify_delete(arn, e))?;
        Ok(())
    }
}

fn classify_create(arn: &str, err: SdkError<CreatePolicyVersionError>) -> ApiError {
    match &err {
        SdkError::ServiceError(ctx) => classify_create_service(arn, ctx.err()),
        _ => ApiError::Transport(format!("{}", DisplayErrorContext(&err))),
    }
}

fn classify_create_service(arn: &str, se: &CreatePolicyVersionError) -> ApiError {
    if se.is_no_such_entity_exception() {
        ApiError::NotFound(arn.to_string())
    } else if se.is_limit_exceeded_exception() {
        ApiError::VersionLimit(arn.to_string())
    } else if se.is_malformed_policy_document_exception() || se.is_invalid_input_exception() {
        ApiError::InvalidDocument(service_message(se))
    } else {
        ApiError::Upstream(service_message(se))
    }
}

fn classify_delete(arn: &str, err: SdkError<DeletePolicyVersionError>) -> ApiError {
    match &err {
        SdkError::ServiceError(ctx) => classify_delete_service(arn, ctx.err()),
        _ => ApiError::Transport(format!("{}", DisplayErrorContext(&err))),
    }
}

fn classify_delete_service(arn: &str, se: &DeletePolicyVersionError) -> ApiError {
    if se.is_no_such_entity_exception() {
        ApiError::NotFound(arn.to_string())
    } else if se.is_limit_exceeded_exception() {
        ApiError::Throttled(service_message(se))
    } else if se.is_delete_conflict_exception() {
        // e.g. the version is still the default; nothing wrong with a document
        ApiError::Conflict(service_message(se))
    } else if se.is_invalid_input_exception() {
        ApiError::InvalidDocument(service_message(se))
    } else {
        ApiError::Upstream(service_message(se))
    }
}

fn service_message<E: ProvideErrorMetadata + std::fmt::Debug>(err: &E) -> String {
    match err.message() {
        Some(m) => m.to_string(),
        None => format!("{err:?}"),
    }
}
