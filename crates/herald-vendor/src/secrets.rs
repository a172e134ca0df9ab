//! Credential resolution for vendor adapters.
//!
//! Vendor configuration carries secret *references*, not secret values:
//! - `env://VAR_NAME` reads an environment variable
//! - `aws-sm://secret-name` reads AWS Secrets Manager
//!
//! Anything without a scheme is taken as a literal value, which keeps local
//! development and tests free of secret plumbing.

use herald_common::DispatchError;
use tracing::debug;

use crate::Result;

pub struct CredentialResolver {
    secrets_client: Option<aws_sdk_secretsmanager::Client>,
}

impl CredentialResolver {
    /// Resolver for environments without AWS access (env and literal
    /// references only).
    pub fn env_only() -> Self {
        Self {
            secrets_client: None,
        }
    }

    /// Resolver with AWS Secrets Manager support.
    pub async fn with_aws() -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            secrets_client: Some(aws_sdk_secretsmanager::Client::new(&aws_config)),
        }
    }

    pub async fn resolve(&self, reference: &str) -> Result<String> {
        if let Some(var) = reference.strip_prefix("env://") {
            return std::env::var(var).map_err(|_| {
                DispatchError::Internal(format!("Environment variable not set: {var}"))
            });
        }

        if let Some(name) = reference.strip_prefix("aws-sm://") {
            let client = self.secrets_client.as_ref().ok_or_else(|| {
                DispatchError::Internal(
                    "aws-sm:// credential reference but no Secrets Manager client".to_string(),
                )
            })?;

            let secret = client
                .get_secret_value()
                .secret_id(name)
                .send()
                .await
                .map_err(|e| {
                    DispatchError::Internal(format!("Secrets Manager read failed for {name}: {e}"))
                })?;

            return secret.secret_string().map(str::to_string).ok_or_else(|| {
                DispatchError::Internal(format!("Secret {name} has no string value"))
            });
        }

        debug!("Credential reference has no scheme, using literal value");
        Ok(reference.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_reference_resolves_to_itself() {
        let resolver = CredentialResolver::env_only();
        assert_eq!(resolver.resolve("sk-test-123").await.unwrap(), "sk-test-123");
    }

    #[tokio::test]
    async fn env_reference_reads_variable() {
        std::env::set_var("HERALD_TEST_SECRET", "hunter2");
        let resolver = CredentialResolver::env_only();
        assert_eq!(
            resolver.resolve("env://HERALD_TEST_SECRET").await.unwrap(),
            "hunter2"
        );
    }

    #[tokio::test]
    async fn missing_env_variable_errors() {
        let resolver = CredentialResolver::env_only();
        assert!(resolver.resolve("env://HERALD_TEST_UNSET").await.is_err());
    }

    #[tokio::test]
    async fn aws_reference_without_client_errors() {
        let resolver = CredentialResolver::env_only();
        assert!(resolver.resolve("aws-sm://herald/sendgrid").await.is_err());
    }
}
