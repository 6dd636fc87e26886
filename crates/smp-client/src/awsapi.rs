//! AWS adapters behind the control-plane and key-management capabilities.
//!
//! Region, profile and endpoint come from the outer CLI invocation; the SSM
//! client talks to the given service endpoint, the KMS client to the regional
//! default.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::Region;
use std::collections::HashMap;
use tracing::debug;

use smp_core::encryption::{GeneratedDataKey, KmsKeyProvider};
use smp_core::error::{Error, Result};

use crate::service::ControlPlane;

/// Load the shared SDK configuration for the given region and profile.
pub async fn load_sdk_config(region: &str, profile: &str) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if !region.is_empty() {
        loader = loader.region(Region::new(region.to_string()));
    }
    if !profile.is_empty() {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

/// SSM control plane: ResumeSession and TerminateSession.
pub struct SsmControlPlane {
    client: aws_sdk_ssm::Client,
}

impl SsmControlPlane {
    /// Build a client against the service endpoint the outer CLI passed.
    pub async fn new(region: &str, profile: &str, endpoint: &str) -> Self {
        let shared = load_sdk_config(region, profile).await;
        let mut builder = aws_sdk_ssm::config::Builder::from(&shared);
        if !endpoint.is_empty() {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: aws_sdk_ssm::Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ControlPlane for SsmControlPlane {
    async fn resume_session(&self, session_id: &str) -> Result<Option<String>> {
        debug!(session_id, "calling ResumeSession");
        let output = self
            .client
            .resume_session()
            .session_id(session_id)
            .send()
            .await
            .map_err(|e| Error::Service {
                message: format!("ResumeSession failed: {e}"),
            })?;
        Ok(output.token_value)
    }

    async fn terminate_session(&self, session_id: &str) -> Result<()> {
        debug!(session_id, "calling TerminateSession");
        self.client
            .terminate_session()
            .session_id(session_id)
            .send()
            .await
            .map_err(|e| Error::Service {
                message: format!("TerminateSession failed: {e}"),
            })?;
        Ok(())
    }
}

/// Key management service adapter for data key generation.
pub struct KmsService {
    client: aws_sdk_kms::Client,
}

impl KmsService {
    pub async fn new(region: &str, profile: &str) -> Self {
        let shared = load_sdk_config(region, profile).await;
        Self {
            client: aws_sdk_kms::Client::new(&shared),
        }
    }
}

#[async_trait]
impl KmsKeyProvider for KmsService {
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &HashMap<String, String>,
        num_bytes: u32,
    ) -> Result<GeneratedDataKey> {
        debug!(key_id, "calling GenerateDataKey");
        let mut request = self
            .client
            .generate_data_key()
            .key_id(key_id)
            .number_of_bytes(num_bytes as i32);
        for (name, value) in context {
            request = request.encryption_context(name.clone(), value.clone());
        }

        let output = request.send().await.map_err(|e| Error::Service {
            message: format!("GenerateDataKey failed: {e}"),
        })?;

        let ciphertext_blob = output
            .ciphertext_blob
            .map(|blob| blob.into_inner())
            .ok_or_else(|| Error::Service {
                message: "GenerateDataKey returned no ciphertext blob".to_string(),
            })?;
        let plaintext = output
            .plaintext
            .map(|blob| blob.into_inner())
            .ok_or_else(|| Error::Service {
                message: "GenerateDataKey returned no plaintext key".to_string(),
            })?;

        Ok(GeneratedDataKey {
            ciphertext_blob,
            plaintext,
        })
    }
}
