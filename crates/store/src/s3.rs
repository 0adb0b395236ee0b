//! S3 object-store job backend.
//!
//! One object per job at `{prefix}/{id}`, listed via prefix scan. Bootstrap
//! attempts to create the bucket; a bucket that already exists (owned by us
//! or not) is used as-is.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use ecss_core::config::AwsConfig;

use crate::backend::{JobBackend, StoreError};

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    region: String,
}

impl S3Backend {
    /// Build an S3 client from project config.
    ///
    /// Static credentials and an endpoint override are applied when
    /// configured (local dev / explicit config); otherwise the default
    /// provider chain is used.
    pub async fn new(bucket: &str, prefix: Option<&str>, aws: &AwsConfig) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(aws.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = aws_credential_types::Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "ecss-static",
            );
            builder = builder.credentials_provider(creds);
        }
        if let Some(ref endpoint) = aws.endpoint_url {
            if !endpoint.is_empty() {
                builder = builder.endpoint_url(endpoint).force_path_style(true);
            }
        }

        let prefix = prefix.unwrap_or("").trim_matches('/').to_string();
        info!(
            "job store: s3 backend s3://{}/{} (region: {})",
            bucket, prefix, aws.region
        );
        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix,
            region: aws.region.clone(),
        }
    }

    fn key(&self, id: &str) -> String {
        if self.prefix.is_empty() {
            id.to_string()
        } else {
            format!("{}/{}", self.prefix, id)
        }
    }

    fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }
}

#[async_trait]
impl JobBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        // us-east-1 rejects an explicit location constraint.
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "created job store bucket");
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_bucket_already_owned_by_you()
                    || service_error.is_bucket_already_exists()
                {
                    debug!(bucket = %self.bucket, "job store bucket already exists");
                    Ok(())
                } else {
                    Err(StoreError::Unavailable(format!(
                        "s3 create bucket failed: {service_error}"
                    )))
                }
            }
        }
    }

    async fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let list_prefix = self.list_prefix();
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| StoreError::Unavailable(format!("s3 list failed: {e}")))?;

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                let id = key.strip_prefix(&list_prefix).unwrap_or(key).to_string();
                if id.is_empty() {
                    continue;
                }
                if let Some(body) = self.get(&id).await? {
                    records.push((id, body));
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(id))
            .send()
            .await;
        let output = match resp {
            Ok(output) => output,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StoreError::Unavailable(format!(
                    "s3 get failed: {service_error}"
                )));
            }
        };
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Unavailable(format!("s3 body read failed: {e}")))?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| StoreError::Other(format!("s3 object is not UTF-8: {e}")))
    }

    async fn put(&self, id: &str, body: &str) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(id))
            .content_type("application/json")
            .body(ByteStream::from(body.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("s3 put failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(id))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("s3 delete failed: {e}")))?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn aws() -> AwsConfig {
        AwsConfig {
            region: "eu-west-1".into(),
            access_key_id: Some("test".into()),
            secret_access_key: Some("test".into()),
            session_token: None,
            endpoint_url: None,
        }
    }

    #[tokio::test]
    async fn test_key_layout_with_prefix() {
        let backend = S3Backend::new("jobs-bucket", Some("scheduler/jobs/"), &aws()).await;
        assert_eq!(backend.key("sleeper-task"), "scheduler/jobs/sleeper-task");
        assert_eq!(backend.list_prefix(), "scheduler/jobs/");
    }

    #[tokio::test]
    async fn test_key_layout_without_prefix() {
        let backend = S3Backend::new("jobs-bucket", None, &aws()).await;
        assert_eq!(backend.key("sleeper-task"), "sleeper-task");
        assert_eq!(backend.list_prefix(), "");
    }
}
