//! DynamoDB key-value job backend.
//!
//! One item per job: partition key `id`, JSON record in the `body` string
//! attribute. Bootstrap creates the table on demand (on-demand billing) and
//! tolerates a table that already exists.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use tracing::{debug, info};

use ecss_core::config::AwsConfig;

use crate::backend::{JobBackend, StoreError};

const ID_ATTR: &str = "id";
const BODY_ATTR: &str = "body";

pub struct DynamoDbBackend {
    client: Client,
    table: String,
}

impl DynamoDbBackend {
    /// Build a DynamoDB client from project config, with the same static
    /// credential and endpoint handling as the other AWS clients.
    pub async fn new(table: &str, aws: &AwsConfig) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(aws.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&base);

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
                builder = builder.endpoint_url(endpoint);
            }
        }

        info!(
            "job store: dynamodb backend table {} (region: {})",
            table, aws.region
        );
        Self {
            client: Client::from_conf(builder.build()),
            table: table.to_string(),
        }
    }

    fn item_body(item: &HashMap<String, AttributeValue>) -> Option<(String, String)> {
        let id = item.get(ID_ATTR)?.as_s().ok()?.clone();
        let body = item.get(BODY_ATTR)?.as_s().ok()?.clone();
        Some((id, body))
    }
}

#[async_trait]
impl JobBackend for DynamoDbBackend {
    fn name(&self) -> &'static str {
        "dynamodb"
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let attribute = AttributeDefinition::builder()
            .attribute_name(ID_ATTR)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| StoreError::Other(format!("dynamodb schema: {e}")))?;
        let key = KeySchemaElement::builder()
            .attribute_name(ID_ATTR)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| StoreError::Other(format!("dynamodb schema: {e}")))?;

        let result = self
            .client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(attribute)
            .key_schema(key)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;
        match result {
            Ok(_) => {
                info!(table = %self.table, "created job store table");
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_resource_in_use_exception() {
                    debug!(table = %self.table, "job store table already exists");
                    Ok(())
                } else {
                    Err(StoreError::Unavailable(format!(
                        "dynamodb create table failed: {service_error}"
                    )))
                }
            }
        }
    }

    async fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut records = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut request = self.client.scan().table_name(&self.table);
            if let Some(key) = start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }
            let resp = request
                .send()
                .await
                .map_err(|e| StoreError::Unavailable(format!("dynamodb scan failed: {e}")))?;

            for item in resp.items() {
                if let Some(record) = Self::item_body(item) {
                    records.push(record);
                }
            }

            match resp.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(ID_ATTR, AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("dynamodb get failed: {e}")))?;
        Ok(resp
            .item()
            .and_then(Self::item_body)
            .map(|(_, body)| body))
    }

    async fn put(&self, id: &str, body: &str) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item(ID_ATTR, AttributeValue::S(id.to_string()))
            .item(BODY_ATTR, AttributeValue::S(body.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("dynamodb put failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key(ID_ATTR, AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("dynamodb delete failed: {e}")))?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
