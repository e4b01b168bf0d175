use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use thiserror::Error;

use crate::core::config::Settings;

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("document {0} does not exist")]
    NotFound(String),
    #[error("document storage unavailable: {0}")]
    Unavailable(String),
}

/// Where uploaded answer sheets and model answers live.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, document_ref: &str) -> Result<FetchedDocument, FetchError>;
}

#[derive(Debug, Clone)]
pub struct StorageService {
    client: Client,
    bucket: String,
}

impl StorageService {
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        if settings.s3().access_key.is_empty() || settings.s3().secret_key.is_empty() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.s3().access_key.clone(),
            settings.s3().secret_key.clone(),
            None,
            None,
            "markwise-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(settings.s3().endpoint.clone())
            .region(aws_config::Region::new(settings.s3().region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        let client = Client::new(&config);

        Ok(Some(Self { client, bucket: settings.s3().bucket.clone() }))
    }
}

#[async_trait]
impl DocumentSource for StorageService {
    async fn fetch_document(&self, document_ref: &str) -> Result<FetchedDocument, FetchError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(document_ref)
            .send()
            .await
            .map_err(|err| classify_get_error(document_ref, err))?;

        let content_type = output.content_type().map(str::to_string);
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| FetchError::Unavailable(err.to_string()))?;

        Ok(FetchedDocument { bytes: body.into_bytes().to_vec(), content_type })
    }
}

fn classify_get_error<R: std::fmt::Debug>(
    document_ref: &str,
    err: SdkError<GetObjectError, R>,
) -> FetchError {
    if let SdkError::ServiceError(service) = &err {
        if matches!(service.err(), GetObjectError::NoSuchKey(_)) {
            return FetchError::NotFound(document_ref.to_string());
        }
    }
    FetchError::Unavailable(err.to_string())
}

/// Storage stand-in for deployments without S3 credentials.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredStorage;

#[async_trait]
impl DocumentSource for UnconfiguredStorage {
    async fn fetch_document(&self, document_ref: &str) -> Result<FetchedDocument, FetchError> {
        Err(FetchError::Unavailable(format!(
            "object storage is not configured; cannot fetch {document_ref}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{DocumentSource, FetchError, StorageService, UnconfiguredStorage};
    use crate::core::config::Settings;
    use crate::test_support;

    #[tokio::test]
    async fn storage_is_disabled_without_credentials() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        let storage = StorageService::from_settings(&settings).await.expect("storage");

        assert!(storage.is_none());
    }

    #[tokio::test]
    async fn unconfigured_storage_reports_unavailable() {
        let err = UnconfiguredStorage.fetch_document("sheets/a.pdf").await.unwrap_err();
        assert!(matches!(err, FetchError::Unavailable(message) if message.contains("sheets/a.pdf")));
    }
}
