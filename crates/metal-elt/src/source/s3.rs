use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, error::DisplayErrorContext, Client};
use tracing::{debug, info, instrument};

use super::ObjectStore;
use crate::config::S3Settings;
use crate::error::{PipelineError, Result};

/// S3 or S3-compatible (MinIO) bucket, optionally scoped to a key prefix
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    /// Empty, or ends with `/`
    prefix: String,
    root_uri: String,
}

impl S3Store {
    /// Static credentials from settings win; otherwise the default AWS chain applies
    pub async fn new(bucket: String, prefix: String, settings: &S3Settings) -> Self {
        debug!("Initializing S3 source with settings: {:?}", settings);

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(settings.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "metal-elt",
            ));
        }
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(settings.path_style)
            .build();

        Self::from_client(Client::from_conf(s3_config), bucket, prefix)
    }

    pub fn from_client(client: Client, bucket: String, prefix: String) -> Self {
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("{}/", p),
        };
        let root_uri = format!("s3://{}/{}", bucket, prefix).trim_end_matches('/').to_string();

        info!("S3 source initialized for {}", root_uri);

        Self {
            client,
            bucket,
            prefix,
            root_uri,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn root_uri(&self) -> &str {
        &self.root_uri
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);

            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| {
                PipelineError::storage(format!(
                    "Failed to list s3://{}/{}: {}",
                    self.bucket,
                    full_prefix,
                    DisplayErrorContext(&e)
                ))
            })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .filter_map(|key| key.strip_prefix(self.prefix.as_str()))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!("Listed {} objects under s3://{}/{}", keys.len(), self.bucket, full_prefix);
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_key = self.full_key(key);
        debug!("Downloading from s3://{}/{}", self.bucket, full_key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                PipelineError::storage(format!(
                    "Failed to download s3://{}/{}: {}",
                    self.bucket,
                    full_key,
                    DisplayErrorContext(&e)
                ))
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| PipelineError::storage(format!("Failed to read S3 response body: {}", e)))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, full_key);
        Ok(data)
    }
}
