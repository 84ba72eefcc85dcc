//! Blob store boundary used for artifact uploads.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

/// Uploads a local file under a logical key and returns its public URL.
/// Implementations must tolerate repeated uploads of the same key
/// (overwrite semantics).
pub(crate) trait BlobStore: Send + Sync {
    fn put_file(&self, path: &Path, key: &str, content_type: &str) -> Result<String>;
}

/// Configuration for the S3-compatible store, read from the environment.
#[derive(Debug, Clone)]
pub(crate) struct S3Config {
    pub(crate) endpoint_url: String,
    pub(crate) access_key_id: String,
    pub(crate) secret_access_key: String,
    pub(crate) bucket: String,
    pub(crate) region: String,
    /// Base URL under which uploaded keys are publicly reachable. Defaults to
    /// `<endpoint>/<bucket>` (path-style).
    pub(crate) public_base_url: Option<String>,
}

impl S3Config {
    pub(crate) fn from_env() -> Result<Self> {
        Ok(Self {
            endpoint_url: require_env("SENTRYCAM_S3_ENDPOINT")?,
            access_key_id: require_env("SENTRYCAM_S3_ACCESS_KEY_ID")?,
            secret_access_key: require_env("SENTRYCAM_S3_SECRET_ACCESS_KEY")?,
            bucket: require_env("SENTRYCAM_S3_BUCKET")?,
            region: std::env::var("SENTRYCAM_S3_REGION").unwrap_or_else(|_| "auto".to_string()),
            public_base_url: std::env::var("SENTRYCAM_S3_PUBLIC_URL").ok(),
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow!("{name} not set"))
}

/// S3-compatible store. Owns a current-thread runtime so that callers on
/// plain threads can upload with a blocking call.
pub(crate) struct S3Store {
    runtime: tokio::runtime::Runtime,
    client: Client,
    bucket: String,
    public_base: String,
}

impl S3Store {
    pub(crate) fn new(config: S3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build storage runtime")?;

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "sentrycam",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let public_base = config
            .public_base_url
            .unwrap_or_else(|| public_base(&config.endpoint_url, &config.bucket));

        Ok(Self {
            runtime,
            client: Client::from_conf(sdk_config),
            bucket: config.bucket,
            public_base,
        })
    }
}

impl BlobStore for S3Store {
    fn put_file(&self, path: &Path, key: &str, content_type: &str) -> Result<String> {
        debug!("uploading {} as {key}", path.display());

        self.runtime.block_on(async {
            let body = ByteStream::from_path(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .content_type(content_type)
                .send()
                .await
                .map_err(|err| anyhow!("upload failed for {key}: {err}"))?;

            Ok::<_, anyhow::Error>(())
        })?;

        Ok(public_url(&self.public_base, key))
    }
}

fn public_base(endpoint_url: &str, bucket: &str) -> String {
    format!("{}/{bucket}", endpoint_url.trim_end_matches('/'))
}

fn public_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}
