use std::path::Path;

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use log::{debug, error, info};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;

use crate::config::StorageConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Fetched,
    Failed,
}

/// Result of an object-storage fetch: a status plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub status: FetchStatus,
    pub message: String,
}

impl FetchOutcome {
    pub fn fetched(message: impl Into<String>) -> Self {
        FetchOutcome {
            status: FetchStatus::Fetched,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        FetchOutcome {
            status: FetchStatus::Failed,
            message: message.into(),
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.status == FetchStatus::Fetched
    }
}

/// Blocking object-storage fetch used by the pipeline.
pub trait ObjectStore: Send + Sync {
    fn fetch(&self, bucket: &str, key: &str, local_path: &Path) -> FetchOutcome;
}

pub async fn new_s3_client(storage: &StorageConfig) -> Client {
    // Falls back to the standard AWS credential chain when no explicit keys are configured.
    let sdk_config = aws_config::load_from_env().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
        .region(Region::new(storage.region.clone()))
        .endpoint_url(storage.endpoint_url.clone())
        // MinIO needs path-style addressing for non DNS-compatible bucket names.
        .force_path_style(true);
    if let (Some(access_key), Some(secret_key)) = (&storage.access_key, &storage.secret_key) {
        builder = builder.credentials_provider(Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "transcode-worker-env",
        ));
    }
    let s3_config = builder.build();

    info!(
        "Creating S3 client with endpoint: {}",
        storage.endpoint_url
    );
    Client::from_conf(s3_config)
}

pub async fn download_file(
    client: &Client,
    bucket: &str,
    key: &str,
    download_path: &Path,
) -> Result<u64, String> {
    info!("S3: Downloading s3://{}/{} to {:?}", bucket, key, download_path);

    let mut resp = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| {
            let err_msg = format!("S3: Failed to get object s3://{}/{}: {}", bucket, key, e);
            error!("{}", err_msg);
            err_msg
        })?;

    if let Some(parent_dir) = download_path.parent() {
        tokio::fs::create_dir_all(parent_dir)
            .await
            .map_err(|e| format!("Failed to create download directory {:?}: {}", parent_dir, e))?;
    }

    let mut file = TokioFile::create(download_path)
        .await
        .map_err(|e| format!("Failed to create file {:?}: {}", download_path, e))?;

    let mut bytes_written: u64 = 0;
    while let Some(chunk) = resp.body.try_next().await.map_err(|e| {
        format!(
            "Error reading S3 object body stream for s3://{}/{}: {}",
            bucket, key, e
        )
    })? {
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("Failed to write to file {:?}: {}", download_path, e))?;
        bytes_written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| format!("Failed to flush file {:?}: {}", download_path, e))?;
    debug!(
        "S3: Downloaded {} bytes from s3://{}/{} to {:?}",
        bytes_written, bucket, key, download_path
    );
    Ok(bytes_written)
}

pub async fn upload_file(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_path: &Path,
) -> Result<(), String> {
    info!("S3: Uploading {:?} to s3://{}/{}", upload_path, bucket, key);

    if !upload_path.exists() {
        return Err(format!("File to upload does not exist: {:?}", upload_path));
    }

    let body = ByteStream::from_path(upload_path).await.map_err(|e| {
        let err_msg = format!("S3: Failed to create ByteStream from path {:?}: {}", upload_path, e);
        error!("{}", err_msg);
        err_msg
    })?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            let err_msg = format!(
                "S3: Failed to upload {:?} to s3://{}/{}: {}",
                upload_path, bucket, key, e
            );
            error!("{}", err_msg);
            err_msg
        })?;

    info!("S3: Uploaded {:?} to s3://{}/{}", upload_path, bucket, key);
    Ok(())
}

/// [`ObjectStore`] over the async S3 client, for use from blocking worker threads.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    runtime: Handle,
}

impl S3ObjectStore {
    /// `runtime` must not be driven by the thread that later calls [`ObjectStore::fetch`].
    pub fn new(client: Client, runtime: Handle) -> Self {
        S3ObjectStore { client, runtime }
    }
}

impl ObjectStore for S3ObjectStore {
    fn fetch(&self, bucket: &str, key: &str, local_path: &Path) -> FetchOutcome {
        match self
            .runtime
            .block_on(download_file(&self.client, bucket, key, local_path))
        {
            Ok(bytes) => FetchOutcome::fetched(format!(
                "Fetched s3://{}/{} ({} bytes) to {:?}",
                bucket, key, bytes, local_path
            )),
            Err(message) => FetchOutcome::failed(message),
        }
    }
}
