//! S3-compatible block storage.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    config::{Credentials, Region},
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::BytesMut;
use futures::future::join_all;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use tokio::io::AsyncRead;

use super::{Download, StorageBackend, Tier};
use crate::error::{ServerError, ServerResult};
use vault_core::hash::ContentHash;
use vault_core::io::read_chunk_async;
use vault_core::util::Finally;

/// The chunk size for each part in a multipart upload.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// The S3 block storage backend.
#[derive(Debug)]
pub struct S3Backend {
    client: Client,
    config: S3StorageConfig,
}

/// S3 block storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// The AWS region.
    region: String,

    /// The name of the bucket.
    bucket: String,

    /// Custom S3 endpoint.
    ///
    /// Set this if you are using an S3-compatible object storage (e.g., Minio).
    endpoint: Option<String>,

    /// S3 credentials.
    ///
    /// If not specified, it's read from the `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables.
    credentials: Option<S3CredentialsConfig>,
}

/// S3 credential configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3CredentialsConfig {
    /// Access key ID.
    access_key_id: String,

    /// Secret access key.
    secret_access_key: String,
}

impl S3Backend {
    pub async fn new(config: S3StorageConfig) -> ServerResult<Self> {
        let s3_config = Self::config_builder(&config)
            .await
            .region(Region::new(config.region.to_owned()))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            config,
        })
    }

    async fn config_builder(config: &S3StorageConfig) -> S3ConfigBuilder {
        let shared_config = aws_config::load_from_env().await;
        let mut builder = S3ConfigBuilder::from(&shared_config);

        if let Some(credentials) = &config.credentials {
            builder = builder.credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                None,
                None,
                "s3",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        builder
    }

    fn key(&self, tier: Tier, hash: &ContentHash) -> String {
        format!("{}/{}/{}", tier.as_str(), hash.shard_prefix(2), hash.to_hex())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn put_block(
        &self,
        tier: Tier,
        hash: &ContentHash,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let key = self.key(tier, hash);

        if self.block_exists(tier, hash).await? {
            let mut sink = tokio::io::sink();
            tokio::io::copy(&mut stream, &mut sink)
                .await
                .map_err(ServerError::storage_io)?;
            return Ok(());
        }

        let buf = BytesMut::with_capacity(CHUNK_SIZE);
        let first_chunk = read_chunk_async(&mut stream, buf)
            .await
            .map_err(ServerError::storage_io)?;

        if first_chunk.len() < CHUNK_SIZE {
            self.client
                .put_object()
                .bucket(&self.config.bucket)
                .key(&key)
                .body(first_chunk.into())
                .send()
                .await
                .map_err(ServerError::storage_io)?;

            return Ok(());
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(ServerError::storage_io)?;

        let upload_id = multipart.upload_id().unwrap();

        let cleanup = Finally::new({
            let bucket = self.config.bucket.clone();
            let client = self.client.clone();
            let upload_id = upload_id.to_owned();
            let key = key.clone();

            async move {
                tracing::warn!("Upload was interrupted - aborting multipart upload");

                let r = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await;

                if let Err(e) = r {
                    tracing::warn!("Failed to abort multipart upload: {}", e);
                }
            }
        });

        let mut part_number = 1;
        let mut parts = Vec::new();
        let mut first_chunk = Some(first_chunk);

        loop {
            let chunk = if part_number == 1 {
                first_chunk.take().unwrap()
            } else {
                let buf = BytesMut::with_capacity(CHUNK_SIZE);
                read_chunk_async(&mut stream, buf)
                    .await
                    .map_err(ServerError::storage_io)?
            };

            if chunk.is_empty() {
                break;
            }

            let client = self.client.clone();
            let fut = tokio::task::spawn({
                client
                    .upload_part()
                    .bucket(&self.config.bucket)
                    .key(&key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(chunk.clone().into())
                    .send()
            });

            parts.push(fut);
            part_number += 1;
        }

        let completed_parts = join_all(parts)
            .await
            .into_iter()
            .map(|join_result| join_result.unwrap())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(ServerError::storage_io)?
            .into_iter()
            .enumerate()
            .map(|(idx, part)| {
                let part_number = idx + 1;
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .set_part_number(Some(part_number as i32))
                    .build()
            })
            .collect::<Vec<_>>();

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(ServerError::storage_io)?;

        cleanup.cancel();

        Ok(())
    }

    async fn block_exists(&self, tier: Tier, hash: &ContentHash) -> ServerResult<bool> {
        let key = self.key(tier, hash);
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(ServerError::storage_io(e)),
        }
    }

    async fn get_block(&self, tier: Tier, hash: &ContentHash) -> ServerResult<Download> {
        let key = self.key(tier, hash);
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(ServerError::storage_io)?;

        let stream = StreamExt::map(output.body, |item| {
            item.map_err(|e| IoError::new(IoErrorKind::Other, e))
        });

        Ok(Download::Stream(Box::new(tokio_util::io::StreamReader::new(stream))))
    }

    async fn delete_block(&self, tier: Tier, hash: &ContentHash) -> ServerResult<()> {
        let key = self.key(tier, hash);
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(ServerError::storage_io)?;

        Ok(())
    }

    async fn move_block(&self, hash: &ContentHash, from: Tier, to: Tier) -> ServerResult<()> {
        let from_key = self.key(from, hash);
        let to_key = self.key(to, hash);

        self.client
            .copy_object()
            .bucket(&self.config.bucket)
            .copy_source(format!("{}/{}", self.config.bucket, from_key))
            .key(&to_key)
            .send()
            .await
            .map_err(ServerError::storage_io)?;

        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&from_key)
            .send()
            .await
            .map_err(ServerError::storage_io)?;

        Ok(())
    }
}
