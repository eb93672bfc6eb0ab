//! Server configuration.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use derivative::Derivative;
use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::Deserialize;
use vault_core::crypto::MasterKey;
use vault_core::{CoreError, CoreResult};

use crate::storage::{LocalStorageConfig, S3StorageConfig};

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// Useful for deploying to platforms that only expose a single
/// environment-variable surface for configuration (e.g. Fly.io).
const ENV_CONFIG_BASE64: &str = "VAULT_SERVER_CONFIG_BASE64";

/// Base64-encoded 256-bit master key, or a secret to hash into one.
const ENV_ENCRYPTION_MASTER_KEY: &str = "ENCRYPTION_MASTER_KEY";

/// Fallback secret. Hashed with SHA-256 if `ENCRYPTION_MASTER_KEY` is unset.
///
/// Also used, as-is, as the HMAC secret for signing and verifying bearer
/// tokens unless `JWT_SECRET` is set.
const ENV_SECRET_KEY: &str = "SECRET_KEY";

/// Dedicated JWT signing secret, overriding `SECRET_KEY` for token auth.
const ENV_JWT_SECRET: &str = "JWT_SECRET";

const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_REDIS_URL: &str = "REDIS_URL";
const ENV_CHUNK_SIZE: &str = "CHUNK_SIZE";
const ENV_INLINE_THRESHOLD: &str = "INLINE_THRESHOLD";
const ENV_SINGLE_OBJECT_THRESHOLD: &str = "SINGLE_OBJECT_THRESHOLD";
const ENV_VERSION_RETENTION_DAYS: &str = "VERSION_RETENTION_DAYS";
const ENV_MAX_VERSIONS_PER_FILE: &str = "MAX_VERSIONS_PER_FILE";

/// Top-level server configuration.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Allowed `Host` headers.
    ///
    /// This _must_ be configured for production use. If unconfigured or the
    /// list is empty, all `Host` headers are allowed.
    #[serde(rename = "allowed-hosts")]
    #[serde(default = "Vec::new")]
    pub allowed_hosts: Vec<String>,

    /// Database connection.
    #[serde(default = "DatabaseConfig::from_env")]
    pub database: DatabaseConfig,

    /// Block storage.
    pub storage: StorageConfig,

    /// Upload session cache.
    #[serde(rename = "session-cache")]
    #[serde(default = "SessionCacheConfig::from_env")]
    pub session_cache: SessionCacheConfig,

    /// Chunking and placement thresholds.
    #[serde(default = "ChunkingConfig::from_env")]
    pub chunking: ChunkingConfig,

    /// Master-key derivation.
    #[serde(default = "EncryptionConfig::from_env")]
    pub encryption: EncryptionConfig,

    /// Whether convergent deduplication is allowed to match blocks across
    /// different owners.
    ///
    /// Off by default: it leaks content equality across tenants.
    #[serde(rename = "cross-user-dedup")]
    #[serde(default = "default_cross_user_dedup")]
    pub cross_user_dedup: bool,

    /// Garbage collection and version retention.
    #[serde(rename = "garbage-collection")]
    #[serde(default = "GarbageCollectionConfig::from_env")]
    pub garbage_collection: GarbageCollectionConfig,

    /// Bearer token verification.
    #[serde(default = "JWTConfig::from_env")]
    #[derivative(Debug = "ignore")]
    pub jwt: JWTConfig,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    #[serde(default = "load_database_url_from_env")]
    pub url: String,

    /// Whether to enable sending of periodic heartbeat queries.
    #[serde(default = "default_db_heartbeat")]
    pub heartbeat: bool,
}

impl DatabaseConfig {
    fn from_env() -> Self {
        Self {
            url: load_database_url_from_env(),
            heartbeat: default_db_heartbeat(),
        }
    }
}

/// Block storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Local file storage.
    #[serde(rename = "local")]
    Local(LocalStorageConfig),

    /// S3-compatible storage.
    #[serde(rename = "s3")]
    S3(S3StorageConfig),
}

/// Upload session cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SessionCacheConfig {
    /// In-process cache, swept by TTL.
    ///
    /// Sessions don't survive a restart. Fine for tests and single-node
    /// development deployments.
    #[serde(rename = "memory")]
    Memory,

    /// Redis-backed cache, shared across replicas.
    #[serde(rename = "redis")]
    Redis {
        /// Connection URL.
        #[serde(default = "load_redis_url_from_env")]
        url: String,
    },
}

impl SessionCacheConfig {
    fn from_env() -> Self {
        match read_non_empty_var(ENV_REDIS_URL) {
            Some(url) => Self::Redis { url },
            None => Self::Memory,
        }
    }
}

/// Chunking and placement-strategy thresholds.
///
/// Changing these values changes the cutpoints for newly-uploaded files;
/// it does not affect already-written blocks, so the dedup ratio against
/// old uploads will be temporarily worse after a change.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    /// Uploads below this size use the `inline` strategy.
    #[serde(rename = "inline-threshold")]
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: u64,

    /// Uploads below this size (and at or above `inline_threshold`) use the
    /// `single` strategy; everything else is `chunked`.
    #[serde(rename = "single-object-threshold")]
    #[serde(default = "default_single_object_threshold")]
    pub single_object_threshold: u64,

    /// Target chunk size for the `chunked` strategy.
    #[serde(rename = "chunk-size")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Minimum content-defined chunk size during re-chunking.
    #[serde(rename = "min-block-size")]
    #[serde(default = "default_min_block_size")]
    pub min_block_size: usize,

    /// Average (target) content-defined chunk size during re-chunking.
    #[serde(rename = "avg-block-size")]
    #[serde(default = "default_avg_block_size")]
    pub avg_block_size: usize,

    /// Maximum content-defined chunk size during re-chunking.
    #[serde(rename = "max-block-size")]
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
}

impl ChunkingConfig {
    fn from_env() -> Self {
        Self {
            inline_threshold: read_env_u64(ENV_INLINE_THRESHOLD).unwrap_or_else(default_inline_threshold),
            single_object_threshold: read_env_u64(ENV_SINGLE_OBJECT_THRESHOLD)
                .unwrap_or_else(default_single_object_threshold),
            chunk_size: read_env_u64(ENV_CHUNK_SIZE).unwrap_or_else(default_chunk_size),
            min_block_size: default_min_block_size(),
            avg_block_size: default_avg_block_size(),
            max_block_size: default_max_block_size(),
        }
    }
}

/// Master-key configuration.
///
/// The key itself is never serialized back out; `Debug` is redacted.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
pub struct EncryptionConfig {
    #[serde(skip)]
    #[derivative(Debug = "ignore")]
    master_key: MasterKeySource,
}

#[derive(Clone)]
enum MasterKeySource {
    Base64(String),
    Secret(String),
}

impl Default for MasterKeySource {
    fn default() -> Self {
        Self::Secret(String::new())
    }
}

impl EncryptionConfig {
    fn from_env() -> Self {
        let master_key = if let Some(encoded) = read_non_empty_var(ENV_ENCRYPTION_MASTER_KEY) {
            MasterKeySource::Base64(encoded)
        } else if let Some(secret) = read_non_empty_var(ENV_SECRET_KEY) {
            MasterKeySource::Secret(secret)
        } else {
            panic!(
                "\n\
                You must configure a master key by setting one of the following \
                environment variables:\n\
                \n\
                * {ENV_ENCRYPTION_MASTER_KEY} (base64-encoded, 32 bytes)\n\
                * {ENV_SECRET_KEY} (any string; hashed with SHA-256)\n\
                "
            )
        };

        Self { master_key }
    }

    /// Resolves the configured master key.
    pub fn master_key(&self) -> CoreResult<MasterKey> {
        match &self.master_key {
            MasterKeySource::Base64(encoded) => MasterKey::from_base64(encoded),
            MasterKeySource::Secret(secret) => Ok(MasterKey::from_secret(secret)),
        }
    }
}

/// Garbage collection and version-retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GarbageCollectionConfig {
    /// The frequency to run garbage collection at.
    ///
    /// If zero, automatic garbage collection is disabled, but it can still
    /// be run on demand.
    #[serde(with = "humantime_serde", default = "default_gc_interval")]
    pub interval: Duration,

    /// How long an old file version is retained before it becomes eligible
    /// for expiration. Zero disables time-based expiration.
    #[serde(rename = "version-retention-days")]
    #[serde(default = "default_version_retention_days")]
    pub version_retention_days: u32,

    /// The maximum number of versions kept per file regardless of age.
    /// Zero means unlimited.
    #[serde(rename = "max-versions-per-file")]
    #[serde(default = "default_max_versions_per_file")]
    pub max_versions_per_file: u32,
}

impl GarbageCollectionConfig {
    fn from_env() -> Self {
        Self {
            interval: default_gc_interval(),
            version_retention_days: read_env_u32(ENV_VERSION_RETENTION_DAYS)
                .unwrap_or_else(default_version_retention_days),
            max_versions_per_file: read_env_u32(ENV_MAX_VERSIONS_PER_FILE)
                .unwrap_or_else(default_max_versions_per_file),
        }
    }
}

/// Bearer token verification configuration.
///
/// Tokens are signed elsewhere (the out-of-scope auth/registration
/// service); this server only verifies them, HS256-only.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
pub struct JWTConfig {
    #[serde(skip)]
    #[derivative(Debug = "ignore")]
    secret: Vec<u8>,
}

impl JWTConfig {
    fn from_env() -> Self {
        let secret = read_non_empty_var(ENV_JWT_SECRET)
            .or_else(|| read_non_empty_var(ENV_SECRET_KEY))
            .unwrap_or_else(|| {
                panic!(
                    "\n\
                    You must configure a JWT signing secret by setting one of the \
                    following environment variables:\n\
                    \n\
                    * {ENV_JWT_SECRET}\n\
                    * {ENV_SECRET_KEY}\n\
                    "
                )
            });

        Self {
            secret: secret.into_bytes(),
        }
    }

    /// The key used to verify an incoming bearer token.
    pub fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_secret(&self.secret)
    }

    /// The key used to sign a newly-issued bearer token.
    pub fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_secret(&self.secret)
    }
}

fn read_non_empty_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_env_u64(key: &str) -> Option<u64> {
    read_non_empty_var(key).map(|v| {
        v.parse()
            .unwrap_or_else(|_| panic!("{key} must be a non-negative integer"))
    })
}

fn read_env_u32(key: &str) -> Option<u32> {
    read_non_empty_var(key).map(|v| {
        v.parse()
            .unwrap_or_else(|_| panic!("{key} must be a non-negative integer"))
    })
}

fn load_database_url_from_env() -> String {
    env::var(ENV_DATABASE_URL)
        .unwrap_or_else(|_| panic!("Database URL must be specified via {ENV_DATABASE_URL}"))
}

fn load_redis_url_from_env() -> String {
    env::var(ENV_REDIS_URL).unwrap_or_else(|_| panic!("Redis URL must be specified via {ENV_REDIS_URL}"))
}

fn default_listen_address() -> SocketAddr {
    "[::]:8080".parse().unwrap()
}

fn default_db_heartbeat() -> bool {
    false
}

fn default_cross_user_dedup() -> bool {
    false
}

fn default_inline_threshold() -> u64 {
    512 * 1024
}

fn default_single_object_threshold() -> u64 {
    50 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    32 * 1024 * 1024
}

fn default_min_block_size() -> usize {
    2 * 1024 * 1024
}

fn default_avg_block_size() -> usize {
    4 * 1024 * 1024
}

fn default_max_block_size() -> usize {
    8 * 1024 * 1024
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(43200)
}

fn default_version_retention_days() -> u32 {
    0
}

fn default_max_versions_per_file() -> u32 {
    0
}

fn load_config_from_path(path: &Path) -> anyhow::Result<Config> {
    tracing::info!("Using configuration file: {:?}", path);

    let config = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&config)?)
}

fn load_config_from_str(s: &str) -> anyhow::Result<Config> {
    tracing::info!("Using configuration from environment variable");
    Ok(toml::from_str(s)?)
}

/// Loads the configuration.
///
/// Precedence:
/// * Path given on the command line.
/// * `VAULT_SERVER_CONFIG_BASE64` environment variable.
/// * `config.toml` in the current directory.
///
/// Most settings can also be supplied purely through environment variables
/// (see the `*_from_env` constructors above), so a config file is optional.
pub async fn load_config(config_path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(config_path) = config_path {
        return load_config_from_path(config_path);
    }

    if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        let decoded = BASE64_STANDARD
            .decode(config_env.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to decode {ENV_CONFIG_BASE64}: {e}"))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| anyhow::anyhow!("{ENV_CONFIG_BASE64} is not valid UTF-8: {e}"))?;
        return load_config_from_str(&decoded);
    }

    let default_path = Path::new("config.toml");
    if default_path.exists() {
        return load_config_from_path(default_path);
    }

    Err(anyhow::anyhow!(
        "No configuration file found and {ENV_CONFIG_BASE64} is unset. \
        Pass a config path explicitly, or rely on environment variables \
        per-section (DATABASE_URL, REDIS_URL, SECRET_KEY, ...) with a \
        minimal config.toml providing at least [storage]."
    ))
}

impl From<CoreError> for anyhow::Error {
    fn from(e: CoreError) -> Self {
        anyhow::anyhow!(e)
    }
}
