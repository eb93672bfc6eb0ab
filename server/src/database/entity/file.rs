//! A stored file's metadata row.
//!
//! Created atomically at upload completion; immutable afterward except for
//! `last_accessed` and tier moves.

use sea_orm::entity::prelude::*;

use super::Json;

pub type FileModel = Model;

/// How a file's bytes are physically laid out.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
pub enum StorageType {
    /// Bytes embedded directly in the session cache / inline payload column.
    #[sea_orm(string_value = "inline")]
    Inline,

    /// Bytes in a single encrypted object, not chunked.
    #[sea_orm(string_value = "single")]
    Single,

    /// Bytes re-chunked and stored as deduplicated, refcounted blocks.
    #[sea_orm(string_value = "chunked")]
    Chunked,

    /// Alias of `chunked` kept for manifest entries written before a
    /// terminology cleanup; reads identically.
    #[sea_orm(string_value = "content_addressed")]
    ContentAddressed,

    /// A full-file dedup hit: this row has no bytes of its own and points
    /// at another file's envelope and manifest.
    #[sea_orm(string_value = "deduplicated_reference")]
    DeduplicatedReference,
}

/// Coarse access-latency class the file's single-object bytes live in.
///
/// Meaningless for `chunked` files, whose blocks are migrated
/// independently; always present for schema simplicity.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
pub enum StorageTier {
    #[sea_orm(string_value = "cache")]
    Cache,

    #[sea_orm(string_value = "warm")]
    Warm,

    #[sea_orm(string_value = "cold")]
    Cold,
}

/// One entry in a file's chunk manifest.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    /// Typed content hash (`sha256:<hex>`) of the plaintext block.
    pub hash: String,

    /// Plaintext size of the block.
    pub size: u64,

    /// Byte offset of this block within the reconstructed plaintext.
    pub offset: u64,

    /// Whether this block was a dedup hit against an existing block.
    pub duplicate: bool,
}

/// Dedup statistics recorded for the manifest as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct DedupInfo {
    pub logical_size: u64,
    pub saved_size: u64,
    pub convergent_encryption: bool,
    pub compressed: bool,
}

/// A file.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "file")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(indexed)]
    pub owner: Uuid,

    pub folder_id: Option<Uuid>,

    pub name: String,

    /// Logical (plaintext) size.
    pub size: i64,

    /// Typed SHA-256 of the whole-file plaintext, used for full-file dedup
    /// lookups. Shared verbatim on `deduplicated_reference` rows, since
    /// that's exactly the value that matched to produce the reference.
    #[sea_orm(indexed)]
    pub content_hash: Option<String>,

    pub mime: String,

    pub storage_type: StorageType,

    pub placement_tier: StorageTier,

    /// `nonce || AES-256-GCM(master_key, nonce, file_key)`, base64-encoded.
    pub encryption_envelope: String,

    /// For `inline`: base64 ciphertext. Unused for every other storage
    /// type — `single` addresses its one object by this row's own `id`
    /// (see `storage::single_object_key`), since its ciphertext is sealed
    /// under a random per-session key rather than one derived from content.
    pub inline_payload: Option<String>,

    pub chunk_manifest: Json<Vec<ManifestEntry>>,

    pub dedup_info: Json<DedupInfo>,

    /// Set only on `deduplicated_reference` rows: the file this one aliases.
    pub dedup_target: Option<Uuid>,

    pub created_at: ChronoDateTimeUtc,

    pub last_accessed: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::Owner",
        to = "super::user::Column::Id"
    )]
    User,

    #[sea_orm(has_many = "super::block_ref::Entity")]
    BlockRef,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::block_ref::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BlockRef.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
