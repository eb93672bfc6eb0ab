//! A tenant of the storage service.
//!
//! Registration, login, and password hashing are handled by an external
//! service; this row only tracks quota accounting.

use sea_orm::entity::prelude::*;

pub type UserModel = Model;

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "user")]
pub struct Model {
    /// The user's ID, taken from the `sub` claim of their bearer token.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Maximum bytes the user may have stored (`file.size` summed, not
    /// `saved_size` after dedup).
    pub quota: i64,

    /// Bytes currently in use. `0 <= used <= quota`, updated transactionally
    /// alongside file create/delete.
    pub used: i64,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file::Entity")]
    File,
}

impl ActiveModelBehavior for ActiveModel {}
