//! Redis-backed upload session cache, shared across replicas.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{SessionCache, UploadSession, SESSION_TTL};
use crate::error::{ServerError, ServerResult};

#[derive(Debug)]
pub struct RedisSessionCache {
    conn: ConnectionManager,
}

impl RedisSessionCache {
    pub async fn new(url: &str) -> ServerResult<Self> {
        let client = redis::Client::open(url).map_err(ServerError::transient)?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(ServerError::transient)?;

        Ok(Self { conn })
    }

    fn key(id: Uuid) -> String {
        format!("upload_session:{id}")
    }
}

#[async_trait::async_trait]
impl SessionCache for RedisSessionCache {
    async fn get(&self, id: Uuid) -> ServerResult<Option<UploadSession>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::key(id)).await.map_err(ServerError::transient)?;

        match raw {
            Some(raw) => {
                let session = serde_json::from_str(&raw).map_err(ServerError::internal)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, session: &UploadSession) -> ServerResult<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(session).map_err(ServerError::internal)?;

        conn.set_ex(Self::key(session.id), raw, SESSION_TTL.as_secs() as usize)
            .await
            .map_err(ServerError::transient)?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> ServerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::key(id)).await.map_err(ServerError::transient)?;
        Ok(())
    }
}
