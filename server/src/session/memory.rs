//! In-process upload session cache, swept by TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time;
use uuid::Uuid;

use super::{SessionCache, UploadSession, SESSION_TTL};
use crate::error::ServerResult;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct MemorySessionCache {
    inner: Arc<Mutex<HashMap<Uuid, (UploadSession, Instant)>>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn({
            let inner = inner.clone();
            async move {
                let mut interval = time::interval(SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    let mut map = inner.lock().await;
                    let now = Instant::now();
                    map.retain(|_, (_, expires_at)| *expires_at > now);
                }
            }
        });

        Self { inner }
    }
}

impl Default for MemorySessionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionCache for MemorySessionCache {
    async fn get(&self, id: Uuid) -> ServerResult<Option<UploadSession>> {
        let map = self.inner.lock().await;
        Ok(map.get(&id).filter(|(_, expires_at)| *expires_at > Instant::now()).map(|(s, _)| s.clone()))
    }

    async fn put(&self, session: &UploadSession) -> ServerResult<()> {
        let mut map = self.inner.lock().await;
        map.insert(session.id, (session.clone(), Instant::now() + SESSION_TTL));
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> ServerResult<()> {
        let mut map = self.inner.lock().await;
        map.remove(&id);
        Ok(())
    }
}
