use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{cmd, Client, RedisError};
use tokio::sync::RwLock;

const RELEASE_LEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    end
    return 0
"#;

#[derive(Clone)]
pub struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
    #[cfg(test)]
    local_leases: Option<Arc<std::sync::Mutex<std::collections::HashMap<String, String>>>>,
}

#[derive(Debug, Clone)]
pub enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub fn new(url: String) -> Self {
        Self {
            url,
            manager: Arc::new(RwLock::new(None)),
            #[cfg(test)]
            local_leases: None,
        }
    }

    /// A disconnected handle that still enforces leases, in process.
    #[cfg(test)]
    pub(crate) fn with_local_leases(url: String) -> Self {
        Self { local_leases: Some(Arc::default()), ..Self::new(url) }
    }

    #[cfg(test)]
    pub(crate) fn lease_holder(&self, key: &str) -> Option<String> {
        let leases = self.local_leases.as_ref()?;
        leases.lock().unwrap().get(key).cloned()
    }

    pub async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    pub async fn health(&self) -> RedisHealth {
        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    /// Claims `key` for `token` until `ttl` elapses. Without a Redis
    /// connection every claim succeeds and exclusivity falls back to the
    /// in-process registry plus the store's version check.
    pub async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, RedisError> {
        #[cfg(test)]
        {
            if let Some(leases) = &self.local_leases {
                let mut leases = leases.lock().unwrap();
                if leases.contains_key(key) {
                    return Ok(false);
                }
                leases.insert(key.to_string(), token.to_string());
                return Ok(true);
            }
        }

        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return Ok(true);
        };

        let ttl_ms = ttl.as_millis().max(1) as u64;
        let acquired: Option<String> = cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut manager)
            .await?;

        Ok(acquired.is_some())
    }

    /// Drops the lease only if `token` still owns it.
    pub async fn release_lease(&self, key: &str, token: &str) -> Result<(), RedisError> {
        #[cfg(test)]
        {
            if let Some(leases) = &self.local_leases {
                let mut leases = leases.lock().unwrap();
                if leases.get(key).map(String::as_str) == Some(token) {
                    leases.remove(key);
                }
                return Ok(());
            }
        }

        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return Ok(());
        };

        let script = redis::Script::new(RELEASE_LEASE_SCRIPT);
        let _: i64 = script.key(key).arg(token).invoke_async(&mut manager).await?;

        Ok(())
    }
}

pub fn submission_lease_key(submission_id: &str) -> String {
    format!("markwise:lease:submission:{submission_id}")
}
