//! Session registry: session code -> running session, plus the reaper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::SessionStatus;
use super::session::SessionHandle;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session code {0} is already in use")]
    CodeInUse(String),
}

/// Registry of live sessions by code. Cheap to clone; clones share the map.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a new session. An existing entry under the same code is never replaced.
    pub async fn insert(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut g = self.inner.write().await;
        if g.contains_key(handle.code()) {
            return Err(RegistryError::CodeInUse(handle.code().to_string()));
        }
        g.insert(handle.code().to_string(), handle);
        Ok(())
    }

    pub async fn get(&self, code: &str) -> Option<SessionHandle> {
        let g = self.inner.read().await;
        g.get(code).cloned()
    }

    pub async fn contains(&self, code: &str) -> bool {
        self.inner.read().await.contains_key(code)
    }

    pub async fn remove(&self, code: &str) -> Option<SessionHandle> {
        self.inner.write().await.remove(code)
    }

    /// Remove the entry for `handle`'s code only if it is still that session.
    pub async fn remove_if_same(&self, handle: &SessionHandle) -> bool {
        let mut g = self.inner.write().await;
        match g.get(handle.code()) {
            Some(current) if current.same_session(handle) => {
                g.remove(handle.code());
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn codes(&self) -> Vec<String> {
        let g = self.inner.read().await;
        g.keys().cloned().collect()
    }

    /// Retire sessions that completed more than `completed_ttl` ago, went idle for
    /// more than `idle_ttl`, or whose processing task is gone. Returns the retired codes.
    pub async fn reap(&self, now: Instant, idle_ttl: Duration, completed_ttl: Duration) -> Vec<String> {
        let handles: Vec<SessionHandle> = self.inner.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for handle in handles {
            if !handle.is_running() {
                expired.push(handle);
                continue;
            }
            let snap = handle.snapshot().await;
            let done = snap.status == SessionStatus::Completed
                && snap
                    .completed_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= completed_ttl);
            let idle = now.saturating_duration_since(snap.last_activity) >= idle_ttl;
            if done || idle {
                expired.push(handle);
            }
        }

        let mut retired = Vec::with_capacity(expired.len());
        for handle in expired {
            if self.remove_if_same(&handle).await {
                handle.shutdown().await;
                log::info!("session {} retired", handle.code());
                retired.push(handle.code().to_string());
            }
        }
        retired
    }

    /// Run [`reap`](Self::reap) every `interval` until the task is aborted.
    pub fn spawn_reaper(&self, interval: Duration, idle_ttl: Duration, completed_ttl: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let retired = registry.reap(Instant::now(), idle_ttl, completed_ttl).await;
                if !retired.is_empty() {
                    log::debug!("reaper retired {} session(s)", retired.len());
                }
            }
        })
    }

    /// Remove and shut down every session.
    pub async fn shutdown_all(&self) {
        let drained: Vec<SessionHandle> = {
            let mut g = self.inner.write().await;
            g.drain().map(|(_, h)| h).collect()
        };
        if !drained.is_empty() {
            log::info!("shutting down {} session(s)", drained.len());
        }
        for handle in drained {
            handle.shutdown().await;
        }
    }
}
